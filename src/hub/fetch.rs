use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    paths::{cache_path, ensure_directory, join_paths, validate_entry},
    segments::{combine_segments, segment_path},
    transport::{Headers, HttpResponse, HttpTransport, ReqwestTransport},
};
use crate::{
    config::HubConfig,
    error::{CacheError, Result},
};

const CHUNK_SIZE: usize = 32 * 1024;
const PART_SUFFIX: &str = ".part";
const RECORD_SUFFIX: &str = ".part.meta";

/// Per-call overrides of the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub revision: Option<String>,
    pub sub_folder: Option<String>,
}

impl FetchOptions {
    #[must_use]
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    #[must_use]
    pub fn sub_folder(mut self, sub_folder: impl Into<String>) -> Self {
        self.sub_folder = Some(sub_folder.into());
        self
    }

    fn sub_folder_or_empty(&self) -> &str {
        self.sub_folder.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The file was already present; the network was not touched.
    Cached { path: PathBuf },
    /// `segments` is zero when the body was streamed in one piece.
    Fetched {
        path: PathBuf,
        bytes: u64,
        segments: u32,
    },
}

impl FetchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Cached { path } | Self::Fetched { path, .. } => path,
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            Self::Cached { path } | Self::Fetched { path, .. } => path,
        }
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

struct FetchPlan {
    url: String,
    destination: PathBuf,
    staging: PathBuf,
    headers: Headers,
}

impl FetchPlan {
    fn new(url: String, destination: PathBuf, headers: Headers) -> Self {
        let staging = with_suffix(&destination, &format!(".{}.tmp", Uuid::new_v4().simple()));
        Self {
            url,
            destination,
            staging,
            headers,
        }
    }

    fn segment_base(&self) -> PathBuf {
        with_suffix(&self.destination, PART_SUFFIX)
    }

    fn with_range(&self, start: u64, end: u64) -> Headers {
        let mut headers = self.headers.clone();
        headers.insert("range".into(), format!("bytes={start}-{end}"));
        headers
    }

    fn record_path(&self) -> PathBuf {
        with_suffix(&self.destination, RECORD_SUFFIX)
    }

    /// Makes `record` the owner of the segment files, dropping parts that were
    /// downloaded for a different url, size, segment size or entity tag.
    fn adopt_record(&self, record: &SegmentRecord, base: &Path, count: u32) -> Result<()> {
        let path = self.record_path();
        let previous: Option<SegmentRecord> = fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok());
        if previous.as_ref() == Some(record) {
            return Ok(());
        }

        let mut index = 1;
        loop {
            let part = segment_path(base, index);
            if index > count && !part.exists() {
                break;
            }
            if part.exists() {
                debug!(index, path = %part.display(), "dropping segment from another version");
                fs::remove_file(&part)
                    .map_err(|source| CacheError::io("remove stale segment", &part, source))?;
            }
            index += 1;
        }

        let staging = with_suffix(&path, &format!(".{}.tmp", Uuid::new_v4().simple()));
        let written = File::create(&staging)
            .map_err(|source| CacheError::io("create segment record", &staging, source))
            .and_then(|file| {
                serde_json::to_writer_pretty(file, record).map_err(|error| {
                    CacheError::io("write segment record", &staging, error.into())
                })
            })
            .and_then(|()| {
                fs::rename(&staging, &path)
                    .map_err(|source| CacheError::io("move segment record", &path, source))
            });
        if written.is_err() {
            remove_quietly(&staging);
        }
        written
    }

    fn commit(&self) -> Result<()> {
        fs::rename(&self.staging, &self.destination)
            .map_err(|source| CacheError::io("move artifact into cache", &self.destination, source))
    }

    fn discard(&self) {
        remove_quietly(&self.staging);
    }
}

/// Identifies the artifact version that the `.partN` files belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentRecord {
    url: String,
    total: u64,
    segment_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

/// Resolves artifacts to cache paths and downloads the ones that are missing.
#[derive(Debug)]
pub struct ArtifactFetcher<T = ReqwestTransport> {
    config: HubConfig,
    transport: T,
}

impl ArtifactFetcher {
    pub fn with_default_transport(config: HubConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::from_config(&config).context("create http client")?;
        Ok(Self::new(config, transport))
    }
}

impl<T: HttpTransport> ArtifactFetcher<T> {
    pub fn new(config: HubConfig, transport: T) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn cache_path(
        &self,
        model_id: &str,
        file_name: &str,
        options: &FetchOptions,
    ) -> Result<PathBuf> {
        cache_path(
            &self.config.cache_dir,
            model_id,
            options.sub_folder_or_empty(),
            file_name,
        )
    }

    pub fn remote_url(
        &self,
        model_id: &str,
        file_name: &str,
        options: &FetchOptions,
    ) -> Result<String> {
        let sub_folder = options.sub_folder_or_empty();
        validate_entry(model_id, sub_folder, file_name)?;

        let revision = options.revision.as_deref().unwrap_or(&self.config.revision);
        let revision: String = url::form_urlencoded::byte_serialize(revision.as_bytes()).collect();
        let remote_path = self
            .config
            .remote_path_template
            .replace("{model}", model_id)
            .replace("{revision}", &revision);
        Ok(join_paths([
            self.config.remote_host.as_str(),
            &remote_path,
            sub_folder,
            file_name,
        ]))
    }

    pub fn fetch(&self, model_id: &str, file_name: &str) -> Result<FetchOutcome> {
        self.fetch_with(model_id, file_name, &FetchOptions::default())
    }

    pub fn fetch_with(
        &self,
        model_id: &str,
        file_name: &str,
        options: &FetchOptions,
    ) -> Result<FetchOutcome> {
        self.fetch_with_progress(model_id, file_name, options, |_| {})
    }

    /// Returns the cached file, or downloads it into place first.
    ///
    /// The body is written to a uniquely named sibling and renamed over the
    /// cache path, so readers never see a partial file and concurrent fetches
    /// of the same artifact each leave a complete copy behind.
    pub fn fetch_with_progress<F>(
        &self,
        model_id: &str,
        file_name: &str,
        options: &FetchOptions,
        mut progress: F,
    ) -> Result<FetchOutcome>
    where
        F: FnMut(Progress),
    {
        let destination = self.cache_path(model_id, file_name, options)?;
        if destination.is_file() {
            debug!(path = %destination.display(), "cache hit");
            return Ok(FetchOutcome::Cached { path: destination });
        }

        let url = self.remote_url(model_id, file_name, options)?;
        let plan = FetchPlan::new(url, destination, self.request_headers());
        info!(url = %plan.url, path = %plan.destination.display(), "downloading artifact");

        let downloaded = match self.config.effective_segment_size() {
            Some(segment_size) => self.download_segmented(&plan, segment_size, &mut progress),
            None => self.download_whole(&plan, &mut progress),
        }
        .and_then(|stats| plan.commit().map(|()| stats));

        match downloaded {
            Ok((bytes, segments)) => {
                info!(path = %plan.destination.display(), bytes, segments, "artifact cached");
                Ok(FetchOutcome::Fetched {
                    path: plan.destination,
                    bytes,
                    segments,
                })
            }
            Err(CacheError::MissingSegment { index, .. }) if plan.destination.is_file() => {
                // A concurrent fetch of the same artifact combined the parts first.
                debug!(index, path = %plan.destination.display(), "artifact completed elsewhere");
                plan.discard();
                Ok(FetchOutcome::Cached {
                    path: plan.destination,
                })
            }
            Err(error) => {
                plan.discard();
                Err(error)
            }
        }
    }

    fn request_headers(&self) -> Headers {
        let mut headers: Headers = self
            .config
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        if let Some(token) = &self.config.auth_token {
            headers.insert("authorization".into(), format!("Bearer {token}"));
        }
        headers
    }

    fn send(&self, url: &str, headers: &Headers) -> Result<HttpResponse> {
        self.transport
            .get(url, headers)
            .map_err(|source| CacheError::Transport {
                url: url.to_owned(),
                source,
            })
    }

    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse> {
        let response = self.send(url, headers)?;
        if !response.is_success() {
            return Err(CacheError::Status {
                url: url.to_owned(),
                status: response.status,
            });
        }
        Ok(response)
    }

    fn download_whole<F>(&self, plan: &FetchPlan, progress: &mut F) -> Result<(u64, u32)>
    where
        F: FnMut(Progress),
    {
        let response = self.get(&plan.url, &plan.headers)?;
        ensure_directory(&plan.destination)?;
        let bytes = write_body(plan, response, progress)?;
        Ok((bytes, 0))
    }

    fn download_segmented<F>(
        &self,
        plan: &FetchPlan,
        segment_size: u64,
        progress: &mut F,
    ) -> Result<(u64, u32)>
    where
        F: FnMut(Progress),
    {
        let opening = self.send(&plan.url, &plan.with_range(0, 0))?;
        if opening.status == 416 {
            // Empty artifacts have no byte 0 to range over.
            debug!(url = %plan.url, "range not satisfiable, fetching without range");
            drop(opening);
            return self.download_whole(plan, progress);
        }
        if !opening.is_success() {
            return Err(CacheError::Status {
                url: plan.url.clone(),
                status: opening.status,
            });
        }
        if opening.status != 206 {
            debug!(url = %plan.url, status = opening.status, "range ignored, streaming whole body");
            ensure_directory(&plan.destination)?;
            let bytes = write_body(plan, opening, progress)?;
            return Ok((bytes, 0));
        }
        let total = content_range_total(&opening).ok_or_else(|| CacheError::InvalidRange {
            url: plan.url.clone(),
            detail: format!("content-range {:?}", opening.header("content-range")),
        })?;
        let record = SegmentRecord {
            url: plan.url.clone(),
            total,
            segment_size,
            etag: opening.header("etag").map(str::to_owned),
        };
        drop(opening);

        ensure_directory(&plan.destination)?;
        let count = u32::try_from(total.div_ceil(segment_size)).map_err(|_| {
            CacheError::InvalidRange {
                url: plan.url.clone(),
                detail: format!("{total} bytes need too many segments of {segment_size}"),
            }
        })?;
        let base = plan.segment_base();
        plan.adopt_record(&record, &base, count)?;
        let mut downloaded = 0u64;

        for index in 1..=count {
            let (start, end) = segment_bounds(index, segment_size, total);
            let expected = end - start + 1;
            let path = segment_path(&base, index);

            if file_len(&path) == Some(expected) {
                debug!(index, path = %path.display(), "reusing downloaded segment");
                downloaded += expected;
                progress(Progress {
                    downloaded,
                    total: Some(total),
                });
                continue;
            }

            let response = self.get(&plan.url, &plan.with_range(start, end))?;
            if response.status != 206 && !(start == 0 && expected == total) {
                return Err(CacheError::InvalidRange {
                    url: plan.url.clone(),
                    detail: format!(
                        "expected 206 for bytes {start}-{end}, got {}",
                        response.status
                    ),
                });
            }
            // Parts only ever appear under their final name once complete, so a
            // concurrent fetch of the same artifact never sees or truncates a
            // half-written one.
            let partial = with_suffix(&path, &format!(".{}.tmp", Uuid::new_v4().simple()));
            let written = stream_to_file(&plan.url, response.body, &partial, |read| {
                downloaded += read;
                progress(Progress {
                    downloaded,
                    total: Some(total),
                });
            })
            .and_then(|written| {
                if written == expected {
                    Ok(written)
                } else {
                    Err(CacheError::SegmentSize {
                        index,
                        expected,
                        actual: written,
                    })
                }
            })
            .and_then(|written| {
                fs::rename(&partial, &path)
                    .map(|()| written)
                    .map_err(|source| CacheError::io("move segment into place", &path, source))
            });
            if let Err(error) = written {
                remove_quietly(&partial);
                return Err(error);
            }
        }

        for index in 1..=count {
            let (start, end) = segment_bounds(index, segment_size, total);
            let expected = end - start + 1;
            let path = segment_path(&base, index);
            match file_len(&path) {
                Some(actual) if actual == expected => {}
                Some(actual) => {
                    return Err(CacheError::SegmentSize {
                        index,
                        expected,
                        actual,
                    })
                }
                None => return Err(CacheError::MissingSegment { index, path }),
            }
        }

        combine_segments(&plan.staging, &base, count)?;
        remove_quietly(&plan.record_path());
        Ok((total, count))
    }
}

/// Fetches `cache_root/model_id/file_name` through `transport` with default settings.
pub fn fetch<T>(
    model_id: &str,
    file_name: &str,
    transport: &T,
    cache_root: impl AsRef<Path>,
) -> Result<PathBuf>
where
    T: HttpTransport + ?Sized,
{
    let config = HubConfig::default().with_cache_dir(cache_root.as_ref());
    ArtifactFetcher::new(config, transport)
        .fetch(model_id, file_name)
        .map(FetchOutcome::into_path)
}

fn write_body<F>(plan: &FetchPlan, response: HttpResponse, progress: &mut F) -> Result<u64>
where
    F: FnMut(Progress),
{
    let total = response.content_length();
    let mut downloaded = 0u64;
    stream_to_file(&plan.url, response.body, &plan.staging, |read| {
        downloaded += read;
        progress(Progress { downloaded, total });
    })
}

fn stream_to_file(
    url: &str,
    mut body: impl Read,
    path: &Path,
    mut on_chunk: impl FnMut(u64),
) -> Result<u64> {
    let mut file =
        File::create(path).map_err(|source| CacheError::io("create download file", path, source))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let read = match body.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                return Err(CacheError::Transport {
                    url: url.to_owned(),
                    source: Box::new(error),
                })
            }
        };
        file.write_all(&buffer[..read])
            .map_err(|source| CacheError::io("write download chunk", path, source))?;
        written += read as u64;
        on_chunk(read as u64);
    }
    file.sync_all()
        .map_err(|source| CacheError::io("sync download file", path, source))?;
    Ok(written)
}

/// Total length from a `Content-Range: bytes <start>-<end>/<total>` header.
fn content_range_total(response: &HttpResponse) -> Option<u64> {
    let value = response.header("content-range")?;
    let (_, total) = value.trim().split_once('/')?;
    total.trim().parse().ok()
}

/// Inclusive byte bounds of 1-based segment `index`.
fn segment_bounds(index: u32, segment_size: u64, total: u64) -> (u64, u64) {
    let start = u64::from(index - 1) * segment_size;
    let end = (start + segment_size).min(total) - 1;
    (start, end)
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), "failed to remove file: {error}"),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
