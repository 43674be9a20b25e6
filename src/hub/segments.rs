use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Path of segment `index` (1-based): the base path with the index appended.
#[must_use]
pub fn segment_path(base: &Path, index: u32) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(index.to_string());
    PathBuf::from(name)
}

/// Concatenates segments `1..=count` of `segment_base` into `final_path`,
/// then deletes them.
///
/// Nothing is written unless every segment exists. If appending fails
/// part-way, the partial output and every segment are left on disk. Once the
/// output is synced, a segment that cannot be removed is only logged.
pub fn combine_segments(
    final_path: impl AsRef<Path>,
    segment_base: impl AsRef<Path>,
    count: u32,
) -> Result<()> {
    combine_with(
        final_path.as_ref(),
        segment_base.as_ref(),
        count,
        |path: &Path| File::open(path),
        |path: &Path| fs::remove_file(path),
    )
}

fn combine_with<R, O, D>(
    final_path: &Path,
    segment_base: &Path,
    count: u32,
    mut open: O,
    mut remove: D,
) -> Result<()>
where
    R: Read,
    O: FnMut(&Path) -> io::Result<R>,
    D: FnMut(&Path) -> io::Result<()>,
{
    let segments: Vec<PathBuf> = (1..=count)
        .map(|index| segment_path(segment_base, index))
        .collect();

    for (index, path) in (1..).zip(&segments) {
        if !path.is_file() {
            return Err(CacheError::MissingSegment {
                index,
                path: path.clone(),
            });
        }
    }

    let file = File::create(final_path)
        .map_err(|source| CacheError::io("create combined file", final_path, source))?;
    let mut writer = BufWriter::new(file);
    for (index, path) in (1..).zip(&segments) {
        let mut segment = open(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => CacheError::MissingSegment {
                index,
                path: path.clone(),
            },
            _ => CacheError::io("open segment", path, source),
        })?;
        io::copy(&mut segment, &mut writer)
            .map_err(|source| CacheError::io("append segment", path, source))?;
    }
    let file = writer
        .into_inner()
        .map_err(|error| CacheError::io("flush combined file", final_path, error.into_error()))?;
    file.sync_all()
        .map_err(|source| CacheError::io("sync combined file", final_path, source))?;

    for path in &segments {
        if let Err(error) = remove(path) {
            warn!(path = %path.display(), "failed to remove combined segment: {error}");
        }
    }
    debug!(path = %final_path.display(), count, "combined segments");
    Ok(())
}
