mod fetch;
mod paths;
mod segments;
mod transport;

pub use fetch::{fetch, ArtifactFetcher, FetchOptions, FetchOutcome, Progress};
pub use paths::{cache_path, ensure_directory, join_paths, validate_entry};
pub use segments::{combine_segments, segment_path};
pub use transport::{Headers, HttpResponse, HttpTransport, ReqwestTransport};
