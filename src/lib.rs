//! Local cache for remotely hosted model artifacts.
//!
//! [`ArtifactFetcher`] maps a model id and file name to a path under the
//! configured cache directory and downloads the file over HTTP when it is not
//! there yet. Downloads land in a temporary sibling and are renamed into place,
//! optionally assembled from ranged segments that survive an interrupted run.
//!
//! ```no_run
//! use hub_cache::{ArtifactFetcher, HubConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let fetcher = ArtifactFetcher::with_default_transport(HubConfig::from_env())?;
//! let outcome = fetcher.fetch("Xenova/bert-base-uncased", "config.json")?;
//! println!("{}", outcome.path().display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod logging;

pub use config::HubConfig;
pub use error::{CacheError, Result, TransportError};
pub use hub::{
    cache_path, combine_segments, ensure_directory, fetch, join_paths, segment_path,
    validate_entry, ArtifactFetcher, FetchOptions, FetchOutcome, Headers, HttpResponse,
    HttpTransport, Progress, ReqwestTransport,
};
