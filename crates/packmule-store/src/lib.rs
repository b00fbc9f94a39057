//! Content-addressed artifact storage shared by every request and worker.

mod download;
mod proxy;
mod store;

pub use download::{download_verified, DownloadRequest, DownloadedArtifact};
pub use proxy::{escape_module_path, ModuleInfo, RemoteProxy};
pub use store::{ArtifactMeta, ArtifactStore, StoreError};
