pub mod manifest;
pub mod mmap;

pub use manifest::{BuildManifest, CatalogStamp, ManifestStore, SpaceManifest, MANIFEST_NAME};
pub use mmap::MmapSource;
