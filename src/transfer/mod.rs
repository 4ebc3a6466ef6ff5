//! Transfer client adapter: the narrow surface the migration engine needs
//! from a media server, plus an HTTP implementation.

pub mod error;
pub mod http;
#[cfg(test)]
pub mod memory;
pub mod types;

use std::path::Path;

pub use error::TransferError;
pub use http::HttpMediaServer;
pub use types::{AlbumRef, AssetKind, AssetRef, DownloadedAsset, UploadRequest};

/// A media server the engine can read from or write to.
///
/// The source side uses the listing and download calls, the destination side
/// the upload and album calls. Implementations must be cheap to share across
/// concurrent workers.
#[async_trait::async_trait]
pub trait MediaServer: Send + Sync {
    async fn list_albums(&self) -> Result<Vec<AlbumRef>, TransferError>;

    async fn list_assets(&self, album_id: &str) -> Result<Vec<AssetRef>, TransferError>;

    /// Fetch the original bytes of `asset_id` into `dest`.
    ///
    /// Bytes are streamed to a `.part` sibling and renamed on completion, so
    /// `dest` only ever holds a complete transfer.
    async fn download(&self, asset_id: &str, dest: &Path)
        -> Result<DownloadedAsset, TransferError>;

    /// Upload a local file, returning the destination's id for it.
    async fn upload(
        &self,
        local_path: &Path,
        request: &UploadRequest,
    ) -> Result<String, TransferError>;

    async fn create_album(&self, name: &str) -> Result<String, TransferError>;

    async fn add_to_album(
        &self,
        album_id: &str,
        destination_ids: &[String],
    ) -> Result<(), TransferError>;
}

/// Temp path a download streams into before being renamed over `dest`.
pub fn part_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/scratch/run/a1/IMG_0001.HEIC")),
            Path::new("/scratch/run/a1/IMG_0001.HEIC.part")
        );
    }
}
