//! In-memory `MediaServer` for engine tests, usable as a source or a
//! destination, with fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::error::TransferError;
use super::types::{AlbumRef, AssetKind, AssetRef, DownloadedAsset, UploadRequest};
use super::{part_path, MediaServer};
use crate::checksum;
use crate::metadata::CaptureMetadata;

#[derive(Debug, Clone)]
pub struct UploadedAsset {
    pub destination_id: String,
    pub source_id: String,
    pub live_photo_video_id: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    albums: Vec<AlbumRef>,
    album_assets: HashMap<String, Vec<String>>,
    assets: BTreeMap<String, (AssetRef, Vec<u8>)>,

    uploads: Vec<UploadedAsset>,
    dest_albums: BTreeMap<String, (String, BTreeSet<String>)>,
    next_id: u64,

    /// Remaining corrupted downloads per source id (`u32::MAX` = forever).
    corrupt_downloads: HashMap<String, u32>,
    /// Remaining transient download failures per source id.
    flaky_downloads: HashMap<String, u32>,
    rejected_uploads: HashSet<String>,
    destination_down: bool,
    listing_down: bool,
    cancel_after_uploads: Option<(usize, CancellationToken)>,
}

#[derive(Default)]
pub struct InMemoryServer {
    inner: Mutex<Inner>,
}

pub fn photo(id: &str, pair_id: Option<&str>) -> AssetRef {
    asset(id, AssetKind::Photo, pair_id, &format!("{id}.jpg"))
}

pub fn video(id: &str, pair_id: Option<&str>) -> AssetRef {
    asset(id, AssetKind::Video, pair_id, &format!("{id}.mov"))
}

pub fn sidecar(id: &str) -> AssetRef {
    asset(id, AssetKind::Sidecar, None, &format!("{id}.xmp"))
}

fn asset(id: &str, kind: AssetKind, pair_id: Option<&str>, filename: &str) -> AssetRef {
    AssetRef {
        source_id: id.to_string(),
        kind,
        pair_id: pair_id.map(String::from),
        original_filename: filename.to_string(),
        declared_checksum: None,
        size_bytes: 0,
        capture_metadata: CaptureMetadata::default(),
    }
}

fn unavailable(operation: &str) -> TransferError {
    TransferError::Unavailable {
        operation: operation.to_string(),
        message: "connection refused".into(),
    }
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source album. Each asset's content is derived from its id and
    /// its declared checksum is the SHA-256 of that content.
    pub fn add_album(&self, album_id: &str, name: &str, assets: Vec<AssetRef>) {
        let mut inner = self.inner.lock().unwrap();
        let mut ids = Vec::new();
        for mut asset in assets {
            let bytes = format!("content of {}", asset.source_id).into_bytes();
            let hash = checksum::hash_reader(&bytes[..]).unwrap();
            asset.declared_checksum.get_or_insert_with(|| hash.to_hex());
            asset.size_bytes = bytes.len() as u64;
            ids.push(asset.source_id.clone());
            inner
                .assets
                .entry(asset.source_id.clone())
                .or_insert((asset, bytes));
        }
        inner.album_assets.insert(album_id.to_string(), ids);
        inner.albums.push(AlbumRef {
            id: album_id.to_string(),
            name: name.to_string(),
            asset_count: None,
        });
    }

    pub fn set_declared_checksum(&self, source_id: &str, checksum: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((asset, _)) = inner.assets.get_mut(source_id) {
            asset.declared_checksum = checksum.map(String::from);
        }
    }

    pub fn corrupt_downloads(&self, source_id: &str, times: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.corrupt_downloads.insert(source_id.to_string(), times);
    }

    pub fn flaky_downloads(&self, source_id: &str, times: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.flaky_downloads.insert(source_id.to_string(), times);
    }

    pub fn reject_uploads(&self, source_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.rejected_uploads.insert(source_id.to_string());
    }

    pub fn allow_uploads(&self, source_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.rejected_uploads.remove(source_id);
    }

    pub fn set_destination_down(&self, down: bool) {
        self.inner.lock().unwrap().destination_down = down;
    }

    pub fn set_listing_down(&self, down: bool) {
        self.inner.lock().unwrap().listing_down = down;
    }

    /// Cancel `token` once `count` uploads have succeeded.
    pub fn cancel_after_uploads(&self, count: usize, token: CancellationToken) {
        self.inner.lock().unwrap().cancel_after_uploads = Some((count, token));
    }

    /// Pre-create a destination album.
    pub fn add_destination_album(&self, album_id: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .dest_albums
            .insert(album_id.to_string(), (name.to_string(), BTreeSet::new()));
    }

    pub fn uploads(&self) -> Vec<UploadedAsset> {
        self.inner.lock().unwrap().uploads.clone()
    }

    pub fn upload_count(&self, source_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .uploads
            .iter()
            .filter(|u| u.source_id == source_id)
            .count()
    }

    pub fn destination_album_members(&self, name: &str) -> BTreeSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .dest_albums
            .values()
            .find(|(n, _)| n == name)
            .map(|(_, members)| members.clone())
            .unwrap_or_default()
    }

    pub fn destination_album_count(&self) -> usize {
        self.inner.lock().unwrap().dest_albums.len()
    }
}

#[async_trait::async_trait]
impl MediaServer for InMemoryServer {
    async fn list_albums(&self) -> Result<Vec<AlbumRef>, TransferError> {
        let inner = self.inner.lock().unwrap();
        if inner.listing_down {
            return Err(unavailable("list_albums"));
        }
        let mut albums = inner.albums.clone();
        for (id, (name, members)) in &inner.dest_albums {
            albums.push(AlbumRef {
                id: id.clone(),
                name: name.clone(),
                asset_count: Some(members.len() as u64),
            });
        }
        Ok(albums)
    }

    async fn list_assets(&self, album_id: &str) -> Result<Vec<AssetRef>, TransferError> {
        let inner = self.inner.lock().unwrap();
        if inner.listing_down {
            return Err(unavailable("list_assets"));
        }
        let ids = inner
            .album_assets
            .get(album_id)
            .ok_or_else(|| TransferError::NotFound(format!("album {album_id}")))?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.assets.get(id).map(|(a, _)| a.clone()))
            .collect())
    }

    async fn download(
        &self,
        asset_id: &str,
        dest: &Path,
    ) -> Result<DownloadedAsset, TransferError> {
        let (asset, bytes) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(remaining) = inner.flaky_downloads.get_mut(asset_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(unavailable("download"));
                }
            }
            let (asset, bytes) = inner
                .assets
                .get(asset_id)
                .cloned()
                .ok_or_else(|| TransferError::NotFound(format!("asset {asset_id}")))?;
            if let Some(remaining) = inner.corrupt_downloads.get_mut(asset_id) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    let mut corrupted = bytes.clone();
                    corrupted[0] ^= 0xFF;
                    (asset, corrupted)
                } else {
                    (asset, bytes)
                }
            } else {
                (asset, bytes)
            }
        };

        let part = part_path(dest);
        tokio::fs::write(&part, &bytes).await?;
        tokio::fs::rename(&part, dest).await?;
        Ok(DownloadedAsset {
            declared_checksum: asset.declared_checksum,
            capture_metadata: asset.capture_metadata,
            bytes_written: bytes.len() as u64,
        })
    }

    async fn upload(
        &self,
        local_path: &Path,
        request: &UploadRequest,
    ) -> Result<String, TransferError> {
        let bytes = tokio::fs::read(local_path).await?;
        let mut inner = self.inner.lock().unwrap();
        if inner.destination_down {
            return Err(unavailable("upload"));
        }
        if inner.rejected_uploads.contains(&request.source_id) {
            return Err(TransferError::HttpStatus {
                status: 400,
                operation: "upload".into(),
                body: "unsupported file".into(),
            });
        }
        if let Some(video_id) = &request.live_photo_video_id {
            if !inner.uploads.iter().any(|u| &u.destination_id == video_id) {
                return Err(TransferError::HttpStatus {
                    status: 400,
                    operation: "upload".into(),
                    body: format!("unknown live photo video {video_id}"),
                });
            }
        }

        inner.next_id += 1;
        let destination_id = format!("dest-{}", inner.next_id);
        inner.uploads.push(UploadedAsset {
            destination_id: destination_id.clone(),
            source_id: request.source_id.clone(),
            live_photo_video_id: request.live_photo_video_id.clone(),
            bytes,
        });

        let done = inner.uploads.len();
        if let Some((count, token)) = &inner.cancel_after_uploads {
            if done >= *count {
                token.cancel();
            }
        }
        Ok(destination_id)
    }

    async fn create_album(&self, name: &str) -> Result<String, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.destination_down {
            return Err(unavailable("create_album"));
        }
        inner.next_id += 1;
        let id = format!("dest-album-{}", inner.next_id);
        inner
            .dest_albums
            .insert(id.clone(), (name.to_string(), BTreeSet::new()));
        Ok(id)
    }

    async fn add_to_album(
        &self,
        album_id: &str,
        destination_ids: &[String],
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.destination_down {
            return Err(unavailable("add_to_album"));
        }
        let (_, members) = inner
            .dest_albums
            .get_mut(album_id)
            .ok_or_else(|| TransferError::NotFound(format!("album {album_id}")))?;
        members.extend(destination_ids.iter().cloned());
        Ok(())
    }
}
