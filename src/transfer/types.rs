use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::metadata::CaptureMetadata;

/// A named collection on a media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRef {
    pub id: String,
    pub name: String,
    pub asset_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Photo,
    Video,
    Sidecar,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Sidecar => "sidecar",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "sidecar" => Some(Self::Sidecar),
            _ => None,
        }
    }
}

/// One media item or sidecar as listed by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub source_id: String,
    pub kind: AssetKind,
    /// Shared by the photo and video halves of a live photo.
    pub pair_id: Option<String>,
    pub original_filename: String,
    pub declared_checksum: Option<String>,
    pub size_bytes: u64,
    pub capture_metadata: CaptureMetadata,
}

/// What the source reported alongside a completed download.
#[derive(Debug, Clone, Default)]
pub struct DownloadedAsset {
    pub declared_checksum: Option<String>,
    pub capture_metadata: CaptureMetadata,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source_id: String,
    pub filename: String,
    pub capture_metadata: CaptureMetadata,
    /// Destination id of the already uploaded video half of a live photo.
    pub live_photo_video_id: Option<String>,
}

/// Drop pair ids that do not describe exactly one photo and one video.
///
/// A pair whose partner is missing from the listing, or whose members are of
/// the wrong kinds, degrades to independent single assets.
pub fn normalize_pairs(assets: &mut [AssetRef]) {
    let mut members: HashMap<String, Vec<AssetKind>> = HashMap::new();
    for asset in assets.iter() {
        if let Some(pair_id) = &asset.pair_id {
            members.entry(pair_id.clone()).or_default().push(asset.kind);
        }
    }

    for asset in assets.iter_mut() {
        let Some(pair_id) = &asset.pair_id else {
            continue;
        };
        let valid = members.get(pair_id).is_some_and(|kinds| {
            kinds.len() == 2 && kinds.contains(&AssetKind::Photo) && kinds.contains(&AssetKind::Video)
        });
        if !valid {
            tracing::warn!(
                source_id = %asset.source_id,
                pair_id = %pair_id,
                "Incomplete live-photo pair, treating as a single asset"
            );
            asset.pair_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(id: &str, kind: AssetKind, pair: Option<&str>) -> AssetRef {
        AssetRef {
            source_id: id.into(),
            kind,
            pair_id: pair.map(String::from),
            original_filename: format!("{id}.bin"),
            declared_checksum: None,
            size_bytes: 0,
            capture_metadata: CaptureMetadata::default(),
        }
    }

    #[test]
    fn test_asset_kind_round_trip() {
        for kind in [AssetKind::Photo, AssetKind::Video, AssetKind::Sidecar] {
            assert_eq!(AssetKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(AssetKind::from_str("audio"), None);
    }

    #[test]
    fn test_normalize_keeps_valid_pair() {
        let mut assets = vec![
            asset("a", AssetKind::Photo, Some("p1")),
            asset("b", AssetKind::Video, Some("p1")),
        ];
        normalize_pairs(&mut assets);
        assert!(assets.iter().all(|a| a.pair_id.as_deref() == Some("p1")));
    }

    #[test]
    fn test_normalize_degrades_orphan_and_malformed_pairs() {
        let mut assets = vec![
            asset("a", AssetKind::Photo, Some("orphan")),
            asset("b", AssetKind::Photo, Some("two-photos")),
            asset("c", AssetKind::Photo, Some("two-photos")),
            asset("d", AssetKind::Video, Some("triple")),
            asset("e", AssetKind::Photo, Some("triple")),
            asset("f", AssetKind::Video, Some("triple")),
        ];
        normalize_pairs(&mut assets);
        assert!(assets.iter().all(|a| a.pair_id.is_none()));
    }
}
