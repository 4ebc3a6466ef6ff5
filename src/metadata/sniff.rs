//! Container detection from file content.
//!
//! Mislabeled files (a HEIC named `.jpg`, a MOV named `.mp4`) are common in
//! exported libraries, so dispatch is always on magic bytes. Binary formats
//! are recognized by `infer`; XMP sidecars are plain XML and checked here.

use std::io::Read;
use std::path::Path;

/// Number of leading bytes inspected, the same window `infer` reads from a path.
const SNIFF_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Jpeg,
    Png,
    Tiff,
    WebP,
    Heif,
    Mp4,
    QuickTime,
    Xmp,
    Unknown,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Tiff => "tiff",
            Self::WebP => "webp",
            Self::Heif => "heif",
            Self::Mp4 => "mp4",
            Self::QuickTime => "quicktime",
            Self::Xmp => "xmp",
            Self::Unknown => "unknown",
        }
    }

    /// Filename extensions that normally carry this container.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Jpeg => &["jpg", "jpeg", "jpe"],
            Self::Png => &["png"],
            Self::Tiff => &["tif", "tiff", "dng"],
            Self::WebP => &["webp"],
            Self::Heif => &["heic", "heif", "avif", "hif"],
            Self::Mp4 => &["mp4", "m4v", "3gp"],
            Self::QuickTime => &["mov", "qt"],
            Self::Xmp => &["xmp"],
            Self::Unknown => &[],
        }
    }
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ContainerKind {
    fn from_mime(mime: &str) -> Self {
        match mime {
            "image/jpeg" => Self::Jpeg,
            "image/png" => Self::Png,
            "image/tiff" => Self::Tiff,
            "image/webp" => Self::WebP,
            "image/heif" | "image/avif" => Self::Heif,
            "video/mp4" | "video/x-m4v" | "video/3gpp" => Self::Mp4,
            "video/quicktime" => Self::QuickTime,
            // Raw formats sharing TIFF or ISO box layouts, audio-only MP4 and
            // everything else the injector has no writer for.
            _ => Self::Unknown,
        }
    }
}

/// Classify a file from its leading bytes.
pub fn sniff_bytes(head: &[u8]) -> ContainerKind {
    if looks_like_xmp(head) {
        return ContainerKind::Xmp;
    }
    match infer::get(head).map(|kind| ContainerKind::from_mime(kind.mime_type())) {
        Some(ContainerKind::Mp4 | ContainerKind::QuickTime) => movie_kind(head),
        Some(kind) => kind,
        None => ContainerKind::Unknown,
    }
}

/// MP4 and QuickTime share the box layout; the `ftyp` major brand decides.
/// Files that open straight with an atom are old QuickTime.
fn movie_kind(head: &[u8]) -> ContainerKind {
    match head.get(4..12) {
        Some([b'f', b't', b'y', b'p', brand @ ..]) if brand != b"qt  " => ContainerKind::Mp4,
        _ => ContainerKind::QuickTime,
    }
}

fn looks_like_xmp(head: &[u8]) -> bool {
    let text = head.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(head);
    let start = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(text.len());
    let text = &text[start..];
    if text.starts_with(b"<?xpacket") || text.starts_with(b"<x:xmpmeta") {
        return true;
    }
    text.starts_with(b"<?xml") && text.windows(7).any(|w| w == b"xmpmeta")
}

/// Classify a file on disk. Blocking.
pub fn sniff_path(path: &Path) -> std::io::Result<ContainerKind> {
    let file = std::fs::File::open(path)?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(sniff_bytes(&head))
}

/// Whether the path's extension is one this container normally uses.
/// Paths without an extension never match.
pub fn extension_matches(path: &Path, kind: ContainerKind) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            kind.extensions().iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 24];
        v.extend_from_slice(b"ftyp");
        v.extend_from_slice(brand);
        v.extend_from_slice(&[0, 0, 0, 0]);
        v.extend_from_slice(brand);
        v.extend_from_slice(b"isom");
        v
    }

    /// Pad a signature so length checks never decide the result.
    fn padded(head: &[u8]) -> Vec<u8> {
        let mut v = head.to_vec();
        v.resize(64, 0);
        v
    }

    #[test]
    fn test_sniff_images() {
        assert_eq!(sniff_bytes(&padded(&[0xFF, 0xD8, 0xFF, 0xE1])), ContainerKind::Jpeg);
        assert_eq!(
            sniff_bytes(&padded(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])),
            ContainerKind::Png
        );
        assert_eq!(sniff_bytes(&padded(b"II*\0\x08\0\0\0")), ContainerKind::Tiff);
        assert_eq!(sniff_bytes(&padded(b"MM\0*\0\0\0\x08")), ContainerKind::Tiff);
        assert_eq!(
            sniff_bytes(&padded(b"RIFF\x10\0\0\0WEBPVP8 ")),
            ContainerKind::WebP
        );
    }

    #[test]
    fn test_sniff_ftyp_brands() {
        assert_eq!(sniff_bytes(&padded(&ftyp(b"heic"))), ContainerKind::Heif);
        // Camera MOV files carry a 20-byte ftyp box.
        let mut mov = vec![0, 0, 0, 20];
        mov.extend_from_slice(b"ftypqt  \0\0\0\0qt  ");
        assert_eq!(sniff_bytes(&padded(&mov)), ContainerKind::QuickTime);
        assert_eq!(sniff_bytes(&padded(&ftyp(b"isom"))), ContainerKind::Mp4);
        assert_eq!(sniff_bytes(&padded(&ftyp(b"mp42"))), ContainerKind::Mp4);
    }

    #[test]
    fn test_sniff_bare_quicktime_atom() {
        assert_eq!(
            sniff_bytes(&padded(b"\0\0\0\x08wide\0\0\0\0mdat")),
            ContainerKind::QuickTime
        );
    }

    #[test]
    fn test_unmanaged_mime_types_are_unknown() {
        assert_eq!(ContainerKind::from_mime("image/gif"), ContainerKind::Unknown);
        assert_eq!(ContainerKind::from_mime("audio/m4a"), ContainerKind::Unknown);
        assert_eq!(ContainerKind::from_mime("image/avif"), ContainerKind::Heif);
    }

    #[test]
    fn test_sniff_xmp() {
        assert_eq!(
            sniff_bytes(b"<?xpacket begin='' id='W5M0MpCehiHzreSzNTczkc9d'?>"),
            ContainerKind::Xmp
        );
        assert_eq!(
            sniff_bytes(b"\xEF\xBB\xBF  <x:xmpmeta xmlns:x='adobe:ns:meta/'>"),
            ContainerKind::Xmp
        );
        assert_eq!(
            sniff_bytes(b"<?xml version='1.0'?><x:xmpmeta xmlns:x='adobe:ns:meta/'>"),
            ContainerKind::Xmp
        );
        assert_eq!(sniff_bytes(b"<?xml version='1.0'?><svg/>"), ContainerKind::Unknown);
    }

    #[test]
    fn test_sniff_unknown_and_short() {
        assert_eq!(sniff_bytes(b""), ContainerKind::Unknown);
        assert_eq!(sniff_bytes(b"plain text"), ContainerKind::Unknown);
    }

    #[test]
    fn test_sniff_path_ignores_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_0001.JPG");
        std::fs::write(&path, padded(&ftyp(b"heic"))).unwrap();
        let kind = sniff_path(&path).unwrap();
        assert_eq!(kind, ContainerKind::Heif);
        assert!(!extension_matches(&path, kind));
        assert!(extension_matches(&path, ContainerKind::Jpeg));
    }

    #[test]
    fn test_extension_matches_without_extension() {
        assert!(!extension_matches(Path::new("README"), ContainerKind::Jpeg));
    }
}
