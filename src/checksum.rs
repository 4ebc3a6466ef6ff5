//! Content hashing for integrity verification and idempotency checks.
//!
//! The migration's own content hash is SHA-256 over the raw file bytes.
//! Servers declare checksums in other shapes: Immich reports a base64 SHA-1,
//! others a hex or base64 SHA-256. [`DeclaredDigest::parse`] keeps the
//! algorithm alongside the bytes so [`verify`] checks the download against
//! the digest the server actually gave, while still producing the SHA-256
//! that is stored.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::Engine;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

const READ_CHUNK: usize = 64 * 1024;

/// A SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Lowercase hex form, as stored in the state database.
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    /// Parse a SHA-256 in any of the accepted encodings.
    ///
    /// Accepts 64-char hex, base64 of the raw 32 bytes, or base64 of 33 bytes
    /// with a leading `0x01` type byte.
    pub fn parse(declared: &str) -> Option<Self> {
        match DeclaredDigest::parse(declared)? {
            DeclaredDigest::Sha256(hash) => Some(hash),
            DeclaredDigest::Sha1(_) => None,
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A checksum as declared by a source server, tagged with its algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredDigest {
    Sha1([u8; 20]),
    Sha256(ContentHash),
}

impl DeclaredDigest {
    /// Parse a declared checksum.
    ///
    /// 40-char hex or base64 of 20 bytes is SHA-1. 64-char hex, base64 of 32
    /// bytes, or base64 of 33 bytes led by `0x01` is SHA-256. Anything else
    /// yields `None`.
    pub fn parse(declared: &str) -> Option<Self> {
        let declared = declared.trim();
        if declared.bytes().all(|b| b.is_ascii_hexdigit()) {
            match declared.len() {
                40 => return Some(Self::Sha1(decode_hex(declared)?)),
                64 => return Some(Self::Sha256(ContentHash(decode_hex(declared)?))),
                _ => {}
            }
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(declared)
            .ok()?;
        match decoded.len() {
            20 => Some(Self::Sha1(decoded.try_into().ok()?)),
            32 => Some(Self::Sha256(ContentHash(decoded.try_into().ok()?))),
            33 if decoded[0] == 0x01 => Some(Self::Sha256(ContentHash(decoded[1..].try_into().ok()?))),
            _ => None,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Sha1(_) => "sha1",
            Self::Sha256(_) => "sha256",
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            Self::Sha1(bytes) => to_hex(bytes),
            Self::Sha256(hash) => hash.to_hex(),
        }
    }
}

impl From<ContentHash> for DeclaredDigest {
    fn from(hash: ContentHash) -> Self {
        Self::Sha256(hash)
    }
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch for {path}: expected {algorithm} {expected}, got {actual}")]
    Mismatch {
        path: PathBuf,
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Failed to read {path} for hashing: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex<const N: usize>(hex: &str) -> Option<[u8; N]> {
    if hex.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = (hi * 16 + lo) as u8;
    }
    Some(out)
}

/// Hash everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(ContentHash(hasher.finalize().into()))
}

/// SHA-256 and SHA-1 of everything `reader` yields, in one pass.
fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<(ContentHash, [u8; 20])> {
    let mut sha256 = Sha256::new();
    let mut sha1 = Sha1::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sha256.update(&buf[..n]);
        sha1.update(&buf[..n]);
    }
    Ok((ContentHash(sha256.finalize().into()), sha1.finalize().into()))
}

fn open(path: &Path) -> Result<std::io::BufReader<std::fs::File>, ChecksumError> {
    std::fs::File::open(path)
        .map(std::io::BufReader::new)
        .map_err(|source| ChecksumError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Hash a file on disk. Blocking.
pub fn hash_file(path: &Path) -> Result<ContentHash, ChecksumError> {
    hash_reader(open(path)?).map_err(|source| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Check `local_path` against a declared digest of either algorithm.
///
/// Returns the file's SHA-256 on a match. Blocking.
pub fn verify(expected: &DeclaredDigest, local_path: &Path) -> Result<ContentHash, ChecksumError> {
    let (sha256, sha1) = digest_reader(open(local_path)?).map_err(|source| ChecksumError::Io {
        path: local_path.to_path_buf(),
        source,
    })?;
    let actual = match expected {
        DeclaredDigest::Sha1(want) if *want == sha1 => return Ok(sha256),
        DeclaredDigest::Sha256(want) if *want == sha256 => return Ok(sha256),
        DeclaredDigest::Sha1(_) => to_hex(&sha1),
        DeclaredDigest::Sha256(_) => sha256.to_hex(),
    };
    Err(ChecksumError::Mismatch {
        path: local_path.to_path_buf(),
        algorithm: expected.algorithm(),
        expected: expected.to_hex(),
        actual,
    })
}

/// [`hash_file`] on the blocking pool.
pub async fn hash_file_async(path: &Path) -> Result<ContentHash, ChecksumError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&owned))
        .await
        .map_err(|e| ChecksumError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })?
}

/// [`verify`] on the blocking pool.
pub async fn verify_async(
    expected: DeclaredDigest,
    local_path: &Path,
) -> Result<ContentHash, ChecksumError> {
    let owned = local_path.to_path_buf();
    tokio::task::spawn_blocking(move || verify(&expected, &owned))
        .await
        .map_err(|e| ChecksumError::Io {
            path: local_path.to_path_buf(),
            source: std::io::Error::other(e),
        })?
}
