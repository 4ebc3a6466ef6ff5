//! Metadata injector. Rewrites capture metadata inside downloaded files so
//! the destination server indexes them under their original timestamps.
//!
//! Dispatch is on the sniffed container, never on the filename. Every write
//! is followed by a read-back; a field that did not take is reported as
//! [`InjectionError::ReadOnlyField`] instead of a silent success.

pub mod exif;
pub mod quicktime;
pub mod sniff;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sniff::ContainerKind;

/// Capture-time metadata extracted from the source server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub date_time_original: Option<DateTime<FixedOffset>>,
    pub create_date: Option<DateTime<FixedOffset>>,
    pub modify_date: Option<DateTime<FixedOffset>>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub description: Option<String>,
}

impl CaptureMetadata {
    pub fn is_empty(&self) -> bool {
        self.date_time_original.is_none()
            && self.create_date.is_none()
            && self.modify_date.is_none()
            && self.make.is_none()
            && self.model.is_none()
            && self.description.is_none()
    }
}

/// A single embedded field the injector knows how to write and read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataField {
    DateTimeOriginal,
    CreateDate,
    ModifyDate,
    Make,
    Model,
    Description,
}

impl MetadataField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DateTimeOriginal => "DateTimeOriginal",
            Self::CreateDate => "CreateDate",
            Self::ModifyDate => "ModifyDate",
            Self::Make => "Make",
            Self::Model => "Model",
            Self::Description => "Description",
        }
    }
}

impl std::fmt::Display for MetadataField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field values in the container's own canonical text form.
pub type FieldValues = BTreeMap<MetadataField, String>;

#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("Unrecognized container format in {path}")]
    UnknownContainer { path: PathBuf },

    #[error("Metadata rewriting is not supported for {container} files ({path})")]
    UnsupportedContainer {
        container: ContainerKind,
        path: PathBuf,
    },

    #[error("{field} could not be written to {container} file (value unchanged after write)")]
    ReadOnlyField {
        field: MetadataField,
        container: ContainerKind,
    },

    #[error("Malformed {container} file: {message}")]
    Malformed {
        container: ContainerKind,
        message: String,
    },

    #[error("I/O error during metadata injection: {0}")]
    Io(#[from] std::io::Error),
}

/// Rewrite the embedded capture metadata of `local_path` in place.
///
/// Blocking; callers on the async runtime go through [`inject_async`].
pub fn inject(local_path: &Path, metadata: &CaptureMetadata) -> Result<(), InjectionError> {
    if metadata.is_empty() {
        return Ok(());
    }

    let container = detect(local_path)?;
    let expected = match container {
        ContainerKind::Jpeg | ContainerKind::Png | ContainerKind::WebP => {
            exif::write(local_path, container, metadata)?;
            exif::expected_values(metadata)
        }
        ContainerKind::Mp4 | ContainerKind::QuickTime => {
            quicktime::write(local_path, container, metadata)?;
            quicktime::expected_values(metadata)
        }
        ContainerKind::Tiff | ContainerKind::Heif | ContainerKind::Xmp => {
            return Err(InjectionError::UnsupportedContainer {
                container,
                path: local_path.to_path_buf(),
            })
        }
        ContainerKind::Unknown => {
            return Err(InjectionError::UnknownContainer {
                path: local_path.to_path_buf(),
            })
        }
    };

    let actual = read_fields_as(local_path, container)?;
    for (field, want) in &expected {
        if actual.get(field) != Some(want) {
            tracing::debug!(
                path = %local_path.display(),
                field = %field,
                expected = %want,
                actual = ?actual.get(field),
                "Metadata field did not take"
            );
            return Err(InjectionError::ReadOnlyField {
                field: *field,
                container,
            });
        }
    }

    tracing::debug!(
        path = %local_path.display(),
        container = %container,
        fields = expected.len(),
        "Injected capture metadata"
    );
    Ok(())
}

/// Read back the fields the injector manages, in canonical form.
#[cfg(test)]
pub fn read_fields(local_path: &Path) -> Result<FieldValues, InjectionError> {
    let container = detect(local_path)?;
    read_fields_as(local_path, container)
}

fn read_fields_as(local_path: &Path, container: ContainerKind) -> Result<FieldValues, InjectionError> {
    match container {
        ContainerKind::Jpeg | ContainerKind::Png | ContainerKind::Tiff | ContainerKind::WebP => {
            exif::read(local_path)
        }
        ContainerKind::Mp4 | ContainerKind::QuickTime => quicktime::read(local_path, container),
        ContainerKind::Heif | ContainerKind::Xmp => Err(InjectionError::UnsupportedContainer {
            container,
            path: local_path.to_path_buf(),
        }),
        ContainerKind::Unknown => Err(InjectionError::UnknownContainer {
            path: local_path.to_path_buf(),
        }),
    }
}

fn detect(local_path: &Path) -> Result<ContainerKind, InjectionError> {
    let container = sniff::sniff_path(local_path)?;
    if container != ContainerKind::Unknown && !sniff::extension_matches(local_path, container) {
        tracing::info!(
            path = %local_path.display(),
            container = %container,
            "File extension does not match content, using sniffed container"
        );
    }
    Ok(container)
}

/// [`inject`] on the blocking pool.
pub async fn inject_async(
    local_path: &Path,
    metadata: &CaptureMetadata,
) -> Result<(), InjectionError> {
    let path = local_path.to_path_buf();
    let metadata = metadata.clone();
    tokio::task::spawn_blocking(move || inject(&path, &metadata))
        .await
        .map_err(|e| InjectionError::Io(std::io::Error::other(e)))?
}
