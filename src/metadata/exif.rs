//! EXIF rewriting for still-image containers (JPEG, PNG, WebP).
//!
//! Writes go through `little_exif`, which replaces only the EXIF block and
//! adds one when the file has none. Read-back uses `kamadak-exif`, a separate
//! parser, so verification does not share the writer's assumptions. TIFF is
//! read but not rewritten: the writer has no TIFF support.

use std::io::BufReader;
use std::path::Path;

use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;

use super::{CaptureMetadata, ContainerKind, FieldValues, InjectionError, MetadataField};

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// `little_exif` always links an Interop IFD from the Exif IFD but only
/// emits it when it holds a tag. Without one the link dangles and strict
/// readers reject the whole block.
const INTEROP_INDEX: &str = "R98";

fn file_type(path: &Path, container: ContainerKind) -> Result<FileExtension, InjectionError> {
    match container {
        ContainerKind::Jpeg => Ok(FileExtension::JPEG),
        ContainerKind::Png => Ok(FileExtension::PNG {
            as_zTXt_chunk: false,
        }),
        ContainerKind::WebP => Ok(FileExtension::WEBP),
        other => Err(InjectionError::UnsupportedContainer {
            container: other,
            path: path.to_path_buf(),
        }),
    }
}

/// Values as they will read back: EXIF timestamps carry no zone, so the
/// source's local wall-clock time is what gets stored.
pub(super) fn expected_values(metadata: &CaptureMetadata) -> FieldValues {
    let mut values = FieldValues::new();
    let stamp = |dt: &chrono::DateTime<chrono::FixedOffset>| {
        dt.naive_local().format(EXIF_DATETIME_FORMAT).to_string()
    };
    if let Some(dt) = &metadata.date_time_original {
        values.insert(MetadataField::DateTimeOriginal, stamp(dt));
    }
    if let Some(dt) = &metadata.create_date {
        values.insert(MetadataField::CreateDate, stamp(dt));
    }
    if let Some(dt) = &metadata.modify_date {
        values.insert(MetadataField::ModifyDate, stamp(dt));
    }
    if let Some(make) = &metadata.make {
        values.insert(MetadataField::Make, make.clone());
    }
    if let Some(model) = &metadata.model {
        values.insert(MetadataField::Model, model.clone());
    }
    if let Some(description) = &metadata.description {
        values.insert(MetadataField::Description, description.clone());
    }
    values
}

/// Rewrite the EXIF block. The new content is written to a sibling file and
/// renamed over the original so a crash never leaves a half-written image.
pub(super) fn write(
    path: &Path,
    container: ContainerKind,
    metadata: &CaptureMetadata,
) -> Result<(), InjectionError> {
    let mut buffer = std::fs::read(path)?;

    // little_exif prints to stderr when it finds no block, so only hand it
    // files the reader already found EXIF in.
    let mut exif = if has_exif(&buffer) {
        Metadata::new_from_vec(&buffer, file_type(path, container)?).map_err(|e| InjectionError::Malformed {
            container,
            message: e.to_string(),
        })?
    } else {
        tracing::debug!(path = %path.display(), "No EXIF block, starting a new one");
        Metadata::new()
    };

    for (field, value) in expected_values(metadata) {
        let tag = match field {
            MetadataField::DateTimeOriginal => ExifTag::DateTimeOriginal(value),
            MetadataField::CreateDate => ExifTag::CreateDate(value),
            MetadataField::ModifyDate => ExifTag::ModifyDate(value),
            MetadataField::Make => ExifTag::Make(value),
            MetadataField::Model => ExifTag::Model(value),
            MetadataField::Description => ExifTag::ImageDescription(value),
        };
        exif.set_tag(tag);
    }
    exif.set_tag(ExifTag::InteroperabilityIndex(INTEROP_INDEX.to_string()));

    exif.write_to_vec(&mut buffer, file_type(path, container)?)
        .map_err(|e| InjectionError::Malformed {
            container,
            message: e.to_string(),
        })?;

    let staging = path.with_extension("exif-tmp");
    std::fs::write(&staging, &buffer)?;
    if let Err(e) = std::fs::rename(&staging, path) {
        let _ = std::fs::remove_file(&staging);
        return Err(e.into());
    }
    Ok(())
}

fn has_exif(buffer: &[u8]) -> bool {
    ::exif::Reader::new()
        .read_from_container(&mut std::io::Cursor::new(buffer))
        .is_ok()
}

/// Read the managed EXIF fields. A file without EXIF yields an empty map.
pub(super) fn read(path: &Path) -> Result<FieldValues, InjectionError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let parsed = match ::exif::Reader::new().read_from_container(&mut reader) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(path = %path.display(), "No EXIF data: {}", e);
            return Ok(FieldValues::new());
        }
    };
    Ok(collect_fields(&parsed))
}

fn collect_fields(parsed: &::exif::Exif) -> FieldValues {
    const TAGS: &[(MetadataField, ::exif::Tag)] = &[
        (MetadataField::DateTimeOriginal, ::exif::Tag::DateTimeOriginal),
        (MetadataField::CreateDate, ::exif::Tag::DateTimeDigitized),
        (MetadataField::ModifyDate, ::exif::Tag::DateTime),
        (MetadataField::Make, ::exif::Tag::Make),
        (MetadataField::Model, ::exif::Tag::Model),
        (MetadataField::Description, ::exif::Tag::ImageDescription),
    ];

    let mut values = FieldValues::new();
    for (field, tag) in TAGS {
        let Some(entry) = parsed.get_field(*tag, ::exif::In::PRIMARY) else {
            continue;
        };
        if let ::exif::Value::Ascii(ref parts) = entry.value {
            if let Some(first) = parts.first() {
                let text = String::from_utf8_lossy(first)
                    .trim_end_matches('\0')
                    .trim_end()
                    .to_string();
                values.insert(*field, text);
            }
        }
    }
    values
}
