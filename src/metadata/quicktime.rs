//! Timestamp rewriting for QuickTime / MP4 movies.
//!
//! Capture time lives in the `mvhd`, `tkhd` and `mdhd` box headers as seconds
//! since 1904-01-01 UTC. Those fields are overwritten in place; sample data is
//! never touched, so multi-gigabyte files cost a handful of small writes.
//!
//! Version-0 headers hold 32-bit values and cannot represent dates past
//! 2040-02-06. Make, model and description are reported but not written.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, FixedOffset, Utc};

use super::{CaptureMetadata, ContainerKind, FieldValues, InjectionError, MetadataField};

/// Seconds between 1904-01-01 and 1970-01-01.
const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

const DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Longest udta text payload read back.
const MAX_TEXT_LEN: u64 = 4096;

const TAG_MAKE: [u8; 4] = [0xA9, b'm', b'a', b'k'];
const TAG_MODEL: [u8; 4] = [0xA9, b'm', b'o', b'd'];
const TAG_DESCRIPTION: [u8; 4] = [0xA9, b'd', b'e', b's'];

#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    kind: [u8; 4],
    start: u64,
    header_len: u64,
    end: u64,
}

impl BoxHeader {
    fn payload_start(&self) -> u64 {
        self.start + self.header_len
    }
}

/// Position of a full-box version byte followed by creation/modification times.
#[derive(Debug, Clone, Copy)]
struct TimestampSlot {
    kind: [u8; 4],
    offset: u64,
}

fn malformed(container: ContainerKind, message: impl Into<String>) -> InjectionError {
    InjectionError::Malformed {
        container,
        message: message.into(),
    }
}

fn read_header<R: Read + Seek>(
    r: &mut R,
    pos: u64,
    limit: u64,
    container: ContainerKind,
) -> Result<BoxHeader, InjectionError> {
    r.seek(SeekFrom::Start(pos))?;
    let mut head = [0u8; 8];
    r.read_exact(&mut head)?;
    let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as u64;
    let kind = [head[4], head[5], head[6], head[7]];

    let (size, header_len) = match size32 {
        0 => (limit - pos, 8),
        1 => {
            let mut large = [0u8; 8];
            r.read_exact(&mut large)?;
            (u64::from_be_bytes(large), 16)
        }
        n => (n, 8),
    };

    let end = pos
        .checked_add(size)
        .ok_or_else(|| malformed(container, "box size overflow"))?;
    if size < header_len || end > limit {
        return Err(malformed(
            container,
            format!(
                "box '{}' at offset {} overruns its parent",
                String::from_utf8_lossy(&kind),
                pos
            ),
        ));
    }
    Ok(BoxHeader {
        kind,
        start: pos,
        header_len,
        end,
    })
}

fn children<R: Read + Seek>(
    r: &mut R,
    start: u64,
    end: u64,
    container: ContainerKind,
) -> Result<Vec<BoxHeader>, InjectionError> {
    let mut out = Vec::new();
    let mut pos = start;
    while end.saturating_sub(pos) >= 8 {
        let header = read_header(r, pos, end, container)?;
        pos = header.end;
        out.push(header);
    }
    Ok(out)
}

fn find(boxes: &[BoxHeader], kind: &[u8; 4]) -> Option<BoxHeader> {
    boxes.iter().find(|b| &b.kind == kind).copied()
}

/// Locate `moov` and every header carrying creation/modification times.
fn locate<R: Read + Seek>(
    r: &mut R,
    container: ContainerKind,
) -> Result<(BoxHeader, Vec<TimestampSlot>), InjectionError> {
    let file_len = r.seek(SeekFrom::End(0))?;
    let top = children(r, 0, file_len, container)?;
    let moov = find(&top, b"moov").ok_or_else(|| malformed(container, "no moov box"))?;
    let in_moov = children(r, moov.payload_start(), moov.end, container)?;
    let mvhd = find(&in_moov, b"mvhd").ok_or_else(|| malformed(container, "no mvhd box"))?;

    let mut slots = vec![TimestampSlot {
        kind: mvhd.kind,
        offset: mvhd.payload_start(),
    }];
    for trak in in_moov.iter().filter(|b| &b.kind == b"trak") {
        let in_trak = children(r, trak.payload_start(), trak.end, container)?;
        if let Some(tkhd) = find(&in_trak, b"tkhd") {
            slots.push(TimestampSlot {
                kind: tkhd.kind,
                offset: tkhd.payload_start(),
            });
        }
        if let Some(mdia) = find(&in_trak, b"mdia") {
            let in_mdia = children(r, mdia.payload_start(), mdia.end, container)?;
            if let Some(mdhd) = find(&in_mdia, b"mdhd") {
                slots.push(TimestampSlot {
                    kind: mdhd.kind,
                    offset: mdhd.payload_start(),
                });
            }
        }
    }
    Ok((moov, slots))
}

/// Read `(version, creation, modification)` from a slot.
fn read_slot<R: Read + Seek>(
    r: &mut R,
    slot: &TimestampSlot,
    container: ContainerKind,
) -> Result<(u8, u64, u64), InjectionError> {
    r.seek(SeekFrom::Start(slot.offset))?;
    let mut version_flags = [0u8; 4];
    r.read_exact(&mut version_flags)?;
    match version_flags[0] {
        0 => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)?;
            let creation = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
            let modification = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as u64;
            Ok((0, creation, modification))
        }
        1 => {
            let mut buf = [0u8; 16];
            r.read_exact(&mut buf)?;
            let mut c = [0u8; 8];
            let mut m = [0u8; 8];
            c.copy_from_slice(&buf[..8]);
            m.copy_from_slice(&buf[8..]);
            Ok((1, u64::from_be_bytes(c), u64::from_be_bytes(m)))
        }
        v => Err(malformed(
            container,
            format!(
                "unsupported {} version {}",
                String::from_utf8_lossy(&slot.kind),
                v
            ),
        )),
    }
}

fn to_mac_seconds(dt: &DateTime<FixedOffset>) -> i64 {
    dt.timestamp() + MAC_EPOCH_OFFSET
}

fn from_mac_seconds(secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    DateTime::<Utc>::from_timestamp(secs - MAC_EPOCH_OFFSET, 0)
}

fn stamp(dt: &DateTime<FixedOffset>) -> String {
    dt.with_timezone(&Utc).format(DATETIME_FORMAT).to_string()
}

fn creation_of(metadata: &CaptureMetadata) -> Option<DateTime<FixedOffset>> {
    metadata.date_time_original.or(metadata.create_date)
}

/// Values as they will read back. Both original and create date share the
/// single creation slot and are stored in UTC.
pub(super) fn expected_values(metadata: &CaptureMetadata) -> FieldValues {
    let mut values = FieldValues::new();
    if let Some(creation) = creation_of(metadata) {
        let text = stamp(&creation);
        if metadata.date_time_original.is_some() {
            values.insert(MetadataField::DateTimeOriginal, text.clone());
        }
        if metadata.create_date.is_some() {
            values.insert(MetadataField::CreateDate, text);
        }
    }
    if let Some(modified) = &metadata.modify_date {
        values.insert(MetadataField::ModifyDate, stamp(modified));
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

fn encode(version: u8, secs: i64) -> Option<Vec<u8>> {
    match version {
        0 => u32::try_from(secs).ok().map(|v| v.to_be_bytes().to_vec()),
        _ => u64::try_from(secs).ok().map(|v| v.to_be_bytes().to_vec()),
    }
}

/// Overwrite creation/modification times in every movie, track and media
/// header. Values that do not fit a header's width are left untouched.
pub(super) fn write(
    path: &Path,
    container: ContainerKind,
    metadata: &CaptureMetadata,
) -> Result<(), InjectionError> {
    let creation = creation_of(metadata);
    let modification = metadata.modify_date.or(creation);
    if creation.is_none() && modification.is_none() {
        return Ok(());
    }

    let mut file = File::options().read(true).write(true).open(path)?;
    let (_, slots) = locate(&mut file, container)?;

    for slot in &slots {
        let (version, _, _) = read_slot(&mut file, slot, container)?;
        let width: u64 = if version == 0 { 4 } else { 8 };
        let fields = [(0u64, creation), (width, modification)];
        for (rel, value) in fields {
            let Some(dt) = value else { continue };
            let Some(bytes) = encode(version, to_mac_seconds(&dt)) else {
                tracing::debug!(
                    path = %path.display(),
                    header = %String::from_utf8_lossy(&slot.kind),
                    version,
                    date = %dt,
                    "Date not representable in header, leaving as is"
                );
                continue;
            };
            file.seek(SeekFrom::Start(slot.offset + 4 + rel))?;
            file.write_all(&bytes)?;
        }
    }
    file.sync_all()?;
    Ok(())
}

fn read_text<R: Read + Seek>(
    r: &mut R,
    item: &BoxHeader,
    container: ContainerKind,
) -> Result<Option<String>, InjectionError> {
    let len = (item.end - item.payload_start()).min(MAX_TEXT_LEN);
    let mut payload = vec![0u8; len as usize];
    r.seek(SeekFrom::Start(item.payload_start()))?;
    r.read_exact(&mut payload)?;

    // iTunes style: a nested `data` box with 8 bytes of type and locale.
    if payload.len() >= 16 && &payload[4..8] == b"data" {
        let inner = children(r, item.payload_start(), item.end, container)?;
        if let Some(data) = find(&inner, b"data") {
            let text_start = (data.payload_start() + 8 - item.payload_start()) as usize;
            let text_end = ((data.end - item.payload_start()) as usize).min(payload.len());
            if text_start <= text_end {
                return Ok(Some(
                    String::from_utf8_lossy(&payload[text_start..text_end]).into_owned(),
                ));
            }
        }
        return Ok(None);
    }

    // QuickTime style: u16 length, u16 language, then the text.
    if payload.len() < 4 {
        return Ok(None);
    }
    let text_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let text_end = (4 + text_len).min(payload.len());
    Ok(Some(
        String::from_utf8_lossy(&payload[4..text_end]).into_owned(),
    ))
}

/// Read the managed fields from the movie header and `moov/udta`.
pub(super) fn read(path: &Path, container: ContainerKind) -> Result<FieldValues, InjectionError> {
    let mut file = File::open(path)?;
    let (moov, slots) = locate(&mut file, container)?;
    let mut values = FieldValues::new();

    if let Some(mvhd) = slots.first() {
        let (_, creation, modification) = read_slot(&mut file, mvhd, container)?;
        if creation != 0 {
            if let Some(dt) = from_mac_seconds(creation) {
                let text = dt.format(DATETIME_FORMAT).to_string();
                values.insert(MetadataField::DateTimeOriginal, text.clone());
                values.insert(MetadataField::CreateDate, text);
            }
        }
        if modification != 0 {
            if let Some(dt) = from_mac_seconds(modification) {
                values.insert(
                    MetadataField::ModifyDate,
                    dt.format(DATETIME_FORMAT).to_string(),
                );
            }
        }
    }

    let in_moov = children(&mut file, moov.payload_start(), moov.end, container)?;
    if let Some(udta) = find(&in_moov, b"udta") {
        let items = children(&mut file, udta.payload_start(), udta.end, container)?;
        let tags = [
            (TAG_MAKE, MetadataField::Make),
            (TAG_MODEL, MetadataField::Model),
            (TAG_DESCRIPTION, MetadataField::Description),
        ];
        for (tag, field) in tags {
            if let Some(item) = find(&items, &tag) {
                if let Some(text) = read_text(&mut file, &item, container)? {
                    values.insert(field, text);
                }
            }
        }
    }
    Ok(values)
}
