use std::io::Cursor;

use chrono::NaiveDateTime;
use exif::experimental::Writer;
use exif::{Context, Field, In, Rational, Reader, Tag, Value};

use super::EmbedError;

const EXIF_HEADER: &[u8] = b"Exif\0\0";
const MAX_SEGMENT: usize = 0xFFFF - 2;

const SYNTHESIZED_TAGS: &[Tag] = &[
    Tag::ExifIFDPointer,
    Tag::GPSInfoIFDPointer,
    Tag::InteropIFDPointer,
    Tag::JPEGInterchangeFormat,
    Tag::JPEGInterchangeFormatLength,
    Tag::StripOffsets,
    Tag::StripByteCounts,
    Tag::TileOffsets,
    Tag::TileByteCounts,
];

/// Decimal degrees to (deg/1, min/1, sec/100) with the hemisphere sign split out.
pub fn to_dms(value: f64) -> ([Rational; 3], bool) {
    let negative = value < 0.0;
    let v = value.abs();
    let mut deg = v.trunc() as u32;
    let minutes = (v - v.trunc()) * 60.0;
    let mut min = minutes.trunc() as u32;
    let mut hundredths = ((minutes - minutes.trunc()) * 60.0 * 100.0).round() as u32;
    if hundredths >= 6000 {
        hundredths -= 6000;
        min += 1;
    }
    if min >= 60 {
        min -= 60;
        deg += 1;
    }
    let r = |num, denom| Rational { num, denom };
    ([r(deg, 1), r(min, 1), r(hundredths, 100)], negative)
}

fn ascii(s: &str) -> Value {
    Value::Ascii(vec![s.as_bytes().to_vec()])
}

fn field(tag: Tag, value: Value) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    }
}

fn gps_fields(lat: f64, lon: f64) -> Vec<Field> {
    let (lat_dms, lat_neg) = to_dms(lat);
    let (lon_dms, lon_neg) = to_dms(lon);
    vec![
        field(Tag::GPSVersionID, Value::Byte(vec![2, 3, 0, 0])),
        field(Tag::GPSLatitudeRef, ascii(if lat_neg { "S" } else { "N" })),
        field(Tag::GPSLatitude, Value::Rational(lat_dms.to_vec())),
        field(Tag::GPSLongitudeRef, ascii(if lon_neg { "W" } else { "E" })),
        field(Tag::GPSLongitude, Value::Rational(lon_dms.to_vec())),
    ]
}

/// Primary-IFD fields worth carrying over; an unreadable block yields none.
fn existing_fields(jpeg: &[u8]) -> Vec<Field> {
    let Ok(exif) = Reader::new().read_from_container(&mut Cursor::new(jpeg)) else {
        return Vec::new();
    };
    let mut kept: Vec<Field> = Vec::new();
    for f in exif.fields() {
        if f.ifd_num != In::PRIMARY
            || f.tag.context() == Context::Gps
            || SYNTHESIZED_TAGS.contains(&f.tag)
            || matches!(f.value, Value::Unknown(..))
        {
            continue;
        }
        if kept.iter().any(|k| k.tag == f.tag) {
            continue;
        }
        kept.push(f.clone());
    }
    kept
}

/// Merge GPS (and a capture date when missing) into the JPEG's EXIF block.
pub fn embed_jpeg(
    jpeg: &[u8],
    coordinates: Option<(f64, f64)>,
    taken: Option<NaiveDateTime>,
) -> Result<Vec<u8>, EmbedError> {
    if coordinates.is_none() && taken.is_none() {
        return Err(EmbedError::NothingToWrite);
    }

    let mut fields = existing_fields(jpeg);
    if let Some((lat, lon)) = coordinates {
        fields.extend(gps_fields(lat, lon));
    }
    if let Some(dt) = taken {
        if !fields.iter().any(|f| f.tag == Tag::DateTimeOriginal) {
            fields.push(field(
                Tag::DateTimeOriginal,
                ascii(&dt.format("%Y:%m:%d %H:%M:%S").to_string()),
            ));
        }
    }

    let mut writer = Writer::new();
    for f in &fields {
        writer.push_field(f);
    }
    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, false)?;

    replace_exif_segment(jpeg, &tiff.into_inner())
}

/// Rebuild the JPEG header with a single Exif APP1 right after SOI/APP0.
fn replace_exif_segment(jpeg: &[u8], tiff: &[u8]) -> Result<Vec<u8>, EmbedError> {
    if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return Err(EmbedError::Container("not a JPEG stream".into()));
    }
    let payload_len = EXIF_HEADER.len() + tiff.len();
    if payload_len > MAX_SEGMENT {
        return Err(EmbedError::Container("EXIF block exceeds one APP1 segment".into()));
    }

    let mut leading_app0 = Vec::new();
    let mut others = Vec::new();
    let mut pos = 2;
    let mut seen_other = false;

    let rest_start = loop {
        if pos + 4 > jpeg.len() || jpeg[pos] != 0xFF {
            return Err(EmbedError::Container("corrupt JPEG marker".into()));
        }
        let marker = jpeg[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        if marker == 0xDA || marker == 0xD9 {
            break pos;
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        let end = pos + 2 + len;
        if len < 2 || end > jpeg.len() {
            return Err(EmbedError::Container("JPEG segment out of bounds".into()));
        }
        let segment = &jpeg[pos..end];
        let is_exif = marker == 0xE1 && segment[4..].starts_with(EXIF_HEADER);
        if marker == 0xE0 && !seen_other {
            leading_app0.push(segment);
        } else if !is_exif {
            seen_other = true;
            others.push(segment);
        }
        pos = end;
    };

    let mut out = Vec::with_capacity(jpeg.len() + payload_len + 4);
    out.extend_from_slice(&[0xFF, 0xD8]);
    for seg in leading_app0 {
        out.extend_from_slice(seg);
    }
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&((payload_len + 2) as u16).to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(tiff);
    for seg in others {
        out.extend_from_slice(seg);
    }
    out.extend_from_slice(&jpeg[rest_start..]);
    Ok(out)
}
