use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

static PAIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([-+]?\d{1,3}\.\d+)\s*,\s*([-+]?\d{1,3}\.\d+)").unwrap());
static LABELLED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Latitude[:\s]*([-+]?\d{1,3}\.\d+).*?Longitude[:\s]*([-+]?\d{1,3}\.\d+)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Image,
    Video,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "Image",
            MediaType::Video => "Video",
            MediaType::Other => "Other",
        }
    }

    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "image" => MediaType::Image,
            "video" => MediaType::Video,
            _ => MediaType::Other,
        }
    }
}

fn media_type_from_label<'de, D: Deserializer<'de>>(d: D) -> Result<MediaType, D::Error> {
    let label = String::deserialize(d)?;
    Ok(MediaType::from_label(&label))
}

/// One memory entry from the export, with its filename stem already assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawRecord")]
pub struct Record {
    pub date: String,
    pub media_type: MediaType,
    pub location: String,
    pub download_url: Option<String>,
    pub prefix: String,
}

/// Wire shape of a record. Exports carry the URL under two keys, often both at once.
#[derive(Deserialize)]
struct RawRecord {
    #[serde(alias = "Date", default)]
    date: String,
    #[serde(alias = "Media Type", deserialize_with = "media_type_from_label")]
    media_type: MediaType,
    #[serde(alias = "Location", default)]
    location: String,
    #[serde(alias = "Media Download Url", default)]
    download_url: Option<String>,
    #[serde(rename = "Download Link", default)]
    download_link: Option<String>,
    #[serde(alias = "_prefix")]
    prefix: String,
}

impl From<RawRecord> for Record {
    fn from(raw: RawRecord) -> Self {
        let download_url = raw
            .download_url
            .filter(|u| !u.is_empty())
            .or(raw.download_link.filter(|u| !u.is_empty()));
        Record {
            date: raw.date,
            media_type: raw.media_type,
            location: raw.location,
            download_url,
            prefix: raw.prefix,
        }
    }
}

impl Record {
    /// Provenance block embedded into, or attached alongside, every file this record produces.
    pub fn metadata(&self) -> RecordMetadata {
        let (latitude, longitude) = match parse_location(&self.location) {
            Some((lat, lon)) => (Some(lat), Some(lon)),
            None => (None, None),
        };
        RecordMetadata {
            date: self.date.clone(),
            media_type: self.media_type.as_str().to_string(),
            location: self.location.clone(),
            latitude,
            longitude,
            source: self.download_url.clone(),
        }
    }

    pub fn parsed_date(&self) -> Option<NaiveDateTime> {
        parse_record_date(&self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Media Type")]
    pub media_type: String,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Latitude")]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitude")]
    pub longitude: Option<f64>,
    #[serde(rename = "Source")]
    pub source: Option<String>,
}

impl RecordMetadata {
    /// Key/value attributes for object stores, absent values omitted.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut attrs = Vec::with_capacity(6);
        if !self.date.is_empty() {
            attrs.push(("Date", self.date.clone()));
        }
        attrs.push(("MediaType", self.media_type.clone()));
        if !self.location.is_empty() {
            attrs.push(("Location", self.location.clone()));
        }
        if let Some(lat) = self.latitude {
            attrs.push(("Latitude", lat.to_string()));
        }
        if let Some(lon) = self.longitude {
            attrs.push(("Longitude", lon.to_string()));
        }
        if let Some(src) = &self.source {
            attrs.push(("Source", src.clone()));
        }
        attrs
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// Pull a decimal "lat, lon" pair out of free-form location text.
pub fn parse_location(location: &str) -> Option<(f64, f64)> {
    if location.is_empty() {
        return None;
    }
    let caps = PAIR_RE
        .captures(location)
        .or_else(|| LABELLED_RE.captures(location))?;
    let lat = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let lon = caps.get(2)?.as_str().parse::<f64>().ok()?;
    Some((lat, lon))
}

/// Parse the export's date text. Returns None for anything unrecognised.
pub fn parse_record_date(s: &str) -> Option<NaiveDateTime> {
    let trimmed = s.trim();
    let cleaned = trimmed.strip_suffix(" UTC").unwrap_or(trimmed).trim();
    if cleaned.is_empty() {
        return None;
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(dt);
        }
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = chrono::NaiveDate::parse_from_str(cleaned, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    chrono::DateTime::parse_from_rfc3339(cleaned)
        .ok()
        .map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location_pair() {
        assert_eq!(
            parse_location("Latitude, Longitude: 43.639523, -79.63285"),
            Some((43.639523, -79.63285))
        );
        assert_eq!(parse_location("12.5,-3.25"), Some((12.5, -3.25)));
        assert_eq!(parse_location(""), None);
        assert_eq!(parse_location("Toronto"), None);
    }

    #[test]
    fn test_parse_location_labelled() {
        assert_eq!(
            parse_location("Latitude: 51.5074 and Longitude: -0.1278"),
            Some((51.5074, -0.1278))
        );
    }

    #[test]
    fn test_parse_record_date() {
        let dt = parse_record_date("2023-07-04 18:30:12 UTC").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2023-07-04 18:30:12");
        assert!(parse_record_date("2021/01/02").is_some());
        assert!(parse_record_date("2021-01-02 10:11").is_some());
        assert!(parse_record_date("yesterday").is_none());
        assert!(parse_record_date("").is_none());
    }

    #[test]
    fn test_record_accepts_export_keys() {
        let json = r#"{
            "Date": "2022-01-01 00:00:00 UTC",
            "Media Type": "Video",
            "Location": "Latitude, Longitude: 1.5, 2.5",
            "Media Download Url": "https://example.com/a",
            "_prefix": "2022-01-01_00-00-00"
        }"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.media_type, MediaType::Video);
        assert_eq!(record.download_url.as_deref(), Some("https://example.com/a"));
        assert_eq!(record.prefix, "2022-01-01_00-00-00");

        let meta = record.metadata();
        assert_eq!(meta.coordinates(), Some((1.5, 2.5)));
        assert_eq!(meta.media_type, "Video");
    }

    #[test]
    fn test_record_with_both_url_keys() {
        let json = r#"{
            "Date": "2022-01-01 00:00:00 UTC",
            "Media Type": "Image",
            "Location": "",
            "Media Download Url": "https://example.com/media",
            "Download Link": "https://example.com/link",
            "_prefix": "p"
        }"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.download_url.as_deref(), Some("https://example.com/media"));

        let json = r#"{"Media Type": "Image", "Media Download Url": "", "Download Link": "https://example.com/link", "_prefix": "p"}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.download_url.as_deref(), Some("https://example.com/link"));
    }

    #[test]
    fn test_record_reads_back_its_own_serialization() {
        let json = r#"{"Media Type": "Video", "Download Link": "https://example.com/v", "_prefix": "p"}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        let again: Record = serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(again.media_type, MediaType::Video);
        assert_eq!(again.download_url.as_deref(), Some("https://example.com/v"));
    }

    #[test]
    fn test_unknown_media_type_is_other() {
        let json = r#"{"date":"","media_type":"Sticker","location":"","prefix":"p"}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.media_type, MediaType::Other);
        assert!(record.download_url.is_none());
    }

    #[test]
    fn test_attributes_omit_missing_values() {
        let meta = RecordMetadata {
            date: "2020-01-01".into(),
            media_type: "Image".into(),
            location: String::new(),
            latitude: None,
            longitude: None,
            source: Some("https://example.com/x".into()),
        };
        let keys: Vec<_> = meta.attributes().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Date", "MediaType", "Source"]);
    }
}
