use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};

use crate::error::ItemError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const BROWSER_AGENT: &str = "Mozilla/5.0";

/// Raw downloaded bytes plus the server's content type, used only as a hint.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Source of record payloads.
pub trait Fetcher {
    fn fetch(&self, url: &str) -> Result<Payload, ItemError>;
}

/// Blocking HTTP(S) GET with a fixed timeout.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ItemError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Payload, ItemError> {
        let resp = self.client.get(url).header(USER_AGENT, BROWSER_AGENT).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ItemError::HttpStatus(status.as_u16()));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = resp.bytes()?.to_vec();
        Ok(Payload { bytes, content_type })
    }
}

/// Extension for a plain download: URL path suffix, then content type, then `.bin`.
pub fn plain_extension(url: &str, content_type: Option<&str>) -> String {
    url_extension(url)
        .or_else(|| content_type.and_then(extension_for_content_type))
        .unwrap_or_else(|| ".bin".to_string())
        .to_ascii_lowercase()
}

fn url_extension(url: &str) -> Option<String> {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    let last = path.rsplit('/').next()?;
    let dot = last.rfind('.')?;
    if dot == 0 || dot + 1 == last.len() {
        return None;
    }
    Some(last[dot..].to_string())
}

pub fn extension_for_content_type(content_type: &str) -> Option<String> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let known = match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "video/mp4" => Some(".mp4"),
        "application/zip" => Some(".zip"),
        _ => None,
    };
    if let Some(ext) = known {
        return Some(ext.to_string());
    }
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
}
