//! Google Drive v3 object store over a pre-issued OAuth bearer token.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::remote::{ObjectStore, StorageQuota, StoredObject};
use crate::error::DestinationError;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const OBJECT_FIELDS: &str = "id,name,webViewLink";
const PAGE_SIZE: &str = "1000";
/// Drive limits each appProperties entry to 124 bytes of key plus value
const MAX_PROPERTY_BYTES: usize = 124;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    web_view_link: Option<String>,
}

impl From<FileResource> for StoredObject {
    fn from(f: FileResource) -> Self {
        StoredObject {
            id: f.id,
            name: f.name,
            link: f.web_view_link,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<FileResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    storage_quota: QuotaFields,
}

/// Drive reports quota numbers as decimal strings; `limit` is absent for unlimited accounts.
#[derive(Debug, Deserialize)]
struct QuotaFields {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    usage: Option<String>,
}

/// One authorised session against a single Drive folder.
pub struct DriveStore {
    client: Client,
    token: String,
    api_base: String,
    upload_url: String,
    folder_id: String,
    folder_name: String,
}

impl DriveStore {
    /// Open a session. With `folder_id` the folder is verified to be reachable; without
    /// one a new folder called `folder_name` is created at the drive root.
    pub fn connect(
        token: &str,
        folder_id: Option<&str>,
        folder_name: &str,
        timeout: Duration,
    ) -> Result<Self, DestinationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Self::connect_at(client, API_BASE, UPLOAD_URL, token, folder_id, folder_name)
    }

    fn connect_at(
        client: Client,
        api_base: &str,
        upload_url: &str,
        token: &str,
        folder_id: Option<&str>,
        folder_name: &str,
    ) -> Result<Self, DestinationError> {
        let mut store = Self {
            client,
            token: token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_url: upload_url.to_string(),
            folder_id: String::new(),
            folder_name: folder_name.to_string(),
        };

        match folder_id {
            Some(id) => {
                let resp = store
                    .authed(store.client.get(format!("{}/files/{}", store.api_base, id)))
                    .query(&[("fields", "id,name"), ("supportsAllDrives", "true")])
                    .send()?;
                let folder: FileResource = checked(resp)?.json()?;
                debug!(folder = %folder.name, id = %folder.id, "drive folder verified");
                store.folder_id = folder.id;
                if !folder.name.is_empty() {
                    store.folder_name = folder.name;
                }
            }
            None => {
                let body = json!({ "name": folder_name, "mimeType": FOLDER_MIME });
                let resp = store
                    .authed(store.client.post(format!("{}/files", store.api_base)))
                    .query(&[("fields", "id,name")])
                    .json(&body)
                    .send()?;
                let folder: FileResource = checked(resp)?.json()?;
                info!(folder = %folder_name, id = %folder.id, "created drive folder");
                store.folder_id = folder.id;
            }
        }
        Ok(store)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }
}

/// Turn a non-success response into a status error carrying the body text.
fn checked(resp: Response) -> Result<Response, DestinationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().unwrap_or_default();
    Err(DestinationError::Status {
        status: status.as_u16(),
        message,
    })
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Cut `value` so that key and value together fit Drive's per-property limit.
fn fit_property(key: &str, value: &str) -> String {
    let budget = MAX_PROPERTY_BYTES.saturating_sub(key.len());
    if value.len() <= budget {
        return value.to_string();
    }
    let mut end = budget;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

fn app_properties(attributes: &[(&'static str, String)]) -> Map<String, Value> {
    attributes
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(fit_property(k, v))))
        .collect()
}

/// Build a `multipart/related` upload body: JSON metadata part, then the media part.
fn multipart_body(metadata: &Value, bytes: &[u8], mime_type: &str) -> (String, Vec<u8>) {
    let digest = hex::encode(Sha256::digest(bytes));
    let boundary = format!("memsync_{}", &digest[..32]);

    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (boundary, body)
}

fn parse_quota(fields: QuotaFields) -> Result<StorageQuota, DestinationError> {
    let usage_text = fields.usage.unwrap_or_else(|| "0".to_string());
    let usage = usage_text
        .parse::<u64>()
        .map_err(|_| DestinationError::Response(format!("unparseable quota usage {:?}", usage_text)))?;
    let limit = match fields.limit {
        Some(text) => Some(
            text.parse::<u64>()
                .map_err(|_| DestinationError::Response(format!("unparseable quota limit {:?}", text)))?,
        ),
        None => None,
    };
    Ok(StorageQuota { usage, limit })
}

impl ObjectStore for DriveStore {
    fn describe(&self) -> String {
        format!("drive:{} ({})", self.folder_name, self.folder_id)
    }

    fn list(&self) -> Result<Vec<StoredObject>, DestinationError> {
        let q = format!("'{}' in parents and trashed=false", escape_query(&self.folder_id));
        let fields = format!("nextPageToken, files({})", OBJECT_FIELDS.replace(',', ", "));
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", PAGE_SIZE),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let resp = self
                .authed(self.client.get(format!("{}/files", self.api_base)))
                .query(&params)
                .send()?;
            let page: FileList = checked(resp)?.json()?;
            objects.extend(page.files.into_iter().map(StoredObject::from));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        debug!(folder = %self.folder_id, count = objects.len(), "listed drive folder");
        Ok(objects)
    }

    fn create(
        &self,
        name: &str,
        bytes: &[u8],
        mime_type: &str,
        attributes: &[(&'static str, String)],
    ) -> Result<StoredObject, DestinationError> {
        let metadata = json!({
            "name": name,
            "parents": [self.folder_id],
            "appProperties": app_properties(attributes),
        });
        let (boundary, body) = multipart_body(&metadata, bytes, mime_type);

        let resp = self
            .authed(self.client.post(&self.upload_url))
            .query(&[
                ("uploadType", "multipart"),
                ("fields", OBJECT_FIELDS),
                ("supportsAllDrives", "true"),
            ])
            .header(CONTENT_TYPE, format!("multipart/related; boundary={}", boundary))
            .body(body)
            .send()?;
        let created: FileResource = checked(resp)?.json()?;
        Ok(created.into())
    }

    fn delete(&self, id: &str) -> Result<(), DestinationError> {
        let resp = self
            .authed(self.client.delete(format!("{}/files/{}", self.api_base, id)))
            .query(&[("supportsAllDrives", "true")])
            .send()?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(id, "drive object already gone");
            return Ok(());
        }
        checked(resp)?;
        Ok(())
    }

    fn quota(&self) -> Result<StorageQuota, DestinationError> {
        let resp = self
            .authed(self.client.get(format!("{}/about", self.api_base)))
            .query(&[("fields", "storageQuota")])
            .send()?;
        let about: About = checked(resp)?.json()?;
        parse_quota(about.storage_quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_property_truncates_on_char_boundary() {
        let short = fit_property("Date", "2020-01-01");
        assert_eq!(short, "2020-01-01");

        let long = "é".repeat(100);
        let fitted = fit_property("Location", &long);
        assert!("Location".len() + fitted.len() <= MAX_PROPERTY_BYTES);
        assert!(fitted.chars().all(|c| c == 'é'));
        assert_eq!(fitted.len(), 116);
    }

    #[test]
    fn test_multipart_body_layout() {
        let metadata = json!({ "name": "a.jpg" });
        let (boundary, body) = multipart_body(&metadata, b"\xff\xd8payload", "image/jpeg");
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with(&format!("--{}\r\n", boundary)));
        assert!(text.contains(r#"{"name":"a.jpg"}"#));
        assert!(text.contains("Content-Type: image/jpeg\r\n\r\n"));
        assert!(text.ends_with(&format!("\r\n--{}--\r\n", boundary)));
        assert_eq!(text.matches(&format!("--{}", boundary)).count(), 3);
    }

    #[test]
    fn test_parse_quota() {
        let about: About =
            serde_json::from_str(r#"{"storageQuota":{"limit":"16106127360","usage":"1024"}}"#).unwrap();
        assert_eq!(
            parse_quota(about.storage_quota).unwrap(),
            StorageQuota {
                usage: 1024,
                limit: Some(16106127360)
            }
        );

        let unlimited: About = serde_json::from_str(r#"{"storageQuota":{}}"#).unwrap();
        assert_eq!(
            parse_quota(unlimited.storage_quota).unwrap(),
            StorageQuota { usage: 0, limit: None }
        );

        let garbage: About = serde_json::from_str(r#"{"storageQuota":{"limit":"lots"}}"#).unwrap();
        assert!(parse_quota(garbage.storage_quota).is_err());
    }

    #[test]
    fn test_app_properties_keep_keys() {
        let props = app_properties(&[("Date", "2020".into()), ("Source", "x".repeat(300))]);
        assert_eq!(props["Date"], "2020");
        assert_eq!(props["Source"].as_str().unwrap().len(), MAX_PROPERTY_BYTES - "Source".len());
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("it's"), "it\\'s");
    }

    mod fake {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;
        use std::thread::{self, JoinHandle};

        /// Answers one connection per canned `(status, body)` in order and hands back the
        /// request lines it saw.
        pub struct FakeDrive {
            pub base: String,
            handle: JoinHandle<Vec<String>>,
        }

        impl FakeDrive {
            pub fn serve(responses: Vec<(u16, &'static str)>) -> Self {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                let base = format!("http://{}", listener.local_addr().unwrap());
                let handle = thread::spawn(move || {
                    let mut seen = Vec::with_capacity(responses.len());
                    for (status, body) in responses {
                        let (stream, _) = listener.accept().unwrap();
                        let mut reader = BufReader::new(stream);
                        let mut request_line = String::new();
                        reader.read_line(&mut request_line).unwrap();

                        let mut length = 0usize;
                        loop {
                            let mut line = String::new();
                            reader.read_line(&mut line).unwrap();
                            let line = line.trim_end();
                            if line.is_empty() {
                                break;
                            }
                            if let Some((key, value)) = line.split_once(':') {
                                if key.eq_ignore_ascii_case("content-length") {
                                    length = value.trim().parse().unwrap();
                                }
                            }
                        }
                        let mut request_body = vec![0u8; length];
                        reader.read_exact(&mut request_body).unwrap();
                        seen.push(request_line.trim_end().to_string());

                        let mut stream = reader.into_inner();
                        write!(
                            stream,
                            "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        )
                        .unwrap();
                        stream.flush().unwrap();
                    }
                    seen
                });
                Self { base, handle }
            }

            pub fn requests(self) -> Vec<String> {
                self.handle.join().unwrap()
            }
        }
    }

    use fake::FakeDrive;

    fn connect_fake(fake: &FakeDrive, folder_id: Option<&str>) -> DriveStore {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let upload = format!("{}/upload", fake.base);
        DriveStore::connect_at(client, &fake.base, &upload, "tok", folder_id, "Snapchat Memories").unwrap()
    }

    #[test]
    fn test_list_follows_page_tokens() {
        let fake = FakeDrive::serve(vec![
            (200, r#"{"id":"F1","name":"Memories"}"#),
            (
                200,
                r#"{"nextPageToken":"page2","files":[{"id":"1","name":"a.jpg"},{"id":"2","name":"b.mp4","webViewLink":"https://d/2"}]}"#,
            ),
            (200, r#"{"files":[{"id":"3","name":"a.jpg"}]}"#),
        ]);
        let store = connect_fake(&fake, Some("F1"));
        assert_eq!(store.describe(), "drive:Memories (F1)");

        let objects = store.list().unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.mp4", "a.jpg"]);
        assert_eq!(objects[1].link.as_deref(), Some("https://d/2"));

        let requests = fake.requests();
        assert!(requests[0].starts_with("GET /files/F1?"));
        assert!(requests[1].starts_with("GET /files?"));
        assert!(!requests[1].contains("pageToken="));
        assert!(requests[2].contains("pageToken=page2"));
    }

    #[test]
    fn test_connect_without_folder_creates_one() {
        let fake = FakeDrive::serve(vec![(200, r#"{"id":"NEW","name":"Snapchat Memories"}"#)]);
        let store = connect_fake(&fake, None);
        assert_eq!(store.describe(), "drive:Snapchat Memories (NEW)");
        assert!(fake.requests()[0].starts_with("POST /files?"));
    }

    #[test]
    fn test_delete_treats_missing_as_done() {
        let fake = FakeDrive::serve(vec![
            (200, r#"{"id":"F1","name":"Memories"}"#),
            (404, r#"{"error":{"code":404,"message":"File not found"}}"#),
            (500, r#"{"error":{"code":500,"message":"backend error"}}"#),
        ]);
        let store = connect_fake(&fake, Some("F1"));

        store.delete("gone").unwrap();
        match store.delete("broken") {
            Err(DestinationError::Status { status, .. }) => assert_eq!(status, 500),
            other => panic!("unexpected delete result {:?}", other),
        }

        let requests = fake.requests();
        assert!(requests[1].starts_with("DELETE /files/gone?"));
    }

    #[test]
    fn test_create_quota_rejection_is_status_error() {
        let fake = FakeDrive::serve(vec![
            (200, r#"{"id":"F1","name":"Memories"}"#),
            (
                403,
                r#"{"error":{"errors":[{"reason":"storageQuotaExceeded"}],"code":403,"message":"The user's Drive storage quota has been exceeded."}}"#,
            ),
            (200, r#"{"id":"9","name":"p.jpg","webViewLink":"https://d/9"}"#),
        ]);
        let store = connect_fake(&fake, Some("F1"));

        let err = store
            .create("p.jpg", b"\xff\xd8", "image/jpeg", &[("Date", "2020".into())])
            .unwrap_err();
        match &err {
            DestinationError::Status { status, message } => {
                assert_eq!(*status, 403);
                assert!(message.contains("storageQuotaExceeded"));
            }
            other => panic!("unexpected create error {:?}", other),
        }
        assert!(err.is_quota_exhausted());

        let created = store.create("p.jpg", b"\xff\xd8", "image/jpeg", &[]).unwrap();
        assert_eq!(created.id, "9");
        assert_eq!(created.link.as_deref(), Some("https://d/9"));

        let requests = fake.requests();
        assert!(requests[1].starts_with("POST /upload?uploadType=multipart"));
    }

    #[test]
    fn test_quota_reads_about() {
        let fake = FakeDrive::serve(vec![
            (200, r#"{"id":"F1","name":"Memories"}"#),
            (200, r#"{"storageQuota":{"limit":"2048","usage":"1024"}}"#),
        ]);
        let store = connect_fake(&fake, Some("F1"));
        assert_eq!(
            store.quota().unwrap(),
            StorageQuota {
                usage: 1024,
                limit: Some(2048)
            }
        );
        assert!(fake.requests()[1].starts_with("GET /about?"));
    }
}
