//! Google Drive API client.

use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use snapmatch_common::{Error, Result};

use crate::google::{check_response, http_client, TokenManager};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Files above this size use a resumable session instead of multipart.
const MULTIPART_LIMIT: usize = 5 * 1024 * 1024;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str =
    "id,name,mimeType,size,modifiedTime,parents,md5Checksum,webContentLink,webViewLink";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Only present for files; Drive encodes it as a decimal string.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub web_content_link: Option<String>,
    #[serde(default)]
    pub web_view_link: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn size_bytes(&self) -> u64 {
        self.size.as_ref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    /// Best available link for fetching the file.
    pub fn link(&self) -> Option<&str> {
        self.web_content_link
            .as_deref()
            .or(self.web_view_link.as_deref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Escape a value for use inside a single-quoted Drive query literal.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl DriveClient {
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            token_manager,
        })
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> Result<reqwest::Response> {
        let response = request
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{}: {}", context, e)))?;

        match check_response(response, context).await {
            Err(Error::Authentication(msg)) => {
                // Next call refreshes; the caller decides whether to retry.
                self.token_manager.invalidate().await;
                Err(Error::Authentication(msg))
            }
            other => other,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T> {
        self.send(request, context)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(format!("{}: failed to parse response: {}", context, e)))
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile> {
        let request = self
            .http
            .get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .query(&[("fields", FILE_FIELDS)]);
        self.send_json(request, "Get file").await
    }

    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let request = self
            .http
            .post(format!("{}/files", DRIVE_API_BASE))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata);
        self.send_json(request, "Create folder").await
    }

    /// List the direct children of a folder.
    pub async fn list_folder(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let list_fields = format!("files({}),nextPageToken", FILE_FIELDS);
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(format!("{}/files", DRIVE_API_BASE)).query(&[
                ("q", query.as_str()),
                ("fields", list_fields.as_str()),
                ("pageSize", "1000"),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileListResponse = self.send_json(request, "List folder").await?;
            all_files.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_files)
    }

    /// Find a child by exact name.
    pub async fn find_child(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent_id)
        );
        let list_fields = format!("files({})", FILE_FIELDS);

        let request = self.http.get(format!("{}/files", DRIVE_API_BASE)).query(&[
            ("q", query.as_str()),
            ("fields", list_fields.as_str()),
            ("pageSize", "1"),
        ]);

        let page: FileListResponse = self.send_json(request, "Find file").await?;
        Ok(page.files.into_iter().next())
    }

    /// Create a new file under `parent_id`.
    pub async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<DriveFile> {
        if data.len() > MULTIPART_LIMIT {
            return self.create_file_resumable(name, parent_id, data, content_type).await;
        }

        let metadata = serde_json::json!({ "name": name, "parents": [parent_id] }).to_string();
        let boundary = format!("snapmatch-{}", uuid::Uuid::new_v4().simple());

        let mut body = Vec::with_capacity(data.len() + metadata.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata.as_bytes());
        body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());

        let request = self
            .http
            .post(format!("{}/files", DRIVE_UPLOAD_BASE))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);
        self.send_json(request, "Upload file").await
    }

    async fn create_file_resumable(
        &self,
        name: &str,
        parent_id: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<DriveFile> {
        let request = self
            .http
            .post(format!("{}/files", DRIVE_UPLOAD_BASE))
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", data.len().to_string())
            .json(&serde_json::json!({ "name": name, "parents": [parent_id] }));

        let response = self.send(request, "Start resumable upload").await?;
        let session_uri = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Network("No upload URI in response".to_string()))?
            .to_string();

        let request = self
            .http
            .put(session_uri)
            .query(&[("fields", FILE_FIELDS)])
            .header(header::CONTENT_TYPE, content_type)
            .body(data);
        self.send_json(request, "Resumable upload").await
    }

    /// Replace the content of an existing file.
    pub async fn update_file(
        &self,
        file_id: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<DriveFile> {
        let request = self
            .http
            .patch(format!("{}/files/{}", DRIVE_UPLOAD_BASE, file_id))
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header(header::CONTENT_TYPE, content_type)
            .body(data);
        self.send_json(request, "Update file").await
    }

    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let request = self
            .http
            .get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .query(&[("alt", "media")]);

        self.send(request, "Download file")
            .await?
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Network(format!("Failed to read download response: {}", e)))
    }

    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let request = self
            .http
            .delete(format!("{}/files/{}", DRIVE_API_BASE, file_id));
        self.send(request, "Delete file").await?;
        Ok(())
    }

    pub async fn copy_file(&self, file_id: &str, new_name: &str, parent_id: &str) -> Result<DriveFile> {
        let request = self
            .http
            .post(format!("{}/files/{}/copy", DRIVE_API_BASE, file_id))
            .query(&[("fields", FILE_FIELDS)])
            .json(&serde_json::json!({ "name": new_name, "parents": [parent_id] }));
        self.send_json(request, "Copy file").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_file(mime_type: &str, size: Option<&str>) -> DriveFile {
        DriveFile {
            id: "1".to_string(),
            name: "a".to_string(),
            mime_type: mime_type.to_string(),
            size: size.map(String::from),
            modified_time: None,
            parents: vec![],
            md5_checksum: None,
            web_content_link: None,
            web_view_link: Some("https://drive.google.com/file/d/1/view".to_string()),
        }
    }

    #[test]
    fn test_drive_file_kind_and_size() {
        let folder = drive_file(FOLDER_MIME_TYPE, None);
        assert!(folder.is_folder());
        assert_eq!(folder.size_bytes(), 0);

        let photo = drive_file("image/jpeg", Some("12345"));
        assert!(!photo.is_folder());
        assert_eq!(photo.size_bytes(), 12345);
    }

    #[test]
    fn test_link_prefers_content_link() {
        let mut file = drive_file("image/jpeg", Some("1"));
        assert_eq!(file.link(), Some("https://drive.google.com/file/d/1/view"));

        file.web_content_link = Some("https://drive.google.com/uc?id=1".to_string());
        assert_eq!(file.link(), Some("https://drive.google.com/uc?id=1"));
    }

    #[test]
    fn test_api_response_parsing() {
        let json = r#"{
            "id": "abc",
            "name": "IMG_1.jpg",
            "mimeType": "image/jpeg",
            "size": "2048",
            "modifiedTime": "2024-05-01T12:00:00Z",
            "parents": ["root"]
        }"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.size_bytes(), 2048);
        assert!(file.modified_time.is_some());
        assert!(file.link().is_none());
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("bob's photo"), "bob\\'s photo");
        assert_eq!(escape_query(r"a\b"), r"a\\b");
    }
}
