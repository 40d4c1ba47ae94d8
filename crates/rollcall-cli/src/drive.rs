//! Google Drive v3 client: pull a folder's images into the known-faces directory.

use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DRIVE_BASE_URL: &str = "https://www.googleapis.com";
const PAGE_SIZE: &str = "100";

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Drive API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

/// Outcome of one folder sync.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub listed: usize,
    pub downloaded: Vec<PathBuf>,
    pub failed: usize,
}

pub struct DriveClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
}

impl DriveClient {
    pub fn new(access_token: String) -> Self {
        Self::with_base_url(access_token, DRIVE_BASE_URL.to_string())
    }

    /// Point the client at another API root, e.g. a local mock.
    pub fn with_base_url(access_token: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Every non-trashed image directly inside `folder_id`, following pagination.
    pub async fn list_images(&self, folder_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let url = format!("{}/drive/v3/files", self.base_url);
        let query = image_query(folder_id);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
                .query(&[
                    ("q", query.as_str()),
                    ("fields", "nextPageToken, files(id, name)"),
                    ("pageSize", PAGE_SIZE),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = checked(request.send().await?).await?;
            let page: FileList = response.json().await?;
            tracing::debug!(count = page.files.len(), "Drive page listed");
            files.extend(page.files);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }

    /// Download one file's content to `dest`.
    pub async fn download(&self, file_id: &str, dest: &Path) -> Result<u64, DriveError> {
        let url = format!("{}/drive/v3/files/{}", self.base_url, file_id);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .query(&[("alt", "media")])
            .send()
            .await?;
        let bytes = checked(response).await?.bytes().await?;

        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|source| DriveError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(bytes.len() as u64)
    }

    /// Download every image in `folder_id` into `dest_dir`.
    ///
    /// Listing failures abort; a failed download is logged and counted.
    pub async fn sync_folder(&self, folder_id: &str, dest_dir: &Path) -> Result<SyncReport, DriveError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| DriveError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let files = self.list_images(folder_id).await?;
        tracing::info!(folder = folder_id, count = files.len(), "found images in Drive folder");

        let mut report = SyncReport {
            listed: files.len(),
            ..SyncReport::default()
        };
        for file in files {
            let Some(local_name) = local_file_name(&file.name) else {
                tracing::warn!(id = %file.id, name = %file.name, "skipping file with unusable name");
                report.failed += 1;
                continue;
            };
            let dest = dest_dir.join(local_name);
            match self.download(&file.id, &dest).await {
                Ok(bytes) => {
                    tracing::info!(name = %file.name, bytes, "downloaded");
                    report.downloaded.push(dest);
                }
                Err(e) => {
                    tracing::warn!(name = %file.name, error = %e, "download failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, DriveError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(DriveError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Drive search expression for images in one folder.
fn image_query(folder_id: &str) -> String {
    let escaped = folder_id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}' in parents and mimeType contains 'image/' and trashed = false")
}

/// Reduce a Drive file name to one safe path component.
fn local_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}
