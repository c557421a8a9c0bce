//! HTTP client for the CDN uploader
//!
//! ## Endpoints
//!
//! - `POST {uploader}/packUpload` - multipart `file` parts, creates a pack
//! - `POST {uploader}/zipAction?file_record_id={id}&action_type=1` - append
//! - `GET  {uploader}/cacheFile/{id}?range={offset},{length}` - ranged read
//!
//! Both write endpoints answer with the pack's zip directory. Each entry's
//! `CompressedSize64` is its stored length; the pack's new cumulative size is
//! the end of the last entry.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{PackFile, PackReceipt, Placement, RemoteStore};
use crate::error::{BlockServiceError, Result};

/// `action_type` value the uploader uses for appends
const APPEND_ACTION: &str = "1";

/// One entry of the pack's zip directory
#[derive(Debug, Clone, Deserialize)]
struct ZipEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CompressedSize64", default)]
    compressed_size: u64,
    #[serde(rename = "UncompressedSize64", default)]
    uncompressed_size: u64,
    #[serde(rename = "Offset", default)]
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct ZipDirectory {
    #[serde(rename = "File", default)]
    files: Vec<ZipEntry>,
}

#[derive(Debug, Deserialize)]
struct PackRecord {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "FileRecord")]
    file_record: PackRecord,
    #[serde(rename = "ZipReader")]
    zip_reader: ZipDirectory,
}

impl ZipDirectory {
    fn into_receipt(self, pack_id: String) -> Result<PackReceipt> {
        let last = self
            .files
            .last()
            .ok_or_else(|| BlockServiceError::remote("pack directory is empty"))?;
        let total_size = last
            .offset
            .checked_add(last.uncompressed_size)
            .ok_or_else(|| BlockServiceError::remote("pack directory entry overflows u64"))?;

        let placements = self
            .files
            .into_iter()
            .map(|f| Placement {
                name: f.name,
                offset: f.offset,
                length: f.compressed_size,
            })
            .collect();

        Ok(PackReceipt {
            pack_id,
            placements,
            total_size,
        })
    }
}

/// Remote pack store reached over HTTP
pub struct HttpRemoteStore {
    http_client: reqwest::Client,
    uploader_url: String,
}

impl HttpRemoteStore {
    pub fn new(uploader_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlockServiceError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            uploader_url: uploader_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn form(files: Vec<PackFile>) -> Form {
        files.into_iter().fold(Form::new(), |form, file| {
            let part = Part::bytes(file.data.to_vec()).file_name(file.name);
            form.part("file", part)
        })
    }

    fn cache_file_url(&self, pack_id: &str) -> String {
        format!("{}/cacheFile/{}", self.uploader_url, pack_id)
    }

    fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(BlockServiceError::remote(format!(
            "HTTP {} from {}",
            status,
            response.url()
        )))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upload(&self, files: Vec<PackFile>) -> Result<PackReceipt> {
        let url = format!("{}/packUpload", self.uploader_url);
        let count = files.len();

        let response = self
            .http_client
            .post(&url)
            .multipart(Self::form(files))
            .send()
            .await?;
        let body: UploadResponse = Self::check(response)?.json().await?;

        debug!(pack_id = %body.file_record.id, files = count, "Uploaded new pack");
        body.zip_reader.into_receipt(body.file_record.id)
    }

    async fn append(&self, pack_id: &str, files: Vec<PackFile>) -> Result<PackReceipt> {
        let url = format!("{}/zipAction", self.uploader_url);
        let count = files.len();

        let response = self
            .http_client
            .post(&url)
            .query(&[("file_record_id", pack_id), ("action_type", APPEND_ACTION)])
            .multipart(Self::form(files))
            .send()
            .await?;
        let body: ZipDirectory = Self::check(response)?.json().await?;

        debug!(pack_id = %pack_id, files = count, "Appended to pack");
        body.into_receipt(pack_id.to_string())
    }

    async fn range_fetch(&self, pack_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        let range = format!("{},{}", offset, length);
        let response = self
            .http_client
            .get(self.cache_file_url(pack_id))
            .query(&[("range", range.as_str())])
            .send()
            .await?;

        Ok(Self::check(response)?.bytes().await?)
    }
}
