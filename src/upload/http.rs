// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! `reqwest` implementations of the backend client and the block blob uploader.

use std::{fmt, path::Path};

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use reqwest::{header, Method, StatusCode};
use tokio::io::AsyncReadExt;
use url::Url;
use uuid::Uuid;

use super::{
    blob::{blob_url, BlobError, BlobUploadOptions, BlobUploadResponse, BlobUploader},
    client::{ArtifactAcceptedResponse, BlobAccessPass, ClientError, ServiceProfilerClient},
};

const API_FEATURE_VERSION: &str = "2020-10-14-preview";
const STORAGE_API_VERSION: &str = "2021-08-06";

/// Client for the profile store's artifact API.
pub struct HttpServiceProfilerClient {
    http_client: reqwest::Client,
    host_url: Url,
    instrumentation_key: String,
    user_agent: Option<String>,
}

impl fmt::Debug for HttpServiceProfilerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServiceProfilerClient")
            .field("host_url", &self.host_url.as_str())
            .finish()
    }
}

impl HttpServiceProfilerClient {
    pub fn new(host_url: Url, instrumentation_key: impl Into<String>) -> Self {
        HttpServiceProfilerClient {
            http_client: reqwest::Client::new(),
            host_url,
            instrumentation_key: instrumentation_key.into(),
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = http_client;
        self
    }

    // api/apps/{ikey}/artifactkinds/profile/artifacts/{artifactId}?iKey={ikey}&extension={ext}&api-version=...
    fn artifact_url(&self, profile_id: Uuid, extension: &str) -> Result<Url, ClientError> {
        let mut base = self.host_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let mut url = base.join(&format!(
            "api/apps/{}/artifactkinds/profile/artifacts/{}",
            self.instrumentation_key, profile_id
        ))?;
        url.query_pairs_mut()
            .append_pair("iKey", &self.instrumentation_key)
            .append_pair("extension", extension)
            .append_pair("api-version", API_FEATURE_VERSION);
        Ok(url)
    }

    fn upload_request_url(&self, profile_id: Uuid, extension: &str) -> Result<Url, ClientError> {
        let mut url = self.artifact_url(profile_id, extension)?;
        url.query_pairs_mut().append_pair("action", "gettoken");
        Ok(url)
    }

    fn upload_finished_request_url(
        &self,
        profile_id: Uuid,
        extension: &str,
        etag: &str,
    ) -> Result<Url, ClientError> {
        let mut url = self.artifact_url(profile_id, extension)?;
        url.query_pairs_mut()
            .append_pair("action", "commit")
            .append_pair("etag", etag);
        Ok(url)
    }

    async fn execute_post(&self, url: Url) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http_client.request(Method::POST, url);
        if let Some(user_agent) = &self.user_agent {
            request = request.header(header::USER_AGENT, user_agent);
        }
        Ok(request.send().await?)
    }
}

fn parse_upload_access(status: u16, location: Option<&str>) -> Result<BlobAccessPass, ClientError> {
    if status >= 300 {
        return Err(ClientError::Status(status));
    }
    match location {
        Some(location) if !location.is_empty() => Ok(BlobAccessPass {
            uri_with_sas_token: location.to_owned(),
            blob_name: None,
            expiry: None,
        }),
        _ => Err(ClientError::MissingLocation),
    }
}

fn parse_upload_finish(status: u16, body: &str) -> Result<ArtifactAcceptedResponse, ClientError> {
    if status != 201 && status != 202 {
        tracing::error!(status, "trace upload commit failed");
        return Err(ClientError::Status(status));
    }
    ArtifactAcceptedResponse::from_json(body)
}

#[async_trait]
impl ServiceProfilerClient for HttpServiceProfilerClient {
    async fn get_upload_access(
        &self,
        profile_id: Uuid,
        extension: &str,
    ) -> Result<BlobAccessPass, ClientError> {
        let response = self
            .execute_post(self.upload_request_url(profile_id, extension)?)
            .await?;
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok());
        parse_upload_access(response.status().as_u16(), location)
    }

    async fn report_upload_finish(
        &self,
        profile_id: Uuid,
        extension: &str,
        etag: &str,
    ) -> Result<ArtifactAcceptedResponse, ClientError> {
        let response = self
            .execute_post(self.upload_finished_request_url(profile_id, extension, etag)?)
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_upload_finish(status, &body)
    }
}

/// Uploads through the block blob REST API: one `Put Block` per block, then
/// a `Put Block List` that commits them with the blob's headers and metadata.
#[derive(Debug, Default)]
pub struct HttpBlockBlobUploader {
    http_client: reqwest::Client,
}

impl HttpBlockBlobUploader {
    pub fn new(http_client: reqwest::Client) -> Self {
        HttpBlockBlobUploader { http_client }
    }

    async fn put_block(
        &self,
        url: &Url,
        block_id: &str,
        block: Vec<u8>,
    ) -> Result<StatusCode, BlobError> {
        let mut url = url.clone();
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", block_id);
        let response = self
            .http_client
            .put(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .body(block)
            .send()
            .await?;
        Ok(response.status())
    }

    async fn put_block_list(
        &self,
        url: &Url,
        block_ids: &[String],
        options: &BlobUploadOptions,
    ) -> Result<BlobUploadResponse, BlobError> {
        let mut url = url.clone();
        url.query_pairs_mut().append_pair("comp", "blocklist");
        let mut request = self
            .http_client
            .put(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-blob-content-encoding", options.content_encoding)
            .header(header::CONTENT_TYPE, "application/xml");
        for (name, value) in &options.metadata {
            request = request.header(format!("x-ms-meta-{name}"), value);
        }
        let response = request.body(block_list_xml(block_ids)).send().await?;
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        Ok(BlobUploadResponse {
            status_code: response.status().as_u16(),
            etag,
        })
    }
}

// all block ids of a blob must have the same length
fn block_id(index: usize) -> String {
    BASE64_STANDARD.encode(format!("block-{index:010}"))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

async fn read_block(file: &mut tokio::fs::File, block_size: usize) -> std::io::Result<Vec<u8>> {
    let mut block = Vec::with_capacity(block_size);
    (&mut *file)
        .take(block_size as u64)
        .read_to_end(&mut block)
        .await?;
    Ok(block)
}

#[async_trait]
impl BlobUploader for HttpBlockBlobUploader {
    async fn upload(
        &self,
        pass: &BlobAccessPass,
        file: &Path,
        options: &BlobUploadOptions,
    ) -> Result<BlobUploadResponse, BlobError> {
        let url = blob_url(pass)?;
        tracing::debug!(message = "uploading to blob", url = %url);
        let mut file = tokio::fs::File::open(file).await?;
        let mut block_ids = vec![];
        loop {
            let block = read_block(&mut file, options.block_size).await?;
            if block.is_empty() {
                break;
            }
            let id = block_id(block_ids.len());
            let status = self.put_block(&url, &id, block).await?;
            if !status.is_success() {
                tracing::error!(%status, block = block_ids.len(), "put block failed");
                return Ok(BlobUploadResponse {
                    status_code: status.as_u16(),
                    etag: String::new(),
                });
            }
            block_ids.push(id);
        }
        self.put_block_list(&url, &block_ids, options).await
    }

    async fn put(&self, url: &Url, body: Vec<u8>) -> Result<u16, BlobError> {
        let response = self
            .http_client
            .put(url.clone())
            .header("x-ms-blob-type", "BlockBlob")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}
