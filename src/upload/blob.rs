// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block blob transfer of compressed artifacts.

use std::{collections::BTreeMap, fmt, path::Path};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use super::client::BlobAccessPass;

/// Size of each transferred block.
pub const UPLOAD_BLOCK_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BlobError {
    #[error("malformed destination url: {0}")]
    MalformedUrl(#[from] url::ParseError),
    #[error("io error reading artifact: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "http")]
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// How a blob is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUploadOptions {
    /// Stored with the blob as `x-ms-meta-*` entries.
    pub metadata: BTreeMap<String, String>,
    pub content_encoding: &'static str,
    pub block_size: usize,
}

/// Outcome of a transfer that reached the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUploadResponse {
    pub status_code: u16,
    pub etag: String,
}

impl BlobUploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Abstraction around the blob transfer layer.
#[async_trait]
pub trait BlobUploader: fmt::Debug + Send + Sync {
    /// Transfer `file` to the destination granted by `pass`, in blocks of
    /// `options.block_size`.
    async fn upload(
        &self,
        pass: &BlobAccessPass,
        file: &Path,
        options: &BlobUploadOptions,
    ) -> Result<BlobUploadResponse, BlobError>;

    /// Single-request PUT of `body` to `url`. Returns the response status.
    async fn put(&self, url: &Url, body: Vec<u8>) -> Result<u16, BlobError>;
}

/// The URL of the blob a pass grants access to.
pub fn blob_url(pass: &BlobAccessPass) -> Result<Url, BlobError> {
    let mut url = Url::parse(&pass.uri_with_sas_token)?;
    if let Some(blob_name) = pass.blob_name.as_deref().filter(|n| !n.is_empty()) {
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(blob_name.split('/'));
    }
    Ok(url)
}
