// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The two calls the uploader makes to the profile store backend.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    #[cfg(feature = "http")]
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("backend response did not have a location")]
    MissingLocation,
    #[error("failed to deserialize backend response: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A short-lived credential granting write access to one upload destination.
#[derive(Clone, PartialEq, Eq)]
pub struct BlobAccessPass {
    /// Container (or blob, when `blob_name` is `None`) URI including the SAS token.
    pub uri_with_sas_token: String,
    pub blob_name: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

// the SAS token is a credential, keep it out of logs
impl fmt::Debug for BlobAccessPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = match self.uri_with_sas_token.split_once('?') {
            Some((base, _)) => format!("{base}?<redacted>"),
            None => self.uri_with_sas_token.clone(),
        };
        f.debug_struct("BlobAccessPass")
            .field("uri_with_sas_token", &redacted)
            .field("blob_name", &self.blob_name)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Body of the backend's response to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactAcceptedResponse {
    pub stamp_id: String,
    pub accepted_time: String,
    #[serde(default)]
    pub blob_uri: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ArtifactAcceptedResponse {
    pub fn from_json(body: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Abstraction around the profile store backend.
#[async_trait]
pub trait ServiceProfilerClient: fmt::Debug + Send + Sync {
    /// Obtain permission to upload the artifact for `profile_id`.
    async fn get_upload_access(
        &self,
        profile_id: Uuid,
        extension: &str,
    ) -> Result<BlobAccessPass, ClientError>;

    /// Report that the artifact for `profile_id` has been uploaded.
    async fn report_upload_finish(
        &self,
        profile_id: Uuid,
        extension: &str,
        etag: &str,
    ) -> Result<ArtifactAcceptedResponse, ClientError>;
}
