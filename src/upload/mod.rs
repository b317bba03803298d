// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shipping captured artifacts to the profile store.
//!
//! An upload compresses the artifact with gzip next to the source file,
//! obtains a [`BlobAccessPass`] from the [`ServiceProfilerClient`], transfers
//! the compressed file in [`UPLOAD_BLOCK_LENGTH`] blocks through a
//! [`BlobUploader`], and reports completion to the backend. The compressed
//! file is deleted on every exit path unless artifacts are retained for
//! debugging.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{prelude::BASE64_STANDARD, Engine};
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use tempfile::TempPath;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::metadata::{os_platform_description, HostMetadata};

pub mod blob;
pub mod client;
#[cfg(feature = "http")]
pub mod http;
pub mod timestamp;

pub use blob::{BlobError, BlobUploadOptions, BlobUploadResponse, BlobUploader, UPLOAD_BLOCK_LENGTH};
pub use client::{ArtifactAcceptedResponse, BlobAccessPass, ClientError, ServiceProfilerClient};

const DATA_CUBE_META_NAME: &str = "spDataCube";
const MACHINE_NAME_META_NAME: &str = "spMachineName";
const START_TIME_META_NAME: &str = "spTraceStartTime";
const PROGRAMMING_LANGUAGE_META_NAME: &str = "spProgrammingLanguage";
const OS_PLATFORM_META_NAME: &str = "spOSPlatform";
const TRACE_FILE_FORMAT_META_NAME: &str = "spTraceFileFormat";
const ROLE_NAME_META_NAME: &str = "RoleName";

const PROGRAMMING_LANGUAGE: &str = "Rust";

/// Why an upload did not complete. Every cause leaves no compressed file behind.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UploadFailed {
    #[error("failed to upload due to lack of app id")]
    MissingAppId,
    #[error("failed to compress artifact: {0}")]
    CompressionFailed(#[source] io::Error),
    #[error("failed to obtain upload pass: {0}")]
    CredentialAcquisitionFailed(#[source] ClientError),
    #[error("malformed upload destination: {0}")]
    MalformedDestination(#[source] url::ParseError),
    #[error("upload of the artifact to block blob failed with status {status_code}")]
    TransferFailed { status_code: u16 },
    #[error("upload of the artifact to block blob failed: {0}")]
    Transfer(#[source] BlobError),
    #[error("report upload finish failed: {0}")]
    CommitFailed(#[source] ClientError),
}

/// Provides the application id uploads are filed under.
pub trait AppIdSupplier: Send + Sync {
    /// The app id, or `None` if it is not known yet.
    fn app_id(&self) -> Option<String>;
}

impl<F> AppIdSupplier for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn app_id(&self) -> Option<String> {
        self()
    }
}

/// Kind, extension and format of an uploaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactFormat {
    pub kind: &'static str,
    pub extension: &'static str,
    pub file_format: &'static str,
}

impl ArtifactFormat {
    pub const JFR: ArtifactFormat = ArtifactFormat {
        kind: "Profile",
        extension: "jfr",
        file_format: "jfr",
    };
}

/// An artifact to upload, and what was observed when it was captured.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub trigger: &'a str,
    /// Start of the recording, in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub file: &'a Path,
    pub profile_id: Uuid,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub format: ArtifactFormat,
}

/// Everything one upload needs to know about its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadContext {
    pub machine_name: String,
    pub app_id: Uuid,
    pub timestamp: i64,
    pub file: PathBuf,
    pub profile_id: Uuid,
    pub file_format: String,
    pub extension: String,
}

/// The backend's acknowledgement of a committed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFinishArgs {
    pub stamp_id: String,
    pub accepted_time: String,
}

/// Describes an uploaded profile. Forwarded to telemetry emission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub trigger: String,
    pub file_id: String,
    pub stamp_id: String,
    pub app_id: Uuid,
    /// The backend's accepted time, with seven fractional digits.
    pub timestamp: String,
    pub machine_name: String,
    pub os_platform: String,
    pub process_id: String,
    pub artifact_kind: String,
    pub artifact_id: String,
    pub extension: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Uploads artifacts to the profile store.
pub struct UploadService {
    client: Arc<dyn ServiceProfilerClient>,
    uploader: Arc<dyn BlobUploader>,
    app_id: Box<dyn AppIdSupplier>,
    metadata: HostMetadata,
    retain_artifacts: bool,
    alternate_upload_url: Option<String>,
}

impl fmt::Debug for UploadService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadService")
            .field("client", &self.client)
            .field("uploader", &self.uploader)
            .field("metadata", &self.metadata)
            .field("retain_artifacts", &self.retain_artifacts)
            .field("alternate_upload_url", &self.alternate_upload_url.is_some())
            .finish()
    }
}

impl UploadService {
    pub fn new(
        client: Arc<dyn ServiceProfilerClient>,
        uploader: Arc<dyn BlobUploader>,
        app_id: impl AppIdSupplier + 'static,
        metadata: HostMetadata,
    ) -> Self {
        UploadService {
            client,
            uploader,
            app_id: Box::new(app_id),
            metadata,
            retain_artifacts: false,
            alternate_upload_url: None,
        }
    }

    /// Keep the compressed artifact on disk after the upload, logging its path.
    pub fn with_retain_artifacts(mut self, retain_artifacts: bool) -> Self {
        self.retain_artifacts = retain_artifacts;
        self
    }

    /// Also PUT every compressed artifact to `url`. The outcome of that
    /// request is only logged.
    pub fn with_alternate_upload_url(mut self, url: Option<String>) -> Self {
        self.alternate_upload_url = url;
        self
    }

    /// Upload a JFR file and return the summary of the uploaded profile.
    pub async fn upload_jfr_file(
        &self,
        trigger: &str,
        timestamp: i64,
        file: &Path,
        profile_id: Uuid,
        cpu_usage: f64,
        memory_usage: f64,
    ) -> Result<UploadSummary, UploadFailed> {
        self.upload(UploadRequest {
            trigger,
            timestamp,
            file,
            profile_id,
            cpu_usage,
            memory_usage,
            format: ArtifactFormat::JFR,
        })
        .await
    }

    pub async fn upload(&self, request: UploadRequest<'_>) -> Result<UploadSummary, UploadFailed> {
        let Some(app_id) = self.app_id() else {
            tracing::error!("failed to upload due to lack of app id");
            return Err(UploadFailed::MissingAppId);
        };
        let alternate_url = self
            .alternate_upload_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(UploadFailed::MalformedDestination)?;

        let context = UploadContext {
            machine_name: self.metadata.machine_name.clone(),
            app_id,
            timestamp: request.timestamp,
            file: request.file.to_owned(),
            profile_id: request.profile_id,
            file_format: request.format.file_format.to_owned(),
            extension: request.format.extension.to_owned(),
        };

        let compressed = compress(&context.file)
            .await
            .map_err(UploadFailed::CompressionFailed)?;
        if let Some(url) = alternate_url {
            self.spawn_alternate_upload(url, &compressed).await;
        }
        let result = self.upload_trace(&context, &compressed).await;
        self.cleanup(compressed);

        let finish = result?;
        tracing::info!(
            profile_id = %context.profile_id,
            stamp_id = %finish.stamp_id,
            "upload done"
        );
        Ok(UploadSummary {
            trigger: request.trigger.to_owned(),
            file_id: create_id(),
            stamp_id: finish.stamp_id,
            app_id,
            timestamp: timestamp::pad_nanos(&finish.accepted_time),
            machine_name: context.machine_name,
            os_platform: os_platform_description().as_str().to_owned(),
            process_id: self.metadata.process_id.clone(),
            artifact_kind: request.format.kind.to_owned(),
            artifact_id: context.profile_id.to_string(),
            extension: context.extension,
            cpu_usage: request.cpu_usage,
            memory_usage: request.memory_usage,
        })
    }

    fn app_id(&self) -> Option<Uuid> {
        let app_id = self.app_id.app_id().filter(|id| !id.is_empty())?;
        match Uuid::parse_str(&app_id) {
            Ok(app_id) => Some(app_id),
            Err(err) => {
                tracing::warn!(?err, %app_id, "app id is not a uuid");
                None
            }
        }
    }

    async fn upload_trace(
        &self,
        context: &UploadContext,
        compressed: &Path,
    ) -> Result<UploadFinishArgs, UploadFailed> {
        let pass = self
            .client
            .get_upload_access(context.profile_id, &context.extension)
            .await
            .map_err(UploadFailed::CredentialAcquisitionFailed)?;
        tracing::debug!(?pass, "obtained upload pass");

        let response = self
            .uploader
            .upload(&pass, compressed, &self.blob_upload_options(context))
            .await
            .map_err(|err| match err {
                BlobError::MalformedUrl(err) => UploadFailed::MalformedDestination(err),
                err => UploadFailed::Transfer(err),
            })?;
        if !response.is_success() {
            tracing::error!(
                status_code = response.status_code,
                "upload of the artifact to block blob failed"
            );
            return Err(UploadFailed::TransferFailed {
                status_code: response.status_code,
            });
        }

        let accepted = self
            .client
            .report_upload_finish(context.profile_id, &context.extension, &response.etag)
            .await
            .map_err(UploadFailed::CommitFailed)?;
        tracing::debug!(status_code = response.status_code, "completed upload request");
        Ok(UploadFinishArgs {
            stamp_id: accepted.stamp_id,
            accepted_time: accepted.accepted_time,
        })
    }

    fn blob_upload_options(&self, context: &UploadContext) -> BlobUploadOptions {
        let mut metadata = BTreeMap::from([
            (DATA_CUBE_META_NAME.to_owned(), context.app_id.to_string()),
            (
                MACHINE_NAME_META_NAME.to_owned(),
                context.machine_name.clone(),
            ),
            (
                START_TIME_META_NAME.to_owned(),
                timestamp::timestamp_millis_to_string(context.timestamp),
            ),
            (
                PROGRAMMING_LANGUAGE_META_NAME.to_owned(),
                PROGRAMMING_LANGUAGE.to_owned(),
            ),
            (
                OS_PLATFORM_META_NAME.to_owned(),
                os_platform_description().as_str().to_owned(),
            ),
            (
                TRACE_FILE_FORMAT_META_NAME.to_owned(),
                context.file_format.clone(),
            ),
        ]);
        if let Some(role_name) = &self.metadata.role_name {
            metadata.insert(ROLE_NAME_META_NAME.to_owned(), role_name.clone());
        }
        BlobUploadOptions {
            metadata,
            content_encoding: "gzip",
            block_size: UPLOAD_BLOCK_LENGTH,
        }
    }

    async fn spawn_alternate_upload(&self, url: Url, compressed: &Path) {
        let body = match tokio::fs::read(compressed).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(?err, "unable to read compressed artifact for alternate upload");
                return;
            }
        };
        let uploader = self.uploader.clone();
        tokio::spawn(async move {
            match uploader.put(&url, body).await {
                Ok(status_code) if (200..300).contains(&status_code) => {
                    tracing::debug!(status_code, "alternate upload done")
                }
                Ok(status_code) => tracing::warn!(status_code, "alternate upload failed"),
                Err(err) => tracing::warn!(?err, "alternate upload failed"),
            }
        });
    }

    fn cleanup(&self, compressed: TempPath) {
        if self.retain_artifacts {
            match compressed.keep() {
                Ok(path) => tracing::info!(path = %path.display(), "compressed artifact retained"),
                Err(err) => tracing::warn!(?err, "unable to retain compressed artifact"),
            }
            return;
        }
        let result = if compressed.is_dir() {
            std::fs::remove_dir_all(&compressed)
        } else {
            compressed.close()
        };
        if let Err(err) = result {
            tracing::warn!(?err, "an error occurred when deleting the compressed artifact");
        }
    }
}

/// Gzip `file` into `<name>.<random>.gz` in the same directory. The returned
/// path deletes the file when dropped.
async fn compress(file: &Path) -> io::Result<TempPath> {
    let file = file.to_owned();
    tokio::task::spawn_blocking(move || {
        tracing::debug!(file = %file.display(), "compressing artifact");
        let dir = match file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut prefix = file.file_name().map(OsString::from).unwrap_or_default();
        prefix.push(".");
        let mut target = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".gz")
            .tempfile_in(dir)?;
        let mut source = std::fs::File::open(&file)?;
        let mut encoder = GzEncoder::new(target.as_file_mut(), Compression::default());
        io::copy(&mut source, &mut encoder)?;
        encoder.finish()?;
        Ok(target.into_temp_path())
    })
    .await
    .map_err(io::Error::other)?
}

// 9 random bytes, base64
fn create_id() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 9]>())
}
