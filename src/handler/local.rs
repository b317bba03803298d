// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A handler that copies artifacts into a directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::{alert::AlertBreach, upload::timestamp::file_name_timestamp};

use super::ProfileHandler;

#[derive(Error, Debug)]
enum LocalProfileHandlerError {
    #[error("{0}")]
    IoError(#[from] std::io::Error),
}

/// A handler that copies artifacts into a directory.
///
/// The files are written with the filename
/// `yyyy-mm-ddTHH-MM-SSZ_<trigger>_<profile id>.jfr`, where the time is the
/// start of the recording.
#[derive(Debug)]
pub struct LocalProfileHandler {
    directory: PathBuf,
}

impl LocalProfileHandler {
    /// Instantiate a new LocalProfileHandler writing into the provided directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        LocalProfileHandler {
            directory: directory.into(),
        }
    }

    async fn copy_profile(
        &self,
        breach: &AlertBreach,
        timestamp: i64,
        file: &Path,
    ) -> Result<PathBuf, std::io::Error> {
        let time = DateTime::<Utc>::from_timestamp_millis(timestamp).unwrap_or_default();
        let file_name = format!(
            "{}_{}_{}.jfr",
            file_name_timestamp(time),
            breach.metric_type.as_str().to_lowercase(),
            breach.profile_id
        );
        tracing::debug!("writing {file_name}");
        tokio::fs::create_dir_all(&self.directory).await?;
        let target = self.directory.join(file_name);
        tokio::fs::copy(file, &target).await?;
        Ok(target)
    }
}

#[async_trait]
impl ProfileHandler for LocalProfileHandler {
    async fn receive(
        &self,
        breach: &AlertBreach,
        timestamp: i64,
        file: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let target = self
            .copy_profile(breach, timestamp, file)
            .await
            .map_err(LocalProfileHandlerError::IoError)?;
        tracing::info!(path = %target.display(), "profile written");
        Ok(())
    }
}
