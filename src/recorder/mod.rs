// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Abstraction around the runtime profiling facility.
//!
//! A [`ConnectionStrategy`] produces a [`RecorderConnection`], which opens
//! [`RecordingHandle`]s. The capture engine tries its strategies in order and
//! uses the first one that connects.

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::asprof::AsProfError;

pub mod asprof;
pub mod config;

pub use config::RecordingConfiguration;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RecordingError {
    #[error(transparent)]
    AsProf(#[from] AsProfError),
    #[error("recording i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recording is not running")]
    NotRunning,
    #[error("recording is still running")]
    StillRunning,
}

/// A connection strategy could not produce a usable connection.
#[derive(Error, Debug)]
#[error("{strategy}: {reason}")]
pub struct ConnectionUnavailable {
    pub strategy: String,
    pub reason: String,
}

/// A live connection to the profiling facility.
pub trait RecorderConnection: fmt::Debug + Send + Sync {
    /// Create a new, not yet started, recording.
    ///
    /// This must not perform blocking I/O: it is called while the capture
    /// engine holds its single-flight lock.
    fn open_recording(
        &self,
        config: &RecordingConfiguration,
    ) -> Result<Box<dyn RecordingHandle>, RecordingError>;
}

/// One recording session.
#[async_trait]
pub trait RecordingHandle: fmt::Debug + Send {
    async fn start(&mut self) -> Result<(), RecordingError>;
    /// Write the data recorded so far to `path` as JFR.
    async fn dump(&mut self, path: &Path) -> Result<(), RecordingError>;
    async fn stop(&mut self) -> Result<(), RecordingError>;
    /// Release the resources held by the recording. The handle is not usable afterwards.
    async fn close(&mut self) -> Result<(), RecordingError>;
}

/// A way of connecting to the profiling facility.
pub trait ConnectionStrategy: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn connect(&self) -> Result<Arc<dyn RecorderConnection>, ConnectionUnavailable>;
}

/// The default ordered strategy list: the library on the loader search path,
/// then the library under `$ASYNC_PROFILER_HOME/lib` if that is set.
pub fn default_strategies() -> Vec<Box<dyn ConnectionStrategy>> {
    let mut strategies: Vec<Box<dyn ConnectionStrategy>> =
        vec![Box::new(asprof::AsProfStrategy::search_path())];
    if let Some(home) = std::env::var_os(asprof::ASYNC_PROFILER_HOME_ENV) {
        strategies.push(Box::new(asprof::AsProfStrategy::home(home)));
    }
    strategies
}
