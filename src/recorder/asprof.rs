// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Recordings driven through async-profiler's `asprof_execute` API.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;

use super::{
    ConnectionStrategy, ConnectionUnavailable, RecorderConnection, RecordingConfiguration,
    RecordingError, RecordingHandle,
};
use crate::asprof::AsProf;

pub const ASYNC_PROFILER_HOME_ENV: &str = "ASYNC_PROFILER_HOME";
const LIBRARY_NAME: &str = "libasyncProfiler.so";

/// The file async-profiler streams the live recording into.
struct JfrFile {
    file: std::fs::File,
}

impl JfrFile {
    #[cfg(target_os = "linux")]
    fn new() -> Result<Self, io::Error> {
        Ok(Self {
            file: tempfile::tempfile()?,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn new() -> Result<Self, io::Error> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "async-profiler is only supported on Linux",
        ))
    }

    #[cfg(target_os = "linux")]
    fn path(&self) -> PathBuf {
        use std::os::fd::AsRawFd;

        format!("/proc/self/fd/{}", self.file.as_raw_fd()).into()
    }

    #[cfg(not(target_os = "linux"))]
    fn path(&self) -> PathBuf {
        unreachable!("JfrFile cannot be created on this platform")
    }
}

/// Loads `libasyncProfiler.so` from one location.
#[derive(Debug, Clone)]
pub struct AsProfStrategy {
    name: String,
    library: OsString,
}

impl AsProfStrategy {
    /// Resolve the library through the dynamic loader search path
    /// (RPATH, `LD_LIBRARY_PATH`, ...).
    pub fn search_path() -> Self {
        AsProfStrategy {
            name: "async-profiler (search path)".into(),
            library: LIBRARY_NAME.into(),
        }
    }

    /// Load the library from `<home>/lib`.
    pub fn home(home: impl Into<PathBuf>) -> Self {
        let library = home.into().join("lib").join(LIBRARY_NAME);
        AsProfStrategy {
            name: format!("async-profiler ({})", library.display()),
            library: library.into_os_string(),
        }
    }
}

impl ConnectionStrategy for AsProfStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Arc<dyn RecorderConnection>, ConnectionUnavailable> {
        let asprof = AsProf::connect(&self.library).map_err(|e| ConnectionUnavailable {
            strategy: self.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(AsProfConnection { asprof }))
    }
}

#[derive(Debug)]
pub(crate) struct AsProfConnection {
    asprof: AsProf,
}

impl RecorderConnection for AsProfConnection {
    fn open_recording(
        &self,
        config: &RecordingConfiguration,
    ) -> Result<Box<dyn RecordingHandle>, RecordingError> {
        Ok(Box::new(AsProfRecording {
            asprof: self.asprof,
            config: config.clone(),
            jfr_file: None,
            status: Status::Idle,
        }))
    }
}

enum Status {
    Idle,
    Starting,
    Running,
}

/// async-profiler is process-global, so at most one of these may be running.
/// When this type drops it stops the profiler if it's running.
struct AsProfRecording {
    asprof: AsProf,
    config: RecordingConfiguration,
    // this is only None before start and after close
    jfr_file: Option<JfrFile>,
    status: Status,
}

impl std::fmt::Debug for AsProfRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsProfRecording")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl RecordingHandle for AsProfRecording {
    async fn start(&mut self) -> Result<(), RecordingError> {
        let jfr_file = JfrFile::new()?;
        let args = self.config.to_args_string(&jfr_file.path());
        tracing::debug!("starting the async-profiler with arguments: {args}");
        self.jfr_file = Some(jfr_file);
        // drop guard - make sure the file is leaked if the profiler might have started
        self.status = Status::Starting;
        self.asprof.start(&args)?;
        self.status = Status::Running;
        Ok(())
    }

    async fn dump(&mut self, path: &Path) -> Result<(), RecordingError> {
        if !matches!(self.status, Status::Running) {
            return Err(RecordingError::NotRunning);
        }
        self.asprof.dump(path)?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RecordingError> {
        match self.status {
            Status::Idle => Ok(()),
            Status::Starting | Status::Running => {
                self.asprof.stop()?;
                self.status = Status::Idle;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), RecordingError> {
        if !matches!(self.status, Status::Idle) {
            return Err(RecordingError::StillRunning);
        }
        self.jfr_file = None;
        Ok(())
    }
}

impl Drop for AsProfRecording {
    fn drop(&mut self) {
        match self.status {
            Status::Running => {
                if let Err(err) = self.asprof.stop() {
                    // SECURITY: avoid removing the JFR file if stopping the profiler fails,
                    // to avoid symlink races
                    std::mem::forget(self.jfr_file.take());
                    // XXX: Rust defines leaking resources during drop as safe.
                    tracing::warn!(?err, "unable to stop profiler during drop glue");
                }
            }
            Status::Idle => {}
            Status::Starting => {
                // SECURITY: avoid removing the JFR file if stopping the profiler fails,
                // to avoid symlink races
                std::mem::forget(self.jfr_file.take());
            }
        }
    }
}
