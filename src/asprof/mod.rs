// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    ffi::{c_char, CStr, CString, OsStr},
    path::Path,
};

use thiserror::Error;

pub(crate) mod raw;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AsProfError {
    #[error("async-profiler error: {0}")]
    AsyncProfilerError(String),
    #[error("async-profiler i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error loading libasyncProfiler: {0}")]
    LibraryError(String),
    #[error("command contains an interior nul byte")]
    InvalidCommand(#[from] std::ffi::NulError),
}

/// A handle to a loaded and initialized async-profiler.
#[derive(Clone, Copy)]
pub(crate) struct AsProf {
    prof: &'static raw::AsyncProfiler,
}

impl std::fmt::Debug for AsProf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsProf").finish()
    }
}

impl AsProf {
    /// Load async-profiler from `library` and initialize it.
    pub(crate) fn connect(library: &OsStr) -> Result<Self, AsProfError> {
        let prof = raw::load(library).map_err(|e| AsProfError::LibraryError(e.to_string()))?;
        unsafe {
            (prof.asprof_init)();
        }
        Ok(AsProf { prof })
    }

    pub(crate) fn start(&self, args: &str) -> Result<(), AsProfError> {
        self.execute(&format!("start,{args}"))?;
        tracing::debug!("async-profiler started successfully");
        Ok(())
    }

    pub(crate) fn dump(&self, path: &Path) -> Result<(), AsProfError> {
        self.execute(&format!("dump,jfr,file={}", path.display()))?;
        tracing::debug!(message = "async-profiler dumped recording", path = ?path);
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<(), AsProfError> {
        self.execute("stop")?;
        tracing::debug!("async-profiler stopped successfully");
        Ok(())
    }

    /// convert an asprof_error_t to a Result
    ///
    /// SAFETY: response must be a valid asprof_error_t
    unsafe fn asprof_error(&self, response: raw::asprof_error_t) -> Result<(), AsProfError> {
        if !response.is_null() {
            let response = unsafe { (self.prof.asprof_error_str)(response) };
            if response.is_null() {
                return Ok(());
            }
            let response = unsafe { CStr::from_ptr(response) };
            let response_str = response.to_string_lossy();
            tracing::error!("received error from async-profiler: {}", response_str);
            Err(AsProfError::AsyncProfilerError(response_str.to_string()))
        } else {
            Ok(())
        }
    }

    fn execute(&self, args: &str) -> Result<(), AsProfError> {
        unsafe extern "C" fn callback(buf: *const c_char, size: usize) {
            unsafe {
                if !buf.is_null() {
                    let parts = std::slice::from_raw_parts(buf as *const u8, size);
                    tracing::debug!(
                        "response from async-profiler: {}",
                        String::from_utf8_lossy(parts)
                    );
                } else {
                    tracing::debug!("invalid pointer or size");
                }
            }
        }

        let args_compatible = CString::new(args)?;
        unsafe {
            self.asprof_error((self.prof.asprof_execute)(
                args_compatible.as_ptr(),
                Some(callback),
            ))
        }
    }
}
