// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    ffi::OsStr,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

// these bindings copied from asprof.h
// in sync with
// https://github.com/async-profiler/async-profiler/blob/bd439d8a0421a821b0c17e5ca74e363103c9cf67/src/asprof.h

#[allow(non_camel_case_types)]
pub type asprof_error_t = *const std::ffi::c_char;
#[allow(non_camel_case_types)]
pub type asprof_writer_t = Option<unsafe extern "C" fn(buf: *const std::ffi::c_char, size: usize)>;

pub(crate) struct AsyncProfiler {
    pub(crate) asprof_init: libloading::Symbol<'static, unsafe extern "C" fn()>,
    pub(crate) asprof_execute: libloading::Symbol<
        'static,
        unsafe extern "C" fn(
            command: *const std::ffi::c_char,
            output_callback: asprof_writer_t,
        ) -> asprof_error_t,
    >,
    pub(crate) asprof_error_str: libloading::Symbol<
        'static,
        unsafe extern "C" fn(asprof_error_t) -> *const std::ffi::c_char,
    >,
}

/// Why a library could not be used.
#[derive(Debug, Clone)]
pub(crate) enum LoadError {
    /// dlopen failed
    Open(Arc<libloading::Error>),
    /// the library opened but is missing a required symbol
    MissingSymbol(&'static str, Arc<libloading::Error>),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Open(err) => write!(f, "unable to open library: {err}"),
            LoadError::MissingSymbol(name, err) => {
                write!(f, "library does not export {name}: {err}")
            }
        }
    }
}

// async-profiler starts threads and installs signal handlers, so once a copy of
// the library is in use it must never be dlclose'd. The first library that loads
// successfully is leaked and kept here for the life of the process.
static ASYNC_PROFILER: OnceLock<AsyncProfiler> = OnceLock::new();
static LOAD_LOCK: Mutex<()> = Mutex::new(());

/// Loads async-profiler from `library` (a soname resolved through the dynamic
/// loader search path, or an absolute path). Returns the already loaded
/// library if one was loaded before.
pub(crate) fn load(library: &OsStr) -> Result<&'static AsyncProfiler, LoadError> {
    let _guard = LOAD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(prof) = ASYNC_PROFILER.get() {
        return Ok(prof);
    }

    // safety: correct use of dlopen
    let lib = unsafe { libloading::Library::new(library) }
        .map_err(|e| LoadError::Open(Arc::new(e)))?;
    let lib: &'static libloading::Library = Box::leak(Box::new(lib));

    // safety: the symbol types match asprof.h
    let prof = unsafe {
        AsyncProfiler {
            asprof_init: symbol(lib, "asprof_init")?,
            asprof_execute: symbol(lib, "asprof_execute")?,
            asprof_error_str: symbol(lib, "asprof_error_str")?,
        }
    };
    Ok(ASYNC_PROFILER.get_or_init(|| prof))
}

unsafe fn symbol<T>(
    lib: &'static libloading::Library,
    name: &'static str,
) -> Result<libloading::Symbol<'static, T>, LoadError> {
    unsafe { lib.get(name.as_bytes()) }.map_err(|e| LoadError::MissingSymbol(name, Arc::new(e)))
}
