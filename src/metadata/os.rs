// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    sync::atomic::{self, AtomicBool},
};

/// OS family reported with uploaded profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsPlatform {
    Windows,
    Linux,
    Osx,
    Unknown,
}

impl OsPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsPlatform::Windows => "Windows",
            OsPlatform::Linux => "Linux",
            OsPlatform::Osx => "OSX",
            OsPlatform::Unknown => "Unknown",
        }
    }

    /// Classify an OS name by case-insensitive prefix.
    pub fn from_os_name(os_name: &str) -> Self {
        let os_name = os_name.to_ascii_lowercase();
        if os_name.starts_with("windows") {
            OsPlatform::Windows
        } else if os_name.starts_with("linux") {
            OsPlatform::Linux
        } else if os_name.starts_with("mac") || os_name.starts_with("darwin") {
            OsPlatform::Osx
        } else {
            OsPlatform::Unknown
        }
    }
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static EMITTED_UNKNOWN_OS: AtomicBool = AtomicBool::new(false);

/// The platform of the running process.
pub fn os_platform_description() -> OsPlatform {
    let platform = OsPlatform::from_os_name(std::env::consts::OS);
    if platform == OsPlatform::Unknown && !EMITTED_UNKNOWN_OS.swap(true, atomic::Ordering::Relaxed)
    {
        tracing::warn!(
            os = std::env::consts::OS,
            "could not determine OS platform for profile metadata"
        );
    }
    platform
}
