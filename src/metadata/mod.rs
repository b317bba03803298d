// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host metadata attached to uploaded profiles.

pub mod os;

pub use os::{os_platform_description, OsPlatform};

/// Identifies the process the profiles come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMetadata {
    pub machine_name: String,
    pub process_id: String,
    pub role_name: Option<String>,
}

impl HostMetadata {
    /// Metadata for the current process, using `machine_name` if provided
    /// and the host name otherwise.
    pub fn detect(machine_name: Option<String>, role_name: Option<String>) -> Self {
        HostMetadata {
            machine_name: machine_name.unwrap_or_else(detect_machine_name),
            process_id: std::process::id().to_string(),
            role_name: role_name.filter(|r| !r.is_empty()),
        }
    }
}

fn detect_machine_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned()),
        )
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| {
            tracing::debug!("unable to determine machine name");
            "unknown".to_owned()
        })
}

#[cfg(test)]
pub(crate) fn dummy_metadata() -> HostMetadata {
    HostMetadata {
        machine_name: "test-machine".into(),
        process_id: "1234".into(),
        role_name: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        let md = HostMetadata::detect(Some("box".into()), Some(String::new()));
        assert_eq!(md.machine_name, "box");
        assert_eq!(md.process_id, std::process::id().to_string());
        assert_eq!(md.role_name, None);
        assert!(!HostMetadata::detect(None, None).machine_name.is_empty());
    }
}
