// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the profile definition a recording runs with.
//!
//! A selector string names either a built-in profile, the embedded reduced
//! profile for the trigger, or a profile definition file on disk. Resolution
//! never fails: any problem is logged and the full built-in profile is used.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::alert::AlertMetricType;

const REDUCED_CPU_PROFILE: &str = include_str!("profiles/reduced-cpu-profile.conf");
const REDUCED_MEMORY_PROFILE: &str = include_str!("profiles/reduced-memory-profile.conf");

/// Selector for the full built-in profile.
pub const PROFILE_SELECTOR: &str = "profile";
/// Selector for the embedded reduced profile.
pub const REDUCED_PROFILE_SELECTOR: &str = "profile_without_env_data";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProfileDefinitionError {
    #[error("unable to read profile definition {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: &'static str },
}

/// A built-in async-profiler option set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltInProfile {
    /// Low-overhead CPU sampling.
    Default,
    /// CPU, allocation and lock sampling. This is the fallback profile.
    Profile,
}

impl BuiltInProfile {
    fn from_selector(selector: &str) -> Option<Self> {
        match selector {
            "default" => Some(BuiltInProfile::Default),
            PROFILE_SELECTOR => Some(BuiltInProfile::Profile),
            _ => None,
        }
    }

    fn options(&self) -> Vec<ProfileOption> {
        let pairs: &[(&str, &str)] = match self {
            BuiltInProfile::Default => &[("event", "cpu"), ("interval", "20ms")],
            BuiltInProfile::Profile => &[
                ("event", "cpu"),
                ("interval", "10ms"),
                ("alloc", "512k"),
                ("lock", "10ms"),
            ],
        };
        pairs
            .iter()
            .map(|(key, value)| ProfileOption {
                key: (*key).to_owned(),
                value: Some((*value).to_owned()),
            })
            .collect()
    }
}

/// One of the profile definitions bundled with the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducedProfile {
    Cpu,
    Memory,
}

impl ReducedProfile {
    fn for_trigger(trigger: AlertMetricType) -> Self {
        match trigger {
            AlertMetricType::Memory => ReducedProfile::Memory,
            AlertMetricType::Cpu | AlertMetricType::Manual | AlertMetricType::Periodic => {
                ReducedProfile::Cpu
            }
        }
    }

    fn resource(&self) -> &'static str {
        match self {
            ReducedProfile::Cpu => REDUCED_CPU_PROFILE,
            ReducedProfile::Memory => REDUCED_MEMORY_PROFILE,
        }
    }
}

/// A single `key=value` (or bare `key`) async-profiler option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileOption {
    pub key: String,
    pub value: Option<String>,
}

impl fmt::Display for ProfileOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

/// The options a recording is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingConfiguration {
    BuiltIn(BuiltInProfile),
    Reduced {
        profile: ReducedProfile,
        options: Vec<ProfileOption>,
    },
    CustomFile {
        path: PathBuf,
        options: Vec<ProfileOption>,
    },
}

impl Default for RecordingConfiguration {
    fn default() -> Self {
        RecordingConfiguration::BuiltIn(BuiltInProfile::Profile)
    }
}

impl RecordingConfiguration {
    /// Resolve `selector` for a recording triggered by `trigger`.
    pub fn resolve(trigger: AlertMetricType, selector: &str) -> Self {
        match Self::try_resolve(trigger, selector) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(
                    ?err,
                    %trigger,
                    selector,
                    "failed to load profile definition, using default profile"
                );
                RecordingConfiguration::default()
            }
        }
    }

    fn try_resolve(
        trigger: AlertMetricType,
        selector: &str,
    ) -> Result<Self, ProfileDefinitionError> {
        let selector = selector.trim();
        if let Some(builtin) = BuiltInProfile::from_selector(selector) {
            return Ok(RecordingConfiguration::BuiltIn(builtin));
        }
        if selector == REDUCED_PROFILE_SELECTOR {
            let profile = ReducedProfile::for_trigger(trigger);
            return Ok(RecordingConfiguration::Reduced {
                profile,
                options: parse_profile_definition(profile.resource())?,
            });
        }
        let path = Path::new(selector);
        let contents =
            std::fs::read_to_string(path).map_err(|source| ProfileDefinitionError::Read {
                path: path.to_owned(),
                source,
            })?;
        Ok(RecordingConfiguration::CustomFile {
            path: path.to_owned(),
            options: parse_profile_definition(&contents)?,
        })
    }

    pub fn options(&self) -> Vec<ProfileOption> {
        match self {
            RecordingConfiguration::BuiltIn(builtin) => builtin.options(),
            RecordingConfiguration::Reduced { options, .. }
            | RecordingConfiguration::CustomFile { options, .. } => options.clone(),
        }
    }

    /// Render the async-profiler argument string for a JFR recording
    /// written to `jfr_file_path`.
    pub fn to_args_string(&self, jfr_file_path: &Path) -> String {
        let mut args = format!("jfr,file={}", jfr_file_path.display());
        for option in self.options() {
            args.push(',');
            args.push_str(&option.to_string());
        }
        args
    }
}

/// Parse a profile definition: one option per line, `#` comments.
pub fn parse_profile_definition(
    contents: &str,
) -> Result<Vec<ProfileOption>, ProfileDefinitionError> {
    let mut options = vec![];
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parse_error = |reason| ProfileDefinitionError::Parse {
            line: idx + 1,
            reason,
        };
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (line, None),
        };
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(parse_error("invalid option name"));
        }
        if let Some(value) = value {
            if value.is_empty() {
                return Err(parse_error("empty option value"));
            }
            if value.contains(',') || value.chars().any(char::is_whitespace) {
                return Err(parse_error("option value contains a separator"));
            }
        }
        options.push(ProfileOption {
            key: key.to_owned(),
            value: value.map(str::to_owned),
        });
    }
    Ok(options)
}
