// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local configuration of the capture subsystem, and the settings the
//! profile store pushes to it.

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    alert::{AlertConfiguration, AlertMetricType},
    recorder::config::PROFILE_SELECTOR,
};

/// Set to `true` to keep artifacts on disk after they were uploaded.
pub const RETAIN_JFR_FILE_ENV: &str = "SERVICE_PROFILER_RETAIN_JFR_FILE";

/// Configuration of the capture engine and its uploads.
///
/// Every field has a default, so a partial document deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfilerConfig {
    /// Where recordings are dumped. Created on demand.
    pub temporary_directory: PathBuf,
    /// Keep artifacts on disk after they were handled, for debugging.
    pub retain_artifacts: bool,
    /// Also upload every compressed artifact to this URL.
    pub alternate_upload_url: Option<String>,
    /// Recording configuration selector for CPU breaches.
    pub cpu_trigger_settings: String,
    /// Recording configuration selector for memory breaches.
    pub memory_trigger_settings: String,
    /// Recording configuration selector for manual requests.
    pub manual_trigger_settings: String,
    /// Recording configuration selector for periodic captures.
    pub periodic_trigger_settings: String,
    pub periodic: PeriodicCapturePolicy,
    /// Attached to uploads as the `RoleName` tag when set.
    pub role_name: Option<String>,
    /// Overrides the detected host name.
    pub machine_name: Option<String>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            temporary_directory: std::env::temp_dir().join("service-profiler"),
            retain_artifacts: false,
            alternate_upload_url: None,
            cpu_trigger_settings: PROFILE_SELECTOR.to_owned(),
            memory_trigger_settings: PROFILE_SELECTOR.to_owned(),
            manual_trigger_settings: PROFILE_SELECTOR.to_owned(),
            periodic_trigger_settings: PROFILE_SELECTOR.to_owned(),
            periodic: PeriodicCapturePolicy::default(),
            role_name: None,
            machine_name: None,
        }
    }
}

impl ProfilerConfig {
    /// Apply the overrides found in the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(retain) = lookup(RETAIN_JFR_FILE_ENV) {
            self.retain_artifacts = retain.trim().eq_ignore_ascii_case("true");
        }
        self
    }

    /// The recording configuration selector for a trigger type.
    pub fn trigger_settings(&self, trigger: AlertMetricType) -> &str {
        match trigger {
            AlertMetricType::Cpu => &self.cpu_trigger_settings,
            AlertMetricType::Memory => &self.memory_trigger_settings,
            AlertMetricType::Manual => &self.manual_trigger_settings,
            AlertMetricType::Periodic => &self.periodic_trigger_settings,
        }
    }
}

/// Whether and how often to capture a profile without any breach.
///
/// Disabled by default. Only takes effect once the profile store's settings
/// enable profiling too, see [`CaptureEngine::update_configuration`].
///
/// [`CaptureEngine::update_configuration`]: crate::profiler::CaptureEngine::update_configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeriodicCapturePolicy {
    pub enabled: bool,
    /// Time between the starts of two periodic captures.
    pub interval_seconds: u64,
    /// Length of each periodic capture.
    pub duration_seconds: u64,
}

impl Default for PeriodicCapturePolicy {
    fn default() -> Self {
        PeriodicCapturePolicy {
            enabled: false,
            interval_seconds: 3600,
            duration_seconds: 120,
        }
    }
}

impl PeriodicCapturePolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn alert_configuration(&self) -> AlertConfiguration {
        AlertConfiguration {
            profile_duration: Duration::from_secs(self.duration_seconds),
            cooldown: self.interval(),
        }
    }
}

/// Settings pushed by the profile store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerSettings {
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub collection_plan: Option<String>,
}
