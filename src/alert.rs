// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Breach events delivered by the alerting subsystem.

use std::{fmt, time::Duration};

use uuid::Uuid;

/// What caused a capture to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertMetricType {
    /// CPU usage crossed its threshold.
    Cpu,
    /// Memory usage crossed its threshold.
    Memory,
    /// A user asked for a profile.
    Manual,
    /// The periodic capture policy fired.
    Periodic,
}

impl AlertMetricType {
    /// The trigger name reported alongside the uploaded profile.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetricType::Cpu => "CPU",
            AlertMetricType::Memory => "MEMORY",
            AlertMetricType::Manual => "MANUAL",
            AlertMetricType::Periodic => "PERIODIC",
        }
    }
}

impl fmt::Display for AlertMetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture parameters attached to a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertConfiguration {
    /// How long the recording runs before it is stopped and uploaded.
    pub profile_duration: Duration,
    /// Minimum time the alerting side waits before firing the same alert again.
    pub cooldown: Duration,
}

/// A request to capture a profile. Consumed exactly once by the capture engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertBreach {
    /// The kind of trigger.
    pub metric_type: AlertMetricType,
    /// Identifier carried through to the uploaded artifact.
    pub profile_id: Uuid,
    /// CPU usage observed when the breach fired.
    pub cpu_metric: f64,
    /// Memory usage observed when the breach fired.
    pub memory_usage: f64,
    /// Capture parameters.
    pub alert_configuration: AlertConfiguration,
}

impl AlertBreach {
    /// A breach with a fresh profile id and no observed usage, as used for
    /// manual and periodic captures.
    pub fn new(metric_type: AlertMetricType, alert_configuration: AlertConfiguration) -> Self {
        AlertBreach {
            metric_type,
            profile_id: Uuid::new_v4(),
            cpu_metric: 0.0,
            memory_usage: 0.0,
            alert_configuration,
        }
    }
}
