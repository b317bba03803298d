// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, path::Path};

use async_trait::async_trait;

use crate::alert::AlertBreach;

pub mod local;
pub mod multi;
pub mod upload;

/// Receives every artifact the capture engine dumps.
///
/// The engine deletes the file once `receive` returns, so handlers must be
/// done with it by then.
#[async_trait]
pub trait ProfileHandler: fmt::Debug + Send + Sync {
    /// `timestamp` is the start of the recording, in milliseconds since the
    /// Unix epoch.
    async fn receive(
        &self,
        breach: &AlertBreach,
        timestamp: i64,
        file: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
