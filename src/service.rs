// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the capture subsystem.

use std::sync::Arc;

use crate::{
    alert::AlertBreach,
    config::ProfilerSettings,
    handler::ProfileHandler,
    profiler::{CaptureEngine, InitializeError},
    scheduler::Scheduler,
};

/// A running [`CaptureEngine`] together with the scheduler it runs on.
#[derive(Debug)]
pub struct ProfilerService {
    engine: CaptureEngine,
    scheduler: Scheduler,
}

impl ProfilerService {
    /// Initialize `engine` on `scheduler`. If no connection to the profiler
    /// can be made, the scheduler is shut down before the error is returned.
    pub async fn start(
        engine: CaptureEngine,
        handler: impl ProfileHandler + 'static,
        scheduler: Scheduler,
    ) -> Result<Self, InitializeError> {
        match engine.initialize(Arc::new(handler), scheduler.clone()) {
            Ok(()) => {
                tracing::info!("profiler service started");
                Ok(ProfilerService { engine, scheduler })
            }
            Err(err) => {
                scheduler.shutdown().await;
                Err(err)
            }
        }
    }

    pub fn engine(&self) -> &CaptureEngine {
        &self.engine
    }

    /// See [`CaptureEngine::accept`].
    pub fn accept(&self, breach: AlertBreach) {
        self.engine.accept(breach);
    }

    /// See [`CaptureEngine::update_configuration`].
    pub fn update_configuration(&self, settings: &ProfilerSettings) {
        self.engine.update_configuration(settings);
    }

    /// Abort all scheduled work, including any in-flight capture cycle.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        tracing::info!("profiler service stopped");
    }
}
