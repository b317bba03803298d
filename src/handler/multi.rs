// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{error::Error, fmt, path::Path};

use async_trait::async_trait;
use thiserror::Error;

use crate::alert::AlertBreach;

use super::ProfileHandler;

type HandlerError = Box<dyn Error + Send + Sync>;

/// Some of the handlers of a [`MultiProfileHandler`] failed.
#[derive(Debug, Error)]
#[error("{} of {handlers} profile handlers failed: {}", .errors.len(), Joined(.errors))]
pub struct MultiProfileHandlerError {
    /// Number of handlers the artifact was passed to.
    pub handlers: usize,
    /// The error of every handler that failed, in handler order.
    pub errors: Vec<HandlerError>,
}

struct Joined<'a>(&'a [HandlerError]);

impl fmt::Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Passes each artifact to several handlers concurrently.
///
/// The artifact is only deleted once `receive` returns, so every handler
/// sees the file however long the others take. A failing handler does not
/// stop the others, and the failures of all of them are reported together
/// as a [`MultiProfileHandlerError`].
#[derive(Debug)]
pub struct MultiProfileHandler {
    handlers: Vec<Box<dyn ProfileHandler>>,
}

impl MultiProfileHandler {
    pub fn new(handlers: Vec<Box<dyn ProfileHandler>>) -> Self {
        MultiProfileHandler { handlers }
    }
}

#[async_trait]
impl ProfileHandler for MultiProfileHandler {
    async fn receive(
        &self,
        breach: &AlertBreach,
        timestamp: i64,
        file: &Path,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let results = futures::future::join_all(
            self.handlers
                .iter()
                .map(|handler| handler.receive(breach, timestamp, file)),
        )
        .await;
        let errors: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            failed = errors.len(),
            handlers = self.handlers.len(),
            "profile handlers failed"
        );
        Err(Box::new(MultiProfileHandlerError {
            handlers: self.handlers.len(),
            errors,
        }))
    }
}
