// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## Service profiler agent
//! An in-process agent that captures a profile of the application using [async-profiler] whenever an
//! alert fires, and uploads it to a profile store.
//!
//! [async-profiler]: https://github.com/async-profiler/async-profiler
//!
//! ### OS/CPU Support
//!
//! This agent currently only supports Linux, on either x86-64 or aarch64.
//!
//! ### Usage
//!
//! An [`AlertBreach`] (CPU, memory, manual or periodic) delivered to the [`CaptureEngine`] starts a
//! recording, unless one is already in progress, in which case the breach is dropped. After the breach's
//! profile duration the recording is dumped to a JFR file and handed to a [`ProfileHandler`], after which
//! the file is deleted.
//!
//! When initialized, the engine [dlopen(3)]'s `libasyncProfiler.so`, first through the loader search
//! path[^1] and then under `$ASYNC_PROFILER_HOME/lib`, and returns an [`Err`] if neither works.
//!
//! [^1]: the dlopen search path includes RPATH and LD_LIBRARY_PATH, but *not* the current directory to avoid current directory attacks.
//!
//! [dlopen(3)]: https://linux.die.net/man/3/dlopen
//!
//! You can use the [`UploadingProfileHandler`] to upload the profiles, as follows:
//!
#![cfg_attr(feature = "http", doc = "```no_run")]
#![cfg_attr(not(feature = "http"), doc = "```compile_fail")]
//! # use std::{sync::Arc, time::Duration};
//! # use service_profiler_agent::{
//! #     alert::{AlertBreach, AlertConfiguration, AlertMetricType},
//! #     config::ProfilerConfig,
//! #     handler::upload::UploadingProfileHandler,
//! #     metadata::HostMetadata,
//! #     profiler::{CaptureEngineBuilder, InitializeError},
//! #     scheduler::Scheduler,
//! #     service::ProfilerService,
//! #     upload::{http::{HttpBlockBlobUploader, HttpServiceProfilerClient}, UploadService},
//! # };
//! # #[tokio::main]
//! # async fn main() -> Result<(), InitializeError> {
//! let config = ProfilerConfig {
//!     role_name: Some("checkout".to_owned()),
//!     ..Default::default()
//! }
//! .with_env_overrides();
//!
//! let endpoint = url::Url::parse("https://profiler.example.com/").unwrap();
//! let client = HttpServiceProfilerClient::new(endpoint, "<your instrumentation key>");
//! let upload_service = UploadService::new(
//!     Arc::new(client),
//!     Arc::new(HttpBlockBlobUploader::default()),
//!     || Some("<your app id>".to_owned()),
//!     HostMetadata::detect(config.machine_name.clone(), config.role_name.clone()),
//! )
//! .with_retain_artifacts(config.retain_artifacts)
//! .with_alternate_upload_url(config.alternate_upload_url.clone());
//!
//! let service = ProfilerService::start(
//!     CaptureEngineBuilder::default().with_config(config).build(),
//!     UploadingProfileHandler::new(upload_service),
//!     Scheduler::current(),
//! )
//! .await?;
//!
//! service.accept(AlertBreach::new(
//!     AlertMetricType::Manual,
//!     AlertConfiguration {
//!         profile_duration: Duration::from_secs(30),
//!         cooldown: Duration::from_secs(120),
//!     },
//! ));
//! # Ok(())
//! # }
//! ```
//!
//! An upload gzips the JFR file next to it, asks the profile store for a short-lived upload pass, transfers
//! the compressed file in 8 MiB blocks and commits it. The compressed file is deleted whatever the outcome.
//! Setting `SERVICE_PROFILER_RETAIN_JFR_FILE=true` (see [`ProfilerConfig::with_env_overrides`]) keeps
//! the files on disk for debugging.
//!
//! In addition to the uploading handler, this crate also includes [`LocalProfileHandler`] that copies the
//! profiles into a directory, and a [`MultiProfileHandler`] that passes each profile to several handlers
//! and reports their failures together. You can also write your own handler (via the [`ProfileHandler`]
//! trait).
//!
//! [`AlertBreach`]: alert::AlertBreach
//! [`CaptureEngine`]: profiler::CaptureEngine
//! [`ProfileHandler`]: handler::ProfileHandler
//! [`UploadingProfileHandler`]: handler::upload::UploadingProfileHandler
//! [`LocalProfileHandler`]: handler::local::LocalProfileHandler
//! [`MultiProfileHandler`]: handler::multi::MultiProfileHandler
//! [`ProfilerConfig::with_env_overrides`]: config::ProfilerConfig::with_env_overrides
//!
//! #### Sample program
//!
//! You can test the agent by using the sample program, for example:
//!
//! ```notrust
//! LD_LIBRARY_PATH=/path/to/async-profiler/lib cargo run --release --example simple -- --output-dir profiles --every 1m
//! ```
//!
//! ### Periodic capture
//!
//! Besides alerts, the engine can capture a profile at a fixed interval. This is disabled by default; it is
//! enabled by [`PeriodicCapturePolicy`] and only runs while the settings pushed by the profile store (see
//! [`CaptureEngine::update_configuration`]) enable profiling.
//!
//! [`PeriodicCapturePolicy`]: config::PeriodicCapturePolicy
//! [`CaptureEngine::update_configuration`]: profiler::CaptureEngine::update_configuration
mod asprof;

pub mod alert;
pub mod config;
pub mod handler;
pub mod metadata;
pub mod profiler;
pub mod recorder;
pub mod scheduler;
pub mod service;
pub mod upload;
