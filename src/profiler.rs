// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    alert::{AlertBreach, AlertMetricType},
    config::{ProfilerConfig, ProfilerSettings},
    handler::ProfileHandler,
    recorder::{
        default_strategies, ConnectionStrategy, ConnectionUnavailable, RecorderConnection,
        RecordingConfiguration, RecordingError, RecordingHandle,
    },
    scheduler::Scheduler,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::{
    io,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::task::AbortHandle;

/// Where the engine is in a capture cycle.
///
/// Every cycle, whether it succeeds or fails at any step, ends in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// A recording was opened and is being started.
    Starting,
    Recording,
    /// The stop callback is running.
    Stopping,
    Dumped,
    /// The artifact is with the profile handler.
    Uploading,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitializeError {
    #[error("capture engine is already initialized")]
    AlreadyInitialized,
    #[error("unable to connect to the profiler, {} strategies tried", .failures.len())]
    NoConnection { failures: Vec<ConnectionUnavailable> },
}

/// Why a capture cycle did not produce an artifact.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("capture engine is not initialized")]
    NotInitialized,
    #[error("a profile is already in progress")]
    RecordingAlreadyActive,
    #[error("failed to start recording: {0}")]
    RecordingStartFailed(#[source] RecordingError),
    #[error("failed to create temporary directory {path}: {source}")]
    TemporaryDirectory { path: PathBuf, source: io::Error },
    #[error("failed to dump recording: {0}")]
    DumpFailed(#[source] RecordingError),
    #[error("profile handler failed: {0}")]
    HandlerFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Builds a [`CaptureEngine`].
#[derive(Debug, Default)]
pub struct CaptureEngineBuilder {
    config: Option<ProfilerConfig>,
    strategies: Option<Vec<Box<dyn ConnectionStrategy>>>,
}

impl CaptureEngineBuilder {
    /// Sets the configuration. Defaults to [`ProfilerConfig::default`].
    pub fn with_config(mut self, config: ProfilerConfig) -> CaptureEngineBuilder {
        self.config = Some(config);
        self
    }

    /// Sets the connection strategies, tried in order. Defaults to
    /// [`default_strategies`].
    pub fn with_strategies(
        mut self,
        strategies: Vec<Box<dyn ConnectionStrategy>>,
    ) -> CaptureEngineBuilder {
        self.strategies = Some(strategies);
        self
    }

    /// Build the engine. The recording configuration of every trigger type
    /// is resolved here.
    pub fn build(self) -> CaptureEngine {
        let config = self.config.unwrap_or_default();
        let recording_configs = RecordingConfigurations::resolve(&config);
        CaptureEngine {
            inner: Arc::new(EngineInner {
                config,
                recording_configs,
                strategies: self.strategies.unwrap_or_else(default_strategies),
                runtime: OnceLock::new(),
                state: Mutex::new(CaptureState::Idle),
                periodic_job: Mutex::new(None),
            }),
        }
    }
}

#[derive(Debug)]
struct RecordingConfigurations {
    cpu: RecordingConfiguration,
    memory: RecordingConfiguration,
    manual: RecordingConfiguration,
    periodic: RecordingConfiguration,
}

impl RecordingConfigurations {
    fn resolve(config: &ProfilerConfig) -> Self {
        let resolve = |trigger| {
            RecordingConfiguration::resolve(trigger, config.trigger_settings(trigger))
        };
        RecordingConfigurations {
            cpu: resolve(AlertMetricType::Cpu),
            memory: resolve(AlertMetricType::Memory),
            manual: resolve(AlertMetricType::Manual),
            periodic: resolve(AlertMetricType::Periodic),
        }
    }

    fn for_trigger(&self, trigger: AlertMetricType) -> &RecordingConfiguration {
        match trigger {
            AlertMetricType::Cpu => &self.cpu,
            AlertMetricType::Memory => &self.memory,
            AlertMetricType::Manual => &self.manual,
            AlertMetricType::Periodic => &self.periodic,
        }
    }
}

#[derive(Debug)]
struct EngineRuntime {
    connection: Arc<dyn RecorderConnection>,
    handler: Arc<dyn ProfileHandler>,
    scheduler: Scheduler,
}

#[derive(Debug)]
struct EngineInner {
    config: ProfilerConfig,
    recording_configs: RecordingConfigurations,
    strategies: Vec<Box<dyn ConnectionStrategy>>,
    // set once by initialize
    runtime: OnceLock<EngineRuntime>,
    // the single-flight slot
    state: Mutex<CaptureState>,
    periodic_job: Mutex<Option<AbortHandle>>,
}

impl EngineInner {
    fn lock_state(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the single-flight slot for one capture cycle and releases it when
/// dropped, however the cycle ends.
struct ActiveRecording {
    inner: Arc<EngineInner>,
}

impl ActiveRecording {
    fn set(&self, state: CaptureState) {
        *self.inner.lock_state() = state;
    }
}

impl Drop for ActiveRecording {
    fn drop(&mut self) {
        *self.inner.lock_state() = CaptureState::Idle;
        tracing::debug!("active recording cleared");
    }
}

/// A dumped recording, removed from disk when dropped unless retained.
struct ArtifactFile {
    path: PathBuf,
    retain: bool,
}

impl Drop for ArtifactFile {
    fn drop(&mut self) {
        let path = self.path.display();
        if self.retain {
            if self.path.exists() {
                tracing::info!(%path, "JFR file retained");
            }
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(%path, "JFR file removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::error!(?err, %path, "failed to remove file"),
        }
    }
}

/// Wall clock at the start of a recording, advanced by the monotonic clock.
#[derive(Debug, Clone, Copy)]
struct RecordingClock {
    start: DateTime<Utc>,
    instant: tokio::time::Instant,
}

impl RecordingClock {
    fn start() -> Self {
        RecordingClock {
            start: Utc::now(),
            instant: tokio::time::Instant::now(),
        }
    }

    fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.instant.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.start_millis().saturating_add(elapsed)
    }
}

/// Captures profiles when breaches arrive and hands the artifacts to a
/// [`ProfileHandler`].
///
/// At most one recording is in flight at any time: breaches arriving while
/// a capture cycle runs are dropped. A cycle records for the breach's
/// profile duration, dumps the recording to
/// `<temporary directory>/recording_<start millis>-<end millis>.jfr`, passes
/// the file to the handler and then deletes it.
///
/// Cloning the engine is cheap and shares its state.
#[derive(Debug, Clone)]
pub struct CaptureEngine {
    inner: Arc<EngineInner>,
}

impl CaptureEngine {
    /// Connect to the profiler using the first connection strategy that
    /// succeeds. On error the engine stays unusable, and the caller is
    /// expected to shut down `scheduler`.
    pub fn initialize(
        &self,
        handler: Arc<dyn ProfileHandler>,
        scheduler: Scheduler,
    ) -> Result<(), InitializeError> {
        if self.inner.runtime.get().is_some() {
            return Err(InitializeError::AlreadyInitialized);
        }
        let mut failures = vec![];
        for strategy in &self.inner.strategies {
            match strategy.connect() {
                Ok(connection) => {
                    tracing::info!(strategy = strategy.name(), "connected to the profiler");
                    return self
                        .inner
                        .runtime
                        .set(EngineRuntime {
                            connection,
                            handler,
                            scheduler,
                        })
                        .map_err(|_| InitializeError::AlreadyInitialized);
                }
                Err(err) => {
                    tracing::warn!(%err, "connection strategy unavailable");
                    failures.push(err);
                }
            }
        }
        tracing::error!("failed to connect to the profiler");
        Err(InitializeError::NoConnection { failures })
    }

    /// The state of the current capture cycle.
    pub fn state(&self) -> CaptureState {
        *self.inner.lock_state()
    }

    /// Dispatch a breach to the action for its trigger type. Returns as soon
    /// as the recording is opened, or the breach dropped.
    pub fn accept(&self, breach: AlertBreach) {
        match breach.metric_type {
            AlertMetricType::Cpu => self.perform_cpu_profile(breach),
            AlertMetricType::Memory => self.perform_memory_profile(breach),
            AlertMetricType::Manual => self.perform_manual_profile(breach),
            AlertMetricType::Periodic => self.perform_periodic_profile(breach),
        }
    }

    fn perform_cpu_profile(&self, breach: AlertBreach) {
        tracing::info!(
            profile_id = %breach.profile_id,
            cpu = breach.cpu_metric,
            "received CPU alert, profiling"
        );
        let duration = breach.alert_configuration.profile_duration;
        self.profile_and_upload(breach, duration);
    }

    fn perform_memory_profile(&self, breach: AlertBreach) {
        tracing::info!(
            profile_id = %breach.profile_id,
            memory = breach.memory_usage,
            "received memory alert, profiling"
        );
        let duration = breach.alert_configuration.profile_duration;
        self.profile_and_upload(breach, duration);
    }

    fn perform_manual_profile(&self, breach: AlertBreach) {
        tracing::info!(profile_id = %breach.profile_id, "received manual alert, profiling");
        let duration = breach.alert_configuration.profile_duration;
        self.profile_and_upload(breach, duration);
    }

    fn perform_periodic_profile(&self, breach: AlertBreach) {
        tracing::info!(profile_id = %breach.profile_id, "received periodic profile request");
        let duration = breach.alert_configuration.profile_duration;
        self.profile_and_upload(breach, duration);
    }

    fn profile_and_upload(&self, breach: AlertBreach, duration: Duration) {
        match self.start_recording(breach.metric_type) {
            Ok((handle, active)) => {
                let Some(runtime) = self.inner.runtime.get() else {
                    return;
                };
                let engine = self.clone();
                let spawned = runtime.scheduler.spawn(async move {
                    engine.execute_profile(breach, duration, handle, active).await;
                });
                if spawned.is_none() {
                    tracing::warn!("scheduler is shut down, recording abandoned");
                }
            }
            Err(err @ CaptureError::RecordingAlreadyActive) => {
                tracing::warn!(
                    %err,
                    profile_id = %breach.profile_id,
                    "alert received, however a profile is already in progress, ignoring request"
                );
            }
            Err(err) => {
                tracing::error!(?err, profile_id = %breach.profile_id, "unable to start profile");
            }
        }
    }

    /// The single-flight check: opens a recording and claims the slot if it
    /// is idle. Never performs I/O.
    fn start_recording(
        &self,
        trigger: AlertMetricType,
    ) -> Result<(Box<dyn RecordingHandle>, ActiveRecording), CaptureError> {
        let runtime = self
            .inner
            .runtime
            .get()
            .ok_or(CaptureError::NotInitialized)?;
        let mut state = self.inner.lock_state();
        if *state != CaptureState::Idle {
            return Err(CaptureError::RecordingAlreadyActive);
        }
        let config = self.inner.recording_configs.for_trigger(trigger);
        let handle = runtime
            .connection
            .open_recording(config)
            .map_err(CaptureError::RecordingStartFailed)?;
        *state = CaptureState::Starting;
        Ok((
            handle,
            ActiveRecording {
                inner: self.inner.clone(),
            },
        ))
    }

    /// Start the recording and schedule its stop.
    async fn execute_profile(
        self,
        breach: AlertBreach,
        duration: Duration,
        mut handle: Box<dyn RecordingHandle>,
        active: ActiveRecording,
    ) {
        let Some(runtime) = self.inner.runtime.get() else {
            return;
        };
        let clock = RecordingClock::start();
        if let Err(err) = handle.start().await {
            tracing::error!(?err, "failed to start recording");
            close_recording(handle).await;
            return;
        }
        active.set(CaptureState::Recording);
        tracing::info!(?duration, profile_id = %breach.profile_id, "recording started");

        let engine = self.clone();
        let scheduled = runtime.scheduler.schedule(duration, async move {
            engine.stop_and_upload(breach, handle, clock, active).await;
        });
        if scheduled.is_none() {
            tracing::warn!("scheduler is shut down, recording abandoned");
        }
    }

    /// The stop callback. Runs every cleanup step whatever happened before,
    /// and only then re-raises a panic.
    async fn stop_and_upload(
        self,
        breach: AlertBreach,
        mut handle: Box<dyn RecordingHandle>,
        clock: RecordingClock,
        active: ActiveRecording,
    ) {
        tracing::info!("closing and uploading recording");
        active.set(CaptureState::Stopping);
        // removes the dump even if this task is aborted
        let artifact = ArtifactFile {
            path: self.inner.config.temporary_directory.join(format!(
                "recording_{}-{}.jfr",
                clock.start_millis(),
                clock.now_millis()
            )),
            retain: self.inner.config.retain_artifacts,
        };

        let outcome = AssertUnwindSafe(self.dump_and_hand_off(
            &breach,
            &mut *handle,
            clock.start_millis(),
            &artifact.path,
            &active,
        ))
        .catch_unwind()
        .await;
        match &outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(?err, "failed to upload recording"),
            Err(_) => tracing::error!("failed to upload recording, non-recoverable error"),
        }

        close_recording(handle).await;
        drop(artifact);
        drop(active);

        if let Err(panic) = outcome {
            std::panic::resume_unwind(panic);
        }
    }

    async fn dump_and_hand_off(
        &self,
        breach: &AlertBreach,
        handle: &mut dyn RecordingHandle,
        timestamp: i64,
        file: &Path,
        active: &ActiveRecording,
    ) -> Result<(), CaptureError> {
        let runtime = self
            .inner
            .runtime
            .get()
            .ok_or(CaptureError::NotInitialized)?;
        let directory = &self.inner.config.temporary_directory;
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|source| CaptureError::TemporaryDirectory {
                path: directory.clone(),
                source,
            })?;
        handle.dump(file).await.map_err(CaptureError::DumpFailed)?;
        active.set(CaptureState::Dumped);
        tracing::debug!(file = %file.display(), "recording dumped");

        active.set(CaptureState::Uploading);
        runtime
            .handler
            .receive(breach, timestamp, file)
            .await
            .map_err(CaptureError::HandlerFailed)
    }

    /// Apply settings pushed by the profile store.
    ///
    /// When both the local periodic capture policy and the pushed settings
    /// are enabled, a periodic capture is (re)scheduled, replacing any
    /// earlier one. Otherwise any periodic capture is cancelled.
    pub fn update_configuration(&self, settings: &ProfilerSettings) {
        tracing::debug!(last_modified = %settings.last_modified, "received profiler settings");
        let policy = self.inner.config.periodic;
        let mut job = self
            .inner
            .periodic_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = job.take() {
            previous.abort();
        }
        if !(policy.enabled && settings.enabled) {
            return;
        }
        if policy.interval().is_zero() {
            tracing::warn!("periodic capture interval is zero, not scheduling periodic profiles");
            return;
        }
        let Some(runtime) = self.inner.runtime.get() else {
            tracing::warn!("capture engine is not initialized, not scheduling periodic profiles");
            return;
        };
        let engine = self.clone();
        tracing::info!(interval = ?policy.interval(), "scheduling periodic profiles");
        *job = runtime.scheduler.schedule_at_fixed_rate(
            policy.interval(),
            policy.interval(),
            move || {
                engine.accept(AlertBreach::new(
                    AlertMetricType::Periodic,
                    policy.alert_configuration(),
                ))
            },
        );
    }
}

/// Stop and close a recording, logging failures.
async fn close_recording(mut handle: Box<dyn RecordingHandle>) {
    if let Err(err) = handle.stop().await {
        tracing::error!(?err, "failed to stop recording");
    }
    if let Err(err) = handle.close().await {
        tracing::error!(?err, "failed to close recording");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{self, AtomicU32};

    use async_trait::async_trait;
    use test_case::test_case;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        alert::AlertConfiguration,
        config::PeriodicCapturePolicy,
        handler::multi::MultiProfileHandler,
        recorder::config::{ReducedProfile, REDUCED_PROFILE_SELECTOR},
    };

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum Failure {
        #[default]
        None,
        Open,
        Start,
        Dump,
        DumpPanic,
    }

    #[derive(Debug, Default)]
    struct MockConnection {
        failure: Failure,
        events: Arc<Mutex<Vec<String>>>,
        configs: Mutex<Vec<RecordingConfiguration>>,
    }

    impl MockConnection {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl RecorderConnection for MockConnection {
        fn open_recording(
            &self,
            config: &RecordingConfiguration,
        ) -> Result<Box<dyn RecordingHandle>, RecordingError> {
            self.events.lock().unwrap().push("open".into());
            if self.failure == Failure::Open {
                return Err(RecordingError::NotRunning);
            }
            self.configs.lock().unwrap().push(config.clone());
            Ok(Box::new(MockRecording {
                failure: self.failure,
                events: self.events.clone(),
            }))
        }
    }

    #[derive(Debug)]
    struct MockRecording {
        failure: Failure,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl MockRecording {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    #[async_trait]
    impl RecordingHandle for MockRecording {
        async fn start(&mut self) -> Result<(), RecordingError> {
            self.push("start");
            if self.failure == Failure::Start {
                return Err(RecordingError::Io(io::Error::other("start failed")));
            }
            Ok(())
        }

        async fn dump(&mut self, path: &Path) -> Result<(), RecordingError> {
            self.push("dump");
            match self.failure {
                Failure::Dump => Err(RecordingError::NotRunning),
                Failure::DumpPanic => panic!("profiler crashed"),
                _ => {
                    std::fs::write(path, b"JFR")?;
                    Ok(())
                }
            }
        }

        async fn stop(&mut self) -> Result<(), RecordingError> {
            self.push("stop");
            Ok(())
        }

        async fn close(&mut self) -> Result<(), RecordingError> {
            self.push("close");
            Ok(())
        }
    }

    #[derive(Debug)]
    struct MockStrategy {
        name: String,
        connection: Option<Arc<MockConnection>>,
        attempts: Arc<AtomicU32>,
    }

    impl ConnectionStrategy for MockStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        fn connect(&self) -> Result<Arc<dyn RecorderConnection>, ConnectionUnavailable> {
            self.attempts.fetch_add(1, atomic::Ordering::Relaxed);
            match &self.connection {
                Some(connection) => Ok(connection.clone()),
                None => Err(ConnectionUnavailable {
                    strategy: self.name.clone(),
                    reason: "incompatible".into(),
                }),
            }
        }
    }

    #[derive(Debug)]
    struct Received {
        breach: AlertBreach,
        timestamp: i64,
        file: PathBuf,
        contents: Vec<u8>,
    }

    #[derive(Debug)]
    struct MockHandler {
        fail: bool,
        tx: mpsc::UnboundedSender<Received>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("upload failed")]
    struct HandlerError;

    #[async_trait]
    impl ProfileHandler for MockHandler {
        async fn receive(
            &self,
            breach: &AlertBreach,
            timestamp: i64,
            file: &Path,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let contents = tokio::fs::read(file).await?;
            let _ = self.tx.send(Received {
                breach: breach.clone(),
                timestamp,
                file: file.to_owned(),
                contents,
            });
            if self.fail {
                return Err(Box::new(HandlerError));
            }
            Ok(())
        }
    }

    struct Fixture {
        engine: CaptureEngine,
        connection: Arc<MockConnection>,
        received: mpsc::UnboundedReceiver<Received>,
        dir: tempfile::TempDir,
    }

    fn config(dir: &tempfile::TempDir) -> ProfilerConfig {
        ProfilerConfig {
            temporary_directory: dir.path().join("recordings"),
            ..Default::default()
        }
    }

    fn engine_with_handler(
        failure: Failure,
        handler: Arc<dyn ProfileHandler>,
        scheduler: Scheduler,
        configure: impl FnOnce(&mut ProfilerConfig),
    ) -> (CaptureEngine, Arc<MockConnection>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        configure(&mut config);
        let connection = Arc::new(MockConnection {
            failure,
            ..Default::default()
        });
        let engine = CaptureEngineBuilder::default()
            .with_config(config)
            .with_strategies(vec![Box::new(MockStrategy {
                name: "mock".into(),
                connection: Some(connection.clone()),
                attempts: Default::default(),
            })])
            .build();
        engine.initialize(handler, scheduler).unwrap();
        (engine, connection, dir)
    }

    fn make_engine(
        failure: Failure,
        handler_fails: bool,
        configure: impl FnOnce(&mut ProfilerConfig),
    ) -> Fixture {
        let (tx, received) = mpsc::unbounded_channel();
        let handler = Arc::new(MockHandler {
            fail: handler_fails,
            tx,
        });
        let (engine, connection, dir) =
            engine_with_handler(failure, handler, Scheduler::current(), configure);
        Fixture {
            engine,
            connection,
            received,
            dir,
        }
    }

    fn breach(metric_type: AlertMetricType) -> AlertBreach {
        AlertBreach::new(
            metric_type,
            AlertConfiguration {
                profile_duration: Duration::from_secs(30),
                cooldown: Duration::from_secs(120),
            },
        )
    }

    async fn wait_for_idle(engine: &CaptureEngine) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if engine.state() == CaptureState::Idle {
                return;
            }
        }
        panic!("capture engine did not return to idle");
    }

    fn recordings(dir: &tempfile::TempDir) -> Vec<PathBuf> {
        match std::fs::read_dir(dir.path().join("recordings")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => vec![],
        }
    }

    fn parse_file_name(file: &Path) -> (i64, i64) {
        let name = file.file_name().unwrap().to_str().unwrap();
        let times = name
            .strip_prefix("recording_")
            .unwrap()
            .strip_suffix(".jfr")
            .unwrap();
        let (start, end) = times.split_once('-').unwrap();
        (start.parse().unwrap(), end.parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_cycle() {
        let mut fixture = make_engine(Failure::None, false, |_| {});
        let breach = breach(AlertMetricType::Cpu);
        let start = tokio::time::Instant::now();
        fixture.engine.accept(breach.clone());
        assert_eq!(fixture.engine.state(), CaptureState::Starting);

        let received = fixture.received.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(received.breach, breach);
        assert_eq!(received.contents, b"JFR");
        let (recording_start, recording_end) = parse_file_name(&received.file);
        assert_eq!(recording_end - recording_start, 30_000);
        assert_eq!(received.timestamp, recording_start);
        assert_eq!(
            received.file.parent().unwrap(),
            fixture.dir.path().join("recordings")
        );

        wait_for_idle(&fixture.engine).await;
        assert_eq!(
            fixture.connection.events(),
            vec!["open", "start", "dump", "stop", "close"]
        );
        assert!(recordings(&fixture.dir).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let mut fixture = make_engine(Failure::None, false, |_| {});
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        // dropped while starting
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fixture.engine.state(), CaptureState::Recording);
        // dropped while recording
        fixture.engine.accept(breach(AlertMetricType::Memory));
        fixture.engine.accept(breach(AlertMetricType::Manual));

        fixture.received.recv().await.unwrap();
        wait_for_idle(&fixture.engine).await;
        assert_eq!(
            fixture.connection.events(),
            vec!["open", "start", "dump", "stop", "close"]
        );
        assert!(fixture.received.try_recv().is_err());

        // the next breach is accepted again
        fixture.engine.accept(breach(AlertMetricType::Memory));
        let received = fixture.received.recv().await.unwrap();
        assert_eq!(received.breach.metric_type, AlertMetricType::Memory);
        wait_for_idle(&fixture.engine).await;
    }

    #[tokio::test(start_paused = true)]
    #[test_case(Failure::Dump; "dump fails")]
    #[test_case(Failure::DumpPanic; "dump panics")]
    async fn test_cleanup_after_dump_failure(failure: Failure) {
        let mut fixture = make_engine(failure, false, |_| {});
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        wait_for_idle(&fixture.engine).await;
        assert_eq!(
            fixture.connection.events(),
            vec!["open", "start", "dump", "stop", "close"]
        );
        assert!(fixture.received.try_recv().is_err());
        assert!(recordings(&fixture.dir).is_empty());

        // ready for the next breach
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        assert_eq!(fixture.engine.state(), CaptureState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_after_handler_failure() {
        let mut fixture = make_engine(Failure::None, true, |_| {});
        fixture.engine.accept(breach(AlertMetricType::Manual));
        let received = fixture.received.recv().await.unwrap();
        wait_for_idle(&fixture.engine).await;
        assert!(!received.file.exists());
        assert_eq!(
            fixture.connection.events(),
            vec!["open", "start", "dump", "stop", "close"]
        );
    }

    /// Signals when it got the artifact, then never returns.
    #[derive(Debug)]
    struct StuckHandler(mpsc::UnboundedSender<PathBuf>);

    #[async_trait]
    impl ProfileHandler for StuckHandler {
        async fn receive(
            &self,
            _breach: &AlertBreach,
            _timestamp: i64,
            file: &Path,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let _ = self.0.send(file.to_owned());
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    #[test_case(false; "removed")]
    #[test_case(true; "retained")]
    async fn test_shutdown_during_hand_off(retain: bool) {
        let (tx, mut entered) = mpsc::unbounded_channel();
        let scheduler = Scheduler::current();
        let (engine, connection, dir) = engine_with_handler(
            Failure::None,
            Arc::new(StuckHandler(tx)),
            scheduler.clone(),
            |config| config.retain_artifacts = retain,
        );
        engine.accept(breach(AlertMetricType::Cpu));
        let file = entered.recv().await.unwrap();
        assert!(file.exists());
        assert_eq!(engine.state(), CaptureState::Uploading);

        scheduler.shutdown().await;
        assert_eq!(engine.state(), CaptureState::Idle);
        assert_eq!(connection.events(), vec!["open", "start", "dump"]);
        if retain {
            assert_eq!(recordings(&dir), vec![file]);
        } else {
            assert!(recordings(&dir).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_handler_sees_artifact() {
        let (tx, mut received) = mpsc::unbounded_channel();
        let slow = MockHandler {
            fail: true,
            tx: tx.clone(),
        };
        let handler = MultiProfileHandler::new(vec![
            Box::new(DelayedHandler(Duration::from_secs(20), slow)),
            Box::new(MockHandler { fail: false, tx }),
        ]);
        let (engine, _connection, dir) =
            engine_with_handler(Failure::None, Arc::new(handler), Scheduler::current(), |_| {});
        engine.accept(breach(AlertMetricType::Cpu));

        let first = received.recv().await.unwrap();
        let second = received.recv().await.unwrap();
        assert_eq!(first.file, second.file);
        assert_eq!(first.contents, b"JFR");
        assert_eq!(second.contents, b"JFR");
        wait_for_idle(&engine).await;
        assert!(recordings(&dir).is_empty());
    }

    #[derive(Debug)]
    struct DelayedHandler<H>(Duration, H);

    #[async_trait]
    impl<H: ProfileHandler> ProfileHandler for DelayedHandler<H> {
        async fn receive(
            &self,
            breach: &AlertBreach,
            timestamp: i64,
            file: &Path,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            tokio::time::sleep(self.0).await;
            self.1.receive(breach, timestamp, file).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure() {
        let mut fixture = make_engine(Failure::Start, false, |_| {});
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        wait_for_idle(&fixture.engine).await;
        assert_eq!(
            fixture.connection.events(),
            vec!["open", "start", "stop", "close"]
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fixture.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure() {
        let fixture = make_engine(Failure::Open, false, |_| {});
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        assert_eq!(fixture.engine.state(), CaptureState::Idle);
        assert_eq!(fixture.connection.events(), vec!["open"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_artifacts() {
        let mut fixture = make_engine(Failure::None, false, |config| {
            config.retain_artifacts = true;
        });
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        let received = fixture.received.recv().await.unwrap();
        wait_for_idle(&fixture.engine).await;
        assert_eq!(recordings(&fixture.dir), vec![received.file]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_configuration_per_trigger() {
        let mut fixture = make_engine(Failure::None, false, |config| {
            config.memory_trigger_settings = REDUCED_PROFILE_SELECTOR.into();
            config.cpu_trigger_settings = "/nonexistent/profile.conf".into();
        });
        fixture.engine.accept(breach(AlertMetricType::Memory));
        fixture.received.recv().await.unwrap();
        wait_for_idle(&fixture.engine).await;
        fixture.engine.accept(breach(AlertMetricType::Cpu));
        fixture.received.recv().await.unwrap();
        wait_for_idle(&fixture.engine).await;

        let configs = fixture.connection.configs.lock().unwrap();
        assert!(matches!(
            configs[0],
            RecordingConfiguration::Reduced {
                profile: ReducedProfile::Memory,
                ..
            }
        ));
        assert_eq!(configs[1], RecordingConfiguration::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CaptureEngineBuilder::default()
            .with_config(config(&dir))
            .with_strategies(vec![])
            .build();
        engine.accept(breach(AlertMetricType::Cpu));
        assert_eq!(engine.state(), CaptureState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let primary_attempts = Arc::new(AtomicU32::new(0));
        let connection = Arc::new(MockConnection::default());
        let engine = CaptureEngineBuilder::default()
            .with_config(config(&dir))
            .with_strategies(vec![
                Box::new(MockStrategy {
                    name: "primary".into(),
                    connection: None,
                    attempts: primary_attempts.clone(),
                }),
                Box::new(MockStrategy {
                    name: "fallback".into(),
                    connection: Some(connection.clone()),
                    attempts: Default::default(),
                }),
            ])
            .build();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(MockHandler { fail: false, tx });
        engine
            .initialize(handler.clone(), Scheduler::current())
            .unwrap();
        assert_eq!(primary_attempts.load(atomic::Ordering::Relaxed), 1);
        assert!(matches!(
            engine.initialize(handler, Scheduler::current()),
            Err(InitializeError::AlreadyInitialized)
        ));

        engine.accept(breach(AlertMetricType::Cpu));
        rx.recv().await.unwrap();
        assert_eq!(connection.events()[0], "open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_no_connection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CaptureEngineBuilder::default()
            .with_config(config(&dir))
            .with_strategies(vec![
                Box::new(MockStrategy {
                    name: "primary".into(),
                    connection: None,
                    attempts: Default::default(),
                }),
                Box::new(MockStrategy {
                    name: "fallback".into(),
                    connection: None,
                    attempts: Default::default(),
                }),
            ])
            .build();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine
            .initialize(Arc::new(MockHandler { fail: false, tx }), Scheduler::current())
            .unwrap_err();
        let failures = match err {
            InitializeError::NoConnection { failures } => failures,
            err => panic!("unexpected error {err:?}"),
        };
        let strategies: Vec<_> = failures.iter().map(|f| f.strategy.as_str()).collect();
        assert_eq!(strategies, vec!["primary", "fallback"]);
    }

    fn settings(enabled: bool) -> ProfilerSettings {
        ProfilerSettings {
            last_modified: Utc::now(),
            enabled,
            collection_plan: None,
        }
    }

    fn periodic_policy(config: &mut ProfilerConfig) {
        config.periodic = PeriodicCapturePolicy {
            enabled: true,
            interval_seconds: 300,
            duration_seconds: 10,
        };
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_capture() {
        let mut fixture = make_engine(Failure::None, false, periodic_policy);
        let start = tokio::time::Instant::now();
        fixture.engine.update_configuration(&settings(true));

        let received = fixture.received.recv().await.unwrap();
        assert_eq!(received.breach.metric_type, AlertMetricType::Periodic);
        assert!(start.elapsed() >= Duration::from_secs(310));
        assert!(start.elapsed() < Duration::from_secs(600));
        let (recording_start, recording_end) = parse_file_name(&received.file);
        assert_eq!(recording_end - recording_start, 10_000);
        fixture.received.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(610));

        // disabling the remote settings cancels the job
        fixture.engine.update_configuration(&settings(false));
        wait_for_idle(&fixture.engine).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(fixture.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_capture_disabled_by_default() {
        let mut fixture = make_engine(Failure::None, false, |_| {});
        fixture.engine.update_configuration(&settings(true));
        tokio::time::sleep(Duration::from_secs(4 * 3600)).await;
        assert!(fixture.received.try_recv().is_err());
        assert!(fixture.connection.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_capture_zero_interval() {
        let mut fixture = make_engine(Failure::None, false, |config| {
            config.periodic = PeriodicCapturePolicy {
                enabled: true,
                interval_seconds: 0,
                duration_seconds: 10,
            };
        });
        fixture.engine.update_configuration(&settings(true));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(fixture.received.try_recv().is_err());
        assert!(fixture.engine.inner.periodic_job.lock().unwrap().is_none());
        assert!(fixture.connection.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_capture_replaced() {
        let mut fixture = make_engine(Failure::None, false, periodic_policy);
        let start = tokio::time::Instant::now();
        fixture.engine.update_configuration(&settings(true));
        tokio::time::sleep(Duration::from_secs(200)).await;
        // rescheduling restarts the interval
        fixture.engine.update_configuration(&settings(true));
        fixture.received.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(510));
        assert!(start.elapsed() < Duration::from_secs(800));
    }
}
