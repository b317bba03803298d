// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A handler that uploads artifacts to the profile store.

use std::{fmt, path::Path};

use async_trait::async_trait;

use crate::{
    alert::AlertBreach,
    upload::{UploadService, UploadSummary},
};

use super::ProfileHandler;

/// Notified of every successful upload, e.g. to emit a telemetry event
/// pointing at the uploaded profile.
pub trait UploadListener: fmt::Debug + Send + Sync {
    fn upload_completed(&self, breach: &AlertBreach, summary: UploadSummary);
}

/// An [`UploadListener`] that logs the summary.
#[derive(Debug, Default)]
pub struct TracingUploadListener;

impl UploadListener for TracingUploadListener {
    fn upload_completed(&self, breach: &AlertBreach, summary: UploadSummary) {
        match serde_json::to_string(&summary) {
            Ok(summary) => {
                tracing::info!(trigger = %breach.metric_type, %summary, "profile uploaded")
            }
            Err(err) => tracing::warn!(?err, "unable to serialize upload summary"),
        }
    }
}

/// Uploads every artifact through an [`UploadService`].
#[derive(Debug)]
pub struct UploadingProfileHandler {
    service: UploadService,
    listener: Box<dyn UploadListener>,
}

impl UploadingProfileHandler {
    pub fn new(service: UploadService) -> Self {
        UploadingProfileHandler {
            service,
            listener: Box::new(TracingUploadListener),
        }
    }

    pub fn with_listener(mut self, listener: impl UploadListener + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }
}

#[async_trait]
impl ProfileHandler for UploadingProfileHandler {
    async fn receive(
        &self,
        breach: &AlertBreach,
        timestamp: i64,
        file: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let summary = self
            .service
            .upload_jfr_file(
                breach.metric_type.as_str(),
                timestamp,
                file,
                breach.profile_id,
                breach.cpu_metric,
                breach.memory_usage,
            )
            .await?;
        self.listener.upload_completed(breach, summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        path::PathBuf,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use flate2::read::GzDecoder;
    use uuid::Uuid;

    use super::*;
    use crate::{
        alert::{AlertConfiguration, AlertMetricType},
        config::ProfilerConfig,
        metadata::dummy_metadata,
        profiler::{CaptureEngine, CaptureEngineBuilder, CaptureState},
        recorder::{
            ConnectionStrategy, ConnectionUnavailable, RecorderConnection,
            RecordingConfiguration, RecordingError, RecordingHandle,
        },
        scheduler::Scheduler,
        upload::{
            ArtifactAcceptedResponse, BlobAccessPass, BlobError, BlobUploadOptions,
            BlobUploadResponse, BlobUploader, ClientError, ServiceProfilerClient, UploadFailed,
        },
    };

    const APP_ID: &str = "8a5a4a0e-7b3b-4c4c-9d9d-0e0e0e0e0e0e";

    #[derive(Debug, Default, Clone)]
    struct AcceptingClient(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl ServiceProfilerClient for AcceptingClient {
        async fn get_upload_access(
            &self,
            profile_id: Uuid,
            extension: &str,
        ) -> Result<BlobAccessPass, ClientError> {
            self.0
                .lock()
                .unwrap()
                .push(format!("access {profile_id} {extension}"));
            Ok(BlobAccessPass {
                uri_with_sas_token: "https://a.blob.core.windows.net/c/b?sig=x".into(),
                blob_name: None,
                expiry: None,
            })
        }

        async fn report_upload_finish(
            &self,
            profile_id: Uuid,
            extension: &str,
            etag: &str,
        ) -> Result<ArtifactAcceptedResponse, ClientError> {
            self.0
                .lock()
                .unwrap()
                .push(format!("finish {profile_id} {extension} {etag}"));
            ArtifactAcceptedResponse::from_json(
                r#"{"stampId":"stamp-1","acceptedTime":"2020-10-14T12:00:00Z"}"#,
            )
        }
    }

    /// Records the path and decompressed contents of every upload.
    #[derive(Debug, Default, Clone)]
    struct AcceptingUploader(Arc<Mutex<Vec<(PathBuf, Vec<u8>)>>>);

    #[async_trait]
    impl BlobUploader for AcceptingUploader {
        async fn upload(
            &self,
            _pass: &BlobAccessPass,
            file: &Path,
            _options: &BlobUploadOptions,
        ) -> Result<BlobUploadResponse, BlobError> {
            let mut contents = vec![];
            GzDecoder::new(std::fs::File::open(file)?).read_to_end(&mut contents)?;
            self.0.lock().unwrap().push((file.to_owned(), contents));
            Ok(BlobUploadResponse {
                status_code: 201,
                etag: "etag".into(),
            })
        }

        async fn put(&self, _url: &url::Url, _body: Vec<u8>) -> Result<u16, BlobError> {
            Ok(201)
        }
    }

    #[derive(Debug, Default)]
    struct RecordingListener(Arc<Mutex<Vec<(AlertMetricType, UploadSummary)>>>);

    impl UploadListener for RecordingListener {
        fn upload_completed(&self, breach: &AlertBreach, summary: UploadSummary) {
            self.0.lock().unwrap().push((breach.metric_type, summary));
        }
    }

    fn handler(app_id: Option<&'static str>) -> (UploadingProfileHandler, RecordingListener) {
        let service = UploadService::new(
            Arc::new(AcceptingClient::default()),
            Arc::new(AcceptingUploader::default()),
            move || app_id.map(String::from),
            dummy_metadata(),
        );
        let listener = RecordingListener::default();
        let handler = UploadingProfileHandler::new(service)
            .with_listener(RecordingListener(listener.0.clone()));
        (handler, listener)
    }

    fn breach() -> AlertBreach {
        AlertBreach {
            cpu_metric: 93.5,
            memory_usage: 40.0,
            ..AlertBreach::new(
                AlertMetricType::Cpu,
                AlertConfiguration {
                    profile_duration: Duration::from_secs(30),
                    cooldown: Duration::from_secs(60),
                },
            )
        }
    }

    #[tokio::test]
    async fn test_uploading_handler() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("recording_0-30000.jfr");
        std::fs::write(&file, b"JFR").unwrap();
        let (handler, listener) = handler(Some(APP_ID));
        let breach = breach();
        handler.receive(&breach, 0, &file).await.unwrap();

        let summaries = listener.0.lock().unwrap();
        let (trigger, summary) = &summaries[0];
        assert_eq!(*trigger, AlertMetricType::Cpu);
        assert_eq!(summary.trigger, "CPU");
        assert_eq!(summary.artifact_id, breach.profile_id.to_string());
        assert_eq!(summary.cpu_usage, 93.5);
        assert_eq!(summary.memory_usage, 40.0);
        assert_eq!(summary.timestamp, "2020-10-14T12:00:00.0000000Z");
    }

    #[tokio::test]
    async fn test_uploading_handler_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("recording_0-30000.jfr");
        std::fs::write(&file, b"JFR").unwrap();
        let (handler, listener) = handler(None);
        let err = handler.receive(&breach(), 0, &file).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UploadFailed>(),
            Some(UploadFailed::MissingAppId)
        ));
        assert!(listener.0.lock().unwrap().is_empty());
    }

    #[derive(Debug)]
    struct JfrRecording;

    #[async_trait]
    impl RecordingHandle for JfrRecording {
        async fn start(&mut self) -> Result<(), RecordingError> {
            Ok(())
        }
        async fn dump(&mut self, path: &Path) -> Result<(), RecordingError> {
            std::fs::write(path, b"JFR")?;
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), RecordingError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), RecordingError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct JfrConnection;

    impl RecorderConnection for JfrConnection {
        fn open_recording(
            &self,
            _config: &RecordingConfiguration,
        ) -> Result<Box<dyn RecordingHandle>, RecordingError> {
            Ok(Box::new(JfrRecording))
        }
    }

    #[derive(Debug)]
    struct JfrStrategy;

    impl ConnectionStrategy for JfrStrategy {
        fn name(&self) -> &str {
            "jfr"
        }

        fn connect(&self) -> Result<Arc<dyn RecorderConnection>, ConnectionUnavailable> {
            Ok(Arc::new(JfrConnection))
        }
    }

    async fn wait_for_upload(engine: &CaptureEngine, listener: &RecordingListener) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let uploaded = !listener.0.lock().unwrap().is_empty();
            if uploaded && engine.state() == CaptureState::Idle {
                return;
            }
        }
        panic!("profile was not uploaded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_and_upload() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = dir.path().join("recordings");
        let client = AcceptingClient::default();
        let uploader = AcceptingUploader::default();
        let listener = RecordingListener::default();
        let service = UploadService::new(
            Arc::new(client.clone()),
            Arc::new(uploader.clone()),
            || Some(APP_ID.to_owned()),
            dummy_metadata(),
        );
        let engine = CaptureEngineBuilder::default()
            .with_config(ProfilerConfig {
                temporary_directory: recordings.clone(),
                ..Default::default()
            })
            .with_strategies(vec![Box::new(JfrStrategy)])
            .build();
        let handler = UploadingProfileHandler::new(service)
            .with_listener(RecordingListener(listener.0.clone()));
        engine
            .initialize(Arc::new(handler), Scheduler::current())
            .unwrap();

        let breach = breach();
        let start = tokio::time::Instant::now();
        engine.accept(breach.clone());
        wait_for_upload(&engine, &listener).await;
        assert!(start.elapsed() >= Duration::from_secs(30));

        let profile_id = breach.profile_id;
        assert_eq!(
            *client.0.lock().unwrap(),
            vec![
                format!("access {profile_id} jfr"),
                format!("finish {profile_id} jfr etag"),
            ]
        );
        let summaries = listener.0.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].1.artifact_id, profile_id.to_string());
        assert_eq!(summaries[0].1.stamp_id, "stamp-1");

        let uploads = uploader.0.lock().unwrap();
        let (compressed, contents) = &uploads[0];
        assert_eq!(contents, b"JFR");
        assert_eq!(compressed.parent().unwrap(), recordings);
        let name = compressed.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("recording_") && name.ends_with(".gz"));
        // neither the recording nor its compressed copy is left
        assert_eq!(std::fs::read_dir(&recordings).unwrap().count(), 0);
    }
}
