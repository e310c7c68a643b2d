use crate::error::ServiceError;
use crate::jobs::JobOrchestrator;
use crate::service::{parse_metadata, FaceService, RegisterRequest, SearchRequest};
use facematch_store::RecordPatch;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facematch.Registry1";
pub const OBJECT_PATH: &str = "/org/facematch/Registry1";

/// D-Bus interface for the face registry daemon.
///
/// Bus name: org.facematch.Registry1
/// Object path: /org/facematch/Registry1
///
/// Structured results are returned as JSON strings.
pub struct FaceRegistryService {
    service: Arc<FaceService>,
    jobs: Arc<JobOrchestrator>,
    models: Vec<String>,
}

impl FaceRegistryService {
    /// `models` names the loaded model files, reported by `Status`.
    pub fn new(service: Arc<FaceService>, jobs: Arc<JobOrchestrator>, models: Vec<String>) -> Self {
        Self { service, jobs, models }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| ServiceError::Internal(format!("response encoding: {e}")).into())
}

fn require_image(name: &str, image: &[u8]) -> Result<(), ServiceError> {
    if image.is_empty() {
        return Err(ServiceError::Validation(format!("{name} is empty")));
    }
    Ok(())
}

#[interface(name = "org.facematch.Registry1")]
impl FaceRegistryService {
    /// Enroll the winning face of an uploaded image under `identity_id`.
    async fn register(&self, identity_id: i64, image: Vec<u8>, metadata: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, bytes = image.len(), "register requested");
        require_image("image", &image)?;
        let outcome = self
            .service
            .register(RegisterRequest {
                identity_id,
                image,
                metadata: parse_metadata(metadata)?,
                source: None,
            })
            .await?;
        to_json(&outcome)
    }

    /// Queue enrollment of a remote image. Returns the accepted job.
    async fn register_remote(&self, identity_id: i64, uri: &str, metadata: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, uri, "register_remote requested");
        let job = self
            .jobs
            .submit_register(identity_id, uri, parse_metadata(metadata)?)
            .await?;
        to_json(&job)
    }

    async fn search(&self, image: Vec<u8>, top_k: u32) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), top_k, "search requested");
        require_image("image", &image)?;
        let outcome = self
            .service
            .search(SearchRequest {
                image,
                top_k: top_k as usize,
                source: None,
            })
            .await?;
        to_json(&outcome)
    }

    async fn search_remote(&self, uri: &str, top_k: u32) -> zbus::fdo::Result<String> {
        tracing::info!(uri, top_k, "search_remote requested");
        let job = self.jobs.submit_search(uri, top_k as usize).await?;
        to_json(&job)
    }

    /// Distance between the closest faces of two images.
    async fn compare(&self, image_a: Vec<u8>, image_b: Vec<u8>, threshold: f64) -> zbus::fdo::Result<String> {
        tracing::info!(threshold, "compare requested");
        require_image("image_a", &image_a)?;
        require_image("image_b", &image_b)?;
        let outcome = self.service.compare(image_a, image_b, threshold as f32).await?;
        to_json(&outcome)
    }

    async fn extract(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        require_image("image", &image)?;
        let faces = self.service.extract(image).await?;
        tracing::info!(faces = faces.len(), "extract served");
        to_json(&faces)
    }

    async fn get_job(&self, job_id: &str) -> zbus::fdo::Result<String> {
        let job = self.jobs.get_job(job_id).await?;
        to_json(&job)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.list_identities().await?)
    }

    async fn list_records(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        to_json(&self.service.list_records(identity_id).await?)
    }

    /// At most `limit` records, enrolled and query. Zero selects the default.
    async fn list_all(&self, limit: u32) -> zbus::fdo::Result<String> {
        to_json(&self.service.list_all(limit as usize).await?)
    }

    async fn delete_record(&self, record_id: u64) -> zbus::fdo::Result<String> {
        tracing::info!(record_id, "delete_record requested");
        let deleted = self.service.delete_record(record_id).await?;
        to_json(&serde_json::json!({ "record_id": record_id, "deleted": deleted }))
    }

    async fn delete_identity(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "delete_identity requested");
        let ids = self.service.delete_identity(identity_id).await?;
        to_json(&serde_json::json!({
            "identity_id": identity_id,
            "deleted_ids": ids,
            "deleted": ids.len(),
        }))
    }

    /// Apply a JSON patch of `identity_id` and/or `metadata` to one record.
    async fn update_record(&self, record_id: u64, patch: &str) -> zbus::fdo::Result<String> {
        tracing::info!(record_id, "update_record requested");
        let patch: RecordPatch = serde_json::from_str(patch)
            .map_err(|e| ServiceError::Validation(format!("patch is not valid: {e}")))?;
        to_json(&self.service.update_record(record_id, patch).await?)
    }

    async fn clear(&self) -> zbus::fdo::Result<String> {
        let deleted = self.service.clear().await?;
        to_json(&serde_json::json!({ "deleted": deleted }))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let registry = self.service.registry_status().await?;
        let queues = self.jobs.queue_depths().await?;
        let settings = self.service.settings();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": !self.models.is_empty(),
            "models": self.models,
            "registry": registry,
            "queues": queues,
            "min_confidence": settings.min_confidence,
            "match_threshold": settings.match_threshold,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::OrchestratorSettings;
    use crate::notify::Notifier;
    use crate::service::tests::{face, fixture, png, Fixture};
    use facematch_store::SqliteJobQueue;
    use std::time::Duration;

    fn dbus(fx: &Fixture) -> FaceRegistryService {
        let queue = Arc::new(SqliteJobQueue::open_in_memory().unwrap());
        let notifier = Notifier::new(None, Duration::from_secs(1)).unwrap();
        let settings = OrchestratorSettings {
            object_scheme: "s3".into(),
            job_ttl: Duration::from_secs(60),
            job_lease: Duration::from_secs(60),
            result_ttl: Duration::from_secs(60),
            worker_poll: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(60),
            dependency_timeout: Duration::from_secs(5),
        };
        let jobs = Arc::new(JobOrchestrator::new(queue, fx.service.clone(), notifier, settings));
        FaceRegistryService::new(fx.service.clone(), jobs, vec!["det_10g.onnx".into(), "w600k_r50.onnx".into()])
    }

    #[tokio::test]
    async fn test_register_then_status() {
        let fx = fixture();
        let image = png(1);
        fx.extractor.set(&image, vec![face(0.0, &[1.0, 0.0])]);
        let svc = dbus(&fx);

        let out: serde_json::Value =
            serde_json::from_str(&svc.register(4, image, r#"{"name":"ana"}"#).await.unwrap()).unwrap();
        assert_eq!(out["identity_id"], 4);

        let status: serde_json::Value = serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert_eq!(status["models_loaded"], true);
        assert_eq!(status["registry"]["enrolled_records"], 1);
        assert_eq!(status["registry"]["dimension"], 2);
        assert_eq!(status["queues"]["register"], 0);
    }

    #[tokio::test]
    async fn test_empty_image_is_invalid_args() {
        let fx = fixture();
        let svc = dbus(&fx);
        let err = svc.search(Vec::new(), 0).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_bad_metadata_is_invalid_args() {
        let fx = fixture();
        let svc = dbus(&fx);
        let err = svc.register(1, png(1), "not json").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_remote_submission_returns_queued_job() {
        let fx = fixture();
        let svc = dbus(&fx);
        let job: serde_json::Value =
            serde_json::from_str(&svc.search_remote("s3://bucket/query.jpg", 3).await.unwrap()).unwrap();
        assert_eq!(job["status"], "queued");
        assert_eq!(job["queue"], "faces_search_queue");

        let fetched: serde_json::Value =
            serde_json::from_str(&svc.get_job(job["id"].as_str().unwrap()).await.unwrap()).unwrap();
        assert_eq!(fetched["id"], job["id"]);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_unknown_object() {
        let fx = fixture();
        let svc = dbus(&fx);
        let err = svc.delete_identity(99).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::UnknownObject(_)));
    }

    #[tokio::test]
    async fn test_update_record_rejects_unknown_fields() {
        let fx = fixture();
        let svc = dbus(&fx);
        let err = svc.update_record(1, r#"{"embedding":[1.0]}"#).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }
}
