//! Asynchronous register/search jobs over remote images.
//!
//! Submissions are validated and enqueued; per-queue worker tasks claim jobs,
//! fetch the object, run the service pipeline and record the outcome. Every
//! terminal transition is handed to the notifier.

use crate::config::Config;
use crate::error::ServiceError;
use crate::notify::{CompletionNotice, Notifier};
use crate::service::{blocking_write, FaceService, RegisterRequest, SearchRequest};
use chrono::Utc;
use facematch_core::Metadata;
use facematch_store::{JobKind, JobRecord, ObjectPath, SqliteJobQueue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const REGISTER_QUEUE: &str = "faces_register_queue";
pub const SEARCH_QUEUE: &str = "faces_search_queue";

/// Work description stored with each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobPayload {
    Register {
        identity_id: i64,
        uri: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Search {
        uri: String,
        top_k: usize,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Register { .. } => JobKind::Register,
            JobPayload::Search { .. } => JobKind::Search,
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::Register { .. } => REGISTER_QUEUE,
            JobPayload::Search { .. } => SEARCH_QUEUE,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            JobPayload::Register { uri, .. } | JobPayload::Search { uri, .. } => uri,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub object_scheme: String,
    pub job_ttl: Duration,
    pub job_lease: Duration,
    pub result_ttl: Duration,
    pub worker_poll: Duration,
    pub sweep_interval: Duration,
    pub dependency_timeout: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            object_scheme: config.object_scheme.clone(),
            job_ttl: config.job_ttl,
            job_lease: config.job_lease,
            result_ttl: config.result_ttl,
            worker_poll: config.worker_poll,
            sweep_interval: config.sweep_interval,
            dependency_timeout: config.dependency_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub register: u64,
    pub search: u64,
}

pub struct JobOrchestrator {
    queue: Arc<SqliteJobQueue>,
    service: Arc<FaceService>,
    notifier: Notifier,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        queue: Arc<SqliteJobQueue>,
        service: Arc<FaceService>,
        notifier: Notifier,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            queue,
            service,
            notifier,
            settings,
        }
    }

    pub async fn submit_register(
        &self,
        identity_id: i64,
        uri: &str,
        metadata: Metadata,
    ) -> Result<JobRecord, ServiceError> {
        self.submit(JobPayload::Register {
            identity_id,
            uri: self.validate_uri(uri)?,
            metadata,
        })
        .await
    }

    /// `top_k` zero is resolved to the configured default when the job runs.
    pub async fn submit_search(&self, uri: &str, top_k: usize) -> Result<JobRecord, ServiceError> {
        self.submit(JobPayload::Search {
            uri: self.validate_uri(uri)?,
            top_k,
        })
        .await
    }

    pub async fn get_job(&self, id: &str) -> Result<JobRecord, ServiceError> {
        let id = id.to_string();
        self.queue_call("job lookup", move |queue| Ok(queue.get(&id)?)).await
    }

    pub async fn queue_depths(&self) -> Result<QueueDepths, ServiceError> {
        self.queue_call("queue depth", |queue| {
            Ok(QueueDepths {
                register: queue.depth(REGISTER_QUEUE)?,
                search: queue.depth(SEARCH_QUEUE)?,
            })
        })
        .await
    }

    /// Claim and run one job from `queue`. `Ok(false)` when nothing was claimable.
    pub async fn run_next(&self, queue: &'static str, worker: &str) -> Result<bool, ServiceError> {
        let owner = worker.to_string();
        let lease = self.settings.job_lease;
        let claimed = self
            .queue_call("job claim", move |q| Ok(q.claim_next(queue, &owner, lease)?))
            .await?;
        let Some(job) = claimed else {
            return Ok(false);
        };
        tracing::info!(job_id = %job.id, queue, worker, kind = job.kind.as_str(), "job claimed");

        let outcome = self.execute(&job).await;
        let id = job.id.clone();
        let owner = worker.to_string();
        let finished = match outcome {
            Ok(result) => {
                self.queue_call("job completion", move |q| Ok(q.complete(&id, &owner, &result)?))
                    .await
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "job failed");
                let message = e.to_string();
                self.queue_call("job failure", move |q| Ok(q.fail(&id, &owner, &message)?))
                    .await
            }
        };

        match finished {
            Ok(record) => {
                tracing::info!(job_id = %record.id, status = %record.status, "job finished");
                self.notifier.dispatch(CompletionNotice::from_job(&record));
            }
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "could not record job outcome"),
        }
        Ok(true)
    }

    /// Worker loop for one queue. Returns after `shutdown` flips, once the
    /// job in hand is finished.
    pub async fn run_worker(self: Arc<Self>, queue: &'static str, worker: String, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue, worker = %worker, "worker started");
        while !*shutdown.borrow() {
            match self.run_next(queue, &worker).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(queue, worker = %worker, error = %e, "job claim failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.worker_poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!(queue, worker = %worker, "worker stopped");
    }

    /// Fail queued jobs nobody claimed in time and running jobs whose lease
    /// ran out, then drop old results. Returns the jobs the sweep failed.
    pub async fn sweep_once(&self) -> Result<Vec<JobRecord>, ServiceError> {
        let result_ttl = self.settings.result_ttl;
        let report = self
            .queue_call("job sweep", move |q| Ok(q.purge_expired(Utc::now(), result_ttl)?))
            .await?;
        for job in &report.expired {
            tracing::warn!(job_id = %job.id, queue = %job.queue, "job expired unclaimed");
        }
        for job in &report.abandoned {
            tracing::warn!(job_id = %job.id, queue = %job.queue, worker = ?job.worker, "job abandoned by its worker");
        }
        let failed: Vec<JobRecord> = report.expired.into_iter().chain(report.abandoned).collect();
        for job in &failed {
            self.notifier.dispatch(CompletionNotice::from_job(job));
        }
        Ok(failed)
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "job sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("sweeper stopped");
    }

    async fn submit(&self, payload: JobPayload) -> Result<JobRecord, ServiceError> {
        let value = serde_json::to_value(&payload)
            .map_err(|e| ServiceError::Internal(format!("job payload: {e}")))?;
        let (queue_name, kind, ttl) = (payload.queue(), payload.kind(), self.settings.job_ttl);
        let job = self
            .queue_call("job submit", move |q| Ok(q.submit(queue_name, kind, &value, ttl)?))
            .await?;
        tracing::info!(job_id = %job.id, queue = queue_name, uri = payload.uri(), "job submitted");
        Ok(job)
    }

    fn validate_uri(&self, uri: &str) -> Result<String, ServiceError> {
        let path = ObjectPath::parse(uri)?;
        if path.scheme != self.settings.object_scheme {
            return Err(ServiceError::Validation(format!(
                "unsupported scheme {:?}, expected {:?}",
                path.scheme, self.settings.object_scheme
            )));
        }
        Ok(path.to_string())
    }

    async fn execute(&self, job: &JobRecord) -> Result<serde_json::Value, ServiceError> {
        let payload: JobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| ServiceError::Validation(format!("job payload: {e}")))?;
        let source = ObjectPath::parse(payload.uri())?;
        let image = self.service.download(&source).await?;

        let result = match payload {
            JobPayload::Register {
                identity_id, metadata, ..
            } => serde_json::to_value(
                self.service
                    .register(RegisterRequest {
                        identity_id,
                        image,
                        metadata,
                        source: Some(source),
                    })
                    .await?,
            ),
            JobPayload::Search { top_k, .. } => serde_json::to_value(
                self.service
                    .search(SearchRequest {
                        image,
                        top_k,
                        source: Some(source),
                    })
                    .await?,
            ),
        };
        result.map_err(|e| ServiceError::Internal(format!("job result: {e}")))
    }

    async fn queue_call<T, F>(&self, what: &'static str, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteJobQueue) -> Result<T, ServiceError> + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        blocking_write(what, self.settings.dependency_timeout, move |deadline| {
            deadline.check()?;
            f(&queue)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{face, fixture, png, Fixture};
    use facematch_store::{FaceRegistry, JobStatus, ObjectStore, Predicate};
    use serde_json::json;

    fn orchestrator_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            object_scheme: "s3".into(),
            job_ttl: Duration::from_secs(60),
            job_lease: Duration::from_secs(60),
            result_ttl: Duration::from_secs(60),
            worker_poll: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(10),
            dependency_timeout: Duration::from_secs(5),
        }
    }

    fn orchestrator(fx: &Fixture, settings: OrchestratorSettings) -> Arc<JobOrchestrator> {
        let queue = Arc::new(SqliteJobQueue::open_in_memory().unwrap());
        let notifier = Notifier::new(None, Duration::from_secs(1)).unwrap();
        Arc::new(JobOrchestrator::new(queue, fx.service.clone(), notifier, settings))
    }

    async fn put(fx: &Fixture, uri: &str, bytes: Vec<u8>) {
        let path = ObjectPath::parse(uri).unwrap();
        fx.objects.upload(&path, bytes, "image/png").await.unwrap();
    }

    #[test]
    fn test_payload_carries_uri_and_kind() {
        let payload = JobPayload::Search {
            uri: "s3://b/k.png".into(),
            top_k: 3,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"kind": "search", "uri": "s3://b/k.png", "top_k": 3}));
        assert_eq!(payload.queue(), SEARCH_QUEUE);
        assert_eq!(serde_json::from_value::<JobPayload>(value).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_register_job_runs_to_success() {
        let fx = fixture();
        let image = png(1);
        fx.extractor.set(&image, vec![face(0.0, &[1.0, 0.0, 0.0])]);
        put(&fx, "s3://intake/alice.png", image).await;
        let jobs = orchestrator(&fx, orchestrator_settings());

        let job = jobs.submit_register(7, "s3://intake/alice.png", Metadata::new()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.queue, REGISTER_QUEUE);
        assert_eq!(jobs.queue_depths().await.unwrap().register, 1);

        assert!(jobs.run_next(REGISTER_QUEUE, "w1").await.unwrap());
        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.worker.as_deref(), Some("w1"));
        let result = done.result.unwrap();
        assert_eq!(result["identity_id"], 7);
        assert_eq!(result["source_uri"], "s3://intake/alice.png");
        assert_eq!(result["annotated_uri"], "s3://intake/processed_faces/alice_processed.png");

        let records = fx.registry.query(&Predicate::Identity(7), None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_uri.as_deref(), Some("s3://intake/alice.png"));
    }

    #[tokio::test]
    async fn test_search_job_finds_enrolled_identity() {
        let fx = fixture();
        let enrolled = png(1);
        let sample = png(2);
        fx.extractor.set(&enrolled, vec![face(0.0, &[1.0, 0.0, 0.0])]);
        fx.extractor.set(&sample, vec![face(0.0, &[0.9, 0.1, 0.0])]);
        put(&fx, "s3://intake/a.png", enrolled).await;
        put(&fx, "s3://intake/sample.png", sample).await;
        let jobs = orchestrator(&fx, orchestrator_settings());

        jobs.submit_register(3, "s3://intake/a.png", Metadata::new()).await.unwrap();
        assert!(jobs.run_next(REGISTER_QUEUE, "w").await.unwrap());

        let job = jobs.submit_search("s3://intake/sample.png", 0).await.unwrap();
        assert!(jobs.run_next(SEARCH_QUEUE, "w").await.unwrap());
        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        let result = done.result.unwrap();
        assert_eq!(result["winner_match"]["identity_id"], 3);
        assert_eq!(fx.registry.count(&Predicate::Queries).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_uri_is_rejected_before_enqueue() {
        let fx = fixture();
        let jobs = orchestrator(&fx, orchestrator_settings());

        let err = jobs.submit_search("not a uri", 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let err = jobs.submit_register(1, "gs://bucket/key.png", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let err = jobs.submit_search("s3://bucket/", 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let depths = jobs.queue_depths().await.unwrap();
        assert_eq!((depths.register, depths.search), (0, 0));
    }

    #[tokio::test]
    async fn test_missing_object_fails_job() {
        let fx = fixture();
        let jobs = orchestrator(&fx, orchestrator_settings());

        let job = jobs.submit_search("s3://intake/ghost.png", 1).await.unwrap();
        assert!(jobs.run_next(SEARCH_QUEUE, "w").await.unwrap());
        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("not found"));
        assert!(done.result.is_none());
    }

    #[tokio::test]
    async fn test_no_face_fails_job_without_writing() {
        let fx = fixture();
        put(&fx, "s3://intake/empty.png", png(9)).await;
        let jobs = orchestrator(&fx, orchestrator_settings());

        let job = jobs.submit_register(1, "s3://intake/empty.png", Metadata::new()).await.unwrap();
        assert!(jobs.run_next(REGISTER_QUEUE, "w").await.unwrap());
        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().starts_with("extraction:"));
        assert_eq!(fx.registry.count(&Predicate::All).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_claims_nothing() {
        let fx = fixture();
        let jobs = orchestrator(&fx, orchestrator_settings());
        assert!(!jobs.run_next(SEARCH_QUEUE, "w").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let fx = fixture();
        let jobs = orchestrator(&fx, orchestrator_settings());
        let err = jobs.get_job("no-such-job").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_expires_unclaimed_jobs() {
        let fx = fixture();
        let mut settings = orchestrator_settings();
        settings.job_ttl = Duration::ZERO;
        let jobs = orchestrator(&fx, settings);

        let job = jobs.submit_search("s3://intake/late.png", 1).await.unwrap();
        let expired = jobs.sweep_once().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, job.id);

        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.as_deref(), Some(facematch_store::EXPIRED_MESSAGE));
        assert!(!jobs.run_next(SEARCH_QUEUE, "w").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_reaps_job_left_running_by_dead_worker() {
        let fx = fixture();
        let queue = Arc::new(SqliteJobQueue::open_in_memory().unwrap());
        let notifier = Notifier::new(None, Duration::from_secs(1)).unwrap();
        let jobs = JobOrchestrator::new(queue.clone(), fx.service.clone(), notifier, orchestrator_settings());

        let job = jobs.submit_search("s3://intake/crash.png", 1).await.unwrap();
        // A previous daemon claimed it and died before finishing.
        queue.claim_next(SEARCH_QUEUE, "gone", Duration::ZERO).unwrap().unwrap();
        assert_eq!(jobs.get_job(&job.id).await.unwrap().status, JobStatus::Running);

        let reaped = jobs.sweep_once().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, job.id);

        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.as_deref(), Some(facematch_store::ABANDONED_MESSAGE));
        assert!(jobs.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_success() {
        let fx = fixture();
        let image = png(4);
        fx.extractor.set(&image, vec![face(0.0, &[0.0, 1.0, 0.0])]);
        put(&fx, "s3://intake/n.png", image).await;
        let queue = Arc::new(SqliteJobQueue::open_in_memory().unwrap());
        let notifier = Notifier::new(Some("http://127.0.0.1:9/hook".into()), Duration::from_millis(100)).unwrap();
        let jobs = JobOrchestrator::new(queue, fx.service.clone(), notifier, orchestrator_settings());

        let job = jobs.submit_register(2, "s3://intake/n.png", Metadata::new()).await.unwrap();
        assert!(jobs.run_next(REGISTER_QUEUE, "w").await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(jobs.get_job(&job.id).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_stops_on_shutdown() {
        let fx = fixture();
        let image = png(5);
        fx.extractor.set(&image, vec![face(0.0, &[1.0, 1.0, 0.0])]);
        put(&fx, "s3://intake/w.png", image).await;
        let jobs = orchestrator(&fx, orchestrator_settings());
        let job = jobs.submit_register(5, "s3://intake/w.png", Metadata::new()).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(jobs.clone().run_worker(REGISTER_QUEUE, "w1".into(), rx.clone()));
        let sweeper = tokio::spawn(jobs.clone().run_sweeper(rx));

        let mut status = JobStatus::Queued;
        for _ in 0..200 {
            status = jobs.get_job(&job.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Succeeded);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(2), sweeper).await.unwrap().unwrap();
    }
}
