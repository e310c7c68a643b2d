//! Completion callbacks for asynchronous jobs.
//!
//! Fire-and-forget: one bounded POST per terminal job, no retries. Failures
//! are logged and never touch the job itself.

use facematch_store::{JobRecord, JobStatus};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionNotice {
    pub correlation_id: String,
    pub outcome_status: JobStatus,
    pub result_summary: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source_uri: Option<String>,
}

impl CompletionNotice {
    pub fn from_job(job: &JobRecord) -> Self {
        Self {
            correlation_id: job.id.clone(),
            outcome_status: job.status,
            result_summary: job.result.as_ref().map(summarize).unwrap_or(serde_json::Value::Null),
            error: job.error.clone(),
            source_uri: job.payload.get("uri").and_then(|v| v.as_str()).map(str::to_string),
        }
    }
}

/// Keep the fields a receiver needs to act on; drop per-face detail.
fn summarize(result: &serde_json::Value) -> serde_json::Value {
    const KEYS: &[&str] = &[
        "record_id",
        "identity_id",
        "query_record_id",
        "winner_index",
        "winner_match",
        "annotated_uri",
    ];
    let mut summary = serde_json::Map::new();
    if let Some(obj) = result.as_object() {
        for key in KEYS {
            if let Some(v) = obj.get(*key) {
                summary.insert((*key).to_string(), v.clone());
            }
        }
    }
    serde_json::Value::Object(summary)
}

#[derive(Clone)]
pub struct Notifier {
    url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        if let Some(url) = &url {
            tracing::info!(url = %url, timeout_secs = timeout.as_secs(), "completion notifications enabled");
        }
        Ok(Self { url, client })
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send the notice on a detached task. No-op without a URL.
    pub fn dispatch(&self, notice: CompletionNotice) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = send(&client, &url, &notice).await {
                tracing::warn!(job_id = %notice.correlation_id, error = %e, "completion notification failed");
            }
        });
    }
}

async fn send(client: &reqwest::Client, url: &str, notice: &CompletionNotice) -> Result<(), reqwest::Error> {
    client.post(url).json(notice).send().await?.error_for_status()?;
    tracing::debug!(job_id = %notice.correlation_id, "completion notification delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use facematch_store::JobKind;
    use serde_json::json;

    fn job(status: JobStatus, result: Option<serde_json::Value>, error: Option<&str>) -> JobRecord {
        JobRecord {
            id: "job-1".into(),
            kind: JobKind::Search,
            queue: "faces_search_queue".into(),
            status,
            payload: json!({"uri": "s3://b/k.jpg", "top_k": 5}),
            result,
            error: error.map(str::to_string),
            worker: Some("w".into()),
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn test_notice_from_succeeded_job() {
        let result = json!({"query_record_id": 9, "winner_index": 1, "faces": [1, 2, 3]});
        let notice = CompletionNotice::from_job(&job(JobStatus::Succeeded, Some(result), None));
        assert_eq!(notice.correlation_id, "job-1");
        assert_eq!(notice.source_uri.as_deref(), Some("s3://b/k.jpg"));
        assert_eq!(notice.result_summary, json!({"query_record_id": 9, "winner_index": 1}));

        let body = serde_json::to_value(&notice).unwrap();
        assert_eq!(body["outcome_status"], "succeeded");
        assert!(body.get("error").is_none());
    }

    #[test]
    fn test_notice_from_failed_job() {
        let notice = CompletionNotice::from_job(&job(JobStatus::Failed, None, Some("boom")));
        assert_eq!(notice.result_summary, serde_json::Value::Null);
        assert_eq!(serde_json::to_value(&notice).unwrap()["error"], "boom");
    }

    #[tokio::test]
    async fn test_dispatch_without_url_is_noop() {
        let notifier = Notifier::new(None, Duration::from_secs(1)).unwrap();
        assert!(!notifier.is_enabled());
        notifier.dispatch(CompletionNotice::from_job(&job(JobStatus::Succeeded, None, None)));
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_swallowed() {
        // Port 9 (discard) on localhost: connection refused, logged only.
        let notifier = Notifier::new(Some("http://127.0.0.1:9/hook".into()), Duration::from_millis(200)).unwrap();
        let notice = CompletionNotice::from_job(&job(JobStatus::Succeeded, None, None));
        let err = send(&notifier.client, "http://127.0.0.1:9/hook", &notice).await;
        assert!(err.is_err());
        notifier.dispatch(notice);
    }
}
