//! Enrollment and query service.
//!
//! Ties the engine thread, the face registry and the object store together.
//! Every collaborator call is bounded by the configured dependency timeout;
//! blocking registry work runs on tokio's blocking pool.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::ServiceError;
use facematch_core::matching::{self, FaceCandidate};
use facematch_core::{Detection, Match, Metadata};
use facematch_store::{FaceRecord, FaceRegistry, NewFace, ObjectPath, ObjectStore, Predicate, RecordPatch};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Listing limit used when the caller passes none.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

const REGISTER_SUFFIX: &str = "_processed";
const SEARCH_SUFFIX: &str = "_search_processed";

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub min_confidence: f32,
    pub match_threshold: f32,
    pub default_top_k: usize,
    pub dependency_timeout: Duration,
    pub annotation_bucket: Option<String>,
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_confidence: config.min_confidence,
            match_threshold: config.match_threshold,
            default_top_k: config.default_top_k,
            dependency_timeout: config.dependency_timeout,
            annotation_bucket: config.annotation_bucket.clone(),
        }
    }
}

pub struct RegisterRequest {
    pub identity_id: i64,
    pub image: Vec<u8>,
    pub metadata: Metadata,
    /// Remote origin of `image`, set on the asynchronous path.
    pub source: Option<ObjectPath>,
}

pub struct SearchRequest {
    pub image: Vec<u8>,
    /// Zero selects the configured default.
    pub top_k: usize,
    pub source: Option<ObjectPath>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    pub record_id: u64,
    pub identity_id: i64,
    pub source_uri: Option<String>,
    pub winner_index: usize,
    pub boxes: Vec<[i32; 4]>,
    pub annotated_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub query_record_id: u64,
    /// Ranked registry hits for the winning face.
    pub matches: Vec<Match>,
    pub winner_index: usize,
    pub winner_box: [i32; 4],
    pub winner_match: Option<Match>,
    pub faces: Vec<FaceCandidate>,
    pub boxes: Vec<[i32; 4]>,
    pub source_uri: Option<String>,
    pub annotated_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompareOutcome {
    pub distance: f32,
    pub same_person: bool,
    pub threshold: f32,
    /// Faces that formed the closest pair, by detection index.
    pub face_a: usize,
    pub face_b: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedFace {
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub embedding: Vec<f32>,
}

/// Record as shown to clients: no embedding, plus where the image came from.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: FaceRecord,
    /// `"remote"` for object-store submissions, `"upload"` otherwise.
    pub source: &'static str,
}

impl From<FaceRecord> for RecordView {
    fn from(record: FaceRecord) -> Self {
        let source = if record.source_uri.is_some() { "remote" } else { "upload" };
        Self { record, source }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityGroup {
    pub identity_id: i64,
    pub faces: Vec<RecordView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub enrolled_records: u64,
    pub query_records: u64,
    pub dimension: Option<usize>,
}

pub struct FaceService {
    engine: EngineHandle,
    registry: Arc<dyn FaceRegistry>,
    objects: Arc<dyn ObjectStore>,
    settings: ServiceSettings,
}

impl FaceService {
    pub fn new(
        engine: EngineHandle,
        registry: Arc<dyn FaceRegistry>,
        objects: Arc<dyn ObjectStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            objects,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Enroll the winning face of `req.image` under `req.identity_id`.
    ///
    /// The record is searchable when this returns.
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterOutcome, ServiceError> {
        let detections = self.detect(req.image.clone()).await?;
        let source_uri = req.source.as_ref().map(ToString::to_string);

        let identity_id = req.identity_id;
        let metadata = req.metadata;
        let source = source_uri.clone();
        let (record_id, selection) = self
            .registry_write("register", move |registry, deadline| {
                let selection = matching::select_winner(&detections, |emb| registry.search(emb, 1))?
                    .ok_or_else(ServiceError::no_face)?;
                deadline.check()?;
                let winner = &detections[selection.winner_index];
                let face = NewFace::enrolled(identity_id, winner.embedding.values.clone())
                    .with_metadata(metadata)
                    .with_source(source);
                let record_id = registry.insert(face)?;
                registry.flush()?;
                Ok((record_id, selection))
            })
            .await?;

        tracing::info!(
            record_id,
            identity_id,
            faces = selection.faces.len(),
            winner = selection.winner_index,
            "registered face"
        );

        let boxes = selection.boxes();
        let annotated_uri = match &req.source {
            Some(source) => {
                self.persist_annotation(req.image, boxes.clone(), selection.winner_index, source, REGISTER_SUFFIX)
                    .await
            }
            None => None,
        };

        Ok(RegisterOutcome {
            record_id,
            identity_id,
            source_uri,
            winner_index: selection.winner_index,
            boxes,
            annotated_uri,
        })
    }

    /// Find the registry identities closest to the winning face of `req.image`.
    ///
    /// The winner's embedding is kept as a query record whatever the outcome
    /// of the match.
    pub async fn search(&self, req: SearchRequest) -> Result<SearchOutcome, ServiceError> {
        let detections = self.detect(req.image.clone()).await?;
        let top_k = self.top_k(req.top_k);
        let source_uri = req.source.as_ref().map(ToString::to_string);

        let source = source_uri.clone();
        let (query_record_id, selection) = self
            .registry_write("search", move |registry, deadline| {
                let selection = matching::select_winner(&detections, |emb| registry.search(emb, top_k))?
                    .ok_or_else(ServiceError::no_face)?;
                deadline.check()?;
                let winner = &detections[selection.winner_index];

                let mut metadata = Metadata::new();
                if let Some(uri) = &source {
                    metadata.insert("source_uri".into(), uri.clone().into());
                }
                let query_face = NewFace::query(winner.embedding.values.clone())
                    .with_metadata(metadata)
                    .with_source(source);
                let query_record_id = registry.insert(query_face)?;
                Ok((query_record_id, selection))
            })
            .await?;

        tracing::info!(
            query_record_id,
            faces = selection.faces.len(),
            winner = selection.winner_index,
            best_identity = ?selection.winner_match().map(|m| m.identity_id),
            best_distance = ?selection.winner_match().map(|m| m.distance),
            "search completed"
        );

        let boxes = selection.boxes();
        let annotated_uri = match &req.source {
            Some(source) => {
                self.persist_annotation(req.image, boxes.clone(), selection.winner_index, source, SEARCH_SUFFIX)
                    .await
            }
            None => None,
        };

        Ok(SearchOutcome {
            query_record_id,
            winner_index: selection.winner_index,
            winner_box: selection.winner().bbox,
            winner_match: selection.winner_match().cloned(),
            matches: selection.matches,
            faces: selection.faces,
            boxes,
            source_uri,
            annotated_uri,
        })
    }

    /// Compare the closest pair of faces across two images.
    pub async fn compare(&self, image_a: Vec<u8>, image_b: Vec<u8>, threshold: f32) -> Result<CompareOutcome, ServiceError> {
        let threshold = if threshold > 0.0 { threshold } else { self.settings.match_threshold };
        let faces_a = self.detect(image_a).await?;
        let faces_b = self.detect(image_b).await?;

        let (face_a, face_b, cmp) = matching::closest_pair(&faces_a, &faces_b, threshold)?.ok_or_else(ServiceError::no_face)?;
        tracing::debug!(distance = cmp.distance, same_person = cmp.same_person, "compared images");
        Ok(CompareOutcome {
            distance: cmp.distance,
            same_person: cmp.same_person,
            threshold,
            face_a,
            face_b,
        })
    }

    /// Every face in the image with its embedding.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Vec<ExtractedFace>, ServiceError> {
        let detections = self.detect(image).await?;
        Ok(detections
            .into_iter()
            .map(|d| ExtractedFace {
                bbox: d.bbox.corners(),
                confidence: d.bbox.confidence,
                embedding: d.embedding.values,
            })
            .collect())
    }

    /// Enrolled records grouped by identity, in identity order.
    pub async fn list_identities(&self) -> Result<Vec<IdentityGroup>, ServiceError> {
        let records = self
            .registry_call("list identities", |registry| Ok(registry.query(&Predicate::Enrolled, None)?))
            .await?;

        let mut groups: BTreeMap<i64, Vec<RecordView>> = BTreeMap::new();
        for record in records {
            if let Some(identity_id) = record.identity_id {
                groups.entry(identity_id).or_default().push(record.into());
            }
        }
        Ok(groups
            .into_iter()
            .map(|(identity_id, faces)| IdentityGroup { identity_id, faces })
            .collect())
    }

    /// Enrolled records of one identity; none is `NotFound`.
    pub async fn list_records(&self, identity_id: i64) -> Result<Vec<RecordView>, ServiceError> {
        let records = self
            .registry_call("list records", move |registry| {
                Ok(registry.query(&Predicate::Identity(identity_id), None)?)
            })
            .await?;
        let views: Vec<RecordView> = records.into_iter().filter(|r| !r.is_query).map(Into::into).collect();
        if views.is_empty() {
            return Err(ServiceError::NotFound(format!("no faces for identity {identity_id}")));
        }
        Ok(views)
    }

    /// Enrolled and query records, oldest first.
    pub async fn list_all(&self, limit: usize) -> Result<Vec<RecordView>, ServiceError> {
        let limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit };
        let records = self
            .registry_call("list all", move |registry| Ok(registry.query(&Predicate::All, Some(limit))?))
            .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    /// Delete one record; an unknown id deletes nothing and is not an error.
    pub async fn delete_record(&self, id: u64) -> Result<u64, ServiceError> {
        let deleted = self
            .registry_write("delete record", move |registry, _| Ok(registry.delete(&Predicate::Id(id))?))
            .await?
            .len() as u64;
        tracing::info!(record_id = id, deleted, "delete record");
        Ok(deleted)
    }

    /// Delete every record of an identity, returning the removed ids.
    pub async fn delete_identity(&self, identity_id: i64) -> Result<Vec<u64>, ServiceError> {
        let ids = self
            .registry_write("delete identity", move |registry, _| {
                Ok(registry.delete(&Predicate::Identity(identity_id))?)
            })
            .await?;
        if ids.is_empty() {
            return Err(ServiceError::NotFound(format!("no faces for identity {identity_id}")));
        }
        tracing::info!(identity_id, deleted = ids.len(), "deleted identity");
        Ok(ids)
    }

    pub async fn update_record(&self, id: u64, patch: RecordPatch) -> Result<RecordView, ServiceError> {
        let record = self
            .registry_write("update record", move |registry, _| Ok(registry.update(id, &patch)?))
            .await?;
        tracing::info!(record_id = id, identity_id = ?record.identity_id, "updated record");
        Ok(record.into())
    }

    /// Remove every record. The embedding dimension stays fixed.
    pub async fn clear(&self) -> Result<u64, ServiceError> {
        let deleted = self
            .registry_write("clear", |registry, _| Ok(registry.delete(&Predicate::All)?))
            .await?
            .len() as u64;
        tracing::warn!(deleted, "registry cleared");
        Ok(deleted)
    }

    pub async fn registry_status(&self) -> Result<RegistryStatus, ServiceError> {
        self.registry_call("status", |registry| {
            Ok(RegistryStatus {
                enrolled_records: registry.count(&Predicate::Enrolled)?,
                query_records: registry.count(&Predicate::Queries)?,
                dimension: registry.dimension()?,
            })
        })
        .await
    }

    /// Fetch a remote image.
    pub async fn download(&self, path: &ObjectPath) -> Result<Vec<u8>, ServiceError> {
        self.bounded("object download", async { Ok(self.objects.download(path).await?) })
            .await
    }

    fn top_k(&self, requested: usize) -> usize {
        if requested == 0 {
            self.settings.default_top_k
        } else {
            requested
        }
    }

    /// Run extraction; zero faces is an extraction error.
    async fn detect(&self, image: Vec<u8>) -> Result<Vec<Detection>, ServiceError> {
        let min_confidence = self.settings.min_confidence;
        let detections = self
            .bounded("extraction", async { Ok(self.engine.extract(image, min_confidence).await?) })
            .await?;
        if detections.is_empty() {
            return Err(ServiceError::no_face());
        }
        Ok(detections)
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T, ServiceError>>) -> Result<T, ServiceError> {
        bounded(what, self.settings.dependency_timeout, fut).await
    }

    async fn registry_call<T, F>(&self, what: &'static str, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FaceRegistry) -> Result<T, ServiceError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        blocking(what, self.settings.dependency_timeout, move || f(registry.as_ref())).await
    }

    /// Like `registry_call`, but a timeout never leaves a write running
    /// behind the caller's back: see [`blocking_write`].
    async fn registry_write<T, F>(&self, what: &'static str, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FaceRegistry, &Deadline) -> Result<T, ServiceError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        blocking_write(what, self.settings.dependency_timeout, move |deadline| f(registry.as_ref(), deadline)).await
    }

    /// Draw and upload the annotated image. Failures are logged, never returned.
    async fn persist_annotation(
        &self,
        image: Vec<u8>,
        boxes: Vec<[i32; 4]>,
        winner: usize,
        source: &ObjectPath,
        suffix: &str,
    ) -> Option<String> {
        match self.try_persist_annotation(image, boxes, winner, source, suffix).await {
            Ok(uri) => {
                tracing::debug!(annotated_uri = %uri, "annotated image stored");
                Some(uri)
            }
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "annotated image not stored");
                None
            }
        }
    }

    async fn try_persist_annotation(
        &self,
        image: Vec<u8>,
        boxes: Vec<[i32; 4]>,
        winner: usize,
        source: &ObjectPath,
        suffix: &str,
    ) -> Result<String, ServiceError> {
        let annotated = tokio::task::spawn_blocking(move || facematch_core::annotate(&image, &boxes, Some(winner)))
            .await?
            .map_err(|e| ServiceError::Internal(format!("annotation: {e}")))?;

        let target = annotation_path(source, self.settings.annotation_bucket.as_deref(), suffix, annotated.extension());
        let content_type = annotated.content_type();
        self.bounded("annotation upload", async {
            Ok(self.objects.upload(&target, annotated.bytes, content_type).await?)
        })
        .await?;
        Ok(target.to_string())
    }
}

/// Await `fut`, turning expiry of `limit` into a dependency error.
pub(crate) async fn bounded<T>(
    what: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation = what, timeout_ms = limit.as_millis() as u64, "dependency call timed out");
            Err(ServiceError::timeout(what, limit))
        }
    }
}

/// Run blocking store work on the blocking pool, bounded by `limit`.
pub(crate) async fn blocking<T, F>(what: &'static str, limit: Duration, f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    bounded(what, limit, async move { tokio::task::spawn_blocking(f).await? }).await
}

/// Expiry flag shared between a caller and its blocking write.
#[derive(Clone)]
pub(crate) struct Deadline {
    expired: Arc<AtomicBool>,
    what: &'static str,
    limit: Duration,
}

impl Deadline {
    fn new(what: &'static str, limit: Duration) -> Self {
        Self {
            expired: Arc::new(AtomicBool::new(false)),
            what,
            limit,
        }
    }

    /// Fail with the caller's timeout error once the caller has given up.
    /// Call before each commit.
    pub(crate) fn check(&self) -> Result<(), ServiceError> {
        if self.expired.load(Ordering::Acquire) {
            return Err(ServiceError::timeout(self.what, self.limit));
        }
        Ok(())
    }

    fn expire(&self) {
        self.expired.store(true, Ordering::Release);
    }
}

/// Run a blocking write bounded by `limit`.
///
/// A blocking task cannot be cancelled, so on expiry the deadline is marked
/// and the task is awaited: a write that had not reached its commit point
/// fails with the timeout, one that already committed returns its result.
/// The reported outcome always matches what the store holds.
pub(crate) async fn blocking_write<T, F>(what: &'static str, limit: Duration, f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&Deadline) -> Result<T, ServiceError> + Send + 'static,
{
    let deadline = Deadline::new(what, limit);
    let token = deadline.clone();
    let mut task = tokio::task::spawn_blocking(move || f(&token));
    match tokio::time::timeout(limit, &mut task).await {
        Ok(joined) => joined?,
        Err(_) => {
            deadline.expire();
            tracing::warn!(operation = what, timeout_ms = limit.as_millis() as u64, "dependency call timed out");
            let result = task.await?;
            if result.is_ok() {
                tracing::warn!(operation = what, "write committed after its deadline");
            }
            result
        }
    }
}

/// `processed_faces/<stem><suffix>.<ext>` in `bucket`, or the source bucket.
pub fn annotation_path(source: &ObjectPath, bucket: Option<&str>, suffix: &str, extension: &str) -> ObjectPath {
    ObjectPath::new(
        &source.scheme,
        bucket.unwrap_or(&source.bucket),
        &format!("processed_faces/{}{suffix}.{extension}", source.key_stem()),
    )
}

/// Parse client-supplied metadata JSON; empty means none.
pub fn parse_metadata(raw: &str) -> Result<Metadata, ServiceError> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ServiceError::Validation("metadata must be a JSON object".into())),
        Err(e) => Err(ServiceError::Validation(format!("metadata is not valid JSON: {e}"))),
    }
}
