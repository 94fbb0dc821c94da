//! File-backed detector store.
//!
//! Holds every detector's configuration, lifecycle status, and scoring
//! engine. Configurations persist as one JSON array per save; each save
//! writes a temp file in the same directory and renames it over the old
//! one, so the on-disk file is always either the previous or the new valid
//! snapshot.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::detect::{
    Detector, DetectorHealth, DetectorKind, DetectorParams, DetectorStatistics, build_detector,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{Anomaly, Sample};

/// Lifecycle status of a detector id, independent of its math state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Updating,
    Error,
}

impl DetectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorStatus::Stopped => "stopped",
            DetectorStatus::Starting => "starting",
            DetectorStatus::Running => "running",
            DetectorStatus::Stopping => "stopping",
            DetectorStatus::Updating => "updating",
            DetectorStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for DetectorStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(DetectorStatus::Stopped),
            "starting" => Ok(DetectorStatus::Starting),
            "running" => Ok(DetectorStatus::Running),
            "stopping" => Ok(DetectorStatus::Stopping),
            "updating" => Ok(DetectorStatus::Updating),
            "error" => Ok(DetectorStatus::Error),
            other => Err(EngineError::InvalidInput(format!(
                "unknown detector status '{other}'"
            ))),
        }
    }
}

/// Persisted configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DetectorKind,
    pub data_type: String,
    pub threshold: f64,
    #[serde(default)]
    pub parameters: DetectorParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Creation request.
#[derive(Debug, Clone)]
pub struct NewDetector {
    pub id: Option<String>,
    pub name: String,
    pub kind: DetectorKind,
    pub data_type: String,
    pub threshold: f64,
    pub parameters: DetectorParams,
    pub description: Option<String>,
}

/// Partial update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorUpdate {
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub threshold: Option<f64>,
    pub parameters: Option<DetectorParams>,
    pub description: Option<String>,
}

/// Aggregated runtime metrics, derived from the engine's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorMetrics {
    pub total_detections: u64,
    pub anomalies_found: u64,
    pub anomaly_rate: f64,
    pub last_detection_at: Option<DateTime<Utc>>,
    pub avg_response_ms: f64,
}

impl From<&DetectorStatistics> for DetectorMetrics {
    fn from(stats: &DetectorStatistics) -> Self {
        Self {
            total_detections: stats.total_detections,
            anomalies_found: stats.anomalies_found,
            anomaly_rate: stats.anomaly_rate,
            last_detection_at: stats.last_detection_at,
            avg_response_ms: stats.avg_response_ms,
        }
    }
}

/// API-facing view of a detector.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorSnapshot {
    #[serde(flatten)]
    pub config: DetectorConfig,
    pub status: DetectorStatus,
    pub metrics: DetectorMetrics,
}

/// Outcome of a training call.
#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub training_time_ms: f64,
    pub sample_count: usize,
}

struct DetectorRecord {
    config: DetectorConfig,
    status: DetectorStatus,
    engine: Arc<Mutex<Box<dyn Detector>>>,
}

/// The store. Reads take the shared lock and see a snapshot; writes are
/// serialized. Engine calls are serialized per detector by the engine
/// mutex, so a reconfigure queued behind an in-flight detect applies after
/// it.
pub struct DetectorStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, DetectorRecord>>,
}

impl DetectorStore {
    /// Open the store, loading any persisted configurations. Detectors come
    /// back stopped; callers re-start the active ones.
    pub async fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let mut records = HashMap::new();
        if path.exists() {
            let raw = std::fs::read(&path)?;
            let configs: Vec<DetectorConfig> = serde_json::from_slice(&raw).map_err(|e| {
                EngineError::Internal(format!(
                    "detector store at {} is corrupt: {e}",
                    path.display()
                ))
            })?;
            for config in configs {
                let engine = build_detector(
                    config.kind,
                    &config.data_type,
                    config.threshold,
                    &config.parameters,
                )?;
                records.insert(
                    config.id.clone(),
                    DetectorRecord {
                        config,
                        status: DetectorStatus::Stopped,
                        engine: Arc::new(Mutex::new(engine)),
                    },
                );
            }
            info!(count = records.len(), path = %path.display(), "detector store loaded");
        }
        Ok(Self {
            path,
            inner: RwLock::new(records),
        })
    }

    pub async fn create(&self, new: NewDetector) -> EngineResult<DetectorSnapshot> {
        new.parameters.validate_for(new.kind)?;
        let engine = build_detector(new.kind, &new.data_type, new.threshold, &new.parameters)?;

        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let config = DetectorConfig {
            id: id.clone(),
            name: new.name,
            kind: new.kind,
            data_type: new.data_type,
            threshold: new.threshold,
            parameters: new.parameters,
            description: new.description,
            is_active: false,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        };

        let mut records = self.inner.write().await;
        if records.contains_key(&id) {
            return Err(EngineError::Conflict(format!(
                "detector '{id}' already exists"
            )));
        }
        records.insert(
            id.clone(),
            DetectorRecord {
                config,
                status: DetectorStatus::Stopped,
                engine: Arc::new(Mutex::new(engine)),
            },
        );
        self.persist(&records)?;
        Ok(Self::snapshot_sync(&records[&id]))
    }

    pub async fn get(&self, id: &str) -> EngineResult<DetectorSnapshot> {
        let records = self.inner.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
        Ok(Self::snapshot_sync(record))
    }

    pub async fn list(
        &self,
        kind: Option<DetectorKind>,
        status: Option<DetectorStatus>,
    ) -> Vec<DetectorSnapshot> {
        let records = self.inner.read().await;
        let mut snapshots: Vec<DetectorSnapshot> = records
            .values()
            .filter(|r| kind.is_none_or(|k| r.config.kind == k))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(Self::snapshot_sync)
            .collect();
        snapshots.sort_by(|a, b| {
            a.config
                .created_at
                .cmp(&b.config.created_at)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        snapshots
    }

    /// Apply a partial update. A running detector passes through `updating`
    /// while the new configuration lands; invalid parameters leave it in
    /// `error`.
    pub async fn update(&self, id: &str, update: DetectorUpdate) -> EngineResult<DetectorSnapshot> {
        let (engine, was_running) = {
            let mut records = self.inner.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
            let was_running = record.status == DetectorStatus::Running;
            if was_running {
                record.status = DetectorStatus::Updating;
            }
            (Arc::clone(&record.engine), was_running)
        };

        let applied: EngineResult<()> = async {
            let mut engine = engine.lock().await;
            if let Some(params) = &update.parameters {
                engine.configure(params)?;
            }
            if let Some(threshold) = update.threshold {
                engine.update_threshold(threshold)?;
            }
            Ok(())
        }
        .await;

        let mut records = self.inner.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;

        match applied {
            Ok(()) => {
                if was_running {
                    record.status = DetectorStatus::Running;
                }
            }
            Err(error) => {
                record.status = DetectorStatus::Error;
                warn!(id, %error, "detector reconfiguration failed");
                return Err(error);
            }
        }

        if let Some(name) = update.name {
            record.config.name = name;
        }
        if let Some(data_type) = update.data_type {
            record.config.data_type = data_type;
        }
        if let Some(threshold) = update.threshold {
            record.config.threshold = threshold;
        }
        if let Some(params) = update.parameters {
            record.config.parameters = params;
        }
        if let Some(description) = update.description {
            record.config.description = Some(description);
        }
        record.config.updated_at = Utc::now();
        let snapshot = Self::snapshot_sync(record);
        self.persist(&records)?;
        Ok(snapshot)
    }

    /// Delete is legal only from `stopped`.
    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        let mut records = self.inner.write().await;
        let record = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
        if record.status != DetectorStatus::Stopped {
            return Err(EngineError::Conflict(format!(
                "detector '{id}' is {}; stop it before deleting",
                record.status.as_str()
            )));
        }
        records.remove(id);
        self.persist(&records)?;
        Ok(())
    }

    /// `stopped → starting`. The pipeline promotes to `running` once the
    /// engine is warm.
    pub async fn start(&self, id: &str) -> EngineResult<DetectorStatus> {
        let mut records = self.inner.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
        match record.status {
            DetectorStatus::Stopped | DetectorStatus::Error => {
                record.status = DetectorStatus::Starting;
                record.config.is_active = true;
                record.config.updated_at = Utc::now();
            }
            other => {
                return Err(EngineError::Conflict(format!(
                    "detector '{id}' cannot start while {}",
                    other.as_str()
                )));
            }
        }
        self.persist(&records)?;
        Ok(DetectorStatus::Starting)
    }

    /// `running/starting → stopped`. Routing stops; buffers are kept.
    pub async fn stop(&self, id: &str) -> EngineResult<DetectorStatus> {
        let mut records = self.inner.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
        match record.status {
            DetectorStatus::Running
            | DetectorStatus::Starting
            | DetectorStatus::Error => {
                record.status = DetectorStatus::Stopped;
                record.config.is_active = false;
                record.config.updated_at = Utc::now();
            }
            other => {
                return Err(EngineError::Conflict(format!(
                    "detector '{id}' cannot stop while {}",
                    other.as_str()
                )));
            }
        }
        self.persist(&records)?;
        Ok(DetectorStatus::Stopped)
    }

    pub async fn status(&self, id: &str) -> EngineResult<DetectorStatus> {
        let records = self.inner.read().await;
        records
            .get(id)
            .map(|r| r.status)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))
    }

    /// Promote a warming detector to `running` once its engine has enough
    /// samples. Returns true when the promotion happened.
    pub async fn promote_if_warm(&self, id: &str) -> EngineResult<bool> {
        let engine = {
            let records = self.inner.read().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
            if record.status != DetectorStatus::Starting {
                return Ok(false);
            }
            Arc::clone(&record.engine)
        };
        let warm = engine.lock().await.health().healthy;
        if !warm {
            return Ok(false);
        }
        let mut records = self.inner.write().await;
        if let Some(record) = records.get_mut(id)
            && record.status == DetectorStatus::Starting
        {
            record.status = DetectorStatus::Running;
            info!(id, "detector warmed up");
            return Ok(true);
        }
        Ok(false)
    }

    /// Stamp the pipeline's last run over this detector.
    pub async fn mark_run(&self, id: &str) -> EngineResult<()> {
        let mut records = self.inner.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))?;
        record.config.last_run_at = Some(Utc::now());
        self.persist(&records)?;
        Ok(())
    }

    pub async fn detect(&self, id: &str, sample: &Sample) -> EngineResult<Option<Anomaly>> {
        let engine = self.engine(id).await?;
        let mut engine = engine.lock().await;
        engine.detect(sample)
    }

    pub async fn is_anomaly(&self, id: &str, values: &[f64]) -> EngineResult<(bool, f64)> {
        let engine = self.engine(id).await?;
        let engine = engine.lock().await;
        engine.is_anomaly(values)
    }

    pub async fn train(&self, id: &str, values: &[f64]) -> EngineResult<TrainReport> {
        let engine = self.engine(id).await?;
        let started = Instant::now();
        let mut engine = engine.lock().await;
        engine.train(values)?;
        Ok(TrainReport {
            training_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            sample_count: values.len(),
        })
    }

    pub async fn statistics(&self, id: &str) -> EngineResult<DetectorStatistics> {
        let engine = self.engine(id).await?;
        let engine = engine.lock().await;
        Ok(engine.statistics())
    }

    pub async fn health(&self, id: &str) -> EngineResult<DetectorHealth> {
        let engine = self.engine(id).await?;
        let engine = engine.lock().await;
        Ok(engine.health())
    }

    async fn engine(&self, id: &str) -> EngineResult<Arc<Mutex<Box<dyn Detector>>>> {
        let records = self.inner.read().await;
        records
            .get(id)
            .map(|r| Arc::clone(&r.engine))
            .ok_or_else(|| EngineError::NotFound(format!("detector '{id}' not found")))
    }

    fn snapshot_sync(record: &DetectorRecord) -> DetectorSnapshot {
        // The engine mutex is a tokio lock; use try_lock to avoid blocking a
        // read path on an in-flight detect. Counters lag one call at worst.
        let metrics = record
            .engine
            .try_lock()
            .map(|engine| DetectorMetrics::from(&engine.statistics()))
            .unwrap_or(DetectorMetrics {
                total_detections: 0,
                anomalies_found: 0,
                anomaly_rate: 0.0,
                last_detection_at: None,
                avg_response_ms: 0.0,
            });
        DetectorSnapshot {
            config: record.config.clone(),
            status: record.status,
            metrics,
        }
    }

    fn persist(&self, records: &HashMap<String, DetectorRecord>) -> EngineResult<()> {
        let mut configs: Vec<&DetectorConfig> = records.values().map(|r| &r.config).collect();
        configs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        write_snapshot(&self.path, &configs)
    }
}

fn write_snapshot(path: &Path, configs: &[&DetectorConfig]) -> EngineResult<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir
        && !dir.exists()
    {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)?;
    }

    let mut json = serde_json::to_vec_pretty(configs)?;
    json.push(b'\n');

    let mut tmp = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    tmp.write_all(&json)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    tmp.persist(path)
        .map_err(|e| EngineError::Internal(format!("atomic replace failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_detector(name: &str) -> NewDetector {
        NewDetector {
            id: None,
            name: name.to_string(),
            kind: DetectorKind::Statistical,
            data_type: "cpu_usage".to_string(),
            threshold: 2.0,
            parameters: DetectorParams {
                window_size: Some(10),
                min_samples: Some(3),
                ..Default::default()
            },
            description: None,
        }
    }

    async fn store_in(dir: &tempfile::TempDir) -> DetectorStore {
        DetectorStore::open(dir.path().join("detectors.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_get_update_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let created = store.create(new_detector("cpu")).await.unwrap();
        assert_eq!(created.status, DetectorStatus::Stopped);

        let fetched = store.get(&created.config.id).await.unwrap();
        assert_eq!(fetched.config.name, "cpu");
        assert_eq!(fetched.config.threshold, 2.0);

        let updated = store
            .update(
                &created.config.id,
                DetectorUpdate {
                    threshold: Some(3.5),
                    description: Some("tighter".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.config.threshold, 3.5);
        assert_eq!(updated.config.description.as_deref(), Some("tighter"));
        assert!(updated.config.updated_at >= created.config.updated_at);
    }

    #[tokio::test]
    async fn persisted_set_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detectors.json");
        let id = {
            let store = DetectorStore::open(&path).await.unwrap();
            store.create(new_detector("survivor")).await.unwrap().config.id
        };

        let raw = std::fs::read_to_string(&path).unwrap();
        // Indented, not minified.
        assert!(raw.starts_with("[\n"));

        let reopened = DetectorStore::open(&path).await.unwrap();
        let fetched = reopened.get(&id).await.unwrap();
        assert_eq!(fetched.config.name, "survivor");
        assert_eq!(fetched.status, DetectorStatus::Stopped);
    }

    #[tokio::test]
    async fn duplicate_ids_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let mut first = new_detector("a");
        first.id = Some("fixed".to_string());
        store.create(first).await.unwrap();

        let mut second = new_detector("b");
        second.id = Some("fixed".to_string());
        assert!(matches!(
            store.create(second).await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_requires_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = store.create(new_detector("d")).await.unwrap().config.id;

        store.start(&id).await.unwrap();
        assert!(matches!(
            store.delete(&id).await,
            Err(EngineError::Conflict(_))
        ));

        store.stop(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(matches!(
            store.get(&id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = store.create(new_detector("lc")).await.unwrap().config.id;

        assert!(matches!(
            store.stop(&id).await,
            Err(EngineError::Conflict(_))
        ));
        store.start(&id).await.unwrap();
        assert_eq!(store.status(&id).await.unwrap(), DetectorStatus::Starting);
        assert!(matches!(
            store.start(&id).await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn warm_up_promotes_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = store.create(new_detector("warm")).await.unwrap().config.id;
        store.start(&id).await.unwrap();

        assert!(!store.promote_if_warm(&id).await.unwrap());
        store.train(&id, &[10.0, 10.5, 9.5, 10.2]).await.unwrap();
        assert!(store.promote_if_warm(&id).await.unwrap());
        assert_eq!(store.status(&id).await.unwrap(), DetectorStatus::Running);
    }

    #[tokio::test]
    async fn invalid_reconfiguration_lands_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = store.create(new_detector("bad")).await.unwrap().config.id;
        store.start(&id).await.unwrap();
        store.train(&id, &[1.0, 2.0, 3.0]).await.unwrap();
        store.promote_if_warm(&id).await.unwrap();

        let err = store
            .update(
                &id,
                DetectorUpdate {
                    parameters: Some(DetectorParams {
                        window_size: Some(1),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(store.status(&id).await.unwrap(), DetectorStatus::Error);
    }

    #[tokio::test]
    async fn detect_routes_through_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let id = store.create(new_detector("route")).await.unwrap().config.id;
        store
            .train(&id, &[10.0, 10.1, 9.9, 10.0, 10.2])
            .await
            .unwrap();
        let anomaly = store
            .detect(&id, &Sample::new(50.0, HashMap::new()))
            .await
            .unwrap();
        assert!(anomaly.is_some());

        let (flagged, _) = store.is_anomaly(&id, &[10.0]).await.unwrap();
        assert!(!flagged);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        assert!(matches!(
            store.get("ghost").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            store.update("ghost", DetectorUpdate::default()).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }
}
