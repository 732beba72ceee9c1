use crate::BridgeError;
use crate::config::{DEFAULT_SUBAGENT_CEILING, DEFAULT_SUBAGENT_RETENTION_MS};
use crate::session::current_unix_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Queued,
    Running,
    Completed,
    Error,
    Stopped,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

impl Display for SubagentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubagentRunRecord {
    pub run_id: String,
    pub conversation_id: String,
    pub task: String,
    pub engine: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Foreground session that should receive the result on its next turn.
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub child_session_id: Option<String>,
    pub status: SubagentStatus,
    pub created_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub ended_at_ms: Option<u64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub results_injected: bool,
}

impl SubagentRunRecord {
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.run_id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub task: String,
    pub engine: Option<String>,
    pub label: Option<String>,
    pub parent_session_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_parent_session(mut self, session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    version: u32,
    runs: Vec<SubagentRunRecord>,
}

/// Capped pool of background agent runs, kept in creation order.
pub struct SubagentRegistry {
    max_concurrent: usize,
    retention_ms: u64,
    runs: Mutex<Vec<SubagentRunRecord>>,
}

impl Default for SubagentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SUBAGENT_CEILING, DEFAULT_SUBAGENT_RETENTION_MS)
    }
}

impl SubagentRegistry {
    pub fn new(max_concurrent: usize, retention_ms: u64) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            retention_ms,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Always records a queued run; the ceiling is enforced by callers via
    /// [`SubagentRegistry::can_spawn`].
    pub fn spawn(
        &self,
        conversation_id: &str,
        task: &str,
        engine: &str,
        label: Option<String>,
        parent_session_id: Option<String>,
    ) -> SubagentRunRecord {
        let record = SubagentRunRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            task: task.to_string(),
            engine: engine.to_string(),
            label,
            parent_session_id,
            child_session_id: None,
            status: SubagentStatus::Queued,
            created_at_ms: current_unix_ms(),
            started_at_ms: None,
            ended_at_ms: None,
            result: None,
            error: None,
            results_injected: false,
        };
        debug!(
            run_id = %record.run_id,
            conversation_id,
            engine,
            "subagent run queued"
        );
        self.lock().push(record.clone());
        record
    }

    pub fn active_count(&self, conversation_id: &str) -> usize {
        self.lock()
            .iter()
            .filter(|run| run.conversation_id == conversation_id && !run.status.is_terminal())
            .count()
    }

    pub fn can_spawn(&self, conversation_id: &str) -> bool {
        self.active_count(conversation_id) < self.max_concurrent
    }

    pub fn mark_running(&self, run_id: &str, child_session_id: Option<String>) -> bool {
        self.transition(run_id, |run| {
            if run.status != SubagentStatus::Queued {
                return false;
            }
            run.status = SubagentStatus::Running;
            run.started_at_ms = Some(current_unix_ms());
            run.child_session_id = child_session_id;
            true
        })
    }

    /// Records the engine session id once the child agent reports it.
    pub fn attach_child_session(&self, run_id: &str, child_session_id: &str) -> bool {
        self.transition(run_id, |run| {
            if run.status != SubagentStatus::Running {
                return false;
            }
            run.child_session_id = Some(child_session_id.to_string());
            true
        })
    }

    pub fn mark_completed(&self, run_id: &str, result: impl Into<String>) -> bool {
        let result = result.into();
        self.transition(run_id, |run| {
            if run.status.is_terminal() {
                return false;
            }
            run.status = SubagentStatus::Completed;
            run.ended_at_ms = Some(current_unix_ms());
            run.result = Some(result);
            true
        })
    }

    pub fn mark_error(&self, run_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.transition(run_id, |run| {
            if run.status.is_terminal() {
                return false;
            }
            run.status = SubagentStatus::Error;
            run.ended_at_ms = Some(current_unix_ms());
            run.error = Some(error);
            true
        })
    }

    /// No-op on runs that already reached a terminal status.
    pub fn stop(&self, run_id: &str) -> bool {
        self.transition(run_id, stop_run)
    }

    pub fn stop_all(&self, conversation_id: &str) -> usize {
        let mut runs = self.lock();
        runs.iter_mut()
            .filter(|run| run.conversation_id == conversation_id)
            .map(stop_run)
            .filter(|stopped| *stopped)
            .count()
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.lock().iter().find(|run| run.run_id == run_id).cloned()
    }

    pub fn all(&self) -> Vec<SubagentRunRecord> {
        self.lock().clone()
    }

    pub fn list(&self, conversation_id: &str) -> Vec<SubagentRunRecord> {
        self.lock()
            .iter()
            .filter(|run| run.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn get_pending_results(
        &self,
        conversation_id: &str,
        parent_session_id: &str,
    ) -> Vec<SubagentRunRecord> {
        self.get_pending_results_at(conversation_id, parent_session_id, current_unix_ms())
    }

    /// Drops expired terminal runs from the whole registry, then returns
    /// completed or failed runs for `parent_session_id` not yet injected.
    pub fn get_pending_results_at(
        &self,
        conversation_id: &str,
        parent_session_id: &str,
        now_ms: u64,
    ) -> Vec<SubagentRunRecord> {
        let mut runs = self.lock();
        let before = runs.len();
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        runs.retain(|run| {
            !(run.status.is_terminal() && run.ended_at_ms.is_some_and(|ended| ended < cutoff))
        });
        if runs.len() != before {
            debug!(expired = before - runs.len(), "pruned expired subagent runs");
        }

        runs.iter()
            .filter(|run| {
                run.conversation_id == conversation_id
                    && matches!(run.status, SubagentStatus::Completed | SubagentStatus::Error)
                    && !run.results_injected
                    && run.parent_session_id.as_deref() == Some(parent_session_id)
            })
            .cloned()
            .collect()
    }

    pub fn mark_results_injected<S: AsRef<str>>(&self, run_ids: &[S]) {
        let mut runs = self.lock();
        for run in runs.iter_mut() {
            if run_ids.iter().any(|id| id.as_ref() == run.run_id) {
                run.results_injected = true;
            }
        }
    }

    /// Removes the oldest terminal runs of a conversation beyond `keep_last`.
    pub fn prune(&self, conversation_id: &str, keep_last: usize) -> usize {
        let mut runs = self.lock();
        let terminal = runs
            .iter()
            .filter(|run| run.conversation_id == conversation_id && run.status.is_terminal())
            .count();
        let mut excess = terminal.saturating_sub(keep_last);
        let removed = excess;
        runs.retain(|run| {
            if excess > 0 && run.conversation_id == conversation_id && run.status.is_terminal() {
                excess -= 1;
                return false;
            }
            true
        });
        removed
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        let snapshot = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            runs: self.lock().clone(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Replaces the in-memory state wholesale.
    pub fn from_json(&self, raw: &str) -> Result<usize, BridgeError> {
        let snapshot: RegistrySnapshot = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BridgeError::Persistence(format!(
                "unsupported subagent snapshot version {}",
                snapshot.version
            )));
        }
        let count = snapshot.runs.len();
        *self.lock() = snapshot.runs;
        Ok(count)
    }

    fn transition(&self, run_id: &str, apply: impl FnOnce(&mut SubagentRunRecord) -> bool) -> bool {
        let mut runs = self.lock();
        let Some(run) = runs.iter_mut().find(|run| run.run_id == run_id) else {
            return false;
        };
        let from = run.status;
        let changed = apply(run);
        if changed {
            debug!(run_id, from = %from, to = %run.status, "subagent status changed");
        }
        changed
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SubagentRunRecord>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stop_run(run: &mut SubagentRunRecord) -> bool {
    if run.status.is_terminal() {
        return false;
    }
    run.status = SubagentStatus::Stopped;
    run.ended_at_ms = Some(current_unix_ms());
    true
}

/// Durable home for registry snapshots.
#[async_trait]
pub trait RegistryPersistence: Send + Sync {
    async fn load(&self) -> Result<Option<String>, BridgeError>;
    async fn save(&self, snapshot: &str) -> Result<(), BridgeError>;
}

#[derive(Clone, Debug)]
pub struct FsRegistryPersistence {
    path: PathBuf,
}

impl FsRegistryPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistryPersistence for FsRegistryPersistence {
    async fn load(&self) -> Result<Option<String>, BridgeError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BridgeError::Persistence(format!(
                "read {} failed: {err}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, snapshot: &str) -> Result<(), BridgeError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                BridgeError::Persistence(format!("create {} failed: {err}", parent.display()))
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, snapshot)
            .await
            .map_err(|err| BridgeError::Persistence(format!("write state file failed: {err}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| BridgeError::Persistence(format!("rename state file failed: {err}")))?;
        info!(path = %self.path.display(), "subagent registry saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    fn spawn(registry: &SubagentRegistry, conversation: &str) -> String {
        registry
            .spawn(conversation, "write tests", "claude", None, Some("parent-1".to_string()))
            .run_id
    }

    #[test]
    fn spawn_always_queues_and_can_spawn_tracks_the_ceiling() {
        let registry = SubagentRegistry::default();
        let runs: Vec<_> = (0..4).map(|_| spawn(&registry, "chat-1")).collect();
        assert!(!registry.can_spawn("chat-1"));
        assert!(registry.can_spawn("chat-2"));

        let extra = spawn(&registry, "chat-1");
        assert_eq!(registry.get(&extra).map(|r| r.status), Some(SubagentStatus::Queued));
        assert!(registry.stop(&extra));
        assert!(!registry.can_spawn("chat-1"));

        assert!(registry.mark_running(&runs[0], Some("child-0".to_string())));
        assert!(registry.mark_completed(&runs[0], "done"));
        assert!(registry.can_spawn("chat-1"));
    }

    #[test]
    fn status_only_moves_forward() {
        let registry = SubagentRegistry::default();
        let run_id = spawn(&registry, "chat-1");
        assert!(registry.mark_running(&run_id, None));
        assert!(!registry.mark_running(&run_id, None));
        assert!(registry.mark_error(&run_id, "boom"));
        assert!(!registry.mark_completed(&run_id, "late"));
        assert!(!registry.stop(&run_id));

        let record = registry.get(&run_id).expect("run should exist");
        assert_eq!(record.status, SubagentStatus::Error);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.ended_at_ms.is_some());
        assert!(record.result.is_none());
    }

    #[test]
    fn stop_all_counts_only_runs_it_stopped() {
        let registry = SubagentRegistry::default();
        let queued = spawn(&registry, "chat-1");
        let running = spawn(&registry, "chat-1");
        let finished = spawn(&registry, "chat-1");
        let other = spawn(&registry, "chat-2");
        registry.mark_running(&running, None);
        registry.mark_completed(&finished, "ok");

        assert_eq!(registry.stop_all("chat-1"), 2);
        assert_eq!(registry.get(&queued).map(|r| r.status), Some(SubagentStatus::Stopped));
        assert_eq!(registry.get(&running).map(|r| r.status), Some(SubagentStatus::Stopped));
        assert_eq!(registry.get(&finished).map(|r| r.status), Some(SubagentStatus::Completed));
        assert_eq!(registry.get(&other).map(|r| r.status), Some(SubagentStatus::Queued));
        assert_eq!(registry.stop_all("chat-1"), 0);
    }

    #[test]
    fn pending_results_are_delivered_once() {
        let registry = SubagentRegistry::default();
        let ok = spawn(&registry, "chat-1");
        let failed = spawn(&registry, "chat-1");
        let stopped = spawn(&registry, "chat-1");
        let unrelated = registry
            .spawn("chat-1", "other", "claude", None, Some("parent-2".to_string()))
            .run_id;
        registry.mark_completed(&ok, "42");
        registry.mark_error(&failed, "agent crashed");
        registry.stop(&stopped);
        registry.mark_completed(&unrelated, "x");

        let pending = registry.get_pending_results("chat-1", "parent-1");
        let ids: Vec<_> = pending.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec![ok.as_str(), failed.as_str()]);

        registry.mark_results_injected(&ids);
        registry.mark_results_injected(&ids);
        assert!(registry.get_pending_results("chat-1", "parent-1").is_empty());
        assert_eq!(registry.get_pending_results("chat-1", "parent-2").len(), 1);
    }

    #[test]
    fn lookups_prune_runs_past_retention() {
        let registry = SubagentRegistry::new(4, 7 * HOUR_MS);
        let old = spawn(&registry, "chat-1");
        let live = spawn(&registry, "chat-1");
        registry.mark_completed(&old, "stale");
        let ended = registry
            .get(&old)
            .and_then(|r| r.ended_at_ms)
            .expect("terminal run has an end time");

        assert_eq!(
            registry
                .get_pending_results_at("chat-1", "parent-1", ended + 6 * HOUR_MS)
                .len(),
            1
        );
        assert!(
            registry
                .get_pending_results_at("chat-2", "parent-1", ended + 8 * HOUR_MS)
                .is_empty()
        );
        assert!(registry.get(&old).is_none());
        assert!(registry.get(&live).is_some());
    }

    #[test]
    fn prune_keeps_recent_terminal_runs_and_all_active_ones() {
        let registry = SubagentRegistry::default();
        let ids: Vec<_> = (0..4).map(|_| spawn(&registry, "chat-1")).collect();
        registry.mark_completed(&ids[0], "a");
        registry.mark_error(&ids[1], "b");
        registry.mark_completed(&ids[3], "d");

        assert_eq!(registry.prune("chat-1", 1), 2);
        let remaining: Vec<_> = registry
            .list("chat-1")
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(remaining, vec![ids[2].clone(), ids[3].clone()]);
        assert_eq!(registry.prune("chat-1", 5), 0);
    }

    #[test]
    fn import_replaces_existing_state() {
        let source = SubagentRegistry::default();
        let kept = spawn(&source, "chat-1");
        source.mark_completed(&kept, "ok");
        let raw = source.to_json().expect("snapshot should serialize");

        let target = SubagentRegistry::default();
        let discarded = spawn(&target, "chat-9");
        assert_eq!(target.from_json(&raw).expect("snapshot should load"), 1);
        assert!(target.get(&discarded).is_none());
        assert_eq!(target.get(&kept), source.get(&kept));
    }

    #[test]
    fn import_rejects_unknown_versions() {
        let registry = SubagentRegistry::default();
        let err = registry
            .from_json(r#"{"version": 99, "runs": []}"#)
            .expect_err("future snapshot versions are rejected");
        assert!(matches!(err, BridgeError::Persistence(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_persistence_round_trips_through_rename() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = FsRegistryPersistence::new(dir.path().join("state/subagents.json"));
        assert_eq!(store.load().await.expect("missing file is not an error"), None);

        store.save("{\"version\":1,\"runs\":[]}").await.expect("save should succeed");
        assert!(!dir.path().join("state/subagents.json.tmp").exists());
        assert_eq!(
            store.load().await.expect("load should succeed").as_deref(),
            Some("{\"version\":1,\"runs\":[]}")
        );
    }
}
