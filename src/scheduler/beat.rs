use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::broker::{BrokerGateway, SubmitOptions, DEFAULT_QUEUE};
use crate::core::config::ScheduleTimezone;
use crate::core::error::RuntimeError;
use crate::core::store::{Task, TaskStore};
use crate::plugins::hex;
use crate::scheduler::entry::{reset_action, ResetAction, ScheduleEntry, ScheduleSpec};

/// Dispatch stops when the last good store read is older than this many
/// reconcile intervals.
const STALE_SNAPSHOT_INTERVALS: u32 = 3;

/// The beat scheduler: reconciles the in-memory schedule with the task
/// store every `max_interval` and fires due tasks through the broker
/// gateway. Exactly one live beat process may exist per deployment.
pub struct BeatScheduler {
    store: Arc<TaskStore>,
    gateway: Arc<BrokerGateway>,
    max_interval: Duration,
    tz: ScheduleTimezone,
    /// The single scheduler lock: reconcile, dispatch, and any in-process
    /// mutation all serialize on it.
    state: Mutex<BeatState>,
}

#[derive(Default)]
struct BeatState {
    entries: HashMap<String, ScheduleEntry>,
    heap: std::collections::BinaryHeap<Reverse<HeapItem>>,
    seq: u64,
    // Change-detection cache, refreshed atomically on every rebuild.
    last_count: Option<usize>,
    last_identity: Option<Vec<String>>,
    last_content_hash: Option<String>,
    last_enabled_map: BTreeMap<String, bool>,
    last_max_updated: Option<DateTime<Utc>>,
    last_good_read: Option<Instant>,
    rebuild_count: u64,
}

#[derive(PartialEq, Eq)]
struct HeapItem {
    due_at: DateTime<Utc>,
    seq: u64,
    task_id: String,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due_at, self.seq).cmp(&(other.due_at, other.seq))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl BeatScheduler {
    pub fn new(
        store: Arc<TaskStore>,
        gateway: Arc<BrokerGateway>,
        max_interval: Duration,
        tz: ScheduleTimezone,
    ) -> Self {
        Self {
            store,
            gateway,
            max_interval,
            tz,
            state: Mutex::new(BeatState::default()),
        }
    }

    /// The beat loop. Never returns under normal operation.
    pub async fn run(&self) -> Result<()> {
        info!(
            "beat started (max_interval={}s, tz={:?})",
            self.max_interval.as_secs(),
            self.tz
        );
        let mut tick = tokio::time::interval(self.max_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.tick().await;
        }
    }

    /// One reconcile-and-dispatch round.
    pub async fn tick(&self) {
        let mut state = self.state.lock().await;

        match self.load_snapshot().await {
            Ok((enabled, flags)) => {
                state.last_good_read = Some(Instant::now());
                if let Some(signal) = detect_change(&state, &enabled, &flags) {
                    info!("schedule change detected ({signal}), rebuilding");
                    self.rebuild(&mut state, enabled, flags).await;
                }
            }
            Err(e) => {
                let e = RuntimeError::StoreUnavailable(e.to_string());
                warn!("{e}; serving last snapshot");
            }
        }

        let stale_after = self.max_interval * STALE_SNAPSHOT_INTERVALS;
        let fresh = state
            .last_good_read
            .is_some_and(|at| at.elapsed() <= stale_after);
        if !fresh {
            warn!("snapshot older than {}s, holding dispatch", stale_after.as_secs());
            return;
        }

        self.dispatch_due(&mut state).await;
    }

    pub async fn rebuild_count(&self) -> u64 {
        self.state.lock().await.rebuild_count
    }

    async fn load_snapshot(&self) -> Result<(Vec<Task>, BTreeMap<String, bool>)> {
        // One consistent read covers both the enabled snapshot and the
        // full enabled-flag map.
        let all = self.store.list_all().await?;
        let flags: BTreeMap<String, bool> =
            all.iter().map(|t| (t.id.clone(), t.enabled)).collect();
        let enabled: Vec<Task> = all.into_iter().filter(|t| t.enabled).collect();
        Ok((enabled, flags))
    }

    /// Rebuild the whole schedule from a fresh snapshot. Atomic from the
    /// dispatcher's point of view: it runs under the scheduler lock and
    /// replaces the entry map, the heap, and every cache slot together.
    async fn rebuild(
        &self,
        state: &mut BeatState,
        enabled: Vec<Task>,
        flags: BTreeMap<String, bool>,
    ) {
        state.rebuild_count += 1;
        let now = Utc::now();
        let mut entries = HashMap::new();

        for task in enabled.iter() {
            let spec = match ScheduleSpec::compile(task.schedule_type, &task.schedule_config) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!("task {} has an invalid schedule, skipping: {e}", task.id);
                    continue;
                }
            };
            let last_run_at = match reset_action(task) {
                ResetAction::Hard => {
                    warn!("task {} mutated while idle, clearing run state", task.id);
                    if let Err(e) = self.store.clear_run_state(&task.id).await {
                        warn!("failed clearing run state of {}: {e}", task.id);
                    }
                    None
                }
                ResetAction::Soft => {
                    debug!("task {} recently mutated, treating as eligible", task.id);
                    None
                }
                ResetAction::Keep => task.last_run,
            };
            entries.insert(
                task.id.clone(),
                ScheduleEntry::new(task.clone(), spec, last_run_at, now, self.tz),
            );
        }

        state.heap.clear();
        for (id, entry) in entries.iter() {
            state.seq += 1;
            state.heap.push(Reverse(HeapItem {
                due_at: entry.due_at,
                seq: state.seq,
                task_id: id.clone(),
            }));
        }

        state.last_count = Some(enabled.len());
        state.last_identity = Some(enabled.iter().map(|t| t.id.clone()).collect());
        state.last_content_hash = Some(content_hash(&enabled));
        state.last_max_updated = enabled.iter().map(|t| t.updated_at).max();
        state.last_enabled_map = flags;
        state.entries = entries;
        info!(
            "schedule rebuilt (#{}) with {} entries",
            state.rebuild_count,
            state.last_count.unwrap_or(0)
        );
    }

    /// Fire every entry whose due time has passed, in due-time order.
    async fn dispatch_due(&self, state: &mut BeatState) {
        let now = Utc::now();
        loop {
            let Some(Reverse(head)) = state.heap.peek() else {
                break;
            };
            if head.due_at > now {
                break;
            }
            let Some(Reverse(item)) = state.heap.pop() else {
                break;
            };

            // Entries vanish from the map on rebuild when their task was
            // deleted or disabled; their queued heap items are just skipped.
            let Some(entry) = state.entries.get(&item.task_id) else {
                continue;
            };
            // A rebuild also reissues heap items; ignore superseded ones.
            if entry.due_at != item.due_at || !entry.is_due(now) {
                continue;
            }

            let task = entry.task.clone();
            let options = SubmitOptions {
                queue: DEFAULT_QUEUE.to_string(),
                priority: task.priority,
                time_limit: task.timeout_seconds,
                retries: task.max_retries,
            };

            match self
                .gateway
                .submit(&task.plugin_name, &task.parameters, &options)
                .await
            {
                Ok(submission_id) => {
                    debug!("task {} dispatched as {}", task.id, submission_id);
                    let next_due = match state.entries.get_mut(&item.task_id) {
                        Some(entry) => {
                            entry.advance_after_fire(now, self.tz);
                            entry.due_at
                        }
                        None => continue,
                    };
                    state.seq += 1;
                    state.heap.push(Reverse(HeapItem {
                        due_at: next_due,
                        seq: state.seq,
                        task_id: item.task_id.clone(),
                    }));
                    // Persisted through the no-touch path; a fire must never
                    // look like a user edit.
                    if let Err(e) = self
                        .store
                        .touch_last_run(&task.id, now, Some(next_due))
                        .await
                    {
                        warn!("failed persisting last_run of {}: {e}", task.id);
                    }
                }
                Err(e) => {
                    // Leave last_run_at alone so the task re-attempts on the
                    // next tick (at-least-once under broker recovery).
                    let e = RuntimeError::BrokerUnavailable(e.to_string());
                    warn!("submission of {} failed, retrying next tick: {e}", task.id);
                    state.heap.push(Reverse(item));
                    break;
                }
            }
        }
    }
}

/// Evaluate the detection signals in order and name the first one that
/// fires. No signal firing means no rebuild.
fn detect_change(
    state: &BeatState,
    enabled: &[Task],
    flags: &BTreeMap<String, bool>,
) -> Option<&'static str> {
    let Some(last_count) = state.last_count else {
        return Some("initial load");
    };

    if last_count != enabled.len() {
        return Some("enabled-set count");
    }

    let identity: Vec<String> = enabled.iter().map(|t| t.id.clone()).collect();
    if state.last_identity.as_ref() != Some(&identity) {
        return Some("enabled-set identity");
    }

    if state.last_content_hash.as_deref() != Some(content_hash(enabled).as_str()) {
        return Some("content hash");
    }

    if state.last_enabled_map != *flags {
        return Some("enabled transition");
    }

    let max_updated = enabled.iter().map(|t| t.updated_at).max();
    if let (Some(current), Some(cached)) = (max_updated, state.last_max_updated) {
        if current > cached {
            return Some("max updated_at");
        }
    }

    None
}

/// Stable hash over the scheduling-relevant fields of the sorted enabled
/// set. `last_run`/`next_run` stay out: the dispatcher's own no-touch
/// writes must not read back as changes.
fn content_hash(enabled: &[Task]) -> String {
    let mut hasher = Sha256::new();
    for task in enabled {
        let tuple = serde_json::json!([
            task.id,
            task.parameters,
            task.schedule_type,
            task.schedule_config,
            task.priority,
            task.max_retries,
            task.timeout_seconds,
            task.enabled,
            task.updated_at.to_rfc3339(),
        ]);
        hasher.update(tuple.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::ScheduleType;

    fn task(id: &str, enabled: bool, updated_at: DateTime<Utc>) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            description: None,
            tags: vec![],
            plugin_name: "demo".into(),
            parameters: serde_json::json!({"x": 1}),
            schedule_type: ScheduleType::Interval,
            schedule_config: serde_json::json!({"interval_seconds": 10}),
            enabled,
            priority: 5,
            max_retries: 3,
            timeout_seconds: None,
            last_run: None,
            next_run: None,
            created_at: updated_at,
            updated_at,
        }
    }

    fn cached_state(enabled: &[Task], flags: &BTreeMap<String, bool>) -> BeatState {
        BeatState {
            last_count: Some(enabled.len()),
            last_identity: Some(enabled.iter().map(|t| t.id.clone()).collect()),
            last_content_hash: Some(content_hash(enabled)),
            last_enabled_map: flags.clone(),
            last_max_updated: enabled.iter().map(|t| t.updated_at).max(),
            ..Default::default()
        }
    }

    fn flags_of(tasks: &[Task]) -> BTreeMap<String, bool> {
        tasks.iter().map(|t| (t.id.clone(), t.enabled)).collect()
    }

    #[test]
    fn quiescent_store_fires_no_signal() {
        let t0 = Utc::now();
        let tasks = vec![task("a", true, t0), task("b", true, t0)];
        let flags = flags_of(&tasks);
        let state = cached_state(&tasks, &flags);
        assert_eq!(detect_change(&state, &tasks, &flags), None);
    }

    #[test]
    fn insert_fires_count_signal() {
        let t0 = Utc::now();
        let cached = vec![task("a", true, t0)];
        let flags = flags_of(&cached);
        let state = cached_state(&cached, &flags);

        let now = vec![task("a", true, t0), task("b", true, t0)];
        let new_flags = flags_of(&now);
        assert_eq!(
            detect_change(&state, &now, &new_flags),
            Some("enabled-set count")
        );
    }

    #[test]
    fn swap_fires_identity_signal() {
        let t0 = Utc::now();
        let cached = vec![task("a", true, t0)];
        let flags = flags_of(&cached);
        let state = cached_state(&cached, &flags);

        let now = vec![task("b", true, t0)];
        let new_flags = flags_of(&now);
        assert_eq!(
            detect_change(&state, &now, &new_flags),
            Some("enabled-set identity")
        );
    }

    #[test]
    fn parameter_edit_fires_content_hash() {
        let t0 = Utc::now();
        let cached = vec![task("a", true, t0)];
        let flags = flags_of(&cached);
        let state = cached_state(&cached, &flags);

        let mut edited = task("a", true, t0);
        edited.parameters = serde_json::json!({"x": 2});
        let now = vec![edited];
        assert_eq!(
            detect_change(&state, &now, &flags),
            Some("content hash")
        );
    }

    #[test]
    fn disabled_row_flip_fires_enabled_transition() {
        let t0 = Utc::now();
        // One enabled task plus one disabled row tracked only in the map.
        let enabled = vec![task("a", true, t0)];
        let mut flags = flags_of(&enabled);
        flags.insert("b".into(), false);
        let state = cached_state(&enabled, &flags);

        // The flag map is the dedicated signal for the enabled-toggle
        // class; here it differs while every enabled-set signal is blind.
        let mut new_flags = flags.clone();
        new_flags.insert("b".into(), true);
        assert_eq!(
            detect_change(&state, &enabled, &new_flags),
            Some("enabled transition")
        );
    }

    #[test]
    fn touch_last_run_shape_is_invisible_to_the_hash() {
        let t0 = Utc::now();
        let mut fired = task("a", true, t0);
        let before = content_hash(&[fired.clone()]);
        fired.last_run = Some(Utc::now());
        fired.next_run = Some(Utc::now());
        assert_eq!(before, content_hash(&[fired]));
    }

    #[test]
    fn forward_updated_at_fires_last_signal() {
        let t0 = Utc::now();
        let cached = vec![task("a", true, t0)];
        let flags = flags_of(&cached);
        let mut state = cached_state(&cached, &flags);
        // Make the earlier signals blind: keep their slots in sync.
        let bumped = task("a", true, t0 + chrono::Duration::seconds(30));
        state.last_content_hash = Some(content_hash(&[bumped.clone()]));

        assert_eq!(
            detect_change(&state, &[bumped], &flags),
            Some("max updated_at")
        );
    }
}
