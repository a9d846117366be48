//! Script Shared State Manager: the shard / integrate / reduce protocol.
//!
//! Grounded on `stories/story_objects.py`'s `Shard`, `Change`,
//! `ScriptStateManager`, and `AfterRequestActions`. One deliberate
//! departure from the source: a `move` of a value not present in `From` is
//! a silent no-op validated at integrate time, rather than failing eagerly
//! at shard-creation time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{StoryError, StoryResult};
use crate::kv::KvStore;
use crate::phone::PhoneId;
use crate::tasks::{Task, TaskRunner};

/// Narrative-specific shared state: a struct of `Vec<PhoneId>` fields,
/// addressed by name so `Shard`/`Change` can operate generically over it.
/// Implementors also provide the matchmaking and startup-reconciliation
/// hooks (`do_reduce`, `on_startup`) that give a concrete story its
/// behavior.
#[async_trait]
pub trait SharedState: Default + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn field(&self, name: &str) -> Option<&Vec<PhoneId>>;
    fn field_mut(&mut self, name: &str) -> Option<&mut Vec<PhoneId>>;

    /// Matchmaking and any other post-integrate bookkeeping. Runs under the
    /// manager lock, immediately after an integrate. Default: no-op.
    async fn do_reduce(&mut self, _runner: &TaskRunner) {}

    /// Startup reconciliation — e.g. moving `*_in_conf` entries back to
    /// `*_waiting_for_conf` after an unclean restart. Default: no-op.
    async fn on_startup(&mut self) {}

    /// Hook fired when a player newly enters the owning script. Default:
    /// no-op.
    async fn player_added(&mut self, _player_number: &PhoneId) {}

    /// Called after a freshly loaded snapshot replaces `self`'s in-memory
    /// state during a sync, so a concrete state can carry forward an
    /// ambient `#[serde(skip)]` handle (e.g. a matchmaking dependency cell)
    /// from the instance being replaced rather than losing it to the
    /// skip-field default every deserialize produces. Default: no-op.
    fn carry_ambient(&mut self, _previous: &Self) {}
}

/// One pending mutation recorded by a [`Shard`]. `From` set means "move";
/// unset means "append".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub from: Option<String>,
    pub to: String,
    pub value: Vec<PhoneId>,
    pub at_front: bool,
}

impl Change {
    /// Replays this change onto `target`. Matches `Change.apply` in the
    /// source with one intentional difference: values listed to move that
    /// are not currently present in `From` are silently dropped instead of
    /// having already failed validation earlier.
    pub fn apply<S: SharedState>(&self, target: &mut S) -> StoryResult<()> {
        let mut values_to_add = self.value.clone();

        if let Some(from_name) = &self.from {
            let from_field = target
                .field_mut(from_name)
                .ok_or_else(|| StoryError::shard_frozen(format!("unknown field '{from_name}'")))?;
            values_to_add.retain(|v| from_field.contains(v));
            from_field.retain(|v| !self.value.contains(v));
        }

        let to_field = target
            .field_mut(&self.to)
            .ok_or_else(|| StoryError::shard_frozen(format!("unknown field '{}'", self.to)))?;
        for v in values_to_add {
            if !to_field.contains(&v) {
                if self.at_front {
                    to_field.insert(0, v);
                } else {
                    to_field.push(v);
                }
            }
        }
        Ok(())
    }
}

/// The manager-side capability a [`Shard`] needs, breaking the
/// Shard-to-Manager back-reference the source has.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn integrate(&self, changes: Vec<Change>) -> StoryResult<()>;
    async fn reduce(&self) -> StoryResult<()>;

    /// Fires the narrative's `player_added` hook for a player newly
    /// entering the owning script. Default: no-op, so sinks that never
    /// wrap a narrative state (e.g. test doubles) don't need to implement
    /// it.
    async fn notify_player_added(&self, _player: &PhoneId) -> StoryResult<()> {
        Ok(())
    }
}

/// A per-request snapshot-plus-changelog view of shared script state.
/// Reads reflect the snapshot at shard-creation time; direct mutation of
/// `snapshot` is impossible since the field is private — every write goes
/// through `append`/`move_value`, which only ever record a [`Change`].
pub struct Shard<S: SharedState> {
    snapshot: S,
    changes: Vec<Change>,
    new_players: Vec<PhoneId>,
    sink: Arc<dyn ChangeSink>,
}

impl<S: SharedState> Shard<S> {
    pub fn new(snapshot: S, sink: Arc<dyn ChangeSink>) -> Self {
        Self { snapshot, changes: Vec::new(), new_players: Vec::new(), sink }
    }

    pub fn field(&self, name: &str) -> Option<&Vec<PhoneId>> {
        self.snapshot.field(name)
    }

    /// Appends `value` to `to`. Fails with `ShardFrozen` if `to` is not a
    /// field on the state shape (an eager check, matching `Shard.append`'s
    /// `_check_to`).
    pub fn append(&mut self, to: &str, value: PhoneId, at_front: bool) -> StoryResult<()> {
        if self.snapshot.field(to).is_none() {
            return Err(StoryError::shard_frozen(format!("unknown field '{to}'")));
        }
        self.changes.push(Change { from: None, to: to.to_string(), value: vec![value], at_front });
        Ok(())
    }

    /// Records a move of `value` from `from` to `to`. `to` must exist on
    /// the state shape; unlike the source, presence of `value` in `from` is
    /// *not* checked here — a stale shard's move silently becomes a no-op
    /// at integrate time instead of failing the whole request.
    pub fn move_value(&mut self, from: &str, to: &str, value: PhoneId, at_front: bool) -> StoryResult<()> {
        if self.snapshot.field(to).is_none() {
            return Err(StoryError::shard_frozen(format!("unknown field '{to}'")));
        }
        self.changes.push(Change { from: Some(from.to_string()), to: to.to_string(), value: vec![value], at_front });
        Ok(())
    }

    /// Records that `player` newly entered the owning script this request,
    /// so `player_added` fires once the returned `AfterRequestActions` runs.
    pub fn mark_player_added(&mut self, player: PhoneId) {
        self.new_players.push(player);
    }

    /// Consumes the shard, handing its pending changes, new-player
    /// notifications, and sink to an [`AfterRequestActions`] task.
    pub fn into_task(self) -> AfterRequestActions {
        AfterRequestActions { changes: self.changes, new_players: self.new_players, sink: self.sink }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredState<S> {
    #[serde(flatten)]
    state: S,
    version: u64,
    generation: u64,
}

struct ManagerInner<S> {
    state: S,
    version: u64,
    generation: u64,
}

/// Owns one narrative's shared state, persisted at `script:<name>`.
/// Mutation only ever happens under `inner`'s lock, across
/// sync -> apply -> save (integrate) or sync -> do_reduce -> save (reduce).
pub struct ScriptStateManager<S: SharedState> {
    key: String,
    kv: Arc<dyn KvStore>,
    runner: TaskRunner,
    inner: tokio::sync::Mutex<ManagerInner<S>>,
}

impl<S: SharedState> ScriptStateManager<S> {
    pub fn new(script_name: &str, kv: Arc<dyn KvStore>, runner: TaskRunner) -> Self {
        Self {
            key: format!("script:{script_name}"),
            kv,
            runner,
            inner: tokio::sync::Mutex::new(ManagerInner { state: S::default(), version: 0, generation: 0 }),
        }
    }

    /// Loads the persisted record once at startup, then runs the
    /// narrative's `on_startup` reconciliation hook and persists any
    /// changes it made.
    pub async fn load_and_reconcile(&self) -> StoryResult<()> {
        let mut inner = self.inner.lock().await;
        self.sync_locked(&mut inner).await?;
        inner.state.on_startup().await;
        self.save_locked(&mut inner).await
    }

    /// Builds a fresh [`Shard`] over the current in-memory snapshot. `self`
    /// must be held behind an `Arc` so the shard can hold a type-erased
    /// handle back to this manager as its [`ChangeSink`].
    pub async fn shard(self: &Arc<Self>) -> Shard<S> {
        let inner = self.inner.lock().await;
        Shard::new(inner.state.clone(), self.clone())
    }

    pub async fn snapshot(&self) -> S {
        self.inner.lock().await.state.clone()
    }

    /// Locks and mutates the in-memory state in place, without syncing from
    /// or saving to storage. Used at bring-up to inject an ambient
    /// dependency handle into a freshly constructed state before the first
    /// `load_and_reconcile` call.
    pub async fn mutate_state<F: FnOnce(&mut S)>(&self, f: F) {
        let mut inner = self.inner.lock().await;
        f(&mut inner.state);
    }

    /// Admin-snapshot-restore style generation bump: any concurrent writer
    /// still holding the pre-bump generation will lose on its next sync.
    pub async fn bump_generation(&self) -> StoryResult<()> {
        let mut inner = self.inner.lock().await;
        let preserved_state = inner.state.clone();
        self.sync_locked(&mut inner).await?;
        inner.state = preserved_state;
        inner.generation += 1;
        self.save_locked(&mut inner).await
    }

    async fn sync_locked(&self, inner: &mut ManagerInner<S>) -> StoryResult<()> {
        let Some(bytes) = self.kv.get(&self.key).await? else { return Ok(()) };
        let stored: StoredState<S> = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => return Err(StoryError::data_integrity(self.key.clone(), e.to_string())),
        };

        if stored.version > inner.version || stored.generation > inner.generation {
            let previous = inner.state.clone();
            inner.state = stored.state;
            inner.state.carry_ambient(&previous);
            inner.version = stored.version;
            inner.generation = stored.generation;
        }
        Ok(())
    }

    async fn save_locked(&self, inner: &mut ManagerInner<S>) -> StoryResult<()> {
        let candidate = StoredState { state: inner.state.clone(), version: inner.version, generation: inner.generation };
        let candidate_value = serde_json::to_value(&candidate)
            .map_err(|e| StoryError::data_integrity(self.key.clone(), e.to_string()))?;

        if let Some(bytes) = self.kv.get(&self.key).await? {
            if let Ok(current_value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                if current_value == candidate_value {
                    return Ok(());
                }
            }
        }

        inner.version += 1;
        let to_write = StoredState { state: inner.state.clone(), version: inner.version, generation: inner.generation };
        let bytes = serde_json::to_vec(&to_write)
            .map_err(|e| StoryError::data_integrity(self.key.clone(), e.to_string()))?;
        self.kv.set(&self.key, bytes.into()).await
    }
}

#[async_trait]
impl<S: SharedState> ChangeSink for ScriptStateManager<S> {
    async fn integrate(&self, changes: Vec<Change>) -> StoryResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        self.sync_locked(&mut inner).await?;
        for change in &changes {
            change.apply(&mut inner.state)?;
        }
        self.save_locked(&mut inner).await
    }

    async fn notify_player_added(&self, player: &PhoneId) -> StoryResult<()> {
        let mut inner = self.inner.lock().await;
        self.sync_locked(&mut inner).await?;
        inner.state.player_added(player).await;
        self.save_locked(&mut inner).await
    }

    async fn reduce(&self) -> StoryResult<()> {
        let mut inner = self.inner.lock().await;
        self.sync_locked(&mut inner).await?;
        inner.state.do_reduce(&self.runner).await;
        self.save_locked(&mut inner).await
    }
}

/// The task enqueued after every request: integrate the shard's recorded
/// changes, then run the narrative's reducer, strictly in that order and
/// never concurrently with another integrate/reduce. Grounded on
/// `AfterRequestActions.execute` in the source.
pub struct AfterRequestActions {
    changes: Vec<Change>,
    new_players: Vec<PhoneId>,
    sink: Arc<dyn ChangeSink>,
}

impl std::fmt::Debug for AfterRequestActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AfterRequestActions({} changes, {} new players)", self.changes.len(), self.new_players.len())
    }
}

#[async_trait]
impl Task for AfterRequestActions {
    async fn execute(self: Box<Self>) -> Result<(), String> {
        self.sink.integrate(self.changes).await.map_err(|e| e.to_string())?;
        for player in &self.new_players {
            self.sink.notify_player_added(player).await.map_err(|e| e.to_string())?;
        }
        self.sink.reduce().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct TestState {
        waiting: Vec<PhoneId>,
        in_conf: Vec<PhoneId>,
    }

    #[async_trait]
    impl SharedState for TestState {
        fn field(&self, name: &str) -> Option<&Vec<PhoneId>> {
            match name {
                "waiting" => Some(&self.waiting),
                "in_conf" => Some(&self.in_conf),
                _ => None,
            }
        }
        fn field_mut(&mut self, name: &str) -> Option<&mut Vec<PhoneId>> {
            match name {
                "waiting" => Some(&mut self.waiting),
                "in_conf" => Some(&mut self.in_conf),
                _ => None,
            }
        }
    }

    fn num(raw: &str) -> PhoneId {
        PhoneId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn concurrent_appends_both_survive() {
        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let manager = Arc::new(ScriptStateManager::<TestState>::new("test", kv, runner));

        let mut shard_a = manager.shard().await;
        shard_a.append("waiting", num("5105551111"), false).unwrap();
        let mut shard_b = manager.shard().await;
        shard_b.append("waiting", num("5105552222"), false).unwrap();

        manager.integrate(shard_a.into_task().changes).await.unwrap();
        manager.integrate(shard_b.into_task().changes).await.unwrap();

        let state = manager.snapshot().await;
        assert_eq!(state.waiting.len(), 2);
    }

    #[tokio::test]
    async fn move_of_absent_value_is_a_silent_no_op() {
        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let manager = Arc::new(ScriptStateManager::<TestState>::new("test", kv, runner));

        let mut shard = manager.shard().await;
        shard.move_value("waiting", "in_conf", num("5105551111"), false).unwrap();
        manager.integrate(shard.into_task().changes).await.unwrap();

        let state = manager.snapshot().await;
        assert!(state.waiting.is_empty());
        assert!(state.in_conf.is_empty(), "value never present in From must not appear in To");
    }

    #[tokio::test]
    async fn append_to_unknown_field_is_rejected_eagerly() {
        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let manager = Arc::new(ScriptStateManager::<TestState>::new("test", kv, runner));

        let mut shard = manager.shard().await;
        let err = shard.append("nonexistent", num("5105551111"), false).unwrap_err();
        assert!(matches!(err, StoryError::ShardFrozen { .. }));
    }
}
