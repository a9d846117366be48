//! Per-player durable state with generation-based optimistic concurrency.
//!
//! Grounded on `player.py`: `RoomInfo`/`SceneInfo`/`ScriptInfo` field
//! defaults and the `load`/`save`/`advance_generation_to` semantics,
//! including the silent drop of a save when a newer generation has already
//! been written.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoryError, StoryResult};
use crate::kv::KvStore;
use crate::phone::PhoneId;

pub const SCRIPT_NEW_STATE: &str = "NEW";
pub const SCRIPT_END_STATE: &str = "END";
pub const SCRIPT_IGNORE_CHANGE: &str = "__IGNORE_CHANGE__";

fn player_key(number: &PhoneId) -> String {
    format!("plr:{}", number.e164())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default = "default_true")]
    pub fresh_state: bool,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl RoomInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fresh_state: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneInfo {
    pub name: String,
    #[serde(default)]
    pub rooms_visited: Vec<String>,
    #[serde(default)]
    pub room_states: HashMap<String, RoomInfo>,
    #[serde(default)]
    pub room_queue: Vec<String>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub ended_early: bool,
}

impl SceneInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn prev_room(&self) -> Option<&str> {
        self.rooms_visited.last().map(String::as_str)
    }

    pub fn has_rooms_in_queue(&self) -> bool {
        !self.room_queue.is_empty()
    }

    /// Gets or lazily creates the RoomInfo for `name`, matching the source's
    /// `SceneInfo.room_state` auto-create behavior.
    pub fn room_state_mut(&mut self, name: &str) -> &mut RoomInfo {
        self.room_states.entry(name.to_string()).or_insert_with(|| RoomInfo::new(name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptInfo {
    #[serde(default = "default_script_state")]
    pub state: String,
    #[serde(default)]
    pub scene_states: HashMap<String, SceneInfo>,
    #[serde(default)]
    pub scene_history: Vec<String>,
    #[serde(default)]
    pub text_handler_states: HashMap<String, Value>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

fn default_script_state() -> String {
    SCRIPT_NEW_STATE.to_string()
}

impl ScriptInfo {
    pub fn new() -> Self {
        Self { state: SCRIPT_NEW_STATE.to_string(), ..Default::default() }
    }

    pub fn is_complete(&self) -> bool {
        self.state == SCRIPT_END_STATE
    }

    /// Gets or lazily creates the SceneInfo for `name`, matching the
    /// source's `ScriptInfo.scene`.
    pub fn scene_mut(&mut self, name: &str) -> &mut SceneInfo {
        self.scene_states.entry(name.to_string()).or_insert_with(|| SceneInfo::new(name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PlayerRecord {
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    scripts: HashMap<String, ScriptInfo>,
}

/// A loaded player. `number` is the only externally visible identity;
/// `generation`/`scripts` are populated by `load()` and must not be read
/// before it (mirroring the source's `NotLoaded` on bare access).
#[derive(Debug, Clone)]
pub struct Player {
    pub number: PhoneId,
    generation: Option<u64>,
    scripts: HashMap<String, ScriptInfo>,
}

impl Player {
    pub fn new(number: PhoneId) -> Self {
        Self { number, generation: None, scripts: HashMap::new() }
    }

    /// A freshly loaded player at generation 0, bypassing the KV store.
    /// Used by `PlayerStore::load`'s fresh-player path and by tests that
    /// don't need a round trip through storage.
    pub fn new_loaded(number: PhoneId) -> Self {
        Self { number, generation: Some(0), scripts: HashMap::new() }
    }

    pub fn generation(&self) -> StoryResult<u64> {
        self.generation.ok_or_else(|| StoryError::not_loaded("Player.generation"))
    }

    pub fn script(&self, name: &str) -> Option<&ScriptInfo> {
        self.scripts.get(name)
    }

    pub fn script_mut(&mut self, name: &str) -> Option<&mut ScriptInfo> {
        self.scripts.get_mut(name)
    }

    pub fn set_script(&mut self, name: impl Into<String>, info: ScriptInfo) {
        self.scripts.insert(name.into(), info);
    }

    /// A cheap, in-memory snapshot used to restore state after a
    /// `StoryNavigationError` mid-request (source's `Snapshot(script_state)`
    /// backup before committing post-action changes).
    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot { scripts: self.scripts.clone() }
    }

    pub fn restore(&mut self, snapshot: PlayerSnapshot) {
        self.scripts = snapshot.scripts;
    }
}

#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    scripts: HashMap<String, ScriptInfo>,
}

pub struct PlayerStore {
    kv: Arc<dyn KvStore>,
}

impl PlayerStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Reads `plr:<E.164>`; a missing key is treated as a fresh player at
    /// generation 0, matching `player.py::load`.
    pub async fn load(&self, number: &PhoneId) -> StoryResult<Player> {
        let key = player_key(number);
        let record = match self.kv.get(&key).await? {
            Some(bytes) => serde_json::from_slice::<PlayerRecord>(&bytes)
                .map_err(|e| StoryError::data_integrity(key.clone(), e.to_string()))?,
            None => PlayerRecord::default(),
        };

        Ok(Player { number: number.clone(), generation: Some(record.generation), scripts: record.scripts })
    }

    /// Writes the player back only if no newer generation has been written
    /// concurrently (`player.py::save`): read current, abort silently if its
    /// generation is strictly greater than ours, otherwise write.
    pub async fn save(&self, player: &Player) -> StoryResult<()> {
        let key = player_key(&player.number);
        let local_generation = player.generation()?;

        if let Some(bytes) = self.kv.get(&key).await? {
            if let Ok(current) = serde_json::from_slice::<PlayerRecord>(&bytes) {
                if current.generation > local_generation {
                    return Ok(());
                }
            }
        }

        let record = PlayerRecord { generation: local_generation, scripts: player.scripts.clone() };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StoryError::data_integrity(key.clone(), e.to_string()))?;
        self.kv.set(&key, bytes.into()).await
    }

    /// Forced-overwrite variant used by admin snapshot restore: load the
    /// current generation, replace scripts with `scripts`, bump generation
    /// by one relative to whatever is currently on disk.
    pub async fn advance_generation_to(
        &self,
        number: &PhoneId,
        scripts: HashMap<String, ScriptInfo>,
    ) -> StoryResult<Player> {
        let key = player_key(number);
        let current_generation = match self.kv.get(&key).await? {
            Some(bytes) => serde_json::from_slice::<PlayerRecord>(&bytes).map(|r| r.generation).unwrap_or(0),
            None => 0,
        };

        let player = Player {
            number: number.clone(),
            generation: Some(current_generation + 1),
            scripts,
        };
        self.save(&player).await?;
        Ok(player)
    }

    pub async fn list_keys(&self) -> StoryResult<Vec<String>> {
        self.kv.scan("plr:").await
    }

    pub async fn delete(&self, number: &PhoneId) -> StoryResult<()> {
        self.kv.delete(&player_key(number)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn number() -> PhoneId {
        PhoneId::parse("5105551234").unwrap()
    }

    #[tokio::test]
    async fn missing_key_loads_as_fresh_player() {
        let store = PlayerStore::new(Arc::new(MemoryKvStore::new()));
        let p = store.load(&number()).await.unwrap();
        assert_eq!(p.generation().unwrap(), 0);
        assert!(p.script("telemarketopia").is_none());
    }

    #[tokio::test]
    async fn save_is_dropped_when_a_newer_generation_already_landed() {
        let store = PlayerStore::new(Arc::new(MemoryKvStore::new()));
        let num = number();

        let mut stale = store.load(&num).await.unwrap();
        stale.set_script("s", ScriptInfo::new());

        // A concurrent admin snapshot restore bumps the generation first.
        store.advance_generation_to(&num, HashMap::new()).await.unwrap();

        // The stale in-flight handler's save must be silently dropped.
        store.save(&stale).await.unwrap();

        let reloaded = store.load(&num).await.unwrap();
        assert!(reloaded.script("s").is_none());
    }

    #[tokio::test]
    async fn round_trip_preserves_scripts() {
        let store = PlayerStore::new(Arc::new(MemoryKvStore::new()));
        let num = number();
        let mut p = store.load(&num).await.unwrap();
        let mut info = ScriptInfo::new();
        info.scene_mut("intro").rooms_visited.push("lobby".to_string());
        p.set_script("telemarketopia", info);
        store.save(&p).await.unwrap();

        let reloaded = store.load(&num).await.unwrap();
        let scene = &reloaded.script("telemarketopia").unwrap().scene_states["intro"];
        assert_eq!(scene.rooms_visited, vec!["lobby".to_string()]);
    }
}
