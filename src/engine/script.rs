//! Script: the top-level per-narrative state machine selecting a Scene by
//! the player's current state label and the dialed number, then advancing
//! that label when the scene completes.
//!
//! Grounded on `story_objects.py`'s `Script.play`/`Script.structure`. The
//! router-vs-script division of the (a)/(b)/(c) decision (§4.8 bullet 2)
//! is implemented as two standalone predicates (`player_is_playing`,
//! `call_could_start_game`) a dispatcher probes before ever calling `play`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{StoryError, StoryResult};
use crate::phone::PhoneId;
use crate::player::{Player, ScriptInfo, SCRIPT_END_STATE, SCRIPT_IGNORE_CHANGE, SCRIPT_NEW_STATE};
use crate::shard::{Shard, SharedState};
use crate::voice::VoiceResponse;

use super::scene::Scene;

const ANY: &str = "*";

pub struct SceneAndNextState<S: SharedState> {
    pub scene: Arc<Scene<S>>,
    pub next_state: String,
}

impl<S: SharedState> SceneAndNextState<S> {
    pub fn new(scene: Arc<Scene<S>>, next_state: impl Into<String>) -> Self {
        Self { scene, next_state: next_state.into() }
    }
}

/// `map<state_label, map<dialed_e164_or_any, SceneAndNextState>>`.
pub struct Script<S: SharedState> {
    name: String,
    structure: HashMap<String, HashMap<String, SceneAndNextState<S>>>,
}

impl<S: SharedState> Script<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), structure: HashMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&mut self, state_label: impl Into<String>, dialed: impl Into<String>, entry: SceneAndNextState<S>) {
        self.structure.entry(state_label.into()).or_default().insert(dialed.into(), entry);
    }

    /// True when this player already has an in-progress (non-`END`)
    /// `ScriptInfo` for this script.
    pub fn player_is_playing(&self, player: &Player) -> bool {
        player.script(&self.name).is_some_and(|s| !s.is_complete())
    }

    /// True when `structure[NEW]` has an entry (specific or `"*"`) for the
    /// dialed number, meaning a fresh game could start here.
    pub fn call_could_start_game(&self, dialed: &PhoneId) -> bool {
        self.structure
            .get(SCRIPT_NEW_STATE)
            .is_some_and(|by_number| by_number.contains_key(dialed.e164()) || by_number.contains_key(ANY))
    }

    async fn load_all(&self) {
        for by_number in self.structure.values() {
            for entry in by_number.values() {
                entry.scene.load_all().await;
            }
        }
    }

    /// Runs one inbound request. Assumes the dispatcher has already decided
    /// this script should handle it (`player_is_playing` or
    /// `call_could_start_game` returned true); a miss inside this method's
    /// own structure lookup is therefore an internal `StoryNavigationError`,
    /// not the inter-script routing miss the dispatcher handles itself.
    pub async fn play(
        &self,
        player: &mut Player,
        dialed: &PhoneId,
        shard: &mut Shard<S>,
        digits: Option<&str>,
    ) -> StoryResult<VoiceResponse> {
        let snapshot = player.snapshot();

        let result = self.play_inner(player, dialed, shard, digits).await;

        if result.is_err() {
            player.restore(snapshot);
        }
        result
    }

    async fn play_inner(
        &self,
        player: &mut Player,
        dialed: &PhoneId,
        shard: &mut Shard<S>,
        digits: Option<&str>,
    ) -> StoryResult<VoiceResponse> {
        if !self.player_is_playing(player) {
            player.set_script(self.name.clone(), ScriptInfo::new());
        }

        let state_label = player
            .script(&self.name)
            .map(|s| s.state.clone())
            .unwrap_or_else(|| SCRIPT_NEW_STATE.to_string());

        let by_number = self
            .structure
            .get(&state_label)
            .ok_or_else(|| StoryError::story_navigation(self.name.clone(), format!("no structure entry for state '{state_label}'")))?;

        let entry = by_number
            .get(dialed.e164())
            .or_else(|| by_number.get(ANY))
            .ok_or_else(|| StoryError::story_navigation(self.name.clone(), format!("no scene for dialed number in state '{state_label}'")))?;

        let player_number = player.number.clone();
        let script_info = player
            .script_mut(&self.name)
            .expect("just ensured via set_script above");

        let response = entry.scene.play(&player_number, script_info, shard, digits).await?;

        let scene_info = script_info
            .scene_states
            .get(entry.scene.name())
            .expect("Scene::play always populates its own SceneInfo entry");

        if entry.scene.is_done(scene_info) {
            script_info.scene_history.push(entry.scene.name().to_string());
            if entry.next_state != SCRIPT_IGNORE_CHANGE {
                script_info.state = entry.next_state.clone();
            }
        }

        Ok(response)
    }

    pub fn is_complete(state: &ScriptInfo) -> bool {
        state.state == SCRIPT_END_STATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::room::{Room, RoomContext};
    use crate::engine::scene::Choices;
    use crate::kv::MemoryKvStore;
    use crate::tasks::TaskRunner;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct EmptyState;

    #[async_trait]
    impl SharedState for EmptyState {
        fn field(&self, _name: &str) -> Option<&Vec<PhoneId>> {
            None
        }
        fn field_mut(&mut self, _name: &str) -> Option<&mut Vec<PhoneId>> {
            None
        }
    }

    struct Greeter;

    #[async_trait]
    impl Room<EmptyState> for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        async fn action(&self, ctx: &mut RoomContext<EmptyState>) -> StoryResult<VoiceResponse> {
            ctx.end_scene();
            Ok(VoiceResponse::new().say("hello"))
        }
    }

    fn num(raw: &str) -> PhoneId {
        PhoneId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn a_single_room_scene_completes_and_advances_state() {
        let mut scene = Scene::new("intro", vec!["greeter".to_string()], Choices::new());
        scene.register_room(Arc::new(Greeter));

        let mut script: Script<EmptyState> = Script::new("telemarketopia");
        script.register(SCRIPT_NEW_STATE, ANY, SceneAndNextState::new(Arc::new(scene), "MATCHED"));

        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let manager = Arc::new(crate::shard::ScriptStateManager::<EmptyState>::new("telemarketopia", kv, runner));
        let mut shard = manager.shard().await;

        let mut player = Player::new_loaded(num("5105551111"));

        let response = script.play(&mut player, &num("5105552222"), &mut shard, None).await.unwrap();
        assert!(response.to_xml().contains("hello"));

        let info = player.script("telemarketopia").unwrap();
        assert_eq!(info.state, "MATCHED");
        assert_eq!(info.scene_history, vec!["intro".to_string()]);
    }
}
