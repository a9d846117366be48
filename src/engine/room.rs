//! Room trait and the per-request context handed to it.
//!
//! Grounded on `story_objects.py`'s `Room`/`RoomContext`. Rooms are
//! stateless singletons identified by `name()` rather than by class
//! identity; all per-player state lives in the
//! `RoomInfo`/`SceneInfo`/`ScriptInfo` fields a `RoomContext` exposes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoryResult;
use crate::phone::PhoneId;
use crate::player::RoomInfo;
use crate::shard::{Shard, SharedState};
use crate::voice::VoiceResponse;

/// Everything one `Room::action` call may read or mutate: the player's
/// identity, this room's own `RoomInfo`, the owning scene's and script's
/// opaque data bags, whether the scene ended early, and a shard view of
/// cross-player shared state. Mutations land directly in the caller's
/// storage — there is no separate "pass back changes" step because every
/// field here is already a live mutable borrow (`story_objects.py`'s
/// `_pass_back_changes` is therefore unnecessary in this shape).
pub struct RoomContext<'a, S: SharedState> {
    pub player_number: &'a PhoneId,
    pub digits: Option<&'a str>,
    script_data: &'a mut HashMap<String, Value>,
    scene_data: &'a mut HashMap<String, Value>,
    scene_ended_early: &'a mut bool,
    room: &'a mut RoomInfo,
    pub shard: &'a mut Shard<S>,
    state_is_new: bool,
    state_changed: bool,
}

impl<'a, S: SharedState> RoomContext<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        player_number: &'a PhoneId,
        digits: Option<&'a str>,
        script_data: &'a mut HashMap<String, Value>,
        scene_data: &'a mut HashMap<String, Value>,
        scene_ended_early: &'a mut bool,
        room: &'a mut RoomInfo,
        shard: &'a mut Shard<S>,
    ) -> Self {
        let state_is_new = room.fresh_state;
        Self { player_number, digits, script_data, scene_data, scene_ended_early, room, shard, state_is_new, state_changed: false }
    }

    /// True exactly when this is the first `action` call since `state` was
    /// last assigned.
    pub fn state_is_new(&self) -> bool {
        self.state_is_new
    }

    pub fn state(&self) -> &str {
        &self.room.state
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.room.state = state.into();
        self.state_changed = true;
    }

    pub fn choices(&self) -> &[String] {
        &self.room.choices
    }

    pub fn push_choice(&mut self, digit: impl Into<String>) {
        self.room.choices.push(digit.into());
    }

    pub fn room_data(&mut self) -> &mut HashMap<String, Value> {
        &mut self.room.data
    }

    pub fn scene_data(&mut self) -> &mut HashMap<String, Value> {
        self.scene_data
    }

    pub fn script_data(&mut self) -> &mut HashMap<String, Value> {
        self.script_data
    }

    pub fn end_scene(&mut self) {
        *self.scene_ended_early = true;
    }

    /// Whether `set_state` was called during this invocation. Consumed by
    /// `Scene::play` to compute the next `fresh_state` value.
    pub(crate) fn state_changed(&self) -> bool {
        self.state_changed
    }
}

#[async_trait]
pub trait Room<S: SharedState>: Send + Sync {
    fn name(&self) -> &str;

    /// One-shot resource warm-up at process start. Default: no-op.
    async fn load(&self) {}

    /// Called on the *previous* room of the previous request so it can
    /// fold the player's DTMF choice into its own state before the scene
    /// advances the queue. Default: no-op.
    fn new_player_choice(&self, _digit: &str, _ctx: &mut RoomContext<S>) {}

    async fn action(&self, ctx: &mut RoomContext<S>) -> StoryResult<VoiceResponse>;
}
