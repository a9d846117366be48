//! Scene: a declared start queue plus a path/room/digit choice table,
//! driving one inbound request through a chain of Room visits.
//!
//! Grounded on `story_objects.py`'s `Scene.play`. The nested-by-path
//! `Choices` table and the `IndexError` defensive recovery (silently
//! replay the previous room instead of failing the request) both carry
//! over from the source as-is.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{StoryError, StoryResult};
use crate::phone::PhoneId;
use crate::player::{RoomInfo, ScriptInfo, SceneInfo};
use crate::shard::{Shard, SharedState};
use crate::voice::VoiceResponse;

use super::room::{Room, RoomContext};

const ANY: &str = "*";

/// `map<from_room, map<path_or_any, map<digit_or_any, Vec<to_room>>>>`.
#[derive(Debug, Clone, Default)]
pub struct Choices {
    table: HashMap<String, HashMap<String, HashMap<String, Vec<String>>>>,
}

impl Choices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from_room: impl Into<String>, path: impl Into<String>, digit: impl Into<String>, to_rooms: Vec<String>) -> &mut Self {
        self.table
            .entry(from_room.into())
            .or_default()
            .entry(path.into())
            .or_default()
            .insert(digit.into(), to_rooms);
        self
    }

    pub fn has_outgoing(&self, from_room: &str) -> bool {
        self.table.contains_key(from_room)
    }

    /// Resolves `(path, digit)` against `from_room`'s table, falling back
    /// first on digit `"*"`, then on path `"*"`.
    fn resolve(&self, from_room: &str, path: &str, digit: &str) -> Option<Vec<String>> {
        let by_path = self.table.get(from_room)?;
        let by_digit = by_path.get(path).or_else(|| by_path.get(ANY))?;
        by_digit.get(digit).or_else(|| by_digit.get(ANY)).cloned()
    }
}

fn split_scene(scene: &mut SceneInfo) -> (&mut HashMap<String, RoomInfo>, &mut HashMap<String, serde_json::Value>, &mut bool, &mut Vec<String>, &mut Vec<String>) {
    (&mut scene.room_states, &mut scene.data, &mut scene.ended_early, &mut scene.rooms_visited, &mut scene.room_queue)
}

pub struct Scene<S: SharedState> {
    name: String,
    start: Vec<String>,
    choices: Choices,
    rooms: HashMap<String, Arc<dyn Room<S>>>,
}

impl<S: SharedState> Scene<S> {
    pub fn new(name: impl Into<String>, start: Vec<String>, choices: Choices) -> Self {
        Self { name: name.into(), start, choices, rooms: HashMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_room(&mut self, room: Arc<dyn Room<S>>) {
        self.rooms.insert(room.name().to_string(), room);
    }

    pub async fn load_all(&self) {
        for room in self.rooms.values() {
            room.load().await;
        }
    }

    /// Scene done-ness per §3: `ended_early` OR (`room_queue` empty AND the
    /// last visited room has no outgoing choice table entry).
    pub fn is_done(&self, scene_info: &SceneInfo) -> bool {
        if scene_info.ended_early {
            return true;
        }
        if !scene_info.room_queue.is_empty() {
            return false;
        }
        match scene_info.prev_room() {
            Some(prev) => !self.choices.has_outgoing(prev),
            None => false,
        }
    }

    /// Runs one inbound request through this scene, mutating `script`'s
    /// `SceneInfo` for this scene in place and returning the room's voice
    /// response.
    pub async fn play(
        &self,
        player_number: &PhoneId,
        script: &mut ScriptInfo,
        shard: &mut Shard<S>,
        digits: Option<&str>,
    ) -> StoryResult<VoiceResponse> {
        let path = script.data.get("path").and_then(|v| v.as_str()).unwrap_or(ANY).to_string();
        let script_data = &mut script.data;
        let scene_info = script.scene_states.entry(self.name.clone()).or_insert_with(|| SceneInfo::new(self.name.clone()));

        if scene_info.room_queue.is_empty() && scene_info.rooms_visited.is_empty() {
            scene_info.room_queue = self.start.clone();
        }

        let prev_room_name = scene_info.prev_room().map(str::to_string);

        // Step 2: feed this request's DTMF to the previous room before
        // computing the next queue.
        if let (Some(prev_name), Some(digit_str)) = (&prev_room_name, digits) {
            if let Some(prev_room) = self.rooms.get(prev_name) {
                let (room_states, scene_data, ended_early, _, _) = split_scene(scene_info);
                if let Some(prev_info) = room_states.get_mut(prev_name) {
                    let mut ctx = RoomContext::new(player_number, Some(digit_str), &mut *script_data, scene_data, ended_early, prev_info, &mut *shard);
                    prev_room.new_player_choice(digit_str, &mut ctx);
                    ctx.push_choice(digit_str.to_string());
                }
            }
        }

        // Step 3: compute the queue for this request.
        if scene_info.room_queue.is_empty() {
            let digit = digits.unwrap_or(ANY);
            let next = prev_room_name
                .as_deref()
                .and_then(|prev| self.choices.resolve(prev, &path, digit));
            match next {
                Some(rooms) => scene_info.room_queue = rooms,
                None => {
                    if let Some(prev) = &prev_room_name {
                        // Defensive recovery: nothing to pop, replay the
                        // previous room rather than fail the request.
                        warn!(scene = %self.name, room = %prev, "empty next-room queue, replaying previous room");
                        scene_info.room_queue = vec![prev.clone()];
                    } else {
                        return Err(StoryError::story_navigation(self.name.clone(), "no start rooms and no previous room to replay"));
                    }
                }
            }
        }

        // Step 4: pop the head of the queue and run it.
        let (room_states, scene_data, ended_early, rooms_visited, room_queue) = split_scene(scene_info);
        let room_name = match room_queue.first().cloned() {
            Some(name) => {
                room_queue.remove(0);
                name
            }
            None => {
                return Err(StoryError::story_navigation(self.name.clone(), "room queue unexpectedly empty"));
            }
        };

        let room = self
            .rooms
            .get(&room_name)
            .ok_or_else(|| StoryError::story_navigation(self.name.clone(), format!("no such room '{room_name}'")))?;

        let room_info = room_states.entry(room_name.clone()).or_insert_with(|| RoomInfo::new(room_name.clone()));
        let mut ctx = RoomContext::new(player_number, digits, script_data, scene_data, ended_early, &mut *room_info, shard);
        let response = room.action(&mut ctx).await?;
        let state_changed = ctx.state_changed();
        room_info.fresh_state = state_changed;

        rooms_visited.push(room_name);
        Ok(response)
    }
}
