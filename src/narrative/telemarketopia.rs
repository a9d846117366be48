//! Telemarketopia: the sample two-path branching narrative. Included as a
//! worked example of every extension point the engine exposes — shared
//! state, matchmaking, room/scene wiring, and text handling — not as a
//! component with open design questions of its own.
//!
//! Grounded on `stories/telemarketopia.py`, `tele_story_objects.py`, and
//! `telemarketopia_conferences.py`: two recruitment paths ("Clavae" and
//! "Karen") that each collect players into a waiting queue, get matched
//! pairwise into a first conference, and eventually converge on a shared
//! final puzzle.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{MediaCatalog, NumberLibrary};
use crate::conference::{ConferenceRegistry, ConfStartFirst, CoordinatorDeps, READY_FOR_CONF_KEY};
use crate::engine::{Choices, Room, RoomContext, Scene, SceneAndNextState, Script};
use crate::error::StoryResult;
use crate::phone::PhoneId;
use crate::player::{PlayerStore, ScriptInfo, SCRIPT_IGNORE_CHANGE, SCRIPT_NEW_STATE};
use crate::shard::{Shard, SharedState};
use crate::tasks::{Task, TaskRunner};
use crate::text_handler::TextHandler;
use crate::voice::{VoiceGateway, VoiceResponse};

pub const SCRIPT_NAME: &str = "telemarketopia";
pub const PATH_CLAVAE: &str = "Clavae";
pub const PATH_KAREN: &str = "Karen";

const PATH_KEY: &str = "path";
const PARTNER_KEY: &str = "partner";
const HAS_DECISION_TEXT_KEY: &str = "_has_decision_text";
const FINAL_CHOICE_KEY: &str = "_player_final_choice";
const PLAYER_IN_FIRST_CONFERENCE_KEY: &str = "player_in_first_conference";
/// Exposed so the HTTP layer's conference-status handler can tell the
/// first conference's join/leave events apart from the final conference's.
pub const IN_FINAL_FINAL_KEY: &str = "_in_final_final";

const CLAVAE_POST_CONF_TEXT: &str = "The first call was just the opening act. Text 1 to push further, 2 to walk away, or 3 if you think you already understand Babyface.";
const KAREN_POST_CONF_TEXT: &str = "That was not what you signed up for, was it. Text 1, 2, or 3 depending on how far you're willing to go now.";

// ---------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------

/// Matches the source's `TeleState`: eight queues, two per lifecycle stage
/// per recruitment path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemarketopiaState {
    pub clavae_players: Vec<PhoneId>,
    pub karen_players: Vec<PhoneId>,
    pub clavae_waiting_for_conf: Vec<PhoneId>,
    pub karen_waiting_for_conf: Vec<PhoneId>,
    pub clavae_in_conf: Vec<PhoneId>,
    pub karen_in_conf: Vec<PhoneId>,
    pub clavae_final_conf: Vec<PhoneId>,
    pub karen_final_conf: Vec<PhoneId>,

    /// Set once at bring-up, after both the owning `ScriptStateManager`
    /// and the `CoordinatorDeps` wrapping it exist. `do_reduce` and
    /// `on_startup` need the full dependency bundle (voice gateway, player
    /// store, conference registry) to act on matchmaking decisions, which
    /// the generic `SharedState` hooks don't carry; this cell closes that
    /// gap without widening the trait for every narrative.
    #[serde(skip)]
    coordinator: Arc<OnceLock<Arc<CoordinatorDeps<TelemarketopiaState>>>>,
}

impl TelemarketopiaState {
    pub fn set_coordinator(&mut self, deps: Arc<CoordinatorDeps<TelemarketopiaState>>) {
        if self.coordinator.set(deps).is_err() {
            warn!("telemarketopia coordinator handle was already set");
        }
    }
}

fn dedupe(values: &[PhoneId]) -> Vec<PhoneId> {
    let mut seen = HashSet::new();
    values.iter().filter(|v| seen.insert((*v).clone())).cloned().collect()
}

#[async_trait]
impl SharedState for TelemarketopiaState {
    fn field(&self, name: &str) -> Option<&Vec<PhoneId>> {
        match name {
            "clavae_players" => Some(&self.clavae_players),
            "karen_players" => Some(&self.karen_players),
            "clavae_waiting_for_conf" => Some(&self.clavae_waiting_for_conf),
            "karen_waiting_for_conf" => Some(&self.karen_waiting_for_conf),
            "clavae_in_conf" => Some(&self.clavae_in_conf),
            "karen_in_conf" => Some(&self.karen_in_conf),
            "clavae_final_conf" => Some(&self.clavae_final_conf),
            "karen_final_conf" => Some(&self.karen_final_conf),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Vec<PhoneId>> {
        match name {
            "clavae_players" => Some(&mut self.clavae_players),
            "karen_players" => Some(&mut self.karen_players),
            "clavae_waiting_for_conf" => Some(&mut self.clavae_waiting_for_conf),
            "karen_waiting_for_conf" => Some(&mut self.karen_waiting_for_conf),
            "clavae_in_conf" => Some(&mut self.clavae_in_conf),
            "karen_in_conf" => Some(&mut self.karen_in_conf),
            "clavae_final_conf" => Some(&mut self.clavae_final_conf),
            "karen_final_conf" => Some(&mut self.karen_final_conf),
            _ => None,
        }
    }

    /// Matchmaking: while both queues have someone waiting, pair their
    /// heads, move both into `*_in_conf`, and start the first-conference
    /// task chain. Grounded on `TeleStateManager.do_reduce`.
    async fn do_reduce(&mut self, runner: &TaskRunner) {
        let Some(deps) = self.coordinator.get().cloned() else {
            warn!("telemarketopia matchmaking skipped: coordinator handle not wired up yet");
            return;
        };

        while !self.clavae_waiting_for_conf.is_empty() && !self.karen_waiting_for_conf.is_empty() {
            let clavae_player = self.clavae_waiting_for_conf.remove(0);
            let karen_player = self.karen_waiting_for_conf.remove(0);
            self.clavae_in_conf.push(clavae_player.clone());
            self.karen_in_conf.push(karen_player.clone());

            info!(clavae = %clavae_player, karen = %karen_player, "matched a pair for the first conference");
            runner
                .enqueue(Box::new(ConfStartFirst {
                    deps: deps.clone(),
                    script_name: SCRIPT_NAME.to_string(),
                    path_a: clavae_player,
                    path_b: karen_player,
                }))
                .await;
        }
    }

    /// Startup reconciliation: anyone stranded `*_in_conf` by an unclean
    /// restart goes back to `*_waiting_for_conf`; anyone recruited onto
    /// both paths at once ("confused players") is dropped from every list
    /// and has their record deleted entirely, per the delete-on-dupe
    /// remediation. Grounded on `TeleStateManager.on_startup`.
    async fn on_startup(&mut self) {
        self.clavae_waiting_for_conf.append(&mut self.clavae_in_conf);
        self.karen_waiting_for_conf.append(&mut self.karen_in_conf);

        self.clavae_players = dedupe(&self.clavae_players);
        self.karen_players = dedupe(&self.karen_players);

        let clavae_set: HashSet<PhoneId> = self.clavae_players.iter().cloned().collect();
        let karen_set: HashSet<PhoneId> = self.karen_players.iter().cloned().collect();
        let confused: Vec<PhoneId> = clavae_set.intersection(&karen_set).cloned().collect();

        if confused.is_empty() {
            return;
        }
        warn!(count = confused.len(), "players recruited onto both paths at once; resetting their progress");

        let deps = self.coordinator.get().cloned();
        for player in &confused {
            self.clavae_players.retain(|p| p != player);
            self.karen_players.retain(|p| p != player);
            self.clavae_waiting_for_conf.retain(|p| p != player);
            self.karen_waiting_for_conf.retain(|p| p != player);
            self.clavae_final_conf.retain(|p| p != player);
            self.karen_final_conf.retain(|p| p != player);

            if let Some(deps) = &deps {
                if let Err(e) = deps.players.delete(player).await {
                    warn!(player = %player, error = %e, "failed to delete a confused player's record");
                }
            }
        }
    }

    async fn player_added(&mut self, player_number: &PhoneId) {
        info!(player = %player_number, "new player entered telemarketopia");
    }

    fn carry_ambient(&mut self, previous: &Self) {
        self.coordinator = previous.coordinator.clone();
    }
}

// ---------------------------------------------------------------------
// Rooms and the Script they wire together
// ---------------------------------------------------------------------

/// The first room any caller hits: plays the recruitment pitch and
/// gathers one digit choosing a path. The digit is folded into state on
/// the *next* request via `new_player_choice`, per the Room/Scene
/// contract (§4.8): the player is recruited before the scene advances
/// past this room.
pub struct GreetingRoom {
    media: Arc<MediaCatalog>,
    asset_id: u64,
}

impl GreetingRoom {
    pub fn new(media: Arc<MediaCatalog>, asset_id: u64) -> Self {
        Self { media, asset_id }
    }
}

#[async_trait]
impl Room<TelemarketopiaState> for GreetingRoom {
    fn name(&self) -> &str {
        "greeting"
    }

    async fn load(&self) {
        if let Err(e) = self.media.load(self.asset_id).await {
            warn!(error = %e, "failed to warm the greeting media asset");
        }
    }

    fn new_player_choice(&self, digit: &str, ctx: &mut RoomContext<TelemarketopiaState>) {
        let (path, players_field, waiting_field) = match digit {
            "1" => (PATH_CLAVAE, "clavae_players", "clavae_waiting_for_conf"),
            _ => (PATH_KAREN, "karen_players", "karen_waiting_for_conf"),
        };

        ctx.script_data().insert(PATH_KEY.to_string(), Value::String(path.to_string()));

        let player = ctx.player_number.clone();
        if let Err(e) = ctx.shard.append(players_field, player.clone(), false) {
            warn!(error = %e, "failed to recruit new player onto a path");
        }
        if let Err(e) = ctx.shard.append(waiting_field, player.clone(), false) {
            warn!(error = %e, "failed to queue new player for the first conference");
        }
        ctx.shard.mark_player_added(player);
    }

    async fn action(&self, _ctx: &mut RoomContext<TelemarketopiaState>) -> StoryResult<VoiceResponse> {
        let asset = self.media.load(self.asset_id).await?;
        Ok(VoiceResponse::new().gather(1, "/tipline/start", VoiceResponse::new().play(&asset.url)))
    }
}

/// Plays a path-specific recruitment appeal and ends the scene, sending
/// the player to the waiting room.
pub struct PathIntakeRoom {
    room_name: &'static str,
    media: Arc<MediaCatalog>,
    asset_id: u64,
}

impl PathIntakeRoom {
    pub fn new(room_name: &'static str, media: Arc<MediaCatalog>, asset_id: u64) -> Self {
        Self { room_name, media, asset_id }
    }
}

#[async_trait]
impl Room<TelemarketopiaState> for PathIntakeRoom {
    fn name(&self) -> &str {
        self.room_name
    }

    async fn load(&self) {
        if let Err(e) = self.media.load(self.asset_id).await {
            warn!(error = %e, room = self.room_name, "failed to warm an intake room's media asset");
        }
    }

    async fn action(&self, ctx: &mut RoomContext<TelemarketopiaState>) -> StoryResult<VoiceResponse> {
        let asset = self.media.load(self.asset_id).await?;
        ctx.end_scene();
        Ok(VoiceResponse::new().play(&asset.url))
    }
}

/// Holds a player while they wait to be matched or to be called back into
/// a conference. Has no outgoing choices, so the owning scene ends every
/// time it runs and the player simply stays in the `WAITING` state.
pub struct PleaseWaitRoom {
    media: Arc<MediaCatalog>,
    asset_id: u64,
}

impl PleaseWaitRoom {
    pub fn new(media: Arc<MediaCatalog>, asset_id: u64) -> Self {
        Self { media, asset_id }
    }
}

#[async_trait]
impl Room<TelemarketopiaState> for PleaseWaitRoom {
    fn name(&self) -> &str {
        "please_wait"
    }

    async fn load(&self) {
        if let Err(e) = self.media.load(self.asset_id).await {
            warn!(error = %e, "failed to warm the please-wait media asset");
        }
    }

    async fn action(&self, ctx: &mut RoomContext<TelemarketopiaState>) -> StoryResult<VoiceResponse> {
        let asset = self.media.load(self.asset_id).await?;
        ctx.end_scene();
        Ok(VoiceResponse::new().play(&asset.url))
    }
}

pub struct TelemarketopiaAssets {
    pub greeting: u64,
    pub clavae_intake: u64,
    pub karen_intake: u64,
    pub please_wait: u64,
}

/// Wires the Rooms above into the `intro` and `waiting_room` Scenes and
/// registers both against the `telemarketopia` Script.
pub fn build_script(media: Arc<MediaCatalog>, assets: TelemarketopiaAssets) -> Script<TelemarketopiaState> {
    let mut intro_choices = Choices::new();
    intro_choices.insert("greeting", "*", "1", vec!["clavae_intake".to_string()]);
    intro_choices.insert("greeting", "*", "2", vec!["karen_intake".to_string()]);

    let mut intro = Scene::new("intro", vec!["greeting".to_string()], intro_choices);
    intro.register_room(Arc::new(GreetingRoom::new(media.clone(), assets.greeting)));
    intro.register_room(Arc::new(PathIntakeRoom::new("clavae_intake", media.clone(), assets.clavae_intake)));
    intro.register_room(Arc::new(PathIntakeRoom::new("karen_intake", media.clone(), assets.karen_intake)));

    let mut waiting = Scene::new("waiting_room", vec!["please_wait".to_string()], Choices::new());
    waiting.register_room(Arc::new(PleaseWaitRoom::new(media, assets.please_wait)));

    let mut script = Script::new(SCRIPT_NAME);
    script.register(SCRIPT_NEW_STATE, "*", SceneAndNextState::new(Arc::new(intro), "WAITING"));
    script.register("WAITING", "*", SceneAndNextState::new(Arc::new(waiting), SCRIPT_IGNORE_CHANGE));
    script
}

// ---------------------------------------------------------------------
// Conference webhook bookkeeping (called from the HTTP layer's
// /conf/status handler, grounded on `ConferenceEventHandler`)
// ---------------------------------------------------------------------

/// Fired on a `conference-start` event for one participant: records that
/// they're in the first conference and who their partner is.
pub async fn record_conference_start(players: &PlayerStore, participant: &PhoneId, partner: &PhoneId) -> StoryResult<()> {
    let mut player = players.load(participant).await?;
    if let Some(info) = player.script_mut(SCRIPT_NAME) {
        info.data.insert(PLAYER_IN_FIRST_CONFERENCE_KEY.to_string(), Value::Bool(true));
        info.data.insert(PARTNER_KEY.to_string(), Value::String(partner.e164().to_string()));
    }
    players.save(&player).await
}

/// Fired on a `conference-leave` event for one participant: marks them
/// ready to record a post-conference decision and sends the path-specific
/// options text.
pub async fn record_conference_leave(
    players: &PlayerStore,
    voice: &dyn VoiceGateway,
    conference_number: &PhoneId,
    leaving: &PhoneId,
) -> StoryResult<()> {
    let mut player = players.load(leaving).await?;
    let path = player
        .script(SCRIPT_NAME)
        .and_then(|s| s.data.get(PATH_KEY))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(info) = player.script_mut(SCRIPT_NAME) {
        info.data.insert(HAS_DECISION_TEXT_KEY.to_string(), Value::Bool(true));
    }
    players.save(&player).await?;

    let text = match path.as_deref() {
        Some(PATH_KAREN) => KAREN_POST_CONF_TEXT,
        _ => CLAVAE_POST_CONF_TEXT,
    };
    voice.send_sms(leaving, conference_number, text, None).await
}

// ---------------------------------------------------------------------
// Text handling
// ---------------------------------------------------------------------

/// Dependencies shared by the final-puzzle tasks and the text handler
/// that enqueues them.
pub struct FinalPuzzleDeps {
    pub voice: Arc<dyn VoiceGateway>,
    pub players: Arc<PlayerStore>,
    pub numbers: Arc<NumberLibrary>,
    pub conferences: Arc<ConferenceRegistry>,
    pub runner: TaskRunner,
    pub final_number_label: String,
    pub climax_base_url: String,
    pub final_climax_base_url: String,
    pub clavae_puzzle_texts: (String, String),
    pub karen_puzzle_texts: (String, String),
}

/// The three inbound-SMS branches telemarketopia cares about, all keyed
/// on which of its two outbound numbers was texted. Grounded on
/// `ConferenceChecker.new_text`.
pub struct ConferenceTextHandler {
    pub numbers: Arc<NumberLibrary>,
    pub players: Arc<PlayerStore>,
    pub deps: Arc<FinalPuzzleDeps>,
    pub conference_label: String,
}

impl ConferenceTextHandler {
    async fn handle_conference_number(&self, caller: &PhoneId, body: &str, script: &mut ScriptInfo) -> StoryResult<()> {
        let already_in_conference = script.data.get(PLAYER_IN_FIRST_CONFERENCE_KEY).and_then(Value::as_bool).unwrap_or(false);
        if !already_in_conference {
            script.data.insert(READY_FOR_CONF_KEY.to_string(), Value::Bool(true));
            return Ok(());
        }

        let has_decision_text = script.data.get(HAS_DECISION_TEXT_KEY).and_then(Value::as_bool).unwrap_or(false);
        if !has_decision_text {
            return Ok(());
        }

        let choice = body.trim().to_string();
        script.data.insert(FINAL_CHOICE_KEY.to_string(), Value::String(choice.clone()));

        let Some(partner_number) = script.data.get(PARTNER_KEY).and_then(Value::as_str).map(PhoneId::from_e164) else {
            return Ok(());
        };
        let partner = self.players.load(&partner_number).await?;
        let Some(partner_choice) = partner
            .script(SCRIPT_NAME)
            .and_then(|s| s.data.get(FINAL_CHOICE_KEY))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(());
        };

        let caller_path = script.data.get(PATH_KEY).and_then(Value::as_str).unwrap_or(PATH_CLAVAE);
        let (clavae_number, clavae_choice, karen_number, karen_choice) = if caller_path == PATH_CLAVAE {
            (caller.clone(), choice, partner_number, partner_choice)
        } else {
            (partner_number, partner_choice, caller.clone(), choice)
        };

        self.deps
            .runner
            .enqueue(Box::new(MakeClimaxCallsTask {
                deps: self.deps.clone(),
                clavae_number,
                clavae_choice,
                karen_number,
                karen_choice,
            }))
            .await;
        Ok(())
    }

    async fn handle_final_number(&self, caller: &PhoneId, body: &str, script: &ScriptInfo) -> StoryResult<()> {
        let got_right_answer = body.trim() == "462";

        let Some(partner_number) = script.data.get(PARTNER_KEY).and_then(Value::as_str).map(PhoneId::from_e164) else {
            return Ok(());
        };
        let caller_path = script.data.get(PATH_KEY).and_then(Value::as_str).unwrap_or(PATH_CLAVAE);
        let (clavae_number, karen_number) = if caller_path == PATH_CLAVAE { (caller.clone(), partner_number) } else { (partner_number, caller.clone()) };

        self.deps
            .runner
            .enqueue(Box::new(SendFinalFinalResult { deps: self.deps.clone(), clavae_number, karen_number, got_right_answer }))
            .await;
        Ok(())
    }
}

#[async_trait]
impl TextHandler<TelemarketopiaState> for ConferenceTextHandler {
    fn name(&self) -> &str {
        "conference_checker"
    }

    async fn handle(
        &self,
        caller: &PhoneId,
        called: &PhoneId,
        body: &str,
        script: &mut ScriptInfo,
        _shard: &mut Shard<TelemarketopiaState>,
    ) -> StoryResult<()> {
        if Some(called.clone()) == self.numbers.from_label(&self.conference_label) {
            return self.handle_conference_number(caller, body, script).await;
        }
        if Some(called.clone()) == self.numbers.from_label(&self.deps.final_number_label) {
            return self.handle_final_number(caller, body, script).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Final-puzzle tasks
// ---------------------------------------------------------------------

/// Places both climax-result calls and, if both players chose the same
/// final option, triggers the ending sequence. Grounded on
/// `MakeClimaxCallsTask.execute`.
pub struct MakeClimaxCallsTask {
    pub deps: Arc<FinalPuzzleDeps>,
    pub clavae_number: PhoneId,
    pub clavae_choice: String,
    pub karen_number: PhoneId,
    pub karen_choice: String,
}

impl fmt::Debug for MakeClimaxCallsTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MakeClimaxCallsTask({}/{}, {}/{})", self.clavae_number, self.clavae_choice, self.karen_number, self.karen_choice)
    }
}

#[async_trait]
impl Task for MakeClimaxCallsTask {
    async fn execute(self: Box<Self>) -> Result<(), String> {
        let from = self.deps.numbers.from_label(&self.deps.final_number_label).unwrap_or_else(|| self.clavae_number.clone());
        let url = format!("{}/{}/{}", self.deps.climax_base_url, self.clavae_choice, self.karen_choice);

        if let Err(e) = self.deps.voice.place_call(&self.clavae_number, &from, &url).await {
            warn!(error = %e, "failed to place Clavae's climax call");
        }
        if let Err(e) = self.deps.voice.place_call(&self.karen_number, &from, &url).await {
            warn!(error = %e, "failed to place Karen's climax call");
        }

        if self.clavae_choice == "3" && self.karen_choice == "3" {
            self.deps
                .runner
                .enqueue(Box::new(DestroyTelemarketopia {
                    deps: self.deps.clone(),
                    clavae_number: self.clavae_number.clone(),
                    karen_number: self.karen_number.clone(),
                }))
                .await;
        }
        Ok(())
    }
}

/// Places both final-puzzle result calls. Grounded on
/// `SendFinalFinalResult.execute`.
pub struct SendFinalFinalResult {
    pub deps: Arc<FinalPuzzleDeps>,
    pub clavae_number: PhoneId,
    pub karen_number: PhoneId,
    pub got_right_answer: bool,
}

impl fmt::Debug for SendFinalFinalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SendFinalFinalResult({}, {}, right={})", self.clavae_number, self.karen_number, self.got_right_answer)
    }
}

#[async_trait]
impl Task for SendFinalFinalResult {
    async fn execute(self: Box<Self>) -> Result<(), String> {
        let from = self.deps.numbers.from_label(&self.deps.final_number_label).unwrap_or_else(|| self.clavae_number.clone());
        let outcome = if self.got_right_answer { "right" } else { "wrong" };
        let url = format!("{}/{}", self.deps.final_climax_base_url, outcome);

        if let Err(e) = self.deps.voice.place_call(&self.clavae_number, &from, &url).await {
            warn!(error = %e, "failed to place Clavae's final-result call");
        }
        if let Err(e) = self.deps.voice.place_call(&self.karen_number, &from, &url).await {
            warn!(error = %e, "failed to place Karen's final-result call");
        }
        Ok(())
    }
}

/// Sends both players their final puzzle clues, dials them directly into
/// a second conference with no readiness handshake (the resolved Open
/// Question in §9: unlike the first conference, the climax does not wait
/// on a "ready" reply), and marks them `_in_final_final`. Grounded on
/// `DestroyTelemarketopia.execute`.
pub struct DestroyTelemarketopia {
    pub deps: Arc<FinalPuzzleDeps>,
    pub clavae_number: PhoneId,
    pub karen_number: PhoneId,
}

impl fmt::Debug for DestroyTelemarketopia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestroyTelemarketopia({}, {})", self.clavae_number, self.karen_number)
    }
}

impl DestroyTelemarketopia {
    async fn mark_in_final_final(&self, player: &PhoneId) -> StoryResult<()> {
        let mut p = self.deps.players.load(player).await?;
        if let Some(info) = p.script_mut(SCRIPT_NAME) {
            info.data.insert(IN_FINAL_FINAL_KEY.to_string(), Value::Bool(true));
        }
        self.deps.players.save(&p).await
    }
}

#[async_trait]
impl Task for DestroyTelemarketopia {
    async fn execute(self: Box<Self>) -> Result<(), String> {
        let final_number = self
            .deps
            .numbers
            .from_label(&self.deps.final_number_label)
            .ok_or_else(|| "no number labeled for the final puzzle".to_string())?;

        let (clavae_first, clavae_second) = &self.deps.clavae_puzzle_texts;
        if let Err(e) = self.deps.voice.send_sms(&self.clavae_number, &final_number, clavae_first, None).await {
            warn!(error = %e, "failed to send Clavae's first final-puzzle text");
        }
        if let Err(e) = self.deps.voice.send_sms(&self.clavae_number, &final_number, clavae_second, None).await {
            warn!(error = %e, "failed to send Clavae's second final-puzzle text");
        }

        let (karen_first, karen_second) = &self.deps.karen_puzzle_texts;
        if let Err(e) = self.deps.voice.send_sms(&self.karen_number, &final_number, karen_first, None).await {
            warn!(error = %e, "failed to send Karen's first final-puzzle text");
        }
        if let Err(e) = self.deps.voice.send_sms(&self.karen_number, &final_number, karen_second, None).await {
            warn!(error = %e, "failed to send Karen's second final-puzzle text");
        }

        for player in [&self.clavae_number, &self.karen_number] {
            if let Err(e) = self.mark_in_final_final(player).await {
                warn!(player = %player, error = %e, "failed to mark a player in the final conference");
            }
        }

        // Unlike the first conference there is no readiness handshake: both
        // players are dialed straight in through the ordinary conference
        // twiml route.
        let conference = self.deps.conferences.create(final_number.clone()).await.map_err(|e| e.to_string())?;
        let twiml = format!("/conf/twiml/{}", conference.id);
        if let Err(e) = self.deps.voice.place_call(&self.clavae_number, &final_number, &twiml).await {
            warn!(error = %e, "failed to dial Clavae into the final conference");
        }
        if let Err(e) = self.deps.voice.place_call(&self.karen_number, &final_number, &twiml).await {
            warn!(error = %e, "failed to dial Karen into the final conference");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conference::{ConferenceRegistry, PairingConfig};
    use crate::kv::MemoryKvStore;
    use crate::shard::{ChangeSink, ScriptStateManager};
    use crate::voice::NullVoiceGateway;
    use std::time::Duration;

    fn num(raw: &str) -> PhoneId {
        PhoneId::parse(raw).unwrap()
    }

    fn pairing_config() -> PairingConfig {
        PairingConfig {
            path_a_waiting_field: "clavae_waiting_for_conf".to_string(),
            path_a_in_conf_field: "clavae_in_conf".to_string(),
            path_b_waiting_field: "karen_waiting_for_conf".to_string(),
            path_b_in_conf_field: "karen_in_conf".to_string(),
            conference_number_label: "conference".to_string(),
            path_a_intro_asset: 2,
            path_b_intro_asset: 3,
            nudge_asset_id: 1,
            ready_request_text: "text back anything when you're ready".to_string(),
            retext_nudge: "still there?".to_string(),
            returned_replied_text: "they never showed".to_string(),
            returned_unreplied_text: "you never replied".to_string(),
            ready_deadline_secs: 600,
            poll_interval_secs: 15,
            retext_after_secs: 300,
            connect_wait_secs: 30,
            nudge_after_secs: 300,
        }
    }

    async fn wired_manager() -> (Arc<ScriptStateManager<TelemarketopiaState>>, Arc<NullVoiceGateway>, Arc<PlayerStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let manager = Arc::new(ScriptStateManager::<TelemarketopiaState>::new(SCRIPT_NAME, kv.clone(), runner.clone()));
        let voice = Arc::new(NullVoiceGateway::new());
        let players = Arc::new(PlayerStore::new(kv.clone()));
        let manifest = r#"[{"number": "5105550000", "labels": ["conference"], "capabilities": ["voice", "sms"]}]"#;
        let numbers = Arc::new(NumberLibrary::from_manifest_json(manifest).unwrap());
        let media = Arc::new(MediaCatalog::new(Box::new(crate::catalog::HttpMediaSource::new("http://unused", "u", "k"))));
        let conferences = Arc::new(ConferenceRegistry::new(kv));

        let deps = Arc::new(CoordinatorDeps {
            state_manager: manager.clone(),
            players: players.clone(),
            voice: voice.clone(),
            conferences,
            media,
            numbers,
            runner,
            config: pairing_config(),
        });
        manager.mutate_state(|s| s.set_coordinator(deps)).await;

        (manager, voice, players)
    }

    #[tokio::test]
    async fn do_reduce_matches_a_waiting_pair_and_starts_a_conference() {
        let (manager, voice, _players) = wired_manager().await;

        let mut shard = manager.shard().await;
        shard.append("clavae_waiting_for_conf", num("5105551111"), false).unwrap();
        manager.integrate(shard.into_task().changes).await.unwrap();

        let mut shard = manager.shard().await;
        shard.append("karen_waiting_for_conf", num("5105552222"), false).unwrap();
        manager.integrate(shard.into_task().changes).await.unwrap();

        manager.reduce().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = manager.snapshot().await;
        assert_eq!(state.clavae_in_conf, vec![num("5105551111")]);
        assert_eq!(state.karen_in_conf, vec![num("5105552222")]);
        assert!(state.clavae_waiting_for_conf.is_empty());

        let calls = voice.calls().await;
        assert_eq!(calls.len(), 2, "both players should be sent the readiness request");
    }

    #[tokio::test]
    async fn on_startup_moves_in_conf_back_to_waiting() {
        let (manager, _voice, _players) = wired_manager().await;
        manager
            .mutate_state(|s| {
                s.clavae_in_conf.push(num("5105551111"));
                s.karen_in_conf.push(num("5105552222"));
            })
            .await;

        manager.load_and_reconcile().await.unwrap();

        let state = manager.snapshot().await;
        assert_eq!(state.clavae_waiting_for_conf, vec![num("5105551111")]);
        assert_eq!(state.karen_waiting_for_conf, vec![num("5105552222")]);
        assert!(state.clavae_in_conf.is_empty());
        assert!(state.karen_in_conf.is_empty());
    }

    #[tokio::test]
    async fn on_startup_deletes_a_player_recruited_onto_both_paths() {
        let (manager, _voice, players) = wired_manager().await;
        let confused = num("5105559999");

        let mut p = players.load(&confused).await.unwrap();
        p.set_script(SCRIPT_NAME, ScriptInfo::new());
        players.save(&p).await.unwrap();

        manager
            .mutate_state(|s| {
                s.clavae_players.push(confused.clone());
                s.karen_players.push(confused.clone());
                s.clavae_waiting_for_conf.push(confused.clone());
            })
            .await;

        manager.load_and_reconcile().await.unwrap();

        let state = manager.snapshot().await;
        assert!(!state.clavae_players.contains(&confused));
        assert!(!state.karen_players.contains(&confused));
        assert!(!state.clavae_waiting_for_conf.contains(&confused));

        let reloaded = players.load(&confused).await.unwrap();
        assert!(reloaded.script(SCRIPT_NAME).is_none(), "confused player's record should be wiped");
    }

    #[tokio::test]
    async fn conference_number_readiness_branch_sets_ready_flag_before_conference() {
        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let players = Arc::new(PlayerStore::new(kv.clone()));
        let manifest = r#"[
            {"number": "5105550000", "labels": ["conference"], "capabilities": ["voice", "sms"]},
            {"number": "5105550001", "labels": ["final"], "capabilities": ["voice", "sms"]}
        ]"#;
        let numbers = Arc::new(NumberLibrary::from_manifest_json(manifest).unwrap());
        let deps = Arc::new(FinalPuzzleDeps {
            voice: Arc::new(NullVoiceGateway::new()),
            players: players.clone(),
            numbers: numbers.clone(),
            conferences: Arc::new(ConferenceRegistry::new(kv.clone())),
            runner,
            final_number_label: "final".to_string(),
            climax_base_url: "/climax".to_string(),
            final_climax_base_url: "/finalclimax".to_string(),
            clavae_puzzle_texts: ("c1".to_string(), "c2".to_string()),
            karen_puzzle_texts: ("k1".to_string(), "k2".to_string()),
        });

        let handler = ConferenceTextHandler { numbers, players, deps, conference_label: "conference".to_string() };

        let caller = num("5105551111");
        let conference_number = num("5105550000");
        let kv2 = Arc::new(MemoryKvStore::new());
        let manager = Arc::new(ScriptStateManager::<TelemarketopiaState>::new(SCRIPT_NAME, kv2, TaskRunner::spawn()));
        let mut shard = manager.shard().await;
        let mut script = ScriptInfo::new();

        handler.handle(&caller, &conference_number, "ready", &mut script, &mut shard).await.unwrap();
        assert!(script.data.contains_key(READY_FOR_CONF_KEY));
    }

    #[tokio::test]
    async fn post_conference_choice_enqueues_climax_call_once_both_players_have_answered() {
        let kv = Arc::new(MemoryKvStore::new());
        let voice = Arc::new(NullVoiceGateway::new());
        let runner = TaskRunner::spawn();
        let players = Arc::new(PlayerStore::new(kv.clone()));
        let manifest = r#"[
            {"number": "5105550000", "labels": ["conference"], "capabilities": ["voice", "sms"]},
            {"number": "5105550001", "labels": ["final"], "capabilities": ["voice", "sms"]}
        ]"#;
        let numbers = Arc::new(NumberLibrary::from_manifest_json(manifest).unwrap());
        let deps = Arc::new(FinalPuzzleDeps {
            voice: voice.clone(),
            players: players.clone(),
            numbers: numbers.clone(),
            conferences: Arc::new(ConferenceRegistry::new(kv.clone())),
            runner,
            final_number_label: "final".to_string(),
            climax_base_url: "/climax".to_string(),
            final_climax_base_url: "/finalclimax".to_string(),
            clavae_puzzle_texts: ("c1".to_string(), "c2".to_string()),
            karen_puzzle_texts: ("k1".to_string(), "k2".to_string()),
        });
        let handler = ConferenceTextHandler { numbers, players: players.clone(), deps, conference_label: "conference".to_string() };

        let clavae_number = num("5105551111");
        let karen_number = num("5105552222");

        let mut karen = players.load(&karen_number).await.unwrap();
        let mut karen_script = ScriptInfo::new();
        karen_script.data.insert(PATH_KEY.to_string(), Value::String(PATH_KAREN.to_string()));
        karen_script.data.insert(PLAYER_IN_FIRST_CONFERENCE_KEY.to_string(), Value::Bool(true));
        karen_script.data.insert(HAS_DECISION_TEXT_KEY.to_string(), Value::Bool(true));
        karen_script.data.insert(FINAL_CHOICE_KEY.to_string(), Value::String("2".to_string()));
        karen_script.data.insert(PARTNER_KEY.to_string(), Value::String(clavae_number.e164().to_string()));
        karen.set_script(SCRIPT_NAME, karen_script);
        players.save(&karen).await.unwrap();

        let mut clavae_script = ScriptInfo::new();
        clavae_script.data.insert(PATH_KEY.to_string(), Value::String(PATH_CLAVAE.to_string()));
        clavae_script.data.insert(PLAYER_IN_FIRST_CONFERENCE_KEY.to_string(), Value::Bool(true));
        clavae_script.data.insert(HAS_DECISION_TEXT_KEY.to_string(), Value::Bool(true));
        clavae_script.data.insert(PARTNER_KEY.to_string(), Value::String(karen_number.e164().to_string()));

        let conference_number = num("5105550000");
        let kv3 = Arc::new(MemoryKvStore::new());
        let manager = Arc::new(ScriptStateManager::<TelemarketopiaState>::new(SCRIPT_NAME, kv3, TaskRunner::spawn()));
        let mut shard = manager.shard().await;

        handler.handle(&clavae_number, &conference_number, "1", &mut clavae_script, &mut shard).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let calls = voice.calls().await;
        assert!(calls.iter().any(|c| matches!(c, crate::voice::RecordedCall::PlaceCall { twiml_url, .. } if twiml_url.contains("/climax/1/2"))));
    }
}
