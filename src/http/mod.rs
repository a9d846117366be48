//! HTTP surface (front door): an `axum` router over a shared `AppState`
//! exposing voice/SMS webhooks and a small debug surface, built the way
//! `server.rs`/`api/mod.rs` build a router over shared state elsewhere in
//! this codebase.

use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::catalog::{MediaCatalog, NumberLibrary};
use crate::conference::ConferenceRegistry;
use crate::engine::Script;
use crate::error::StoryResult;
use crate::kv::KvStore;
use crate::narrative::{self, TelemarketopiaState};
use crate::phone::PhoneId;
use crate::player::{Player, PlayerStore, ScriptInfo};
use crate::shard::ScriptStateManager;
use crate::tasks::TaskRunner;
use crate::text_handler::TextPipeline;
use crate::voice::{ConferenceDial, VoiceGateway, VoiceResponse};

/// Shared, Arc-wrapped handles every request needs. One narrative
/// (`telemarketopia`) is wired in directly rather than behind a registry of
/// trait objects — it's a worked example, not a plugin surface with its
/// own extension contract.
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub voice: Arc<dyn VoiceGateway>,
    pub media: Arc<MediaCatalog>,
    pub numbers: Arc<NumberLibrary>,
    pub runner: TaskRunner,
    pub players: Arc<PlayerStore>,
    pub conferences: Arc<ConferenceRegistry>,
    pub script: Arc<Script<TelemarketopiaState>>,
    pub state_manager: Arc<ScriptStateManager<TelemarketopiaState>>,
    pub text_pipeline: TextPipeline<TelemarketopiaState>,
    pub error_report_numbers: Vec<PhoneId>,
    pub error_report_from: PhoneId,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tipline/start", get(tipline_start).post(tipline_start))
        .route("/tipline/sms", get(tipline_sms).post(tipline_sms))
        .route("/conf/twiml/:conf_id", get(conf_twiml).post(conf_twiml))
        .route("/conf/status/:conf_id", get(conf_status).post(conf_status))
        .route("/climax/:clavae/:karen", get(climax).post(climax))
        .route("/finalclimax/:outcome", get(final_climax).post(final_climax))
        .route("/debug/players", get(debug_list_players))
        .route("/debug/players/:number/reset", post(debug_reset_player))
        .route("/debug/players/:number/snapshot", post(debug_load_snapshot))
        .with_state(state)
}

fn voice_xml(response: VoiceResponse) -> Response {
    (StatusCode::OK, [("content-type", "application/xml")], response.to_xml()).into_response()
}

/// `From`/`To`/`Called`/`Digits` as delivered by a voice webhook. `Called`
/// is preferred over `To` when both are present, matching the voice
/// platform's own documented precedence for which number the callee
/// actually reached.
#[derive(Debug, Deserialize)]
pub struct TwilRequest {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
    #[serde(rename = "Called", default)]
    pub called: Option<String>,
    #[serde(rename = "Digits", default)]
    pub digits: Option<String>,
}

impl TwilRequest {
    fn caller(&self) -> StoryResult<PhoneId> {
        PhoneId::parse(&self.from)
    }

    fn dialed(&self) -> StoryResult<PhoneId> {
        let raw = self.called.as_deref().or(self.to.as_deref()).unwrap_or(&self.from);
        PhoneId::parse(raw)
    }
}

#[derive(Debug, Deserialize)]
pub struct TwilSmsRequest {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
    #[serde(rename = "Called", default)]
    pub called: Option<String>,
    #[serde(rename = "Body", default)]
    pub body: String,
}

async fn report_error(state: &AppState, context: &str, err: &crate::error::StoryError) {
    error!(%context, error = %err, "unrecoverable story engine error");
    let body = format!("story engine error in {context}: {err}");
    for number in &state.error_report_numbers {
        if let Err(e) = state.voice.send_sms(number, &state.error_report_from, &body, None).await {
            warn!(error = %e, "failed to send an operator error report");
        }
    }
}

fn apology_response() -> VoiceResponse {
    VoiceResponse::new().say("Please give us a moment.")
}

/// The router-level decision: continue an in-progress script, start a new
/// one, or decline so another script could try. With exactly one narrative
/// wired in, declining just means falling through to the apology response.
async fn handle_voice_request(state: &AppState, req: &TwilRequest) -> Response {
    let (caller, dialed) = match (req.caller(), req.dialed()) {
        (Ok(c), Ok(d)) => (c, d),
        _ => return voice_xml(apology_response()),
    };

    let mut player = match state.players.load(&caller).await {
        Ok(p) => p,
        Err(e) => {
            report_error(state, "loading player", &e).await;
            return voice_xml(apology_response());
        }
    };

    if !state.script.player_is_playing(&player) && !state.script.call_could_start_game(&dialed) {
        return voice_xml(VoiceResponse::new().say("This number isn't playing anything right now."));
    }

    let mut shard = state.state_manager.shard().await;
    let result = state.script.play(&mut player, &dialed, &mut shard, req.digits.as_deref()).await;

    match result {
        Ok(response) => {
            if let Err(e) = state.players.save(&player).await {
                report_error(state, "saving player after voice request", &e).await;
            }
            state.runner.enqueue(Box::new(shard.into_task())).await;
            voice_xml(response)
        }
        Err(e) => {
            report_error(state, "running the script", &e).await;
            voice_xml(apology_response())
        }
    }
}

async fn tipline_start(State(state): State<Arc<AppState>>, Form(req): Form<TwilRequest>) -> Response {
    handle_voice_request(&state, &req).await
}

async fn tipline_sms(State(state): State<Arc<AppState>>, Form(req): Form<TwilSmsRequest>) -> Response {
    let (caller, called) = match (PhoneId::parse(&req.from), req.called.as_deref().or(req.to.as_deref())) {
        (Ok(c), Some(raw)) => match PhoneId::parse(raw) {
            Ok(called) => (c, called),
            Err(_) => return voice_xml(VoiceResponse::new()),
        },
        _ => return voice_xml(VoiceResponse::new()),
    };

    let mut player = match state.players.load(&caller).await {
        Ok(p) => p,
        Err(e) => {
            report_error(&state, "loading player for sms", &e).await;
            return voice_xml(VoiceResponse::new());
        }
    };

    if !state.script.player_is_playing(&player) {
        return voice_xml(VoiceResponse::new());
    }

    let mut shard = state.state_manager.shard().await;
    let script_name = state.script.name().to_string();
    let Some(script_info) = player.script_mut(&script_name) else {
        return voice_xml(VoiceResponse::new());
    };

    if let Err(e) = state.text_pipeline.run(&caller, &called, &req.body, script_info, &mut shard).await {
        report_error(&state, "running the text handler pipeline", &e).await;
    }

    if let Err(e) = state.players.save(&player).await {
        report_error(&state, "saving player after sms", &e).await;
    }
    state.runner.enqueue(Box::new(shard.into_task())).await;
    voice_xml(VoiceResponse::new())
}

fn conference_name(conf_id: u64) -> String {
    format!("{}-{conf_id}", narrative::SCRIPT_NAME)
}

async fn conf_twiml(State(state): State<Arc<AppState>>, Path(conf_id): Path<u64>, Form(req): Form<TwilRequest>) -> Response {
    let mut record = match state.conferences.find(conf_id).await {
        Ok(Some(r)) => r,
        Ok(None) => return voice_xml(VoiceResponse::new().say("This conference has ended.").hangup()),
        Err(e) => {
            report_error(&state, "loading a conference record for twiml", &e).await;
            return voice_xml(apology_response());
        }
    };

    let mut response = VoiceResponse::new();
    if let Ok(caller) = req.caller() {
        if let Some(asset_id) = record.take_intro(&caller) {
            if let Err(e) = state.conferences.update(&record).await {
                report_error(&state, "clearing a played conference intro", &e).await;
            }
            match state.media.load(asset_id).await {
                Ok(asset) => response = response.play(&asset.url),
                Err(e) => report_error(&state, "loading a conference intro clip", &e).await,
            }
        }
    }

    let dial = ConferenceDial::new(conference_name(conf_id)).status_callback(format!("/conf/status/{conf_id}"));
    voice_xml(response.dial_conference(dial))
}

#[derive(Debug, Deserialize)]
pub struct ConferenceStatusForm {
    #[serde(rename = "StatusCallbackEvent", default)]
    pub event: Option<String>,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "ConferenceSid", default)]
    pub conference_sid: Option<String>,
}

/// Whether `player` has already been sent into the final (destroy)
/// conference, used to keep the final conference's join/leave events from
/// re-triggering the first conference's text hooks.
async fn already_past_first_conference(players: &PlayerStore, player: &PhoneId) -> StoryResult<bool> {
    let loaded = players.load(player).await?;
    Ok(loaded.script(narrative::SCRIPT_NAME).is_some_and(|s| s.data.contains_key(narrative::IN_FINAL_FINAL_KEY)))
}

async fn conf_status(State(state): State<Arc<AppState>>, Path(conf_id): Path<u64>, Form(form): Form<ConferenceStatusForm>) -> Response {
    let mut record = match state.conferences.find(conf_id).await {
        Ok(Some(r)) => r,
        Ok(None) => return voice_xml(VoiceResponse::new()),
        Err(e) => {
            report_error(&state, "loading a conference record for a status callback", &e).await;
            return voice_xml(VoiceResponse::new());
        }
    };

    let event = form.event.as_deref().unwrap_or("");
    let caller = form.from.as_deref().and_then(|f| PhoneId::parse(f).ok());

    match event {
        "conference-start" => {
            record.started_at = Some(chrono::Utc::now());
            if let Some(sid) = form.conference_sid {
                record.twilio_sid = Some(sid);
            }
            if let Err(e) = state.conferences.update(&record).await {
                report_error(&state, "recording conference-start", &e).await;
            }
        }
        "participant-join" => {
            if let Some(caller) = &caller {
                record.mark_active(caller);
                if let Err(e) = state.conferences.update(&record).await {
                    report_error(&state, "recording participant-join", &e).await;
                }

                if !already_past_first_conference(&state.players, caller).await.unwrap_or(false) {
                    let partner = record.participants.keys().find(|p| *p != caller).cloned();
                    if let Some(partner) = partner {
                        if let Err(e) = narrative::record_conference_start(&state.players, caller, &partner).await {
                            report_error(&state, "recording a first-conference join", &e).await;
                        }
                    }
                }
            }
        }
        "participant-leave" => {
            if let Some(caller) = &caller {
                record.mark_left(caller);
                if let Err(e) = state.conferences.update(&record).await {
                    report_error(&state, "recording participant-leave", &e).await;
                }

                if !already_past_first_conference(&state.players, caller).await.unwrap_or(false) {
                    if let Err(e) = narrative::record_conference_leave(&state.players, state.voice.as_ref(), &record.from_number, caller).await {
                        report_error(&state, "recording a first-conference leave", &e).await;
                    }
                }
            }
        }
        _ => {}
    }

    voice_xml(VoiceResponse::new())
}

async fn climax(State(_state): State<Arc<AppState>>, Path((clavae, karen)): Path<(String, String)>) -> Response {
    let response = VoiceResponse::new()
        .play(format!("/assets/climax/clavae-{clavae}.mp3"))
        .play(format!("/assets/climax/karen-{karen}.mp3"));
    voice_xml(response)
}

async fn final_climax(State(_state): State<Arc<AppState>>, Path(outcome): Path<String>) -> Response {
    let response = VoiceResponse::new().play(format!("/assets/finalclimax/{outcome}.mp3"));
    voice_xml(response)
}

#[derive(Debug, Serialize)]
struct DebugPlayerSummary {
    number: String,
}

async fn debug_list_players(State(state): State<Arc<AppState>>) -> Json<Vec<DebugPlayerSummary>> {
    let keys = state.players.list_keys().await.unwrap_or_default();
    Json(keys.into_iter().map(|k| DebugPlayerSummary { number: k.trim_start_matches("plr:").to_string() }).collect())
}

async fn debug_reset_player(State(state): State<Arc<AppState>>, Path(number): Path<String>) -> impl IntoResponse {
    let Ok(phone) = PhoneId::parse(&number) else {
        return (StatusCode::BAD_REQUEST, "invalid phone number").into_response();
    };
    match state.players.delete(&phone).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(error = %e, "failed to reset a player");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub scripts: std::collections::HashMap<String, ScriptInfo>,
}

async fn debug_load_snapshot(State(state): State<Arc<AppState>>, Path(number): Path<String>, Json(req): Json<SnapshotRequest>) -> impl IntoResponse {
    let Ok(phone) = PhoneId::parse(&number) else {
        return (StatusCode::BAD_REQUEST, "invalid phone number").into_response();
    };
    match state.players.advance_generation_to(&phone, req.scripts).await {
        Ok(player) => Json(summarize(&player)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to load a player snapshot");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct PlayerSummary {
    number: String,
    generation: u64,
    scripts: Vec<String>,
}

fn summarize(player: &Player) -> PlayerSummary {
    PlayerSummary {
        number: player.number.e164().to_string(),
        generation: player.generation().unwrap_or(0),
        scripts: vec![narrative::SCRIPT_NAME.to_string()].into_iter().filter(|name| player.script(name).is_some()).collect(),
    }
}
