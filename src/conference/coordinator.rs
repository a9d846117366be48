//! Matchmaking and conference lifecycle as a chain of self-re-enqueuing
//! delayed tasks, rather than one long-running task that sleeps across the
//! whole lifecycle.
//!
//! Grounded on `telemarketopia_conferences.py`'s `ConfStartFirst` →
//! `ConfWaitForPlayers` → `ConnectFirstConference` → `ReturnPlayers` chain.
//! Re-expressing the source's nested `execute`-then-`sleep` shape as
//! distinct re-enqueued task types, rather than one task sleeping twice,
//! keeps a polling wait from occupying a spawned task for longer than one
//! tick.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::catalog::{MediaCatalog, NumberLibrary};
use crate::error::StoryResult;
use crate::phone::PhoneId;
use crate::player::PlayerStore;
use crate::shard::{ScriptStateManager, SharedState};
use crate::tasks::{Task, TaskRunner};
use crate::voice::VoiceGateway;

use super::record::ConferenceRegistry;

/// Key under `ScriptInfo.data` a narrative's TextHandler sets once a
/// player replies they're ready. Cleared on conference start and on
/// return-to-queue.
pub const READY_FOR_CONF_KEY: &str = "_ready_for_conf";

#[derive(Clone)]
pub struct PairingConfig {
    pub path_a_waiting_field: String,
    pub path_a_in_conf_field: String,
    pub path_b_waiting_field: String,
    pub path_b_in_conf_field: String,
    pub conference_number_label: String,
    pub path_a_intro_asset: u64,
    pub path_b_intro_asset: u64,
    pub nudge_asset_id: u64,
    pub ready_request_text: String,
    pub retext_nudge: String,
    pub returned_replied_text: String,
    pub returned_unreplied_text: String,
    pub ready_deadline_secs: u64,
    pub poll_interval_secs: u64,
    pub retext_after_secs: u64,
    pub connect_wait_secs: u64,
    pub nudge_after_secs: u64,
}

pub struct CoordinatorDeps<S: SharedState> {
    pub state_manager: Arc<ScriptStateManager<S>>,
    pub players: Arc<PlayerStore>,
    pub voice: Arc<dyn VoiceGateway>,
    pub conferences: Arc<ConferenceRegistry>,
    pub media: Arc<MediaCatalog>,
    pub numbers: Arc<NumberLibrary>,
    pub runner: TaskRunner,
    pub config: PairingConfig,
}

/// Clears `READY_FOR_CONF_KEY` from a player's `ScriptInfo.data` for
/// `script_name` and saves the player back.
async fn clear_ready_flag<S: SharedState>(deps: &CoordinatorDeps<S>, script_name: &str, player: &PhoneId) -> StoryResult<()> {
    let mut p = deps.players.load(player).await?;
    if let Some(info) = p.script_mut(script_name) {
        info.data.remove(READY_FOR_CONF_KEY);
    }
    deps.players.save(&p).await
}

async fn is_ready_flag_set<S: SharedState>(deps: &CoordinatorDeps<S>, script_name: &str, player: &PhoneId) -> bool {
    match deps.players.load(player).await {
        Ok(p) => p.script(script_name).map(|s| s.data.contains_key(READY_FOR_CONF_KEY)).unwrap_or(false),
        Err(_) => false,
    }
}

pub struct ConfStartFirst<S: SharedState> {
    pub deps: Arc<CoordinatorDeps<S>>,
    pub script_name: String,
    pub path_a: PhoneId,
    pub path_b: PhoneId,
}

impl<S: SharedState> fmt::Debug for ConfStartFirst<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfStartFirst({}, {})", self.path_a, self.path_b)
    }
}

#[async_trait]
impl<S: SharedState> Task for ConfStartFirst<S> {
    async fn execute(self: Box<Self>) -> Result<(), String> {
        clear_ready_flag(&self.deps, &self.script_name, &self.path_a).await.map_err(|e| e.to_string())?;
        clear_ready_flag(&self.deps, &self.script_name, &self.path_b).await.map_err(|e| e.to_string())?;

        let from = self
            .deps
            .voice
            .send_sms(&self.path_a, &self.path_a, &self.deps.config.ready_request_text, None)
            .await;
        if let Err(e) = from {
            warn!(error = %e, "failed to text path_a readiness request");
        }
        if let Err(e) = self.deps.voice.send_sms(&self.path_b, &self.path_b, &self.deps.config.ready_request_text, None).await {
            warn!(error = %e, "failed to text path_b readiness request");
        }

        self.deps
            .runner
            .enqueue(Box::new(ConfWaitForPlayers {
                deps: self.deps.clone(),
                script_name: self.script_name.clone(),
                path_a: self.path_a.clone(),
                path_b: self.path_b.clone(),
                elapsed_secs: 0,
                texted: HashMap::new(),
            }))
            .await;
        Ok(())
    }

    fn delay(&self) -> u64 {
        0
    }
}

pub struct ConfWaitForPlayers<S: SharedState> {
    pub deps: Arc<CoordinatorDeps<S>>,
    pub script_name: String,
    pub path_a: PhoneId,
    pub path_b: PhoneId,
    pub elapsed_secs: u64,
    pub texted: HashMap<PhoneId, bool>,
}

impl<S: SharedState> fmt::Debug for ConfWaitForPlayers<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfWaitForPlayers({}, {}, elapsed={})", self.path_a, self.path_b, self.elapsed_secs)
    }
}

#[async_trait]
impl<S: SharedState> Task for ConfWaitForPlayers<S> {
    /// 30s for the first poll (matching the initial "timer 30s elapsed"
    /// wait), `poll_interval_secs` for every re-poll after that.
    fn delay(&self) -> u64 {
        if self.elapsed_secs == 0 {
            30
        } else {
            self.deps.config.poll_interval_secs
        }
    }

    async fn execute(mut self: Box<Self>) -> Result<(), String> {
        // `delay()` is exactly how long the runner just slept before
        // calling this `execute`; folding it in here keeps `elapsed_secs`
        // tracking real time rather than assuming every tick is a
        // `poll_interval_secs`-long one.
        self.elapsed_secs += self.delay();

        let a_ready = is_ready_flag_set(&self.deps, &self.script_name, &self.path_a).await;
        let b_ready = is_ready_flag_set(&self.deps, &self.script_name, &self.path_b).await;

        if a_ready && b_ready {
            return self.start_conference().await.map_err(|e| e.to_string());
        }

        if self.elapsed_secs >= self.deps.config.retext_after_secs {
            if !a_ready && !*self.texted.get(&self.path_a).unwrap_or(&false) {
                let _ = self.deps.voice.send_sms(&self.path_a, &self.path_a, &self.deps.config.retext_nudge, None).await;
                self.texted.insert(self.path_a.clone(), true);
            }
            if !b_ready && !*self.texted.get(&self.path_b).unwrap_or(&false) {
                let _ = self.deps.voice.send_sms(&self.path_b, &self.path_b, &self.deps.config.retext_nudge, None).await;
                self.texted.insert(self.path_b.clone(), true);
            }
        }

        if self.elapsed_secs >= self.deps.config.ready_deadline_secs {
            self.deps
                .runner
                .enqueue(Box::new(ReturnPlayers {
                    deps: self.deps.clone(),
                    script_name: self.script_name.clone(),
                    path_a: self.path_a.clone(),
                    path_b: self.path_b.clone(),
                    path_a_replied: a_ready,
                    path_b_replied: b_ready,
                }))
                .await;
            return Ok(());
        }

        let next = ConfWaitForPlayers {
            deps: self.deps.clone(),
            script_name: self.script_name.clone(),
            path_a: self.path_a.clone(),
            path_b: self.path_b.clone(),
            elapsed_secs: self.elapsed_secs,
            texted: self.texted.clone(),
        };
        self.deps.runner.enqueue(Box::new(next)).await;
        Ok(())
    }
}

impl<S: SharedState> ConfWaitForPlayers<S> {
    async fn start_conference(&self) -> StoryResult<()> {
        clear_ready_flag(&self.deps, &self.script_name, &self.path_a).await?;
        clear_ready_flag(&self.deps, &self.script_name, &self.path_b).await?;

        let from_number = self.deps.numbers.from_label(&self.deps.config.conference_number_label).unwrap_or_else(|| self.path_a.clone());
        let mut conference = self.deps.conferences.create(from_number.clone()).await?;
        conference.invite(self.path_a.clone(), Some(self.deps.config.path_a_intro_asset));
        conference.invite(self.path_b.clone(), Some(self.deps.config.path_b_intro_asset));
        self.deps.conferences.update(&conference).await?;

        self.deps.voice.place_call(&self.path_a, &from_number, &format!("/conf/twiml/{}", conference.id)).await?;
        self.deps.voice.place_call(&self.path_b, &from_number, &format!("/conf/twiml/{}", conference.id)).await?;

        self.deps
            .runner
            .enqueue(Box::new(ConnectFirstConference {
                deps: self.deps.clone(),
                script_name: self.script_name.clone(),
                path_a: self.path_a.clone(),
                path_b: self.path_b.clone(),
                conference_id: conference.id,
            }))
            .await;
        Ok(())
    }
}

pub struct ConnectFirstConference<S: SharedState> {
    pub deps: Arc<CoordinatorDeps<S>>,
    pub script_name: String,
    pub path_a: PhoneId,
    pub path_b: PhoneId,
    pub conference_id: u64,
}

impl<S: SharedState> fmt::Debug for ConnectFirstConference<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectFirstConference({})", self.conference_id)
    }
}

#[async_trait]
impl<S: SharedState> Task for ConnectFirstConference<S> {
    fn delay(&self) -> u64 {
        self.deps.config.connect_wait_secs
    }

    async fn execute(self: Box<Self>) -> Result<(), String> {
        let record = self.deps.conferences.find(self.conference_id).await.map_err(|e| e.to_string())?;
        let connected = record.map(|r| r.is_active()).unwrap_or(false);

        if !connected {
            self.deps
                .runner
                .enqueue(Box::new(ReturnPlayers {
                    deps: self.deps.clone(),
                    script_name: self.script_name.clone(),
                    path_a: self.path_a.clone(),
                    path_b: self.path_b.clone(),
                    path_a_replied: true,
                    path_b_replied: true,
                }))
                .await;
            return Ok(());
        }

        self.deps
            .runner
            .enqueue(Box::new(NudgeConference { deps: self.deps.clone(), conference_id: self.conference_id }))
            .await;
        Ok(())
    }
}

pub struct NudgeConference<S: SharedState> {
    pub deps: Arc<CoordinatorDeps<S>>,
    pub conference_id: u64,
}

impl<S: SharedState> fmt::Debug for NudgeConference<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NudgeConference({})", self.conference_id)
    }
}

#[async_trait]
impl<S: SharedState> Task for NudgeConference<S> {
    fn delay(&self) -> u64 {
        self.deps.config.nudge_after_secs
    }

    async fn execute(self: Box<Self>) -> Result<(), String> {
        let record = self.deps.conferences.find(self.conference_id).await.map_err(|e| e.to_string())?;
        let Some(record) = record else { return Ok(()) };
        if record.active_count() <= 1 {
            return Ok(());
        }
        let Some(sid) = &record.twilio_sid else { return Ok(()) };
        let asset = self.deps.media.load(self.deps.config.nudge_asset_id).await.map_err(|e| e.to_string())?;
        self.deps.voice.play_into(sid, &asset.url).await.map_err(|e| e.to_string())
    }
}

pub struct ReturnPlayers<S: SharedState> {
    pub deps: Arc<CoordinatorDeps<S>>,
    pub script_name: String,
    pub path_a: PhoneId,
    pub path_b: PhoneId,
    pub path_a_replied: bool,
    pub path_b_replied: bool,
}

impl<S: SharedState> fmt::Debug for ReturnPlayers<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReturnPlayers({}, {})", self.path_a, self.path_b)
    }
}

#[async_trait]
impl<S: SharedState> Task for ReturnPlayers<S> {
    async fn execute(self: Box<Self>) -> Result<(), String> {
        let mut shard = self.deps.state_manager.shard().await;

        shard
            .move_value(&self.deps.config.path_a_in_conf_field, &self.deps.config.path_a_waiting_field, self.path_a.clone(), self.path_a_replied)
            .map_err(|e| e.to_string())?;
        shard
            .move_value(&self.deps.config.path_b_in_conf_field, &self.deps.config.path_b_waiting_field, self.path_b.clone(), self.path_b_replied)
            .map_err(|e| e.to_string())?;

        clear_ready_flag(&self.deps, &self.script_name, &self.path_a).await.map_err(|e| e.to_string())?;
        clear_ready_flag(&self.deps, &self.script_name, &self.path_b).await.map_err(|e| e.to_string())?;

        let text_for = |replied: bool| {
            if replied {
                self.deps.config.returned_replied_text.clone()
            } else {
                self.deps.config.returned_unreplied_text.clone()
            }
        };
        let _ = self.deps.voice.send_sms(&self.path_a, &self.path_a, &text_for(self.path_a_replied), None).await;
        let _ = self.deps.voice.send_sms(&self.path_b, &self.path_b, &text_for(self.path_b_replied), None).await;

        info!(a = %self.path_a, b = %self.path_b, "returned unmatched players to their waiting queues");
        self.deps.runner.enqueue(Box::new(shard.into_task())).await;
        Ok(())
    }
}
