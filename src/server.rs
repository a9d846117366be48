//! Process bring-up: wires every component into one running process
//! behind a fluent builder — setters that return `Self`, a fallible
//! `build`, and a `serve` that blocks until the process is killed.
//!
//! Bring-up order matters for telemarketopia specifically: the
//! `ScriptStateManager` must exist behind an `Arc` before `CoordinatorDeps`
//! can wrap it, the coordinator handle must be injected into the narrative
//! state via `mutate_state` before `load_and_reconcile` runs (so
//! `on_startup`'s reconciliation can re-enqueue matchmaking through a
//! coordinator that's actually present), and the task runner's drain loop
//! must already be spun up before anything is enqueued onto it.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::catalog::{HttpMediaSource, MediaCatalog, NumberLibrary};
use crate::config::{self, Credentials};
use crate::conference::{ConferenceRegistry, CoordinatorDeps, PairingConfig};
use crate::error::{StoryError, StoryResult};
use crate::http::{self, AppState};
use crate::kv::{KvStore, MemoryKvStore, SqliteKvStore};
use crate::narrative::{self, ConferenceTextHandler, FinalPuzzleDeps, TelemarketopiaAssets, TelemarketopiaState};
use crate::player::PlayerStore;
use crate::shard::ScriptStateManager;
use crate::tasks::TaskRunner;
use crate::text_handler::TextPipeline;
use crate::voice::{TwilioVoiceGateway, VoiceGateway};

/// Where to persist the KV store gateway. `Memory` is for tests and local
/// iteration; `Sqlite` is the production-shaped backend.
pub enum Storage {
    Memory,
    Sqlite(String),
}

/// Asset and number-library ids/labels that tie the bundled telemarketopia
/// narrative to a specific deployment's media catalog and outbound number
/// pool. Grounded on `constants.py`'s module-level id/label constants.
pub struct TelemarketopiaConfig {
    pub assets: TelemarketopiaAssets,
    pub pairing: PairingConfig,
    pub final_number_label: String,
    pub climax_base_url: String,
    pub final_climax_base_url: String,
    pub clavae_puzzle_texts: (String, String),
    pub karen_puzzle_texts: (String, String),
}

pub struct ServerBuilder {
    storage: Storage,
    creds_path: Option<String>,
    numbers_path: Option<String>,
    telemarketopia: Option<TelemarketopiaConfig>,
    bind_addr: SocketAddr,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            storage: Storage::Memory,
            creds_path: None,
            numbers_path: None,
            telemarketopia: None,
            bind_addr: "0.0.0.0:3000".parse().unwrap(),
        }
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_credentials_path(mut self, path: impl Into<String>) -> Self {
        self.creds_path = Some(path.into());
        self
    }

    pub fn with_numbers_path(mut self, path: impl Into<String>) -> Self {
        self.numbers_path = Some(path.into());
        self
    }

    pub fn with_telemarketopia(mut self, config: TelemarketopiaConfig) -> Self {
        self.telemarketopia = Some(config);
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Builds every component and returns a process ready to `serve`: KV
    /// gateway, then catalogs, then the shared-state manager and its
    /// coordinator, then the task runner's drain loop, then the HTTP
    /// router.
    pub async fn build(self) -> StoryResult<StoryServer> {
        let creds_path = self.creds_path.ok_or_else(|| StoryError::Configuration("credentials path not provided".to_string()))?;
        let numbers_path = self.numbers_path.ok_or_else(|| StoryError::Configuration("numbers manifest path not provided".to_string()))?;
        let tele_config = self
            .telemarketopia
            .ok_or_else(|| StoryError::Configuration("telemarketopia configuration not provided".to_string()))?;

        let creds = Credentials::load(&creds_path)?;
        let manifest = config::load_numbers_manifest(&numbers_path)?;
        let numbers = Arc::new(NumberLibrary::from_manifest_json(&manifest)?);

        let kv: Arc<dyn KvStore> = match self.storage {
            Storage::Memory => Arc::new(MemoryKvStore::new()),
            Storage::Sqlite(url) => Arc::new(SqliteKvStore::new(&url).await?),
        };

        let media = Arc::new(MediaCatalog::new(Box::new(HttpMediaSource::new(
            creds.media.api_url.clone(),
            creds.media.user.clone(),
            creds.media.private_key.clone(),
        ))));

        let voice: Arc<dyn VoiceGateway> = Arc::new(TwilioVoiceGateway::new(creds.twilio.account_sid.clone(), creds.twilio.auth_token.clone())?);

        let players = Arc::new(PlayerStore::new(kv.clone()));
        let conferences = Arc::new(ConferenceRegistry::new(kv.clone()));
        let runner = TaskRunner::spawn();

        let state_manager = Arc::new(ScriptStateManager::<TelemarketopiaState>::new(narrative::SCRIPT_NAME, kv.clone(), runner.clone()));

        let coordinator_deps = Arc::new(CoordinatorDeps {
            state_manager: state_manager.clone(),
            players: players.clone(),
            voice: voice.clone(),
            conferences: conferences.clone(),
            media: media.clone(),
            numbers: numbers.clone(),
            runner: runner.clone(),
            config: tele_config.pairing,
        });
        state_manager.mutate_state(|s| s.set_coordinator(coordinator_deps.clone())).await;
        state_manager.load_and_reconcile().await?;
        info!("telemarketopia shared state reconciled at startup");

        let script = Arc::new(narrative::build_script(media.clone(), tele_config.assets));

        let final_puzzle_deps = Arc::new(FinalPuzzleDeps {
            voice: voice.clone(),
            players: players.clone(),
            numbers: numbers.clone(),
            conferences: conferences.clone(),
            runner: runner.clone(),
            final_number_label: tele_config.final_number_label,
            climax_base_url: tele_config.climax_base_url,
            final_climax_base_url: tele_config.final_climax_base_url,
            clavae_puzzle_texts: tele_config.clavae_puzzle_texts,
            karen_puzzle_texts: tele_config.karen_puzzle_texts,
        });

        let mut text_pipeline = TextPipeline::new();
        text_pipeline.register(Box::new(ConferenceTextHandler {
            numbers: numbers.clone(),
            players: players.clone(),
            deps: final_puzzle_deps,
            conference_label: "conference".to_string(),
        }));

        let error_report_numbers = creds.error_report_numbers()?;
        let error_report_from = numbers
            .from_label("conference")
            .or_else(|| error_report_numbers.first().cloned())
            .ok_or_else(|| StoryError::Configuration("no number available to send error reports from".to_string()))?;

        let state = Arc::new(AppState {
            kv,
            voice,
            media,
            numbers,
            runner,
            players,
            conferences,
            script,
            state_manager,
            text_pipeline,
            error_report_numbers,
            error_report_from,
        });

        Ok(StoryServer { state, bind_addr: self.bind_addr })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired process, ready to accept connections. Kept separate from
/// `ServerBuilder` so tests can build an `AppState` directly and mount it
/// without going through file-backed configuration loading.
pub struct StoryServer {
    state: Arc<AppState>,
    bind_addr: SocketAddr,
}

impl StoryServer {
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serves the HTTP surface until the process is killed. Does not
    /// return under normal operation.
    pub async fn serve(self) -> StoryResult<()> {
        let router = http::router(self.state);
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| StoryError::Configuration(format!("binding {}: {e}", self.bind_addr)))?;

        info!(addr = %self.bind_addr, "serving");
        axum::serve(listener, router).await.map_err(|e| StoryError::Configuration(format!("server error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tele_config() -> TelemarketopiaConfig {
        TelemarketopiaConfig {
            assets: TelemarketopiaAssets { greeting: 1, clavae_intake: 2, karen_intake: 3, please_wait: 4 },
            pairing: PairingConfig {
                path_a_waiting_field: "clavae_waiting_for_conf".to_string(),
                path_a_in_conf_field: "clavae_in_conf".to_string(),
                path_b_waiting_field: "karen_waiting_for_conf".to_string(),
                path_b_in_conf_field: "karen_in_conf".to_string(),
                conference_number_label: "conference".to_string(),
                path_a_intro_asset: 2,
                path_b_intro_asset: 3,
                nudge_asset_id: 1,
                ready_request_text: "ready?".to_string(),
                retext_nudge: "still there?".to_string(),
                returned_replied_text: "they never showed".to_string(),
                returned_unreplied_text: "you never replied".to_string(),
                ready_deadline_secs: 600,
                poll_interval_secs: 15,
                retext_after_secs: 300,
                connect_wait_secs: 30,
                nudge_after_secs: 300,
            },
            final_number_label: "final".to_string(),
            climax_base_url: "/climax".to_string(),
            final_climax_base_url: "/finalclimax".to_string(),
            clavae_puzzle_texts: ("c1".to_string(), "c2".to_string()),
            karen_puzzle_texts: ("k1".to_string(), "k2".to_string()),
        }
    }

    #[tokio::test]
    async fn missing_credentials_path_is_a_configuration_error() {
        let err = ServerBuilder::new().with_numbers_path("numbers.json").with_telemarketopia(tele_config()).build().await.unwrap_err();
        assert!(matches!(err, StoryError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_telemarketopia_config_is_a_configuration_error() {
        let err = ServerBuilder::new().with_credentials_path("creds.json").with_numbers_path("numbers.json").build().await.unwrap_err();
        assert!(matches!(err, StoryError::Configuration(_)));
    }
}
