//! Process entry point. Reads file paths for credentials and the outbound
//! number manifest, and knobs like `RUST_LOG`, from the environment
//! rather than parsing command-line flags.

use spins_story_engine::conference::PairingConfig;
use spins_story_engine::narrative::TelemarketopiaAssets;
use spins_story_engine::server::{ServerBuilder, Storage, TelemarketopiaConfig};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn telemarketopia_config() -> TelemarketopiaConfig {
    TelemarketopiaConfig {
        assets: TelemarketopiaAssets {
            greeting: env_or("TELE_ASSET_GREETING", "1").parse().expect("TELE_ASSET_GREETING must be a media asset id"),
            clavae_intake: env_or("TELE_ASSET_CLAVAE_INTAKE", "2").parse().expect("TELE_ASSET_CLAVAE_INTAKE must be a media asset id"),
            karen_intake: env_or("TELE_ASSET_KAREN_INTAKE", "3").parse().expect("TELE_ASSET_KAREN_INTAKE must be a media asset id"),
            please_wait: env_or("TELE_ASSET_PLEASE_WAIT", "4").parse().expect("TELE_ASSET_PLEASE_WAIT must be a media asset id"),
        },
        pairing: PairingConfig {
            path_a_waiting_field: "clavae_waiting_for_conf".to_string(),
            path_a_in_conf_field: "clavae_in_conf".to_string(),
            path_b_waiting_field: "karen_waiting_for_conf".to_string(),
            path_b_in_conf_field: "karen_in_conf".to_string(),
            conference_number_label: "conference".to_string(),
            path_a_intro_asset: env_or("TELE_ASSET_CLAVAE_CONF_INTRO", "6").parse().expect("TELE_ASSET_CLAVAE_CONF_INTRO must be a media asset id"),
            path_b_intro_asset: env_or("TELE_ASSET_KAREN_CONF_INTRO", "7").parse().expect("TELE_ASSET_KAREN_CONF_INTRO must be a media asset id"),
            nudge_asset_id: env_or("TELE_ASSET_NUDGE", "5").parse().expect("TELE_ASSET_NUDGE must be a media asset id"),
            ready_request_text: "Text anything back when you're ready to go.".to_string(),
            retext_nudge: "Still there? Text anything to stay in the queue.".to_string(),
            returned_replied_text: "They never showed. You're back in the queue.".to_string(),
            returned_unreplied_text: "You didn't reply in time, so you're back in the queue.".to_string(),
            ready_deadline_secs: 600,
            poll_interval_secs: 15,
            retext_after_secs: 300,
            connect_wait_secs: 30,
            nudge_after_secs: 300,
        },
        final_number_label: "final".to_string(),
        climax_base_url: "/climax".to_string(),
        final_climax_base_url: "/finalclimax".to_string(),
        clavae_puzzle_texts: (
            "Babyface wants a number. Six digits.".to_string(),
            "You'll know it when you hear it again.".to_string(),
        ),
        karen_puzzle_texts: (
            "Karen wants the same number Clavae has.".to_string(),
            "Compare notes if you can find a way to.".to_string(),
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let storage = match std::env::var("DATABASE_URL") {
        Ok(url) => Storage::Sqlite(url),
        Err(_) => Storage::Memory,
    };
    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:3000").parse()?;

    let server = ServerBuilder::new()
        .with_storage(storage)
        .with_credentials_path(env_or("CREDS_PATH", "creds.json"))
        .with_numbers_path(env_or("NUMBERS_PATH", "numbers.json"))
        .with_telemarketopia(telemarketopia_config())
        .with_bind_addr(bind_addr)
        .build()
        .await?;

    server.serve().await?;
    Ok(())
}
