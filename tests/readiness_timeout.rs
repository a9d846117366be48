//! Two players matched into the first conference who never both text
//! "ready" within the deadline get returned to their waiting queues with
//! the unreplied/replied texts split correctly, and their ready flags are
//! cleared rather than carried into the next matching round.

use std::sync::Arc;

use spins_story_engine::catalog::{HttpMediaSource, MediaCatalog, NumberLibrary};
use spins_story_engine::conference::{ConferenceRegistry, CoordinatorDeps, PairingConfig, ReturnPlayers};
use spins_story_engine::kv::MemoryKvStore;
use spins_story_engine::narrative::{TelemarketopiaState, SCRIPT_NAME};
use spins_story_engine::phone::PhoneId;
use spins_story_engine::player::{PlayerStore, ScriptInfo};
use spins_story_engine::shard::ScriptStateManager;
use spins_story_engine::tasks::{Task, TaskRunner};
use spins_story_engine::voice::NullVoiceGateway;

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

#[tokio::test]
async fn neither_player_answering_in_time_returns_both_to_waiting_with_the_unreplied_text() {
    let kv = Arc::new(MemoryKvStore::new());
    let runner = TaskRunner::spawn();
    let manager = Arc::new(ScriptStateManager::<TelemarketopiaState>::new(SCRIPT_NAME, kv.clone(), runner.clone()));
    let voice = Arc::new(NullVoiceGateway::new());
    let players = Arc::new(PlayerStore::new(kv.clone()));
    let manifest = r#"[{"number": "5105550000", "labels": ["conference"], "capabilities": ["voice", "sms"]}]"#;
    let numbers = Arc::new(NumberLibrary::from_manifest_json(manifest).unwrap());
    let media = Arc::new(MediaCatalog::new(Box::new(HttpMediaSource::new("http://unused", "u", "k"))));
    let conferences = Arc::new(ConferenceRegistry::new(kv.clone()));

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

    let clavae_player = num("5105551111");
    let karen_player = num("5105552222");

    manager
        .mutate_state(|s| {
            s.clavae_in_conf.push(clavae_player.clone());
            s.karen_in_conf.push(karen_player.clone());
        })
        .await;

    // Neither player replied "ready" before the deadline elapsed.
    let task = ReturnPlayers {
        deps: deps.clone(),
        script_name: SCRIPT_NAME.to_string(),
        path_a: clavae_player.clone(),
        path_b: karen_player.clone(),
        path_a_replied: false,
        path_b_replied: false,
    };
    Box::new(task).execute().await.unwrap();

    // ReturnPlayers enqueues its shard changes onto the runner; give the
    // drain loop a moment to integrate them.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let state = manager.snapshot().await;
    assert_eq!(state.clavae_waiting_for_conf, vec![clavae_player.clone()]);
    assert_eq!(state.karen_waiting_for_conf, vec![karen_player.clone()]);
    assert!(state.clavae_in_conf.is_empty());
    assert!(state.karen_in_conf.is_empty());

    let calls = voice.calls().await;
    assert_eq!(calls.len(), 2, "both players should be texted about the timeout");
}

#[tokio::test]
async fn clearing_the_ready_flag_on_return_keeps_it_out_of_the_next_round() {
    let kv = Arc::new(MemoryKvStore::new());
    let runner = TaskRunner::spawn();
    let manager = Arc::new(ScriptStateManager::<TelemarketopiaState>::new(SCRIPT_NAME, kv.clone(), runner.clone()));
    let voice = Arc::new(NullVoiceGateway::new());
    let players = Arc::new(PlayerStore::new(kv.clone()));
    let manifest = r#"[{"number": "5105550000", "labels": ["conference"], "capabilities": ["voice", "sms"]}]"#;
    let numbers = Arc::new(NumberLibrary::from_manifest_json(manifest).unwrap());
    let media = Arc::new(MediaCatalog::new(Box::new(HttpMediaSource::new("http://unused", "u", "k"))));
    let conferences = Arc::new(ConferenceRegistry::new(kv.clone()));

    let deps = Arc::new(CoordinatorDeps {
        state_manager: manager.clone(),
        players: players.clone(),
        voice,
        conferences,
        media,
        numbers,
        runner,
        config: pairing_config(),
    });

    let clavae_player = num("5105553333");
    let karen_player = num("5105554444");

    let mut p = players.load(&clavae_player).await.unwrap();
    let mut info = ScriptInfo::new();
    info.data.insert(spins_story_engine::conference::READY_FOR_CONF_KEY.to_string(), serde_json::Value::Bool(true));
    p.set_script(SCRIPT_NAME, info);
    players.save(&p).await.unwrap();

    let task = ReturnPlayers {
        deps,
        script_name: SCRIPT_NAME.to_string(),
        path_a: clavae_player.clone(),
        path_b: karen_player.clone(),
        path_a_replied: true,
        path_b_replied: false,
    };
    Box::new(task).execute().await.unwrap();

    let reloaded = players.load(&clavae_player).await.unwrap();
    let info = reloaded.script(SCRIPT_NAME).unwrap();
    assert!(!info.data.contains_key(spins_story_engine::conference::READY_FOR_CONF_KEY));
}
