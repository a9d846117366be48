//! Admin snapshot-restore flow: `PlayerStore::advance_generation_to` must
//! force a write through even when the stored generation is ahead of
//! whatever the restoring caller last observed, and the resulting record
//! must win any subsequent save race against a stale in-flight request.

use std::collections::HashMap;
use std::sync::Arc;

use spins_story_engine::kv::MemoryKvStore;
use spins_story_engine::phone::PhoneId;
use spins_story_engine::player::{PlayerStore, ScriptInfo};

fn num(raw: &str) -> PhoneId {
    PhoneId::parse(raw).unwrap()
}

#[tokio::test]
async fn restoring_a_snapshot_bumps_past_the_stored_generation() {
    let kv = Arc::new(MemoryKvStore::new());
    let store = PlayerStore::new(kv);
    let player_number = num("5105551111");

    let mut advancing = store.load(&player_number).await.unwrap();
    advancing.set_script("telemarketopia", ScriptInfo::new());
    store.save(&advancing).await.unwrap();
    advancing.set_script("telemarketopia", ScriptInfo::new());
    store.save(&advancing).await.unwrap();

    let current = store.load(&player_number).await.unwrap();
    assert_eq!(current.generation().unwrap(), 2);

    let mut restored_scripts = HashMap::new();
    restored_scripts.insert("telemarketopia".to_string(), ScriptInfo::new());
    let restored = store.advance_generation_to(&player_number, restored_scripts).await.unwrap();
    assert_eq!(restored.generation().unwrap(), 3, "restore must land strictly ahead of the generation already on disk");

    let reloaded = store.load(&player_number).await.unwrap();
    assert_eq!(reloaded.generation().unwrap(), 3);
    assert!(reloaded.script("telemarketopia").is_some());
}

#[tokio::test]
async fn a_stale_save_in_flight_during_restore_loses_to_the_restored_generation() {
    let kv = Arc::new(MemoryKvStore::new());
    let store = PlayerStore::new(kv);
    let player_number = num("5105552222");

    let stale_view = store.load(&player_number).await.unwrap();

    let restored = store.advance_generation_to(&player_number, HashMap::new()).await.unwrap();
    assert_eq!(restored.generation().unwrap(), 1);

    // `stale_view` still thinks it's at generation 0; its save must be
    // silently dropped rather than clobbering the restored record.
    let mut stale_view = stale_view;
    stale_view.set_script("telemarketopia", ScriptInfo::new());
    store.save(&stale_view).await.unwrap();

    let reloaded = store.load(&player_number).await.unwrap();
    assert_eq!(reloaded.generation().unwrap(), 1, "the restored generation must survive a stale concurrent save");
    assert!(reloaded.script("telemarketopia").is_none());
}

#[tokio::test]
async fn restoring_an_unknown_player_starts_at_generation_one() {
    let kv = Arc::new(MemoryKvStore::new());
    let store = PlayerStore::new(kv);
    let player_number = num("5105553333");

    let restored = store.advance_generation_to(&player_number, HashMap::new()).await.unwrap();
    assert_eq!(restored.generation().unwrap(), 1);
}
