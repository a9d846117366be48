//! Conference record and registry, persisted at `spins_conference_list`.
//!
//! Grounded on `actions/conferences.py`'s `TwilConference`: a
//! process-wide list guarded by one lock (`_conference_lock`), sequential
//! integer ids, and a participant-status map keyed by phone number.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{StoryError, StoryResult};
use crate::kv::KvStore;
use crate::phone::PhoneId;

const CONFERENCE_LIST_KEY: &str = "spins_conference_list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Active,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceRecord {
    pub id: u64,
    #[serde(default)]
    pub twilio_sid: Option<String>,
    pub from_number: PhoneId,
    #[serde(default)]
    pub participants: HashMap<PhoneId, ParticipantStatus>,
    #[serde(default)]
    pub intros: HashMap<PhoneId, u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl ConferenceRecord {
    fn new(id: u64, from_number: PhoneId) -> Self {
        Self { id, twilio_sid: None, from_number, participants: HashMap::new(), intros: HashMap::new(), started_at: None }
    }

    pub fn invite(&mut self, participant: PhoneId, intro_asset: Option<u64>) {
        self.participants.insert(participant.clone(), ParticipantStatus::Invited);
        if let Some(asset) = intro_asset {
            self.intros.insert(participant, asset);
        }
    }

    pub fn mark_active(&mut self, participant: &PhoneId) {
        self.participants.insert(participant.clone(), ParticipantStatus::Active);
    }

    pub fn mark_left(&mut self, participant: &PhoneId) {
        self.participants.insert(participant.clone(), ParticipantStatus::Left);
    }

    pub fn active_count(&self) -> usize {
        self.participants.values().filter(|s| **s == ParticipantStatus::Active).count()
    }

    pub fn is_active(&self) -> bool {
        self.active_count() > 0
    }

    pub fn take_intro(&mut self, participant: &PhoneId) -> Option<u64> {
        self.intros.remove(participant)
    }
}

/// Guards the whole conference list behind one lock, matching the
/// source's `_conference_lock`: conference bookkeeping is low-volume and
/// never needs the shard/integrate fan-out the script state does.
pub struct ConferenceRegistry {
    kv: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl ConferenceRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, lock: Mutex::new(()) }
    }

    async fn load_all(&self) -> StoryResult<Vec<ConferenceRecord>> {
        match self.kv.get(CONFERENCE_LIST_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoryError::data_integrity(CONFERENCE_LIST_KEY, e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn save_all(&self, records: &[ConferenceRecord]) -> StoryResult<()> {
        let bytes = serde_json::to_vec(records)
            .map_err(|e| StoryError::data_integrity(CONFERENCE_LIST_KEY, e.to_string()))?;
        self.kv.set(CONFERENCE_LIST_KEY, bytes.into()).await
    }

    pub async fn create(&self, from_number: PhoneId) -> StoryResult<ConferenceRecord> {
        let _guard = self.lock.lock().await;
        let mut records = self.load_all().await?;
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = ConferenceRecord::new(next_id, from_number);
        records.push(record.clone());
        self.save_all(&records).await?;
        Ok(record)
    }

    pub async fn find(&self, id: u64) -> StoryResult<Option<ConferenceRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all().await?.into_iter().find(|r| r.id == id))
    }

    pub async fn update(&self, record: &ConferenceRecord) -> StoryResult<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.load_all().await?;
        if let Some(slot) = records.iter_mut().find(|r| r.id == record.id) {
            *slot = record.clone();
        } else {
            records.push(record.clone());
        }
        self.save_all(&records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn num(raw: &str) -> PhoneId {
        PhoneId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn created_conferences_get_sequential_ids() {
        let registry = ConferenceRegistry::new(Arc::new(MemoryKvStore::new()));
        let a = registry.create(num("5105551111")).await.unwrap();
        let b = registry.create(num("5105551111")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn update_round_trips_participant_status() {
        let registry = ConferenceRegistry::new(Arc::new(MemoryKvStore::new()));
        let mut record = registry.create(num("5105551111")).await.unwrap();
        record.invite(num("5105552222"), Some(7));
        record.mark_active(&num("5105552222"));
        registry.update(&record).await.unwrap();

        let reloaded = registry.find(record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.active_count(), 1);
        assert_eq!(reloaded.intros.get(&num("5105552222")), Some(&7));
    }
}
