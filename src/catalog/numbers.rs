//! Outbound number pool, loaded once from `numbers.json`. Grounded on
//! `resources/numbers.py`'s `NumberLibrary`: a capability index plus a
//! label index over the same manifest.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::error::{StoryError, StoryResult};
use crate::phone::PhoneId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Voice,
    Sms,
    Mms,
}

#[derive(Debug, Deserialize)]
struct NumberEntry {
    number: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    capabilities: Vec<Capability>,
}

/// A loaded, queryable pool of outbound numbers.
pub struct NumberLibrary {
    entries: Vec<(PhoneId, HashSet<Capability>)>,
    by_label: HashMap<String, PhoneId>,
}

impl NumberLibrary {
    /// Parses a `numbers.json` manifest: an array of
    /// `{number, labels[], capabilities[]}`.
    pub fn from_manifest_json(raw: &str) -> StoryResult<Self> {
        let entries: Vec<NumberEntry> = serde_json::from_str(raw)
            .map_err(|e| StoryError::Configuration(format!("numbers.json: {e}")))?;

        let mut parsed = Vec::with_capacity(entries.len());
        let mut by_label = HashMap::new();
        for entry in entries {
            let phone = PhoneId::parse(&entry.number)?;
            for label in &entry.labels {
                by_label.insert(label.clone(), phone.clone());
            }
            parsed.push((phone, entry.capabilities.into_iter().collect()));
        }

        Ok(Self { entries: parsed, by_label })
    }

    /// Uniform-random choice among numbers possessing every capability in
    /// `caps`. Fails with `NoSuchCapability` if none match.
    pub fn random(&self, caps: &[Capability]) -> StoryResult<PhoneId> {
        let candidates: Vec<&PhoneId> = self
            .entries
            .iter()
            .filter(|(_, owned)| caps.iter().all(|c| owned.contains(c)))
            .map(|(phone, _)| phone)
            .collect();

        candidates
            .choose(&mut rand::thread_rng())
            .map(|p| (*p).clone())
            .ok_or_else(|| StoryError::NoSuchCapability { capabilities: caps.iter().map(|c| format!("{c:?}")).collect() })
    }

    pub fn from_label(&self, label: &str) -> Option<PhoneId> {
        self.by_label.get(label).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"[
        {"number": "5105551111", "labels": ["main"], "capabilities": ["voice", "sms"]},
        {"number": "5105552222", "labels": ["final"], "capabilities": ["voice"]}
    ]"#;

    #[test]
    fn random_only_picks_numbers_with_every_requested_capability() {
        let lib = NumberLibrary::from_manifest_json(MANIFEST).unwrap();
        let picked = lib.random(&[Capability::Sms]).unwrap();
        assert_eq!(picked.e164(), "+15105551111");
    }

    #[test]
    fn random_fails_when_no_number_has_the_capability() {
        let lib = NumberLibrary::from_manifest_json(MANIFEST).unwrap();
        let err = lib.random(&[Capability::Mms]).unwrap_err();
        assert!(matches!(err, StoryError::NoSuchCapability { .. }));
    }

    #[test]
    fn from_label_looks_up_by_manifest_label() {
        let lib = NumberLibrary::from_manifest_json(MANIFEST).unwrap();
        assert_eq!(lib.from_label("final").unwrap().e164(), "+15105552222");
        assert!(lib.from_label("missing").is_none());
    }
}
