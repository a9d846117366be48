//! Configuration & bring-up: loads `creds.json` and `numbers.json` at
//! startup. Grounded on `constants.py`/`resources/numbers.py`'s load-once-
//! at-import style, re-expressed as explicit file reads rather than
//! module-level globals.

use std::path::Path;

use serde::Deserialize;

use crate::error::{StoryError, StoryResult};
use crate::phone::PhoneId;

#[derive(Debug, Clone, Deserialize)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaCredentials {
    pub api_url: String,
    pub user: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorReportsConfig {
    #[serde(default)]
    pub numbers_to_text: Vec<String>,
}

/// Shape of `creds.json`: voice-platform credentials, media-catalog
/// credentials, and who to text when something goes wrong unrecoverably.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub twilio: TwilioCredentials,
    pub media: MediaCredentials,
    #[serde(default)]
    pub error_reports: ErrorReportsConfig,
}

impl Credentials {
    pub fn load(path: impl AsRef<Path>) -> StoryResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoryError::Configuration(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| StoryError::Configuration(format!("parsing {}: {e}", path.display())))
    }

    pub fn error_report_numbers(&self) -> StoryResult<Vec<PhoneId>> {
        self.error_reports.numbers_to_text.iter().map(|raw| PhoneId::parse(raw)).collect()
    }
}

/// Reads the raw `numbers.json` manifest text; parsing into a
/// `NumberLibrary` is the catalog module's concern.
pub fn load_numbers_manifest(path: impl AsRef<Path>) -> StoryResult<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| StoryError::Configuration(format!("reading {}: {e}", path.display())))
}
