//! Error taxonomy for the story engine.
//!
//! Mirrors the category grouping and `category()`/`is_recoverable()` helper
//! style used throughout the client-facing error types elsewhere in this
//! stack: one top-level enum, grouped variants, convenience constructors.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type StoryResult<T> = Result<T, StoryError>;

#[derive(Error, Debug, Clone)]
pub enum StoryError {
    /// A phone number string/integer could not be parsed in any supported form.
    #[error("invalid phone number: {input}")]
    InvalidNumber { input: String },

    /// An accessor was called on a Player/TwilRequest/Resource before `load()`.
    #[error("{what} accessed before load()")]
    NotLoaded { what: String },

    /// A Scene could not compute a next room. Callers should recover locally
    /// by replaying the previous room rather than surfacing this to the player.
    #[error("story navigation failed in scene '{scene}': {reason}")]
    StoryNavigation { scene: String, reason: String },

    /// Attempted direct mutation of a Shard field, or append/move against a
    /// field name that is not part of the registered state shape.
    #[error("shard is frozen: {reason}")]
    ShardFrozen { reason: String },

    /// Serialized state was missing required fields; caller should fall back
    /// to defaults after logging.
    #[error("data integrity error loading '{key}': {reason}")]
    DataIntegrity { key: String, reason: String },

    /// The voice platform returned a non-2xx response, or the underlying
    /// HTTP client failed outright.
    #[error("voice gateway error: {reason}")]
    VoiceGateway { reason: String },

    /// A Task's `execute()` returned an error.
    #[error("task '{task}' failed: {reason}")]
    Task { task: String, reason: String },

    /// The persistent key-value store failed at the transport layer. This is
    /// distinct from a missing key, which is represented as `Ok(None)`.
    #[error("kv store error during {op}: {reason}")]
    Kv { op: String, reason: String },

    /// A labeled capability (e.g. a number with the `sms` capability) did not
    /// exist when requested.
    #[error("no number satisfies capabilities {capabilities:?}")]
    NoSuchCapability { capabilities: Vec<String> },

    /// Configuration failed to load at startup; the process should not start.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl StoryError {
    pub fn invalid_number(input: impl Into<String>) -> Self {
        Self::InvalidNumber { input: input.into() }
    }

    pub fn not_loaded(what: impl Into<String>) -> Self {
        Self::NotLoaded { what: what.into() }
    }

    pub fn story_navigation(scene: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoryNavigation { scene: scene.into(), reason: reason.into() }
    }

    pub fn shard_frozen(reason: impl Into<String>) -> Self {
        Self::ShardFrozen { reason: reason.into() }
    }

    pub fn data_integrity(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataIntegrity { key: key.into(), reason: reason.into() }
    }

    pub fn voice_gateway(reason: impl Into<String>) -> Self {
        Self::VoiceGateway { reason: reason.into() }
    }

    pub fn task(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Task { task: task.into(), reason: reason.into() }
    }

    pub fn kv(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Kv { op: op.into(), reason: reason.into() }
    }

    /// Whether a retry of the same operation might succeed without operator
    /// intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::VoiceGateway { .. } | Self::Kv { .. } | Self::StoryNavigation { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidNumber { .. } => "number",
            Self::NotLoaded { .. } => "state",
            Self::StoryNavigation { .. } => "navigation",
            Self::ShardFrozen { .. } => "shard",
            Self::DataIntegrity { .. } => "integrity",
            Self::VoiceGateway { .. } => "voice",
            Self::Task { .. } => "task",
            Self::Kv { .. } => "kv",
            Self::NoSuchCapability { .. } => "catalog",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<sqlx::Error> for StoryError {
    fn from(e: sqlx::Error) -> Self {
        StoryError::kv("sqlx", e.to_string())
    }
}
