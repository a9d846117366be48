//! Conference Coordinator: bookkeeping for ad-hoc two-party conferences and
//! the task-chain state machine that pairs, connects, and nudges them.

mod coordinator;
mod record;

pub use coordinator::{
    CoordinatorDeps, PairingConfig, READY_FOR_CONF_KEY, ConfStartFirst, ConfWaitForPlayers,
    ConnectFirstConference, NudgeConference, ReturnPlayers,
};
pub use record::{ConferenceRecord, ConferenceRegistry, ParticipantStatus};
