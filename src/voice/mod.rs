//! Voice Gateway: outbound calls, SMS, and conference control, plus the
//! TwiML-shaped response builder used to answer inbound webhooks.

mod gateway;
mod response;

pub use gateway::{NullVoiceGateway, RecordedCall, TwilioVoiceGateway, VoiceGateway};
pub use response::{ConferenceDial, VoiceResponse};
