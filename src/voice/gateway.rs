//! Outbound voice-platform operations: calls, SMS, conference lifecycle.
//!
//! Grounded on `actions/conferences.py` (`add_participant`, `play_sound`,
//! `stop`) and `resources/redis.py`'s thin-wrapper style: the gateway is a
//! deliberately small capability trait, not a rich client SDK.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{StoryError, StoryResult};
use crate::phone::PhoneId;

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn place_call(&self, to: &PhoneId, from: &PhoneId, twiml_url: &str) -> StoryResult<()>;

    async fn send_sms(&self, to: &PhoneId, from: &PhoneId, body: &str, media_url: Option<&str>) -> StoryResult<()>;

    /// Twilio conferences come into being implicitly the moment a call leg
    /// dials into one by name — there is no server-side "create" call, only
    /// local bookkeeping of the name that will be used.
    async fn create_conference(&self, name_hint: &str) -> StoryResult<String>;

    async fn play_into(&self, conference_sid: &str, url: &str) -> StoryResult<()>;

    async fn hangup_conference(&self, conference_sid: &str) -> StoryResult<()>;
}

/// Serializes every operation through a single process-wide mutex — the
/// "voice-gateway lock" — because the underlying HTTP client is not safe to
/// fire concurrently against the rate-limited voice-platform API. Mirrors
/// the source's `_twil_lock`.
pub struct TwilioVoiceGateway {
    client: reqwest::blocking::Client,
    account_sid: String,
    auth_token: String,
    base_url: String,
    lock: Arc<Mutex<()>>,
}

impl TwilioVoiceGateway {
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>) -> StoryResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| StoryError::voice_gateway(e.to_string()))?;
        Ok(Self {
            client,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
            lock: Arc::new(Mutex::new(())),
        })
    }

    fn calls_url(&self) -> String {
        format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid)
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.base_url, self.account_sid)
    }

    fn conference_url(&self, sid: &str) -> String {
        format!("{}/Accounts/{}/Conferences/{}.json", self.base_url, self.account_sid, sid)
    }
}

#[async_trait]
impl VoiceGateway for TwilioVoiceGateway {
    async fn place_call(&self, to: &PhoneId, from: &PhoneId, twiml_url: &str) -> StoryResult<()> {
        let _guard = self.lock.lock().await;
        let client = self.client.clone();
        let url = self.calls_url();
        let creds = (self.account_sid.clone(), self.auth_token.clone());
        let form = [
            ("To".to_string(), to.e164().to_string()),
            ("From".to_string(), from.e164().to_string()),
            ("Url".to_string(), twiml_url.to_string()),
        ];

        tokio::task::spawn_blocking(move || {
            client
                .post(&url)
                .basic_auth(creds.0, Some(creds.1))
                .form(&form)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)
        })
        .await
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?;
        Ok(())
    }

    async fn send_sms(&self, to: &PhoneId, from: &PhoneId, body: &str, media_url: Option<&str>) -> StoryResult<()> {
        let _guard = self.lock.lock().await;
        let client = self.client.clone();
        let url = self.messages_url();
        let creds = (self.account_sid.clone(), self.auth_token.clone());
        let mut form = vec![
            ("To".to_string(), to.e164().to_string()),
            ("From".to_string(), from.e164().to_string()),
            ("Body".to_string(), body.to_string()),
        ];
        if let Some(media) = media_url {
            form.push(("MediaUrl".to_string(), media.to_string()));
        }

        tokio::task::spawn_blocking(move || {
            client
                .post(&url)
                .basic_auth(creds.0, Some(creds.1))
                .form(&form)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)
        })
        .await
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?;
        Ok(())
    }

    async fn create_conference(&self, name_hint: &str) -> StoryResult<String> {
        Ok(format!("{name_hint}-{}", Uuid::new_v4()))
    }

    async fn play_into(&self, conference_sid: &str, url: &str) -> StoryResult<()> {
        let _guard = self.lock.lock().await;
        let client = self.client.clone();
        let req_url = self.conference_url(conference_sid);
        let creds = (self.account_sid.clone(), self.auth_token.clone());
        let form = [("AnnounceUrl".to_string(), url.to_string())];

        tokio::task::spawn_blocking(move || {
            client
                .post(&req_url)
                .basic_auth(creds.0, Some(creds.1))
                .form(&form)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)
        })
        .await
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?;
        Ok(())
    }

    async fn hangup_conference(&self, conference_sid: &str) -> StoryResult<()> {
        let _guard = self.lock.lock().await;
        let client = self.client.clone();
        let req_url = self.conference_url(conference_sid);
        let creds = (self.account_sid.clone(), self.auth_token.clone());
        let form = [("Status".to_string(), "completed".to_string())];

        tokio::task::spawn_blocking(move || {
            client
                .post(&req_url)
                .basic_auth(creds.0, Some(creds.1))
                .form(&form)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)
        })
        .await
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?
        .map_err(|e| StoryError::voice_gateway(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum RecordedCall {
    PlaceCall { to: PhoneId, from: PhoneId, twiml_url: String },
    SendSms { to: PhoneId, from: PhoneId, body: String },
    CreateConference { name_hint: String },
    PlayInto { conference_sid: String, url: String },
    HangupConference { conference_sid: String },
}

/// Test double that records every call instead of reaching the network.
#[derive(Default)]
pub struct NullVoiceGateway {
    calls: Mutex<Vec<RecordedCall>>,
}

impl NullVoiceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl VoiceGateway for NullVoiceGateway {
    async fn place_call(&self, to: &PhoneId, from: &PhoneId, twiml_url: &str) -> StoryResult<()> {
        info!(%to, %from, "null gateway: place_call");
        self.calls.lock().await.push(RecordedCall::PlaceCall {
            to: to.clone(),
            from: from.clone(),
            twiml_url: twiml_url.to_string(),
        });
        Ok(())
    }

    async fn send_sms(&self, to: &PhoneId, from: &PhoneId, body: &str, _media_url: Option<&str>) -> StoryResult<()> {
        self.calls.lock().await.push(RecordedCall::SendSms {
            to: to.clone(),
            from: from.clone(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn create_conference(&self, name_hint: &str) -> StoryResult<String> {
        self.calls.lock().await.push(RecordedCall::CreateConference { name_hint: name_hint.to_string() });
        Ok(format!("{name_hint}-test"))
    }

    async fn play_into(&self, conference_sid: &str, url: &str) -> StoryResult<()> {
        self.calls
            .lock()
            .await
            .push(RecordedCall::PlayInto { conference_sid: conference_sid.to_string(), url: url.to_string() });
        Ok(())
    }

    async fn hangup_conference(&self, conference_sid: &str) -> StoryResult<()> {
        warn!(%conference_sid, "null gateway: hangup_conference");
        self.calls.lock().await.push(RecordedCall::HangupConference { conference_sid: conference_sid.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(raw: &str) -> PhoneId {
        PhoneId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn null_gateway_records_every_call() {
        let gw = NullVoiceGateway::new();
        gw.place_call(&num("5105551111"), &num("5105552222"), "https://example.com/tw").await.unwrap();
        gw.send_sms(&num("5105551111"), &num("5105552222"), "hi", None).await.unwrap();

        let calls = gw.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], RecordedCall::PlaceCall { .. }));
        assert!(matches!(calls[1], RecordedCall::SendSms { .. }));
    }
}
