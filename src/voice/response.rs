//! A hand-rolled TwiML-shaped voice response builder. No crate in the
//! dependency stack models this XML dialect, so it is built directly —
//! matching the handful of elements §6 actually uses rather than the full
//! TwiML verb set.

use std::fmt::Write as _;

#[derive(Debug, Clone)]
enum Element {
    Play { url: String },
    Say { text: String },
    Gather { num_digits: u32, action: String, children: Vec<Element> },
    DialConference(ConferenceDial),
    Hangup,
}

#[derive(Debug, Clone)]
pub struct ConferenceDial {
    pub name: String,
    pub participant_label: Option<String>,
    pub status_callback: Option<String>,
    pub status_callback_event: Option<String>,
    pub wait_url: Option<String>,
}

impl ConferenceDial {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            participant_label: None,
            status_callback: None,
            status_callback_event: None,
            wait_url: None,
        }
    }

    pub fn participant_label(mut self, label: impl Into<String>) -> Self {
        self.participant_label = Some(label.into());
        self
    }

    pub fn status_callback(mut self, url: impl Into<String>) -> Self {
        self.status_callback = Some(url.into());
        self.status_callback_event = Some("start end join leave".to_string());
        self
    }

    pub fn wait_url(mut self, url: impl Into<String>) -> Self {
        self.wait_url = Some(url.into());
        self
    }
}

/// Ordered sequence of voice verbs, rendered to TwiML on demand.
#[derive(Debug, Clone, Default)]
pub struct VoiceResponse {
    elements: Vec<Element>,
}

impl VoiceResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play(mut self, url: impl Into<String>) -> Self {
        self.elements.push(Element::Play { url: url.into() });
        self
    }

    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.elements.push(Element::Say { text: text.into() });
        self
    }

    /// A DTMF gather wrapping whatever is spoken/played while waiting.
    pub fn gather(mut self, num_digits: u32, action: impl Into<String>, prompt: VoiceResponse) -> Self {
        self.elements.push(Element::Gather {
            num_digits,
            action: action.into(),
            children: prompt.elements,
        });
        self
    }

    pub fn dial_conference(mut self, dial: ConferenceDial) -> Self {
        self.elements.push(Element::DialConference(dial));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.elements.push(Element::Hangup);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>");
        render_elements(&self.elements, &mut out);
        out.push_str("</Response>");
        out
    }
}

fn render_elements(elements: &[Element], out: &mut String) {
    for el in elements {
        match el {
            Element::Play { url } => {
                let _ = write!(out, "<Play>{}</Play>", escape(url));
            }
            Element::Say { text } => {
                let _ = write!(out, "<Say>{}</Say>", escape(text));
            }
            Element::Gather { num_digits, action, children } => {
                let _ = write!(out, "<Gather numDigits=\"{num_digits}\" action=\"{}\" method=\"POST\">", escape(action));
                render_elements(children, out);
                out.push_str("</Gather>");
            }
            Element::DialConference(dial) => {
                out.push_str("<Dial>");
                let _ = write!(out, "<Conference");
                if let Some(label) = &dial.participant_label {
                    let _ = write!(out, " participantLabel=\"{}\"", escape(label));
                }
                if let Some(cb) = &dial.status_callback {
                    let _ = write!(out, " statusCallback=\"{}\"", escape(cb));
                }
                if let Some(event) = &dial.status_callback_event {
                    let _ = write!(out, " statusCallbackEvent=\"{}\"", escape(event));
                }
                if let Some(wait) = &dial.wait_url {
                    let _ = write!(out, " waitUrl=\"{}\"", escape(wait));
                }
                let _ = write!(out, ">{}</Conference>", escape(&dial.name));
                out.push_str("</Dial>");
            }
            Element::Hangup => out.push_str("<Hangup/>"),
        }
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_gather_wrapping_a_play() {
        let xml = VoiceResponse::new()
            .gather(1, "/tipline/start", VoiceResponse::new().play("https://example.com/intro.mp3"))
            .to_xml();

        assert!(xml.contains("<Gather numDigits=\"1\""));
        assert!(xml.contains("<Play>https://example.com/intro.mp3</Play>"));
    }

    #[test]
    fn escapes_ampersands_in_urls() {
        let xml = VoiceResponse::new().play("https://example.com/a?x=1&y=2").to_xml();
        assert!(xml.contains("&amp;"));
    }

    #[test]
    fn dial_conference_carries_status_callback_event() {
        let xml = VoiceResponse::new()
            .dial_conference(ConferenceDial::new("telemarketopia-7").status_callback("/conf/status/7"))
            .to_xml();
        assert!(xml.contains("statusCallbackEvent=\"start end join leave\""));
    }
}
