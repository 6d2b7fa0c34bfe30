use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

const PROMPT: &str = "Classify the sky in this mountain webcam image. Answer with exactly one \
word from: Bluebird, Sunny, Cloudy, Overcast, Foggy, Night.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkyLabel {
    Bluebird,
    Sunny,
    Cloudy,
    Overcast,
    Foggy,
    Night,
}

impl SkyLabel {
    pub const ALL: [SkyLabel; 6] = [
        SkyLabel::Bluebird,
        SkyLabel::Sunny,
        SkyLabel::Cloudy,
        SkyLabel::Overcast,
        SkyLabel::Foggy,
        SkyLabel::Night,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkyLabel::Bluebird => "Bluebird",
            SkyLabel::Sunny => "Sunny",
            SkyLabel::Cloudy => "Cloudy",
            SkyLabel::Overcast => "Overcast",
            SkyLabel::Foggy => "Foggy",
            SkyLabel::Night => "Night",
        }
    }

    /// First known label mentioned in a free-text reply, else `Cloudy`.
    pub fn from_reply(reply: &str) -> SkyLabel {
        let lower = reply.to_lowercase();
        Self::ALL
            .iter()
            .filter_map(|label| {
                lower
                    .find(&label.as_str().to_lowercase())
                    .map(|pos| (pos, *label))
            })
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, label)| label)
            .unwrap_or(SkyLabel::Cloudy)
    }
}

pub trait SkyClassifier {
    /// `None` when the image could not be classified.
    fn classify(&self, image: &[u8]) -> Option<SkyLabel>;
}

pub struct GeminiClassifier {
    client: Client,
    url: String,
}

impl GeminiClassifier {
    pub fn new(endpoint: &str, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build classifier client")?;
        let url = format!(
            "{}/models/{model}:generateContent?key={api_key}",
            endpoint.trim_end_matches('/')
        );
        Ok(Self { client, url })
    }

    fn request(&self, image: &[u8]) -> Result<String> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": PROMPT },
                    { "inline_data": { "mime_type": sniff_mime(image), "data": STANDARD.encode(image) } }
                ]
            }]
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .context("classifier request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("classifier returned HTTP {status}"));
        }
        let payload: Value = response.json().context("classifier reply is not JSON")?;
        reply_text(&payload).ok_or_else(|| anyhow!("classifier reply has no text part"))
    }
}

impl SkyClassifier for GeminiClassifier {
    fn classify(&self, image: &[u8]) -> Option<SkyLabel> {
        match self.request(image) {
            Ok(reply) => {
                let label = SkyLabel::from_reply(&reply);
                debug!(reply = %reply.trim(), label = label.as_str(), "sky classified");
                Some(label)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "sky classification failed");
                None
            }
        }
    }
}

fn reply_text(payload: &Value) -> Option<String> {
    payload
        .pointer("/candidates/0/content/parts")?
        .as_array()?
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(ToString::to_string)
        .reduce(|a, b| a + " " + &b)
}

fn sniff_mime(image: &[u8]) -> &'static str {
    if image.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if image.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_replies_to_labels() {
        assert_eq!(SkyLabel::from_reply("Overcast."), SkyLabel::Overcast);
        assert_eq!(SkyLabel::from_reply("  bluebird day"), SkyLabel::Bluebird);
        assert_eq!(SkyLabel::from_reply("Foggy, maybe Cloudy"), SkyLabel::Foggy);
        assert_eq!(SkyLabel::from_reply("I cannot tell"), SkyLabel::Cloudy);
    }

    #[test]
    fn extracts_text_from_candidates() {
        let payload = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Sunny" }] } }]
        });
        assert_eq!(reply_text(&payload).as_deref(), Some("Sunny"));
        assert_eq!(reply_text(&json!({})), None);
    }

    #[test]
    fn sniffs_png_and_defaults_to_jpeg() {
        assert_eq!(sniff_mime(&[0x89, b'P', b'N', b'G', 0x0d]), "image/png");
        assert_eq!(sniff_mime(&[0xff, 0xd8, 0xff]), "image/jpeg");
    }
}
