use super::audio::SpeechSynthesizer;
use super::types::{PlayerConfig, SynthesisError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const TTS_MODEL_PATH: &str = "fal-ai/elevenlabs/tts/multilingual-v2";
const STABILITY: f32 = 0.5;
const SIMILARITY_BOOST: f32 = 0.75;

#[derive(Debug, Clone, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice: &'a str,
    stability: f32,
    similarity_boost: f32,
}

/// ElevenLabs multilingual speech synthesis through fal.ai.
pub struct FalClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl FalClient {
    pub fn new(config: &PlayerConfig) -> Result<Self, SynthesisError> {
        let api_key = config
            .fal_key
            .clone()
            .and_then(|k| {
                let t = k.trim().to_string();
                if t.is_empty() { None } else { Some(t) }
            })
            .ok_or(SynthesisError::NoApiKey)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.fal_base_url.trim().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url, TTS_MODEL_PATH)
    }
}

#[async_trait]
impl SpeechSynthesizer for FalClient {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<String, SynthesisError> {
        let request = TtsRequest {
            text,
            voice,
            stability: STABILITY,
            similarity_boost: SIMILARITY_BOOST,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("authorization", format!("Key {}", self.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::ApiResponse {
                status: status.as_u16(),
                message: body,
            });
        }

        let raw: Value = response.json().await?;
        audio_url_from_response(&raw)
    }
}

fn audio_url_from_response(raw: &Value) -> Result<String, SynthesisError> {
    raw.get("audio")
        .and_then(|a| a.get("url"))
        .and_then(|u| u.as_str())
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| SynthesisError::Parse(format!("no audio url in response: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::types::PlayerConfig;
    use serde_json::json;

    fn config(key: Option<&str>) -> PlayerConfig {
        let mut cfg = PlayerConfig::from_env();
        cfg.fal_key = key.map(|k| k.to_string());
        cfg.fal_base_url = "https://fal.example/".to_string();
        cfg
    }

    #[test]
    fn requires_api_key() {
        assert!(matches!(FalClient::new(&config(None)), Err(SynthesisError::NoApiKey)));
        assert!(matches!(FalClient::new(&config(Some("  "))), Err(SynthesisError::NoApiKey)));
    }

    #[test]
    fn endpoint_joins_model_path() {
        let client = FalClient::new(&config(Some("k"))).unwrap();
        assert_eq!(
            client.endpoint(),
            "https://fal.example/fal-ai/elevenlabs/tts/multilingual-v2"
        );
    }

    #[test]
    fn request_body_shape() {
        let body = serde_json::to_value(TtsRequest {
            text: "Hallo",
            voice: "Aria",
            stability: STABILITY,
            similarity_boost: SIMILARITY_BOOST,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"text": "Hallo", "voice": "Aria", "stability": 0.5, "similarity_boost": 0.75})
        );
    }

    #[test]
    fn extracts_audio_url() {
        let ok = json!({"audio": {"url": "https://cdn.fal/x.mp3", "content_type": "audio/mpeg"}});
        assert_eq!(audio_url_from_response(&ok).unwrap(), "https://cdn.fal/x.mp3");
        assert!(matches!(
            audio_url_from_response(&json!({"audio": {}})),
            Err(SynthesisError::Parse(_))
        ));
    }
}
