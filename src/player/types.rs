use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One turn of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
    pub speaker_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub summary: String,
    #[serde(rename = "conversation")]
    pub lines: Vec<Line>,
}

const SHORT_TITLE_CHARS: usize = 50;

impl Scenario {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Summary cut to 50 characters, with an ellipsis when truncated.
    pub fn short_title(&self) -> String {
        let mut chars = self.summary.chars();
        let head: String = chars.by_ref().take(SHORT_TITLE_CHARS).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }

    /// Text and speaker for a target; `None` when the index is out of range.
    pub fn narration(&self, target: AudioTarget) -> Option<(&str, Option<i32>)> {
        match target {
            AudioTarget::Summary => Some((self.summary.as_str(), None)),
            AudioTarget::Line(i) => self.lines.get(i).map(|l| (l.text.as_str(), Some(l.speaker_id))),
        }
    }
}

/// What a piece of audio narrates: one line of the conversation, or the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AudioTarget {
    Line(usize),
    Summary,
}

pub const SUMMARY_TOKEN: &str = "summary";

impl AudioTarget {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ResolveError::BadRequest("Missing required parameters".to_string()));
        }
        if raw == SUMMARY_TOKEN {
            return Ok(AudioTarget::Summary);
        }
        raw.parse::<usize>()
            .map(AudioTarget::Line)
            .map_err(|_| ResolveError::InvalidIndex(raw.to_string()))
    }

    pub fn line_index(&self) -> Option<usize> {
        match self {
            AudioTarget::Line(i) => Some(*i),
            AudioTarget::Summary => None,
        }
    }
}

impl fmt::Display for AudioTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioTarget::Line(i) => write!(f, "{}", i),
            AudioTarget::Summary => f.write_str(SUMMARY_TOKEN),
        }
    }
}

impl Serialize for AudioTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AudioTarget::Line(i) => serializer.serialize_u64(*i as u64),
            AudioTarget::Summary => serializer.serialize_str(SUMMARY_TOKEN),
        }
    }
}

impl<'de> Deserialize<'de> for AudioTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(usize),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Index(i) => Ok(AudioTarget::Line(i)),
            Raw::Text(s) => AudioTarget::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Voice names per speaker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMap {
    pub first: String,
    pub second: String,
    pub fallback: String,
}

impl Default for VoiceMap {
    fn default() -> Self {
        Self {
            first: "Liam".to_string(),
            second: "Aria".to_string(),
            fallback: "Daniel".to_string(),
        }
    }
}

impl VoiceMap {
    /// `None` stands for the narrator (summary), which always takes the fallback voice.
    pub fn for_speaker(&self, speaker_id: Option<i32>) -> &str {
        match speaker_id {
            Some(0) => &self.first,
            Some(1) => &self.second,
            _ => &self.fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSettings {
    pub repeat_delay: Duration,
    pub max_repeats: u32,
    /// Interval of the cosmetic prefetch progress ticks; `None` disables them.
    pub progress_tick: Option<Duration>,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            repeat_delay: Duration::from_millis(3000),
            max_repeats: 3,
            progress_tick: Some(Duration::from_millis(300)),
        }
    }
}

pub const DEFAULT_FAL_BASE_URL: &str = "https://fal.run";
pub const DEFAULT_PUBLIC_PREFIX: &str = "/audio-cache";

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub fal_key: Option<String>,
    pub fal_base_url: String,
    pub scenarios_path: PathBuf,
    pub cache_dir: PathBuf,
    pub public_prefix: String,
    pub voices: VoiceMap,
    pub playback: PlaybackSettings,
}

impl PlayerConfig {
    pub fn from_env() -> Self {
        let voices_default = VoiceMap::default();
        let playback_default = PlaybackSettings::default();

        let cache_dir = env_string("AUDIO_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|d| d.join("scenario-player").join("audio-cache")))
            .unwrap_or_else(|| PathBuf::from("audio-cache"));

        let progress_tick = match env_u64("PROGRESS_TICK_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => playback_default.progress_tick,
        };

        Self {
            fal_key: env_string("FAL_KEY"),
            fal_base_url: env_string("FAL_BASE_URL").unwrap_or_else(|| DEFAULT_FAL_BASE_URL.to_string()),
            scenarios_path: env_string("SCENARIOS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules").join("data.json.mdc")),
            cache_dir,
            public_prefix: env_string("AUDIO_PUBLIC_PREFIX").unwrap_or_else(|| DEFAULT_PUBLIC_PREFIX.to_string()),
            voices: VoiceMap {
                first: env_string("VOICE_SPEAKER_0").unwrap_or(voices_default.first),
                second: env_string("VOICE_SPEAKER_1").unwrap_or(voices_default.second),
                fallback: env_string("VOICE_FALLBACK").unwrap_or(voices_default.fallback),
            },
            playback: PlaybackSettings {
                repeat_delay: env_u64("REPEAT_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(playback_default.repeat_delay),
                max_repeats: env_u32("MAX_REPEATS").unwrap_or(playback_default.max_repeats),
                progress_tick,
            },
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|v| {
        let t = v.trim().to_string();
        if t.is_empty() { None } else { Some(t) }
    })
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env_string(key)?;
    match raw.parse::<u64>() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    let n = env_u64(key)?;
    match u32::try_from(n) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!("Ignoring {}={}: {}", key, n, e);
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("No API key set for speech synthesis (FAL_KEY)")]
    NoApiKey,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned error: {status} — {message}")]
    ApiResponse { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Scenario not found: {0}")]
    NotFound(String),

    #[error("Invalid conversation index: {0}")]
    InvalidIndex(String),

    #[error("Failed to generate audio: {0}")]
    Synthesis(#[from] SynthesisError),
}

impl ResolveError {
    /// HTTP-style status for the resolver query interface.
    pub fn status(&self) -> u16 {
        match self {
            ResolveError::BadRequest(_) | ResolveError::InvalidIndex(_) => 400,
            ResolveError::NotFound(_) => 404,
            ResolveError::Synthesis(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Scenario {
        Scenario {
            summary: "At the bakery".to_string(),
            lines: vec![
                Line { text: "Guten Morgen!".to_string(), speaker_id: 0 },
                Line { text: "Was darf es sein?".to_string(), speaker_id: 1 },
                Line { text: "Zwei Brezeln, bitte.".to_string(), speaker_id: 7 },
            ],
        }
    }

    #[test]
    fn parses_targets() {
        assert_eq!(AudioTarget::parse("2").unwrap(), AudioTarget::Line(2));
        assert_eq!(AudioTarget::parse("summary").unwrap(), AudioTarget::Summary);
        assert_eq!(AudioTarget::parse("x").unwrap_err().status(), 400);
        assert_eq!(AudioTarget::parse("-1").unwrap_err().status(), 400);
        assert!(matches!(AudioTarget::parse(" "), Err(ResolveError::BadRequest(_))));
    }

    #[test]
    fn target_wire_form() {
        assert_eq!(serde_json::to_value(AudioTarget::Line(4)).unwrap(), serde_json::json!(4));
        assert_eq!(serde_json::to_value(AudioTarget::Summary).unwrap(), serde_json::json!("summary"));
        let t: AudioTarget = serde_json::from_value(serde_json::json!("3")).unwrap();
        assert_eq!(t, AudioTarget::Line(3));
        let t: AudioTarget = serde_json::from_value(serde_json::json!(1)).unwrap();
        assert_eq!(t, AudioTarget::Line(1));
    }

    #[test]
    fn voices_follow_speaker_slots() {
        let voices = VoiceMap::default();
        let s = scenario();
        let speaker = |t| s.narration(t).unwrap().1;
        assert_eq!(voices.for_speaker(speaker(AudioTarget::Line(0))), "Liam");
        assert_eq!(voices.for_speaker(speaker(AudioTarget::Line(1))), "Aria");
        assert_eq!(voices.for_speaker(speaker(AudioTarget::Line(2))), "Daniel");
        assert_eq!(voices.for_speaker(speaker(AudioTarget::Summary)), "Daniel");
        assert!(s.narration(AudioTarget::Line(3)).is_none());
    }

    #[test]
    fn short_title_truncates_on_chars() {
        let mut s = scenario();
        assert_eq!(s.short_title(), "At the bakery");
        s.summary = "ä".repeat(60);
        assert_eq!(s.short_title(), format!("{}...", "ä".repeat(50)));
    }

    #[test]
    fn oversized_counts_are_ignored() {
        std::env::set_var("SCENARIO_PLAYER_TEST_REPEATS", "4294967296");
        assert_eq!(env_u32("SCENARIO_PLAYER_TEST_REPEATS"), None);
        std::env::set_var("SCENARIO_PLAYER_TEST_REPEATS", " 5 ");
        assert_eq!(env_u32("SCENARIO_PLAYER_TEST_REPEATS"), Some(5));
        std::env::remove_var("SCENARIO_PLAYER_TEST_REPEATS");
        assert_eq!(env_u32("SCENARIO_PLAYER_TEST_REPEATS"), None);
    }

    #[test]
    fn default_data_file() {
        if std::env::var_os("SCENARIOS_PATH").is_none() {
            let cfg = PlayerConfig::from_env();
            assert_eq!(cfg.scenarios_path, PathBuf::from("rules").join("data.json.mdc"));
        }
    }

    #[test]
    fn scenario_json_shape() {
        let raw = r#"{"summary":"s","conversation":[{"text":"Hallo","speaker_id":1}]}"#;
        let s: Scenario = serde_json::from_str(raw).unwrap();
        assert_eq!(s.lines[0].speaker_id, 1);
        assert_eq!(s.line_count(), 1);
    }
}
