use super::sequencer::{Phase, PlaybackState};
use super::types::AudioTarget;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub scenario_id: Option<String>,
    pub line_count: usize,
    #[serde(flatten)]
    pub state: PlaybackState,
    pub max_repeats: u32,
    pub prefetch_in_flight: Option<usize>,
    pub prefetch_pending: Vec<usize>,
    pub resolved: Vec<AudioTarget>,
}

impl PlaybackSnapshot {
    pub fn phase(&self) -> Phase {
        self.state.phase
    }
}

/// A freshly opened scenario, with whether the filtered list continues either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedScenario {
    #[serde(flatten)]
    pub snapshot: PlaybackSnapshot,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEventKind {
    StateChanged { snapshot: PlaybackSnapshot },
    /// Audio for the line is being fetched before it can start.
    LineLoading { index: usize },
    /// Narration of the summary is being fetched.
    SummaryLoading,
    Play { target: AudioTarget, url: String },
    Halt,
    AudioReady { target: AudioTarget, url: String },
    PrefetchProgress { index: usize, percent: u8 },
    #[serde(rename_all = "camelCase")]
    RepeatScheduled { delay_ms: u64 },
    ScenarioFinished,
    Error { target: AudioTarget, status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    pub scenario_id: Option<String>,
    #[serde(flatten)]
    pub kind: PlaybackEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioListing {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub line_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size_mb: f64,
    pub entries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged() {
        let event = PlaybackEvent {
            scenario_id: Some("cafe".into()),
            kind: PlaybackEventKind::Play {
                target: AudioTarget::Line(2),
                url: "/audio-cache/cafe_2.mp3".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"scenarioId": "cafe", "type": "play", "target": 2, "url": "/audio-cache/cafe_2.mp3"})
        );

        let event = PlaybackEvent {
            scenario_id: None,
            kind: PlaybackEventKind::RepeatScheduled { delay_ms: 3000 },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"scenarioId": null, "type": "repeatScheduled", "delayMs": 3000})
        );
    }

    #[test]
    fn snapshot_flattens_state() {
        let snapshot = PlaybackSnapshot {
            scenario_id: Some("cafe".into()),
            line_count: 3,
            state: PlaybackState {
                current_index: Some(1),
                is_playing_all: true,
                phase: Phase::PlayingAll,
                ..Default::default()
            },
            max_repeats: 3,
            prefetch_in_flight: Some(2),
            prefetch_pending: vec![],
            resolved: vec![AudioTarget::Line(0), AudioTarget::Summary],
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["currentIndex"], json!(1));
        assert_eq!(value["phase"], json!("playingAll"));
        assert_eq!(value["resolved"], json!([0, "summary"]));

        let opened = OpenedScenario { snapshot, has_next: true, has_previous: false };
        let value = serde_json::to_value(&opened).unwrap();
        assert_eq!(value["scenarioId"], json!("cafe"));
        assert_eq!(value["hasNext"], json!(true));
        assert_eq!(value["hasPrevious"], json!(false));
    }
}
