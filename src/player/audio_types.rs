use super::types::{AudioTarget, ResolveError};

use serde::{Deserialize, Serialize};

/// A request for the audio of one line (or the summary) of a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioQuery {
    pub scenario_id: String,
    pub index: String,
}

impl AudioQuery {
    pub fn parse(&self) -> Result<(&str, AudioTarget), ResolveError> {
        let scenario_id = self.scenario_id.trim();
        if scenario_id.is_empty() {
            return Err(ResolveError::BadRequest("Missing required parameters".to_string()));
        }
        Ok((scenario_id, AudioTarget::parse(&self.index)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioResponse {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioQueryError {
    pub status: u16,
    pub message: String,
}

impl From<&ResolveError> for AudioQueryError {
    fn from(e: &ResolveError) -> Self {
        Self {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioStage {
    CacheHit,
    Synthesizing,
    Caching,
    CacheFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioProgressEvent {
    pub scenario_id: String,
    pub target: AudioTarget,
    pub stage: AudioStage,
    pub message: String,
}
