use std::sync::Arc;

use crate::player::audio::AudioResolver;
use crate::player::audio_types::{AudioProgressEvent, AudioQuery, AudioQueryError, AudioResponse};
use crate::player::catalog::{ScenarioBrowser, ScenarioCatalog};
use crate::player::gui_types::{CacheStats, OpenedScenario, PlaybackSnapshot, ScenarioListing};
use crate::player::session::SessionHandle;
use crate::player::types::Scenario;

use base64::Engine;
use tauri::async_runtime::Mutex;
use tauri::Emitter;

pub const AUDIO_PROGRESS_EVENT: &str = "scenario:audio:progress";

pub struct AppState {
    pub session: SessionHandle,
    pub resolver: Arc<AudioResolver>,
    pub catalog: Arc<ScenarioCatalog>,
    pub browser: Mutex<ScenarioBrowser>,
}

impl AppState {
    /// Opens `id` in the session and marks it selected. Playback is reset by the session.
    async fn open(&self, id: &str) -> Result<OpenedScenario, String> {
        self.session.open(id).await.map_err(|e| e.to_string())?;
        let (has_next, has_previous) = {
            let mut browser = self.browser.lock().await;
            browser.select(id);
            (browser.has_next(&self.catalog), browser.has_previous(&self.catalog))
        };
        let snapshot = self.session.snapshot().await.map_err(|e| e.to_string())?;
        Ok(OpenedScenario {
            snapshot,
            has_next,
            has_previous,
        })
    }

    async fn open_picked(&self, picked: Option<String>) -> Result<Option<OpenedScenario>, String> {
        match picked {
            Some(id) => self.open(&id).await.map(Some),
            None => Ok(None),
        }
    }
}

#[tauri::command]
pub async fn list_scenarios(
    state: tauri::State<'_, AppState>,
    query: Option<String>,
) -> Result<Vec<ScenarioListing>, String> {
    let mut browser = state.browser.lock().await;
    if let Some(q) = query {
        browser.set_query(&q);
    }

    let listings = state
        .catalog
        .search(browser.query())
        .into_iter()
        .filter_map(|id| {
            let scenario = state.catalog.get(id)?;
            Some(ScenarioListing {
                id: id.to_string(),
                title: scenario.short_title(),
                summary: scenario.summary.clone(),
                line_count: scenario.line_count(),
            })
        })
        .collect();
    Ok(listings)
}

#[tauri::command]
pub async fn get_scenario(state: tauri::State<'_, AppState>, id: String) -> Result<Scenario, String> {
    state
        .catalog
        .get(&id)
        .cloned()
        .ok_or_else(|| format!("Scenario not found: {}", id))
}

#[tauri::command]
pub async fn open_scenario(state: tauri::State<'_, AppState>, id: String) -> Result<OpenedScenario, String> {
    state.open(&id).await
}

#[tauri::command]
pub async fn close_scenario(state: tauri::State<'_, AppState>) -> Result<(), String> {
    state.browser.lock().await.close();
    state.session.close().map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn next_scenario(state: tauri::State<'_, AppState>) -> Result<Option<OpenedScenario>, String> {
    let picked = state.browser.lock().await.next(&state.catalog);
    state.open_picked(picked).await
}

#[tauri::command]
pub async fn previous_scenario(state: tauri::State<'_, AppState>) -> Result<Option<OpenedScenario>, String> {
    let picked = state.browser.lock().await.previous(&state.catalog);
    state.open_picked(picked).await
}

#[tauri::command]
pub async fn random_scenario(state: tauri::State<'_, AppState>) -> Result<Option<OpenedScenario>, String> {
    let mut browser = state.browser.lock().await;
    let picked = browser.random(&state.catalog, &mut rand::rng());
    drop(browser);
    state.open_picked(picked).await
}

#[tauri::command]
pub async fn resolve_audio(
    app: tauri::AppHandle,
    state: tauri::State<'_, AppState>,
    scenario_id: String,
    index: String,
) -> Result<AudioResponse, AudioQueryError> {
    let query = AudioQuery { scenario_id, index };
    let (scenario_id, target) = query.parse().map_err(|e| AudioQueryError::from(&e))?;

    let url = state
        .resolver
        .resolve_with_progress(scenario_id, target, |stage, message| {
            let _ = app.emit(
                AUDIO_PROGRESS_EVENT,
                AudioProgressEvent {
                    scenario_id: scenario_id.to_string(),
                    target,
                    stage,
                    message: message.to_string(),
                },
            );
        })
        .await
        .map_err(|e| AudioQueryError::from(&e))?;

    Ok(AudioResponse { url })
}

/// Cached audio as base64, for the webview to wrap in a data URL.
#[tauri::command]
pub async fn load_cached_audio(state: tauri::State<'_, AppState>, url: String) -> Result<String, String> {
    let bytes = state
        .resolver
        .cache()
        .read_public(&url)
        .ok_or_else(|| format!("Audio not cached: {}", url))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[tauri::command]
pub async fn cache_stats(state: tauri::State<'_, AppState>) -> Result<CacheStats, String> {
    let (size_mb, entries) = state.resolver.cache().stats();
    Ok(CacheStats { size_mb, entries })
}

#[tauri::command]
pub async fn select_line(state: tauri::State<'_, AppState>, index: usize) -> Result<(), String> {
    state.session.select_line(index).await.map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn play_all(state: tauri::State<'_, AppState>) -> Result<(), String> {
    state.session.play_all().map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn stop_playback(state: tauri::State<'_, AppState>) -> Result<(), String> {
    state.session.stop().map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn audio_ended(state: tauri::State<'_, AppState>, index: usize) -> Result<(), String> {
    state.session.audio_ended(index).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn set_auto_repeat(state: tauri::State<'_, AppState>, enabled: bool) -> Result<(), String> {
    state.session.set_auto_repeat(enabled).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn request_summary(state: tauri::State<'_, AppState>) -> Result<(), String> {
    state.session.request_summary().map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn playback_snapshot(state: tauri::State<'_, AppState>) -> Result<PlaybackSnapshot, String> {
    state.session.snapshot().await.map_err(|e| e.to_string())
}
