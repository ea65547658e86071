pub mod player;

#[cfg(feature = "desktop")]
mod commands;

#[cfg(feature = "desktop")]
pub use desktop::run;

#[cfg(feature = "desktop")]
mod desktop {
    use std::sync::Arc;

    use crate::commands::{self, AppState};
    use crate::player::audio::{AudioCache, AudioResolver, HttpDownloader, SpeechSynthesizer};
    use crate::player::catalog::{ScenarioBrowser, ScenarioCatalog};
    use crate::player::fal::FalClient;
    use crate::player::gui_types::{PlaybackEvent, PlaybackEventKind};
    use crate::player::session::PlaybackSession;
    use crate::player::types::{PlayerConfig, SynthesisError};

    use async_trait::async_trait;
    use tauri::async_runtime::Mutex;
    use tauri::{Emitter, Manager};

    pub const PLAYBACK_EVENT: &str = "scenario:playback";

    /// Stand-in when no FAL_KEY is configured; cached audio still plays.
    struct MissingKey;

    #[async_trait]
    impl SpeechSynthesizer for MissingKey {
        async fn synthesize(&self, _text: &str, _voice: &str) -> Result<String, SynthesisError> {
            Err(SynthesisError::NoApiKey)
        }
    }

    fn build_resolver(config: &PlayerConfig, catalog: Arc<ScenarioCatalog>) -> Result<AudioResolver, String> {
        let synthesizer: Arc<dyn SpeechSynthesizer> = match FalClient::new(config) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::warn!("Speech synthesis unavailable: {}", e);
                Arc::new(MissingKey)
            }
        };
        let downloader = HttpDownloader::new().map_err(|e| e.to_string())?;
        let cache = AudioCache::new(&config.cache_dir, &config.public_prefix);
        Ok(AudioResolver::new(
            catalog,
            cache,
            config.voices.clone(),
            synthesizer,
            Arc::new(downloader),
        ))
    }

    /// Repeat limit reached: move to the next scenario in the filtered list and play it through.
    async fn advance_after_finish(app: tauri::AppHandle) {
        let state = app.state::<AppState>();
        let next = state.browser.lock().await.next(&state.catalog);
        let Some(id) = next else {
            tracing::info!("Last scenario finished, nothing to advance to");
            return;
        };
        if let Err(e) = state.session.open(&id).await {
            tracing::error!("Failed to advance to scenario {}: {}", id, e);
            return;
        }
        if let Err(e) = state.session.play_all() {
            tracing::error!("Failed to start scenario {}: {}", id, e);
        }
    }

    pub fn run() {
        tracing_subscriber::fmt::init();
        tracing::info!("Starting Scenario Player v{}", env!("CARGO_PKG_VERSION"));

        let config = PlayerConfig::from_env();

        tauri::Builder::default()
            .setup(move |app| {
                let catalog = Arc::new(ScenarioCatalog::load_or_empty(&config.scenarios_path));
                let resolver = Arc::new(build_resolver(&config, catalog.clone())?);

                let app_handle = app.handle().clone();
                let sink = move |event: PlaybackEvent| {
                    let finished = matches!(event.kind, PlaybackEventKind::ScenarioFinished);
                    let _ = app_handle.emit(PLAYBACK_EVENT, event);
                    if finished {
                        tauri::async_runtime::spawn(advance_after_finish(app_handle.clone()));
                    }
                };

                let session = PlaybackSession::new(resolver.clone(), catalog.clone(), config.playback.clone(), sink);
                let (handle, actor) = session.into_actor();
                tauri::async_runtime::spawn(actor);

                app.manage(AppState {
                    session: handle,
                    resolver,
                    catalog,
                    browser: Mutex::new(ScenarioBrowser::new()),
                });
                Ok(())
            })
            .invoke_handler(tauri::generate_handler![
                commands::list_scenarios,
                commands::get_scenario,
                commands::open_scenario,
                commands::close_scenario,
                commands::next_scenario,
                commands::previous_scenario,
                commands::random_scenario,
                commands::resolve_audio,
                commands::load_cached_audio,
                commands::cache_stats,
                commands::select_line,
                commands::play_all,
                commands::stop_playback,
                commands::audio_ended,
                commands::set_auto_repeat,
                commands::request_summary,
                commands::playback_snapshot,
            ])
            .run(tauri::generate_context!())
            .expect("error while running tauri application");
    }
}
