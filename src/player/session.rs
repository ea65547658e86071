use super::audio::AudioSource;
use super::catalog::ScenarioCatalog;
use super::gui_types::{PlaybackEvent, PlaybackEventKind, PlaybackSnapshot};
use super::prefetch::{PrefetchQueue, SimulatedProgress};
use super::sequencer::{Directive, Sequencer};
use super::types::{AudioTarget, PlaybackSettings, ResolveError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Receives everything the frontend needs to render and drive the audio element.
pub trait EventSink: Send {
    fn emit(&mut self, event: PlaybackEvent);
}

impl<F> EventSink for F
where
    F: FnMut(PlaybackEvent) + Send,
{
    fn emit(&mut self, event: PlaybackEvent) {
        (self)(event)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Playback session has shut down")]
    Closed,

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    OnDemand,
    /// Prefetches started before the queue was last cleared carry an older generation.
    Prefetch { generation: u64 },
}

/// Results of background work, tagged with the epoch they were started in.
#[derive(Debug)]
enum Completion {
    Resolved {
        epoch: u64,
        target: AudioTarget,
        origin: Origin,
        result: Result<String, ResolveError>,
    },
    Progress {
        epoch: u64,
        generation: u64,
        index: usize,
        percent: u8,
    },
    RepeatElapsed {
        epoch: u64,
        token: u64,
    },
}

impl Completion {
    fn epoch(&self) -> u64 {
        match self {
            Completion::Resolved { epoch, .. }
            | Completion::Progress { epoch, .. }
            | Completion::RepeatElapsed { epoch, .. } => *epoch,
        }
    }
}

/// Single owner of all playback state for the open scenario.
///
/// Transitions come from the [`Sequencer`]; their directives are executed
/// here. Resolutions and the repeat delay run as tokio tasks that report back
/// through a channel. Every scenario switch bumps the epoch, and results from
/// an older epoch are dropped on arrival.
pub struct PlaybackSession {
    source: Arc<dyn AudioSource>,
    catalog: Arc<ScenarioCatalog>,
    settings: PlaybackSettings,
    sink: Box<dyn EventSink>,

    scenario_id: Option<String>,
    epoch: u64,
    sequencer: Sequencer,
    queue: PrefetchQueue,
    resolved: BTreeMap<AudioTarget, String>,
    on_demand: HashSet<AudioTarget>,
    awaiting: Option<usize>,

    prefetch_task: Option<JoinHandle<()>>,
    prefetch_generation: u64,
    repeat_task: Option<(u64, JoinHandle<()>)>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl PlaybackSession {
    pub fn new(
        source: Arc<dyn AudioSource>,
        catalog: Arc<ScenarioCatalog>,
        settings: PlaybackSettings,
        sink: impl EventSink + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer::new(settings.max_repeats, settings.repeat_delay);
        Self {
            source,
            catalog,
            settings,
            sink: Box::new(sink),
            scenario_id: None,
            epoch: 0,
            sequencer,
            queue: PrefetchQueue::new(),
            resolved: BTreeMap::new(),
            on_demand: HashSet::new(),
            awaiting: None,
            prefetch_task: None,
            prefetch_generation: 0,
            repeat_task: None,
            tx,
            rx,
        }
    }

    pub fn scenario_id(&self) -> Option<&str> {
        self.scenario_id.as_deref()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            scenario_id: self.scenario_id.clone(),
            line_count: self.sequencer.line_count(),
            state: self.sequencer.state().clone(),
            max_repeats: self.sequencer.max_repeats(),
            prefetch_in_flight: self.queue.in_flight(),
            prefetch_pending: self.queue.pending().collect(),
            resolved: self.resolved.keys().copied().collect(),
        }
    }

    /// Whether any resolution started by this scenario is still running.
    pub fn has_pending_work(&self) -> bool {
        !self.on_demand.is_empty() || !self.queue.is_empty()
    }

    /// Switch to another scenario. Playback is always reset first.
    pub fn open_scenario(&mut self, id: &str) -> Result<(), ResolveError> {
        let line_count = self
            .catalog
            .get(id)
            .map(|s| s.line_count())
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;

        let directives = self.sequencer.reset(line_count);
        self.execute(directives);
        self.begin_epoch(Some(id.to_string()));
        tracing::info!("Opened scenario {} ({} lines)", id, line_count);
        self.publish_state();
        Ok(())
    }

    pub fn close_scenario(&mut self) {
        let directives = self.sequencer.reset(0);
        self.execute(directives);
        self.begin_epoch(None);
        self.publish_state();
    }

    pub fn select_line(&mut self, index: usize) -> Result<(), ResolveError> {
        if index >= self.sequencer.line_count() {
            return Err(ResolveError::InvalidIndex(index.to_string()));
        }
        let directives = self.sequencer.select_line(index);
        self.execute(directives);
        self.publish_state();
        Ok(())
    }

    pub fn play_all(&mut self) {
        let directives = self.sequencer.play_all();
        self.execute(directives);
        self.publish_state();
    }

    pub fn stop(&mut self) {
        let directives = self.sequencer.stop();
        self.execute(directives);
        self.publish_state();
    }

    pub fn audio_ended(&mut self, index: usize) {
        let directives = self.sequencer.audio_ended(index);
        self.execute(directives);
        self.publish_state();
    }

    pub fn set_auto_repeat(&mut self, enabled: bool) {
        let directives = self.sequencer.set_auto_repeat(enabled);
        self.execute(directives);
        self.publish_state();
    }

    /// Narration of the scenario summary; reported as `AudioReady` for `Summary`.
    pub fn request_summary(&mut self) {
        if self.scenario_id.is_none() {
            return;
        }
        match self.resolved.get(&AudioTarget::Summary) {
            Some(url) => {
                let url = url.clone();
                self.emit(PlaybackEventKind::AudioReady { target: AudioTarget::Summary, url });
            }
            None => {
                if !self.on_demand.contains(&AudioTarget::Summary) {
                    self.emit(PlaybackEventKind::SummaryLoading);
                    self.spawn_on_demand(AudioTarget::Summary);
                }
            }
        }
    }

    /// Waits for the next background result and applies it.
    pub async fn next_completion(&mut self) {
        if let Some(completion) = self.rx.recv().await {
            self.apply(completion);
        }
    }

    /// Applies every result that has already arrived, without waiting.
    pub fn drain_completions(&mut self) {
        while let Ok(completion) = self.rx.try_recv() {
            self.apply(completion);
        }
    }

    /// Actor loop: commands and background results, one at a time.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.rx.recv() => self.apply(completion),
            }
        }
        self.shutdown();
        tracing::debug!("Playback session stopped");
    }

    /// Split into a handle and the actor future; the caller picks the runtime.
    pub fn into_actor(self) -> (SessionHandle, impl Future<Output = ()> + Send) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle { tx }, self.run(rx))
    }

    pub fn spawn(self) -> SessionHandle {
        let (handle, actor) = self.into_actor();
        tokio::spawn(actor);
        handle
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open { id, reply } => {
                let _ = reply.send(self.open_scenario(&id));
            }
            SessionCommand::Close => self.close_scenario(),
            SessionCommand::SelectLine { index, reply } => {
                let _ = reply.send(self.select_line(index));
            }
            SessionCommand::PlayAll => self.play_all(),
            SessionCommand::Stop => self.stop(),
            SessionCommand::AudioEnded { index } => self.audio_ended(index),
            SessionCommand::SetAutoRepeat { enabled } => self.set_auto_repeat(enabled),
            SessionCommand::RequestSummary => self.request_summary(),
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn begin_epoch(&mut self, scenario_id: Option<String>) {
        self.epoch += 1;
        self.scenario_id = scenario_id;
        self.resolved.clear();
        self.on_demand.clear();
        self.awaiting = None;
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.prefetch_task.take() {
            task.abort();
        }
        if let Some((_, task)) = self.repeat_task.take() {
            task.abort();
        }
    }

    fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Play(index) => self.play(index),
                Directive::Halt => {
                    self.awaiting = None;
                    self.emit(PlaybackEventKind::Halt);
                }
                Directive::EnqueuePrefetch(indices) => {
                    let resolved = &self.resolved;
                    let on_demand = &self.on_demand;
                    let added = self.queue.enqueue(indices, |i| {
                        let target = AudioTarget::Line(i);
                        resolved.contains_key(&target) || on_demand.contains(&target)
                    });
                    tracing::debug!("Queued {} lines for prefetch", added);
                    self.pump_prefetch();
                }
                Directive::ClearPrefetch => {
                    self.queue.clear();
                    self.prefetch_generation += 1;
                    if let Some(task) = self.prefetch_task.take() {
                        task.abort();
                    }
                }
                Directive::ScheduleRepeat { token, delay } => self.schedule_repeat(token, delay),
                Directive::CancelRepeat => {
                    if let Some((_, task)) = self.repeat_task.take() {
                        task.abort();
                    }
                }
                Directive::ScenarioFinished => {
                    tracing::info!("Repeat limit reached for {:?}", self.scenario_id);
                    self.emit(PlaybackEventKind::ScenarioFinished);
                }
            }
        }
    }

    fn play(&mut self, index: usize) {
        let target = AudioTarget::Line(index);
        if let Some(url) = self.resolved.get(&target) {
            let url = url.clone();
            self.awaiting = None;
            self.emit(PlaybackEventKind::Play { target, url });
            return;
        }

        self.awaiting = Some(index);
        self.emit(PlaybackEventKind::LineLoading { index });

        // the prefetch already running for this line will serve it
        if self.queue.in_flight() == Some(index) {
            return;
        }
        self.queue.dequeue(index);
        self.spawn_on_demand(target);
    }

    fn spawn_on_demand(&mut self, target: AudioTarget) {
        let Some(scenario_id) = self.scenario_id.clone() else {
            return;
        };
        if !self.on_demand.insert(target) {
            return;
        }

        let source = self.source.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = source.resolve(&scenario_id, target).await;
            let _ = tx.send(Completion::Resolved {
                epoch,
                target,
                origin: Origin::OnDemand,
                result,
            });
        });
    }

    /// Starts the head of the queue unless a prefetch is already running.
    fn pump_prefetch(&mut self) {
        let Some(scenario_id) = self.scenario_id.clone() else {
            return;
        };
        let Some(index) = self.queue.begin_next() else {
            return;
        };

        let source = self.source.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let generation = self.prefetch_generation;
        let tick = self.settings.progress_tick;

        self.prefetch_task = Some(tokio::spawn(async move {
            let target = AudioTarget::Line(index);
            let mut progress = SimulatedProgress::default();
            let _ = tx.send(Completion::Progress {
                epoch,
                generation,
                index,
                percent: progress.percent(),
            });

            let resolve = source.resolve(&scenario_id, target);
            let result = match tick {
                Some(period) => {
                    tokio::pin!(resolve);
                    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    loop {
                        tokio::select! {
                            result = &mut resolve => break result,
                            _ = ticker.tick() => {
                                if let Some(percent) = progress.advance() {
                                    let _ = tx.send(Completion::Progress { epoch, generation, index, percent });
                                }
                            }
                        }
                    }
                }
                None => resolve.await,
            };

            if result.is_ok() {
                let _ = tx.send(Completion::Progress {
                    epoch,
                    generation,
                    index,
                    percent: progress.complete(),
                });
            }
            let _ = tx.send(Completion::Resolved {
                epoch,
                target,
                origin: Origin::Prefetch { generation },
                result,
            });
        }));
    }

    fn schedule_repeat(&mut self, token: u64, delay: Duration) {
        if let Some((_, task)) = self.repeat_task.take() {
            task.abort();
        }
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Completion::RepeatElapsed { epoch, token });
        });
        self.repeat_task = Some((token, task));
        self.emit(PlaybackEventKind::RepeatScheduled {
            delay_ms: delay.as_millis() as u64,
        });
    }

    fn apply(&mut self, completion: Completion) {
        if completion.epoch() != self.epoch {
            tracing::debug!("Dropping result from a previous scenario: {:?}", completion);
            return;
        }

        match completion {
            Completion::Progress { generation, index, percent, .. } => {
                if generation == self.prefetch_generation {
                    self.emit(PlaybackEventKind::PrefetchProgress { index, percent });
                }
            }
            Completion::RepeatElapsed { token, .. } => {
                if matches!(self.repeat_task, Some((current, _)) if current == token) {
                    self.repeat_task = None;
                }
                let directives = self.sequencer.repeat_elapsed(token);
                self.execute(directives);
                self.publish_state();
            }
            Completion::Resolved { target, origin, result, .. } => {
                match origin {
                    Origin::OnDemand => {
                        self.on_demand.remove(&target);
                    }
                    Origin::Prefetch { generation } if generation != self.prefetch_generation => {
                        // the queue was cleared since; its slot belongs to a newer prefetch
                        if let Ok(url) = result {
                            tracing::debug!("Keeping audio for {} from a cleared prefetch", target);
                            self.resolved.entry(target).or_insert(url);
                            self.publish_state();
                        }
                        return;
                    }
                    Origin::Prefetch { .. } => {
                        if let Some(index) = target.line_index() {
                            self.queue.finish(index);
                        }
                        self.prefetch_task = None;
                    }
                }

                match result {
                    Ok(url) => self.on_resolved(target, url),
                    Err(e) => self.on_failed(target, origin, e),
                }

                if matches!(origin, Origin::Prefetch { .. }) {
                    self.pump_prefetch();
                }
                self.publish_state();
            }
        }
    }

    fn on_resolved(&mut self, target: AudioTarget, url: String) {
        self.resolved.entry(target).or_insert_with(|| url.clone());
        self.emit(PlaybackEventKind::AudioReady { target, url: url.clone() });

        if let Some(index) = target.line_index() {
            if self.awaiting == Some(index) && self.sequencer.wants_audio(index) {
                self.awaiting = None;
                self.emit(PlaybackEventKind::Play { target, url });
            }
        }
    }

    fn on_failed(&mut self, target: AudioTarget, origin: Origin, error: ResolveError) {
        match origin {
            Origin::Prefetch { .. } => {
                tracing::warn!("Error pre-downloading audio for {}: {}", target, error);
                // still wanted for playback: fall back to an on-demand attempt
                if let Some(index) = target.line_index() {
                    if self.awaiting == Some(index) && self.sequencer.wants_audio(index) {
                        self.spawn_on_demand(target);
                    }
                }
            }
            Origin::OnDemand => {
                tracing::error!("Error fetching audio for {}: {}", target, error);
                if target.line_index() == self.awaiting {
                    self.awaiting = None;
                }
                self.emit(PlaybackEventKind::Error {
                    target,
                    status: error.status(),
                    message: error.to_string(),
                });
            }
        }
    }

    fn publish_state(&mut self) {
        let snapshot = self.snapshot();
        self.emit(PlaybackEventKind::StateChanged { snapshot });
    }

    fn emit(&mut self, kind: PlaybackEventKind) {
        let event = PlaybackEvent {
            scenario_id: self.scenario_id.clone(),
            kind,
        };
        self.sink.emit(event);
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub enum SessionCommand {
    Open {
        id: String,
        reply: oneshot::Sender<Result<(), ResolveError>>,
    },
    Close,
    SelectLine {
        index: usize,
        reply: oneshot::Sender<Result<(), ResolveError>>,
    },
    PlayAll,
    Stop,
    AudioEnded {
        index: usize,
    },
    SetAutoRepeat {
        enabled: bool,
    },
    RequestSummary,
    Snapshot {
        reply: oneshot::Sender<PlaybackSnapshot>,
    },
}

/// Cloneable sender side of a running [`PlaybackSession`].
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).map_err(|_| SessionError::Closed)
    }

    pub async fn open(&self, id: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Open { id: id.to_string(), reply })?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn select_line(&self, index: usize) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SelectLine { index, reply })?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn snapshot(&self) -> Result<PlaybackSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn close(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Close)
    }

    pub fn play_all(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::PlayAll)
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop)
    }

    pub fn audio_ended(&self, index: usize) -> Result<(), SessionError> {
        self.send(SessionCommand::AudioEnded { index })
    }

    pub fn set_auto_repeat(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetAutoRepeat { enabled })
    }

    pub fn request_summary(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::RequestSummary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::sequencer::Phase;
    use crate::player::types::{Line, Scenario, SynthesisError};

    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeSource {
        calls: StdMutex<Vec<(String, AudioTarget)>>,
        failing: HashSet<AudioTarget>,
        /// Fail only the first attempt.
        flaky: HashSet<AudioTarget>,
        delay: Duration,
    }

    impl FakeSource {
        fn calls(&self) -> Vec<(String, AudioTarget)> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, target: AudioTarget) -> usize {
            self.calls().iter().filter(|(_, t)| *t == target).count()
        }
    }

    #[async_trait]
    impl AudioSource for FakeSource {
        async fn resolve(&self, scenario_id: &str, target: AudioTarget) -> Result<String, ResolveError> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((scenario_id.to_string(), target));
                calls.iter().filter(|(_, t)| *t == target).count()
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.contains(&target) || (attempt == 1 && self.flaky.contains(&target)) {
                return Err(ResolveError::Synthesis(SynthesisError::ApiResponse {
                    status: 503,
                    message: "busy".into(),
                }));
            }
            Ok(format!("/audio-cache/{}_{}.mp3", scenario_id, target))
        }
    }

    type Events = Arc<StdMutex<Vec<PlaybackEvent>>>;

    fn lines(n: usize) -> Vec<Line> {
        (0..n)
            .map(|i| Line { text: format!("Satz {}", i), speaker_id: (i % 2) as i32 })
            .collect()
    }

    fn catalog() -> Arc<ScenarioCatalog> {
        Arc::new(ScenarioCatalog::from_entries(vec![
            ("cafe".to_string(), Scenario { summary: "Im Café".to_string(), lines: lines(3) }),
            ("bahnhof".to_string(), Scenario { summary: "Am Bahnhof".to_string(), lines: lines(2) }),
            ("markt".to_string(), Scenario { summary: "Auf dem Markt".to_string(), lines: lines(4) }),
        ]))
    }

    fn settings(max_repeats: u32) -> PlaybackSettings {
        PlaybackSettings {
            repeat_delay: Duration::from_millis(3000),
            max_repeats,
            progress_tick: None,
        }
    }

    fn session(source: Arc<FakeSource>, settings: PlaybackSettings) -> (PlaybackSession, Events) {
        let events: Events = Arc::default();
        let sink_events = events.clone();
        let session = PlaybackSession::new(source, catalog(), settings, move |e: PlaybackEvent| {
            sink_events.lock().unwrap().push(e);
        });
        (session, events)
    }

    async fn settle(session: &mut PlaybackSession) {
        while session.has_pending_work() {
            session.next_completion().await;
        }
    }

    fn kinds(events: &Events) -> Vec<PlaybackEventKind> {
        events.lock().unwrap().iter().map(|e| e.kind.clone()).collect()
    }

    fn played(events: &Events) -> Vec<AudioTarget> {
        kinds(events)
            .into_iter()
            .filter_map(|k| match k {
                PlaybackEventKind::Play { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    fn count(events: &Events, pred: impl Fn(&PlaybackEventKind) -> bool) -> usize {
        kinds(events).iter().filter(|k| pred(k)).count()
    }

    #[tokio::test]
    async fn plays_three_lines_then_idles() {
        let source = Arc::new(FakeSource::default());
        let (mut s, events) = session(source.clone(), settings(3));
        s.open_scenario("cafe").unwrap();

        s.play_all();
        settle(&mut s).await;
        assert_eq!(played(&events), vec![AudioTarget::Line(0)]);
        assert_eq!(
            s.snapshot().resolved,
            vec![AudioTarget::Line(0), AudioTarget::Line(1), AudioTarget::Line(2)]
        );

        s.audio_ended(0);
        s.audio_ended(1);
        s.audio_ended(2);

        assert_eq!(
            played(&events),
            vec![AudioTarget::Line(0), AudioTarget::Line(1), AudioTarget::Line(2)]
        );
        let snap = s.snapshot();
        assert_eq!(snap.phase(), Phase::Idle);
        assert_eq!(snap.state.current_index, None);
        assert!(!snap.state.is_playing_all);
        assert_eq!(count(&events, |k| matches!(k, PlaybackEventKind::ScenarioFinished)), 0);
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_once_after_delay_then_finishes() {
        let source = Arc::new(FakeSource::default());
        let (mut s, events) = session(source.clone(), settings(1));
        s.open_scenario("cafe").unwrap();
        s.set_auto_repeat(true);
        s.play_all();
        settle(&mut s).await;

        s.audio_ended(0);
        s.audio_ended(1);
        s.audio_ended(2);
        assert_eq!(s.snapshot().phase(), Phase::RepeatPending);
        assert_eq!(s.snapshot().state.repeat_count, 1);

        let started = tokio::time::Instant::now();
        s.next_completion().await;
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert_eq!(s.snapshot().phase(), Phase::PlayingAll);
        assert_eq!(s.snapshot().state.current_index, Some(0));
        assert_eq!(played(&events).last(), Some(&AudioTarget::Line(0)));

        s.audio_ended(0);
        s.audio_ended(1);
        s.audio_ended(2);

        let snap = s.snapshot();
        assert_eq!(snap.phase(), Phase::Idle);
        assert_eq!(snap.state.repeat_count, 0);
        assert_eq!(count(&events, |k| matches!(k, PlaybackEventKind::ScenarioFinished)), 1);
        assert_eq!(played(&events).len(), 6);
        // replay used the audio resolved during the first pass
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_repeat_cancels_the_delay() {
        let source = Arc::new(FakeSource::default());
        let (mut s, events) = session(source, settings(3));
        s.open_scenario("bahnhof").unwrap();
        s.set_auto_repeat(true);
        s.play_all();
        settle(&mut s).await;
        s.audio_ended(0);
        s.audio_ended(1);
        assert_eq!(s.snapshot().phase(), Phase::RepeatPending);

        s.set_auto_repeat(false);
        assert_eq!(s.snapshot().phase(), Phase::Idle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        s.drain_completions();
        assert_eq!(s.snapshot().phase(), Phase::Idle);
        assert_eq!(played(&events).len(), 2);
        assert_eq!(count(&events, |k| matches!(k, PlaybackEventKind::ScenarioFinished)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resets_everything() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut s, events) = session(source, settings(3));
        s.open_scenario("cafe").unwrap();
        s.set_auto_repeat(true);
        s.play_all();
        assert_eq!(s.snapshot().prefetch_in_flight, Some(1));

        s.stop();
        let snap = s.snapshot();
        assert_eq!(snap.state.current_index, None);
        assert!(!snap.state.is_playing_all);
        assert_eq!(snap.state.repeat_count, 0);
        assert!(snap.state.auto_repeat);
        assert_eq!(snap.prefetch_in_flight, None);
        assert!(snap.prefetch_pending.is_empty());
        assert!(kinds(&events).contains(&PlaybackEventKind::Halt));

        // the on-demand result still lands in the map, but nothing starts playing
        settle(&mut s).await;
        assert!(played(&events).is_empty());
        assert_eq!(s.snapshot().resolved, vec![AudioTarget::Line(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_from_previous_scenario_are_dropped() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut s, events) = session(source.clone(), settings(3));
        s.open_scenario("cafe").unwrap();
        s.play_all();

        s.open_scenario("bahnhof").unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.scenario_id.as_deref(), Some("bahnhof"));
        assert_eq!(snap.line_count, 2);
        assert!(!s.has_pending_work());

        // the on-demand request for cafe line 0 is still running
        s.next_completion().await;
        assert!(s.snapshot().resolved.is_empty());
        assert!(played(&events).is_empty());
        assert_eq!(source.calls(), vec![("cafe".to_string(), AudioTarget::Line(0))]);
    }

    #[tokio::test]
    async fn failed_prefetch_is_dropped_without_error() {
        let source = Arc::new(FakeSource {
            failing: HashSet::from([AudioTarget::Line(1)]),
            ..Default::default()
        });
        let (mut s, events) = session(source, settings(3));
        s.open_scenario("cafe").unwrap();
        s.play_all();
        settle(&mut s).await;

        let snap = s.snapshot();
        assert_eq!(snap.resolved, vec![AudioTarget::Line(0), AudioTarget::Line(2)]);
        assert!(snap.prefetch_pending.is_empty());
        assert_eq!(count(&events, |k| matches!(k, PlaybackEventKind::Error { .. })), 0);

        // reaching the line retries on demand, and that failure is surfaced
        s.audio_ended(0);
        settle(&mut s).await;
        let errors: Vec<_> = kinds(&events)
            .into_iter()
            .filter(|k| matches!(k, PlaybackEventKind::Error { .. }))
            .collect();
        assert_eq!(
            errors,
            vec![PlaybackEventKind::Error {
                target: AudioTarget::Line(1),
                status: 500,
                message: "Failed to generate audio: API returned error: 503 — busy".to_string(),
            }]
        );
        assert_eq!(s.snapshot().state.current_index, Some(1));

        // later lines still work
        s.select_line(2).unwrap();
        assert_eq!(played(&events).last(), Some(&AudioTarget::Line(2)));
    }

    #[tokio::test]
    async fn single_line_loads_then_toggles_off() {
        let source = Arc::new(FakeSource::default());
        let (mut s, events) = session(source, settings(3));
        s.open_scenario("cafe").unwrap();

        s.select_line(1).unwrap();
        assert!(kinds(&events).contains(&PlaybackEventKind::LineLoading { index: 1 }));
        settle(&mut s).await;
        assert_eq!(played(&events), vec![AudioTarget::Line(1)]);
        assert_eq!(s.snapshot().phase(), Phase::PlayingSingle);

        s.select_line(1).unwrap();
        assert_eq!(s.snapshot().phase(), Phase::Idle);
        assert_eq!(kinds(&events).last().map(|k| matches!(k, PlaybackEventKind::StateChanged { .. })), Some(true));

        assert!(matches!(s.select_line(9), Err(ResolveError::InvalidIndex(_))));
    }

    #[tokio::test]
    async fn summary_is_resolved_once() {
        let source = Arc::new(FakeSource::default());
        let (mut s, events) = session(source.clone(), settings(3));
        s.open_scenario("cafe").unwrap();

        s.request_summary();
        s.request_summary();
        settle(&mut s).await;
        s.request_summary();

        let ready = count(&events, |k| {
            matches!(k, PlaybackEventKind::AudioReady { target: AudioTarget::Summary, .. })
        });
        assert_eq!(ready, 2);
        assert_eq!(count(&events, |k| matches!(k, PlaybackEventKind::SummaryLoading)), 1);
        assert_eq!(source.calls(), vec![("cafe".to_string(), AudioTarget::Summary)]);
    }

    #[tokio::test(start_paused = true)]
    async fn jump_to_line_being_prefetched_waits_for_it() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut s, events) = session(source.clone(), settings(3));
        s.open_scenario("markt").unwrap();
        s.play_all();
        assert_eq!(s.snapshot().prefetch_in_flight, Some(1));

        s.select_line(1).unwrap();
        assert!(kinds(&events).contains(&PlaybackEventKind::LineLoading { index: 1 }));
        settle(&mut s).await;

        assert_eq!(source.calls_for(AudioTarget::Line(1)), 1);
        assert_eq!(played(&events), vec![AudioTarget::Line(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_prefetch_of_awaited_line_retries_on_demand() {
        let source = Arc::new(FakeSource {
            flaky: HashSet::from([AudioTarget::Line(1)]),
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut s, events) = session(source.clone(), settings(3));
        s.open_scenario("markt").unwrap();
        s.play_all();
        s.select_line(1).unwrap();
        settle(&mut s).await;

        assert_eq!(source.calls_for(AudioTarget::Line(1)), 2);
        assert_eq!(played(&events), vec![AudioTarget::Line(1)]);
        assert_eq!(count(&events, |k| matches!(k, PlaybackEventKind::Error { .. })), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_of_awaited_line_reports_error() {
        let source = Arc::new(FakeSource {
            failing: HashSet::from([AudioTarget::Line(1)]),
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut s, events) = session(source.clone(), settings(3));
        s.open_scenario("markt").unwrap();
        s.play_all();
        s.select_line(1).unwrap();
        settle(&mut s).await;

        assert_eq!(source.calls_for(AudioTarget::Line(1)), 2);
        assert!(played(&events).is_empty());
        let errors = count(&events, |k| {
            matches!(k, PlaybackEventKind::Error { target: AudioTarget::Line(1), status: 500, .. })
        });
        assert_eq!(errors, 1);
        assert_eq!(s.snapshot().state.current_index, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_prefetch_result_leaves_new_slot_alone() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut s, _events) = session(source.clone(), settings(3));
        s.open_scenario("markt").unwrap();
        s.play_all();
        // line 1 finishes, its result still queued
        tokio::time::sleep(Duration::from_millis(1100)).await;

        s.stop();
        s.play_all();
        assert_eq!(s.snapshot().prefetch_in_flight, Some(1));

        s.drain_completions();
        let snap = s.snapshot();
        assert_eq!(snap.prefetch_in_flight, Some(1));
        assert_eq!(snap.prefetch_pending, vec![2, 3]);
        assert!(snap.resolved.contains(&AudioTarget::Line(1)));
        assert!(s.prefetch_task.is_some());

        settle(&mut s).await;
        assert_eq!(source.calls_for(AudioTarget::Line(1)), 2);
        assert_eq!(source.calls_for(AudioTarget::Line(2)), 1);
        assert_eq!(s.snapshot().resolved.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn late_repeat_timer_keeps_the_newer_one() {
        let source = Arc::new(FakeSource::default());
        let (mut s, events) = session(source, settings(3));
        s.open_scenario("bahnhof").unwrap();
        s.set_auto_repeat(true);
        s.play_all();
        settle(&mut s).await;
        s.audio_ended(0);
        s.audio_ended(1);
        // the first timer fires, its result still queued
        tokio::time::sleep(Duration::from_millis(3100)).await;

        s.stop();
        s.play_all();
        s.audio_ended(0);
        s.audio_ended(1);
        assert_eq!(s.snapshot().phase(), Phase::RepeatPending);

        s.drain_completions();
        assert_eq!(s.snapshot().phase(), Phase::RepeatPending);
        assert!(s.repeat_task.is_some());

        s.set_auto_repeat(false);
        assert!(s.repeat_task.is_none());
        tokio::time::sleep(Duration::from_secs(10)).await;
        s.drain_completions();
        assert_eq!(s.snapshot().phase(), Phase::Idle);
        assert_eq!(played(&events).len(), 4);
    }

    #[tokio::test]
    async fn unknown_scenario_is_rejected() {
        let (mut s, _events) = session(Arc::new(FakeSource::default()), settings(3));
        assert!(matches!(s.open_scenario("nope"), Err(ResolveError::NotFound(_))));
        assert!(s.scenario_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_reports_monotonic_progress() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let mut cfg = settings(3);
        cfg.progress_tick = Some(Duration::from_millis(300));
        let (mut s, events) = session(source, cfg);
        s.open_scenario("bahnhof").unwrap();
        s.play_all();
        settle(&mut s).await;

        let progress: Vec<u8> = kinds(&events)
            .into_iter()
            .filter_map(|k| match k {
                PlaybackEventKind::PrefetchProgress { index: 1, percent } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first(), Some(&10));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.len() >= 3);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn actor_handle_drives_session() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let session = PlaybackSession::new(
            Arc::new(FakeSource::default()),
            catalog(),
            settings(3),
            move |e: PlaybackEvent| {
                let _ = event_tx.send(e);
            },
        );
        let handle = session.spawn();

        assert!(matches!(
            handle.open("nope").await,
            Err(SessionError::Resolve(ResolveError::NotFound(_)))
        ));
        handle.open("bahnhof").await.unwrap();
        handle.play_all().unwrap();

        loop {
            let event = event_rx.recv().await.unwrap();
            if let PlaybackEventKind::Play { target, url } = event.kind {
                assert_eq!(target, AudioTarget::Line(0));
                assert_eq!(url, "/audio-cache/bahnhof_0.mp3");
                assert_eq!(event.scenario_id.as_deref(), Some("bahnhof"));
                break;
            }
        }

        handle.stop().unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.phase(), Phase::Idle);
        assert!(snap.prefetch_pending.is_empty());
    }
}
