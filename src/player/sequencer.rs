use serde::{Deserialize, Serialize};

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Idle,
    PlayingSingle,
    PlayingAll,
    RepeatPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub phase: Phase,
    pub current_index: Option<usize>,
    pub is_playing_all: bool,
    pub auto_repeat: bool,
    pub repeat_count: u32,
}

/// Side effects requested by a transition, executed by the host in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Start the line's audio, resolving it first if needed.
    Play(usize),
    /// Stop whatever is currently sounding.
    Halt,
    EnqueuePrefetch(Vec<usize>),
    ClearPrefetch,
    ScheduleRepeat { token: u64, delay: Duration },
    CancelRepeat,
    /// The repeat budget is spent; the host may move on to another scenario.
    ScenarioFinished,
}

/// Playback state machine for one scenario.
///
/// Holds no timers and does no I/O. Every input returns the directives the
/// host must carry out; the repeat delay is identified by a token so a timer
/// that fires after being cancelled is ignored.
#[derive(Debug, Clone)]
pub struct Sequencer {
    state: PlaybackState,
    line_count: usize,
    max_repeats: u32,
    repeat_delay: Duration,
    repeat_token: u64,
}

impl Sequencer {
    pub fn new(max_repeats: u32, repeat_delay: Duration) -> Self {
        Self {
            state: PlaybackState::default(),
            line_count: 0,
            max_repeats,
            repeat_delay,
            repeat_token: 0,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn max_repeats(&self) -> u32 {
        self.max_repeats
    }

    /// Whether `index` is the line that should be sounding right now.
    pub fn wants_audio(&self, index: usize) -> bool {
        self.state.current_index == Some(index)
            && matches!(self.state.phase, Phase::PlayingSingle | Phase::PlayingAll)
    }

    /// New scenario: always stops first.
    pub fn reset(&mut self, line_count: usize) -> Vec<Directive> {
        let directives = self.stop();
        self.line_count = line_count;
        directives
    }

    pub fn stop(&mut self) -> Vec<Directive> {
        let mut directives = Vec::new();
        if self.state.phase == Phase::RepeatPending {
            directives.push(Directive::CancelRepeat);
        }
        // invalidate any timer still on its way
        self.repeat_token += 1;
        self.go_idle();
        directives.push(Directive::ClearPrefetch);
        directives.push(Directive::Halt);
        directives
    }

    pub fn select_line(&mut self, index: usize) -> Vec<Directive> {
        if index >= self.line_count {
            return Vec::new();
        }

        match self.state.phase {
            Phase::PlayingAll => {
                self.state.current_index = Some(index);
                vec![Directive::Play(index)]
            }
            Phase::RepeatPending => {
                self.repeat_token += 1;
                self.state.phase = Phase::PlayingAll;
                self.state.current_index = Some(index);
                vec![Directive::CancelRepeat, Directive::Play(index)]
            }
            Phase::PlayingSingle if self.state.current_index == Some(index) => {
                self.go_idle();
                vec![Directive::Halt]
            }
            Phase::Idle | Phase::PlayingSingle => {
                self.state.phase = Phase::PlayingSingle;
                self.state.current_index = Some(index);
                vec![Directive::Play(index)]
            }
        }
    }

    pub fn play_all(&mut self) -> Vec<Directive> {
        if self.line_count == 0 || self.state.is_playing_all {
            return Vec::new();
        }

        self.state.phase = Phase::PlayingAll;
        self.state.is_playing_all = true;
        self.state.current_index = Some(0);
        self.state.repeat_count = 0;

        let mut directives = vec![Directive::Play(0)];
        if self.line_count > 1 {
            directives.push(Directive::EnqueuePrefetch((1..self.line_count).collect()));
        }
        directives
    }

    /// The audio of `index` reached its natural end.
    pub fn audio_ended(&mut self, index: usize) -> Vec<Directive> {
        if self.state.phase != Phase::PlayingAll || self.state.current_index != Some(index) {
            return Vec::new();
        }

        if index + 1 < self.line_count {
            self.state.current_index = Some(index + 1);
            return vec![Directive::Play(index + 1)];
        }

        if self.state.auto_repeat && self.state.repeat_count < self.max_repeats {
            self.state.repeat_count += 1;
            self.state.phase = Phase::RepeatPending;
            self.repeat_token += 1;
            return vec![Directive::ScheduleRepeat {
                token: self.repeat_token,
                delay: self.repeat_delay,
            }];
        }

        let exhausted = self.state.auto_repeat && self.state.repeat_count >= self.max_repeats;
        self.go_idle();
        if exhausted {
            vec![Directive::ScenarioFinished]
        } else {
            Vec::new()
        }
    }

    pub fn repeat_elapsed(&mut self, token: u64) -> Vec<Directive> {
        if self.state.phase != Phase::RepeatPending || token != self.repeat_token {
            return Vec::new();
        }
        self.state.phase = Phase::PlayingAll;
        self.state.current_index = Some(0);
        vec![Directive::Play(0)]
    }

    pub fn set_auto_repeat(&mut self, enabled: bool) -> Vec<Directive> {
        self.state.auto_repeat = enabled;
        if enabled || self.state.phase != Phase::RepeatPending {
            return Vec::new();
        }
        self.repeat_token += 1;
        self.go_idle();
        vec![Directive::CancelRepeat]
    }

    fn go_idle(&mut self) {
        self.state.phase = Phase::Idle;
        self.state.current_index = None;
        self.state.is_playing_all = false;
        self.state.repeat_count = 0;
    }
}
