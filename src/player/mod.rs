pub mod audio;
pub mod audio_types;
pub mod catalog;
pub mod fal;
pub mod gui_types;
pub mod prefetch;
pub mod sequencer;
pub mod session;
pub mod types;
