//! APU scheduler: owns the chip set and the mixer, advances emulation in
//! bounded steps (never past the next frame-sequencer edge or the frame
//! boundary), dispatches register access with open-bus fallback, and flushes
//! finished PCM frames to the external audio sink.

pub mod apu;

#[cfg(test)]
mod tests;

pub use apu::{
    Apu, ApuConfig, AudioSink, Machine, SetupError, BASE_FREQ_NTSC, BASE_FREQ_PAL,
    FRAME_RATE_NTSC, FRAME_RATE_PAL,
};
