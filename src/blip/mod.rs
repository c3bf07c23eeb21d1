//! Band-limited synthesis buffer.
//!
//! Converts discrete amplitude changes at arbitrary clock offsets into an
//! alias-free PCM stream: each transition deposits a precomputed band-limited
//! step kernel at its fractional sample position into a fixed-point
//! accumulation buffer. Reading integrates the deltas and applies a bass
//! high-pass. Treble rolloff is baked into each synth's kernel via [`TrebleEq`].

pub mod blip;

pub use blip::{BlipBuffer, BlipSynth, TrebleEq};
