//! Master mixer.
//!
//! Owns the master band-limited buffer and one synthesizer per discrete-event
//! chip group, applies per-chip gain and the expansion attenuation table, and
//! meters per-channel peak levels. Buffered chips (FDS, N163, VRC7) bypass the
//! event path and splice finished segments directly into the master buffer.

pub mod mixer;

pub use mixer::{Mixer, MixerConfig};
