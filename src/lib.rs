//! Famisynth: NES/Famicom APU and expansion audio emulation core.
//!
//! Cycle-accurate emulation of the Ricoh 2A03 sound generator plus the six
//! cartridge expansion chips, mixed into band-limited PCM as documented on
//! the [NESdev Wiki](https://www.nesdev.org/wiki/APU) and the expansion-audio
//! pages. The core produces audio and exposes register access; it renders no
//! UI, manages no files, and never blocks on device I/O.
//!
//! ## Modules
//!
//! - **apu** – the scheduler: chip set, [frame sequencer](https://www.nesdev.org/wiki/APU_Frame_Counter),
//!   cycle accounting, register dispatch, audio-sink boundary
//! - **blip** – band-limited synthesis buffer (fixed-point impulse accumulation)
//! - **chips** – channel models and chip adapters: 2A03,
//!   [VRC6](https://www.nesdev.org/wiki/VRC6_audio), [VRC7](https://www.nesdev.org/wiki/VRC7_audio),
//!   [FDS](https://www.nesdev.org/wiki/FDS_audio), [MMC5](https://www.nesdev.org/wiki/MMC5_audio),
//!   [N163](https://www.nesdev.org/wiki/Namco_163_audio), [S5B](https://www.nesdev.org/wiki/Sunsoft_5B_audio)
//! - **mixer** – master buffer, non-linear 2A03 DAC mix, per-chip gains and
//!   attenuation, peak metering
//! - **registers** – per-chip register write log with decay timers

pub mod apu;
pub mod blip;
pub mod chips;
pub mod mixer;
pub mod registers;

pub use apu::{Apu, ApuConfig, AudioSink, Machine, SetupError};
pub use chips::{ChannelId, ChipLevel, ChipMask};
pub use mixer::MixerConfig;
