//! Sound chip models and the chip set dispatch.
//!
//! Two chip shapes exist (matching the hardware's relationship to the common
//! clock): *stepwise* chips emit discrete mixer events as they are clocked
//! (2A03, VRC6, MMC5, S5B), while *buffered* chips run their own synthesis
//! into a private buffer and splice a finished segment into the master buffer
//! once per frame (FDS, N163, VRC7). The scheduler owns a small [`SoundChip`]
//! enum per enabled chip rather than open-ended trait objects.

pub mod fds;
pub mod mmc5;
pub mod n163;
pub mod nes;
pub mod s5b;
pub mod vrc6;
pub mod vrc7;

use crate::blip::BlipBuffer;
use crate::mixer::Mixer;
use crate::registers::{RegisterLogger, RegisterState};

pub use fds::Fds;
pub use mmc5::Mmc5;
pub use n163::N163;
pub use nes::Nes2a03;
pub use s5b::S5b;
pub use vrc6::Vrc6;
pub use vrc7::Vrc7;

/// Bitmask of enabled expansion chips. The 2A03 is always present.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ChipMask(pub u8);

impl ChipMask {
    pub const NONE: ChipMask = ChipMask(0);
    pub const VRC6: ChipMask = ChipMask(1);
    pub const VRC7: ChipMask = ChipMask(2);
    pub const FDS: ChipMask = ChipMask(4);
    pub const MMC5: ChipMask = ChipMask(8);
    pub const N163: ChipMask = ChipMask(16);
    pub const S5B: ChipMask = ChipMask(32);

    pub fn contains(self, chip: ChipMask) -> bool {
        self.0 & chip.0 != 0
    }

    /// Number of enabled expansion chips plus the 2A03 itself.
    pub fn chip_count(self) -> u32 {
        1 + self.0.count_ones()
    }
}

impl std::ops::BitOr for ChipMask {
    type Output = ChipMask;
    fn bitor(self, rhs: ChipMask) -> ChipMask {
        ChipMask(self.0 | rhs.0)
    }
}

/// Identifies which chip a mixer event came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChipId {
    Nes,
    Vrc6,
    Mmc5,
    S5b,
}

/// Every channel the core can produce, across all chips.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum ChannelId {
    Square1,
    Square2,
    Triangle,
    Noise,
    Dpcm,

    Vrc6Pulse1,
    Vrc6Pulse2,
    Vrc6Sawtooth,

    Mmc5Square1,
    Mmc5Square2,
    Mmc5Voice,

    N163Ch1,
    N163Ch2,
    N163Ch3,
    N163Ch4,
    N163Ch5,
    N163Ch6,
    N163Ch7,
    N163Ch8,

    Fds,

    Vrc7Ch1,
    Vrc7Ch2,
    Vrc7Ch3,
    Vrc7Ch4,
    Vrc7Ch5,
    Vrc7Ch6,

    S5bCh1,
    S5bCh2,
    S5bCh3,
}

pub const CHANNEL_COUNT: usize = 29;

impl ChannelId {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Per-chip output level trim slots (the 2A03 splits into its two mixer pins).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum ChipLevel {
    Apu1,
    Apu2,
    Vrc6,
    Vrc7,
    Mmc5,
    Fds,
    N163,
    S5b,
}

pub const CHIP_LEVEL_COUNT: usize = 8;

/// Peak meter for one channel: tracks the [min, max] amplitude swing since
/// the last query and resets on read, without touching the audio path.
#[derive(Clone, Copy, Default)]
pub struct LevelState {
    min: i32,
    max: i32,
    last: i32,
}

impl LevelState {
    pub fn update(&mut self, value: i32) {
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Amplitude swing since the previous call; resets the window.
    pub fn take_level(&mut self) -> i32 {
        let level = self.max - self.min;
        self.min = self.last;
        self.max = self.last;
        level
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Chips that emit discrete mixer events every clocked edge.
pub trait StepwiseChip {
    fn reset(&mut self);
    /// Advance by exactly `cycles` APU cycles, emitting events into the mixer.
    fn process(&mut self, cycles: u32, mixer: &mut Mixer);
    /// End the audio frame: rewind internal event timestamps to zero.
    fn end_frame(&mut self);
}

/// Chips that synthesize into a private buffer and splice a finished segment
/// into the master buffer once per frame.
pub trait BufferedChip {
    fn reset(&mut self);
    /// Advance by exactly `cycles` APU cycles, accumulating into the chip's
    /// private buffer. `out` is the master buffer (used for sample counting).
    fn process(&mut self, cycles: u32, out: &mut BlipBuffer);
    /// Drain the private buffer, filter, and mix into `out`. `scratch` may be
    /// overwritten freely and is discarded afterwards.
    fn end_frame(&mut self, out: &mut BlipBuffer, scratch: &mut [i16]);
}

/// An expansion chip slot owned by the scheduler (the 2A03 itself is a fixed
/// field there). A small fixed enum: the chip roster is known at compile
/// time, so there is no open-ended subclassing.
pub enum SoundChip {
    Vrc6(Vrc6),
    Mmc5(Mmc5),
    S5b(S5b),
    Fds(Fds),
    N163(N163),
    Vrc7(Vrc7),
}

impl SoundChip {
    pub fn reset(&mut self) {
        match self {
            SoundChip::Vrc6(c) => StepwiseChip::reset(c),
            SoundChip::Mmc5(c) => StepwiseChip::reset(c),
            SoundChip::S5b(c) => StepwiseChip::reset(c),
            SoundChip::Fds(c) => BufferedChip::reset(c),
            SoundChip::N163(c) => BufferedChip::reset(c),
            SoundChip::Vrc7(c) => BufferedChip::reset(c),
        }
    }

    pub fn process(&mut self, cycles: u32, mixer: &mut Mixer) {
        match self {
            SoundChip::Vrc6(c) => c.process(cycles, mixer),
            SoundChip::Mmc5(c) => c.process(cycles, mixer),
            SoundChip::S5b(c) => c.process(cycles, mixer),
            SoundChip::Fds(c) => c.process(cycles, mixer.buffer_mut()),
            SoundChip::N163(c) => c.process(cycles, mixer.buffer_mut()),
            SoundChip::Vrc7(c) => c.process(cycles, mixer.buffer_mut()),
        }
    }

    pub fn end_frame(&mut self, mixer: &mut Mixer, scratch: &mut [i16]) {
        match self {
            SoundChip::Vrc6(c) => StepwiseChip::end_frame(c),
            SoundChip::Mmc5(c) => StepwiseChip::end_frame(c),
            SoundChip::S5b(c) => StepwiseChip::end_frame(c),
            SoundChip::Fds(c) => c.end_frame(mixer.buffer_mut(), scratch),
            SoundChip::N163(c) => c.end_frame(mixer.buffer_mut(), scratch),
            SoundChip::Vrc7(c) => c.end_frame(mixer.buffer_mut(), scratch),
        }
    }

    pub fn write(&mut self, address: u16, value: u8, mixer: &mut Mixer) {
        match self {
            SoundChip::Vrc6(c) => c.write(address, value, mixer),
            SoundChip::Mmc5(c) => c.write(address, value),
            SoundChip::S5b(c) => c.write(address, value),
            SoundChip::Fds(c) => c.write(address, value),
            SoundChip::N163(c) => c.write(address, value),
            SoundChip::Vrc7(c) => c.write(address, value),
        }
    }

    /// Read a mapped register; `None` means the address is unmapped for this
    /// chip (the scheduler then falls through to the next chip or open bus).
    pub fn read(&mut self, address: u16) -> Option<u8> {
        match self {
            SoundChip::Mmc5(c) => c.read(address),
            SoundChip::Fds(c) => c.read(address),
            SoundChip::N163(c) => c.read(address),
            SoundChip::Vrc6(_) | SoundChip::S5b(_) | SoundChip::Vrc7(_) => None,
        }
    }

    pub fn log(&mut self, address: u16, value: u8) {
        match self {
            SoundChip::Vrc6(c) => c.log(address, value),
            SoundChip::Mmc5(c) => c.log(address, value),
            SoundChip::S5b(c) => c.log(address, value),
            SoundChip::Fds(c) => c.log(address, value),
            SoundChip::N163(c) => c.log(address, value),
            SoundChip::Vrc7(c) => c.log(address, value),
        }
    }

    pub fn logger(&self) -> &RegisterLogger {
        match self {
            SoundChip::Vrc6(c) => c.logger(),
            SoundChip::Mmc5(c) => c.logger(),
            SoundChip::S5b(c) => c.logger(),
            SoundChip::Fds(c) => c.logger(),
            SoundChip::N163(c) => c.logger(),
            SoundChip::Vrc7(c) => c.logger(),
        }
    }

    pub fn logger_mut(&mut self) -> &mut RegisterLogger {
        match self {
            SoundChip::Vrc6(c) => c.logger_mut(),
            SoundChip::Mmc5(c) => c.logger_mut(),
            SoundChip::S5b(c) => c.logger_mut(),
            SoundChip::Fds(c) => c.logger_mut(),
            SoundChip::N163(c) => c.logger_mut(),
            SoundChip::Vrc7(c) => c.logger_mut(),
        }
    }

    pub fn register(&self, address: u16) -> Option<&RegisterState> {
        self.logger().register(address)
    }

    /// Audible frequency of channel `chan` in Hz (0.0 when silent/invalid).
    pub fn chan_freq(&self, chan: usize) -> f64 {
        match self {
            SoundChip::Vrc6(c) => c.chan_freq(chan),
            SoundChip::Mmc5(c) => c.chan_freq(chan),
            SoundChip::S5b(c) => c.chan_freq(chan),
            SoundChip::Fds(c) => c.chan_freq(chan),
            SoundChip::N163(c) => c.chan_freq(chan),
            SoundChip::Vrc7(c) => c.chan_freq(chan),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_count_includes_the_2a03() {
        assert_eq!(ChipMask::NONE.chip_count(), 1);
        assert_eq!((ChipMask::VRC6 | ChipMask::FDS).chip_count(), 3);
    }

    #[test]
    fn level_state_tracks_swing_and_resets_on_read() {
        let mut level = LevelState::default();
        level.update(-20);
        level.update(35);
        assert_eq!(level.take_level(), 55);
        // After the read the window restarts from the last value.
        assert_eq!(level.take_level(), 0);
        level.update(40);
        assert_eq!(level.take_level(), 5);
    }
}
