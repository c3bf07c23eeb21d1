//! The emulation root: chip set, frame sequencer, cycle accounting, register
//! dispatch, and the audio-sink boundary.
//!
//! All timing is in integer APU cycles (NTSC 1,789,773 Hz / PAL 1,662,607 Hz).
//! `add_cycles` accumulates pending work; `process` consumes it in steps no
//! larger than the distance to the next frame-sequencer edge or frame
//! boundary, so no chip ever sees a step that could cross an audible state
//! change. Reads and writes flush pending cycles first; unmapped reads
//! return the high byte of the address (open bus).

use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chips::{
    CHIP_LEVEL_COUNT, ChannelId, ChipLevel, ChipMask, Fds, Mmc5, N163, Nes2a03, S5b, SoundChip,
    StepwiseChip, Vrc6, Vrc7,
};
use crate::mixer::{Mixer, MixerConfig};
use crate::registers::RegisterState;

pub const BASE_FREQ_NTSC: u32 = 1_789_773;
pub const BASE_FREQ_PAL: u32 = 1_662_607;
pub const FRAME_RATE_NTSC: u32 = 60;
pub const FRAME_RATE_PAL: u32 = 50;

/// Frame-sequencer rate: steps per second (1/240 s sub-intervals).
const SEQUENCER_FREQUENCY: u32 = 240;

/// Lowest frame rate the sound buffer must absorb without overflowing.
const RATE_MIN: u32 = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Machine {
    Ntsc,
    Pal,
}

impl Machine {
    pub fn base_freq(self) -> u32 {
        match self {
            Machine::Ntsc => BASE_FREQ_NTSC,
            Machine::Pal => BASE_FREQ_PAL,
        }
    }

    pub fn frame_rate(self) -> u32 {
        match self {
            Machine::Ntsc => FRAME_RATE_NTSC,
            Machine::Pal => FRAME_RATE_PAL,
        }
    }
}

/// Receives each finished frame of interleaved signed 16-bit PCM. The
/// boundary is push-only: backpressure is entirely the sink's concern.
pub trait AudioSink {
    fn flush_buffer(&mut self, samples: &[i16]);
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    #[error("invalid channel count: {0} (expected 1 or 2)")]
    InvalidChannelCount(u32),
    #[error("failed to allocate synthesis buffer: {0}")]
    BufferAllocation(&'static str),
}

/// A configuration snapshot, applied atomically by [`Apu::apply_config`].
/// Unset fields keep their current values; filters and gains are recomputed
/// once at the end regardless of how many fields changed.
#[derive(Default)]
pub struct ApuConfig {
    /// Enabled expansion chips; a change rebuilds and resets the chip set.
    pub external_sound: Option<ChipMask>,
    /// Master filter/volume settings.
    pub mixer: Option<MixerConfig>,
    /// Per-chip level trims in dB, indexed by [`ChipLevel`].
    pub chip_levels_db: [Option<f32>; CHIP_LEVEL_COUNT],
    /// Dedicated low-pass cutoffs for the buffered chips.
    pub fds_lowpass_hz: Option<u32>,
    pub n163_lowpass_hz: Option<u32>,
    /// N163 linear mixing (disables the hardware multiplexer emulation).
    pub n163_linear_mixing: Option<bool>,
    /// Replacement OPLL patch table for the VRC7.
    pub vrc7_patches: Option<[[u8; 8]; 16]>,
}

pub struct Apu<S: AudioSink> {
    sink: S,
    mixer: Mixer,

    nes: Nes2a03,
    expansions: Vec<SoundChip>,
    chip_mask: ChipMask,

    machine: Machine,
    base_freq: u32,
    sample_rate: u32,
    stereo: bool,

    cycles_to_run: u32,
    frame_cycles: u32,
    frame_clock: u32,
    frame_cycle_count: u32,

    sequencer_clock: u32,
    sequencer_next: u32,
    sequencer_count: u32,

    sound_buffer_samples: u32,
    sound_buffer: Vec<i16>,
    scratch: Vec<i16>,

    /// VRC7 level trim, kept out of the mixer's attenuation path on purpose.
    level_vrc7: f32,
    /// Current DPCM sample memory, rebound after chip-set rebuilds.
    sample_data: Option<Rc<[u8]>>,
}

impl<S: AudioSink> Apu<S> {
    pub fn new(sink: S) -> Self {
        let machine = Machine::Ntsc;
        Self {
            sink,
            mixer: Mixer::new(),
            nes: Nes2a03::new(machine.base_freq()),
            expansions: Vec::new(),
            chip_mask: ChipMask::NONE,
            machine,
            base_freq: machine.base_freq(),
            sample_rate: 44100,
            stereo: false,
            cycles_to_run: 0,
            frame_cycles: 0,
            frame_clock: machine.base_freq() / machine.frame_rate(),
            frame_cycle_count: machine.base_freq() / machine.frame_rate(),
            sequencer_clock: 0,
            sequencer_next: machine.base_freq() / SEQUENCER_FREQUENCY,
            sequencer_count: 0,
            sound_buffer_samples: 0,
            sound_buffer: Vec::new(),
            scratch: Vec::new(),
            level_vrc7: 1.0,
            sample_data: None,
        }
    }

    /// Allocate the sound path for a sample rate, channel count (1 = mono,
    /// 2 = stereo by duplication), and machine. Prior state is untouched on
    /// failure.
    pub fn setup_sound(
        &mut self,
        sample_rate: u32,
        channels: u32,
        machine: Machine,
    ) -> Result<(), SetupError> {
        if !(11025..=192_000).contains(&sample_rate) {
            warn!(sample_rate, "rejecting sound setup");
            return Err(SetupError::InvalidSampleRate(sample_rate));
        }
        if channels == 0 || channels > 2 {
            warn!(channels, "rejecting sound setup");
            return Err(SetupError::InvalidChannelCount(channels));
        }

        // Worst case: one frame at the minimum frame rate.
        let samples = sample_rate / RATE_MIN;
        self.mixer
            .allocate_buffer(samples, sample_rate)
            .map_err(SetupError::BufferAllocation)?;

        self.sample_rate = sample_rate;
        self.sound_buffer_samples = samples;
        self.stereo = channels == 2;
        self.sound_buffer = vec![0; (samples * channels) as usize * 2];
        self.scratch = vec![0; samples as usize * 2];

        self.change_machine_rate(machine);
        self.recompute_mixing();

        debug!(sample_rate, channels, ?machine, "sound path allocated");
        Ok(())
    }

    /// Worst-case samples per frame for the current setup.
    pub fn sound_buffer_samples(&self) -> u32 {
        self.sound_buffer_samples
    }

    /// Switch NTSC/PAL on the fly. Resets the session.
    pub fn change_machine_rate(&mut self, machine: Machine) {
        self.machine = machine;
        self.base_freq = machine.base_freq();
        self.frame_cycle_count = self.base_freq / machine.frame_rate();

        self.nes.change_machine(self.base_freq, machine == Machine::Pal);
        self.mixer.set_clock_rate(self.base_freq);
        for chip in &mut self.expansions {
            match chip {
                SoundChip::Fds(fds) => fds.set_clock_rate(self.base_freq),
                SoundChip::N163(n163) => n163.set_clock_rate(self.base_freq),
                SoundChip::Vrc7(vrc7) => {
                    vrc7.set_sample_speed(self.sample_rate, machine.frame_rate());
                }
                _ => {}
            }
        }

        info!(?machine, base_freq = self.base_freq, "machine rate changed");
        self.reset();
    }

    /// Tear down and rebuild the chip set for an enabled-chip mask, then
    /// reset everything. The chip set is otherwise fixed for a session.
    pub fn set_enabled_chips(&mut self, mask: ChipMask) {
        self.chip_mask = mask;
        self.nes = Nes2a03::new(self.base_freq);
        self.nes
            .change_machine(self.base_freq, self.machine == Machine::Pal);

        self.expansions.clear();
        if mask.contains(ChipMask::VRC6) {
            self.expansions.push(SoundChip::Vrc6(Vrc6::new()));
        }
        if mask.contains(ChipMask::VRC7) {
            let mut vrc7 = Vrc7::new();
            vrc7.set_sample_speed(self.sample_rate, self.machine.frame_rate());
            self.expansions.push(SoundChip::Vrc7(vrc7));
        }
        if mask.contains(ChipMask::FDS) {
            let mut fds = Fds::new();
            fds.set_clock_rate(self.base_freq);
            self.expansions.push(SoundChip::Fds(fds));
        }
        if mask.contains(ChipMask::MMC5) {
            self.expansions
                .push(SoundChip::Mmc5(Mmc5::new(self.base_freq)));
        }
        if mask.contains(ChipMask::N163) {
            let mut n163 = N163::new();
            n163.set_clock_rate(self.base_freq);
            self.expansions.push(SoundChip::N163(n163));
        }
        if mask.contains(ChipMask::S5B) {
            self.expansions.push(SoundChip::S5b(S5b::new()));
        }

        self.mixer.set_external_sound(mask);
        if let Some(data) = self.sample_data.clone() {
            self.nes.write_sample(data);
        }

        info!(mask = mask.0, chips = self.expansions.len() + 1, "chip set rebuilt");
        self.reset();
        self.recompute_mixing();
    }

    pub fn enabled_chips(&self) -> ChipMask {
        self.chip_mask
    }

    /// Reset every chip and the mixer to power-on state. Register history and
    /// pending cycles are dropped.
    pub fn reset(&mut self) {
        self.sequencer_count = 0;
        self.sequencer_clock = 0;
        self.sequencer_next = self.base_freq / SEQUENCER_FREQUENCY;

        self.cycles_to_run = 0;
        self.frame_cycles = 0;
        self.frame_clock = self.frame_cycle_count;

        self.mixer.clear_buffer();

        self.nes.logger_mut().reset();
        StepwiseChip::reset(&mut self.nes);
        for chip in &mut self.expansions {
            chip.logger_mut().reset();
            chip.reset();
        }
    }

    /// Accumulate pending emulation work. Negative amounts are ignored.
    pub fn add_cycles(&mut self, cycles: i32) {
        if cycles < 0 {
            return;
        }
        self.cycles_to_run += cycles as u32;
    }

    /// Consume all pending cycles. Each iteration advances every chip by the
    /// largest step that cannot cross a frame-sequencer edge or the frame
    /// boundary, then fires whichever of the two was reached.
    pub fn process(&mut self) {
        while self.cycles_to_run > 0 {
            let mut time = self.cycles_to_run;
            time = time.min(self.sequencer_next - self.sequencer_clock);
            time = time.min(self.frame_clock);

            self.nes.process(time, &mut self.mixer);
            for chip in &mut self.expansions {
                chip.process(time, &mut self.mixer);
            }

            self.frame_cycles += time;
            self.sequencer_clock += time;
            self.frame_clock -= time;
            self.cycles_to_run -= time;

            if self.sequencer_clock == self.sequencer_next {
                self.step_sequence();
            }
            if self.frame_clock == 0 {
                self.end_frame();
            }
        }
    }

    fn step_sequence(&mut self) {
        self.sequencer_count += 1;
        if self.sequencer_count == SEQUENCER_FREQUENCY {
            self.sequencer_clock = 0;
            self.sequencer_count = 0;
        }
        // Integer target positions, so rounding never drifts over a second.
        self.sequencer_next = (self.base_freq as u64 * (self.sequencer_count as u64 + 1)
            / SEQUENCER_FREQUENCY as u64) as u32;

        self.nes.clock_sequence();
        for chip in &mut self.expansions {
            if let SoundChip::Mmc5(mmc5) = chip {
                // Electrically separate clock on the cartridge, same cadence.
                mmc5.clock_sequence();
            }
        }
    }

    /// End of audio frame: drain chips into the mixer, read the finished
    /// samples, and push them to the sink.
    fn end_frame(&mut self) {
        StepwiseChip::end_frame(&mut self.nes);
        let scratch = self.scratch.as_mut_slice();
        for chip in &mut self.expansions {
            chip.end_frame(&mut self.mixer, scratch);
        }

        self.mixer.finish_buffer(self.frame_cycles);
        let read = self.mixer.read_buffer(scratch);

        if self.stereo {
            for (i, &sample) in scratch[..read].iter().enumerate() {
                self.sound_buffer[i * 2] = sample;
                self.sound_buffer[i * 2 + 1] = sample;
            }
            self.sink.flush_buffer(&self.sound_buffer[..read * 2]);
        } else {
            self.sink.flush_buffer(&scratch[..read]);
        }

        self.frame_clock = self.frame_cycle_count;
        self.frame_cycles = 0;

        self.nes.logger_mut().step();
        for chip in &mut self.expansions {
            chip.logger_mut().step();
        }
    }

    /// Write a hardware register. Pending cycles are flushed first; every
    /// chip sees the write and filters by address. Unmapped writes are
    /// silently dropped.
    pub fn write(&mut self, address: u16, value: u8) {
        self.process();

        self.nes.write(address, value, &mut self.mixer);
        self.nes.log(address, value);
        for chip in &mut self.expansions {
            chip.write(address, value, &mut self.mixer);
            chip.log(address, value);
        }
    }

    /// Read a hardware register. Unmapped addresses read back the high byte
    /// of the address (open bus).
    pub fn read(&mut self, address: u16) -> u8 {
        self.process();

        if let Some(value) = self.nes.read(address) {
            return value;
        }
        for chip in &mut self.expansions {
            if let Some(value) = chip.read(address) {
                return value;
            }
        }
        (address >> 8) as u8
    }

    /// Apply a configuration snapshot atomically, recomputing filters and
    /// gains once.
    pub fn apply_config(&mut self, config: ApuConfig) {
        if let Some(mask) = config.external_sound {
            if mask != self.chip_mask {
                self.set_enabled_chips(mask);
            }
        }

        if let Some(mixer_config) = config.mixer {
            self.mixer.update_settings(mixer_config);
        }

        const LEVEL_SLOTS: [ChipLevel; CHIP_LEVEL_COUNT] = [
            ChipLevel::Apu1,
            ChipLevel::Apu2,
            ChipLevel::Vrc6,
            ChipLevel::Vrc7,
            ChipLevel::Mmc5,
            ChipLevel::Fds,
            ChipLevel::N163,
            ChipLevel::S5b,
        ];
        for (slot, level_db) in LEVEL_SLOTS.iter().zip(config.chip_levels_db.iter()) {
            let Some(db) = level_db else { continue };
            let gain = 10f32.powf(db / 20.0);
            if *slot == ChipLevel::Vrc7 {
                // Deliberately outside the mixer's attenuation path.
                self.level_vrc7 = gain;
            } else {
                self.mixer.set_chip_level(*slot, gain);
            }
        }

        for chip in &mut self.expansions {
            match chip {
                SoundChip::Fds(fds) => {
                    if let Some(hz) = config.fds_lowpass_hz {
                        fds.set_lowpass_cutoff(hz);
                    }
                }
                SoundChip::N163(n163) => {
                    if let Some(hz) = config.n163_lowpass_hz {
                        n163.set_lowpass_cutoff(hz);
                    }
                    if let Some(linear) = config.n163_linear_mixing {
                        n163.set_mixing_method(linear);
                    }
                }
                SoundChip::Vrc7(vrc7) => {
                    if let Some(patches) = config.vrc7_patches {
                        vrc7.set_patch_table(patches);
                    }
                }
                _ => {}
            }
        }

        self.recompute_mixing();
        debug!("configuration applied");
    }

    /// Push the current filter/volume state down to every synth, including
    /// the buffered chips' private paths.
    fn recompute_mixing(&mut self) {
        if self.mixer.sample_rate() == 0 {
            return; // not set up yet
        }
        self.mixer.update_settings(self.mixer.config());

        let eq = self.mixer.treble_eq();
        let volume = self.mixer.overall_volume() * self.mixer.attenuation();
        for chip in &mut self.expansions {
            match chip {
                SoundChip::Fds(fds) => {
                    fds.update_filter(&eq);
                    fds.set_clock_rate(self.base_freq);
                    let level = self.mixer.chip_level(ChipLevel::Fds);
                    fds.update_mix_level((volume * level) as f64);
                }
                SoundChip::N163(n163) => {
                    n163.update_filter(&eq);
                    n163.set_clock_rate(self.base_freq);
                    let level = self.mixer.chip_level(ChipLevel::N163);
                    n163.update_mix_level((volume * level) as f64);
                }
                SoundChip::Vrc7(vrc7) => {
                    // Overall volume only: the attenuation exemption is
                    // load-bearing for existing mixer configurations.
                    vrc7.set_volume(self.mixer.overall_volume() * self.level_vrc7);
                }
                _ => {}
            }
        }
    }

    // ---- DPCM sample memory ------------------------------------------------

    /// Bind the DPCM sample window. The data is shared, not copied, and
    /// survives chip-set rebuilds.
    pub fn write_sample(&mut self, data: Rc<[u8]>) {
        self.sample_data = Some(data.clone());
        self.nes.write_sample(data);
    }

    pub fn clear_sample(&mut self) {
        self.sample_data = None;
        self.nes.clear_sample();
    }

    pub fn sample_pos(&self) -> u8 {
        self.nes.sample_pos()
    }

    pub fn delta_counter(&self) -> u8 {
        self.nes.delta_counter()
    }

    pub fn dpcm_playing(&self) -> bool {
        self.nes.dpcm_playing()
    }

    // ---- Introspection (visualizers, register views) -----------------------

    /// Peak level swing of a channel since the last query; resets on read.
    pub fn chan_vol(&mut self, chan: ChannelId) -> i32 {
        let index = chan.index();
        let n163 = ChannelId::N163Ch1.index()..=ChannelId::N163Ch8.index();
        let vrc7 = ChannelId::Vrc7Ch1.index()..=ChannelId::Vrc7Ch6.index();
        if chan == ChannelId::Fds || n163.contains(&index) || vrc7.contains(&index) {
            self.buffered_level(chan)
        } else {
            self.mixer.channel_level(chan)
        }
    }

    fn buffered_level(&mut self, chan: ChannelId) -> i32 {
        let index = chan.index();
        let n163_range = ChannelId::N163Ch1.index()..=ChannelId::N163Ch8.index();
        let vrc7_range = ChannelId::Vrc7Ch1.index()..=ChannelId::Vrc7Ch6.index();
        for chip in &mut self.expansions {
            match chip {
                SoundChip::Fds(fds) if chan == ChannelId::Fds => {
                    return fds.channel_level(0);
                }
                SoundChip::N163(n163) if n163_range.contains(&index) => {
                    return n163.channel_level(index - ChannelId::N163Ch1.index());
                }
                SoundChip::Vrc7(vrc7) if vrc7_range.contains(&index) => {
                    return vrc7.channel_level(index - ChannelId::Vrc7Ch1.index());
                }
                _ => {}
            }
        }
        0
    }

    /// Last value written to a register of `chip` (`ChipMask::NONE` = 2A03).
    pub fn reg(&self, chip: ChipMask, address: u16) -> u8 {
        self.register_state(chip, address).map_or(0, |r| r.value())
    }

    pub fn register_state(&self, chip: ChipMask, address: u16) -> Option<&RegisterState> {
        if chip == ChipMask::NONE {
            return self.nes.logger().register(address);
        }
        self.find_chip(chip)?.logger().register(address)
    }

    /// Audible frequency of `chan` on `chip`, in Hz.
    pub fn chan_freq(&self, chip: ChipMask, chan: usize) -> f64 {
        if chip == ChipMask::NONE {
            return self.nes.chan_freq(chan);
        }
        self.find_chip(chip).map_or(0.0, |c| c.chan_freq(chan))
    }

    pub fn fds_mod_counter(&self) -> i8 {
        for chip in &self.expansions {
            if let SoundChip::Fds(fds) = chip {
                return fds.mod_counter();
            }
        }
        0
    }

    fn find_chip(&self, mask: ChipMask) -> Option<&SoundChip> {
        self.expansions.iter().find(|chip| {
            matches!(
                (chip, mask),
                (SoundChip::Vrc6(_), ChipMask::VRC6)
                    | (SoundChip::Vrc7(_), ChipMask::VRC7)
                    | (SoundChip::Fds(_), ChipMask::FDS)
                    | (SoundChip::Mmc5(_), ChipMask::MMC5)
                    | (SoundChip::N163(_), ChipMask::N163)
                    | (SoundChip::S5b(_), ChipMask::S5B)
            )
        })
    }

    // ---- Diagnostics -------------------------------------------------------

    /// Current frame-sequencer step index on the 2A03.
    pub fn frame_step(&self) -> u8 {
        self.nes.frame_step()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
