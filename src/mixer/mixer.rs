//! Event mixing, chip balancing, and peak metering.
//!
//! 2A03 channels pass through the console's non-linear DAC formulas before
//! synthesis; expansion chips mix linearly through their own synths. Gain
//! balancing between chips follows the historical attenuation measurements
//! unless survey mix is selected, which normalizes by chip count instead.

use crate::blip::{BlipBuffer, BlipSynth, TrebleEq};
use crate::chips::{CHANNEL_COUNT, CHIP_LEVEL_COUNT, ChannelId, ChipId, ChipLevel, ChipMask, LevelState};

/// Scale factor from the non-linear DAC output (0..~0.6) to synth amplitude.
const AMP_2A03: f64 = 400.0;

/// Historical per-chip attenuation: each enabled expansion chip shrinks the
/// whole mix to leave headroom, matching measured cartridge behavior.
const ATTENUATION_VRC6: f32 = 0.80;
const ATTENUATION_VRC7: f32 = 0.64;
const ATTENUATION_MMC5: f32 = 0.83;
const ATTENUATION_FDS: f32 = 0.90;
const ATTENUATION_N163: f32 = 0.70;
const ATTENUATION_S5B: f32 = 0.50;

/// Square pin of the 2A03 DAC: `95.88 / (8128/n + 100)` for n = sq1 + sq2.
fn calc_pin1(sq1: f64, sq2: f64) -> f64 {
    let sum = sq1 + sq2;
    if sum > 0.0 {
        95.88 / (8128.0 / sum + 100.0)
    } else {
        0.0
    }
}

/// Triangle/noise/DPCM pin of the 2A03 DAC.
fn calc_pin2(tri: f64, noise: f64, dmc: f64) -> f64 {
    if tri + noise + dmc > 0.0 {
        159.79 / (1.0 / (tri / 8227.0 + noise / 12241.0 + dmc / 22638.0) + 100.0)
    } else {
        0.0
    }
}

/// Filter and volume settings applied to the master buffer and event synths.
#[derive(Clone, Copy, Debug)]
pub struct MixerConfig {
    /// Bass high-pass corner in Hz.
    pub low_cut: u32,
    /// Treble rolloff corner in Hz.
    pub high_cut: u32,
    /// Treble damping in dB at half the sample rate.
    pub high_damp: u32,
    /// Overall volume, 1.0 = unity.
    pub overall_volume: f32,
    /// Chip-count normalization instead of the historical attenuation table.
    pub use_survey_mix: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            low_cut: 16,
            high_cut: 12000,
            high_damp: 24,
            overall_volume: 1.0,
            use_survey_mix: false,
        }
    }
}

pub struct Mixer {
    buffer: BlipBuffer,

    synth_2a03_ss: BlipSynth,
    synth_2a03_tnd: BlipSynth,
    synth_vrc6: BlipSynth,
    synth_mmc5: BlipSynth,
    synth_s5b: BlipSynth,

    /// Last value seen per channel, for delta computation and the DAC sums.
    channels: [i32; CHANNEL_COUNT],
    meters: [LevelState; CHANNEL_COUNT],

    chip_mask: ChipMask,
    sample_rate: u32,
    config: MixerConfig,
    /// Per-chip trims in linear gain (1.0 = unity).
    chip_levels: [f32; CHIP_LEVEL_COUNT],

    /// Previous DAC pin outputs, for delta synthesis of the non-linear mix.
    sum_ss: f64,
    sum_tnd: f64,
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            buffer: BlipBuffer::new(),
            synth_2a03_ss: BlipSynth::new(),
            synth_2a03_tnd: BlipSynth::new(),
            synth_vrc6: BlipSynth::new(),
            synth_mmc5: BlipSynth::new(),
            synth_s5b: BlipSynth::new(),
            channels: [0; CHANNEL_COUNT],
            meters: [LevelState::default(); CHANNEL_COUNT],
            chip_mask: ChipMask::NONE,
            sample_rate: 0,
            config: MixerConfig::default(),
            chip_levels: [1.0; CHIP_LEVEL_COUNT],
            sum_ss: 0.0,
            sum_tnd: 0.0,
        }
    }

    /// Allocate the master buffer: `samples` is the worst-case frame length
    /// in output samples. Fails only if the requested size is unrepresentable.
    pub fn allocate_buffer(&mut self, samples: u32, sample_rate: u32) -> Result<(), &'static str> {
        self.sample_rate = sample_rate;
        let msec = samples * 1000 * 2 / sample_rate;
        self.buffer.set_sample_rate(sample_rate, msec)
    }

    pub fn set_clock_rate(&mut self, rate: u32) {
        self.buffer.set_clock_rate(rate);
    }

    pub fn buffer_mut(&mut self) -> &mut BlipBuffer {
        &mut self.buffer
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Change the enabled-chip set; recomputes attenuation and synth gains.
    pub fn set_external_sound(&mut self, chips: ChipMask) {
        self.chip_mask = chips;
        self.update_settings(self.config);
    }

    pub fn set_chip_level(&mut self, chip: ChipLevel, linear_gain: f32) {
        self.chip_levels[chip as usize] = linear_gain;
    }

    pub fn chip_level(&self, chip: ChipLevel) -> f32 {
        self.chip_levels[chip as usize]
    }

    /// Combined headroom factor for the current chip set.
    pub fn attenuation(&self) -> f32 {
        if self.config.use_survey_mix {
            return 1.0 / self.chip_mask.chip_count() as f32;
        }
        let mut attenuation = 1.0;
        if self.chip_mask.contains(ChipMask::VRC6) {
            attenuation *= ATTENUATION_VRC6;
        }
        if self.chip_mask.contains(ChipMask::VRC7) {
            attenuation *= ATTENUATION_VRC7;
        }
        if self.chip_mask.contains(ChipMask::MMC5) {
            attenuation *= ATTENUATION_MMC5;
        }
        if self.chip_mask.contains(ChipMask::FDS) {
            attenuation *= ATTENUATION_FDS;
        }
        if self.chip_mask.contains(ChipMask::N163) {
            attenuation *= ATTENUATION_N163;
        }
        if self.chip_mask.contains(ChipMask::S5B) {
            attenuation *= ATTENUATION_S5B;
        }
        attenuation
    }

    pub fn overall_volume(&self) -> f32 {
        self.config.overall_volume
    }

    /// The treble equalization shared by the event synths; buffered chips
    /// apply the same EQ on top of their dedicated low-pass filters.
    pub fn treble_eq(&self) -> TrebleEq {
        TrebleEq::new(
            -(self.config.high_damp as f64),
            self.config.high_cut,
            self.sample_rate,
        )
    }

    pub fn config(&self) -> MixerConfig {
        self.config
    }

    /// Apply new filter/volume settings and recompute every synth. Before the
    /// sound path is allocated only the settings themselves are stored.
    pub fn update_settings(&mut self, config: MixerConfig) {
        self.config = config;
        if self.sample_rate == 0 {
            return;
        }
        let volume = config.overall_volume * self.attenuation();

        self.buffer.set_bass_freq(config.low_cut);

        let eq = self.treble_eq();
        self.synth_2a03_ss.treble_eq(&eq);
        self.synth_2a03_tnd.treble_eq(&eq);
        self.synth_vrc6.treble_eq(&eq);
        self.synth_mmc5.treble_eq(&eq);
        self.synth_s5b.treble_eq(&eq);

        let levels = &self.chip_levels;
        self.synth_2a03_ss.volume(volume as f64, 10000);
        self.synth_2a03_tnd.volume(volume as f64, 10000);
        self.synth_vrc6
            .volume((volume * 3.98333 * levels[ChipLevel::Vrc6 as usize]) as f64, 500);
        self.synth_mmc5
            .volume((volume * 1.18421 * levels[ChipLevel::Mmc5 as usize]) as f64, 130);
        self.synth_s5b
            .volume((volume * levels[ChipLevel::S5b as usize]) as f64, 1600);
    }

    /// Record a channel's new output level at `cycle` clocks into the frame.
    /// 2A03 levels feed the DAC formulas; expansion levels mix linearly.
    pub fn add_event(&mut self, chan: ChannelId, chip: ChipId, value: i32, cycle: u32) {
        let idx = chan.index();
        let delta = value - self.channels[idx];
        self.channels[idx] = value;
        self.store_level(chan, value);
        if delta == 0 {
            return;
        }

        match chip {
            ChipId::Nes => match chan {
                ChannelId::Square1 | ChannelId::Square2 => self.mix_square_pin(cycle),
                _ => self.mix_tnd_pin(cycle),
            },
            ChipId::Vrc6 => self.synth_vrc6.offset(cycle, delta, &mut self.buffer),
            ChipId::Mmc5 => self.synth_mmc5.offset(cycle, delta, &mut self.buffer),
            ChipId::S5b => self.synth_s5b.offset(cycle, delta, &mut self.buffer),
        }
    }

    fn mix_square_pin(&mut self, cycle: u32) {
        let level = self.chip_levels[ChipLevel::Apu1 as usize] as f64;
        let sq1 = self.channels[ChannelId::Square1.index()] as f64 * level;
        let sq2 = self.channels[ChannelId::Square2.index()] as f64 * level;
        let sum = if self.config.use_survey_mix {
            (sq1 + sq2) * 0.00752
        } else {
            calc_pin1(sq1, sq2)
        };
        let delta = ((sum - self.sum_ss) * AMP_2A03) as i32;
        self.sum_ss = sum;
        self.synth_2a03_ss.offset(cycle, delta, &mut self.buffer);
    }

    fn mix_tnd_pin(&mut self, cycle: u32) {
        let level = self.chip_levels[ChipLevel::Apu2 as usize] as f64;
        let tri = self.channels[ChannelId::Triangle.index()] as f64 * level;
        let noise = self.channels[ChannelId::Noise.index()] as f64 * level;
        let dmc = self.channels[ChannelId::Dpcm.index()] as f64 * level;
        let sum = if self.config.use_survey_mix {
            tri * 0.00851 + noise * 0.00494 + dmc * 0.00335
        } else {
            calc_pin2(tri, noise, dmc)
        };
        let delta = ((sum - self.sum_tnd) * AMP_2A03) as i32;
        self.sum_tnd = sum;
        self.synth_2a03_tnd.offset(cycle, delta, &mut self.buffer);
    }

    fn store_level(&mut self, chan: ChannelId, value: i32) {
        let mut level = value.abs();
        // Normalize a few channels so meters read comparably.
        match chan {
            ChannelId::Vrc6Sawtooth => level = level * 3 / 4,
            ChannelId::Dpcm => level /= 8,
            ChannelId::S5bCh1 | ChannelId::S5bCh2 | ChannelId::S5bCh3 => {
                level = ((level.max(1) as f32).ln() * 2.8) as i32;
            }
            _ => {}
        }
        self.meters[chan.index()].update(level);
    }

    /// Peak swing of an event-chip channel since the last query; resets.
    pub fn channel_level(&mut self, chan: ChannelId) -> i32 {
        self.meters[chan.index()].take_level()
    }

    /// Finish the audio frame covering `frame_cycles` clock cycles.
    pub fn finish_buffer(&mut self, frame_cycles: u32) {
        self.buffer.end_frame(frame_cycles);
    }

    pub fn samples_avail(&self) -> u32 {
        self.buffer.samples_avail()
    }

    pub fn read_buffer(&mut self, dest: &mut [i16]) -> usize {
        self.buffer.read_samples(dest)
    }

    /// Drop all buffered audio and delta state (used by a full reset).
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.synth_2a03_ss.clear();
        self.synth_2a03_tnd.clear();
        self.synth_vrc6.clear();
        self.synth_mmc5.clear();
        self.synth_s5b.clear();
        self.channels = [0; CHANNEL_COUNT];
        for meter in &mut self.meters {
            meter.reset();
        }
        self.sum_ss = 0.0;
        self.sum_tnd = 0.0;
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer() -> Mixer {
        let mut m = Mixer::new();
        m.allocate_buffer(44100 / 16, 44100).unwrap();
        m.set_clock_rate(1_789_773);
        m.update_settings(MixerConfig::default());
        m
    }

    #[test]
    fn attenuation_decreases_with_each_expansion_chip() {
        let mut m = mixer();
        let mut previous = m.attenuation();
        assert_eq!(previous, 1.0);
        let masks = [
            ChipMask::VRC6,
            ChipMask::VRC6 | ChipMask::FDS,
            ChipMask::VRC6 | ChipMask::FDS | ChipMask::N163,
            ChipMask::VRC6 | ChipMask::FDS | ChipMask::N163 | ChipMask::S5B,
        ];
        for mask in masks {
            m.set_external_sound(mask);
            let a = m.attenuation();
            assert!(a < previous, "attenuation must strictly decrease");
            previous = a;
        }
    }

    #[test]
    fn survey_mix_follows_chip_count() {
        let mut m = mixer();
        m.update_settings(MixerConfig { use_survey_mix: true, ..MixerConfig::default() });
        m.set_external_sound(ChipMask::VRC6 | ChipMask::MMC5);
        assert_eq!(m.attenuation(), 1.0 / 3.0);
        m.set_external_sound(ChipMask::NONE);
        assert_eq!(m.attenuation(), 1.0);
    }

    #[test]
    fn square_event_reaches_output() {
        let mut m = mixer();
        m.add_event(ChannelId::Square1, ChipId::Nes, 15, 100);
        m.add_event(ChannelId::Square1, ChipId::Nes, 0, 900);
        m.finish_buffer(29780);
        let mut out = [0i16; 2048];
        let n = m.read_buffer(&mut out);
        assert!(n > 0);
        assert!(out[..n].iter().any(|&s| s != 0));
    }

    #[test]
    fn meter_reads_swing_and_resets() {
        let mut m = mixer();
        m.add_event(ChannelId::Triangle, ChipId::Nes, 15, 0);
        m.add_event(ChannelId::Triangle, ChipId::Nes, 0, 10);
        assert_eq!(m.channel_level(ChannelId::Triangle), 15);
        assert_eq!(m.channel_level(ChannelId::Triangle), 0);
    }
}
