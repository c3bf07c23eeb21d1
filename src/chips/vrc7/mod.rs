//! Konami VRC7 expansion sound: wraps the chip's embedded 2-operator FM
//! synthesizer. The synthesizer runs in its own 3.579545 MHz clock domain
//! with no cycle-stepping interface, so this adapter only counts elapsed APU
//! cycles during processing and synthesizes the exact number of output
//! samples at end-of-frame, smoothing with a 2-sample moving average.
//!
//! $9010 latches a register index, $9030 writes the value.
//!
//! The VRC7's volume is deliberately exempt from the mixer's expansion
//! attenuation; do not route it through the shared gain path.

pub mod opll;
pub mod patches;

use crate::blip::{BlipBuffer, TrebleEq};
use crate::chips::{BufferedChip, LevelState};
use crate::registers::RegisterLogger;

pub use opll::Opll;
pub use patches::default_patch_table;

/// Mixing amplification: patch 14 at max volume measures ~13.8 dB above a
/// 50% square at v=15.
const AMPLIFY: f32 = 4.6;

/// The OPLL clock: half the NTSC colorburst-derived 3.579545 MHz.
pub const OPLL_CLOCK: u32 = 3_579_545;

/// Native synthesis rate: one sample per 72 OPLL clocks.
const NATIVE_RATE: f64 = OPLL_CLOCK as f64 / 72.0;

pub struct Vrc7 {
    opll: Opll,

    sample_rate: u32,
    /// Native samples per output sample.
    resample_step: f64,
    resample_phase: f64,
    native_prev: i32,
    native_next: i32,

    buffer: Vec<i16>,
    buffer_pos: usize,
    last_sample: i32,

    register_latch: u8,
    volume: f32,

    levels: [LevelState; 6],
    time: u32,

    logger: RegisterLogger,
}

impl Vrc7 {
    pub fn new() -> Self {
        let mut logger = RegisterLogger::new();
        logger.add_register_range(0x00, 0x07);
        logger.add_register_range(0x10, 0x15);
        logger.add_register_range(0x20, 0x25);
        logger.add_register_range(0x30, 0x35);

        Self {
            opll: Opll::new(default_patch_table()),
            sample_rate: 0,
            resample_step: 0.0,
            resample_phase: 1.0,
            native_prev: 0,
            native_next: 0,
            buffer: Vec::new(),
            buffer_pos: 0,
            last_sample: 0,
            register_latch: 0,
            volume: AMPLIFY,
            levels: [LevelState::default(); 6],
            time: 0,
            logger,
        }
    }

    /// Size the sample path: output rate plus the worst-case frame length.
    pub fn set_sample_speed(&mut self, sample_rate: u32, frame_rate: u32) {
        self.sample_rate = sample_rate;
        self.resample_step = NATIVE_RATE / sample_rate as f64;
        self.resample_phase = 1.0;
        // Allow some overflow past one frame.
        self.buffer = vec![0; (sample_rate / frame_rate) as usize * 2];
        self.buffer_pos = 0;
    }

    /// Direct volume: overall volume × the VRC7 trim, *without* the mixer's
    /// expansion attenuation (historical behavior, contractual).
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume * AMPLIFY;
    }

    pub fn update_filter(&mut self, _eq: &TrebleEq) {
        // The FM core is band-limited by its native rate and the moving
        // average; no kernel of its own to re-equalize.
    }

    /// Replace the built-in patch table (user configuration); patch 0 stays
    /// under control of registers $00–$07.
    pub fn set_patch_table(&mut self, patches: [[u8; 8]; 16]) {
        self.opll.set_patches(patches);
    }

    pub fn write(&mut self, address: u16, value: u8) {
        match address {
            0x9010 => self.register_latch = value,
            0x9030 => self.opll.write_reg(self.register_latch, value),
            _ => {}
        }
    }

    /// Register-indexed logging, like the hardware port pair.
    pub fn log(&mut self, address: u16, value: u8) {
        match address {
            0x9010 => {
                self.logger.set_port(value as u16);
            }
            0x9030 => {
                self.logger.write(value);
            }
            _ => {}
        }
    }

    pub fn logger(&self) -> &RegisterLogger {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut RegisterLogger {
        &mut self.logger
    }

    pub fn chan_freq(&self, chan: usize) -> f64 {
        if chan >= 6 {
            return 0.0;
        }
        let (fnum, block) = self.opll.chan_fnum(chan);
        if fnum == 0 {
            return 0.0;
        }
        NATIVE_RATE * fnum as f64 / (1u64 << (19 - block as u32)) as f64
    }

    pub fn channel_level(&mut self, chan: usize) -> i32 {
        if chan >= 6 {
            return 0;
        }
        let level = self.levels[chan].take_level();
        if level <= 0 {
            0
        } else {
            ((level as f32).ln() * 3.0) as i32
        }
    }

    /// One output-rate sample from the FM core, linear-interpolated out of
    /// the native 49716 Hz stream.
    fn next_sample(&mut self) -> i32 {
        while self.resample_phase >= 1.0 {
            self.resample_phase -= 1.0;
            self.native_prev = self.native_next;
            self.native_next = self.opll.calc();
        }
        let frac = self.resample_phase;
        self.resample_phase += self.resample_step;
        (self.native_prev as f64 + (self.native_next - self.native_prev) as f64 * frac) as i32
    }
}

impl BufferedChip for Vrc7 {
    fn reset(&mut self) {
        self.opll.reset();
        self.buffer_pos = 0;
        self.resample_phase = 1.0;
        self.native_prev = 0;
        self.native_next = 0;
        self.last_sample = 0;
        self.register_latch = 0;
        for level in &mut self.levels {
            level.reset();
        }
        self.time = 0;
    }

    fn process(&mut self, cycles: u32, _out: &mut BlipBuffer) {
        // No cycle stepping here: sample the channel meters and accumulate
        // elapsed time for end-of-frame synthesis.
        for chan in 0..6 {
            self.levels[chan].update(self.opll.chan_vol(chan));
        }
        self.time += cycles;
    }

    fn end_frame(&mut self, out: &mut BlipBuffer, _scratch: &mut [i16]) {
        let want_samples = out.count_samples(self.time) as usize;

        // Generate exactly the frame's worth of samples (the buffer may hold
        // a few carried over when frame boundaries straddle a sample).
        while self.buffer_pos < want_samples.min(self.buffer.len()) {
            let raw = self.next_sample();

            // Clipping is slightly asymmetric on hardware.
            let clipped = raw.clamp(-3200, 3600);
            let sample = ((clipped as f32 * self.volume) as i32).clamp(-32768, 32767);

            // Cheap approximation of the chip's output low-pass.
            self.buffer[self.buffer_pos] = ((sample + self.last_sample) >> 1) as i16;
            self.last_sample = sample;
            self.buffer_pos += 1;
        }

        let take = want_samples.min(self.buffer_pos);
        out.mix_samples(&self.buffer[..take]);
        self.buffer.copy_within(take..self.buffer_pos, 0);
        self.buffer_pos -= take;

        self.time = 0;
    }
}

impl Default for Vrc7 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apu::BASE_FREQ_NTSC;

    fn master() -> BlipBuffer {
        let mut buf = BlipBuffer::new();
        buf.set_sample_rate(44100, 250).unwrap();
        buf.set_clock_rate(BASE_FREQ_NTSC);
        buf
    }

    fn vrc7() -> Vrc7 {
        let mut chip = Vrc7::new();
        chip.set_sample_speed(44100, 60);
        chip.set_volume(1.0);
        chip
    }

    fn write_reg(chip: &mut Vrc7, reg: u8, value: u8) {
        chip.write(0x9010, reg);
        chip.write(0x9030, value);
    }

    #[test]
    fn frame_synthesis_matches_requested_sample_count() {
        let mut chip = vrc7();
        let mut out = master();
        let mut scratch = [0i16; 2048];
        let frame = BASE_FREQ_NTSC / 60;

        chip.process(frame, &mut out);
        chip.end_frame(&mut out, &mut scratch);
        out.end_frame(frame);

        let expected = 44100 / 60;
        let avail = out.samples_avail() as i64;
        assert!((avail - expected as i64).abs() <= 1, "got {avail}");
    }

    #[test]
    fn keyed_note_reaches_master_buffer() {
        let mut chip = vrc7();
        let mut out = master();
        let mut scratch = [0i16; 2048];

        write_reg(&mut chip, 0x30, 0x10); // patch 1, full volume
        write_reg(&mut chip, 0x10, 172);
        write_reg(&mut chip, 0x20, 0x10 | (4 << 1));

        let frame = BASE_FREQ_NTSC / 60;
        for _ in 0..4 {
            chip.process(frame, &mut out);
            chip.end_frame(&mut out, &mut scratch);
            out.end_frame(frame);
        }

        let mut samples = vec![0i16; 8192];
        let n = out.read_samples(&mut samples);
        assert!(samples[..n].iter().any(|&s| s != 0));
    }

    #[test]
    fn frequency_reporting_follows_fnum_and_block() {
        let mut chip = vrc7();
        write_reg(&mut chip, 0x10, 172);
        write_reg(&mut chip, 0x20, 4 << 1);
        let freq = chip.chan_freq(0);
        let expected = NATIVE_RATE * 172.0 / (1u64 << 15) as f64;
        assert!((freq - expected).abs() < 1e-6);
        assert_eq!(chip.chan_freq(1), 0.0);
    }
}
