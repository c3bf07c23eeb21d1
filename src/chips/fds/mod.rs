//! Famicom Disk System expansion sound.
//!
//! The wave unit updates every chip clock, so the chip owns a private
//! synthesis buffer and splices a finished, low-passed segment into the
//! master buffer at end-of-frame. Idle stretches are skipped in one jump via
//! the core's max-skippable-cycles query.
//!
//! Registers: $4040–$407F wavetable RAM, $4080–$408A control; $4090/$4092
//! read back the envelope gains.

pub mod wave;

use crate::apu::BASE_FREQ_NTSC;
use crate::blip::{BlipBuffer, BlipSynth, TrebleEq};
use crate::chips::{BufferedChip, LevelState};
use crate::registers::RegisterLogger;

pub use wave::{FdsEnvelope, FdsModulator, FdsWave};

/// Default dedicated low-pass cutoff in Hz (configurable at runtime).
const DEFAULT_LOWPASS_HZ: u32 = 2000;

pub struct Fds {
    wave: FdsWave,

    blip: BlipBuffer,
    synth: BlipSynth,

    cutoff_hz: u32,
    /// First-order IIR coefficient; lower means a stronger low-pass.
    alpha: f32,
    low_pass_state: f32,

    level: LevelState,
    time: u32,

    logger: RegisterLogger,
}

impl Fds {
    pub fn new() -> Self {
        let mut logger = RegisterLogger::new();
        logger.add_register_range(0x4040, 0x408F);

        Self {
            wave: FdsWave::new(),
            blip: BlipBuffer::new(),
            synth: BlipSynth::new(),
            cutoff_hz: DEFAULT_LOWPASS_HZ,
            alpha: 0.0,
            low_pass_state: 0.0,
            level: LevelState::default(),
            time: 0,
            logger,
        }
    }

    /// Apply the master treble EQ on top of the FDS's dedicated low-pass and
    /// (re)allocate the private buffer for the EQ's sample rate.
    pub fn update_filter(&mut self, eq: &TrebleEq) {
        self.synth.treble_eq(eq);
        // The private buffer performs no bass removal; the master buffer
        // already does that on readout.
        let _ = self.blip.set_sample_rate(eq.sample_rate, 250);
        self.blip.set_bass_freq(0);
        self.recompute_lowpass();
    }

    pub fn set_clock_rate(&mut self, rate: u32) {
        self.blip.set_clock_rate(rate);
    }

    pub fn set_lowpass_cutoff(&mut self, cutoff_hz: u32) {
        self.cutoff_hz = cutoff_hz;
        self.recompute_lowpass();
    }

    fn recompute_lowpass(&mut self) {
        let rate = self.blip.sample_rate();
        if rate == 0 {
            return;
        }
        // Good enough while the cutoff is small next to the sample rate, and
        // always stable: e^(-x) stays within (0, 1].
        let cutoff_rad = 2.0 * std::f32::consts::PI * self.cutoff_hz as f32 / rate as f32;
        self.alpha = 1.0 - (-cutoff_rad).exp();
    }

    pub fn update_mix_level(&mut self, v: f64) {
        self.synth.volume(v, 3500);
    }

    pub fn write(&mut self, address: u16, value: u8) {
        self.wave.write_register(address, value);
    }

    pub fn read(&mut self, address: u16) -> Option<u8> {
        match address {
            0x4040..=0x407F | 0x4090 | 0x4092 => Some(self.wave.read_register(address)),
            _ => None,
        }
    }

    pub fn log(&mut self, address: u16, value: u8) {
        if self.logger.set_port(address) {
            self.logger.write(value);
        }
    }

    pub fn logger(&self) -> &RegisterLogger {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut RegisterLogger {
        &mut self.logger
    }

    /// Wave frequency from the pitch registers; halted output reports 0.
    pub fn chan_freq(&self, chan: usize) -> f64 {
        if chan != 0 {
            return 0.0;
        }
        let lo = self.logger.register(0x4082).map_or(0, |r| r.value()) as u32;
        let hi = self.logger.register(0x4083).map_or(0, |r| r.value()) as u32;
        if hi & 0x80 != 0 {
            return 0.0;
        }
        let pitch = lo | ((hi << 8) & 0xF00);
        BASE_FREQ_NTSC as f64 * pitch as f64 / 4194304.0
    }

    /// Peak swing since the last query, meter-normalized.
    pub fn channel_level(&mut self, chan: usize) -> i32 {
        if chan != 0 {
            return 0;
        }
        self.level.take_level() / 38
    }

    pub fn mod_counter(&self) -> i8 {
        self.wave.mod_counter()
    }
}

impl BufferedChip for Fds {
    fn reset(&mut self) {
        self.wave.reset();
        self.synth.clear();
        self.blip.clear();
        self.low_pass_state = 0.0;
        self.level.reset();
        self.time = 0;
    }

    fn process(&mut self, cycles: u32, _out: &mut BlipBuffer) {
        let mut now = 0;
        while now < cycles {
            let skip = self.wave.clock_audio_max_skip().min(cycles - now);
            if skip > 0 {
                self.wave.skip_clock_audio(skip);
                now += skip;
            }
            if now >= cycles {
                break;
            }

            let out = self.wave.clock_audio() as i32;
            self.level.update(out);
            self.synth.update(self.time + now, out, &mut self.blip);
            now += 1;
        }

        self.time += cycles;
    }

    fn end_frame(&mut self, out: &mut BlipBuffer, scratch: &mut [i16]) {
        self.blip.end_frame(self.time);

        let read = self.blip.read_samples(scratch);

        // Low-pass the finished segment before handing it to the master mix.
        for sample in &mut scratch[..read] {
            let filtered =
                self.low_pass_state + self.alpha * (*sample as f32 - self.low_pass_state);
            *sample = filtered.round() as i16;
            // Nudge keeps the IIR state away from denormals.
            self.low_pass_state = filtered + 1e-18;
        }

        out.mix_samples(&scratch[..read]);
        self.time = 0;
    }
}

impl Default for Fds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fds() -> Fds {
        let mut fds = Fds::new();
        fds.update_filter(&TrebleEq::new(-24.0, 12000, 44100));
        fds.set_clock_rate(BASE_FREQ_NTSC);
        fds.update_mix_level(1.0);
        fds
    }

    fn master() -> BlipBuffer {
        let mut buf = BlipBuffer::new();
        buf.set_sample_rate(44100, 250).unwrap();
        buf.set_clock_rate(BASE_FREQ_NTSC);
        buf
    }

    #[test]
    fn running_wave_produces_audio_in_master_buffer() {
        let mut fds = fds();
        let mut out = master();
        let mut scratch = [0i16; 2048];

        // Program a ramp wave and start the carrier.
        fds.write(0x4089, 0x80);
        for i in 0..64u16 {
            fds.write(0x4040 + i, (i & 0x3F) as u8);
        }
        fds.write(0x4089, 0x00);
        fds.write(0x4080, 0x80 | 0x20); // fixed gain 32
        fds.write(0x4082, 0x00);
        fds.write(0x4083, 0x04); // mid pitch, running

        let frame = BASE_FREQ_NTSC / 60;
        fds.process(frame, &mut out);
        fds.end_frame(&mut out, &mut scratch);
        out.end_frame(frame);

        let mut samples = [0i16; 1024];
        let n = out.read_samples(&mut samples);
        assert!(n > 0);
        assert!(samples[..n].iter().any(|&s| s != 0));
    }

    #[test]
    fn wavetable_reads_back_when_halted() {
        let mut fds = fds();
        fds.write(0x4089, 0x80);
        fds.write(0x4040, 0x21);
        assert_eq!(fds.read(0x4040), Some(0x21));
        assert_eq!(fds.read(0x4000), None);
    }

    #[test]
    fn frequency_reporting_uses_pitch_registers() {
        let mut fds = fds();
        fds.write(0x4082, 0x00);
        fds.log(0x4082, 0x00);
        fds.write(0x4083, 0x80);
        fds.log(0x4083, 0x80);
        assert_eq!(fds.chan_freq(0), 0.0); // halted
        fds.write(0x4083, 0x01);
        fds.log(0x4083, 0x01);
        assert!(fds.chan_freq(0) > 0.0);
    }
}
