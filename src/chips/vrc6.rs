//! Konami VRC6 expansion sound: two pulse channels with selectable duty width
//! and a gate (force-volume) bit, plus a phase-accumulator sawtooth. All three
//! emit inverted-sign mixer events — the cartridge attenuates the mix rather
//! than adding to it.
//!
//! Register blocks: $9000–$9002 (pulse 1), $A000–$A002 (pulse 2),
//! $B000–$B002 (sawtooth).

use crate::apu::BASE_FREQ_NTSC;
use crate::chips::{ChannelId, ChipId, StepwiseChip};
use crate::mixer::Mixer;
use crate::registers::RegisterLogger;

struct Vrc6Pulse {
    chan: ChannelId,

    time: u32,
    counter: u32,
    period: u32,
    period_low: u8,
    period_high: u8,

    duty_cycle: u8,
    duty_counter: u8,
    volume: u8,
    gate: bool,
    enabled: bool,
}

impl Vrc6Pulse {
    fn new(chan: ChannelId) -> Self {
        Self {
            chan,
            time: 0,
            counter: 0,
            period: 0,
            period_low: 0,
            period_high: 0,
            duty_cycle: 0,
            duty_counter: 0,
            volume: 0,
            gate: false,
            enabled: false,
        }
    }

    fn reset(&mut self) {
        self.duty_cycle = 0;
        self.volume = 0;
        self.gate = false;
        self.enabled = false;
        self.period = 0;
        self.period_low = 0;
        self.period_high = 0;
        self.counter = 0;
        self.duty_counter = 0;
        self.end_frame();
    }

    fn write(&mut self, reg: u16, value: u8, mixer: &mut Mixer) {
        match reg {
            0x00 => {
                self.gate = value & 0x80 != 0;
                self.duty_cycle = ((value & 0x70) >> 4) + 1;
                self.volume = value & 0x0F;
                if self.gate {
                    mixer.add_event(self.chan, ChipId::Vrc6, -(self.volume as i32), self.time);
                }
            }
            0x01 => {
                self.period_low = value;
                self.period = self.period_low as u32 + ((self.period_high as u32) << 8);
            }
            0x02 => {
                // The phase is held reset while the channel is disabled. Only
                // the coarse counter: the fine counter keeps its position, as
                // on hardware.
                if !self.enabled {
                    self.duty_counter = 0;
                }
                self.enabled = value & 0x80 != 0;
                self.period_high = value & 0x0F;
                self.period = self.period_low as u32 + ((self.period_high as u32) << 8);
            }
            _ => {}
        }
    }

    fn process(&mut self, time: u32, mixer: &mut Mixer) {
        if !self.enabled || self.period == 0 {
            self.time += time;
            return;
        }

        let mut time = time;
        while time >= self.counter {
            time -= self.counter;
            self.time += self.counter;
            self.counter = self.period + 1;

            self.duty_counter = (self.duty_counter + 1) & 0x0F;
            let out = if self.gate || self.duty_counter >= self.duty_cycle {
                self.volume as i32
            } else {
                0
            };
            mixer.add_event(self.chan, ChipId::Vrc6, -out, self.time);
        }

        self.counter -= time;
        self.time += time;
    }

    fn end_frame(&mut self) {
        self.time = 0;
    }

    fn frequency(&self) -> f64 {
        if self.gate || !self.enabled || self.period == 0 {
            return 0.0;
        }
        BASE_FREQ_NTSC as f64 / 16.0 / (self.period as f64 + 1.0)
    }
}

struct Vrc6Sawtooth {
    time: u32,
    counter: u32,
    period: u32,
    period_low: u8,
    period_high: u8,

    phase_accumulator: u8,
    phase_input: u8,
    step_count: u8,
    enabled: bool,
}

impl Vrc6Sawtooth {
    fn new() -> Self {
        Self {
            time: 0,
            counter: 0,
            period: 0,
            period_low: 0,
            period_high: 0,
            phase_accumulator: 0,
            phase_input: 0,
            step_count: 0,
            enabled: false,
        }
    }

    fn reset(&mut self) {
        self.phase_accumulator = 0;
        self.phase_input = 0;
        self.enabled = false;
        self.step_count = 0;
        self.period = 0;
        self.period_low = 0;
        self.period_high = 0;
        self.counter = 0;
        self.end_frame();
    }

    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0x00 => {
                self.phase_input = value & 0x3F;
            }
            0x01 => {
                self.period_low = value;
                self.period = self.period_low as u32 + ((self.period_high as u32) << 8);
            }
            0x02 => {
                if !self.enabled {
                    // Coarse counter (period 14) and numeric output reset
                    // while disabled; the fine down-counter keeps its phase,
                    // leaving up to 1/7 cycle of deliberate jitter.
                    self.step_count = 0;
                    self.phase_accumulator = 0;
                }
                self.enabled = value & 0x80 != 0;
                self.period_high = value & 0x0F;
                self.period = self.period_low as u32 + ((self.period_high as u32) << 8);
            }
            _ => {}
        }
    }

    fn process(&mut self, time: u32, mixer: &mut Mixer) {
        if !self.enabled || self.period == 0 {
            self.time += time;
            return;
        }

        let mut time = time;
        while time >= self.counter {
            time -= self.counter;
            self.time += self.counter;
            self.counter = self.period + 1;

            // The 6-bit phase input is added on every other internal step;
            // the accumulator resets after 14 steps (7 additions).
            if self.step_count & 1 != 0 {
                self.phase_accumulator = self.phase_accumulator.wrapping_add(self.phase_input);
            }
            self.step_count += 1;
            if self.step_count == 14 {
                self.phase_accumulator = 0;
                self.step_count = 0;
            }

            // The top 5 bits of the accumulator reach the mixer.
            mixer.add_event(
                ChannelId::Vrc6Sawtooth,
                ChipId::Vrc6,
                -((self.phase_accumulator >> 3) as i32),
                self.time,
            );
        }

        self.counter -= time;
        self.time += time;
    }

    fn end_frame(&mut self) {
        self.time = 0;
    }

    fn frequency(&self) -> f64 {
        if !self.enabled || self.period == 0 {
            return 0.0;
        }
        BASE_FREQ_NTSC as f64 / 14.0 / (self.period as f64 + 1.0)
    }
}

pub struct Vrc6 {
    pulse1: Vrc6Pulse,
    pulse2: Vrc6Pulse,
    sawtooth: Vrc6Sawtooth,
    logger: RegisterLogger,
}

impl Vrc6 {
    pub fn new() -> Self {
        let mut logger = RegisterLogger::new();
        logger.add_register_range(0x9000, 0x9003);
        logger.add_register_range(0xA000, 0xA002);
        logger.add_register_range(0xB000, 0xB002);

        Self {
            pulse1: Vrc6Pulse::new(ChannelId::Vrc6Pulse1),
            pulse2: Vrc6Pulse::new(ChannelId::Vrc6Pulse2),
            sawtooth: Vrc6Sawtooth::new(),
            logger,
        }
    }

    pub fn write(&mut self, address: u16, value: u8, mixer: &mut Mixer) {
        match address {
            0x9000..=0x9002 => self.pulse1.write(address & 3, value, mixer),
            0xA000..=0xA002 => self.pulse2.write(address & 3, value, mixer),
            0xB000..=0xB002 => self.sawtooth.write(address & 3, value),
            _ => {}
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

    pub fn chan_freq(&self, chan: usize) -> f64 {
        match chan {
            0 => self.pulse1.frequency(),
            1 => self.pulse2.frequency(),
            2 => self.sawtooth.frequency(),
            _ => 0.0,
        }
    }
}

impl StepwiseChip for Vrc6 {
    fn reset(&mut self) {
        self.pulse1.reset();
        self.pulse2.reset();
        self.sawtooth.reset();
    }

    fn process(&mut self, cycles: u32, mixer: &mut Mixer) {
        self.pulse1.process(cycles, mixer);
        self.pulse2.process(cycles, mixer);
        self.sawtooth.process(cycles, mixer);
    }

    fn end_frame(&mut self) {
        self.pulse1.end_frame();
        self.pulse2.end_frame();
        self.sawtooth.end_frame();
    }
}

impl Default for Vrc6 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::StepwiseChip;
    use crate::mixer::MixerConfig;

    fn mixer() -> Mixer {
        let mut m = Mixer::new();
        m.allocate_buffer(44100 / 16, 44100).unwrap();
        m.set_clock_rate(1_789_773);
        m.update_settings(MixerConfig::default());
        m
    }

    #[test]
    fn sawtooth_accumulator_resets_every_fourteen_steps() {
        let mut vrc6 = Vrc6::new();
        let mut m = mixer();
        vrc6.write(0xB000, 0x20, &mut m); // phase input 0x20
        vrc6.write(0xB001, 0x10, &mut m);
        vrc6.write(0xB002, 0x80, &mut m); // enable
        // The down-counter starts at zero, so the first call fires two steps;
        // 13 calls of one period each total exactly 14 steps.
        for _ in 0..13 {
            vrc6.process(0x11, &mut m);
        }
        assert_eq!(vrc6.sawtooth.step_count, 0);
        assert_eq!(vrc6.sawtooth.phase_accumulator, 0);
    }

    #[test]
    fn disabled_pulse_holds_duty_phase_reset() {
        let mut vrc6 = Vrc6::new();
        let mut m = mixer();
        vrc6.write(0x9000, 0x0F, &mut m);
        vrc6.write(0x9001, 0x40, &mut m);
        vrc6.write(0x9002, 0x80, &mut m); // enable
        vrc6.process(2000, &mut m);
        assert_ne!(vrc6.pulse1.duty_counter, 0);
        vrc6.write(0x9002, 0x00, &mut m); // disable: counter untouched yet
        vrc6.write(0x9002, 0x00, &mut m); // next write sees disabled state
        assert_eq!(vrc6.pulse1.duty_counter, 0);
    }

    #[test]
    fn pulse_events_are_inverted() {
        let mut vrc6 = Vrc6::new();
        let mut m = mixer();
        vrc6.write(0x9000, 0x8F, &mut m); // gate + volume 15: immediate event
        // The gate write emits the level directly; meters record |value|.
        assert_eq!(m.channel_level(ChannelId::Vrc6Pulse1), 15);
    }
}
