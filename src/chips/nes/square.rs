//! Square wave channel: duty sequencer, volume envelope, frequency sweep,
//! length counter. Shared by the 2A03 (both squares) and the MMC5, which
//! drops the sweep unit's minimum-period silencing rule.

use crate::chips::{ChannelId, ChipId};
use crate::mixer::Mixer;

use super::LENGTH_TABLE;

/// Duty sequences, one step per timer edge (16 steps per waveform period).
const DUTY_TABLE: [[u8; 16]; 4] = [
    [0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0],
    [1, 1, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
];

pub struct Square {
    chan: ChannelId,
    chip: ChipId,
    pub cpu_rate: u32,

    time: u32,
    counter: u32,
    period: u16,
    length_counter: u16,
    control_reg: u8,
    enabled: bool,

    duty_length: u8,
    duty_cycle: u8,

    looping: bool,
    envelope_fix: bool,
    envelope_speed: u8,
    envelope_volume: u8,
    fixed_volume: u8,
    envelope_counter: u8,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_mode: bool,
    sweep_shift: u8,
    sweep_counter: i16,
    sweep_result: i32,
    sweep_written: bool,
}

impl Square {
    pub fn new(chan: ChannelId, chip: ChipId, cpu_rate: u32) -> Self {
        let mut square = Self {
            chan,
            chip,
            cpu_rate,
            time: 0,
            counter: 0,
            period: 0,
            length_counter: 0,
            control_reg: 0,
            enabled: false,
            duty_length: 0,
            duty_cycle: 0,
            looping: false,
            envelope_fix: false,
            envelope_speed: 0,
            envelope_volume: 0,
            fixed_volume: 0,
            envelope_counter: 0,
            sweep_enabled: false,
            sweep_period: 0,
            sweep_mode: false,
            sweep_shift: 0,
            sweep_counter: 0,
            sweep_result: 0,
            sweep_written: false,
        };
        square.reset();
        square
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.control_reg = 0;
        self.counter = 0;

        self.sweep_counter = 1;
        self.sweep_period = 1;

        self.envelope_counter = 1;
        self.envelope_speed = 1;

        for reg in 0..4 {
            self.write(reg, 0);
        }
        self.sweep_update(0);
        self.end_frame();
    }

    /// Channel registers 0–3 ($4000–$4003 / $4004–$4007 / $5000/$5002/$5003).
    pub fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0x00 => {
                self.duty_length = value >> 6;
                self.fixed_volume = value & 0x0F;
                self.looping = value & 0x20 != 0;
                self.envelope_fix = value & 0x10 != 0;
                self.envelope_speed = (value & 0x0F) + 1;
            }
            0x01 => {
                self.sweep_enabled = value & 0x80 != 0;
                self.sweep_period = ((value >> 4) & 0x07) + 1;
                self.sweep_mode = value & 0x08 != 0;
                self.sweep_shift = value & 0x07;
                self.sweep_written = true;
            }
            0x02 => {
                self.period = value as u16 | (self.period & 0x0700);
            }
            0x03 => {
                self.period = (((value & 0x07) as u16) << 8) | (self.period & 0xFF);
                self.length_counter = LENGTH_TABLE[((value & 0xF8) >> 3) as usize] as u16;
                self.duty_cycle = 0;
                self.envelope_volume = 0x0F;
                self.envelope_counter = self.envelope_speed;
                if self.control_reg != 0 {
                    self.enabled = true;
                }
            }
            _ => {}
        }
    }

    /// Per-channel enable bit from the chip's control register.
    pub fn write_control(&mut self, value: u8) {
        self.control_reg = value & 0x01;
        if self.control_reg == 0 {
            self.enabled = false;
        }
    }

    /// Length-counter-active flag for the control register readback.
    pub fn read_control(&self) -> bool {
        self.length_counter > 0 && self.enabled
    }

    fn valid(&self) -> bool {
        (self.period > 7 || (self.period > 0 && self.chip == ChipId::Mmc5))
            && self.enabled
            && self.length_counter > 0
            && self.sweep_result < 0x800
    }

    pub fn process(&mut self, time: u32, mixer: &mut Mixer) {
        if self.period == 0 {
            self.time += time;
            return;
        }

        let valid = self.valid();
        let mut time = time;
        while time >= self.counter {
            time -= self.counter;
            self.time += self.counter;
            self.counter = self.period as u32 + 1;

            let volume = if self.envelope_fix {
                self.fixed_volume
            } else {
                self.envelope_volume
            };
            let out = if valid && DUTY_TABLE[self.duty_length as usize][self.duty_cycle as usize] != 0 {
                volume as i32
            } else {
                0
            };
            mixer.add_event(self.chan, self.chip, out, self.time);
            self.duty_cycle = (self.duty_cycle + 1) & 0x0F;
        }

        self.counter -= time;
        self.time += time;
    }

    pub fn end_frame(&mut self) {
        self.time = 0;
    }

    pub fn frequency(&self) -> f64 {
        if !self.valid() {
            return 0.0;
        }
        self.cpu_rate as f64 / 16.0 / (self.period as f64 + 1.0)
    }

    pub fn length_counter_update(&mut self) {
        if !self.looping && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    /// Sweep tick. `diff` is the extra −1 bias the first hardware square
    /// applies when negating. The target period is recomputed on *every*
    /// tick — an out-of-range target silences the channel even when the
    /// period write is never committed.
    pub fn sweep_update(&mut self, diff: i32) {
        let shifted = (self.period >> self.sweep_shift) as i32;
        self.sweep_result = if self.sweep_mode {
            self.period as i32 - shifted - diff
        } else {
            self.period as i32 + shifted
        };

        self.sweep_counter -= 1;
        if self.sweep_counter == 0 {
            self.sweep_counter = self.sweep_period as i16;
            if self.sweep_enabled
                && self.period > 0x07
                && self.sweep_result < 0x800
                && self.sweep_shift > 0
            {
                self.period = self.sweep_result.max(0) as u16;
            }
        }

        if self.sweep_written {
            self.sweep_written = false;
            self.sweep_counter = self.sweep_period as i16;
        }
    }

    pub fn envelope_update(&mut self) {
        self.envelope_counter -= 1;
        if self.envelope_counter == 0 {
            self.envelope_counter = self.envelope_speed;
            if !self.envelope_fix {
                if self.looping {
                    self.envelope_volume = (self.envelope_volume.wrapping_sub(1)) & 0x0F;
                } else if self.envelope_volume > 0 {
                    self.envelope_volume -= 1;
                }
            }
        }
    }

    pub fn period(&self) -> u16 {
        self.period
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::MixerConfig;

    fn mixer() -> Mixer {
        let mut m = Mixer::new();
        m.allocate_buffer(44100 / 16, 44100).unwrap();
        m.set_clock_rate(1_789_773);
        m.update_settings(MixerConfig::default());
        m
    }

    fn square() -> Square {
        Square::new(ChannelId::Square1, ChipId::Nes, 1_789_773)
    }

    #[test]
    fn length_counter_halts_with_loop_bit() {
        let mut sq = square();
        sq.write_control(1);
        sq.write(0, 0x30); // loop/halt set, constant volume
        sq.write(3, 0x10); // length index 2 -> 20
        let before = sq.length_counter;
        assert!(before > 0);
        for _ in 0..1000 {
            sq.length_counter_update();
        }
        assert_eq!(sq.length_counter, before);
    }

    #[test]
    fn length_counter_never_goes_negative() {
        let mut sq = square();
        sq.write_control(1);
        sq.write(0, 0x10);
        sq.write(3, 0x18); // length index 3 -> 2
        for _ in 0..100 {
            sq.length_counter_update();
        }
        assert_eq!(sq.length_counter, 0);
    }

    #[test]
    fn sweep_target_overflow_silences_even_without_commit() {
        let mut sq = square();
        sq.write_control(1);
        sq.write(0, 0x1F);
        sq.write(1, 0x01); // sweep disabled (bit 7 clear), shift 1
        sq.write(2, 0xFF);
        sq.write(3, 0x07); // period 0x7FF
        sq.sweep_update(0); // target = 0x7FF + 0x3FF >= 0x800
        assert!(sq.sweep_result >= 0x800);
        assert!(!sq.valid());
        // The period itself was never replaced.
        assert_eq!(sq.period(), 0x7FF);
    }

    #[test]
    fn zero_period_emits_only_silence() {
        let mut sq = square();
        let mut m = mixer();
        sq.write_control(1);
        sq.write(0, 0x1F); // duty 0, constant volume 15
        sq.write(3, 0x08); // length loaded, period stays 0
        sq.process(10000, &mut m);
        assert_eq!(m.channel_level(ChannelId::Square1), 0);
    }

    #[test]
    fn counter_stays_within_period_reload() {
        let mut sq = square();
        let mut m = mixer();
        sq.write_control(1);
        sq.write(0, 0x3F);
        sq.write(2, 0x40);
        sq.write(3, 0x00);
        for _ in 0..200 {
            sq.process(7, &mut m);
            assert!(sq.counter() <= sq.period() as u32 + 1);
        }
    }

    #[test]
    fn mmc5_square_is_audible_below_period_eight() {
        let mut sq = Square::new(ChannelId::Mmc5Square1, ChipId::Mmc5, 1_789_773);
        sq.write_control(1);
        sq.write(0, 0x1F);
        sq.write(2, 0x04);
        sq.write(3, 0x08);
        assert!(sq.valid());
        assert!(sq.frequency() > 0.0);
    }
}
