//! OPLL-style 2-operator FM synthesizer (the VRC7's embedded sound core):
//! six melodic channels, each a modulator/carrier slot pair with log-sine
//! phase lookup, ADSR envelopes, modulator feedback, and AM/FM LFOs. Output
//! is one mono sample per native tick (chip clock / 72 ≈ 49716 Hz).

/// Sine/exponent table resolution (quarter wave).
const SIN_LEN: usize = 256;

/// Full sine index width: 2 mirror bits + 8 table bits.
const PHASE_MASK: u32 = 0x3FF;

/// Phase accumulator fraction bits below the 10-bit sine index.
const PHASE_FRAC_BITS: u32 = 8;

/// Envelope attenuation domain: 7 bits, 0.375 dB per step.
const EG_MUTE: u8 = 127;

/// Multiplication factors ×2 (so 0.5 is representable).
const MULT2: [u32; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

/// Key-scale-level attenuation per block/fnum-high, in 0.375 dB units.
const KSL_TABLE: [u8; 16] = [0, 48, 64, 74, 80, 86, 90, 94, 96, 100, 102, 104, 106, 108, 110, 112];

const NUM_CHANNELS: usize = 6;

#[derive(Clone, Copy, PartialEq)]
enum EgState {
    Attack,
    Decay,
    Sustain,
    Release,
    Finished,
}

/// Decoded 8-byte patch half (one operator).
#[derive(Clone, Copy, Default)]
struct OpParams {
    am: bool,
    vib: bool,
    eg_hold: bool,
    ksr: bool,
    mult: u8,
    ksl: u8,
    tl: u8,        // modulator only, 6 bits × 0.75 dB
    wave_rect: bool,
    feedback: u8,  // modulator only
    ar: u8,
    dr: u8,
    sl: u8,
    rr: u8,
}

#[derive(Clone, Copy, Default)]
struct Patch {
    modulator: OpParams,
    carrier: OpParams,
}

impl Patch {
    fn decode(bytes: &[u8; 8]) -> Self {
        let op = |flags: u8| OpParams {
            am: flags & 0x80 != 0,
            vib: flags & 0x40 != 0,
            eg_hold: flags & 0x20 != 0,
            ksr: flags & 0x10 != 0,
            mult: flags & 0x0F,
            ..OpParams::default()
        };

        let mut modulator = op(bytes[0]);
        let mut carrier = op(bytes[1]);

        modulator.ksl = bytes[2] >> 6;
        modulator.tl = bytes[2] & 0x3F;
        carrier.ksl = bytes[3] >> 6;
        carrier.wave_rect = bytes[3] & 0x10 != 0;
        modulator.wave_rect = bytes[3] & 0x08 != 0;
        modulator.feedback = bytes[3] & 0x07;

        modulator.ar = bytes[4] >> 4;
        modulator.dr = bytes[4] & 0x0F;
        carrier.ar = bytes[5] >> 4;
        carrier.dr = bytes[5] & 0x0F;
        modulator.sl = bytes[6] >> 4;
        modulator.rr = bytes[6] & 0x0F;
        carrier.sl = bytes[7] >> 4;
        carrier.rr = bytes[7] & 0x0F;

        Self { modulator, carrier }
    }
}

/// One operator's run-time state.
#[derive(Clone, Copy)]
struct Slot {
    phase: u32,
    eg_state: EgState,
    eg_level: u8,
    eg_clock: u32,
    /// Last two linear outputs, for modulator feedback.
    history: [i32; 2],
}

impl Slot {
    fn new() -> Self {
        Self {
            phase: 0,
            eg_state: EgState::Finished,
            eg_level: EG_MUTE,
            eg_clock: 0,
            history: [0; 2],
        }
    }

    fn key_on(&mut self) {
        self.phase = 0;
        self.eg_state = EgState::Attack;
        self.eg_level = EG_MUTE;
        self.eg_clock = 0;
    }

    fn key_off(&mut self) {
        if self.eg_state != EgState::Finished {
            self.eg_state = EgState::Release;
        }
    }
}

#[derive(Clone, Copy)]
struct Channel {
    fnum: u16,
    block: u8,
    key_on: bool,
    sustain: bool,
    inst: u8,
    volume: u8,
    slots: [Slot; 2],
    last_output: i32,
}

impl Channel {
    fn new() -> Self {
        Self {
            fnum: 0,
            block: 0,
            key_on: false,
            sustain: false,
            inst: 0,
            volume: 0,
            slots: [Slot::new(); 2],
            last_output: 0,
        }
    }
}

pub struct Opll {
    patches: [[u8; 8]; 16],
    channels: [Channel; NUM_CHANNELS],
    registers: [u8; 0x40],

    /// Log-sine quarter table: −log2(sin) in 1/256-of-an-octave units.
    logsin: [u16; SIN_LEN],
    /// 2^x fraction table for converting back to linear.
    exp: [u16; SIN_LEN],

    am_phase: u32,
    fm_phase: u32,
}

impl Opll {
    pub fn new(patches: [[u8; 8]; 16]) -> Self {
        let mut logsin = [0u16; SIN_LEN];
        let mut exp = [0u16; SIN_LEN];
        for i in 0..SIN_LEN {
            let sin = ((i as f64 + 0.5) * std::f64::consts::FRAC_PI_2 / SIN_LEN as f64).sin();
            logsin[i] = (-sin.log2() * 256.0).round() as u16;
            exp[i] = ((2f64.powf(i as f64 / 256.0) - 1.0) * 1024.0).round() as u16;
        }

        Self {
            patches,
            channels: [Channel::new(); NUM_CHANNELS],
            registers: [0; 0x40],
            logsin,
            exp,
            am_phase: 0,
            fm_phase: 0,
        }
    }

    pub fn reset(&mut self) {
        self.channels = [Channel::new(); NUM_CHANNELS];
        self.registers = [0; 0x40];
        self.am_phase = 0;
        self.fm_phase = 0;
    }

    pub fn set_patches(&mut self, patches: [[u8; 8]; 16]) {
        self.patches = patches;
    }

    pub fn write_reg(&mut self, reg: u8, value: u8) {
        if reg as usize >= self.registers.len() {
            return;
        }
        self.registers[reg as usize] = value;

        match reg {
            0x00..=0x07 => {
                // User patch bytes land in slot 0.
                self.patches[0][reg as usize] = value;
            }
            0x10..=0x15 => {
                let chan = &mut self.channels[(reg & 0x07) as usize];
                chan.fnum = (chan.fnum & 0x100) | value as u16;
            }
            0x20..=0x25 => {
                let index = (reg & 0x07) as usize;
                let was_on = self.channels[index].key_on;
                let chan = &mut self.channels[index];
                chan.fnum = (chan.fnum & 0xFF) | (((value & 0x01) as u16) << 8);
                chan.block = (value >> 1) & 0x07;
                chan.sustain = value & 0x20 != 0;
                chan.key_on = value & 0x10 != 0;
                if chan.key_on && !was_on {
                    for slot in &mut chan.slots {
                        slot.key_on();
                    }
                } else if !chan.key_on && was_on {
                    for slot in &mut chan.slots {
                        slot.key_off();
                    }
                }
            }
            0x30..=0x35 => {
                let chan = &mut self.channels[(reg & 0x07) as usize];
                chan.inst = value >> 4;
                chan.volume = value & 0x0F;
            }
            _ => {}
        }
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.registers.get(reg as usize).copied().unwrap_or(0)
    }

    /// Look up a sign-mirrored sine amplitude with `att` extra attenuation
    /// (0.375 dB units); rectified waves mute the negative half.
    fn wave_lookup(&self, phase: u32, att: u32, rect: bool) -> i32 {
        let phase = phase & PHASE_MASK;
        let negative = phase & 0x200 != 0;
        if negative && rect {
            return 0;
        }
        let quarter = if phase & 0x100 != 0 {
            0xFF - (phase & 0xFF)
        } else {
            phase & 0xFF
        } as usize;

        // Both terms live in 1/256-octave log units.
        let level = self.logsin[quarter] as u32 + (att << 4);
        let fraction = (level & 0xFF) as usize;
        let shift = (level >> 8).min(31);
        let linear = ((self.exp[0xFF - fraction] as i32 + 1024) << 1) >> shift;
        if negative { -linear } else { linear }
    }

    /// Effective envelope rate clock period in samples (None = stalled).
    fn eg_period(rate: u8, rks: u8) -> Option<u32> {
        if rate == 0 {
            return None;
        }
        let rate4 = (rate as u32 * 4 + rks as u32).min(63);
        let shift = 13u32.saturating_sub(rate4 / 4);
        Some(((1u32 << shift).max(1) * 4) / (4 + (rate4 & 3)))
    }

    fn advance_envelope(slot: &mut Slot, params: &OpParams, chan_block_fnum: u8, sustain: bool) {
        // Key scaling of rate: 2 bits of block/fnum, halved without KSR.
        let rks = if params.ksr { chan_block_fnum } else { chan_block_fnum >> 2 };

        let (rate, target): (u8, u8) = match slot.eg_state {
            EgState::Attack => (params.ar, 0),
            EgState::Decay => (params.dr, params.sl * 8),
            EgState::Sustain => {
                if params.eg_hold {
                    (0, EG_MUTE) // held at the sustain level
                } else {
                    (params.rr, EG_MUTE)
                }
            }
            EgState::Release => {
                let rate = if sustain {
                    5
                } else if params.eg_hold {
                    params.rr
                } else {
                    7
                };
                (rate, EG_MUTE)
            }
            EgState::Finished => (0, EG_MUTE),
        };

        let Some(period) = Self::eg_period(rate, rks) else {
            return;
        };

        slot.eg_clock += 1;
        if slot.eg_clock < period {
            return;
        }
        slot.eg_clock = 0;

        match slot.eg_state {
            EgState::Attack => {
                // Exponential approach to zero attenuation.
                let step = (slot.eg_level >> 3) + 1;
                slot.eg_level = slot.eg_level.saturating_sub(step);
                if slot.eg_level == 0 || params.ar == 15 {
                    slot.eg_level = 0;
                    slot.eg_state = EgState::Decay;
                }
            }
            EgState::Decay => {
                if slot.eg_level < EG_MUTE {
                    slot.eg_level += 1;
                }
                if slot.eg_level >= target {
                    slot.eg_state = EgState::Sustain;
                }
            }
            EgState::Sustain | EgState::Release => {
                if slot.eg_level < EG_MUTE {
                    slot.eg_level += 1;
                }
                if slot.eg_level >= EG_MUTE {
                    slot.eg_state = EgState::Finished;
                }
            }
            EgState::Finished => {}
        }
    }

    /// Synthesize one native-rate sample across all 6 channels.
    pub fn calc(&mut self) -> i32 {
        // LFOs: AM ≈ 3.7 Hz tremolo, FM ≈ 6.4 Hz vibrato at the native rate.
        self.am_phase = self.am_phase.wrapping_add(78);
        self.fm_phase = self.fm_phase.wrapping_add(135);
        let am_att = {
            // Triangle 0..13 units (≈ 4.8 dB depth).
            let tri = (self.am_phase >> 16) & 0x3F;
            let tri = if tri >= 0x20 { 0x3F - tri } else { tri };
            (tri * 13 / 31) as u32
        };
        let fm_offset = {
            let tri = (self.fm_phase >> 16) & 0x3F;
            let tri = if tri >= 0x20 { 0x3F - tri } else { tri } as i32;
            tri - 16 // -16..15
        };

        let mut mix = 0i32;
        for index in 0..NUM_CHANNELS {
            let chan = self.channels[index];
            let patch = Patch::decode(&self.patches[chan.inst as usize]);
            let block_fnum = ((chan.block << 1) | (chan.fnum >> 8) as u8) & 0x0F;
            let ksl_base = KSL_TABLE[((chan.fnum >> 5) & 0x0F) as usize];

            let mut updated = chan;

            // Operator phase steps (18-bit cycle, 10-bit sine index on top).
            let step = |params: &OpParams| -> u32 {
                let base = (chan.fnum as u32 * MULT2[params.mult as usize]) << chan.block;
                let base = base >> 2;
                if params.vib {
                    // Vibrato scales with pitch: offset a few cents.
                    let depth = (base >> 7) as i32;
                    (base as i32 + (depth * fm_offset) / 16) as u32
                } else {
                    base
                }
            };

            // Modulator with self-feedback.
            let m = &mut updated.slots[0];
            m.phase = m.phase.wrapping_add(step(&patch.modulator));
            Self::advance_envelope(m, &patch.modulator, block_fnum, chan.sustain);
            let feedback = if patch.modulator.feedback > 0 {
                (m.history[0] + m.history[1]) >> (9 - patch.modulator.feedback)
            } else {
                0
            };
            let mod_ksl = Self::ksl_att(ksl_base, patch.modulator.ksl, chan.block);
            let mut mod_att = m.eg_level as u32 + patch.modulator.tl as u32 * 2 + mod_ksl;
            if patch.modulator.am {
                mod_att += am_att;
            }
            let mod_phase_index = (m.phase >> PHASE_FRAC_BITS).wrapping_add(feedback as u32);
            let mod_out = if m.eg_state == EgState::Finished {
                0
            } else {
                self.wave_lookup(mod_phase_index, mod_att.min(127), patch.modulator.wave_rect)
            };
            let m = &mut updated.slots[0];
            m.history[1] = m.history[0];
            m.history[0] = mod_out;

            // Carrier, phase-modulated by the modulator output.
            let c = &mut updated.slots[1];
            c.phase = c.phase.wrapping_add(step(&patch.carrier));
            Self::advance_envelope(c, &patch.carrier, block_fnum, chan.sustain);
            let car_ksl = Self::ksl_att(ksl_base, patch.carrier.ksl, chan.block);
            let mut car_att = c.eg_level as u32 + chan.volume as u32 * 8 + car_ksl;
            if patch.carrier.am {
                car_att += am_att;
            }
            let car_phase_index =
                (c.phase >> PHASE_FRAC_BITS).wrapping_add((mod_out >> 1) as u32);
            let car_out = if c.eg_state == EgState::Finished {
                0
            } else {
                self.wave_lookup(car_phase_index, car_att.min(127), patch.carrier.wave_rect)
            };

            updated.last_output = car_out;
            self.channels[index] = updated;
            mix += car_out;
        }

        mix
    }

    fn ksl_att(ksl_base: u8, ksl: u8, block: u8) -> u32 {
        if ksl == 0 {
            return 0;
        }
        let att = ksl_base as i32 - ((7 - block as i32) * 16);
        if att <= 0 {
            return 0;
        }
        (att as u32) >> (3 - ksl as u32)
    }

    /// Absolute level of a channel's most recent output, for metering.
    pub fn chan_vol(&self, chan: usize) -> i32 {
        self.channels.get(chan).map_or(0, |c| c.last_output.abs())
    }

    pub fn chan_fnum(&self, chan: usize) -> (u16, u8) {
        let c = &self.channels[chan];
        (c.fnum, c.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::vrc7::patches::default_patch_table;

    fn opll() -> Opll {
        Opll::new(default_patch_table())
    }

    fn key_on(opll: &mut Opll, chan: u8, fnum: u16, block: u8, inst: u8) {
        opll.write_reg(0x30 + chan, inst << 4);
        opll.write_reg(0x10 + chan, (fnum & 0xFF) as u8);
        opll.write_reg(
            0x20 + chan,
            0x10 | (block << 1) | ((fnum >> 8) & 1) as u8,
        );
    }

    #[test]
    fn silence_before_any_key_on() {
        let mut opll = opll();
        for _ in 0..256 {
            assert_eq!(opll.calc(), 0);
        }
    }

    #[test]
    fn keyed_channel_produces_audio() {
        let mut opll = opll();
        key_on(&mut opll, 0, 172, 4, 1);
        let mut nonzero = 0;
        for _ in 0..4096 {
            if opll.calc() != 0 {
                nonzero += 1;
            }
        }
        assert!(nonzero > 100, "only {nonzero} nonzero samples");
    }

    #[test]
    fn key_off_decays_to_silence() {
        let mut opll = opll();
        key_on(&mut opll, 0, 172, 4, 1);
        for _ in 0..4096 {
            opll.calc();
        }
        // Release the key and let the envelope run out.
        opll.write_reg(0x20, (4 << 1) | 0);
        for _ in 0..200_000 {
            opll.calc();
        }
        for _ in 0..512 {
            assert_eq!(opll.calc(), 0);
        }
    }

    #[test]
    fn user_patch_bytes_apply_to_instrument_zero() {
        let mut opll = opll();
        opll.write_reg(0x00, 0x21);
        opll.write_reg(0x01, 0x21);
        opll.write_reg(0x05, 0xF0); // carrier AR 15
        assert_eq!(opll.patches[0][5], 0xF0);
        key_on(&mut opll, 2, 200, 3, 0);
        let mut heard = false;
        for _ in 0..8192 {
            if opll.calc() != 0 {
                heard = true;
            }
        }
        assert!(heard);
    }

    #[test]
    fn max_volume_register_attenuates() {
        let mut opll = opll();
        key_on(&mut opll, 0, 172, 4, 1);
        let mut loud_peak = 0i32;
        for _ in 0..8192 {
            loud_peak = loud_peak.max(opll.calc().abs());
        }

        let mut opll = Opll::new(default_patch_table());
        opll.write_reg(0x30, (1 << 4) | 0x0F); // volume 15 = −22.5 dB
        opll.write_reg(0x10, 172);
        opll.write_reg(0x20, 0x10 | (4 << 1));
        let mut quiet_peak = 0i32;
        for _ in 0..8192 {
            quiet_peak = quiet_peak.max(opll.calc().abs());
        }
        assert!(quiet_peak < loud_peak);
    }
}
