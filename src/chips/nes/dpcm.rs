//! DPCM channel: DMA sample reader plus 1-bit delta output unit driving a
//! 7-bit counter. Sample memory is an external read-only window the DMA unit
//! addresses relative to $C000, wrapping within a 15-bit range.

use std::rc::Rc;

use crate::chips::{ChannelId, ChipId};
use crate::mixer::Mixer;

pub const DMC_PERIODS_NTSC: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

pub const DMC_PERIODS_PAL: [u16; 16] = [
    398, 354, 316, 298, 276, 236, 210, 198, 176, 148, 132, 118, 98, 78, 66, 50,
];

/// Read-only sample memory window (cartridge PRG space proxy), rebindable at
/// any time. Reads past the bound window return 0.
pub struct SampleMem {
    memory: Rc<[u8]>,
    reads: u64,
}

impl SampleMem {
    pub fn new() -> Self {
        Self { memory: Rc::from([]), reads: 0 }
    }

    pub fn set_mem(&mut self, memory: Rc<[u8]>) {
        self.memory = memory;
    }

    pub fn clear(&mut self) {
        self.memory = Rc::from([]);
    }

    /// Fetch the byte at `address` ($C000-relative like the DMA unit's bus).
    pub fn read(&mut self, address: u16) -> u8 {
        self.reads += 1;
        let offset = address.wrapping_sub(0xC000) as usize;
        self.memory.get(offset).copied().unwrap_or(0)
    }

    /// Total fetches performed, for diagnostics.
    pub fn read_count(&self) -> u64 {
        self.reads
    }
}

impl Default for SampleMem {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dpcm {
    pal: bool,

    time: u32,
    counter: u32,
    period: u16,

    bit_divider: u8,
    shift_reg: u8,
    play_mode: u8,
    delta_counter: u8,
    sample_buffer: u8,

    dma_load_reg: u16,
    dma_length_reg: u16,
    dma_address: u16,
    dma_bytes_remaining: u16,

    triggered_irq: bool,
    sample_filled: bool,
    silence_flag: bool,

    sample_mem: SampleMem,
}

impl Dpcm {
    pub fn new() -> Self {
        let mut dpcm = Self {
            pal: false,
            time: 0,
            counter: 0,
            period: 0,
            bit_divider: 0,
            shift_reg: 0,
            play_mode: 0,
            delta_counter: 0,
            sample_buffer: 0,
            dma_load_reg: 0,
            dma_length_reg: 0,
            dma_address: 0,
            dma_bytes_remaining: 0,
            triggered_irq: false,
            sample_filled: false,
            silence_flag: true,
            sample_mem: SampleMem::new(),
        };
        dpcm.reset();
        dpcm
    }

    fn period_table(&self) -> &'static [u16; 16] {
        if self.pal { &DMC_PERIODS_PAL } else { &DMC_PERIODS_NTSC }
    }

    pub fn set_machine(&mut self, pal: bool) {
        self.pal = pal;
    }

    pub fn reset(&mut self) {
        self.period = self.period_table()[0];
        self.counter = self.period as u32;

        self.bit_divider = 0;
        self.shift_reg = 0;
        self.dma_load_reg = 0;
        self.dma_length_reg = 0;
        self.dma_address = 0;
        self.dma_bytes_remaining = 0;

        self.triggered_irq = false;
        self.sample_filled = false;
        self.silence_flag = true;

        // Loaded with 0 on power-up.
        self.delta_counter = 0;

        self.end_frame();
    }

    /// Channel registers 0–3 ($4010–$4013).
    pub fn write(&mut self, reg: u16, value: u8, mixer: &mut Mixer) {
        match reg {
            0x00 => {
                self.play_mode = value & 0xC0;
                self.period = self.period_table()[(value & 0x0F) as usize];
                if value & 0x80 == 0 {
                    self.triggered_irq = false;
                }
            }
            0x01 => {
                // Direct load of the delta counter, audible immediately.
                self.delta_counter = value & 0x7F;
                mixer.add_event(
                    ChannelId::Dpcm,
                    ChipId::Nes,
                    self.delta_counter as i32,
                    self.time,
                );
            }
            0x02 => {
                self.dma_load_reg = value as u16;
            }
            0x03 => {
                self.dma_length_reg = value as u16;
            }
            _ => {}
        }
    }

    /// $4015 bit 4: enabling with an exhausted sample restarts it, disabling
    /// stops DMA immediately. Either write clears the IRQ latch.
    pub fn write_control(&mut self, value: u8) {
        if value & 1 != 0 {
            if self.dma_bytes_remaining == 0 {
                self.reload();
            }
        } else {
            self.dma_bytes_remaining = 0;
        }
        self.triggered_irq = false;
    }

    pub fn read_control(&self) -> bool {
        self.dma_bytes_remaining > 0
    }

    pub fn did_irq(&self) -> bool {
        self.triggered_irq
    }

    fn reload(&mut self) {
        self.dma_address = (self.dma_load_reg << 6) | 0x4000;
        self.dma_bytes_remaining = (self.dma_length_reg << 4) + 1;
    }

    pub fn process(&mut self, time: u32, mixer: &mut Mixer) {
        let mut time = time;
        while time >= self.counter {
            time -= self.counter;
            self.time += self.counter;
            self.counter = self.period as u32;

            // DMA reader: fetch the next byte when the buffer is empty.
            if !self.sample_filled && self.dma_bytes_remaining > 0 {
                self.sample_buffer = self.sample_mem.read(self.dma_address | 0x8000);
                self.dma_address = (self.dma_address + 1) & 0x7FFF;
                self.dma_bytes_remaining -= 1;
                self.sample_filled = true;

                if self.dma_bytes_remaining == 0 {
                    match self.play_mode {
                        0x40 | 0xC0 => self.reload(),
                        0x80 => self.triggered_irq = true,
                        _ => {}
                    }
                }
            }

            // Output unit: every 8 steps, refill the shift register or mark
            // the cycle silent.
            if self.bit_divider == 0 {
                self.bit_divider = 8;
                if self.sample_filled {
                    self.shift_reg = self.sample_buffer;
                    self.sample_filled = false;
                    self.silence_flag = false;
                } else {
                    self.silence_flag = true;
                }
            }

            if !self.silence_flag {
                if self.shift_reg & 1 != 0 {
                    if self.delta_counter < 126 {
                        self.delta_counter += 2;
                    }
                } else if self.delta_counter > 1 {
                    self.delta_counter -= 2;
                }
            }

            self.shift_reg >>= 1;
            self.bit_divider -= 1;

            mixer.add_event(
                ChannelId::Dpcm,
                ChipId::Nes,
                self.delta_counter as i32,
                self.time,
            );
        }

        self.counter -= time;
        self.time += time;
    }

    pub fn end_frame(&mut self) {
        self.time = 0;
    }

    pub fn frequency(&self) -> f64 {
        if !self.sample_filled && self.dma_bytes_remaining == 0 {
            return 0.0;
        }
        let rate = if self.pal {
            crate::apu::BASE_FREQ_PAL
        } else {
            crate::apu::BASE_FREQ_NTSC
        };
        rate as f64 / self.period as f64
    }

    pub fn sample_mem(&mut self) -> &mut SampleMem {
        &mut self.sample_mem
    }

    /// Progress through the sample in 64-byte pages.
    pub fn sample_pos(&self) -> u8 {
        (self.dma_address.wrapping_sub((self.dma_load_reg << 6) | 0x4000) >> 6) as u8
    }

    pub fn delta_counter(&self) -> u8 {
        self.delta_counter
    }

    pub fn is_playing(&self) -> bool {
        self.dma_bytes_remaining > 0
    }

    pub fn bytes_remaining(&self) -> u16 {
        self.dma_bytes_remaining
    }

    pub fn dma_address(&self) -> u16 {
        self.dma_address
    }
}

impl Default for Dpcm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::MixerConfig;
    use std::rc::Rc;

    fn mixer() -> Mixer {
        let mut m = Mixer::new();
        m.allocate_buffer(44100 / 16, 44100).unwrap();
        m.set_clock_rate(1_789_773);
        m.update_settings(MixerConfig::default());
        m
    }

    #[test]
    fn enable_computes_address_and_length() {
        let mut dpcm = Dpcm::new();
        let mut m = mixer();
        dpcm.write(2, 0x12, &mut m); // load register
        dpcm.write(3, 0x05, &mut m); // length register
        dpcm.write_control(1);
        assert_eq!(dpcm.dma_address(), (0x12 << 6) | 0x4000);
        assert_eq!(dpcm.bytes_remaining(), (0x05 << 4) + 1);
    }

    #[test]
    fn loop_mode_reloads_identically_after_consuming_all_bytes() {
        let mut dpcm = Dpcm::new();
        let mut m = mixer();
        let sample: Rc<[u8]> = Rc::from(vec![0xAA; 0x200]);
        dpcm.sample_mem().set_mem(sample);

        dpcm.write(0, 0x4F, &mut m); // loop mode, fastest rate
        dpcm.write(2, 0x00, &mut m);
        dpcm.write(3, 0x00, &mut m); // 1 byte
        dpcm.write_control(1);
        let start_addr = dpcm.dma_address();
        let start_len = dpcm.bytes_remaining();

        // Run long enough to consume the byte several times over.
        for _ in 0..64 {
            dpcm.process(1000, &mut m);
        }
        assert!(dpcm.is_playing());
        // Reload restores the identical address/length pair.
        assert_eq!(dpcm.bytes_remaining(), start_len);
        assert_eq!(dpcm.dma_address() & !0x003F, start_addr & !0x003F);
    }

    #[test]
    fn irq_mode_latches_after_last_byte() {
        let mut dpcm = Dpcm::new();
        let mut m = mixer();
        dpcm.sample_mem().set_mem(Rc::from(vec![0x00; 0x100]));
        dpcm.write(0, 0x8F, &mut m); // IRQ mode
        dpcm.write(3, 0x00, &mut m);
        dpcm.write_control(1);
        for _ in 0..64 {
            dpcm.process(1000, &mut m);
        }
        assert!(!dpcm.is_playing());
        assert!(dpcm.did_irq());
        // Clearing the IRQ-enable bit drops the latch.
        dpcm.write(0, 0x0F, &mut m);
        assert!(!dpcm.did_irq());
    }

    #[test]
    fn no_fetch_happens_with_zero_bytes_remaining() {
        let mut dpcm = Dpcm::new();
        let mut m = mixer();
        dpcm.sample_mem().set_mem(Rc::from(vec![0xFF; 0x100]));
        dpcm.write(0, 0x0F, &mut m);
        // DMA never enabled: output runs silent, memory is never touched.
        for _ in 0..32 {
            dpcm.process(1000, &mut m);
        }
        assert_eq!(dpcm.sample_mem.read_count(), 0);
    }

    #[test]
    fn delta_counter_stays_in_range() {
        let mut dpcm = Dpcm::new();
        let mut m = mixer();
        dpcm.sample_mem().set_mem(Rc::from(vec![0xFF; 0x1000]));
        dpcm.write(0, 0x4F, &mut m); // loop, all-ones sample ramps up
        dpcm.write(3, 0x10, &mut m);
        dpcm.write_control(1);
        for _ in 0..256 {
            dpcm.process(1000, &mut m);
            assert!(dpcm.delta_counter() <= 126);
        }
        assert_eq!(dpcm.delta_counter(), 126);
    }
}
