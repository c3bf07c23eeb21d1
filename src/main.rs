//! Demo player: programs a short 2A03 + VRC6 phrase through the register
//! interface, renders it frame by frame, and plays the result.
//! Usage: famisynth [seconds]

use std::env;

use famisynth::apu::BASE_FREQ_NTSC;
use famisynth::{Apu, AudioSink, ChipMask, Machine};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 44100;

/// Collects finished frames for one-shot playback at the end.
#[derive(Default)]
struct CollectSink {
    samples: Vec<i16>,
}

impl AudioSink for CollectSink {
    fn flush_buffer(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }
}

/// A small minor arpeggio in 2A03 square periods (NTSC).
const ARPEGGIO: [u16; 4] = [0x1AB, 0x152, 0x11D, 0x0D2];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let seconds: u32 = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let mut apu = Apu::new(CollectSink::default());
    apu.setup_sound(SAMPLE_RATE, 1, Machine::Ntsc)
        .expect("sound setup failed");
    apu.set_enabled_chips(ChipMask::VRC6);

    // Square 1 carries the arpeggio, the VRC6 sawtooth drones under it.
    apu.write(0x4015, 0x01);
    apu.write(0x4000, 0xBC); // duty 2, constant volume 12
    apu.write(0xB000, 0x18);
    apu.write(0xB001, 0x56);
    apu.write(0xB002, 0x82);

    let frames = seconds * 60;
    let frame_cycles = BASE_FREQ_NTSC / 60;
    for frame in 0..frames {
        if frame % 15 == 0 {
            let period = ARPEGGIO[(frame as usize / 15) % ARPEGGIO.len()];
            apu.write(0x4002, (period & 0xFF) as u8);
            apu.write(0x4003, 0x08 | (period >> 8) as u8);
        }
        apu.add_cycles(frame_cycles as i32);
        apu.process();
    }

    let samples = std::mem::take(&mut apu.sink_mut().samples);
    println!("rendered {} samples, playing...", samples.len());

    let (_stream, handle) = OutputStream::try_default().expect("no audio output device");
    let sink = Sink::try_new(&handle).expect("failed to open audio sink");
    sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
    sink.sleep_until_end();
}
