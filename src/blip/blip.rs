//! Fixed-point band-limited synthesis buffer and waveform synthesizer.
//!
//! The buffer stores amplitude *deltas* at resampled (output-rate) positions
//! with 16 fractional bits; [`BlipSynth`] spreads each delta over a 12-tap
//! windowed-sinc step kernel selected from 1024 sub-sample phases. Reading
//! runs an integrating accumulator with a configurable bass high-pass shift.

/// Fractional bits of the clock → sample-position conversion factor.
const ACCURACY_BITS: u32 = 16;

/// Bits of sub-sample phase resolution. Fewer than 10 bits causes audible
/// aliasing on high-frequency pulse waves.
const PHASE_BITS: u32 = 10;

/// Number of sub-sample phases per kernel.
pub const PHASE_RES: usize = 1 << PHASE_BITS;

/// Kernel width of the widest supported impulse, in output samples.
const WIDEST_IMPULSE: usize = 16;

/// Guard samples kept past the end of the buffer for kernel spill-over.
const BUFFER_EXTRA: usize = WIDEST_IMPULSE + 2;

/// Kernel width used by every synth in this crate.
const QUALITY: usize = 12;

/// Internal sample resolution; output samples are `accum >> (SAMPLE_BITS - 16)`.
const SAMPLE_BITS: u32 = 30;

const IMPULSES_LEN: usize = PHASE_RES / 2 * QUALITY + 1;

/// Low-pass equalization parameters for a synth kernel: logarithmic rolloff
/// to `treble_db` at half the sample rate, starting at `rolloff_hz`.
#[derive(Clone, Copy, Debug)]
pub struct TrebleEq {
    pub treble_db: f64,
    pub rolloff_hz: u32,
    pub sample_rate: u32,
}

impl TrebleEq {
    pub fn new(treble_db: f64, rolloff_hz: u32, sample_rate: u32) -> Self {
        Self { treble_db, rolloff_hz, sample_rate }
    }

    /// Generate `count` points of the half impulse response.
    fn generate(&self, out: &mut [f32]) {
        let count = out.len();
        // Narrow kernels have a wider transition band; lower their cutoff.
        let oversample = PHASE_RES as f64 * 2.25 / count as f64 + 0.85;
        let half_rate = self.sample_rate as f64 * 0.5;
        let cutoff = self.rolloff_hz as f64 * oversample / half_rate;

        gen_sinc(out, PHASE_RES as f64 * oversample, self.treble_db, cutoff);

        // Half of a Hamming window.
        let to_fraction = std::f64::consts::PI / (count - 1) as f64;
        for (i, v) in out.iter_mut().enumerate() {
            *v *= (0.54 - 0.46 * (i as f64 * to_fraction).cos()) as f32;
        }
    }
}

impl Default for TrebleEq {
    fn default() -> Self {
        Self { treble_db: -8.0, rolloff_hz: 0, sample_rate: 44100 }
    }
}

/// Band-limited sinc with exponential treble rolloff, evaluated as a closed
/// form of the summed cosine spectrum.
fn gen_sinc(out: &mut [f32], oversample: f64, treble_db: f64, cutoff: f64) {
    let cutoff = cutoff.min(0.999);
    let treble = treble_db.clamp(-300.0, 5.0);

    let maxh = 4096.0;
    let rolloff = 10f64.powf(1.0 / (maxh * 20.0) * treble / (1.0 - cutoff));
    let pow_a_n = rolloff.powf(maxh - maxh * cutoff);
    let to_angle = std::f64::consts::PI / 2.0 / maxh / oversample;

    let count = out.len();
    for (i, v) in out.iter_mut().enumerate() {
        let angle = ((i as f64 - count as f64) * 2.0 + 1.0) * to_angle;
        let mut c = rolloff * ((maxh - 1.0) * angle).cos() - (maxh * angle).cos();
        let cos_nc_angle = (maxh * cutoff * angle).cos();
        let cos_nc1_angle = ((maxh * cutoff - 1.0) * angle).cos();
        let cos_angle = angle.cos();

        c = c * pow_a_n - rolloff * cos_nc1_angle + cos_nc_angle;
        let d = 1.0 + rolloff * (rolloff - cos_angle - cos_angle);
        let b = 2.0 - cos_angle - cos_angle;
        let a = 1.0 - cos_angle - cos_nc_angle + cos_nc1_angle;

        *v = ((a * d + c * b) / (b * d)) as f32; // a / b + c / d
    }
}

/// Fixed-point accumulation ring buffer at the output sample rate.
pub struct BlipBuffer {
    factor: u32,
    offset: u32,
    buffer: Vec<i32>,
    buffer_size: usize,
    reader_accum: i32,
    bass_shift: u32,
    sample_rate: u32,
    clock_rate: u32,
    bass_freq: u32,
}

impl BlipBuffer {
    pub fn new() -> Self {
        Self {
            factor: u32::MAX,
            offset: 0,
            buffer: Vec::new(),
            buffer_size: 0,
            reader_accum: 0,
            bass_shift: 0,
            sample_rate: 0,
            clock_rate: 0,
            bass_freq: 16,
        }
    }

    /// Set output sample rate and buffer length in milliseconds, then clear.
    /// Fails if the length is not representable in resampled time.
    pub fn set_sample_rate(&mut self, rate: u32, msec: u32) -> Result<(), &'static str> {
        let max_size = (u32::MAX >> ACCURACY_BITS) as usize - BUFFER_EXTRA - 64;
        let size = ((rate as u64 * (msec as u64 + 1) + 999) / 1000) as usize;
        if size > max_size {
            return Err("requested buffer length exceeds resampled time range");
        }

        self.buffer = vec![0; size + BUFFER_EXTRA];
        self.buffer_size = size;
        self.sample_rate = rate;

        if self.clock_rate != 0 {
            self.set_clock_rate(self.clock_rate);
        }
        self.set_bass_freq(self.bass_freq);
        self.clear();
        Ok(())
    }

    /// Set the number of source clock units per second.
    pub fn set_clock_rate(&mut self, rate: u32) {
        self.clock_rate = rate;
        let ratio = self.sample_rate as f64 / rate as f64;
        self.factor = (ratio * (1u32 << ACCURACY_BITS) as f64 + 0.5).floor() as u32;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Set the bass high-pass corner; higher values remove more bass.
    pub fn set_bass_freq(&mut self, freq: u32) {
        self.bass_freq = freq;
        let mut shift = 31;
        if freq > 0 && self.sample_rate > 0 {
            shift = 13;
            let mut f = ((freq as u64) << 16) / self.sample_rate as u64;
            loop {
                f >>= 1;
                if f == 0 {
                    break;
                }
                shift -= 1;
                if shift == 0 {
                    break;
                }
            }
        }
        self.bass_shift = shift;
    }

    /// End a time frame of `clocks` source cycles, making its samples
    /// readable. A new frame begins at the end of the current one.
    pub fn end_frame(&mut self, clocks: u32) {
        self.offset += clocks * self.factor;
        debug_assert!(self.samples_avail() as usize <= self.buffer_size);
    }

    pub fn samples_avail(&self) -> u32 {
        self.offset >> ACCURACY_BITS
    }

    /// Number of output samples a span of `clocks` source cycles adds to the
    /// current frame.
    pub fn count_samples(&self, clocks: u32) -> u32 {
        let last = (clocks * self.factor + self.offset) >> ACCURACY_BITS;
        last - (self.offset >> ACCURACY_BITS)
    }

    /// Read up to `dest.len()` samples out of the buffer, removing them.
    /// Returns the number of samples written.
    pub fn read_samples(&mut self, dest: &mut [i16]) -> usize {
        let count = (self.samples_avail() as usize).min(dest.len());
        if count == 0 {
            return 0;
        }

        let bass = self.bass_shift;
        let mut accum = self.reader_accum;
        for (i, out) in dest[..count].iter_mut().enumerate() {
            let mut s = accum >> (SAMPLE_BITS - 16);
            if s as i16 as i32 != s {
                s = 0x7FFF - (s >> 24); // clamp
            }
            *out = s as i16;
            accum += self.buffer[i] - (accum >> bass);
        }
        self.reader_accum = accum;

        self.remove_samples(count);
        count
    }

    fn remove_samples(&mut self, count: usize) {
        self.offset -= (count as u32) << ACCURACY_BITS;
        let remain = self.samples_avail() as usize + BUFFER_EXTRA;
        self.buffer.copy_within(count..count + remain, 0);
        self.buffer[remain..remain + count].fill(0);
    }

    /// Mix raw output-rate samples into the current frame position, as an
    /// amplitude staircase (used by chips that own a private buffer).
    pub fn mix_samples(&mut self, samples: &[i16]) {
        let start = (self.offset >> ACCURACY_BITS) as usize + WIDEST_IMPULSE / 2;
        let shift = SAMPLE_BITS - 16;
        let mut prev = 0i32;
        for (i, &s) in samples.iter().enumerate() {
            let s = (s as i32) << shift;
            self.buffer[start + i] += s - prev;
            prev = s;
        }
        self.buffer[start + samples.len()] -= prev;
    }

    /// Clear all samples and restart at time zero.
    pub fn clear(&mut self) {
        self.offset = 0;
        self.reader_accum = 0;
        self.buffer.fill(0);
    }

    #[inline]
    fn resampled_time(&self, clocks: u32) -> u32 {
        clocks * self.factor + self.offset
    }
}

impl Default for BlipBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-waveform synthesizer: deposits band-limited amplitude steps into a
/// [`BlipBuffer`]. Holds the phase-indexed kernel, the volume scale, and the
/// last amplitude for delta tracking.
pub struct BlipSynth {
    impulses: Vec<i16>,
    last_amp: i32,
    delta_factor: i32,
    volume_unit: f64,
    kernel_unit: i32,
}

impl BlipSynth {
    pub fn new() -> Self {
        Self {
            impulses: vec![0; IMPULSES_LEN],
            last_amp: 0,
            delta_factor: 0,
            volume_unit: 0.0,
            kernel_unit: 0,
        }
    }

    /// Set overall volume, where `range` is the greatest expected amplitude
    /// swing (max − min). The output value is around
    /// `(amplitude / range) * volume * 65536`.
    pub fn volume(&mut self, v: f64, range: u32) {
        self.volume_unit(v / range as f64);
    }

    /// Rebuild the kernel for the given treble equalization.
    pub fn treble_eq(&mut self, eq: &TrebleEq) {
        let half_size = PHASE_RES / 2 * (WIDEST_IMPULSE - 1);
        let mut fimpulse = vec![0f32; half_size + PHASE_RES * 2];

        let gen_count = PHASE_RES / 2 * (QUALITY - 1);
        eq.generate(&mut fimpulse[PHASE_RES..PHASE_RES + gen_count]);

        // Mirror slightly past center for the integration below.
        for i in 0..PHASE_RES {
            fimpulse[PHASE_RES + gen_count + i] = fimpulse[PHASE_RES + gen_count - 1 - i];
        }

        // Rescale so the kernel integrates to a fixed unit.
        let total: f64 = fimpulse[PHASE_RES..PHASE_RES + gen_count]
            .iter()
            .map(|&v| v as f64)
            .sum();
        let base_unit = 32768.0;
        let rescale = base_unit / 2.0 / total;
        self.kernel_unit = base_unit as i32;

        // Integrate, first-difference, rescale, convert to fixed point.
        let mut sum = 0.0;
        let mut next = 0.0;
        for i in 0..IMPULSES_LEN {
            self.impulses[i] = ((next - sum) * rescale + 0.5).floor() as i16;
            sum += fimpulse[i] as f64;
            next += fimpulse[i + PHASE_RES] as f64;
        }
        self.adjust_impulse();

        // Volume must be rescaled against the fresh kernel.
        let vol = self.volume_unit;
        if vol != 0.0 {
            self.volume_unit = 0.0;
            self.volume_unit(vol);
        }
    }

    /// Sum kernel taps per phase and push the rounding error into the final
    /// tap so every phase integrates to exactly `kernel_unit`.
    fn adjust_impulse(&mut self) {
        let size = IMPULSES_LEN;
        for p in (PHASE_RES / 2..PHASE_RES).rev() {
            let p2 = PHASE_RES - 2 - p;
            let mut error = self.kernel_unit as i64;
            let mut i = 1;
            while i < size {
                error -= self.impulses[i + p] as i64;
                error -= self.impulses[i + p2] as i64;
                i += PHASE_RES;
            }
            if p == p2 {
                error /= 2; // phase 0.5 uses the same half for both sides
            }
            self.impulses[size - PHASE_RES + p] =
                (self.impulses[size - PHASE_RES + p] as i64 + error) as i16;
        }
    }

    fn volume_unit(&mut self, new_unit: f64) {
        if new_unit == self.volume_unit {
            return;
        }
        if self.kernel_unit == 0 {
            self.treble_eq(&TrebleEq::default());
        }
        self.volume_unit = new_unit;
        let mut factor = new_unit * (1i64 << SAMPLE_BITS) as f64 / self.kernel_unit as f64;

        if factor > 0.0 {
            let mut shift = 0;
            // A very small unit requires attenuating the kernel itself.
            while factor < 2.0 {
                shift += 1;
                factor *= 2.0;
            }
            if shift > 0 {
                self.kernel_unit >>= shift;
                debug_assert!(self.kernel_unit > 0);
                // Keep values positive to avoid round-toward-zero asymmetry.
                let offset = 0x8000 + (1 << (shift - 1));
                let offset2 = 0x8000 >> shift;
                for imp in self.impulses.iter_mut() {
                    *imp = (((*imp as i32 + offset) >> shift) - offset2) as i16;
                }
                self.adjust_impulse();
            }
        }
        self.delta_factor = (factor + 0.5).floor() as i32;
    }

    /// Update the waveform's amplitude at the given frame-relative clock time,
    /// emitting a band-limited step for the difference from the previous
    /// amplitude.
    pub fn update(&mut self, clock: u32, amp: i32, buf: &mut BlipBuffer) {
        let delta = amp - self.last_amp;
        if delta != 0 {
            self.last_amp = amp;
            self.offset_resampled(buf.resampled_time(clock), delta, buf);
        }
    }

    /// Add an amplitude transition of `delta` at the given clock time.
    pub fn offset(&self, clock: u32, delta: i32, buf: &mut BlipBuffer) {
        self.offset_resampled(buf.resampled_time(clock), delta, buf);
    }

    fn offset_resampled(&self, time: u32, delta: i32, buf: &mut BlipBuffer) {
        let pos = (time >> ACCURACY_BITS) as usize;
        debug_assert!(pos < buf.buffer_size);
        let delta = delta * self.delta_factor;
        let phase = (time >> (ACCURACY_BITS - PHASE_BITS)) as usize & (PHASE_RES - 1);

        let fwd = (WIDEST_IMPULSE - QUALITY) / 2;
        let rev = fwd + QUALITY - 2;
        let mid = QUALITY / 2 - 1;
        for i in 0..=mid {
            buf.buffer[pos + fwd + i] +=
                self.impulses[PHASE_RES - phase + PHASE_RES * i] as i32 * delta;
            buf.buffer[pos + rev + 1 - i] +=
                self.impulses[phase + PHASE_RES * i] as i32 * delta;
        }
    }

    /// Forget the last amplitude (next update emits a full step from zero).
    pub fn clear(&mut self) {
        self.last_amp = 0;
    }
}

impl Default for BlipSynth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> BlipBuffer {
        let mut buf = BlipBuffer::new();
        buf.set_sample_rate(44100, 250).unwrap();
        buf.set_clock_rate(1_789_773);
        buf
    }

    #[test]
    fn frame_sample_count_matches_rate() {
        let mut buf = buffer();
        let frame_cycles = 1_789_773 / 60;
        buf.end_frame(frame_cycles);
        let avail = buf.samples_avail();
        assert!((avail as i64 - 44100 / 60).abs() <= 1, "got {avail}");
    }

    #[test]
    fn step_produces_nonzero_output() {
        let mut buf = buffer();
        let mut synth = BlipSynth::new();
        synth.volume(1.0, 100);
        synth.update(100, 50, &mut buf);
        buf.end_frame(10000);

        let mut out = [0i16; 512];
        let n = buf.read_samples(&mut out);
        assert!(n > 0);
        assert!(out[..n].iter().any(|&s| s != 0));
    }

    #[test]
    fn identical_updates_cancel_to_silence() {
        let mut buf = buffer();
        let mut synth = BlipSynth::new();
        synth.volume(1.0, 100);
        // Same amplitude twice: second update is a no-op delta.
        synth.update(100, 30, &mut buf);
        synth.update(200, 30, &mut buf);
        synth.update(300, 0, &mut buf);
        buf.end_frame(20000);

        let mut out = [0i16; 1024];
        let n = buf.read_samples(&mut out);
        // Tail settles back to (near) zero after the step returns to 0.
        assert!(out[n - 1].abs() < 64);
    }

    #[test]
    fn mix_samples_offsets_current_frame() {
        let mut buf = buffer();
        let samples = [1000i16; 32];
        buf.mix_samples(&samples);
        buf.end_frame(1_789_773 / 60);

        let mut out = [0i16; 1024];
        let n = buf.read_samples(&mut out);
        assert!(n >= 32);
        assert!(out[..32].iter().any(|&s| s != 0));
    }

    #[test]
    fn count_samples_is_consistent_with_end_frame() {
        let mut buf = buffer();
        let clocks = 29780;
        let counted = buf.count_samples(clocks);
        buf.end_frame(clocks);
        assert_eq!(counted, buf.samples_avail());
    }
}
