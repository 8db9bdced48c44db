use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::collections::VecDeque;

// Define standard sample rates for clarity and consistency
pub const TELEPHONY_MULAW_SAMPLE_RATE: f64 = 8000.0;
pub const ENGINE_PCM16_SAMPLE_RATE: f64 = 16000.0;

/// One 20 ms telephony frame at 8 kHz.
pub const TELEPHONY_FRAME_SAMPLES: usize = 160;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Expands one G.711 μ-law code to a 16-bit linear sample.
pub fn mulaw_to_linear(code: u8) -> i16 {
    let code = !code;
    let exponent = (code >> 4) & 0x07;
    let mantissa = (code & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if code & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compresses a 16-bit linear sample to G.711 μ-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign: u8 = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;
    let segment = (magnitude >> 7) as u32;
    let exponent = (31 - segment.max(1).leading_zeros()).min(7) as u8;
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decodes a μ-law byte stream to linear PCM16 samples.
pub fn decode_mulaw(payload: &[u8]) -> Vec<i16> {
    payload.iter().map(|&code| mulaw_to_linear(code)).collect()
}

/// Encodes linear PCM16 samples to a μ-law byte stream.
pub fn encode_mulaw(pcm16: &[i16]) -> Vec<u8> {
    pcm16.iter().map(|&sample| linear_to_mulaw(sample)).collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Encodes PCM16 samples as little-endian bytes in base64.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

/// Decodes base64 little-endian PCM16. A trailing odd byte is ignored.
pub fn decode_i16(base64_fragment: &str) -> Vec<i16> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    } else {
        tracing::error!("Failed to decode base64 fragment to i16");
        Vec::new()
    }
}

/// A stateful mono resampler that accepts arbitrarily sized input.
///
/// The resampler is primed with two chunks of silence, so every push returns
/// exactly `input.len() * out_rate / in_rate` samples (cumulatively, rounded
/// down) at the cost of a fixed delay of two input chunks. A frame's audio may
/// therefore surface in the output of the frames that follow it. Call
/// [`StreamResampler::reset`] to discard that carried audio, and
/// [`StreamResampler::finish`] to drain it at the end of a stream.
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    chunk_size: usize,
    ratio: f64,
    pending: Vec<f32>,
    ready: VecDeque<f32>,
    pushed: u64,
    emitted: u64,
}

impl StreamResampler {
    pub fn new(in_rate: f64, out_rate: f64, chunk_size: usize) -> anyhow::Result<Self> {
        let mut stream = Self {
            resampler: create_resampler(in_rate, out_rate, chunk_size)?,
            chunk_size,
            ratio: out_rate / in_rate,
            pending: Vec::with_capacity(chunk_size * 3),
            ready: VecDeque::new(),
            pushed: 0,
            emitted: 0,
        };
        stream.prime();
        Ok(stream)
    }

    /// The 8 kHz telephony → 16 kHz engine resampler.
    pub fn telephony_to_engine() -> anyhow::Result<Self> {
        Self::new(
            TELEPHONY_MULAW_SAMPLE_RATE,
            ENGINE_PCM16_SAMPLE_RATE,
            TELEPHONY_FRAME_SAMPLES,
        )
    }

    fn prime(&mut self) {
        self.pending.resize(self.chunk_size * 2, 0.0);
        self.drain_full_chunks();
    }

    fn drain_full_chunks(&mut self) {
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            match self.resampler.process(&[chunk], None) {
                Ok(res) => self.ready.extend(&res[0]),
                Err(e) => {
                    tracing::error!(error = %e, "Resampler rejected a chunk");
                    break;
                }
            }
        }
    }

    /// Pushes samples and returns the resampled output owed for them.
    pub fn push(&mut self, samples: &[i16]) -> Vec<i16> {
        self.pending.extend(convert_i16_to_f32(samples));
        self.pushed += samples.len() as u64;
        self.drain_full_chunks();

        let owed = (self.pushed as f64 * self.ratio) as u64;
        let take = owed.saturating_sub(self.emitted).min(self.ready.len() as u64);
        self.emitted += take;
        let output: Vec<f32> = self.ready.drain(..take as usize).collect();
        convert_f32_to_i16(&output)
    }

    /// Flushes the audio still held back by the priming delay and resets.
    pub fn finish(&mut self) -> Vec<i16> {
        if self.pushed == 0 {
            return Vec::new();
        }
        // Pad past the filter lag so the last real samples come out.
        let padded = self.pending.len().div_ceil(self.chunk_size) * self.chunk_size + self.chunk_size;
        self.pending.resize(padded, 0.0);
        self.drain_full_chunks();

        let total = ((self.pushed + self.chunk_size as u64 * 2) as f64 * self.ratio) as u64;
        let tail = total.saturating_sub(self.emitted).min(self.ready.len() as u64);
        let output: Vec<f32> = self.ready.drain(..tail as usize).collect();
        self.reset();
        convert_f32_to_i16(&output)
    }

    /// Forgets all carried audio and filter state.
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.ready.clear();
        self.pushed = 0;
        self.emitted = 0;
        self.prime();
    }
}
