// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Chroma feature extraction for Musicgen-Melody: a Hann-window power
//! spectrogram folded through a librosa-style chroma filter bank, normalized
//! and quantized to a one-hot chroma per frame. Accepts raw waveforms or the
//! stem tensor produced by a demucs source separation.

use candle::{Result, Tensor};
use rubato::Resampler;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub feature_size: usize,
    pub sampling_rate: usize,
    pub hop_length: usize,
    pub chunk_length: usize,
    pub n_fft: usize,
    pub num_chroma: usize,
    pub padding_value: f32,
    /// Stems kept from a demucs output, "vocals" and "other".
    pub stem_indices: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feature_size: 12,
            sampling_rate: 32000,
            hop_length: 4096,
            chunk_length: 30,
            n_fft: 16384,
            num_chroma: 12,
            padding_value: 0.0,
            stem_indices: vec![3, 2],
        }
    }
}

impl Config {
    /// Samples per chunk, inputs are truncated to this length.
    pub fn n_samples(&self) -> usize {
        self.chunk_length * self.sampling_rate
    }
}

/// Sampling rate demucs operates at, used when none is given for a stem
/// tensor.
const DEMUCS_SAMPLING_RATE: usize = 44000;

fn hertz_to_chroma_number(freq: f64, num_chroma: usize, tuning: f64) -> f64 {
    let stuttgart_pitch = 440.0 * 2f64.powf(tuning / num_chroma as f64);
    num_chroma as f64 * (freq / (stuttgart_pitch / 16.0)).log2()
}

/// Librosa-style chroma filter bank, `num_chroma` rows of
/// `1 + num_frequency_bins / 2` spectrogram weights. Gaussian bumps around
/// each chroma center, L2-normalized per frequency column, Gaussian-weighted
/// towards mid octaves and rolled so that row 0 is C.
pub fn chroma_filter_bank(
    num_frequency_bins: usize,
    num_chroma: usize,
    sampling_rate: usize,
    tuning: f64,
) -> Result<Vec<Vec<f32>>> {
    if num_frequency_bins < 2 || num_chroma == 0 {
        candle::bail!(
            "invalid chroma filter bank parameters, {num_frequency_bins} bins and {num_chroma} chroma"
        )
    }
    let mut freq_bins: Vec<f64> = (1..num_frequency_bins)
        .map(|i| {
            let freq = i as f64 * sampling_rate as f64 / num_frequency_bins as f64;
            hertz_to_chroma_number(freq, num_chroma, tuning)
        })
        .collect();
    freq_bins.insert(0, freq_bins[0] - 1.5 * num_chroma as f64);
    let mut bins_width: Vec<f64> = freq_bins
        .windows(2)
        .map(|w| (w[1] - w[0]).max(1.0))
        .collect();
    bins_width.push(1.0);
    let half_chroma = (num_chroma as f64 / 2.0).round();
    let n_freqs = 1 + num_frequency_bins / 2;
    let roll = 3 * (num_chroma / 12);
    let mut filters = vec![vec![0f32; n_freqs]; num_chroma];
    for f in 0..n_freqs {
        let mut column = vec![0f64; num_chroma];
        for (c, v) in column.iter_mut().enumerate() {
            let d = freq_bins[f] - c as f64;
            let d = (d + half_chroma + 10.0 * num_chroma as f64).rem_euclid(num_chroma as f64)
                - half_chroma;
            *v = (-0.5 * (2.0 * d / bins_width[f]).powi(2)).exp();
        }
        let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
        let weight = (-0.5 * ((freq_bins[f] / num_chroma as f64 - 5.0) / 2.0).powi(2)).exp();
        for c in 0..num_chroma {
            filters[c][f] = (column[(c + roll) % num_chroma] / norm * weight) as f32;
        }
    }
    Ok(filters)
}

pub struct ExtractedFeatures {
    /// One-hot chroma features, `(b, frames, num_chroma)`.
    pub input_features: Tensor,
    /// Audio padding mask subsampled by the hop length, `(b, ceil(t / hop))`.
    pub attention_mask: Tensor,
}

pub struct MusicgenMelodyFeatureExtractor {
    config: Config,
    chroma_filters: Vec<Vec<f32>>,
    window: Vec<f32>,
    window_energy: f32,
    n_freqs: usize,
    device: candle::Device,
    span: tracing::Span,
}

impl MusicgenMelodyFeatureExtractor {
    pub fn new(config: Config, device: &candle::Device) -> Result<Self> {
        let chroma_filters =
            chroma_filter_bank(config.n_fft, config.num_chroma, config.sampling_rate, 0.0)?;
        let n_fft = config.n_fft;
        let window: Vec<f32> = (0..n_fft)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * i as f64 / n_fft as f64;
                (0.5 * (1.0 - phase.cos())) as f32
            })
            .collect();
        let window_energy = window.iter().map(|v| v * v).sum::<f32>();
        Ok(Self {
            config,
            chroma_filters,
            window,
            window_energy,
            n_freqs: 1 + n_fft / 2,
            device: device.clone(),
            span: tracing::span!(tracing::Level::TRACE, "chroma"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Centered power spectrogram normalized by the window energy, returned
    /// as `frames` rows of `n_freqs` values.
    fn spectrogram(&self, waveform: &[f32]) -> Result<Vec<Vec<f32>>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        // Short inputs get a constant pad up to the fft size first.
        let waveform = if waveform.len() < n_fft {
            let pad = n_fft - waveform.len();
            let left = pad / 2;
            let mut padded = vec![0f32; left];
            padded.extend_from_slice(waveform);
            padded.resize(n_fft, 0f32);
            padded
        } else {
            waveform.to_vec()
        };
        // Reflect padding of half a window on both sides.
        let half = n_fft / 2;
        let len = waveform.len();
        let mut padded = Vec::with_capacity(len + n_fft);
        for i in (1..=half).rev() {
            padded.push(waveform[i.min(len - 1)])
        }
        padded.extend_from_slice(&waveform);
        for i in 1..=half {
            padded.push(waveform[len - 1 - i.min(len - 1)])
        }
        let num_frames = 1 + len / hop;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);
        let mut frames = Vec::with_capacity(num_frames);
        let mut buffer = vec![Complex::new(0f32, 0f32); n_fft];
        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            for (i, v) in buffer.iter_mut().enumerate() {
                *v = Complex::new(padded[start + i] * self.window[i], 0f32);
            }
            fft.process(&mut buffer);
            let spec: Vec<f32> = buffer[..self.n_freqs]
                .iter()
                .map(|v| v.norm_sqr() / self.window_energy)
                .collect();
            frames.push(spec)
        }
        Ok(frames)
    }

    /// One-hot chroma rows for a single waveform, `frames * num_chroma`.
    fn chroma_features(&self, waveform: &[f32]) -> Result<Vec<Vec<f32>>> {
        let _enter = self.span.enter();
        let num_chroma = self.config.num_chroma;
        let spec_frames = self.spectrogram(waveform)?;
        let mut features = Vec::with_capacity(spec_frames.len());
        for spec in spec_frames.iter() {
            let mut raw = vec![0f32; num_chroma];
            for (c, v) in raw.iter_mut().enumerate() {
                let filter = &self.chroma_filters[c];
                *v = filter.iter().zip(spec.iter()).map(|(f, s)| f * s).sum();
            }
            // Infinity-norm normalization over the chroma axis, then the
            // strongest bin becomes a one-hot.
            let norm = raw.iter().fold(0f32, |acc, v| acc.max(v.abs())).max(1e-6);
            let normalized: Vec<f32> = raw.iter().map(|v| v / norm).collect();
            let mut best = 0;
            for (c, v) in normalized.iter().enumerate() {
                if *v > normalized[best] {
                    best = c
                }
            }
            let mut one_hot = vec![0f32; num_chroma];
            one_hot[best] = 1.0;
            features.push(one_hot)
        }
        Ok(features)
    }

    fn resample(&self, pcm: &[f32], from_rate: usize) -> Result<Vec<f32>> {
        let to_rate = self.config.sampling_rate;
        if from_rate == to_rate {
            return Ok(pcm.to_vec());
        }
        let ratio = to_rate as f64 / from_rate as f64;
        let mut resampler = rubato::FastFixedIn::new(
            ratio,
            f64::max(ratio, 1.0),
            rubato::PolynomialDegree::Septic,
            1024,
            1,
        )
        .map_err(candle::Error::wrap)?;
        let mut out = Vec::with_capacity((pcm.len() as f64 * ratio) as usize + 1024);
        let mut chunk_buf = vec![0f32; 1024];
        for chunk in pcm.chunks(1024) {
            chunk_buf[..chunk.len()].copy_from_slice(chunk);
            chunk_buf[chunk.len()..].fill(0f32);
            let resampled = resampler
                .process(&[&chunk_buf], None)
                .map_err(candle::Error::wrap)?;
            out.extend_from_slice(&resampled[0])
        }
        out.truncate((pcm.len() as f64 * ratio).round() as usize);
        Ok(out)
    }

    /// Featurizes a batch of mono waveforms. Rows longer than
    /// `chunk_length * sampling_rate` are truncated, shorter ones are padded
    /// to the longest row with the padding value.
    pub fn extract<S: AsRef<[f32]>>(
        &self,
        audio: &[S],
        sampling_rate: Option<usize>,
    ) -> Result<ExtractedFeatures> {
        if audio.is_empty() {
            candle::bail!("empty audio batch")
        }
        if sampling_rate.is_none() {
            tracing::warn!(
                "no sampling rate was provided, assuming {} Hz",
                self.config.sampling_rate
            );
        }
        let from_rate = sampling_rate.unwrap_or(self.config.sampling_rate);
        let audio: Vec<Vec<f32>> = audio
            .iter()
            .map(|row| self.resample(row.as_ref(), from_rate))
            .collect::<Result<_>>()?;
        let longest = audio.iter().map(|row| row.len()).max().unwrap_or(0);
        let target_len = usize::min(longest, self.config.n_samples());
        let hop = self.config.hop_length;
        let mask_len = target_len.div_ceil(hop);
        let mut features = Vec::new();
        let mut mask = Vec::with_capacity(audio.len() * mask_len);
        let mut num_frames = 0;
        for row in audio.iter() {
            let mut padded = row.clone();
            padded.resize(target_len, self.config.padding_value);
            for idx in 0..mask_len {
                mask.push(u32::from(idx * hop < row.len()))
            }
            let rows = self.chroma_features(&padded)?;
            num_frames = rows.len();
            for frame in rows {
                features.extend_from_slice(&frame)
            }
        }
        let input_features = Tensor::from_vec(
            features,
            (audio.len(), num_frames, self.config.num_chroma),
            &self.device,
        )?;
        let attention_mask =
            Tensor::from_vec(mask, (audio.len(), mask_len), &self.device)?;
        Ok(ExtractedFeatures { input_features, attention_mask })
    }

    /// Featurizes a demucs output of shape `(b, stems, channels, t)`: the
    /// configured stems are summed, channels averaged down to mono and the
    /// result resampled from the demucs rate.
    pub fn extract_stems(
        &self,
        audio: &Tensor,
        sampling_rate: Option<usize>,
    ) -> Result<ExtractedFeatures> {
        let (_b, num_stems, _c, _t) = audio.dims4()?;
        let from_rate = sampling_rate.unwrap_or(DEMUCS_SAMPLING_RATE);
        let stems: Vec<Tensor> = self
            .config
            .stem_indices
            .iter()
            .map(|&idx| {
                if idx >= num_stems {
                    candle::bail!("stem index {idx} out of range, input has {num_stems} stems")
                }
                audio.narrow(1, idx, 1)
            })
            .collect::<Result<_>>()?;
        let wav = Tensor::cat(&stems, 1)?.sum(1)?.mean(1)?;
        let rows = wav.to_dtype(candle::DType::F32)?.to_vec2::<f32>()?;
        self.extract(&rows, Some(from_rate))
    }

    /// Dispatches on tensor rank: 1-D and 2-D are mono waveforms, 3-D is a
    /// batch of stereo signals averaged to mono, 4-D is a demucs output.
    pub fn extract_tensor(
        &self,
        audio: &Tensor,
        sampling_rate: Option<usize>,
    ) -> Result<ExtractedFeatures> {
        let audio = audio.to_dtype(candle::DType::F32)?;
        match audio.rank() {
            1 => self.extract(&[audio.to_vec1::<f32>()?], sampling_rate),
            2 => self.extract(&audio.to_vec2::<f32>()?, sampling_rate),
            3 => {
                tracing::warn!("stereo input detected, averaging channels to mono");
                self.extract(&audio.mean(1)?.to_vec2::<f32>()?, sampling_rate)
            }
            4 => {
                tracing::warn!("4-d input detected, treating it as a demucs output");
                self.extract_stems(&audio, sampling_rate)
            }
            rank => candle::bail!("unsupported audio tensor of rank {rank}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn tiny_config() -> Config {
        Config {
            sampling_rate: 8000,
            hop_length: 256,
            chunk_length: 1,
            n_fft: 1024,
            ..Config::default()
        }
    }

    #[test]
    fn filter_bank_shape_and_range() -> Result<()> {
        let filters = chroma_filter_bank(1024, 12, 8000, 0.0)?;
        assert_eq!(filters.len(), 12);
        assert_eq!(filters[0].len(), 513);
        for row in filters.iter() {
            assert!(row.iter().all(|v| v.is_finite() && *v >= 0.));
        }
        // The dc column sits far below the octave weighting window.
        assert!(filters.iter().all(|row| row[0] < 1e-3));
        Ok(())
    }

    #[test]
    fn concert_pitch_maps_to_chroma_a() -> Result<()> {
        let sampling_rate = 32000;
        let n_fft = 2048;
        let filters = chroma_filter_bank(n_fft, 12, sampling_rate, 0.0)?;
        // Frequency bin closest to 440 Hz.
        let bin = (440.0 * n_fft as f64 / sampling_rate as f64).round() as usize;
        let best = (0..12).max_by(|&a, &b| filters[a][bin].total_cmp(&filters[b][bin]));
        // Row 0 is C, so A lands on row 9.
        assert_eq!(best, Some(9));
        Ok(())
    }

    #[test]
    fn features_are_one_hot() -> Result<()> {
        let cfg = tiny_config();
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg.clone(), &Device::Cpu)?;
        let wave: Vec<f32> = (0..cfg.n_samples())
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 8000.0).sin())
            .collect();
        let out = extractor.extract(&[wave], Some(8000))?;
        let (b, frames, chroma) = out.input_features.dims3()?;
        assert_eq!((b, chroma), (1, 12));
        assert_eq!(frames, 1 + cfg.n_samples() / cfg.hop_length);
        let rows = out.input_features.to_vec3::<f32>()?;
        for frame in rows[0].iter() {
            assert_eq!(frame.iter().sum::<f32>(), 1.0);
            assert_eq!(frame.iter().cloned().fold(0f32, f32::max), 1.0);
        }
        Ok(())
    }

    #[test]
    fn short_inputs_are_padded() -> Result<()> {
        let cfg = tiny_config();
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg, &Device::Cpu)?;
        let out = extractor.extract(&[vec![0.5f32; 100]], Some(8000))?;
        let (b, frames, chroma) = out.input_features.dims3()?;
        assert_eq!((b, chroma), (1, 12));
        assert!(frames >= 1);
        Ok(())
    }

    #[test]
    fn long_inputs_are_truncated() -> Result<()> {
        let cfg = tiny_config();
        let n_samples = cfg.n_samples();
        let hop = cfg.hop_length;
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg, &Device::Cpu)?;
        let out = extractor.extract(&[vec![0.1f32; 3 * n_samples]], Some(8000))?;
        let (_b, frames, _c) = out.input_features.dims3()?;
        assert_eq!(frames, 1 + n_samples / hop);
        Ok(())
    }

    #[test]
    fn batch_padding_and_mask() -> Result<()> {
        let cfg = tiny_config();
        let hop = cfg.hop_length;
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg, &Device::Cpu)?;
        let long = vec![0.1f32; 4 * hop];
        let short = vec![0.1f32; hop];
        let out = extractor.extract(&[long, short], Some(8000))?;
        let mask = out.attention_mask.to_vec2::<u32>()?;
        assert_eq!(mask[0], [1, 1, 1, 1]);
        assert_eq!(mask[1], [1, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn stem_extraction_goes_mono() -> Result<()> {
        let cfg = Config { stem_indices: vec![1, 0], ..tiny_config() };
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg, &Device::Cpu)?;
        let audio = Tensor::randn(0f32, 1f32, (2, 2, 2, 2000), &Device::Cpu)?;
        let out = extractor.extract_stems(&audio, Some(8000))?;
        assert_eq!(out.input_features.dim(0)?, 2);
        let bad = Tensor::randn(0f32, 1f32, (1, 2, 2, 100), &Device::Cpu)?;
        let cfg = Config { stem_indices: vec![3, 2], ..tiny_config() };
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg, &Device::Cpu)?;
        assert!(extractor.extract_stems(&bad, Some(8000)).is_err());
        Ok(())
    }

    #[test]
    fn resampling_halves_the_length() -> Result<()> {
        let cfg = tiny_config();
        let extractor = MusicgenMelodyFeatureExtractor::new(cfg, &Device::Cpu)?;
        let out = extractor.resample(&vec![0.1f32; 16000], 16000)?;
        assert_eq!(out.len(), 8000);
        Ok(())
    }
}
