// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use candle_transformers::generation::{LogitsProcessor, Sampling};

/// Sampling controls for the autoregressive speech decoder.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
    /// When set, generated sequences are right-padded with eos or truncated
    /// to this length before the decoder output fixing pass.
    pub pad_to_max_mel_tokens: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 450,
            do_sample: true,
            temperature: 0.8,
            top_k: None,
            top_p: Some(0.8),
            seed: 299792458,
            pad_to_max_mel_tokens: None,
        }
    }
}

impl GenerationConfig {
    pub fn greedy() -> Self {
        Self { do_sample: false, ..Self::default() }
    }

    pub fn logits_processor(&self) -> LogitsProcessor {
        let sampling = if !self.do_sample || self.temperature <= 0. {
            Sampling::ArgMax
        } else {
            let temperature = self.temperature;
            match (self.top_k, self.top_p) {
                (None, None) => Sampling::All { temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            }
        };
        LogitsProcessor::from_sampling(self.seed, sampling)
    }
}
