// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use crate::conditioner::{pad_bos_eos, ConditioningEncoder};
use crate::decoder::SpeechDecoder;
use crate::encoder::Encoder;
use crate::generation::GenerationConfig;
use crate::{decoder, encoder};
use candle::{DType, IndexOp, Result, Tensor, D};
use candle_nn::VarBuilder;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    pub text_config: encoder::Config,
    pub speech_config: encoder::Config,
    pub decoder_config: decoder::Config,
    pub logit_scale_init_value: f64,
}

impl Config {
    /// The `susnato/clvp_dev` checkpoint (Tortoise TTS).
    pub fn tortoise() -> Self {
        Self {
            text_config: encoder::Config::text(),
            speech_config: encoder::Config::speech(),
            decoder_config: decoder::Config::tortoise(),
            logit_scale_init_value: 2.6592,
        }
    }
}

pub struct ClvpOutput {
    /// Generated (and fixed) speech token ids, only set by `generate`.
    pub speech_ids: Option<Tensor>,
    /// Scaled cosine similarity, speech rows vs text columns, `(b, b)`.
    pub logits_per_speech: Tensor,
    /// Transpose of `logits_per_speech`.
    pub logits_per_text: Tensor,
    pub text_embeds: Tensor,
    pub speech_embeds: Tensor,
    pub loss: Option<Tensor>,
}

fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    xs.broadcast_div(&xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)
}

fn contrastive_loss(logits: &Tensor) -> Result<Tensor> {
    let n = logits.dim(0)? as u32;
    let labels = Tensor::arange(0u32, n, logits.device())?;
    candle_nn::loss::cross_entropy(logits, &labels)
}

/// Mean of the caption and speech contrastive losses over the similarity
/// matrix.
pub fn clvp_loss(similarity: &Tensor) -> Result<Tensor> {
    let caption_loss = contrastive_loss(similarity)?;
    let speech_loss = contrastive_loss(&similarity.t()?.contiguous()?)?;
    (caption_loss + speech_loss)? / 2.
}

/// The full CLVP stack: a conditioning encoder feeding an autoregressive
/// speech decoder, plus text and speech encoders projecting into a shared
/// embedding space scored by a learned logit scale.
pub struct Clvp {
    conditioning_encoder: ConditioningEncoder,
    speech_decoder_model: SpeechDecoder,
    text_encoder_model: Encoder,
    speech_encoder_model: Encoder,
    logit_scale: Tensor,
    config: Config,
}

impl Clvp {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let conditioning_encoder = ConditioningEncoder::new(
            &cfg.text_config,
            &cfg.decoder_config,
            vb.pp("conditioning_encoder"),
        )?;
        let speech_decoder_model =
            SpeechDecoder::new(&cfg.decoder_config, vb.pp("speech_decoder_model"))?;
        let text_encoder_model = Encoder::new(&cfg.text_config, vb.pp("text_encoder_model"))?;
        let speech_encoder_model =
            Encoder::new(&cfg.speech_config, vb.pp("speech_encoder_model"))?;
        let logit_scale = vb.get((), "logit_scale")?;
        Ok(Self {
            conditioning_encoder,
            speech_decoder_model,
            text_encoder_model,
            speech_encoder_model,
            logit_scale,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Projected text embedding, `(b, projection_dim)`.
    pub fn text_embeds(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        Ok(self.text_encoder_model.forward(input_ids, attention_mask)?.embeds)
    }

    /// Projected speech embedding from speech token ids.
    pub fn speech_embeds(
        &mut self,
        speech_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        Ok(self.speech_encoder_model.forward(speech_ids, attention_mask)?.embeds)
    }

    /// Generates speech ids for the given text and audio prompt, then embeds
    /// them with the speech encoder.
    pub fn generate_speech_embeds(
        &mut self,
        input_ids: &Tensor,
        input_features: &Tensor,
        attention_mask: Option<&Tensor>,
        generation_config: &GenerationConfig,
    ) -> Result<Tensor> {
        let output = self.generate(input_ids, input_features, attention_mask, generation_config)?;
        Ok(output.speech_embeds)
    }

    /// Replaces the decoder stop tokens with the codes the vocoder expects:
    /// the leading bos is dropped, every eos and everything after the first
    /// eos becomes `decoder_fixing_codes[0]`, and sequences that stopped get
    /// their last three tokens overwritten with `decoder_fixing_codes[1..]`.
    pub fn fix_speech_decoder_output(&self, speech_ids: &Tensor) -> Result<Tensor> {
        let fixing_codes = &self.config.decoder_config.decoder_fixing_codes;
        if fixing_codes.len() != 4 {
            candle::bail!("expected 4 decoder fixing codes, got {}", fixing_codes.len())
        }
        let eos = self.config.decoder_config.eos_token_id;
        let device = speech_ids.device();
        let rows = speech_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let mut fixed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row: Vec<u32> = row.into_iter().skip(1).collect();
            if let Some(stop) = row.iter().position(|&t| t == eos) {
                for t in row.iter_mut().skip(stop) {
                    *t = fixing_codes[0]
                }
                let len = row.len();
                if len >= 3 {
                    row[len - 3..].copy_from_slice(&fixing_codes[1..4]);
                }
            }
            fixed.push(row)
        }
        let b_size = fixed.len();
        let seq_len = fixed.first().map_or(0, |r| r.len());
        let flat: Vec<u32> = fixed.into_iter().flatten().collect();
        Tensor::from_vec(flat, (b_size, seq_len), device)
    }

    /// Full forward pass: condition the decoder on text and audio, take the
    /// greedy speech ids, embed both modalities and score the similarity.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        input_features: &Tensor,
        attention_mask: Option<&Tensor>,
        return_loss: bool,
    ) -> Result<ClvpOutput> {
        let conditioning =
            self.conditioning_encoder.forward(input_features, input_ids, attention_mask)?;
        self.speech_decoder_model.decoder.reset_kv_cache();
        let logits = self.speech_decoder_model.forward_embeds(&conditioning, None)?;
        let speech_ids = logits.argmax(D::Minus1)?;
        let speech_ids = self.fix_speech_decoder_output(&speech_ids)?;
        self.similarity_output(input_ids, attention_mask, &speech_ids, false, return_loss)
    }

    /// Autoregressive speech-token generation followed by the similarity
    /// scoring of `forward`. Prompts longer than `max_text_tokens - 3` are
    /// rejected, the reserved slots hold bos, eos and one pad.
    pub fn generate(
        &mut self,
        input_ids: &Tensor,
        input_features: &Tensor,
        attention_mask: Option<&Tensor>,
        generation_config: &GenerationConfig,
    ) -> Result<ClvpOutput> {
        let seq_len = input_ids.dim(1)?;
        let max_text_tokens = self.config.decoder_config.max_text_tokens;
        if seq_len + 3 > max_text_tokens {
            candle::bail!(
                "text prompt of {seq_len} tokens does not fit, at most {} tokens are supported",
                max_text_tokens - 3
            )
        }
        let (b_size, _) = input_ids.dims2()?;
        let mask = match attention_mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones((b_size, seq_len), DType::U32, input_ids.device())?,
        };
        let (padded_ids, padded_mask) = pad_bos_eos(
            input_ids,
            Some(&mask),
            0,
            self.config.text_config.bos_token_id,
            self.config.text_config.eos_token_id,
            false,
            true,
        )?;
        let conditioning = self.conditioning_encoder.forward(
            input_features,
            &padded_ids,
            padded_mask.as_ref(),
        )?;
        let speech_ids = self.generate_speech_ids(&conditioning, generation_config)?;
        let speech_ids = match generation_config.pad_to_max_mel_tokens {
            None => speech_ids,
            Some(pad_to) => {
                let cur = speech_ids.dim(1)?;
                if pad_to <= cur {
                    speech_ids.narrow(1, 0, pad_to)?
                } else {
                    let eos = self.config.decoder_config.eos_token_id;
                    let pad = Tensor::full(eos, (b_size, pad_to - cur), speech_ids.device())?;
                    Tensor::cat(&[&speech_ids, &pad], 1)?
                }
            }
        };
        let fixed_ids = self.fix_speech_decoder_output(&speech_ids)?;
        // The text embedding is computed over the eos-padded prompt.
        self.similarity_output(&padded_ids, padded_mask.as_ref(), &fixed_ids, true, false)
    }

    /// Samples tokens from the decoder primed with the conditioning prompt.
    /// The bos slot carries its position-0 embedding, the n-th sampled token
    /// sits at absolute position n + 1.
    fn generate_speech_ids(
        &mut self,
        conditioning: &Tensor,
        generation_config: &GenerationConfig,
    ) -> Result<Tensor> {
        let span = tracing::span!(tracing::Level::TRACE, "generate");
        let _enter = span.enter();
        let (b_size, _prompt_len, _h) = conditioning.dims3()?;
        let device = conditioning.device();
        let bos = self.config.decoder_config.bos_token_id;
        let eos = self.config.decoder_config.eos_token_id;
        self.speech_decoder_model.decoder.reset_kv_cache();
        let bos_ids = Tensor::full(bos, (b_size, 1), device)?;
        let position_zero = Tensor::zeros(1, DType::U32, device)?;
        let bos_embeds = self
            .speech_decoder_model
            .decoder
            .embed_tokens(&bos_ids)?
            .broadcast_add(&self.speech_decoder_model.decoder.embed_positions(&position_zero)?)?;
        let prompt = Tensor::cat(&[conditioning, &bos_embeds], 1)?;
        let mut logits = self.speech_decoder_model.forward_prompt(&prompt)?;
        let mut processor = generation_config.logits_processor();
        let mut tokens: Vec<Vec<u32>> = vec![vec![bos]; b_size];
        let mut finished = vec![false; b_size];
        loop {
            let last = logits.i((.., logits.dim(1)? - 1, ..))?;
            let mut next = Vec::with_capacity(b_size);
            for (b_idx, done) in finished.iter_mut().enumerate() {
                let token = if *done {
                    eos
                } else {
                    let token = processor.sample(&last.i(b_idx)?)?;
                    if token == eos {
                        *done = true
                    }
                    token
                };
                tokens[b_idx].push(token);
                next.push(token);
            }
            let num_generated = tokens[0].len() - 1;
            if finished.iter().all(|&f| f) || num_generated >= generation_config.max_new_tokens {
                break;
            }
            let next = Tensor::from_vec(next, (b_size, 1), device)?;
            // Position index counts bos plus the tokens sampled so far.
            logits = self.speech_decoder_model.forward_step(&next, tokens[0].len())?;
        }
        let seq_len = tokens[0].len();
        let flat: Vec<u32> = tokens.into_iter().flatten().collect();
        Tensor::from_vec(flat, (b_size, seq_len), device)
    }

    fn similarity_output(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        fixed_speech_ids: &Tensor,
        keep_speech_ids: bool,
        return_loss: bool,
    ) -> Result<ClvpOutput> {
        let speech_embeds = self.speech_encoder_model.forward(fixed_speech_ids, None)?.embeds;
        let text_embeds = self.text_encoder_model.forward(input_ids, attention_mask)?.embeds;
        let speech_embeds = l2_normalize(&speech_embeds)?;
        let text_embeds = l2_normalize(&text_embeds)?;
        let logit_scale = self.logit_scale.to_dtype(DType::F32)?.to_scalar::<f32>()?.exp();
        let logits_per_text =
            (text_embeds.matmul(&speech_embeds.t()?)? * f64::from(logit_scale))?;
        let logits_per_speech = logits_per_text.t()?.contiguous()?;
        let loss = if return_loss { Some(clvp_loss(&logits_per_text)?) } else { None };
        Ok(ClvpOutput {
            speech_ids: keep_speech_ids.then(|| fixed_speech_ids.clone()),
            logits_per_speech,
            logits_per_text,
            text_embeds,
            speech_embeds,
            loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Config {
        let text_config = encoder::Config {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 24,
            projection_dim: 8,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            use_rotary_embedding: false,
            max_seq_len: 64,
            bos_token_id: 30,
            eos_token_id: 0,
            ..encoder::Config::text()
        };
        let speech_config = encoder::Config {
            vocab_size: 16,
            bos_token_id: 12,
            eos_token_id: 13,
            ..text_config.clone()
        };
        let decoder_config = decoder::Config {
            vocab_size: 16,
            max_position_embeddings: 64,
            max_text_tokens: 8,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            feature_size: 8,
            num_mel_attn_blocks: 1,
            bos_token_id: 12,
            eos_token_id: 13,
            decoder_fixing_codes: vec![3, 4, 4, 5],
            ..decoder::Config::tortoise()
        };
        Config {
            text_config,
            speech_config,
            decoder_config,
            logit_scale_init_value: 2.6592,
        }
    }

    fn tiny_model() -> Result<Clvp> {
        let vb = VarBuilder::zeros(DType::F32, &candle::Device::Cpu);
        Clvp::new(&tiny_config(), vb)
    }

    #[test]
    fn output_fixing_rewrites_stopped_sequences() -> Result<()> {
        let dev = candle::Device::Cpu;
        let model = tiny_model()?;
        // Row 0 stops (eos = 13), row 1 never does.
        let ids = Tensor::new(&[[12u32, 7, 8, 13, 9, 10], [12, 7, 8, 9, 10, 11]], &dev)?;
        let fixed = model.fix_speech_decoder_output(&ids)?.to_vec2::<u32>()?;
        assert_eq!(fixed[0], [7, 8, 4, 4, 5]);
        assert_eq!(fixed[1], [7, 8, 9, 10, 11]);
        Ok(())
    }

    #[test]
    fn output_fixing_with_early_stop() -> Result<()> {
        let dev = candle::Device::Cpu;
        let model = tiny_model()?;
        let ids = Tensor::new(&[[12u32, 13, 7, 8, 9]], &dev)?;
        let fixed = model.fix_speech_decoder_output(&ids)?.to_vec2::<u32>()?;
        // Everything after the stop collapses to code 0, tail overwritten.
        assert_eq!(fixed[0], [3, 4, 4, 5]);
        Ok(())
    }

    #[test]
    fn l2_normalized_rows_have_unit_norm() -> Result<()> {
        let dev = candle::Device::Cpu;
        let xs = Tensor::new(&[[3f32, 4.], [0., 2.]], &dev)?;
        let ys = l2_normalize(&xs)?.to_vec2::<f32>()?;
        assert!((ys[0][0] - 0.6).abs() < 1e-6);
        assert!((ys[0][1] - 0.8).abs() < 1e-6);
        assert!((ys[1][1] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn uniform_similarity_loss_is_log_batch() -> Result<()> {
        let dev = candle::Device::Cpu;
        let similarity = Tensor::zeros((4, 4), DType::F32, &dev)?;
        let loss = clvp_loss(&similarity)?.to_vec0::<f32>()?;
        assert!((loss - (4f32).ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn forward_produces_square_similarity() -> Result<()> {
        let dev = candle::Device::Cpu;
        let mut model = tiny_model()?;
        let input_ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &dev)?;
        let features = Tensor::randn(0f32, 1f32, (2, 8, 5), &dev)?;
        let out = model.forward(&input_ids, &features, None, false)?;
        assert_eq!(out.logits_per_text.dims(), [2, 2]);
        assert_eq!(out.logits_per_speech.dims(), [2, 2]);
        assert_eq!(out.text_embeds.dims(), [2, 8]);
        assert_eq!(out.speech_embeds.dims(), [2, 8]);
        assert!(out.speech_ids.is_none());
        Ok(())
    }

    #[test]
    fn generate_stops_at_the_token_budget() -> Result<()> {
        let dev = candle::Device::Cpu;
        let mut model = tiny_model()?;
        let cfg = GenerationConfig { max_new_tokens: 4, ..GenerationConfig::greedy() };
        let input_ids = Tensor::new(&[[1u32, 2, 3]], &dev)?;
        let features = Tensor::randn(0f32, 1f32, (1, 8, 5), &dev)?;
        let out = model.generate(&input_ids, &features, None, &cfg)?;
        let speech_ids = match out.speech_ids {
            Some(ids) => ids,
            None => candle::bail!("generate should return speech ids"),
        };
        // bos dropped by the fixing pass, so 4 sampled tokens remain.
        assert_eq!(speech_ids.dims(), [1, 4]);
        assert_eq!(out.logits_per_text.dims(), [1, 1]);
        Ok(())
    }

    #[test]
    fn generate_pads_or_truncates_to_the_mel_length() -> Result<()> {
        let dev = candle::Device::Cpu;
        let mut model = tiny_model()?;
        let input_ids = Tensor::new(&[[1u32, 2, 3]], &dev)?;
        let features = Tensor::randn(0f32, 1f32, (1, 8, 5), &dev)?;
        let cfg = GenerationConfig {
            max_new_tokens: 4,
            pad_to_max_mel_tokens: Some(7),
            ..GenerationConfig::greedy()
        };
        let out = model.generate(&input_ids, &features, None, &cfg)?;
        let speech_ids = match out.speech_ids {
            Some(ids) => ids,
            None => candle::bail!("generate should return speech ids"),
        };
        // 5 raw tokens padded with eos up to 7, minus the bos after fixing.
        assert_eq!(speech_ids.dims(), [1, 6]);
        let row = speech_ids.to_vec2::<u32>()?;
        // The eos pad is rewritten by the fixing pass.
        assert_eq!(row[0][3..], [4, 4, 5]);
        let cfg = GenerationConfig { pad_to_max_mel_tokens: Some(2), ..cfg };
        let out = model.generate(&input_ids, &features, None, &cfg)?;
        let speech_ids = match out.speech_ids {
            Some(ids) => ids,
            None => candle::bail!("generate should return speech ids"),
        };
        // 5 raw tokens truncated to 2, minus the bos.
        assert_eq!(speech_ids.dims(), [1, 1]);
        Ok(())
    }

    #[test]
    fn generate_rejects_long_prompts() -> Result<()> {
        let dev = candle::Device::Cpu;
        let mut model = tiny_model()?;
        // max_text_tokens is 8, so 6 tokens are one too many.
        let input_ids = Tensor::new(&[[1u32, 2, 3, 4, 5, 6]], &dev)?;
        let features = Tensor::randn(0f32, 1f32, (1, 8, 5), &dev)?;
        let cfg = GenerationConfig::greedy();
        assert!(model.generate(&input_ids, &features, None, &cfg).is_err());
        Ok(())
    }
}
