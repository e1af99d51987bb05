// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use crate::attention::SelfAttention;
use crate::nn::groupnorm_groups;
use crate::{decoder, encoder};
use candle::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{conv1d, embedding, group_norm, Conv1d, Embedding, GroupNorm, VarBuilder};

/// Prepends a bos token and/or inserts an eos token into each row. The eos
/// goes right before the first pad token, or at the end of the row when
/// nothing is padded. The attention mask grows by one leading `1` for each
/// added token.
pub fn pad_bos_eos(
    input_ids: &Tensor,
    attention_mask: Option<&Tensor>,
    pad_token_id: u32,
    bos_token_id: u32,
    eos_token_id: u32,
    add_bos: bool,
    add_eos: bool,
) -> Result<(Tensor, Option<Tensor>)> {
    let device = input_ids.device();
    let mut rows = input_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    if rows.is_empty() {
        candle::bail!("empty batch in pad_bos_eos")
    }
    let mut mask_rows = match attention_mask {
        None => None,
        Some(mask) => Some(mask.to_dtype(DType::U32)?.to_vec2::<u32>()?),
    };
    if add_bos {
        for row in rows.iter_mut() {
            row.insert(0, bos_token_id)
        }
        if let Some(mask) = mask_rows.as_mut() {
            for row in mask.iter_mut() {
                row.insert(0, 1)
            }
        }
    }
    if add_eos {
        for row in rows.iter_mut() {
            match row.iter().position(|&t| t == pad_token_id) {
                Some(pos) => row.insert(pos, eos_token_id),
                None => row.push(eos_token_id),
            }
        }
        if let Some(mask) = mask_rows.as_mut() {
            for row in mask.iter_mut() {
                row.insert(0, 1)
            }
        }
    }
    let b_size = rows.len();
    let seq_len = rows[0].len();
    let flat: Vec<u32> = rows.into_iter().flatten().collect();
    let input_ids = Tensor::from_vec(flat, (b_size, seq_len), device)?;
    let attention_mask = match mask_rows {
        None => None,
        Some(mask) => {
            let flat: Vec<u32> = mask.into_iter().flatten().collect();
            Some(Tensor::from_vec(flat, (b_size, seq_len), device)?)
        }
    };
    Ok((input_ids, attention_mask))
}

/// Fuses log-mel spectrograms with text embeddings into the decoder prompt.
/// The mel branch keeps only its first time step, the text branch carries
/// token plus position embeddings. Output is `(b, 1 + text_len, hidden)`.
pub struct ConditioningEncoder {
    text_token_embedding: Embedding,
    text_position_embedding: Embedding,
    mel_conv: Conv1d,
    group_norms: Vec<GroupNorm>,
    mel_attn_blocks: Vec<SelfAttention>,
    text_bos_token_id: u32,
    text_eos_token_id: u32,
    span: tracing::Span,
}

impl ConditioningEncoder {
    pub fn new(
        text_cfg: &encoder::Config,
        decoder_cfg: &decoder::Config,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_size = decoder_cfg.hidden_size;
        let text_token_embedding = embedding(
            text_cfg.vocab_size,
            hidden_size,
            vb.pp("text_token_embedding"),
        )?;
        let text_position_embedding = embedding(
            decoder_cfg.max_text_tokens,
            hidden_size,
            vb.pp("text_position_embedding"),
        )?;
        let mel_conv = conv1d(
            decoder_cfg.feature_size,
            hidden_size,
            1,
            Default::default(),
            vb.pp("mel_conv"),
        )?;
        let num_groups = groupnorm_groups(hidden_size)?;
        let mut group_norms = Vec::with_capacity(decoder_cfg.num_mel_attn_blocks);
        let mut mel_attn_blocks = Vec::with_capacity(decoder_cfg.num_mel_attn_blocks);
        for idx in 0..decoder_cfg.num_mel_attn_blocks {
            group_norms.push(group_norm(
                num_groups,
                hidden_size,
                1e-5,
                vb.pp("group_norms").pp(idx),
            )?);
            mel_attn_blocks.push(SelfAttention::new(
                hidden_size,
                decoder_cfg.num_attention_heads,
                decoder_cfg.use_attention_bias,
                vb.pp("mel_attn_blocks").pp(idx),
            )?);
        }
        Ok(Self {
            text_token_embedding,
            text_position_embedding,
            mel_conv,
            group_norms,
            mel_attn_blocks,
            text_bos_token_id: text_cfg.bos_token_id,
            text_eos_token_id: text_cfg.eos_token_id,
            span: tracing::span!(tracing::Level::TRACE, "conditioning"),
        })
    }

    /// `input_features` is a log-mel spectrogram `(b, feature_size, frames)`,
    /// `input_ids` the tokenized text. A single text broadcasts over N
    /// audios and vice versa, mismatched batch sizes are an error.
    pub fn forward(
        &mut self,
        input_features: &Tensor,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_size, seq_len) = input_ids.dims2()?;
        let mask = match attention_mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones((b_size, seq_len), DType::U32, input_ids.device())?,
        };
        let (input_ids, mask) = pad_bos_eos(
            input_ids,
            Some(&mask),
            0,
            self.text_bos_token_id,
            self.text_eos_token_id,
            true,
            true,
        )?;
        let mask = match mask {
            Some(mask) => mask,
            None => candle::bail!("attention mask lost during bos/eos padding"),
        };
        let inputs_embeds = input_ids.apply(&self.text_token_embedding)?;
        // Position ids only advance on unmasked tokens.
        let position_ids = (mask.to_dtype(DType::F32)?.cumsum(D::Minus1)? - 1.0)?
            .relu()?
            .to_dtype(DType::U32)?;
        let position_embeds = position_ids.apply(&self.text_position_embedding)?;
        let text_embeds = (inputs_embeds + position_embeds)?;

        let mut mel_spec = input_features.apply(&self.mel_conv)?;
        for (norm, attn) in self.group_norms.iter().zip(self.mel_attn_blocks.iter_mut()) {
            let residual = mel_spec.transpose(1, 2)?;
            let xs = norm.forward(&mel_spec)?.transpose(1, 2)?.contiguous()?;
            let xs = attn.forward(&xs, None, None, 0)?;
            mel_spec = (xs + residual)?.transpose(1, 2)?.contiguous()?;
        }
        // Only the first frame conditions the decoder.
        let mel_spec = mel_spec.i((.., .., 0))?.unsqueeze(1)?;

        let text_b = text_embeds.dim(0)?;
        let mel_b = mel_spec.dim(0)?;
        let (text_embeds, mel_spec) = if text_b == mel_b {
            (text_embeds, mel_spec)
        } else if text_b == 1 {
            let (_, t, h) = text_embeds.dims3()?;
            (text_embeds.broadcast_as((mel_b, t, h))?.contiguous()?, mel_spec)
        } else if mel_b == 1 {
            let (_, t, h) = mel_spec.dims3()?;
            (text_embeds.clone(), mel_spec.broadcast_as((text_b, t, h))?.contiguous()?)
        } else {
            candle::bail!(
                "expected either 1 text vs N audios or matched batch sizes, got {text_b} texts and {mel_b} audios"
            )
        };
        Tensor::cat(&[&mel_spec, &text_embeds], 1)
    }
}
