// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use crate::attention::SelfAttention;
use crate::nn::{causal_mask, expand_attention_mask, Conv1D};
use candle::{IndexOp, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, VarBuilder};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub max_text_tokens: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub n_inner: Option<usize>,
    pub layer_norm_epsilon: f64,
    pub activation_function: candle_nn::Activation,
    pub use_attention_bias: bool,
    pub feature_size: usize,
    pub num_mel_attn_blocks: usize,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub decoder_fixing_codes: Vec<u32>,
}

impl Config {
    /// Speech decoder of the `susnato/clvp_dev` checkpoint (the Tortoise
    /// autoregressive model).
    pub fn tortoise() -> Self {
        Self {
            vocab_size: 8194,
            max_position_embeddings: 608,
            max_text_tokens: 256,
            hidden_size: 1024,
            num_hidden_layers: 30,
            num_attention_heads: 20,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            activation_function: candle_nn::Activation::NewGelu,
            use_attention_bias: true,
            feature_size: 80,
            num_mel_attn_blocks: 6,
            bos_token_id: 8192,
            eos_token_id: 8193,
            decoder_fixing_codes: vec![83, 45, 45, 248],
        }
    }

    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.hidden_size)
    }
}

#[derive(Debug, Clone)]
struct DecoderMlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
    activation: candle_nn::Activation,
}

impl DecoderMlp {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let inner = cfg.inner_dim();
        let c_fc = Conv1D::new(cfg.hidden_size, inner, vb.pp("c_fc"))?;
        let c_proj = Conv1D::new(inner, cfg.hidden_size, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj, activation: cfg.activation_function })
    }
}

impl Module for DecoderMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.c_fc)?.apply(&self.activation)?.apply(&self.c_proj)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    input_layernorm: LayerNorm,
    attn: SelfAttention,
    post_attention_layernorm: LayerNorm,
    mlp: DecoderMlp,
    span: tracing::Span,
}

impl DecoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let ln_cfg = candle_nn::LayerNormConfig { eps: cfg.layer_norm_epsilon, ..Default::default() };
        let input_layernorm = layer_norm(cfg.hidden_size, ln_cfg, vb.pp("input_layernorm"))?;
        // The cache also holds the conditioning prefix, which sits in front
        // of the positioned tokens.
        let attn = SelfAttention::new(
            cfg.hidden_size,
            cfg.num_attention_heads,
            cfg.use_attention_bias,
            vb.pp("attn"),
        )?
        .with_kv_cache(cfg.max_position_embeddings + cfg.max_text_tokens + 2);
        let post_attention_layernorm =
            layer_norm(cfg.hidden_size, ln_cfg, vb.pp("post_attention_layernorm"))?;
        let mlp = DecoderMlp::new(cfg, vb.pp("mlp"))?;
        Ok(Self {
            input_layernorm,
            attn,
            post_attention_layernorm,
            mlp,
            span: tracing::span!(tracing::Level::TRACE, "decoder-layer"),
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = xs;
        let xs = xs.apply(&self.input_layernorm)?;
        let xs = self.attn.forward(&xs, None, mask, 0)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let xs = xs.apply(&self.post_attention_layernorm)?.apply(&self.mlp)?;
        residual + xs
    }
}

/// GPT-2 style decoder over speech tokens with absolute position
/// embeddings and incremental kv-cache decoding.
pub struct Decoder {
    input_embeds_layer: Embedding,
    position_embeds_layer: Embedding,
    layers: Vec<DecoderLayer>,
    layer_norm: LayerNorm,
    span: tracing::Span,
}

impl Decoder {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let input_embeds_layer =
            embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("input_embeds_layer"))?;
        let position_embeds_layer = embedding(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.pp("position_embeds_layer"),
        )?;
        let vb_l = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::new(cfg, vb_l.pp(idx))?)
        }
        let ln_cfg = candle_nn::LayerNormConfig { eps: cfg.layer_norm_epsilon, ..Default::default() };
        let layer_norm = layer_norm(cfg.hidden_size, ln_cfg, vb.pp("layer_norm"))?;
        Ok(Self {
            input_embeds_layer,
            position_embeds_layer,
            layers,
            layer_norm,
            span: tracing::span!(tracing::Level::TRACE, "decoder"),
        })
    }

    pub fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        input_ids.apply(&self.input_embeds_layer)
    }

    pub fn embed_positions(&self, position_ids: &Tensor) -> Result<Tensor> {
        position_ids.apply(&self.position_embeds_layer)
    }

    pub fn seqlen_offset(&self) -> usize {
        self.layers.first().map_or(0, |l| l.attn.current_seq_len())
    }

    pub fn reset_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.attn.reset_kv_cache()
        }
    }

    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let embeds = self.embed_tokens(input_ids)?;
        self.forward_embeds(&embeds, attention_mask)
    }

    /// Adds absolute position embeddings starting at the current cache
    /// offset, then runs the stack.
    pub fn forward_embeds(
        &mut self,
        inputs_embeds: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (_b, seq_len, _h) = inputs_embeds.dims3()?;
        let offset = self.seqlen_offset();
        let position_ids = Tensor::arange(
            offset as u32,
            (offset + seq_len) as u32,
            inputs_embeds.device(),
        )?;
        let position_embeds = self.embed_positions(&position_ids)?;
        let xs = inputs_embeds.broadcast_add(&position_embeds)?;
        self.forward_inner(&xs, attention_mask)
    }

    /// Single-step decode with an explicit absolute position, used by the
    /// generation loop where the position index runs behind the cache
    /// offset because of the conditioning prefix.
    pub fn forward_step(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        let embeds = self.embed_tokens(input_ids)?;
        let position_ids = Tensor::new(&[position as u32], input_ids.device())?;
        let position_embeds = self.embed_positions(&position_ids)?;
        let xs = embeds.broadcast_add(&position_embeds)?;
        self.forward_inner(&xs, None)
    }

    /// Runs raw embeddings through the stack without touching the position
    /// embeddings, the caller is responsible for any position information.
    pub fn forward_prompt(&mut self, inputs_embeds: &Tensor) -> Result<Tensor> {
        self.forward_inner(inputs_embeds, None)
    }

    fn forward_inner(&mut self, xs: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b, seq_len, _h) = xs.dims3()?;
        let past_len = self.seqlen_offset();
        let mut mask = if seq_len <= 1 {
            None
        } else {
            Some(causal_mask(seq_len, past_len, xs.dtype(), xs.device())?)
        };
        if let Some(m) = attention_mask {
            let expanded = expand_attention_mask(m, seq_len, xs.dtype())?;
            mask = Some(match mask {
                None => expanded,
                Some(causal) => causal.broadcast_add(&expanded)?,
            });
        }
        let mut xs = xs.clone();
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask.as_ref())?
        }
        xs.apply(&self.layer_norm)
    }
}

/// Decoder topped with the causal language-model head.
pub struct SpeechDecoder {
    pub decoder: Decoder,
    final_norm: LayerNorm,
    lm_head: candle_nn::Linear,
}

impl SpeechDecoder {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let decoder = Decoder::new(cfg, vb.pp("model").pp("decoder"))?;
        let final_norm = layer_norm(cfg.hidden_size, cfg.layer_norm_epsilon, vb.pp("final_norm"))?;
        let lm_head = linear(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?;
        Ok(Self { decoder, final_norm, lm_head })
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        hidden.apply(&self.final_norm)?.apply(&self.lm_head)
    }

    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let hidden = self.decoder.forward(input_ids, attention_mask)?;
        self.logits(&hidden)
    }

    pub fn forward_embeds(
        &mut self,
        inputs_embeds: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let hidden = self.decoder.forward_embeds(inputs_embeds, attention_mask)?;
        self.logits(&hidden)
    }

    pub fn forward_prompt(&mut self, inputs_embeds: &Tensor) -> Result<Tensor> {
        let hidden = self.decoder.forward_prompt(inputs_embeds)?;
        self.logits(&hidden)
    }

    pub fn forward_step(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        let hidden = self.decoder.forward_step(input_ids, position)?;
        self.logits(&hidden)
    }

    /// Next-token cross entropy, labels are the inputs shifted left by one.
    pub fn loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (_b, seq_len, vocab_size) = logits.dims3()?;
        let shift_logits = logits.i((.., ..seq_len - 1))?.reshape(((), vocab_size))?;
        let shift_labels = labels.i((.., 1..))?.flatten_all()?;
        candle_nn::loss::cross_entropy(&shift_logits, &shift_labels)
    }
}
