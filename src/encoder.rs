// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use crate::attention::{RotaryEmbedding, SelfAttention};
use crate::nn::expand_attention_mask;
use candle::{Module, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear_no_bias, rms_norm, Embedding, LayerNorm, RmsNorm, VarBuilder,
};

fn default_max_seq_len() -> usize {
    4096
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub projection_dim: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub hidden_act: candle_nn::Activation,
    pub layer_norm_eps: f64,
    pub use_rotary_embedding: bool,
    pub use_attention_bias: bool,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
}

impl Config {
    /// Text branch of the `susnato/clvp_dev` checkpoint.
    pub fn text() -> Self {
        Self {
            vocab_size: 256,
            hidden_size: 768,
            intermediate_size: 1536,
            projection_dim: 768,
            num_hidden_layers: 20,
            num_attention_heads: 12,
            hidden_act: candle_nn::Activation::Gelu,
            layer_norm_eps: 1e-5,
            use_rotary_embedding: true,
            use_attention_bias: false,
            max_seq_len: default_max_seq_len(),
            bos_token_id: 255,
            eos_token_id: 0,
        }
    }

    /// Speech branch, same stack over the speech-token vocabulary.
    pub fn speech() -> Self {
        Self {
            vocab_size: 8194,
            bos_token_id: 8192,
            eos_token_id: 8193,
            ..Self::text()
        }
    }
}

// The MLP projects to twice the intermediate size and gates one half with
// the other.
#[derive(Debug, Clone)]
struct GatedMlp {
    proj: candle_nn::Linear,
    fc2: candle_nn::Linear,
    activation: candle_nn::Activation,
    intermediate_size: usize,
}

impl GatedMlp {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::linear(
            cfg.hidden_size,
            cfg.intermediate_size * 2,
            vb.pp("fc1").pp("proj"),
        )?;
        let fc2 = candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?;
        Ok(Self { proj, fc2, activation: cfg.hidden_act, intermediate_size: cfg.intermediate_size })
    }
}

impl Module for GatedMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.apply(&self.proj)?;
        let hidden = xs.narrow(D::Minus1, 0, self.intermediate_size)?;
        let gate = xs.narrow(D::Minus1, self.intermediate_size, self.intermediate_size)?;
        (hidden * gate.apply(&self.activation)?)?.apply(&self.fc2)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    input_rmsnorm: RmsNorm,
    self_attn: SelfAttention,
    post_attention_rmsnorm: RmsNorm,
    mlp: GatedMlp,
    span: tracing::Span,
}

impl EncoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let input_rmsnorm = rms_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("input_rmsnorm"))?;
        let self_attn = SelfAttention::new(
            cfg.hidden_size,
            cfg.num_attention_heads,
            cfg.use_attention_bias,
            vb.pp("self_attn"),
        )?;
        let post_attention_rmsnorm = rms_norm(
            cfg.hidden_size,
            cfg.layer_norm_eps,
            vb.pp("post_attention_rmsnorm"),
        )?;
        let mlp = GatedMlp::new(cfg, vb.pp("mlp"))?;
        Ok(Self {
            input_rmsnorm,
            self_attn,
            post_attention_rmsnorm,
            mlp,
            span: tracing::span!(tracing::Level::TRACE, "encoder-layer"),
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        rope: Option<&RotaryEmbedding>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = xs;
        let xs = xs.apply(&self.input_rmsnorm)?;
        let xs = self.self_attn.forward(&xs, rope, mask, 0)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let xs = xs.apply(&self.post_attention_rmsnorm)?.apply(&self.mlp)?;
        residual + xs
    }
}

pub struct EncoderOutput {
    /// Projected pooled embedding, `(b, projection_dim)`.
    pub embeds: Tensor,
    /// Hidden states after the final layer norm, `(b, t, hidden)`.
    pub last_hidden_state: Tensor,
    /// Mean over the time axis of the last hidden state, `(b, hidden)`.
    pub pooled_output: Tensor,
}

/// Transformer encoder shared by the text and speech branches. The pooled
/// representation goes through a bias-free projection to the shared
/// embedding space.
pub struct Encoder {
    token_embedding: Embedding,
    rotary: Option<RotaryEmbedding>,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
    projection: candle_nn::Linear,
    span: tracing::Span,
}

impl Encoder {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let token_embedding =
            embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("token_embedding"))?;
        let rotary = if cfg.use_rotary_embedding {
            Some(RotaryEmbedding::new(
                cfg.projection_dim,
                cfg.num_attention_heads,
                cfg.max_seq_len,
                vb.device(),
            )?)
        } else {
            None
        };
        let vb_l = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::new(cfg, vb_l.pp(idx))?)
        }
        let final_layer_norm = layer_norm(
            cfg.hidden_size,
            candle_nn::LayerNormConfig { eps: cfg.layer_norm_eps, ..Default::default() },
            vb.pp("final_layer_norm"),
        )?;
        let projection =
            linear_no_bias(cfg.hidden_size, cfg.projection_dim, vb.pp("projection"))?;
        Ok(Self {
            token_embedding,
            rotary,
            layers,
            final_layer_norm,
            projection,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }

    pub fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        input_ids.apply(&self.token_embedding)
    }

    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let embeds = self.embed_tokens(input_ids)?;
        self.forward_embeds(&embeds, attention_mask)
    }

    pub fn forward_embeds(
        &mut self,
        inputs_embeds: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let _enter = self.span.enter();
        let (_b, seq_len, _h) = inputs_embeds.dims3()?;
        let mask = match attention_mask {
            None => None,
            Some(mask) => Some(expand_attention_mask(mask, seq_len, inputs_embeds.dtype())?),
        };
        let mut xs = inputs_embeds.clone();
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, self.rotary.as_ref(), mask.as_ref())?
        }
        let last_hidden_state = xs.apply(&self.final_layer_norm)?;
        let pooled_output = last_hidden_state.mean(1)?;
        let embeds = pooled_output.apply(&self.projection)?;
        Ok(EncoderOutput { embeds, last_hidden_state, pooled_output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn tiny_config() -> Config {
        Config {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 24,
            projection_dim: 8,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            hidden_act: candle_nn::Activation::Gelu,
            layer_norm_eps: 1e-5,
            // head_dim is below the rotary floor at this size
            use_rotary_embedding: false,
            use_attention_bias: false,
            max_seq_len: 64,
            bos_token_id: 30,
            eos_token_id: 0,
        }
    }

    #[test]
    fn encoder_output_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let mut encoder = Encoder::new(&tiny_config(), vb)?;
        let input_ids = Tensor::zeros((2, 5), DType::U32, &dev)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 0], [1, 1, 0, 0, 0]], &dev)?;
        let out = encoder.forward(&input_ids, Some(&mask))?;
        assert_eq!(out.last_hidden_state.dims(), [2, 5, 16]);
        assert_eq!(out.pooled_output.dims(), [2, 16]);
        assert_eq!(out.embeds.dims(), [2, 8]);
        Ok(())
    }

    #[test]
    fn gated_mlp_halves_the_projection() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let mlp = GatedMlp::new(&cfg, vb)?;
        let xs = Tensor::randn(0f32, 1f32, (1, 3, cfg.hidden_size), &dev)?;
        let ys = mlp.forward(&xs)?;
        assert_eq!(ys.dims(), [1, 3, cfg.hidden_size]);
        Ok(())
    }

    #[test]
    fn checkpoint_configs_are_consistent() {
        let text = Config::text();
        let speech = Config::speech();
        assert_eq!(text.vocab_size, 256);
        assert_eq!(speech.vocab_size, 8194);
        assert_eq!(text.projection_dim, speech.projection_dim);
        assert!(text.use_rotary_embedding);
    }
}
