// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use candle::{Result, Tensor, D};
use candle_nn::kv_cache::KvCache;
use candle_nn::{linear, linear_b, Linear, VarBuilder};

fn rotate_half(xs: &Tensor) -> Result<Tensor> {
    let last_dim = xs.dim(D::Minus1)?;
    let xs1 = xs.narrow(D::Minus1, 0, last_dim / 2)?;
    let xs2 = xs.narrow(D::Minus1, last_dim / 2, last_dim - last_dim / 2)?;
    Tensor::cat(&[&xs2.neg()?, &xs1], D::Minus1)
}

/// Rotary position embedding applied to the leading `dim` channels of each
/// head, the remaining channels pass through untouched.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    dim: usize,
}

impl RotaryEmbedding {
    pub fn new(
        projection_dim: usize,
        num_heads: usize,
        max_seq_len: usize,
        dev: &candle::Device,
    ) -> Result<Self> {
        let dim = usize::max(projection_dim / (num_heads * 2), 32);
        let inv_freq: Vec<_> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / 10000f32.powf(i as f32 / dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
            .to_dtype(candle::DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self { cos: emb.cos()?, sin: emb.sin()?, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `xs` has layout `(b, h, t, d)`, positions start at `offset`. The
    /// head dim must be at least the rotary dim.
    pub fn apply(&self, xs: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = xs.dims4()?;
        let dim = self.dim;
        if dim > head_dim {
            candle::bail!("rotary dim {dim} is larger than the head dim {head_dim}")
        }
        let cos = self.cos.narrow(0, offset, seq_len)?.to_dtype(xs.dtype())?;
        let sin = self.sin.narrow(0, offset, seq_len)?.to_dtype(xs.dtype())?;
        let xs_rot = xs.narrow(D::Minus1, 0, dim)?;
        let xs_pass = xs.narrow(D::Minus1, dim, head_dim - dim)?;
        let xs_rot = (xs_rot.broadcast_mul(&cos)? + rotate_half(&xs_rot)?.broadcast_mul(&sin)?)?;
        if dim == head_dim {
            Ok(xs_rot)
        } else {
            Tensor::cat(&[&xs_rot, &xs_pass], D::Minus1)
        }
    }
}

/// Multi-head self-attention with separate q/k/v/out projections. Rotary
/// embeddings, the attention mask, and the kv cache are all optional so the
/// same module serves the encoder, the decoder and the mel conditioning
/// blocks.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    kv_cache: Option<KvCache>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    span: tracing::Span,
}

impl SelfAttention {
    pub fn new(embed_dim: usize, num_heads: usize, use_bias: bool, vb: VarBuilder) -> Result<Self> {
        if embed_dim % num_heads != 0 {
            candle::bail!("embed_dim {embed_dim} is not divisible by num_heads {num_heads}")
        }
        let head_dim = embed_dim / num_heads;
        let q_proj = linear_b(embed_dim, embed_dim, use_bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(embed_dim, embed_dim, use_bias, vb.pp("k_proj"))?;
        let v_proj = linear_b(embed_dim, embed_dim, use_bias, vb.pp("v_proj"))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            kv_cache: None,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            span: tracing::span!(tracing::Level::TRACE, "mha"),
        })
    }

    pub fn with_kv_cache(mut self, max_seq_len: usize) -> Self {
        self.kv_cache = Some(KvCache::new(2, max_seq_len));
        self
    }

    pub fn reset_kv_cache(&mut self) {
        if let Some(cache) = self.kv_cache.as_mut() {
            cache.reset()
        }
    }

    pub fn current_seq_len(&self) -> usize {
        self.kv_cache.as_ref().map_or(0, |c| c.current_seq_len())
    }

    /// `mask` is additive, broadcastable to `(b, h, t, s)`. The query is
    /// scaled before rotary so cached keys stay unscaled.
    pub fn forward(
        &mut self,
        xs: &Tensor,
        rope: Option<&RotaryEmbedding>,
        mask: Option<&Tensor>,
        pos_offset: usize,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_size, seq_len, embed_dim) = xs.dims3()?;
        let shape = |x: Tensor| -> Result<Tensor> {
            x.reshape((b_size, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let mut q = shape((xs.apply(&self.q_proj)? * self.scale)?)?;
        let mut k = shape(xs.apply(&self.k_proj)?)?;
        let mut v = shape(xs.apply(&self.v_proj)?)?;
        if let Some(rope) = rope {
            q = rope.apply(&q, pos_offset)?;
            k = rope.apply(&k, pos_offset)?;
            v = rope.apply(&v, pos_offset)?;
        }
        let (k, v) = match self.kv_cache.as_mut() {
            None => (k, v),
            Some(cache) => cache.append(&k.contiguous()?, &v.contiguous()?)?,
        };
        let attn_weights = q.matmul(&k.t()?)?;
        let attn_weights = match mask {
            None => attn_weights,
            Some(mask) => attn_weights.broadcast_add(mask)?,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_size, seq_len, embed_dim))?
            .apply(&self.out_proj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device, IndexOp};

    #[test]
    fn rotate_half_swaps_and_negates() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::new(&[[1f32, 2., 3., 4.]], &dev)?;
        let ys = rotate_half(&xs)?.to_vec2::<f32>()?;
        assert_eq!(ys, [[-3., -4., 1., 2.]]);
        Ok(())
    }

    #[test]
    fn rotary_dim_floors_at_32() -> Result<()> {
        let dev = Device::Cpu;
        let rope = RotaryEmbedding::new(768, 12, 16, &dev)?;
        assert_eq!(rope.dim(), 32);
        let rope = RotaryEmbedding::new(1024, 8, 16, &dev)?;
        assert_eq!(rope.dim(), 64);
        Ok(())
    }

    #[test]
    fn rotary_is_identity_at_position_zero() -> Result<()> {
        let dev = Device::Cpu;
        let rope = RotaryEmbedding::new(768, 12, 16, &dev)?;
        let xs = Tensor::randn(0f32, 1f32, (1, 2, 1, 64), &dev)?;
        let ys = rope.apply(&xs, 0)?;
        let diff = (xs - ys)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn attention_output_shape_and_cache() -> Result<()> {
        let dev = Device::Cpu;
        let vb = candle_nn::VarBuilder::zeros(DType::F32, &dev);
        let mut attn = SelfAttention::new(16, 4, true, vb)?.with_kv_cache(8);
        let xs = Tensor::randn(0f32, 1f32, (2, 3, 16), &dev)?;
        let ys = attn.forward(&xs, None, None, 0)?;
        assert_eq!(ys.dims(), [2, 3, 16]);
        assert_eq!(attn.current_seq_len(), 3);
        let step = Tensor::randn(0f32, 1f32, (2, 1, 16), &dev)?;
        let ys = attn.forward(&step, None, None, 3)?;
        assert_eq!(ys.dims(), [2, 1, 16]);
        assert_eq!(attn.current_seq_len(), 4);
        let _ = ys.i((0, 0))?;
        attn.reset_kv_cache();
        assert_eq!(attn.current_seq_len(), 0);
        Ok(())
    }
}
