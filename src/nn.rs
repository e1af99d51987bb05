// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;

/// GPT-2 style 1D convolution, i.e. a linear layer whose weight is stored
/// transposed, with shape `(in_features, out_features)`.
#[derive(Debug, Clone)]
pub struct Conv1D {
    weight: Tensor,
    bias: Tensor,
    in_features: usize,
    out_features: usize,
}

impl Conv1D {
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((in_features, out_features), "weight")?;
        let bias = vb.get(out_features, "bias")?;
        Ok(Self { weight, bias, in_features, out_features })
    }

    pub fn from_weights(weight: Tensor, bias: Tensor) -> Result<Self> {
        let (in_features, out_features) = weight.dims2()?;
        Ok(Self { weight, bias, in_features, out_features })
    }
}

impl Module for Conv1D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_size, seq_len, _) = xs.dims3()?;
        let xs = xs
            .reshape((b_size * seq_len, self.in_features))?
            .matmul(&self.weight)?
            .broadcast_add(&self.bias)?;
        xs.reshape((b_size, seq_len, self.out_features))
    }
}

/// Expands a `(b, s)` padding mask of ones and zeros into an additive
/// `(b, 1, t, s)` mask, 0 on kept positions and a large negative value on
/// masked ones.
pub fn expand_attention_mask(mask: &Tensor, tgt_len: usize, dtype: DType) -> Result<Tensor> {
    let (b_size, src_len) = mask.dims2()?;
    let mask = mask
        .to_dtype(DType::F32)?
        .reshape((b_size, 1, 1, src_len))?
        .broadcast_as((b_size, 1, tgt_len, src_len))?;
    let inverted = mask.affine(-1.0, 1.0)?;
    (inverted * f64::from(f32::MIN))?.to_dtype(dtype)
}

/// Additive causal mask of shape `(1, 1, t, past_len + t)`. Row `i` attends
/// to columns `..=past_len + i`.
pub fn causal_mask(
    tgt_len: usize,
    past_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let src_len = past_len + tgt_len;
    let mask: Vec<f32> = (0..tgt_len)
        .flat_map(|i| (0..src_len).map(move |j| if j > past_len + i { f32::MIN } else { 0. }))
        .collect();
    Tensor::from_vec(mask, (1, 1, tgt_len, src_len), device)?.to_dtype(dtype)
}

/// Number of groups for a group norm over `channels`, starting from 32 and
/// halving until the group count divides the channel count.
pub fn groupnorm_groups(channels: usize) -> Result<usize> {
    let mut groups: usize = if channels <= 16 {
        8
    } else if channels <= 64 {
        16
    } else {
        32
    };
    while channels % groups != 0 {
        groups /= 2;
    }
    if groups <= 2 {
        candle::bail!("no valid group count found for {channels} channels, got {groups} groups")
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::IndexOp;

    #[test]
    fn conv1d_is_a_transposed_linear() -> Result<()> {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 0., 2.], [0., 1., 1.]], &dev)?;
        let bias = Tensor::new(&[0f32, 10., 0.], &dev)?;
        let conv = Conv1D::from_weights(weight, bias)?;
        let xs = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &dev)?;
        let ys = conv.forward(&xs)?.to_vec3::<f32>()?;
        assert_eq!(ys, [[[1., 12., 4.], [3., 14., 10.]]]);
        Ok(())
    }

    #[test]
    fn padding_mask_expansion() -> Result<()> {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[1u32, 1, 0]], &dev)?;
        let expanded = expand_attention_mask(&mask, 2, DType::F32)?;
        assert_eq!(expanded.dims(), [1, 1, 2, 3]);
        let row = expanded.i((0, 0, 0))?.to_vec1::<f32>()?;
        assert_eq!(row[0], 0.);
        assert_eq!(row[1], 0.);
        assert!(row[2] < -1e30);
        Ok(())
    }

    #[test]
    fn causal_mask_with_past() -> Result<()> {
        let dev = Device::Cpu;
        let mask = causal_mask(2, 3, DType::F32, &dev)?;
        assert_eq!(mask.dims(), [1, 1, 2, 5]);
        let rows = mask.i((0, 0))?.to_vec2::<f32>()?;
        assert!(rows[0][..4].iter().all(|&v| v == 0.));
        assert!(rows[0][4] < -1e30);
        assert!(rows[1].iter().all(|&v| v == 0.));
        Ok(())
    }

    #[test]
    fn groupnorm_group_counts() -> Result<()> {
        assert_eq!(groupnorm_groups(1024)?, 32);
        assert_eq!(groupnorm_groups(80)?, 16);
        assert_eq!(groupnorm_groups(8)?, 8);
        assert!(groupnorm_groups(10).is_err());
        Ok(())
    }
}
