// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Configuration layer for the Llava vision-language models: a CLIP-style
//! vision backbone config, a Llama-style text backbone config and the
//! composite config that glues them through a multi-modal projector.

use candle::{Module, Result, Tensor};

/// Activations named by the llava checkpoints. `quick_gelu` is the CLIP
/// sigmoid approximation, which `candle_nn::Activation` does not carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Gelu,
    QuickGelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub projection_dim: usize,
    pub vocab_size: usize,
    pub hidden_act: Activation,
    pub layer_norm_eps: f64,
}

impl Default for VisionConfig {
    // The CLIP ViT-L/14-336px tower used by llava-1.5.
    fn default() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            num_channels: 3,
            image_size: 336,
            patch_size: 14,
            projection_dim: 768,
            vocab_size: 32000,
            hidden_act: Activation::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }
}

impl VisionConfig {
    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
}

impl Default for TextConfig {
    // Llama-7b.
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            intermediate_size: 11008,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: 32,
            max_position_embeddings: 2048,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.,
        }
    }
}

/// Whether the cls token of the vision tower is kept in the image features
/// handed to the projector.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum VisionFeatureSelectStrategy {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "full")]
    Full,
}

impl VisionFeatureSelectStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "full" => Ok(Self::Full),
            _ => candle::bail!(
                "vision_feature_select_strategy should be one of 'default', 'full', got {s}"
            ),
        }
    }
}

fn default_ignore_index() -> i64 {
    -100
}

fn default_image_token_index() -> u32 {
    32000
}

fn default_projector_hidden_act() -> Activation {
    Activation::Gelu
}

fn default_vision_feature_layer() -> i64 {
    -2
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LlavaConfig {
    #[serde(default)]
    pub vision_config: VisionConfig,
    #[serde(default)]
    pub text_config: TextConfig,
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
    #[serde(default = "default_projector_hidden_act")]
    pub projector_hidden_act: Activation,
    #[serde(default)]
    pub vision_feature_select_strategy: VisionFeatureSelectStrategy,
    #[serde(default = "default_vision_feature_layer")]
    pub vision_feature_layer: i64,
}

impl Default for LlavaConfig {
    fn default() -> Self {
        Self {
            vision_config: VisionConfig::default(),
            text_config: TextConfig::default(),
            ignore_index: default_ignore_index(),
            image_token_index: default_image_token_index(),
            projector_hidden_act: default_projector_hidden_act(),
            vision_feature_select_strategy: VisionFeatureSelectStrategy::default(),
            vision_feature_layer: default_vision_feature_layer(),
        }
    }
}

impl LlavaConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(candle::Error::wrap)
    }

    /// Number of placeholder tokens one image expands to.
    pub fn num_image_tokens(&self) -> usize {
        let patches = self.vision_config.num_patches();
        match self.vision_feature_select_strategy {
            VisionFeatureSelectStrategy::Default => patches,
            VisionFeatureSelectStrategy::Full => patches + 1,
        }
    }

    /// Resolves `vision_feature_layer` against the hidden-state stack, where
    /// index 0 is the embedding output.
    pub fn resolved_vision_feature_layer(&self) -> Result<usize> {
        let num_states = self.vision_config.num_hidden_layers as i64 + 1;
        let idx = if self.vision_feature_layer < 0 {
            num_states + self.vision_feature_layer
        } else {
            self.vision_feature_layer
        };
        if idx < 0 || idx >= num_states {
            candle::bail!(
                "vision_feature_layer {} is out of range for {} hidden states",
                self.vision_feature_layer,
                num_states
            )
        }
        Ok(idx as usize)
    }
}
