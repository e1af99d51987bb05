// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

pub use candle;
pub use candle_nn;

pub mod attention;
pub mod clvp;
pub mod conditioner;
pub mod decoder;
pub mod encoder;
pub mod generation;
pub mod llava;
pub mod musicgen_melody;
pub mod nn;
