use crate::error::{Result, TransformerError};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Position-wise Feed-Forward: max(0, x·W1 + b1)·W2 + b2
///
/// 全位置・全バッチで同じ重みを使い、位置間の混合はしない。
#[derive(Module, Debug)]
pub struct PositionwiseFeedForward<B: Backend> {
    pub(crate) w_1: Linear<B>,
    pub(crate) w_2: Linear<B>,
    d_model: usize,
}

impl<B: Backend> PositionwiseFeedForward<B> {
    pub fn new(d_model: usize, d_ff: usize, device: &B::Device) -> Self {
        let w_1 = LinearConfig::new(d_model, d_ff).init(device);
        let w_2 = LinearConfig::new(d_ff, d_model).init(device);

        Self { w_1, w_2, d_model }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_batch, _seq_len, d_model] = x.dims();
        if d_model != self.d_model {
            return Err(TransformerError::shape(
                "feed_forward",
                format!("入力の最終次元 {} が d_model={} と異なります", d_model, self.d_model),
            ));
        }

        // 第1層: d_model → d_ff
        let hidden = self.w_1.forward(x);
        let activated = burn::tensor::activation::relu(hidden);

        // 第2層: d_ff → d_model
        Ok(self.w_2.forward(activated))
    }
}
