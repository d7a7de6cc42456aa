use crate::error::{Result, TransformerError};
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig};
use burn::prelude::*;

// ===== Sublayer Connection =====

/// 残差接続 + 正規化（Post-LN）: normalize(x + dropout(f(x)))
///
/// 正規化パラメータ（gamma = 1, beta = 0 で初期化）は各インスタンスが個別に持つ。
/// 分散は偏りあり（d_model で割る）、eps は平方根の内側に加える。
#[derive(Module, Debug)]
pub struct SublayerConnection<B: Backend> {
    pub(crate) norm: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> SublayerConnection<B> {
    pub fn new(d_model: usize, dropout_rate: f64, layer_norm_eps: f64, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(d_model)
                .with_epsilon(layer_norm_eps)
                .init(device),
            dropout: DropoutConfig::new(dropout_rate).init(),
        }
    }

    /// サブレイヤー関数 f を x に適用して接続する
    pub fn forward<F>(&self, x: Tensor<B, 3>, sublayer: F) -> Result<Tensor<B, 3>>
    where
        F: FnOnce(Tensor<B, 3>) -> Result<Tensor<B, 3>>,
    {
        let output = sublayer(x.clone())?;
        self.connect(x, output)
    }

    /// 計算済みのサブレイヤー出力 f(x) を接続する
    pub fn connect(&self, x: Tensor<B, 3>, sublayer_output: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        if x.dims() != sublayer_output.dims() {
            return Err(TransformerError::shape(
                "sublayer_connection",
                format!(
                    "入力 {:?} とサブレイヤー出力 {:?} の形状が異なります",
                    x.dims(),
                    sublayer_output.dims()
                ),
            ));
        }

        let residual = x + self.dropout.forward(sublayer_output);
        Ok(self.norm.forward(residual))
    }
}
