use crate::attention::MultiHeadAttention;
use crate::config::TransformerConfig;
use crate::error::{Result, TransformerError};
use crate::feed_forward::PositionwiseFeedForward;
use crate::params::{NamedParameter, NamedParameters, ParameterStore, join};
use crate::sublayer::SublayerConnection;
use burn::prelude::*;

/// レイヤーへの入力（マスクとEncoderメモリ）
#[derive(Debug, Clone)]
pub struct LayerInput<B: Backend> {
    /// 自己注意のマスク [batch|1, q_len|1, k_len]
    pub self_mask: Option<Tensor<B, 3, Bool>>,
    /// Encoderの最終出力（Decoderのみ使用）
    pub memory: Option<Tensor<B, 3>>,
    /// ソース側パディングマスク（Cross-Attention用）
    pub memory_mask: Option<Tensor<B, 3, Bool>>,
}

impl<B: Backend> LayerInput<B> {
    pub fn encoder(self_mask: Option<Tensor<B, 3, Bool>>) -> Self {
        Self {
            self_mask,
            memory: None,
            memory_mask: None,
        }
    }

    pub fn decoder(
        self_mask: Option<Tensor<B, 3, Bool>>,
        memory: Tensor<B, 3>,
        memory_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Self {
        Self {
            self_mask,
            memory: Some(memory),
            memory_mask,
        }
    }
}

/// レイヤーの出力
#[derive(Debug, Clone)]
pub struct LayerOutput<B: Backend> {
    pub hidden: Tensor<B, 3>,
    /// 自己注意の重み [batch, heads, q_len, q_len]
    pub self_attention: Tensor<B, 4>,
    /// Cross-Attentionの重み [batch, heads, tgt_len, src_len]（Decoderのみ）
    pub cross_attention: Option<Tensor<B, 4>>,
}

/// EncoderLayer / DecoderLayer に共通のフォワード計算
pub trait TransformerLayer<B: Backend> {
    fn forward_layer(&self, x: Tensor<B, 3>, input: &LayerInput<B>) -> Result<LayerOutput<B>>;
}

// ===== Encoder Layer =====

/// 自己注意 → Feed-Forward（それぞれ残差接続 + 正規化）
#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    self_attention: MultiHeadAttention<B>,
    feed_forward: PositionwiseFeedForward<B>,
    self_attention_sublayer: SublayerConnection<B>,
    feed_forward_sublayer: SublayerConnection<B>,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Self {
        Self {
            self_attention: MultiHeadAttention::new(
                config.d_model,
                config.num_heads,
                config.dropout_rate,
                device,
            ),
            feed_forward: PositionwiseFeedForward::new(config.d_model, config.d_ff, device),
            self_attention_sublayer: sublayer(config, device),
            feed_forward_sublayer: sublayer(config, device),
        }
    }

    /// x: [batch, src_len, d_model], mask: ソースのパディングマスク
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 4>)> {
        // 1. 自己注意（Q = K = V = x）
        let attention = self
            .self_attention
            .forward(x.clone(), x.clone(), x.clone(), mask)?;
        let x = self.self_attention_sublayer.connect(x, attention.context)?;

        // 2. Feed-Forward
        let x = self
            .feed_forward_sublayer
            .forward(x, |x| self.feed_forward.forward(x))?;

        Ok((x, attention.weights))
    }
}

impl<B: Backend> TransformerLayer<B> for EncoderLayer<B> {
    fn forward_layer(&self, x: Tensor<B, 3>, input: &LayerInput<B>) -> Result<LayerOutput<B>> {
        let (hidden, self_attention) = self.forward(x, input.self_mask.clone())?;
        Ok(LayerOutput {
            hidden,
            self_attention,
            cross_attention: None,
        })
    }
}

// ===== Decoder Layer =====

/// 因果自己注意 → Cross-Attention → Feed-Forward（それぞれ残差接続 + 正規化）
#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    self_attention: MultiHeadAttention<B>,
    cross_attention: MultiHeadAttention<B>,
    feed_forward: PositionwiseFeedForward<B>,
    self_attention_sublayer: SublayerConnection<B>,
    cross_attention_sublayer: SublayerConnection<B>,
    feed_forward_sublayer: SublayerConnection<B>,
}

impl<B: Backend> DecoderLayer<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Self {
        let attention = || {
            MultiHeadAttention::new(
                config.d_model,
                config.num_heads,
                config.dropout_rate,
                device,
            )
        };

        Self {
            self_attention: attention(),
            cross_attention: attention(),
            feed_forward: PositionwiseFeedForward::new(config.d_model, config.d_ff, device),
            self_attention_sublayer: sublayer(config, device),
            cross_attention_sublayer: sublayer(config, device),
            feed_forward_sublayer: sublayer(config, device),
        }
    }

    /// x: [batch, tgt_len, d_model], memory: [batch, src_len, d_model]
    /// self_mask: 因果マスク ∧ ターゲットのパディングマスク
    /// memory_mask: ソースのパディングマスク
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        self_mask: Option<Tensor<B, 3, Bool>>,
        memory_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<LayerOutput<B>> {
        // 1. 因果マスク付き自己注意
        let self_attention = self
            .self_attention
            .forward(x.clone(), x.clone(), x.clone(), self_mask)?;
        let x = self
            .self_attention_sublayer
            .connect(x, self_attention.context)?;

        // 2. Cross-Attention（Encoderの出力を参照）
        let cross_attention =
            self.cross_attention
                .forward(x.clone(), memory.clone(), memory, memory_mask)?;
        let x = self
            .cross_attention_sublayer
            .connect(x, cross_attention.context)?;

        // 3. Feed-Forward
        let x = self
            .feed_forward_sublayer
            .forward(x, |x| self.feed_forward.forward(x))?;

        Ok(LayerOutput {
            hidden: x,
            self_attention: self_attention.weights,
            cross_attention: Some(cross_attention.weights),
        })
    }
}

impl<B: Backend> TransformerLayer<B> for DecoderLayer<B> {
    fn forward_layer(&self, x: Tensor<B, 3>, input: &LayerInput<B>) -> Result<LayerOutput<B>> {
        let memory = input.memory.clone().ok_or_else(|| {
            TransformerError::shape("decoder_layer", "Encoderメモリが渡されていません")
        })?;
        self.forward(x, memory, input.self_mask.clone(), input.memory_mask.clone())
    }
}

fn sublayer<B: Backend>(config: &TransformerConfig, device: &B::Device) -> SublayerConnection<B> {
    SublayerConnection::new(
        config.d_model,
        config.dropout_rate,
        config.layer_norm_eps,
        device,
    )
}

// ===== 名前付きパラメータ =====

impl<B: Backend> NamedParameters<B> for EncoderLayer<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.self_attention
            .collect_parameters(&join(prefix, "self_attention"), out);
        self.feed_forward
            .collect_parameters(&join(prefix, "feed_forward"), out);
        self.self_attention_sublayer
            .collect_parameters(&join(prefix, "self_attention_sublayer"), out);
        self.feed_forward_sublayer
            .collect_parameters(&join(prefix, "feed_forward_sublayer"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        Ok(Self {
            self_attention: self.self_attention.load_parameters(
                &join(prefix, "self_attention"),
                store,
                device,
            )?,
            feed_forward: self.feed_forward.load_parameters(
                &join(prefix, "feed_forward"),
                store,
                device,
            )?,
            self_attention_sublayer: self.self_attention_sublayer.load_parameters(
                &join(prefix, "self_attention_sublayer"),
                store,
                device,
            )?,
            feed_forward_sublayer: self.feed_forward_sublayer.load_parameters(
                &join(prefix, "feed_forward_sublayer"),
                store,
                device,
            )?,
        })
    }
}

impl<B: Backend> NamedParameters<B> for DecoderLayer<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.self_attention
            .collect_parameters(&join(prefix, "self_attention"), out);
        self.cross_attention
            .collect_parameters(&join(prefix, "cross_attention"), out);
        self.feed_forward
            .collect_parameters(&join(prefix, "feed_forward"), out);
        self.self_attention_sublayer
            .collect_parameters(&join(prefix, "self_attention_sublayer"), out);
        self.cross_attention_sublayer
            .collect_parameters(&join(prefix, "cross_attention_sublayer"), out);
        self.feed_forward_sublayer
            .collect_parameters(&join(prefix, "feed_forward_sublayer"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        Ok(Self {
            self_attention: self.self_attention.load_parameters(
                &join(prefix, "self_attention"),
                store,
                device,
            )?,
            cross_attention: self.cross_attention.load_parameters(
                &join(prefix, "cross_attention"),
                store,
                device,
            )?,
            feed_forward: self.feed_forward.load_parameters(
                &join(prefix, "feed_forward"),
                store,
                device,
            )?,
            self_attention_sublayer: self.self_attention_sublayer.load_parameters(
                &join(prefix, "self_attention_sublayer"),
                store,
                device,
            )?,
            cross_attention_sublayer: self.cross_attention_sublayer.load_parameters(
                &join(prefix, "cross_attention_sublayer"),
                store,
                device,
            )?,
            feed_forward_sublayer: self.feed_forward_sublayer.load_parameters(
                &join(prefix, "feed_forward_sublayer"),
                store,
                device,
            )?,
        })
    }
}
