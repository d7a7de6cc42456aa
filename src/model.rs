use crate::config::TransformerConfig;
use crate::embedding::TokenEmbedding;
use crate::error::{Result, TransformerError};
use crate::layers::{DecoderLayer, EncoderLayer, LayerInput, LayerOutput, TransformerLayer};
use crate::mask::{decoder_self_mask, padding_mask};
use crate::params::{NamedParameter, NamedParameters, ParameterStore, join};
use crate::positional_encoding::PositionalEncoding;
use burn::module::Ignored;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use std::sync::Arc;

// ===== 共通ヘルパー関数 =====

/// 埋め込み + 位置エンコーディング + Dropout（Encoder/Decoder共通）
fn embed<B: Backend>(
    embedding: &TokenEmbedding<B>,
    positional: &PositionalEncoding,
    dropout: &Dropout,
    ids: Tensor<B, 2, Int>,
    context: &'static str,
) -> Result<Tensor<B, 3>> {
    let [_batch, seq_len] = ids.dims();
    if seq_len > positional.max_len() {
        return Err(TransformerError::Configuration(format!(
            "{}: 系列長 {} が max_len={} を超えています",
            context,
            seq_len,
            positional.max_len()
        )));
    }

    let embedded = embedding.forward(ids, context)?;
    let x = positional.apply(embedded)?;
    Ok(dropout.forward(x))
}

/// レイヤーを順番に適用（EncoderLayer/DecoderLayer共通）
fn run_stack<B: Backend, L: TransformerLayer<B>>(
    layers: &[L],
    mut x: Tensor<B, 3>,
    input: &LayerInput<B>,
    check_numerics: bool,
    context: &'static str,
) -> Result<(Tensor<B, 3>, Vec<LayerOutput<B>>)> {
    let mut outputs = Vec::with_capacity(layers.len());

    for (index, layer) in layers.iter().enumerate() {
        let output = layer.forward_layer(x, input)?;
        log::debug!("{} layer {}: {:?}", context, index, output.hidden.dims());

        if check_numerics {
            ensure_finite(&output.hidden, &format!("{}.layers.{}", context, index))?;
        }

        x = output.hidden.clone();
        outputs.push(output);
    }

    Ok((x, outputs))
}

fn ensure_finite<B: Backend, const D: usize>(x: &Tensor<B, D>, location: &str) -> Result<()> {
    let all_finite = x.to_data().iter::<f32>().all(f32::is_finite);
    if all_finite {
        Ok(())
    } else {
        Err(TransformerError::NumericalInstability(location.to_string()))
    }
}

// ===== Encoder =====

/// Encoderの出力
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// Encoderメモリ [batch, src_len, d_model]
    pub memory: Tensor<B, 3>,
    /// レイヤーごとの自己注意の重み
    pub self_attention: Vec<Tensor<B, 4>>,
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    embedding: TokenEmbedding<B>,
    positional: Ignored<Arc<PositionalEncoding>>,
    dropout: Dropout,
    layers: Vec<EncoderLayer<B>>,
    check_numerics: bool,
}

impl<B: Backend> Encoder<B> {
    pub fn new(
        config: &TransformerConfig,
        positional: Arc<PositionalEncoding>,
        device: &B::Device,
    ) -> Self {
        let layers = (0..config.num_layers)
            .map(|_| EncoderLayer::new(config, device))
            .collect();

        Self {
            embedding: TokenEmbedding::new(config.vocab_size_src, config.d_model, device),
            positional: Ignored(positional),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            layers,
            check_numerics: config.check_numerics,
        }
    }

    pub fn embedding(&self) -> &TokenEmbedding<B> {
        &self.embedding
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// src_ids: [batch, src_len], src_mask: [batch, 1, src_len]（true = パディング）
    pub fn forward(
        &self,
        src_ids: Tensor<B, 2, Int>,
        src_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<EncoderOutput<B>> {
        let x = embed(
            &self.embedding,
            &self.positional.0,
            &self.dropout,
            src_ids,
            "encoder",
        )?;

        let input = LayerInput::encoder(src_mask);
        let (memory, outputs) = run_stack(&self.layers, x, &input, self.check_numerics, "encoder")?;

        Ok(EncoderOutput {
            memory,
            self_attention: outputs.into_iter().map(|o| o.self_attention).collect(),
        })
    }
}

// ===== Decoder =====

/// Decoderの出力
#[derive(Debug, Clone)]
pub struct DecoderOutput<B: Backend> {
    /// 語彙ロジット [batch, tgt_len, vocab_size_tgt]（Softmax前）
    pub logits: Tensor<B, 3>,
    pub self_attention: Vec<Tensor<B, 4>>,
    pub cross_attention: Vec<Tensor<B, 4>>,
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    /// 埋め込み共有時は None（Encoder側の表を使う）
    embedding: Option<TokenEmbedding<B>>,
    positional: Ignored<Arc<PositionalEncoding>>,
    dropout: Dropout,
    layers: Vec<DecoderLayer<B>>,
    output_projection: Linear<B>,
    check_numerics: bool,
}

impl<B: Backend> Decoder<B> {
    pub fn new(
        config: &TransformerConfig,
        positional: Arc<PositionalEncoding>,
        device: &B::Device,
    ) -> Self {
        let embedding = if config.share_embeddings {
            None
        } else {
            Some(TokenEmbedding::new(config.vocab_size_tgt, config.d_model, device))
        };

        let layers = (0..config.num_layers)
            .map(|_| DecoderLayer::new(config, device))
            .collect();

        Self {
            embedding,
            positional: Ignored(positional),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            layers,
            output_projection: LinearConfig::new(config.d_model, config.vocab_size_tgt).init(device),
            check_numerics: config.check_numerics,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// 自前の埋め込み表でデコードする
    pub fn forward(
        &self,
        tgt_ids: Tensor<B, 2, Int>,
        memory: Tensor<B, 3>,
        tgt_mask: Option<Tensor<B, 3, Bool>>,
        memory_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<DecoderOutput<B>> {
        let embedding = self.embedding.as_ref().ok_or_else(|| {
            TransformerError::Configuration(
                "埋め込みを共有するDecoderは forward_with_embedding で呼び出してください".to_string(),
            )
        })?;
        self.forward_with_embedding(embedding, tgt_ids, memory, tgt_mask, memory_mask)
    }

    /// 指定した埋め込み表でデコードする（埋め込み共有用）
    pub fn forward_with_embedding(
        &self,
        embedding: &TokenEmbedding<B>,
        tgt_ids: Tensor<B, 2, Int>,
        memory: Tensor<B, 3>,
        tgt_mask: Option<Tensor<B, 3, Bool>>,
        memory_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<DecoderOutput<B>> {
        let [tgt_batch, _tgt_len] = tgt_ids.dims();
        let [memory_batch, _src_len, _d_model] = memory.dims();
        if tgt_batch != memory_batch {
            return Err(TransformerError::shape(
                "decoder",
                format!(
                    "ターゲットのバッチサイズ {} とEncoderメモリのバッチサイズ {} が異なります",
                    tgt_batch, memory_batch
                ),
            ));
        }

        let x = embed(embedding, &self.positional.0, &self.dropout, tgt_ids, "decoder")?;

        let input = LayerInput::decoder(tgt_mask, memory, memory_mask);
        let (x, outputs) = run_stack(&self.layers, x, &input, self.check_numerics, "decoder")?;

        // 出力射影: [batch, tgt_len, d_model] → [batch, tgt_len, vocab_size]
        let logits = self.output_projection.forward(x);
        if self.check_numerics {
            ensure_finite(&logits, "decoder.output_projection")?;
        }

        let mut self_attention = Vec::with_capacity(outputs.len());
        let mut cross_attention = Vec::with_capacity(outputs.len());
        for output in outputs {
            self_attention.push(output.self_attention);
            cross_attention.extend(output.cross_attention);
        }

        Ok(DecoderOutput {
            logits,
            self_attention,
            cross_attention,
        })
    }
}

// ===== Transformer =====

/// 全レイヤーのAttention重み付きの出力
#[derive(Debug, Clone)]
pub struct TransformerOutput<B: Backend> {
    /// [batch, tgt_len, vocab_size_tgt]
    pub logits: Tensor<B, 3>,
    pub encoder_self_attention: Vec<Tensor<B, 4>>,
    pub decoder_self_attention: Vec<Tensor<B, 4>>,
    pub cross_attention: Vec<Tensor<B, 4>>,
}

#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    pad_id: usize,
    d_model: usize,
    max_len: usize,
}

impl TransformerConfig {
    /// 設定を検査してからモデルを構築する
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Transformer<B>> {
        self.validate()?;

        let positional = Arc::new(PositionalEncoding::new(self.max_len, self.d_model));
        let model = Transformer {
            encoder: Encoder::new(self, positional.clone(), device),
            decoder: Decoder::new(self, positional, device),
            pad_id: self.pad_id,
            d_model: self.d_model,
            max_len: self.max_len,
        };

        log::info!(
            "Transformerを構築: d_model={}, heads={}, layers={}, d_ff={}, パラメータ数={}",
            self.d_model,
            self.num_heads,
            self.num_layers,
            self.d_ff,
            model.num_params()
        );

        Ok(model)
    }
}

impl<B: Backend> Transformer<B> {
    pub fn encoder(&self) -> &Encoder<B> {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder<B> {
        &self.decoder
    }

    pub fn pad_id(&self) -> usize {
        self.pad_id
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// (source_ids, target_ids) → ロジット [batch, tgt_len, vocab_size_tgt]
    pub fn forward(&self, src_ids: Tensor<B, 2, Int>, tgt_ids: Tensor<B, 2, Int>) -> Result<Tensor<B, 3>> {
        Ok(self.forward_with_attention(src_ids, tgt_ids)?.logits)
    }

    /// マスクをトークンIDから導出してフォワード（Attention重みも返す）
    pub fn forward_with_attention(
        &self,
        src_ids: Tensor<B, 2, Int>,
        tgt_ids: Tensor<B, 2, Int>,
    ) -> Result<TransformerOutput<B>> {
        let src_mask = padding_mask(&src_ids, self.pad_id);
        let tgt_mask = decoder_self_mask(&tgt_ids, self.pad_id)?;
        self.forward_with_masks(src_ids, tgt_ids, Some(src_mask), Some(tgt_mask))
    }

    /// 事前計算済みのマスクでフォワード
    ///
    /// src_mask はEncoderの自己注意とCross-Attentionの両方に使う。
    pub fn forward_with_masks(
        &self,
        src_ids: Tensor<B, 2, Int>,
        tgt_ids: Tensor<B, 2, Int>,
        src_mask: Option<Tensor<B, 3, Bool>>,
        tgt_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<TransformerOutput<B>> {
        let [src_batch, _] = src_ids.dims();
        let [tgt_batch, _] = tgt_ids.dims();
        if src_batch != tgt_batch {
            return Err(TransformerError::shape(
                "transformer",
                format!("ソース {} とターゲット {} のバッチサイズが異なります", src_batch, tgt_batch),
            ));
        }

        let encoded = self.encoder.forward(src_ids, src_mask.clone())?;
        let decoded = self.decode(tgt_ids, encoded.memory, tgt_mask, src_mask)?;

        Ok(TransformerOutput {
            logits: decoded.logits,
            encoder_self_attention: encoded.self_attention,
            decoder_self_attention: decoded.self_attention,
            cross_attention: decoded.cross_attention,
        })
    }

    /// ソース側だけを計算（自己回帰生成でメモリを再利用する）
    pub fn encode(&self, src_ids: Tensor<B, 2, Int>) -> Result<EncoderOutput<B>> {
        let src_mask = padding_mask(&src_ids, self.pad_id);
        self.encoder.forward(src_ids, Some(src_mask))
    }

    /// Encoderメモリに対してターゲット列をデコード
    pub fn decode(
        &self,
        tgt_ids: Tensor<B, 2, Int>,
        memory: Tensor<B, 3>,
        tgt_mask: Option<Tensor<B, 3, Bool>>,
        memory_mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<DecoderOutput<B>> {
        match &self.decoder.embedding {
            Some(_) => self.decoder.forward(tgt_ids, memory, tgt_mask, memory_mask),
            None => self.decoder.forward_with_embedding(
                &self.encoder.embedding,
                tgt_ids,
                memory,
                tgt_mask,
                memory_mask,
            ),
        }
    }

    /// 全学習パラメータの名前付き一覧（列挙順は固定）
    pub fn named_parameters(&self) -> Vec<NamedParameter> {
        let mut out = Vec::new();
        self.collect_parameters("", &mut out);
        out
    }

    /// 名前付き一覧から重みを復元した新しいモデルを返す（self は変更しない）
    pub fn load_named_parameters<I>(&self, params: I, device: &B::Device) -> Result<Self>
    where
        I: IntoIterator<Item = NamedParameter>,
    {
        let store: ParameterStore = params.into_iter().collect();
        self.load_parameters("", &store, device)
    }
}

// ===== 名前付きパラメータ =====

impl<B: Backend> NamedParameters<B> for Encoder<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.embedding.collect_parameters(&join(prefix, "embedding"), out);
        for (index, layer) in self.layers.iter().enumerate() {
            layer.collect_parameters(&join(prefix, &format!("layers.{}", index)), out);
        }
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                layer.load_parameters(&join(prefix, &format!("layers.{}", index)), store, device)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut encoder = self.clone();
        encoder.embedding = self
            .embedding
            .load_parameters(&join(prefix, "embedding"), store, device)?;
        encoder.layers = layers;
        Ok(encoder)
    }
}

impl<B: Backend> NamedParameters<B> for Decoder<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        if let Some(embedding) = &self.embedding {
            embedding.collect_parameters(&join(prefix, "embedding"), out);
        }
        for (index, layer) in self.layers.iter().enumerate() {
            layer.collect_parameters(&join(prefix, &format!("layers.{}", index)), out);
        }
        self.output_projection
            .collect_parameters(&join(prefix, "output_projection"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let embedding = match &self.embedding {
            Some(embedding) => Some(embedding.load_parameters(&join(prefix, "embedding"), store, device)?),
            None => None,
        };

        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                layer.load_parameters(&join(prefix, &format!("layers.{}", index)), store, device)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut decoder = self.clone();
        decoder.embedding = embedding;
        decoder.layers = layers;
        decoder.output_projection = self.output_projection.load_parameters(
            &join(prefix, "output_projection"),
            store,
            device,
        )?;
        Ok(decoder)
    }
}

impl<B: Backend> NamedParameters<B> for Transformer<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.encoder.collect_parameters(&join(prefix, "encoder"), out);
        self.decoder.collect_parameters(&join(prefix, "decoder"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let mut model = self.clone();
        model.encoder = self.encoder.load_parameters(&join(prefix, "encoder"), store, device)?;
        model.decoder = self.decoder.load_parameters(&join(prefix, "decoder"), store, device)?;
        Ok(model)
    }
}
