use crate::error::{Result, TransformerError};
use crate::params::{NamedParameter, NamedParameters, ParameterStore};
use burn::nn::{Embedding, EmbeddingConfig};
use burn::prelude::*;

/// トークン埋め込み（語彙範囲の検査と sqrt(d_model) スケーリング付き）
#[derive(Module, Debug)]
pub struct TokenEmbedding<B: Backend> {
    embedding: Embedding<B>,
    vocab_size: usize,
    d_model: usize,
}

impl<B: Backend> TokenEmbedding<B> {
    pub fn new(vocab_size: usize, d_model: usize, device: &B::Device) -> Self {
        Self {
            embedding: EmbeddingConfig::new(vocab_size, d_model).init(device),
            vocab_size,
            d_model,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// ids: [batch, seq_len] → [batch, seq_len, d_model]
    ///
    /// 位置エンコーディング（単位スケール）との大きさを揃えるため sqrt(d_model) 倍する。
    pub fn forward(&self, ids: Tensor<B, 2, Int>, context: &'static str) -> Result<Tensor<B, 3>> {
        self.check_ids(&ids, context)?;
        let scale = (self.d_model as f32).sqrt();
        Ok(self.embedding.forward(ids) * scale)
    }

    fn check_ids(&self, ids: &Tensor<B, 2, Int>, context: &'static str) -> Result<()> {
        let [batch, seq_len] = ids.dims();
        if batch == 0 || seq_len == 0 {
            return Err(TransformerError::shape(
                context,
                format!("空のトークン列です [batch={}, seq_len={}]", batch, seq_len),
            ));
        }

        let min: i64 = ids.clone().min().into_scalar().elem();
        let max: i64 = ids.clone().max().into_scalar().elem();

        let out_of_range = if min < 0 {
            Some(min)
        } else if max >= self.vocab_size as i64 {
            Some(max)
        } else {
            None
        };

        match out_of_range {
            Some(id) => Err(TransformerError::TokenIndex {
                context,
                id,
                vocab_size: self.vocab_size,
            }),
            None => Ok(()),
        }
    }
}

impl<B: Backend> NamedParameters<B> for TokenEmbedding<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.embedding.collect_parameters(prefix, out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let mut token_embedding = self.clone();
        token_embedding.embedding = self.embedding.load_parameters(prefix, store, device)?;
        Ok(token_embedding)
    }
}
