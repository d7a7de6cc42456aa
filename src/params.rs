//! 学習パラメータの名前付き列挙と復元
//!
//! 永続化の形式は外部に任せ、ここでは「名前 → TensorData」の完全な
//! 一覧を提供する。名前はドット区切りのパス
//! （例: `encoder.layers.0.self_attention.heads.1.w_q.weight`）。

use crate::attention::{AttentionHead, MultiHeadAttention};
use crate::error::{Result, TransformerError};
use crate::feed_forward::PositionwiseFeedForward;
use crate::sublayer::SublayerConnection;
use burn::module::Param;
use burn::nn::{Embedding, LayerNorm, Linear};
use burn::prelude::*;
use std::collections::HashMap;

/// 名前付きパラメータ1個分
#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub data: TensorData,
}

impl NamedParameter {
    pub fn shape(&self) -> &[usize] {
        &self.data.shape
    }

    pub fn num_elements(&self) -> usize {
        self.data.shape.iter().product()
    }
}

/// 復元元のパラメータ集合
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    entries: HashMap<String, TensorData>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: TensorData) {
        self.entries.insert(name.into(), data);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 名前と形状を検査してテンソルを作る
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let data = self
            .entries
            .get(name)
            .ok_or_else(|| TransformerError::MissingParameter(name.to_string()))?;

        if data.shape.as_slice() != expected.as_slice() {
            return Err(TransformerError::shape(
                "load_named_parameters",
                format!("{}: 期待 {:?}, 実際 {:?}", name, expected, data.shape),
            ));
        }

        Ok(Tensor::from_data(data.clone(), device))
    }
}

impl FromIterator<NamedParameter> for ParameterStore {
    fn from_iter<I: IntoIterator<Item = NamedParameter>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|p| (p.name, p.data)).collect();
        Self { entries }
    }
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// 名前付きで列挙・復元できるモジュール
///
/// 復元は `&self` から新しいモジュールを作るため、失敗しても元の重みは壊れない。
pub trait NamedParameters<B: Backend>: Sized {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>);

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self>;
}

fn push<B: Backend, const D: usize>(out: &mut Vec<NamedParameter>, name: String, param: &Param<Tensor<B, D>>) {
    out.push(NamedParameter {
        name,
        data: param.val().into_data(),
    });
}

impl<B: Backend> NamedParameters<B> for Linear<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        push(out, join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            push(out, join(prefix, "bias"), bias);
        }
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let weight = store.tensor::<B, 2>(&join(prefix, "weight"), self.weight.val().dims(), device)?;
        let bias = match &self.bias {
            Some(bias) => Some(Param::from_tensor(store.tensor::<B, 1>(
                &join(prefix, "bias"),
                bias.val().dims(),
                device,
            )?)),
            None => None,
        };

        let mut linear = self.clone();
        linear.weight = Param::from_tensor(weight);
        linear.bias = bias;
        Ok(linear)
    }
}

impl<B: Backend> NamedParameters<B> for Embedding<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        push(out, join(prefix, "weight"), &self.weight);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let weight = store.tensor::<B, 2>(&join(prefix, "weight"), self.weight.val().dims(), device)?;
        let mut embedding = self.clone();
        embedding.weight = Param::from_tensor(weight);
        Ok(embedding)
    }
}

impl<B: Backend> NamedParameters<B> for LayerNorm<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        push(out, join(prefix, "gamma"), &self.gamma);
        push(out, join(prefix, "beta"), &self.beta);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let gamma = store.tensor::<B, 1>(&join(prefix, "gamma"), self.gamma.val().dims(), device)?;
        let beta = store.tensor::<B, 1>(&join(prefix, "beta"), self.beta.val().dims(), device)?;

        let mut norm = self.clone();
        norm.gamma = Param::from_tensor(gamma);
        norm.beta = Param::from_tensor(beta);
        Ok(norm)
    }
}

impl<B: Backend> NamedParameters<B> for SublayerConnection<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.norm.collect_parameters(&join(prefix, "norm"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let mut sublayer = self.clone();
        sublayer.norm = self.norm.load_parameters(&join(prefix, "norm"), store, device)?;
        Ok(sublayer)
    }
}

impl<B: Backend> NamedParameters<B> for AttentionHead<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.w_q.collect_parameters(&join(prefix, "w_q"), out);
        self.w_k.collect_parameters(&join(prefix, "w_k"), out);
        self.w_v.collect_parameters(&join(prefix, "w_v"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        Ok(AttentionHead {
            w_q: self.w_q.load_parameters(&join(prefix, "w_q"), store, device)?,
            w_k: self.w_k.load_parameters(&join(prefix, "w_k"), store, device)?,
            w_v: self.w_v.load_parameters(&join(prefix, "w_v"), store, device)?,
        })
    }
}

impl<B: Backend> NamedParameters<B> for MultiHeadAttention<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        for (index, head) in self.heads.iter().enumerate() {
            head.collect_parameters(&join(prefix, &format!("heads.{}", index)), out);
        }
        self.w_o.collect_parameters(&join(prefix, "w_o"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let heads = self
            .heads
            .iter()
            .enumerate()
            .map(|(index, head)| head.load_parameters(&join(prefix, &format!("heads.{}", index)), store, device))
            .collect::<Result<Vec<_>>>()?;

        let mut attention = self.clone();
        attention.heads = heads;
        attention.w_o = self.w_o.load_parameters(&join(prefix, "w_o"), store, device)?;
        Ok(attention)
    }
}

impl<B: Backend> NamedParameters<B> for PositionwiseFeedForward<B> {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.w_1.collect_parameters(&join(prefix, "w_1"), out);
        self.w_2.collect_parameters(&join(prefix, "w_2"), out);
    }

    fn load_parameters(&self, prefix: &str, store: &ParameterStore, device: &B::Device) -> Result<Self> {
        let mut feed_forward = self.clone();
        feed_forward.w_1 = self.w_1.load_parameters(&join(prefix, "w_1"), store, device)?;
        feed_forward.w_2 = self.w_2.load_parameters(&join(prefix, "w_2"), store, device)?;
        Ok(feed_forward)
    }
}
