use crate::error::{Result, TransformerError};
use crate::mask::broadcast_mask;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;

/// 参照禁止のスコアを置き換える値
///
/// f32では exp(-1e9 - max) が必ず 0 にアンダーフローするため、
/// Softmax後の重みは厳密に 0 になる。-inf と違い、全キーが禁止された
/// 行でも NaN にならない。
pub const MASK_FILL_VALUE: f32 = -1.0e9;

// ===== Scaled Dot-Product Attention =====

/// Attention重み softmax(Q·K^T / sqrt(d_k)) を計算する
///
/// query: [.., q_len, d_k], key: [.., k_len, d_k],
/// mask: [.., q_len, k_len] にブロードキャスト可能な Bool（true = 禁止）
///
/// 禁止位置の重みは厳密に 0。全キーが禁止された行は全て 0 になる。
pub fn attention_weights<B: Backend, const D: usize>(
    query: Tensor<B, D>,
    key: Tensor<B, D>,
    mask: Option<Tensor<B, D, Bool>>,
) -> Result<Tensor<B, D>> {
    if D < 2 {
        return Err(TransformerError::shape(
            "scaled_dot_product_attention",
            format!("2次元以上のテンソルが必要です (rank={})", D),
        ));
    }

    let q_dims = query.dims();
    let k_dims = key.dims();

    if q_dims[..D - 2] != k_dims[..D - 2] {
        return Err(TransformerError::shape(
            "scaled_dot_product_attention",
            format!("Q {:?} と K {:?} のバッチ次元が異なります", q_dims, k_dims),
        ));
    }
    if q_dims[D - 1] != k_dims[D - 1] {
        return Err(TransformerError::shape(
            "scaled_dot_product_attention",
            format!(
                "Q の d_k={} と K の d_k={} が異なります",
                q_dims[D - 1],
                k_dims[D - 1]
            ),
        ));
    }

    let mut score_dims = q_dims;
    score_dims[D - 1] = k_dims[D - 2];

    // 計算前にマスク形状を確定させる
    let mask = match mask {
        Some(mask) => Some(broadcast_mask(mask, score_dims)?),
        None => None,
    };

    let d_k = q_dims[D - 1];
    let scale = (d_k as f32).sqrt();
    let scores = query.matmul(key.transpose()) / scale;

    match mask {
        Some(mask) => {
            let weights = stable_softmax(scores.mask_fill(mask.clone(), MASK_FILL_VALUE), D - 1);
            // 全キーが禁止された行は一様分布になるので、許可位置以外を 0 にする
            Ok(weights * mask.bool_not().float())
        }
        None => Ok(stable_softmax(scores, D - 1)),
    }
}

/// Scaled Dot-Product Attention（学習パラメータなしの純粋関数）
///
/// 戻り値: (出力 [.., q_len, d_v], Attention重み [.., q_len, k_len])
pub fn scaled_dot_product_attention<B: Backend, const D: usize>(
    query: Tensor<B, D>,
    key: Tensor<B, D>,
    value: Tensor<B, D>,
    mask: Option<Tensor<B, D, Bool>>,
) -> Result<(Tensor<B, D>, Tensor<B, D>)> {
    check_key_value(&key, &value)?;
    let weights = attention_weights(query, key, mask)?;
    let output = weights.clone().matmul(value);
    Ok((output, weights))
}

fn check_key_value<B: Backend, const D: usize>(key: &Tensor<B, D>, value: &Tensor<B, D>) -> Result<()> {
    let k_dims = key.dims();
    let v_dims = value.dims();
    if D >= 2 && (k_dims[..D - 1] != v_dims[..D - 1]) {
        return Err(TransformerError::shape(
            "scaled_dot_product_attention",
            format!("K {:?} と V {:?} の系列長/バッチ次元が異なります", k_dims, v_dims),
        ));
    }
    Ok(())
}

/// 行の最大値を引いてから exp を取る数値安定なSoftmax
fn stable_softmax<B: Backend, const D: usize>(scores: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let row_max = scores.clone().detach().max_dim(dim);
    let exp = (scores - row_max).exp();
    exp.clone() / exp.sum_dim(dim)
}

// ===== Attention Head =====

/// 1ヘッド分の射影 W_q, W_k, W_v (d_model → d_k)
#[derive(Module, Debug)]
pub struct AttentionHead<B: Backend> {
    pub(crate) w_q: Linear<B>,
    pub(crate) w_k: Linear<B>,
    pub(crate) w_v: Linear<B>,
}

impl<B: Backend> AttentionHead<B> {
    pub fn new(d_model: usize, d_head: usize, device: &B::Device) -> Self {
        Self {
            w_q: LinearConfig::new(d_model, d_head).init(device),
            w_k: LinearConfig::new(d_model, d_head).init(device),
            w_v: LinearConfig::new(d_model, d_head).init(device),
        }
    }

    /// 戻り値: (ヘッド出力 [batch, q_len, d_k], 重み [batch, q_len, k_len])
    fn forward(
        &self,
        query: Tensor<B, 3>,
        key: Tensor<B, 3>,
        value: Tensor<B, 3>,
        mask: Option<Tensor<B, 3, Bool>>,
        dropout: &Dropout,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let q = self.w_q.forward(query);
        let k = self.w_k.forward(key);
        let v = self.w_v.forward(value);

        let weights = attention_weights(q, k, mask)?;
        let output = dropout.forward(weights.clone()).matmul(v);

        Ok((output, weights))
    }
}

// ===== Multi-Head Attention =====

/// Multi-Head Attentionの出力
#[derive(Debug, Clone)]
pub struct MhaOutput<B: Backend> {
    /// 結合・出力射影後 [batch, q_len, d_model]
    pub context: Tensor<B, 3>,
    /// ヘッドごとの重み [batch, num_heads, q_len, k_len]
    pub weights: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    pub(crate) heads: Vec<AttentionHead<B>>,
    pub(crate) w_o: Linear<B>,
    dropout: Dropout,
    d_model: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// d_model は num_heads で割り切れること（TransformerConfig::validate で検査済み）
    pub fn new(d_model: usize, num_heads: usize, dropout_rate: f64, device: &B::Device) -> Self {
        let d_head = d_model / num_heads;
        let heads = (0..num_heads)
            .map(|_| AttentionHead::new(d_model, d_head, device))
            .collect();

        Self {
            heads,
            w_o: LinearConfig::new(d_model, d_model).init(device),
            dropout: DropoutConfig::new(dropout_rate).init(),
            d_model,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    /// query: [batch, q_len, d_model], key/value: [batch, k_len, d_model]
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        key: Tensor<B, 3>,
        value: Tensor<B, 3>,
        mask: Option<Tensor<B, 3, Bool>>,
    ) -> Result<MhaOutput<B>> {
        self.check_inputs(&query, &key, &value)?;

        // ヘッド間で状態を共有しない
        let mut head_outputs = Vec::with_capacity(self.heads.len());
        let mut head_weights = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            let (output, weights) = head.forward(
                query.clone(),
                key.clone(),
                value.clone(),
                mask.clone(),
                &self.dropout,
            )?;
            head_outputs.push(output);
            head_weights.push(weights);
        }

        let concat = concatenate_heads(head_outputs);

        Ok(MhaOutput {
            context: self.w_o.forward(concat),
            weights: Tensor::stack(head_weights, 1),
        })
    }

    fn check_inputs(&self, query: &Tensor<B, 3>, key: &Tensor<B, 3>, value: &Tensor<B, 3>) -> Result<()> {
        let q = query.dims();
        let k = key.dims();
        let v = value.dims();

        for (name, dims) in [("Q", q), ("K", k), ("V", v)] {
            if dims[2] != self.d_model {
                return Err(TransformerError::shape(
                    "multi_head_attention",
                    format!("{} の最終次元 {} が d_model={} と異なります", name, dims[2], self.d_model),
                ));
            }
        }
        if q[0] != k[0] || k[0] != v[0] {
            return Err(TransformerError::shape(
                "multi_head_attention",
                format!("バッチサイズが一致しません (Q={}, K={}, V={})", q[0], k[0], v[0]),
            ));
        }
        if k[1] != v[1] {
            return Err(TransformerError::shape(
                "multi_head_attention",
                format!("K と V の系列長が異なります ({} != {})", k[1], v[1]),
            ));
        }
        Ok(())
    }
}

/// Attentionヘッドを最終次元で連結
fn concatenate_heads<B: Backend>(heads: Vec<Tensor<B, 3>>) -> Tensor<B, 3> {
    Tensor::cat(heads, 2)
}
