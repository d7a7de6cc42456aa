//! Attentionマスク
//!
//! マスクは `Tensor<B, 3, Bool>` で `[batch|1, query_len|1, key_len]` の形を持ち、
//! `true` が「参照禁止」のキー位置を表す。Multi-Head Attentionで全ヘッドに
//! 同じマスクがブロードキャストされる。

use crate::error::{Result, TransformerError};
use burn::prelude::*;

/// パディングマスク [batch, 1, key_len]（id == pad_id の位置が true）
pub fn padding_mask<B: Backend>(ids: &Tensor<B, 2, Int>, pad_id: usize) -> Tensor<B, 3, Bool> {
    ids.clone().equal_elem(pad_id as i64).unsqueeze_dim::<3>(1)
}

/// 因果マスク [1, len, len]（key > query の位置が true、上三角・対角除く）
pub fn causal_mask<B: Backend>(len: usize, device: &B::Device) -> Tensor<B, 3, Bool> {
    let mut data = Vec::with_capacity(len * len);
    for query in 0..len {
        for key in 0..len {
            data.push(key > query);
        }
    }

    Tensor::<B, 2, Bool>::from_data(TensorData::new(data, [len, len]), device).unsqueeze::<3>()
}

/// 2つのマスクを合成する（どちらかで禁止なら禁止 = 許可同士のAND）
///
/// 各次元は等しいか、どちらかが1でなければならない。
pub fn combine_masks<B: Backend>(
    a: Tensor<B, 3, Bool>,
    b: Tensor<B, 3, Bool>,
) -> Result<Tensor<B, 3, Bool>> {
    let a_dims = a.dims();
    let b_dims = b.dims();
    for axis in 0..3 {
        let (x, y) = (a_dims[axis], b_dims[axis]);
        if x != y && x != 1 && y != 1 {
            return Err(TransformerError::shape(
                "combine_masks",
                format!("{:?} と {:?} はブロードキャストできません", a_dims, b_dims),
            ));
        }
    }

    Ok((a.int() + b.int()).greater_elem(0))
}

/// Decoderの自己注意用マスク: 因果マスク ∧ ターゲットのパディングマスク
pub fn decoder_self_mask<B: Backend>(
    tgt_ids: &Tensor<B, 2, Int>,
    pad_id: usize,
) -> Result<Tensor<B, 3, Bool>> {
    let [_batch, tgt_len] = tgt_ids.dims();
    let causal = causal_mask::<B>(tgt_len, &tgt_ids.device());
    combine_masks(causal, padding_mask(tgt_ids, pad_id))
}

/// マスクがスコア形状 `score_dims` にブロードキャスト可能か検査し、展開する
pub(crate) fn broadcast_mask<B: Backend, const D: usize>(
    mask: Tensor<B, D, Bool>,
    score_dims: [usize; D],
) -> Result<Tensor<B, D, Bool>> {
    let mask_dims = mask.dims();
    if mask_dims == score_dims {
        return Ok(mask);
    }

    let compatible = mask_dims
        .iter()
        .zip(score_dims.iter())
        .all(|(&m, &s)| m == s || m == 1);
    if !compatible {
        return Err(TransformerError::shape(
            "attention_mask",
            format!(
                "マスク {:?} をスコア {:?} にブロードキャストできません",
                mask_dims, score_dims
            ),
        ));
    }

    Ok(mask.expand(Shape::from(score_dims)))
}
