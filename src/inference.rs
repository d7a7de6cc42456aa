use crate::error::{Result, TransformerError};
use crate::mask::{decoder_self_mask, padding_mask};
use crate::model::Transformer;
use burn::prelude::*;

/// トークンID列 → [1, len] のテンソル
pub fn ids_tensor<B: Backend>(ids: &[i64], device: &B::Device) -> Tensor<B, 2, Int> {
    Tensor::<B, 1, Int>::from_data(TensorData::new(ids.to_vec(), [ids.len()]), device).reshape([1, ids.len()])
}

/// Intテンソル → 行ごとの Vec<i64>
pub fn tensor_to_rows<B: Backend>(ids: Tensor<B, 2, Int>) -> Result<Vec<Vec<i64>>> {
    let [_batch, len] = ids.dims();
    let flat: Vec<i64> = ids
        .into_data()
        .convert::<i64>()
        .to_vec()
        .map_err(|e| TransformerError::TensorData(format!("{:?}", e)))?;

    Ok(flat.chunks(len.max(1)).map(|row| row.to_vec()).collect())
}

/// 貪欲法による自己回帰生成
///
/// ソースを一度だけエンコードし、各ステップで最終位置のargmaxを追加する。
/// 全行が eos_id を出力するか、長さが max_new_tokens（および max_len）に
/// 達したら終了。終了済みの行には以後 eos_id を詰める。
///
/// 戻り値: [batch, generated_len]（先頭は sos_id）
pub fn greedy_decode<B: Backend>(
    model: &Transformer<B>,
    src_ids: Tensor<B, 2, Int>,
    sos_id: usize,
    eos_id: usize,
    max_new_tokens: usize,
) -> Result<Tensor<B, 2, Int>> {
    let [batch_size, _src_len] = src_ids.dims();
    let device = src_ids.device();

    let src_mask = padding_mask(&src_ids, model.pad_id());
    let memory = model.encoder().forward(src_ids, Some(src_mask.clone()))?.memory;

    let limit = (max_new_tokens + 1).min(model.max_len());
    let eos = eos_id as i64;

    let mut generated: Vec<Vec<i64>> = vec![vec![sos_id as i64]; batch_size];
    let mut finished = vec![false; batch_size];

    while generated[0].len() < limit && finished.iter().any(|done| !done) {
        let current_len = generated[0].len();
        let flat: Vec<i64> = generated.iter().flatten().copied().collect();
        let tgt_ids = Tensor::<B, 1, Int>::from_data(TensorData::new(flat, [batch_size * current_len]), &device)
            .reshape([batch_size, current_len]);

        let tgt_mask = decoder_self_mask(&tgt_ids, model.pad_id())?;
        let logits = model
            .decode(tgt_ids, memory.clone(), Some(tgt_mask), Some(src_mask.clone()))?
            .logits;

        let [_, _, vocab_size] = logits.dims();
        let last_logits = logits
            .slice([0..batch_size, current_len - 1..current_len, 0..vocab_size])
            .reshape([batch_size, vocab_size]);
        let predicted = tensor_to_rows(last_logits.argmax(1))?;

        for (row, prediction) in predicted.iter().enumerate() {
            let next = if finished[row] { eos } else { prediction[0] };
            generated[row].push(next);
            if next == eos {
                finished[row] = true;
            }
        }

        log::debug!("生成ステップ {}: 終了済み {}/{}", current_len, finished.iter().filter(|d| **d).count(), batch_size);
    }

    let len = generated[0].len();
    let flat: Vec<i64> = generated.into_iter().flatten().collect();
    Ok(Tensor::<B, 1, Int>::from_data(TensorData::new(flat, [batch_size * len]), &device).reshape([batch_size, len]))
}
