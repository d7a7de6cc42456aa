use crate::error::{Result, TransformerError};
use burn::prelude::*;

/// 正弦波位置エンコーディング表 [max_len, d_model]
///
/// 構築時に一度だけ計算し、以後は変更しない。Encoder/Decoderは
/// `Arc` で同じ表を共有する。
///
/// PE(pos, 2i)   = sin(pos / 10000^(2i / d_model))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i / d_model))
#[derive(Debug, Clone, PartialEq)]
pub struct PositionalEncoding {
    max_len: usize,
    d_model: usize,
    table: Vec<f32>,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, d_model: usize) -> Self {
        let mut table = Vec::with_capacity(max_len * d_model);

        for pos in 0..max_len {
            for i in 0..d_model {
                table.push(Self::value(pos, i, d_model));
            }
        }

        Self {
            max_len,
            d_model,
            table,
        }
    }

    /// (position, dimension, d_model) だけで決まる値
    pub fn value(pos: usize, i: usize, d_model: usize) -> f32 {
        // 偶数次元とその次の奇数次元は同じ周波数を使う
        let pair = (i - i % 2) as f64;
        let angle = pos as f64 / 10000_f64.powf(pair / d_model as f64);
        if i % 2 == 0 {
            angle.sin() as f32
        } else {
            angle.cos() as f32
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// 表全体（行優先）
    pub fn table(&self) -> &[f32] {
        &self.table
    }

    /// より長い表を新しく作る（既存の表は変更しない）
    pub fn extended(&self, max_len: usize) -> Self {
        Self::new(max_len.max(self.max_len), self.d_model)
    }

    /// 先頭 seq_len 行を [1, seq_len, d_model] のテンソルとして返す
    pub fn slice<B: Backend>(&self, seq_len: usize, device: &B::Device) -> Result<Tensor<B, 3>> {
        if seq_len > self.max_len {
            return Err(TransformerError::Configuration(format!(
                "系列長 {} が位置エンコーディング表の長さ max_len={} を超えています",
                seq_len, self.max_len
            )));
        }

        let rows = &self.table[..seq_len * self.d_model];
        Ok(Tensor::<B, 1>::from_floats(rows, device)
            .reshape([seq_len, self.d_model])
            .unsqueeze::<3>())
    }

    /// 埋め込み x [batch, seq_len, d_model] に位置エンコーディングを加算
    pub fn apply<B: Backend>(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_batch, seq_len, d_model] = x.dims();
        if d_model != self.d_model {
            return Err(TransformerError::shape(
                "positional_encoding",
                format!("入力の d_model={} が表の d_model={} と異なります", d_model, self.d_model),
            ));
        }

        let encoding = self.slice::<B>(seq_len, &x.device())?;
        Ok(x + encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_row_is_sin_zero_cos_zero() {
        let pe = PositionalEncoding::new(4, 6);
        assert_eq!(&pe.table()[..6], &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_known_values() {
        // pos=1, i=0: sin(1)
        assert!((PositionalEncoding::value(1, 0, 4) - 1f32.sin()).abs() < 1e-6);
        // pos=1, i=3: cos(1 / 10000^(2/4)) = cos(0.01)
        assert!((PositionalEncoding::value(1, 3, 4) - 0.01f32.cos()).abs() < 1e-6);
        // pos=2, i=2: sin(2 / 100)
        assert!((PositionalEncoding::value(2, 2, 4) - 0.02f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_recomputation_is_bit_identical() {
        let a = PositionalEncoding::new(50, 16);
        let b = PositionalEncoding::new(50, 16);
        let a_bits: Vec<u32> = a.table().iter().map(|v| v.to_bits()).collect();
        let b_bits: Vec<u32> = b.table().iter().map(|v| v.to_bits()).collect();
        assert_eq!(a_bits, b_bits);
    }

    #[test]
    fn test_extended_keeps_prefix() {
        let short = PositionalEncoding::new(5, 8);
        let long = short.extended(9);
        assert_eq!(long.max_len(), 9);
        assert_eq!(&long.table()[..5 * 8], short.table());
    }
}
