use crate::error::{Result, TransformerError};
use burn::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// これより長い系列はCSV出力しない
pub const MAX_EXPORT_LEN: usize = 20;

/// Attention行列をCSVファイルにエクスポート
///
/// weights: [batch, heads, q_len, k_len]（自己注意なら q_len == k_len）
/// save_dir: 保存先ディレクトリ（その下の exports/ に書き出す）
/// layer_name: ファイル名の接頭辞（例: "encoder_layer0", "cross_layer1"）
///
/// 書き出したファイルのパスを返す。系列が長すぎる場合は空。
pub fn export_attention_to_csv<B: Backend>(
    weights: &Tensor<B, 4>,
    save_dir: &Path,
    layer_name: &str,
) -> Result<Vec<PathBuf>> {
    let [batch_size, num_heads, q_len, k_len] = weights.dims();

    if q_len > MAX_EXPORT_LEN || k_len > MAX_EXPORT_LEN {
        log::warn!(
            "{}: 系列長 {}x{} が長いためCSV出力をスキップします（上限 {}）",
            layer_name,
            q_len,
            k_len,
            MAX_EXPORT_LEN
        );
        return Ok(Vec::new());
    }

    let exports_dir = save_dir.join("exports");
    fs::create_dir_all(&exports_dir)?;

    let values: Vec<f32> = weights
        .to_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| TransformerError::TensorData(format!("{:?}", e)))?;

    let mut written = Vec::with_capacity(batch_size * num_heads);
    for batch_idx in 0..batch_size {
        for head_idx in 0..num_heads {
            let offset = (batch_idx * num_heads + head_idx) * q_len * k_len;
            let matrix = &values[offset..offset + q_len * k_len];

            let filepath = exports_dir.join(format!("{}_batch{}_head{}.csv", layer_name, batch_idx, head_idx));
            fs::write(&filepath, matrix_to_csv(matrix, q_len, k_len))?;
            log::debug!("Attention行列を出力: {}", filepath.display());
            written.push(filepath);
        }
    }

    log::info!("{}: {} 個のCSVを出力", layer_name, written.len());
    Ok(written)
}

fn matrix_to_csv(matrix: &[f32], rows: usize, cols: usize) -> String {
    let mut csv = String::from("query\\key");
    for key_idx in 0..cols {
        csv.push_str(&format!(",{}", key_idx));
    }
    csv.push('\n');

    for (query_idx, row) in matrix.chunks(cols).take(rows).enumerate() {
        csv.push_str(&query_idx.to_string());
        for value in row {
            csv.push_str(&format!(",{:.6}", value));
        }
        csv.push('\n');
    }

    csv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_to_csv_layout() {
        let csv = matrix_to_csv(&[0.25, 0.75, 1.0, 0.0], 2, 2);
        assert_eq!(csv, "query\\key,0,1\n0,0.250000,0.750000\n1,1.000000,0.000000\n");
    }

    #[test]
    fn test_rectangular_matrix() {
        let csv = matrix_to_csv(&[0.5, 0.5, 0.0], 1, 3);
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.starts_with("query\\key,0,1,2\n"));
    }
}
