//! Transformer本体のエラー型
//!
//! 形状・設定・トークンIDの検査はすべて各コンポーネントの入口で行い、
//! 呼び出し元にそのまま返す（リトライや暗黙の補正はしない）。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformerError {
    /// テンソルの次元が合成先のコンポーネントと合わない
    #[error("形状の不一致 ({context}): {detail}")]
    ShapeMismatch {
        context: &'static str,
        detail: String,
    },

    /// ハイパーパラメータの矛盾、または max_len を超える系列長
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// 語彙範囲外のトークンID
    #[error("トークンID {id} は語彙範囲 [0, {vocab_size}) の外です ({context})")]
    TokenIndex {
        context: &'static str,
        id: i64,
        vocab_size: usize,
    },

    /// 中間活性値に NaN/Inf を検出（check_numerics 有効時のみ）
    #[error("数値不安定: {0} で NaN/Inf を検出しました")]
    NumericalInstability(String),

    #[error("パラメータが見つかりません: {0}")]
    MissingParameter(String),

    #[error("テンソルデータの読み出しに失敗: {0}")]
    TensorData(String),

    #[error("チェックポイントエラー: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransformerError>;

impl TransformerError {
    pub(crate) fn shape(context: &'static str, detail: impl Into<String>) -> Self {
        TransformerError::ShapeMismatch {
            context,
            detail: detail.into(),
        }
    }
}
