use crate::error::TransformerError;
use burn::prelude::*;

// 小規模プリセットのハイパーパラメーター
pub const TINY_D_MODEL: usize = 64; // 埋め込み次元
pub const TINY_NUM_HEADS: usize = 4; // Multi-head Attentionのヘッド数
pub const TINY_D_FF: usize = TINY_D_MODEL * 4; // Feed-forward中間層の次元数
pub const TINY_NUM_LAYERS: usize = 4; // Encoder/Decoderのレイヤー数
pub const TINY_MAX_LEN: usize = 64; // 位置エンコーディング表の長さ

/// Transformerの構築時設定（構築後は変更しない）
#[derive(Config, Debug)]
pub struct TransformerConfig {
    /// ソース語彙サイズ
    pub vocab_size_src: usize,
    /// ターゲット語彙サイズ
    pub vocab_size_tgt: usize,
    #[config(default = 512)]
    pub d_model: usize,
    #[config(default = 8)]
    pub num_heads: usize,
    /// Encoder/Decoderそれぞれのレイヤー数
    #[config(default = 6)]
    pub num_layers: usize,
    #[config(default = 2048)]
    pub d_ff: usize,
    /// 位置エンコーディング表の長さ（これを超える系列はエラー）
    #[config(default = 512)]
    pub max_len: usize,
    /// 訓練時のみ有効（Autodiffバックエンドでのみ作用する）
    #[config(default = 0.1)]
    pub dropout_rate: f64,
    #[config(default = 0)]
    pub pad_id: usize,
    #[config(default = 1)]
    pub sos_id: usize,
    #[config(default = 2)]
    pub eos_id: usize,
    #[config(default = 1e-6)]
    pub layer_norm_eps: f64,
    /// ソース/ターゲットで埋め込み表を共有する（語彙サイズが同じ場合のみ）
    #[config(default = false)]
    pub share_embeddings: bool,
    /// 各レイヤー出力の NaN/Inf 検査（デバッグ用）
    #[config(default = false)]
    pub check_numerics: bool,
}

impl TransformerConfig {
    /// テスト・デモ用の小さな構成
    pub fn tiny(vocab_size_src: usize, vocab_size_tgt: usize) -> Self {
        Self::new(vocab_size_src, vocab_size_tgt)
            .with_d_model(TINY_D_MODEL)
            .with_num_heads(TINY_NUM_HEADS)
            .with_d_ff(TINY_D_FF)
            .with_num_layers(TINY_NUM_LAYERS)
            .with_max_len(TINY_MAX_LEN)
    }

    /// 各ヘッドの次元数 d_k = d_model / num_heads
    pub fn d_head(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// パラメータを確保する前に設定の整合性を検査する
    pub fn validate(&self) -> crate::error::Result<()> {
        let positive = [
            ("vocab_size_src", self.vocab_size_src),
            ("vocab_size_tgt", self.vocab_size_tgt),
            ("d_model", self.d_model),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers),
            ("d_ff", self.d_ff),
            ("max_len", self.max_len),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TransformerError::Configuration(format!(
                    "{} は1以上である必要があります",
                    name
                )));
            }
        }

        if self.d_model % self.num_heads != 0 {
            return Err(TransformerError::Configuration(format!(
                "d_model ({}) が num_heads ({}) で割り切れません",
                self.d_model, self.num_heads
            )));
        }

        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(TransformerError::Configuration(format!(
                "dropout_rate ({}) は [0, 1) の範囲で指定してください",
                self.dropout_rate
            )));
        }

        if !(self.layer_norm_eps > 0.0) {
            return Err(TransformerError::Configuration(format!(
                "layer_norm_eps ({}) は正の値である必要があります",
                self.layer_norm_eps
            )));
        }

        let special = [
            ("pad_id", self.pad_id),
            ("sos_id", self.sos_id),
            ("eos_id", self.eos_id),
        ];
        let smallest_vocab = self.vocab_size_src.min(self.vocab_size_tgt);
        for (name, id) in special {
            if id >= smallest_vocab {
                return Err(TransformerError::Configuration(format!(
                    "{} ({}) が語彙サイズ {} の範囲外です",
                    name, id, smallest_vocab
                )));
            }
        }

        if self.share_embeddings && self.vocab_size_src != self.vocab_size_tgt {
            return Err(TransformerError::Configuration(format!(
                "埋め込み共有には同じ語彙サイズが必要です (src={}, tgt={})",
                self.vocab_size_src, self.vocab_size_tgt
            )));
        }

        Ok(())
    }
}
