use attention_transformer::checkpoint::{load_checkpoint, save_checkpoint};
use attention_transformer::export::export_attention_to_csv;
use attention_transformer::inference::{greedy_decode, ids_tensor, tensor_to_rows};
use attention_transformer::{InferenceBackend, Transformer, TransformerConfig};

use burn::prelude::*;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

/// Encoder-Decoder Transformer（Attention Is All You Need）
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// モデル設定のJSONファイル（省略時は小型プリセット）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 小型プリセットのソース語彙サイズ
    #[arg(long, default_value_t = 32)]
    src_vocab: usize,

    /// 小型プリセットのターゲット語彙サイズ
    #[arg(long, default_value_t = 32)]
    tgt_vocab: usize,

    /// モデルを読み込むディレクトリ（--config より優先）
    #[arg(long)]
    load: Option<PathBuf>,

    /// モデルを保存するディレクトリ
    #[arg(long)]
    save: Option<PathBuf>,

    /// 名前付きパラメータの一覧を表示
    #[arg(long)]
    list_params: bool,

    /// ソースのトークンID（空白区切り）
    #[arg(long)]
    src: Option<String>,

    /// ターゲットのトークンID（空白区切り、指定時はフォワードを実行）
    #[arg(long)]
    tgt: Option<String>,

    /// 貪欲法で生成する
    #[arg(long)]
    generate: bool,

    /// 生成する最大トークン数
    #[arg(long, default_value_t = 20)]
    max_new_tokens: usize,

    /// Attention行列をCSVエクスポートするディレクトリ（フォワード時のみ）
    #[arg(long)]
    export_attn: Option<PathBuf>,

    /// バックエンドの選択（ndarray, wgpu）
    #[arg(long, default_value = "ndarray")]
    backend: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let start_time = Instant::now();
    let args = Args::parse();

    match args.backend.as_str() {
        "ndarray" => run::<InferenceBackend>(&args, &Default::default())?,
        #[cfg(feature = "wgpu")]
        "wgpu" => {
            use burn::backend::wgpu::{Wgpu, WgpuDevice};
            run::<Wgpu>(&args, &WgpuDevice::default())?
        }
        other => return Err(format!("未対応のバックエンド: {}", other).into()),
    }

    log::info!("処理時間: {:.2}秒", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn run<B: Backend>(args: &Args, device: &B::Device) -> Result<(), Box<dyn std::error::Error>> {
    // モデルの初期化または読み込み
    let (model, config) = if let Some(load_dir) = &args.load {
        load_checkpoint::<B>(load_dir, device)?
    } else {
        let config = match &args.config {
            Some(path) => TransformerConfig::load(path).map_err(|e| format!("設定読み込みエラー: {:?}", e))?,
            None => TransformerConfig::tiny(args.src_vocab, args.tgt_vocab),
        };
        (config.init::<B>(device)?, config)
    };

    if args.list_params {
        for param in model.named_parameters() {
            println!("{}\t{:?}", param.name, param.shape());
        }
    }

    if let Some(src) = &args.src {
        let src_ids = ids_tensor::<B>(&parse_ids(src)?, device);

        if let Some(tgt) = &args.tgt {
            let tgt_ids = ids_tensor::<B>(&parse_ids(tgt)?, device);
            run_forward(&model, src_ids.clone(), tgt_ids, args.export_attn.as_ref())?;
        }

        if args.generate {
            let generated = greedy_decode(&model, src_ids, config.sos_id, config.eos_id, args.max_new_tokens)?;
            for row in tensor_to_rows(generated)? {
                let text: Vec<String> = row.iter().map(|id| id.to_string()).collect();
                println!("生成: {}", text.join(" "));
            }
        }
    }

    if let Some(save_dir) = &args.save {
        save_checkpoint(&model, &config, save_dir)?;
    }

    Ok(())
}

fn run_forward<B: Backend>(
    model: &Transformer<B>,
    src_ids: Tensor<B, 2, Int>,
    tgt_ids: Tensor<B, 2, Int>,
    export_dir: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = model.forward_with_attention(src_ids, tgt_ids)?;
    let [_, tgt_len, vocab_size] = output.logits.dims();

    // 各位置の最大ロジットのトークン
    let predicted = tensor_to_rows(output.logits.argmax(2).reshape([1, tgt_len]))?;
    println!("ロジット: [1, {}, {}]", tgt_len, vocab_size);
    println!("各位置のargmax: {:?}", predicted[0]);

    if let Some(dir) = export_dir {
        let groups = [
            ("encoder_layer", &output.encoder_self_attention),
            ("decoder_layer", &output.decoder_self_attention),
            ("cross_layer", &output.cross_attention),
        ];
        for (prefix, weights) in groups {
            for (index, layer_weights) in weights.iter().enumerate() {
                export_attention_to_csv(layer_weights, dir, &format!("{}{}", prefix, index))?;
            }
        }
    }

    Ok(())
}

fn parse_ids(text: &str) -> Result<Vec<i64>, std::num::ParseIntError> {
    text.split_whitespace().map(str::parse).collect()
}
