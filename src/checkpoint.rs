use crate::config::TransformerConfig;
use crate::error::{Result, TransformerError};
use crate::model::Transformer;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MODEL_FILE: &str = "model";
pub const CONFIG_FILE: &str = "config.json";
pub const MANIFEST_FILE: &str = "parameters.json";

/// パラメータ1個分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub name: String,
    pub shape: Vec<usize>,
}

/// parameters.json の内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterManifest {
    pub crate_version: String,
    /// RFC 3339
    pub saved_at: String,
    pub total_parameters: usize,
    pub parameters: Vec<ParameterEntry>,
}

impl ParameterManifest {
    pub fn from_model<B: Backend>(model: &Transformer<B>) -> Self {
        let parameters: Vec<ParameterEntry> = model
            .named_parameters()
            .into_iter()
            .map(|p| ParameterEntry {
                shape: p.shape().to_vec(),
                name: p.name,
            })
            .collect();

        let total_parameters = parameters
            .iter()
            .map(|p| p.shape.iter().product::<usize>())
            .sum();

        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            saved_at: chrono::Local::now().to_rfc3339(),
            total_parameters,
            parameters,
        }
    }
}

/// モデルを保存（model.bin, config.json, parameters.json）
pub fn save_checkpoint<B: Backend>(
    model: &Transformer<B>,
    config: &TransformerConfig,
    save_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(save_dir.join(MODEL_FILE), &recorder)
        .map_err(|e| TransformerError::Checkpoint(format!("モデル保存エラー: {:?}", e)))?;

    config.save(save_dir.join(CONFIG_FILE))?;

    let manifest = ParameterManifest::from_model(model);
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(save_dir.join(MANIFEST_FILE), json)?;

    log::info!(
        "モデルを保存: {} (パラメータ数: {})",
        save_dir.display(),
        manifest.total_parameters
    );
    Ok(())
}

/// config.json からモデルを組み立て、model.bin の重みを読み込む
pub fn load_checkpoint<B: Backend>(
    load_dir: &Path,
    device: &B::Device,
) -> Result<(Transformer<B>, TransformerConfig)> {
    let config = TransformerConfig::load(load_dir.join(CONFIG_FILE))
        .map_err(|e| TransformerError::Checkpoint(format!("設定読み込みエラー: {:?}", e)))?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = config
        .init::<B>(device)?
        .load_file(load_dir.join(MODEL_FILE), &recorder, device)
        .map_err(|e| TransformerError::Checkpoint(format!("モデル読み込みエラー: {:?}", e)))?;

    let manifest_path = load_dir.join(MANIFEST_FILE);
    if manifest_path.exists() {
        let manifest: ParameterManifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
        verify_manifest(&model, &manifest)?;
    } else {
        log::warn!("{} がありません。形状の照合をスキップします", manifest_path.display());
    }

    log::info!("モデルを読み込み: {}", load_dir.display());
    Ok((model, config))
}

/// 読み込んだモデルのパラメータ名と形状が記録と一致するか検査
pub fn verify_manifest<B: Backend>(model: &Transformer<B>, manifest: &ParameterManifest) -> Result<()> {
    let actual = ParameterManifest::from_model(model).parameters;

    if actual.len() != manifest.parameters.len() {
        return Err(TransformerError::Checkpoint(format!(
            "パラメータ数が一致しません: 記録 {}, モデル {}",
            manifest.parameters.len(),
            actual.len()
        )));
    }

    for (expected, found) in manifest.parameters.iter().zip(&actual) {
        if expected != found {
            return Err(TransformerError::Checkpoint(format!(
                "パラメータが一致しません: 記録 {} {:?}, モデル {} {:?}",
                expected.name, expected.shape, found.name, found.shape
            )));
        }
    }

    Ok(())
}
