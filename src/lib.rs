#![recursion_limit = "256"]

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod error;
pub mod export;
pub mod feed_forward;
pub mod inference;
pub mod layers;
pub mod mask;
pub mod model;
pub mod params;
pub mod positional_encoding;
pub mod sublayer;

pub use config::TransformerConfig;
pub use error::{Result, TransformerError};
pub use model::{Transformer, TransformerOutput};
pub use params::{NamedParameter, NamedParameters, ParameterStore};

use burn::backend::{Autodiff, NdArray};

/// 推論用バックエンド（CPU）
pub type InferenceBackend = NdArray;

/// 学習用バックエンド（Dropoutが有効になる）
pub type TrainingBackend = Autodiff<NdArray>;
