use attention_transformer::export::export_attention_to_csv;
use attention_transformer::inference::{greedy_decode, ids_tensor, tensor_to_rows};
use attention_transformer::{InferenceBackend, TransformerConfig};
use burn::prelude::*;
use std::fs;

type TestBackend = InferenceBackend;

fn small_config() -> TransformerConfig {
    TransformerConfig::new(10, 12)
        .with_d_model(8)
        .with_num_heads(2)
        .with_d_ff(16)
        .with_num_layers(1)
        .with_max_len(6)
        .with_dropout_rate(0.0)
}

#[test]
fn test_greedy_decode_starts_with_sos_and_respects_limits() {
    let device = Default::default();
    let config = small_config();
    let model = config.init::<TestBackend>(&device).unwrap();

    let src = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![1i64, 4, 5, 3, 6, 0], [6]), &device)
        .reshape([2, 3]);

    let generated = greedy_decode(&model, src, config.sos_id, config.eos_id, 3).unwrap();
    let [batch, len] = generated.dims();
    assert_eq!(batch, 2);
    assert!((2..=4).contains(&len), "生成長 {}", len);

    for row in tensor_to_rows(generated).unwrap() {
        assert_eq!(row[0], config.sos_id as i64);
        assert!(row.iter().all(|id| (0..12).contains(id)));
        // eos の後は eos のみ
        if let Some(position) = row.iter().position(|id| *id == config.eos_id as i64) {
            assert!(row[position..].iter().all(|id| *id == config.eos_id as i64));
        }
    }

    // max_len を超えて生成しない
    let src = ids_tensor::<TestBackend>(&[1, 4, 5], &device);
    let generated = greedy_decode(&model, src, config.sos_id, config.eos_id, 100).unwrap();
    assert!(generated.dims()[1] <= config.max_len);
}

#[test]
fn test_greedy_decode_is_deterministic() {
    let device = Default::default();
    let config = small_config();
    let model = config.init::<TestBackend>(&device).unwrap();

    let first = greedy_decode(&model, ids_tensor::<TestBackend>(&[1, 7, 2], &device), 1, 2, 4).unwrap();
    let second = greedy_decode(&model, ids_tensor::<TestBackend>(&[1, 7, 2], &device), 1, 2, 4).unwrap();
    assert_eq!(tensor_to_rows(first).unwrap(), tensor_to_rows(second).unwrap());
}

#[test]
fn test_export_attention_writes_one_file_per_head() {
    let device = Default::default();
    let model = small_config().init::<TestBackend>(&device).unwrap();
    let output = model
        .forward_with_attention(
            ids_tensor::<TestBackend>(&[1, 4, 5, 0], &device),
            ids_tensor::<TestBackend>(&[1, 3], &device),
        )
        .unwrap();

    let save_dir = std::env::temp_dir().join(format!("attention_transformer_export_{}", std::process::id()));
    let written = export_attention_to_csv(&output.cross_attention[0], &save_dir, "cross_layer0").unwrap();
    assert_eq!(written.len(), 2);

    let content = fs::read_to_string(&written[0]).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "query\\key,0,1,2,3");
    assert_eq!(lines.len(), 3);
    // パディング列
    assert!(lines[1].ends_with(",0.000000"));

    fs::remove_dir_all(&save_dir).ok();
}

#[test]
fn test_export_skips_long_sequences() {
    let device = Default::default();
    let weights = Tensor::<TestBackend, 4>::zeros([1, 1, 21, 21], &device);
    let save_dir = std::env::temp_dir().join(format!("attention_transformer_skip_{}", std::process::id()));

    let written = export_attention_to_csv(&weights, &save_dir, "long").unwrap();
    assert!(written.is_empty());
    assert!(!save_dir.join("exports").exists());
}
