use attention_transformer::inference::ids_tensor;
use attention_transformer::{InferenceBackend, TrainingBackend, Transformer, TransformerConfig, TransformerError};
use burn::prelude::*;
use std::collections::HashSet;

type TestBackend = InferenceBackend;

fn small_config() -> TransformerConfig {
    TransformerConfig::new(11, 13)
        .with_d_model(8)
        .with_num_heads(2)
        .with_d_ff(16)
        .with_num_layers(2)
        .with_max_len(16)
        .with_dropout_rate(0.0)
}

fn build(config: &TransformerConfig) -> Transformer<TestBackend> {
    config.init::<TestBackend>(&Default::default()).unwrap()
}

fn ids(values: &[i64]) -> Tensor<TestBackend, 2, Int> {
    ids_tensor::<TestBackend>(values, &Default::default())
}

fn batch_ids(rows: &[&[i64]]) -> Tensor<TestBackend, 2, Int> {
    let len = rows[0].len();
    let flat: Vec<i64> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(flat, [rows.len() * len]), &Default::default())
        .reshape([rows.len(), len])
}

fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec().unwrap()
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[test]
fn test_invalid_configurations_are_rejected() {
    let device = Default::default();
    let cases = [
        small_config().with_num_heads(3),
        small_config().with_dropout_rate(1.0),
        small_config().with_d_model(0),
        small_config().with_pad_id(11),
        small_config().with_share_embeddings(true),
        small_config().with_layer_norm_eps(0.0),
    ];

    for config in cases {
        let result = config.init::<TestBackend>(&device);
        assert!(
            matches!(result, Err(TransformerError::Configuration(_))),
            "受理されてはいけない設定: {:?}",
            config
        );
    }
}

#[test]
fn test_logits_shape() {
    let model = build(&small_config());

    let logits = model
        .forward(batch_ids(&[&[1, 5, 6, 2], &[1, 7, 2, 0]]), batch_ids(&[&[1, 3, 4], &[1, 9, 0]]))
        .unwrap();
    assert_eq!(logits.dims(), [2, 3, 13]);
}

#[test]
fn test_sequence_longer_than_max_len_fails() {
    let model = build(&small_config());
    let long: Vec<i64> = (0..17).map(|i| 1 + i % 10).collect();

    let err = model.forward(ids(&long), ids(&[1, 2])).unwrap_err();
    assert!(matches!(err, TransformerError::Configuration(_)));

    let err = model.forward(ids(&[1, 2]), ids(&long)).unwrap_err();
    assert!(matches!(err, TransformerError::Configuration(_)));
}

#[test]
fn test_token_out_of_range_fails() {
    let model = build(&small_config());

    let err = model.forward(ids(&[1, 11]), ids(&[1, 2])).unwrap_err();
    assert!(matches!(err, TransformerError::TokenIndex { id: 11, vocab_size: 11, .. }));

    let err = model.forward(ids(&[1, 2]), ids(&[1, 13])).unwrap_err();
    assert!(matches!(err, TransformerError::TokenIndex { id: 13, vocab_size: 13, .. }));

    let err = model.forward(ids(&[-1, 2]), ids(&[1, 2])).unwrap_err();
    assert!(matches!(err, TransformerError::TokenIndex { id: -1, .. }));
}

#[test]
fn test_batch_size_mismatch_fails() {
    let model = build(&small_config());

    let err = model
        .forward(batch_ids(&[&[1, 2], &[3, 4]]), ids(&[1, 2]))
        .unwrap_err();
    assert!(matches!(err, TransformerError::ShapeMismatch { .. }));
}

#[test]
fn test_batch_elements_are_independent() {
    let model = build(&small_config());
    let src_rows: [&[i64]; 2] = [&[1, 5, 6, 2], &[1, 7, 8, 9]];
    let tgt_rows: [&[i64]; 2] = [&[1, 3, 4], &[1, 10, 12]];

    let batched = to_vec(model.forward(batch_ids(&src_rows), batch_ids(&tgt_rows)).unwrap());
    let row_len = 3 * 13;

    for (index, (src, tgt)) in src_rows.iter().zip(tgt_rows.iter()).enumerate() {
        let single = to_vec(model.forward(ids(src), ids(tgt)).unwrap());
        let diff = max_abs_diff(&single, &batched[index * row_len..(index + 1) * row_len]);
        assert!(diff < 1e-5, "バッチ {} の出力が単独実行と異なります (差 {})", index, diff);
    }
}

#[test]
fn test_inference_is_deterministic() {
    let model = build(&small_config().with_dropout_rate(0.3));

    let first = to_vec(model.forward(ids(&[1, 5, 2]), ids(&[1, 3])).unwrap());
    let second = to_vec(model.forward(ids(&[1, 5, 2]), ids(&[1, 3])).unwrap());
    assert_eq!(first, second);
}

#[test]
fn test_padding_keys_receive_zero_weight() {
    let model = build(&small_config());

    let output = model
        .forward_with_attention(ids(&[1, 5, 6, 0, 0]), ids(&[1, 3, 4]))
        .unwrap();

    assert_eq!(output.encoder_self_attention.len(), 2);
    assert_eq!(output.cross_attention.len(), 2);

    let weights = output
        .encoder_self_attention
        .into_iter()
        .chain(output.cross_attention);
    for layer_weights in weights {
        let [_, heads, _, k_len] = layer_weights.dims();
        assert_eq!(heads, 2);
        for row in to_vec(layer_weights).chunks(k_len) {
            assert_eq!(row[3], 0.0);
            assert_eq!(row[4], 0.0);
        }
    }
}

#[test]
fn test_decoder_self_attention_is_lower_triangular() {
    let model = build(&small_config());

    let output = model
        .forward_with_attention(ids(&[1, 5, 6, 2]), ids(&[1, 3, 4, 7]))
        .unwrap();

    for layer_weights in output.decoder_self_attention {
        assert_eq!(layer_weights.dims(), [1, 2, 4, 4]);
        for matrix in to_vec(layer_weights).chunks(16) {
            for query in 0..4 {
                for key in (query + 1)..4 {
                    assert_eq!(matrix[query * 4 + key], 0.0);
                }
            }
        }
    }
}

#[test]
fn test_left_padded_target_keeps_causal_zeros() {
    let model = build(&small_config());

    let output = model
        .forward_with_attention(ids(&[1, 5, 6, 2]), ids(&[0, 3, 4, 7]))
        .unwrap();
    assert!(to_vec(output.logits).iter().all(|v| v.is_finite()));

    for layer_weights in output.decoder_self_attention {
        for matrix in to_vec(layer_weights).chunks(16) {
            // 先頭はパディングで参照可能なキーがないため行全体が 0
            assert_eq!(&matrix[..4], &[0.0, 0.0, 0.0, 0.0]);
            for query in 1..4 {
                assert_eq!(matrix[query * 4], 0.0);
                for key in (query + 1)..4 {
                    assert_eq!(matrix[query * 4 + key], 0.0);
                }
            }
        }
    }
}

#[test]
fn test_future_tokens_do_not_change_earlier_logits() {
    let model = build(&small_config());
    let src = ids(&[1, 5, 6, 2]);

    let short = to_vec(model.forward(src.clone(), ids(&[1, 3])).unwrap());
    let long = to_vec(model.forward(src, ids(&[1, 3, 9, 4])).unwrap());

    assert!(max_abs_diff(&short, &long[..short.len()]) < 1e-5);
}

#[test]
fn test_dropout_only_active_on_training_backend() {
    let device = Default::default();
    let config = small_config().with_dropout_rate(0.5);
    let model = config.init::<TrainingBackend>(&device).unwrap();

    let src = ids_tensor::<TrainingBackend>(&[1, 5, 6, 2], &device);
    let tgt = ids_tensor::<TrainingBackend>(&[1, 3, 4], &device);

    let first = to_vec(model.forward(src.clone(), tgt.clone()).unwrap());
    let second = to_vec(model.forward(src, tgt).unwrap());
    assert!(max_abs_diff(&first, &second) > 0.0);

    let no_dropout = small_config().init::<TrainingBackend>(&device).unwrap();
    let src = ids_tensor::<TrainingBackend>(&[1, 5, 6, 2], &device);
    let tgt = ids_tensor::<TrainingBackend>(&[1, 3, 4], &device);
    let first = to_vec(no_dropout.forward(src.clone(), tgt.clone()).unwrap());
    let second = to_vec(no_dropout.forward(src, tgt).unwrap());
    assert_eq!(first, second);
}

#[test]
fn test_named_parameters_cover_every_weight() {
    let model = build(&small_config());
    let params = model.named_parameters();

    let total: usize = params.iter().map(|p| p.num_elements()).sum();
    assert_eq!(total, 3317);
    assert_eq!(total, model.num_params());

    let names: HashSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names.len(), params.len(), "名前が重複しています");

    for expected in [
        "encoder.embedding.weight",
        "encoder.layers.0.self_attention.heads.0.w_q.weight",
        "encoder.layers.1.feed_forward_sublayer.norm.gamma",
        "decoder.embedding.weight",
        "decoder.layers.1.cross_attention.w_o.bias",
        "decoder.output_projection.weight",
    ] {
        assert!(names.contains(expected), "{} がありません", expected);
    }

    let w_q = params
        .iter()
        .find(|p| p.name == "encoder.layers.0.self_attention.heads.1.w_q.weight")
        .unwrap();
    assert_eq!(w_q.shape(), &[8, 4]);
}

#[test]
fn test_named_parameters_restore_another_model() {
    let config = small_config();
    let source = build(&config);
    let target = build(&config);
    let src = ids(&[1, 5, 6, 2]);
    let tgt = ids(&[1, 3, 4]);

    let expected = to_vec(source.forward(src.clone(), tgt.clone()).unwrap());
    let restored = target
        .load_named_parameters(source.named_parameters(), &Default::default())
        .unwrap();

    assert!(max_abs_diff(&expected, &to_vec(restored.forward(src, tgt).unwrap())) < 1e-6);
}

#[test]
fn test_failed_restore_leaves_model_untouched() {
    let config = small_config();
    let source = build(&config);
    let target = build(&config);
    let src = ids(&[1, 5, 6, 2]);
    let tgt = ids(&[1, 3, 4]);
    let before = to_vec(target.forward(src.clone(), tgt.clone()).unwrap());

    let missing: Vec<_> = source
        .named_parameters()
        .into_iter()
        .filter(|p| p.name != "decoder.output_projection.bias")
        .collect();
    let err = target.load_named_parameters(missing, &Default::default()).unwrap_err();
    assert!(matches!(err, TransformerError::MissingParameter(ref name) if name == "decoder.output_projection.bias"));

    let mut wrong_shape = source.named_parameters();
    let entry = wrong_shape
        .iter_mut()
        .find(|p| p.name == "encoder.embedding.weight")
        .unwrap();
    entry.data = TensorData::new(vec![0.0f32; 8 * 12], [12, 8]);
    let err = target.load_named_parameters(wrong_shape, &Default::default()).unwrap_err();
    assert!(matches!(err, TransformerError::ShapeMismatch { .. }));

    let after = to_vec(target.forward(src, tgt).unwrap());
    assert_eq!(before, after);
}

#[test]
fn test_shared_embeddings() {
    let config = TransformerConfig::new(12, 12)
        .with_d_model(8)
        .with_num_heads(2)
        .with_d_ff(16)
        .with_num_layers(1)
        .with_max_len(16)
        .with_dropout_rate(0.0)
        .with_share_embeddings(true);
    let model = build(&config);

    let names: Vec<String> = model.named_parameters().into_iter().map(|p| p.name).collect();
    assert!(names.iter().any(|n| n == "encoder.embedding.weight"));
    assert!(!names.iter().any(|n| n.starts_with("decoder.embedding")));

    let logits = model.forward(ids(&[1, 5, 11]), ids(&[1, 11, 3])).unwrap();
    assert_eq!(logits.dims(), [1, 3, 12]);
}

#[test]
fn test_numerics_check_passes_on_finite_values() {
    let model = build(&small_config().with_check_numerics(true));
    let logits = model.forward(ids(&[1, 5, 6, 2]), ids(&[1, 3])).unwrap();
    assert!(to_vec(logits).iter().all(|v| v.is_finite()));
}

#[test]
fn test_encode_then_decode_matches_forward() {
    let model = build(&small_config());
    let src = ids(&[1, 5, 6, 2]);
    let tgt = ids(&[1, 3, 4]);

    let expected = to_vec(model.forward(src.clone(), tgt.clone()).unwrap());

    let encoded = model.encode(src.clone()).unwrap();
    assert_eq!(encoded.memory.dims(), [1, 4, 8]);
    let src_mask = attention_transformer::mask::padding_mask(&src, model.pad_id());
    let tgt_mask = attention_transformer::mask::decoder_self_mask(&tgt, model.pad_id()).unwrap();
    let decoded = model
        .decode(tgt, encoded.memory, Some(tgt_mask), Some(src_mask))
        .unwrap();

    assert!(max_abs_diff(&expected, &to_vec(decoded.logits)) < 1e-6);
}
