//! End-to-end tests of the LLM model against the mock runtime.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use declm_core::{CachedDataset, ConfigError, DataCache, ModelConfig, Precision, RuntimeConfig};
use declm_llm::adapter::ADAPTER_CONFIG_FILE;
use declm_llm::mock::{
    ADAPTER_WEIGHTS_FILE, BackboneCall, MockAdapterProvider, MockBackboneProvider,
    MockFeatureFactory,
};
use declm_llm::model::{MANIFEST_FILE, MODEL_WEIGHTS_DIR};
use declm_llm::output::PREDICTIONS;
use declm_llm::{
    BackboneConfig, BatchValue, FeatureInputs, ForwardInput, ForwardOutput, LlmError, LlmModel,
    ModelContext, ModelMode, OutputKey, Targets,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const ZERO_SHOT: &str = "\
model_name: mock/tiny
input_features:
  - name: prompt
    type: text
output_features:
  - name: answer
    type: text
generation_config:
  max_new_tokens: 10
";

fn prompt_tuning() -> String {
    format!("{ZERO_SHOT}adapter:\n  type: prompt_tuning\n  num_virtual_tokens: 8\n")
}

struct Harness {
    backbones: Arc<MockBackboneProvider>,
    adapters: Arc<MockAdapterProvider>,
    features: Arc<MockFeatureFactory>,
    cache: DataCache,
}

impl Harness {
    fn new(vocab_size: usize) -> Self {
        Self::with_backbones(MockBackboneProvider::with_vocab(vocab_size))
    }

    fn with_backbones(backbones: MockBackboneProvider) -> Self {
        Self {
            backbones: Arc::new(backbones),
            adapters: Arc::new(MockAdapterProvider::new()),
            features: Arc::new(MockFeatureFactory::new()),
            cache: DataCache::new(),
        }
    }

    fn context(&self) -> ModelContext {
        ModelContext::new(
            self.backbones.clone(),
            self.adapters.clone(),
            self.features.clone(),
        )
        .with_data_cache(self.cache.clone())
    }

    fn build(&self, yaml: &str) -> declm_llm::Result<LlmModel> {
        LlmModel::new(ModelConfig::from_yaml_str(yaml)?, self.context())
    }

    fn generate_calls(&self) -> Vec<BackboneCall> {
        self.backbones
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackboneCall::Generate { .. }))
            .collect()
    }

    fn embed_calls(&self) -> Vec<BackboneCall> {
        self.backbones
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackboneCall::Embed { .. }))
            .collect()
    }
}

/// Deterministic `[batch, seq]` token ids below 32.
fn ids(batch: usize, seq: usize) -> Tensor {
    let data: Vec<u32> = (0..batch * seq).map(|i| ((i * 7 + 3) % 32) as u32).collect();
    Tensor::from_vec(data, (batch, seq), &Device::Cpu).unwrap()
}

fn batch(tokens: Tensor) -> FeatureInputs {
    FeatureInputs::from([("prompt".to_string(), tokens)])
}

fn targets(tokens: Tensor) -> Targets {
    Targets::from([("answer".to_string(), tokens)])
}

fn logits(output: &ForwardOutput) -> Tensor {
    output.logits("answer").expect("logits for answer").clone()
}

// --- Construction ---

#[test]
fn test_zero_shot_generation_end_to_end() {
    let harness = Harness::new(32);
    let model = harness.build(ZERO_SHOT).unwrap();
    assert_eq!(model.mode(), ModelMode::ZeroShotGeneration);
    assert_eq!(model.context_len(), 2048);
    assert_eq!(model.max_input_length(), 2030);
    assert!(model.trainable_parameters().is_none());

    let output = model.forward(batch(ids(1, 5)), None).unwrap();
    let ForwardOutput::Generated(generated) = &output else {
        panic!("expected generated output, got {output:?}");
    };
    assert_eq!(generated.keys().collect::<Vec<_>>(), vec!["answer"]);
    assert_eq!(generated["answer"][PREDICTIONS].dims(), &[1, 10]);
    assert_eq!(generated["answer"]["logits"].dims(), &[1, 10, 32]);
}

#[test]
fn test_prompt_tuning_forward_shape() {
    let harness = Harness::new(32);
    let model = harness.build(&prompt_tuning()).unwrap();
    assert_eq!(model.mode(), ModelMode::FineTuning);
    assert_eq!(harness.adapters.wrap_count(), 1);

    let output = model.forward(batch(ids(2, 16)), None).unwrap();
    let ForwardOutput::Logits(map) = &output else {
        panic!("expected logits output, got {output:?}");
    };
    let logits = &map[&OutputKey::logits("answer")];
    assert_eq!(logits.dims(), &[2, 32]);
    assert_eq!(logits.dtype(), DType::F32);

    let short = model.forward(batch(ids(2, 3)), None).unwrap();
    assert_eq!(self::logits(&short).dims(), &[2, 32]);

    let params = model.trainable_parameters().unwrap();
    assert_eq!(params.trainable, 8 * 16);
}

#[test]
fn test_two_output_features_fail_before_backbone_load() {
    let harness = Harness::new(32);
    let yaml = ZERO_SHOT.replace(
        "generation_config:",
        "  - name: summary\n    type: text\ngeneration_config:",
    );
    let err = harness.build(&yaml).err().unwrap();
    assert!(matches!(
        err,
        LlmError::Config(ConfigError::TooManyOutputFeatures { count: 2 })
    ));
    assert_eq!(harness.backbones.load_count(), 0);
}

#[test]
fn test_reserved_feature_name_rejected() {
    let harness = Harness::new(32);
    let yaml = ZERO_SHOT.replace("name: prompt", "name: keys");
    let err = harness.build(&yaml).err().unwrap();
    assert!(matches!(
        err,
        LlmError::Config(ConfigError::ReservedFeatureName { .. })
    ));
    assert_eq!(harness.backbones.load_count(), 0);
}

#[test]
fn test_decoder_bound_to_backbone_vocab() {
    // The tokenizer may know fewer tokens than the LM head emits.
    let harness = Harness::new(48);
    let model = harness.build(&prompt_tuning()).unwrap();
    assert_eq!(model.output_feature("answer").unwrap().input_size(), 48);
    assert_eq!(model.config().output_features[0].input_size, None);

    let output = model.forward(batch(ids(3, 7)), None).unwrap();
    assert_eq!(logits(&output).dims(), &[3, 48]);
}

#[test]
fn test_context_too_small_for_generation_budget() {
    let harness = Harness::with_backbones(MockBackboneProvider::new(BackboneConfig {
        vocab_size: 32,
        hidden_size: Some(8),
        max_sequence_length: None,
        max_position_embeddings: Some(16),
    }));
    let err = harness.build(ZERO_SHOT).err().unwrap();
    assert!(matches!(
        err,
        LlmError::Config(ConfigError::ContextTooSmall {
            context_len: 16,
            max_new_tokens: 10,
            margin: 8
        })
    ));
}

#[test]
fn test_oversized_generation_budget_is_context_error() {
    let harness = Harness::new(32);
    let yaml = ZERO_SHOT.replace(
        "max_new_tokens: 10",
        &format!("max_new_tokens: {}", usize::MAX),
    );
    ModelConfig::from_yaml_str(&yaml).unwrap().validate().unwrap();
    let err = harness.build(&yaml).err().unwrap();
    assert!(matches!(
        err,
        LlmError::Config(ConfigError::ContextTooSmall { context_len: 2048, .. })
    ));
}

#[test]
fn test_runtime_config_sets_backbone_precision() {
    let harness = Harness::new(32);
    let mut runtime = RuntimeConfig::default();
    runtime.backbone.precision = Precision::Full;
    runtime.backbone.default_context_len = 512;
    let model = LlmModel::new(
        ModelConfig::from_yaml_str(&prompt_tuning()).unwrap(),
        harness.context().with_runtime_config(&runtime),
    )
    .unwrap();
    assert_eq!(model.context_len(), 512);
    assert_eq!(model.max_input_length(), 494);
    let logits = model.backbone().forward(&ids(1, 3)).unwrap();
    assert_eq!(logits.dtype(), DType::F32);
}

#[test]
fn test_backbone_failure_propagates() {
    let harness =
        Harness::with_backbones(MockBackboneProvider::with_vocab(32).with_unavailable("mock/tiny"));
    let err = harness.build(ZERO_SHOT).err().unwrap();
    assert!(matches!(err, LlmError::Backbone { ref model, .. } if model == "mock/tiny"));
}

#[test]
fn test_unsupported_adapter_family() {
    let harness = Harness::new(32);
    let yaml = format!("{ZERO_SHOT}adapter:\n  type: lora\n  r: 4\n");
    let err = harness.build(&yaml).err().unwrap();
    assert!(matches!(err, LlmError::Unsupported(_)));
}

#[test]
fn test_construction_clears_data_cache() {
    let harness = Harness::new(32);
    harness.cache.insert(CachedDataset {
        fingerprint: "abc123".into(),
        path: PathBuf::from("/tmp/train.parquet"),
        num_rows: 10,
    });
    assert_eq!(harness.cache.len(), 1);
    harness.build(ZERO_SHOT).unwrap();
    assert!(harness.cache.is_empty());
}

#[test]
fn test_args_and_model_type() {
    let harness = Harness::new(32);
    let model = LlmModel::new(
        ModelConfig::from_yaml_str(ZERO_SHOT).unwrap(),
        harness.context().with_random_seed(42),
    )
    .unwrap();
    assert_eq!(model.model_type(), "llm");
    assert!(model.augmentation_pipelines().is_empty());
    let args = model.args();
    assert_eq!(args.random_seed, Some(42));
    assert_eq!(args.input_features[0].name, "prompt");
    assert_eq!(args.output_features[0].name, "answer");
    assert_eq!(model.input_feature_names(), vec!["prompt"]);
}

// --- Forward ---

#[test]
fn test_input_name_mismatch() {
    let harness = Harness::new(32);
    let model = harness.build(ZERO_SHOT).unwrap();
    let inputs = FeatureInputs::from([("question".to_string(), ids(1, 4))]);
    match model.forward(inputs, None) {
        Err(LlmError::InputMismatch { expected, actual }) => {
            assert_eq!(expected, vec!["prompt"]);
            assert_eq!(actual, vec!["question"]);
        }
        other => panic!("expected input mismatch, got {other:?}"),
    }
}

#[test]
fn test_generation_input_truncated_before_backbone() {
    let harness = Harness::new(32);
    let model = harness.build(ZERO_SHOT).unwrap();
    let mask = Tensor::ones((1, 2040), DType::U32, &Device::Cpu).unwrap();

    let output = model.forward(batch(ids(1, 2040)), Some(&mask)).unwrap();
    assert_eq!(output.generated("answer").unwrap()[PREDICTIONS].dims(), &[1, 10]);
    assert_eq!(
        harness.generate_calls(),
        vec![BackboneCall::Generate {
            shape: vec![1, 2030],
            mask_shape: Some(vec![1, 2030]),
            max_new_tokens: 10,
        }]
    );
}

#[test]
fn test_adapter_input_truncated_before_backbone() {
    let harness = Harness::new(32);
    let model = harness.build(&prompt_tuning()).unwrap();
    let output = model.forward(batch(ids(2, 2100)), None).unwrap();
    assert_eq!(logits(&output).dims(), &[2, 32]);
    assert_eq!(
        harness.embed_calls(),
        vec![BackboneCall::Embed {
            shape: vec![2, 2030]
        }]
    );
}

#[test]
fn test_empty_sequence_rejected_before_backbone() {
    let harness = Harness::new(32);
    let empty = Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap();

    let zero_shot = harness.build(ZERO_SHOT).unwrap();
    assert!(matches!(
        zero_shot.forward(batch(empty.clone()), None),
        Err(LlmError::Shape(_))
    ));
    let tuned = harness.build(&prompt_tuning()).unwrap();
    assert!(matches!(
        tuned.forward(batch(empty), None),
        Err(LlmError::Shape(_))
    ));

    assert!(harness.generate_calls().is_empty());
    assert!(harness.embed_calls().is_empty());
}

#[test]
fn test_half_precision_backbone_yields_f32_logits() {
    let harness = Harness::with_backbones(MockBackboneProvider::with_vocab(32).with_dtype(DType::BF16));
    let model = harness.build(&prompt_tuning()).unwrap();
    let raw = model.backbone().forward(&ids(2, 4)).unwrap();
    assert_eq!(raw.dtype(), DType::BF16);

    let output = model.forward(batch(ids(2, 4)), None).unwrap();
    let logits = logits(&output);
    assert_eq!(logits.dtype(), DType::F32);
    assert!(logits.to_vec2::<f32>().unwrap().iter().flatten().all(|v| v.is_finite()));
}

#[test]
fn test_forward_accepts_and_ignores_targets() {
    let harness = Harness::new(32);
    let model = harness.build(&prompt_tuning()).unwrap();
    let with_targets = ForwardInput::WithTargets(
        batch(ids(2, 6)),
        [("answer".to_string(), BatchValue::array(vec![1, 2, 3, 4], vec![2, 2]))]
            .into_iter()
            .collect(),
    );
    let a = logits(&model.forward(with_targets, None).unwrap());
    let b = logits(&model.forward(batch(ids(2, 6)), None).unwrap());
    assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
}

// --- Metrics and loss ---

#[test]
fn test_zero_shot_metrics_leave_loss_accumulators_alone() {
    let harness = Harness::new(32);
    let mut model = harness.build(ZERO_SHOT).unwrap();
    let output = model.forward(batch(ids(1, 5)), None).unwrap();
    let predictions = model.outputs_to_predictions(&output).unwrap();

    let before = model.eval_loss_metric().clone();
    let target = Tensor::new(&[[4u32, 5, 6, 7]], &Device::Cpu).unwrap();
    model.update_metrics(&targets(target.clone()), &predictions).unwrap();

    assert_eq!(model.eval_loss_metric(), &before);
    assert_eq!(model.eval_additional_losses_metric().count(), 0.0);

    let updates = harness.features.metric_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].target_shape, vec![1, 10]);
    assert_eq!(updates[0].prediction_shape, vec![1, 10]);
    // The caller's target is not padded in place.
    assert_eq!(target.dims(), &[1, 4]);
}

#[test]
fn test_fine_tuning_metrics_track_losses() {
    let harness = Harness::new(32);
    let mut model = harness.build(&prompt_tuning()).unwrap();
    let output = model.forward(batch(ids(2, 16)), None).unwrap();
    let predictions = model.outputs_to_predictions(&output).unwrap();
    assert_eq!(predictions["answer"][PREDICTIONS].dims(), &[2, 1]);

    let target = Tensor::new(&[[3u32, 9, 1], [5, 2, 8]], &Device::Cpu).unwrap();
    model.update_metrics(&targets(target.clone()), &predictions).unwrap();

    assert_eq!(model.eval_loss_metric().count(), 1.0);
    assert_eq!(model.eval_additional_losses_metric().count(), 1.0);
    let loss = model.eval_loss_metric().compute().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
    let additional = model.eval_additional_losses_metric().compute().unwrap();
    assert!(additional > 0.0);

    // Predictions are shorter than the target: the target is left unpadded.
    let updates = harness.features.metric_updates();
    assert_eq!(updates[0].target_shape, vec![2, 3]);

    let (eval_loss, additional_losses) = model.eval_loss(&targets(target), &predictions).unwrap();
    assert!(eval_loss.dims().is_empty());
    assert!(additional_losses.dims().is_empty());
    assert!((eval_loss.to_scalar::<f32>().unwrap() as f64 - loss).abs() < 1e-5);

    model.reset_metrics();
    assert_eq!(model.eval_loss_metric().count(), 0.0);
    assert_eq!(model.eval_additional_losses_metric().compute(), None);
}

#[test]
fn test_loss_weight_scales_eval_loss() {
    let harness = Harness::new(32);
    let model = harness.build(&prompt_tuning()).unwrap();
    let weighted_yaml = prompt_tuning().replace("    type: text\ngeneration", "    type: text\n    loss:\n      weight: 2.0\ngeneration");
    let weighted = harness.build(&weighted_yaml).unwrap();
    assert_eq!(weighted.config().output_features[0].loss.weight, 2.0);

    let target = targets(Tensor::new(&[[3u32], [5]], &Device::Cpu).unwrap());
    let output = model.forward(batch(ids(2, 4)), None).unwrap();
    let predictions = model.outputs_to_predictions(&output).unwrap();

    let (plain, _) = model.eval_loss(&target, &predictions).unwrap();
    let (doubled, _) = weighted.eval_loss(&target, &predictions).unwrap();
    let plain = plain.to_scalar::<f32>().unwrap();
    let doubled = doubled.to_scalar::<f32>().unwrap();
    assert!((doubled - 2.0 * plain).abs() < 1e-5);
}

#[test]
fn test_category_output_with_adapter() {
    let harness = Harness::new(32);
    let yaml = prompt_tuning().replace("name: answer\n    type: text", "name: answer\n    type: category");
    let mut model = harness.build(&yaml).unwrap();
    let output = model.forward(batch(ids(2, 5)), None).unwrap();
    let predictions = model.outputs_to_predictions(&output).unwrap();
    assert_eq!(predictions["answer"][PREDICTIONS].dims(), &[2]);

    let target = Tensor::new(&[3u32, 5], &Device::Cpu).unwrap();
    model.update_metrics(&targets(target), &predictions).unwrap();
    assert_eq!(harness.features.metric_updates()[0].target_shape, vec![2]);
    assert_eq!(model.eval_loss_metric().count(), 1.0);
}

#[test]
fn test_predictions_require_matching_output_kind() {
    let harness = Harness::new(32);
    let model = harness.build(ZERO_SHOT).unwrap();
    let wrong = ForwardOutput::Logits(
        [(
            OutputKey::logits("answer"),
            Tensor::zeros((1, 32), DType::F32, &Device::Cpu).unwrap(),
        )]
        .into_iter()
        .collect(),
    );
    assert!(matches!(
        model.outputs_to_predictions(&wrong),
        Err(LlmError::Shape(_))
    ));
}

#[test]
fn test_missing_target_is_feature_error() {
    let harness = Harness::new(32);
    let mut model = harness.build(&prompt_tuning()).unwrap();
    let output = model.forward(batch(ids(1, 4)), None).unwrap();
    let predictions = model.outputs_to_predictions(&output).unwrap();
    assert!(matches!(
        model.update_metrics(&Targets::new(), &predictions),
        Err(LlmError::Feature { .. })
    ));
}

// --- Persistence ---

#[test]
fn test_save_load_round_trip() -> anyhow::Result<()> {
    let harness = Harness::new(32);
    let dir = TempDir::new()?;
    let input = ids(2, 12);

    let model = harness.build(&prompt_tuning())?;
    let before = logits(&model.forward(batch(input.clone()), None)?).to_vec2::<f32>()?;
    model.save(dir.path())?;

    let weights = dir.path().join(MODEL_WEIGHTS_DIR);
    assert!(weights.join(ADAPTER_WEIGHTS_FILE).exists());
    assert!(weights.join("adapter_config.json").exists());
    assert!(weights.join(MANIFEST_FILE).exists());

    // A fresh model starts from a different adapter initialisation.
    let mut restored = harness.build(&prompt_tuning())?;
    let fresh = logits(&restored.forward(batch(input.clone()), None)?).to_vec2::<f32>()?;
    assert_ne!(fresh, before);

    let loads_before = harness.backbones.load_count();
    restored.load(dir.path())?;
    assert_eq!(harness.backbones.load_count(), loads_before + 1);
    assert!(!restored.peft_config().unwrap().inference_mode);

    let after = logits(&restored.forward(batch(input), None)?).to_vec2::<f32>()?;
    for (row_before, row_after) in before.iter().zip(&after) {
        for (a, b) in row_before.iter().zip(row_after) {
            assert!((a - b).abs() < 1e-5, "{a} != {b}");
        }
    }
    Ok(())
}

#[test]
fn test_manifest_records_weight_digests() -> anyhow::Result<()> {
    let harness = Harness::new(32);
    let dir = TempDir::new()?;
    let model = harness.build(&prompt_tuning())?;
    model.save(dir.path())?;

    let weights = dir.path().join(MODEL_WEIGHTS_DIR);
    let manifest: declm_llm::model::AdapterManifest =
        serde_json::from_str(&std::fs::read_to_string(weights.join(MANIFEST_FILE))?)?;
    assert_eq!(manifest.base_model, "mock/tiny");
    let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec![ADAPTER_WEIGHTS_FILE, ADAPTER_CONFIG_FILE]);
    for file in &manifest.files {
        assert_eq!(
            file.sha256,
            declm_core::persistence::sha256_file(&weights.join(&file.name))?
        );
    }
    manifest.verify(&weights)?;
    Ok(())
}

#[test]
fn test_tampered_weights_fail_checksum() {
    let harness = Harness::new(32);
    let dir = TempDir::new().unwrap();
    let model = harness.build(&prompt_tuning()).unwrap();
    model.save(dir.path()).unwrap();

    let weights_file = dir.path().join(MODEL_WEIGHTS_DIR).join(ADAPTER_WEIGHTS_FILE);
    let mut bytes = std::fs::read(&weights_file).unwrap();
    bytes.push(0);
    std::fs::write(&weights_file, bytes).unwrap();

    let mut restored = harness.build(&prompt_tuning()).unwrap();
    assert!(matches!(
        restored.load(dir.path()),
        Err(LlmError::Checksum { .. })
    ));
}

#[test]
fn test_tampered_adapter_config_fails_checksum() {
    let harness = Harness::new(32);
    let dir = TempDir::new().unwrap();
    let model = harness.build(&prompt_tuning()).unwrap();
    model.save(dir.path()).unwrap();

    let config_file = dir.path().join(MODEL_WEIGHTS_DIR).join(ADAPTER_CONFIG_FILE);
    let saved = std::fs::read_to_string(&config_file).unwrap();
    let edited = saved.replace("\"num_virtual_tokens\": 8", "\"num_virtual_tokens\": 4");
    assert_ne!(edited, saved);
    std::fs::write(&config_file, edited).unwrap();

    let mut restored = harness.build(&prompt_tuning()).unwrap();
    let loads = harness.backbones.load_count();
    match restored.load(dir.path()) {
        Err(LlmError::Checksum { path, .. }) => assert!(path.ends_with(ADAPTER_CONFIG_FILE)),
        other => panic!("expected checksum failure, got {other:?}"),
    }
    assert_eq!(harness.backbones.load_count(), loads);
}

#[test]
fn test_load_from_missing_directory_fails() {
    let harness = Harness::new(32);
    let dir = TempDir::new().unwrap();
    let mut model = harness.build(&prompt_tuning()).unwrap();
    assert!(matches!(model.load(dir.path()), Err(LlmError::Io(_))));
}

#[test]
fn test_save_and_load_are_noops_without_adapter() {
    let harness = Harness::new(32);
    let dir = TempDir::new().unwrap();
    let mut model = harness.build(ZERO_SHOT).unwrap();

    model.save(dir.path()).unwrap();
    assert!(!dir.path().join(MODEL_WEIGHTS_DIR).exists());

    let loads = harness.backbones.load_count();
    model.load(dir.path()).unwrap();
    assert_eq!(harness.backbones.load_count(), loads);
    assert_eq!(model.mode(), ModelMode::ZeroShotGeneration);
}
