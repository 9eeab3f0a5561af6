//! Local causal-LM oracle on candle.
//!
//! Weights, `config.json` and `tokenizer.json` come from the Hugging Face hub
//! or from a local directory. Scoring primes the KV cache with the prompt in
//! one batched pass and then steps through the completion one token at a
//! time, reading the next-token distribution after each step.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{llama, mistral, phi3, qwen2};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde_json::Value;
use tokenizers::Tokenizer;

use super::registry;
use super::{
    LanguageModelOracle, OracleError, OracleResult, greedy_token, log_softmax_at, scoring_window,
};

/// Special tokens that end a generation when present in the vocabulary.
const END_TOKENS: &[&str] = &["<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<|end|>", "</s>"];

/// Where inference should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU.
    #[default]
    Auto,
    Cpu,
}

/// Configuration for loading a [`CandleOracle`].
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Hub repo id or local directory.
    pub model_id: String,
    /// Hub revision (branch, tag or commit). `None` for the default branch.
    pub revision: Option<String>,
    pub device: DevicePreference,
    /// Upper bound on prompt + completion tokens; capped further by the
    /// model's own `max_position_embeddings`.
    pub max_context: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model_id: registry::default_model_id().to_string(),
            revision: None,
            device: DevicePreference::Auto,
            max_context: 2048,
        }
    }
}

// ---------------------------------------------------------------------------
// Model files
// ---------------------------------------------------------------------------

enum Source {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl Source {
    fn open(model_id: &str, revision: Option<&str>) -> Result<Self, String> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        let api = Api::new().map_err(|e| format!("cannot reach the model hub: {e}"))?;
        let repo = match revision {
            Some(rev) => {
                Repo::with_revision(model_id.to_string(), RepoType::Model, rev.to_string())
            }
            None => Repo::model(model_id.to_string()),
        };
        Ok(Self::Hub(api.repo(repo)))
    }

    fn get(&self, file: &str) -> Result<PathBuf, String> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(format!("{} not found", path.display()))
                }
            }
            Self::Hub(repo) => repo
                .get(file)
                .map_err(|e| format!("download of {file} failed: {e}")),
        }
    }

    /// Single `model.safetensors`, or the shards named by the index file.
    fn weights(&self) -> Result<Vec<PathBuf>, String> {
        if let Ok(single) = self.get("model.safetensors") {
            return Ok(vec![single]);
        }
        let index = self.get("model.safetensors.index.json")?;
        shard_names(&index)?
            .iter()
            .map(|name| self.get(name))
            .collect()
    }
}

fn read_json(path: &Path) -> Result<Value, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("failed reading {}: {e}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
}

fn shard_names(index: &Path) -> Result<BTreeSet<String>, String> {
    let json = read_json(index)?;
    let map = json
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| format!("{} has no weight_map", index.display()))?;
    Ok(map
        .values()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

/// `eos_token_id` from a model config; scalar or list.
fn config_eos_ids(config: &Value) -> Vec<u32> {
    match config.get("eos_token_id") {
        Some(Value::Number(n)) => n.as_u64().map(|id| id as u32).into_iter().collect(),
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(Value::as_u64)
            .map(|id| id as u32)
            .collect(),
        _ => Vec::new(),
    }
}

/// `requested`, capped by the model's `max_position_embeddings` when known.
fn effective_context(requested: usize, model_limit: Option<u64>) -> usize {
    match model_limit.map(|m| m as usize) {
        Some(limit) if limit < requested => {
            tracing::warn!(
                requested,
                model_limit = limit,
                "max_context exceeds the model's position limit; capping"
            );
            limit
        }
        _ => requested,
    }
}

fn select_device(preference: DevicePreference) -> Device {
    if preference == DevicePreference::Cpu {
        return Device::Cpu;
    }
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}

// ---------------------------------------------------------------------------
// Architectures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Architecture {
    Llama,
    Qwen2,
    Mistral,
    Phi3,
}

impl Architecture {
    fn detect(config: &Value) -> Result<Self, String> {
        match config.get("model_type").and_then(Value::as_str) {
            Some("llama") => Ok(Self::Llama),
            Some("qwen2") => Ok(Self::Qwen2),
            Some("mistral") => Ok(Self::Mistral),
            Some("phi3") => Ok(Self::Phi3),
            Some(other) => Err(format!(
                "unsupported architecture \"{other}\" (supported: llama, qwen2, mistral, phi3)"
            )),
            None => Err("config.json has no model_type".into()),
        }
    }
}

enum CausalLm {
    Llama {
        model: llama::Llama,
        cache: llama::Cache,
        config: llama::Config,
        dtype: DType,
        device: Device,
    },
    Qwen2(qwen2::ModelForCausalLM),
    Mistral(mistral::Model),
    Phi3(phi3::Model),
}

impl CausalLm {
    fn load(
        arch: Architecture,
        config: &Value,
        vb: VarBuilder,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, String> {
        let parse_err = |e: serde_json::Error| format!("config.json does not match {arch:?}: {e}");
        let build_err = |e: candle_core::Error| format!("failed constructing {arch:?} model: {e}");
        let model = match arch {
            Architecture::Llama => {
                let cfg: llama::LlamaConfig =
                    serde_json::from_value(config.clone()).map_err(parse_err)?;
                let cfg = cfg.into_config(false);
                let model = llama::Llama::load(vb, &cfg).map_err(build_err)?;
                let cache = llama::Cache::new(true, dtype, &cfg, device).map_err(build_err)?;
                Self::Llama {
                    model,
                    cache,
                    config: cfg,
                    dtype,
                    device: device.clone(),
                }
            }
            Architecture::Qwen2 => {
                let cfg: qwen2::Config =
                    serde_json::from_value(config.clone()).map_err(parse_err)?;
                Self::Qwen2(qwen2::ModelForCausalLM::new(&cfg, vb).map_err(build_err)?)
            }
            Architecture::Mistral => {
                let cfg: mistral::Config =
                    serde_json::from_value(config.clone()).map_err(parse_err)?;
                Self::Mistral(mistral::Model::new(&cfg, vb).map_err(build_err)?)
            }
            Architecture::Phi3 => {
                let cfg: phi3::Config =
                    serde_json::from_value(config.clone()).map_err(parse_err)?;
                Self::Phi3(phi3::Model::new(&cfg, vb).map_err(build_err)?)
            }
        };
        Ok(model)
    }

    fn reset(&mut self) -> candle_core::Result<()> {
        match self {
            Self::Llama {
                cache,
                config,
                dtype,
                device,
                ..
            } => *cache = llama::Cache::new(true, *dtype, config, device)?,
            Self::Qwen2(m) => m.clear_kv_cache(),
            Self::Mistral(m) => m.clear_kv_cache(),
            Self::Phi3(m) => m.clear_kv_cache(),
        }
        Ok(())
    }

    /// Feed `tokens` starting at position `offset`; return next-token logits.
    fn forward_last(
        &mut self,
        tokens: &[u32],
        offset: usize,
        device: &Device,
    ) -> candle_core::Result<Vec<f32>> {
        let input = Tensor::new(tokens, device)?.unsqueeze(0)?;
        let logits = match self {
            Self::Llama { model, cache, .. } => model.forward(&input, offset, cache)?,
            Self::Qwen2(m) => m.forward(&input, offset)?,
            Self::Mistral(m) => m.forward(&input, offset)?,
            Self::Phi3(m) => m.forward(&input, offset)?,
        };
        // [1, vocab] or [1, 1, vocab] depending on the architecture.
        let logits = logits.squeeze(0)?;
        let logits = match logits.rank() {
            1 => logits,
            2 => logits.i(logits.dim(0)? - 1)?,
            r => candle_core::bail!("unexpected logits rank {r}"),
        };
        logits.to_dtype(DType::F32)?.to_vec1::<f32>()
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// A causal LM loaded once and shared read-only; the KV cache sits behind a
/// mutex so concurrent callers are serialised.
pub struct CandleOracle {
    model_id: String,
    device: Device,
    tokenizer: Tokenizer,
    eos_ids: Vec<u32>,
    max_context: usize,
    model: Mutex<CausalLm>,
}

impl CandleOracle {
    /// Load the model, tokenizer and weights named by `config`.
    pub fn load(config: &OracleConfig) -> OracleResult<Self> {
        let unavailable = |message: String| OracleError::ModelUnavailable {
            model: config.model_id.clone(),
            message,
        };

        tracing::info!(model = %config.model_id, "loading model");
        let source =
            Source::open(&config.model_id, config.revision.as_deref()).map_err(unavailable)?;

        let raw_config = source
            .get("config.json")
            .and_then(|p| read_json(&p))
            .map_err(unavailable)?;
        let arch = Architecture::detect(&raw_config).map_err(unavailable)?;

        let tokenizer_path = source.get("tokenizer.json").map_err(unavailable)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| unavailable(format!("failed to load tokenizer: {e}")))?;

        let weights = source.weights().map_err(unavailable)?;
        let device = select_device(config.device);
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        // SAFETY: the safetensors files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights.as_slice(), dtype, &device) }
            .map_err(|e| unavailable(format!("failed to map weights: {e}")))?;
        let model = CausalLm::load(arch, &raw_config, vb, dtype, &device).map_err(unavailable)?;

        let mut eos: BTreeSet<u32> = config_eos_ids(&raw_config).into_iter().collect();
        eos.extend(END_TOKENS.iter().filter_map(|t| tokenizer.token_to_id(t)));

        let max_context = effective_context(
            config.max_context,
            raw_config
                .get("max_position_embeddings")
                .and_then(Value::as_u64),
        );

        tracing::info!(
            model = %config.model_id,
            arch = ?arch,
            device = ?device,
            shards = weights.len(),
            max_context,
            "model loaded"
        );

        Ok(Self {
            model_id: config.model_id.clone(),
            device,
            tokenizer,
            eos_ids: eos.into_iter().collect(),
            max_context,
            model: Mutex::new(model),
        })
    }

    /// Context limit in tokens after capping by the model's position limit.
    pub fn max_context(&self) -> usize {
        self.max_context
    }

    fn encode(&self, text: &str) -> OracleResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(OracleError::inference)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Every call resets the cache before use, so a guard left behind by a
    /// panicking caller is still safe to take over.
    fn lock(&self) -> MutexGuard<'_, CausalLm> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LanguageModelOracle for CandleOracle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score(&self, prompt: &str, completion: &str) -> OracleResult<f64> {
        let prompt_ids = self.encode(prompt)?;
        let joint = self.encode(&format!("{prompt}{completion}"))?;
        if !joint.starts_with(&prompt_ids) {
            tracing::debug!(
                prompt_tokens = prompt_ids.len(),
                joint_tokens = joint.len(),
                "prompt encoding is not a prefix of the joint encoding"
            );
        }

        let window = scoring_window(prompt_ids.len(), joint.len(), self.max_context);
        if window.scored() == 0 {
            return Ok(0.0);
        }
        let kept = &joint[window.drop..];
        let targets = &kept[window.start..window.end];

        let mut model = self.lock();
        model.reset().map_err(OracleError::inference)?;
        let mut logits = model
            .forward_last(&kept[..window.start], 0, &self.device)
            .map_err(OracleError::inference)?;

        let mut total = 0.0;
        for (k, &token) in targets.iter().enumerate() {
            total += log_softmax_at(&logits, token).ok_or_else(|| {
                OracleError::inference(format!("token {token} is outside the model vocabulary"))
            })?;
            if k + 1 < targets.len() {
                logits = model
                    .forward_last(&[token], window.start + k, &self.device)
                    .map_err(OracleError::inference)?;
            }
        }

        if !total.is_finite() {
            return Err(OracleError::inference(format!(
                "non-finite log-probability {total}"
            )));
        }
        Ok(total)
    }

    fn generate(&self, prompt: &str, max_new_tokens: usize) -> OracleResult<String> {
        let mut ids = self.encode(prompt)?;
        let room = self.max_context.saturating_sub(max_new_tokens).max(1);
        if ids.len() > room {
            ids.drain(..ids.len() - room);
        }
        if ids.is_empty() {
            return Err(OracleError::inference("cannot generate from an empty prompt"));
        }

        let mut model = self.lock();
        model.reset().map_err(OracleError::inference)?;
        let mut logits = model
            .forward_last(&ids, 0, &self.device)
            .map_err(OracleError::inference)?;
        let mut pos = ids.len();
        let mut out = Vec::with_capacity(max_new_tokens);

        while out.len() < max_new_tokens {
            let next = greedy_token(&logits)
                .ok_or_else(|| OracleError::inference("model returned empty logits"))?;
            if self.eos_ids.contains(&next) {
                break;
            }
            out.push(next);
            if out.len() == max_new_tokens {
                break;
            }
            logits = model
                .forward_last(&[next], pos, &self.device)
                .map_err(OracleError::inference)?;
            pos += 1;
        }
        drop(model);

        let text = self
            .tokenizer
            .decode(&out, true)
            .map_err(OracleError::inference)?;
        Ok(text.trim().to_string())
    }
}

impl fmt::Debug for CandleOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandleOracle")
            .field("model_id", &self.model_id)
            .field("device", &self.device)
            .field("max_context", &self.max_context)
            .field("eos_ids", &self.eos_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use serde_json::json;

    fn local_config(model_id: &str) -> OracleConfig {
        OracleConfig {
            model_id: model_id.to_string(),
            device: DevicePreference::Cpu,
            ..Default::default()
        }
    }

    #[test]
    fn default_config_values() {
        let config = OracleConfig::default();
        assert_eq!(config.model_id, "Qwen/Qwen2.5-0.5B-Instruct");
        assert_eq!(config.max_context, 2048);
        assert_eq!(config.device, DevicePreference::Auto);
        assert!(config.revision.is_none());
    }

    #[test]
    fn eos_ids_from_scalar_or_list() {
        assert_eq!(config_eos_ids(&json!({"eos_token_id": 151645})), vec![151645]);
        assert_eq!(
            config_eos_ids(&json!({"eos_token_id": [128001, 128008, 128009]})),
            vec![128001, 128008, 128009]
        );
        assert!(config_eos_ids(&json!({})).is_empty());
    }

    #[test]
    fn architecture_detection() {
        assert_eq!(
            Architecture::detect(&json!({"model_type": "qwen2"})).unwrap(),
            Architecture::Qwen2
        );
        assert_eq!(
            Architecture::detect(&json!({"model_type": "llama"})).unwrap(),
            Architecture::Llama
        );
        let err = Architecture::detect(&json!({"model_type": "gemma3_text"})).unwrap_err();
        assert!(err.contains("gemma3_text"));
        assert!(Architecture::detect(&json!({})).is_err());
    }

    #[test]
    fn shard_names_are_deduplicated() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &index,
            json!({"weight_map": {
                "a.weight": "model-00001-of-00002.safetensors",
                "b.weight": "model-00002-of-00002.safetensors",
                "c.weight": "model-00001-of-00002.safetensors"
            }})
            .to_string(),
        )
        .unwrap();
        let names: Vec<String> = shard_names(&index).unwrap().into_iter().collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn local_directory_without_config_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = CandleOracle::load(&local_config(dir.path().to_str().unwrap())).unwrap_err();
        assert!(matches!(err, OracleError::ModelUnavailable { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn unsupported_architecture_fails_before_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "gemma3_text"}"#).unwrap();
        let err = CandleOracle::load(&local_config(dir.path().to_str().unwrap())).unwrap_err();
        match err {
            OracleError::ModelUnavailable { message, .. } => {
                assert!(message.contains("unsupported architecture"))
            }
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn forced_cpu_device() {
        assert!(select_device(DevicePreference::Cpu).is_cpu());
    }

    #[test]
    fn context_capped_by_model_limit() {
        assert_eq!(effective_context(2048, Some(512)), 512);
        assert_eq!(effective_context(256, Some(512)), 256);
        assert_eq!(effective_context(2048, None), 2048);
    }

    const WORDS: &[&str] = &["<unk>", "a", "b", "c", "d", "e", "f", "g", "h"];
    const PROMPT: &str = "a b c d e";
    const COMPLETION: &str = " f g h";

    /// Random two-layer llama over a nine-word whitespace vocabulary.
    fn tiny_llama(dir: &Path) {
        let config = json!({
            "model_type": "llama",
            "hidden_size": 16,
            "intermediate_size": 32,
            "vocab_size": WORDS.len(),
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "max_position_embeddings": 64,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "tie_word_embeddings": false
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();

        let cfg: llama::LlamaConfig = serde_json::from_value(config).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        llama::Llama::load(vb, &cfg.into_config(false)).unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();

        let vocab: serde_json::Map<String, Value> = WORDS
            .iter()
            .enumerate()
            .map(|(id, word)| (word.to_string(), json!(id)))
            .collect();
        let tokenizer = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        });
        std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();
    }

    fn load_tiny(dir: &Path, max_context: usize) -> CandleOracle {
        CandleOracle::load(&OracleConfig {
            max_context,
            ..local_config(dir.to_str().unwrap())
        })
        .unwrap()
    }

    /// Sum of log-probabilities with a fresh full forward pass per position.
    fn full_pass_score(oracle: &CandleOracle, prompt: &str, completion: &str) -> f64 {
        let prompt_ids = oracle.encode(prompt).unwrap();
        let joint = oracle.encode(&format!("{prompt}{completion}")).unwrap();
        let window = scoring_window(prompt_ids.len(), joint.len(), oracle.max_context());
        let kept = &joint[window.drop..];
        let mut model = oracle.lock();
        (window.start..window.end)
            .map(|i| {
                model.reset().unwrap();
                let logits = model.forward_last(&kept[..i], 0, &Device::Cpu).unwrap();
                log_softmax_at(&logits, kept[i]).unwrap()
            })
            .sum()
    }

    #[test]
    fn local_model_loads_with_capped_context() {
        let dir = tempfile::TempDir::new().unwrap();
        tiny_llama(dir.path());
        let oracle = load_tiny(dir.path(), 2048);
        assert_eq!(oracle.max_context(), 64);
        assert_eq!(oracle.model_id(), dir.path().to_str().unwrap());
        assert!(oracle.eos_ids.is_empty());
        assert_eq!(oracle.encode(PROMPT).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn stepwise_scoring_matches_full_passes() {
        let dir = tempfile::TempDir::new().unwrap();
        tiny_llama(dir.path());
        // 64 keeps everything; 6 and 3 cut into the prompt and the completion.
        for max_context in [64, 6, 3] {
            let oracle = load_tiny(dir.path(), max_context);
            let stepwise = oracle.score(PROMPT, COMPLETION).unwrap();
            let expected = full_pass_score(&oracle, PROMPT, COMPLETION);
            assert!(stepwise < 0.0, "max_context {max_context}: {stepwise}");
            assert!(
                (stepwise - expected).abs() < 1e-4,
                "max_context {max_context}: {stepwise} vs {expected}"
            );
        }
    }

    #[test]
    fn repeated_calls_are_identical() {
        let dir = tempfile::TempDir::new().unwrap();
        tiny_llama(dir.path());
        let oracle = load_tiny(dir.path(), 64);

        let score = oracle.score(PROMPT, COMPLETION).unwrap();
        let text = oracle.generate(PROMPT, 4).unwrap();
        assert!(!text.is_empty());
        assert!(text.split_whitespace().count() <= 4);
        for _ in 0..2 {
            assert_eq!(oracle.score(PROMPT, COMPLETION).unwrap(), score);
            assert_eq!(oracle.generate(PROMPT, 4).unwrap(), text);
        }
    }

    #[test]
    fn poisoned_lock_is_taken_over() {
        let dir = tempfile::TempDir::new().unwrap();
        tiny_llama(dir.path());
        let oracle = load_tiny(dir.path(), 64);
        let score = oracle.score(PROMPT, COMPLETION).unwrap();

        let panicked = std::panic::catch_unwind::<_, ()>(std::panic::AssertUnwindSafe(|| {
            let _model = oracle.lock();
            panic!("caller panicked while holding the model");
        }));
        assert!(panicked.is_err());
        assert!(oracle.model.is_poisoned());

        assert_eq!(oracle.score(PROMPT, COMPLETION).unwrap(), score);
        assert!(oracle.generate(PROMPT, 2).is_ok());
    }
}
