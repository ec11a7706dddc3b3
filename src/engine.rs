//! 基于 candle 的原生推理引擎：GGUF 量化权重 + tokenizers 分词器。

use crate::native::{
    NativeBackend, NativeEngine, NativeModel, NativeModelOptions, NativeSession,
    NativeSessionOptions, TokenCallback,
};
use crate::types::{NativeError, NativeResult};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{
    quantized_gemma3, quantized_llama, quantized_phi, quantized_phi3, quantized_qwen3,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// 这些文本在词表里出现时视为结束符
const EOS_CANDIDATES: &[&str] = &["<|im_end|>", "<|endoftext|>", "<|end|>", "<end_of_turn>", "</s>", "<eos>"];

// 模型包装器枚举
enum ModelWrapper {
    Llama(Box<quantized_llama::ModelWeights>),
    Qwen3(Box<quantized_qwen3::ModelWeights>),
    Phi2(Box<quantized_phi::ModelWeights>),
    Phi3(Box<quantized_phi3::ModelWeights>),
    Gemma3(Box<quantized_gemma3::ModelWeights>),
}

impl ModelWrapper {
    /// 按 GGUF 元数据中的 `general.architecture` 选择实现
    fn from_gguf(
        architecture: &str,
        content: gguf_file::Content,
        file: &mut std::fs::File,
        device: &Device,
        flash_attn: bool,
    ) -> NativeResult<Self> {
        let wrapper = match architecture {
            "llama" | "mistral" => {
                ModelWrapper::Llama(Box::new(quantized_llama::ModelWeights::from_gguf(content, file, device)?))
            }
            "qwen3" => {
                ModelWrapper::Qwen3(Box::new(quantized_qwen3::ModelWeights::from_gguf(content, file, device)?))
            }
            "phi2" => ModelWrapper::Phi2(Box::new(quantized_phi::ModelWeights::from_gguf(content, file, device)?)),
            "phi3" => ModelWrapper::Phi3(Box::new(quantized_phi3::ModelWeights::from_gguf(
                flash_attn, content, file, device,
            )?)),
            "gemma3" => {
                ModelWrapper::Gemma3(Box::new(quantized_gemma3::ModelWeights::from_gguf(content, file, device)?))
            }
            other => {
                return Err(NativeError::ModelLoad(format!(
                    "unsupported model architecture: {}",
                    other
                )))
            }
        };
        Ok(wrapper)
    }

    /// `pos` 为 0 时模型重置自身的 kv 缓存
    fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor> {
        match self {
            ModelWrapper::Llama(model) => model.forward(input, pos),
            ModelWrapper::Qwen3(model) => model.forward(input, pos),
            ModelWrapper::Phi2(model) => model.forward(input, pos),
            ModelWrapper::Phi3(model) => model.forward(input, pos),
            ModelWrapper::Gemma3(model) => model.forward(input, pos),
        }
    }
}

/// 以十进制单位显示字节数，例如 `4.20GB`
fn human_size(bytes: usize) -> String {
    const UNITS: [(&str, f64); 3] = [("GB", 1e9), ("MB", 1e6), ("KB", 1e3)];
    let value = bytes as f64;
    UNITS
        .iter()
        .find(|(_, scale)| value >= *scale)
        .map(|(unit, scale)| format!("{:.2}{}", value / scale, unit))
        .unwrap_or_else(|| format!("{bytes}B"))
}

/// 上下文已占满预算时没有位置再生成任何 token
fn ensure_room(context: usize, limit: usize) -> NativeResult<()> {
    if context >= limit {
        return Err(NativeError::TokenLimit {
            requested: context + 1,
            limit,
        });
    }
    Ok(())
}

/// 设置计算设备
fn select_device(backend: NativeBackend) -> NativeResult<Device> {
    let accelerator = || -> NativeResult<Option<Device>> {
        if candle_core::utils::cuda_is_available() {
            Ok(Some(Device::new_cuda(0)?))
        } else if candle_core::utils::metal_is_available() {
            Ok(Some(Device::new_metal(0)?))
        } else {
            Ok(None)
        }
    };

    match backend {
        NativeBackend::Cpu => Ok(Device::Cpu),
        NativeBackend::Gpu => accelerator()?.ok_or_else(|| {
            NativeError::BackendUnavailable("no CUDA or Metal device available".to_string())
        }),
        NativeBackend::Default => Ok(accelerator()?.unwrap_or(Device::Cpu)),
    }
}

fn sampling(options: &NativeSessionOptions) -> Sampling {
    let temperature = f64::from(options.temperature);
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match options.top_p {
        Some(p) => Sampling::TopKThenTopP {
            k: options.top_k,
            p: f64::from(p),
            temperature,
        },
        None => Sampling::TopK {
            k: options.top_k,
            temperature,
        },
    }
}

pub fn count_tokens(tokenizer: &Tokenizer, text: &str) -> NativeResult<usize> {
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|e| NativeError::Tokenization(e.to_string()))?;
    Ok(encoding.len())
}

/// 读取 LoRA 适配器的秩（`lora_A` 矩阵的第一维）
pub fn adapter_rank(path: &Path) -> NativeResult<u32> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| NativeError::InvalidLora(format!("{}: {}", path.display(), e)))?;
    tensors
        .iter()
        .find(|(name, tensor)| name.contains("lora_A") && tensor.rank() == 2)
        .map(|(_, tensor)| tensor.dims()[0] as u32)
        .ok_or_else(|| {
            NativeError::InvalidLora(format!("{} contains no lora_A weights", path.display()))
        })
}

/// 增量解码，只在新文本构成完整字符时输出
pub struct TokenOutputStream<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> TokenOutputStream<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> NativeResult<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| NativeError::Tokenization(e.to_string()))
    }

    pub fn next_token(&mut self, token: u32) -> NativeResult<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len() && !text.ends_with('\u{FFFD}') {
            if let Some(fresh) = text.get(prev_text.len()..) {
                let fresh = fresh.to_string();
                self.prev_index = self.current_index;
                self.current_index = self.tokens.len();
                return Ok(Some(fresh));
            }
        }
        Ok(None)
    }

    /// 输出尚未吐出的剩余文本
    pub fn decode_rest(&self) -> NativeResult<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        Ok(text
            .get(prev_text.len()..)
            .filter(|rest| !rest.is_empty())
            .map(str::to_string))
    }
}

/// candle 推理引擎，支持 llama/qwen3/phi2/phi3/gemma3 架构的 GGUF 权重
pub struct CandleEngine {
    flash_attn: bool,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl CandleEngine {
    pub fn new() -> Self {
        Self {
            flash_attn: false,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
        }
    }

    pub fn with_flash_attn(mut self, enabled: bool) -> Self {
        self.flash_attn = enabled;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32, last_n: usize) -> Self {
        self.repeat_penalty = penalty;
        self.repeat_last_n = last_n;
        self
    }
}

impl Default for CandleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for CandleEngine {
    fn load_model(&self, options: &NativeModelOptions) -> NativeResult<Arc<dyn NativeModel>> {
        let start = Instant::now();
        let device = select_device(options.backend)?;

        let mut file = std::fs::File::open(&options.model_path)
            .map_err(|e| NativeError::ModelLoad(format!("{}: {}", options.model_path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| NativeError::ModelLoad(e.with_path(&options.model_path).to_string()))?;

        let total_size: usize = content
            .tensor_infos
            .values()
            .map(|t| t.shape.elem_count() * t.ggml_dtype.type_size() / t.ggml_dtype.block_size())
            .sum();
        let tensor_count = content.tensor_infos.len();
        let architecture = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_else(|| "llama".to_string());
        let gguf_eos = content
            .metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.to_u32().ok());

        let weights = ModelWrapper::from_gguf(&architecture, content, &mut file, &device, self.flash_attn)?;

        let tokenizer = Tokenizer::from_file(&options.tokenizer_path).map_err(|e| {
            NativeError::Tokenization(format!("{}: {}", options.tokenizer_path.display(), e))
        })?;
        let eos_token = gguf_eos.or_else(|| {
            let vocab = tokenizer.get_vocab(true);
            EOS_CANDIDATES.iter().find_map(|t| vocab.get(*t).copied())
        });

        info!(
            architecture = %architecture,
            tensors = tensor_count,
            size = %human_size(total_size),
            device = ?device,
            elapsed_s = start.elapsed().as_secs_f32(),
            "Loaded GGUF weights"
        );

        Ok(Arc::new(CandleModel {
            weights: Arc::new(Mutex::new(weights)),
            tokenizer: Arc::new(tokenizer),
            device,
            eos_token,
            max_tokens: options.max_tokens,
            supported_lora_ranks: options.supported_lora_ranks.clone(),
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
        }))
    }
}

struct CandleModel {
    weights: Arc<Mutex<ModelWrapper>>,
    tokenizer: Arc<Tokenizer>,
    device: Device,
    eos_token: Option<u32>,
    max_tokens: usize,
    supported_lora_ranks: Option<Vec<u32>>,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl CandleModel {
    fn check_adapter(&self, path: &Path) -> NativeResult<()> {
        let rank = adapter_rank(path)?;
        let supported = self.supported_lora_ranks.as_deref().unwrap_or(&[]);
        if !supported.contains(&rank) {
            return Err(NativeError::InvalidLora(format!(
                "adapter rank {} not in supported ranks {:?}",
                rank, supported
            )));
        }
        Err(NativeError::Unsupported(
            "applying LoRA adapters to quantized weights".to_string(),
        ))
    }
}

impl NativeModel for CandleModel {
    fn create_session(&self, options: &NativeSessionOptions) -> NativeResult<Box<dyn NativeSession>> {
        if let Some(path) = &options.lora_path {
            self.check_adapter(path)?;
        }

        Ok(Box::new(CandleSession {
            weights: self.weights.clone(),
            tokenizer: self.tokenizer.clone(),
            device: self.device.clone(),
            eos_token: self.eos_token,
            max_tokens: self.max_tokens,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            logits_processor: LogitsProcessor::from_sampling(options.random_seed, sampling(options)),
            history: Vec::new(),
            processed: 0,
        }))
    }
}

struct CandleSession {
    weights: Arc<Mutex<ModelWrapper>>,
    tokenizer: Arc<Tokenizer>,
    device: Device,
    eos_token: Option<u32>,
    max_tokens: usize,
    repeat_penalty: f32,
    repeat_last_n: usize,
    logits_processor: LogitsProcessor,
    /// 提示与已生成内容的全部token
    history: Vec<u32>,
    /// 已送入模型 kv 缓存的token数
    processed: usize,
}

impl CandleSession {
    fn step(&mut self, weights: &mut ModelWrapper) -> NativeResult<u32> {
        let input = Tensor::new(&self.history[self.processed..], &self.device)?.unsqueeze(0)?;
        let logits = weights.forward(&input, self.processed)?;
        self.processed = self.history.len();

        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        let logits = if logits.rank() == 2 {
            let last = logits.dim(0)?.saturating_sub(1);
            logits.get(last)?
        } else {
            logits
        };

        // 应用重复惩罚
        let logits = if self.repeat_penalty == 1.0 {
            logits
        } else {
            let start_at = self.history.len().saturating_sub(self.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &self.history[start_at..],
            )?
        };

        Ok(self.logits_processor.sample(&logits)?)
    }
}

impl NativeSession for CandleSession {
    fn size_in_tokens(&self, text: &str) -> NativeResult<usize> {
        count_tokens(&self.tokenizer, text)
    }

    fn add_query_chunk(&mut self, text: &str) -> NativeResult<()> {
        let encoding = self
            .tokenizer
            .encode(text, self.history.is_empty())
            .map_err(|e| NativeError::Tokenization(e.to_string()))?;
        let requested = self.history.len() + encoding.len();
        if requested > self.max_tokens {
            return Err(NativeError::TokenLimit {
                requested,
                limit: self.max_tokens,
            });
        }
        self.history.extend_from_slice(encoding.get_ids());
        Ok(())
    }

    fn generate(&mut self, on_token: &mut TokenCallback<'_>) -> NativeResult<String> {
        if self.history.is_empty() {
            return Err(NativeError::Inference("prompt is empty".to_string()));
        }
        ensure_room(self.history.len(), self.max_tokens)?;

        let tokenizer = self.tokenizer.clone();
        let weights = self.weights.clone();
        let mut weights = weights.lock();
        let mut stream = TokenOutputStream::new(&tokenizer);
        let mut text = String::new();
        let mut generated = 0usize;
        let start = Instant::now();

        while self.history.len() < self.max_tokens {
            let next = self.step(&mut weights)?;
            self.history.push(next);
            generated += 1;
            if Some(next) == self.eos_token {
                break;
            }
            if let Some(fragment) = stream.next_token(next)? {
                if on_token(fragment.as_str()).is_break() {
                    return Err(NativeError::Cancelled);
                }
                text.push_str(&fragment);
            }
        }

        if let Some(rest) = stream.decode_rest()? {
            if on_token(rest.as_str()).is_break() {
                return Err(NativeError::Cancelled);
            }
            text.push_str(&rest);
        }

        let elapsed = start.elapsed().as_secs_f64();
        debug!(
            generated,
            context = self.history.len(),
            tokens_per_s = generated as f64 / elapsed.max(f64::EPSILON),
            "Generation loop finished"
        );
        Ok(text)
    }
}
