use crate::types::{ModelError, SessionError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 首选执行后端，序号与宿主侧枚举保持一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BackendValue", into = "u8")]
pub enum PreferredBackend {
    Unspecified = 0,
    Cpu = 1,
    Gpu = 2,
    GpuFloat16 = 3,
    GpuMixed = 4,
    GpuFull = 5,
    Tpu = 6,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BackendValue {
    Ordinal(i64),
    Name(String),
}

impl TryFrom<BackendValue> for PreferredBackend {
    type Error = String;

    fn try_from(value: BackendValue) -> Result<Self, Self::Error> {
        match value {
            BackendValue::Ordinal(ordinal) => PreferredBackend::try_from(ordinal),
            BackendValue::Name(name) => name.parse(),
        }
    }
}

impl TryFrom<i64> for PreferredBackend {
    type Error = String;

    fn try_from(ordinal: i64) -> Result<Self, Self::Error> {
        match ordinal {
            0 => Ok(PreferredBackend::Unspecified),
            1 => Ok(PreferredBackend::Cpu),
            2 => Ok(PreferredBackend::Gpu),
            3 => Ok(PreferredBackend::GpuFloat16),
            4 => Ok(PreferredBackend::GpuMixed),
            5 => Ok(PreferredBackend::GpuFull),
            6 => Ok(PreferredBackend::Tpu),
            other => Err(format!("Invalid preferredBackend value: {}", other)),
        }
    }
}

impl From<PreferredBackend> for u8 {
    fn from(backend: PreferredBackend) -> Self {
        backend as u8
    }
}

impl FromStr for PreferredBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "unspecified" | "unknown" => Ok(PreferredBackend::Unspecified),
            "cpu" => Ok(PreferredBackend::Cpu),
            "gpu" => Ok(PreferredBackend::Gpu),
            "gpu_float16" | "gpu_fp16" => Ok(PreferredBackend::GpuFloat16),
            "gpu_mixed" => Ok(PreferredBackend::GpuMixed),
            "gpu_full" => Ok(PreferredBackend::GpuFull),
            "tpu" => Ok(PreferredBackend::Tpu),
            other => Err(format!("Unknown backend: {}", other)),
        }
    }
}

impl std::fmt::Display for PreferredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PreferredBackend::Unspecified => "unspecified",
            PreferredBackend::Cpu => "cpu",
            PreferredBackend::Gpu => "gpu",
            PreferredBackend::GpuFloat16 => "gpu_float16",
            PreferredBackend::GpuMixed => "gpu_mixed",
            PreferredBackend::GpuFull => "gpu_full",
            PreferredBackend::Tpu => "tpu",
        };
        f.write_str(name)
    }
}

/// 模型配置，模型创建后不可变
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// 模型文件路径
    pub model_path: PathBuf,
    /// 最大token预算
    pub max_tokens: usize,
    /// 支持的LoRA秩
    #[serde(default)]
    pub supported_lora_ranks: Option<Vec<u32>>,
    /// 首选后端
    #[serde(default)]
    pub preferred_backend: Option<PreferredBackend>,
    /// 分词器路径，缺省时使用模型同目录下的 tokenizer.json
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

impl ModelConfig {
    pub fn new(model_path: impl Into<PathBuf>, max_tokens: usize) -> Self {
        Self {
            model_path: model_path.into(),
            max_tokens,
            supported_lora_ranks: None,
            preferred_backend: None,
            tokenizer_path: None,
        }
    }

    pub fn with_lora_ranks(mut self, ranks: Vec<u32>) -> Self {
        self.supported_lora_ranks = Some(ranks);
        self
    }

    pub fn with_backend(mut self, backend: PreferredBackend) -> Self {
        self.preferred_backend = Some(backend);
        self
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.max_tokens == 0 {
            return Err(ModelError::InvalidConfiguration(
                "max_tokens must be positive".to_string(),
            ));
        }
        if let Some(ranks) = &self.supported_lora_ranks {
            if ranks.is_empty() {
                return Err(ModelError::InvalidConfiguration(
                    "supported_lora_ranks must not be empty".to_string(),
                ));
            }
            if ranks.contains(&0) {
                return Err(ModelError::InvalidConfiguration(
                    "LoRA ranks must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn resolved_tokenizer_path(&self) -> PathBuf {
        match &self.tokenizer_path {
            Some(path) => path.clone(),
            None => self
                .model_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("tokenizer.json"),
        }
    }
}

/// 会话采样配置，会话创建后不可变
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub lora_path: Option<PathBuf>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(SessionError::InvalidConfiguration(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.top_k == 0 {
            return Err(SessionError::InvalidConfiguration(
                "top_k must be positive".to_string(),
            ));
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(SessionError::InvalidConfiguration(format!(
                    "top_p must be within (0, 1], got {}",
                    top_p
                )));
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            random_seed: default_random_seed(),
            top_k: default_top_k(),
            top_p: None,
            lora_path: None,
        }
    }
}

fn default_temperature() -> f32 {
    0.8
}

fn default_random_seed() -> u64 {
    1
}

fn default_top_k() -> usize {
    40
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedderSettings {
    /// 文本嵌入模型资源目录
    #[serde(default = "default_asset_dir")]
    pub asset_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamSettings {
    /// 部分结果缓冲区容量，溢出时丢弃最旧的
    #[serde(default = "default_partial_capacity")]
    pub partial_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    /// 同时执行的原生调用上限
    #[serde(default = "default_max_blocking")]
    pub max_blocking: usize,
}

fn default_asset_dir() -> PathBuf {
    PathBuf::from("assets/text_embedder")
}

fn default_partial_capacity() -> usize {
    1
}

fn default_max_blocking() -> usize {
    2
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            asset_dir: default_asset_dir(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            partial_capacity: default_partial_capacity(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_blocking: default_max_blocking(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub embedder: EmbedderSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    /// CLI未指定采样参数时使用
    #[serde(default)]
    pub session_defaults: SessionConfig,
}

impl BridgeConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
