use crate::native::{EmbedderFactory, NativeEmbedder};
use crate::types::{EmbedError, NativeError, NativeResult};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info, warn};

/// 文本嵌入服务，首次调用时才创建原生嵌入器
pub struct EmbeddingService {
    factory: Arc<dyn EmbedderFactory>,
    asset_path: PathBuf,
    embedder: Mutex<Option<Box<dyn NativeEmbedder>>>,
}

impl EmbeddingService {
    pub fn new(factory: Arc<dyn EmbedderFactory>, asset_path: impl Into<PathBuf>) -> Self {
        Self {
            factory,
            asset_path: asset_path.into(),
            embedder: Mutex::new(None),
        }
    }

    pub fn asset_path(&self) -> &Path {
        &self.asset_path
    }

    pub fn is_initialized(&self) -> bool {
        self.embedder.lock().is_some()
    }

    /// 阻塞计算嵌入向量。初始化失败时不保留句柄，下次调用会重试。
    pub fn embed(&self, text: &str) -> Result<Vec<f64>, EmbedError> {
        let mut guard = self.embedder.lock();
        if guard.is_none() {
            let embedder = self
                .factory
                .create(&self.asset_path)
                .map_err(|e| EmbedError::InitializationFailed(e.to_string()))?;
            info!(assets = %self.asset_path.display(), "Text embedder initialized");
            *guard = Some(embedder);
        }
        let embedder = guard
            .as_mut()
            .ok_or_else(|| EmbedError::InitializationFailed("embedder unavailable".to_string()))?;

        let start = Instant::now();
        let vector = match embedder.embed(text) {
            Ok(Some(vector)) => vector,
            Ok(None) => {
                return Err(EmbedError::ComputationFailed(
                    "embedder returned no result".to_string(),
                ))
            }
            Err(e) => {
                warn!(error = %e, "Embedding failed");
                return Err(EmbedError::ComputationFailed(e.to_string()));
            }
        };
        debug!(
            dims = vector.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Text embedded"
        );
        Ok(vector.into_iter().map(f64::from).collect())
    }

    /// 释放原生句柄，之后的调用会重新初始化
    pub fn close(&self) {
        if self.embedder.lock().take().is_some() {
            info!("Text embedder closed");
        }
    }
}

/// 基于 candle BERT 的句向量嵌入器工厂。
///
/// 资源目录需包含 `config.json`、`tokenizer.json` 与 `model.safetensors`。
pub struct BertEmbedderFactory {
    max_length: usize,
}

impl BertEmbedderFactory {
    pub fn new() -> Self {
        Self { max_length: 512 }
    }
}

impl Default for BertEmbedderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbedderFactory for BertEmbedderFactory {
    fn create(&self, asset_path: &Path) -> NativeResult<Box<dyn NativeEmbedder>> {
        let config_path = asset_path.join("config.json");
        let tokenizer_path = asset_path.join("tokenizer.json");
        let weights_path = asset_path.join("model.safetensors");
        for path in [&config_path, &tokenizer_path, &weights_path] {
            if !path.exists() {
                return Err(NativeError::ModelLoad(format!(
                    "missing embedder asset {}",
                    path.display()
                )));
            }
        }

        let device = Device::Cpu;
        let config = std::fs::read_to_string(&config_path)
            .map_err(|e| NativeError::ModelLoad(e.to_string()))?;
        let config: BertConfig =
            serde_json::from_str(&config).map_err(|e| NativeError::ModelLoad(e.to_string()))?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| NativeError::Tokenization(e.to_string()))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: self.max_length,
                ..Default::default()
            }))
            .map_err(|e| NativeError::Tokenization(e.to_string()))?;

        // SAFETY: 权重文件在嵌入器生命周期内不会被修改
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        Ok(Box::new(BertEmbedder {
            model,
            tokenizer,
            device,
        }))
    }
}

struct BertEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl NativeEmbedder for BertEmbedder {
    fn embed(&mut self, text: &str) -> NativeResult<Option<Vec<f32>>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| NativeError::Tokenization(e.to_string()))?;
        if encoding.get_ids().is_empty() {
            return Ok(None);
        }

        let ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let hidden = self.model.forward(&ids, &type_ids, Some(&mask))?;
        let pooled = mean_pool(&hidden, &mask)?;
        let mut vector = pooled.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        l2_normalize(&mut vector);
        Ok(Some(vector))
    }
}

/// 按注意力掩码对隐藏状态做平均池化，输出形状 `(batch, hidden)`
fn mean_pool(hidden: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    summed.broadcast_div(&counts)
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}
