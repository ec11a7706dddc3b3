//! 原生推理引擎的同步接口。
//!
//! 会话层与桥接层只通过这些 trait 访问原生句柄，具体实现见
//! [`crate::engine::CandleEngine`] 与 [`crate::embedding::BertEmbedderFactory`]。

use crate::types::NativeResult;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 原生引擎可识别的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeBackend {
    Default,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone)]
pub struct NativeModelOptions {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_tokens: usize,
    pub supported_lora_ranks: Option<Vec<u32>>,
    pub backend: NativeBackend,
}

#[derive(Debug, Clone)]
pub struct NativeSessionOptions {
    pub temperature: f32,
    pub random_seed: u64,
    pub top_k: usize,
    pub top_p: Option<f32>,
    pub lora_path: Option<PathBuf>,
}

/// 加载模型权重
pub trait NativeEngine: Send + Sync {
    fn load_model(&self, options: &NativeModelOptions) -> NativeResult<Arc<dyn NativeModel>>;
}

/// 已加载的模型句柄，负责派生会话
pub trait NativeModel: Send + Sync {
    fn create_session(&self, options: &NativeSessionOptions) -> NativeResult<Box<dyn NativeSession>>;
}

/// 每生成一个文本片段回调一次，返回 `Break` 时引擎应尽快停止并返回 `Cancelled`。
pub type TokenCallback<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

pub trait NativeSession: Send {
    fn size_in_tokens(&self, text: &str) -> NativeResult<usize>;

    /// 追加到隐式提示缓冲区
    fn add_query_chunk(&mut self, text: &str) -> NativeResult<()>;

    /// 阻塞直到生成结束，返回完整文本
    fn generate(&mut self, on_token: &mut TokenCallback<'_>) -> NativeResult<String>;
}

pub trait NativeEmbedder: Send {
    /// 返回 `None` 表示引擎没有给出结果
    fn embed(&mut self, text: &str) -> NativeResult<Option<Vec<f32>>>;
}

pub trait EmbedderFactory: Send + Sync {
    fn create(&self, asset_path: &Path) -> NativeResult<Box<dyn NativeEmbedder>>;
}
