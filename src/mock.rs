//! 测试用的原生引擎替身：按空白切分计数token，逐词吐出固定回复。

use crate::native::{
    EmbedderFactory, NativeBackend, NativeEmbedder, NativeEngine, NativeModel, NativeModelOptions,
    NativeSession, NativeSessionOptions, TokenCallback,
};
use crate::types::{NativeError, NativeResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockBehaviour {
    pub response: Vec<String>,
    pub token_delay: Duration,
    /// 输出这么多片段后报错
    pub fail_after: Option<usize>,
    pub fail_load: bool,
    /// 适配器路径 -> 秩
    pub adapters: HashMap<PathBuf, u32>,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            response: vec![
                "Mock ".to_string(),
                "response ".to_string(),
                "stream".to_string(),
            ],
            token_delay: Duration::ZERO,
            fail_after: None,
            fail_load: false,
            adapters: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct Counters {
    pub models_loaded: AtomicUsize,
    pub live_models: AtomicUsize,
    pub live_sessions: AtomicUsize,
    pub max_live_sessions: AtomicUsize,
}

pub struct MockEngine {
    behaviour: MockBehaviour,
    pub counters: Arc<Counters>,
}

impl MockEngine {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl NativeEngine for MockEngine {
    fn load_model(&self, options: &NativeModelOptions) -> NativeResult<Arc<dyn NativeModel>> {
        if self.behaviour.fail_load {
            return Err(NativeError::ModelLoad("corrupt weights".to_string()));
        }
        self.counters.models_loaded.fetch_add(1, Ordering::SeqCst);
        self.counters.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockModel {
            options: options.clone(),
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct MockModel {
    options: NativeModelOptions,
    behaviour: MockBehaviour,
    counters: Arc<Counters>,
}

impl Drop for MockModel {
    fn drop(&mut self) {
        self.counters.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NativeModel for MockModel {
    fn create_session(&self, options: &NativeSessionOptions) -> NativeResult<Box<dyn NativeSession>> {
        if let Some(path) = &options.lora_path {
            let rank = self
                .behaviour
                .adapters
                .get(path)
                .ok_or_else(|| NativeError::InvalidLora(format!("{} not found", path.display())))?;
            let supported = self.options.supported_lora_ranks.as_deref().unwrap_or(&[]);
            if !supported.contains(rank) {
                return Err(NativeError::InvalidLora(format!("rank {} not supported", rank)));
            }
        }

        let live = self.counters.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live_sessions.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            max_tokens: self.options.max_tokens,
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
            used: 0,
        }))
    }
}

struct MockSession {
    max_tokens: usize,
    behaviour: MockBehaviour,
    counters: Arc<Counters>,
    used: usize,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.counters.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NativeSession for MockSession {
    fn size_in_tokens(&self, text: &str) -> NativeResult<usize> {
        Ok(text.split_whitespace().count())
    }

    fn add_query_chunk(&mut self, text: &str) -> NativeResult<()> {
        let requested = self.used + self.size_in_tokens(text)?;
        if requested > self.max_tokens {
            return Err(NativeError::TokenLimit {
                requested,
                limit: self.max_tokens,
            });
        }
        self.used = requested;
        Ok(())
    }

    fn generate(&mut self, on_token: &mut TokenCallback<'_>) -> NativeResult<String> {
        let mut text = String::new();
        for (index, fragment) in self.behaviour.response.iter().enumerate() {
            if self.behaviour.fail_after == Some(index) {
                return Err(NativeError::Inference("mock engine failure".to_string()));
            }
            if !self.behaviour.token_delay.is_zero() {
                std::thread::sleep(self.behaviour.token_delay);
            }
            if on_token(fragment.as_str()).is_break() {
                return Err(NativeError::Cancelled);
            }
            text.push_str(fragment);
        }
        Ok(text)
    }
}

/// 前 `fail_inits` 次创建失败
#[derive(Default)]
pub struct MockEmbedderFactory {
    pub fail_inits: AtomicUsize,
    pub created: AtomicUsize,
}

impl EmbedderFactory for MockEmbedderFactory {
    fn create(&self, _asset_path: &Path) -> NativeResult<Box<dyn NativeEmbedder>> {
        let remaining = self.fail_inits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_inits.store(remaining - 1, Ordering::SeqCst);
            return Err(NativeError::ModelLoad("asset missing".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEmbedder))
    }
}

struct MockEmbedder;

impl NativeEmbedder for MockEmbedder {
    fn embed(&mut self, text: &str) -> NativeResult<Option<Vec<f32>>> {
        if text.is_empty() {
            return Ok(None);
        }
        if text == "explode" {
            return Err(NativeError::Inference("embedder crashed".to_string()));
        }
        let words = text.split_whitespace().count() as f32;
        Ok(Some(vec![words, text.len() as f32, 0.5, -0.5]))
    }
}

impl NativeModelOptions {
    pub fn for_tests(max_tokens: usize) -> Self {
        Self {
            model_path: PathBuf::from("model.bin"),
            tokenizer_path: PathBuf::from("tokenizer.json"),
            max_tokens,
            supported_lora_ranks: None,
            backend: NativeBackend::Default,
        }
    }
}

impl NativeSessionOptions {
    pub fn for_tests() -> Self {
        Self {
            temperature: 0.8,
            random_seed: 42,
            top_k: 40,
            top_p: None,
            lora_path: None,
        }
    }
}
