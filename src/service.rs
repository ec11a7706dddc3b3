use crate::config::{BridgeConfig, ModelConfig, SessionConfig, StreamSettings};
use crate::embedding::{BertEmbedderFactory, EmbeddingService};
use crate::engine::CandleEngine;
use crate::model::InferenceModel;
use crate::native::{EmbedderFactory, NativeEngine};
use crate::session::{InferenceSession, SessionState};
use crate::stream::{self, EventSink, SinkSlot};
use crate::types::{BridgeError, BridgeResult, Command, CommandResult, ErrorPayload, Reply};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// 桥接层持有的生命周期状态，同一时刻最多一个模型（及其一个会话）
#[derive(Default)]
struct BridgeState {
    model: Option<Arc<InferenceModel>>,
}

impl BridgeState {
    fn model(&self) -> BridgeResult<Arc<InferenceModel>> {
        self.model.clone().ok_or(BridgeError::NotInitialized("model"))
    }

    fn session(&self) -> BridgeResult<Arc<InferenceSession>> {
        self.model()?
            .active_session()
            .ok_or(BridgeError::NotInitialized("session"))
    }
}

/// 对外状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub model_path: Option<PathBuf>,
    pub session_id: Option<String>,
    pub session_state: Option<String>,
    pub sink_registered: bool,
    pub embedder_initialized: bool,
}

/// 对外唯一的入口：管理模型/会话生命周期并把流式输出转发给接收端
pub struct GenAiBridge {
    /// 原生推理引擎
    engine: Arc<dyn NativeEngine>,
    /// 文本嵌入服务
    embeddings: Arc<EmbeddingService>,
    state: Mutex<BridgeState>,
    sink: Arc<SinkSlot>,
    /// 限制同时进行的原生调用
    workers: Arc<Semaphore>,
    stream_settings: StreamSettings,
}

impl GenAiBridge {
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        embedder_factory: Arc<dyn EmbedderFactory>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            engine,
            embeddings: Arc::new(EmbeddingService::new(
                embedder_factory,
                config.embedder.asset_dir.clone(),
            )),
            state: Mutex::new(BridgeState::default()),
            sink: Arc::new(SinkSlot::default()),
            workers: Arc::new(Semaphore::new(config.workers.max_blocking.max(1))),
            stream_settings: config.stream.clone(),
        }
    }

    /// 使用 candle 推理引擎与 BERT 嵌入器
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            Arc::new(CandleEngine::new()),
            Arc::new(BertEmbedderFactory::new()),
            config,
        )
    }

    /// 注册事件接收端，替换旧的接收端；之前的事件不会补发
    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        if self.sink.register(sink) {
            debug!("Replaced previously registered event sink");
        } else {
            debug!("Event sink registered");
        }
    }

    pub fn unregister_sink(&self) {
        if self.sink.unregister() {
            debug!("Event sink unregistered");
        }
    }

    /// 在受限的阻塞线程池上执行原生调用
    async fn run_blocking<T, F>(&self, f: F) -> BridgeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BridgeError::Worker(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| BridgeError::Worker(e.to_string()))
    }

    /// 关闭句柄时不占用工作许可，否则正在生成的任务可能永远等不到取消
    async fn teardown<F>(&self, f: F) -> BridgeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| BridgeError::Worker(e.to_string()))
    }

    /// 加载新模型。已有模型（及其会话）先被完整关闭。
    pub async fn create_model(&self, config: ModelConfig) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.model.take() {
            info!(path = %previous.config().model_path.display(), "Replacing loaded model");
            self.teardown(move || previous.close()).await?;
        }

        let engine = self.engine.clone();
        let settings = self.stream_settings.clone();
        let model = self
            .run_blocking(move || InferenceModel::create(engine.as_ref(), config, &settings))
            .await??;
        let model = Arc::new(model);

        if let Some(receiver) = model.take_event_receiver() {
            tokio::spawn(stream::relay(receiver, self.sink.clone()));
        }
        state.model = Some(model);
        Ok(())
    }

    /// 没有模型时为空操作
    pub async fn close_model(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        match state.model.take() {
            Some(model) => self.teardown(move || model.close()).await,
            None => {
                debug!("close_model called without a loaded model");
                Ok(())
            }
        }
    }

    /// 参数无效时保留现有会话
    pub async fn create_session(&self, config: SessionConfig) -> BridgeResult<()> {
        let state = self.state.lock().await;
        let model = state.model()?;
        model.check_session_config(&config)?;

        let closing = model.clone();
        self.teardown(move || {
            closing.close_session();
        })
        .await?;

        self.run_blocking(move || model.create_session(config))
            .await??;
        Ok(())
    }

    /// 没有会话时为空操作
    pub async fn close_session(&self) -> BridgeResult<()> {
        let state = self.state.lock().await;
        match state.model.clone() {
            Some(model) => {
                self.teardown(move || {
                    model.close_session();
                })
                .await
            }
            None => Ok(()),
        }
    }

    async fn current_session(&self) -> BridgeResult<Arc<InferenceSession>> {
        self.state.lock().await.session()
    }

    // 会话相关的命令都在等待工作线程之前检查会话是否空闲

    pub async fn size_in_tokens(&self, prompt: String) -> BridgeResult<usize> {
        let session = self.current_session().await?;
        session.check_idle()?;
        Ok(self
            .run_blocking(move || session.size_in_tokens(&prompt))
            .await??)
    }

    pub async fn add_query_chunk(&self, prompt: String) -> BridgeResult<()> {
        let session = self.current_session().await?;
        session.check_idle()?;
        Ok(self
            .run_blocking(move || session.add_query_chunk(&prompt))
            .await??)
    }

    pub async fn generate_response(&self) -> BridgeResult<String> {
        let session = self.current_session().await?;
        let permit = session.begin_generation()?;
        Ok(self
            .run_blocking(move || session.generate_with(permit))
            .await??)
    }

    /// 启动流式生成后立即返回；生成结果与终止事件经由接收端送出
    pub async fn generate_response_async(&self) -> BridgeResult<()> {
        let session = self.current_session().await?;
        if !self.sink.is_registered() {
            return Err(BridgeError::NoSink);
        }

        let stream = session.begin_streaming()?;
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BridgeError::Worker(e.to_string()))?;
        debug!(session_id = %session.id(), "Streaming generation started");
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            session.run_streaming(stream);
        });
        Ok(())
    }

    pub async fn embed_text(&self, text: String) -> BridgeResult<Vec<f64>> {
        let embeddings = self.embeddings.clone();
        Ok(self.run_blocking(move || embeddings.embed(&text)).await??)
    }

    /// 释放模型、会话与嵌入器
    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.close_model().await?;
        let embeddings = self.embeddings.clone();
        self.teardown(move || embeddings.close()).await
    }

    pub async fn status(&self) -> BridgeStatus {
        let state = self.state.lock().await;
        let session = state.session().ok();
        BridgeStatus {
            model_path: state.model.as_ref().map(|m| m.config().model_path.clone()),
            session_id: session.as_ref().map(|s| s.id().to_string()),
            session_state: session.as_ref().map(|s| s.state().to_string()),
            sink_registered: self.sink.is_registered(),
            embedder_initialized: self.embeddings.is_initialized(),
        }
    }

    pub async fn session_state(&self) -> Option<SessionState> {
        self.current_session().await.ok().map(|s| s.state())
    }

    /// 执行一条命令，恰好产生一个回复
    pub async fn handle(&self, command: Command) -> CommandResult {
        let method = command.name();
        let result = match command {
            Command::CreateModel {
                model_path,
                max_tokens,
                lora_ranks,
                preferred_backend,
            } => {
                let config = ModelConfig {
                    model_path,
                    max_tokens,
                    supported_lora_ranks: lora_ranks,
                    preferred_backend,
                    tokenizer_path: None,
                };
                self.create_model(config).await.map(|_| Reply::Unit)
            }
            Command::CloseModel => self.close_model().await.map(|_| Reply::Unit),
            Command::CreateSession {
                temperature,
                random_seed,
                top_k,
                top_p,
                lora_path,
            } => {
                let config = SessionConfig {
                    temperature,
                    random_seed,
                    top_k,
                    top_p,
                    lora_path,
                };
                self.create_session(config).await.map(|_| Reply::Unit)
            }
            Command::CloseSession => self.close_session().await.map(|_| Reply::Unit),
            Command::SizeInTokens { prompt } => {
                self.size_in_tokens(prompt).await.map(Reply::TokenCount)
            }
            Command::AddQueryChunk { prompt } => {
                self.add_query_chunk(prompt).await.map(|_| Reply::Unit)
            }
            Command::GenerateResponse => self.generate_response().await.map(Reply::Text),
            Command::GenerateResponseAsync => {
                self.generate_response_async().await.map(|_| Reply::Unit)
            }
            Command::EmbedText { text } => self.embed_text(text).await.map(Reply::Embedding),
        };

        result.map_err(|e| {
            warn!(method, code = %e.code(), error = %e, "Command failed");
            ErrorPayload::from(e)
        })
    }

    /// 解析并执行 JSON 形式的命令，解析失败同样以错误回复
    pub async fn handle_json(&self, request: serde_json::Value) -> CommandResult {
        match serde_json::from_value::<Command>(request) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                let err = BridgeError::InvalidCommand(e.to_string());
                warn!(error = %err, "Rejected malformed command");
                Err(ErrorPayload::from(err))
            }
        }
    }

    /// 在运行时上异步执行命令，回复通过 oneshot 送回调用方。必须在 tokio 运行时内调用。
    pub fn dispatch(self: &Arc<Self>, command: Command) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        let bridge = self.clone();
        tokio::spawn(async move {
            let reply = bridge.handle(command).await;
            if tx.send(reply).is_err() {
                debug!("Command caller went away before the reply was sent");
            }
        });
        rx
    }
}
