use crate::config::PreferredBackend;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 对外暴露的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// 模型文件不存在
    NotFound,
    /// 后端、LoRA或采样参数非法
    InvalidConfiguration,
    /// 操作依赖的模型/会话尚未创建
    NotInitialized,
    /// 已有生成任务在进行中
    AlreadyInProgress,
    /// 原生引擎报错
    EngineFailure,
    /// 对象已关闭
    Closed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorCode::NotInitialized => "NOT_INITIALIZED",
            ErrorCode::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            ErrorCode::EngineFailure => "ENGINE_FAILURE",
            ErrorCode::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 原生引擎层错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Invalid LoRA adapter: {0}")]
    InvalidLora(String),

    #[error("Token limit exceeded: {requested} tokens requested, limit is {limit}")]
    TokenLimit { requested: usize, limit: usize },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Generation cancelled")]
    Cancelled,
}

impl From<candle_core::Error> for NativeError {
    fn from(e: candle_core::Error) -> Self {
        NativeError::Inference(e.to_string())
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not found at path: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Invalid preferred backend: {0}")]
    InvalidBackend(String),

    #[error("Invalid model configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to initialize model: {0}")]
    InitializationFailed(#[source] NativeError),
}

impl ModelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ModelError::FileNotFound(_) => ErrorCode::NotFound,
            ModelError::InvalidBackend(_) | ModelError::InvalidConfiguration(_) => {
                ErrorCode::InvalidConfiguration
            }
            ModelError::InitializationFailed(_) => ErrorCode::EngineFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("A response is already being generated")]
    AlreadyGenerating,

    #[error("Invalid LoRA configuration: {0}")]
    InvalidLoraConfiguration(String),

    #[error("Invalid session configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Token limit exceeded: {requested} tokens requested, limit is {limit}")]
    TokenLimitExceeded { requested: usize, limit: usize },

    #[error("Inference engine failure: {0}")]
    Engine(#[source] NativeError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Closed => ErrorCode::Closed,
            SessionError::AlreadyGenerating => ErrorCode::AlreadyInProgress,
            SessionError::InvalidLoraConfiguration(_) | SessionError::InvalidConfiguration(_) => {
                ErrorCode::InvalidConfiguration
            }
            SessionError::TokenLimitExceeded { .. } | SessionError::Engine(_) => {
                ErrorCode::EngineFailure
            }
        }
    }
}

impl From<NativeError> for SessionError {
    fn from(e: NativeError) -> Self {
        match e {
            NativeError::InvalidLora(msg) => SessionError::InvalidLoraConfiguration(msg),
            NativeError::TokenLimit { requested, limit } => {
                SessionError::TokenLimitExceeded { requested, limit }
            }
            NativeError::Cancelled => SessionError::Closed,
            other => SessionError::Engine(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("Failed to initialize text embedder: {0}")]
    InitializationFailed(String),

    #[error("Embedding computation failed: {0}")]
    ComputationFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    #[error("No event sink registered")]
    NoSink,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Worker failure: {0}")]
    Worker(String),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::NotInitialized(_) | BridgeError::NoSink => ErrorCode::NotInitialized,
            BridgeError::Model(e) => e.code(),
            BridgeError::Session(e) => e.code(),
            BridgeError::Embed(_) | BridgeError::Worker(_) => ErrorCode::EngineFailure,
            BridgeError::InvalidCommand(_) => ErrorCode::InvalidConfiguration,
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// 失败命令与流错误共用的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<&SessionError> for ErrorPayload {
    fn from(e: &SessionError) -> Self {
        let payload = ErrorPayload::new(e.code(), e.to_string());
        match e {
            SessionError::TokenLimitExceeded { requested, limit } => payload.with_details(
                serde_json::json!({ "requested": requested, "limit": limit }),
            ),
            _ => payload,
        }
    }
}

impl From<&BridgeError> for ErrorPayload {
    fn from(e: &BridgeError) -> Self {
        match e {
            BridgeError::Session(inner) => inner.into(),
            BridgeError::NotInitialized(component) => ErrorPayload::new(e.code(), e.to_string())
                .with_details(serde_json::json!({ "component": component })),
            BridgeError::Model(ModelError::FileNotFound(path)) => {
                ErrorPayload::new(e.code(), e.to_string())
                    .with_details(serde_json::json!({ "path": path }))
            }
            _ => ErrorPayload::new(e.code(), e.to_string()),
        }
    }
}

impl From<BridgeError> for ErrorPayload {
    fn from(e: BridgeError) -> Self {
        ErrorPayload::from(&e)
    }
}

/// 单次生成产生的流事件
#[derive(Debug)]
pub enum StreamEvent {
    /// 部分生成结果
    Partial(String),
    /// 正常结束
    Done,
    /// 异常结束
    Failed(SessionError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Partial(_))
    }
}

/// 发送给事件接收端的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub partial_result: String,
    pub done: bool,
}

/// 调用方发起的命令（每个命令恰好一个回复）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    CreateModel {
        model_path: PathBuf,
        max_tokens: usize,
        #[serde(default)]
        lora_ranks: Option<Vec<u32>>,
        #[serde(default)]
        preferred_backend: Option<PreferredBackend>,
    },
    CloseModel,
    #[serde(rename_all = "camelCase")]
    CreateSession {
        temperature: f32,
        random_seed: u64,
        top_k: usize,
        #[serde(default)]
        top_p: Option<f32>,
        #[serde(default)]
        lora_path: Option<PathBuf>,
    },
    CloseSession,
    SizeInTokens {
        prompt: String,
    },
    AddQueryChunk {
        prompt: String,
    },
    GenerateResponse,
    GenerateResponseAsync,
    EmbedText {
        text: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateModel { .. } => "createModel",
            Command::CloseModel => "closeModel",
            Command::CreateSession { .. } => "createSession",
            Command::CloseSession => "closeSession",
            Command::SizeInTokens { .. } => "sizeInTokens",
            Command::AddQueryChunk { .. } => "addQueryChunk",
            Command::GenerateResponse => "generateResponse",
            Command::GenerateResponseAsync => "generateResponseAsync",
            Command::EmbedText { .. } => "embedText",
        }
    }
}

/// 命令成功时的返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Unit,
    TokenCount(usize),
    Text(String),
    Embedding(Vec<f64>),
}

pub type CommandResult = std::result::Result<Reply, ErrorPayload>;
