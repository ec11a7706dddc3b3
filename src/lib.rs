pub mod config;
pub mod types;
pub mod native;
pub mod stream;
pub mod session;
pub mod model;
pub mod embedding;
pub mod engine;
pub mod service;

#[cfg(test)]
mod mock;

// 配置
pub use config::{
    BridgeConfig, EmbedderSettings, ModelConfig, PreferredBackend, SessionConfig,
    StreamSettings, WorkerSettings,
};

// 命令、回复与错误
pub use types::{
    BridgeError, BridgeResult, Command, CommandResult, EmbedError, ErrorCode, ErrorPayload,
    ModelError, NativeError, NativeResult, Reply, SessionError, StreamEvent, StreamMessage,
};

// 原生引擎接口
pub use native::{
    EmbedderFactory, NativeBackend, NativeEmbedder, NativeEngine, NativeModel,
    NativeModelOptions, NativeSession, NativeSessionOptions, TokenCallback,
};

// 流式转发
pub use stream::{ChannelSink, EventSink, SinkEvent};

// 模型与会话
pub use model::InferenceModel;
pub use session::{InferenceSession, SessionState};

// candle 实现
pub use embedding::{BertEmbedderFactory, EmbeddingService};
pub use engine::{CandleEngine, TokenOutputStream};

// 对外入口 (推荐使用)
pub use service::{BridgeStatus, GenAiBridge};
