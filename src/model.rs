use crate::config::{ModelConfig, PreferredBackend, SessionConfig, StreamSettings};
use crate::native::{NativeBackend, NativeEngine, NativeModel, NativeModelOptions, NativeSessionOptions};
use crate::session::InferenceSession;
use crate::stream::{self, StreamReceiver, StreamSender};
use crate::types::{ModelError, SessionError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// 推理模型：持有原生模型句柄、当前会话以及共享的流事件通道
pub struct InferenceModel {
    config: ModelConfig,
    native: Mutex<Option<Arc<dyn NativeModel>>>,
    session: Mutex<Option<Arc<InferenceSession>>>,
    events: StreamSender,
    receiver: Mutex<Option<StreamReceiver>>,
}

/// 宿主后端到原生后端的映射，原生引擎只认识默认/CPU/GPU三种
pub fn native_backend(preferred: Option<PreferredBackend>) -> Result<NativeBackend, ModelError> {
    match preferred {
        None | Some(PreferredBackend::Unspecified) => Ok(NativeBackend::Default),
        Some(PreferredBackend::Cpu) => Ok(NativeBackend::Cpu),
        Some(PreferredBackend::Gpu) => Ok(NativeBackend::Gpu),
        Some(
            other @ (PreferredBackend::GpuFloat16
            | PreferredBackend::GpuMixed
            | PreferredBackend::GpuFull
            | PreferredBackend::Tpu),
        ) => Err(ModelError::InvalidBackend(format!(
            "{} (ordinal {}) is not supported by the inference engine",
            other, other as u8
        ))),
    }
}

impl InferenceModel {
    /// 阻塞加载模型权重
    pub fn create(
        engine: &dyn NativeEngine,
        config: ModelConfig,
        stream_settings: &StreamSettings,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        if !config.model_path.exists() {
            return Err(ModelError::FileNotFound(config.model_path.clone()));
        }
        let backend = native_backend(config.preferred_backend)?;

        let options = NativeModelOptions {
            model_path: config.model_path.clone(),
            tokenizer_path: config.resolved_tokenizer_path(),
            max_tokens: config.max_tokens,
            supported_lora_ranks: config.supported_lora_ranks.clone(),
            backend,
        };

        let start = Instant::now();
        let native = engine
            .load_model(&options)
            .map_err(ModelError::InitializationFailed)?;
        info!(
            path = %config.model_path.display(),
            max_tokens = config.max_tokens,
            ?backend,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model loaded"
        );

        let (events, receiver) = stream::channel(stream_settings.partial_capacity);
        Ok(Self {
            config,
            native: Mutex::new(Some(native)),
            session: Mutex::new(None),
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.native.lock().is_none()
    }

    /// 事件通道的读端只能取走一次，交给转发任务
    pub fn take_event_receiver(&self) -> Option<StreamReceiver> {
        self.receiver.lock().take()
    }

    pub fn active_session(&self) -> Option<Arc<InferenceSession>> {
        self.session.lock().clone()
    }

    /// 不涉及原生引擎的会话参数检查，失败时已有会话保持不变
    pub fn check_session_config(&self, config: &SessionConfig) -> Result<(), SessionError> {
        config.validate()?;
        if config.lora_path.is_some() && self.config.supported_lora_ranks.is_none() {
            return Err(SessionError::InvalidLoraConfiguration(
                "model declares no supported LoRA ranks".to_string(),
            ));
        }
        Ok(())
    }

    /// 先关闭已有会话，再基于当前模型创建新会话
    pub fn create_session(&self, config: SessionConfig) -> Result<Arc<InferenceSession>, SessionError> {
        self.check_session_config(&config)?;
        self.close_session();

        let native_model = self.native.lock().clone().ok_or(SessionError::Closed)?;
        let options = NativeSessionOptions {
            temperature: config.temperature,
            random_seed: config.random_seed,
            top_k: config.top_k,
            top_p: config.top_p,
            lora_path: config.lora_path.clone(),
        };
        let native_session = native_model.create_session(&options)?;

        let session = Arc::new(InferenceSession::new(
            native_session,
            config,
            self.config.max_tokens,
            self.events.clone(),
        ));
        info!(session_id = %session.id(), "Session created");
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    /// 返回是否确实关闭了一个会话
    pub fn close_session(&self) -> bool {
        let session = self.session.lock().take();
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// 可重复调用
    pub fn close(&self) {
        self.close_session();
        let native = self.native.lock().take();
        if native.is_some() {
            self.events.close();
            drop(native);
            info!(path = %self.config.model_path.display(), "Model closed");
        } else {
            debug!("Model already closed");
        }
    }
}

impl Drop for InferenceModel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehaviour, MockEngine};
    use crate::session::SessionState;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use tempfile::NamedTempFile;

    fn model_file() -> NamedTempFile {
        NamedTempFile::new().unwrap()
    }

    fn create(engine: &MockEngine, config: ModelConfig) -> Result<InferenceModel, ModelError> {
        InferenceModel::create(engine, config, &StreamSettings::default())
    }

    #[test]
    fn test_backend_mapping() {
        assert_eq!(native_backend(None).unwrap(), NativeBackend::Default);
        assert_eq!(
            native_backend(Some(PreferredBackend::Cpu)).unwrap(),
            NativeBackend::Cpu
        );
        for backend in [
            PreferredBackend::GpuFloat16,
            PreferredBackend::GpuMixed,
            PreferredBackend::GpuFull,
            PreferredBackend::Tpu,
        ] {
            assert!(matches!(
                native_backend(Some(backend)),
                Err(ModelError::InvalidBackend(_))
            ));
        }
    }

    #[test]
    fn test_missing_file() {
        let engine = MockEngine::new(MockBehaviour::default());
        let err = create(&engine, ModelConfig::new("/definitely/not/here.bin", 512))
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::FileNotFound(p) if p == PathBuf::from("/definitely/not/here.bin")));
        assert_eq!(engine.counters.models_loaded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_native_failure_is_wrapped() {
        let file = model_file();
        let engine = MockEngine::new(MockBehaviour {
            fail_load: true,
            ..Default::default()
        });
        let err = create(&engine, ModelConfig::new(file.path(), 512)).err().unwrap();
        assert!(matches!(err, ModelError::InitializationFailed(_)));
    }

    #[test]
    fn test_invalid_backend_rejected_before_loading() {
        let file = model_file();
        let engine = MockEngine::new(MockBehaviour::default());
        let config = ModelConfig::new(file.path(), 512).with_backend(PreferredBackend::Tpu);
        assert!(matches!(
            create(&engine, config),
            Err(ModelError::InvalidBackend(_))
        ));
        assert_eq!(engine.counters.models_loaded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_session_replaces_previous() {
        let file = model_file();
        let engine = MockEngine::new(MockBehaviour::default());
        let model = create(&engine, ModelConfig::new(file.path(), 512)).unwrap();

        let first = model.create_session(SessionConfig::default()).unwrap();
        let second = model.create_session(SessionConfig::default()).unwrap();
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(second.state(), SessionState::Ready);
        assert_eq!(engine.counters.max_live_sessions.load(Ordering::SeqCst), 1);
        assert_eq!(engine.counters.live_sessions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lora_validation() {
        let file = model_file();
        let mut behaviour = MockBehaviour::default();
        behaviour.adapters.insert(PathBuf::from("r4.bin"), 4);
        behaviour.adapters.insert(PathBuf::from("r16.bin"), 16);
        let engine = MockEngine::new(behaviour);

        let plain = create(&engine, ModelConfig::new(file.path(), 512)).unwrap();
        let config = SessionConfig {
            lora_path: Some(PathBuf::from("r4.bin")),
            ..Default::default()
        };
        assert!(matches!(
            plain.create_session(config.clone()),
            Err(SessionError::InvalidLoraConfiguration(_))
        ));

        let lora = create(
            &engine,
            ModelConfig::new(file.path(), 512).with_lora_ranks(vec![4, 8]),
        )
        .unwrap();
        assert!(lora.create_session(config).is_ok());
        let config = SessionConfig {
            lora_path: Some(PathBuf::from("r16.bin")),
            ..Default::default()
        };
        assert!(matches!(
            lora.create_session(config),
            Err(SessionError::InvalidLoraConfiguration(_))
        ));
    }

    #[test]
    fn test_rejected_config_keeps_current_session() {
        let file = model_file();
        let engine = MockEngine::new(MockBehaviour::default());
        let model = create(&engine, ModelConfig::new(file.path(), 512)).unwrap();
        let session = model.create_session(SessionConfig::default()).unwrap();

        let config = SessionConfig {
            temperature: 5.0,
            ..Default::default()
        };
        assert!(matches!(
            model.create_session(config),
            Err(SessionError::InvalidConfiguration(_))
        ));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(model.active_session().map(|s| s.id().to_string()), Some(session.id().to_string()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let file = model_file();
        let engine = MockEngine::new(MockBehaviour::default());
        let model = create(&engine, ModelConfig::new(file.path(), 512)).unwrap();
        let session = model.create_session(SessionConfig::default()).unwrap();

        model.close();
        model.close();
        assert!(model.is_closed());
        assert!(session.is_closed());
        assert_eq!(engine.counters.live_models.load(Ordering::SeqCst), 0);
        assert_eq!(engine.counters.live_sessions.load(Ordering::SeqCst), 0);
        assert!(matches!(
            model.create_session(SessionConfig::default()),
            Err(SessionError::Closed)
        ));
    }
}
