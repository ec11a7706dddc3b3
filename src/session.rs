use crate::config::SessionConfig;
use crate::native::NativeSession;
use crate::stream::{GenerationStream, StreamSender};
use crate::types::SessionError;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Generating,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Ready => write!(f, "ready"),
            SessionState::Generating => write!(f, "generating"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// 生成许可，同一会话同时只能存在一个；释放时会话回到就绪状态
pub struct GenerationPermit {
    flag: Arc<AtomicBool>,
}

impl GenerationPermit {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct PromptLog {
    chunks: Vec<String>,
    tokens: usize,
}

/// 推理会话
pub struct InferenceSession {
    /// 会话ID
    id: String,
    /// 会话配置
    config: SessionConfig,
    /// 所属模型的token预算
    max_tokens: usize,
    native: Mutex<Option<Box<dyn NativeSession>>>,
    /// 自创建以来追加的提示片段
    prompt: Mutex<PromptLog>,
    generating: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    events: StreamSender,
}

impl InferenceSession {
    pub(crate) fn new(
        native: Box<dyn NativeSession>,
        config: SessionConfig,
        max_tokens: usize,
        events: StreamSender,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            max_tokens,
            native: Mutex::new(Some(native)),
            prompt: Mutex::new(PromptLog::default()),
            generating: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.generating.load(Ordering::Acquire) {
            SessionState::Generating
        } else {
            SessionState::Ready
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn query_chunks(&self) -> Vec<String> {
        self.prompt.lock().chunks.clone()
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt.lock().tokens
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.generating.load(Ordering::Acquire) {
            return Err(SessionError::AlreadyGenerating);
        }
        Ok(())
    }

    fn acquire_permit(&self) -> Result<GenerationPermit, SessionError> {
        self.ensure_open()?;
        GenerationPermit::acquire(&self.generating).ok_or(SessionError::AlreadyGenerating)
    }

    /// 关闭后回调返回 `Break`，原生循环据此提前结束
    fn cancel_check(&self) -> impl FnMut(&str) -> ControlFlow<()> {
        let closed = self.closed.clone();
        move |_| {
            if closed.load(Ordering::Acquire) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }

    pub fn size_in_tokens(&self, prompt: &str) -> Result<usize, SessionError> {
        self.ensure_idle()?;
        let native = self.native.lock();
        let native = native.as_ref().ok_or(SessionError::Closed)?;
        Ok(native.size_in_tokens(prompt)?)
    }

    /// 超出模型token预算时报错，不做截断
    pub fn add_query_chunk(&self, prompt: &str) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let mut native = self.native.lock();
        let native = native.as_mut().ok_or(SessionError::Closed)?;

        let mut log = self.prompt.lock();
        let tokens = native.size_in_tokens(prompt)?;
        let requested = log.tokens + tokens;
        if requested > self.max_tokens {
            return Err(SessionError::TokenLimitExceeded {
                requested,
                limit: self.max_tokens,
            });
        }

        native.add_query_chunk(prompt)?;
        log.chunks.push(prompt.to_string());
        log.tokens = requested;
        debug!(session_id = %self.id, tokens, total = requested, "Query chunk added");
        Ok(())
    }

    /// 只检查会话是否空闲，不占用会话；供调用方在排队等待工作线程前快速失败
    pub fn check_idle(&self) -> Result<(), SessionError> {
        self.ensure_idle()
    }

    /// 占用会话以便稍后在工作线程上阻塞生成
    pub fn begin_generation(&self) -> Result<GenerationPermit, SessionError> {
        self.acquire_permit()
    }

    /// 阻塞生成，直到原生引擎返回完整文本
    pub fn generate_response(&self) -> Result<String, SessionError> {
        let permit = self.acquire_permit()?;
        self.generate_with(permit)
    }

    /// 使用已取得的许可生成，许可在返回时释放
    pub fn generate_with(&self, _permit: GenerationPermit) -> Result<String, SessionError> {
        self.ensure_open()?;
        let start = Instant::now();

        let mut native = self.native.lock();
        let native = native.as_mut().ok_or(SessionError::Closed)?;
        let mut on_token = self.cancel_check();
        let text = native.generate(&mut on_token)?;

        info!(
            session_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "Response generated"
        );
        Ok(text)
    }

    /// 在调用方上下文里占用会话与通道；失败时不会产生任何流事件
    pub fn begin_streaming(&self) -> Result<GenerationStream, SessionError> {
        let permit = self.acquire_permit()?;
        self.events.begin(permit)
    }

    /// 在工作线程上运行流式生成，保证恰好送出一个终止事件
    pub fn run_streaming(&self, stream: GenerationStream) {
        let start = Instant::now();
        let mut fragments = 0usize;

        let result = {
            let mut native = self.native.lock();
            match native.as_mut() {
                None => Err(SessionError::Closed),
                Some(native) => {
                    let mut cancelled = self.cancel_check();
                    let mut on_token = |fragment: &str| {
                        if cancelled(fragment).is_break() {
                            return ControlFlow::Break(());
                        }
                        fragments += 1;
                        stream.partial(fragment);
                        ControlFlow::Continue(())
                    };
                    native
                        .generate(&mut on_token)
                        .map(|_| ())
                        .map_err(SessionError::from)
                }
            }
        };

        match &result {
            Ok(()) => info!(
                session_id = %self.id,
                fragments,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Streaming generation finished"
            ),
            Err(e) => warn!(session_id = %self.id, fragments, error = %e, "Streaming generation failed"),
        }
        stream.finish(result);
    }

    /// 开始流式生成并立即返回，结果通过模型的事件通道送出
    pub fn generate_response_async(
        self: &Arc<Self>,
    ) -> Result<tokio::task::JoinHandle<()>, SessionError> {
        let stream = self.begin_streaming()?;
        let session = self.clone();
        Ok(tokio::task::spawn_blocking(move || session.run_streaming(stream)))
    }

    /// 释放原生会话。生成进行中时先通知取消，等待原生循环退出后再释放；可重复调用。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let native = self.native.lock().take();
        drop(native);
        info!(session_id = %self.id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehaviour, MockEngine};
    use crate::native::{NativeEngine, NativeModelOptions, NativeSessionOptions};
    use crate::stream::{self, StreamReceiver};
    use crate::types::StreamEvent;
    use std::time::Duration;

    fn session_with(behaviour: MockBehaviour, max_tokens: usize) -> (Arc<InferenceSession>, StreamReceiver) {
        let engine = MockEngine::new(behaviour);
        let model = engine
            .load_model(&NativeModelOptions::for_tests(max_tokens))
            .unwrap();
        let native = model
            .create_session(&NativeSessionOptions::for_tests())
            .unwrap();
        let (tx, rx) = stream::channel(64);
        let session = InferenceSession::new(native, SessionConfig::default(), max_tokens, tx);
        (Arc::new(session), rx)
    }

    async fn collect(rx: &StreamReceiver) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(delivery) = rx.recv().await {
            let terminal = delivery.event().is_terminal();
            events.push(match delivery.event() {
                StreamEvent::Partial(text) => StreamEvent::Partial(text.clone()),
                StreamEvent::Done => StreamEvent::Done,
                StreamEvent::Failed(e) => StreamEvent::Failed(match e {
                    SessionError::Closed => SessionError::Closed,
                    other => SessionError::InvalidConfiguration(other.to_string()),
                }),
            });
            if terminal {
                break;
            }
        }
        events
    }

    #[test]
    fn test_session_creation() {
        let (session, _rx) = session_with(MockBehaviour::default(), 512);
        assert!(!session.id().is_empty());
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.query_chunks().is_empty());
    }

    #[test]
    fn test_query_chunks_accumulate() {
        let (session, _rx) = session_with(MockBehaviour::default(), 512);
        let mut last = 0;
        let mut prompt = String::new();
        for chunk in ["Hello", " there, how", " are you today"] {
            session.add_query_chunk(chunk).unwrap();
            prompt.push_str(chunk);
            let size = session.size_in_tokens(&prompt).unwrap();
            assert!(size >= last);
            last = size;
        }
        assert_eq!(session.query_chunks().len(), 3);
        assert_eq!(session.prompt_tokens(), 6);
    }

    #[test]
    fn test_token_budget_is_enforced() {
        let (session, _rx) = session_with(MockBehaviour::default(), 4);
        session.add_query_chunk("one two three").unwrap();
        let err = session.add_query_chunk("four five").unwrap_err();
        assert!(matches!(
            err,
            SessionError::TokenLimitExceeded { requested: 5, limit: 4 }
        ));
        // 失败的片段不会进入日志
        assert_eq!(session.query_chunks(), vec!["one two three".to_string()]);
    }

    #[test]
    fn test_blocking_generation() {
        let (session, _rx) = session_with(MockBehaviour::default(), 512);
        session.add_query_chunk("Hello").unwrap();
        let text = session.generate_response().unwrap();
        assert_eq!(text, "Mock response stream");
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_streaming_generation_terminates_once() {
        let (session, rx) = session_with(MockBehaviour::default(), 512);
        session.add_query_chunk("Hello").unwrap();
        session.generate_response_async().unwrap().await.unwrap();

        let events = collect(&rx).await;
        assert_eq!(events.len(), 4);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_second_generation_fails_fast() {
        let behaviour = MockBehaviour {
            token_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (session, rx) = session_with(behaviour, 512);
        session.add_query_chunk("Hello").unwrap();

        let handle = session.generate_response_async().unwrap();
        assert_eq!(session.state(), SessionState::Generating);
        assert!(matches!(
            session.generate_response_async(),
            Err(SessionError::AlreadyGenerating)
        ));
        assert!(matches!(
            session.generate_response(),
            Err(SessionError::AlreadyGenerating)
        ));
        assert!(matches!(
            session.add_query_chunk("more"),
            Err(SessionError::AlreadyGenerating)
        ));

        handle.await.unwrap();
        let events = collect(&rx).await;
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_held_permit_blocks_other_callers() {
        let (session, _rx) = session_with(MockBehaviour::default(), 512);
        session.add_query_chunk("Hello").unwrap();

        let permit = session.begin_generation().unwrap();
        assert_eq!(session.state(), SessionState::Generating);
        assert!(matches!(session.check_idle(), Err(SessionError::AlreadyGenerating)));
        assert!(matches!(
            session.begin_generation(),
            Err(SessionError::AlreadyGenerating)
        ));

        let text = session.generate_with(permit).unwrap();
        assert_eq!(text, "Mock response stream");
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.check_idle().is_ok());
    }

    #[tokio::test]
    async fn test_native_failure_becomes_terminal_error() {
        let behaviour = MockBehaviour {
            fail_after: Some(1),
            ..Default::default()
        };
        let (session, rx) = session_with(behaviour, 512);
        session.add_query_chunk("Hello").unwrap();
        session.generate_response_async().unwrap().await.unwrap();

        let events = collect(&rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Partial(_)));
        assert!(matches!(events[1], StreamEvent::Failed(_)));
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_generation() {
        let behaviour = MockBehaviour {
            token_delay: Duration::from_millis(100),
            response: vec!["a ".to_string(); 20],
            ..Default::default()
        };
        let (session, rx) = session_with(behaviour, 512);
        session.add_query_chunk("Hello").unwrap();
        let handle = session.generate_response_async().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let closer = session.clone();
        tokio::task::spawn_blocking(move || closer.close())
            .await
            .unwrap();
        handle.await.unwrap();

        let events = collect(&rx).await;
        assert!(events.len() < 21);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Failed(SessionError::Closed))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_closed_session_rejects_everything() {
        let (session, _rx) = session_with(MockBehaviour::default(), 512);
        session.close();
        session.close();
        assert!(matches!(session.size_in_tokens("x"), Err(SessionError::Closed)));
        assert!(matches!(session.add_query_chunk("x"), Err(SessionError::Closed)));
        assert!(matches!(session.generate_response(), Err(SessionError::Closed)));
        assert!(matches!(session.begin_streaming(), Err(SessionError::Closed)));
    }
}
