//! 生成结果的流式通道与转发。
//!
//! 部分结果放在有界队列里，满了丢弃最旧的；终止事件单独占一个槽位，
//! 不受丢弃策略影响，并且总是在本次生成的所有部分结果之后被取出。

use crate::session::GenerationPermit;
use crate::types::{ErrorPayload, NativeError, SessionError, StreamEvent, StreamMessage};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// 唯一的外部事件接收端
pub trait EventSink: Send + Sync {
    fn success(&self, message: StreamMessage);
    fn end_of_stream(&self);
    fn error(&self, payload: ErrorPayload);
}

/// [`ChannelSink`] 转发出去的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Message(StreamMessage),
    EndOfStream,
    Error(ErrorPayload),
}

impl SinkEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SinkEvent::Message(_))
    }
}

/// 把事件转发到 tokio 通道的接收端
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn success(&self, message: StreamMessage) {
        let _ = self.tx.send(SinkEvent::Message(message));
    }

    fn end_of_stream(&self) {
        let _ = self.tx.send(SinkEvent::EndOfStream);
    }

    fn error(&self, payload: ErrorPayload) {
        let _ = self.tx.send(SinkEvent::Error(payload));
    }
}

/// 当前注册的接收端，新注册不会补发之前的事件
#[derive(Default)]
pub struct SinkSlot {
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl SinkSlot {
    /// 返回是否替换了旧的接收端
    pub fn register(&self, sink: Arc<dyn EventSink>) -> bool {
        self.sink.write().replace(sink).is_some()
    }

    pub fn unregister(&self) -> bool {
        self.sink.write().take().is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.sink.read().is_some()
    }

    /// 没有接收端时丢弃事件，返回 false
    pub fn deliver(&self, event: &StreamEvent) -> bool {
        let sink = match self.sink.read().clone() {
            Some(sink) => sink,
            None => return false,
        };

        match event {
            StreamEvent::Partial(text) => sink.success(StreamMessage {
                partial_result: text.clone(),
                done: false,
            }),
            StreamEvent::Done => sink.end_of_stream(),
            StreamEvent::Failed(e) => sink.error(ErrorPayload::from(e)),
        }
        true
    }
}

struct ChannelState {
    partials: VecDeque<String>,
    terminal: Option<Delivery>,
    in_flight: bool,
    closed: bool,
    dropped: u64,
}

struct Shared {
    state: Mutex<ChannelState>,
    notify: Notify,
    capacity: usize,
}

/// 创建模型共享的事件通道
pub fn channel(partial_capacity: usize) -> (StreamSender, StreamReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(ChannelState {
            partials: VecDeque::new(),
            terminal: None,
            in_flight: false,
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
        capacity: partial_capacity.max(1),
    });

    (
        StreamSender {
            shared: shared.clone(),
        },
        StreamReceiver { shared },
    )
}

#[derive(Clone)]
pub struct StreamSender {
    shared: Arc<Shared>,
}

impl StreamSender {
    /// 开始一次生成。上一次生成的终止事件尚未转发完时拒绝，避免两次输出交错。
    pub fn begin(&self, permit: GenerationPermit) -> Result<GenerationStream, SessionError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(SessionError::Closed);
        }
        if state.in_flight || state.terminal.is_some() {
            return Err(SessionError::AlreadyGenerating);
        }
        state.in_flight = true;

        Ok(GenerationStream {
            shared: self.shared.clone(),
            permit: Some(permit),
        })
    }

    /// 关闭后不再接受新的生成；进行中的生成仍会送达终止事件
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// 因缓冲区溢出被丢弃的部分结果数量
    pub fn dropped_partials(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

/// 一次流式生成的写端。未调用 [`GenerationStream::finish`] 就被丢弃时会补发失败事件。
pub struct GenerationStream {
    shared: Arc<Shared>,
    permit: Option<GenerationPermit>,
}

impl GenerationStream {
    pub fn partial(&self, text: &str) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            if state.partials.len() >= self.shared.capacity {
                state.partials.pop_front();
                state.dropped += 1;
                trace!("Partial result buffer full, dropped oldest fragment");
            }
            state.partials.push_back(text.to_string());
        }
        self.shared.notify.notify_one();
    }

    pub fn finish(mut self, result: Result<(), SessionError>) {
        let event = match result {
            Ok(()) => StreamEvent::Done,
            Err(e) => StreamEvent::Failed(e),
        };
        self.push_terminal(event);
    }

    fn push_terminal(&mut self, event: StreamEvent) {
        {
            let mut state = self.shared.state.lock();
            state.in_flight = false;
            state.terminal = Some(Delivery {
                event,
                permit: self.permit.take(),
            });
        }
        self.shared.notify.notify_one();
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.push_terminal(StreamEvent::Failed(SessionError::Engine(
                NativeError::Inference("generation aborted".to_string()),
            )));
        }
    }
}

/// 从通道取出的一个事件。终止事件持有生成许可，释放后会话回到就绪状态。
pub struct Delivery {
    event: StreamEvent,
    permit: Option<GenerationPermit>,
}

impl Delivery {
    pub fn event(&self) -> &StreamEvent {
        &self.event
    }

    /// 释放生成许可并交出事件
    pub fn release(mut self) -> StreamEvent {
        drop(self.permit.take());
        self.event
    }
}

pub struct StreamReceiver {
    shared: Arc<Shared>,
}

impl StreamReceiver {
    /// 通道关闭且没有待转发事件时返回 `None`
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(text) = state.partials.pop_front() {
                    return Some(Delivery {
                        event: StreamEvent::Partial(text),
                        permit: None,
                    });
                }
                if let Some(terminal) = state.terminal.take() {
                    return Some(terminal);
                }
                if state.closed && !state.in_flight {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

/// 把通道中的事件按到达顺序转发给接收端。
///
/// 终止事件先释放许可再送出，接收端看到终止事件时会话已经就绪。
/// 此时终止槽已空，新一轮生成的事件只会排在它之后。
pub async fn relay(receiver: StreamReceiver, sink: Arc<SinkSlot>) {
    let mut forwarded = 0u64;
    let mut discarded = 0u64;

    while let Some(delivery) = receiver.recv().await {
        let event = delivery.release();
        if sink.deliver(&event) {
            forwarded += 1;
        } else {
            discarded += 1;
            trace!("No event sink registered, discarding stream event");
        }
    }

    debug!(forwarded, discarded, "Stream relay finished");
}
