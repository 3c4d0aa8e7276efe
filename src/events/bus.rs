//! 事件总线：按会话的有序扇出
//!
//! 引擎通过 EventPublisher 非阻塞写入会话专属队列；每个会话一个泵任务按序取出并分发给
//! 该会话的全部订阅者（每个订阅者独立的无界通道，慢订阅者不影响引擎与其他订阅者）。
//! 晚到的订阅者只收到订阅之后产生的事件。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::core::SessionId;
use crate::events::{Event, SessionEvent};

/// 单个会话的订阅者列表
#[derive(Default)]
struct Topic {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl Topic {
    fn add(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    fn fan_out(&self, event: &SessionEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// 事件总线（可克隆，内部共享）
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<SessionId, Arc<Topic>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为会话打开新主题并启动泵任务，返回引擎使用的发布端。
    ///
    /// 同一 ID 再次打开时替换旧主题；旧主题的订阅者在旧泵结束后收到流结束。
    pub fn open(&self, session_id: &str) -> EventPublisher {
        let topic = Arc::new(Topic::default());
        if let Ok(mut topics) = self.topics.lock() {
            topics.insert(session_id.to_string(), Arc::clone(&topic));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        let topics = Arc::clone(&self.topics);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                topic.fan_out(&event);
            }
            // 发布端已释放：仅当主题仍是自己时移除
            if let Ok(mut topics) = topics.lock() {
                if topics.get(&sid).is_some_and(|t| Arc::ptr_eq(t, &topic)) {
                    topics.remove(&sid);
                }
            }
            tracing::debug!(session_id = %sid, "event topic closed");
        });

        EventPublisher {
            session_id: session_id.to_string(),
            seq: 0,
            tx,
        }
    }

    /// 订阅会话；会话不存在（或事件流已结束）时返回 None
    pub fn subscribe(&self, session_id: &str) -> Option<EventStream> {
        let topics = self.topics.lock().ok()?;
        topics.get(session_id).map(|topic| EventStream { rx: topic.add() })
    }

    /// 当前打开的主题数
    pub fn topic_count(&self) -> usize {
        self.topics.lock().map(|t| t.len()).unwrap_or(0)
    }
}

/// 引擎侧的发布端：分配序号，写入即返回
#[derive(Debug)]
pub struct EventPublisher {
    session_id: SessionId,
    seq: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventPublisher {
    pub fn emit(&mut self, event: Event) {
        tracing::debug!(session_id = %self.session_id, seq = self.seq, kind = event.kind(), "emit");
        let record = SessionEvent {
            session_id: self.session_id.clone(),
            seq: self.seq,
            event,
        };
        self.seq += 1;
        // 泵任务只在运行时关闭时退出，发送失败可忽略
        let _ = self.tx.send(record);
    }
}

/// 订阅端：按引擎产生顺序接收事件，会话事件流结束后返回 None
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// 收集到终态事件（含）或流结束为止
    pub async fn collect_until_terminal(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.recv().await {
            let terminal = ev.event.is_terminal();
            events.push(ev);
            if terminal {
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CompletionStatus;

    #[tokio::test]
    async fn test_multiple_subscribers_receive_full_ordered_stream() {
        let bus = EventBus::new();
        let mut publisher = bus.open("s1");
        let mut a = bus.subscribe("s1").unwrap();
        let mut b = bus.subscribe("s1").unwrap();

        publisher.emit(Event::PlanGenerated {
            plan: vec!["one".into()],
        });
        publisher.emit(Event::RePlanning {});
        publisher.emit(Event::WorkflowComplete {
            status: CompletionStatus::Success,
        });
        drop(publisher);

        for stream in [&mut a, &mut b] {
            let events = stream.collect_until_terminal().await;
            let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
            assert_eq!(seqs, vec![0, 1, 2]);
            assert_eq!(events[1].event.kind(), "re_planning");
            assert!(stream.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_later_events() {
        let bus = EventBus::new();
        let mut publisher = bus.open("s2");
        let mut early = bus.subscribe("s2").unwrap();
        publisher.emit(Event::RePlanning {});
        // 等待泵任务分发第一个事件后再订阅
        assert_eq!(early.recv().await.unwrap().seq, 0);

        let mut late = bus.subscribe("s2").unwrap();
        publisher.emit(Event::WorkflowComplete {
            status: CompletionStatus::Failed,
        });
        let ev = late.recv().await.unwrap();
        assert_eq!(ev.seq, 1);
        assert!(ev.event.is_terminal());
    }

    #[tokio::test]
    async fn test_topic_removed_after_publisher_dropped() {
        let bus = EventBus::new();
        let publisher = bus.open("s3");
        let mut sub = bus.subscribe("s3").unwrap();
        drop(publisher);
        assert!(sub.recv().await.is_none());
        assert!(bus.subscribe("s3").is_none());
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_has_no_stream() {
        assert!(EventBus::new().subscribe("missing").is_none());
    }
}
