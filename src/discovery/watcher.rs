//! 节点变化订阅
//!
//! 存储的前缀 watch 由后台任务逐条翻译为 [`NodeEvent`]，经有界 channel
//! 交给订阅方。订阅方处理慢时后台任务阻塞在发送上，内存占用不会无限增长。

use futures::{FutureExt, Stream};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use super::node::{Node, NodeEvent};
use super::path::KeyCodec;
use crate::store::{StoreEvent, StoreEventKind, StoreEventStream};

/// 订阅统计
#[derive(Debug, Default)]
pub struct WatchStats {
    delivered: AtomicU64,
    skipped: AtomicU64,
}

impl WatchStats {
    /// 已投递的事件数
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// 因记录无法解析而丢弃的变更数
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }
}

/// 节点变化订阅
///
/// 事件顺序与存储产生的顺序一致。底层 watch 结束后 [`recv`](Self::recv) 返回
/// `None`，订阅不可重启，需要重新调用 `watch`。丢弃订阅会停止后台任务。
pub struct NodeWatcher {
    prefix: String,
    rx: mpsc::Receiver<NodeEvent>,
    token: CancellationToken,
    stats: Arc<WatchStats>,
}

/// 订阅的发送端，由后台任务持有
pub(crate) struct WatchSink {
    tx: mpsc::Sender<NodeEvent>,
    token: CancellationToken,
    stats: Arc<WatchStats>,
}

impl NodeWatcher {
    pub(crate) fn channel(prefix: impl Into<String>, buffer: usize) -> (Self, WatchSink) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let token = CancellationToken::new();
        let stats = Arc::new(WatchStats::default());
        (
            Self {
                prefix: prefix.into(),
                rx,
                token: token.clone(),
                stats: stats.clone(),
            },
            WatchSink { tx, token, stats },
        )
    }

    /// 等待下一个事件
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }

    /// 关闭订阅并停止后台任务
    pub fn close(&mut self) {
        self.token.cancel();
        self.rx.close();
    }

    /// 是否已被关闭
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 订阅的前缀
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn stats(&self) -> &WatchStats {
        &self.stats
    }
}

impl Stream for NodeWatcher {
    type Item = NodeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for NodeWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl WatchSink {
    /// 投递事件，订阅已关闭时返回 false
    pub(crate) async fn send(&self, event: NodeEvent) -> bool {
        let sent = tokio::select! {
            _ = self.token.cancelled() => false,
            result = self.tx.send(event) => result.is_ok(),
        };
        if sent {
            self.stats.delivered.fetch_add(1, Ordering::SeqCst);
        }
        sent
    }

    pub(crate) fn skip(&self) {
        self.stats.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// 单条存储变更的翻译结果
#[derive(Debug, PartialEq)]
enum Translation {
    Event(NodeEvent),
    /// 记录无法解析，已记录日志
    Skipped,
    /// 不属于该前缀的直接子节点
    Foreign,
}

fn translate(scan_prefix: &str, event: &StoreEvent) -> Translation {
    if !KeyCodec::owns(scan_prefix, &event.key) {
        return Translation::Foreign;
    }

    match event.kind {
        StoreEventKind::Put => match Node::decode(&event.value) {
            Ok(node) => Translation::Event(NodeEvent::add(vec![node])),
            Err(e) => {
                error!(key = %event.key, error = %e, "Watch put node decode error");
                Translation::Skipped
            }
        },
        StoreEventKind::Delete => {
            let Some(prev) = event.prev_value.as_deref() else {
                error!(key = %event.key, "Watch delete event carries no previous value");
                return Translation::Skipped;
            };
            match Node::decode(prev) {
                Ok(node) => Translation::Event(NodeEvent::remove(vec![node])),
                Err(e) => {
                    error!(key = %event.key, error = %e, "Watch delete node decode error");
                    Translation::Skipped
                }
            }
        }
    }
}

async fn dispatch(mut events: StoreEventStream, scan_prefix: String, sink: WatchSink) {
    loop {
        let item = tokio::select! {
            _ = sink.token().cancelled() => {
                debug!("Watch closed by subscriber");
                return;
            }
            item = events.next() => item,
        };

        match item {
            Some(Ok(event)) => match translate(&scan_prefix, &event) {
                Translation::Event(node_event) => {
                    if !sink.send(node_event).await {
                        debug!("Watch subscriber gone");
                        return;
                    }
                }
                Translation::Skipped => sink.skip(),
                Translation::Foreign => {}
            },
            Some(Err(e)) => {
                warn!(error = %e, "Watch stream failed");
                return;
            }
            None => {
                debug!("Watch stream ended");
                return;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 启动后台翻译任务，任务内的 panic 只结束该任务
pub(crate) fn spawn_dispatch(
    events: StoreEventStream,
    scan_prefix: String,
    sink: WatchSink,
) -> JoinHandle<()> {
    let span = info_span!("watch", prefix = %scan_prefix);
    let prefix = scan_prefix.clone();
    let task = dispatch(events, scan_prefix, sink);

    tokio::spawn(
        async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                error!(
                    prefix = %prefix,
                    panic = %panic_message(panic.as_ref()),
                    "Watch dispatch task panicked"
                );
            }
        }
        .instrument(span),
    )
}
