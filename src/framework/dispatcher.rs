//! 事件分发
//!
//! Bundle 事件和框架事件进入同一个 FIFO 队列，由唯一的分发任务按序投递。
//! 监听器是同步回调，在阻塞线程池中执行；单个监听器 panic 只记录日志，
//! 不影响其他监听器和后续事件。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::event::{BundleEvent, BundleListener, EventListenerId, FrameworkEvent, FrameworkListener};

enum Dispatched {
    Bundle(BundleEvent),
    Framework(FrameworkEvent),
}

enum DispatchItem {
    Event(Dispatched),
    /// 队列屏障：之前入队的事件全部投递完毕后通知
    Barrier(oneshot::Sender<()>),
}

struct Registered<L> {
    id: EventListenerId,
    bundle_id: i64,
    listener: L,
}

#[derive(Default)]
struct ListenerTable {
    bundle: Vec<Registered<BundleListener>>,
    framework: Vec<Registered<FrameworkListener>>,
}

struct DispatcherShared {
    sender: Mutex<Option<mpsc::UnboundedSender<DispatchItem>>>,
    listeners: Arc<RwLock<ListenerTable>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// 事件分发器
///
/// 可克隆，克隆体共享同一队列与监听器表。
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    shared: Arc<DispatcherShared>,
}

impl EventDispatcher {
    /// 创建分发器并启动分发任务（需要在 tokio 运行时内调用）
    pub(crate) fn start() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listeners = Arc::new(RwLock::new(ListenerTable::default()));
        let task = tokio::spawn(Self::run(receiver, Arc::clone(&listeners)));

        Self {
            shared: Arc::new(DispatcherShared {
                sender: Mutex::new(Some(sender)),
                listeners,
                next_id: AtomicU64::new(1),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    async fn run(
        mut receiver: mpsc::UnboundedReceiver<DispatchItem>,
        listeners: Arc<RwLock<ListenerTable>>,
    ) {
        debug!("事件分发任务已启动");
        while let Some(item) = receiver.recv().await {
            match item {
                DispatchItem::Barrier(done) => {
                    let _ = done.send(());
                }
                DispatchItem::Event(event) => {
                    let listeners = Arc::clone(&listeners);
                    if let Err(e) =
                        tokio::task::spawn_blocking(move || Self::deliver(&listeners, event)).await
                    {
                        error!(error = %e, "事件投递任务失败");
                    }
                }
            }
        }
        debug!("事件分发任务已退出");
    }

    fn deliver(listeners: &RwLock<ListenerTable>, event: Dispatched) {
        match event {
            Dispatched::Bundle(event) => {
                let snapshot: Vec<(EventListenerId, BundleListener)> = listeners
                    .read()
                    .bundle
                    .iter()
                    .map(|r| (r.id, Arc::clone(&r.listener)))
                    .collect();
                trace!(
                    bundle_id = event.bundle_id,
                    event_type = %event.event_type,
                    listeners = snapshot.len(),
                    "投递 Bundle 事件"
                );
                for (id, listener) in snapshot {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        error!(listener_id = id, bundle_id = event.bundle_id, "Bundle 监听器 panic");
                    }
                }
            }
            Dispatched::Framework(event) => {
                let snapshot: Vec<(EventListenerId, FrameworkListener)> = listeners
                    .read()
                    .framework
                    .iter()
                    .map(|r| (r.id, Arc::clone(&r.listener)))
                    .collect();
                for (id, listener) in snapshot {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        error!(listener_id = id, "框架监听器 panic");
                    }
                }
            }
        }
    }

    fn send(&self, item: DispatchItem) -> bool {
        match self.shared.sender.lock().as_ref() {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }

    /// 发布 Bundle 事件
    pub(crate) fn publish_bundle(&self, event: BundleEvent) {
        if !self.send(DispatchItem::Event(Dispatched::Bundle(event))) {
            debug!("分发器已关闭，丢弃 Bundle 事件");
        }
    }

    /// 发布框架事件
    pub(crate) fn publish_framework(&self, event: FrameworkEvent) {
        if !self.send(DispatchItem::Event(Dispatched::Framework(event))) {
            debug!("分发器已关闭，丢弃框架事件");
        }
    }

    /// 等待此前入队的事件全部投递完毕
    pub(crate) async fn wait_for_empty_queue(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(DispatchItem::Barrier(done)) {
            let _ = wait.await;
        }
    }

    /// 添加 Bundle 监听器
    pub(crate) fn add_bundle_listener(&self, bundle_id: i64, listener: BundleListener) -> EventListenerId {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.write().bundle.push(Registered {
            id,
            bundle_id,
            listener,
        });
        id
    }

    /// 添加框架监听器
    pub(crate) fn add_framework_listener(
        &self,
        bundle_id: i64,
        listener: FrameworkListener,
    ) -> EventListenerId {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.write().framework.push(Registered {
            id,
            bundle_id,
            listener,
        });
        id
    }

    /// 移除 Bundle 监听器，只能移除本 Bundle 添加的监听器
    pub(crate) fn remove_bundle_listener(&self, bundle_id: i64, id: EventListenerId) -> bool {
        let mut table = self.shared.listeners.write();
        let before = table.bundle.len();
        table.bundle.retain(|r| !(r.id == id && r.bundle_id == bundle_id));
        table.bundle.len() != before
    }

    /// 移除框架监听器，只能移除本 Bundle 添加的监听器
    pub(crate) fn remove_framework_listener(&self, bundle_id: i64, id: EventListenerId) -> bool {
        let mut table = self.shared.listeners.write();
        let before = table.framework.len();
        table.framework.retain(|r| !(r.id == id && r.bundle_id == bundle_id));
        table.framework.len() != before
    }

    /// 移除 Bundle 添加的全部监听器，返回移除数量
    pub(crate) fn remove_all_listeners(&self, bundle_id: i64) -> usize {
        let mut table = self.shared.listeners.write();
        let before = table.bundle.len() + table.framework.len();
        table.bundle.retain(|r| r.bundle_id != bundle_id);
        table.framework.retain(|r| r.bundle_id != bundle_id);
        before - table.bundle.len() - table.framework.len()
    }

    /// 当前监听器数量（Bundle 监听器, 框架监听器）
    #[cfg(test)]
    pub(crate) fn listener_counts(&self) -> (usize, usize) {
        let table = self.shared.listeners.read();
        (table.bundle.len(), table.framework.len())
    }

    /// 队列是否已关闭
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.sender.lock().is_none()
    }

    /// 关闭队列，已入队的事件仍会投递
    pub(crate) fn close(&self) {
        if self.shared.sender.lock().take().is_some() {
            debug!("事件分发器已关闭");
        }
    }

    /// 关闭队列并等待分发任务退出
    pub(crate) async fn shutdown(&self) {
        self.close();
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "事件分发任务异常退出");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::event::{BundleEventType, FrameworkEventType};

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let dispatcher = EventDispatcher::start();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        dispatcher.add_bundle_listener(
            1,
            Arc::new(move |e: &BundleEvent| sink.lock().push(e.event_type)),
        );
        dispatcher.add_bundle_listener(1, Arc::new(|_: &BundleEvent| panic!("listener failure")));

        for event_type in [
            BundleEventType::Installed,
            BundleEventType::Starting,
            BundleEventType::Started,
        ] {
            dispatcher.publish_bundle(BundleEvent::new(event_type, 1, "a", "loc"));
        }
        dispatcher.wait_for_empty_queue().await;

        assert_eq!(
            *seen.lock(),
            vec![
                BundleEventType::Installed,
                BundleEventType::Starting,
                BundleEventType::Started
            ]
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_listeners_by_owner() {
        let dispatcher = EventDispatcher::start();
        let id = dispatcher.add_framework_listener(2, Arc::new(|_: &FrameworkEvent| {}));
        dispatcher.add_bundle_listener(2, Arc::new(|_: &BundleEvent| {}));
        dispatcher.add_bundle_listener(3, Arc::new(|_: &BundleEvent| {}));

        assert!(!dispatcher.remove_framework_listener(3, id));
        assert!(dispatcher.remove_framework_listener(2, id));
        assert_eq!(dispatcher.remove_all_listeners(2), 1);
        assert_eq!(dispatcher.listener_counts(), (1, 0));

        dispatcher.close();
        dispatcher.publish_framework(FrameworkEvent::new(FrameworkEventType::Info, 0, "dropped"));
        dispatcher.wait_for_empty_queue().await;
    }
}
