//! 流注册表
//!
//! 以 stream id 为键，保证同一 id 任意时刻至多一个会话；
//! 同时提供"等待媒体服务器推流"的一次性信号。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};

use crate::sip::SipRequest;
use crate::ssrc::SsrcLease;
use crate::{GatewayError, Result};

/// 一路点播会话
#[derive(Debug)]
pub struct Stream {
    pub id: String,

    /// 创建该流的信令协议标记
    pub protocol: String,

    /// 远端对话确认并推流成功后挂上的 BYE
    teardown: Mutex<Option<SipRequest>>,

    /// 该流占用的 SSRC
    ssrc: Mutex<Option<SsrcLease>>,

    publish_tx: Mutex<Option<oneshot::Sender<()>>>,
    publish_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Stream {
    pub fn new(id: impl Into<String>, protocol: impl Into<String>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            id: id.into(),
            protocol: protocol.into(),
            teardown: Mutex::new(None),
            ssrc: Mutex::new(None),
            publish_tx: Mutex::new(Some(tx)),
            publish_rx: Mutex::new(Some(rx)),
        }
    }

    /// 媒体服务器推流回调触发；重复触发无效果
    pub fn signal_publish(&self) -> bool {
        match lock(&self.publish_tx).take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn set_teardown(&self, request: SipRequest) {
        *lock(&self.teardown) = Some(request);
    }

    pub fn take_teardown(&self) -> Option<SipRequest> {
        lock(&self.teardown).take()
    }

    pub fn has_teardown(&self) -> bool {
        lock(&self.teardown).is_some()
    }

    pub fn set_ssrc(&self, lease: SsrcLease) {
        *lock(&self.ssrc) = Some(lease);
    }

    pub fn take_ssrc(&self) -> Option<SsrcLease> {
        lock(&self.ssrc).take()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 流注册表
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub async fn find(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.read().await.get(id).cloned()
    }

    /// 不存在时插入；已存在返回 StreamAlreadyExists
    pub async fn add(&self, stream: Arc<Stream>) -> Result<()> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(&stream.id) {
            return Err(GatewayError::StreamAlreadyExists(stream.id.clone()));
        }

        tracing::debug!(target: "gb_gateway", stream_id = %stream.id, "Stream registered");
        streams.insert(stream.id.clone(), stream);
        Ok(())
    }

    /// 删除并返回条目，调用方据此发送 BYE
    pub async fn remove(&self, id: &str) -> Option<Arc<Stream>> {
        let stream = self.streams.write().await.remove(id);
        if stream.is_some() {
            tracing::debug!(target: "gb_gateway", stream_id = %id, "Stream removed");
        }
        stream
    }

    /// 仅当注册表中仍是这一路会话时才移除，返回是否移除
    pub async fn remove_if_same(&self, stream: &Arc<Stream>) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get(&stream.id) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                streams.remove(&stream.id);
                tracing::debug!(target: "gb_gateway", stream_id = %stream.id, "Stream removed");
                true
            }
            _ => false,
        }
    }

    /// 条目仍属于这一路会话时挂上 BYE；条目已被关闭时原样交还，由调用方立即发送
    pub async fn attach_teardown(&self, stream: &Arc<Stream>, request: SipRequest) -> Option<SipRequest> {
        let streams = self.streams.read().await;
        match streams.get(&stream.id) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                stream.set_teardown(request);
                None
            }
            _ => Some(request),
        }
    }

    /// 等待推流信号；每路流只允许一个等待者，第二次等待直接返回 false
    pub async fn wait_for_publish(&self, stream: &Stream, timeout: Duration) -> bool {
        let Some(rx) = lock(&stream.publish_rx).take() else {
            tracing::warn!(target: "gb_gateway", stream_id = %stream.id, "publish already awaited");
            return false;
        };

        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::SipMethod;

    const ID: &str = "34020000001320000001/34020000001310000001";

    #[tokio::test]
    async fn test_add_is_exclusive() {
        let registry = StreamRegistry::new();

        registry.add(Arc::new(Stream::new(ID, "28181"))).await.unwrap();
        let second = registry.add(Arc::new(Stream::new(ID, "28181"))).await;

        assert!(matches!(second, Err(GatewayError::StreamAlreadyExists(_))));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_returns_teardown() {
        let registry = StreamRegistry::new();
        let stream = Arc::new(Stream::new(ID, "28181"));
        stream.set_teardown(SipRequest::new(SipMethod::Bye, "sip:x@y".to_string()));
        registry.add(stream).await.unwrap();

        let removed = registry.remove(ID).await.unwrap();
        assert_eq!(removed.take_teardown().unwrap().method, SipMethod::Bye);
        assert!(registry.find(ID).await.is_none());
        assert!(registry.remove(ID).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_if_same_keeps_newer_entry() {
        let registry = StreamRegistry::new();
        let old = Arc::new(Stream::new(ID, "28181"));
        registry.add(old.clone()).await.unwrap();
        registry.remove(ID).await.unwrap();

        let newer = Arc::new(Stream::new(ID, "28181"));
        registry.add(newer.clone()).await.unwrap();

        assert!(!registry.remove_if_same(&old).await);
        assert!(Arc::ptr_eq(&registry.find(ID).await.unwrap(), &newer));
        assert!(registry.remove_if_same(&newer).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_attach_teardown_after_close() {
        let registry = StreamRegistry::new();
        let stream = Arc::new(Stream::new(ID, "28181"));
        registry.add(stream.clone()).await.unwrap();

        let bye = SipRequest::new(SipMethod::Bye, "sip:x@y".to_string());
        assert!(registry.attach_teardown(&stream, bye.clone()).await.is_none());
        assert!(stream.has_teardown());

        stream.take_teardown();
        registry.remove(ID).await.unwrap();
        let returned = registry.attach_teardown(&stream, bye).await;
        assert_eq!(returned.unwrap().method, SipMethod::Bye);
        assert!(!stream.has_teardown());
    }

    #[tokio::test]
    async fn test_publish_signal_before_wait() {
        let registry = StreamRegistry::new();
        let stream = Arc::new(Stream::new(ID, "28181"));

        assert!(stream.signal_publish());
        assert!(!stream.signal_publish());
        assert!(registry.wait_for_publish(&stream, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_publish_signal_during_wait() {
        let registry = StreamRegistry::new();
        let stream = Arc::new(Stream::new(ID, "28181"));

        let signaller = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signaller.signal_publish();
        });

        assert!(registry.wait_for_publish(&stream, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_publish_wait_times_out() {
        let registry = StreamRegistry::new();
        let stream = Stream::new(ID, "28181");

        assert!(!registry.wait_for_publish(&stream, Duration::from_millis(20)).await);
        // 单次使用
        assert!(!registry.wait_for_publish(&stream, Duration::from_millis(20)).await);
    }
}
