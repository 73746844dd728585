// 测试用的信令/媒体替身，供本库与守护进程的测试共用

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::media::{MediaEndpoint, MediaSourceController, SetupMode};
use crate::signaling::SignalingClient;
use crate::sip::{SipMethod, SipRequest, SipResponse};
use crate::{GatewayError, Result};

type Script = Box<dyn Fn(&SipRequest) -> Vec<SipResponse> + Send + Sync>;

enum Reply {
    /// 按脚本回应答后关闭事务
    Script(Script),
    /// 事务一直不结束
    Hang,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 记录所有发出的请求；带应答的请求按脚本回应
#[derive(Default)]
pub struct MockSignaling {
    reply: Mutex<Option<Reply>>,
    requests: Mutex<Vec<SipRequest>>,
    sent: Mutex<Vec<SipRequest>>,
    failing: Mutex<HashSet<SipMethod>>,
    hanging: Mutex<Vec<mpsc::Sender<SipResponse>>>,
}

impl MockSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_with(&self, script: impl Fn(&SipRequest) -> Vec<SipResponse> + Send + Sync + 'static) {
        *lock(&self.reply) = Some(Reply::Script(Box::new(script)));
    }

    pub fn script_hanging(&self) {
        *lock(&self.reply) = Some(Reply::Hang);
    }

    /// 指定方法的 send 返回错误
    pub fn fail_send(&self, method: SipMethod) {
        lock(&self.failing).insert(method);
    }

    /// send_request 发出的请求
    pub fn requests(&self) -> Vec<SipRequest> {
        lock(&self.requests).clone()
    }

    /// send 发出的请求
    pub fn sent(&self) -> Vec<SipRequest> {
        lock(&self.sent).clone()
    }

    pub fn sent_methods(&self) -> Vec<SipMethod> {
        lock(&self.sent).iter().map(|r| r.method).collect()
    }
}

#[async_trait]
impl SignalingClient for MockSignaling {
    async fn send_request(&self, request: SipRequest) -> Result<mpsc::Receiver<SipResponse>> {
        let (tx, rx) = mpsc::channel(16);

        match &*lock(&self.reply) {
            Some(Reply::Script(script)) => {
                for response in script(&request) {
                    let _ = tx.try_send(response);
                }
            }
            Some(Reply::Hang) => lock(&self.hanging).push(tx),
            None => {}
        }

        lock(&self.requests).push(request);
        Ok(rx)
    }

    async fn send(&self, request: SipRequest) -> Result<()> {
        let failing = lock(&self.failing).contains(&request.method);
        lock(&self.sent).push(request);

        if failing {
            return Err(GatewayError::Transport("mock send failure".to_string()));
        }
        Ok(())
    }
}

/// 按请求构造应答；2xx 带 To tag
pub fn response_for(request: &SipRequest, status_code: u16, body: Option<String>) -> SipResponse {
    let reason = match status_code {
        100 => "Trying",
        200 => "OK",
        486 => "Busy Here",
        _ => "Error",
    };

    let mut response = SipResponse::for_request(request, status_code, reason);
    if (200..300).contains(&status_code) {
        if let Some(to) = request.headers.get("To") {
            response.headers.set("To", format!("{};tag=mock", to));
        }
    }
    if let Some(body) = body {
        response.add_header("Content-Type", "application/sdp");
        response.set_body(body);
    }
    response
}

/// 媒体服务器收流源替身
pub struct MockMedia {
    endpoint: MediaEndpoint,
    fail_create: Mutex<bool>,
    fail_connect: Mutex<bool>,
    created: Mutex<Vec<(String, SetupMode, u32)>>,
    connected: Mutex<Vec<(String, String)>>,
    closed: Mutex<Vec<String>>,
    closed_notify: Notify,
}

impl MockMedia {
    pub fn new() -> Self {
        Self {
            endpoint: MediaEndpoint {
                ip: "10.0.0.5".to_string(),
                port: 30000,
            },
            fail_create: Mutex::new(false),
            fail_connect: Mutex::new(false),
            created: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            closed_notify: Notify::new(),
        }
    }

    pub fn fail_create(&self) {
        *lock(&self.fail_create) = true;
    }

    pub fn fail_connect(&self) {
        *lock(&self.fail_connect) = true;
    }

    pub fn created(&self) -> Vec<(String, SetupMode, u32)> {
        lock(&self.created).clone()
    }

    pub fn connected(&self) -> Vec<(String, String)> {
        lock(&self.connected).clone()
    }

    pub fn closed(&self) -> Vec<String> {
        lock(&self.closed).clone()
    }

    /// 等待至少 n 次 close，最多 2 秒
    pub async fn wait_closed(&self, n: usize) -> bool {
        let wait = async {
            loop {
                let notified = self.closed_notify.notified();
                if lock(&self.closed).len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait).await.is_ok()
    }
}

impl Default for MockMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSourceController for MockMedia {
    async fn create(&self, stream_id: &str, setup: SetupMode, ssrc: u32) -> Result<MediaEndpoint> {
        if *lock(&self.fail_create) {
            return Err(GatewayError::MediaSource("mock create failure".to_string()));
        }
        lock(&self.created).push((stream_id.to_string(), setup, ssrc));
        Ok(self.endpoint.clone())
    }

    async fn connect(&self, stream_id: &str, remote_addr: &str) -> Result<()> {
        if *lock(&self.fail_connect) {
            return Err(GatewayError::MediaSource("mock connect failure".to_string()));
        }
        lock(&self.connected).push((stream_id.to_string(), remote_addr.to_string()));
        Ok(())
    }

    async fn close(&self, stream_id: &str) -> Result<()> {
        lock(&self.closed).push(stream_id.to_string());
        self.closed_notify.notify_waiters();
        Ok(())
    }
}
