// GB28181 SIP 信令端点（UDP）
// 处理设备注册、心跳、目录/录像应答，并为编排器提供带事务的请求发送

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::manscdp::{self, ManscdpMessage};
use super::message::{uri_user, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::correlator::ResponseCorrelator;
use crate::device::{Channel, Device, DeviceManager};
use crate::signaling::{new_branch, LocalIdentity, SignalingClient};
use crate::{GatewayError, Result};

/// 未收到最终应答的事务保留时长
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

/// SIP 服务器配置
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    /// 监听地址
    pub bind_addr: String,

    /// 平台身份与对外地址
    pub identity: LocalIdentity,

    /// 设备过期时间（秒）
    pub device_expires: u32,

    /// 注册密码（Some 时启用 Digest 鉴权）
    pub auth_password: Option<String>,

    /// 清理周期
    pub cleanup_interval: Duration,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            identity: LocalIdentity::default(),
            device_expires: 3600,
            auth_password: None,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// 事务键：Call-ID + CSeq 序号 + 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransactionKey {
    call_id: String,
    seq: u32,
    method: SipMethod,
}

impl TransactionKey {
    fn of_request(req: &SipRequest) -> Option<Self> {
        let cseq = req.cseq()?;
        Some(Self {
            call_id: req.call_id()?.to_string(),
            seq: cseq.seq,
            method: cseq.method,
        })
    }

    fn of_response(resp: &SipResponse) -> Option<Self> {
        let cseq = resp.cseq()?;
        Some(Self {
            call_id: resp.call_id()?.to_string(),
            seq: cseq.seq,
            method: cseq.method,
        })
    }
}

struct Transaction {
    responses: mpsc::Sender<SipResponse>,
    created: Instant,
}

/// GB28181 SIP 服务器
pub struct SipServer {
    config: SipServerConfig,
    device_manager: Arc<DeviceManager>,
    correlator: Arc<ResponseCorrelator<ManscdpMessage>>,
    socket: Arc<UdpSocket>,
    transactions: DashMap<TransactionKey, Transaction>,
}

impl SipServer {
    /// 创建 SIP 服务器
    pub async fn new(
        config: SipServerConfig,
        device_manager: Arc<DeviceManager>,
        correlator: Arc<ResponseCorrelator<ManscdpMessage>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("Failed to bind UDP socket {}: {}", config.bind_addr, e)))?;

        tracing::info!(target: "gb28181::sip", "GB28181 SIP server listening on {}", config.bind_addr);

        Ok(Self {
            config,
            device_manager,
            correlator,
            socket: Arc::new(socket),
            transactions: DashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 获取设备管理器
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.device_manager
    }

    /// 启动服务器
    pub async fn start(self: Arc<Self>) -> Result<()> {
        tracing::info!(target: "gb28181::sip", "GB28181 SIP server started");

        // 启动清理任务
        let server = self.clone();
        tokio::spawn(async move {
            server.cleanup_task().await;
        });

        // 主接收循环
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    let data = buf[..len].to_vec();
                    let server = self.clone();
                    let span = tracing::info_span!("gb28181.sip.handle_message", remote = %addr, bytes = len);

                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_message(data, addr).await {
                                tracing::error!(target: "gb28181::sip", "Failed to handle message from {}: {}", addr, e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::sip", "Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    /// 处理 SIP 消息
    async fn handle_message(&self, data: Vec<u8>, addr: SocketAddr) -> Result<()> {
        let msg_str = String::from_utf8_lossy(&data);

        tracing::debug!(target: "gb28181::sip", "Received SIP message: {}", msg_str);

        let message = SipMessage::from_string(&msg_str)
            .map_err(|e| GatewayError::Sip(format!("Failed to parse SIP message: {}", e)))?;

        match message {
            SipMessage::Request(req) => self.handle_request(req, addr).await,
            SipMessage::Response(resp) => {
                self.handle_response(resp, addr);
                Ok(())
            }
        }
    }

    /// 处理 SIP 请求
    async fn handle_request(&self, req: SipRequest, addr: SocketAddr) -> Result<()> {
        match req.method {
            SipMethod::Register => self.handle_register(req, addr).await,
            SipMethod::Message => self.handle_message_method(req, addr).await,
            SipMethod::Notify => self.handle_notify(req, addr).await,
            SipMethod::Bye => {
                tracing::info!(target: "gb28181::sip", call_id = ?req.call_id(), "BYE from device");
                self.reply(&req, 200, "OK", addr).await
            }
            SipMethod::Ack => Ok(()),
            _ => {
                tracing::warn!(target: "gb28181::sip", "Unsupported SIP method: {}", req.method);
                self.reply(&req, 405, "Method Not Allowed", addr).await
            }
        }
    }

    /// 处理 REGISTER 请求（设备注册/注销）
    async fn handle_register(&self, req: SipRequest, addr: SocketAddr) -> Result<()> {
        let device_id = extract_device_id(&req)?;

        let expires = req
            .headers
            .get("Expires")
            .and_then(|e| e.trim().parse::<u32>().ok())
            .unwrap_or(self.config.device_expires);

        tracing::info!(target: "gb28181::sip", %device_id, expires, "Handling REGISTER");

        if let Some(password) = self.config.auth_password.as_deref() {
            if !self.verify_register_auth(&req, &device_id, password, addr).await? {
                // 已返回 401 挑战
                return Ok(());
            }
        }

        if expires == 0 {
            self.device_manager.unregister_device(&device_id).await;
        } else {
            let mut device = Device::new(device_id.clone(), addr.ip().to_string(), addr.port());
            device.expires = expires;
            device.update_keepalive();
            self.device_manager.register_device(device).await;
        }

        let mut response = SipResponse::for_request(&req, 200, "OK");
        response.add_header("Expires", expires.to_string());
        response.add_header("Date", chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string());
        self.send_response(response, addr).await
    }

    /// 校验 REGISTER Digest 认证
    async fn verify_register_auth(
        &self,
        req: &SipRequest,
        device_id: &str,
        password: &str,
        addr: SocketAddr,
    ) -> Result<bool> {
        let params = req.headers.get("Authorization").and_then(parse_digest_auth_header);

        let Some(params) = params else {
            self.send_unauthorized(req, addr, device_id).await?;
            return Ok(false);
        };

        let username = params.get("username").map(String::as_str).unwrap_or(device_id);
        let realm = params
            .get("realm")
            .map(String::as_str)
            .unwrap_or(self.config.identity.domain.as_str());
        let uri = params.get("uri").map(String::as_str).unwrap_or(req.uri.as_str());

        let (Some(nonce), Some(response)) = (params.get("nonce"), params.get("response")) else {
            self.send_unauthorized(req, addr, device_id).await?;
            return Ok(false);
        };

        if username != device_id {
            tracing::warn!(target: "gb28181::sip", %device_id, auth_username = %username, "REGISTER username mismatch");
            self.send_unauthorized(req, addr, device_id).await?;
            return Ok(false);
        }

        let expected = compute_digest_response(username, realm, password, &req.method.to_string(), uri, nonce);
        if !expected.eq_ignore_ascii_case(response) {
            tracing::warn!(target: "gb28181::sip", %device_id, "REGISTER digest auth failed");
            self.send_unauthorized(req, addr, device_id).await?;
            return Ok(false);
        }

        tracing::debug!(target: "gb28181::sip", %device_id, "REGISTER digest auth success");
        Ok(true)
    }

    /// 发送 401 Unauthorized 挑战
    async fn send_unauthorized(&self, req: &SipRequest, addr: SocketAddr, device_id: &str) -> Result<()> {
        let nonce_source = format!("{}:{}:{}", device_id, addr, chrono::Utc::now().timestamp_millis());
        let nonce = format!("{:x}", md5::compute(nonce_source));

        let mut resp = SipResponse::for_request(req, 401, "Unauthorized");
        resp.add_header(
            "WWW-Authenticate",
            format!(
                "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
                self.config.identity.domain, nonce
            ),
        );

        tracing::warn!(target: "gb28181::sip", %device_id, "Sent 401 Unauthorized for REGISTER");
        self.send_response(resp, addr).await
    }

    /// 处理 MESSAGE 请求（心跳、目录、录像应答）
    async fn handle_message_method(&self, req: SipRequest, addr: SocketAddr) -> Result<()> {
        let device_id = extract_device_id(&req)?;
        let body = req.body.as_deref().unwrap_or_default();

        match manscdp::cmd_type(body) {
            Some("Keepalive") => {
                if !self.device_manager.update_keepalive(&device_id).await {
                    tracing::debug!(target: "gb28181::sip", %device_id, "Keepalive from unregistered device");
                }
            }
            Some("Catalog") => self.handle_catalog_response(&device_id, body).await,
            Some("RecordInfo") => self.handle_record_response(&device_id, body),
            Some(other) => {
                tracing::debug!(target: "gb28181::sip", %device_id, cmd_type = other, "Unhandled MESSAGE");
            }
            None => {
                tracing::debug!(target: "gb28181::sip", %device_id, "MESSAGE without CmdType");
            }
        }

        self.reply(&req, 200, "OK", addr).await
    }

    /// 目录应答：替换设备通道列表
    async fn handle_catalog_response(&self, device_id: &str, body: &str) {
        let catalog = match manscdp::parse_manscdp(body) {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", %device_id, "{}", e);
                return;
            }
        };

        let channels: Vec<Channel> = catalog
            .device_list
            .map(|list| list.items)
            .unwrap_or_default()
            .into_iter()
            .map(|item| Channel {
                channel_id: item.device_id,
                name: item.name,
                manufacturer: item.manufacturer,
                model: item.model,
                status: item.status,
                parent_id: item.parent_id,
            })
            .collect();

        tracing::info!(target: "gb28181::sip", %device_id, channels = channels.len(), "Received catalog from device");
        self.device_manager.update_channels(device_id, channels).await;
    }

    /// 录像应答：按 SN 交给关联器
    fn handle_record_response(&self, device_id: &str, body: &str) {
        let message = match manscdp::parse_manscdp(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", %device_id, "{}", e);
                return;
            }
        };

        let Some(sn) = message.sn else {
            tracing::warn!(target: "gb28181::sip", %device_id, "RecordInfo response without SN");
            return;
        };

        tracing::debug!(
            target: "gb28181::sip",
            %device_id,
            sn,
            sum_num = message.sum_num.unwrap_or(0),
            "RecordInfo response received"
        );
        self.correlator.dispatch(sn, message);
    }

    /// 处理 NOTIFY（移动位置上报）
    async fn handle_notify(&self, req: SipRequest, addr: SocketAddr) -> Result<()> {
        let body = req.body.as_deref().unwrap_or_default();

        if manscdp::cmd_type(body) == Some("MobilePosition") {
            match manscdp::parse_manscdp(body) {
                Ok(position) => tracing::info!(
                    target: "gb28181::sip",
                    device_id = %position.device_id,
                    longitude = ?position.longitude,
                    latitude = ?position.latitude,
                    "Mobile position received"
                ),
                Err(e) => tracing::warn!(target: "gb28181::sip", "{}", e),
            }
        }

        self.reply(&req, 200, "OK", addr).await
    }

    /// 应答路由到等待中的事务；最终应答结束事务
    fn handle_response(&self, resp: SipResponse, addr: SocketAddr) {
        let Some(key) = TransactionKey::of_response(&resp) else {
            tracing::debug!(target: "gb28181::sip", remote = %addr, "Response without Call-ID/CSeq");
            return;
        };

        tracing::debug!(
            target: "gb28181::sip",
            call_id = %key.call_id,
            status = resp.status_code,
            "Received SIP response"
        );

        if resp.is_provisional() {
            if let Some(tx) = self.transactions.get(&key) {
                let _ = tx.responses.try_send(resp);
            }
            return;
        }

        match self.transactions.remove(&key) {
            Some((_, tx)) => {
                let _ = tx.responses.try_send(resp);
            }
            None => {
                tracing::debug!(target: "gb28181::sip", call_id = %key.call_id, "Response for unknown transaction");
            }
        }
    }

    async fn reply(&self, req: &SipRequest, code: u16, reason: &str, addr: SocketAddr) -> Result<()> {
        self.send_response(SipResponse::for_request(req, code, reason), addr).await
    }

    /// 发送响应
    async fn send_response(&self, response: SipResponse, addr: SocketAddr) -> Result<()> {
        self.socket
            .send_to(response.to_string().as_bytes(), addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("Failed to send response: {}", e)))?;

        tracing::debug!(
            target: "gb28181::sip",
            "Sent SIP response to {}: {} {}",
            addr,
            response.status_code,
            response.reason_phrase
        );
        Ok(())
    }

    /// 补 Via 后发往请求目标
    async fn transmit(&self, mut request: SipRequest) -> Result<()> {
        let addr = request
            .destination
            .ok_or_else(|| GatewayError::Transport(format!("{} request has no destination", request.method)))?;

        if !request.headers.contains("Via") {
            let identity = &self.config.identity;
            request.headers.prepend(
                "Via",
                format!(
                    "SIP/2.0/UDP {}:{};rport;branch={}",
                    identity.public_ip,
                    identity.sip_port,
                    new_branch()
                ),
            );
        }

        self.socket
            .send_to(request.to_string().as_bytes(), addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("Failed to send {}: {}", request.method, e)))?;

        tracing::debug!(target: "gb28181::sip", method = %request.method, remote = %addr, "Sent SIP request");
        Ok(())
    }

    /// 清理任务（过期设备、无应答事务）
    async fn cleanup_task(&self) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);

        loop {
            interval.tick().await;

            let expired_devices = self.device_manager.cleanup_expired().await;
            if expired_devices > 0 {
                tracing::info!(target: "gb28181::sip", "Cleaned up {} expired devices", expired_devices);
            }

            let before = self.transactions.len();
            self.transactions.retain(|_, t| t.created.elapsed() < TRANSACTION_TIMEOUT);
            let dropped = before.saturating_sub(self.transactions.len());
            if dropped > 0 {
                tracing::debug!(target: "gb28181::sip", "Dropped {} stale transactions", dropped);
            }
        }
    }
}

#[async_trait]
impl SignalingClient for SipServer {
    async fn send_request(&self, request: SipRequest) -> Result<mpsc::Receiver<SipResponse>> {
        let key = TransactionKey::of_request(&request)
            .ok_or_else(|| GatewayError::Sip("request has no Call-ID/CSeq".to_string()))?;

        let (tx, rx) = mpsc::channel(8);
        self.transactions.insert(
            key.clone(),
            Transaction {
                responses: tx,
                created: Instant::now(),
            },
        );

        if let Err(e) = self.transmit(request).await {
            self.transactions.remove(&key);
            return Err(e);
        }
        Ok(rx)
    }

    async fn send(&self, request: SipRequest) -> Result<()> {
        self.transmit(request).await
    }
}

/// 从 From 头部提取设备 ID
fn extract_device_id(req: &SipRequest) -> Result<String> {
    req.headers
        .get("From")
        .and_then(uri_user)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Sip("Failed to extract device ID".to_string()))
}

fn parse_digest_auth_header(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.trim().strip_prefix("Digest ").unwrap_or(value);

    let map: HashMap<String, String> = rest
        .split(',')
        .filter_map(|part| {
            let (key, val) = part.trim().split_once('=')?;
            Some((key.trim().to_string(), val.trim().trim_matches('"').to_string()))
        })
        .collect();

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// 计算 Digest 响应（不使用 qop）
fn compute_digest_response(username: &str, realm: &str, password: &str, method: &str, uri: &str, nonce: &str) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}
