// GB28181 设备目录
// 已注册设备的信息与状态，以及面向设备的请求构建

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::media::{MediaEndpoint, SetupMode};
use crate::signaling::{new_call_id, LocalIdentity};
use crate::sip::manscdp::{self, MANSCDP_CONTENT_TYPE};
use crate::sip::sdp::{SdpSession, SessionName};
use crate::sip::{SipMethod, SipRequest};
use crate::{GatewayError, Result};

/// 设备状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// GB28181 设备
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// 设备 ID（20位国标编码）
    pub device_id: String,

    /// 设备名称
    pub name: String,

    /// 设备 IP 地址
    pub ip: String,

    /// 设备端口
    pub port: u16,

    /// 传输协议（UDP/TCP）
    pub transport: String,

    /// 设备状态
    pub status: DeviceStatus,

    /// 注册时间
    pub register_time: DateTime<Utc>,

    /// 最后心跳时间
    pub last_keepalive: DateTime<Utc>,

    /// 过期时间（秒）
    pub expires: u32,

    /// 通道列表
    pub channels: Vec<Channel>,
}

/// 设备通道（摄像头）
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    /// 通道状态（ON/OFF）
    pub status: String,
    pub parent_id: String,
}

impl Device {
    pub fn new(device_id: String, ip: String, port: u16) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            name: String::new(),
            ip,
            port,
            transport: "UDP".to_string(),
            status: DeviceStatus::Online,
            register_time: now,
            last_keepalive: now,
            expires: 3600,
            channels: Vec::new(),
        }
    }

    /// 更新心跳时间
    pub fn update_keepalive(&mut self) {
        self.last_keepalive = Utc::now();
        self.status = DeviceStatus::Online;
    }

    /// 检查是否过期
    pub fn is_expired(&self) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_keepalive);
        elapsed.num_seconds() > self.expires as i64
    }

    /// 设备信令地址
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|e| GatewayError::Sip(format!("Invalid device address {}:{}: {}", self.ip, self.port, e)))
    }

    fn new_request(
        &self,
        identity: &LocalIdentity,
        method: SipMethod,
        target_id: &str,
        cseq: u32,
    ) -> Result<SipRequest> {
        let mut request = SipRequest::new(
            method,
            format!("sip:{}@{}:{}", target_id, self.ip, self.port),
        );

        request.add_header("Via", identity.via_header());
        request.add_header("From", identity.from_header());
        request.add_header("To", format!("<sip:{}@{}>", target_id, identity.domain));
        request.add_header("Call-ID", new_call_id(&identity.domain));
        request.add_header("CSeq", format!("{} {}", cseq, method));
        request.add_header("Max-Forwards", "70");
        request.destination = Some(self.addr()?);

        Ok(request)
    }

    fn build_invite(
        &self,
        identity: &LocalIdentity,
        channel_id: &str,
        ssrc: &str,
        sdp: SdpSession,
    ) -> Result<SipRequest> {
        let mut request = self.new_request(identity, SipMethod::Invite, channel_id, 1)?;
        request.add_header("Contact", identity.contact());
        request.add_header("Subject", format!("{}:{},{}:0", channel_id, ssrc, identity.sip_id));
        request.add_header("Content-Type", "application/sdp");
        request.set_body(sdp.to_string());
        Ok(request)
    }

    fn offer(
        &self,
        identity: &LocalIdentity,
        endpoint: &MediaEndpoint,
        setup: SetupMode,
        ssrc: &str,
        session_name: SessionName,
    ) -> SdpSession {
        let mut sdp = SdpSession::new(identity.sip_id.clone(), endpoint.ip.clone(), session_name);
        sdp.add_video(endpoint.port, setup);
        sdp.ssrc = Some(ssrc.to_string());
        sdp
    }

    /// 实时点播
    pub fn build_live_request(
        &self,
        identity: &LocalIdentity,
        channel_id: &str,
        endpoint: &MediaEndpoint,
        setup: SetupMode,
        ssrc: &str,
    ) -> Result<SipRequest> {
        let sdp = self.offer(identity, endpoint, setup, ssrc, SessionName::Play);
        self.build_invite(identity, channel_id, ssrc, sdp)
    }

    /// 录像回放
    #[allow(clippy::too_many_arguments)]
    pub fn build_playback_request(
        &self,
        identity: &LocalIdentity,
        channel_id: &str,
        endpoint: &MediaEndpoint,
        start: i64,
        end: i64,
        setup: SetupMode,
        ssrc: &str,
    ) -> Result<SipRequest> {
        check_window(start, end)?;

        let mut sdp = self.offer(identity, endpoint, setup, ssrc, SessionName::Playback);
        sdp.uri = Some(format!("{}:0", channel_id));
        sdp.time = (start, end);
        self.build_invite(identity, channel_id, ssrc, sdp)
    }

    /// 录像下载
    #[allow(clippy::too_many_arguments)]
    pub fn build_download_request(
        &self,
        identity: &LocalIdentity,
        channel_id: &str,
        endpoint: &MediaEndpoint,
        start: i64,
        end: i64,
        setup: SetupMode,
        speed: u8,
        ssrc: &str,
    ) -> Result<SipRequest> {
        check_window(start, end)?;

        let mut sdp = self.offer(identity, endpoint, setup, ssrc, SessionName::Download);
        sdp.uri = Some(format!("{}:0", channel_id));
        sdp.time = (start, end);
        sdp.add_media_attribute(format!("downloadspeed:{}", speed));
        self.build_invite(identity, channel_id, ssrc, sdp)
    }

    /// 录像检索
    pub fn build_record_query(
        &self,
        identity: &LocalIdentity,
        channel_id: &str,
        start_time: &str,
        end_time: &str,
        sn: u32,
        record_type: &str,
    ) -> Result<SipRequest> {
        let mut request = self.new_request(identity, SipMethod::Message, &self.device_id, sn)?;
        request.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
        request.set_body(manscdp::record_info_query(sn, channel_id, start_time, end_time, record_type));
        Ok(request)
    }

    /// 订阅移动位置
    pub fn build_position_subscribe(
        &self,
        identity: &LocalIdentity,
        channel_id: &str,
        sn: u32,
    ) -> Result<SipRequest> {
        let mut request = self.new_request(identity, SipMethod::Subscribe, &self.device_id, sn)?;
        request.add_header("Contact", identity.contact());
        request.add_header("Event", format!("presence;id={}", sn));
        request.add_header("Expires", "3600");
        request.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
        request.set_body(manscdp::mobile_position_query(sn, channel_id, 5));
        Ok(request)
    }

    /// 目录查询
    pub fn build_catalog_query(&self, identity: &LocalIdentity, sn: u32) -> Result<SipRequest> {
        let mut request = self.new_request(identity, SipMethod::Message, &self.device_id, sn)?;
        request.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
        request.set_body(manscdp::catalog_query(sn, &self.device_id));
        Ok(request)
    }
}

fn check_window(start: i64, end: i64) -> Result<()> {
    if end < start {
        return Err(GatewayError::InvalidTime(format!(
            "end time {} is before start time {}",
            end, start
        )));
    }
    Ok(())
}

/// 设备管理器
pub struct DeviceManager {
    /// 设备列表（device_id -> Device）
    devices: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册设备（已存在时保留通道列表）
    pub async fn register_device(&self, mut device: Device) {
        let device_id = device.device_id.clone();
        let mut devices = self.devices.write().await;
        if let Some(existing) = devices.get(&device_id) {
            if device.channels.is_empty() {
                device.channels = existing.channels.clone();
            }
            device.register_time = existing.register_time;
        }
        devices.insert(device_id.clone(), device);

        tracing::info!(target: "gb_gateway", %device_id, "Device registered");
    }

    /// 注销设备
    pub async fn unregister_device(&self, device_id: &str) -> Option<Device> {
        let device = self.devices.write().await.remove(device_id);

        if device.is_some() {
            tracing::info!(target: "gb_gateway", %device_id, "Device unregistered");
        }

        device
    }

    /// 获取设备
    pub async fn get_device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// 更新设备心跳
    pub async fn update_keepalive(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().await;

        if let Some(device) = devices.get_mut(device_id) {
            device.update_keepalive();
            tracing::debug!(target: "gb_gateway", %device_id, "Device keepalive updated");
            true
        } else {
            false
        }
    }

    /// 替换设备通道列表
    pub async fn update_channels(&self, device_id: &str, channels: Vec<Channel>) -> bool {
        let mut devices = self.devices.write().await;

        match devices.get_mut(device_id) {
            Some(device) => {
                device.channels = channels;
                true
            }
            None => false,
        }
    }

    /// 列出所有设备
    pub async fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// 清理过期设备
    pub async fn cleanup_expired(&self) -> usize {
        let mut devices = self.devices.write().await;
        let before = devices.len();
        devices.retain(|device_id, d| {
            let keep = !d.is_expired();
            if !keep {
                tracing::info!(target: "gb_gateway", %device_id, "Device expired and removed");
            }
            keep
        });
        before - devices.len()
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
