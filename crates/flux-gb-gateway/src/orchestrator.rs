//! 点播会话编排
//!
//! 一次 on_play 对应一次编排：校验 stream id、登记流、分配 SSRC 和收流源、
//! 向设备发 INVITE、处理应答并 ACK、主动模式下连接设备媒体地址、
//! 等待媒体服务器推流回调。任何失败都走到 `TornDown`，统一释放注册表条目和收流源。
//!
//! ```text
//! Idle -> SourceAllocated -> RequestSent -> Answered -> AckSent -> WaitingPublish -> Published
//!   \            \               \             \           \              \
//!    +------------+---------------+-------------+-----------+--------------+--> TornDown
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeZone};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::device::{Device, DeviceManager};
use crate::media::{MediaEndpoint, MediaSourceController, SetupMode};
use crate::registry::{Stream, StreamRegistry};
use crate::signaling::{LocalIdentity, SignalingClient};
use crate::sip::message::rewrite_uri_host;
use crate::sip::{CSeq, SdpSession, SipMethod, SipRequest, SipResponse};
use crate::ssrc::{SsrcAllocator, SsrcKind};
use crate::{GatewayError, Result, GB28181_PROTOCOL};

const MAX_DOWNLOAD_SPEED: i64 = 4;

/// 编排相关超时
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// INVITE 事务截止时间
    pub invite: Duration,
    /// 等待推流回调的上限
    pub publish: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            invite: Duration::from_secs(10),
            publish: Duration::from_secs(10),
        }
    }
}

/// stream id 解析出的设备与通道
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub device_id: String,
    pub channel_id: String,
}

/// 解析 `<deviceId>/<channelId>[.<suffix>]`；不是国标流时返回 None
pub fn parse_stream_id(stream_id: &str) -> Option<StreamTarget> {
    let mut parts = stream_id.split('/');
    let (device_id, channel_id) = match (parts.next(), parts.next(), parts.next()) {
        (Some(d), Some(c), None) => (d, c),
        _ => return None,
    };

    if device_id.len() != 20 || channel_id.len() < 20 {
        return None;
    }

    Some(StreamTarget {
        device_id: device_id.to_string(),
        channel_id: channel_id.chars().take(20).collect(),
    })
}

/// 点播类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayKind {
    Live,
    Playback { start: i64, end: i64 },
    Download { start: i64, end: i64, speed: u8 },
}

impl PlayKind {
    fn ssrc_kind(&self) -> SsrcKind {
        match self {
            PlayKind::Live => SsrcKind::Live,
            PlayKind::Playback { .. } | PlayKind::Download { .. } => SsrcKind::OnDemand,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PlayKind::Live => "live",
            PlayKind::Playback { .. } => "playback",
            PlayKind::Download { .. } => "download",
        }
    }
}

/// on_play 查询参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayParams {
    pub setup: SetupMode,
    pub kind: PlayKind,
}

impl PlayParams {
    /// 解析 setup/stream_type/start_time/end_time/speed
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| query.get(key).map(|v| v.trim().to_ascii_lowercase()).unwrap_or_default();

        let setup = SetupMode::parse(&get("setup"));
        let stream_type = get("stream_type");

        let kind = match stream_type.as_str() {
            "playback" | "download" => {
                let start = parse_local_time(&get("start_time"))?;
                let end = parse_local_time(&get("end_time"))?;

                if stream_type == "playback" {
                    PlayKind::Playback { start, end }
                } else {
                    let speed = get("speed").parse::<i64>().unwrap_or(0);
                    PlayKind::Download {
                        start,
                        end,
                        speed: speed.clamp(0, MAX_DOWNLOAD_SPEED) as u8,
                    }
                }
            }
            _ => PlayKind::Live,
        };

        Ok(Self { setup, kind })
    }
}

/// `YYYY-MM-DDThh:mm:ss`，按本地时区转为秒级时间戳
pub fn parse_local_time(s: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(&s.trim().to_ascii_uppercase(), "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| GatewayError::InvalidTime(format!("{}: {}", s, e)))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
        .ok_or_else(|| GatewayError::InvalidTime(format!("{}: not representable in local time", s)))
}

/// 一次编排的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// 不是本网关的流
    Ignored,
    /// 同 id 的流已存在
    AlreadyPlaying,
    /// 设备未注册
    DeviceOffline,
    /// 推流成功
    Published,
    /// 编排失败，已清理
    Failed(String),
}

/// 编排状态
enum PlayState {
    Idle,
    SourceAllocated {
        endpoint: MediaEndpoint,
        ssrc: String,
    },
    RequestSent {
        invite: SipRequest,
        responses: mpsc::Receiver<SipResponse>,
        deadline: Instant,
    },
    Answered {
        invite: SipRequest,
        response: SipResponse,
    },
    AckSent {
        answer: String,
        teardown: SipRequest,
    },
    WaitingPublish {
        teardown: SipRequest,
    },
    Published,
    TornDown {
        reason: String,
        /// 已确认的对话需要 BYE
        teardown: Option<SipRequest>,
    },
}

impl PlayState {
    fn name(&self) -> &'static str {
        match self {
            PlayState::Idle => "idle",
            PlayState::SourceAllocated { .. } => "source_allocated",
            PlayState::RequestSent { .. } => "request_sent",
            PlayState::Answered { .. } => "answered",
            PlayState::AckSent { .. } => "ack_sent",
            PlayState::WaitingPublish { .. } => "waiting_publish",
            PlayState::Published => "published",
            PlayState::TornDown { .. } => "torn_down",
        }
    }

    fn torn_down(reason: impl Into<String>, teardown: Option<SipRequest>) -> Self {
        PlayState::TornDown {
            reason: reason.into(),
            teardown,
        }
    }
}

/// 一次编排的上下文
struct PlayContext {
    stream: Arc<Stream>,
    device: Device,
    target: StreamTarget,
    params: PlayParams,
}

/// 点播会话编排器
pub struct SessionOrchestrator {
    identity: LocalIdentity,
    registry: Arc<StreamRegistry>,
    devices: Arc<DeviceManager>,
    signaling: Arc<dyn SignalingClient>,
    media: Arc<dyn MediaSourceController>,
    ssrc: Arc<SsrcAllocator>,
    timeouts: SessionTimeouts,
}

impl SessionOrchestrator {
    pub fn new(
        identity: LocalIdentity,
        registry: Arc<StreamRegistry>,
        devices: Arc<DeviceManager>,
        signaling: Arc<dyn SignalingClient>,
        media: Arc<dyn MediaSourceController>,
        ssrc: Arc<SsrcAllocator>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            identity,
            registry,
            devices,
            signaling,
            media,
            ssrc,
            timeouts,
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// 处理 on_play
    pub async fn play(&self, stream_id: &str, query: &HashMap<String, String>) -> PlayOutcome {
        if self.registry.find(stream_id).await.is_some() {
            return PlayOutcome::AlreadyPlaying;
        }

        let Some(target) = parse_stream_id(stream_id) else {
            return PlayOutcome::Ignored;
        };

        let Some(device) = self.devices.get_device(&target.device_id).await else {
            tracing::warn!(target: "gb_gateway", device_id = %target.device_id, "Device offline");
            return PlayOutcome::DeviceOffline;
        };

        let stream = Arc::new(Stream::new(stream_id, GB28181_PROTOCOL));
        if self.registry.add(stream.clone()).await.is_err() {
            return PlayOutcome::AlreadyPlaying;
        }

        let params = match PlayParams::from_query(query) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(target: "gb_gateway", %stream_id, "Invalid play parameters: {}", e);
                self.cleanup(&stream, None).await;
                return PlayOutcome::Failed(e.to_string());
            }
        };

        tracing::info!(
            target: "gb_gateway",
            %stream_id,
            kind = params.kind.name(),
            setup = params.setup.as_str(),
            "Play requested"
        );

        let mut ctx = PlayContext {
            stream,
            device,
            target,
            params,
        };

        let mut state = PlayState::Idle;
        loop {
            state = match state {
                PlayState::Published => return PlayOutcome::Published,
                PlayState::TornDown { reason, teardown } => {
                    tracing::warn!(target: "gb_gateway", %stream_id, %reason, "Play torn down");
                    self.cleanup(&ctx.stream, teardown).await;
                    return PlayOutcome::Failed(reason);
                }
                state => {
                    let from = state.name();
                    let next = self.step(&mut ctx, state).await;
                    tracing::debug!(target: "gb_gateway", %stream_id, from, to = next.name(), "Play state transition");
                    next
                }
            };
        }
    }

    /// 状态转移
    async fn step(&self, ctx: &mut PlayContext, state: PlayState) -> PlayState {
        match state {
            PlayState::Idle => self.allocate_source(ctx).await,
            PlayState::SourceAllocated { endpoint, ssrc } => self.send_invite(ctx, &endpoint, &ssrc).await,
            PlayState::RequestSent {
                invite,
                responses,
                deadline,
            } => self.await_final_response(invite, responses, deadline).await,
            PlayState::Answered { invite, response } => self.acknowledge(invite, response).await,
            PlayState::AckSent { answer, teardown } => self.connect_active(ctx, &answer, teardown).await,
            PlayState::WaitingPublish { teardown } => {
                if !self.registry.wait_for_publish(&ctx.stream, self.timeouts.publish).await {
                    return PlayState::torn_down("publish timeout", Some(teardown));
                }

                // 推流回调与关流回调可能交错，条目已不属于本会话时立即 BYE
                match self.registry.attach_teardown(&ctx.stream, teardown).await {
                    None => {
                        tracing::info!(target: "gb_gateway", stream_id = %ctx.stream.id, "Stream published");
                        PlayState::Published
                    }
                    Some(teardown) => PlayState::torn_down("stream closed before publish completed", Some(teardown)),
                }
            }
            terminal @ (PlayState::Published | PlayState::TornDown { .. }) => terminal,
        }
    }

    async fn allocate_source(&self, ctx: &mut PlayContext) -> PlayState {
        let lease = match self.ssrc.allocate(ctx.params.kind.ssrc_kind()) {
            Ok(lease) => lease,
            Err(e) => return PlayState::torn_down(e.to_string(), None),
        };
        let ssrc = lease.text.clone();
        let value = lease.value();
        ctx.stream.set_ssrc(lease);

        match self.media.create(&ctx.stream.id, ctx.params.setup, value).await {
            Ok(endpoint) => {
                tracing::info!(
                    target: "gb_gateway",
                    stream_id = %ctx.stream.id,
                    %ssrc,
                    ip = %endpoint.ip,
                    port = endpoint.port,
                    "Media source created"
                );
                PlayState::SourceAllocated { endpoint, ssrc }
            }
            Err(e) => PlayState::torn_down(format!("create media source: {}", e), None),
        }
    }

    fn build_invite(&self, ctx: &PlayContext, endpoint: &MediaEndpoint, ssrc: &str) -> Result<SipRequest> {
        let channel_id = &ctx.target.channel_id;
        let setup = ctx.params.setup;

        match ctx.params.kind {
            PlayKind::Live => ctx
                .device
                .build_live_request(&self.identity, channel_id, endpoint, setup, ssrc),
            PlayKind::Playback { start, end } => ctx
                .device
                .build_playback_request(&self.identity, channel_id, endpoint, start, end, setup, ssrc),
            PlayKind::Download { start, end, speed } => ctx.device.build_download_request(
                &self.identity,
                channel_id,
                endpoint,
                start,
                end,
                setup,
                speed,
                ssrc,
            ),
        }
    }

    async fn send_invite(&self, ctx: &PlayContext, endpoint: &MediaEndpoint, ssrc: &str) -> PlayState {
        let invite = match self.build_invite(ctx, endpoint, ssrc) {
            Ok(invite) => invite,
            Err(e) => return PlayState::torn_down(format!("build request: {}", e), None),
        };

        match self.signaling.send_request(invite.clone()).await {
            Ok(responses) => PlayState::RequestSent {
                invite,
                responses,
                deadline: Instant::now() + self.timeouts.invite,
            },
            Err(e) => PlayState::torn_down(format!("send INVITE: {}", e), None),
        }
    }

    /// 1xx 忽略，2xx 进入 Answered，其余终止；截止时间到即取消
    async fn await_final_response(
        &self,
        invite: SipRequest,
        mut responses: mpsc::Receiver<SipResponse>,
        deadline: Instant,
    ) -> PlayState {
        loop {
            match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => return PlayState::torn_down("INVITE timeout", None),
                Ok(None) => return PlayState::torn_down("INVITE transaction closed", None),
                Ok(Some(response)) if response.is_provisional() => continue,
                Ok(Some(response)) if response.is_success() => {
                    return PlayState::Answered { invite, response };
                }
                Ok(Some(response)) => {
                    return PlayState::torn_down(
                        format!("INVITE rejected: {} {}", response.status_code, response.reason_phrase),
                        None,
                    );
                }
            }
        }
    }

    async fn acknowledge(&self, invite: SipRequest, response: SipResponse) -> PlayState {
        let answer = response.body.clone().unwrap_or_default();

        let mut ack = build_ack(&self.identity, &invite, &response);
        ack.add_header("Contact", self.identity.contact());
        // answer 中的 contact 不可信，请求目标改为本平台对外地址
        ack.uri = rewrite_uri_host(&ack.uri, &self.identity.public_ip, self.identity.sip_port);

        tracing::info!(target: "gb_gateway", call_id = ?ack.call_id(), "Send ACK");

        if let Err(e) = self.signaling.send(ack.clone()).await {
            return PlayState::torn_down(format!("send ACK: {}", e), None);
        }

        PlayState::AckSent {
            answer,
            teardown: derive_teardown(&ack),
        }
    }

    async fn connect_active(&self, ctx: &PlayContext, answer: &str, teardown: SipRequest) -> PlayState {
        if ctx.params.setup != SetupMode::Active {
            return PlayState::WaitingPublish { teardown };
        }

        let sdp = match SdpSession::from_string(answer) {
            Ok(sdp) => sdp,
            Err(e) => return PlayState::torn_down(format!("parse answer: {}", e), Some(teardown)),
        };

        let port = match sdp.video() {
            Some(video) if video.port != 0 => video.port,
            _ => return PlayState::torn_down("answer has no video address", Some(teardown)),
        };

        let addr = format!("{}:{}", sdp.address, port);
        match self.media.connect(&ctx.stream.id, &addr).await {
            Ok(()) => PlayState::WaitingPublish { teardown },
            Err(e) => PlayState::torn_down(format!("connect {}: {}", addr, e), Some(teardown)),
        }
    }

    /// 终止：已确认的对话发 BYE；注册表条目仍是本会话时移除并异步释放收流源，
    /// 否则已由 close_stream 释放过
    async fn cleanup(&self, stream: &Arc<Stream>, teardown: Option<SipRequest>) {
        if let Some(bye) = teardown {
            self.send_teardown(&stream.id, bye).await;
        }

        if self.registry.remove_if_same(stream).await {
            self.release(stream.clone());
        }
    }

    async fn send_teardown(&self, stream_id: &str, bye: SipRequest) {
        tracing::info!(target: "gb_gateway", %stream_id, "Send BYE");
        if let Err(e) = self.signaling.send(bye).await {
            tracing::error!(target: "gb_gateway", %stream_id, "Failed to send BYE: {}", e);
        }
    }

    /// 关闭收流源后归还 SSRC
    fn release(&self, stream: Arc<Stream>) {
        let media = self.media.clone();
        let ssrc = self.ssrc.clone();
        tokio::spawn(async move {
            if let Err(e) = media.close(&stream.id).await {
                tracing::warn!(target: "gb_gateway", stream_id = %stream.id, "Failed to close media source: {}", e);
            }
            if let Some(lease) = stream.take_ssrc() {
                ssrc.release(&lease);
            }
        });
    }

    /// 关闭流：发送挂在流上的 BYE 并释放资源
    pub async fn close_stream(&self, stream_id: &str) -> bool {
        let Some(stream) = self.registry.remove(stream_id).await else {
            return false;
        };

        if let Some(bye) = stream.take_teardown() {
            self.send_teardown(stream_id, bye).await;
        }
        self.release(stream);

        tracing::info!(target: "gb_gateway", %stream_id, "Stream closed");
        true
    }

    /// on_publish：唤醒等待中的编排
    pub async fn on_publish(&self, stream_id: &str) -> bool {
        match self.registry.find(stream_id).await {
            Some(stream) => stream.signal_publish(),
            None => false,
        }
    }

    /// on_publish_done
    pub async fn on_publish_done(&self, stream_id: &str) -> bool {
        self.close_stream(stream_id).await
    }

    /// on_idle_timeout / on_receive_timeout；返回 true 表示拒绝并关闭了流。
    /// rtmp 自行处理超时，不关闭。
    pub async fn on_stream_timeout(&self, stream_id: &str, protocol: &str) -> bool {
        if protocol == "rtmp" {
            return false;
        }

        self.close_stream(stream_id).await;
        true
    }
}

/// 按 INVITE 和 2xx 应答构造 ACK；2xx 的 ACK 是独立事务，使用新的 branch
pub fn build_ack(identity: &LocalIdentity, invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
    ack.destination = invite.destination;

    ack.add_header("Via", identity.via_header());
    for route in response.headers.get_all("Record-Route").collect::<Vec<_>>().into_iter().rev() {
        ack.add_header("Route", route);
    }
    if let Some(from) = invite.headers.get("From") {
        ack.add_header("From", from);
    }
    if let Some(to) = response.headers.get("To").or_else(|| invite.headers.get("To")) {
        ack.add_header("To", to);
    }
    if let Some(call_id) = invite.call_id() {
        ack.add_header("Call-ID", call_id);
    }

    let seq = invite.cseq().map(|c| c.seq).unwrap_or(1);
    ack.set_cseq(CSeq { seq, method: SipMethod::Ack });
    ack.add_header("Max-Forwards", "70");

    ack
}

/// 由 ACK 派生 BYE：改方法、去掉顶层 Via、CSeq 加一
pub fn derive_teardown(ack: &SipRequest) -> SipRequest {
    let mut bye = ack.clone();
    bye.method = SipMethod::Bye;
    bye.headers.remove_first("Via");

    let seq = ack.cseq().map(|c| c.seq).unwrap_or(1);
    bye.set_cseq(CSeq {
        seq: seq + 1,
        method: SipMethod::Bye,
    });

    bye
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{response_for, MockMedia, MockSignaling};

    const STREAM_ID: &str = "34020000001320000001/34020000001310000001";
    const DEVICE_ID: &str = "34020000001320000001";

    struct Harness {
        orchestrator: Arc<SessionOrchestrator>,
        signaling: Arc<MockSignaling>,
        media: Arc<MockMedia>,
        ssrc: Arc<SsrcAllocator>,
    }

    async fn harness() -> Harness {
        let devices = Arc::new(DeviceManager::new());
        devices
            .register_device(Device::new(DEVICE_ID.to_string(), "192.168.1.64".to_string(), 5060))
            .await;

        let signaling = Arc::new(MockSignaling::new());
        let media = Arc::new(MockMedia::new());
        let identity = LocalIdentity {
            public_ip: "203.0.113.10".to_string(),
            sip_port: 15060,
            ..LocalIdentity::default()
        };
        let ssrc = Arc::new(SsrcAllocator::new(&identity.sip_id));

        let orchestrator = Arc::new(SessionOrchestrator::new(
            identity,
            Arc::new(StreamRegistry::new()),
            devices,
            signaling.clone(),
            media.clone(),
            ssrc.clone(),
            SessionTimeouts {
                invite: Duration::from_millis(300),
                publish: Duration::from_millis(200),
            },
        ));

        Harness {
            orchestrator,
            signaling,
            media,
            ssrc,
        }
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    const ANSWER: &str = "v=0\r\no=34020000001310000001 0 0 IN IP4 192.168.1.64\r\ns=Play\r\n\
                          c=IN IP4 192.168.1.64\r\nt=0 0\r\nm=video 36000 TCP/RTP/AVP 96\r\n\
                          a=setup:passive\r\ny=0200000001\r\n";

    /// 100 Trying + 200 OK 应答脚本
    fn answer_with(h: &Harness, body: &'static str) {
        h.signaling.script_with(move |invite| {
            vec![
                response_for(invite, 100, None),
                response_for(invite, 200, Some(body.to_string())),
            ]
        });
    }

    fn publish_soon(h: &Harness) {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                if orchestrator.on_publish(STREAM_ID).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    /// 等待 ACK 发出，此时编排已进入等待推流
    async fn wait_for_ack(h: &Harness) {
        for _ in 0..100 {
            if h.signaling.sent_methods().contains(&SipMethod::Ack) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("ACK was not sent");
    }

    #[test]
    fn test_parse_stream_id() {
        assert_eq!(
            parse_stream_id("34020000001320000001/34020000001310000001.session_id_0"),
            Some(StreamTarget {
                device_id: "34020000001320000001".to_string(),
                channel_id: "34020000001310000001".to_string(),
            })
        );
        assert!(parse_stream_id("live/test").is_none());
        assert!(parse_stream_id("3402000000132000000/34020000001310000001").is_none());
        assert!(parse_stream_id("34020000001320000001/3402000000131000000").is_none());
        assert!(parse_stream_id("a/34020000001320000001/34020000001310000001").is_none());
    }

    #[test]
    fn test_play_params() {
        let live = PlayParams::from_query(&query(&[])).unwrap();
        assert_eq!(live.kind, PlayKind::Live);
        assert_eq!(live.setup, SetupMode::Udp);

        let playback = PlayParams::from_query(&query(&[
            ("setup", "passive"),
            ("stream_type", "playback"),
            ("start_time", "2024-06-18T15:20:56"),
            ("end_time", "2024-06-18T15:25:56"),
        ]))
        .unwrap();
        let start = parse_local_time("2024-06-18T15:20:56").unwrap();
        assert_eq!(playback.kind, PlayKind::Playback { start, end: start + 300 });
        assert_eq!(playback.setup, SetupMode::Passive);

        let download = PlayParams::from_query(&query(&[
            ("stream_type", "download"),
            ("start_time", "2024-06-18T15:20:56"),
            ("end_time", "2024-06-18T15:25:56"),
            ("speed", "9"),
        ]))
        .unwrap();
        assert!(matches!(download.kind, PlayKind::Download { speed: 4, .. }));

        let negative = PlayParams::from_query(&query(&[
            ("stream_type", "download"),
            ("start_time", "2024-06-18T15:20:56"),
            ("end_time", "2024-06-18T15:25:56"),
            ("speed", "-3"),
        ]))
        .unwrap();
        assert!(matches!(negative.kind, PlayKind::Download { speed: 0, .. }));

        assert!(PlayParams::from_query(&query(&[
            ("stream_type", "playback"),
            ("start_time", "yesterday"),
            ("end_time", "2024-06-18T15:25:56"),
        ]))
        .is_err());
    }

    #[test]
    fn test_ack_and_teardown_derivation() {
        let mut invite = SipRequest::new(SipMethod::Invite, "sip:34020000001310000001@192.168.1.64:5060".to_string());
        invite.add_header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1");
        invite.add_header("From", "<sip:34020000002000000001@3402000000>;tag=1");
        invite.add_header("To", "<sip:34020000001310000001@3402000000>");
        invite.add_header("Call-ID", "call-1");
        invite.add_header("CSeq", "3 INVITE");

        let mut ok = SipResponse::for_request(&invite, 200, "OK");
        ok.headers.set("To", "<sip:34020000001310000001@3402000000>;tag=abc");

        let ack = build_ack(&LocalIdentity::default(), &invite, &ok);
        assert_eq!(ack.method, SipMethod::Ack);
        let via = ack.headers.get("Via").unwrap();
        assert!(via.starts_with("SIP/2.0/UDP 127.0.0.1:5060"));
        assert_ne!(via, invite.headers.get("Via").unwrap());
        assert_eq!(ack.headers.get("CSeq"), Some("3 ACK"));
        assert!(ack.headers.get("To").unwrap().contains("tag=abc"));

        let bye = derive_teardown(&ack);
        assert_eq!(bye.method, SipMethod::Bye);
        assert_eq!(bye.headers.get("CSeq"), Some("4 BYE"));
        assert!(bye.headers.get("Via").is_none());
        assert_eq!(bye.call_id(), Some("call-1"));
    }

    #[tokio::test]
    async fn test_invalid_stream_id_is_ignored() {
        let h = harness().await;

        for id in ["live/test", "34020000001320000001", "3402000000132000000/34020000001310000001"] {
            assert_eq!(h.orchestrator.play(id, &query(&[])).await, PlayOutcome::Ignored);
        }

        assert!(h.orchestrator.registry().is_empty().await);
        assert!(h.signaling.requests().is_empty());
        assert!(h.media.created().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let h = harness().await;

        let outcome = h
            .orchestrator
            .play("34020000001320000099/34020000001310000001", &query(&[]))
            .await;

        assert_eq!(outcome, PlayOutcome::DeviceOffline);
        assert!(h.signaling.requests().is_empty());
    }

    #[tokio::test]
    async fn test_live_play_published() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        publish_soon(&h);

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[])).await;
        assert_eq!(outcome, PlayOutcome::Published);

        let invites = h.signaling.requests();
        assert_eq!(invites.len(), 1);
        let body = invites[0].body.as_deref().unwrap();
        assert!(body.contains("s=Play"));
        assert!(body.contains("y=0200000001"));
        assert_eq!(h.media.created()[0].2, 200000001);

        // ACK 目标改为本平台对外地址
        let sent = h.signaling.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, SipMethod::Ack);
        assert_eq!(sent[0].uri, "sip:34020000001310000001@203.0.113.10:15060");

        // BYE 挂在流上，关闭时才发送
        let stream = h.orchestrator.registry().find(STREAM_ID).await.unwrap();
        assert!(stream.has_teardown());

        assert!(h.orchestrator.on_publish_done(STREAM_ID).await);
        let sent = h.signaling.sent();
        assert_eq!(sent.last().unwrap().method, SipMethod::Bye);
        assert!(h.media.wait_closed(1).await);
        assert_eq!(h.ssrc.in_use(SsrcKind::Live), 0);
    }

    #[tokio::test]
    async fn test_existing_stream_is_idempotent() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        publish_soon(&h);

        assert_eq!(h.orchestrator.play(STREAM_ID, &query(&[])).await, PlayOutcome::Published);
        assert_eq!(h.orchestrator.play(STREAM_ID, &query(&[])).await, PlayOutcome::AlreadyPlaying);

        assert_eq!(h.signaling.requests().len(), 1);
        assert_eq!(h.orchestrator.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_play_registers_once() {
        let h = harness().await;
        answer_with(&h, ANSWER);

        let plays = (0..4).map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.play(STREAM_ID, &HashMap::new()).await })
        });
        let outcomes: Vec<PlayOutcome> = join_all(plays).await;

        let proceeded = outcomes.iter().filter(|o| **o != PlayOutcome::AlreadyPlaying).count();
        assert_eq!(proceeded, 1);
        assert_eq!(h.signaling.requests().len(), 1);
    }

    async fn join_all<I>(handles: I) -> Vec<PlayOutcome>
    where
        I: IntoIterator<Item = tokio::task::JoinHandle<PlayOutcome>>,
    {
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn test_rejected_invite_cleans_up() {
        let h = harness().await;
        h.signaling.script_with(|invite| vec![response_for(invite, 100, None), response_for(invite, 486, None)]);

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[])).await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert!(h.orchestrator.registry().find(STREAM_ID).await.is_none());
        assert!(h.media.wait_closed(1).await);
        // 对话未确认，不发 ACK/BYE
        assert!(h.signaling.sent().is_empty());
        assert_eq!(h.ssrc.in_use(SsrcKind::Live), 0);
    }

    #[tokio::test]
    async fn test_invite_timeout_cleans_up() {
        let h = harness().await;
        h.signaling.script_hanging();

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[])).await;

        assert_eq!(outcome, PlayOutcome::Failed("INVITE timeout".to_string()));
        assert!(h.orchestrator.registry().is_empty().await);
        assert!(h.media.wait_closed(1).await);
    }

    #[tokio::test]
    async fn test_ack_failure_cleans_up() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        h.signaling.fail_send(SipMethod::Ack);

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[])).await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert!(h.orchestrator.registry().is_empty().await);
        assert!(h.media.wait_closed(1).await);
        assert!(!h.signaling.sent_methods().contains(&SipMethod::Bye));
    }

    #[tokio::test]
    async fn test_active_answer_without_video_is_torn_down() {
        let h = harness().await;
        answer_with(&h, "v=0\r\nc=IN IP4 192.168.1.64\r\nm=audio 8000 RTP/AVP 8\r\n");

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[("setup", "active")])).await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack, SipMethod::Bye]);
        assert!(h.media.connected().is_empty());
        assert!(h.orchestrator.registry().is_empty().await);
        assert!(h.media.wait_closed(1).await);
    }

    #[tokio::test]
    async fn test_active_answer_with_zero_port_is_torn_down() {
        let h = harness().await;
        answer_with(&h, "v=0\r\nc=IN IP4 192.168.1.64\r\nm=video 0 TCP/RTP/AVP 96\r\n");

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[("setup", "active")])).await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack, SipMethod::Bye]);
    }

    #[tokio::test]
    async fn test_active_connects_to_answer_address() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        publish_soon(&h);

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[("setup", "active")])).await;

        assert_eq!(outcome, PlayOutcome::Published);
        assert_eq!(
            h.media.connected(),
            vec![(STREAM_ID.to_string(), "192.168.1.64:36000".to_string())]
        );
        assert_eq!(h.media.created()[0].1, SetupMode::Active);
    }

    #[tokio::test]
    async fn test_active_connect_failure_is_torn_down() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        h.media.fail_connect();

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[("setup", "active")])).await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack, SipMethod::Bye]);
        assert!(h.orchestrator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_publish_timeout_sends_teardown() {
        let h = harness().await;
        answer_with(&h, ANSWER);

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[])).await;

        assert_eq!(outcome, PlayOutcome::Failed("publish timeout".to_string()));
        let sent = h.signaling.sent();
        assert_eq!(sent.last().unwrap().method, SipMethod::Bye);
        assert_eq!(sent.last().unwrap().headers.get("CSeq"), Some("2 BYE"));
        assert!(h.orchestrator.registry().is_empty().await);
        assert!(h.media.wait_closed(1).await);
    }

    #[tokio::test]
    async fn test_media_create_failure_cleans_up() {
        let h = harness().await;
        h.media.fail_create();

        let outcome = h.orchestrator.play(STREAM_ID, &query(&[])).await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert!(h.signaling.requests().is_empty());
        assert!(h.orchestrator.registry().is_empty().await);
        assert!(h.media.wait_closed(1).await);
        assert_eq!(h.ssrc.in_use(SsrcKind::Live), 0);
    }

    #[tokio::test]
    async fn test_malformed_playback_time_sends_nothing() {
        let h = harness().await;

        let outcome = h
            .orchestrator
            .play(
                STREAM_ID,
                &query(&[("stream_type", "playback"), ("start_time", "bad"), ("end_time", "bad")]),
            )
            .await;

        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert!(h.signaling.requests().is_empty());
        assert!(h.media.created().is_empty());
        assert!(h.orchestrator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_playback_uses_on_demand_pool() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        publish_soon(&h);

        let outcome = h
            .orchestrator
            .play(
                STREAM_ID,
                &query(&[
                    ("stream_type", "playback"),
                    ("start_time", "2024-06-18T15:20:56"),
                    ("end_time", "2024-06-18T15:25:56"),
                ]),
            )
            .await;

        assert_eq!(outcome, PlayOutcome::Published);
        assert_eq!(h.ssrc.in_use(SsrcKind::OnDemand), 1);
        assert_eq!(h.ssrc.in_use(SsrcKind::Live), 0);

        let body = h.signaling.requests()[0].body.clone().unwrap();
        let start = parse_local_time("2024-06-18T15:20:56").unwrap();
        assert!(body.contains("s=Playback"));
        assert!(body.contains(&format!("t={} {}", start, start + 300)));
        assert!(body.contains("y=1200000001"));
    }

    #[tokio::test]
    async fn test_stream_timeout_hooks() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        publish_soon(&h);
        assert_eq!(h.orchestrator.play(STREAM_ID, &query(&[])).await, PlayOutcome::Published);

        assert!(!h.orchestrator.on_stream_timeout(STREAM_ID, "rtmp").await);
        assert!(h.orchestrator.registry().find(STREAM_ID).await.is_some());

        assert!(h.orchestrator.on_stream_timeout(STREAM_ID, "rtsp").await);
        assert!(h.orchestrator.registry().find(STREAM_ID).await.is_none());
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack, SipMethod::Bye]);
    }

    #[tokio::test]
    async fn test_download_play_clamps_speed() {
        let h = harness().await;
        answer_with(&h, ANSWER);
        publish_soon(&h);

        let outcome = h
            .orchestrator
            .play(
                STREAM_ID,
                &query(&[
                    ("stream_type", "download"),
                    ("start_time", "2024-06-18T15:20:56"),
                    ("end_time", "2024-06-18T15:25:56"),
                    ("speed", "9"),
                ]),
            )
            .await;

        assert_eq!(outcome, PlayOutcome::Published);
        assert_eq!(h.ssrc.in_use(SsrcKind::OnDemand), 1);
        assert_eq!(h.ssrc.in_use(SsrcKind::Live), 0);

        let body = h.signaling.requests()[0].body.clone().unwrap();
        assert!(body.contains("s=Download"));
        assert!(body.contains("a=downloadspeed:4"));
        assert!(body.contains("u=34020000001310000001:0"));
        assert!(body.contains("y=1200000001"));
    }

    #[tokio::test]
    async fn test_stale_cleanup_leaves_newer_session() {
        let h = harness().await;
        answer_with(&h, ANSWER);

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.play(STREAM_ID, &HashMap::new()).await })
        };
        wait_for_ack(&h).await;

        // 等待推流期间被关流，随后同 id 的新会话登记
        assert!(h.orchestrator.on_stream_timeout(STREAM_ID, "rtsp").await);
        assert!(h.media.wait_closed(1).await);
        let newer = Arc::new(Stream::new(STREAM_ID, GB28181_PROTOCOL));
        h.orchestrator.registry().add(newer.clone()).await.unwrap();

        assert_eq!(first.await.unwrap(), PlayOutcome::Failed("publish timeout".to_string()));

        let current = h.orchestrator.registry().find(STREAM_ID).await.unwrap();
        assert!(Arc::ptr_eq(&current, &newer));
        // 第一路自己的对话仍然 BYE
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack, SipMethod::Bye]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.media.closed(), vec![STREAM_ID.to_string()]);
        assert_eq!(h.ssrc.in_use(SsrcKind::Live), 0);
    }

    #[tokio::test]
    async fn test_close_between_publish_and_attach_sends_teardown() {
        let h = harness().await;
        answer_with(&h, ANSWER);

        let play = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.play(STREAM_ID, &HashMap::new()).await })
        };
        wait_for_ack(&h).await;

        // 单线程运行时：两次回调之间编排任务没有机会运行
        assert!(h.orchestrator.on_publish(STREAM_ID).await);
        assert!(h.orchestrator.on_publish_done(STREAM_ID).await);
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack]);

        let outcome = play.await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Failed(_)));
        assert_eq!(h.signaling.sent_methods(), vec![SipMethod::Ack, SipMethod::Bye]);
        assert!(h.orchestrator.registry().is_empty().await);

        assert!(h.media.wait_closed(1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.media.closed().len(), 1);
    }
}
