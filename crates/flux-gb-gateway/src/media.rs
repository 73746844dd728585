// 媒体服务器上的 GB28181 收流源
// 网关只负责分配/连接/关闭，收流本身由媒体服务器完成

use async_trait::async_trait;
use crate::Result;

/// 传输建立方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupMode {
    /// UDP 收流
    #[default]
    Udp,
    /// TCP 被动：设备连接本地端口
    Passive,
    /// TCP 主动：本地连接设备 answer 中的地址
    Active,
}

impl SetupMode {
    /// 解析 setup 查询参数，未知取值按 UDP 处理
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => SetupMode::Active,
            "passive" => SetupMode::Passive,
            _ => SetupMode::Udp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SetupMode::Udp => "udp",
            SetupMode::Passive => "passive",
            SetupMode::Active => "active",
        }
    }
}

/// 已分配的本地收流端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub ip: String,
    pub port: u16,
}

/// 媒体服务器收流源控制
#[async_trait]
pub trait MediaSourceController: Send + Sync {
    /// 按传输方式和 SSRC 创建收流源，返回本地收流地址
    async fn create(&self, stream_id: &str, setup: SetupMode, ssrc: u32) -> Result<MediaEndpoint>;

    /// 主动模式下让收流源连接设备的媒体地址
    async fn connect(&self, stream_id: &str, remote_addr: &str) -> Result<()>;

    /// 关闭收流源
    async fn close(&self, stream_id: &str) -> Result<()>;
}
