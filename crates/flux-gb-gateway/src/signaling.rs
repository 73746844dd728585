// SIP 事务层接口
// 编排器只依赖该接口：带应答的发送、无需应答的发送

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use crate::sip::{SipRequest, SipResponse};
use crate::Result;

/// 网关自身的 SIP 身份与对外地址
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// 平台 SIP ID（20 位国标编码）
    pub sip_id: String,

    /// SIP 域
    pub domain: String,

    /// 对外公布的 IP
    pub public_ip: String,

    /// 对外公布的 SIP 端口
    pub sip_port: u16,
}

impl LocalIdentity {
    pub fn contact(&self) -> String {
        format!("<sip:{}@{}:{}>", self.sip_id, self.public_ip, self.sip_port)
    }

    pub fn from_header(&self) -> String {
        format!("<sip:{}@{}>;tag={}", self.sip_id, self.domain, new_tag())
    }

    pub fn via_header(&self) -> String {
        format!(
            "SIP/2.0/UDP {}:{};rport;branch={}",
            self.public_ip,
            self.sip_port,
            new_branch()
        )
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self {
            sip_id: "34020000002000000001".to_string(),
            domain: "3402000000".to_string(),
            public_ip: "127.0.0.1".to_string(),
            sip_port: 5060,
        }
    }
}

/// SIP 信令客户端
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// 发送请求并返回该事务的应答通道；最终应答之后通道关闭
    async fn send_request(&self, request: SipRequest) -> Result<mpsc::Receiver<SipResponse>>;

    /// 发送请求，不等待应答（ACK、BYE 等）
    async fn send(&self, request: SipRequest) -> Result<()>;
}

pub fn new_tag() -> String {
    rand::thread_rng().gen_range(100_000_000u32..1_000_000_000).to_string()
}

pub fn new_branch() -> String {
    format!("z9hG4bK{}", rand::thread_rng().gen_range(100_000_000u64..10_000_000_000))
}

pub fn new_call_id(domain: &str) -> String {
    format!("{:x}@{}", rand::thread_rng().gen::<u64>(), domain)
}
