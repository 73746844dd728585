// flux-gb-gateway: GB28181 信令网关核心库
//
// 架构：
// - registry: 流注册表（stream id -> Stream），等待推流信号
// - correlator: 异步应答关联器（SN -> 回调）
// - orchestrator: 点播会话编排状态机（INVITE/ACK/BYE）
// - query: 录像检索、位置订阅等设备查询
// - sip/: SIP 报文、SDP、MANSCDP 与 UDP 信令端点
// - device / media / signaling / ssrc: 编排器依赖的协作者

pub mod error;
pub mod registry;
pub mod correlator;
pub mod orchestrator;
pub mod query;
pub mod ssrc;
pub mod device;
pub mod media;
pub mod signaling;
pub mod sip;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// 重新导出常用类型
pub use error::{GatewayError, Result};
pub use registry::{Stream, StreamRegistry};
pub use correlator::ResponseCorrelator;
pub use orchestrator::{PlayOutcome, PlayParams, SessionOrchestrator, SessionTimeouts};
pub use query::{QueryService, RecordList, RecordQuery};
pub use device::{Device, DeviceManager};
pub use media::{MediaEndpoint, MediaSourceController, SetupMode};
pub use signaling::{LocalIdentity, SignalingClient};
pub use ssrc::{SsrcAllocator, SsrcKind, SsrcLease};

/// 本网关创建的流使用的协议标记
pub const GB28181_PROTOCOL: &str = "28181";
