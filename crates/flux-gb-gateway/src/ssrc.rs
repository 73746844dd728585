// SSRC 分配
// GB28181 SSRC 为 10 位十进制：1 位类型（0 实时 / 1 历史）+ 5 位域编码 + 4 位序号

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use crate::{GatewayError, Result};

const MAX_SEQUENCE: u16 = 9999;

/// SSRC 池类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsrcKind {
    Live,
    OnDemand,
}

impl SsrcKind {
    fn prefix(&self) -> char {
        match self {
            SsrcKind::Live => '0',
            SsrcKind::OnDemand => '1',
        }
    }
}

/// 已分配的 SSRC，需显式交还
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcLease {
    pub kind: SsrcKind,
    pub sequence: u16,
    /// 10 位十进制文本（SDP y= 行）
    pub text: String,
}

impl SsrcLease {
    pub fn value(&self) -> u32 {
        self.text.parse().unwrap_or_default()
    }
}

impl fmt::Display for SsrcLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Default)]
struct Pool {
    in_use: HashSet<u16>,
    last: u16,
}

impl Pool {
    fn acquire(&mut self) -> Option<u16> {
        let seq = (1..=MAX_SEQUENCE)
            .map(|offset| (self.last + offset - 1) % MAX_SEQUENCE + 1)
            .find(|seq| !self.in_use.contains(seq))?;
        self.in_use.insert(seq);
        self.last = seq;
        Some(seq)
    }
}

/// 实时/历史两个互不重叠的 SSRC 池
pub struct SsrcAllocator {
    domain: String,
    live: Mutex<Pool>,
    on_demand: Mutex<Pool>,
}

impl SsrcAllocator {
    /// 域编码取平台 SIP ID 的第 4~8 位
    pub fn new(sip_id: &str) -> Self {
        let domain: String = sip_id.chars().skip(3).take(5).collect();
        let domain = format!("{:0>5}", domain);
        Self {
            domain,
            live: Mutex::new(Pool::default()),
            on_demand: Mutex::new(Pool::default()),
        }
    }

    fn pool(&self, kind: SsrcKind) -> &Mutex<Pool> {
        match kind {
            SsrcKind::Live => &self.live,
            SsrcKind::OnDemand => &self.on_demand,
        }
    }

    pub fn allocate(&self, kind: SsrcKind) -> Result<SsrcLease> {
        let sequence = {
            let mut pool = self.pool(kind).lock().unwrap_or_else(|e| e.into_inner());
            pool.acquire().ok_or(GatewayError::SsrcExhausted)?
        };

        let text = format!("{}{}{:04}", kind.prefix(), self.domain, sequence);
        tracing::debug!(target: "gb_gateway", ssrc = %text, ?kind, "SSRC allocated");

        Ok(SsrcLease { kind, sequence, text })
    }

    pub fn release(&self, lease: &SsrcLease) {
        let mut pool = self.pool(lease.kind).lock().unwrap_or_else(|e| e.into_inner());
        if pool.in_use.remove(&lease.sequence) {
            tracing::debug!(target: "gb_gateway", ssrc = %lease.text, "SSRC released");
        }
    }

    pub fn in_use(&self, kind: SsrcKind) -> usize {
        self.pool(kind).lock().unwrap_or_else(|e| e.into_inner()).in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssrc_format() {
        let allocator = SsrcAllocator::new("34020000002000000001");

        let live = allocator.allocate(SsrcKind::Live).unwrap();
        let vod = allocator.allocate(SsrcKind::OnDemand).unwrap();

        assert_eq!(live.text, "0200000001");
        assert_eq!(vod.text, "1200000001");
        assert_eq!(live.value(), 200000001);
        assert_ne!(live.value(), vod.value());
    }

    #[test]
    fn test_ssrc_release_and_reuse() {
        let allocator = SsrcAllocator::new("34020000002000000001");

        let a = allocator.allocate(SsrcKind::Live).unwrap();
        let b = allocator.allocate(SsrcKind::Live).unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.in_use(SsrcKind::Live), 2);

        allocator.release(&a);
        assert_eq!(allocator.in_use(SsrcKind::Live), 1);

        // 轮转分配，刚释放的值不会立即复用
        let c = allocator.allocate(SsrcKind::Live).unwrap();
        assert_eq!(c.sequence, 3);
    }

    #[test]
    fn test_ssrc_exhaustion() {
        let allocator = SsrcAllocator::new("34020000002000000001");

        for _ in 0..MAX_SEQUENCE {
            allocator.allocate(SsrcKind::OnDemand).unwrap();
        }
        assert!(matches!(
            allocator.allocate(SsrcKind::OnDemand),
            Err(GatewayError::SsrcExhausted)
        ));

        // 另一个池不受影响
        assert!(allocator.allocate(SsrcKind::Live).is_ok());
    }
}
