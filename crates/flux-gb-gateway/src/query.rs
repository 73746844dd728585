// 面向设备的查询：录像检索、移动位置订阅、目录查询
// 应答经 SIP 端点异步到达，按 SN 交给关联器

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::correlator::{Completion, ResponseCorrelator};
use crate::device::DeviceManager;
use crate::signaling::{LocalIdentity, SignalingClient};
use crate::sip::{ManscdpMessage, RecordItem};
use crate::{GatewayError, Result};

/// 录像检索参数
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub device_id: String,
    pub channel_id: String,
    pub start_time: String,
    pub end_time: String,
    pub record_type: String,
    pub timeout: Duration,
}

/// 录像检索结果；超时时为已收到的部分
#[derive(Debug, Clone, Serialize)]
pub struct RecordList {
    pub sum_num: u32,
    pub complete: bool,
    pub items: Vec<RecordItem>,
}

pub struct QueryService {
    identity: LocalIdentity,
    devices: Arc<DeviceManager>,
    signaling: Arc<dyn SignalingClient>,
    correlator: Arc<ResponseCorrelator<ManscdpMessage>>,
}

impl QueryService {
    pub fn new(
        identity: LocalIdentity,
        devices: Arc<DeviceManager>,
        signaling: Arc<dyn SignalingClient>,
        correlator: Arc<ResponseCorrelator<ManscdpMessage>>,
    ) -> Self {
        Self {
            identity,
            devices,
            signaling,
            correlator,
        }
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    /// 录像检索：先登记 SN 再发送，避免应答先于登记到达
    pub async fn query_records(&self, query: RecordQuery) -> Result<RecordList> {
        let device = self
            .devices
            .get_device(&query.device_id)
            .await
            .ok_or_else(|| GatewayError::DeviceNotFound(query.device_id.clone()))?;

        let sn = self.correlator.new_token();
        let sum_num = Arc::new(AtomicU32::new(0));
        let total = sum_num.clone();

        let acc = self.correlator.accumulate(sn, move |message: ManscdpMessage, items: &mut Vec<RecordItem>| {
            let expected = message.sum_num.unwrap_or(0);
            total.store(expected, Ordering::Relaxed);
            items.extend(message.into_records());
            items.len() >= expected as usize
        });

        let request = device.build_record_query(
            &self.identity,
            &query.channel_id,
            &query.start_time,
            &query.end_time,
            sn,
            &query.record_type,
        );
        let sent = match request {
            Ok(request) => self.signaling.send(request).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.correlator.cancel(sn);
            return Err(e);
        }

        tracing::info!(
            target: "gb_gateway",
            device_id = %query.device_id,
            channel_id = %query.channel_id,
            sn,
            "Record query sent"
        );

        let completion = self.correlator.wait(sn, query.timeout).await;
        let items = acc.into_items();

        tracing::info!(target: "gb_gateway", sn, count = items.len(), ?completion, "Record query finished");

        Ok(RecordList {
            sum_num: sum_num.load(Ordering::Relaxed),
            complete: completion == Completion::Complete,
            items,
        })
    }

    /// 订阅移动位置，不等待应答
    pub async fn subscribe_position(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_device(device_id)
            .await
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;

        let sn = self.correlator.new_token();
        let request = device.build_position_subscribe(&self.identity, channel_id, sn)?;
        self.signaling.send(request).await?;

        tracing::info!(target: "gb_gateway", %device_id, %channel_id, "Position subscription sent");
        Ok(())
    }

    /// 目录查询，应答由 SIP 端点写入设备通道列表
    pub async fn query_catalog(&self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_device(device_id)
            .await
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;

        let sn = self.correlator.new_token();
        let request = device.build_catalog_query(&self.identity, sn)?;
        self.signaling.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::sip::manscdp::parse_manscdp;
    use crate::sip::SipMethod;
    use crate::testing::MockSignaling;

    const DEVICE_ID: &str = "34020000001320000001";
    const CHANNEL_ID: &str = "34020000001310000001";

    async fn service() -> (Arc<QueryService>, Arc<MockSignaling>, Arc<ResponseCorrelator<ManscdpMessage>>) {
        let devices = Arc::new(DeviceManager::new());
        devices
            .register_device(Device::new(DEVICE_ID.to_string(), "192.168.1.64".to_string(), 5060))
            .await;

        let signaling = Arc::new(MockSignaling::new());
        let correlator = Arc::new(ResponseCorrelator::with_bounds(
            Duration::from_millis(50),
            Duration::from_millis(500),
        ));
        let service = Arc::new(QueryService::new(
            LocalIdentity::default(),
            devices,
            signaling.clone(),
            correlator.clone(),
        ));
        (service, signaling, correlator)
    }

    fn record_query(timeout: Duration) -> RecordQuery {
        RecordQuery {
            device_id: DEVICE_ID.to_string(),
            channel_id: CHANNEL_ID.to_string(),
            start_time: "2024-06-18T00:00:00".to_string(),
            end_time: "2024-06-18T23:59:59".to_string(),
            record_type: String::new(),
            timeout,
        }
    }

    fn record_page(sn: u32, sum: u32, names: &[&str]) -> ManscdpMessage {
        let items: String = names
            .iter()
            .map(|n| format!("<Item><DeviceID>{}</DeviceID><Name>{}</Name></Item>", CHANNEL_ID, n))
            .collect();
        let xml = format!(
            "<Response><CmdType>RecordInfo</CmdType><SN>{}</SN><DeviceID>{}</DeviceID>\
             <SumNum>{}</SumNum><RecordList Num=\"{}\">{}</RecordList></Response>",
            sn,
            CHANNEL_ID,
            sum,
            names.len(),
            items
        );
        parse_manscdp(&xml).unwrap()
    }

    /// 等待查询请求发出后取其 SN
    async fn sent_sn(signaling: &MockSignaling) -> u32 {
        for _ in 0..100 {
            if let Some(request) = signaling.sent().first() {
                return request.cseq().unwrap().seq;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("record query was not sent");
    }

    #[tokio::test]
    async fn test_record_query_multi_part() {
        let (service, signaling, correlator) = service().await;

        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.query_records(record_query(Duration::from_secs(5))).await })
        };

        let sn = sent_sn(&signaling).await;
        assert!(correlator.dispatch(sn, record_page(sn, 3, &["a", "b"])));
        assert!(correlator.dispatch(sn, record_page(sn, 3, &["c"])));

        let list = task.await.unwrap().unwrap();
        assert!(list.complete);
        assert_eq!(list.sum_num, 3);
        let names: Vec<&str> = list.items.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let request = &signaling.sent()[0];
        assert_eq!(request.method, SipMethod::Message);
        assert!(request.body.as_ref().unwrap().contains("<Type>all</Type>"));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_record_query_partial_on_timeout() {
        let (service, signaling, correlator) = service().await;

        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.query_records(record_query(Duration::ZERO)).await })
        };

        let sn = sent_sn(&signaling).await;
        correlator.dispatch(sn, record_page(sn, 5, &["a"]));

        let list = task.await.unwrap().unwrap();
        assert!(!list.complete);
        assert_eq!(list.items.len(), 1);
    }

    #[tokio::test]
    async fn test_record_query_unknown_device() {
        let (service, signaling, _) = service().await;

        let mut query = record_query(Duration::from_secs(1));
        query.device_id = "34020000001320000099".to_string();

        assert!(matches!(
            service.query_records(query).await,
            Err(GatewayError::DeviceNotFound(_))
        ));
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn test_record_query_send_failure_cancels() {
        let (service, signaling, correlator) = service().await;
        signaling.fail_send(SipMethod::Message);

        assert!(service.query_records(record_query(Duration::from_secs(1))).await.is_err());
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_query_catalog() {
        let (service, signaling, correlator) = service().await;

        service.query_catalog(DEVICE_ID).await.unwrap();

        let request = &signaling.sent()[0];
        assert_eq!(request.method, SipMethod::Message);
        let body = request.body.as_ref().unwrap();
        assert!(body.contains("<CmdType>Catalog</CmdType>"));
        assert!(body.contains(&format!("<DeviceID>{}</DeviceID>", DEVICE_ID)));
        // 应答由 SIP 端点处理，不占用关联器
        assert_eq!(correlator.pending(), 0);

        assert!(matches!(
            service.query_catalog("34020000001320000099").await,
            Err(GatewayError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_position() {
        let (service, signaling, _) = service().await;

        service.subscribe_position(DEVICE_ID, CHANNEL_ID).await.unwrap();

        let request = &signaling.sent()[0];
        assert_eq!(request.method, SipMethod::Subscribe);
        assert!(request.headers.get("Event").unwrap().starts_with("presence"));
        assert!(request.body.as_ref().unwrap().contains("<CmdType>MobilePosition</CmdType>"));
    }
}
