// GB28181 MANSCDP 消息
// 查询请求体生成与设备应答 XML 解析

use quick_xml::de::from_str;
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use crate::{GatewayError, Result};

pub const MANSCDP_CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// GB28181 XML 消息根节点（Response/Notify 通用）
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpMessage {
    /// 命令类型
    pub cmd_type: String,

    /// 序列号
    #[serde(rename = "SN")]
    pub sn: Option<u32>,

    /// 设备 ID
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    /// 总条数（Catalog/RecordInfo 分包时为全部条数）
    #[serde(default)]
    pub sum_num: Option<u32>,

    /// 目录列表（CmdType=Catalog）
    #[serde(default)]
    pub device_list: Option<ItemList<CatalogItem>>,

    /// 录像列表（CmdType=RecordInfo）
    #[serde(default)]
    pub record_list: Option<ItemList<RecordItem>>,

    /// 经度（CmdType=MobilePosition）
    #[serde(default)]
    pub longitude: Option<f64>,

    /// 纬度（CmdType=MobilePosition）
    #[serde(default)]
    pub latitude: Option<f64>,
}

impl ManscdpMessage {
    /// 录像条目（不存在时为空）
    pub fn into_records(self) -> Vec<RecordItem> {
        self.record_list.map(|l| l.items).unwrap_or_default()
    }
}

/// 带 Num 属性的条目列表
#[derive(Debug, Deserialize, PartialEq)]
pub struct ItemList<T> {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default = "Vec::new")]
    pub items: Vec<T>,
}

/// 目录条目（通道信息）
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    /// 状态（ON/OFF）
    #[serde(default)]
    pub status: String,

    #[serde(rename = "ParentID", default)]
    pub parent_id: String,
}

/// 录像条目
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all(serialize = "snake_case", deserialize = "PascalCase"))]
pub struct RecordItem {
    #[serde(rename(deserialize = "DeviceID"), default)]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub file_path: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub end_time: String,

    #[serde(default)]
    pub secrecy: u8,

    #[serde(rename(deserialize = "Type"), default)]
    pub record_type: String,

    #[serde(rename(deserialize = "RecorderID"), default)]
    pub recorder_id: String,

    #[serde(default)]
    pub file_size: Option<u64>,
}

/// 目录查询
pub fn catalog_query(sn: u32, device_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>Catalog</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
</Query>"#,
        sn,
        escape(device_id)
    )
}

/// 录像检索；type 为空时按 all 检索
pub fn record_info_query(
    sn: u32,
    channel_id: &str,
    start_time: &str,
    end_time: &str,
    record_type: &str,
) -> String {
    let record_type = if record_type.is_empty() { "all" } else { record_type };
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>RecordInfo</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<StartTime>{}</StartTime>
<EndTime>{}</EndTime>
<Secrecy>0</Secrecy>
<Type>{}</Type>
</Query>"#,
        sn,
        escape(channel_id),
        escape(start_time),
        escape(end_time),
        escape(record_type)
    )
}

/// 移动位置订阅
pub fn mobile_position_query(sn: u32, channel_id: &str, interval_secs: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>MobilePosition</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Interval>{}</Interval>
</Query>"#,
        sn,
        escape(channel_id),
        interval_secs
    )
}

/// 解析 GB28181 XML 消息
pub fn parse_manscdp(xml: &str) -> Result<ManscdpMessage> {
    from_str(xml.trim()).map_err(|e| GatewayError::Xml(format!("Failed to parse GB28181 XML: {}", e)))
}

/// 不完整解析即可判断的命令类型
pub fn cmd_type(xml: &str) -> Option<&str> {
    let start = xml.find("<CmdType>")? + "<CmdType>".len();
    let end = xml[start..].find("</CmdType>")?;
    Some(xml[start..start + end].trim())
}
