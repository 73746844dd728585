use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flux_gb_gateway::{LocalIdentity, SessionTimeouts};

/// 网关配置
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SipConfig {
    #[serde(default = "default_sip_bind")]
    pub bind: String,

    /// 写入 Contact/Via、ACK 目标的对外地址
    #[serde(default = "default_public_ip")]
    pub public_ip: String,

    #[serde(default = "default_sip_port")]
    pub port: u16,

    #[serde(default = "default_sip_id")]
    pub sip_id: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    /// 设置后 REGISTER 需要 Digest 鉴权
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_device_expires")]
    pub device_expires: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// 媒体服务器 HTTP API 地址
    #[serde(default = "default_media_api_url")]
    pub api_url: String,

    #[serde(default = "default_media_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_invite_timeout")]
    pub invite_timeout_secs: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_min_timeout")]
    pub min_timeout_secs: u64,

    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// 默认值函数
fn default_http_bind() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_sip_bind() -> String {
    "0.0.0.0:5060".to_string()
}

fn default_public_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_sip_port() -> u16 {
    5060
}

fn default_sip_id() -> String {
    "34020000002000000001".to_string()
}

fn default_domain() -> String {
    "3402000000".to_string()
}

fn default_device_expires() -> u32 {
    3600
}

fn default_media_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_media_timeout_ms() -> u64 {
    5000
}

fn default_invite_timeout() -> u64 {
    10
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_min_timeout() -> u64 {
    5
}

fn default_max_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind: default_sip_bind(),
            public_ip: default_public_ip(),
            port: default_sip_port(),
            sip_id: default_sip_id(),
            domain: default_domain(),
            password: None,
            device_expires: default_device_expires(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            api_url: default_media_api_url(),
            request_timeout_ms: default_media_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invite_timeout_secs: default_invite_timeout(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            min_timeout_secs: default_min_timeout(),
            max_timeout_secs: default_max_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            sip_id: self.sip.sip_id.clone(),
            domain: self.sip.domain.clone(),
            public_ip: self.sip.public_ip.clone(),
            sip_port: self.sip.port,
        }
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            invite: Duration::from_secs(self.session.invite_timeout_secs),
            publish: Duration::from_secs(self.session.publish_timeout_secs),
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.sip.sip_id.len() != 20 {
            return Err(anyhow!("sip.sip_id must be 20 characters, got {:?}", self.sip.sip_id));
        }

        if self.session.invite_timeout_secs == 0 || self.session.publish_timeout_secs == 0 {
            return Err(anyhow!("session timeouts must be greater than 0"));
        }

        if self.query.min_timeout_secs > self.query.max_timeout_secs {
            return Err(anyhow!(
                "query.min_timeout_secs ({}) cannot be greater than query.max_timeout_secs ({})",
                self.query.min_timeout_secs,
                self.query.max_timeout_secs
            ));
        }

        Ok(())
    }
}

/// 配置加载器
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 加载并验证配置；文件不存在时使用默认配置
    pub fn load(&self) -> Result<GatewayConfig> {
        let config = if self.path.exists() {
            Config::builder()
                .add_source(File::new(
                    self.path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                    FileFormat::Toml,
                ))
                .build()?
                .try_deserialize()?
        } else {
            GatewayConfig::default()
        };

        config.validate()?;
        Ok(config)
    }
}
