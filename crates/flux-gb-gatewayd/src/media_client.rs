use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use flux_gb_gateway::{GatewayError, MediaEndpoint, MediaSourceController, Result, SetupMode};

/// 媒体服务器 API 应答
#[derive(Debug, Deserialize)]
struct ApiReply {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct CreateSource<'a> {
    source: &'a str,
    setup: &'a str,
    ssrc: u32,
}

#[derive(Debug, Serialize)]
struct ConnectSource<'a> {
    source: &'a str,
    remote_addr: &'a str,
}

#[derive(Debug, Serialize)]
struct CloseSource<'a> {
    source: &'a str,
}

/// 基于媒体服务器 HTTP API 的收流源控制
pub struct HttpMediaSource {
    base_url: String,
    client: Client,
}

impl HttpMediaSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::MediaSource(format!("build http client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::MediaSource(format!("{}: {}", url, e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::MediaSource(format!(
                "media request failed: status={} body={}",
                status, text
            )));
        }

        let reply: ApiReply = serde_json::from_str(&text)
            .map_err(|e| GatewayError::MediaSource(format!("media invalid json: {} (body={})", e, text)))?;
        if reply.code != 0 {
            return Err(GatewayError::MediaSource(format!(
                "media request rejected: code={} msg={}",
                reply.code, reply.msg
            )));
        }

        Ok(reply.data)
    }
}

#[async_trait]
impl MediaSourceController for HttpMediaSource {
    async fn create(&self, stream_id: &str, setup: SetupMode, ssrc: u32) -> Result<MediaEndpoint> {
        let data = self
            .post_json(
                "/api/v1/gb28181/source/create",
                &CreateSource {
                    source: stream_id,
                    setup: setup.as_str(),
                    ssrc,
                },
            )
            .await?;

        let ip = data.get("ip").and_then(Value::as_str);
        let port = data.get("port").and_then(Value::as_u64);
        match (ip, port) {
            (Some(ip), Some(port)) if port > 0 && port <= u16::MAX as u64 => Ok(MediaEndpoint {
                ip: ip.to_string(),
                port: port as u16,
            }),
            _ => Err(GatewayError::MediaSource(format!("create source: bad reply data {}", data))),
        }
    }

    async fn connect(&self, stream_id: &str, remote_addr: &str) -> Result<()> {
        self.post_json(
            "/api/v1/gb28181/source/connect",
            &ConnectSource {
                source: stream_id,
                remote_addr,
            },
        )
        .await?;
        Ok(())
    }

    async fn close(&self, stream_id: &str) -> Result<()> {
        self.post_json("/api/v1/source/close", &CloseSource { source: stream_id })
            .await?;
        Ok(())
    }
}
