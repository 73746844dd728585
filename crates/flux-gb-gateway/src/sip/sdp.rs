// GB28181 点播 SDP
// 生成 INVITE 的 SDP offer，解析设备返回的 SDP answer

use crate::media::SetupMode;
use crate::{GatewayError, Result};

/// 点播会话类型（s= 行）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionName {
    Play,
    Playback,
    Download,
}

impl SessionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionName::Play => "Play",
            SessionName::Playback => "Playback",
            SessionName::Download => "Download",
        }
    }
}

/// SDP 会话描述
#[derive(Debug, Clone)]
pub struct SdpSession {
    /// o= 行的用户名（国标编码）
    pub origin: String,

    /// s= 会话名称
    pub session_name: String,

    /// u= 回放/下载的通道 URI
    pub uri: Option<String>,

    /// c= 连接地址
    pub address: String,

    /// t= 起止时间（秒），实时流为 0 0
    pub time: (i64, i64),

    /// y= SSRC（GB28181 扩展）
    pub ssrc: Option<String>,

    /// f= 媒体描述（GB28181 扩展），原样保留
    pub format: Option<String>,

    /// 媒体描述
    pub media: Vec<SdpMedia>,
}

/// SDP 媒体描述
#[derive(Debug, Clone)]
pub struct SdpMedia {
    /// 媒体类型（video/audio）
    pub media_type: String,

    /// 端口
    pub port: u16,

    /// 传输协议（RTP/AVP 或 TCP/RTP/AVP）
    pub protocol: String,

    /// 格式列表
    pub formats: Vec<u8>,

    /// a= 属性（不含 a= 前缀）
    pub attributes: Vec<String>,
}

impl SdpMedia {
    /// 查找 `a=name:value` 属性
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find_map(|a| {
            a.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }
}

impl SdpSession {
    pub fn new(origin: String, address: String, session_name: SessionName) -> Self {
        Self {
            origin,
            session_name: session_name.as_str().to_string(),
            uri: None,
            address,
            time: (0, 0),
            ssrc: None,
            format: None,
            media: Vec::new(),
        }
    }

    /// 添加接收方向的视频媒体（PS/MPEG4/H264）
    pub fn add_video(&mut self, port: u16, setup: SetupMode) {
        let mut attributes = vec![
            "recvonly".to_string(),
            "rtpmap:96 PS/90000".to_string(),
            "rtpmap:98 H264/90000".to_string(),
            "rtpmap:97 MPEG4/90000".to_string(),
        ];

        let protocol = match setup {
            SetupMode::Udp => "RTP/AVP",
            SetupMode::Active | SetupMode::Passive => {
                attributes.push(format!("setup:{}", setup.as_str()));
                attributes.push("connection:new".to_string());
                "TCP/RTP/AVP"
            }
        };

        self.media.push(SdpMedia {
            media_type: "video".to_string(),
            port,
            protocol: protocol.to_string(),
            formats: vec![96, 98, 97],
            attributes,
        });
    }

    /// 为最后一个媒体追加属性
    pub fn add_media_attribute(&mut self, attribute: String) {
        if let Some(media) = self.media.last_mut() {
            media.attributes.push(attribute);
        }
    }

    /// 视频媒体描述
    pub fn video(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "video")
    }

    /// 从字符串解析 SDP
    pub fn from_string(sdp: &str) -> Result<Self> {
        let mut session = SdpSession {
            origin: String::new(),
            session_name: String::new(),
            uri: None,
            address: String::new(),
            time: (0, 0),
            ssrc: None,
            format: None,
            media: Vec::new(),
        };

        let mut saw_version = false;
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| GatewayError::Sdp(format!("malformed line: {}", line)))?;

            match key {
                "v" => saw_version = true,
                "o" => {
                    session.origin = value.split_whitespace().next().unwrap_or_default().to_string();
                }
                "s" => session.session_name = value.to_string(),
                "u" => session.uri = Some(value.to_string()),
                "c" => {
                    // 媒体级 c= 覆盖会话级地址
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        session.address = addr.to_string();
                    }
                }
                "t" => {
                    let mut parts = value.split_whitespace().map(|p| p.parse().unwrap_or(0));
                    session.time = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
                }
                "y" => session.ssrc = Some(value.trim().to_string()),
                "f" => session.format = Some(value.to_string()),
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(GatewayError::Sdp(format!("malformed media line: {}", line)));
                    }
                    let port = parts[1]
                        .parse()
                        .map_err(|_| GatewayError::Sdp(format!("invalid media port: {}", parts[1])))?;

                    current_media = Some(SdpMedia {
                        media_type: parts[0].to_string(),
                        port,
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    if let Some(ref mut media) = current_media {
                        media.attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }

        if !saw_version {
            return Err(GatewayError::Sdp("missing v= line".to_string()));
        }

        Ok(session)
    }
}

impl std::fmt::Display for SdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.origin, self.address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(uri) = &self.uri {
            write!(f, "u={}\r\n", uri)?;
        }
        write!(f, "c=IN IP4 {}\r\n", self.address)?;
        write!(f, "t={} {}\r\n", self.time.0, self.time.1)?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
        }

        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }
        if let Some(format) = &self.format {
            write!(f, "f={}\r\n", format)?;
        }

        Ok(())
    }
}
