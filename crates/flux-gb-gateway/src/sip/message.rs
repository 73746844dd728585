// SIP 消息解析和生成
// 头部按出现顺序保存（Via 可能出现多次，拆除顶层 Via 需要保序）

use std::fmt;
use std::net::SocketAddr;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
        };
        f.write_str(name)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

/// CSeq 头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::parse(parts.next()?)?;
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// 有序头部表，名称大小写不敏感
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 追加头部（允许重复）
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 插入到最前面（用于补 Via）
    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(0, (name.into(), value.into()));
    }

    /// 替换第一个同名头部，不存在时追加
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    /// 移除第一个（最顶层）同名头部
    pub fn remove_first(&mut self, name: &str) -> Option<String> {
        let pos = self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(pos).1)
    }

    /// 移除全部同名头部
    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
    /// 传输层目的地址，不写入报文
    pub destination: Option<SocketAddr>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: String) -> Self {
        Self {
            method,
            uri,
            version: "SIP/2.0".to_string(),
            headers: Headers::default(),
            body: None,
            destination: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.append(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.get("CSeq").and_then(CSeq::parse)
    }

    pub fn set_cseq(&mut self, cseq: CSeq) {
        self.headers.set("CSeq", cseq.to_string());
    }

    /// 从字符串解析 SIP 请求
    pub fn from_string(s: &str) -> Result<Self, String> {
        let (start_line, headers, body) = split_message(s)?;

        let request_line: Vec<&str> = start_line.split_whitespace().collect();
        if request_line.len() != 3 {
            return Err("Invalid request line".to_string());
        }

        let method = SipMethod::parse(request_line[0])
            .ok_or_else(|| format!("Unknown method: {}", request_line[0]))?;

        Ok(Self {
            method,
            uri: request_line[1].to_string(),
            version: request_line[2].to_string(),
            headers,
            body,
            destination: None,
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: &str) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.to_string(),
            headers: Headers::default(),
            body: None,
        }
    }

    /// 按请求复制对话相关头部生成响应
    pub fn for_request(req: &SipRequest, status_code: u16, reason_phrase: &str) -> Self {
        let mut resp = Self::new(status_code, reason_phrase);
        for (key, value) in req.headers.iter() {
            if ["Via", "From", "To", "Call-ID", "CSeq"]
                .iter()
                .any(|k| k.eq_ignore_ascii_case(key))
            {
                resp.headers.append(key, value);
            }
        }
        resp
    }

    /// 添加头部
    pub fn add_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.append(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.get("CSeq").and_then(CSeq::parse)
    }

    /// 从字符串解析 SIP 响应
    pub fn from_string(s: &str) -> Result<Self, String> {
        let (start_line, headers, body) = split_message(s)?;

        let status_line: Vec<&str> = start_line.splitn(3, ' ').collect();
        if status_line.len() < 2 {
            return Err("Invalid status line".to_string());
        }

        let status_code = status_line[1]
            .parse::<u16>()
            .map_err(|_| "Invalid status code".to_string())?;

        Ok(Self {
            version: status_line[0].to_string(),
            status_code,
            reason_phrase: status_line.get(2).copied().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.status_code, self.reason_phrase)?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从字符串解析 SIP 消息
    pub fn from_string(s: &str) -> Result<Self, String> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::from_string(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_string(s)?))
        }
    }
}

fn write_headers_and_body(
    f: &mut fmt::Formatter<'_>,
    headers: &Headers,
    body: Option<&str>,
) -> fmt::Result {
    for (key, value) in headers.iter() {
        if key.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        write!(f, "{}: {}\r\n", key, value)?;
    }

    let body = body.unwrap_or_default();
    write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
}

/// 拆分起始行、头部和消息体
fn split_message(s: &str) -> Result<(&str, Headers, Option<String>), String> {
    let (head, body) = match s.find("\r\n\r\n") {
        Some(pos) => (&s[..pos], &s[pos + 4..]),
        None => match s.find("\n\n") {
            Some(pos) => (&s[..pos], &s[pos + 2..]),
            None => (s, ""),
        },
    };

    let mut lines = head.lines();
    let start_line = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| "Empty SIP message".to_string())?;

    let mut headers = Headers::default();
    for line in lines {
        if let Some(pos) = line.find(':') {
            let key = expand_compact_name(line[..pos].trim());
            headers.append(key, line[pos + 1..].trim());
        }
    }

    let body = if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    };

    Ok((start_line, headers, body))
}

/// 紧凑头部名展开（RFC 3261 7.3.3）
fn expand_compact_name(name: &str) -> &str {
    match name {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "c" => "Content-Type",
        "l" => "Content-Length",
        other => other,
    }
}

/// 提取 `sip:user@host` 中的 user 部分
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest.find('@')?;
    Some(&rest[..end])
}

/// 替换 SIP URI 的 host 和 port，保留 user 与参数
pub fn rewrite_uri_host(uri: &str, host: &str, port: u16) -> String {
    let (scheme, rest) = match uri.find(':') {
        Some(pos) if !uri[..pos].contains('@') => (&uri[..pos], &uri[pos + 1..]),
        _ => ("sip", uri),
    };

    let (user, host_part) = match rest.find('@') {
        Some(pos) => (Some(&rest[..pos]), &rest[pos + 1..]),
        None => (None, rest),
    };

    let params = host_part.find(';').map(|pos| &host_part[pos..]).unwrap_or_default();

    match user {
        Some(user) => format!("{}:{}@{}:{}{}", scheme, user, host, port, params),
        None => format!("{}:{}:{}{}", scheme, host, port, params),
    }
}

/// 读取头部参数值，例如 `To: <sip:a@b>;tag=123` 的 tag
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}
