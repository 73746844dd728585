use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("SIP transport error: {0}")]
    Transport(String),

    #[error("Media source error: {0}")]
    MediaSource(String),

    #[error("SSRC pool exhausted")]
    SsrcExhausted,

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
