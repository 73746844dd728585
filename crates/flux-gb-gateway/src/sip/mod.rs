// GB28181 SIP 信令层

pub mod message;
pub mod sdp;
pub mod manscdp;
pub mod server;

pub use message::{CSeq, Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{SdpMedia, SdpSession, SessionName};
pub use manscdp::{ManscdpMessage, RecordItem};
pub use server::{SipServer, SipServerConfig};
