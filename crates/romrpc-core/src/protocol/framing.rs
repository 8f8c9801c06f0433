//! Length-prefixed framing for stream transports.
//!
//! ```text
//! text frame:  [u32 BE: len][UTF-8 JSON bytes of len]
//! close frame: [u32 BE: 0xFFFF_FFFF][u16 BE: close code]
//! ```

use crate::config::ProtocolConfig;
use crate::{Result, RomError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Length value reserved to announce a close frame.
pub const CLOSE_MARKER: u32 = u32::MAX;

/// Why a stream transport was closed. Decides the reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    GoingAway,
    ProtocolError,
    /// Connection dropped without a close frame.
    Abnormal,
    PolicyViolation,
    /// The server no longer trusts the session; reconnect with a new one.
    SessionNotReliable,
    Other(u16),
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::Abnormal => 1006,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::SessionNotReliable => 4500,
            CloseStatus::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => CloseStatus::Normal,
            1001 => CloseStatus::GoingAway,
            1002 => CloseStatus::ProtocolError,
            1006 => CloseStatus::Abnormal,
            1008 => CloseStatus::PolicyViolation,
            4500 => CloseStatus::SessionNotReliable,
            other => CloseStatus::Other(other),
        }
    }

    /// Protocol errors and policy violations must not be resumed.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            CloseStatus::ProtocolError | CloseStatus::PolicyViolation
        )
    }

    /// Whether reconnecting should drop the known session id first.
    pub fn requires_new_session(self) -> bool {
        matches!(self, CloseStatus::SessionNotReliable)
    }
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// One unit read off a stream transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Close(CloseStatus),
}

/// Read one frame. Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len == CLOSE_MARKER {
        let code = reader.read_u16().await?;
        return Ok(Some(Frame::Close(CloseStatus::from_code(code))));
    }

    let len = len as usize;
    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(RomError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let text = String::from_utf8(payload)
        .map_err(|_| RomError::protocol("invalid UTF-8 in frame"))?;
    Ok(Some(Frame::Text(text)))
}

/// Write one text frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    let payload = text.as_bytes();
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(RomError::protocol(format!(
            "frame size {} exceeds maximum {}",
            payload.len(),
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_close_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    status: CloseStatus,
) -> Result<()> {
    writer.write_all(&CLOSE_MARKER.to_be_bytes()).await?;
    writer.write_all(&status.code().to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
