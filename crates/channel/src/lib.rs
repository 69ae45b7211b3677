//! Authenticated message channel: netstring frames over any byte stream,
//! preceded by a mutual hello handshake that yields the verified peer
//! identity. Stands in for the opaque secure-channel layer; transport
//! encryption is out of scope.

use dpq_auth::{AuthError, PeerBook};
use dpq_contracts::netstring::{self, FrameBuffer, NetstringError};
use serde_json::Value as Json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_FRAME_LEN: usize = netstring::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug)]
pub enum ChannelError {
    Io(std::io::Error),
    Framing(NetstringError),
    Handshake(&'static str),
    Auth(AuthError),
    ClosedMidFrame,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Io(err) => write!(f, "channel i/o error: {}", err),
            ChannelError::Framing(err) => write!(f, "channel framing error: {}", err),
            ChannelError::Handshake(what) => write!(f, "channel handshake failed: {}", what),
            ChannelError::Auth(err) => write!(f, "channel peer rejected: {}", err),
            ChannelError::ClosedMidFrame => write!(f, "peer closed connection mid-frame"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<std::io::Error> for ChannelError {
    fn from(value: std::io::Error) -> Self {
        ChannelError::Io(value)
    }
}

impl From<NetstringError> for ChannelError {
    fn from(value: NetstringError) -> Self {
        ChannelError::Framing(value)
    }
}

impl From<AuthError> for ChannelError {
    fn from(value: AuthError) -> Self {
        ChannelError::Auth(value)
    }
}

/// Our end of a channel: who we claim to be, and the token proving it.
#[derive(Debug, Clone)]
pub struct ChannelIdentity {
    pub identity: String,
    pub token: String,
}

pub struct SecureChannel<S> {
    stream: S,
    frames: FrameBuffer,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureChannel<S> {
    /// Client side: send our hello, then verify the server's.
    pub async fn connect(
        stream: S,
        local: &ChannelIdentity,
        trusted: &PeerBook,
    ) -> Result<Self, ChannelError> {
        let mut channel = SecureChannel {
            stream,
            frames: FrameBuffer::new(DEFAULT_MAX_FRAME_LEN),
            peer: String::new(),
        };
        channel.send_hello(local).await?;
        channel.peer = channel.read_hello(trusted).await?;
        Ok(channel)
    }

    /// Server side: the peer speaks first; reply with our hello once the
    /// peer verifies.
    pub async fn accept(
        stream: S,
        local: &ChannelIdentity,
        trusted: &PeerBook,
    ) -> Result<Self, ChannelError> {
        let mut channel = SecureChannel {
            stream,
            frames: FrameBuffer::new(DEFAULT_MAX_FRAME_LEN),
            peer: String::new(),
        };
        channel.peer = channel.read_hello(trusted).await?;
        channel.send_hello(local).await?;
        Ok(channel)
    }

    /// Verified identity of the peer on the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(&netstring::encode(payload)).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next whole frame; `None` on clean close between frames.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.frames.is_empty() {
                    return Ok(None);
                }
                return Err(ChannelError::ClosedMidFrame);
            }
            self.frames.extend(&chunk[..n]);
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send_hello(&mut self, local: &ChannelIdentity) -> Result<(), ChannelError> {
        let hello = Json::Array(vec![
            Json::String("hello".to_string()),
            Json::String(local.identity.clone()),
            Json::String(local.token.clone()),
        ]);
        let bytes = serde_json::to_vec(&hello).unwrap_or_default();
        self.send(&bytes).await
    }

    async fn read_hello(&mut self, trusted: &PeerBook) -> Result<String, ChannelError> {
        let frame = self
            .recv()
            .await?
            .ok_or(ChannelError::Handshake("peer closed before hello"))?;

        let hello: Json = serde_json::from_slice(&frame)
            .map_err(|_| ChannelError::Handshake("hello is not valid JSON"))?;
        let items = hello
            .as_array()
            .filter(|items| items.len() == 3)
            .ok_or(ChannelError::Handshake("hello has wrong shape"))?;

        if items[0].as_str() != Some("hello") {
            return Err(ChannelError::Handshake("hello has wrong tag"));
        }
        let identity = items[1]
            .as_str()
            .ok_or(ChannelError::Handshake("hello identity must be a string"))?;
        let token = items[2]
            .as_str()
            .ok_or(ChannelError::Handshake("hello token must be a string"))?;

        Ok(trusted.verify(identity, token)?)
    }
}
