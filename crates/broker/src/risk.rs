//! The broker's leg to the risk accountant: one authenticated connection
//! per consultation, the whole round trip bounded by a single timeout.
//! Any failure here is a transport failure and the caller fails closed.

use std::sync::Arc;
use std::time::Duration;

use dpq_auth::PeerBook;
use dpq_channel::{ChannelIdentity, SecureChannel};
use dpq_contracts::wire::encode_risk_query;
use dpq_contracts::{RiskQuery, RiskResponse};
use tokio::net::TcpStream;

#[derive(Debug)]
pub struct RiskTransportError(pub String);

impl std::fmt::Display for RiskTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "risk accountant unreachable: {}", self.0)
    }
}

impl std::error::Error for RiskTransportError {}

#[derive(Clone)]
pub struct RiskClient {
    addr: String,
    timeout: Duration,
    local: ChannelIdentity,
    trusted: Arc<PeerBook>,
}

impl RiskClient {
    pub fn new(
        addr: impl Into<String>,
        timeout: Duration,
        local: ChannelIdentity,
        trusted: Arc<PeerBook>,
    ) -> Self {
        RiskClient {
            addr: addr.into(),
            timeout,
            local,
            trusted,
        }
    }

    pub async fn consult(&self, query: &RiskQuery) -> Result<RiskResponse, RiskTransportError> {
        let attempt = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|err| RiskTransportError(format!("connect: {}", err)))?;
            let mut channel = SecureChannel::connect(stream, &self.local, &self.trusted)
                .await
                .map_err(|err| RiskTransportError(format!("handshake: {}", err)))?;

            let bytes = encode_risk_query(query);
            channel
                .send(&bytes)
                .await
                .map_err(|err| RiskTransportError(format!("send: {}", err)))?;

            let frame = channel
                .recv()
                .await
                .map_err(|err| RiskTransportError(format!("recv: {}", err)))?
                .ok_or_else(|| RiskTransportError("closed before responding".to_string()))?;
            let response = dpq_contracts::wire::decode_risk_response(&frame)
                .map_err(|err| RiskTransportError(format!("decode: {}", err)))?;
            let _ = channel.shutdown().await;
            Ok(response)
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| RiskTransportError("round trip timed out".to_string()))?
    }
}
