//! Per-connection protocol state machine. A connection is IDLE between
//! requests; an Info or Risk request holds it through exactly one risk
//! accountant round trip before the response goes back. Meta and Echo
//! never touch the accountant.

use std::sync::Arc;
use std::time::Duration;

use dpq_auth::PeerBook;
use dpq_channel::{ChannelIdentity, SecureChannel};
use dpq_contracts::wire::{decode_request, encode_response};
use dpq_contracts::{Request, RequestKind, Response, RiskQuery, RiskResponseStatus};
use serde_json::Value as Json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::frontend::{Frontend, QueryError};
use crate::risk::RiskClient;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub allow_alias: bool,
    pub allow_echo: bool,
    pub handshake_timeout: Duration,
}

#[derive(Clone)]
pub struct Broker {
    frontend: Arc<RwLock<Arc<Frontend>>>,
    risk: RiskClient,
    settings: ServerSettings,
}

/// Outcome of one request: the response to send and whether the
/// connection survives it.
struct Outcome {
    response: Response,
    keep_open: bool,
}

impl Outcome {
    fn reply(response: Response) -> Self {
        Outcome {
            response,
            keep_open: true,
        }
    }

    fn fatal(response: Response) -> Self {
        Outcome {
            response,
            keep_open: false,
        }
    }
}

impl Broker {
    pub fn new(
        frontend: Arc<RwLock<Arc<Frontend>>>,
        risk: RiskClient,
        settings: ServerSettings,
    ) -> Self {
        Broker {
            frontend,
            risk,
            settings,
        }
    }

    pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        channel: &mut SecureChannel<S>,
    ) {
        let peer = channel.peer().to_string();
        loop {
            let frame = match channel.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "client channel receive failed");
                    break;
                }
            };

            let request = match decode_request(&frame) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "malformed request");
                    let reject = Response::bad_query(None, "malformed request");
                    if send_response(channel, &reject).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let request_id = Ulid::new().to_string();
            let outcome = self.dispatch(&request_id, &peer, &request, &frame).await;
            tracing::info!(
                request_id = %request_id,
                peer = %peer,
                kind = request.kind.code(),
                status = outcome.response.status.code(),
                "request handled"
            );
            if send_response(channel, &outcome.response).await.is_err() {
                break;
            }
            if !outcome.keep_open {
                break;
            }
        }
        let _ = channel.shutdown().await;
    }

    async fn dispatch(
        &self,
        request_id: &str,
        peer: &str,
        request: &Request,
        frame: &[u8],
    ) -> Outcome {
        // Each request runs against the snapshot current at its start;
        // hot reload swaps the pointer for later requests only.
        let snapshot = {
            let slot = self.frontend.read().await;
            Arc::clone(&slot)
        };

        match request.kind {
            RequestKind::Meta => {
                Outcome::reply(Response::ok(RequestKind::Meta, snapshot.meta_json().clone()))
            }
            RequestKind::Echo => {
                if !self.settings.allow_echo {
                    return Outcome::reply(Response::bad_query(
                        Some(RequestKind::Echo),
                        "echo is disabled",
                    ));
                }
                // The request already parsed, so the frame is valid JSON.
                let parsed: Json = serde_json::from_slice(frame).unwrap_or(Json::Null);
                Outcome::reply(Response::ok(RequestKind::Echo, parsed))
            }
            RequestKind::Info => self.run_info(request_id, peer, request, &snapshot).await,
            RequestKind::Risk => self.run_risk(request_id, peer, request).await,
        }
    }

    fn effective_user(&self, peer: &str, alias: Option<&str>) -> String {
        match alias {
            Some(alias) if self.settings.allow_alias => alias.to_string(),
            _ => peer.to_string(),
        }
    }

    async fn run_info(
        &self,
        request_id: &str,
        peer: &str,
        request: &Request,
        snapshot: &Frontend,
    ) -> Outcome {
        let Some(payload) = request.payload.as_ref() else {
            return Outcome::reply(Response::bad_query(
                Some(RequestKind::Info),
                "query payload required",
            ));
        };
        if !request.eps.is_finite() || request.eps <= 0.0 {
            return Outcome::reply(Response::bad_query(
                Some(RequestKind::Info),
                "eps must be a positive number",
            ));
        }

        let user = self.effective_user(peer, request.alias.as_deref());
        let verdict = match self
            .risk
            .consult(&RiskQuery::check(user.clone(), request.eps))
            .await
        {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    user = %user,
                    error = %err,
                    "risk round trip failed, closing connection"
                );
                return Outcome::fatal(Response::internal_error());
            }
        };

        match verdict.status {
            RiskResponseStatus::Ok => match verdict.granted() {
                Some(true) => match snapshot.handle_query(request.eps, payload).await {
                    Ok(result) => {
                        Outcome::reply(Response::ok(RequestKind::Info, Json::Object(result)))
                    }
                    Err(QueryError::BadQuery(text)) => {
                        Outcome::reply(Response::bad_query(Some(RequestKind::Info), text))
                    }
                    Err(QueryError::Internal(text)) => {
                        tracing::error!(
                            request_id = %request_id,
                            user = %user,
                            error = %text,
                            "query execution failed, closing connection"
                        );
                        Outcome::fatal(Response::internal_error())
                    }
                },
                Some(false) => Outcome::reply(Response::budget_exceeded(
                    "requested risk exceeds the remaining budget",
                )),
                None => Outcome::reply(Response::accountant_error(
                    "risk accountant returned an unusable verdict",
                )),
            },
            status => {
                tracing::warn!(
                    request_id = %request_id,
                    user = %user,
                    status = status.code(),
                    "risk accountant rejected the request"
                );
                Outcome::reply(Response::accountant_error(
                    "risk accountant rejected the request",
                ))
            }
        }
    }

    async fn run_risk(&self, request_id: &str, peer: &str, request: &Request) -> Outcome {
        let user = self.effective_user(peer, request.alias.as_deref());
        let verdict = match self.risk.consult(&RiskQuery::info(user.clone())).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    user = %user,
                    error = %err,
                    "risk round trip failed, closing connection"
                );
                return Outcome::fatal(Response::internal_error());
            }
        };

        match verdict.spend() {
            Some((used, total_threshold, per_query_threshold)) => Outcome::reply(Response::ok(
                RequestKind::Risk,
                serde_json::json!({
                    "used": used,
                    "totalThreshold": total_threshold,
                    "perQueryThreshold": per_query_threshold,
                }),
            )),
            None => {
                tracing::warn!(
                    request_id = %request_id,
                    user = %user,
                    status = verdict.status.code(),
                    "risk accountant rejected the spend lookup"
                );
                Outcome::reply(Response::accountant_error(
                    "risk accountant rejected the request",
                ))
            }
        }
    }
}

async fn send_response<S: AsyncRead + AsyncWrite + Unpin>(
    channel: &mut SecureChannel<S>,
    response: &Response,
) -> Result<(), dpq_channel::ChannelError> {
    channel.send(&encode_response(response)).await
}

/// Accept loop: one task per client connection.
pub async fn listen(
    listener: TcpListener,
    local: ChannelIdentity,
    trusted: Arc<RwLock<Arc<PeerBook>>>,
    broker: Broker,
) {
    let handshake_timeout = broker.settings.handshake_timeout;
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };

        let local = local.clone();
        let trusted = Arc::clone(&trusted);
        let broker = broker.clone();
        tokio::spawn(async move {
            let book = {
                let snapshot = trusted.read().await;
                Arc::clone(&snapshot)
            };
            let handshake = tokio::time::timeout(
                handshake_timeout,
                SecureChannel::accept(stream, &local, &book),
            )
            .await;
            let mut channel = match handshake {
                Ok(Ok(channel)) => channel,
                Ok(Err(err)) => {
                    tracing::warn!(remote = %remote, error = %err, "handshake rejected");
                    return;
                }
                Err(_) => {
                    tracing::warn!(remote = %remote, "handshake timed out");
                    return;
                }
            };
            tracing::info!(remote = %remote, peer = %channel.peer(), "client connected");
            broker.handle_connection(&mut channel).await;
        });
    }
}
