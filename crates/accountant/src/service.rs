//! Risk accountant protocol service: answers `check` and `info` queries
//! over an authenticated channel. Store failures are connection-fatal;
//! unknown users and malformed queries are per-request rejections.

use std::sync::Arc;
use std::time::Duration;

use dpq_channel::{ChannelIdentity, SecureChannel};
use dpq_contracts::wire::{decode_risk_query, encode_risk_response};
use dpq_contracts::{RiskQuery, RiskQueryType, RiskResponse, RiskResponseStatus};
use dpq_policy::PolicySet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::store::{RiskStore, StoreError};

#[derive(Clone)]
pub struct RiskService {
    store: RiskStore,
    policies: Arc<RwLock<Arc<PolicySet>>>,
}

impl RiskService {
    pub fn new(store: RiskStore, policies: Arc<RwLock<Arc<PolicySet>>>) -> Self {
        RiskService { store, policies }
    }

    /// Answer one risk query. `Err` means the store is unhealthy and the
    /// connection must be closed after a generic error response.
    pub async fn handle(&self, query: &RiskQuery) -> Result<RiskResponse, StoreError> {
        match query.qtype {
            RiskQueryType::Check => {
                let Some(eps) = query.eps.filter(|e| e.is_finite() && *e > 0.0) else {
                    return Ok(RiskResponse::error(
                        RiskResponseStatus::BadQuery,
                        "check requires a positive eps",
                    ));
                };
                let policy = {
                    let snapshot = self.policies.read().await;
                    snapshot.active()
                };
                match self
                    .store
                    .check_and_record(&query.user, eps, policy.as_ref())
                    .await
                {
                    Ok(granted) => Ok(RiskResponse::admission(granted)),
                    Err(StoreError::UnknownUser(user)) => Ok(RiskResponse::error(
                        RiskResponseStatus::UserNotFound,
                        format!("unknown user `{}`", user),
                    )),
                    Err(err) => Err(err),
                }
            }
            RiskQueryType::Info => match self.store.usage(&query.user).await {
                Ok(usage) => Ok(RiskResponse::usage(
                    usage.used,
                    usage.total_threshold,
                    usage.per_query_threshold,
                )),
                Err(StoreError::UnknownUser(user)) => Ok(RiskResponse::error(
                    RiskResponseStatus::UserNotFound,
                    format!("unknown user `{}`", user),
                )),
                Err(err) => Err(err),
            },
        }
    }

    /// Serve queries on one established channel until the peer goes away
    /// or the store fails.
    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        channel: &mut SecureChannel<S>,
    ) {
        let peer = channel.peer().to_string();
        loop {
            let frame = match channel.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "risk channel receive failed");
                    break;
                }
            };

            let query = match decode_risk_query(&frame) {
                Ok(query) => query,
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "malformed risk query");
                    let reject =
                        RiskResponse::error(RiskResponseStatus::BadQuery, "malformed risk query");
                    if send_response(channel, &reject).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let request_id = Ulid::new().to_string();
            match self.handle(&query).await {
                Ok(response) => {
                    tracing::info!(
                        request_id = %request_id,
                        peer = %peer,
                        user = %query.user,
                        qtype = query.qtype.code(),
                        status = response.status.code(),
                        "risk query answered"
                    );
                    if send_response(channel, &response).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        request_id = %request_id,
                        peer = %peer,
                        user = %query.user,
                        error = %err,
                        "risk store failure, closing connection"
                    );
                    let reject =
                        RiskResponse::error(RiskResponseStatus::InternalError, "internal error");
                    let _ = send_response(channel, &reject).await;
                    break;
                }
            }
        }
        let _ = channel.shutdown().await;
    }
}

async fn send_response<S: AsyncRead + AsyncWrite + Unpin>(
    channel: &mut SecureChannel<S>,
    response: &RiskResponse,
) -> Result<(), dpq_channel::ChannelError> {
    channel.send(&encode_risk_response(response)).await
}

/// Accept loop: one task per connection, handshake bounded by a timeout.
pub async fn listen(
    listener: TcpListener,
    local: ChannelIdentity,
    trusted: Arc<RwLock<Arc<dpq_auth::PeerBook>>>,
    service: RiskService,
    handshake_timeout: Duration,
) {
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
        let service = service.clone();
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
            tracing::info!(remote = %remote, peer = %channel.peer(), "risk peer connected");
            service.serve(&mut channel).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RiskStore;
    use dpq_policy::PolicySet;

    async fn test_service() -> RiskService {
        let store =
            RiskStore::connect_and_migrate("sqlite::memory:", Duration::from_secs(2))
                .await
                .expect("store should open");
        store.put_user("alice", "", 10.0, 3.0).await.unwrap();
        let policies = Arc::new(RwLock::new(Arc::new(PolicySet::builtin())));
        RiskService::new(store, policies)
    }

    #[tokio::test]
    async fn check_grants_until_the_budget_is_exhausted() {
        let service = test_service().await;

        // tt=10, qt=3: 2+2+2+2 granted, the final 3 denied
        for _ in 0..4 {
            let response = service
                .handle(&RiskQuery::check("alice", 2.0))
                .await
                .unwrap();
            assert_eq!(response.granted(), Some(true));
        }
        let response = service
            .handle(&RiskQuery::check("alice", 3.0))
            .await
            .unwrap();
        assert_eq!(response.granted(), Some(false));

        let info = service.handle(&RiskQuery::info("alice")).await.unwrap();
        assert_eq!(info.spend(), Some((8.0, 10.0, 3.0)));
    }

    #[tokio::test]
    async fn unknown_users_get_user_not_found() {
        let service = test_service().await;
        let response = service
            .handle(&RiskQuery::check("mallory", 1.0))
            .await
            .unwrap();
        assert_eq!(response.status, RiskResponseStatus::UserNotFound);

        let response = service.handle(&RiskQuery::info("mallory")).await.unwrap();
        assert_eq!(response.status, RiskResponseStatus::UserNotFound);
    }

    #[tokio::test]
    async fn swapping_the_policy_set_changes_subsequent_decisions() {
        use dpq_policy::{AdmissionPolicy, HistoryEntry};

        struct DenyAll;
        impl AdmissionPolicy for DenyAll {
            fn name(&self) -> &str {
                "deny_all"
            }
            fn description(&self) -> &str {
                "denies every request"
            }
            fn admit(&self, _: f64, _: f64, _: f64, _: f64, _: &[HistoryEntry]) -> bool {
                false
            }
        }

        let store = RiskStore::connect_and_migrate("sqlite::memory:", Duration::from_secs(2))
            .await
            .unwrap();
        store.put_user("alice", "", 10.0, 3.0).await.unwrap();
        let policies = Arc::new(RwLock::new(Arc::new(PolicySet::builtin())));
        let service = RiskService::new(store, Arc::clone(&policies));

        let response = service.handle(&RiskQuery::check("alice", 1.0)).await.unwrap();
        assert_eq!(response.granted(), Some(true));

        // hot reload swaps the snapshot; later requests see the new policy
        let swapped = PolicySet::builtin()
            .with_policy(Arc::new(DenyAll))
            .with_active("deny_all")
            .unwrap();
        *policies.write().await = Arc::new(swapped);

        let response = service.handle(&RiskQuery::check("alice", 1.0)).await.unwrap();
        assert_eq!(response.granted(), Some(false));
    }

    #[tokio::test]
    async fn nonpositive_eps_is_a_bad_query() {
        let service = test_service().await;
        for eps in [0.0, -1.0, f64::NAN] {
            let response = service
                .handle(&RiskQuery::check("alice", eps))
                .await
                .unwrap();
            assert_eq!(response.status, RiskResponseStatus::BadQuery);
        }
        // and the rejected checks must not have spent anything
        let info = service.handle(&RiskQuery::info("alice")).await.unwrap();
        assert_eq!(info.spend(), Some((0.0, 10.0, 3.0)));
    }
}
