use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    RequestVote,
    AppendEntries,
    InstallSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChaosConfig {
    /// Probability in [0, 1] of dropping each RPC kind before it is sent.
    #[serde(default)]
    pub drop_request_vote: f64,
    #[serde(default)]
    pub drop_append_entries: f64,
    #[serde(default)]
    pub drop_install_snapshot: f64,
    /// Fixed latency added to every outbound peer RPC.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosStatus {
    pub enabled: bool,
    pub config: ChaosConfig,
    pub dropped_total: u64,
    pub delayed_total: u64,
}

/// Fault injector for outbound peer RPCs. Compiled into the transport but
/// inert unless enabled in config; configured at runtime through the
/// /chaos endpoints or directly from tests.
pub struct ChaosController {
    enabled: bool,
    config: RwLock<ChaosConfig>,
    dropped_total: AtomicU64,
    delayed_total: AtomicU64,
}

impl ChaosController {
    pub fn new(enabled: bool) -> Self {
        ChaosController {
            enabled,
            config: RwLock::new(ChaosConfig::default()),
            dropped_total: AtomicU64::new(0),
            delayed_total: AtomicU64::new(0),
        }
    }

    pub async fn configure(&self, config: ChaosConfig) {
        if !self.enabled {
            warn!("chaos configuration received but chaos is disabled in config");
        }
        *self.config.write().await = config;
    }

    pub async fn reset(&self) {
        *self.config.write().await = ChaosConfig::default();
        self.dropped_total.store(0, Ordering::Relaxed);
        self.delayed_total.store(0, Ordering::Relaxed);
    }

    pub async fn status(&self) -> ChaosStatus {
        ChaosStatus {
            enabled: self.enabled,
            config: self.config.read().await.clone(),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            delayed_total: self.delayed_total.load(Ordering::Relaxed),
        }
    }

    /// Called by the transport before each outbound RPC. May delay the
    /// call or fail it as if the peer were unreachable.
    pub async fn inject(&self, kind: RpcKind, peer: &str) -> Result<(), VaultError> {
        if !self.enabled {
            return Ok(());
        }

        let (drop_probability, delay_ms) = {
            let config = self.config.read().await;
            let p = match kind {
                RpcKind::RequestVote => config.drop_request_vote,
                RpcKind::AppendEntries => config.drop_append_entries,
                RpcKind::InstallSnapshot => config.drop_install_snapshot,
            };
            (p, config.delay_ms)
        };

        if delay_ms > 0 {
            self.delayed_total.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if drop_probability > 0.0 && rand::thread_rng().gen_bool(drop_probability.clamp(0.0, 1.0)) {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            debug!("chaos dropped {:?} to {}", kind, peer);
            return Err(VaultError::PeerUnavailable {
                peer: peer.to_string(),
                reason: "injected fault".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_controller_never_drops() {
        let chaos = ChaosController::new(false);
        chaos
            .configure(ChaosConfig { drop_append_entries: 1.0, ..Default::default() })
            .await;

        for _ in 0..50 {
            chaos.inject(RpcKind::AppendEntries, "node-2").await.unwrap();
        }
        assert_eq!(chaos.status().await.dropped_total, 0);
    }

    #[tokio::test]
    async fn test_full_drop_probability_always_drops() {
        let chaos = ChaosController::new(true);
        chaos
            .configure(ChaosConfig { drop_request_vote: 1.0, ..Default::default() })
            .await;

        for _ in 0..10 {
            assert!(chaos.inject(RpcKind::RequestVote, "node-2").await.is_err());
        }
        // Other kinds are unaffected.
        chaos.inject(RpcKind::AppendEntries, "node-2").await.unwrap();
        assert_eq!(chaos.status().await.dropped_total, 10);
    }

    #[tokio::test]
    async fn test_reset_clears_config_and_counters() {
        let chaos = ChaosController::new(true);
        chaos
            .configure(ChaosConfig { drop_append_entries: 1.0, ..Default::default() })
            .await;
        let _ = chaos.inject(RpcKind::AppendEntries, "node-2").await;

        chaos.reset().await;
        let status = chaos.status().await;
        assert_eq!(status.dropped_total, 0);
        assert_eq!(status.config.drop_append_entries, 0.0);
        chaos.inject(RpcKind::AppendEntries, "node-2").await.unwrap();
    }
}
