// nonce.rs — per-wallet monotonic nonce allocation (spec §4.B, §8 invariant 1).
//
// The teacher allocates a nonce inline at each call site
// (`chrono::Utc::now().timestamp_millis()`), fine for a bot that only ever
// has one order in flight. A batching engine with many concurrent per-wallet
// actors needs a dedicated, lock-protected allocator — this module is new
// relative to the teacher, grounded on the `dashmap` per-key-lock idiom used
// by `dex-sdk` and `ferrofluid` elsewhere in this pack.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

const VALIDITY_BEFORE_MS: i64 = 2 * 86_400_000;
const VALIDITY_AFTER_MS: i64 = 86_400_000;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable snapshot of the last nonce issued per wallet, for optional
/// cross-restart persistence (spec §4.B: "durable snapshot optional").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonceSnapshot {
    pub last_nonce_by_wallet: std::collections::HashMap<String, u64>,
}

struct WalletState {
    last_nonce: u64,
}

/// Allocates strictly increasing nonces per signing wallet, clamped into the
/// exchange's validity window `[now-2d, now+1d]`. Allocation is atomic per
/// wallet: concurrent callers serialize on that wallet's lock, never on any
/// other wallet's.
pub struct NonceVault {
    wallets: DashMap<String, Arc<Mutex<WalletState>>>,
}

impl NonceVault {
    pub fn new() -> Self {
        Self { wallets: DashMap::new() }
    }

    pub fn from_snapshot(snapshot: NonceSnapshot) -> Self {
        let vault = Self::new();
        for (wallet, last_nonce) in snapshot.last_nonce_by_wallet {
            vault.wallets.insert(wallet, Arc::new(Mutex::new(WalletState { last_nonce })));
        }
        vault
    }

    pub fn snapshot(&self) -> NonceSnapshot {
        let mut last_nonce_by_wallet = std::collections::HashMap::new();
        for entry in self.wallets.iter() {
            // best-effort snapshot; a wallet mid-allocation is read via try_lock
            // and skipped rather than blocking the snapshot.
            if let Ok(state) = entry.value().try_lock() {
                last_nonce_by_wallet.insert(entry.key().clone(), state.last_nonce);
            }
        }
        NonceSnapshot { last_nonce_by_wallet }
    }

    fn wallet_lock(&self, wallet: &str) -> Arc<Mutex<WalletState>> {
        self.wallets
            .entry(wallet.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WalletState { last_nonce: 0 })))
            .clone()
    }

    /// Allocates the next nonce for `wallet`: `max(now_ms, last+1)`, clamped
    /// into `[now-2d, now+1d]`. Never reused, never decreasing.
    pub async fn next_nonce(&self, wallet: &str) -> u64 {
        let lock = self.wallet_lock(wallet);
        let mut state = lock.lock().await;
        let now = now_ms();
        let candidate = now.max(state.last_nonce as i64 + 1);
        let min_allowed = now - VALIDITY_BEFORE_MS;
        let max_allowed = now + VALIDITY_AFTER_MS;
        let clamped = candidate.clamp(min_allowed, max_allowed).max(0) as u64;
        state.last_nonce = clamped;
        clamped
    }

    /// Bumps the nonce floor to `now` immediately — used after an
    /// `AuthRejected` response so the next allocation never reuses a nonce
    /// the exchange may have already consumed partially.
    pub async fn bump_to_now(&self, wallet: &str) {
        let lock = self.wallet_lock(wallet);
        let mut state = lock.lock().await;
        state.last_nonce = state.last_nonce.max(now_ms() as u64);
    }
}

impl Default for NonceVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonces_are_strictly_increasing_per_wallet() {
        let vault = NonceVault::new();
        let n1 = vault.next_nonce("0xWALLET").await;
        let n2 = vault.next_nonce("0xWALLET").await;
        assert!(n2 > n1);
    }

    #[tokio::test]
    async fn different_wallets_are_independent() {
        let vault = NonceVault::new();
        let a = vault.next_nonce("0xA").await;
        let b = vault.next_nonce("0xB").await;
        // both allocated near "now", no ordering requirement across wallets
        assert!(a > 0 && b > 0);
    }

    #[tokio::test]
    async fn nonce_within_validity_window() {
        let vault = NonceVault::new();
        let n = vault.next_nonce("0xWALLET").await as i64;
        let now = now_ms();
        assert!(n >= now - VALIDITY_BEFORE_MS);
        assert!(n <= now + VALIDITY_AFTER_MS);
    }

    #[tokio::test]
    async fn concurrent_allocations_never_collide() {
        let vault = Arc::new(NonceVault::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let v = vault.clone();
            handles.push(tokio::spawn(async move { v.next_nonce("0xWALLET").await }));
        }
        let mut nonces = Vec::new();
        for h in handles {
            nonces.push(h.await.unwrap());
        }
        nonces.sort_unstable();
        for w in nonces.windows(2) {
            assert!(w[0] < w[1], "nonces must be strictly increasing, got {:?}", w);
        }
    }
}
