// persistence.rs — optional cross-restart durability for process-local state
// that the Repository (spec §4.I) doesn't own (spec §4.B: "durable snapshot
// optional").
//
// Kept from the teacher almost verbatim: same `load_state`/`save_state`
// JSON-file pair, same file-existence check, same `info!`/`error!` log
// style. Only the payload changed, from the teacher's single-account
// `EngineState{balance, positions, ...}` to a `NonceSnapshot` per signing
// wallet, since this relay's durable facts (followers, trades, positions)
// already live behind `crate::repository::Repository` — the only thing left
// that would otherwise reset to zero across a restart is each wallet's nonce
// high-water mark.

use log::{error, info};
use std::fs;
use std::path::Path;

use crate::nonce::NonceSnapshot;

pub fn load_nonce_snapshot<P: AsRef<Path>>(path: P) -> NonceSnapshot {
    if path.as_ref().exists() {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<NonceSnapshot>(&content) {
                Ok(snapshot) => {
                    info!("Loaded nonce snapshot from {:?}: {} wallet(s)", path.as_ref(), snapshot.last_nonce_by_wallet.len());
                    return snapshot;
                }
                Err(e) => error!("Failed to parse nonce snapshot file: {}", e),
            },
            Err(e) => error!("Failed to read nonce snapshot file: {}", e),
        }
    }
    info!("Nonce snapshot file not found at {:?}. Starting with an empty vault.", path.as_ref());
    NonceSnapshot::default()
}

pub fn save_nonce_snapshot<P: AsRef<Path>>(path: P, snapshot: &NonceSnapshot) {
    match serde_json::to_string_pretty(snapshot) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                error!("Failed to write nonce snapshot file: {}", e);
            }
        }
        Err(e) => error!("Failed to serialize nonce snapshot: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_file() {
        let mut snapshot = NonceSnapshot::default();
        snapshot.last_nonce_by_wallet.insert("0xWALLET".to_string(), 42);
        let path = std::env::temp_dir().join(format!("copy_relay_nonce_test_{}.json", uuid::Uuid::new_v4()));

        save_nonce_snapshot(&path, &snapshot);
        let loaded = load_nonce_snapshot(&path);
        assert_eq!(loaded.last_nonce_by_wallet.get("0xWALLET"), Some(&42));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_empty_snapshot() {
        let path = std::env::temp_dir().join(format!("copy_relay_nonce_missing_{}.json", uuid::Uuid::new_v4()));
        let loaded = load_nonce_snapshot(&path);
        assert!(loaded.last_nonce_by_wallet.is_empty());
    }
}
