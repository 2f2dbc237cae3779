// signing.rs — structured-message signatures for exchange actions (spec §4.B, §6).
//
// Kept close to the teacher's `signing.rs`: same msgpack action-hash
// construction, same EIP-712 digest assembly, same `(r,s,v)` signature shape.
// Generalized in two ways the teacher's single-purpose MM binary didn't need:
//   - `chain_id` is a required `SignerConfig` field instead of the hardcoded
//     `1337` the teacher used (spec §9 Open Question (b)).
//   - A second signing domain, `HyperliquidSignTransaction`, is added for the
//     wire-level actions spec §4.B/§6 describe; callers pick one domain at
//     `Signer` construction time and never mix them within a process.

use crate::config::SignerConfig;
use crate::error::RelayError;
use ethers_core::types::transaction::eip712::EIP712Domain;
use ethers_core::types::{Address as EthAddress, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer as EthersSigner};
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

// ─── JSON wire types (camelCase, for the `/exchange` request body) ─────────

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: String,
    pub sz: String,
    pub reduce_only: bool,
    pub order_type: OrderTypeWire,
    pub cloid: Option<String>,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum OrderTypeWire {
    Limit(LimitOrderWire),
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LimitOrderWire {
    pub tif: String,
}

#[derive(Serialize, Clone)]
pub struct OrderActionWire {
    pub r#type: String, // "order"
    pub orders: Vec<OrderRequest>,
    pub grouping: String,
}

// ─── MsgPack wire types (abbreviated keys, for action-hash computation) ────
// Python SDK: {"a": asset, "b": is_buy, "p": limit_px, "s": sz, "r": reduce_only, "t": order_type}

#[derive(Serialize)]
struct OrderWireMsgPack {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypeWireMsgPack,
}

#[derive(Serialize)]
struct OrderTypeWireMsgPack {
    limit: LimitOrderWireMsgPack,
}

#[derive(Serialize)]
struct LimitOrderWireMsgPack {
    tif: String,
}

#[derive(Serialize)]
struct OrderActionMsgPack {
    r#type: String,
    orders: Vec<OrderWireMsgPack>,
    grouping: String,
}

/// Computes the action hash matching the Python SDK's `action_hash()`:
/// `keccak(msgpack(action) || nonce.to_bytes(8, "big") || vault_marker)`.
fn compute_action_hash(action: &OrderActionWire, nonce: u64, vault_address: Option<&str>) -> [u8; 32] {
    let msgpack_orders: Vec<OrderWireMsgPack> = action
        .orders
        .iter()
        .map(|o| {
            let tif_str = match &o.order_type {
                OrderTypeWire::Limit(l) => l.tif.clone(),
            };
            OrderWireMsgPack {
                a: o.asset,
                b: o.is_buy,
                p: o.limit_px.clone(),
                s: o.sz.clone(),
                r: o.reduce_only,
                t: OrderTypeWireMsgPack { limit: LimitOrderWireMsgPack { tif: tif_str } },
            }
        })
        .collect();

    let msgpack_action = OrderActionMsgPack {
        r#type: action.r#type.clone(),
        orders: msgpack_orders,
        grouping: action.grouping.clone(),
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .expect("msgpack serialization of a well-formed action never fails");

    buf.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        None => buf.push(0x00),
        Some(addr) => {
            buf.push(0x01);
            let addr_clean = addr.strip_prefix("0x").unwrap_or(addr);
            if let Ok(bytes) = hex::decode(addr_clean) {
                buf.extend_from_slice(&bytes);
            }
        }
    }
    keccak256(&buf)
}

fn agent_domain_hash(chain_id: u64) -> [u8; 32] {
    EIP712Domain {
        name: Some("Exchange".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(EthAddress::zero()),
        salt: None,
    }
    .separator()
}

fn sign_agent_digest(action_hash: [u8; 32], chain_id: u64) -> H256 {
    let action_hash_h256 = H256::from(action_hash);
    let domain_hash = agent_domain_hash(chain_id);
    let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)".as_bytes());
    let source_hash = keccak256("a".as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&agent_type_hash);
    encoded.extend_from_slice(&source_hash);
    encoded.extend_from_slice(action_hash_h256.as_bytes());
    let struct_hash = keccak256(&encoded);

    let mut final_payload = Vec::new();
    final_payload.extend_from_slice(&[0x19, 0x01]);
    final_payload.extend_from_slice(&domain_hash);
    final_payload.extend_from_slice(&struct_hash);
    H256::from(keccak256(&final_payload))
}

/// `HyperliquidSignTransaction` domain per spec §4.B/§6: domain carries the
/// configured `chain_id` and the signing wallet as `verifying_contract`;
/// the primary type's `action` field is the canonical JSON serialization of
/// the action object (byte-identical to what is later submitted — testable
/// property §8.7).
fn sign_transaction_digest(action_json: &serde_json::Value, nonce: u64, chain_id: u64, wallet_address: &str) -> Result<H256, RelayError> {
    let verifying_contract = EthAddress::from_str(wallet_address)
        .map_err(|e| RelayError::SignatureError(format!("bad wallet address: {}", e)))?;

    let domain_hash = EIP712Domain {
        name: Some("HyperliquidSignTransaction".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(verifying_contract),
        salt: None,
    }
    .separator();

    let action_str = serde_json::to_string(action_json)?;
    let type_hash = keccak256(
        "HyperliquidTransaction(string action,uint64 nonce,uint256 chainId)".as_bytes(),
    );
    let action_hash = keccak256(action_str.as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&type_hash);
    encoded.extend_from_slice(&action_hash);
    encoded.extend_from_slice(&{
        let mut nonce_bytes = [0u8; 32];
        nonce_bytes[24..].copy_from_slice(&nonce.to_be_bytes());
        nonce_bytes
    });
    encoded.extend_from_slice(&{
        let mut chain_bytes = [0u8; 32];
        U256::from(chain_id).to_big_endian(&mut chain_bytes);
        chain_bytes
    });
    let struct_hash = keccak256(&encoded);

    let mut final_payload = Vec::new();
    final_payload.extend_from_slice(&[0x19, 0x01]);
    final_payload.extend_from_slice(&domain_hash);
    final_payload.extend_from_slice(&struct_hash);
    Ok(H256::from(keccak256(&final_payload)))
}

fn signature_from_recoverable(sig: ethers_core::types::Signature) -> Signature {
    Signature {
        r: format!("0x{:0>64x}", sig.r),
        s: format!("0x{:0>64x}", sig.s),
        v: sig.v.max(27) as u8,
    }
}

fn build_order_json(action: &OrderActionWire) -> serde_json::Value {
    // CRITICAL: key insertion order must match the Python SDK's order
    // (type, orders, grouping; inner order: a, b, p, s, r, t) because the
    // exchange re-msgpacks the JSON body preserving key order to verify the
    // signature — `serde_json::json!{}` would alphabetize and break that.
    let json_orders: Vec<serde_json::Value> = action
        .orders
        .iter()
        .map(|o| {
            let tif_str = match &o.order_type {
                OrderTypeWire::Limit(l) => l.tif.clone(),
            };
            let mut order_map = serde_json::Map::new();
            order_map.insert("a".to_string(), serde_json::Value::from(o.asset));
            order_map.insert("b".to_string(), serde_json::Value::from(o.is_buy));
            order_map.insert("p".to_string(), serde_json::Value::from(o.limit_px.clone()));
            order_map.insert("s".to_string(), serde_json::Value::from(o.sz.clone()));
            order_map.insert("r".to_string(), serde_json::Value::from(o.reduce_only));
            let mut tif_map = serde_json::Map::new();
            tif_map.insert("tif".to_string(), serde_json::Value::from(tif_str));
            let mut limit_map = serde_json::Map::new();
            limit_map.insert("limit".to_string(), serde_json::Value::Object(tif_map));
            order_map.insert("t".to_string(), serde_json::Value::Object(limit_map));
            if let Some(c) = &o.cloid {
                order_map.insert("c".to_string(), serde_json::Value::from(c.clone()));
            }
            serde_json::Value::Object(order_map)
        })
        .collect();

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from(action.r#type.clone()));
    action_map.insert("orders".to_string(), serde_json::Value::Array(json_orders));
    action_map.insert("grouping".to_string(), serde_json::Value::from(action.grouping.clone()));
    serde_json::Value::Object(action_map)
}

/// Which EIP-712 domain to sign with. The legacy `Agent` domain is kept from
/// the teacher codebase for compatibility with deployments still on it;
/// `HyperliquidSignTransaction` is the domain spec §4.B/§6 specify for
/// chain-id-aware networks. Selected once at `Signer` construction, never
/// mixed within a process (spec §9 Open Question (b)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningDomain {
    LegacyAgent,
    HyperliquidSignTransaction,
}

pub struct Signer {
    wallet: LocalWallet,
    wallet_address: String,
    chain_id: u64,
    domain: SigningDomain,
}

impl Signer {
    pub fn new(config: &SignerConfig, domain: SigningDomain) -> Result<Self, RelayError> {
        let wallet = LocalWallet::from_str(&config.private_key)
            .map_err(|e| RelayError::SignatureError(e.to_string()))?;
        let wallet_address = format!("{:#x}", wallet.address());
        Ok(Self { wallet, wallet_address, chain_id: config.chain_id, domain })
    }

    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    /// Signs an `order` action, returning the signature and the exact JSON
    /// action object that must be submitted alongside it.
    pub async fn sign_order_action(
        &self,
        orders: Vec<OrderRequest>,
        grouping: &str,
        nonce: u64,
    ) -> Result<(Signature, serde_json::Value), RelayError> {
        let action = OrderActionWire { r#type: "order".to_string(), orders, grouping: grouping.to_string() };
        let action_json = build_order_json(&action);

        let digest = match self.domain {
            SigningDomain::LegacyAgent => {
                let action_hash = compute_action_hash(&action, nonce, None);
                sign_agent_digest(action_hash, self.chain_id)
            }
            SigningDomain::HyperliquidSignTransaction => {
                sign_transaction_digest(&action_json, nonce, self.chain_id, &self.wallet_address)?
            }
        };

        let sig = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| RelayError::SignatureError(e.to_string()))?;
        Ok((signature_from_recoverable(sig), action_json))
    }

    /// Signs a `cancel` action for a single order.
    pub async fn sign_cancel_action(&self, asset: u32, oid: u64, nonce: u64) -> Result<(Signature, serde_json::Value), RelayError> {
        #[derive(Serialize)]
        struct CancelWireMsgPack {
            a: u32,
            o: u64,
        }
        #[derive(Serialize)]
        struct CancelActionMsgPack {
            r#type: String,
            cancels: Vec<CancelWireMsgPack>,
        }

        let mut cancel_obj = serde_json::Map::new();
        cancel_obj.insert("a".to_string(), serde_json::Value::from(asset));
        cancel_obj.insert("o".to_string(), serde_json::Value::from(oid));
        let mut action_map = serde_json::Map::new();
        action_map.insert("type".to_string(), serde_json::Value::from("cancel"));
        action_map.insert("cancels".to_string(), serde_json::Value::Array(vec![serde_json::Value::Object(cancel_obj)]));
        let action_json = serde_json::Value::Object(action_map);

        let digest = match self.domain {
            SigningDomain::LegacyAgent => {
                let msgpack_action = CancelActionMsgPack { r#type: "cancel".to_string(), cancels: vec![CancelWireMsgPack { a: asset, o: oid }] };
                let mut buf = Vec::new();
                let mut serializer = Serializer::new(&mut buf).with_struct_map();
                msgpack_action.serialize(&mut serializer).expect("well-formed cancel action always serializes");
                buf.extend_from_slice(&nonce.to_be_bytes());
                buf.push(0x00);
                sign_agent_digest(keccak256(&buf), self.chain_id)
            }
            SigningDomain::HyperliquidSignTransaction => {
                sign_transaction_digest(&action_json, nonce, self.chain_id, &self.wallet_address)?
            }
        };

        let sig = self.wallet.sign_hash(digest).map_err(|e| RelayError::SignatureError(e.to_string()))?;
        Ok((signature_from_recoverable(sig), action_json))
    }

    /// Signs a `cancelByCloid` action for a single order. Mirrors
    /// `sign_cancel_action` but over the cloid-keyed cancel shape — the two
    /// are different wire actions and must not share a signed digest.
    pub async fn sign_cancel_by_cloid_action(&self, asset: u32, cloid: &str, nonce: u64) -> Result<(Signature, serde_json::Value), RelayError> {
        #[derive(Serialize)]
        struct CancelByCloidWireMsgPack {
            asset: u32,
            cloid: String,
        }
        #[derive(Serialize)]
        struct CancelByCloidActionMsgPack {
            r#type: String,
            cancels: Vec<CancelByCloidWireMsgPack>,
        }

        let mut cancel_obj = serde_json::Map::new();
        cancel_obj.insert("asset".to_string(), serde_json::Value::from(asset));
        cancel_obj.insert("cloid".to_string(), serde_json::Value::from(cloid));
        let mut action_map = serde_json::Map::new();
        action_map.insert("type".to_string(), serde_json::Value::from("cancelByCloid"));
        action_map.insert("cancels".to_string(), serde_json::Value::Array(vec![serde_json::Value::Object(cancel_obj)]));
        let action_json = serde_json::Value::Object(action_map);

        let digest = match self.domain {
            SigningDomain::LegacyAgent => {
                let msgpack_action = CancelByCloidActionMsgPack {
                    r#type: "cancelByCloid".to_string(),
                    cancels: vec![CancelByCloidWireMsgPack { asset, cloid: cloid.to_string() }],
                };
                let mut buf = Vec::new();
                let mut serializer = Serializer::new(&mut buf).with_struct_map();
                msgpack_action.serialize(&mut serializer).expect("well-formed cancelByCloid action always serializes");
                buf.extend_from_slice(&nonce.to_be_bytes());
                buf.push(0x00);
                sign_agent_digest(keccak256(&buf), self.chain_id)
            }
            SigningDomain::HyperliquidSignTransaction => {
                sign_transaction_digest(&action_json, nonce, self.chain_id, &self.wallet_address)?
            }
        };

        let sig = self.wallet.sign_hash(digest).map_err(|e| RelayError::SignatureError(e.to_string()))?;
        Ok((signature_from_recoverable(sig), action_json))
    }
}

/// Matches the Python SDK's `float_to_wire`: round to 8 decimals, strip
/// trailing zeros, keep the integer part bare when there's no remainder.
pub fn float_to_wire(x: f64) -> String {
    let rounded = format!("{:.8}", x);
    if rounded.contains('.') {
        let trimmed = rounded.trim_end_matches('0');
        trimmed.trim_end_matches('.').to_string()
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer(domain: SigningDomain) -> Signer {
        let config = SignerConfig {
            chain_id: 42161,
            // well-known throwaway anvil test key
            private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
        };
        Signer::new(&config, domain).unwrap()
    }

    #[tokio::test]
    async fn signs_order_action_legacy_domain() {
        let signer = test_signer(SigningDomain::LegacyAgent);
        let orders = vec![OrderRequest {
            asset: 0,
            is_buy: true,
            limit_px: "30000".to_string(),
            sz: "0.1".to_string(),
            reduce_only: false,
            order_type: OrderTypeWire::Limit(LimitOrderWire { tif: "Ioc".to_string() }),
            cloid: None,
        }];
        let (sig, action_json) = signer.sign_order_action(orders, "na", 1_700_000_000_000).await.unwrap();
        assert!(sig.r.starts_with("0x"));
        assert!(sig.v == 27 || sig.v == 28);
        assert_eq!(action_json["type"], "order");
    }

    #[tokio::test]
    async fn action_json_key_order_is_stable() {
        let signer = test_signer(SigningDomain::HyperliquidSignTransaction);
        let orders = vec![OrderRequest {
            asset: 1,
            is_buy: false,
            limit_px: "2000".to_string(),
            sz: "1".to_string(),
            reduce_only: false,
            order_type: OrderTypeWire::Limit(LimitOrderWire { tif: "Alo".to_string() }),
            cloid: None,
        }];
        let (_, action_json) = signer.sign_order_action(orders, "alo", 1).await.unwrap();
        let keys: Vec<&String> = action_json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["type", "orders", "grouping"]);
    }

    #[tokio::test]
    async fn cancel_by_cloid_signs_its_own_action_shape() {
        let signer = test_signer(SigningDomain::HyperliquidSignTransaction);
        let (sig, action_json) = signer.sign_cancel_by_cloid_action(0, "0xabc123", 1_700_000_000_000).await.unwrap();
        assert!(sig.v == 27 || sig.v == 28);
        assert_eq!(action_json["type"], "cancelByCloid");
        assert_eq!(action_json["cancels"][0]["cloid"], "0xabc123");
    }

    #[test]
    fn float_to_wire_strips_trailing_zeros() {
        assert_eq!(float_to_wire(0.1), "0.1");
        assert_eq!(float_to_wire(100.0), "100");
        assert_eq!(float_to_wire(1.23456789), "1.23456789");
    }
}
