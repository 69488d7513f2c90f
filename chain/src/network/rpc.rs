//! Conceptual peer RPC message shapes.
//!
//! These are the payloads exchanged over the (external) socket layer:
//! liveness pings, the authentication hello with its signed challenge, and
//! the block/catch-up lookups. The shapes are canonical-JSON records; the
//! byte framing around them belongs to the transport.

use serde::{Deserialize, Serialize};

use crate::crypto::Wallet;
use crate::hlc::Hlc;
use crate::types::{Block, Vk};

/// `ping -> {response: "ping"}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub response: String,
}

impl PingResponse {
    pub fn new() -> Self {
        Self {
            response: "ping".to_string(),
        }
    }
}

impl Default for PingResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// `hello{challenge, ip}` — sent when a connection is opened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub challenge: String,
    pub ip: String,
}

/// Response to [`HelloRequest`]: the signed challenge plus this node's
/// chain tip, so the caller can immediately decide whether to catch up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub response: String,
    pub challenge_response: String,
    pub latest_block_number: u64,
    pub latest_hlc_timestamp: Hlc,
}

impl HelloResponse {
    pub fn answer(
        request: &HelloRequest,
        wallet: &Wallet,
        latest_block_number: u64,
        latest_hlc_timestamp: Hlc,
    ) -> Self {
        Self {
            response: "hello".to_string(),
            challenge_response: wallet.sign(&request.challenge),
            latest_block_number,
            latest_hlc_timestamp,
        }
    }
}

/// `get_latest_block -> {number, hlc_timestamp}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatestBlockResponse {
    pub number: u64,
    pub hlc_timestamp: Hlc,
}

/// `get_block{block_num | hlc_timestamp}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBlockRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hlc_timestamp: Option<Hlc>,
}

/// Response to [`GetBlockRequest`]; `block_info` is `None` when the block
/// is unknown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBlockResponse {
    pub block_info: Option<Block>,
}

/// `get_network_map -> {masternodes: {vk -> ip}}`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMapResponse {
    pub masternodes: std::collections::BTreeMap<Vk, String>,
}
