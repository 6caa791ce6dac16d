//! RPC Method Implementations
//!
//! Each method corresponds to a JSON-RPC call that external apps can make.

use crate::consensus::Transaction;
use crate::crypto::{Address, Hash};
use crate::node::Node;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Value,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC Error
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const BLOCK_NOT_FOUND: i32 = -5;

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

/// Arguments of `add_transaction`
#[derive(Debug, Deserialize)]
pub struct AddTransactionArgs {
    pub value: u64,
    pub nonce: u64,
    /// Hex sender address
    pub from: String,
    /// Hex recipient address
    pub to: String,
}

#[derive(Debug, Deserialize)]
struct GetBlockArgs {
    hash: String,
}

/// RPC Handler State
pub struct RpcState {
    pub node: Arc<Node>,
}

/// Process a JSON-RPC request and return a response
pub async fn handle_request(state: &RpcState, request: JsonRpcRequest) -> JsonRpcResponse {
    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(
            request.id,
            INVALID_REQUEST,
            format!("Unsupported jsonrpc version: {}", request.jsonrpc),
        );
    }
    match request.method.as_str() {
        "add_transaction" => add_transaction(state, request.id, request.params),
        "mine_block" => mine_block(state, request.id).await,
        "chain_info" => chain_info(state, request.id).await,
        "get_block" => get_block(state, request.id, request.params).await,
        "peers" => peers(state, request.id),
        "stop" => stop(state, request.id),
        _ => JsonRpcResponse::error(
            request.id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    }
}

/// Accept `{..}` or `[{..}]`
fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    let value = match params {
        Some(Value::Array(mut arr)) if arr.len() == 1 => arr.remove(0),
        Some(value) => value,
        None => return Err("missing params".to_string()),
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Pools a transaction and gossips it to peers
fn add_transaction(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let args: AddTransactionArgs = match parse_params(params) {
        Ok(args) => args,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {e}")),
    };
    let (from, to) = match (Address::from_hex(&args.from), Address::from_hex(&args.to)) {
        (Ok(from), Ok(to)) => (from, to),
        _ => return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: bad address".into()),
    };

    let tx = Transaction::new(from, to, args.nonce, args.value);
    match state.node.add_transaction(tx) {
        Ok(hash) => {
            info!("RPC: pooled transaction {hash}");
            JsonRpcResponse::success(id, json!({ "hash": hash.to_hex() }))
        }
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// Mines the pooled transactions into a new block
async fn mine_block(state: &RpcState, id: Value) -> JsonRpcResponse {
    match state.node.mine_block().await {
        Ok(block) => JsonRpcResponse::success(
            id,
            json!({
                "hash": block.hash.to_hex(),
                "height": block.height,
                "transactions": block.tx_count(),
            }),
        ),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// Returns head, height and node identity
async fn chain_info(state: &RpcState, id: Value) -> JsonRpcResponse {
    let node = &state.node;
    match node.chain().status().await {
        Ok(status) => JsonRpcResponse::success(
            id,
            json!({
                "head": status.head.to_hex(),
                "height": status.height,
                "difficulty": status.difficulty,
                "pending_transactions": node.pool().len(),
                "peer_id": node.local_peer_id().to_string(),
                "listen_addr": node.network().local_addr().to_string(),
            }),
        ),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// Returns full block data by hash
async fn get_block(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let hash_str = match params {
        Some(Value::String(s)) => s,
        other => match parse_params::<GetBlockArgs>(other) {
            Ok(args) => args.hash,
            Err(_) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected block hash".into())
            }
        },
    };

    let hash = match Hash::from_hex(&hash_str) {
        Ok(h) => h,
        Err(_) => return JsonRpcResponse::error(id, BLOCK_NOT_FOUND, "Block not found".into()),
    };

    match state.node.chain().get_block(hash).await {
        Ok(Some(block)) => {
            let transactions: Vec<Value> = block
                .transactions
                .iter()
                .map(|tx| {
                    json!({
                        "from": tx.from.to_hex(),
                        "to": tx.to.to_hex(),
                        "value": tx.value,
                        "nonce": tx.nonce,
                    })
                })
                .collect();
            JsonRpcResponse::success(
                id,
                json!({
                    "hash": block.hash.to_hex(),
                    "height": block.height,
                    "priori": block.header.priori.to_hex(),
                    "summary": block.header.summary.to_hex(),
                    "timestamp": block.header.timestamp,
                    "nonce": block.header.nonce,
                    "transactions": transactions,
                }),
            )
        }
        Ok(None) => JsonRpcResponse::error(id, BLOCK_NOT_FOUND, "Block not found".into()),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// Returns the connected peers
fn peers(state: &RpcState, id: Value) -> JsonRpcResponse {
    let peers: Vec<String> = state
        .node
        .network()
        .connected_peers()
        .iter()
        .map(|p| p.to_string())
        .collect();
    JsonRpcResponse::success(id, json!({ "count": peers.len(), "peers": peers }))
}

/// Asks the node to shut down after replying
fn stop(state: &RpcState, id: Value) -> JsonRpcResponse {
    info!("RPC: stop requested");
    state.node.request_stop();
    JsonRpcResponse::success(id, json!(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_accepts_object_or_single_array() {
        let object = json!({"value": 5, "nonce": 1, "from": "aa", "to": "bb"});
        let args: AddTransactionArgs = parse_params(Some(object.clone())).unwrap();
        assert_eq!(args.value, 5);

        let args: AddTransactionArgs = parse_params(Some(json!([object]))).unwrap();
        assert_eq!(args.to, "bb");

        assert!(parse_params::<AddTransactionArgs>(None).is_err());
        assert!(parse_params::<AddTransactionArgs>(Some(json!({"value": 1}))).is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let response = JsonRpcResponse::error(json!(3), METHOD_NOT_FOUND, "nope".into());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["code"], -32601);
        assert_eq!(value["id"], 3);
        assert!(value["result"].is_null());
    }
}
