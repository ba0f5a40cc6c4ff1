//! Adapters for the external collaborators the core consumes as traits.

use async_trait::async_trait;
use bytes::Bytes;
use opnet_plugin::{HookKind, PluginRuntime, SyncStateSender};
use opnet_rpc::{BitcoinRpcClient, ContractExecutor, RpcClientError};
use opnet_types::{CallRequest, NetworkInfo, RawCallResult, Txid};
use tracing::debug;

/// JSON-RPC client for the wrapped Bitcoin node.
pub struct BitcoindClient {
    http: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
}

impl BitcoindClient {
    pub fn new(url: String, user: Option<String>, password: Option<String>) -> Self {
        let auth = user.map(|u| (u, password.unwrap_or_default()));
        Self { http: reqwest::Client::new(), url, auth }
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcClientError> {
        let mut request = self.http.post(&self.url).json(&serde_json::json!({
            "jsonrpc": "1.0",
            "id": "opnet",
            "method": method,
            "params": params,
        }));
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }
        let response =
            request.send().await.map_err(|e| RpcClientError::Transport(e.to_string()))?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| RpcClientError::Transport(e.to_string()))?;
        if !body["error"].is_null() {
            let code = body["error"]["code"].as_i64().unwrap_or_default();
            let message = body["error"]["message"].as_str().unwrap_or_default();
            return Err(RpcClientError::Node(format!("{code}: {message}")));
        }
        Ok(body["result"].clone())
    }
}

/// Bitcoin RPC presents txids byte-reversed.
fn txid_hex(txid: &Txid) -> String {
    let mut bytes = txid.0;
    bytes.reverse();
    hex::encode(bytes)
}

#[async_trait]
impl BitcoinRpcClient for BitcoindClient {
    async fn block_count(&self) -> Result<u64, RpcClientError> {
        let result = self.rpc_call("getblockcount", serde_json::json!([])).await?;
        result.as_u64().ok_or_else(|| RpcClientError::Node("non-numeric block count".into()))
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<Option<Bytes>, RpcClientError> {
        match self.rpc_call("getrawtransaction", serde_json::json!([txid_hex(txid)])).await {
            Ok(result) => {
                let raw = result.as_str().unwrap_or_default();
                hex::decode(raw)
                    .map(|b| Some(Bytes::from(b)))
                    .map_err(|e| RpcClientError::Node(format!("bad raw tx hex: {e}")))
            }
            // -5: no such mempool or blockchain transaction
            Err(RpcClientError::Node(message)) if message.starts_with("-5:") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn broadcast_transaction(&self, raw: &[u8]) -> Result<String, RpcClientError> {
        let result =
            self.rpc_call("sendrawtransaction", serde_json::json!([hex::encode(raw)])).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }
}

/// Stand-in executor for nodes running without a contract engine attached.
pub struct DetachedExecutor;

#[async_trait]
impl ContractExecutor for DetachedExecutor {
    async fn call(&self, _request: &CallRequest) -> Result<RawCallResult, String> {
        Err("contract runtime not attached".to_string())
    }
}

/// Stand-in plugin runtime: accepts loads, answers hooks without effect.
///
/// The real runtime is the capability-restricted WASM engine living outside
/// this workspace.
pub struct DetachedRuntime;

#[async_trait]
impl PluginRuntime for DetachedRuntime {
    async fn load(
        &self,
        plugin_id: &str,
        _bytecode: Bytes,
        _config: serde_json::Value,
        _network: NetworkInfo,
        _sync: SyncStateSender,
    ) -> Result<(), String> {
        debug!(target: "opnet::node", plugin = %plugin_id, "detached runtime accepted plugin");
        Ok(())
    }

    async fn unload(&self, _plugin_id: &str) {}

    async fn invoke_hook(
        &self,
        plugin_id: &str,
        hook: HookKind,
        _payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, String> {
        debug!(target: "opnet::node", plugin = %plugin_id, hook = %hook, "hook ignored by detached runtime");
        Ok(None)
    }

    async fn invoke_route(
        &self,
        _plugin_id: &str,
        _handler: &str,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        Err("contract runtime not attached".to_string())
    }

    async fn invoke_ws(
        &self,
        _plugin_id: &str,
        _handler: &str,
        _payload: serde_json::Value,
        _client_id: &str,
    ) -> Result<serde_json::Value, String> {
        Err("contract runtime not attached".to_string())
    }
}
