// DANS : src/execution/channels.rs
//
// Les canaux de livraison d'une transaction signée. Un seul moteur les
// porte tous : la diffusion RPC brute, les deux façades du relai à
// enchères (bundle et transaction simple) et le relai tiers à clé d'API.

use crate::monitoring::metrics;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

lazy_static! {
    /// Les comptes de pourboire du relai, rotation round-robin pour ne pas
    /// écrire toujours sur le même compte.
    pub static ref RELAY_TIP_ACCOUNTS: Vec<Pubkey> = [
        "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
        "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
        "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
        "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
        "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
        "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
        "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
        "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
    ]
    .iter()
    .filter_map(|address| Pubkey::from_str(address).ok())
    .collect();
}

const HTTP_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    DirectRpc,
    RelayBundle,
    RelayDirect,
    ThirdPartyRelay,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::DirectRpc => "direct_rpc",
            DeliveryChannel::RelayBundle => "relay_bundle",
            DeliveryChannel::RelayDirect => "relay_direct",
            DeliveryChannel::ThirdPartyRelay => "third_party_relay",
        }
    }

    /// Les canaux relai portent un pourboire dans la transaction.
    pub fn carries_tip(&self) -> bool {
        matches!(
            self,
            DeliveryChannel::RelayBundle | DeliveryChannel::RelayDirect
        )
    }
}

impl std::fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryChannel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "direct_rpc" => Ok(DeliveryChannel::DirectRpc),
            "relay_bundle" => Ok(DeliveryChannel::RelayBundle),
            "relay_direct" => Ok(DeliveryChannel::RelayDirect),
            "third_party_relay" => Ok(DeliveryChannel::ThirdPartyRelay),
            other => Err(format!("canal de livraison inconnu: {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Seule erreur qui justifie une reconstruction et un second envoi.
    #[error("blockhash expiré")]
    BlockhashExpired,
    #[error("tous les endpoints RPC ont refusé: {0}")]
    AllEndpointsFailed(String),
    #[error("relai: {0}")]
    Relay(String),
    #[error("transaction non sérialisable: {0}")]
    Serialize(String),
    #[error("canal non configuré: {0}")]
    ChannelUnavailable(DeliveryChannel),
}

/// Les URLs des canaux, issues de la configuration.
#[derive(Debug, Clone)]
pub struct RelayEndpoints {
    pub send_urls: Vec<String>,
    pub bundle_url: String,
    pub transaction_url: String,
    pub third_party_url: Option<String>,
    pub third_party_api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcReply {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    message: String,
}

pub struct SubmissionEngine {
    rpc_senders: Vec<Arc<RpcClient>>,
    http: reqwest::Client,
    endpoints: RelayEndpoints,
    tip_cursor: AtomicUsize,
}

impl SubmissionEngine {
    pub fn new(endpoints: RelayEndpoints) -> Self {
        let rpc_senders = endpoints
            .send_urls
            .iter()
            .map(|url| Arc::new(RpcClient::new(url.clone())))
            .collect();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            rpc_senders,
            http,
            endpoints,
            tip_cursor: AtomicUsize::new(0),
        }
    }

    /// Le prochain compte de pourboire, en rotation.
    pub fn next_tip_account(&self) -> Pubkey {
        let index = self.tip_cursor.fetch_add(1, Ordering::Relaxed);
        RELAY_TIP_ACCOUNTS[index % RELAY_TIP_ACCOUNTS.len()]
    }

    /// Soumet une transaction déjà signée sur le canal demandé.
    pub async fn submit(
        &self,
        channel: DeliveryChannel,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, SubmitError> {
        let result = match channel {
            DeliveryChannel::DirectRpc => self.submit_direct_rpc(transaction).await,
            DeliveryChannel::RelayBundle => self.submit_bundle(transaction).await,
            DeliveryChannel::RelayDirect => {
                self.submit_json_rpc_send(&self.endpoints.transaction_url, None, transaction)
                    .await
            }
            DeliveryChannel::ThirdPartyRelay => {
                let url = self
                    .endpoints
                    .third_party_url
                    .as_ref()
                    .ok_or(SubmitError::ChannelUnavailable(channel))?;
                self.submit_json_rpc_send(
                    url,
                    self.endpoints.third_party_api_key.as_deref(),
                    transaction,
                )
                .await
            }
        };

        let status = if result.is_ok() { "ok" } else { "err" };
        metrics::SUBMISSIONS
            .with_label_values(&[channel.as_str(), status])
            .inc();
        result
    }

    /// Diffusion brute : tous les endpoints en parallèle, le premier accusé
    /// de réception gagne, les échecs individuels sont tolérés.
    async fn submit_direct_rpc(
        &self,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, SubmitError> {
        if self.rpc_senders.is_empty() {
            return Err(SubmitError::ChannelUnavailable(DeliveryChannel::DirectRpc));
        }

        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            ..RpcSendTransactionConfig::default()
        };

        let mut pending: FuturesUnordered<_> = self
            .rpc_senders
            .iter()
            .map(|client| {
                let client = Arc::clone(client);
                let transaction = transaction.clone();
                async move {
                    client
                        .send_transaction_with_config(&transaction, config)
                        .await
                        .map_err(|error| error.to_string())
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some(result) = pending.next().await {
            match result {
                Ok(signature) => return Ok(signature),
                Err(message) => {
                    debug!(error = %message, "[Soumission] Un endpoint RPC a refusé.");
                    failures.push(message);
                }
            }
        }
        Err(classify_failure(failures.join(" | ")))
    }

    async fn submit_bundle(
        &self,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, SubmitError> {
        let encoded = encode_base64(transaction)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendBundle",
            "params": [[encoded], { "encoding": "base64" }],
        });
        self.post_json_rpc(&self.endpoints.bundle_url, None, body)
            .await?;
        // Le relai répond par un identifiant de bundle ; la signature de la
        // transaction reste la seule poignée de confirmation.
        Ok(transaction.signatures[0])
    }

    async fn submit_json_rpc_send(
        &self,
        url: &str,
        api_key: Option<&str>,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, SubmitError> {
        let encoded = encode_base64(transaction)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [encoded, { "encoding": "base64", "skipPreflight": true }],
        });
        let result = self.post_json_rpc(url, api_key, body).await?;
        let signature = result
            .as_str()
            .and_then(|text| Signature::from_str(text).ok())
            .unwrap_or(transaction.signatures[0]);
        Ok(signature)
    }

    async fn post_json_rpc(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, SubmitError> {
        let mut request = self.http.post(url).json(&body);
        if let Some(key) = api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|error| SubmitError::Relay(error.to_string()))?;
        if !response.status().is_success() {
            return Err(SubmitError::Relay(format!(
                "statut HTTP {}",
                response.status()
            )));
        }
        let reply: JsonRpcReply = response
            .json()
            .await
            .map_err(|error| SubmitError::Relay(error.to_string()))?;
        if let Some(error) = reply.error {
            return Err(classify_failure(error.message));
        }
        reply
            .result
            .ok_or_else(|| SubmitError::Relay("réponse sans résultat".to_string()))
    }
}

/// Un refus qui mentionne le blockhash est le seul cas rejouable.
fn classify_failure(message: String) -> SubmitError {
    if message.to_lowercase().contains("blockhash") {
        SubmitError::BlockhashExpired
    } else {
        SubmitError::AllEndpointsFailed(message)
    }
}

fn encode_base64(transaction: &VersionedTransaction) -> Result<String, SubmitError> {
    let bytes =
        bincode::serialize(transaction).map_err(|error| SubmitError::Serialize(error.to_string()))?;
    Ok(STANDARD.encode(bytes))
}

/// Pourboire relai : un pourcentage de la valeur attendue, borné.
pub fn calculate_tip(expected_value: u64, profit_percent: u64, min: u64, max: u64) -> u64 {
    let from_value = (expected_value as u128 * profit_percent as u128 / 100) as u64;
    from_value.clamp(min, max.max(min))
}
