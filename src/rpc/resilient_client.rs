// DANS : src/rpc/resilient_client.rs

use anyhow::{Context, Result};
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::rpc_client::RpcClient,
    rpc_config::RpcTransactionConfig,
    rpc_response::Response as RpcResponse,
};
use solana_sdk::{
    account::Account, commitment_config::CommitmentConfig, pubkey::Pubkey, signature::Signature,
};
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, TransactionStatus, UiTransactionEncoding,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

/// Un "wrapper" autour du RpcClient de Solana qui ajoute une logique de
/// ré-essai automatique pour les appels RPC qui échouent à cause d'erreurs réseau temporaires.
#[derive(Clone)]
pub struct ResilientRpcClient {
    client: Arc<RpcClient>,
    max_retries: u8,
    delay_ms: u64,
}

impl ResilientRpcClient {
    /// Construit un nouveau client RPC résilient.
    pub fn new(rpc_url: String, max_retries: u8, delay_ms: u64) -> Self {
        Self {
            client: Arc::new(RpcClient::new(rpc_url)),
            max_retries,
            delay_ms,
        }
    }

    /// Détermine si une erreur du client est temporaire et si une nouvelle tentative doit être effectuée.
    fn is_retryable(error: &ClientError) -> bool {
        matches!(
            error.kind,
            ClientErrorKind::Reqwest(_) | ClientErrorKind::RpcError(_) | ClientErrorKind::Io(_)
        )
    }

    // --- MÉTHODES WRAPPÉES AVEC LOGIQUE DE RÉ-ESSAI ---

    /// Récupère les données brutes d'un compte.
    pub async fn get_account_data(&self, pubkey: &Pubkey) -> Result<Vec<u8>> {
        for attempt in 0..=self.max_retries {
            match self.client.get_account_data(pubkey).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < self.max_retries {
                        sleep(Duration::from_millis(self.delay_ms)).await;
                    } else {
                        return Err(e).with_context(|| {
                            format!("Échec final de get_account_data pour {}", pubkey)
                        });
                    }
                }
            }
        }
        unreachable!()
    }

    /// Récupère un compte complet.
    pub async fn get_account(&self, pubkey: &Pubkey) -> Result<Account> {
        for attempt in 0..=self.max_retries {
            match self.client.get_account(pubkey).await {
                Ok(account) => return Ok(account),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < self.max_retries {
                        sleep(Duration::from_millis(self.delay_ms)).await;
                    } else {
                        return Err(e)
                            .with_context(|| format!("Échec final de get_account pour {}", pubkey));
                    }
                }
            }
        }
        unreachable!()
    }

    /// Récupère le dernier blockhash.
    pub async fn get_latest_blockhash(&self) -> Result<solana_sdk::hash::Hash> {
        for attempt in 0..=self.max_retries {
            match self.client.get_latest_blockhash().await {
                Ok(hash) => return Ok(hash),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < self.max_retries {
                        sleep(Duration::from_millis(self.delay_ms)).await;
                    } else {
                        return Err(e).with_context(|| "Échec final de get_latest_blockhash");
                    }
                }
            }
        }
        unreachable!()
    }

    /// Récupère le statut d'un lot de signatures (confirmation).
    pub async fn get_signature_statuses(
        &self,
        signatures: &[Signature],
    ) -> Result<RpcResponse<Vec<Option<TransactionStatus>>>> {
        for attempt in 0..=self.max_retries {
            match self.client.get_signature_statuses(signatures).await {
                Ok(statuses) => return Ok(statuses),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < self.max_retries {
                        sleep(Duration::from_millis(self.delay_ms)).await;
                    } else {
                        return Err(e).with_context(|| "Échec final de get_signature_statuses");
                    }
                }
            }
        }
        unreachable!()
    }

    /// Récupère une transaction confirmée complète, encodée en base64.
    pub async fn get_transaction(
        &self,
        signature: &Signature,
    ) -> Result<EncodedConfirmedTransactionWithStatusMeta> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        for attempt in 0..=self.max_retries {
            match self
                .client
                .get_transaction_with_config(signature, config)
                .await
            {
                Ok(transaction) => return Ok(transaction),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < self.max_retries {
                        sleep(Duration::from_millis(self.delay_ms)).await;
                    } else {
                        return Err(e).with_context(|| {
                            format!("Échec final de get_transaction pour {}", signature)
                        });
                    }
                }
            }
        }
        unreachable!()
    }
}
