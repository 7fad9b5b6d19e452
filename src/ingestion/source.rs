// DANS : src/ingestion/source.rs
//
// Une connexion Geyser gRPC pilotée par une machine à états explicite.
// La reconnexion est immédiate et sans backoff : sur ce flux, chaque
// milliseconde hors ligne est une transaction potentiellement manquée,
// on préfère marteler l'endpoint plutôt que d'attendre.

use crate::ingestion::{RawEvent, SourceId};
use crate::monitoring::metrics;
use anyhow::{Context, Result, anyhow, bail};
use arc_swap::ArcSwap;
use futures_util::SinkExt;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use yellowstone_grpc_client::GeyserGrpcClient;
use yellowstone_grpc_proto::prelude::{
    CommitmentLevel, SubscribeRequest, SubscribeRequestFilterTransactions, SubscribeRequestPing,
    subscribe_update::UpdateOneof,
};

/// Le filtre d'abonnement, partagé via `ArcSwap` : le binaire peut le
/// remplacer à chaud, les sources le rechargent à la prochaine nudge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// Transactions retenues seulement si elles touchent TOUS ces comptes
    /// (c'est ainsi qu'on épingle un programme).
    pub required_accounts: Vec<String>,
    pub include_accounts: Vec<String>,
    pub exclude_accounts: Vec<String>,
    /// Les transactions échouées portent les codes d'erreur qui nous font
    /// désuivre un pool, on les garde donc par défaut.
    pub include_failed: bool,
}

impl SubscriptionFilter {
    pub fn for_programs(programs: &[Pubkey]) -> Self {
        Self {
            required_accounts: programs.iter().map(|p| p.to_string()).collect(),
            include_accounts: vec![],
            exclude_accounts: vec![],
            include_failed: true,
        }
    }

    fn to_request(&self) -> SubscribeRequest {
        let failed = if self.include_failed { None } else { Some(false) };
        SubscribeRequest {
            transactions: HashMap::from([(
                "txs".to_string(),
                SubscribeRequestFilterTransactions {
                    vote: Some(false),
                    failed,
                    account_include: self.include_accounts.clone(),
                    account_exclude: self.exclude_accounts.clone(),
                    account_required: self.required_accounts.clone(),
                    signature: None,
                },
            )]),
            commitment: Some(CommitmentLevel::Processed as i32),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Connecting => "connecting",
            SourceState::Subscribed => "subscribed",
            SourceState::Streaming => "streaming",
        }
    }
}

/// Une source Geyser : un endpoint, un état, un canal de sortie.
pub struct GeyserSource {
    id: SourceId,
    endpoint: String,
    filter: Arc<ArcSwap<SubscriptionFilter>>,
    refilter_rx: watch::Receiver<u64>,
    output: mpsc::Sender<RawEvent>,
    state: SourceState,
}

impl GeyserSource {
    pub fn new(
        id: SourceId,
        endpoint: String,
        filter: Arc<ArcSwap<SubscriptionFilter>>,
        refilter_rx: watch::Receiver<u64>,
        output: mpsc::Sender<RawEvent>,
    ) -> Self {
        Self {
            id,
            endpoint,
            filter,
            refilter_rx,
            output,
            state: SourceState::Disconnected,
        }
    }

    /// Lance la boucle de vie de la source dans sa propre tâche.
    /// Elle ne s'arrête que lorsque le pipeline aval est fermé.
    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.run_connection().await {
                    Ok(()) => {
                        info!(source = %self.id, "[Source] Pipeline fermé, arrêt de la source.");
                        break;
                    }
                    Err(error) => {
                        warn!(
                            source = %self.id,
                            error = format!("{error:#}"),
                            "[Source] Connexion perdue, reconnexion immédiate."
                        );
                        metrics::SOURCE_RECONNECTS
                            .with_label_values(&[&self.id.to_string()])
                            .inc();
                        self.set_state(SourceState::Disconnected);
                    }
                }
            }
        })
    }

    /// Une vie de connexion : Connecting → Subscribed → Streaming, puis
    /// pompe le flux jusqu'à l'erreur de transport ou la fin du stream.
    async fn run_connection(&mut self) -> Result<()> {
        self.set_state(SourceState::Connecting);
        let mut client = GeyserGrpcClient::build_from_shared(self.endpoint.clone())?
            .connect()
            .await
            .with_context(|| format!("Connexion Geyser impossible ({})", self.endpoint))?;
        let (mut subscribe_tx, mut stream) = client.subscribe().await?;
        self.set_state(SourceState::Subscribed);

        // On repart toujours du filtre le plus récent ; une nudge reçue
        // pendant la coupure est donc déjà satisfaite.
        self.refilter_rx.borrow_and_update();
        let request = self.filter.load().to_request();
        subscribe_tx.send(request).await.map_err(|e| anyhow!(e))?;
        self.set_state(SourceState::Streaming);

        loop {
            tokio::select! {
                changed = self.refilter_rx.changed() => {
                    if changed.is_err() {
                        bail!("canal de re-souscription fermé");
                    }
                    let request = self.filter.load().to_request();
                    subscribe_tx.send(request).await.map_err(|e| anyhow!(e))?;
                    info!(source = %self.id, "[Source] Filtre re-soumis sur la connexion vivante.");
                }
                message = stream.next() => {
                    let Some(result) = message else {
                        bail!("stream clôturé par le serveur");
                    };
                    let update = result.context("Erreur de stream gRPC")?;
                    match update.update_oneof {
                        Some(UpdateOneof::Transaction(tx)) => {
                            metrics::EVENTS_RECEIVED
                                .with_label_values(&[&self.id.to_string()])
                                .inc();
                            if let Some(event) = RawEvent::from_geyser(tx, self.id) {
                                if self.output.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(UpdateOneof::Ping(_)) => {
                            let pong = SubscribeRequest {
                                ping: Some(SubscribeRequestPing { id: 1 }),
                                ..Default::default()
                            };
                            subscribe_tx.send(pong).await.map_err(|e| anyhow!(e))?;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn set_state(&mut self, next: SourceState) {
        if self.state != next {
            info!(
                source = %self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "[Source] Transition d'état."
            );
            metrics::SOURCE_STATE_TRANSITIONS
                .with_label_values(&[&self.id.to_string(), next.as_str()])
                .inc();
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keeps_failed_transactions_by_default() {
        let program = Pubkey::new_unique();
        let filter = SubscriptionFilter::for_programs(&[program]);
        let request = filter.to_request();

        let tx_filter = request.transactions.get("txs").unwrap();
        assert_eq!(tx_filter.vote, Some(false));
        assert_eq!(tx_filter.failed, None);
        assert_eq!(tx_filter.account_required, vec![program.to_string()]);
        assert_eq!(
            request.commitment,
            Some(CommitmentLevel::Processed as i32)
        );
    }

    #[test]
    fn filter_can_exclude_failed_transactions() {
        let mut filter = SubscriptionFilter::for_programs(&[]);
        filter.include_failed = false;
        let request = filter.to_request();
        assert_eq!(
            request.transactions.get("txs").unwrap().failed,
            Some(false)
        );
    }
}
