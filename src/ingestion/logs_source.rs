// DANS : src/ingestion/logs_source.rs
//
// Source redondante par WebSocket : `logsSubscribe` annonce les signatures
// qui mentionnent le programme, puis on rapatrie chaque transaction complète
// par RPC. Plus lent que Geyser, mais sur une autre infrastructure : quand
// le gRPC tousse, ce chemin continue d'alimenter le pipeline, et le cache de
// déduplication écrase les doublons en aval.

use crate::ingestion::{RawEvent, RawInstruction, SourceId, TableLookup, balance_deltas};
use crate::monitoring::metrics;
use crate::rpc::ResilientRpcClient;
use anyhow::{Context, Result, bail};
use futures_util::stream::FuturesOrdered;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::InstructionError;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::TransactionError;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, UiInnerInstructions, UiInstruction,
    UiTransactionTokenBalance,
};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

pub struct LogsSource {
    id: SourceId,
    ws_url: String,
    program: Pubkey,
    rpc: Arc<ResilientRpcClient>,
    output: mpsc::Sender<RawEvent>,
}

impl LogsSource {
    pub fn new(
        id: SourceId,
        ws_url: String,
        program: Pubkey,
        rpc: Arc<ResilientRpcClient>,
        output: mpsc::Sender<RawEvent>,
    ) -> Self {
        Self {
            id,
            ws_url,
            program,
            rpc,
            output,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.run_connection().await {
                    Ok(()) => {
                        info!(source = %self.id, "[SourceLogs] Pipeline fermé, arrêt de la source.");
                        break;
                    }
                    Err(error) => {
                        warn!(
                            source = %self.id,
                            error = format!("{error:#}"),
                            "[SourceLogs] Connexion perdue, reconnexion immédiate."
                        );
                        metrics::SOURCE_RECONNECTS
                            .with_label_values(&[&self.id.to_string()])
                            .inc();
                    }
                }
            }
        })
    }

    async fn run_connection(&self) -> Result<()> {
        let client = PubsubClient::new(&self.ws_url)
            .await
            .with_context(|| format!("Connexion WebSocket impossible ({})", self.ws_url))?;
        let filter = RpcTransactionLogsFilter::Mentions(vec![self.program.to_string()]);
        let config = RpcTransactionLogsConfig {
            commitment: Some(CommitmentConfig::confirmed()),
        };
        let (stream, _unsubscribe) = client
            .logs_subscribe(filter, config)
            .await
            .context("Échec de l'abonnement logsSubscribe")?;
        info!(source = %self.id, program = %self.program, "[SourceLogs] Abonnement actif.");

        let source_label = self.id.to_string();
        let announced = stream.filter_map(move |response| {
            metrics::EVENTS_RECEIVED
                .with_label_values(&[&source_label])
                .inc();
            let raw = bs58::decode(&response.value.signature).into_vec().ok()?;
            Signature::try_from(raw.as_slice()).ok()
        });

        forward_in_order(announced, |signature| self.hydrate(signature), &self.output).await
    }

    /// Rapatrie la transaction annoncée et la met au format du flux principal.
    async fn hydrate(&self, signature: Signature) -> Option<RawEvent> {
        match self.rpc.get_transaction(&signature).await {
            Ok(fetched) => event_from_fetched(self.id, fetched),
            Err(error) => {
                warn!(
                    %signature,
                    error = format!("{error:#}"),
                    "[SourceLogs] Transaction annoncée mais irrécupérable."
                );
                None
            }
        }
    }
}

/// Pompe les signatures annoncées vers l'aval. La récupération RPC prend des
/// dizaines de millisecondes, les hydratations tournent donc en parallèle,
/// mais la file ordonnée livre dans l'ordre des annonces : l'aval suppose
/// l'ordre par source, un fetch lent ne doit pas se faire doubler.
async fn forward_in_order<S, F, Fut>(
    mut announced: S,
    mut hydrate: F,
    output: &mpsc::Sender<RawEvent>,
) -> Result<()>
where
    S: Stream<Item = Signature> + Unpin,
    F: FnMut(Signature) -> Fut,
    Fut: Future<Output = Option<RawEvent>>,
{
    let mut inflight = FuturesOrdered::new();
    loop {
        tokio::select! {
            maybe = announced.next() => {
                match maybe {
                    Some(signature) => {
                        if output.is_closed() {
                            return Ok(());
                        }
                        inflight.push_back(hydrate(signature));
                    }
                    None => break,
                }
            }
            hydrated = inflight.next(), if !inflight.is_empty() => {
                if let Some(Some(event)) = hydrated {
                    if output.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    // Le serveur a clôturé le flux : on livre ce qui est déjà en vol avant
    // de rendre la main pour reconnexion.
    while let Some(hydrated) = inflight.next().await {
        if let Some(event) = hydrated {
            if output.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    bail!("stream logsSubscribe clôturé par le serveur")
}

/// Met à plat une transaction récupérée par RPC dans le même format que le
/// flux Geyser, pour que l'aval ne voie aucune différence entre les sources.
fn event_from_fetched(
    source: SourceId,
    fetched: EncodedConfirmedTransactionWithStatusMeta,
) -> Option<RawEvent> {
    let decoded = fetched.transaction.transaction.decode()?;
    let signature = *decoded.signatures.first()?;
    let message = decoded.message;

    let instructions = message
        .instructions()
        .iter()
        .map(|ix| RawInstruction {
            program_id_index: ix.program_id_index,
            accounts: ix.accounts.clone(),
            data: ix.data.clone(),
        })
        .collect();

    let table_lookups = message
        .address_table_lookups()
        .map(|lookups| {
            lookups
                .iter()
                .map(|lookup| TableLookup {
                    table: lookup.account_key,
                    writable_indexes: lookup.writable_indexes.clone(),
                    readonly_indexes: lookup.readonly_indexes.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut event = RawEvent {
        source,
        signature,
        slot: fetched.slot,
        recent_blockhash: *message.recent_blockhash(),
        account_keys: message.static_account_keys().to_vec(),
        instructions,
        inner_instructions: Vec::new(),
        balance_deltas: Vec::new(),
        failed: false,
        error_code: None,
        loaded_writable: Vec::new(),
        loaded_readonly: Vec::new(),
        table_lookups,
    };

    let Some(meta) = fetched.transaction.meta else {
        return Some(event);
    };

    event.failed = meta.err.is_some();
    event.error_code = match &meta.err {
        Some(TransactionError::InstructionError(_, InstructionError::Custom(code))) => Some(*code),
        _ => None,
    };

    if let Some(groups) = Option::<Vec<UiInnerInstructions>>::from(meta.inner_instructions) {
        event.inner_instructions = groups.into_iter().map(compiled_inner).collect();
    }

    let loaded: Option<solana_transaction_status::UiLoadedAddresses> =
        meta.loaded_addresses.into();
    if let Some(loaded) = loaded {
        event.loaded_writable = parse_address_list(&loaded.writable);
        event.loaded_readonly = parse_address_list(&loaded.readonly);
    }

    let pre: Vec<_> = Option::<Vec<UiTransactionTokenBalance>>::from(meta.pre_token_balances)
        .unwrap_or_default()
        .into_iter()
        .map(adapt_balance)
        .collect();
    let post: Vec<_> = Option::<Vec<UiTransactionTokenBalance>>::from(meta.post_token_balances)
        .unwrap_or_default()
        .into_iter()
        .map(adapt_balance)
        .collect();
    event.balance_deltas = balance_deltas(&pre, &post);

    Some(event)
}

/// Les instructions internes arrivent compilées avec leur payload en base58.
fn compiled_inner(group: UiInnerInstructions) -> (u8, Vec<RawInstruction>) {
    let instructions = group
        .instructions
        .into_iter()
        .filter_map(|instruction| match instruction {
            UiInstruction::Compiled(compiled) => Some(RawInstruction {
                program_id_index: compiled.program_id_index,
                accounts: compiled.accounts,
                data: bs58::decode(&compiled.data).into_vec().ok()?,
            }),
            UiInstruction::Parsed(_) => None,
        })
        .collect();
    (group.index, instructions)
}

fn parse_address_list(raw: &[String]) -> Vec<Pubkey> {
    raw.iter()
        .filter_map(|address| Pubkey::from_str(address).ok())
        .collect()
}

/// Ramène un solde de token RPC au format du flux principal pour partager
/// le même calcul de variation.
fn adapt_balance(
    balance: UiTransactionTokenBalance,
) -> yellowstone_grpc_proto::prelude::TokenBalance {
    yellowstone_grpc_proto::prelude::TokenBalance {
        account_index: balance.account_index as u32,
        mint: balance.mint,
        ui_token_amount: Some(yellowstone_grpc_proto::prelude::UiTokenAmount {
            ui_amount: balance.ui_token_amount.ui_amount.unwrap_or(0.0),
            decimals: balance.ui_token_amount.decimals as u32,
            amount: balance.ui_token_amount.amount,
            ui_amount_string: balance.ui_token_amount.ui_amount_string,
        }),
        owner: Option::<String>::from(balance.owner).unwrap_or_default(),
        program_id: Option::<String>::from(balance.program_id).unwrap_or_default(),
    }
}
