// DANS : src/execution/worker.rs
//
// Le pool de workers qui exécute les TradeJob : hydratation du marché à la
// première vente, construction, soumission avec une seule reconstruction
// sur blockhash expiré, puis sondage de la confirmation. Le dispatcher ne
// bloque jamais ; c'est ici que le temps se passe.

use crate::decoders::serum_market::decode_market_keys;
use crate::execution::TradeJob;
use crate::execution::builder::{SwapPlan, TransactionBuilder};
use crate::execution::channels::{SubmissionEngine, SubmitError, calculate_tip};
use crate::ledger::{
    AbandonReason, SubmissionAttempt, TradeDirection, TradeLedger, TradeStatus, now_ms,
};
use crate::rpc::ResilientRpcClient;
use crate::state::{PoolRecord, PoolTracker};
use anyhow::{Context, Result, bail};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const CONFIRM_POLL_INTERVAL_MS: u64 = 2_000;
const CONFIRM_POLL_ATTEMPTS: u32 = 30;

/// Les réglages opérationnels que chaque worker applique aux trades.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub chunk_division: u32,
    pub tip_min_lamports: u64,
    pub tip_max_lamports: u64,
    pub tip_profit_percent: u64,
}

pub struct TradeWorker {
    queue: Arc<Mutex<mpsc::UnboundedReceiver<TradeJob>>>,
    rpc: Arc<ResilientRpcClient>,
    engine: Arc<SubmissionEngine>,
    builder: Arc<TransactionBuilder>,
    tracker: PoolTracker,
    ledger: Arc<TradeLedger>,
    settings: WorkerSettings,
}

/// Démarre `count` workers sur une file partagée.
#[allow(clippy::too_many_arguments)]
pub fn start_workers(
    count: usize,
    jobs: mpsc::UnboundedReceiver<TradeJob>,
    rpc: Arc<ResilientRpcClient>,
    engine: Arc<SubmissionEngine>,
    builder: Arc<TransactionBuilder>,
    tracker: PoolTracker,
    ledger: Arc<TradeLedger>,
    settings: WorkerSettings,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(jobs));
    (0..count.max(1))
        .map(|index| {
            let worker = TradeWorker {
                queue: queue.clone(),
                rpc: rpc.clone(),
                engine: engine.clone(),
                builder: builder.clone(),
                tracker: tracker.clone(),
                ledger: ledger.clone(),
                settings,
            };
            tokio::spawn(worker.run(index))
        })
        .collect()
}

impl TradeWorker {
    async fn run(self, index: usize) {
        info!("[Worker {index}] Démarré.");
        loop {
            // Le verrou n'est tenu que le temps du recv : un job long
            // n'empêche pas les autres workers de se servir.
            let job = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(job) = job else {
                break;
            };
            self.handle(job).await;
        }
        info!("[Worker {index}] File fermée, arrêt.");
    }

    async fn handle(&self, mut job: TradeJob) {
        if let Some(deadline) = job.not_before {
            tokio::time::sleep_until(deadline).await;
        }
        if !self.ledger.advance(&mut job.trade, TradeStatus::Preprocessed) {
            return;
        }

        let Some(mut record) = self.tracker.get(&job.pool) else {
            warn!(pool = %job.pool, "[Worker] Pool inconnu au moment d'exécuter.");
            self.fail(&mut job, AbandonReason::MarketUnavailable);
            return;
        };

        if let Err(e) = self.ensure_market_hydrated(&mut record).await {
            warn!(pool = %job.pool, "[Worker] Hydratation du marché impossible: {e:#}");
            self.fail(&mut job, AbandonReason::MarketUnavailable);
            return;
        }

        let signature = match self.submit_with_retry(&record, &mut job).await {
            Ok(signature) => signature,
            Err(e) => {
                warn!(trade = %job.trade.id, "[Worker] Soumission abandonnée: {e:#}");
                let reason = if e.is::<SubmitError>() {
                    AbandonReason::SubmissionFailed
                } else {
                    AbandonReason::BuildFailed
                };
                self.fail(&mut job, reason);
                return;
            }
        };
        self.ledger.advance(&mut job.trade, TradeStatus::Processed);
        debug!(trade = %job.trade.id, signature = %signature, "[Worker] Transaction partie, sondage de la confirmation.");

        match self.await_confirmation(&signature).await {
            Ok(()) => self.settle_confirmed(&mut job).await,
            Err(e) => {
                warn!(trade = %job.trade.id, signature = %signature, "[Worker] Confirmation manquée: {e:#}");
                self.fail(&mut job, AbandonReason::ConfirmationTimeout);
            }
        }
    }

    /// Renseigne les clés du carnet d'ordres si la fiche ne les porte pas
    /// encore. Fait une seule fois par pool, puis persisté.
    async fn ensure_market_hydrated(&self, record: &mut PoolRecord) -> Result<()> {
        if record.market_is_hydrated() {
            return Ok(());
        }
        let account = self.rpc.get_account(&record.market).await?;
        let keys = decode_market_keys(&record.market, &record.market_program, &account.data)?;
        record.market_bids = keys.bids;
        record.market_asks = keys.asks;
        record.market_event_queue = keys.event_queue;
        record.market_coin_vault = keys.coin_vault;
        record.market_pc_vault = keys.pc_vault;
        record.market_vault_signer = keys.vault_signer;
        self.tracker.save(record);
        debug!(market = %record.market, "[Worker] Clés de marché hydratées.");
        Ok(())
    }

    /// Construit, signe et soumet. Un blockhash expiré vaut exactement une
    /// reconstruction avec un blockhash frais ; toute autre erreur est finale.
    async fn submit_with_retry(
        &self,
        record: &PoolRecord,
        job: &mut TradeJob,
    ) -> Result<Signature> {
        for rebuild in 0..=1u8 {
            let blockhash = self
                .rpc
                .get_latest_blockhash()
                .await
                .context("pas de blockhash frais")?;
            let plan = SwapPlan {
                record,
                direction: job.direction,
                amount_in: job.amount,
                blockhash,
                tip: self.tip_for(&job.trade.direction, job.amount, job.channel.carries_tip()),
            };
            let transaction = self.builder.build_swap(&plan)?;
            let sent_at_ms = now_ms();

            match self.engine.submit(job.channel, &transaction).await {
                Ok(signature) => {
                    self.ledger.record_attempt(
                        &mut job.trade,
                        SubmissionAttempt {
                            channel: job.channel.as_str().to_string(),
                            signature: Some(signature),
                            sent_at_ms,
                            error: None,
                        },
                    );
                    return Ok(signature);
                }
                Err(SubmitError::BlockhashExpired) if rebuild == 0 => {
                    self.ledger.record_attempt(
                        &mut job.trade,
                        SubmissionAttempt {
                            channel: job.channel.as_str().to_string(),
                            signature: None,
                            sent_at_ms,
                            error: Some(SubmitError::BlockhashExpired.to_string()),
                        },
                    );
                    debug!(trade = %job.trade.id, "[Worker] Blockhash expiré, reconstruction.");
                }
                Err(e) => {
                    self.ledger.record_attempt(
                        &mut job.trade,
                        SubmissionAttempt {
                            channel: job.channel.as_str().to_string(),
                            signature: None,
                            sent_at_ms,
                            error: Some(e.to_string()),
                        },
                    );
                    return Err(e.into());
                }
            }
        }
        unreachable!()
    }

    fn tip_for(
        &self,
        direction: &TradeDirection,
        amount: u64,
        channel_carries_tip: bool,
    ) -> Option<(Pubkey, u64)> {
        if !channel_carries_tip {
            return None;
        }
        let lamports = match direction {
            TradeDirection::Buy => calculate_tip(
                amount,
                self.settings.tip_profit_percent,
                self.settings.tip_min_lamports,
                self.settings.tip_max_lamports,
            ),
            // Une sortie ne se négocie pas : pourboire plafond.
            TradeDirection::Sell => self.settings.tip_max_lamports,
        };
        Some((self.engine.next_tip_account(), lamports))
    }

    async fn await_confirmation(&self, signature: &Signature) -> Result<()> {
        for _ in 0..CONFIRM_POLL_ATTEMPTS {
            sleep(Duration::from_millis(CONFIRM_POLL_INTERVAL_MS)).await;
            let response = match self.rpc.get_signature_statuses(&[*signature]).await {
                Ok(response) => response,
                Err(e) => {
                    debug!("[Worker] Statuts indisponibles, nouveau sondage: {e:#}");
                    continue;
                }
            };
            if let Some(Some(status)) = response.value.first() {
                if let Some(err) = &status.err {
                    bail!("transaction échouée on-chain: {err}");
                }
                if status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    return Ok(());
                }
            }
        }
        bail!("aucune confirmation après {CONFIRM_POLL_ATTEMPTS} sondages")
    }

    async fn settle_confirmed(&self, job: &mut TradeJob) {
        match job.direction {
            TradeDirection::Buy => {
                let filled = match self.read_token_balance(&job.trade.token_mint).await {
                    Ok(amount) if amount > 0 => amount,
                    Ok(_) | Err(_) => {
                        // Swap confirmé mais solde illisible : on ne peut pas
                        // armer un plan de vente sur un montant inconnu.
                        warn!(
                            trade = %job.trade.id,
                            "[Worker] Achat confirmé mais solde introuvable, position purgée."
                        );
                        self.tracker.mark_exhausted(&job.pool);
                        self.ledger.advance(&mut job.trade, TradeStatus::Completed);
                        return;
                    }
                };
                self.tracker
                    .set_chunk_plan(&job.pool, filled, self.settings.chunk_division, true);
                self.ledger.set_filled(&mut job.trade, filled);
                self.ledger.advance(&mut job.trade, TradeStatus::Completed);
                info!(
                    trade = %job.trade.id,
                    pool = %job.pool,
                    filled,
                    "[Worker] Achat confirmé, plan de vente armé."
                );
            }
            TradeDirection::Sell => {
                self.apply_confirmed_sell(job);
                self.ledger.set_filled(&mut job.trade, job.amount);
                self.ledger.advance(&mut job.trade, TradeStatus::Completed);
                info!(
                    trade = %job.trade.id,
                    pool = %job.pool,
                    amount = job.amount,
                    final_chunk = job.final_chunk,
                    "[Worker] Vente confirmée."
                );
            }
        }
    }

    /// Solde en unités brutes du compte associé au mint, zéro si absent.
    async fn read_token_balance(&self, mint: &Pubkey) -> Result<u64> {
        let owner = self.builder.payer_pubkey();
        let ata = get_associated_token_address(&owner, mint);
        let account = self.rpc.get_account(&ata).await?;
        let token_account = spl_token::state::Account::unpack(&account.data)
            .context("compte de token associé illisible")?;
        Ok(token_account.amount)
    }

    /// La confirmation de la dernière tranche solde la position.
    fn apply_confirmed_sell(&self, job: &TradeJob) {
        if job.final_chunk {
            self.tracker.mark_exhausted(&job.pool);
        }
    }

    /// Une vente qui échoue rend sa tranche pour qu'un prochain déclencheur
    /// puisse la reprendre.
    fn apply_failed_sell(&self, job: &TradeJob) {
        if let Some(taken) = job.chunk_taken {
            self.tracker.restore_chunk(&job.pool, taken);
        }
    }

    fn fail(&self, job: &mut TradeJob, reason: AbandonReason) {
        match job.direction {
            // Un achat raté laisse un claim de suivi sans position : on
            // purge pour que le pool redevienne neutre.
            TradeDirection::Buy => self.tracker.mark_exhausted(&job.pool),
            TradeDirection::Sell => self.apply_failed_sell(job),
        }
        self.ledger
            .advance(&mut job.trade, TradeStatus::Abandoned(reason));
        warn!(trade = %job.trade.id, raison = %reason, "[Worker] Trade abandonné.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::channels::{DeliveryChannel, RelayEndpoints};
    use crate::state::{KeyValueStore, MemoryStore};
    use solana_sdk::signature::Keypair;

    fn make_worker(store: Arc<MemoryStore>) -> TradeWorker {
        let (_jobs_tx, jobs_rx) = mpsc::unbounded_channel::<TradeJob>();
        let kv: Arc<dyn KeyValueStore> = store;
        TradeWorker {
            queue: Arc::new(Mutex::new(jobs_rx)),
            rpc: Arc::new(ResilientRpcClient::new("http://127.0.0.1:1".to_string(), 0, 1)),
            engine: Arc::new(SubmissionEngine::new(RelayEndpoints {
                send_urls: Vec::new(),
                bundle_url: String::new(),
                transaction_url: String::new(),
                third_party_url: None,
                third_party_api_key: None,
            })),
            builder: Arc::new(TransactionBuilder::new(Arc::new(Keypair::new()))),
            tracker: PoolTracker::new(kv.clone()),
            ledger: Arc::new(TradeLedger::new(kv)),
            settings: WorkerSettings {
                chunk_division: 3,
                tip_min_lamports: 1_000,
                tip_max_lamports: 100_000,
                tip_profit_percent: 10,
            },
        }
    }

    fn job_for(
        worker: &TradeWorker,
        pool: Pubkey,
        direction: TradeDirection,
        channel: DeliveryChannel,
    ) -> TradeJob {
        let mint = Pubkey::new_unique();
        let trade = worker.ledger.create(&pool, &mint, direction, 200_000);
        TradeJob {
            trade,
            pool,
            direction,
            amount: 200_000,
            not_before: None,
            channel,
            chunk_taken: None,
            final_chunk: false,
        }
    }

    #[test]
    fn the_tip_follows_the_direction() {
        let worker = make_worker(Arc::new(MemoryStore::new()));

        let (_, buy_tip) = worker
            .tip_for(&TradeDirection::Buy, 200_000, true)
            .unwrap();
        assert_eq!(buy_tip, 20_000);

        let (_, sell_tip) = worker
            .tip_for(&TradeDirection::Sell, 200_000, true)
            .unwrap();
        assert_eq!(sell_tip, 100_000);

        assert!(worker.tip_for(&TradeDirection::Buy, 200_000, false).is_none());
    }

    #[test]
    fn a_failed_sell_restores_its_chunk() {
        let store = Arc::new(MemoryStore::new());
        let worker = make_worker(store);
        let pool = Pubkey::new_unique();

        worker.tracker.set_chunk_plan(&pool, 9, 3, true);
        let take = worker.tracker.take_chunk(&pool).unwrap();
        assert_eq!(take.taken, 3);

        let mut job = job_for(&worker, pool, TradeDirection::Sell, DeliveryChannel::DirectRpc);
        job.chunk_taken = Some(take.taken);
        worker.fail(&mut job, AbandonReason::SubmissionFailed);

        let chunk = worker.tracker.chunk(&pool).unwrap();
        assert_eq!(chunk.remaining, 9);
        assert!(!chunk.exhausted);
        assert!(job.trade.status.is_terminal());
    }

    #[test]
    fn the_last_confirmed_chunk_purges_the_pool() {
        let store = Arc::new(MemoryStore::new());
        let worker = make_worker(store);
        let pool = Pubkey::new_unique();

        assert!(worker.tracker.claim_tracking(&pool));
        worker.tracker.set_chunk_plan(&pool, 4, 4, true);

        let mut job = job_for(&worker, pool, TradeDirection::Sell, DeliveryChannel::RelayBundle);
        job.final_chunk = true;
        worker.apply_confirmed_sell(&job);

        assert!(!worker.tracker.is_tracked(&pool));
        assert!(worker.tracker.chunk(&pool).is_none());
    }

    #[test]
    fn an_abandoned_buy_purges_the_claim() {
        let store = Arc::new(MemoryStore::new());
        let worker = make_worker(store);
        let pool = Pubkey::new_unique();

        assert!(worker.tracker.claim_tracking(&pool));
        let mut job = job_for(&worker, pool, TradeDirection::Buy, DeliveryChannel::DirectRpc);
        worker.fail(&mut job, AbandonReason::BuildFailed);

        assert!(!worker.tracker.is_tracked(&pool));
        assert_eq!(
            job.trade.status,
            TradeStatus::Abandoned(AbandonReason::BuildFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_staggered_job_waits_for_its_slot() {
        let worker = make_worker(Arc::new(MemoryStore::new()));
        let pool = Pubkey::new_unique();

        let delay = Duration::from_millis(750);
        let mut job = job_for(&worker, pool, TradeDirection::Sell, DeliveryChannel::DirectRpc);
        job.not_before = Some(tokio::time::Instant::now() + delay);
        let trade_id = job.trade.id.clone();

        let start = tokio::time::Instant::now();
        worker.handle(job).await;

        // L'horloge virtuelle doit avoir franchi l'échéance avant que le
        // worker ne touche au trade (ici : pool inconnu, donc abandon).
        assert!(tokio::time::Instant::now() - start >= delay);
        let trade = worker.ledger.load(&trade_id).unwrap();
        assert_eq!(
            trade.status,
            TradeStatus::Abandoned(AbandonReason::MarketUnavailable)
        );
    }
}
