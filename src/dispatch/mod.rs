// DANS : src/dispatch/mod.rs
//
// La tâche de décision unique. Elle draine la sortie du multiplexeur
// strictement un événement à la fois, décode les instructions AMM v4,
// met à jour l'état des pools et décide d'acheter, de vendre ou de ne
// rien faire. Elle n'attend jamais une soumission : les trades partent
// sur la file des workers et la boucle repasse à l'événement suivant.

use crate::data_pipeline::LiquidityLookup;
use crate::decoders::AmmInstruction;
use crate::decoders::raydium_amm::layouts::{PoolStateLayout, pool_state};
use crate::decoders::raydium_amm::{
    LEGACY_MARKET_PROGRAM, RAYDIUM_AMM_V4_PROGRAM_ID, amm_authority, initialize2_accounts,
    liquidity_accounts, swap_accounts, swap_user_accounts,
};
use crate::execution::TradeJob;
use crate::execution::channels::DeliveryChannel;
use crate::ingestion::{RawEvent, RawInstruction};
use crate::ledger::{TradeDirection, TradeLedger};
use crate::lookup::{LookupResolver, ResolveError};
use crate::monitoring::metrics;
use crate::rpc::ResilientRpcClient;
use crate::state::{ChunkTake, PoolRecord, PoolTracker};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// La politique unique du dispatcher : quel signal déclenche quelle action,
/// et avec quels seuils. Tout vient de la configuration.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub buy_notional_lamports: u64,
    pub min_trigger_notional_lamports: u64,
    pub chunk_division: u32,
    pub max_sell_attempts: i64,
    pub burst_interval_ms: u64,
    pub withdraw_buy_enabled: bool,
    pub withdraw_buy_delay_ms: u64,
    pub buy_channel: DeliveryChannel,
    pub sell_channel: DeliveryChannel,
    pub terminal_error_codes: HashSet<u32>,
}

pub struct TradeDispatcher {
    events: mpsc::UnboundedReceiver<RawEvent>,
    jobs: mpsc::UnboundedSender<TradeJob>,
    resolver: Arc<LookupResolver>,
    tracker: PoolTracker,
    ledger: Arc<TradeLedger>,
    liquidity: Arc<dyn LiquidityLookup>,
    rpc: Arc<ResilientRpcClient>,
    /// Notre propre portefeuille : ses swaps ne déclenchent jamais rien.
    payer: Pubkey,
    policy: DispatchPolicy,
}

impl TradeDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: mpsc::UnboundedReceiver<RawEvent>,
        jobs: mpsc::UnboundedSender<TradeJob>,
        resolver: Arc<LookupResolver>,
        tracker: PoolTracker,
        ledger: Arc<TradeLedger>,
        liquidity: Arc<dyn LiquidityLookup>,
        rpc: Arc<ResilientRpcClient>,
        payer: Pubkey,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            events,
            jobs,
            resolver,
            tracker,
            ledger,
            liquidity,
            rpc,
            payer,
            policy,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("[Dispatch] Démarré.");
        while let Some(event) = self.events.recv().await {
            let started = std::time::Instant::now();
            self.dispatch(&event).await;
            metrics::DISPATCH_SECONDS.observe(started.elapsed().as_secs_f64());
        }
        info!("[Dispatch] Flux d'événements fermé, arrêt.");
    }

    /// Traite chaque instruction AMM v4 de l'événement. Une instruction
    /// indécodable ou aux comptes irrésolus est comptée puis ignorée ;
    /// rien ne remonte jamais jusqu'à la boucle.
    async fn dispatch(&self, event: &RawEvent) {
        for instruction in event.instructions_for(&RAYDIUM_AMM_V4_PROGRAM_ID) {
            let decoded = match AmmInstruction::decode(&instruction.data) {
                Ok(decoded) => decoded,
                Err(error) => {
                    metrics::DISPATCH_DROPS.with_label_values(&["decode"]).inc();
                    debug!(signature = %event.signature, %error, "[Dispatch] Instruction indécodable, ignorée.");
                    continue;
                }
            };
            if let Err(error) = self.act(event, instruction, decoded).await {
                metrics::DISPATCH_DROPS
                    .with_label_values(&["resolution"])
                    .inc();
                debug!(signature = %event.signature, %error, "[Dispatch] Comptes irrésolus, événement abandonné.");
            }
        }
    }

    async fn act(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
        decoded: AmmInstruction,
    ) -> Result<(), ResolveError> {
        if event.failed {
            return self.on_failed(event, instruction, decoded).await;
        }
        match decoded {
            AmmInstruction::Initialize2 { open_time, .. } => {
                self.on_pool_created(event, instruction, open_time).await
            }
            AmmInstruction::Deposit { .. } => self.on_deposit(event, instruction).await,
            AmmInstruction::Withdraw { .. } => self.on_withdraw(event, instruction).await,
            AmmInstruction::SwapBaseIn { amount_in, .. } => {
                self.on_swap(event, instruction, amount_in).await
            }
            // Les swaps base-out n'annoncent pas leur notional d'entrée :
            // aucun signal à en tirer.
            AmmInstruction::SwapBaseOut { .. } => Ok(()),
        }
    }

    /// Une transaction échouée n'a rien changé on-chain. Son seul intérêt :
    /// un code d'erreur terminal sur un pool suivi signifie que le pool est
    /// mort (gelé, vidé, désactivé) et qu'il faut cesser de le suivre.
    async fn on_failed(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
        decoded: AmmInstruction,
    ) -> Result<(), ResolveError> {
        let Some(code) = event.error_code else {
            return Ok(());
        };
        if !self.policy.terminal_error_codes.contains(&code) {
            return Ok(());
        }
        let pool_position = match decoded {
            AmmInstruction::Initialize2 { .. } => return Ok(()),
            AmmInstruction::Deposit { .. } | AmmInstruction::Withdraw { .. } => {
                liquidity_accounts::AMM
            }
            AmmInstruction::SwapBaseIn { .. } | AmmInstruction::SwapBaseOut { .. } => {
                swap_accounts::AMM
            }
        };
        let pool = self
            .instruction_account(event, instruction, pool_position)
            .await?;
        if self.tracker.is_tracked(&pool) {
            warn!(pool = %pool, code, "[Dispatch] Erreur terminale observée, suivi retiré.");
            self.tracker.untrack(&pool);
            metrics::DISPATCH_ACTIONS
                .with_label_values(&["untrack"])
                .inc();
        }
        Ok(())
    }

    async fn on_pool_created(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
        open_time: u64,
    ) -> Result<(), ResolveError> {
        let accounts = self.resolver.instruction_accounts(event, instruction).await?;
        if accounts.len() < initialize2_accounts::MIN_ACCOUNTS {
            return Err(ResolveError::OutOfBounds {
                index: initialize2_accounts::MIN_ACCOUNTS - 1,
                available: accounts.len(),
            });
        }
        let Some(record) = record_from_initialize2(&accounts, event, open_time) else {
            debug!(signature = %event.signature, "[Dispatch] Pool sans côté WSOL, ignoré.");
            return Ok(());
        };
        // Première livraison gagnante : une rediffusion du même pool par
        // une autre source ne réécrit rien et n'achète pas deux fois.
        if !self.tracker.register(&record) {
            return Ok(());
        }
        if !self.tracker.claim_tracking(&record.address) {
            return Ok(());
        }
        self.tracker.incr_liquidity(&record.address);
        info!(
            pool = %record.address,
            mint = %record.token_mint,
            slot = event.slot,
            "[Dispatch] Nouveau pool WSOL, achat déclenché."
        );
        metrics::DISPATCH_ACTIONS.with_label_values(&["buy"]).inc();
        self.emit_buy(&record.address, &record.token_mint, None);
        Ok(())
    }

    async fn on_deposit(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
    ) -> Result<(), ResolveError> {
        let pool = self
            .instruction_account(event, instruction, liquidity_accounts::AMM)
            .await?;
        let delta = self.tracker.incr_liquidity(&pool);
        debug!(pool = %pool, counter = delta.current, "[Dispatch] Dépôt de liquidité.");
        Ok(())
    }

    async fn on_withdraw(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
    ) -> Result<(), ResolveError> {
        let pool = self
            .instruction_account(event, instruction, liquidity_accounts::AMM)
            .await?;
        let delta = self.tracker.decr_liquidity(&pool);
        if !delta.reached_zero() {
            return Ok(());
        }
        if self.tracker.is_tracked(&pool) {
            let Some(record) = self.tracker.get(&pool) else {
                return Ok(());
            };
            info!(pool = %pool, "[Dispatch] Liquidité à zéro sur un pool suivi, vente en rafale.");
            metrics::DISPATCH_ACTIONS
                .with_label_values(&["burst_sell"])
                .inc();
            let mut stagger: u32 = 0;
            while let Some(take) = self.tracker.take_chunk(&pool) {
                let not_before = tokio::time::Instant::now()
                    + Duration::from_millis(u64::from(stagger) * self.policy.burst_interval_ms);
                self.emit_sell(&pool, &record.token_mint, take, Some(not_before));
                stagger += 1;
                if take.exhausted() {
                    break;
                }
            }
        } else if self.policy.withdraw_buy_enabled {
            self.schedule_withdraw_buy(pool);
        }
        Ok(())
    }

    /// Un gros swap entrant en WSOL sur un pool suivi dont la liquidité est
    /// à zéro : quelqu'un achète dans un pool qui se vide, on lui vend une
    /// tranche. Au-delà du plafond de tentatives, la cotation est revalidée
    /// à l'extérieur une seule fois ; ensuite la position est purgée.
    async fn on_swap(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
        amount_in: u64,
    ) -> Result<(), ResolveError> {
        if amount_in < self.policy.min_trigger_notional_lamports {
            return Ok(());
        }
        let pool = self
            .instruction_account(event, instruction, swap_accounts::AMM)
            .await?;
        if !self.tracker.is_tracked(&pool) {
            return Ok(());
        }
        if self.tracker.liquidity_ops(&pool) != 0 {
            return Ok(());
        }
        let accounts = self.resolver.instruction_accounts(event, instruction).await?;
        let Some(user) = swap_user_accounts(&accounts) else {
            return Ok(());
        };
        if user.owner == self.payer {
            return Ok(());
        }
        if !wsol_flows_in(event, instruction, &accounts) {
            return Ok(());
        }
        let Some(record) = self.tracker.get(&pool) else {
            return Ok(());
        };

        let attempts = self.tracker.bump_sell_attempts(&pool);
        if attempts > self.policy.max_sell_attempts {
            if !self.tracker.claim_ceiling_reset(&pool) {
                // Déjà revalidé une fois : la position ne se vendra pas.
                info!(pool = %pool, "[Dispatch] Plafond de ventes atteint une seconde fois, position purgée.");
                self.tracker.mark_exhausted(&pool);
                return Ok(());
            }
            match self.liquidity.liquidity_count(&record.token_mint).await {
                Ok(count) if count.is_listed() => {
                    info!(
                        pool = %pool,
                        venues = count.total,
                        "[Dispatch] Liquidité toujours cotée, plafond réarmé."
                    );
                    self.tracker.reset_sell_attempts(&pool);
                }
                Ok(_) => {
                    info!(pool = %pool, "[Dispatch] Liquidité disparue des cotations, position purgée.");
                    self.tracker.mark_exhausted(&pool);
                    return Ok(());
                }
                Err(error) => {
                    warn!(pool = %pool, "[Dispatch] Revalidation impossible, position purgée: {error:#}");
                    self.tracker.mark_exhausted(&pool);
                    return Ok(());
                }
            }
        }

        let Some(take) = self.tracker.take_chunk(&pool) else {
            return Ok(());
        };
        info!(
            pool = %pool,
            amount_in,
            taken = take.taken,
            "[Dispatch] Swap entrant massif sur pool suivi, vente d'une tranche."
        );
        metrics::DISPATCH_ACTIONS
            .with_label_values(&["chunk_sell"])
            .inc();
        self.emit_sell(&pool, &record.token_mint, take, None);
        Ok(())
    }

    /// Retrait à zéro sur un pool non suivi : si le bouton est armé, on
    /// tente un achat différé en pariant sur le rebond après la purge.
    fn schedule_withdraw_buy(&self, pool: Pubkey) {
        let rpc = self.rpc.clone();
        let tracker = self.tracker.clone();
        let ledger = self.ledger.clone();
        let jobs = self.jobs.clone();
        let delay = Duration::from_millis(self.policy.withdraw_buy_delay_ms);
        let notional = self.policy.buy_notional_lamports;
        let channel = self.policy.buy_channel;
        info!(pool = %pool, delay_ms = delay.as_millis() as u64, "[Dispatch] Retrait sur pool non suivi, achat différé programmé.");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let data = match rpc.get_account_data(&pool).await {
                Ok(data) => data,
                Err(error) => {
                    warn!(pool = %pool, "[Dispatch] Achat différé annulé, pool illisible: {error:#}");
                    return;
                }
            };
            let state = match pool_state(&data) {
                Ok(state) => state,
                Err(error) => {
                    warn!(pool = %pool, %error, "[Dispatch] Achat différé annulé, état indécodable.");
                    return;
                }
            };
            let Some(record) = record_from_pool_state(&pool, state) else {
                debug!(pool = %pool, "[Dispatch] Achat différé annulé, pas de côté WSOL.");
                return;
            };
            tracker.register(&record);
            if !tracker.claim_tracking(&pool) {
                return;
            }
            metrics::DISPATCH_ACTIONS
                .with_label_values(&["delayed_buy"])
                .inc();
            let trade = ledger.create(&pool, &record.token_mint, TradeDirection::Buy, notional);
            let job = TradeJob {
                trade,
                pool,
                direction: TradeDirection::Buy,
                amount: notional,
                not_before: None,
                channel,
                chunk_taken: None,
                final_chunk: false,
            };
            if jobs.send(job).is_err() {
                warn!("[Dispatch] File de soumission fermée, achat différé perdu.");
            }
        });
    }

    fn emit_buy(&self, pool: &Pubkey, mint: &Pubkey, not_before: Option<tokio::time::Instant>) {
        let trade = self
            .ledger
            .create(pool, mint, TradeDirection::Buy, self.policy.buy_notional_lamports);
        let job = TradeJob {
            trade,
            pool: *pool,
            direction: TradeDirection::Buy,
            amount: self.policy.buy_notional_lamports,
            not_before,
            channel: self.policy.buy_channel,
            chunk_taken: None,
            final_chunk: false,
        };
        if self.jobs.send(job).is_err() {
            warn!("[Dispatch] File de soumission fermée, achat perdu.");
        }
    }

    fn emit_sell(
        &self,
        pool: &Pubkey,
        mint: &Pubkey,
        take: ChunkTake,
        not_before: Option<tokio::time::Instant>,
    ) {
        let trade = self
            .ledger
            .create(pool, mint, TradeDirection::Sell, take.taken);
        let job = TradeJob {
            trade,
            pool: *pool,
            direction: TradeDirection::Sell,
            amount: take.taken,
            not_before,
            channel: self.policy.sell_channel,
            chunk_taken: Some(take.taken),
            final_chunk: take.exhausted(),
        };
        if self.jobs.send(job).is_err() {
            warn!("[Dispatch] File de soumission fermée, vente perdue.");
        }
    }

    /// Résout le compte occupant une position donnée d'une instruction.
    async fn instruction_account(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
        position: usize,
    ) -> Result<Pubkey, ResolveError> {
        let index = instruction
            .accounts
            .get(position)
            .copied()
            .ok_or(ResolveError::OutOfBounds {
                index: position,
                available: instruction.accounts.len(),
            })?;
        self.resolver
            .resolve_message_index(event, index as usize)
            .await
    }
}

/// Le swap pousse-t-il du WSOL dans le pool ? On lit le mint du compte
/// source de l'utilisateur dans les bilans de l'événement ; sans bilans,
/// on tranche en faveur du déclenchement.
fn wsol_flows_in(event: &RawEvent, instruction: &RawInstruction, resolved: &[Pubkey]) -> bool {
    let base = if resolved.contains(&LEGACY_MARKET_PROGRAM) {
        swap_accounts::USER_BASE_LEGACY
    } else {
        swap_accounts::USER_BASE
    };
    let Some(&source_index) = instruction.accounts.get(base) else {
        return false;
    };
    match event
        .balance_deltas
        .iter()
        .find(|delta| delta.account_index == source_index)
    {
        Some(delta) => delta.mint == spl_token::native_mint::id(),
        None => true,
    }
}

/// Construit la fiche d'un pool depuis les comptes résolus d'une
/// `initialize2`. Retourne `None` si aucun côté n'est du WSOL : ces
/// paires exotiques ne s'achètent pas en lamports.
fn record_from_initialize2(
    accounts: &[Pubkey],
    event: &RawEvent,
    open_time: u64,
) -> Option<PoolRecord> {
    use initialize2_accounts as idx;
    let coin_mint = accounts[idx::COIN_MINT];
    let pc_mint = accounts[idx::PC_MINT];
    let wsol = spl_token::native_mint::id();
    let (wsol_is_coin, token_mint) = if coin_mint == wsol {
        (true, pc_mint)
    } else if pc_mint == wsol {
        (false, coin_mint)
    } else {
        return None;
    };
    let decimals_of = |mint: &Pubkey, fallback: u8| {
        event
            .balance_deltas
            .iter()
            .find(|delta| delta.mint == *mint)
            .map(|delta| delta.decimals)
            .unwrap_or(fallback)
    };
    Some(PoolRecord {
        address: accounts[idx::AMM],
        authority: accounts[idx::AMM_AUTHORITY],
        coin_mint,
        pc_mint,
        coin_decimals: decimals_of(&coin_mint, if wsol_is_coin { 9 } else { 0 }),
        pc_decimals: decimals_of(&pc_mint, if wsol_is_coin { 0 } else { 9 }),
        coin_vault: accounts[idx::COIN_VAULT],
        pc_vault: accounts[idx::PC_VAULT],
        open_orders: accounts[idx::OPEN_ORDERS],
        target_orders: accounts[idx::TARGET_ORDERS],
        market: accounts[idx::MARKET],
        market_program: accounts[idx::MARKET_PROGRAM],
        token_mint,
        wsol_is_coin,
        open_time: i64::try_from(open_time).unwrap_or(i64::MAX),
        market_bids: Pubkey::default(),
        market_asks: Pubkey::default(),
        market_event_queue: Pubkey::default(),
        market_coin_vault: Pubkey::default(),
        market_pc_vault: Pubkey::default(),
        market_vault_signer: Pubkey::default(),
    })
}

/// Même fiche, mais depuis l'état on-chain du pool (achat différé : le
/// pool existait avant nous, il n'y a pas d'`initialize2` à lire).
fn record_from_pool_state(address: &Pubkey, state: &PoolStateLayout) -> Option<PoolRecord> {
    let coin_mint = state.coin_mint;
    let pc_mint = state.pc_mint;
    let wsol = spl_token::native_mint::id();
    let (wsol_is_coin, token_mint) = if coin_mint == wsol {
        (true, pc_mint)
    } else if pc_mint == wsol {
        (false, coin_mint)
    } else {
        return None;
    };
    let coin_decimals = state.coin_decimals;
    let pc_decimals = state.pc_decimals;
    let open_time = state.state_data.pool_open_time;
    Some(PoolRecord {
        address: *address,
        authority: amm_authority(),
        coin_mint,
        pc_mint,
        coin_decimals: coin_decimals as u8,
        pc_decimals: pc_decimals as u8,
        coin_vault: state.coin_vault,
        pc_vault: state.pc_vault,
        open_orders: state.open_orders,
        target_orders: state.target_orders,
        market: state.market,
        market_program: state.market_program,
        token_mint,
        wsol_is_coin,
        open_time: i64::try_from(open_time).unwrap_or(i64::MAX),
        market_bids: Pubkey::default(),
        market_asks: Pubkey::default(),
        market_event_queue: Pubkey::default(),
        market_coin_vault: Pubkey::default(),
        market_pc_vault: Pubkey::default(),
        market_vault_signer: Pubkey::default(),
    })
}
