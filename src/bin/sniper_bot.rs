// DANS : src/bin/sniper_bot.rs

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Result, anyhow, ensure};
use arc_swap::ArcSwap;
use harpon::{
    config::Config,
    data_pipeline::{DexScreenerLookup, LiquidityLookup},
    decoders::raydium_amm::RAYDIUM_AMM_V4_PROGRAM_ID,
    dispatch::{DispatchPolicy, TradeDispatcher},
    execution::{
        builder::TransactionBuilder,
        channels::{DeliveryChannel, RelayEndpoints, SubmissionEngine},
        worker::{WorkerSettings, start_workers},
    },
    ingestion::{
        RawEvent, SourceId,
        logs_source::LogsSource,
        multiplexer::EventMultiplexer,
        source::{GeyserSource, SubscriptionFilter},
    },
    ledger::TradeLedger,
    lookup::{LookupResolver, RpcTableSource},
    monitoring::{logging, metrics},
    rpc::ResilientRpcClient,
    state::{KeyValueStore, MemoryStore, PoolTracker},
};
use solana_sdk::signature::read_keypair_file;
use solana_sdk::signer::Signer;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Profondeur du canal borné entre chaque source et le multiplexeur.
const SOURCE_CHANNEL_CAPACITY: usize = 8_192;

#[tokio::main]
async fn main() -> Result<()> {
    println!("--- Lancement du Sniper Raydium AMM v4 ---");
    logging::setup_logging();

    // --- Initialisation ---
    let config = Config::load()?;
    let payer = Arc::new(
        read_keypair_file(&config.keypair_path)
            .map_err(|e| anyhow!("Keypair illisible ({}) : {}", config.keypair_path, e))?,
    );
    println!("[Init] Portefeuille du bot : {}", payer.pubkey());
    let rpc = Arc::new(ResilientRpcClient::new(config.solana_rpc_url.clone(), 3, 500));

    // --- État partagé ---
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let tracker = PoolTracker::new(store.clone());
    let ledger = Arc::new(TradeLedger::new(store.clone()));
    let resolver = Arc::new(LookupResolver::new(
        Arc::new(RpcTableSource::new(rpc.clone())),
        config.table_cache_capacity,
    ));
    let liquidity: Arc<dyn LiquidityLookup> = Arc::new(DexScreenerLookup::new());

    // Tâche 1 : serveur de métriques Prometheus
    tokio::spawn(metrics::start_metrics_server());

    // Tâche 2 : les sources d'événements (gRPC + logsSubscribe de secours).
    // Le sender de re-souscription doit survivre tout le process : les
    // sources coupent leur connexion quand ce canal se ferme.
    let filter = Arc::new(ArcSwap::from_pointee(SubscriptionFilter::for_programs(&[
        RAYDIUM_AMM_V4_PROGRAM_ID,
    ])));
    let (_refilter_tx, refilter_rx) = watch::channel(0u64);
    let mut inputs = Vec::new();
    for (index, endpoint) in config.geyser_grpc_urls.iter().enumerate() {
        let (tx, rx) = mpsc::channel::<RawEvent>(SOURCE_CHANNEL_CAPACITY);
        GeyserSource::new(
            SourceId(index as u8),
            endpoint.clone(),
            filter.clone(),
            refilter_rx.clone(),
            tx,
        )
        .start();
        inputs.push(rx);
        println!("[Init] Source Geyser #{} : {}", index, endpoint);
    }
    if let Some(ws_url) = &config.solana_ws_url {
        let (tx, rx) = mpsc::channel::<RawEvent>(SOURCE_CHANNEL_CAPACITY);
        LogsSource::new(
            SourceId(config.geyser_grpc_urls.len() as u8),
            ws_url.clone(),
            RAYDIUM_AMM_V4_PROGRAM_ID,
            rpc.clone(),
            tx,
        )
        .start();
        inputs.push(rx);
        println!("[Init] Source logsSubscribe de secours : {}", ws_url);
    }
    ensure!(
        !inputs.is_empty(),
        "Aucune source configurée (GEYSER_GRPC_URLS vide et pas de SOLANA_WS_URL)"
    );

    // Tâche 3 : fan-in et déduplication
    let (multiplexer, events) =
        EventMultiplexer::new(inputs, Duration::from_secs(config.dedup_window_secs));
    multiplexer.start();

    // Tâche 4 : le dispatcher
    let buy_channel = DeliveryChannel::from_str(&config.buy_channel).map_err(|e| anyhow!(e))?;
    let sell_channel = DeliveryChannel::from_str(&config.sell_channel).map_err(|e| anyhow!(e))?;
    let policy = DispatchPolicy {
        buy_notional_lamports: config.buy_notional_lamports,
        min_trigger_notional_lamports: config.min_trigger_notional_lamports,
        chunk_division: config.chunk_division,
        max_sell_attempts: config.max_sell_attempts,
        burst_interval_ms: config.burst_interval_ms,
        withdraw_buy_enabled: config.withdraw_buy_enabled,
        withdraw_buy_delay_ms: config.withdraw_buy_delay_ms,
        buy_channel,
        sell_channel,
        terminal_error_codes: config.terminal_error_codes.iter().copied().collect(),
    };
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    TradeDispatcher::new(
        events,
        jobs_tx,
        resolver,
        tracker.clone(),
        ledger.clone(),
        liquidity,
        rpc.clone(),
        payer.pubkey(),
        policy,
    )
    .start();

    // Tâche 5 : les workers d'exécution
    let send_urls = if config.rpc_send_urls.is_empty() {
        vec![config.solana_rpc_url.clone()]
    } else {
        config.rpc_send_urls.clone()
    };
    let engine = Arc::new(SubmissionEngine::new(RelayEndpoints {
        send_urls,
        bundle_url: config.relay_bundle_url.clone(),
        transaction_url: config.relay_transaction_url.clone(),
        third_party_url: config.third_party_relay_url.clone(),
        third_party_api_key: config.third_party_relay_api_key.clone(),
    }));
    let builder = Arc::new(TransactionBuilder::new(payer.clone()));
    println!(
        "[Init] Démarrage de {} workers d'exécution (canaux : achat={}, vente={})...",
        config.worker_count,
        buy_channel.as_str(),
        sell_channel.as_str()
    );
    start_workers(
        config.worker_count,
        jobs_rx,
        rpc,
        engine,
        builder,
        tracker,
        ledger,
        WorkerSettings {
            chunk_division: config.chunk_division,
            tip_min_lamports: config.tip_min_lamports,
            tip_max_lamports: config.tip_max_lamports,
            tip_profit_percent: config.tip_profit_percent,
        },
    );

    println!("[Bot] Pipeline démarré. En chasse.");
    std::future::pending::<()>().await;

    Ok(())
}
