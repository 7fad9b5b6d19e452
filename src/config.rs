// DANS : src/config.rs
//
// Toute la surface de configuration, chargée depuis l'environnement
// (et un éventuel fichier .env). Les listes s'écrivent séparées par
// des virgules : GEYSER_GRPC_URLS=https://a:10000,https://b:10000

use anyhow::Result;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Endpoints Geyser gRPC, une source redondante par URL.
    pub geyser_grpc_urls: Vec<String>,
    pub solana_rpc_url: String,
    /// Endpoint WebSocket pour la source de secours par logs. Absent,
    /// la source de secours n'est pas démarrée.
    pub solana_ws_url: Option<String>,
    /// Endpoints de diffusion brute. Vide, le RPC principal sert aussi
    /// à l'envoi.
    #[serde(default)]
    pub rpc_send_urls: Vec<String>,
    #[serde(default = "default_relay_bundle_url")]
    pub relay_bundle_url: String,
    #[serde(default = "default_relay_transaction_url")]
    pub relay_transaction_url: String,
    pub third_party_relay_url: Option<String>,
    pub third_party_relay_api_key: Option<String>,

    pub keypair_path: String,

    #[serde(default = "default_buy_notional_lamports")]
    pub buy_notional_lamports: u64,
    #[serde(default = "default_min_trigger_notional_lamports")]
    pub min_trigger_notional_lamports: u64,
    #[serde(default = "default_chunk_division")]
    pub chunk_division: u32,
    #[serde(default = "default_max_sell_attempts")]
    pub max_sell_attempts: i64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_burst_interval_ms")]
    pub burst_interval_ms: u64,
    #[serde(default)]
    pub withdraw_buy_enabled: bool,
    #[serde(default = "default_withdraw_buy_delay_ms")]
    pub withdraw_buy_delay_ms: u64,

    #[serde(default = "default_tip_min_lamports")]
    pub tip_min_lamports: u64,
    #[serde(default = "default_tip_max_lamports")]
    pub tip_max_lamports: u64,
    #[serde(default = "default_tip_profit_percent")]
    pub tip_profit_percent: u64,

    /// Canal de soumission des achats / des ventes : "direct_rpc",
    /// "relay_bundle", "relay_direct" ou "third_party_relay".
    #[serde(default = "default_buy_channel")]
    pub buy_channel: String,
    #[serde(default = "default_sell_channel")]
    pub sell_channel: String,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_table_cache_capacity")]
    pub table_cache_capacity: usize,
    /// Codes d'erreur custom du programme AMM qui condamnent un pool.
    #[serde(default)]
    pub terminal_error_codes: Vec<u32>,
}

fn default_relay_bundle_url() -> String {
    "https://mainnet.block-engine.jito.wtf/api/v1/bundles".to_string()
}

fn default_relay_transaction_url() -> String {
    "https://mainnet.block-engine.jito.wtf/api/v1/transactions".to_string()
}

fn default_buy_notional_lamports() -> u64 {
    100_000_000 // 0,1 SOL
}

fn default_min_trigger_notional_lamports() -> u64 {
    1_000_000_000 // 1 SOL
}

fn default_chunk_division() -> u32 {
    4
}

fn default_max_sell_attempts() -> i64 {
    5
}

fn default_dedup_window_secs() -> u64 {
    3_000
}

fn default_burst_interval_ms() -> u64 {
    50
}

fn default_withdraw_buy_delay_ms() -> u64 {
    3_000
}

fn default_tip_min_lamports() -> u64 {
    100_000
}

fn default_tip_max_lamports() -> u64 {
    3_000_000
}

fn default_tip_profit_percent() -> u64 {
    10
}

fn default_buy_channel() -> String {
    "direct_rpc".to_string()
}

fn default_sell_channel() -> String {
    "relay_bundle".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_table_cache_capacity() -> usize {
    512
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()?;
        Ok(config)
    }
}
