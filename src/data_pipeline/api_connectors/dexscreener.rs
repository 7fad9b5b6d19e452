// DANS : src/data_pipeline/api_connectors/dexscreener.rs
//
// Implémentation DexScreener du LiquidityLookup : l'endpoint token-pairs
// liste toutes les paires d'un mint, toutes venues confondues.

use crate::data_pipeline::{LiquidityCount, LiquidityLookup};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::time::Duration;

const DEXSCREENER_BASE_URL: &str = "https://api.dexscreener.com";
const REQUEST_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    chain_id: String,
    dex_id: String,
    #[serde(default)]
    liquidity: Liquidity,
}

#[derive(Debug, Deserialize, Default)]
struct Liquidity {
    #[serde(default)]
    usd: f64,
}

pub struct DexScreenerLookup {
    client: reqwest::Client,
    base_url: String,
}

impl DexScreenerLookup {
    pub fn new() -> Self {
        Self::with_base_url(DEXSCREENER_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }
}

impl Default for DexScreenerLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiquidityLookup for DexScreenerLookup {
    async fn liquidity_count(&self, mint: &Pubkey) -> Result<LiquidityCount> {
        let url = format!("{}/token-pairs/v1/solana/{}", self.base_url, mint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Requête DexScreener impossible")?;

        if !response.status().is_success() {
            return Err(anyhow!("Erreur API DexScreener: {}", response.status()));
        }

        let pairs: Vec<TokenPair> = response
            .json()
            .await
            .context("Réponse DexScreener indéchiffrable")?;
        Ok(count_live_pairs(&pairs))
    }
}

/// Seules les paires Solana avec de la liquidité résiduelle comptent :
/// une paire vidée reste listée un moment mais ne vaut plus rien.
fn count_live_pairs(pairs: &[TokenPair]) -> LiquidityCount {
    let mut per_venue: HashMap<String, usize> = HashMap::new();
    for pair in pairs {
        if pair.chain_id == "solana" && pair.liquidity.usd > 0.0 {
            *per_venue.entry(pair.dex_id.clone()).or_insert(0) += 1;
        }
    }
    LiquidityCount {
        total: per_venue.values().sum(),
        per_venue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_token_pairs_payload_parses() {
        let body = r#"[
            {
                "chainId": "solana",
                "dexId": "raydium",
                "pairAddress": "58oQChx4yWmvKdwLLZzBi4ChoCc2fqCUWBkwMihLYQo2",
                "baseToken": { "address": "So11111111111111111111111111111111111111112", "name": "Wrapped SOL", "symbol": "SOL" },
                "liquidity": { "usd": 118000.5, "base": 500, "quote": 400 }
            },
            {
                "chainId": "solana",
                "dexId": "orca",
                "pairAddress": "7qbRF6YsyGuLUVs6Y1q64bdVrfe4ZcUUz1JRdoVNUJnm"
            },
            {
                "chainId": "ethereum",
                "dexId": "uniswap",
                "pairAddress": "0x0",
                "liquidity": { "usd": 9999.0 }
            }
        ]"#;

        let pairs: Vec<TokenPair> = serde_json::from_str(body).unwrap();
        assert_eq!(pairs.len(), 3);

        let count = count_live_pairs(&pairs);
        // La paire Orca sans liquidité et la paire Ethereum ne comptent pas.
        assert_eq!(count.total, 1);
        assert_eq!(count.per_venue.get("raydium"), Some(&1));
        assert!(count.is_listed());
    }

    #[test]
    fn an_empty_listing_reads_as_gone() {
        let pairs: Vec<TokenPair> = serde_json::from_str("[]").unwrap();
        let count = count_live_pairs(&pairs);
        assert_eq!(count.total, 0);
        assert!(!count.is_listed());
    }
}
