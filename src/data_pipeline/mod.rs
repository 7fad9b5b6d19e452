// DANS : src/data_pipeline/mod.rs
//
// Les collaborateurs de données externes. Le pipeline n'en connaît que le
// trait : la revalidation de liquidité est le seul endroit où l'on sort
// de la chaîne on-chain.

pub mod api_connectors;

use anyhow::Result;
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;

/// Où un mint est-il encore coté, et combien de fois.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidityCount {
    pub total: usize,
    /// Nombre de paires vivantes par venue (dexId).
    pub per_venue: HashMap<String, usize>,
}

impl LiquidityCount {
    pub fn is_listed(&self) -> bool {
        self.total > 0
    }
}

#[async_trait]
pub trait LiquidityLookup: Send + Sync {
    async fn liquidity_count(&self, mint: &Pubkey) -> Result<LiquidityCount>;
}

pub use api_connectors::dexscreener::DexScreenerLookup;
