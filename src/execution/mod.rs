// DANS : src/execution/mod.rs

pub mod builder;
pub mod channels;
pub mod worker;

use crate::ledger::{TradeDirection, TradeRecord};
use channels::DeliveryChannel;
use solana_sdk::pubkey::Pubkey;

/// Une unité de travail sur la file de soumission. Le dispatcher la crée
/// sans jamais attendre son exécution ; un worker la consomme.
#[derive(Debug)]
pub struct TradeJob {
    pub trade: TradeRecord,
    pub pool: Pubkey,
    pub direction: TradeDirection,
    /// Lamports engagés (achat) ou unités brutes du token (vente).
    pub amount: u64,
    /// Échéance d'une vente étagée : le worker attend avant de soumettre.
    pub not_before: Option<tokio::time::Instant>,
    pub channel: DeliveryChannel,
    /// Tranche prélevée au dispatch, à restituer si la vente échoue.
    pub chunk_taken: Option<u64>,
    /// Vrai si cette tranche vide le plan : sa confirmation solde la position.
    pub final_chunk: bool,
}
