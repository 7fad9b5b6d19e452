// DANS : src/state/pool_tracker.rs
//
// L'état par pool : la fiche d'identité, le drapeau de suivi, le compteur
// d'opérations de liquidité et le plan de vente par tranches. Tout vit dans
// le KeyValueStore ; les livraisons dupliquées ou désordonnées du fan-in
// sont neutralisées par les primitives atomiques, jamais par des verrous
// applicatifs.

use crate::monitoring::metrics;
use crate::state::store::{ClampedDelta, KeyValueStore};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tracing::info;

/// La fiche d'identité d'un pool, immuable après enregistrement à
/// l'exception des clés de marché hydratées à la première vente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: Pubkey,
    pub authority: Pubkey,
    pub coin_mint: Pubkey,
    pub pc_mint: Pubkey,
    pub coin_decimals: u8,
    pub pc_decimals: u8,
    pub coin_vault: Pubkey,
    pub pc_vault: Pubkey,
    pub open_orders: Pubkey,
    pub target_orders: Pubkey,
    pub market: Pubkey,
    pub market_program: Pubkey,
    /// Le mint recherché, c'est-à-dire le côté non-WSOL de la paire.
    pub token_mint: Pubkey,
    pub wsol_is_coin: bool,
    pub open_time: i64,
    // Clés du carnet Serum/OpenBook, inconnues à la création du pool.
    // `Pubkey::default()` tant que `hydrate_market` n'est pas passé.
    #[serde(default)]
    pub market_bids: Pubkey,
    #[serde(default)]
    pub market_asks: Pubkey,
    #[serde(default)]
    pub market_event_queue: Pubkey,
    #[serde(default)]
    pub market_coin_vault: Pubkey,
    #[serde(default)]
    pub market_pc_vault: Pubkey,
    #[serde(default)]
    pub market_vault_signer: Pubkey,
}

impl PoolRecord {
    pub fn market_is_hydrated(&self) -> bool {
        self.market_bids != Pubkey::default()
    }

    /// Les comptes côté pool d'une instruction de swap.
    pub fn swap_keys(&self) -> crate::decoders::raydium_amm::SwapKeys {
        crate::decoders::raydium_amm::SwapKeys {
            amm: self.address,
            open_orders: self.open_orders,
            target_orders: self.target_orders,
            coin_vault: self.coin_vault,
            pc_vault: self.pc_vault,
            market_program: self.market_program,
            market: self.market,
            market_bids: self.market_bids,
            market_asks: self.market_asks,
            market_event_queue: self.market_event_queue,
            market_coin_vault: self.market_coin_vault,
            market_pc_vault: self.market_pc_vault,
            market_vault_signer: self.market_vault_signer,
        }
    }
}

/// Le plan de vente par tranches d'une position acquise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenChunk {
    pub total: u64,
    pub remaining: u64,
    pub chunk: u64,
    /// Faux tant que l'achat n'est pas confirmé : on ne vend pas des
    /// tokens qu'on ne détient pas encore.
    pub confirmed: bool,
    pub exhausted: bool,
}

/// Une tranche prélevée atomiquement sur le plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTake {
    pub taken: u64,
    pub remaining: u64,
}

impl ChunkTake {
    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Clone)]
pub struct PoolTracker {
    store: Arc<dyn KeyValueStore>,
}

impl PoolTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn entity(pool: &Pubkey) -> String {
        format!("pool:{pool}")
    }

    /// Enregistre la fiche. Retourne `false` si le pool était déjà connu :
    /// la première livraison gagne, les rediffusions ne réécrivent rien.
    pub fn register(&self, record: &PoolRecord) -> bool {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(_) => return false,
        };
        self.store
            .set_nx(&Self::entity(&record.address), "record", &json)
    }

    pub fn get(&self, pool: &Pubkey) -> Option<PoolRecord> {
        let json = self.store.get(&Self::entity(pool), "record")?;
        serde_json::from_str(&json).ok()
    }

    /// Réécrit la fiche (hydratation des clés de marché).
    pub fn save(&self, record: &PoolRecord) {
        if let Ok(json) = serde_json::to_string(record) {
            self.store.set(&Self::entity(&record.address), "record", &json);
        }
    }

    /// Pose le drapeau de suivi. Un seul appelant gagne : c'est ce qui
    /// interdit le double-achat quand deux sources livrent la création.
    pub fn claim_tracking(&self, pool: &Pubkey) -> bool {
        let claimed = self.store.set_nx(&Self::entity(pool), "tracked", "1");
        if claimed {
            metrics::TRACKED_POOLS.inc();
        }
        claimed
    }

    pub fn is_tracked(&self, pool: &Pubkey) -> bool {
        self.store.exists(&Self::entity(pool), "tracked")
    }

    pub fn untrack(&self, pool: &Pubkey) {
        if self.store.delete(&Self::entity(pool), "tracked") {
            metrics::TRACKED_POOLS.dec();
            info!(pool = %pool, "[Tracker] Pool retiré du suivi.");
        }
    }

    pub fn liquidity_ops(&self, pool: &Pubkey) -> i64 {
        self.store
            .get(&Self::entity(pool), "liquidity_ops")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    pub fn incr_liquidity(&self, pool: &Pubkey) -> ClampedDelta {
        self.store
            .incr_clamped(&Self::entity(pool), "liquidity_ops", 1, 0)
    }

    /// Décrément borné à zéro ; `reached_zero()` sur le retour signale la
    /// transition qui déclenche la sortie.
    pub fn decr_liquidity(&self, pool: &Pubkey) -> ClampedDelta {
        self.store
            .incr_clamped(&Self::entity(pool), "liquidity_ops", -1, 0)
    }

    /// Installe le plan de vente : `division` tranches sur le solde
    /// réellement acquis, la dernière tranche absorbe le reste.
    pub fn set_chunk_plan(&self, pool: &Pubkey, total: u64, division: u32, confirmed: bool) {
        let chunk = if total == 0 {
            0
        } else {
            (total / u64::from(division.max(1))).max(1)
        };
        self.store.set_many(
            &Self::entity(pool),
            &[
                ("chunk_total", total.to_string()),
                ("chunk_remaining", total.to_string()),
                ("chunk_size", chunk.to_string()),
                ("chunk_confirmed", if confirmed { "1" } else { "0" }.to_string()),
                ("chunk_exhausted", "0".to_string()),
            ],
        );
    }

    pub fn chunk(&self, pool: &Pubkey) -> Option<TokenChunk> {
        let fields = self.store.get_entity(&Self::entity(pool))?;
        let parse = |name: &str| fields.get(name).and_then(|value| value.parse::<u64>().ok());
        Some(TokenChunk {
            total: parse("chunk_total")?,
            remaining: parse("chunk_remaining")?,
            chunk: parse("chunk_size")?,
            confirmed: fields.get("chunk_confirmed").map(String::as_str) == Some("1"),
            exhausted: fields.get("chunk_exhausted").map(String::as_str) == Some("1"),
        })
    }

    /// Prélève une tranche. Quand le solde restant ne couvre plus deux
    /// tranches nominales, le prélèvement emporte tout : le plan produit
    /// exactement `division` tranches, la dernière absorbant le reste.
    pub fn take_chunk(&self, pool: &Pubkey) -> Option<ChunkTake> {
        let entity = Self::entity(pool);
        if self.store.get(&entity, "chunk_confirmed").as_deref() != Some("1") {
            return None;
        }
        let size = self
            .store
            .get(&entity, "chunk_size")?
            .parse::<i64>()
            .ok()
            .filter(|size| *size > 0)?;
        let remaining = self
            .store
            .get(&entity, "chunk_remaining")?
            .parse::<i64>()
            .ok()?;
        let requested = if remaining < 2 * size { remaining } else { size };
        if requested <= 0 {
            return None;
        }

        // Le clamp atomique garantit qu'un prélèvement concurrent ne peut
        // pas emporter plus que le solde, quel que soit `requested`.
        let delta = self
            .store
            .incr_clamped(&entity, "chunk_remaining", -requested, 0);
        let taken = delta.previous - delta.current;
        if taken <= 0 {
            return None;
        }
        if delta.current == 0 {
            self.store.set(&entity, "chunk_exhausted", "1");
        }
        Some(ChunkTake {
            taken: taken as u64,
            remaining: delta.current as u64,
        })
    }

    /// Rend une tranche dont la vente a échoué définitivement. Sans effet
    /// si la position a déjà été soldée : on ne ressuscite pas un état purgé.
    pub fn restore_chunk(&self, pool: &Pubkey, amount: u64) {
        let entity = Self::entity(pool);
        if !self.store.exists(&entity, "chunk_total") {
            return;
        }
        self.store
            .incr_clamped(&entity, "chunk_remaining", amount as i64, 0);
        self.store.set(&entity, "chunk_exhausted", "0");
    }

    pub fn bump_sell_attempts(&self, pool: &Pubkey) -> i64 {
        self.store
            .incr_clamped(&Self::entity(pool), "sell_attempts", 1, 0)
            .current
    }

    pub fn reset_sell_attempts(&self, pool: &Pubkey) {
        self.store.set(&Self::entity(pool), "sell_attempts", "0");
    }

    /// La revalidation du plafond de ventes ne se fait qu'une fois par pool.
    pub fn claim_ceiling_reset(&self, pool: &Pubkey) -> bool {
        self.store
            .set_nx(&Self::entity(pool), "ceiling_reset", "1")
    }

    /// Position soldée : plus de suivi, plus d'état. Appelé quand la vente
    /// de la dernière tranche est confirmée.
    pub fn mark_exhausted(&self, pool: &Pubkey) {
        self.untrack(pool);
        self.store.delete_entity(&Self::entity(pool));
        info!(pool = %pool, "[Tracker] Position soldée, état purgé.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::MemoryStore;

    fn tracker() -> PoolTracker {
        PoolTracker::new(Arc::new(MemoryStore::new()))
    }

    fn record(address: Pubkey) -> PoolRecord {
        PoolRecord {
            address,
            authority: Pubkey::new_unique(),
            coin_mint: Pubkey::new_unique(),
            pc_mint: Pubkey::new_unique(),
            coin_decimals: 9,
            pc_decimals: 6,
            coin_vault: Pubkey::new_unique(),
            pc_vault: Pubkey::new_unique(),
            open_orders: Pubkey::new_unique(),
            target_orders: Pubkey::new_unique(),
            market: Pubkey::new_unique(),
            market_program: Pubkey::new_unique(),
            token_mint: Pubkey::new_unique(),
            wsol_is_coin: true,
            open_time: 1_700_000_000,
            market_bids: Pubkey::default(),
            market_asks: Pubkey::default(),
            market_event_queue: Pubkey::default(),
            market_coin_vault: Pubkey::default(),
            market_pc_vault: Pubkey::default(),
            market_vault_signer: Pubkey::default(),
        }
    }

    #[test]
    fn the_first_registration_wins() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        let first = record(pool);
        assert!(tracker.register(&first));

        let mut replay = first.clone();
        replay.open_time = 0;
        assert!(!tracker.register(&replay));
        assert_eq!(tracker.get(&pool).unwrap(), first);
    }

    #[test]
    fn tracking_has_a_single_winner() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        assert!(tracker.claim_tracking(&pool));
        assert!(!tracker.claim_tracking(&pool));
        assert!(tracker.is_tracked(&pool));

        tracker.untrack(&pool);
        assert!(!tracker.is_tracked(&pool));
    }

    #[test]
    fn liquidity_counter_never_goes_negative() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();

        let fresh = tracker.decr_liquidity(&pool);
        assert_eq!(fresh.current, 0);
        assert!(fresh.clamped);
        assert!(!fresh.reached_zero());

        tracker.incr_liquidity(&pool);
        tracker.incr_liquidity(&pool);
        assert!(!tracker.decr_liquidity(&pool).reached_zero());
        assert!(tracker.decr_liquidity(&pool).reached_zero());
        assert!(!tracker.decr_liquidity(&pool).reached_zero());
        assert_eq!(tracker.liquidity_ops(&pool), 0);
    }

    #[test]
    fn chunks_divide_with_the_remainder_on_the_last() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        tracker.set_chunk_plan(&pool, 10, 3, true);

        let takes: Vec<u64> = std::iter::from_fn(|| tracker.take_chunk(&pool))
            .map(|take| take.taken)
            .collect();
        assert_eq!(takes, vec![3, 3, 4]);
        assert!(tracker.chunk(&pool).unwrap().exhausted);
        assert!(tracker.take_chunk(&pool).is_none());
    }

    #[test]
    fn an_even_balance_yields_exactly_division_chunks() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        tracker.set_chunk_plan(&pool, 9, 3, true);

        let takes: Vec<u64> = std::iter::from_fn(|| tracker.take_chunk(&pool))
            .map(|take| take.taken)
            .collect();
        assert_eq!(takes, vec![3, 3, 3]);
    }

    #[test]
    fn an_unconfirmed_plan_yields_nothing() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        tracker.set_chunk_plan(&pool, 1000, 4, false);
        assert!(tracker.take_chunk(&pool).is_none());
    }

    #[test]
    fn a_restored_chunk_can_be_taken_again() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        tracker.set_chunk_plan(&pool, 4, 2, true);

        assert_eq!(tracker.take_chunk(&pool).unwrap().taken, 2);
        let last = tracker.take_chunk(&pool).unwrap();
        assert_eq!(last.taken, 2);
        assert!(last.exhausted());

        tracker.restore_chunk(&pool, 2);
        let chunk = tracker.chunk(&pool).unwrap();
        assert_eq!(chunk.remaining, 2);
        assert!(!chunk.exhausted);
        assert_eq!(tracker.take_chunk(&pool).unwrap().taken, 2);
    }

    #[test]
    fn a_late_restore_does_not_resurrect_a_purged_pool() {
        let store = Arc::new(MemoryStore::new());
        let tracker = PoolTracker::new(store.clone());
        let pool = Pubkey::new_unique();
        tracker.register(&record(pool));
        tracker.claim_tracking(&pool);
        tracker.set_chunk_plan(&pool, 4, 2, true);
        assert_eq!(tracker.take_chunk(&pool).unwrap().taken, 2);
        assert!(tracker.take_chunk(&pool).unwrap().exhausted());

        // La dernière tranche confirmée a soldé la position ; une tranche
        // antérieure échoue ensuite et tente de rendre ses tokens.
        tracker.mark_exhausted(&pool);
        tracker.restore_chunk(&pool, 2);

        assert!(store.get_entity(&PoolTracker::entity(&pool)).is_none());
        assert!(tracker.take_chunk(&pool).is_none());
    }

    #[test]
    fn exhaustion_purges_the_pool() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        tracker.register(&record(pool));
        tracker.claim_tracking(&pool);
        tracker.set_chunk_plan(&pool, 100, 4, true);

        tracker.mark_exhausted(&pool);
        assert!(!tracker.is_tracked(&pool));
        assert!(tracker.get(&pool).is_none());
        assert!(tracker.chunk(&pool).is_none());
    }

    #[test]
    fn the_record_round_trips_through_the_store() {
        let tracker = tracker();
        let pool = Pubkey::new_unique();
        let mut original = record(pool);
        assert!(tracker.register(&original));

        original.market_bids = Pubkey::new_unique();
        original.market_asks = Pubkey::new_unique();
        tracker.save(&original);

        let loaded = tracker.get(&pool).unwrap();
        assert!(loaded.market_is_hydrated());
        assert_eq!(loaded, original);
    }
}
