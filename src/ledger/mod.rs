// DANS : src/ledger/mod.rs
//
// Le journal des trades. Chaque décision du dispatcher ouvre une fiche,
// chaque étape de sa vie la fait avancer dans un cycle strictement
// monotone : Created → Preprocessed → Processed → Completed | Abandoned.
// Une fiche terminée ne bouge plus, quoi qu'il arrive en aval.

use crate::monitoring::metrics;
use crate::state::KeyValueStore;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

const TRADE_INDEX: &str = "trades";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeDirection::Buy => write!(f, "achat"),
            TradeDirection::Sell => write!(f, "vente"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    BuildFailed,
    SubmissionFailed,
    ConfirmationTimeout,
    MarketUnavailable,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbandonReason::BuildFailed => "construction impossible",
            AbandonReason::SubmissionFailed => "soumission refusée partout",
            AbandonReason::ConfirmationTimeout => "jamais confirmé",
            AbandonReason::MarketUnavailable => "marché introuvable",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Created,
    Preprocessed,
    Processed,
    Completed,
    Abandoned(AbandonReason),
}

impl TradeStatus {
    fn rank(&self) -> u8 {
        match self {
            TradeStatus::Created => 0,
            TradeStatus::Preprocessed => 1,
            TradeStatus::Processed => 2,
            TradeStatus::Completed | TradeStatus::Abandoned(_) => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Created => "created",
            TradeStatus::Preprocessed => "preprocessed",
            TradeStatus::Processed => "processed",
            TradeStatus::Completed => "completed",
            TradeStatus::Abandoned(_) => "abandoned",
        }
    }
}

/// Une tentative de soumission sur un canal, réussie ou non.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub channel: String,
    pub signature: Option<Signature>,
    pub sent_at_ms: u64,
    pub error: Option<String>,
}

/// Horodatages du cycle de vie, en millisecondes Unix, jamais décroissants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTiming {
    pub listened_ms: u64,
    pub preprocessed_ms: Option<u64>,
    pub processed_ms: Option<u64>,
    pub completed_ms: Option<u64>,
}

impl TradeTiming {
    fn latest(&self) -> u64 {
        self.completed_ms
            .or(self.processed_ms)
            .or(self.preprocessed_ms)
            .unwrap_or(self.listened_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub pool: Pubkey,
    pub token_mint: Pubkey,
    pub direction: TradeDirection,
    /// Lamports engagés pour un achat, unités brutes du token pour une vente.
    pub requested_amount: u64,
    /// Renseigné à la confirmation : tokens acquis (achat).
    pub filled_amount: u64,
    pub status: TradeStatus,
    pub timing: TradeTiming,
    pub attempts: Vec<SubmissionAttempt>,
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct TradeLedger {
    store: Arc<dyn KeyValueStore>,
    sequence: AtomicU64,
}

impl TradeLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            sequence: AtomicU64::new(0),
        }
    }

    fn entity(id: &str) -> String {
        format!("trade:{id}")
    }

    /// Ouvre une fiche au statut `Created` et la persiste immédiatement.
    pub fn create(
        &self,
        pool: &Pubkey,
        token_mint: &Pubkey,
        direction: TradeDirection,
        requested_amount: u64,
    ) -> TradeRecord {
        let millis = now_ms();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let prefix: String = pool.to_string().chars().take(4).collect();
        let record = TradeRecord {
            id: format!("{prefix}-{millis}-{seq}"),
            pool: *pool,
            token_mint: *token_mint,
            direction,
            requested_amount,
            filled_amount: 0,
            status: TradeStatus::Created,
            timing: TradeTiming {
                listened_ms: millis,
                ..TradeTiming::default()
            },
            attempts: Vec::new(),
        };
        self.persist(&record);
        metrics::TRADE_TRANSITIONS
            .with_label_values(&["created"])
            .inc();
        record
    }

    /// Fait avancer le statut. Les transitions qui ne progressent pas
    /// (retour en arrière, sortie d'un état terminal) sont rejetées et
    /// journalisées, jamais appliquées.
    pub fn advance(&self, record: &mut TradeRecord, next: TradeStatus) -> bool {
        if next.rank() <= record.status.rank() {
            warn!(
                trade = %record.id,
                from = record.status.as_str(),
                to = next.as_str(),
                "[Ledger] Transition illégale ignorée."
            );
            return false;
        }

        let stamp = now_ms().max(record.timing.latest());
        match next {
            TradeStatus::Preprocessed => record.timing.preprocessed_ms = Some(stamp),
            TradeStatus::Processed => record.timing.processed_ms = Some(stamp),
            TradeStatus::Completed | TradeStatus::Abandoned(_) => {
                record.timing.completed_ms = Some(stamp)
            }
            TradeStatus::Created => {}
        }
        record.status = next;
        self.persist(record);
        metrics::TRADE_TRANSITIONS
            .with_label_values(&[next.as_str()])
            .inc();
        true
    }

    /// Consigne une tentative de soumission sur la fiche.
    pub fn record_attempt(&self, record: &mut TradeRecord, attempt: SubmissionAttempt) {
        record.attempts.push(attempt);
        self.persist(record);
    }

    pub fn set_filled(&self, record: &mut TradeRecord, amount: u64) {
        record.filled_amount = amount;
        self.persist(record);
    }

    pub fn load(&self, id: &str) -> Option<TradeRecord> {
        let json = self.store.get(&Self::entity(id), "record")?;
        serde_json::from_str(&json).ok()
    }

    /// Purge explicite des fiches abandonnées. Jamais appelée sur le chemin
    /// chaud ; c'est un nettoyage d'exploitation.
    pub fn purge_abandoned(&self) -> usize {
        let Some(index) = self.store.get_entity(TRADE_INDEX) else {
            return 0;
        };
        let mut purged = 0;
        for (id, status) in index {
            if status == "abandoned" {
                self.store.delete_entity(&Self::entity(&id));
                self.store.delete(TRADE_INDEX, &id);
                purged += 1;
            }
        }
        purged
    }

    fn persist(&self, record: &TradeRecord) {
        match serde_json::to_string(record) {
            Ok(json) => {
                self.store.set(&Self::entity(&record.id), "record", &json);
                self.store
                    .set(TRADE_INDEX, &record.id, record.status.as_str());
            }
            Err(error) => {
                warn!(trade = %record.id, %error, "[Ledger] Fiche non sérialisable.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn ledger() -> TradeLedger {
        TradeLedger::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn the_lifecycle_only_moves_forward() {
        let ledger = ledger();
        let pool = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let mut trade = ledger.create(&pool, &mint, TradeDirection::Buy, 50_000_000);

        assert!(ledger.advance(&mut trade, TradeStatus::Preprocessed));
        assert!(ledger.advance(&mut trade, TradeStatus::Processed));
        assert!(!ledger.advance(&mut trade, TradeStatus::Created));
        assert!(ledger.advance(&mut trade, TradeStatus::Completed));
        assert_eq!(trade.status, TradeStatus::Completed);
    }

    #[test]
    fn an_abandoned_trade_never_completes() {
        let ledger = ledger();
        let pool = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let mut trade = ledger.create(&pool, &mint, TradeDirection::Sell, 1_000);

        assert!(ledger.advance(
            &mut trade,
            TradeStatus::Abandoned(AbandonReason::SubmissionFailed)
        ));
        assert!(!ledger.advance(&mut trade, TradeStatus::Completed));
        assert_eq!(
            trade.status,
            TradeStatus::Abandoned(AbandonReason::SubmissionFailed)
        );

        let reloaded = ledger.load(&trade.id).unwrap();
        assert_eq!(reloaded.status, trade.status);
    }

    #[test]
    fn skipping_intermediate_states_is_legal() {
        let ledger = ledger();
        let pool = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let mut trade = ledger.create(&pool, &mint, TradeDirection::Buy, 1);

        // Un trade peut être abandonné avant même d'être préparé.
        assert!(ledger.advance(
            &mut trade,
            TradeStatus::Abandoned(AbandonReason::BuildFailed)
        ));
        assert!(trade.timing.completed_ms.is_some());
    }

    #[test]
    fn timing_is_non_decreasing() {
        let ledger = ledger();
        let pool = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let mut trade = ledger.create(&pool, &mint, TradeDirection::Buy, 1);

        ledger.advance(&mut trade, TradeStatus::Preprocessed);
        ledger.advance(&mut trade, TradeStatus::Processed);
        ledger.advance(&mut trade, TradeStatus::Completed);

        let timing = trade.timing;
        assert!(timing.preprocessed_ms.unwrap() >= timing.listened_ms);
        assert!(timing.processed_ms.unwrap() >= timing.preprocessed_ms.unwrap());
        assert!(timing.completed_ms.unwrap() >= timing.processed_ms.unwrap());
    }

    #[test]
    fn attempts_accumulate_in_order() {
        let ledger = ledger();
        let pool = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let mut trade = ledger.create(&pool, &mint, TradeDirection::Sell, 500);

        ledger.record_attempt(
            &mut trade,
            SubmissionAttempt {
                channel: "relay_bundle".into(),
                signature: None,
                sent_at_ms: now_ms(),
                error: Some("timeout".into()),
            },
        );
        ledger.record_attempt(
            &mut trade,
            SubmissionAttempt {
                channel: "direct_rpc".into(),
                signature: Some(Signature::from([5; 64])),
                sent_at_ms: now_ms(),
                error: None,
            },
        );

        let reloaded = ledger.load(&trade.id).unwrap();
        assert_eq!(reloaded.attempts.len(), 2);
        assert_eq!(reloaded.attempts[0].channel, "relay_bundle");
        assert!(reloaded.attempts[1].error.is_none());
    }

    #[test]
    fn purge_only_touches_abandoned_records() {
        let ledger = ledger();
        let pool = Pubkey::new_unique();
        let mint = Pubkey::new_unique();

        let mut doomed = ledger.create(&pool, &mint, TradeDirection::Buy, 1);
        let alive = ledger.create(&pool, &mint, TradeDirection::Buy, 2);
        ledger.advance(
            &mut doomed,
            TradeStatus::Abandoned(AbandonReason::ConfirmationTimeout),
        );

        assert_eq!(ledger.purge_abandoned(), 1);
        assert!(ledger.load(&doomed.id).is_none());
        assert!(ledger.load(&alive.id).is_some());
    }
}
