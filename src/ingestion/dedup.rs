// DANS : src/ingestion/dedup.rs
//
// Suppression des doublons entre sources. K flux redondants livrent la même
// transaction : seule la première occurrence d'une signature dans la fenêtre
// traverse. Pas de tâche de nettoyage : le balayage est amorti sur les
// insertions.

use solana_sdk::signature::Signature;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

// Un balayage tous les N inserts borne la mémoire sans timer dédié.
const SWEEP_EVERY_INSERTS: u32 = 1024;

pub struct SignatureCache {
    window: Duration,
    entries: HashMap<Signature, Instant>,
    inserts_since_sweep: u32,
}

impl SignatureCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
            inserts_since_sweep: 0,
        }
    }

    /// Enregistre une signature. Retourne `false` si elle a déjà été vue
    /// dans la fenêtre (doublon à jeter), `true` si elle est nouvelle.
    pub fn insert(&mut self, signature: Signature) -> bool {
        self.insert_at(signature, Instant::now())
    }

    /// Variante à horloge explicite, pour des tests déterministes.
    pub fn insert_at(&mut self, signature: Signature, now: Instant) -> bool {
        self.inserts_since_sweep += 1;
        if self.inserts_since_sweep >= SWEEP_EVERY_INSERTS {
            self.sweep_at(now);
        }

        match self.entries.get_mut(&signature) {
            Some(seen_at) if now.duration_since(*seen_at) < self.window => false,
            Some(seen_at) => {
                // Entrée expirée jamais balayée : la signature redevient inédite.
                *seen_at = now;
                true
            }
            None => {
                self.entries.insert(signature, now);
                true
            }
        }
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.contains_at(signature, Instant::now())
    }

    pub fn contains_at(&self, signature: &Signature, now: Instant) -> bool {
        self.entries
            .get(signature)
            .is_some_and(|seen_at| now.duration_since(*seen_at) < self.window)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep_at(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen_at| now.duration_since(*seen_at) < self.window);
        self.inserts_since_sweep = 0;
        debug!(
            purged = before - self.entries.len(),
            kept = self.entries.len(),
            "[Dedup] Balayage des signatures expirées."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(n: u8) -> Signature {
        Signature::from([n; 64])
    }

    #[test]
    fn first_insert_passes_duplicate_is_flagged() {
        let mut cache = SignatureCache::new(Duration::from_secs(3000));
        let now = Instant::now();

        assert!(cache.insert_at(sig(1), now));
        assert!(!cache.insert_at(sig(1), now));
        assert!(cache.contains_at(&sig(1), now));
        assert!(!cache.contains_at(&sig(2), now));
    }

    #[test]
    fn signature_expires_after_the_window() {
        let window = Duration::from_secs(3000);
        let mut cache = SignatureCache::new(window);
        let start = Instant::now();

        assert!(cache.insert_at(sig(7), start));
        // Juste avant l'expiration : toujours un doublon.
        let almost = start + window - Duration::from_millis(1);
        assert!(cache.contains_at(&sig(7), almost));
        assert!(!cache.insert_at(sig(7), almost));

        // La fenêtre passée : la signature est expirée avant même le balayage.
        let after = start + window;
        assert!(!cache.contains_at(&sig(7), after));
        assert!(cache.insert_at(sig(7), after));
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let window = Duration::from_secs(60);
        let mut cache = SignatureCache::new(window);
        let start = Instant::now();

        cache.insert_at(sig(1), start);
        cache.insert_at(sig(2), start);
        assert_eq!(cache.len(), 2);

        // On force un balayage en dépassant le seuil d'insertions, une fois
        // la fenêtre écoulée : les deux entrées initiales sont récupérées.
        let later = start + window + Duration::from_secs(1);
        for i in 0..SWEEP_EVERY_INSERTS {
            cache.insert_at(Signature::from([(i % 251) as u8 + 3; 64]), later);
        }
        assert!(!cache.contains_at(&sig(1), later));
        assert!(!cache.contains_at(&sig(2), later));
        assert!(cache.len() <= SWEEP_EVERY_INSERTS as usize);
    }
}
