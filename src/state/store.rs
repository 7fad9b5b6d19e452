// DANS : src/state/store.rs
//
// Le magasin d'état partagé, calqué sur des hashes Redis : une entité
// porte des champs. C'est la seule ressource mutable entre tâches, et
// toute mutation composée passe par ses primitives atomiques. Aucune
// séquence lire-puis-écrire n'est permise côté appelant.

use std::collections::HashMap;
use std::sync::Mutex;

/// Résultat d'un incrément borné : l'avant, l'après, et si la borne a mordu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedDelta {
    pub previous: i64,
    pub current: i64,
    pub clamped: bool,
}

impl ClampedDelta {
    /// Vrai sur la transition stricte vers zéro (et non quand on y était déjà).
    pub fn reached_zero(&self) -> bool {
        self.previous > 0 && self.current == 0
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, entity: &str, field: &str) -> Option<String>;
    fn get_entity(&self, entity: &str) -> Option<HashMap<String, String>>;
    fn set(&self, entity: &str, field: &str, value: &str);
    /// Écrit plusieurs champs d'un coup : un lecteur concurrent voit tout ou rien.
    fn set_many(&self, entity: &str, fields: &[(&str, String)]);
    /// Écrit seulement si le champ est absent. Retourne `true` pour l'unique
    /// gagnant : c'est la primitive de revendication qui interdit de
    /// traiter deux fois le même pool.
    fn set_nx(&self, entity: &str, field: &str, value: &str) -> bool;
    fn exists(&self, entity: &str, field: &str) -> bool;
    /// Retourne `true` si le champ existait : le retrait aussi est une
    /// revendication (un seul appelant observe la disparition).
    fn delete(&self, entity: &str, field: &str) -> bool;
    fn delete_entity(&self, entity: &str);
    /// Incrément atomique borné : le champ (absent = 0) reçoit `delta` sans
    /// jamais descendre sous `floor`.
    fn incr_clamped(&self, entity: &str, field: &str, delta: i64, floor: i64) -> ClampedDelta;
}

/// Implémentation en mémoire, mono-processus. Un magasin réseau partagé
/// peut implémenter le même trait pour un déploiement multi-processus.
#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, entity: &str, field: &str) -> Option<String> {
        let entities = self.entities.lock().unwrap();
        entities.get(entity)?.get(field).cloned()
    }

    fn get_entity(&self, entity: &str) -> Option<HashMap<String, String>> {
        let entities = self.entities.lock().unwrap();
        entities.get(entity).cloned()
    }

    fn set(&self, entity: &str, field: &str, value: &str) {
        let mut entities = self.entities.lock().unwrap();
        entities
            .entry(entity.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn set_many(&self, entity: &str, fields: &[(&str, String)]) {
        let mut entities = self.entities.lock().unwrap();
        let map = entities.entry(entity.to_string()).or_default();
        for (field, value) in fields {
            map.insert((*field).to_string(), value.clone());
        }
    }

    fn set_nx(&self, entity: &str, field: &str, value: &str) -> bool {
        let mut entities = self.entities.lock().unwrap();
        let map = entities.entry(entity.to_string()).or_default();
        if map.contains_key(field) {
            return false;
        }
        map.insert(field.to_string(), value.to_string());
        true
    }

    fn exists(&self, entity: &str, field: &str) -> bool {
        let entities = self.entities.lock().unwrap();
        entities
            .get(entity)
            .is_some_and(|map| map.contains_key(field))
    }

    fn delete(&self, entity: &str, field: &str) -> bool {
        let mut entities = self.entities.lock().unwrap();
        let Some(map) = entities.get_mut(entity) else {
            return false;
        };
        let removed = map.remove(field).is_some();
        // Une entité sans champs n'existe plus, comme un hash Redis vidé.
        if map.is_empty() {
            entities.remove(entity);
        }
        removed
    }

    fn delete_entity(&self, entity: &str) {
        let mut entities = self.entities.lock().unwrap();
        entities.remove(entity);
    }

    fn incr_clamped(&self, entity: &str, field: &str, delta: i64, floor: i64) -> ClampedDelta {
        let mut entities = self.entities.lock().unwrap();
        let map = entities.entry(entity.to_string()).or_default();
        let previous = map
            .get(field)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        let raw = previous.saturating_add(delta);
        let current = raw.max(floor);
        map.insert(field.to_string(), current.to_string());
        ClampedDelta {
            previous,
            current,
            clamped: raw < floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nx_has_a_single_winner() {
        let store = MemoryStore::new();
        assert!(store.set_nx("pool:A", "tracked", "1"));
        assert!(!store.set_nx("pool:A", "tracked", "1"));
        assert_eq!(store.get("pool:A", "tracked").as_deref(), Some("1"));
    }

    #[test]
    fn incr_clamped_never_crosses_the_floor() {
        let store = MemoryStore::new();

        let first = store.incr_clamped("pool:A", "ops", -1, 0);
        assert_eq!(first.previous, 0);
        assert_eq!(first.current, 0);
        assert!(first.clamped);
        assert!(!first.reached_zero());

        store.incr_clamped("pool:A", "ops", 2, 0);
        let down = store.incr_clamped("pool:A", "ops", -1, 0);
        assert_eq!(down.current, 1);
        assert!(!down.clamped);

        let zero = store.incr_clamped("pool:A", "ops", -1, 0);
        assert_eq!(zero.current, 0);
        assert!(zero.reached_zero());
    }

    #[test]
    fn deleting_the_last_field_removes_the_entity() {
        let store = MemoryStore::new();
        store.set("pool:A", "record", "x");
        assert!(store.delete("pool:A", "record"));
        assert!(!store.delete("pool:A", "record"));
        assert!(store.get_entity("pool:A").is_none());
    }

    #[test]
    fn set_many_lands_as_a_whole() {
        let store = MemoryStore::new();
        store.set_many(
            "trade:t1",
            &[("status", "created".into()), ("pool", "A".into())],
        );
        let fields = store.get_entity("trade:t1").unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["status"], "created");
    }

    #[test]
    fn delete_entity_clears_every_field() {
        let store = MemoryStore::new();
        store.set("pool:A", "record", "x");
        store.set("pool:A", "tracked", "1");
        store.delete_entity("pool:A");
        assert!(!store.exists("pool:A", "record"));
        assert!(!store.exists("pool:A", "tracked"));
    }
}
