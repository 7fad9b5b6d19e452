// DANS : src/lookup/mod.rs
//
// Résolution des références de comptes d'un message v0. Un index d'instruction
// pointe soit dans la liste statique de la transaction, soit dans une table de
// correspondance on-chain ; les tables sont mises en cache avec éviction LRU.

use crate::ingestion::{RawEvent, RawInstruction, TableLookup};
use crate::monitoring::metrics;
use crate::rpc::ResilientRpcClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use solana_sdk::address_lookup_table::state::AddressLookupTable;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Référence de compte : index direct dans les clés statiques, ou paire
/// (table, index) à résoudre via une table de correspondance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRef {
    Static(usize),
    Table { table: Pubkey, index: u8 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("index de compte {index} hors bornes ({available} adresses disponibles)")]
    OutOfBounds { index: usize, available: usize },
    #[error("table de correspondance {0} indisponible")]
    TableUnavailable(Pubkey),
}

/// D'où viennent les tables de correspondance. Le bot utilise le RPC ;
/// les tests injectent une source en mémoire.
#[async_trait]
pub trait AddressTableSource: Send + Sync {
    async fn fetch(&self, table: &Pubkey) -> Result<Vec<Pubkey>>;
}

/// Source de production : lit le compte de la table et le désérialise.
pub struct RpcTableSource {
    rpc: Arc<ResilientRpcClient>,
}

impl RpcTableSource {
    pub fn new(rpc: Arc<ResilientRpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl AddressTableSource for RpcTableSource {
    async fn fetch(&self, table: &Pubkey) -> Result<Vec<Pubkey>> {
        let account = self.rpc.get_account(table).await?;
        let parsed = AddressLookupTable::deserialize(&account.data)
            .with_context(|| format!("Table de correspondance {} illisible", table))?;
        Ok(parsed.addresses.to_vec())
    }
}

struct TableEntry {
    addresses: Vec<Pubkey>,
    last_used: u64,
}

/// Cache borné des tables, recence suivie par un tick monotone.
/// Les tables on-chain sont immuables une fois gelées : pas de TTL,
/// seule la pression mémoire fait sortir une entrée.
struct TableCache {
    entries: HashMap<Pubkey, TableEntry>,
    capacity: usize,
    tick: u64,
}

impl TableCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    fn get(&mut self, table: &Pubkey) -> Option<Vec<Pubkey>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(table).map(|entry| {
            entry.last_used = tick;
            entry.addresses.clone()
        })
    }

    fn put(&mut self, table: Pubkey, addresses: Vec<Pubkey>) {
        self.tick += 1;
        if !self.entries.contains_key(&table) && self.entries.len() >= self.capacity {
            if let Some(evicted) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key)
            {
                self.entries.remove(&evicted);
                debug!(table = %evicted, "[Lookup] Éviction LRU d'une table.");
            }
        }
        self.entries.insert(
            table,
            TableEntry {
                addresses,
                last_used: self.tick,
            },
        );
    }
}

/// Classe un index de message : en dessous du nombre de clés statiques c'est
/// un accès direct, au-delà l'ordre v0 s'applique (tous les index writable
/// des tables dans l'ordre, puis tous les readonly).
pub fn classify_index(
    index: usize,
    static_len: usize,
    lookups: &[TableLookup],
) -> Result<AccountRef, ResolveError> {
    if index < static_len {
        return Ok(AccountRef::Static(index));
    }
    let mut position = index - static_len;
    for lookup in lookups {
        if position < lookup.writable_indexes.len() {
            return Ok(AccountRef::Table {
                table: lookup.table,
                index: lookup.writable_indexes[position],
            });
        }
        position -= lookup.writable_indexes.len();
    }
    for lookup in lookups {
        if position < lookup.readonly_indexes.len() {
            return Ok(AccountRef::Table {
                table: lookup.table,
                index: lookup.readonly_indexes[position],
            });
        }
        position -= lookup.readonly_indexes.len();
    }
    let loaded: usize = lookups
        .iter()
        .map(|l| l.writable_indexes.len() + l.readonly_indexes.len())
        .sum();
    Err(ResolveError::OutOfBounds {
        index,
        available: static_len + loaded,
    })
}

/// Résout les références de comptes contre le cache de tables partagé.
pub struct LookupResolver {
    cache: Mutex<TableCache>,
    source: Arc<dyn AddressTableSource>,
}

impl LookupResolver {
    pub fn new(source: Arc<dyn AddressTableSource>, capacity: usize) -> Self {
        Self {
            cache: Mutex::new(TableCache::new(capacity)),
            source,
        }
    }

    /// Résout une référence. Miss de cache : on va chercher la table (une
    /// seule relance en cas d'erreur passagère), on peuple le cache, et on
    /// réessaie l'index. Au-delà, l'appelant abandonne l'événement.
    pub async fn resolve(
        &self,
        reference: AccountRef,
        static_keys: &[Pubkey],
    ) -> Result<Pubkey, ResolveError> {
        match reference {
            AccountRef::Static(index) => {
                static_keys
                    .get(index)
                    .copied()
                    .ok_or(ResolveError::OutOfBounds {
                        index,
                        available: static_keys.len(),
                    })
            }
            AccountRef::Table { table, index } => {
                let addresses = self.table_addresses(&table).await?;
                addresses
                    .get(index as usize)
                    .copied()
                    .ok_or(ResolveError::OutOfBounds {
                        index: index as usize,
                        available: addresses.len(),
                    })
            }
        }
    }

    /// Résout l'index d'un message complet. Les adresses déjà chargées par le
    /// validateur (présentes dans l'événement) court-circuitent le cache.
    pub async fn resolve_message_index(
        &self,
        event: &RawEvent,
        index: usize,
    ) -> Result<Pubkey, ResolveError> {
        let static_len = event.account_keys.len();
        if index < static_len {
            return Ok(event.account_keys[index]);
        }
        let inline = event.loaded_writable.len() + event.loaded_readonly.len();
        if inline > 0 {
            return event
                .loaded_writable
                .iter()
                .chain(event.loaded_readonly.iter())
                .nth(index - static_len)
                .copied()
                .ok_or(ResolveError::OutOfBounds {
                    index,
                    available: static_len + inline,
                });
        }
        let reference = classify_index(index, static_len, &event.table_lookups)?;
        self.resolve(reference, &event.account_keys).await
    }

    /// Résout la liste de comptes d'une instruction, dans l'ordre.
    pub async fn instruction_accounts(
        &self,
        event: &RawEvent,
        instruction: &RawInstruction,
    ) -> Result<Vec<Pubkey>, ResolveError> {
        let mut accounts = Vec::with_capacity(instruction.accounts.len());
        for &index in &instruction.accounts {
            accounts.push(self.resolve_message_index(event, index as usize).await?);
        }
        Ok(accounts)
    }

    async fn table_addresses(&self, table: &Pubkey) -> Result<Vec<Pubkey>, ResolveError> {
        if let Some(addresses) = self.cache.lock().unwrap().get(table) {
            return Ok(addresses);
        }
        let fetched = match self.source.fetch(table).await {
            Ok(addresses) => addresses,
            Err(first_error) => {
                debug!(table = %table, error = %first_error, "[Lookup] Premier fetch de table échoué, relance.");
                match self.source.fetch(table).await {
                    Ok(addresses) => addresses,
                    Err(second_error) => {
                        warn!(table = %table, error = %second_error, "[Lookup] Table irrécupérable.");
                        metrics::RESOLUTION_FAILURES.inc();
                        return Err(ResolveError::TableUnavailable(*table));
                    }
                }
            }
        };
        self.cache.lock().unwrap().put(*table, fetched.clone());
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemoryTableSource {
        tables: HashMap<Pubkey, Vec<Pubkey>>,
        fetches: AtomicUsize,
    }

    impl MemoryTableSource {
        fn new(tables: HashMap<Pubkey, Vec<Pubkey>>) -> Self {
            Self {
                tables,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AddressTableSource for MemoryTableSource {
        async fn fetch(&self, table: &Pubkey) -> Result<Vec<Pubkey>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.tables
                .get(table)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("table inconnue"))
        }
    }

    fn lookup(table: Pubkey, writable: Vec<u8>, readonly: Vec<u8>) -> TableLookup {
        TableLookup {
            table,
            writable_indexes: writable,
            readonly_indexes: readonly,
        }
    }

    #[test]
    fn boundary_between_static_and_table() {
        let table = Pubkey::new_unique();
        let lookups = vec![lookup(table, vec![7, 8], vec![9])];

        // Dernier index statique : accès direct.
        assert_eq!(
            classify_index(3, 4, &lookups).unwrap(),
            AccountRef::Static(3)
        );
        // Premier index au-delà : première entrée writable de la table.
        assert_eq!(
            classify_index(4, 4, &lookups).unwrap(),
            AccountRef::Table { table, index: 7 }
        );
        // Après les writable viennent les readonly.
        assert_eq!(
            classify_index(6, 4, &lookups).unwrap(),
            AccountRef::Table { table, index: 9 }
        );
        assert!(matches!(
            classify_index(7, 4, &lookups),
            Err(ResolveError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn writable_of_all_tables_precede_readonly() {
        let first = Pubkey::new_unique();
        let second = Pubkey::new_unique();
        let lookups = vec![
            lookup(first, vec![0], vec![1]),
            lookup(second, vec![2], vec![3]),
        ];
        // Ordre v0 : writable de chaque table, puis readonly de chaque table.
        assert_eq!(
            classify_index(1, 0, &lookups).unwrap(),
            AccountRef::Table {
                table: second,
                index: 2
            }
        );
        assert_eq!(
            classify_index(2, 0, &lookups).unwrap(),
            AccountRef::Table {
                table: first,
                index: 1
            }
        );
    }

    #[tokio::test]
    async fn static_resolution_checks_bounds() {
        let source = Arc::new(MemoryTableSource::new(HashMap::new()));
        let resolver = LookupResolver::new(source, 8);
        let keys = vec![Pubkey::new_unique(), Pubkey::new_unique()];

        assert_eq!(
            resolver
                .resolve(AccountRef::Static(1), &keys)
                .await
                .unwrap(),
            keys[1]
        );
        assert_eq!(
            resolver.resolve(AccountRef::Static(2), &keys).await,
            Err(ResolveError::OutOfBounds {
                index: 2,
                available: 2
            })
        );
    }

    #[tokio::test]
    async fn table_fetch_populates_cache() {
        let table = Pubkey::new_unique();
        let addresses = vec![Pubkey::new_unique(), Pubkey::new_unique()];
        let mut tables = HashMap::new();
        tables.insert(table, addresses.clone());
        let source = Arc::new(MemoryTableSource::new(tables));
        let resolver = LookupResolver::new(source.clone(), 8);

        let reference = AccountRef::Table { table, index: 1 };
        assert_eq!(
            resolver.resolve(reference, &[]).await.unwrap(),
            addresses[1]
        );
        // Deuxième résolution : servie par le cache, pas de nouveau fetch.
        assert_eq!(
            resolver.resolve(reference, &[]).await.unwrap(),
            addresses[1]
        );
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_table_fails_after_one_retry() {
        let source = Arc::new(MemoryTableSource::new(HashMap::new()));
        let resolver = LookupResolver::new(source.clone(), 8);
        let table = Pubkey::new_unique();

        let err = resolver
            .resolve(AccountRef::Table { table, index: 0 }, &[])
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::TableUnavailable(table));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lru_evicts_the_coldest_table() {
        let tables: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
        let mut map = HashMap::new();
        for table in &tables {
            map.insert(*table, vec![Pubkey::new_unique()]);
        }
        let source = Arc::new(MemoryTableSource::new(map));
        let resolver = LookupResolver::new(source.clone(), 2);

        for table in &tables {
            resolver
                .resolve(AccountRef::Table { table: *table, index: 0 }, &[])
                .await
                .unwrap();
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);

        // La table 0, la plus froide, a été évincée : la résoudre refait un fetch.
        resolver
            .resolve(AccountRef::Table { table: tables[0], index: 0 }, &[])
            .await
            .unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);

        // La table 2 est encore chaude : pas de fetch supplémentaire.
        resolver
            .resolve(AccountRef::Table { table: tables[2], index: 0 }, &[])
            .await
            .unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
    }
}
