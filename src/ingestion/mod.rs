// DANS : src/ingestion/mod.rs
//
// Le type d'événement qui circule dans tout le pipeline, et sa construction
// depuis le protobuf Yellowstone. Un événement est construit une fois par
// transaction observée, puis déplacé par valeur jusqu'au dispatcher.

use solana_sdk::hash::Hash;
use solana_sdk::instruction::InstructionError;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::TransactionError;
use std::fmt;
use yellowstone_grpc_proto::prelude::SubscribeUpdateTransaction;

pub mod dedup;
pub mod logs_source;
pub mod multiplexer;
pub mod source;

/// Identité d'une source du fan-in (indice dans la liste configurée).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u8);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Une instruction compilée, top-level ou interne.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

/// Référence d'une table de correspondance portée par le message v0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLookup {
    pub table: Pubkey,
    pub writable_indexes: Vec<u8>,
    pub readonly_indexes: Vec<u8>,
}

/// Variation nette du solde d'un compte de token sur la transaction,
/// en unités brutes du mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalanceDelta {
    pub account_index: u8,
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub decimals: u8,
    pub delta: i128,
}

/// Une transaction observée, mise à plat pour le pipeline.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub source: SourceId,
    pub signature: Signature,
    pub slot: u64,
    pub recent_blockhash: Hash,
    pub account_keys: Vec<Pubkey>,
    pub instructions: Vec<RawInstruction>,
    /// Groupes d'instructions internes, indexés par l'instruction top-level.
    pub inner_instructions: Vec<(u8, Vec<RawInstruction>)>,
    pub balance_deltas: Vec<TokenBalanceDelta>,
    pub failed: bool,
    /// Code d'erreur custom du programme, si la transaction a échoué dessus.
    pub error_code: Option<u32>,
    pub loaded_writable: Vec<Pubkey>,
    pub loaded_readonly: Vec<Pubkey>,
    pub table_lookups: Vec<TableLookup>,
}

impl RawEvent {
    /// Le programme invoqué par une instruction. Les identifiants de
    /// programme sont toujours dans les clés statiques, jamais en table.
    pub fn program_id(&self, instruction: &RawInstruction) -> Option<&Pubkey> {
        self.account_keys.get(instruction.program_id_index as usize)
    }

    /// Toutes les instructions adressées à `program`, top-level puis internes,
    /// dans l'ordre d'exécution.
    pub fn instructions_for(&self, program: &Pubkey) -> Vec<&RawInstruction> {
        let mut matched = Vec::new();
        for (top_index, instruction) in self.instructions.iter().enumerate() {
            if self.program_id(instruction) == Some(program) {
                matched.push(instruction);
            }
            for (group_index, group) in &self.inner_instructions {
                if *group_index as usize == top_index {
                    for inner in group {
                        if self.program_id(inner) == Some(program) {
                            matched.push(inner);
                        }
                    }
                }
            }
        }
        matched
    }

    /// Construit l'événement depuis une mise à jour Geyser. Retourne `None`
    /// pour les payloads incomplets ou malformés, que l'on ignore.
    pub fn from_geyser(update: SubscribeUpdateTransaction, source: SourceId) -> Option<Self> {
        let info = update.transaction?;
        let transaction = info.transaction?;
        let message = transaction.message?;

        let signature = Signature::try_from(info.signature.as_slice()).ok()?;
        let recent_blockhash = <[u8; 32]>::try_from(message.recent_blockhash.as_slice())
            .map(Hash::new_from_array)
            .ok()?;

        let mut account_keys = Vec::with_capacity(message.account_keys.len());
        for key in &message.account_keys {
            account_keys.push(Pubkey::try_from(key.as_slice()).ok()?);
        }

        let instructions = message
            .instructions
            .into_iter()
            .map(|ix| RawInstruction {
                program_id_index: ix.program_id_index as u8,
                accounts: ix.accounts,
                data: ix.data,
            })
            .collect();

        let mut table_lookups = Vec::with_capacity(message.address_table_lookups.len());
        for lookup in message.address_table_lookups {
            table_lookups.push(TableLookup {
                table: Pubkey::try_from(lookup.account_key.as_slice()).ok()?,
                writable_indexes: lookup.writable_indexes,
                readonly_indexes: lookup.readonly_indexes,
            });
        }

        let mut event = RawEvent {
            source,
            signature,
            slot: update.slot,
            recent_blockhash,
            account_keys,
            instructions,
            inner_instructions: Vec::new(),
            balance_deltas: Vec::new(),
            failed: false,
            error_code: None,
            loaded_writable: Vec::new(),
            loaded_readonly: Vec::new(),
            table_lookups,
        };

        if let Some(meta) = info.meta {
            event.failed = meta.err.is_some();
            event.error_code = meta
                .err
                .as_ref()
                .and_then(|err| custom_error_code(&err.err));
            event.loaded_writable = parse_keys(&meta.loaded_writable_addresses);
            event.loaded_readonly = parse_keys(&meta.loaded_readonly_addresses);

            for group in meta.inner_instructions {
                let inner = group
                    .instructions
                    .into_iter()
                    .map(|ix| RawInstruction {
                        program_id_index: ix.program_id_index as u8,
                        accounts: ix.accounts,
                        data: ix.data,
                    })
                    .collect();
                event.inner_instructions.push((group.index as u8, inner));
            }

            event.balance_deltas =
                balance_deltas(&meta.pre_token_balances, &meta.post_token_balances);
        }

        Some(event)
    }
}

fn parse_keys(raw: &[Vec<u8>]) -> Vec<Pubkey> {
    raw.iter()
        .filter_map(|key| Pubkey::try_from(key.as_slice()).ok())
        .collect()
}

/// Le protobuf transporte l'erreur de transaction telle que le validateur la
/// sérialise (bincode). Seuls les codes custom des programmes nous servent.
fn custom_error_code(raw: &[u8]) -> Option<u32> {
    match bincode::deserialize::<TransactionError>(raw).ok()? {
        TransactionError::InstructionError(_, InstructionError::Custom(code)) => Some(code),
        _ => None,
    }
}

pub(crate) fn balance_deltas(
    pre: &[yellowstone_grpc_proto::prelude::TokenBalance],
    post: &[yellowstone_grpc_proto::prelude::TokenBalance],
) -> Vec<TokenBalanceDelta> {
    use std::collections::HashMap;
    use std::str::FromStr;

    struct Entry {
        mint: Pubkey,
        owner: Pubkey,
        decimals: u8,
        amount: i128,
    }

    fn entry(balance: &yellowstone_grpc_proto::prelude::TokenBalance) -> Option<(u8, Entry)> {
        let amount = balance.ui_token_amount.as_ref()?;
        Some((
            u8::try_from(balance.account_index).ok()?,
            Entry {
                mint: Pubkey::from_str(&balance.mint).ok()?,
                owner: Pubkey::from_str(&balance.owner).ok()?,
                decimals: u8::try_from(amount.decimals).ok()?,
                amount: amount.amount.parse::<i128>().ok()?,
            },
        ))
    }

    let mut pre_by_index: HashMap<u8, Entry> = pre.iter().filter_map(entry).collect();
    let mut deltas = Vec::new();

    for balance in post {
        let Some((index, after)) = entry(balance) else {
            continue;
        };
        let before = pre_by_index.remove(&index).map_or(0, |e| e.amount);
        deltas.push(TokenBalanceDelta {
            account_index: index,
            mint: after.mint,
            owner: after.owner,
            decimals: after.decimals,
            delta: after.amount - before,
        });
    }

    // Comptes présents avant mais plus après : solde parti à zéro (fermés).
    for (index, before) in pre_by_index.drain() {
        deltas.push(TokenBalanceDelta {
            account_index: index,
            mint: before.mint,
            owner: before.owner,
            decimals: before.decimals,
            delta: -before.amount,
        });
    }

    deltas.sort_by_key(|delta| delta.account_index);
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use yellowstone_grpc_proto::prelude::{TokenBalance, UiTokenAmount};

    fn token_balance(index: u32, mint: &Pubkey, owner: &Pubkey, amount: &str) -> TokenBalance {
        TokenBalance {
            account_index: index,
            mint: mint.to_string(),
            ui_token_amount: Some(UiTokenAmount {
                ui_amount: 0.0,
                decimals: 6,
                amount: amount.to_string(),
                ui_amount_string: String::new(),
            }),
            owner: owner.to_string(),
            program_id: spl_token::id().to_string(),
        }
    }

    #[test]
    fn deltas_cover_created_changed_and_closed_accounts() {
        let mint = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let pre = vec![
            token_balance(1, &mint, &owner, "500"),
            token_balance(2, &mint, &owner, "100"),
        ];
        let post = vec![
            token_balance(1, &mint, &owner, "200"),
            token_balance(3, &mint, &owner, "700"),
        ];

        let deltas = balance_deltas(&pre, &post);
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].account_index, 1);
        assert_eq!(deltas[0].delta, -300);
        assert_eq!(deltas[1].account_index, 2);
        assert_eq!(deltas[1].delta, -100);
        assert_eq!(deltas[2].account_index, 3);
        assert_eq!(deltas[2].delta, 700);
    }

    #[test]
    fn custom_error_code_is_extracted() {
        let error = TransactionError::InstructionError(2, InstructionError::Custom(38));
        let raw = bincode::serialize(&error).unwrap();
        assert_eq!(custom_error_code(&raw), Some(38));

        let other = TransactionError::AccountNotFound;
        let raw = bincode::serialize(&other).unwrap();
        assert_eq!(custom_error_code(&raw), None);
    }
}
