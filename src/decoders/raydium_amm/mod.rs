// DANS : src/decoders/raydium_amm/mod.rs

pub mod instructions;
pub mod layouts;

use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::pubkey;

use instructions::AmmInstruction;

pub const RAYDIUM_AMM_V4_PROGRAM_ID: Pubkey =
    pubkey!("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");

/// Le DEX Serum v3 historique. Les pools dont le marché vit encore sous ce
/// programme émettent des swaps avec une liste de comptes raccourcie d'un
/// élément (pas de `target_orders`), d'où le double jeu d'offsets plus bas.
pub const LEGACY_MARKET_PROGRAM: Pubkey =
    pubkey!("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin");

/// OpenBook, le fork actuel de Serum utilisé par les pools récents.
pub const OPENBOOK_MARKET_PROGRAM: Pubkey =
    pubkey!("srmqPvymJeFKQ4zGQed1GFppgkRHL9kaELCbyksJtPX");

const AMM_AUTHORITY_SEED: &[u8] = b"amm authority";

/// Dérive l'autorité PDA commune à tous les pools AMM v4.
pub fn amm_authority() -> Pubkey {
    Pubkey::find_program_address(&[AMM_AUTHORITY_SEED], &RAYDIUM_AMM_V4_PROGRAM_ID).0
}

// --- POSITIONS DES COMPTES DANS LES LISTES D'INSTRUCTIONS ---

/// Comptes d'une `initialize2`, tels qu'ordonnés par le programme on-chain.
pub mod initialize2_accounts {
    pub const AMM: usize = 4;
    pub const AMM_AUTHORITY: usize = 5;
    pub const OPEN_ORDERS: usize = 6;
    pub const LP_MINT: usize = 7;
    pub const COIN_MINT: usize = 8;
    pub const PC_MINT: usize = 9;
    pub const COIN_VAULT: usize = 10;
    pub const PC_VAULT: usize = 11;
    pub const TARGET_ORDERS: usize = 12;
    pub const MARKET_PROGRAM: usize = 15;
    pub const MARKET: usize = 16;
    pub const USER_WALLET: usize = 17;
    /// Le plus grand index lu ci-dessus, borne de validation.
    pub const MIN_ACCOUNTS: usize = 18;
}

/// Comptes d'un `deposit` / `withdraw` : seul l'identifiant du pool nous
/// intéresse, il occupe la même position dans les deux instructions.
pub mod liquidity_accounts {
    pub const AMM: usize = 1;
    pub const MIN_ACCOUNTS: usize = 2;
}

/// Comptes d'un swap (base-in comme base-out).
pub mod swap_accounts {
    pub const AMM: usize = 1;
    pub const MARKET_PROGRAM: usize = 7;
    /// Offset des comptes utilisateur dans la forme moderne (18 comptes).
    pub const USER_BASE: usize = 15;
    /// Offset des comptes utilisateur dans la forme Serum v3 (17 comptes).
    pub const USER_BASE_LEGACY: usize = 14;
    pub const MIN_ACCOUNTS: usize = 17;
}

/// Les trois comptes utilisateur d'un swap : source, destination, signataire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapUserAccounts {
    pub source: Pubkey,
    pub destination: Pubkey,
    pub owner: Pubkey,
}

/// Extrait les comptes utilisateur d'une liste résolue de comptes de swap.
/// La présence du programme Serum v3 historique signale la forme courte.
pub fn swap_user_accounts(accounts: &[Pubkey]) -> Option<SwapUserAccounts> {
    let legacy = accounts.contains(&LEGACY_MARKET_PROGRAM);
    let base = if legacy {
        swap_accounts::USER_BASE_LEGACY
    } else {
        swap_accounts::USER_BASE
    };
    if accounts.len() < base + 3 {
        return None;
    }
    Some(SwapUserAccounts {
        source: accounts[base],
        destination: accounts[base + 1],
        owner: accounts[base + 2],
    })
}

// --- CONSTRUCTION D'INSTRUCTIONS ---

/// Toutes les adresses nécessaires pour émettre un swap sur un pool donné.
/// Le constructeur de transactions les tire du `PoolRecord` suivi.
#[derive(Debug, Clone)]
pub struct SwapKeys {
    pub amm: Pubkey,
    pub open_orders: Pubkey,
    pub target_orders: Pubkey,
    pub coin_vault: Pubkey,
    pub pc_vault: Pubkey,
    pub market_program: Pubkey,
    pub market: Pubkey,
    pub market_bids: Pubkey,
    pub market_asks: Pubkey,
    pub market_event_queue: Pubkey,
    pub market_coin_vault: Pubkey,
    pub market_pc_vault: Pubkey,
    pub market_vault_signer: Pubkey,
}

/// Construit l'instruction `swap_base_in` (forme moderne à 18 comptes).
pub fn create_swap_base_in_instruction(
    keys: &SwapKeys,
    user_source: &Pubkey,
    user_destination: &Pubkey,
    user_owner: &Pubkey,
    amount_in: u64,
    minimum_amount_out: u64,
) -> Instruction {
    let data = AmmInstruction::SwapBaseIn {
        amount_in,
        minimum_amount_out,
    }
    .encode();

    let accounts = vec![
        AccountMeta::new_readonly(spl_token::id(), false),
        AccountMeta::new(keys.amm, false),
        AccountMeta::new_readonly(amm_authority(), false),
        AccountMeta::new(keys.open_orders, false),
        AccountMeta::new(keys.target_orders, false),
        AccountMeta::new(keys.coin_vault, false),
        AccountMeta::new(keys.pc_vault, false),
        AccountMeta::new_readonly(keys.market_program, false),
        AccountMeta::new(keys.market, false),
        AccountMeta::new(keys.market_bids, false),
        AccountMeta::new(keys.market_asks, false),
        AccountMeta::new(keys.market_event_queue, false),
        AccountMeta::new(keys.market_coin_vault, false),
        AccountMeta::new(keys.market_pc_vault, false),
        AccountMeta::new_readonly(keys.market_vault_signer, false),
        AccountMeta::new(*user_source, false),
        AccountMeta::new(*user_destination, false),
        AccountMeta::new_readonly(*user_owner, true),
    ];

    Instruction {
        program_id: RAYDIUM_AMM_V4_PROGRAM_ID,
        accounts,
        data,
    }
}
