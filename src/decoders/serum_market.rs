// DANS : src/decoders/serum_market.rs
//
// En-tête d'un marché Serum/OpenBook v3. Le swap AMM v4 exige les comptes du
// marché (carnets, file d'événements, vaults, signataire) qui ne figurent pas
// dans l'état du pool : on les hydrate depuis ce compte-ci.

use crate::decoders::DecodeError;
use bytemuck::{Pod, Zeroable, cast, from_bytes};
use solana_sdk::pubkey::Pubkey;
use std::mem::size_of;

pub const MARKET_STATE_LEN: usize = size_of::<MarketStateLayout>();
const _: () = assert!(MARKET_STATE_LEN == 376);

// Les données du compte commencent par les 5 bytes ASCII "serum".
const HEAD_PADDING: usize = 5;

/// L'en-tête de marché v3, les adresses stockées en mots de 64 bits.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct MarketStateLayout {
    pub account_flags: u64,
    pub own_address: [u64; 4],
    pub vault_signer_nonce: u64,
    pub coin_mint: [u64; 4],
    pub pc_mint: [u64; 4],
    pub coin_vault: [u64; 4],
    pub coin_deposits_total: u64,
    pub coin_fees_accrued: u64,
    pub pc_vault: [u64; 4],
    pub pc_deposits_total: u64,
    pub pc_fees_accrued: u64,
    pub pc_dust_threshold: u64,
    pub req_q: [u64; 4],
    pub event_q: [u64; 4],
    pub bids: [u64; 4],
    pub asks: [u64; 4],
    pub coin_lot_size: u64,
    pub pc_lot_size: u64,
    pub fee_rate_bps: u64,
    pub referrer_rebates_accrued: u64,
}

/// Les comptes du marché dont le swap a besoin, adresses résolues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketKeys {
    pub bids: Pubkey,
    pub asks: Pubkey,
    pub event_queue: Pubkey,
    pub coin_vault: Pubkey,
    pub pc_vault: Pubkey,
    pub vault_signer: Pubkey,
}

/// Décode l'en-tête d'un compte de marché et dérive le signataire des vaults.
pub fn decode_market_keys(
    market: &Pubkey,
    market_program: &Pubkey,
    data: &[u8],
) -> Result<MarketKeys, DecodeError> {
    let body = data
        .get(HEAD_PADDING..HEAD_PADDING + MARKET_STATE_LEN)
        .ok_or(DecodeError::ShortBuffer {
            expected: HEAD_PADDING + MARKET_STATE_LEN,
            actual: data.len(),
        })?;
    let state: &MarketStateLayout = from_bytes(body);

    let vault_signer_nonce = state.vault_signer_nonce;
    let vault_signer = Pubkey::create_program_address(
        &[&market.to_bytes(), &vault_signer_nonce.to_le_bytes()],
        market_program,
    )
    .map_err(|_| DecodeError::InvalidVaultSigner)?;

    Ok(MarketKeys {
        bids: cast(state.bids),
        asks: cast(state.asks),
        event_queue: cast(state.event_q),
        coin_vault: cast(state.coin_vault),
        pc_vault: cast(state.pc_vault),
        vault_signer,
    })
}
