// DANS : src/decoders/raydium_amm/layouts.rs
//
// Les trois comptes à taille fixe du programme AMM v4. Le schéma n'a pas de
// discriminateur : c'est la longueur exacte du compte qui identifie le layout.

use crate::decoders::DecodeError;
use bytemuck::{Pod, Zeroable, bytes_of, from_bytes};
use solana_sdk::pubkey::Pubkey;
use std::mem::size_of;

pub const POOL_STATE_LEN: usize = size_of::<PoolStateLayout>();
pub const FEES_LEN: usize = size_of::<FeesLayout>();
pub const TARGET_ORDERS_LEN: usize = size_of::<TargetOrdersLayout>();

// Tailles on-chain. Une dérive d'un seul byte casserait le dispatch par
// longueur, donc on les fige à la compilation.
const _: () = assert!(POOL_STATE_LEN == 752);
const _: () = assert!(FEES_LEN == 64);
const _: () = assert!(TARGET_ORDERS_LEN == 2208);

/// Les paramètres de frais embarqués dans l'état du pool, publiés aussi
/// comme compte autonome de 64 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct FeesLayout {
    pub min_separate_numerator: u64,
    pub min_separate_denominator: u64,
    pub trade_fee_numerator: u64,
    pub trade_fee_denominator: u64,
    pub pnl_numerator: u64,
    pub pnl_denominator: u64,
    pub swap_fee_numerator: u64,
    pub swap_fee_denominator: u64,
}

/// Compteurs de PnL et de volume tenus par le programme dans l'état du pool.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct StateDataLayout {
    pub need_take_pnl_coin: u64,
    pub need_take_pnl_pc: u64,
    pub total_pnl_pc: u64,
    pub total_pnl_coin: u64,
    pub pool_open_time: u64,
    pub punish_pc_amount: u64,
    pub punish_coin_amount: u64,
    pub orderbook_to_init_time: u64,
    pub swap_coin_in_amount: u128,
    pub swap_pc_out_amount: u128,
    pub swap_acc_pc_fee: u64,
    pub swap_pc_in_amount: u128,
    pub swap_coin_out_amount: u128,
    pub swap_acc_coin_fee: u64,
}

/// L'état complet d'un pool AMM v4 (752 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct PoolStateLayout {
    pub status: u64,
    pub nonce: u64,
    pub order_num: u64,
    pub depth: u64,
    pub coin_decimals: u64,
    pub pc_decimals: u64,
    pub state: u64,
    pub reset_flag: u64,
    pub min_size: u64,
    pub vol_max_cut_ratio: u64,
    pub amount_wave: u64,
    pub coin_lot_size: u64,
    pub pc_lot_size: u64,
    pub min_price_multiplier: u64,
    pub max_price_multiplier: u64,
    pub sys_decimal_value: u64,
    pub fees: FeesLayout,
    pub state_data: StateDataLayout,
    pub coin_vault: Pubkey,
    pub pc_vault: Pubkey,
    pub coin_mint: Pubkey,
    pub pc_mint: Pubkey,
    pub lp_mint: Pubkey,
    pub open_orders: Pubkey,
    pub market: Pubkey,
    pub market_program: Pubkey,
    pub target_orders: Pubkey,
    pub withdraw_queue: Pubkey,
    pub temp_lp_vault: Pubkey,
    pub amm_owner: Pubkey,
    pub lp_amount: u64,
    pub client_order_id: u64,
    pub padding: [u64; 2],
}

/// Un ordre planifié dans le carnet cible (prix et volume en lots).
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct TargetOrder {
    pub price: u64,
    pub vol: u64,
}

/// Le compte `target_orders` du pool (2208 bytes) : la planification des
/// ordres que l'AMM pose sur son marché OpenBook.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct TargetOrdersLayout {
    pub owner: [u64; 4],
    pub buy_orders: [TargetOrder; 50],
    pub padding1: [u64; 8],
    pub target_x: u128,
    pub target_y: u128,
    pub plan_x_buy: u128,
    pub plan_y_buy: u128,
    pub plan_x_sell: u128,
    pub plan_y_sell: u128,
    pub placed_x: u128,
    pub placed_y: u128,
    pub calc_pnl_x: u128,
    pub calc_pnl_y: u128,
    pub sell_orders: [TargetOrder; 50],
    pub padding2: [u64; 6],
    pub replace_buy_client_id: [u64; 10],
    pub replace_sell_client_id: [u64; 10],
    pub last_order_numerator: u64,
    pub last_order_denominator: u64,
    pub plan_orders_cur: u64,
    pub place_orders_cur: u64,
    pub valid_buy_order_num: u64,
    pub valid_sell_order_num: u64,
    pub padding3: [u64; 10],
    pub free_slot_bits: u128,
}

/// Un compte AMM v4 décodé, dispatché sur la longueur exacte du tampon.
#[derive(Debug, Clone)]
pub enum AmmAccount {
    Pool(PoolStateLayout),
    Fees(FeesLayout),
    TargetOrders(Box<TargetOrdersLayout>),
}

impl AmmAccount {
    /// Réinterprète les données d'un compte par sa longueur. La lecture est
    /// zero-copy, la copie vers le layout possédé se fait en sortie d'API.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        match data.len() {
            POOL_STATE_LEN => Ok(AmmAccount::Pool(*from_bytes(data))),
            FEES_LEN => Ok(AmmAccount::Fees(*from_bytes(data))),
            TARGET_ORDERS_LEN => Ok(AmmAccount::TargetOrders(Box::new(*from_bytes(data)))),
            other => Err(DecodeError::UnknownAccountLength(other)),
        }
    }

    /// Ré-émet les bytes exacts du compte, inverse byte à byte de `decode`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AmmAccount::Pool(layout) => bytes_of(layout).to_vec(),
            AmmAccount::Fees(layout) => bytes_of(layout).to_vec(),
            AmmAccount::TargetOrders(layout) => bytes_of(layout.as_ref()).to_vec(),
        }
    }
}

/// Vue empruntée de l'état d'un pool, pour les chemins chauds qui ne
/// gardent pas le layout.
pub fn pool_state(data: &[u8]) -> Result<&PoolStateLayout, DecodeError> {
    if data.len() != POOL_STATE_LEN {
        return Err(DecodeError::UnknownAccountLength(data.len()));
    }
    Ok(from_bytes(data))
}
