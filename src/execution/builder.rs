// DANS : src/execution/builder.rs
//
// Construction des transactions de swap. Chaque transaction est
// autosuffisante : elle crée les comptes associés dont elle a besoin,
// enveloppe ou désenveloppe le SOL, et referme le compte WSOL derrière
// elle pour récupérer le rent.

use crate::decoders::raydium_amm::create_swap_base_in_instruction;
use crate::ledger::TradeDirection;
use crate::state::PoolRecord;
use anyhow::{Context, Result, bail};
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{VersionedMessage, v0};
use solana_sdk::packet::PACKET_DATA_SIZE;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use std::sync::Arc;

const SWAP_CU_LIMIT: u32 = 160_000;
const SWAP_CU_PRICE_MICRO_LAMPORTS: u64 = 100_000;
// On accepte n'importe quelle sortie : sur ce créneau, la vitesse prime
// sur la protection de slippage.
const MIN_AMOUNT_OUT: u64 = 1;

/// Ce que le worker demande au constructeur.
pub struct SwapPlan<'a> {
    pub record: &'a PoolRecord,
    pub direction: TradeDirection,
    pub amount_in: u64,
    pub blockhash: Hash,
    /// `(compte, lamports)` pour les canaux relai.
    pub tip: Option<(Pubkey, u64)>,
}

pub struct TransactionBuilder {
    payer: Arc<Keypair>,
}

impl TransactionBuilder {
    pub fn new(payer: Arc<Keypair>) -> Self {
        Self { payer }
    }

    pub fn payer_pubkey(&self) -> Pubkey {
        self.payer.pubkey()
    }

    pub fn build_swap(&self, plan: &SwapPlan<'_>) -> Result<VersionedTransaction> {
        if !plan.record.market_is_hydrated() {
            bail!(
                "clés de marché non hydratées pour le pool {}",
                plan.record.address
            );
        }

        let payer = self.payer.pubkey();
        let wsol_mint = spl_token::native_mint::id();
        let wsol_ata = get_associated_token_address(&payer, &wsol_mint);
        let token_ata = get_associated_token_address(&payer, &plan.record.token_mint);
        let keys = plan.record.swap_keys();

        let mut instructions: Vec<Instruction> = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(SWAP_CU_LIMIT),
            ComputeBudgetInstruction::set_compute_unit_price(SWAP_CU_PRICE_MICRO_LAMPORTS),
        ];

        match plan.direction {
            TradeDirection::Buy => {
                instructions.push(create_associated_token_account_idempotent(
                    &payer,
                    &payer,
                    &wsol_mint,
                    &spl_token::id(),
                ));
                instructions.push(system_instruction::transfer(
                    &payer,
                    &wsol_ata,
                    plan.amount_in,
                ));
                instructions.push(spl_token::instruction::sync_native(
                    &spl_token::id(),
                    &wsol_ata,
                )?);
                instructions.push(create_associated_token_account_idempotent(
                    &payer,
                    &payer,
                    &plan.record.token_mint,
                    &spl_token::id(),
                ));
                instructions.push(create_swap_base_in_instruction(
                    &keys,
                    &wsol_ata,
                    &token_ata,
                    &payer,
                    plan.amount_in,
                    MIN_AMOUNT_OUT,
                ));
            }
            TradeDirection::Sell => {
                instructions.push(create_associated_token_account_idempotent(
                    &payer,
                    &payer,
                    &wsol_mint,
                    &spl_token::id(),
                ));
                instructions.push(create_swap_base_in_instruction(
                    &keys,
                    &token_ata,
                    &wsol_ata,
                    &payer,
                    plan.amount_in,
                    MIN_AMOUNT_OUT,
                ));
            }
        }

        // Fermer le compte WSOL récupère le rent et, sur une vente,
        // désenveloppe le produit vers le portefeuille.
        instructions.push(spl_token::instruction::close_account(
            &spl_token::id(),
            &wsol_ata,
            &payer,
            &payer,
            &[],
        )?);

        if let Some((tip_account, lamports)) = plan.tip {
            instructions.push(system_instruction::transfer(
                &payer,
                &tip_account,
                lamports,
            ));
        }

        let message = v0::Message::try_compile(&payer, &instructions, &[], plan.blockhash)
            .context("Compilation du message v0 impossible")?;
        let transaction =
            VersionedTransaction::try_new(VersionedMessage::V0(message), &[self.payer.as_ref()])
                .context("Signature de la transaction impossible")?;

        let size = bincode::serialize(&transaction)?.len();
        if size > PACKET_DATA_SIZE {
            bail!("transaction de {size} octets au-delà de la limite de {PACKET_DATA_SIZE}");
        }
        Ok(transaction)
    }
}
