// DANS : src/decoders/mod.rs

use thiserror::Error;

pub mod raydium_amm;
pub mod serum_market;

pub use raydium_amm::instructions::AmmInstruction;
pub use raydium_amm::layouts::AmmAccount;

/// Erreurs du codec binaire. Les appelants doivent pouvoir les distinguer :
/// un événement indécodable est compté puis abandonné, jamais propagé plus haut.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("tampon trop court ({actual} bytes reçus, {expected} attendus)")]
    ShortBuffer { expected: usize, actual: usize },
    #[error("discriminateur d'instruction inconnu ({0})")]
    UnknownDiscriminator(u8),
    #[error("{0} bytes excédentaires après le dernier champ")]
    TrailingBytes(usize),
    #[error("taille de compte inconnue ({0} bytes)")]
    UnknownAccountLength(usize),
    #[error("signataire de vault du marché non dérivable")]
    InvalidVaultSigner,
}
