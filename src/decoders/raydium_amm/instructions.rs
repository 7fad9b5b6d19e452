// DANS : src/decoders/raydium_amm/instructions.rs

use crate::decoders::DecodeError;

// Tags d'instruction du programme AMM v4 (premier byte des données).
const TAG_INITIALIZE2: u8 = 1;
const TAG_DEPOSIT: u8 = 3;
const TAG_WITHDRAW: u8 = 4;
const TAG_SWAP_BASE_IN: u8 = 9;
const TAG_SWAP_BASE_OUT: u8 = 11;

/// Les cinq instructions AMM v4 que le pipeline interprète. Tous les champs
/// sont en little-endian à largeur fixe derrière un tag d'un byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmmInstruction {
    Initialize2 {
        nonce: u8,
        open_time: u64,
        init_pc_amount: u64,
        init_coin_amount: u64,
    },
    Deposit {
        max_coin_amount: u64,
        max_pc_amount: u64,
        base_side: u64,
    },
    Withdraw {
        amount: u64,
    },
    SwapBaseIn {
        amount_in: u64,
        minimum_amount_out: u64,
    },
    SwapBaseOut {
        max_amount_in: u64,
        amount_out: u64,
    },
}

/// Curseur de lecture sans allocation sur les données d'une instruction.
struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or(DecodeError::ShortBuffer {
                expected: self.offset + 1,
                actual: self.data.len(),
            })?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let end = self.offset + 8;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or(DecodeError::ShortBuffer {
                expected: end,
                actual: self.data.len(),
            })?;
        self.offset = end;
        let bytes: [u8; 8] = slice.try_into().map_err(|_| DecodeError::ShortBuffer {
            expected: end,
            actual: self.data.len(),
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Vérifie que tout le tampon a été consommé.
    fn finish(self) -> Result<(), DecodeError> {
        let remaining = self.data.len() - self.offset;
        if remaining > 0 {
            return Err(DecodeError::TrailingBytes(remaining));
        }
        Ok(())
    }
}

impl AmmInstruction {
    /// Décode les données brutes d'une instruction AMM v4.
    /// `decode(encode(v)) == v` pour toutes les variantes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, rest) = data.split_first().ok_or(DecodeError::ShortBuffer {
            expected: 1,
            actual: 0,
        })?;
        let mut reader = ByteReader::new(rest);
        let decoded = match tag {
            TAG_INITIALIZE2 => AmmInstruction::Initialize2 {
                nonce: reader.read_u8()?,
                open_time: reader.read_u64()?,
                init_pc_amount: reader.read_u64()?,
                init_coin_amount: reader.read_u64()?,
            },
            TAG_DEPOSIT => AmmInstruction::Deposit {
                max_coin_amount: reader.read_u64()?,
                max_pc_amount: reader.read_u64()?,
                base_side: reader.read_u64()?,
            },
            TAG_WITHDRAW => AmmInstruction::Withdraw {
                amount: reader.read_u64()?,
            },
            TAG_SWAP_BASE_IN => AmmInstruction::SwapBaseIn {
                amount_in: reader.read_u64()?,
                minimum_amount_out: reader.read_u64()?,
            },
            TAG_SWAP_BASE_OUT => AmmInstruction::SwapBaseOut {
                max_amount_in: reader.read_u64()?,
                amount_out: reader.read_u64()?,
            },
            other => return Err(DecodeError::UnknownDiscriminator(other)),
        };
        reader.finish()?;
        Ok(decoded)
    }

    /// Encode l'instruction vers sa forme on-chain, inverse structurel de `decode`.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            AmmInstruction::Initialize2 {
                nonce,
                open_time,
                init_pc_amount,
                init_coin_amount,
            } => {
                let mut data = vec![TAG_INITIALIZE2, nonce];
                data.extend_from_slice(&open_time.to_le_bytes());
                data.extend_from_slice(&init_pc_amount.to_le_bytes());
                data.extend_from_slice(&init_coin_amount.to_le_bytes());
                data
            }
            AmmInstruction::Deposit {
                max_coin_amount,
                max_pc_amount,
                base_side,
            } => {
                let mut data = vec![TAG_DEPOSIT];
                data.extend_from_slice(&max_coin_amount.to_le_bytes());
                data.extend_from_slice(&max_pc_amount.to_le_bytes());
                data.extend_from_slice(&base_side.to_le_bytes());
                data
            }
            AmmInstruction::Withdraw { amount } => {
                let mut data = vec![TAG_WITHDRAW];
                data.extend_from_slice(&amount.to_le_bytes());
                data
            }
            AmmInstruction::SwapBaseIn {
                amount_in,
                minimum_amount_out,
            } => {
                let mut data = vec![TAG_SWAP_BASE_IN];
                data.extend_from_slice(&amount_in.to_le_bytes());
                data.extend_from_slice(&minimum_amount_out.to_le_bytes());
                data
            }
            AmmInstruction::SwapBaseOut {
                max_amount_in,
                amount_out,
            } => {
                let mut data = vec![TAG_SWAP_BASE_OUT];
                data.extend_from_slice(&max_amount_in.to_le_bytes());
                data.extend_from_slice(&amount_out.to_le_bytes());
                data
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<AmmInstruction> {
        vec![
            AmmInstruction::Initialize2 {
                nonce: 254,
                open_time: 1_755_000_000,
                init_pc_amount: 5_000_000_000,
                init_coin_amount: u64::MAX / 3,
            },
            AmmInstruction::Deposit {
                max_coin_amount: 42,
                max_pc_amount: 0,
                base_side: 1,
            },
            AmmInstruction::Withdraw { amount: 123_456_789 },
            AmmInstruction::SwapBaseIn {
                amount_in: 1_000_000_000,
                minimum_amount_out: 1,
            },
            AmmInstruction::SwapBaseOut {
                max_amount_in: u64::MAX,
                amount_out: 777,
            },
        ]
    }

    #[test]
    fn round_trip_every_variant() {
        for instruction in all_variants() {
            let encoded = instruction.encode();
            let decoded = AmmInstruction::decode(&encoded).unwrap();
            assert_eq!(decoded, instruction);
        }
    }

    #[test]
    fn empty_buffer_is_short() {
        assert_eq!(
            AmmInstruction::decode(&[]),
            Err(DecodeError::ShortBuffer {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn truncated_field_is_short() {
        // Un withdraw tronqué au milieu de son u64.
        let err = AmmInstruction::decode(&[4, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer { .. }));
    }

    #[test]
    fn unknown_tag_is_reported() {
        let mut data = vec![2u8];
        data.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            AmmInstruction::decode(&data),
            Err(DecodeError::UnknownDiscriminator(2))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = AmmInstruction::Withdraw { amount: 9 }.encode();
        encoded.push(0);
        assert_eq!(
            AmmInstruction::decode(&encoded),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn known_swap_base_in_bytes() {
        // Vecteur de référence : tag 9 puis deux u64 little-endian.
        let encoded = AmmInstruction::SwapBaseIn {
            amount_in: 0x0102030405060708,
            minimum_amount_out: 1,
        }
        .encode();
        assert_eq!(encoded.len(), 17);
        assert_eq!(encoded[0], 9);
        assert_eq!(&encoded[1..9], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&encoded[9..17], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }
}
