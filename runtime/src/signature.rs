//! Signature coverage.
//!
//! SIGN covers every instruction of the transaction; SIGNTO at position `j`
//! covers only the instructions before it. All signatures are verified
//! before the first instruction runs.

use alloc::vec::Vec;

use crate::instruction::{Instruction, Tx};
use crate::output::Address;
use crate::VmError;

/// Checks a signature over a 32-byte message.
pub trait SignatureVerifier {
    fn verify(&self, sig: &[u8], msg: &[u8; 32], pubkey: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Coverage {
    signer: Address,
    /// Instructions `[0, upto)` are covered.
    upto: usize,
}

/// Verified signers of one transaction.
#[derive(Debug, Clone, Default)]
pub struct SignerTable {
    entries: Vec<Coverage>,
}

impl SignerTable {
    /// Verify every SIGN/SIGNTO. A bad signature fails at its own index.
    pub fn verify(tx: &Tx, verifier: &dyn SignatureVerifier) -> core::result::Result<Self, (usize, VmError)> {
        let mut entries = Vec::new();
        let total = tx.instructions.len();
        for (idx, ix) in tx.instructions.iter().enumerate() {
            let (sig, pubkey, upto) = match ix {
                Instruction::Sign { sig, pubkey } => (sig, pubkey, total),
                Instruction::SignTo { sig, pubkey } => (sig, pubkey, idx),
                _ => continue,
            };
            let msg = tx.sighash(Some(upto));
            if !verifier.verify(sig, &msg, pubkey) {
                return Err((
                    idx,
                    VmError::Auth(alloc::format!(
                        "invalid signature from {}",
                        Address::from_pubkey(pubkey)
                    )),
                ));
            }
            entries.push(Coverage {
                signer: Address::from_pubkey(pubkey),
                upto,
            });
        }
        Ok(SignerTable { entries })
    }

    /// Addresses whose signatures cover instruction `idx`.
    pub fn signers_for(&self, idx: usize) -> Vec<Address> {
        let mut signers: Vec<Address> = Vec::new();
        for entry in self.entries.iter().filter(|e| idx < e.upto) {
            if !signers.contains(&entry.signer) {
                signers.push(entry.signer);
            }
        }
        signers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
