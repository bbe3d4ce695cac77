//! Instructions and transactions.
//!
//! Wire format of an instruction: `opcode u8 ‖ ULEB length ‖ args`. A
//! transaction is `version u16 ‖ ULEB count ‖ instructions`, and its hash is
//! blake3 over those bytes.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::codec::{read_str_seq, write_str_seq, BufReader, BufWriter};
use crate::output::{Address, Pointer};
use crate::{Result, VmError};

/// Current transaction format version.
pub const TX_VERSION: u16 = 1;

pub const SIG_LEN: usize = 64;
pub const PUBKEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Import = 0xA1,
    Load = 0xA2,
    LoadByOrigin = 0xA3,
    New = 0xB1,
    Call = 0xB2,
    Exec = 0xB3,
    ExecFunc = 0xB4,
    Fund = 0xC1,
    Lock = 0xC2,
    Deploy = 0xD1,
    Sign = 0xE1,
    SignTo = 0xE2,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0xA1 => OpCode::Import,
            0xA2 => OpCode::Load,
            0xA3 => OpCode::LoadByOrigin,
            0xB1 => OpCode::New,
            0xB2 => OpCode::Call,
            0xB3 => OpCode::Exec,
            0xB4 => OpCode::ExecFunc,
            0xC1 => OpCode::Fund,
            0xC2 => OpCode::Lock,
            0xD1 => OpCode::Deploy,
            0xE1 => OpCode::Sign,
            0xE2 => OpCode::SignTo,
            other => return Err(VmError::Codec(alloc::format!("unknown opcode {:#04x}", other))),
        })
    }
}

/// One transaction instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Import { pkg_id: [u8; 32] },
    Load { output_id: [u8; 32] },
    LoadByOrigin { origin: Pointer },
    New { idx: u16, export_idx: u16, args: Vec<u8> },
    Call { idx: u16, method_idx: u16, args: Vec<u8> },
    Exec { idx: u16, export_idx: u16, method_idx: u16, args: Vec<u8> },
    ExecFunc { idx: u16, export_idx: u16, args: Vec<u8> },
    Fund { idx: u16 },
    Lock { idx: u16, address: Address },
    Deploy { entries: Vec<String>, sources: BTreeMap<String, String> },
    Sign { sig: [u8; SIG_LEN], pubkey: [u8; PUBKEY_LEN] },
    SignTo { sig: [u8; SIG_LEN], pubkey: [u8; PUBKEY_LEN] },
}

impl Instruction {
    pub fn opcode(&self) -> OpCode {
        match self {
            Instruction::Import { .. } => OpCode::Import,
            Instruction::Load { .. } => OpCode::Load,
            Instruction::LoadByOrigin { .. } => OpCode::LoadByOrigin,
            Instruction::New { .. } => OpCode::New,
            Instruction::Call { .. } => OpCode::Call,
            Instruction::Exec { .. } => OpCode::Exec,
            Instruction::ExecFunc { .. } => OpCode::ExecFunc,
            Instruction::Fund { .. } => OpCode::Fund,
            Instruction::Lock { .. } => OpCode::Lock,
            Instruction::Deploy { .. } => OpCode::Deploy,
            Instruction::Sign { .. } => OpCode::Sign,
            Instruction::SignTo { .. } => OpCode::SignTo,
        }
    }

    pub fn is_signature(&self) -> bool {
        matches!(self, Instruction::Sign { .. } | Instruction::SignTo { .. })
    }

    /// Argument bytes, without opcode and length prefix.
    pub fn args_bytes(&self) -> Vec<u8> {
        let mut w = BufWriter::new();
        match self {
            Instruction::Import { pkg_id } => {
                w.write_fixed_bytes(pkg_id);
            }
            Instruction::Load { output_id } => {
                w.write_fixed_bytes(output_id);
            }
            Instruction::LoadByOrigin { origin } => origin.write(&mut w),
            Instruction::New { idx, export_idx, args } => {
                w.write_u16(*idx).write_u16(*export_idx).write_bytes(args);
            }
            Instruction::Call { idx, method_idx, args } => {
                w.write_u16(*idx).write_u16(*method_idx).write_bytes(args);
            }
            Instruction::Exec {
                idx,
                export_idx,
                method_idx,
                args,
            } => {
                w.write_u16(*idx)
                    .write_u16(*export_idx)
                    .write_u16(*method_idx)
                    .write_bytes(args);
            }
            Instruction::ExecFunc { idx, export_idx, args } => {
                w.write_u16(*idx).write_u16(*export_idx).write_bytes(args);
            }
            Instruction::Fund { idx } => {
                w.write_u16(*idx);
            }
            Instruction::Lock { idx, address } => {
                w.write_u16(*idx).write_fixed_bytes(address.as_bytes());
            }
            Instruction::Deploy { entries, sources } => {
                write_str_seq(&mut w, entries);
                w.write_uleb(sources.len() as u64);
                for (name, src) in sources {
                    w.write_string(name).write_string(src);
                }
            }
            Instruction::Sign { sig, pubkey } | Instruction::SignTo { sig, pubkey } => {
                w.write_fixed_bytes(sig).write_fixed_bytes(pubkey);
            }
        }
        w.into_bytes()
    }

    pub fn write(&self, w: &mut BufWriter) {
        w.write_u8(self.opcode() as u8);
        w.write_bytes(&self.args_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BufWriter::new();
        self.write(&mut w);
        w.into_bytes()
    }

    pub fn read(r: &mut BufReader<'_>) -> Result<Self> {
        let opcode = OpCode::from_u8(r.read_u8()?)?;
        let args = r.read_bytes()?;
        let mut a = BufReader::new(args);
        let ix = match opcode {
            OpCode::Import => Instruction::Import {
                pkg_id: a.read_array()?,
            },
            OpCode::Load => Instruction::Load {
                output_id: a.read_array()?,
            },
            OpCode::LoadByOrigin => Instruction::LoadByOrigin {
                origin: Pointer::read(&mut a)?,
            },
            OpCode::New => Instruction::New {
                idx: a.read_u16()?,
                export_idx: a.read_u16()?,
                args: a.read_bytes()?.to_vec(),
            },
            OpCode::Call => Instruction::Call {
                idx: a.read_u16()?,
                method_idx: a.read_u16()?,
                args: a.read_bytes()?.to_vec(),
            },
            OpCode::Exec => Instruction::Exec {
                idx: a.read_u16()?,
                export_idx: a.read_u16()?,
                method_idx: a.read_u16()?,
                args: a.read_bytes()?.to_vec(),
            },
            OpCode::ExecFunc => Instruction::ExecFunc {
                idx: a.read_u16()?,
                export_idx: a.read_u16()?,
                args: a.read_bytes()?.to_vec(),
            },
            OpCode::Fund => Instruction::Fund { idx: a.read_u16()? },
            OpCode::Lock => Instruction::Lock {
                idx: a.read_u16()?,
                address: Address(a.read_array()?),
            },
            OpCode::Deploy => {
                let entries = read_str_seq(&mut a)?;
                let count = a.read_count()?;
                let mut sources = BTreeMap::new();
                for _ in 0..count {
                    let name = a.read_string()?;
                    let src = a.read_string()?;
                    sources.insert(name, src);
                }
                Instruction::Deploy { entries, sources }
            }
            OpCode::Sign => Instruction::Sign {
                sig: a.read_array()?,
                pubkey: a.read_array()?,
            },
            OpCode::SignTo => Instruction::SignTo {
                sig: a.read_array()?,
                pubkey: a.read_array()?,
            },
        };
        a.finish()?;
        Ok(ix)
    }

    /// Contribution of this instruction to a sighash: signatures only
    /// contribute their opcode and public key.
    fn sighash_bytes(&self) -> Vec<u8> {
        match self {
            Instruction::Sign { pubkey, .. } | Instruction::SignTo { pubkey, .. } => {
                let mut out = Vec::with_capacity(1 + PUBKEY_LEN);
                out.push(self.opcode() as u8);
                out.extend_from_slice(pubkey);
                out
            }
            other => other.to_bytes(),
        }
    }
}

/// A transaction: a version and an ordered instruction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: u16,
    pub instructions: Vec<Instruction>,
}

impl Default for Tx {
    fn default() -> Self {
        Tx::new()
    }
}

impl Tx {
    pub fn new() -> Self {
        Tx {
            version: TX_VERSION,
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, ix: Instruction) -> &mut Self {
        self.instructions.push(ix);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BufWriter::new();
        w.write_u16(self.version);
        w.write_uleb(self.instructions.len() as u64);
        for ix in self.instructions.iter() {
            ix.write(&mut w);
        }
        w.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = BufReader::new(bytes);
        let version = r.read_u16()?;
        if version != TX_VERSION {
            return Err(VmError::Codec(alloc::format!("unsupported tx version {}", version)));
        }
        let count = r.read_count()?;
        let mut instructions = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            instructions.push(Instruction::read(&mut r)?);
        }
        r.finish()?;
        Ok(Tx {
            version,
            instructions,
        })
    }

    pub fn hash(&self) -> [u8; 32] {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }

    /// Message signed by a signature covering instructions `[0, upto)`;
    /// `None` covers the whole transaction.
    pub fn sighash(&self, upto: Option<usize>) -> [u8; 32] {
        let end = upto.unwrap_or(self.instructions.len()).min(self.instructions.len());
        let mut hasher = blake3::Hasher::new();
        for ix in self.instructions[..end].iter() {
            hasher.update(&ix.sighash_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}
