//! Pointers, addresses and outputs.
//!
//! An `Output` is the persisted projection of a jig at one point in time. Its
//! id is the hash of its serialization, so it changes whenever any of the five
//! fields does.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::codec::{BufReader, BufWriter};
use crate::lock::Lock;
use crate::{Result, VmError};

/// Byte length of a serialized pointer.
pub const POINTER_LEN: usize = 36;

/// Byte length of an address.
pub const ADDRESS_LEN: usize = 20;

/// A 32-byte id plus an index: `(tx hash, statement)` for origins and
/// locations, `(package id, export)` for class pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer {
    pub id: [u8; 32],
    pub idx: u32,
}

impl Pointer {
    pub const fn new(id: [u8; 32], idx: u32) -> Self {
        Pointer { id, idx }
    }

    pub fn to_bytes(&self) -> [u8; POINTER_LEN] {
        let mut out = [0u8; POINTER_LEN];
        out[..32].copy_from_slice(&self.id);
        out[32..].copy_from_slice(&self.idx.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != POINTER_LEN {
            return Err(VmError::Execution(alloc::format!(
                "pointer must be {} bytes, got {}",
                POINTER_LEN,
                bytes.len()
            )));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes[..32]);
        let mut idx = [0u8; 4];
        idx.copy_from_slice(&bytes[32..]);
        Ok(Pointer::new(id, u32::from_le_bytes(idx)))
    }

    pub fn read(r: &mut BufReader<'_>) -> Result<Self> {
        Pointer::from_bytes(r.read_fixed_bytes(POINTER_LEN)?)
    }

    pub fn write(&self, w: &mut BufWriter) {
        w.write_fixed_bytes(&self.to_bytes());
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", to_hex(&self.id), self.idx)
    }
}

/// Hash of a public key, the owner named by an address lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// First 20 bytes of blake3(pubkey).
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        let hash = blake3::hash(pubkey);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&hash.as_bytes()[..ADDRESS_LEN]);
        Address(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| {
            VmError::Execution(alloc::format!(
                "address must be {} bytes, got {}",
                ADDRESS_LEN,
                bytes.len()
            ))
        })?;
        Ok(Address(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

/// Persisted state of a jig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub origin: Pointer,
    pub location: Pointer,
    pub class_ptr: Pointer,
    pub lock: Lock,
    pub state: Vec<u8>,
}

impl Output {
    pub fn new(origin: Pointer, location: Pointer, class_ptr: Pointer, lock: Lock, state: Vec<u8>) -> Self {
        Output {
            origin,
            location,
            class_ptr,
            lock,
            state,
        }
    }

    /// `origin ‖ location ‖ classPtr ‖ lock ‖ bytes(state)`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = BufWriter::new();
        self.origin.write(&mut w);
        self.location.write(&mut w);
        self.class_ptr.write(&mut w);
        self.lock.write(&mut w);
        w.write_bytes(&self.state);
        w.into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = BufReader::new(bytes);
        let origin = Pointer::read(&mut r)?;
        let location = Pointer::read(&mut r)?;
        let class_ptr = Pointer::read(&mut r)?;
        let lock = Lock::read(&mut r)?;
        let state = r.read_bytes()?.to_vec();
        r.finish()?;
        Ok(Output::new(origin, location, class_ptr, lock, state))
    }

    /// Content hash of the serialized output.
    pub fn id(&self) -> [u8; 32] {
        *blake3::hash(&self.serialize()).as_bytes()
    }

    pub fn package_id(&self) -> [u8; 32] {
        self.class_ptr.id
    }
}

/// Lower-case hex rendering used in log lines and error messages.
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}
