//! Method descriptor parsing, just enough to find reference arguments.

use alloc::{vec, vec::Vec};

use crate::{error::FatalWalkError, runtime::MethodInfo};

/// Walks the argument types of a descriptor such as `(I[JLfoo;D)V`.
///
/// Every array type reads as `L`, since arrays are references.
pub(crate) struct SignatureCursor<'s> {
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> SignatureCursor<'s> {
    pub(crate) fn new(signature: &'s str) -> Result<Self, FatalWalkError> {
        let bytes = signature.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(malformed(0));
        }
        Ok(Self { bytes, pos: 1 })
    }

    fn next_byte(&mut self) -> Result<u8, FatalWalkError> {
        let byte = *self.bytes.get(self.pos).ok_or(malformed(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    /// The next argument type, or `)` after the last one.
    pub(crate) fn next_arg(&mut self) -> Result<u8, FatalWalkError> {
        let mut c = self.next_byte()?;
        if c == b'[' {
            while c == b'[' {
                c = self.next_byte()?;
            }
            if c != b'L' {
                return Ok(b'L');
            }
        }
        if c == b'L' {
            while self.next_byte()? != b';' {}
        }
        Ok(c)
    }
}

fn malformed(pos: usize) -> FatalWalkError {
    FatalWalkError::Malformed {
        what: "method signature",
        value: pos as u64,
    }
}

/// Stack slots the arguments of `signature` take, without a receiver.
pub(crate) fn send_slots(signature: &str) -> Result<usize, FatalWalkError> {
    let mut cursor = SignatureCursor::new(signature)?;
    let mut slots = 0;
    loop {
        match cursor.next_arg()? {
            b')' => return Ok(slots),
            b'J' | b'D' => slots += 2,
            _ => slots += 1,
        }
    }
}

/// Reference bits for the argument slots of `method` at entry, before any
/// local has been assigned. Slot 0 is bit 0 of word 0.
pub(crate) fn argument_bits(method: &MethodInfo, slots: usize) -> Result<Vec<u32>, FatalWalkError> {
    let mut bits = vec![0u32; slots.max(1).div_ceil(32)];
    let mut set = |slot: usize| {
        if let Some(word) = bits.get_mut(slot / 32) {
            *word |= 1 << (slot % 32);
        }
    };

    let mut slot = 0;
    if !method.is_static() {
        set(slot);
        slot += 1;
    }
    let mut cursor = SignatureCursor::new(&method.signature)?;
    loop {
        match cursor.next_arg()? {
            b')' => break,
            b'L' => {
                set(slot);
                slot += 1;
            }
            b'J' | b'D' => slot += 2,
            _ => slot += 1,
        }
    }
    Ok(bits)
}
