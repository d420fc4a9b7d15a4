//! Bounds-checked access to the target's memory.
//!
//! The walker never dereferences target addresses. Every read goes through a
//! [`MemoryView`], and every multi-byte value is decoded by a [`Target`] that
//! knows the word size and byte order of the process being walked.

#[cfg(target_os = "linux")]
pub mod process;

use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use core::cell::RefCell;

use crate::Addr;

/// A read (or write) touched memory that is not part of the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unable to access {width} bytes at {address:?}")]
pub struct MemoryError {
    pub address: Addr,
    pub width: usize,
}

type Result<T, E = MemoryError> = core::result::Result<T, E>;

/// Raw access to the thread's stack, the metadata store and the OS register
/// file of the walked thread.
pub trait MemoryView {
    /// Fills `buf` with the bytes at `address`, or fails without side effects.
    fn read_bytes(&self, address: Addr, buf: &mut [u8]) -> Result<()>;

    /// Slot callbacks may relocate objects; views that cannot be written fail.
    fn write_bytes(&self, address: Addr, bytes: &[u8]) -> Result<()> {
        Err(MemoryError {
            address,
            width: bytes.len(),
        })
    }

    /// Looks up a register of the walked OS thread by name ("rsp", "gpr14").
    fn register(&self, _name: &str) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Typed reads over a [`MemoryView`] for one target word size and byte order.
#[derive(Clone, Copy)]
pub struct Target<'m> {
    mem: &'m dyn MemoryView,
    word_size: usize,
    endian: Endian,
}

impl core::fmt::Debug for Target<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Target")
            .field("word_size", &self.word_size)
            .field("endian", &self.endian)
            .finish_non_exhaustive()
    }
}

macro_rules! read_int {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self, address: Addr) -> Result<$ty> {
            let mut buf = [0; core::mem::size_of::<$ty>()];
            self.mem.read_bytes(address, &mut buf)?;
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(buf),
                Endian::Big => <$ty>::from_be_bytes(buf),
            })
        }
    };
}

impl<'m> Target<'m> {
    pub fn new(mem: &'m dyn MemoryView, word_size: usize, endian: Endian) -> Self {
        debug_assert!(word_size == 4 || word_size == 8);
        Self {
            mem,
            word_size,
            endian,
        }
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn view(&self) -> &'m dyn MemoryView {
        self.mem
    }

    /// The address of the `index`th word relative to `base`.
    pub fn slot(&self, base: Addr, index: i64) -> Addr {
        base.byte_add(index * self.word_size as i64)
    }

    /// Number of whole words between two addresses, `high - low`.
    pub fn words_between(&self, high: Addr, low: Addr) -> i64 {
        high.distance(low) / self.word_size as i64
    }

    read_int!(read_u16, u16);
    read_int!(read_i16, i16);
    read_int!(read_u32, u32);
    read_int!(read_i32, i32);
    read_int!(read_u64, u64);

    pub fn read_u8(&self, address: Addr) -> Result<u8> {
        let mut buf = [0; 1];
        self.mem.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads one unsigned target word.
    pub fn read_word(&self, address: Addr) -> Result<u64> {
        match self.word_size {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }

    /// Reads one target word, sign extended.
    pub fn read_iword(&self, address: Addr) -> Result<i64> {
        match self.word_size {
            4 => self.read_i32(address).map(i64::from),
            _ => self.read_u64(address).map(|v| v as i64),
        }
    }

    pub fn read_addr(&self, address: Addr) -> Result<Addr> {
        self.read_word(address).map(Addr)
    }

    /// Reads the word at `base + index` words.
    pub fn read_slot(&self, base: Addr, index: i64) -> Result<u64> {
        self.read_word(self.slot(base, index))
    }

    pub fn write_word(&self, address: Addr, value: u64) -> Result<()> {
        match (self.word_size, self.endian) {
            (4, Endian::Little) => self.mem.write_bytes(address, &(value as u32).to_le_bytes()),
            (4, Endian::Big) => self.mem.write_bytes(address, &(value as u32).to_be_bytes()),
            (_, Endian::Little) => self.mem.write_bytes(address, &value.to_le_bytes()),
            (_, Endian::Big) => self.mem.write_bytes(address, &value.to_be_bytes()),
        }
    }

    /// Reads a byte string of known length, replacing invalid UTF-8.
    pub fn read_string(&self, address: Addr, len: usize) -> Result<String> {
        let mut buf = vec![0; len];
        self.mem.read_bytes(address, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn cursor(&self, at: Addr) -> Cursor<'_, 'm> {
        Cursor { target: self, at }
    }
}

/// A typed, advancing cursor over a record in target memory.
pub struct Cursor<'t, 'm> {
    target: &'t Target<'m>,
    at: Addr,
}

impl Cursor<'_, '_> {
    pub fn position(&self) -> Addr {
        self.at
    }

    pub fn skip(&mut self, bytes: u64) {
        self.at = self.at.byte_add(bytes as i64);
    }

    /// Rounds the position up to a multiple of `align` bytes.
    pub fn align_to(&mut self, align: u64) {
        let rem = self.at.0 % align;
        if rem != 0 {
            self.skip(align - rem);
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.target.read_u8(self.at)?;
        self.skip(1);
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let value = self.target.read_u16(self.at)?;
        self.skip(2);
        Ok(value)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let value = self.target.read_i16(self.at)?;
        self.skip(2);
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.target.read_u32(self.at)?;
        self.skip(4);
        Ok(value)
    }

    pub fn read_word(&mut self) -> Result<u64> {
        let value = self.target.read_word(self.at)?;
        self.skip(self.target.word_size as u64);
        Ok(value)
    }
}

/// An in-memory copy of the interesting parts of a process, as read from a
/// core file. Writes from slot callbacks land in the copy.
#[derive(Debug, Default)]
pub struct SnapshotMemory {
    segments: RefCell<BTreeMap<u64, Vec<u8>>>,
    registers: BTreeMap<String, u64>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment. Segments must not overlap.
    pub fn add_segment(&mut self, base: Addr, bytes: Vec<u8>) {
        self.segments.get_mut().insert(base.0, bytes);
    }

    pub fn set_register(&mut self, name: &str, value: u64) {
        self.registers.insert(name.into(), value);
    }

    fn locate(&self, address: Addr, width: usize) -> Result<(u64, usize)> {
        let err = MemoryError { address, width };
        let segments = self.segments.borrow();
        let (&base, bytes) = segments.range(..=address.0).next_back().ok_or(err)?;
        let start = usize::try_from(address.0 - base).map_err(|_| err)?;
        match start.checked_add(width) {
            Some(end) if end <= bytes.len() => Ok((base, start)),
            _ => Err(err),
        }
    }
}

impl MemoryView for SnapshotMemory {
    fn read_bytes(&self, address: Addr, buf: &mut [u8]) -> Result<()> {
        let (base, start) = self.locate(address, buf.len())?;
        let segments = self.segments.borrow();
        let bytes = &segments[&base];
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, address: Addr, bytes: &[u8]) -> Result<()> {
        let (base, start) = self.locate(address, bytes.len())?;
        let mut segments = self.segments.borrow_mut();
        let segment = segments.get_mut(&base).ok_or(MemoryError {
            address,
            width: bytes.len(),
        })?;
        segment[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn register(&self, name: &str) -> Option<u64> {
        self.registers.get(name).copied()
    }
}
