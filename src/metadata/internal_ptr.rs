//! Internal pointer maps.
//!
//! Compiled code may keep pointers into the middle of an array in temps or
//! registers. Each such pointer is tied to a pinning slot holding the array
//! itself. When a slot callback moves the array, the walker shifts every
//! pointer tied to it by the same distance.
//!
//! The atlas-wide map is
//!
//! ```text
//! word  the stack map it does not apply to
//! u8    size in bytes of what follows
//! u8    padding, with aligned maps
//! i16   index of the first internal pointer slot
//! i16   offset of the first internal pointer slot (bytes from bp)
//! u8    number of pinning arrays
//! then per array:
//!   u8  pinning slot index
//!   u8  number of internal pointers
//!   u8  internal pointer slot index[..]
//! ```
//!
//! and a map record may add the registers holding internal pointers:
//!
//! ```text
//! u8    size in bytes of what follows
//! u8    number of pinning arrays
//! then per array:
//!   u8  pinning slot index
//!   u8  number of registers
//!   u8  register number[..]   (1-based)
//! ```

use alloc::vec::Vec;

use super::{CompiledMethod, MapEntry, Result, NO_INTERNAL_PTR_REGISTERS};
use crate::{memory::Cursor, Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinningArray {
    pub index: u8,
    /// Slot indexes, relative to the first internal pointer slot.
    pub internal_pointers: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalPointerMap {
    pub index_of_first: i16,
    /// Byte offset from bp of slot index 0.
    pub offset_of_first: i16,
    pub arrays: Vec<PinningArray>,
}

impl InternalPointerMap {
    /// The slot with index `index`, in a frame based at `bp`.
    pub fn slot(&self, bp: Addr, word_size: usize, index: u8) -> Addr {
        bp.byte_add(i64::from(self.offset_of_first) + i64::from(index) * word_size as i64)
    }
}

/// Registers holding pointers into one pinning array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinningRegisters {
    pub index: u8,
    /// 1-based register numbers.
    pub registers: Vec<u8>,
}

fn read_counted(cursor: &mut Cursor<'_, '_>) -> Result<(u8, Vec<u8>)> {
    let index = cursor.read_u8()?;
    let count = cursor.read_u8()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        entries.push(cursor.read_u8()?);
    }
    Ok((index, entries))
}

impl<'m> CompiledMethod<'m> {
    /// The internal pointer map to apply to a frame stopped at `stack_map`.
    #[instrument(level = "trace", skip_all, fields(method = ?self.address))]
    pub fn internal_pointer_map(&self, stack_map: &MapEntry) -> Result<Option<InternalPointerMap>> {
        let Some(atlas) = self.atlas.filter(|atlas| !atlas.internal_pointer_map.is_null()) else {
            return Ok(None);
        };
        let target = self.target();
        let mut cursor = target.cursor(atlas.internal_pointer_map);
        let excluded = Addr(cursor.read_word()?);
        if excluded == stack_map.address {
            trace!("internal pointer map does not apply to this stack map");
            return Ok(None);
        }

        let _size = cursor.read_u8()?;
        if self.aligned_maps() {
            cursor.skip(1);
        }
        let index_of_first = cursor.read_i16()?;
        let offset_of_first = cursor.read_i16()?;
        let count = cursor.read_u8()?;
        let mut arrays = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (index, internal_pointers) = read_counted(&mut cursor)?;
            arrays.push(PinningArray {
                index,
                internal_pointers,
            });
        }
        Ok(Some(InternalPointerMap {
            index_of_first,
            offset_of_first,
            arrays,
        }))
    }

    /// Registers holding internal pointers at `stack_map`, per pinning array.
    pub fn pinning_registers(&self, stack_map: &MapEntry) -> Result<Vec<PinningRegisters>> {
        if self.register_map(stack_map)? == NO_INTERNAL_PTR_REGISTERS {
            return Ok(Vec::new());
        }
        let Some(record) = self.internal_pointer_registers_at(stack_map)? else {
            return Ok(Vec::new());
        };
        let mut cursor = self.target().cursor(record);
        let _size = cursor.read_u8()?;
        let count = cursor.read_u8()?;
        let mut arrays = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (index, registers) = read_counted(&mut cursor)?;
            arrays.push(PinningRegisters { index, registers });
        }
        Ok(arrays)
    }
}
