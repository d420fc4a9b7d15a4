//! The GC stack maps of a compiled method.
//!
//! Map records follow the atlas's parameter map, ascending by low pc offset.
//! A full record is
//!
//! ```text
//! u16/u32  low pc offset
//! u32      bytecode info
//! u32      register save description
//! u32      register map
//! [..]     internal pointer registers, if the register map says so
//! u8[n]    stack slot bitmap
//! u8[n]    live monitor bitmap, if the last stack slot byte has bit 7 set
//! ```
//!
//! while a record whose bytecode info has `doNotProfile` set stops after the
//! bytecode info. Such records only move the inlining position; the stack
//! map in force stays the last full record.

use super::{ByteCodeInfo, CompiledMethod, Result, INTERNAL_PTR_REG_MASK};
use crate::{error::FatalWalkError, memory::Target, Addr};

const LIVE_MONITOR_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub address: Addr,
    /// Index of this record, from 0.
    pub index: u32,
    pub range_start: u64,
    /// Inclusive.
    pub range_end: u64,
    pub info: ByteCodeInfo,
    pub info_address: Addr,
    /// Carries only a bytecode position, no stack map.
    pub is_bytecode_info: bool,
}

impl MapEntry {
    pub fn covers(&self, offset: u64) -> bool {
        self.range_start <= offset && offset <= self.range_end
    }
}

/// The maps in force at a pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapsAtPc {
    /// The last full record at or before the pc.
    pub stack_map: Option<MapEntry>,
    /// The record whose range contains the pc.
    pub inline_map: Option<MapEntry>,
}

/// Walks the map records of one method in order.
#[derive(Debug, Clone)]
pub struct MapIterator<'c, 'm> {
    method: &'c CompiledMethod<'m>,
    next: Addr,
    index: u32,
    count: u32,
    current_stack_map: Option<MapEntry>,
}

impl<'c, 'm> MapIterator<'c, 'm> {
    /// The last full record returned so far.
    pub fn current_stack_map(&self) -> Option<MapEntry> {
        self.current_stack_map
    }

    fn read_next(&mut self) -> Result<MapEntry> {
        let method = self.method;
        let target = method.target();
        let address = self.next;
        let off = method.map_offset_size();

        let range_start = read_offset(target, address, off)?;
        let info_address = address.byte_add(off as i64);
        let info = ByteCodeInfo::read(target, info_address)?;
        let is_bytecode_info = info.do_not_profile;

        let next = if is_bytecode_info {
            info_address.byte_add(4)
        } else {
            let bitmap = method.stack_slots_at(address)?;
            let map_bytes = method.map_bytes();
            let mut next = bitmap.byte_add(map_bytes as i64);
            if map_bytes > 0 && target.read_u8(next.byte_add(-1))? & LIVE_MONITOR_BIT != 0 {
                next = next.byte_add(map_bytes as i64);
            }
            next
        };

        self.index += 1;
        let range_end = if self.index < self.count {
            read_offset(target, next, off)?.wrapping_sub(1)
        } else {
            method.metadata.code_size().wrapping_sub(1)
        };

        self.next = next;
        let entry = MapEntry {
            address,
            index: self.index - 1,
            range_start,
            range_end,
            info,
            info_address,
            is_bytecode_info,
        };
        if !is_bytecode_info {
            self.current_stack_map = Some(entry);
        }
        Ok(entry)
    }
}

impl Iterator for MapIterator<'_, '_> {
    type Item = Result<MapEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let entry = self.read_next();
        if entry.is_err() {
            // a broken record hides everything after it
            self.count = self.index;
        }
        Some(entry)
    }
}

fn read_offset(target: &Target<'_>, address: Addr, size: u64) -> Result<u64> {
    Ok(match size {
        4 => u64::from(target.read_u32(address)?),
        _ => u64::from(target.read_u16(address)?),
    })
}

/// One slot's worth of stack map bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotBits {
    pub object: bool,
    pub stack_allocated: bool,
}

/// Reads a stack slot bitmap one bit at a time, least significant bit of
/// each byte first, together with the matching stack-allocation bitmap.
///
/// Parameters and temps share one cursor, so it is passed along by value
/// between the two scans. Past the end of the bitmap every slot reads as a
/// primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcBitmapCursor {
    description: Addr,
    stack_alloc: Option<Addr>,
    bytes_left: u64,
    bits_left: u8,
    bits: u8,
    alloc_bits: u8,
}

impl GcBitmapCursor {
    pub fn new(description: Addr, map_bytes: u64, stack_alloc: Option<Addr>) -> Self {
        Self {
            description,
            stack_alloc,
            bytes_left: map_bytes,
            bits_left: 0,
            bits: 0,
            alloc_bits: 0,
        }
    }

    pub fn next_bits(&mut self, target: &Target<'_>) -> Result<SlotBits> {
        if self.bits_left == 0 {
            if self.bytes_left > 0 {
                self.bits = target.read_u8(self.description)?;
                self.description = self.description.byte_add(1);
                if let Some(alloc) = self.stack_alloc {
                    self.alloc_bits = target.read_u8(alloc)?;
                    self.stack_alloc = Some(alloc.byte_add(1));
                }
                self.bytes_left -= 1;
            } else {
                self.bits = 0;
                self.alloc_bits = 0;
            }
            self.bits_left = 8;
        }
        let bits = SlotBits {
            object: self.bits & 1 != 0,
            stack_allocated: self.alloc_bits & 1 != 0,
        };
        self.bits >>= 1;
        self.alloc_bits >>= 1;
        self.bits_left -= 1;
        Ok(bits)
    }
}

impl<'m> CompiledMethod<'m> {
    pub fn maps(&self) -> MapIterator<'_, 'm> {
        let (next, count) = match self.atlas {
            Some(atlas) => (atlas.first_map(self.target().word_size()), atlas.number_of_maps),
            None => (Addr::NULL, 0),
        };
        MapIterator {
            method: self,
            next,
            index: 0,
            count,
            current_stack_map: None,
        }
    }

    /// Finds the maps in force at `pc`, a return address into this method.
    ///
    /// A pc outside every range, or a method without an atlas, yields no
    /// maps rather than an error.
    #[instrument(level = "trace", skip(self), fields(method = ?self.address))]
    pub fn maps_at_pc(&self, pc: Addr) -> Result<MapsAtPc> {
        // return addresses point past the call
        let offset = pc.0.wrapping_sub(self.metadata.start_pc.0).wrapping_sub(1);
        let mut maps = self.maps();
        while let Some(entry) = maps.next() {
            let entry = entry?;
            if entry.covers(offset) {
                let found = MapsAtPc {
                    stack_map: maps.current_stack_map(),
                    inline_map: Some(entry),
                };
                trace!(offset, ?found, "found maps");
                return Ok(found);
            }
        }
        trace!(offset, "no map covers pc");
        Ok(MapsAtPc::default())
    }

    fn register_map_address(&self, record: Addr) -> Addr {
        record.byte_add(self.map_offset_size() as i64 + 8)
    }

    pub fn register_save_description(&self, stack_map: &MapEntry) -> Result<u32> {
        Ok(self.target().read_u32(stack_map.address.byte_add(self.map_offset_size() as i64 + 4))?)
    }

    pub fn register_map(&self, stack_map: &MapEntry) -> Result<u32> {
        Ok(self.target().read_u32(self.register_map_address(stack_map.address))?)
    }

    pub(crate) fn has_internal_pointer_map(&self) -> bool {
        self.atlas.is_some_and(|atlas| !atlas.internal_pointer_map.is_null())
    }

    /// Internal pointer registers are recorded right after the register map.
    pub(crate) fn internal_pointer_registers_at(&self, stack_map: &MapEntry) -> Result<Option<Addr>> {
        let regmap_address = self.register_map_address(stack_map.address);
        let regmap = self.target().read_u32(regmap_address)?;
        if regmap & INTERNAL_PTR_REG_MASK != 0 && self.has_internal_pointer_map() {
            Ok(Some(regmap_address.byte_add(4)))
        } else {
            Ok(None)
        }
    }

    fn stack_slots_at(&self, record: Addr) -> Result<Addr> {
        let regmap_address = self.register_map_address(record);
        let regmap = self.target().read_u32(regmap_address)?;
        let mut cursor = regmap_address.byte_add(4);
        if regmap & INTERNAL_PTR_REG_MASK != 0 && self.has_internal_pointer_map() {
            cursor = cursor.byte_add(i64::from(self.target().read_u8(cursor)?) + 1);
        }
        Ok(cursor)
    }

    /// The stack slot bitmap of a full record.
    pub fn stack_slots(&self, stack_map: &MapEntry) -> Result<Addr> {
        if stack_map.is_bytecode_info {
            return Err(FatalWalkError::Malformed {
                what: "stack map without slots",
                value: stack_map.address.0,
            });
        }
        self.stack_slots_at(stack_map.address)
    }

    /// The bitmap of slots holding a locked monitor, if the record has one.
    pub fn live_monitors(&self, stack_map: &MapEntry) -> Result<Option<Addr>> {
        let bitmap = self.stack_slots(stack_map)?;
        let map_bytes = self.map_bytes();
        if map_bytes == 0 {
            return Ok(None);
        }
        let end = bitmap.byte_add(map_bytes as i64);
        if self.target().read_u8(end.byte_add(-1))? & LIVE_MONITOR_BIT != 0 {
            Ok(Some(end))
        } else {
            Ok(None)
        }
    }

    /// The bitmap of stack slots holding whole objects, if `stack_map` has
    /// any.
    pub fn stack_alloc_map(&self, stack_map: &MapEntry) -> Result<Option<Addr>> {
        let Some(atlas) = self.atlas else {
            return Ok(None);
        };
        if atlas.stack_alloc_map.is_null() {
            return Ok(None);
        }
        let target = self.target();
        // the header word names the one map without stack allocations
        if target.read_addr(atlas.stack_alloc_map)? == stack_map.address {
            return Ok(None);
        }
        Ok(Some(atlas.stack_alloc_map.byte_add(target.word_size() as i64)))
    }

    /// A bitmap cursor over the slots of `stack_map`.
    pub fn gc_bitmap(&self, stack_map: &MapEntry) -> Result<GcBitmapCursor> {
        Ok(GcBitmapCursor::new(
            self.stack_slots(stack_map)?,
            self.map_bytes(),
            self.stack_alloc_map(stack_map)?,
        ))
    }
}
