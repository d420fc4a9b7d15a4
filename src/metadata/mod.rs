//! Decoding of the metadata the compiler leaves next to every compiled
//! method.
//!
//! All multi-byte fields are in target byte order. Word fields are one target
//! word wide. A method's metadata record looks like this:
//!
//! ```text
//! word  ram method
//! word  constant pool
//! word  start pc
//! word  end pc              (exclusive)
//! word  gc stack atlas      (null for methods without maps)
//! word  inlined call sites  (null when nothing was inlined)
//! word  register save description
//! u16   argument slots
//! i16   total frame size    (words between the unwind pointer and bp)
//! u16   prologue pushes
//! i16   scalar temp slots
//! i16   object temp slots
//! u16   flags
//! ```
//!
//! The stack atlas follows the same conventions:
//!
//! ```text
//! word  internal pointer map  (null if none)
//! word  stack alloc map       (null if none)
//! u32   number of maps
//! u16   number of map bytes
//! i16   parameter base offset (bytes from bp)
//! u16   number of parameter slots
//! i16   local base offset     (bytes from bp)
//! u8    parameter map[number of map bytes]
//! ...   map records, ascending by low pc offset
//! ```
//!
//! The inlined call site table sits directly below the atlas, which is how
//! its length is known.


mod inline;
mod internal_ptr;
mod maps;

pub use inline::{InlineRange, InlinedCallSite};
pub use internal_ptr::{InternalPointerMap, PinningArray, PinningRegisters};
pub use maps::{GcBitmapCursor, MapEntry, MapIterator, MapsAtPc, SlotBits};

use crate::{
    config::WalkerConfig,
    error::FatalWalkError,
    memory::{MemoryError, Target},
    Addr,
};

type Result<T, E = FatalWalkError> = core::result::Result<T, E>;

/// Register maps with this bit set carry an internal pointer sub-record.
pub const INTERNAL_PTR_REG_MASK: u32 = 0x8000_0000;

/// Register map value of a map whose internal pointer registers are not
/// tracked.
pub const NO_INTERNAL_PTR_REGISTERS: u32 = 0xFADE_CAFE;

/// Ranges at least this long need 4 byte pc offsets.
const FOUR_BYTE_OFFSET_RANGE: u64 = 0xFFFF;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetadataFlags: u16 {
        /// The next flag decides the offset size instead of the code size.
        const USED_FOR_SIZE = 0x1;
        const GC_MAP_32_BIT_OFFSETS = 0x2;
        /// A stub with no stack maps.
        const IS_STUB = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodMetadata {
    pub ram_method: Addr,
    pub constant_pool: Addr,
    pub start_pc: Addr,
    pub end_pc: Addr,
    pub gc_stack_atlas: Addr,
    pub inlined_calls: Addr,
    pub register_save_description: u64,
    pub slots: u16,
    pub total_frame_size: i16,
    pub prologue_pushes: u16,
    pub scalar_temp_slots: i16,
    pub object_temp_slots: i16,
    pub flags: MetadataFlags,
}

impl MethodMetadata {
    pub fn read(target: &Target<'_>, address: Addr) -> Result<Self, MemoryError> {
        let mut cursor = target.cursor(address);
        Ok(Self {
            ram_method: Addr(cursor.read_word()?),
            constant_pool: Addr(cursor.read_word()?),
            start_pc: Addr(cursor.read_word()?),
            end_pc: Addr(cursor.read_word()?),
            gc_stack_atlas: Addr(cursor.read_word()?),
            inlined_calls: Addr(cursor.read_word()?),
            register_save_description: cursor.read_word()?,
            slots: cursor.read_u16()?,
            total_frame_size: cursor.read_i16()?,
            prologue_pushes: cursor.read_u16()?,
            scalar_temp_slots: cursor.read_i16()?,
            object_temp_slots: cursor.read_i16()?,
            flags: MetadataFlags::from_bits_retain(cursor.read_u16()?),
        })
    }

    pub fn code_size(&self) -> u64 {
        self.end_pc.0.wrapping_sub(self.start_pc.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAtlas {
    pub address: Addr,
    pub internal_pointer_map: Addr,
    pub stack_alloc_map: Addr,
    pub number_of_maps: u32,
    pub number_of_map_bytes: u16,
    pub parm_base_offset: i16,
    pub number_of_parm_slots: u16,
    pub local_base_offset: i16,
}

impl StackAtlas {
    /// Size of the fixed part, before the parameter map.
    pub fn header_size(word_size: usize) -> u64 {
        2 * word_size as u64 + 12
    }

    pub fn read(target: &Target<'_>, address: Addr) -> Result<Self, MemoryError> {
        let mut cursor = target.cursor(address);
        Ok(Self {
            address,
            internal_pointer_map: Addr(cursor.read_word()?),
            stack_alloc_map: Addr(cursor.read_word()?),
            number_of_maps: cursor.read_u32()?,
            number_of_map_bytes: cursor.read_u16()?,
            parm_base_offset: cursor.read_i16()?,
            number_of_parm_slots: cursor.read_u16()?,
            local_base_offset: cursor.read_i16()?,
        })
    }

    pub fn parameter_map(&self, word_size: usize) -> Addr {
        self.address.byte_add(Self::header_size(word_size) as i64)
    }

    pub fn first_map(&self, word_size: usize) -> Addr {
        self.parameter_map(word_size)
            .byte_add(i64::from(self.number_of_map_bytes))
    }
}

/// The 32-bit bytecode position record of a map or inlined call site.
///
/// Laid out as a C bitfield: `doNotProfile:1, isSameReceiver:1,
/// callerIndex:13 (signed), byteCodeIndex:17`, allocated from the least
/// significant bit on little-endian targets and from the most significant
/// bit on big-endian ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteCodeInfo {
    pub do_not_profile: bool,
    pub is_same_receiver: bool,
    /// Index of the enclosing call site, negative for the outermost method.
    pub caller_index: i32,
    pub byte_code_index: u32,
}

impl ByteCodeInfo {
    pub fn decode(raw: u32, endian: crate::memory::Endian) -> Self {
        let (dnp, same, caller, bci) = match endian {
            crate::memory::Endian::Little => (raw & 1, (raw >> 1) & 1, (raw >> 2) & 0x1FFF, raw >> 15),
            crate::memory::Endian::Big => (raw >> 31, (raw >> 30) & 1, (raw >> 17) & 0x1FFF, raw & 0x1_FFFF),
        };
        // sign extend the 13 bit caller index
        let caller_index = ((caller << 19) as i32) >> 19;
        Self {
            do_not_profile: dnp != 0,
            is_same_receiver: same != 0,
            caller_index,
            byte_code_index: bci,
        }
    }

    pub fn read(target: &Target<'_>, address: Addr) -> Result<Self, MemoryError> {
        Ok(Self::decode(target.read_u32(address)?, target.endian()))
    }

    pub fn has_caller(&self) -> bool {
        self.caller_index >= 0
    }
}

/// A compiled method's metadata, ready for map and inline lookups.
#[derive(Debug, Clone, Copy)]
pub struct CompiledMethod<'m> {
    target: Target<'m>,
    pub address: Addr,
    pub metadata: MethodMetadata,
    /// Absent for stubs and methods compiled without maps.
    pub atlas: Option<StackAtlas>,
    four_byte_offsets: bool,
    aligned_maps: bool,
    low_bit_marks_unloaded: bool,
}

impl<'m> CompiledMethod<'m> {
    #[instrument(level = "trace", skip(target, config))]
    pub fn read(target: Target<'m>, config: &WalkerConfig, address: Addr) -> Result<Self> {
        let metadata = MethodMetadata::read(&target, address)?;
        let atlas = if metadata.gc_stack_atlas.is_null() || metadata.flags.contains(MetadataFlags::IS_STUB) {
            None
        } else {
            Some(StackAtlas::read(&target, metadata.gc_stack_atlas)?)
        };

        let four_byte_offsets = if config.aligned_stack_maps {
            true
        } else if config.metadata_size_flags && metadata.flags.contains(MetadataFlags::USED_FOR_SIZE) {
            metadata.flags.contains(MetadataFlags::GC_MAP_32_BIT_OFFSETS)
        } else {
            metadata.code_size() >= FOUR_BYTE_OFFSET_RANGE
        };

        trace!(?metadata, ?atlas, four_byte_offsets, "read compiled method");

        Ok(Self {
            target,
            address,
            metadata,
            atlas,
            four_byte_offsets,
            aligned_maps: config.aligned_stack_maps,
            low_bit_marks_unloaded: config.layout().low_bit_marks_unloaded(),
        })
    }

    pub fn target(&self) -> &Target<'m> {
        &self.target
    }

    pub fn uses_four_byte_offsets(&self) -> bool {
        self.four_byte_offsets
    }

    /// Size of the low pc offset at the start of every map record.
    pub(crate) fn map_offset_size(&self) -> u64 {
        if self.four_byte_offsets {
            4
        } else {
            2
        }
    }

    pub(crate) fn aligned_maps(&self) -> bool {
        self.aligned_maps
    }

    pub fn ram_method(&self) -> Addr {
        self.metadata.ram_method
    }

    pub fn constant_pool(&self) -> Addr {
        self.metadata.constant_pool
    }

    /// Words from the unwind pointer up to the return address slot.
    pub fn total_frame_size(&self) -> i64 {
        i64::from(self.metadata.total_frame_size)
    }

    /// Argument slots of the outermost method.
    pub fn arg_slots(&self) -> usize {
        usize::from(self.metadata.slots)
    }

    fn map_bytes(&self) -> u64 {
        self.atlas.map_or(0, |atlas| u64::from(atlas.number_of_map_bytes))
    }

    /// First parameter slot of a frame based at `bp`.
    pub fn parm_scan_start(&self, bp: Addr) -> Addr {
        bp.byte_add(self.atlas.map_or(0, |atlas| i64::from(atlas.parm_base_offset)))
    }

    /// First local slot of a frame based at `bp`.
    pub fn local_scan_start(&self, bp: Addr) -> Addr {
        bp.byte_add(self.atlas.map_or(0, |atlas| i64::from(atlas.local_base_offset)))
    }

    fn is_all_ones(&self, method: Addr) -> bool {
        match self.target.word_size() {
            4 => method.0 as u32 == u32::MAX,
            _ => method.0 == u64::MAX,
        }
    }

    /// Call sites whose method was unloaded are skipped during inline walks.
    pub(crate) fn is_unloaded(&self, method: Addr) -> bool {
        self.is_all_ones(method)
    }

    /// Unloaded, or patched by class redefinition.
    pub(crate) fn is_patched(&self, method: Addr) -> bool {
        self.is_all_ones(method) || (self.low_bit_marks_unloaded && method.0 & 1 != 0)
    }
}
