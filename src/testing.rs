//! Synthetic runtime images for tests.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::String,
    vec,
    vec::Vec,
};

use crate::{
    config::{LocalMapper, WalkerConfig},
    error::{FatalWalkError, LocalizedSlotError},
    memory::{Endian, SnapshotMemory},
    metadata::{MetadataFlags, INTERNAL_PTR_REG_MASK},
    report::{Frame, FrameAction, SlotInfo, WalkCallbacks},
    runtime::{MethodInfo, Runtime},
    Addr,
};

/// Appends target-encoded values to a memory segment.
pub(crate) struct ImageBuilder {
    base: Addr,
    bytes: Vec<u8>,
    word_size: usize,
    endian: Endian,
}

impl ImageBuilder {
    pub(crate) fn new(base: Addr, word_size: usize, endian: Endian) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            word_size,
            endian,
        }
    }

    pub(crate) fn for_config(base: Addr, config: &WalkerConfig) -> Self {
        Self::new(base, config.word_size(), config.endian)
    }

    pub(crate) fn here(&self) -> Addr {
        self.base.byte_add(self.bytes.len() as i64)
    }

    fn encode(&self, value: u64, width: usize) -> Vec<u8> {
        let le = value.to_le_bytes();
        let mut bytes = le[..width].to_vec();
        if self.endian == Endian::Big {
            bytes.reverse();
        }
        bytes
    }

    pub(crate) fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub(crate) fn u16(&mut self, value: u16) -> &mut Self {
        let bytes = self.encode(u64::from(value), 2);
        self.bytes.extend(bytes);
        self
    }

    pub(crate) fn i16(&mut self, value: i16) -> &mut Self {
        self.u16(value as u16)
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
        let bytes = self.encode(u64::from(value), 4);
        self.bytes.extend(bytes);
        self
    }

    pub(crate) fn word(&mut self, value: u64) -> &mut Self {
        let bytes = self.encode(value, self.word_size);
        self.bytes.extend(bytes);
        self
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub(crate) fn zeros(&mut self, len: usize) -> &mut Self {
        self.bytes.resize(self.bytes.len() + len, 0);
        self
    }

    pub(crate) fn align(&mut self, align: usize) -> &mut Self {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
        self
    }

    fn patch(&mut self, at: Addr, value: u64, width: usize) {
        let start = at.distance(self.base) as usize;
        let bytes = self.encode(value, width);
        self.bytes[start..start + width].copy_from_slice(&bytes);
    }

    pub(crate) fn set_word(&mut self, at: Addr, value: u64) -> &mut Self {
        self.patch(at, value, self.word_size);
        self
    }

    pub(crate) fn set_u32(&mut self, at: Addr, value: u32) -> &mut Self {
        self.patch(at, u64::from(value), 4);
        self
    }

    pub(crate) fn finish(self, memory: &mut SnapshotMemory) {
        memory.add_segment(self.base, self.bytes);
    }
}

/// A zeroed stack segment, addressed by word.
pub(crate) struct StackImage {
    image: ImageBuilder,
}

impl StackImage {
    pub(crate) fn new(low: Addr, words: usize, config: &WalkerConfig) -> Self {
        let mut image = ImageBuilder::for_config(low, config);
        image.zeros(words * config.word_size());
        Self { image }
    }

    pub(crate) fn low(&self) -> Addr {
        self.image.base
    }

    /// The address of word `index` from the bottom.
    pub(crate) fn at(&self, index: usize) -> Addr {
        self.image.base.byte_add((index * self.image.word_size) as i64)
    }

    pub(crate) fn set(&mut self, index: usize, value: u64) -> &mut Self {
        let at = self.at(index);
        self.image.set_word(at, value);
        self
    }

    pub(crate) fn finish(self, memory: &mut SnapshotMemory) {
        self.image.finish(memory);
    }
}

/// Encodes a bytecode info record the way the target's compiler lays out
/// the bitfield.
pub(crate) fn byte_code_info(endian: Endian, do_not_profile: bool, caller_index: i32, bci: u32) -> u32 {
    let dnp = u32::from(do_not_profile);
    let caller = (caller_index as u32) & 0x1FFF;
    match endian {
        Endian::Little => dnp | (caller << 2) | (bci << 15),
        Endian::Big => (dnp << 31) | (caller << 17) | (bci & 0x1_FFFF),
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MapSpec {
    pub low: u32,
    pub caller_index: i32,
    pub bci: u32,
    pub bytecode_info_only: bool,
    pub save_description: u32,
    pub register_map: u32,
    /// (pinning slot index, 1-based register numbers)
    pub internal_registers: Vec<(u8, Vec<u8>)>,
    pub slots: Vec<u8>,
    pub live_monitors: Option<Vec<u8>>,
}

impl MapSpec {
    pub(crate) fn full(low: u32, slots: Vec<u8>) -> Self {
        Self {
            low,
            caller_index: -1,
            slots,
            ..Default::default()
        }
    }

    pub(crate) fn info(low: u32, caller_index: i32, bci: u32) -> Self {
        Self {
            low,
            caller_index,
            bci,
            bytecode_info_only: true,
            ..Default::default()
        }
    }

    pub(crate) fn at(mut self, caller_index: i32, bci: u32) -> Self {
        self.caller_index = caller_index;
        self.bci = bci;
        self
    }

    pub(crate) fn with_register_map(mut self, register_map: u32) -> Self {
        self.register_map = register_map;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InternalPtrSpec {
    /// Index of the map the internal pointer map does not apply to.
    pub excluded_map: Option<usize>,
    pub index_of_first: i16,
    pub offset_of_first: i16,
    pub arrays: Vec<(u8, Vec<u8>)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StackAllocSpec {
    /// Index of the map without stack allocated objects.
    pub excluded_map: Option<usize>,
    pub bits: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AtlasSpec {
    pub map_bytes: u16,
    pub parm_base_offset: i16,
    pub parm_slots: u16,
    pub local_base_offset: i16,
    pub maps: Vec<MapSpec>,
    pub internal_pointers: Option<InternalPtrSpec>,
    pub stack_alloc: Option<StackAllocSpec>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SiteSpec {
    pub method: Addr,
    pub caller_index: i32,
    pub bci: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MethodSpec {
    pub ram_method: Addr,
    pub constant_pool: Addr,
    pub start_pc: Addr,
    pub end_pc: Addr,
    pub register_save_description: u64,
    pub slots: u16,
    pub total_frame_size: i16,
    pub prologue_pushes: u16,
    pub scalar_temp_slots: i16,
    pub object_temp_slots: i16,
    pub flags: MetadataFlags,
    pub atlas: Option<AtlasSpec>,
    pub inlined: Vec<SiteSpec>,
}

/// Addresses of the pieces of a built method.
#[derive(Debug, Clone, Default)]
pub(crate) struct BuiltMethod {
    pub metadata: Addr,
    pub maps: Vec<Addr>,
    pub sites: Vec<Addr>,
}

impl MethodSpec {
    fn offset_size(&self, config: &WalkerConfig) -> usize {
        if config.aligned_stack_maps {
            4
        } else if config.metadata_size_flags && self.flags.contains(MetadataFlags::USED_FOR_SIZE) {
            if self.flags.contains(MetadataFlags::GC_MAP_32_BIT_OFFSETS) {
                4
            } else {
                2
            }
        } else if self.end_pc.distance(self.start_pc) >= 0xFFFF {
            4
        } else {
            2
        }
    }

    pub(crate) fn build(&self, image: &mut ImageBuilder, config: &WalkerConfig) -> BuiltMethod {
        let endian = config.endian;
        let word = config.word_size();
        let mut built = BuiltMethod {
            metadata: image.here(),
            ..Default::default()
        };

        image
            .word(self.ram_method.0)
            .word(self.constant_pool.0)
            .word(self.start_pc.0)
            .word(self.end_pc.0);
        let atlas_field = image.here();
        image.word(0);
        let inlined_field = image.here();
        image
            .word(0)
            .word(self.register_save_description)
            .u16(self.slots)
            .i16(self.total_frame_size)
            .u16(self.prologue_pushes)
            .i16(self.scalar_temp_slots)
            .i16(self.object_temp_slots)
            .u16(self.flags.bits())
            .align(word);

        let Some(atlas) = &self.atlas else {
            return built;
        };
        let map_bytes = usize::from(atlas.map_bytes);

        if !self.inlined.is_empty() {
            let table = image.here();
            image.set_word(inlined_field, table.0);
            let padding = (word + 4).div_ceil(word) * word - (word + 4);
            for site in &self.inlined {
                built.sites.push(image.here());
                image
                    .word(site.method.0)
                    .u32(byte_code_info(endian, false, site.caller_index, site.bci))
                    .zeros(padding + map_bytes);
            }
            image.align(word);
        }

        let atlas_address = image.here();
        image.set_word(atlas_field, atlas_address.0);
        let internal_field = image.here();
        image.word(0);
        let alloc_field = image.here();
        image
            .word(0)
            .u32(atlas.maps.len() as u32)
            .u16(atlas.map_bytes)
            .i16(atlas.parm_base_offset)
            .u16(atlas.parm_slots)
            .i16(atlas.local_base_offset)
            .zeros(map_bytes);

        let has_internal_map = atlas.internal_pointers.is_some();
        let offset_size = self.offset_size(config);
        for map in &atlas.maps {
            built.maps.push(image.here());
            match offset_size {
                4 => image.u32(map.low),
                _ => image.u16(map.low as u16),
            };
            image.u32(byte_code_info(endian, map.bytecode_info_only, map.caller_index, map.bci));
            if map.bytecode_info_only {
                continue;
            }
            let mut register_map = map.register_map;
            if !map.internal_registers.is_empty() {
                register_map |= INTERNAL_PTR_REG_MASK;
            }
            image.u32(map.save_description).u32(register_map);
            if register_map & INTERNAL_PTR_REG_MASK != 0 && has_internal_map {
                let mut record = vec![map.internal_registers.len() as u8];
                for (index, registers) in &map.internal_registers {
                    record.push(*index);
                    record.push(registers.len() as u8);
                    record.extend_from_slice(registers);
                }
                image.u8(record.len() as u8).bytes(&record);
            }
            let mut slots = map.slots.clone();
            slots.resize(map_bytes, 0);
            image.bytes(&slots);
            if let Some(monitors) = &map.live_monitors {
                let mut monitors = monitors.clone();
                monitors.resize(map_bytes, 0);
                image.bytes(&monitors);
            }
        }
        image.align(word);

        if let Some(internal) = &atlas.internal_pointers {
            let at = image.here();
            image.set_word(internal_field, at.0);
            let excluded = internal.excluded_map.map_or(0, |index| built.maps[index].0);
            let mut body = Vec::new();
            for (index, pointers) in &internal.arrays {
                body.push(*index);
                body.push(pointers.len() as u8);
                body.extend_from_slice(pointers);
            }
            image.word(excluded).u8((body.len() + 5) as u8);
            if config.aligned_stack_maps {
                image.u8(0);
            }
            image
                .i16(internal.index_of_first)
                .i16(internal.offset_of_first)
                .u8(internal.arrays.len() as u8)
                .bytes(&body)
                .align(word);
        }

        if let Some(alloc) = &atlas.stack_alloc {
            let at = image.here();
            image.set_word(alloc_field, at.0);
            let excluded = alloc.excluded_map.map_or(0, |index| built.maps[index].0);
            let mut bits = alloc.bits.clone();
            bits.resize(map_bytes, 0);
            image.word(excluded).bytes(&bits).align(word);
        }

        built
    }
}

/// A runtime whose answers are set up by the test.
#[derive(Debug, Default)]
pub(crate) struct TestRuntime {
    /// (start pc, end pc, metadata)
    pub compiled: Vec<(Addr, Addr, Addr)>,
    pub methods: BTreeMap<Addr, MethodInfo>,
    pub local_maps: BTreeMap<(Addr, u64), Vec<u32>>,
    pub pending_maps: BTreeMap<(Addr, u64), Vec<u32>>,
    pub signatures: BTreeMap<(Addr, u64), String>,
    pub interface_methods: BTreeMap<Addr, Addr>,
    pub object_fields: BTreeMap<Addr, Vec<Addr>>,
    /// Methods whose local maps cannot be computed.
    pub broken_local_maps: BTreeSet<Addr>,
}

impl TestRuntime {
    pub(crate) fn add_method(&mut self, address: Addr, method: MethodInfo) -> &mut Self {
        self.methods.insert(address, method);
        self
    }

    pub(crate) fn add_compiled(&mut self, spec: &MethodSpec, built: &BuiltMethod) -> &mut Self {
        self.compiled.push((spec.start_pc, spec.end_pc, built.metadata));
        self
    }
}

fn empty_map(slots: usize) -> Vec<u32> {
    vec![0; slots.div_ceil(32).max(1)]
}

impl Runtime for TestRuntime {
    fn metadata_for_pc(&self, pc: Addr) -> Option<Addr> {
        self.compiled
            .iter()
            .find(|(start, end, _)| *start <= pc && pc < *end)
            .map(|(_, _, metadata)| *metadata)
    }

    fn method(&self, method: Addr) -> Result<MethodInfo, FatalWalkError> {
        self.methods.get(&method).cloned().ok_or(FatalWalkError::Malformed {
            what: "unknown method",
            value: method.0,
        })
    }

    fn resolved_method_signature(&self, constant_pool: Addr, index: u64) -> Result<String, FatalWalkError> {
        self.signatures
            .get(&(constant_pool, index))
            .cloned()
            .ok_or(FatalWalkError::Malformed {
                what: "unresolved constant pool entry",
                value: index,
            })
    }

    fn interface_method(&self, interface_and_slot: Addr) -> Result<Addr, FatalWalkError> {
        self.interface_methods
            .get(&interface_and_slot)
            .copied()
            .ok_or(FatalWalkError::Malformed {
                what: "unknown interface slot",
                value: interface_and_slot.0,
            })
    }

    fn local_map(
        &self,
        method: Addr,
        pc_offset: u64,
        locals: usize,
        _mapper: LocalMapper,
    ) -> Result<Vec<u32>, LocalizedSlotError> {
        if self.broken_local_maps.contains(&method) {
            return Err(LocalizedSlotError::Malformed {
                what: "local map",
                value: method.0,
            });
        }
        Ok(self
            .local_maps
            .get(&(method, pc_offset))
            .cloned()
            .unwrap_or_else(|| empty_map(locals)))
    }

    fn pending_stack_map(&self, method: Addr, pc_offset: u64, pushes: usize) -> Result<Vec<u32>, LocalizedSlotError> {
        Ok(self
            .pending_maps
            .get(&(method, pc_offset))
            .cloned()
            .unwrap_or_else(|| empty_map(pushes)))
    }

    fn object_fields(&self, object: Addr) -> Result<Vec<Addr>, LocalizedSlotError> {
        Ok(self.object_fields.get(&object).cloned().unwrap_or_default())
    }
}

/// Records everything a walk reports.
#[derive(Default)]
pub(crate) struct Recorder<'a> {
    pub frames: Vec<Frame>,
    pub slots: Vec<(Frame, SlotInfo)>,
    pub fields: Vec<(Addr, Addr)>,
    /// Stop after this many frames.
    pub stop_after: Option<usize>,
    /// Moves objects: slot address to new value, written on report.
    pub relocations: BTreeMap<Addr, u64>,
    pub memory: Option<(&'a SnapshotMemory, &'a WalkerConfig)>,
}

impl Recorder<'_> {
    pub(crate) fn kinds(&self) -> Vec<crate::report::FrameKind> {
        self.frames.iter().map(|frame| frame.kind).collect()
    }

    pub(crate) fn slot_addresses(&self) -> Vec<Addr> {
        self.slots.iter().map(|(_, slot)| slot.address).collect()
    }
}

impl WalkCallbacks for Recorder<'_> {
    fn on_frame(&mut self, frame: &Frame) -> FrameAction {
        self.frames.push(*frame);
        match self.stop_after {
            Some(limit) if self.frames.len() >= limit => FrameAction::Stop,
            _ => FrameAction::Continue,
        }
    }

    fn on_object_slot(&mut self, frame: &Frame, slot: &SlotInfo) {
        self.slots.push((*frame, *slot));
        if let (Some(value), Some((memory, config))) = (self.relocations.get(&slot.address), self.memory) {
            let target = crate::memory::Target::new(memory, config.word_size(), config.endian);
            target.write_word(slot.address, *value).unwrap();
        }
    }

    fn on_field_slot(&mut self, _frame: &Frame, field: Addr, container: Addr) {
        self.fields.push((field, container));
    }
}
