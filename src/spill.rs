//! Where compiled code left each register.
//!
//! While unwinding compiled frames the walker keeps, per register id of the
//! architecture, the stack address the register's value of the frame being
//! looked at was saved to. A register map bit then names a register id, and
//! the slot behind it is what gets reported.

use alloc::{vec, vec::Vec};

use crate::{
    arch::{ArchLayout, SaveDescription},
    memory::Target,
    metadata::MethodMetadata,
    Addr,
};

/// Saved register locations, indexed by register id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegisterFile {
    slots: Vec<Option<Addr>>,
}

impl RegisterFile {
    pub(crate) fn new(layout: &dyn ArchLayout) -> Self {
        Self {
            slots: vec![None; layout.potential_saved_registers()],
        }
    }

    pub(crate) fn get(&self, id: usize) -> Option<Addr> {
        self.slots.get(id).copied().flatten()
    }

    fn set(&mut self, id: usize, at: Addr) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = Some(at);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Registers a call clobbers hold nothing of the caller's.
    pub(crate) fn clear_destroyed(&mut self, layout: &dyn ArchLayout) {
        for &id in layout.callee_destroyed() {
            if let Some(slot) = self.slots.get_mut(usize::from(id)) {
                *slot = None;
            }
        }
    }

    /// A data resolve saves every register in id order, after a fixed number
    /// of other slots.
    pub(crate) fn fill_data_resolve(&mut self, layout: &dyn ArchLayout, target: &Target<'_>, unwind_sp: Addr) {
        let first = layout.resolve_shape().slots_before_saves_in_data_resolve as i64;
        for id in 0..self.slots.len() {
            self.slots[id] = Some(target.slot(unwind_sp, first + id as i64));
        }
        trace!(registers = ?self.slots, "data resolve register saves");
    }

    /// Other resolves leave the registers in the thread's global save area.
    pub(crate) fn fill_resolve(&mut self, target: &Target<'_>, global_storage: Addr) {
        for id in 0..self.slots.len() {
            self.slots[id] = Some(target.slot(global_storage, id as i64));
        }
        trace!(registers = ?self.slots, "resolve register saves");
    }

    /// Runtime helpers called directly from compiled code save only the
    /// preserved registers, each at its own index of the global save area.
    pub(crate) fn fill_native_helper(&mut self, layout: &dyn ArchLayout, target: &Target<'_>, global_storage: Addr) {
        for &id in layout.callee_saved() {
            self.set(usize::from(id), target.slot(global_storage, i64::from(id)));
        }
        trace!(registers = ?self.slots, "helper register saves");
    }

    /// A J2I frame stores the preserved registers back to back, in the
    /// order of the callee-saved list.
    pub(crate) fn fill_j2i(&mut self, layout: &dyn ArchLayout, target: &Target<'_>, saved_registers: Addr) {
        for (n, &id) in layout.callee_saved().iter().enumerate() {
            self.set(usize::from(id), target.slot(saved_registers, n as i64));
        }
        trace!(registers = ?self.slots, "J2I register saves");
    }

    /// Records the registers the prologue of a compiled method saved in its
    /// frame, as its register save description says.
    pub(crate) fn add_spilled(
        &mut self,
        layout: &dyn ArchLayout,
        target: &Target<'_>,
        metadata: &MethodMetadata,
        bp: Addr,
    ) {
        let description = metadata.register_save_description;
        match layout.save_description() {
            SaveDescription::PushMask => {
                let pushes = i64::from(metadata.prologue_pushes);
                if pushes == 0 {
                    return;
                }
                let temps = i64::from(metadata.scalar_temp_slots) + i64::from(metadata.object_temp_slots);
                let cursor = target.slot(bp, -(temps + pushes));
                self.assign_bits(target, description & u64::from(layout.register_map_mask()), 0, cursor);
            }
            SaveDescription::GprRange => {
                let saved = description & 0x1_FFFF;
                let offset = (description >> 17) & 0xFFFF;
                // the range starts at gpr15
                self.assign_bits(target, saved, 15, bp.byte_add(-(offset as i64)));
            }
            SaveDescription::MaskAndOffset => {
                let saved = description & 0xFFFF;
                if saved == 0 {
                    return;
                }
                let offset = (description >> 16) & 0xFFFF;
                self.assign_bits(target, saved, 0, bp.byte_add(-(offset as i64)));
            }
        }
        trace!(registers = ?self.slots, "frame register saves");
    }

    /// Each set bit takes the next save slot, starting with register `first`.
    fn assign_bits(&mut self, target: &Target<'_>, mut bits: u64, first: usize, mut cursor: Addr) {
        let mut id = first;
        while bits != 0 {
            if bits & 1 != 0 {
                self.set(id, cursor);
                cursor = target.slot(cursor, 1);
            }
            bits >>= 1;
            id += 1;
        }
    }
}

/// Argument registers a resolve helper spilled to the stack, consumed one at
/// a time from the highest address downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpillCursor {
    remaining: usize,
    next: Addr,
}

impl SpillCursor {
    pub(crate) fn empty() -> Self {
        Self {
            remaining: 0,
            next: Addr::NULL,
        }
    }

    /// `count` spilled registers whose first lives at `first`.
    pub(crate) fn new(count: usize, first: Addr) -> Self {
        Self {
            remaining: count,
            next: first,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    /// The slot of the next argument register, if any is left.
    pub(crate) fn take(&mut self, target: &Target<'_>) -> Option<Addr> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.next;
        self.remaining -= 1;
        self.next = target.slot(slot, -1);
        Some(slot)
    }
}

/// Float argument registers not yet matched to a signature character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FloatArgs {
    total: usize,
    remaining: usize,
}

impl FloatArgs {
    pub(crate) fn new(layout: &dyn ArchLayout) -> Self {
        let total = layout.float_argument_registers().unwrap_or(0);
        Self { total, remaining: total }
    }

    /// No float argument travels in a register.
    pub(crate) fn none(layout: &dyn ArchLayout) -> Self {
        Self {
            total: layout.float_argument_registers().unwrap_or(0),
            remaining: 0,
        }
    }

    /// The number of the next float argument register, if any is left.
    pub(crate) fn take(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let number = self.total - self.remaining;
        self.remaining -= 1;
        Some(number)
    }
}

/// Save slot of float argument register `number` in the thread's float save
/// area. Slots are 64 bits wide; vector saves are twice that and start after
/// the 16 float slots.
pub(crate) fn float_argument_slot(layout: &dyn ArchLayout, vector_registers: bool, base: Addr, number: usize) -> Addr {
    let mut index = layout.fpr_save_index(number);
    if vector_registers && layout.save_description() == SaveDescription::MaskAndOffset {
        index = 2 * index + 16;
    }
    base.byte_add(index as i64 * 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::Arch,
        memory::{Endian, SnapshotMemory},
        metadata::MetadataFlags,
    };

    fn metadata(description: u64) -> MethodMetadata {
        MethodMetadata {
            ram_method: Addr::NULL,
            constant_pool: Addr::NULL,
            start_pc: Addr::NULL,
            end_pc: Addr::NULL,
            gc_stack_atlas: Addr::NULL,
            inlined_calls: Addr::NULL,
            register_save_description: description,
            slots: 0,
            total_frame_size: 0,
            prologue_pushes: 0,
            scalar_temp_slots: 0,
            object_temp_slots: 0,
            flags: MetadataFlags::empty(),
        }
    }

    #[test]
    fn push_mask_saves_below_the_temps() {
        let mem = SnapshotMemory::new();
        let layout = Arch::X86_64.layout();
        let target = Target::new(&mem, 8, Endian::Little);
        let mut file = RegisterFile::new(layout);

        let mut md = metadata(0b1000_0000_0000_0010); // rbx, r15
        md.prologue_pushes = 3;
        md.scalar_temp_slots = 2;
        md.object_temp_slots = 1;
        file.add_spilled(layout, &target, &md, Addr(0x1000));

        assert_eq!(file.get(1), Some(Addr(0x1000 - 6 * 8)));
        assert_eq!(file.get(15), Some(Addr(0x1000 - 5 * 8)));
        assert_eq!(file.get(0), None);

        // nothing pushed, nothing saved
        let mut empty = RegisterFile::new(layout);
        md.prologue_pushes = 0;
        empty.add_spilled(layout, &target, &md, Addr(0x1000));
        assert!((0..empty.len()).all(|id| empty.get(id).is_none()));
    }

    #[test]
    fn gpr_range_starts_at_gpr15() {
        let mem = SnapshotMemory::new();
        let layout = Arch::Ppc64.layout();
        let target = Target::new(&mem, 8, Endian::Big);
        let mut file = RegisterFile::new(layout);

        // gpr15 and gpr17 saved 0x40 bytes below bp
        let description = (0x40 << 17) | 0b101;
        file.add_spilled(layout, &target, &metadata(description), Addr(0x2000));

        assert_eq!(file.get(15), Some(Addr(0x2000 - 0x40)));
        assert_eq!(file.get(16), None);
        assert_eq!(file.get(17), Some(Addr(0x2000 - 0x38)));
    }

    #[test]
    fn mask_and_offset() {
        let mem = SnapshotMemory::new();
        let layout = Arch::S390x.layout();
        let target = Target::new(&mem, 8, Endian::Big);
        let mut file = RegisterFile::new(layout);

        let description = (0x20 << 16) | (1 << 6) | (1 << 12);
        file.add_spilled(layout, &target, &metadata(description), Addr(0x3000));
        assert_eq!(file.get(6), Some(Addr(0x3000 - 0x20)));
        assert_eq!(file.get(12), Some(Addr(0x3000 - 0x18)));

        let mut untouched = RegisterFile::new(layout);
        untouched.add_spilled(layout, &target, &metadata(0x20 << 16), Addr(0x3000));
        assert_eq!(untouched, RegisterFile::new(layout));
    }

    #[test]
    fn transition_saves() {
        let mem = SnapshotMemory::new();
        let layout = Arch::X86_64.layout();
        let target = Target::new(&mem, 8, Endian::Little);

        let mut file = RegisterFile::new(layout);
        file.fill_j2i(layout, &target, Addr(0x100));
        // rbx first, then r15
        assert_eq!(file.get(1), Some(Addr(0x100)));
        assert_eq!(file.get(15), Some(Addr(0x108)));
        assert_eq!(file.get(9), Some(Addr(0x138)));
        assert_eq!(file.get(0), None);

        file.clear_destroyed(layout);
        assert_eq!(file.get(1), Some(Addr(0x100)));

        let mut helper = RegisterFile::new(layout);
        helper.fill_native_helper(layout, &target, Addr(0x800));
        assert_eq!(helper.get(15), Some(Addr(0x800 + 15 * 8)));
        assert_eq!(helper.get(2), None);

        let mut data = RegisterFile::new(layout);
        data.fill_data_resolve(layout, &target, Addr(0x400));
        assert_eq!(data.get(0), Some(Addr(0x400 + 16 * 8)));
        data.clear_destroyed(layout);
        assert_eq!(data.get(0), None);
        assert_eq!(data.get(12), Some(Addr(0x400 + 28 * 8)));

        let mut resolve = RegisterFile::new(layout);
        resolve.fill_resolve(&target, Addr(0x800));
        assert_eq!(resolve.get(3), Some(Addr(0x818)));
    }

    #[test]
    fn spill_cursor_walks_down() {
        let mem = SnapshotMemory::new();
        let target = Target::new(&mem, 4, Endian::Little);
        let mut cursor = SpillCursor::new(2, Addr(0x108));
        assert_eq!(cursor.take(&target), Some(Addr(0x108)));
        assert_eq!(cursor.remaining(), 1);
        assert_eq!(cursor.take(&target), Some(Addr(0x104)));
        assert_eq!(cursor.take(&target), None);
        assert_eq!(SpillCursor::empty().take(&target), None);
    }

    #[test]
    fn float_slots() {
        let s390 = Arch::S390x.layout();
        let mut floats = FloatArgs::new(s390);
        assert_eq!(floats.take(), Some(0));
        assert_eq!(floats.take(), Some(1));
        assert_eq!(float_argument_slot(s390, false, Addr(0x1000), 1), Addr(0x1010));
        assert_eq!(float_argument_slot(s390, true, Addr(0x1000), 1), Addr(0x1000 + 20 * 8));
        assert_eq!(float_argument_slot(Arch::Ppc64.layout(), true, Addr(0x1000), 1), Addr(0x1008));

        assert_eq!(FloatArgs::none(s390).take(), None);
        assert_eq!(FloatArgs::new(Arch::X86_32.layout()).take(), None);
    }
}
