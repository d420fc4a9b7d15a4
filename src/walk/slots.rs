//! Handing slots to the callbacks.

use super::WalkState;
use crate::{
    error::LocalizedSlotError,
    report::{SlotClass, SlotInfo, SlotType},
    Addr, WalkFlags,
};

/// Longest local or operand stack a bytecoded frame can describe.
pub(super) const MAX_DESCRIBED_SLOTS: usize = 65_536;

impl WalkState<'_, '_> {
    /// Slot iteration was asked for and the governor still allows it.
    pub(super) fn walking_slots(&self) -> bool {
        self.flags.contains(WalkFlags::ITERATE_O_SLOTS) && !self.governor.is_disabled()
    }

    /// Charges a failed slot iteration to the governor.
    pub(super) fn govern(&mut self, during: &'static str, result: Result<(), LocalizedSlotError>) {
        if let Err(err) = result {
            self.governor.record(during, &err);
        }
    }

    /// Reports one slot. Only object slots reach the callbacks; the rest is
    /// traced.
    pub(super) fn report_slot(
        &mut self,
        class: SlotClass,
        address: Addr,
        indirection: Addr,
        slot_type: SlotType,
        index: i64,
    ) -> Result<(), LocalizedSlotError> {
        match class {
            SlotClass::Object => {
                let value = self.target.read_addr(address)?;
                trace!(?address, ?indirection, ?value, ?slot_type, index, "O-slot");
                let info = SlotInfo {
                    address,
                    indirection,
                    slot_type,
                    index,
                };
                let frame = self.frame();
                if let Some(callbacks) = self.callbacks.as_deref_mut() {
                    callbacks.on_object_slot(&frame, &info);
                }
            }
            SlotClass::Primitive => trace!(?address, ?slot_type, index, "I-slot"),
            SlotClass::InternalPointer => trace!(?address, index, "internal pointer"),
        }
        Ok(())
    }

    pub(super) fn report_object(&mut self, address: Addr, slot_type: SlotType, index: i64) -> Result<(), LocalizedSlotError> {
        self.report_slot(SlotClass::Object, address, address, slot_type, index)
    }

    pub(super) fn report_primitive(&mut self, address: Addr, slot_type: SlotType, index: i64) -> Result<(), LocalizedSlotError> {
        self.report_slot(SlotClass::Primitive, address, address, slot_type, index)
    }

    /// A reference field of the stack-allocated object at `container`.
    pub(super) fn report_field(&mut self, field: Addr, container: Addr) {
        trace!(?field, ?container, "field slot");
        let frame = self.frame();
        if let Some(callbacks) = self.callbacks.as_deref_mut() {
            callbacks.on_field_slot(&frame, field, container);
        }
    }

    /// The class object of the current method stays alive with the frame.
    pub(super) fn walk_method_class(&mut self) -> Result<(), LocalizedSlotError> {
        if !self.flags.contains(WalkFlags::ITERATE_METHOD_CLASS_SLOTS) || self.method.is_null() {
            return Ok(());
        }
        let class_slot = self.runtime.method(self.method)?.class_object_slot;
        self.report_object(class_slot, SlotType::Internal, -1)
    }

    /// Reports `count` slots from `highest` downward, one bit of `bits` each.
    pub(super) fn walk_described_pushes(
        &mut self,
        highest: Addr,
        count: usize,
        bits: &[u32],
        slot_type: SlotType,
    ) -> Result<(), LocalizedSlotError> {
        check_slot_count("described slot count", count)?;
        let mut cursor = highest;
        for index in 0..count {
            let class = if bit(bits, index) {
                SlotClass::Object
            } else {
                SlotClass::Primitive
            };
            self.report_slot(class, cursor, cursor, slot_type, index as i64)?;
            cursor = self.target.slot(cursor, -1);
        }
        Ok(())
    }

    /// Like [`WalkState::walk_described_pushes`], but each slot holds a
    /// tagged pointer to where the value really lives.
    pub(super) fn walk_indirect_described_pushes(
        &mut self,
        highest: Addr,
        count: usize,
        bits: &[u32],
    ) -> Result<(), LocalizedSlotError> {
        check_slot_count("described slot count", count)?;
        let mut cursor = highest;
        for index in 0..count {
            let redirected = self.target.read_addr(cursor)?.untag(1);
            if bit(bits, index) {
                self.report_slot(SlotClass::Object, redirected, cursor, SlotType::MethodLocal, index as i64)?;
            } else if self.config.indirect_primitive_slots {
                self.report_slot(SlotClass::Primitive, redirected, cursor, SlotType::MethodLocal, index as i64)?;
            } else {
                self.report_primitive(cursor, SlotType::MethodLocal, index as i64)?;
            }
            cursor = self.target.slot(cursor, -1);
        }
        Ok(())
    }

    /// `count` references pushed by the runtime, upward from `start`.
    pub(super) fn walk_object_pushes(&mut self, start: Addr, count: usize) -> Result<(), LocalizedSlotError> {
        check_slot_count("object push count", count)?;
        for index in 0..count {
            self.report_object(self.target.slot(start, index as i64), SlotType::Internal, index as i64)?;
        }
        Ok(())
    }

    /// JNI local references. A set low bit means the slot points at the
    /// reference instead of holding it.
    pub(super) fn walk_jni_refs(&mut self, start: Addr, count: usize) -> Result<(), LocalizedSlotError> {
        check_slot_count("JNI reference count", count)?;
        for index in 0..count {
            let slot = self.target.slot(start, index as i64);
            let value = self.target.read_word(slot)?;
            let address = if value & 1 != 0 { Addr(value & !1) } else { slot };
            self.report_slot(SlotClass::Object, address, slot, SlotType::JniLocal, index as i64)?;
        }
        Ok(())
    }
}

fn bit(bits: &[u32], index: usize) -> bool {
    bits.get(index / 32).is_some_and(|word| word & (1 << (index % 32)) != 0)
}

pub(super) fn check_slot_count(what: &'static str, count: usize) -> Result<(), LocalizedSlotError> {
    if count > MAX_DESCRIBED_SLOTS {
        return Err(LocalizedSlotError::Malformed {
            what,
            value: count as u64,
        });
    }
    Ok(())
}
