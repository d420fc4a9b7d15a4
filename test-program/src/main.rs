use std::collections::BTreeMap;

use stackwalker::{
    arch::Arch,
    error::{FatalWalkError, LocalizedSlotError},
    memory::SnapshotMemory,
    report::{Frame, FrameAction, SlotInfo, WalkCallbacks},
    runtime::{LocalMapper, MethodInfo, Modifiers, Runtime, WalkThread},
    Addr, WalkFlags, WalkOptions, WalkerConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STACK: u64 = 0x10_0000;
const CALLEE: Addr = Addr(0x5100);
const CALLER: Addr = Addr(0x5200);

fn word(index: u64) -> Addr {
    Addr(STACK + index * 8)
}

/// Two methods, one calling the other, both interpreted.
struct Demo {
    methods: BTreeMap<Addr, MethodInfo>,
}

impl Demo {
    fn new() -> Self {
        let method = |name: &str, signature: &str, arg_count, bytecodes| MethodInfo {
            name: name.into(),
            signature: signature.into(),
            modifiers: Modifiers::STATIC,
            arg_count,
            temp_count: 1,
            bytecodes: Addr(bytecodes),
            constant_pool: Addr(bytecodes + 0x800),
            class_object_slot: word(16),
            ..Default::default()
        };
        let mut methods = BTreeMap::new();
        methods.insert(CALLEE, method("callee", "(Ljava/lang/Object;)V", 1, 0x60_1000));
        methods.insert(CALLER, method("main", "()V", 0, 0x60_2000));
        Self { methods }
    }
}

impl Runtime for Demo {
    fn metadata_for_pc(&self, _pc: Addr) -> Option<Addr> {
        None
    }

    fn method(&self, method: Addr) -> Result<MethodInfo, FatalWalkError> {
        self.methods.get(&method).cloned().ok_or(FatalWalkError::Malformed {
            what: "unknown method",
            value: method.value(),
        })
    }

    fn resolved_method_signature(&self, _constant_pool: Addr, index: u64) -> Result<String, FatalWalkError> {
        Err(FatalWalkError::Malformed {
            what: "unresolved constant pool entry",
            value: index,
        })
    }

    fn interface_method(&self, interface_and_slot: Addr) -> Result<Addr, FatalWalkError> {
        Err(FatalWalkError::Malformed {
            what: "unknown interface slot",
            value: interface_and_slot.value(),
        })
    }

    fn local_map(
        &self,
        method: Addr,
        _pc_offset: u64,
        _locals: usize,
        _mapper: LocalMapper,
    ) -> Result<Vec<u32>, LocalizedSlotError> {
        // the callee's argument is a live reference
        Ok(vec![u32::from(method == CALLEE)])
    }

    fn pending_stack_map(&self, _method: Addr, _pc_offset: u64, _pushes: usize) -> Result<Vec<u32>, LocalizedSlotError> {
        Ok(vec![1])
    }

    fn object_fields(&self, _object: Addr) -> Result<Vec<Addr>, LocalizedSlotError> {
        Ok(Vec::new())
    }
}

struct Printer<'r> {
    runtime: &'r Demo,
}

impl WalkCallbacks for Printer<'_> {
    fn on_frame(&mut self, frame: &Frame) -> FrameAction {
        let name = self.runtime.methods.get(&frame.method).map_or("?", |method| method.name.as_str());
        tracing::info!(kind = ?frame.kind, name, pc = ?frame.pc, offset = ?frame.bytecode_pc_offset, "frame");
        FrameAction::Continue
    }

    fn on_object_slot(&mut self, frame: &Frame, slot: &SlotInfo) {
        tracing::info!(method = ?frame.method, address = ?slot.address, slot_type = ?slot.slot_type, index = slot.index, "object slot");
    }
}

/// The callee has one pending push and runs at bytecode offset 4 of its
/// method; the caller sits above it and ends the stack.
fn build_stack() -> SnapshotMemory {
    #[rustfmt::skip]
    let words: [u64; 20] = [
        // callee: pending push, saved caller literals, pc and arg0
        0x40_0000, CALLER.value(), 0x60_2000 + 9, word(9).value(),
        // callee temp, then its argument
        0, 0x40_0100,
        // caller: end of stack
        0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let mut memory = SnapshotMemory::new();
    memory.add_segment(Addr(STACK), words.iter().flat_map(|word| word.to_le_bytes()).collect());
    memory
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let config = WalkerConfig::for_version(2, Arch::X86_64).unwrap();
    let runtime = Demo::new();
    let memory = build_stack();
    let thread = WalkThread {
        thread: Addr(0x7000_0000),
        sp: word(0),
        arg0_ea: word(5),
        pc: Addr(0x60_1000 + 4),
        literals: CALLEE,
        ..Default::default()
    };

    let options = WalkOptions::new(WalkFlags::ITERATE_FRAMES | WalkFlags::ITERATE_O_SLOTS);
    let mut printer = Printer { runtime: &runtime };
    let result = stackwalker::walk_stack(&config, &runtime, &memory, &thread, &options, Some(&mut printer)).unwrap();
    tracing::info!(rc = ?result.rc, frames = result.frames_walked, "walked");

    let mut names = Vec::new();
    let mut collect = |frame: &Frame| {
        names.push(frame.method);
        FrameAction::Continue
    };
    let options = WalkOptions::new(WalkFlags::ITERATE_FRAMES | WalkFlags::VISIBLE_ONLY).with_max_frames(1);
    stackwalker::walk_stack(&config, &runtime, &memory, &thread, &options, Some(&mut collect)).unwrap();
    tracing::info!(?names, "top visible frame");
}
