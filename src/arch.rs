//! Per-architecture register catalogs and resolve-frame shapes.
//!
//! Register ids index the spill table of a walk. They follow the bit
//! numbering compiled code uses in its register maps, so an id here must
//! name the same machine register the metadata producer meant.

use core::fmt;

use alloc::string::ToString;

use crate::{error::WalkError, memory::Endian, Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    X86_32,
    Ppc64,
    Ppc32,
    S390x,
    S390,
}

impl Arch {
    pub const ALL: [Arch; 6] = [
        Arch::X86_64,
        Arch::X86_32,
        Arch::Ppc64,
        Arch::Ppc32,
        Arch::S390x,
        Arch::S390,
    ];

    /// Parses the architecture name a runtime or core file declares.
    pub fn from_name(name: &str) -> Result<Arch, WalkError> {
        Ok(match name {
            "amd64" | "x86_64" | "x86-64" => Arch::X86_64,
            "x86" | "ia32" | "i386" | "i686" => Arch::X86_32,
            "ppc64" | "ppc64le" | "powerpc64" => Arch::Ppc64,
            "ppc" | "ppc32" | "powerpc" => Arch::Ppc32,
            "s390x" => Arch::S390x,
            "s390" | "s390-31" => Arch::S390,
            other => return Err(WalkError::PlatformUnsupported(other.to_string())),
        })
    }

    pub fn layout(self) -> &'static dyn ArchLayout {
        match self {
            Arch::X86_64 => &X86_64,
            Arch::X86_32 => &X86_32,
            Arch::Ppc64 => &PPC64,
            Arch::Ppc32 => &PPC32,
            Arch::S390x => &S390X,
            Arch::S390 => &S390_31,
        }
    }
}

/// Order in which the bits of a register map are matched to register ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Bit 0 is register 0.
    LowToHigh,
    /// Bit 0 is the highest mapped register.
    HighToLow,
}

/// How a compiled method's register save description is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDescription {
    /// A bit per register, pushed in id order below the frame's temps.
    PushMask,
    /// 17 bits of saved GPRs and a 16-bit byte offset from the frame base.
    GprRange,
    /// A 16-bit register mask and a 16-bit byte offset from the frame base.
    MaskAndOffset,
}

/// Slot counts of the transition frames compiled code builds around runtime
/// helper calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveShape {
    /// Slots between the unwind pointer and the register save area of a
    /// data resolve frame.
    pub slots_before_saves_in_data_resolve: usize,
    pub data_resolve_pushes: usize,
    pub recompilation_pushes: usize,
    pub virtual_method_pushes: usize,
    pub static_method_pushes: usize,
}

/// Everything the walker needs to know about one architecture.
pub trait ArchLayout: Sync + fmt::Debug {
    fn arch(&self) -> Arch;
    fn word_size(&self) -> usize;
    fn default_endian(&self) -> Endian;
    /// All registers that may hold a spilled reference, by id.
    fn register_names(&self) -> &'static [&'static str];
    /// Preserved across calls, in the order a J2I frame saves them.
    fn callee_saved(&self) -> &'static [u8];
    /// Clobbered by a call; stale spill entries for these are dropped.
    fn callee_destroyed(&self) -> &'static [u8];
    fn register_map_mask(&self) -> u32;
    fn register_scan(&self) -> ScanDirection;
    /// Registers carrying the first arguments of a compiled call, in order.
    fn argument_registers(&self) -> &'static [u8];
    /// `None` when floats travel in integer registers or on the stack.
    fn float_argument_registers(&self) -> Option<usize>;
    fn floats_passed_as_doubles(&self) -> bool;
    /// Index of the 64-bit save slot holding float argument `n`.
    fn fpr_save_index(&self, n: usize) -> usize;
    /// The callee pops the arguments of compiled-to-interpreter calls.
    fn callee_pops_arguments(&self) -> bool;
    fn helpers_pass_parameters_on_stack(&self) -> bool;
    /// The register a live thread keeps the managed stack pointer in.
    fn java_sp_register(&self) -> &'static str;
    fn instruction_pointer_register(&self) -> &'static str;
    fn save_description(&self) -> SaveDescription;
    fn resolve_shape(&self) -> ResolveShape;
    /// Strips addressing-mode bits from a return address.
    fn mask_pc(&self, pc: Addr) -> Addr;
    /// Patched or unloaded method pointers carry a set low bit instead of
    /// being all ones.
    fn low_bit_marks_unloaded(&self) -> bool;

    fn potential_saved_registers(&self) -> usize {
        self.register_names().len()
    }

    fn register_name(&self, id: usize) -> &'static str {
        self.register_names().get(id).copied().unwrap_or("???")
    }

    /// First spill-table index matched by a register-map scan.
    fn register_scan_start(&self) -> usize {
        match self.register_scan() {
            ScanDirection::LowToHigh => 0,
            ScanDirection::HighToLow => (self.register_map_mask().count_ones() as usize).saturating_sub(1),
        }
    }
}

#[derive(Debug)]
struct Catalog {
    arch: Arch,
    word_size: usize,
    endian: Endian,
    names: &'static [&'static str],
    callee_saved: &'static [u8],
    callee_destroyed: &'static [u8],
    register_map_mask: u32,
    scan: ScanDirection,
    argument_registers: &'static [u8],
    float_argument_registers: Option<usize>,
    floats_passed_as_doubles: bool,
    fpr_stride: usize,
    callee_pops_arguments: bool,
    helpers_pass_parameters_on_stack: bool,
    java_sp: &'static str,
    ip: &'static str,
    save_description: SaveDescription,
    resolve: ResolveShape,
    pc_mask: u64,
    low_bit_unloaded: bool,
}

impl ArchLayout for Catalog {
    fn arch(&self) -> Arch {
        self.arch
    }
    fn word_size(&self) -> usize {
        self.word_size
    }
    fn default_endian(&self) -> Endian {
        self.endian
    }
    fn register_names(&self) -> &'static [&'static str] {
        self.names
    }
    fn callee_saved(&self) -> &'static [u8] {
        self.callee_saved
    }
    fn callee_destroyed(&self) -> &'static [u8] {
        self.callee_destroyed
    }
    fn register_map_mask(&self) -> u32 {
        self.register_map_mask
    }
    fn register_scan(&self) -> ScanDirection {
        self.scan
    }
    fn argument_registers(&self) -> &'static [u8] {
        self.argument_registers
    }
    fn float_argument_registers(&self) -> Option<usize> {
        self.float_argument_registers
    }
    fn floats_passed_as_doubles(&self) -> bool {
        self.floats_passed_as_doubles
    }
    fn fpr_save_index(&self, n: usize) -> usize {
        n * self.fpr_stride
    }
    fn callee_pops_arguments(&self) -> bool {
        self.callee_pops_arguments
    }
    fn helpers_pass_parameters_on_stack(&self) -> bool {
        self.helpers_pass_parameters_on_stack
    }
    fn java_sp_register(&self) -> &'static str {
        self.java_sp
    }
    fn instruction_pointer_register(&self) -> &'static str {
        self.ip
    }
    fn save_description(&self) -> SaveDescription {
        self.save_description
    }
    fn resolve_shape(&self) -> ResolveShape {
        self.resolve
    }
    fn mask_pc(&self, pc: Addr) -> Addr {
        Addr(pc.0 & self.pc_mask)
    }
    fn low_bit_marks_unloaded(&self) -> bool {
        self.low_bit_unloaded
    }
}

#[rustfmt::skip]
static X86_64: Catalog = Catalog {
    arch: Arch::X86_64,
    word_size: 8,
    endian: Endian::Little,
    names: &[
        "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp",
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
    ],
    // rbx r15 r14 r13 r12 r11 r10 r9
    callee_saved: &[1, 15, 14, 13, 12, 11, 10, 9],
    callee_destroyed: &[0, 2, 3, 4, 5, 6, 7, 8],
    register_map_mask: 0xFFFF,
    scan: ScanDirection::LowToHigh,
    // rax rsi rdx rcx
    argument_registers: &[0, 5, 3, 2],
    float_argument_registers: Some(8),
    floats_passed_as_doubles: false,
    fpr_stride: 1,
    callee_pops_arguments: true,
    helpers_pass_parameters_on_stack: false,
    java_sp: "rsp",
    ip: "rip",
    save_description: SaveDescription::PushMask,
    resolve: ResolveShape {
        slots_before_saves_in_data_resolve: 16,
        data_resolve_pushes: 35,
        recompilation_pushes: 9,
        virtual_method_pushes: 2,
        static_method_pushes: 1,
    },
    pc_mask: u64::MAX,
    low_bit_unloaded: false,
};

#[rustfmt::skip]
static X86_32: Catalog = Catalog {
    arch: Arch::X86_32,
    word_size: 4,
    endian: Endian::Little,
    names: &["eax", "ebx", "ecx", "edx", "edi", "esi", "ebp", "esp"],
    // esi ecx ebx
    callee_saved: &[5, 2, 1],
    callee_destroyed: &[0, 3, 4, 6, 7],
    register_map_mask: 0x7F,
    scan: ScanDirection::LowToHigh,
    argument_registers: &[],
    float_argument_registers: None,
    floats_passed_as_doubles: false,
    fpr_stride: 1,
    callee_pops_arguments: true,
    helpers_pass_parameters_on_stack: true,
    java_sp: "esp",
    ip: "eip",
    save_description: SaveDescription::PushMask,
    resolve: ResolveShape {
        slots_before_saves_in_data_resolve: 20,
        data_resolve_pushes: 32,
        recompilation_pushes: 3,
        virtual_method_pushes: 4,
        static_method_pushes: 1,
    },
    pc_mask: u64::MAX,
    low_bit_unloaded: false,
};

#[rustfmt::skip]
const PPC_NAMES: [&str; 32] = [
    "gpr0", "gpr1", "gpr2", "gpr3", "gpr4", "gpr5", "gpr6", "gpr7",
    "gpr8", "gpr9", "gpr10", "gpr11", "gpr12", "gpr13", "gpr14", "gpr15",
    "gpr16", "gpr17", "gpr18", "gpr19", "gpr20", "gpr21", "gpr22", "gpr23",
    "gpr24", "gpr25", "gpr26", "gpr27", "gpr28", "gpr29", "gpr30", "gpr31",
];

const PPC_RESOLVE: ResolveShape = ResolveShape {
    slots_before_saves_in_data_resolve: 0,
    data_resolve_pushes: 33,
    recompilation_pushes: 3,
    virtual_method_pushes: 0,
    static_method_pushes: 0,
};

#[rustfmt::skip]
static PPC64: Catalog = Catalog {
    arch: Arch::Ppc64,
    word_size: 8,
    endian: Endian::Big,
    names: &PPC_NAMES,
    callee_saved: &[31, 30, 29, 28, 27, 26, 25, 24, 23, 22, 21, 20, 19, 18, 17, 16],
    callee_destroyed: &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    register_map_mask: 0xFFFF_FFFF,
    scan: ScanDirection::HighToLow,
    argument_registers: &[3, 4, 5, 6, 7, 8, 9, 10],
    float_argument_registers: Some(8),
    floats_passed_as_doubles: true,
    fpr_stride: 1,
    callee_pops_arguments: false,
    helpers_pass_parameters_on_stack: false,
    java_sp: "gpr14",
    ip: "pc",
    save_description: SaveDescription::GprRange,
    resolve: PPC_RESOLVE,
    pc_mask: u64::MAX,
    low_bit_unloaded: true,
};

#[rustfmt::skip]
static PPC32: Catalog = Catalog {
    arch: Arch::Ppc32,
    word_size: 4,
    endian: Endian::Big,
    names: &PPC_NAMES,
    callee_saved: &[31, 30, 29, 28, 27, 26, 25, 24, 23, 22, 21, 20, 19, 18, 17, 16, 15],
    callee_destroyed: &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14],
    register_map_mask: 0xFFFF_FFFF,
    scan: ScanDirection::HighToLow,
    argument_registers: &[3, 4, 5, 6, 7, 8, 9, 10],
    float_argument_registers: Some(8),
    floats_passed_as_doubles: true,
    fpr_stride: 1,
    callee_pops_arguments: false,
    helpers_pass_parameters_on_stack: false,
    java_sp: "gpr14",
    ip: "pc",
    save_description: SaveDescription::GprRange,
    resolve: PPC_RESOLVE,
    pc_mask: u64::MAX,
    low_bit_unloaded: true,
};

#[rustfmt::skip]
static S390X: Catalog = Catalog {
    arch: Arch::S390x,
    word_size: 8,
    endian: Endian::Big,
    names: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7",
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
    ],
    callee_saved: &[12, 11, 10, 9, 8, 7, 6],
    callee_destroyed: &[0, 1, 2, 3, 4, 5, 13, 14, 15],
    register_map_mask: 0xFFFF,
    scan: ScanDirection::HighToLow,
    argument_registers: &[1, 2, 3],
    float_argument_registers: Some(4),
    floats_passed_as_doubles: false,
    // FPR0/2/4/6 carry arguments
    fpr_stride: 2,
    callee_pops_arguments: false,
    helpers_pass_parameters_on_stack: false,
    java_sp: "r5",
    ip: "psw",
    save_description: SaveDescription::MaskAndOffset,
    resolve: ResolveShape {
        slots_before_saves_in_data_resolve: 0,
        data_resolve_pushes: 16,
        recompilation_pushes: 7 + 64 / 8,
        virtual_method_pushes: 0,
        static_method_pushes: 0,
    },
    pc_mask: u64::MAX,
    low_bit_unloaded: false,
};

// 31-bit s390 saves both halves of the 64-bit GPRs; ids 16..31 are the
// high halves.
#[rustfmt::skip]
static S390_31: Catalog = Catalog {
    arch: Arch::S390,
    word_size: 4,
    endian: Endian::Big,
    names: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7",
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
        "hr0", "hr1", "hr2", "hr3", "hr4", "hr5", "hr6", "hr7",
        "hr8", "hr9", "hr10", "hr11", "hr12", "hr13", "hr14", "hr15",
    ],
    callee_saved: &[28, 27, 26, 25, 24, 23, 22, 12, 11, 10, 9, 8, 7, 6],
    callee_destroyed: &[
        0, 1, 2, 3, 4, 5, 13, 14, 15,
        16, 17, 18, 19, 20, 21, 29, 30, 31,
    ],
    register_map_mask: 0xFFFF,
    scan: ScanDirection::HighToLow,
    argument_registers: &[1, 2, 3],
    float_argument_registers: Some(4),
    floats_passed_as_doubles: false,
    fpr_stride: 2,
    callee_pops_arguments: false,
    helpers_pass_parameters_on_stack: false,
    java_sp: "r5",
    ip: "psw",
    save_description: SaveDescription::MaskAndOffset,
    resolve: ResolveShape {
        slots_before_saves_in_data_resolve: 0,
        data_resolve_pushes: 32,
        recompilation_pushes: 7 + 64 / 4,
        virtual_method_pushes: 0,
        static_method_pushes: 0,
    },
    pc_mask: 0x7FFF_FFFF,
    low_bit_unloaded: false,
};
