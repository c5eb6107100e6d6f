use std::collections::BTreeMap;
use std::fmt;

use crate::cpu::flag::FLAG_RESERVED;
use crate::cpu::segment::{Segment, SegmentDescriptor};

#[cfg(test)]
#[path = "./register_test.rs"]
mod register_test;

/// architectural 64-bit registers exposed by the vcpu
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum R {
    RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI,
    R8, R9, R10, R11, R12, R13, R14, R15,
    RIP, RFLAGS,
    CR0, CR3, CR4,
}

impl R {
    /// returns the encoding index for general purpose registers
    pub fn index(self) -> Option<usize> {
        match self {
            R::RAX => Some(0),
            R::RCX => Some(1),
            R::RDX => Some(2),
            R::RBX => Some(3),
            R::RSP => Some(4),
            R::RBP => Some(5),
            R::RSI => Some(6),
            R::RDI => Some(7),
            R::R8 => Some(8),
            R::R9 => Some(9),
            R::R10 => Some(10),
            R::R11 => Some(11),
            R::R12 => Some(12),
            R::R13 => Some(13),
            R::R14 => Some(14),
            R::R15 => Some(15),
            _ => None,
        }
    }

    /// name of the register viewed at `size`
    pub fn as_str(self, size: OperandSize, high_byte: bool) -> &'static str {
        const NAMES: [[&str; 4]; 16] = [
            ["al", "ax", "eax", "rax"],
            ["cl", "cx", "ecx", "rcx"],
            ["dl", "dx", "edx", "rdx"],
            ["bl", "bx", "ebx", "rbx"],
            ["spl", "sp", "esp", "rsp"],
            ["bpl", "bp", "ebp", "rbp"],
            ["sil", "si", "esi", "rsi"],
            ["dil", "di", "edi", "rdi"],
            ["r8b", "r8w", "r8d", "r8"],
            ["r9b", "r9w", "r9d", "r9"],
            ["r10b", "r10w", "r10d", "r10"],
            ["r11b", "r11w", "r11d", "r11"],
            ["r12b", "r12w", "r12d", "r12"],
            ["r13b", "r13w", "r13d", "r13"],
            ["r14b", "r14w", "r14d", "r14"],
            ["r15b", "r15w", "r15d", "r15"],
        ];
        match self.index() {
            Some(i) if high_byte && i < 4 => ["ah", "ch", "dh", "bh"][i],
            Some(i) => NAMES[i][size.index()],
            None => match self {
                R::RIP => "rip",
                R::RFLAGS => "rflags",
                R::CR0 => "cr0",
                R::CR3 => "cr3",
                R::CR4 => "cr4",
                _ => unreachable!(),
            },
        }
    }
}

impl fmt::Display for R {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str(OperandSize::_64bit, false))
    }
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum OperandSize {
    /// byte: 0-FF
    _8bit,

    /// word: 0-FFFF
    _16bit,

    /// dword: 0-FFFFFFFF
    _32bit,

    /// qword
    _64bit,
}

impl OperandSize {
    pub fn from_bits(bits: usize) -> Option<Self> {
        match bits {
            8 => Some(OperandSize::_8bit),
            16 => Some(OperandSize::_16bit),
            32 => Some(OperandSize::_32bit),
            64 => Some(OperandSize::_64bit),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            OperandSize::_8bit => 8,
            OperandSize::_16bit => 16,
            OperandSize::_32bit => 32,
            OperandSize::_64bit => 64,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    pub fn mask(self) -> u64 {
        match self {
            OperandSize::_64bit => u64::max_value(),
            _ => (1u64 << self.bits()) - 1,
        }
    }

    /// position in per-width tables
    pub fn index(self) -> usize {
        match self {
            OperandSize::_8bit => 0,
            OperandSize::_16bit => 1,
            OperandSize::_32bit => 2,
            OperandSize::_64bit => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum AddressSize {
    _16bit, _32bit, _64bit,
}

impl AddressSize {
    pub fn bits(self) -> u32 {
        match self {
            AddressSize::_16bit => 16,
            AddressSize::_32bit => 32,
            AddressSize::_64bit => 64,
        }
    }

    pub fn mask(self) -> u64 {
        self.operand_size().mask()
    }

    /// the width of index registers (SI/ESI/RSI) used with this address size
    pub fn operand_size(self) -> OperandSize {
        match self {
            AddressSize::_16bit => OperandSize::_16bit,
            AddressSize::_32bit => OperandSize::_32bit,
            AddressSize::_64bit => OperandSize::_64bit,
        }
    }
}

/// descriptor table registers
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum TableRegister {
    GDTR, IDTR, LDTR, TR,
}

pub const MSR_EFER: u32 = 0xC000_0080;
pub const MSR_STAR: u32 = 0xC000_0081;
pub const MSR_LSTAR: u32 = 0xC000_0082;
pub const MSR_FMASK: u32 = 0xC000_0084;

pub const CR0_PE: u64 = 1;
pub const CR0_PG: u64 = 1 << 31;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

/// complete architectural state of one virtual cpu
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterState {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    /// ES, CS, SS, DS, FS, GS
    pub segments: [SegmentDescriptor; 6],

    pub gdtr: SegmentDescriptor,
    pub idtr: SegmentDescriptor,
    pub ldtr: SegmentDescriptor,
    pub tr: SegmentDescriptor,

    pub msrs: BTreeMap<u32, u64>,
}

impl Default for RegisterState {
    fn default() -> Self {
        RegisterState {
            gpr: [0; 16],
            rip: 0,
            rflags: FLAG_RESERVED,
            cr0: 0,
            cr3: 0,
            cr4: 0,
            segments: [SegmentDescriptor::default(); 6],
            gdtr: SegmentDescriptor::default(),
            idtr: SegmentDescriptor::default(),
            ldtr: SegmentDescriptor::unusable(0),
            tr: SegmentDescriptor::default(),
            msrs: BTreeMap::new(),
        }
    }
}

impl RegisterState {
    pub fn get(&self, r: R) -> u64 {
        match r {
            R::RIP => self.rip,
            R::RFLAGS => self.rflags,
            R::CR0 => self.cr0,
            R::CR3 => self.cr3,
            R::CR4 => self.cr4,
            _ => self.gpr[r.index().unwrap_or(0)],
        }
    }

    pub fn set(&mut self, r: R, val: u64) {
        match r {
            R::RIP => self.rip = val,
            R::RFLAGS => self.rflags = val | FLAG_RESERVED,
            R::CR0 => self.cr0 = val,
            R::CR3 => self.cr3 = val,
            R::CR4 => self.cr4 = val,
            _ => self.gpr[r.index().unwrap_or(0)] = val,
        }
    }

    pub fn segment(&self, seg: Segment) -> SegmentDescriptor {
        self.segments[seg.index()]
    }

    pub fn set_segment(&mut self, seg: Segment, desc: SegmentDescriptor) {
        self.segments[seg.index()] = desc;
    }

    pub fn table(&self, t: TableRegister) -> SegmentDescriptor {
        match t {
            TableRegister::GDTR => self.gdtr,
            TableRegister::IDTR => self.idtr,
            TableRegister::LDTR => self.ldtr,
            TableRegister::TR => self.tr,
        }
    }

    pub fn set_table(&mut self, t: TableRegister, desc: SegmentDescriptor) {
        match t {
            TableRegister::GDTR => self.gdtr = desc,
            TableRegister::IDTR => self.idtr = desc,
            TableRegister::LDTR => self.ldtr = desc,
            TableRegister::TR => self.tr = desc,
        }
    }
}
