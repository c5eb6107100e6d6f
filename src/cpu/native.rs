//! Host executed ALU fragments.
//!
//! Every fragment imports the caller supplied status flags into the host RFLAGS,
//! executes the real instruction and hands the resulting RFLAGS back, so guest
//! flag semantics are exactly those of the hardware.

use std::arch::asm;

use crate::cpu::flag::{ARITH_MASK, FLAG_CF};
use crate::cpu::op::Op;
use crate::cpu::register::OperandSize;

#[cfg(test)]
#[path = "./native_test.rs"]
mod native_test;

type RegisterFn = fn(&mut u64, &mut u64, u64) -> u64;
type MemoryFn = fn(&mut [u8], &mut u64, u64) -> u64;

/// the native forms of one operation at one width
pub struct Fragments {
    width: usize,
    register: RegisterFn,
    memory: MemoryFn,
    locked: Option<MemoryFn>,
}

impl Fragments {
    /// Operates on `dst` in a register. `src` is the second operand (the shift
    /// count for shifts), and receives the old destination for XCHG.
    /// Returns the host flags after execution.
    pub fn run_register(&self, dst: &mut u64, src: &mut u64, flags: u64) -> u64 {
        (self.register)(dst, src, flags)
    }

    /// Operates in place on the first `width` bytes of `dst`
    pub fn run_memory(&self, dst: &mut [u8], src: &mut u64, flags: u64, lock: bool) -> u64 {
        let dst = &mut dst[..self.width];
        match self.locked {
            Some(locked) if lock => locked(dst, src, flags),
            _ => (self.memory)(dst, src, flags),
        }
    }

    pub fn is_lockable(&self) -> bool {
        self.locked.is_some()
    }
}

macro_rules! binary_register {
    ($mn:literal, $w:literal) => {
        |d: &mut u64, s: &mut u64, flags: u64| -> u64 {
            let mut f = flags;
            unsafe {
                asm!(
                    "pushfq",
                    "and qword ptr [rsp], {keep}",
                    "or qword ptr [rsp], {f}",
                    "popfq",
                    concat!($mn, " {d:", $w, "}, {s:", $w, "}"),
                    "pushfq",
                    "pop {f}",
                    d = inout(reg) *d,
                    s = inout(reg) *s,
                    f = inout(reg) f,
                    keep = in(reg) !ARITH_MASK,
                );
            }
            f
        }
    };
}

macro_rules! binary_memory {
    ($lock:literal, $mn:literal, $ptr:literal, $w:literal) => {
        |d: &mut [u8], s: &mut u64, flags: u64| -> u64 {
            let mut f = flags;
            unsafe {
                asm!(
                    "pushfq",
                    "and qword ptr [rsp], {keep}",
                    "or qword ptr [rsp], {f}",
                    "popfq",
                    concat!($lock, $mn, " ", $ptr, " ptr [{m}], {s:", $w, "}"),
                    "pushfq",
                    "pop {f}",
                    m = in(reg) d.as_mut_ptr(),
                    s = inout(reg) *s,
                    f = inout(reg) f,
                    keep = in(reg) !ARITH_MASK,
                );
            }
            f
        }
    };
}

macro_rules! unary_register {
    ($mn:literal, $w:literal) => {
        |d: &mut u64, _s: &mut u64, flags: u64| -> u64 {
            let mut f = flags;
            unsafe {
                asm!(
                    "pushfq",
                    "and qword ptr [rsp], {keep}",
                    "or qword ptr [rsp], {f}",
                    "popfq",
                    concat!($mn, " {d:", $w, "}"),
                    "pushfq",
                    "pop {f}",
                    d = inout(reg) *d,
                    f = inout(reg) f,
                    keep = in(reg) !ARITH_MASK,
                );
            }
            f
        }
    };
}

macro_rules! unary_memory {
    ($lock:literal, $mn:literal, $ptr:literal, $w:literal) => {
        |d: &mut [u8], _s: &mut u64, flags: u64| -> u64 {
            let mut f = flags;
            unsafe {
                asm!(
                    "pushfq",
                    "and qword ptr [rsp], {keep}",
                    "or qword ptr [rsp], {f}",
                    "popfq",
                    concat!($lock, $mn, " ", $ptr, " ptr [{m}]"),
                    "pushfq",
                    "pop {f}",
                    m = in(reg) d.as_mut_ptr(),
                    f = inout(reg) f,
                    keep = in(reg) !ARITH_MASK,
                );
            }
            f
        }
    };
}

macro_rules! shift_register {
    ($mn:literal, $w:literal) => {
        |d: &mut u64, s: &mut u64, flags: u64| -> u64 {
            let mut f = flags;
            unsafe {
                asm!(
                    "pushfq",
                    "and qword ptr [rsp], {keep}",
                    "or qword ptr [rsp], {f}",
                    "popfq",
                    concat!($mn, " {d:", $w, "}, cl"),
                    "pushfq",
                    "pop {f}",
                    d = inout(reg) *d,
                    f = inout(reg) f,
                    keep = in(reg) !ARITH_MASK,
                    in("cl") *s as u8,
                );
            }
            f
        }
    };
}

macro_rules! shift_memory {
    ($lock:literal, $mn:literal, $ptr:literal, $w:literal) => {
        |d: &mut [u8], s: &mut u64, flags: u64| -> u64 {
            let mut f = flags;
            unsafe {
                asm!(
                    "pushfq",
                    "and qword ptr [rsp], {keep}",
                    "or qword ptr [rsp], {f}",
                    "popfq",
                    concat!($mn, " ", $ptr, " ptr [{m}], cl"),
                    "pushfq",
                    "pop {f}",
                    m = in(reg) d.as_mut_ptr(),
                    f = inout(reg) f,
                    keep = in(reg) !ARITH_MASK,
                    in("cl") *s as u8,
                );
            }
            f
        }
    };
}

macro_rules! fragments {
    ($reg:ident, $mem:ident, $mn:literal, $bytes:literal, $ptr:literal, $w:literal, lock) => {
        Fragments {
            width: $bytes,
            register: $reg!($mn, $w),
            memory: $mem!("", $mn, $ptr, $w),
            locked: Some($mem!("lock ", $mn, $ptr, $w)),
        }
    };
    ($reg:ident, $mem:ident, $mn:literal, $bytes:literal, $ptr:literal, $w:literal, nolock) => {
        Fragments {
            width: $bytes,
            register: $reg!($mn, $w),
            memory: $mem!("", $mn, $ptr, $w),
            locked: None,
        }
    };
}

/// one table row: the 8, 16, 32 and 64-bit forms of `$mn`
macro_rules! row {
    ($reg:ident, $mem:ident, $mn:literal, $lock:ident) => {
        [
            fragments!($reg, $mem, $mn, 1, "byte", "l", $lock),
            fragments!($reg, $mem, $mn, 2, "word", "x", $lock),
            fragments!($reg, $mem, $mn, 4, "dword", "e", $lock),
            fragments!($reg, $mem, $mn, 8, "qword", "r", $lock),
        ]
    };
}

static TABLE: [[Fragments; 4]; 17] = [
    row!(binary_register, binary_memory, "add", lock),
    row!(binary_register, binary_memory, "or", lock),
    row!(binary_register, binary_memory, "adc", lock),
    row!(binary_register, binary_memory, "sbb", lock),
    row!(binary_register, binary_memory, "and", lock),
    row!(binary_register, binary_memory, "sub", lock),
    row!(binary_register, binary_memory, "xor", lock),
    row!(binary_register, binary_memory, "cmp", nolock),
    row!(binary_register, binary_memory, "test", nolock),
    // a memory operand makes xchg atomic without prefix
    row!(binary_register, binary_memory, "xchg", nolock),
    row!(unary_register, unary_memory, "inc", lock),
    row!(unary_register, unary_memory, "dec", lock),
    row!(unary_register, unary_memory, "neg", lock),
    row!(unary_register, unary_memory, "not", lock),
    row!(shift_register, shift_memory, "shl", nolock),
    row!(shift_register, shift_memory, "shr", nolock),
    row!(shift_register, shift_memory, "sar", nolock),
];

fn row_index(op: Op) -> Option<usize> {
    Some(match op {
        Op::Add => 0,
        Op::Or => 1,
        Op::Adc => 2,
        Op::Sbb => 3,
        Op::And => 4,
        Op::Sub => 5,
        Op::Xor => 6,
        Op::Cmp => 7,
        Op::Test => 8,
        Op::Xchg => 9,
        Op::Inc => 10,
        Op::Dec => 11,
        Op::Neg => 12,
        Op::Not => 13,
        Op::Shl | Op::Sal => 14,
        Op::Shr => 15,
        Op::Sar => 16,
        _ => return None,
    })
}

/// returns the native forms of `op` at `size`, if `op` is an ALU operation
pub fn lookup(op: Op, size: OperandSize) -> Option<&'static Fragments> {
    row_index(op).map(|row| &TABLE[row][size.index()])
}

/// the status flags `op` writes
pub fn affected_flags(op: Op) -> u64 {
    match op {
        Op::Inc | Op::Dec => ARITH_MASK & !FLAG_CF,
        Op::Not | Op::Xchg => 0,
        _ => ARITH_MASK,
    }
}

/// operations that only compute flags
pub fn is_readonly(op: Op) -> bool {
    match op {
        Op::Cmp | Op::Test => true,
        _ => false,
    }
}

/// single operand forms, the source slot is ignored
pub fn is_unary(op: Op) -> bool {
    match op {
        Op::Inc | Op::Dec | Op::Neg | Op::Not => true,
        _ => false,
    }
}

static SWAP: [fn(u64) -> u64; 4] = [
    |v| v & 0xFF,
    |v| u64::from((v as u16).swap_bytes()),
    |v| u64::from((v as u32).swap_bytes()),
    |v| v.swap_bytes(),
];

/// reverses the byte order of the low `size` bytes of `val`
pub fn swap_bytes(size: OperandSize, val: u64) -> u64 {
    SWAP[size.index()](val)
}
