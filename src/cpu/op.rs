use crate::cpu::flag::Flags;

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Op {
    Add,
    Adc,
    And,
    Cmp,
    Dec,
    Inc,
    Neg,
    Not,
    Or,
    Sar,
    Sbb,
    Shl,

    /// encoded identically to Shl
    Sal,

    Shr,
    Sub,
    Test,
    Xchg,
    Xor,

    Mov,
    Movzx,

    /// Move Data After Swapping Bytes
    Movbe,

    Lea,
    Movsb,
    Movsw,
    Movsd,
    Movsq,
    Stosb,
    Stosw,
    Stosd,
    Stosq,

    /// near or far, see `Instruction::is_far_branch`
    Jmp,

    /// Jump if condition is met
    Jcc(Condition),

    Call,
    Ret,
    Iret,

    /// Fast System Call
    Syscall,

    /// Return From Fast System Call
    Sysret,

    /// Store Global Descriptor Table Register
    Sgdt,

    /// Store Interrupt Descriptor Table Register
    Sidt,

    Lgdt,
    Lidt,

    /// Store Task Register
    Str,

    /// Store Local Descriptor Table Register
    Sldt,

    Lldt,
    Ltr,

    /// Set Interrupt Flag
    Sti,

    /// Clear Interrupt Flag
    Cli,

    /// Output to Port
    Out,

    Cpuid,
    Nop,

    /// decoded, but outside of the emulated instruction set
    Unknown,
}

impl Op {
    /// string instructions honour the REP prefix
    pub fn is_string(&self) -> bool {
        match *self {
            Op::Movsb | Op::Movsw | Op::Movsd | Op::Movsq |
            Op::Stosb | Op::Stosw | Op::Stosd | Op::Stosq => true,
            _ => false,
        }
    }
}

/// condition codes of the Jcc family, in encoding order
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Condition {
    /// overflow (OF=1)
    O,
    No,

    /// below (CF=1).    (alias: jc, jnae)
    B,

    /// above or equal (CF=0).    (alias: jnc, jnb)
    Ae,

    /// equal (ZF=1).    (alias: jz)
    E,
    Ne,

    /// below or equal (CF=1 or ZF=1).    (alias: jna)
    Be,

    /// above (CF=0 and ZF=0).    (alias: jnbe)
    A,

    S,
    Ns,

    /// parity even (PF=1)
    P,
    Np,

    /// less (SF ≠ OF).    (alias: jnge)
    L,

    /// greater or equal (SF=OF).    (alias: jnl)
    Ge,

    /// less or equal (ZF=1 or SF ≠ OF).    (alias: jng)
    Le,

    /// greater (ZF=0 and SF=OF).    (alias: jnle)
    G,
}

const CONDITIONS: [fn(Flags) -> bool; 16] = [
    |f| f.overflow(),
    |f| !f.overflow(),
    |f| f.carry(),
    |f| !f.carry(),
    |f| f.zero(),
    |f| !f.zero(),
    |f| f.carry() || f.zero(),
    |f| !f.carry() && !f.zero(),
    |f| f.sign(),
    |f| !f.sign(),
    |f| f.parity(),
    |f| !f.parity(),
    |f| f.sign() != f.overflow(),
    |f| f.sign() == f.overflow(),
    |f| f.zero() || f.sign() != f.overflow(),
    |f| !f.zero() && f.sign() == f.overflow(),
];

impl Condition {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_met(self, flags: Flags) -> bool {
        CONDITIONS[self.index()](flags)
    }
}
