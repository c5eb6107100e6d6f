#[cfg(test)]
#[path = "./flag_test.rs"]
mod flag_test;

/// https://en.wikipedia.org/wiki/FLAGS_register
pub const FLAG_CF: u64 = 0x0000_0001;
pub const FLAG_RESERVED: u64 = 0x0000_0002; // always 1
pub const FLAG_PF: u64 = 0x0000_0004;
pub const FLAG_AF: u64 = 0x0000_0010;
pub const FLAG_ZF: u64 = 0x0000_0040;
pub const FLAG_SF: u64 = 0x0000_0080;
pub const FLAG_TF: u64 = 0x0000_0100;
pub const FLAG_IF: u64 = 0x0000_0200;
pub const FLAG_DF: u64 = 0x0000_0400;
pub const FLAG_OF: u64 = 0x0000_0800;
pub const FLAG_IOPL: u64 = 0x0000_3000;
pub const FLAG_NT: u64 = 0x0000_4000;
pub const FLAG_RF: u64 = 0x0001_0000;
pub const FLAG_VM: u64 = 0x0002_0000;
pub const FLAG_AC: u64 = 0x0004_0000;
pub const FLAG_VIF: u64 = 0x0008_0000;
pub const FLAG_VIP: u64 = 0x0010_0000;
pub const FLAG_ID: u64 = 0x0020_0000;

/// status flags written by arithmetic instructions
pub const ARITH_MASK: u64 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// bits SYSRET may restore from R11
pub const SYSRET_MASK: u64 = 0x003C_7FD7;

/// RFLAGS viewed through its individual bits
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Flags(pub u64);

impl Flags {
    pub fn carry(self) -> bool {
        self.0 & FLAG_CF != 0
    }

    pub fn parity(self) -> bool {
        self.0 & FLAG_PF != 0
    }

    pub fn adjust(self) -> bool {
        self.0 & FLAG_AF != 0
    }

    pub fn zero(self) -> bool {
        self.0 & FLAG_ZF != 0
    }

    pub fn sign(self) -> bool {
        self.0 & FLAG_SF != 0
    }

    pub fn interrupt(self) -> bool {
        self.0 & FLAG_IF != 0
    }

    pub fn direction(self) -> bool {
        self.0 & FLAG_DF != 0
    }

    pub fn overflow(self) -> bool {
        self.0 & FLAG_OF != 0
    }

    pub fn nested_task(self) -> bool {
        self.0 & FLAG_NT != 0
    }

    pub fn virtual_8086(self) -> bool {
        self.0 & FLAG_VM != 0
    }

    pub fn iopl(self) -> u8 {
        ((self.0 & FLAG_IOPL) >> 12) as u8
    }

    /// replaces the bits selected by `mask` with those of `val`
    pub fn merge(self, val: u64, mask: u64) -> Flags {
        Flags((self.0 & !mask) | (val & mask) | FLAG_RESERVED)
    }
}

/// the flag bits IRET may modify, given the privilege state and operand width
pub fn iret_writable_mask(cpl: u8, iopl: u8, operand_bits: u32) -> u64 {
    let mut mask = ARITH_MASK | FLAG_TF | FLAG_DF | FLAG_NT | FLAG_RF | FLAG_AC | FLAG_ID;
    if cpl <= iopl {
        mask |= FLAG_IF;
    }
    if cpl == 0 {
        mask |= FLAG_IOPL | FLAG_VIF | FLAG_VIP;
    }
    if operand_bits == 16 {
        mask &= 0xFFFF;
    }
    mask
}
