use std::fmt;

use crate::cpu::register::{R, OperandSize, AddressSize};
use crate::cpu::segment::Segment;
use crate::cpu::vcpu::Vcpu;
use crate::error::{Error, Gap};
use crate::memory::PAGE_SIZE;

#[cfg(test)]
#[path = "./operand_test.rs"]
mod operand_test;

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum OperandKind {
    Register,
    Segment,
    Immediate,
    Memory,
    FarPointer,
}

/// truncating conversion out of an operand's 64-bit value cache
pub trait Truncate {
    fn truncate(val: u64) -> Self;
}

macro_rules! impl_truncate {
    ($($t:ty),*) => {
        $(
            impl Truncate for $t {
                fn truncate(val: u64) -> Self {
                    val as $t
                }
            }
        )*
    };
}

impl_truncate!(u8, u16, u32, u64, i8, i16, i32, i64);

/// a view of a general purpose register at some width
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Gpr {
    pub reg: R,
    pub size: OperandSize,

    /// AH, CH, DH, BH
    pub high_byte: bool,
}

impl Gpr {
    pub fn new(reg: R, size: OperandSize) -> Self {
        Gpr { reg, size, high_byte: false }
    }

    pub fn high(reg: R) -> Self {
        Gpr { reg, size: OperandSize::_8bit, high_byte: true }
    }

    pub fn read(&self, vcpu: &dyn Vcpu) -> u64 {
        let full = vcpu.read_reg(self.reg);
        if self.high_byte {
            (full >> 8) & 0xFF
        } else {
            full & self.size.mask()
        }
    }

    /// writes `val` with x86-64 semantics: 8 and 16-bit writes merge, 32-bit writes zero-extend
    pub fn write(&self, vcpu: &mut dyn Vcpu, val: u64) {
        let full = vcpu.read_reg(self.reg);
        let res = match self.size {
            OperandSize::_8bit if self.high_byte => (full & !0xFF00) | ((val & 0xFF) << 8),
            OperandSize::_8bit => (full & !0xFF) | (val & 0xFF),
            OperandSize::_16bit => (full & !0xFFFF) | (val & 0xFFFF),
            OperandSize::_32bit => val & 0xFFFF_FFFF,
            OperandSize::_64bit => val,
        };
        vcpu.write_reg(self.reg, res);
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.reg.as_str(self.size, self.high_byte))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisterOperand {
    pub gpr: Gpr,
    value: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentOperand {
    pub segment: Segment,
    value: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImmediateOperand {
    pub size: OperandSize,
    value: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FarPointerOperand {
    pub selector: u16,
    pub offset: u64,
    pub size: OperandSize,
}

/// where the last read or write of a memory operand went
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Access {
    pub linear: u64,
    pub physical: u64,

    /// false for device backed memory and for accesses spanning two pages
    pub host_accessible: bool,

    /// the access crosses into a second page, which may map anywhere
    pub split: bool,
}

impl Access {
    /// reads through the vcpu, translating each page of a split access on its own
    fn read(&self, vcpu: &mut dyn Vcpu, data: &mut [u8]) -> Result<(), Error> {
        if self.split {
            return vcpu.read_linear(self.linear, None, data);
        }
        if vcpu.read_phys(self.physical, data) {
            Ok(())
        } else {
            Err(Error::Fault(self.linear))
        }
    }

    fn write(&self, vcpu: &mut dyn Vcpu, data: &[u8]) -> Result<(), Error> {
        if self.split {
            return vcpu.write_linear(self.linear, data);
        }
        if vcpu.write_phys(self.physical, data) {
            Ok(())
        } else {
            Err(Error::Fault(self.linear))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryOperand {
    pub size: OperandSize,
    pub segment: Segment,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub displacement: Option<i64>,
    pub address_size: AddressSize,
    value: u64,

    /// stand-in for locations that are not host accessible
    scratch: [u8; 8],

    /// valid for one read/write cycle
    access: Option<Access>,
}

impl MemoryOperand {
    pub fn new(size: OperandSize, segment: Segment, address_size: AddressSize) -> Self {
        MemoryOperand {
            size,
            segment,
            base: None,
            index: None,
            scale: 1,
            displacement: None,
            address_size,
            value: 0,
            scratch: [0; 8],
            access: None,
        }
    }

    pub fn with_base(mut self, base: Gpr) -> Self {
        self.base = Some(base);
        self
    }

    /// scale is clamped to at least 1
    pub fn with_index(mut self, index: Gpr, scale: u8) -> Self {
        self.index = Some(index);
        self.scale = scale.max(1);
        self
    }

    pub fn with_displacement(mut self, disp: i64) -> Self {
        self.displacement = Some(disp);
        self
    }

    /// the same addressing form, `bytes` further into memory and `size` wide
    pub fn offset_by(&self, bytes: i64, size: OperandSize) -> Self {
        let disp = self.displacement.unwrap_or(0).wrapping_add(bytes);
        let mut res = MemoryOperand::new(size, self.segment, self.address_size);
        res.base = self.base;
        res.index = self.index;
        res.scale = self.scale;
        res.displacement = Some(disp);
        res
    }

    /// base + index * scale + displacement, truncated to the address size
    pub fn effective_address(&self, vcpu: &dyn Vcpu) -> u64 {
        let mut ea = 0u64;
        if let Some(base) = self.base {
            ea = ea.wrapping_add(base.read(vcpu));
        }
        if let Some(index) = self.index {
            ea = ea.wrapping_add(index.read(vcpu).wrapping_mul(u64::from(self.scale.max(1))));
        }
        if let Some(disp) = self.displacement {
            ea = ea.wrapping_add(disp as u64);
        }
        ea & self.address_size.mask()
    }

    pub fn linear_address(&self, vcpu: &dyn Vcpu) -> u64 {
        let ea = self.effective_address(vcpu);
        if vcpu.is_long_mode() {
            match self.segment {
                Segment::FS | Segment::GS => vcpu.read_segment(self.segment).base.wrapping_add(ea),
                _ => ea,
            }
        } else {
            vcpu.read_segment(self.segment).base.wrapping_add(ea) & 0xFFFF_FFFF
        }
    }

    /// resolves the guest physical address of the operand, valid until the next resolve
    pub fn resolve(&mut self, vcpu: &mut dyn Vcpu, len: usize) -> Result<Access, Error> {
        self.access = None;
        let linear = self.linear_address(vcpu);
        let physical = match vcpu.translate(linear, None) {
            Some(gpa) => gpa,
            None => return Err(Error::Fault(linear)),
        };
        let split = (linear % PAGE_SIZE) as usize + len > PAGE_SIZE as usize;
        if split {
            let next = (linear | (PAGE_SIZE - 1)).wrapping_add(1);
            if vcpu.translate(next, None).is_none() {
                return Err(Error::Fault(next));
            }
        }
        let host_accessible = !split && vcpu.host_memory(physical, len).is_some();
        if !host_accessible {
            debug!("{} at {:#X} resolves to {:#X} without a host view", self, linear, physical);
        }
        let access = Access { linear, physical, host_accessible, split };
        self.access = Some(access);
        Ok(access)
    }

    /// the result of the last resolve, if any
    pub fn access(&self) -> Option<Access> {
        self.access
    }

    pub fn is_host_accessible(&self) -> bool {
        self.access.map_or(false, |a| a.host_accessible)
    }

    pub fn read_bytes(&mut self, vcpu: &mut dyn Vcpu, data: &mut [u8]) -> Result<(), Error> {
        let access = self.resolve(vcpu, data.len())?;
        if access.host_accessible {
            if let Some(mem) = vcpu.host_memory(access.physical, data.len()) {
                data.copy_from_slice(mem);
                return Ok(());
            }
        }
        access.read(vcpu, data)
    }

    pub fn write_bytes(&mut self, vcpu: &mut dyn Vcpu, data: &[u8]) -> Result<(), Error> {
        let access = self.resolve(vcpu, data.len())?;
        if access.host_accessible {
            if let Some(mem) = vcpu.host_memory(access.physical, data.len()) {
                mem.copy_from_slice(data);
                return Ok(());
            }
        }
        access.write(vcpu, data)
    }

    fn read(&mut self, vcpu: &mut dyn Vcpu) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        let len = self.size.bytes();
        self.read_bytes(vcpu, &mut buf[..len])?;
        self.scratch = buf;
        self.value = u64::from_le_bytes(buf);
        Ok(())
    }

    fn write(&mut self, vcpu: &mut dyn Vcpu) -> Result<(), Error> {
        let buf = self.value.to_le_bytes();
        let len = self.size.bytes();
        self.write_bytes(vcpu, &buf[..len])?;
        self.scratch = buf;
        Ok(())
    }

    /// Runs `f` on the memory location itself when it is host accessible, otherwise
    /// on a private stand-in holding the current contents. The value cache reflects
    /// the location afterwards. A modified stand-in must be committed with `write()`.
    pub fn with_location<T, F>(&mut self, vcpu: &mut dyn Vcpu, f: F) -> Result<T, Error>
        where F: FnOnce(&mut [u8]) -> T
    {
        let len = self.size.bytes();
        let access = self.resolve(vcpu, len)?;
        if access.host_accessible {
            if let Some(mem) = vcpu.host_memory(access.physical, len) {
                let res = f(mem);
                let mut buf = [0u8; 8];
                buf[..len].copy_from_slice(mem);
                self.value = u64::from_le_bytes(buf);
                return Ok(res);
            }
        }
        let mut buf = [0u8; 8];
        access.read(vcpu, &mut buf[..len])?;
        self.scratch = buf;
        let res = f(&mut self.scratch[..len]);
        self.value = u64::from_le_bytes(self.scratch);
        Ok(res)
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let size = match self.size {
            OperandSize::_8bit => "byte",
            OperandSize::_16bit => "word",
            OperandSize::_32bit => "dword",
            OperandSize::_64bit => "qword",
        };
        let mut parts = String::new();
        if let Some(base) = self.base {
            parts.push_str(&base.to_string());
        }
        if let Some(index) = self.index {
            if !parts.is_empty() {
                parts.push('+');
            }
            parts.push_str(&index.to_string());
            if self.scale > 1 {
                parts.push_str(&format!("*{}", self.scale));
            }
        }
        if let Some(disp) = self.displacement {
            if parts.is_empty() {
                parts.push_str(&format!("0x{:X}", disp));
            } else if disp < 0 {
                parts.push_str(&format!("-0x{:X}", (disp as i128).abs()));
            } else {
                parts.push_str(&format!("+0x{:X}", disp));
            }
        }
        write!(f, "{} [{}:{}]", size, self.segment, parts)
    }
}

/// a typed handle to one instruction argument
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Register(RegisterOperand),
    Segment(SegmentOperand),
    Immediate(ImmediateOperand),
    Memory(MemoryOperand),
    FarPointer(FarPointerOperand),
}

impl Operand {
    pub fn register(reg: R, size: OperandSize) -> Self {
        Operand::Register(RegisterOperand { gpr: Gpr::new(reg, size), value: 0 })
    }

    pub fn gpr(gpr: Gpr) -> Self {
        Operand::Register(RegisterOperand { gpr, value: 0 })
    }

    pub fn segment(segment: Segment) -> Self {
        Operand::Segment(SegmentOperand { segment, value: 0 })
    }

    pub fn immediate(val: u64, size: OperandSize) -> Self {
        Operand::Immediate(ImmediateOperand { size, value: val & size.mask() })
    }

    pub fn memory(mem: MemoryOperand) -> Self {
        Operand::Memory(mem)
    }

    pub fn far_pointer(selector: u16, offset: u64, size: OperandSize) -> Self {
        Operand::FarPointer(FarPointerOperand { selector, offset, size })
    }

    pub fn kind(&self) -> OperandKind {
        match *self {
            Operand::Register(_) => OperandKind::Register,
            Operand::Segment(_) => OperandKind::Segment,
            Operand::Immediate(_) => OperandKind::Immediate,
            Operand::Memory(_) => OperandKind::Memory,
            Operand::FarPointer(_) => OperandKind::FarPointer,
        }
    }

    pub fn size(&self) -> OperandSize {
        match *self {
            Operand::Register(ref r) => r.gpr.size,
            Operand::Segment(_) => OperandSize::_16bit,
            Operand::Immediate(ref i) => i.size,
            Operand::Memory(ref m) => m.size,
            Operand::FarPointer(ref p) => p.size,
        }
    }

    /// the cached value
    pub fn value(&self) -> u64 {
        match *self {
            Operand::Register(ref r) => r.value,
            Operand::Segment(ref s) => s.value,
            Operand::Immediate(ref i) => i.value,
            Operand::Memory(ref m) => m.value,
            Operand::FarPointer(ref p) => p.offset,
        }
    }

    pub fn get<T: Truncate>(&self) -> T {
        T::truncate(self.value())
    }

    /// sets the cached value, truncated to the operand width
    pub fn set(&mut self, val: u64) {
        let val = val & self.size().mask();
        match *self {
            Operand::Register(ref mut r) => r.value = val,
            Operand::Segment(ref mut s) => s.value = val,
            Operand::Immediate(ref mut i) => i.value = val,
            Operand::Memory(ref mut m) => m.value = val,
            Operand::FarPointer(ref mut p) => p.offset = val,
        }
    }

    /// populates the value cache from the operand's source
    pub fn read(&mut self, vcpu: &mut dyn Vcpu) -> Result<(), Error> {
        match *self {
            Operand::Register(ref mut r) => {
                r.value = r.gpr.read(vcpu);
                Ok(())
            }
            Operand::Segment(ref mut s) => {
                s.value = u64::from(vcpu.read_segment(s.segment).selector);
                Ok(())
            }
            Operand::Immediate(_) | Operand::FarPointer(_) => Ok(()),
            Operand::Memory(ref mut m) => m.read(vcpu),
        }
    }

    /// commits the value cache to the operand's location.
    /// segment writes only replace the selector, the caller reloads the descriptor cache
    pub fn write(&mut self, vcpu: &mut dyn Vcpu) -> Result<(), Error> {
        match *self {
            Operand::Register(ref r) => {
                r.gpr.write(vcpu, r.value);
                Ok(())
            }
            Operand::Segment(ref s) => {
                let mut desc = vcpu.read_segment(s.segment);
                desc.selector = s.value as u16;
                vcpu.write_segment(s.segment, desc);
                Ok(())
            }
            Operand::Immediate(_) | Operand::FarPointer(_) => Err(Gap::OperandKind.into()),
            Operand::Memory(ref mut m) => m.write(vcpu),
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryOperand> {
        match *self {
            Operand::Memory(ref m) => Some(m),
            _ => None,
        }
    }

    pub fn as_memory_mut(&mut self) -> Option<&mut MemoryOperand> {
        match *self {
            Operand::Memory(ref mut m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Operand::Register(ref r) => write!(f, "{}", r.gpr),
            Operand::Segment(ref s) => write!(f, "{}", s.segment),
            Operand::Immediate(ref i) => match i.size {
                OperandSize::_8bit => write!(f, "0x{:02X}", i.value),
                OperandSize::_16bit => write!(f, "0x{:04X}", i.value),
                OperandSize::_32bit => write!(f, "0x{:08X}", i.value),
                OperandSize::_64bit => write!(f, "0x{:016X}", i.value),
            },
            Operand::Memory(ref m) => write!(f, "{}", m),
            Operand::FarPointer(ref p) => write!(f, "{:04X}:{:X}", p.selector, p.offset),
        }
    }
}
