use crate::cpu::register::TableRegister;
use crate::cpu::segment::{SegmentDescriptor, is_null_selector, ATTR_G};
use crate::cpu::vcpu::Vcpu;
use crate::error::{Error, Gap};

#[cfg(test)]
#[path = "./descriptor_test.rs"]
mod descriptor_test;

/// resolves segment selectors to descriptor caches
pub trait DescriptorTable {
    /// `is_64bit` selects 16-byte system descriptors
    fn parse_gdt(&self, vcpu: &mut dyn Vcpu, selector: u16, is_64bit: bool) -> Result<SegmentDescriptor, Error>;
}

/// reads descriptors from the guest's GDT or LDT
#[derive(Clone, Copy, Debug, Default)]
pub struct GdtParser;

impl GdtParser {
    pub fn new() -> Self {
        GdtParser
    }
}

/// decodes the low 8 bytes of a descriptor into the cached form
pub fn decode_descriptor(selector: u16, raw: u64) -> SegmentDescriptor {
    let mut limit = ((raw & 0xFFFF) | ((raw >> 32) & 0xF_0000)) as u32;
    let base = ((raw >> 16) & 0xFF_FFFF) | ((raw >> 32) & 0xFF00_0000);
    let access = ((raw >> 40) & 0xFF) as u32;
    let flags = ((raw >> 52) & 0xF) as u32;
    let attrib = access | (flags << 12);
    if attrib & ATTR_G != 0 {
        limit = (limit << 12) | 0xFFF;
    }
    SegmentDescriptor::new(selector, attrib, limit, base)
}

impl DescriptorTable for GdtParser {
    fn parse_gdt(&self, vcpu: &mut dyn Vcpu, selector: u16, is_64bit: bool) -> Result<SegmentDescriptor, Error> {
        if is_null_selector(selector) {
            return Ok(SegmentDescriptor::unusable(selector));
        }
        let table = if selector & 4 != 0 {
            let ldtr = vcpu.read_table(TableRegister::LDTR);
            if ldtr.is_unusable() {
                return Err(Gap::DescriptorException(selector).into());
            }
            ldtr
        } else {
            vcpu.read_table(TableRegister::GDTR)
        };

        let offset = u64::from(selector & !7);
        let mut buf = [0u8; 16];
        if offset + 7 > u64::from(table.limit) {
            return Err(Gap::DescriptorException(selector).into());
        }
        vcpu.read_linear(table.base.wrapping_add(offset), None, &mut buf[..8])?;

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        let mut desc = decode_descriptor(selector, u64::from_le_bytes(raw));
        if is_64bit && desc.is_system() {
            if offset + 15 > u64::from(table.limit) {
                return Err(Gap::DescriptorException(selector).into());
            }
            vcpu.read_linear(table.base.wrapping_add(offset + 8), None, &mut buf[8..12])?;
            let mut high = [0u8; 4];
            high.copy_from_slice(&buf[8..12]);
            desc.base |= u64::from(u32::from_le_bytes(high)) << 32;
        }
        Ok(desc)
    }
}
