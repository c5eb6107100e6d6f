use crate::config::MachineConfig;
use std::cell::RefCell;
use std::rc::Rc;

use crate::cpu::flag::FLAG_IF;
use crate::cpu::register::{R, RegisterState, TableRegister, CR0_PE, CR0_PG, EFER_LMA, EFER_LME, MSR_EFER};
use crate::cpu::segment::{Segment, SegmentDescriptor, ATTR_PRESENT, ATTR_S, ATTR_ACCESSED};
use crate::cpu::vcpu::Vcpu;
use crate::emulator::{Emulator, Outcome};
use crate::error::Error;
use crate::memory::MMU;

#[cfg(test)]
#[path = "./machine_test.rs"]
mod machine_test;

/// guest physical address of the GDT built by `enter_protected_mode` / `enter_long_mode`
pub const GDT_BASE: u64 = 0x500;

/// identity page tables built by `enter_long_mode`, PML4 then PDPT
pub const PAGE_TABLE_BASE: u64 = 0x1000;

/// 4K page tables built by `map_pages`, PML4, PDPT, PD then PT
pub const SMALL_PAGE_TABLE_BASE: u64 = 0x5_0000;

pub const SEL_KERNEL_CODE64: u16 = 0x08;
pub const SEL_KERNEL_DATA: u16 = 0x10;
pub const SEL_USER_CODE32: u16 = 0x18;
pub const SEL_USER_DATA: u16 = 0x20;
pub const SEL_USER_CODE64: u16 = 0x28;
pub const SEL_KERNEL_CODE32: u16 = 0x30;

/// flat descriptors, layout matches what SYSCALL/SYSRET expect with STAR = 0x0018_0008 << 32
const GDT: [u64; 7] = [
    0,
    0x00AF_9B00_0000_FFFF, // kernel code, 64-bit
    0x00CF_9300_0000_FFFF, // kernel data
    0x00CF_FB00_0000_FFFF, // user code, 32-bit
    0x00CF_F300_0000_FFFF, // user data
    0x00AF_FB00_0000_FFFF, // user code, 64-bit
    0x00CF_9B00_0000_FFFF, // kernel code, 32-bit
];

pub trait Component {
    /// returns true if write was handled
    fn out_u8(&mut self, _port: u16, _data: u8) -> bool {
        false
    }

    /// returns true if write was handled
    fn out_u16(&mut self, _port: u16, _data: u16) -> bool {
        false
    }

    /// returns true if write was handled
    fn out_u32(&mut self, _port: u16, _data: u32) -> bool {
        false
    }
}

/// a reference vcpu host: register file, guest memory and port devices
pub struct Machine {
    pub regs: RegisterState,
    pub mmu: MMU,

    /// handlers for i/o ports, the first one to accept a write wins
    components: Vec<Box<dyn Component>>,

    pending_interrupt: Option<u8>,

    /// set while interrupt delivery is blocked for one instruction
    interrupt_shadow: bool,

    /// vectors accepted by the guest, in order
    delivered: Vec<u8>,
}

impl Machine {
    pub fn new(cfg: &MachineConfig) -> Self {
        let mut mmu = MMU::new(cfg.ram_size as usize);
        for window in &cfg.mmio {
            mmu.add_mmio(window.base, window.size as usize);
        }
        let mut m = Machine {
            regs: RegisterState::default(),
            mmu,
            components: Vec::new(),
            pending_interrupt: None,
            interrupt_shadow: false,
            delivered: Vec::new(),
        };
        m.reset_segments();
        m
    }

    /// a machine in 16-bit mode with all segment bases at 0
    pub fn deterministic() -> Self {
        Self::new(&MachineConfig::default())
    }

    fn reset_segments(&mut self) {
        for seg in &[Segment::ES, Segment::SS, Segment::DS, Segment::FS, Segment::GS] {
            let attrib = 0x2 | ATTR_ACCESSED | ATTR_S | ATTR_PRESENT;
            self.regs.set_segment(*seg, SegmentDescriptor::new(0, attrib, 0xFFFF, 0));
        }
        let attrib = 0xA | ATTR_ACCESSED | ATTR_S | ATTR_PRESENT;
        self.regs.set_segment(Segment::CS, SegmentDescriptor::new(0, attrib, 0xFFFF, 0));
        self.regs.gdtr = SegmentDescriptor::new(0, 0, 0xFFFF, 0);
        self.regs.idtr = SegmentDescriptor::new(0, 0, 0x3FF, 0);
    }

    pub fn add_component(&mut self, component: Box<dyn Component>) {
        self.components.push(component);
    }

    /// writes `code` to guest physical `addr` and points RIP at it
    pub fn load_code(&mut self, addr: u64, code: &[u8]) {
        self.mmu.write(addr, code);
        self.regs.rip = addr;
    }

    /// writes `descriptors` to guest physical `base` and loads GDTR
    pub fn load_gdt(&mut self, base: u64, descriptors: &[u64]) {
        for (i, desc) in descriptors.iter().enumerate() {
            self.mmu.write_u64(base + i as u64 * 8, *desc);
        }
        let limit = (descriptors.len() * 8).saturating_sub(1) as u32;
        self.regs.gdtr = SegmentDescriptor::new(0, 0, limit, base);
    }

    /// flat 32-bit protected mode at ring 0
    pub fn enter_protected_mode(&mut self) {
        self.load_gdt(GDT_BASE, &GDT);
        self.regs.cr0 |= CR0_PE;
        self.regs.set_segment(Segment::CS, SegmentDescriptor::flat_code(SEL_KERNEL_CODE32, 0, false));
        self.load_data_segments(SEL_KERNEL_DATA, 0);
    }

    /// 64-bit mode at ring 0, the low 4GB identity mapped with 1GB pages
    pub fn enter_long_mode(&mut self) {
        self.load_gdt(GDT_BASE, &GDT);
        let pml4 = PAGE_TABLE_BASE;
        let pdpt = PAGE_TABLE_BASE + 0x1000;
        self.mmu.write_u64(pml4, pdpt | 0x3);
        for i in 0..4u64 {
            // present, writable, 1GB page
            self.mmu.write_u64(pdpt + i * 8, (i << 30) | 0x83);
        }
        self.regs.cr3 = pml4;
        self.regs.cr0 |= CR0_PE | CR0_PG;
        self.regs.msrs.insert(MSR_EFER, EFER_LME | EFER_LMA);
        self.regs.set_segment(Segment::CS, SegmentDescriptor::flat_code(SEL_KERNEL_CODE64, 0, true));
        self.load_data_segments(SEL_KERNEL_DATA, 0);
    }

    /// Replaces the page tables with 4K mappings of `(linear, physical)` pages inside
    /// the low 2MB. Everything else is unmapped.
    pub fn map_pages(&mut self, pages: &[(u64, u64)]) {
        let pml4 = SMALL_PAGE_TABLE_BASE;
        let pdpt = pml4 + 0x1000;
        let pd = pml4 + 0x2000;
        let pt = pml4 + 0x3000;
        for i in 0..4 * 512 {
            self.mmu.write_u64(pml4 + i * 8, 0);
        }
        self.mmu.write_u64(pml4, pdpt | 0x3);
        self.mmu.write_u64(pdpt, pd | 0x3);
        self.mmu.write_u64(pd, pt | 0x3);
        for (linear, physical) in pages {
            let index = (linear >> 12) & 0x1FF;
            self.mmu.write_u64(pt + index * 8, (physical & !0xFFF) | 0x3);
        }
        self.regs.cr3 = pml4;
        self.regs.cr0 |= CR0_PG;
    }

    fn load_data_segments(&mut self, selector: u16, dpl: u8) {
        for seg in &[Segment::ES, Segment::SS, Segment::DS, Segment::FS, Segment::GS] {
            self.regs.set_segment(*seg, SegmentDescriptor::flat_data(selector, dpl));
        }
    }

    /// requests delivery of interrupt `vector`
    pub fn raise_interrupt(&mut self, vector: u8) {
        self.pending_interrupt = Some(vector);
    }

    pub fn pending_interrupt(&self) -> Option<u8> {
        self.pending_interrupt
    }

    pub fn delivered_interrupts(&self) -> &[u8] {
        &self.delivered
    }

    pub fn is_interrupt_shadow_active(&self) -> bool {
        self.interrupt_shadow
    }

    /// Accepts a pending interrupt if the guest can take it. Delivery through
    /// the IDT is not modelled, the vector is recorded instead.
    fn deliver_interrupt(&mut self) {
        if self.interrupt_shadow || self.regs.rflags & FLAG_IF == 0 {
            return;
        }
        if let Some(vector) = self.pending_interrupt.take() {
            debug!("delivering interrupt {:02X} at {:016X}", vector, self.regs.rip);
            self.delivered.push(vector);
        }
    }

    /// Executes one instruction at RIP, after giving a pending interrupt the chance
    /// to be delivered. A shadow armed by the previous instruction blocks delivery
    /// for exactly this instruction.
    pub fn step(&mut self, emulator: &mut Emulator) -> Result<Outcome, Error> {
        self.deliver_interrupt();
        self.interrupt_shadow = false;
        let ip = self.regs.rip;
        emulator.emulate(self, ip, None, None)
    }

    /// executes up to `count` instructions, stopping early on anything but `Outcome::Ok`
    pub fn execute_instructions(&mut self, emulator: &mut Emulator, count: usize) -> Result<Outcome, Error> {
        for _ in 0..count {
            match self.step(emulator)? {
                Outcome::Ok => {}
                other => return Ok(other),
            }
        }
        Ok(Outcome::Ok)
    }

    pub fn register_snapshot(&self) -> RegisterState {
        self.regs.clone()
    }
}

/// "TrapEmuVcpu " in the CPUID vendor register order EBX, EDX, ECX
const CPUID_VENDOR: [u32; 3] = [0x7061_7254, 0x5675_6D45, 0x2075_7063];

impl Vcpu for Machine {
    fn read_reg(&self, r: R) -> u64 {
        self.regs.get(r)
    }

    fn write_reg(&mut self, r: R, val: u64) {
        self.regs.set(r, val);
    }

    fn read_segment(&self, seg: Segment) -> SegmentDescriptor {
        self.regs.segment(seg)
    }

    fn write_segment(&mut self, seg: Segment, desc: SegmentDescriptor) {
        self.regs.set_segment(seg, desc);
    }

    fn read_table(&self, t: TableRegister) -> SegmentDescriptor {
        self.regs.table(t)
    }

    fn write_table(&mut self, t: TableRegister, desc: SegmentDescriptor) {
        self.regs.set_table(t, desc);
    }

    fn read_msr(&self, index: u32) -> Option<u64> {
        self.regs.msrs.get(&index).cloned()
    }

    fn translate(&self, linear: u64, page_table_root: Option<u64>) -> Option<u64> {
        let root = match page_table_root {
            Some(root) => Some(root),
            None if self.regs.cr0 & CR0_PG != 0 => Some(self.regs.cr3),
            None => None,
        };
        match root {
            Some(root) => self.mmu.walk(linear, root),
            None if self.mmu.is_mapped(linear) => Some(linear),
            None => None,
        }
    }

    fn read_phys(&mut self, gpa: u64, data: &mut [u8]) -> bool {
        self.mmu.read(gpa, data)
    }

    fn write_phys(&mut self, gpa: u64, data: &[u8]) -> bool {
        self.mmu.write(gpa, data)
    }

    fn host_memory(&mut self, gpa: u64, len: usize) -> Option<&mut [u8]> {
        self.mmu.host_slice(gpa, len)
    }

    fn write_port(&mut self, port: u16, len: usize, val: u32) -> bool {
        debug!("out: write to {:04X} = {:X} ({} bytes)", port, val, len);
        for component in &mut self.components {
            let handled = match len {
                1 => component.out_u8(port, val as u8),
                2 => component.out_u16(port, val as u16),
                _ => component.out_u32(port, val),
            };
            if handled {
                return true;
            }
        }
        false
    }

    fn handle_cpuid(&mut self) -> bool {
        let leaf = self.regs.get(R::RAX) as u32;
        let (eax, ebx, ecx, edx) = match leaf {
            0 => (1u32, CPUID_VENDOR[0], CPUID_VENDOR[2], CPUID_VENDOR[1]),
            // family 6, fpu tsc msr pae cx8 apic sep cmov fxsr sse sse2
            1 => (0x0000_0600u32, 0u32, 0u32, 0x0780_A971u32),
            _ => return false,
        };
        self.regs.set(R::RAX, u64::from(eax));
        self.regs.set(R::RBX, u64::from(ebx));
        self.regs.set(R::RCX, u64::from(ecx));
        self.regs.set(R::RDX, u64::from(edx));
        true
    }

    fn set_sti_blocking(&mut self) {
        self.interrupt_shadow = true;
    }
}

/// a port device that records every write to a port range
#[derive(Clone, Debug, Default)]
pub struct PortRecorder {
    pub first: u16,
    pub last: u16,

    /// shared with the caller, the machine owns the component
    pub writes: Rc<RefCell<Vec<(u16, u32)>>>,
}

impl PortRecorder {
    pub fn new(first: u16, last: u16) -> Self {
        PortRecorder { first, last, writes: Rc::new(RefCell::new(Vec::new())) }
    }

    fn record(&mut self, port: u16, data: u32) -> bool {
        if port < self.first || port > self.last {
            return false;
        }
        self.writes.borrow_mut().push((port, data));
        true
    }
}

impl Component for PortRecorder {
    fn out_u8(&mut self, port: u16, data: u8) -> bool {
        self.record(port, u32::from(data))
    }

    fn out_u16(&mut self, port: u16, data: u16) -> bool {
        self.record(port, u32::from(data))
    }

    fn out_u32(&mut self, port: u16, data: u32) -> bool {
        self.record(port, data)
    }
}
