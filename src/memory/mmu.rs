use crate::memory::FlatMemory;

#[cfg(test)]
#[path = "./mmu_test.rs"]
mod mmu_test;

pub const PAGE_SIZE: u64 = 0x1000;

const PTE_PRESENT: u64 = 1;
const PTE_PS: u64 = 1 << 7;
const PTE_ADDR: u64 = 0x000F_FFFF_FFFF_F000;

/// a device backed range of guest physical memory.
/// it is never handed out as a host slice, every access is recorded
#[derive(Clone, Debug, Default)]
pub struct MmioWindow {
    pub base: u64,
    pub data: Vec<u8>,
    pub reads: Vec<(u64, usize)>,
    pub writes: Vec<(u64, Vec<u8>)>,
}

impl MmioWindow {
    pub fn new(base: u64, size: usize) -> Self {
        MmioWindow { base, data: vec![0; size], ..Default::default() }
    }

    fn offset(&self, addr: u64, len: usize) -> Option<usize> {
        let off = addr.checked_sub(self.base)? as usize;
        if off.checked_add(len)? <= self.data.len() {
            Some(off)
        } else {
            None
        }
    }
}

/// guest physical memory: flat ram plus device windows
#[derive(Clone, Default)]
pub struct MMU {
    pub ram: FlatMemory,
    pub mmio: Vec<MmioWindow>,
}

impl MMU {
    pub fn new(ram_size: usize) -> Self {
        MMU {
            ram: FlatMemory::new(ram_size),
            mmio: Vec::new(),
        }
    }

    pub fn add_mmio(&mut self, base: u64, size: usize) {
        self.mmio.push(MmioWindow::new(base, size));
    }

    /// returns true if `addr` is backed by ram or a device
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.ram.contains(addr, 1) || self.mmio.iter().any(|w| w.offset(addr, 1).is_some())
    }

    /// host view of `len` bytes of ram, None for device ranges
    pub fn host_slice(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        self.ram.read_mut(addr, len)
    }

    /// reads a sequence of data from ram or a device
    pub fn read(&mut self, addr: u64, data: &mut [u8]) -> bool {
        if let Some(mem) = self.ram.read(addr, data.len()) {
            data.copy_from_slice(mem);
            return true;
        }
        for window in &mut self.mmio {
            if let Some(off) = window.offset(addr, data.len()) {
                data.copy_from_slice(&window.data[off..off + data.len()]);
                window.reads.push((addr, data.len()));
                return true;
            }
        }
        false
    }

    // writes a sequence of data to ram or a device
    pub fn write(&mut self, addr: u64, data: &[u8]) -> bool {
        if self.ram.write(addr, data) {
            return true;
        }
        for window in &mut self.mmio {
            if let Some(off) = window.offset(addr, data.len()) {
                window.data[off..off + data.len()].copy_from_slice(data);
                window.writes.push((addr, data.to_vec()));
                return true;
            }
        }
        false
    }

    pub fn read_u8(&mut self, addr: u64) -> Option<u8> {
        let mut buf = [0u8; 1];
        if self.read(addr, &mut buf) { Some(buf[0]) } else { None }
    }

    pub fn read_u16(&mut self, addr: u64) -> Option<u16> {
        let mut buf = [0u8; 2];
        if self.read(addr, &mut buf) { Some(u16::from_le_bytes(buf)) } else { None }
    }

    pub fn read_u32(&mut self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        if self.read(addr, &mut buf) { Some(u32::from_le_bytes(buf)) } else { None }
    }

    pub fn read_u64(&mut self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        if self.read(addr, &mut buf) { Some(u64::from_le_bytes(buf)) } else { None }
    }

    pub fn write_u8(&mut self, addr: u64, data: u8) -> bool {
        self.write(addr, &[data])
    }

    pub fn write_u16(&mut self, addr: u64, data: u16) -> bool {
        self.write(addr, &data.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, data: u32) -> bool {
        self.write(addr, &data.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, data: u64) -> bool {
        self.write(addr, &data.to_le_bytes())
    }

    /// Walks the 4-level page tables rooted at `root`.
    /// Page tables must live in ram. Returns None for non-present entries.
    pub fn walk(&self, linear: u64, root: u64) -> Option<u64> {
        let pml4e = self.entry(root, (linear >> 39) & 0x1FF)?;
        let pdpte = self.entry(pml4e, (linear >> 30) & 0x1FF)?;
        if pdpte & PTE_PS != 0 {
            return Some((pdpte & 0x000F_FFFF_C000_0000) | (linear & 0x3FFF_FFFF));
        }
        let pde = self.entry(pdpte, (linear >> 21) & 0x1FF)?;
        if pde & PTE_PS != 0 {
            return Some((pde & 0x000F_FFFF_FFE0_0000) | (linear & 0x1F_FFFF));
        }
        let pte = self.entry(pde, (linear >> 12) & 0x1FF)?;
        Some((pte & PTE_ADDR) | (linear & 0xFFF))
    }

    /// reads entry `index` of the table referenced by `parent`, None if not present
    fn entry(&self, parent: u64, index: u64) -> Option<u64> {
        let entry = self.ram.read_u64((parent & PTE_ADDR) + index * 8)?;
        if entry & PTE_PRESENT == 0 {
            None
        } else {
            Some(entry)
        }
    }
}
