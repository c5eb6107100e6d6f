/// guest ram, addressed from guest physical 0
#[derive(Clone, Default)]
pub struct FlatMemory {
    pub memory: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        FlatMemory { memory: vec![0u8; size] }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// returns true if `len` bytes at `addr` are backed
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        match (addr as usize).checked_add(len) {
            Some(end) => addr <= usize::max_value() as u64 && end <= self.memory.len(),
            None => false,
        }
    }

    pub fn read(&self, addr: u64, length: usize) -> Option<&[u8]> {
        if !self.contains(addr, length) {
            return None;
        }
        let addr = addr as usize;
        Some(&self.memory[addr..addr+length])
    }

    pub fn read_mut(&mut self, addr: u64, length: usize) -> Option<&mut [u8]> {
        if !self.contains(addr, length) {
            return None;
        }
        let addr = addr as usize;
        Some(&mut self.memory[addr..addr+length])
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> bool {
        match self.read_mut(addr, data.len()) {
            Some(mem) => {
                mem.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read(addr, 8)?);
        Some(u64::from_le_bytes(buf))
    }
}
