use crate::cpu::flag::Flags;
use crate::cpu::register::{R, TableRegister};
use crate::cpu::segment::{Segment, SegmentDescriptor};
use crate::error::Error;
use crate::memory::PAGE_SIZE;

/// The capabilities the emulator needs from the virtual cpu it works on.
///
/// The register file and guest memory are mutated in place. Implementations are
/// expected to be exclusively owned by the calling thread for the duration of one
/// emulation; the emulator performs no locking of its own.
pub trait Vcpu {
    /// reads a full 64-bit register
    fn read_reg(&self, r: R) -> u64;

    fn write_reg(&mut self, r: R, val: u64);

    fn read_segment(&self, seg: Segment) -> SegmentDescriptor;

    fn write_segment(&mut self, seg: Segment, desc: SegmentDescriptor);

    fn read_table(&self, t: TableRegister) -> SegmentDescriptor;

    fn write_table(&mut self, t: TableRegister, desc: SegmentDescriptor);

    /// returns None if the msr is not readable
    fn read_msr(&self, index: u32) -> Option<u64>;

    /// translates a guest linear address to a guest physical address.
    /// `page_table_root` overrides the current CR3
    fn translate(&self, linear: u64, page_table_root: Option<u64>) -> Option<u64>;

    /// reads guest physical memory, including device backed ranges.
    /// returns false if the access could not be carried out
    fn read_phys(&mut self, gpa: u64, data: &mut [u8]) -> bool;

    /// returns false if the access could not be carried out
    fn write_phys(&mut self, gpa: u64, data: &[u8]) -> bool;

    /// returns a host view of `len` bytes of guest ram at `gpa`, or None if the
    /// range is not ordinary ram
    fn host_memory(&mut self, gpa: u64, len: usize) -> Option<&mut [u8]>;

    /// returns true if write was handled
    fn write_port(&mut self, port: u16, len: usize, val: u32) -> bool;

    /// returns true if cpuid was handled
    fn handle_cpuid(&mut self) -> bool;

    /// blocks interrupt delivery until the next instruction has retired
    fn set_sti_blocking(&mut self);

    fn cpl(&self) -> u8 {
        self.read_segment(Segment::CS).rpl()
    }

    fn iopl(&self) -> u8 {
        Flags(self.read_reg(R::RFLAGS)).iopl()
    }

    fn flags(&self) -> Flags {
        Flags(self.read_reg(R::RFLAGS))
    }

    /// returns true while executing in 64-bit mode
    fn is_long_mode(&self) -> bool {
        self.read_segment(Segment::CS).is_long()
    }

    /// reads guest linear memory page by page, translated under `page_table_root`
    /// or the current paging state
    fn read_linear(&mut self, linear: u64, page_table_root: Option<u64>, data: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < data.len() {
            let addr = linear.wrapping_add(done as u64);
            let chunk = (data.len() - done).min((PAGE_SIZE - (addr % PAGE_SIZE)) as usize);
            let gpa = self.translate(addr, page_table_root).ok_or(Error::Fault(addr))?;
            if !self.read_phys(gpa, &mut data[done..done + chunk]) {
                return Err(Error::Fault(addr));
            }
            done += chunk;
        }
        Ok(())
    }

    fn write_linear(&mut self, linear: u64, data: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < data.len() {
            let addr = linear.wrapping_add(done as u64);
            let chunk = (data.len() - done).min((PAGE_SIZE - (addr % PAGE_SIZE)) as usize);
            let gpa = self.translate(addr, None).ok_or(Error::Fault(addr))?;
            if !self.write_phys(gpa, &data[done..done + chunk]) {
                return Err(Error::Fault(addr));
            }
            done += chunk;
        }
        Ok(())
    }
}
