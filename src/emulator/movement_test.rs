use crate::cpu::flag::FLAG_DF;
use crate::cpu::register::R;
use crate::cpu::segment::Segment;
use crate::cpu::vcpu::Vcpu;
use crate::emulator::{Emulator, Outcome};
use crate::error::{Error, Gap};
use crate::machine::{Machine, SEL_KERNEL_DATA};

const CODE: u64 = 0x8000;

fn run(machine: &mut Machine, code: &[u8]) -> Result<Outcome, Error> {
    machine.load_code(CODE, code);
    Emulator::default().emulate(machine, CODE, None, None)
}

/// runs the instruction at RIP until it moves on, returning the number of iterations
fn run_until_done(machine: &mut Machine, emulator: &mut Emulator) -> usize {
    let ip = machine.read_reg(R::RIP);
    let mut n = 0;
    loop {
        assert_eq!(Outcome::Ok, emulator.emulate(machine, ip, None, None).unwrap());
        n += 1;
        if machine.read_reg(R::RIP) != ip {
            return n;
        }
    }
}

#[test]
fn can_mov_between_registers_and_memory() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    machine.write_reg(R::RBX, 0x2000);
    machine.write_reg(R::RAX, 0xCAFE_BABE);

    run(&mut machine, &[0x89, 0x03]).unwrap(); // mov [ebx],eax
    assert_eq!(Some(0xCAFE_BABE), machine.mmu.read_u32(0x2000));

    run(&mut machine, &[0x8A, 0x4B, 0x01]).unwrap(); // mov cl,[ebx+0x1]
    assert_eq!(0xBA, machine.read_reg(R::RCX));

    run(&mut machine, &[0xC7, 0x43, 0x04, 0x78, 0x56, 0x34, 0x12]).unwrap(); // mov dword [ebx+0x4],0x12345678
    assert_eq!(Some(0x1234_5678), machine.mmu.read_u32(0x2004));
    assert_eq!(CODE + 7, machine.read_reg(R::RIP));
}

#[test]
fn mov_to_32_bit_register_zero_extends() {
    let mut machine = Machine::deterministic();
    machine.enter_long_mode();
    machine.write_reg(R::RAX, 0xFFFF_FFFF_FFFF_FFFF);
    run(&mut machine, &[0xB8, 0x01, 0x00, 0x00, 0x00]).unwrap(); // mov eax,0x1
    assert_eq!(1, machine.read_reg(R::RAX));
}

#[test]
fn can_movzx() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    machine.write_reg(R::RAX, 0xFFFF_FF80);
    run(&mut machine, &[0x0F, 0xB6, 0xD8]).unwrap(); // movzx ebx,al
    assert_eq!(0x80, machine.read_reg(R::RBX));
}

#[test]
fn mov_to_segment_register_loads_descriptor() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    machine.write_reg(R::RAX, u64::from(SEL_KERNEL_DATA));
    run(&mut machine, &[0x8E, 0xC0]).unwrap(); // mov es,ax
    let es = machine.read_segment(Segment::ES);
    assert_eq!(SEL_KERNEL_DATA, es.selector);
    assert_eq!(0xFFFF_FFFF, es.limit);
    assert_eq!(false, machine.is_interrupt_shadow_active());

    run(&mut machine, &[0x8E, 0xD0]).unwrap(); // mov ss,ax
    assert_eq!(true, machine.is_interrupt_shadow_active());
}

#[test]
fn mov_to_segment_register_outside_gdt_is_a_gap() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    machine.write_reg(R::RAX, 0x100);
    match run(&mut machine, &[0x8E, 0xD8]) { // mov ds,ax
        Err(Error::Unsupported(Gap::DescriptorException(0x100))) => {}
        other => panic!("expected DescriptorException, got {:?}", other),
    }
    assert_eq!(SEL_KERNEL_DATA, machine.read_segment(Segment::DS).selector);
    assert_eq!(CODE, machine.read_reg(R::RIP));
}

#[test]
fn can_mov_from_segment_register() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    run(&mut machine, &[0x8C, 0xD8]).unwrap(); // mov eax,ds
    assert_eq!(u64::from(SEL_KERNEL_DATA), machine.read_reg(R::RAX));
}

#[test]
fn lea_does_not_touch_memory() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    machine.write_reg(R::RBX, 0x7FFF_0000);
    machine.write_reg(R::RSI, 0x10);
    run(&mut machine, &[0x8D, 0x44, 0xB3, 0x08]).unwrap(); // lea eax,[ebx+esi*4+0x8]
    assert_eq!(0x7FFF_0048, machine.read_reg(R::RAX));
}

#[test]
fn lea_wraps_at_16_bits() {
    let mut machine = Machine::deterministic();
    machine.write_reg(R::RBX, 0xFFFF);
    machine.write_reg(R::RAX, 0xAAAA_0000);
    run(&mut machine, &[0x8D, 0x47, 0x02]).unwrap(); // lea ax,[bx+0x2]
    assert_eq!(0xAAAA_0001, machine.read_reg(R::RAX));
}

#[test]
fn rep_movsb_copies_forward() {
    let mut machine = Machine::deterministic();
    machine.load_code(CODE, &[0xF3, 0xA4]); // rep movsb
    machine.mmu.write(0x3000, b"hello");
    machine.write_reg(R::RSI, 0x3000);
    machine.write_reg(R::RDI, 0x4000);
    machine.write_reg(R::RCX, 5);

    let mut emulator = Emulator::default();
    assert_eq!(5, run_until_done(&mut machine, &mut emulator));
    assert_eq!(0x3005, machine.read_reg(R::RSI));
    assert_eq!(0x4005, machine.read_reg(R::RDI));
    assert_eq!(0, machine.read_reg(R::RCX));
    assert_eq!(CODE + 2, machine.read_reg(R::RIP));
    assert_eq!(Some(&b"hello"[..]), machine.mmu.ram.read(0x4000, 5));
}

#[test]
fn rep_movsb_copies_backward_with_direction_flag() {
    let mut machine = Machine::deterministic();
    machine.load_code(CODE, &[0xF3, 0xA4]); // rep movsb
    machine.mmu.write(0x3000, b"abc");
    machine.write_reg(R::RSI, 0x3002);
    machine.write_reg(R::RDI, 0x4002);
    machine.write_reg(R::RCX, 3);
    machine.write_reg(R::RFLAGS, FLAG_DF);

    let mut emulator = Emulator::default();
    assert_eq!(3, run_until_done(&mut machine, &mut emulator));
    assert_eq!(0x2FFF, machine.read_reg(R::RSI));
    assert_eq!(0x3FFF, machine.read_reg(R::RDI));
    assert_eq!(Some(&b"abc"[..]), machine.mmu.ram.read(0x4000, 3));
}

#[test]
fn rep_with_zero_count_does_nothing() {
    let mut machine = Machine::deterministic();
    machine.write_reg(R::RSI, 0x3000);
    machine.write_reg(R::RDI, 0x4000);
    machine.write_reg(R::RCX, 0);
    assert_eq!(Outcome::Ok, run(&mut machine, &[0xF3, 0xA4]).unwrap()); // rep movsb
    assert_eq!(0x3000, machine.read_reg(R::RSI));
    assert_eq!(0x4000, machine.read_reg(R::RDI));
    assert_eq!(CODE + 2, machine.read_reg(R::RIP));
}

#[test]
fn single_movsw_advances_by_width() {
    let mut machine = Machine::deterministic();
    machine.mmu.write_u16(0x3000, 0xBEEF);
    machine.write_reg(R::RSI, 0x3000);
    machine.write_reg(R::RDI, 0x4000);
    machine.write_reg(R::RCX, 9);
    run(&mut machine, &[0xA5]).unwrap(); // movsw
    assert_eq!(Some(0xBEEF), machine.mmu.read_u16(0x4000));
    assert_eq!(0x3002, machine.read_reg(R::RSI));
    assert_eq!(0x4002, machine.read_reg(R::RDI));
    assert_eq!(9, machine.read_reg(R::RCX));
}

#[test]
fn index_registers_wrap_at_address_size() {
    let mut machine = Machine::deterministic();
    machine.write_reg(R::RAX, 0x41);
    machine.write_reg(R::RDI, 0x1_FFFF);
    run(&mut machine, &[0xAA]).unwrap(); // stosb
    assert_eq!(Some(0x41), machine.mmu.read_u8(0xFFFF));
    assert_eq!(0x1_0000, machine.read_reg(R::RDI));
}

#[test]
fn rep_stosd_fills_memory() {
    let mut machine = Machine::deterministic();
    machine.enter_long_mode();
    machine.load_code(CODE, &[0xF3, 0xAB]); // rep stosd
    machine.write_reg(R::RAX, 0x1122_3344);
    machine.write_reg(R::RDI, 0x5000);
    machine.write_reg(R::RCX, 4);

    let mut emulator = Emulator::default();
    assert_eq!(4, run_until_done(&mut machine, &mut emulator));
    for i in 0..4 {
        assert_eq!(Some(0x1122_3344), machine.mmu.read_u32(0x5000 + i * 4));
    }
    assert_eq!(0x5010, machine.read_reg(R::RDI));
}

#[test]
fn faulting_movs_leaves_registers() {
    let mut machine = Machine::deterministic();
    machine.enter_protected_mode();
    machine.write_reg(R::RSI, 0x3000);
    machine.write_reg(R::RDI, 0x4000_0000);
    machine.write_reg(R::RCX, 2);
    machine.load_code(CODE, &[0xF3, 0xA4]); // rep movsb
    let before = machine.register_snapshot();
    assert_eq!(Outcome::Fault, Emulator::default().emulate(&mut machine, CODE, None, None).unwrap());
    assert_eq!(before, machine.register_snapshot());
}

#[test]
fn mov_reads_across_a_page_boundary() {
    let mut machine = Machine::deterministic();
    machine.enter_long_mode();
    machine.map_pages(&[(CODE, CODE), (0x10000, 0x20000), (0x11000, 0x40000)]);
    machine.mmu.write(0x20FFE, &[0x11, 0x22]);
    machine.mmu.write(0x21000, &[0xAA, 0xBB]);
    machine.mmu.write(0x40000, &[0x33, 0x44]);
    machine.write_reg(R::RBX, 0x10FFE);

    assert_eq!(Outcome::Ok, run(&mut machine, &[0x8B, 0x03]).unwrap()); // mov eax,[rbx]
    assert_eq!(0x4433_2211, machine.read_reg(R::RAX));
}
