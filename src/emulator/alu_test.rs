use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::config::{MachineConfig, MmioConfig};
use crate::cpu::flag::*;
use crate::cpu::register::R;
use crate::cpu::vcpu::Vcpu;
use crate::emulator::{Emulator, Outcome};
use crate::machine::Machine;

const CODE: u64 = 0x8000;
const MMIO_BASE: u64 = 0x10_0000;

fn protected_machine() -> Machine {
    let mut machine = Machine::new(&MachineConfig {
        ram_size: MMIO_BASE,
        mmio: vec![MmioConfig { base: MMIO_BASE, size: 0x1000 }],
    });
    machine.enter_protected_mode();
    machine
}

fn run(machine: &mut Machine, code: &[u8]) -> Outcome {
    machine.load_code(CODE, code);
    Emulator::default().emulate(machine, CODE, None, None).unwrap()
}

fn parity(val: u32) -> bool {
    (val as u8).count_ones() % 2 == 0
}

/// flags of a 32-bit operation computed without the host cpu
fn reference_flags(a: u32, b: u32, res: u32, carry: bool, overflow: bool, adjust: bool) -> u64 {
    let mut flags = 0;
    if carry { flags |= FLAG_CF; }
    if parity(res) { flags |= FLAG_PF; }
    if adjust && (a ^ b ^ res) & 0x10 != 0 { flags |= FLAG_AF; }
    if res == 0 { flags |= FLAG_ZF; }
    if res & 0x8000_0000 != 0 { flags |= FLAG_SF; }
    if overflow { flags |= FLAG_OF; }
    flags
}

/// (code, expected eax, expected flags) for `op eax, ebx`
fn reference(name: &str, a: u32, b: u32) -> (Vec<u8>, u32, u64) {
    match name {
        "add" => {
            let (res, carry) = a.overflowing_add(b);
            let overflow = (a as i32).overflowing_add(b as i32).1;
            (vec![0x01, 0xD8], res, reference_flags(a, b, res, carry, overflow, true))
        }
        "sub" | "cmp" => {
            let (res, carry) = a.overflowing_sub(b);
            let overflow = (a as i32).overflowing_sub(b as i32).1;
            let flags = reference_flags(a, b, res, carry, overflow, true);
            if name == "sub" {
                (vec![0x29, 0xD8], res, flags)
            } else {
                (vec![0x39, 0xD8], a, flags)
            }
        }
        "and" => (vec![0x21, 0xD8], a & b, reference_flags(a, b, a & b, false, false, false)),
        "or" => (vec![0x09, 0xD8], a | b, reference_flags(a, b, a | b, false, false, false)),
        "xor" => (vec![0x31, 0xD8], a ^ b, reference_flags(a, b, a ^ b, false, false, false)),
        "test" => (vec![0x85, 0xD8], a, reference_flags(a, b, a & b, false, false, false)),
        _ => unreachable!(),
    }
}

#[test]
fn register_alu_matches_reference_model() {
    let mut rng = XorShiftRng::seed_from_u64(0x7E57);
    // AF is undefined for logic ops
    let checked = ARITH_MASK & !FLAG_AF;
    let mut machine = protected_machine();
    for name in &["add", "sub", "cmp", "and", "or", "xor", "test"] {
        for _ in 0..200 {
            let a: u32 = rng.gen();
            let b: u32 = rng.gen();
            let (code, expected, flags) = reference(name, a, b);

            machine.write_reg(R::RFLAGS, 0);
            machine.write_reg(R::RAX, u64::from(a));
            machine.write_reg(R::RBX, u64::from(b));
            assert_eq!(Outcome::Ok, run(&mut machine, &code));
            assert_eq!(u64::from(expected), machine.read_reg(R::RAX), "{} {:08X}, {:08X}", name, a, b);
            assert_eq!(flags & checked, machine.read_reg(R::RFLAGS) & checked, "{} {:08X}, {:08X}", name, a, b);
            assert_eq!(u64::from(b), machine.read_reg(R::RBX));
        }
    }
}

#[test]
fn add_sets_auxiliary_carry() {
    let mut machine = protected_machine();
    machine.write_reg(R::RAX, 0x0F);
    machine.write_reg(R::RBX, 0x01);
    run(&mut machine, &[0x01, 0xD8]); // add eax,ebx
    assert_eq!(0x10, machine.read_reg(R::RAX));
    assert_eq!(FLAG_AF, machine.read_reg(R::RFLAGS) & FLAG_AF);
}

#[test]
fn unaffected_flags_are_kept() {
    let mut machine = protected_machine();
    machine.write_reg(R::RFLAGS, FLAG_IF | FLAG_DF | FLAG_CF);
    machine.write_reg(R::RAX, 0xFFFF_FFFF);
    run(&mut machine, &[0x40]); // inc eax
    assert_eq!(0, machine.read_reg(R::RAX));
    let flags = Flags(machine.read_reg(R::RFLAGS));
    assert_eq!(true, flags.carry());
    assert_eq!(true, flags.zero());
    assert_eq!(true, flags.interrupt());
    assert_eq!(true, flags.direction());
}

#[test]
fn can_add_high_byte_register() {
    let mut machine = protected_machine();
    machine.write_reg(R::RAX, 0x1234_40C0);
    run(&mut machine, &[0x00, 0xE0]); // add al,ah
    assert_eq!(0x1234_4000, machine.read_reg(R::RAX));
    assert_eq!(true, Flags(machine.read_reg(R::RFLAGS)).carry());
}

#[test]
fn adc_and_sbb_consume_carry() {
    let mut machine = protected_machine();
    machine.write_reg(R::RFLAGS, FLAG_CF);
    machine.write_reg(R::RAX, 1);
    machine.write_reg(R::RBX, 1);
    run(&mut machine, &[0x11, 0xD8]); // adc eax,ebx
    assert_eq!(3, machine.read_reg(R::RAX));

    machine.write_reg(R::RFLAGS, FLAG_CF);
    run(&mut machine, &[0x19, 0xD8]); // sbb eax,ebx
    assert_eq!(1, machine.read_reg(R::RAX));
}

#[test]
fn neg_and_not() {
    let mut machine = protected_machine();
    machine.write_reg(R::RAX, 5);
    run(&mut machine, &[0xF7, 0xD8]); // neg eax
    assert_eq!(0xFFFF_FFFB, machine.read_reg(R::RAX));
    assert_eq!(true, Flags(machine.read_reg(R::RFLAGS)).carry());

    machine.write_reg(R::RFLAGS, FLAG_ZF);
    run(&mut machine, &[0xF7, 0xD0]); // not eax
    assert_eq!(4, machine.read_reg(R::RAX));
    assert_eq!(FLAG_ZF | FLAG_RESERVED, machine.read_reg(R::RFLAGS));
}

#[test]
fn shifts_use_cl_and_immediates() {
    let mut machine = protected_machine();
    machine.write_reg(R::RAX, 0x8000_0001);
    machine.write_reg(R::RCX, 1);
    run(&mut machine, &[0xD3, 0xE0]); // shl eax,cl
    assert_eq!(2, machine.read_reg(R::RAX));
    assert_eq!(true, Flags(machine.read_reg(R::RFLAGS)).carry());

    machine.write_reg(R::RAX, 0x8000_0000);
    run(&mut machine, &[0xC1, 0xF8, 0x04]); // sar eax,0x4
    assert_eq!(0xF800_0000, machine.read_reg(R::RAX));

    run(&mut machine, &[0xD1, 0xE8]); // shr eax,1
    assert_eq!(0x7C00_0000, machine.read_reg(R::RAX));
}

#[test]
fn shift_by_zero_keeps_flags() {
    let mut machine = protected_machine();
    machine.write_reg(R::RFLAGS, FLAG_CF | FLAG_ZF);
    machine.write_reg(R::RAX, 0x1234);
    machine.write_reg(R::RCX, 0);
    run(&mut machine, &[0xD3, 0xE0]); // shl eax,cl
    assert_eq!(0x1234, machine.read_reg(R::RAX));
    assert_eq!(FLAG_CF | FLAG_ZF | FLAG_RESERVED, machine.read_reg(R::RFLAGS));
}

#[test]
fn can_operate_on_memory_in_place() {
    let mut machine = protected_machine();
    machine.mmu.write_u32(0x2000, 0xFFFF_FFFF);
    machine.write_reg(R::RBX, 0x2000);
    machine.write_reg(R::RAX, 1);
    run(&mut machine, &[0xF0, 0x01, 0x03]); // lock add [ebx],eax
    assert_eq!(Some(0), machine.mmu.read_u32(0x2000));
    let flags = Flags(machine.read_reg(R::RFLAGS));
    assert_eq!(true, flags.carry());
    assert_eq!(true, flags.zero());
}

#[test]
fn cmp_and_test_leave_memory_untouched() {
    let mut machine = protected_machine();
    machine.mmu.write_u32(0x2000, 7);
    machine.write_reg(R::RBX, 0x2000);
    machine.write_reg(R::RAX, 7);
    run(&mut machine, &[0x39, 0x03]); // cmp [ebx],eax
    assert_eq!(Some(7), machine.mmu.read_u32(0x2000));
    assert_eq!(true, Flags(machine.read_reg(R::RFLAGS)).zero());

    run(&mut machine, &[0x85, 0x03]); // test [ebx],eax
    assert_eq!(Some(7), machine.mmu.read_u32(0x2000));
    assert_eq!(false, Flags(machine.read_reg(R::RFLAGS)).zero());
    assert_eq!(7, machine.read_reg(R::RAX));
}

#[test]
fn device_memory_is_committed_unless_readonly() {
    let mut machine = protected_machine();
    machine.mmu.write_u32(MMIO_BASE, 0x10);
    machine.write_reg(R::RBX, MMIO_BASE);
    machine.write_reg(R::RAX, 0x10);
    let writes = machine.mmu.mmio[0].writes.len();

    run(&mut machine, &[0x39, 0x03]); // cmp [ebx],eax
    assert_eq!(writes, machine.mmu.mmio[0].writes.len());
    assert_eq!(true, Flags(machine.read_reg(R::RFLAGS)).zero());

    run(&mut machine, &[0x29, 0x03]); // sub [ebx],eax
    assert_eq!(writes + 1, machine.mmu.mmio[0].writes.len());
    assert_eq!(Some(0), machine.mmu.read_u32(MMIO_BASE));
}

#[test]
fn xchg_swaps_register_and_memory() {
    let mut machine = protected_machine();
    machine.mmu.write_u32(0x2000, 0xAAAA);
    machine.write_reg(R::RBX, 0x2000);
    machine.write_reg(R::RAX, 0xBBBB);
    machine.write_reg(R::RFLAGS, FLAG_CF);
    run(&mut machine, &[0x87, 0x03]); // xchg [ebx],eax
    assert_eq!(Some(0xBBBB), machine.mmu.read_u32(0x2000));
    assert_eq!(0xAAAA, machine.read_reg(R::RAX));
    assert_eq!(FLAG_CF | FLAG_RESERVED, machine.read_reg(R::RFLAGS));

    machine.write_reg(R::RCX, 1);
    machine.write_reg(R::RDX, 2);
    run(&mut machine, &[0x87, 0xCA]); // xchg edx,ecx
    assert_eq!(2, machine.read_reg(R::RCX));
    assert_eq!(1, machine.read_reg(R::RDX));
}

#[test]
fn sub_in_long_mode_is_64_bit() {
    let mut machine = Machine::deterministic();
    machine.enter_long_mode();
    machine.write_reg(R::RAX, 0);
    machine.write_reg(R::RBX, 1);
    run(&mut machine, &[0x48, 0x29, 0xD8]); // sub rax,rbx
    assert_eq!(u64::max_value(), machine.read_reg(R::RAX));
    let flags = Flags(machine.read_reg(R::RFLAGS));
    assert_eq!(true, flags.carry());
    assert_eq!(true, flags.sign());
}

#[test]
fn movbe_swaps_bytes() {
    let mut machine = protected_machine();
    machine.mmu.write_u32(0x2000, 0x1122_3344);
    machine.write_reg(R::RBX, 0x2000);
    run(&mut machine, &[0x0F, 0x38, 0xF0, 0x03]); // movbe eax,[ebx]
    assert_eq!(0x4433_2211, machine.read_reg(R::RAX));

    machine.write_reg(R::RAX, 0xAABB);
    run(&mut machine, &[0x66, 0x0F, 0x38, 0xF1, 0x03]); // movbe [ebx],ax
    assert_eq!(Some(0x1122_BBAA), machine.mmu.read_u32(0x2000));
}

#[test]
fn alu_writes_across_a_page_boundary() {
    let mut machine = Machine::deterministic();
    machine.enter_long_mode();
    machine.map_pages(&[(CODE, CODE), (0x10000, 0x20000), (0x11000, 0x40000)]);
    machine.mmu.write(0x20FFE, &[0xFF, 0xFF]);
    machine.mmu.write(0x40000, &[0x00, 0x00]);
    machine.write_reg(R::RBX, 0x10FFE);
    machine.write_reg(R::RAX, 1);

    assert_eq!(Outcome::Ok, run(&mut machine, &[0x01, 0x03])); // add [rbx],eax
    assert_eq!(Some(0x0000), machine.mmu.read_u16(0x20FFE));
    assert_eq!(Some(0x0001), machine.mmu.read_u16(0x40000));
    assert_eq!(Some(0x0000), machine.mmu.read_u16(0x21000));
}

#[test]
fn alu_fault_on_second_page_leaves_memory_unmodified() {
    let mut machine = Machine::deterministic();
    machine.enter_long_mode();
    machine.map_pages(&[(CODE, CODE), (0x10000, 0x20000)]);
    machine.mmu.write(0x20FFE, &[0x34, 0x12]);
    machine.write_reg(R::RBX, 0x10FFE);
    machine.write_reg(R::RAX, 1);

    assert_eq!(Outcome::Fault, run(&mut machine, &[0x01, 0x03])); // add [rbx],eax
    assert_eq!(Some(0x1234), machine.mmu.read_u16(0x20FFE));
}
