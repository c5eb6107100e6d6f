use crate::cpu::register::{R, RegisterState, OperandSize, AddressSize};
use crate::cpu::flag::FLAG_RESERVED;
use crate::cpu::segment::Segment;

#[test]
fn can_access_gpr() {
    let mut r = RegisterState::default();
    r.set(R::RCX, 0xFFFF_FFFF);
    assert_eq!(0xFFFF_FFFF, r.get(R::RCX));
    assert_eq!(0xFFFF_FFFF, r.gpr[1]);

    r.set(R::R15, 0x1515);
    assert_eq!(0x1515, r.gpr[15]);
}

#[test]
fn rflags_keeps_reserved_bit() {
    let mut r = RegisterState::default();
    assert_eq!(FLAG_RESERVED, r.get(R::RFLAGS));
    r.set(R::RFLAGS, 0);
    assert_eq!(FLAG_RESERVED, r.get(R::RFLAGS));
}

#[test]
fn names_registers_by_width() {
    assert_eq!("al", R::RAX.as_str(OperandSize::_8bit, false));
    assert_eq!("ah", R::RAX.as_str(OperandSize::_8bit, true));
    assert_eq!("r9w", R::R9.as_str(OperandSize::_16bit, false));
    assert_eq!("esi", R::RSI.as_str(OperandSize::_32bit, false));
    assert_eq!("rip", format!("{}", R::RIP));
    assert_eq!("cs", format!("{}", Segment::CS));
}

#[test]
fn operand_size_masks() {
    assert_eq!(0xFF, OperandSize::_8bit.mask());
    assert_eq!(0xFFFF_FFFF, OperandSize::_32bit.mask());
    assert_eq!(u64::max_value(), OperandSize::_64bit.mask());
    assert_eq!(Some(OperandSize::_16bit), OperandSize::from_bits(16));
    assert_eq!(None, OperandSize::from_bits(12));
    assert_eq!(0xFFFF, AddressSize::_16bit.mask());
}

#[test]
fn register_state_survives_bincode() {
    let mut r = RegisterState::default();
    r.set(R::RBX, 0x1234);
    r.msrs.insert(0xC000_0082, 0xFFFF_8000_0000_1000);
    let encoded = bincode::serialize(&r).unwrap();
    let decoded: RegisterState = bincode::deserialize(&encoded).unwrap();
    assert_eq!(r, decoded);
}
