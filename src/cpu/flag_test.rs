use crate::cpu::flag::*;

#[test]
fn can_merge_masked_flags() {
    let flags = Flags(FLAG_RESERVED | FLAG_IF | FLAG_CF);
    let merged = flags.merge(FLAG_ZF | FLAG_DF, ARITH_MASK);
    assert_eq!(FLAG_RESERVED | FLAG_IF | FLAG_ZF, merged.0);
    assert_eq!(false, merged.carry());
    assert_eq!(true, merged.zero());
    assert_eq!(false, merged.direction());
}

#[test]
fn can_read_iopl() {
    assert_eq!(3, Flags(FLAG_IOPL).iopl());
    assert_eq!(1, Flags(0x1000).iopl());
}

#[test]
fn iret_mask_depends_on_privilege() {
    let user = iret_writable_mask(3, 0, 64);
    assert_eq!(0, user & FLAG_IF);
    assert_eq!(0, user & FLAG_IOPL);

    let io = iret_writable_mask(3, 3, 64);
    assert_eq!(FLAG_IF, io & FLAG_IF);
    assert_eq!(0, io & FLAG_IOPL);

    let kernel = iret_writable_mask(0, 0, 64);
    assert_eq!(FLAG_IOPL | FLAG_IF | FLAG_VIF | FLAG_VIP, kernel & (FLAG_IOPL | FLAG_IF | FLAG_VIF | FLAG_VIP));

    let word = iret_writable_mask(0, 0, 16);
    assert_eq!(0, word & !0xFFFF);
}
