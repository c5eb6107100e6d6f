use crate::cpu::flag::{iret_writable_mask, Flags, FLAG_RESERVED, FLAG_RF, SYSRET_MASK};
use crate::cpu::op::Op;
use crate::cpu::operand::Operand;
use crate::cpu::register::{OperandSize, MSR_FMASK, MSR_LSTAR, MSR_STAR, R};
use crate::cpu::segment::{is_null_selector, Segment, SegmentDescriptor};
use crate::emulator::{Context, Flow};
use crate::error::{Error, Gap};

#[cfg(test)]
#[path = "./branch_test.rs"]
mod branch_test;

/// the target of a near branch, masked to the operand size
fn near_target(ctx: &mut Context) -> Result<u64, Error> {
    let mask = ctx.instr.operand_size().mask();
    let target = match ctx.operand(0)?.clone() {
        Operand::Immediate(_) => ctx.next_ip.wrapping_add(ctx.read_operand(0)?),
        Operand::Register(_) | Operand::Memory(_) => ctx.read_operand(0)?,
        _ => return Err(Gap::OperandKind.into()),
    };
    Ok(target & mask)
}

/// selector and offset of a far branch, from a pointer or an m16:16/32/64 location
fn far_target(ctx: &mut Context) -> Result<(u16, u64), Error> {
    let operand = ctx.operand(0)?.clone();
    match operand {
        Operand::FarPointer(ref p) => Ok((p.selector, p.offset)),
        Operand::Memory(ref m) => {
            let offset = ctx.read_operand(0)?;
            let selector = m.offset_by(m.size.bytes() as i64, OperandSize::_16bit);
            let id = ctx.alloc(Operand::memory(selector))?;
            let selector = ctx.read_id(id)?;
            Ok((selector as u16, offset))
        }
        _ => Err(Gap::OperandKind.into()),
    }
}

/// Resolves the code segment a far JMP or CALL lands in. The returned
/// descriptor carries the adjusted RPL.
fn far_code_segment(ctx: &mut Context, selector: u16) -> Result<SegmentDescriptor, Error> {
    let mut desc = ctx.lookup_segment(Segment::CS, selector)?;
    if !ctx.is_protected_mode() {
        return Ok(desc);
    }
    if !desc.is_code() {
        return Err(Gap::FarBranchNotCode.into());
    }
    let cpl = ctx.vcpu.cpl();
    let rpl = (selector & 3) as u8;
    let allowed = if desc.is_conforming() {
        desc.dpl() <= cpl
    } else {
        desc.dpl() == cpl && rpl <= cpl
    };
    if !allowed {
        return Err(Gap::FarBranchPrivilege.into());
    }
    if !desc.is_present() {
        return Err(Gap::SegmentNotPresent(selector).into());
    }
    desc.selector = (selector & !3) | u16::from(cpl);
    Ok(desc)
}

enum Target {
    Near(u64),
    Far(SegmentDescriptor, u64),
}

fn branch_target(ctx: &mut Context) -> Result<Target, Error> {
    if ctx.instr.is_far_branch() {
        let (selector, offset) = far_target(ctx)?;
        let desc = far_code_segment(ctx, selector)?;
        Ok(Target::Far(desc, offset))
    } else {
        Ok(Target::Near(near_target(ctx)?))
    }
}

fn take_branch(ctx: &mut Context, target: Target) {
    match target {
        Target::Near(ip) => ctx.vcpu.write_reg(R::RIP, ip),
        Target::Far(desc, ip) => {
            ctx.vcpu.write_segment(Segment::CS, desc);
            ctx.vcpu.write_reg(R::RIP, ip);
        }
    }
}

pub fn jmp(ctx: &mut Context) -> Result<Flow, Error> {
    let target = branch_target(ctx)?;
    take_branch(ctx, target);
    Ok(Flow::Branch)
}

pub fn jcc(ctx: &mut Context) -> Result<Flow, Error> {
    let cond = match ctx.instr.op() {
        Op::Jcc(cond) => cond,
        _ => return Err(Gap::OperandKind.into()),
    };
    if !cond.is_met(ctx.flags()) {
        return Ok(Flow::Next);
    }
    let target = near_target(ctx)?;
    ctx.vcpu.write_reg(R::RIP, target);
    Ok(Flow::Branch)
}

/// CALL pushes the return CS (far) and IP only once the target is known to be valid
pub fn call(ctx: &mut Context) -> Result<Flow, Error> {
    let target = branch_target(ctx)?;
    let size = ctx.instr.operand_size();
    let next_ip = ctx.next_ip;
    match target {
        Target::Far(..) => {
            let cs = u64::from(ctx.vcpu.read_segment(Segment::CS).selector);
            ctx.push(&[cs, next_ip], size)?;
        }
        Target::Near(_) => ctx.push(&[next_ip], size)?,
    }
    take_branch(ctx, target);
    Ok(Flow::Branch)
}

/// near RET, with an optional count of extra bytes to release
pub fn ret(ctx: &mut Context) -> Result<Flow, Error> {
    let size = ctx.instr.operand_size();
    let [ip] = ctx.peek::<1>(size)?;
    let extra = match ctx.instr.operand_count() {
        0 => 0,
        _ => ctx.read_operand(0)?,
    };
    ctx.release_stack(size.bytes() as u64);
    ctx.release_stack(extra);
    ctx.vcpu.write_reg(R::RIP, ip & size.mask());
    Ok(Flow::Branch)
}

/// The CS and SS an IRET returns to, checked at the RPL of the popped CS.
/// A null SS is only accepted when returning to 64-bit code below ring 3.
fn check_iret_segments(cs: &SegmentDescriptor, ss: &SegmentDescriptor) -> Result<(), Error> {
    let rpl = cs.rpl();
    let allowed = if cs.is_conforming() {
        cs.dpl() <= rpl
    } else {
        cs.dpl() == rpl
    };
    if !cs.is_code() || !allowed {
        return Err(Gap::DescriptorException(cs.selector).into());
    }
    if !cs.is_present() {
        return Err(Gap::SegmentNotPresent(cs.selector).into());
    }
    if is_null_selector(ss.selector) {
        if cs.is_long() && rpl != 3 {
            return Ok(());
        }
        return Err(Gap::DescriptorException(ss.selector).into());
    }
    if !ss.is_writable_data() || ss.rpl() != rpl || ss.dpl() != rpl {
        return Err(Gap::DescriptorException(ss.selector).into());
    }
    if !ss.is_present() {
        return Err(Gap::SegmentNotPresent(ss.selector).into());
    }
    Ok(())
}

/// IRET in 64-bit mode, always popping SS:RSP
pub fn iret(ctx: &mut Context) -> Result<Flow, Error> {
    if !ctx.vcpu.is_long_mode() {
        return Err(Gap::IretOutsideLongMode.into());
    }
    let flags = ctx.flags();
    if flags.nested_task() {
        return Err(Gap::TaskSwitch.into());
    }
    if flags.virtual_8086() {
        return Err(Gap::Virtual8086.into());
    }

    let size = ctx.instr.operand_size();
    let [ip, cs, rflags, sp, ss] = ctx.peek::<5>(size)?;
    let cpl = ctx.vcpu.cpl();
    let cs = cs as u16;
    if ((cs & 3) as u8) < cpl {
        return Err(Gap::IretPrivilegeIncrease.into());
    }
    let cs_desc = ctx.lookup_segment(Segment::CS, cs)?;
    let ss_desc = ctx.lookup_segment(Segment::SS, ss as u16)?;
    check_iret_segments(&cs_desc, &ss_desc)?;
    let mask = iret_writable_mask(cpl, ctx.vcpu.iopl(), size.bits());

    ctx.vcpu.write_reg(R::RIP, ip & size.mask());
    ctx.vcpu.write_segment(Segment::CS, cs_desc);
    ctx.set_flags(flags.merge(rflags, mask));
    ctx.vcpu.write_reg(R::RSP, sp & size.mask());
    ctx.vcpu.write_segment(Segment::SS, ss_desc);
    Ok(Flow::Branch)
}

fn read_msr(ctx: &Context, index: u32) -> Result<u64, Error> {
    ctx.vcpu.read_msr(index).ok_or(Error::MsrRead(index))
}

/// SYSCALL into the flat ring 0 segments named by STAR
pub fn syscall(ctx: &mut Context) -> Result<Flow, Error> {
    let star = read_msr(ctx, MSR_STAR)?;
    let lstar = read_msr(ctx, MSR_LSTAR)?;
    let fmask = read_msr(ctx, MSR_FMASK)?;

    let rflags = ctx.flags().0;
    let cs = ((star >> 32) as u16) & !3;
    ctx.vcpu.write_reg(R::RCX, ctx.next_ip);
    ctx.vcpu.write_reg(R::R11, rflags);
    ctx.vcpu.write_reg(R::RIP, lstar);
    ctx.set_flags(Flags((rflags & !fmask & !FLAG_RF) | FLAG_RESERVED));
    ctx.vcpu.write_segment(Segment::CS, SegmentDescriptor::flat_code(cs, 0, true));
    ctx.vcpu.write_segment(Segment::SS, SegmentDescriptor::flat_data(cs.wrapping_add(8), 0));
    Ok(Flow::Branch)
}

/// SYSRET back to ring 3, to 64-bit code with REX.W and to 32-bit code otherwise
pub fn sysret(ctx: &mut Context) -> Result<Flow, Error> {
    let star = read_msr(ctx, MSR_STAR)?;
    let base = (star >> 48) as u16;
    let long = ctx.instr.operand_size() == OperandSize::_64bit;

    let rcx = ctx.vcpu.read_reg(R::RCX);
    let r11 = ctx.vcpu.read_reg(R::R11);
    let (cs, rip) = if long {
        (base.wrapping_add(16) | 3, rcx)
    } else {
        (base | 3, rcx & 0xFFFF_FFFF)
    };
    ctx.vcpu.write_reg(R::RIP, rip);
    ctx.set_flags(Flags((r11 & SYSRET_MASK) | FLAG_RESERVED));
    ctx.vcpu.write_segment(Segment::CS, SegmentDescriptor::flat_code(cs, 3, long));
    ctx.vcpu.write_segment(Segment::SS, SegmentDescriptor::flat_data(base.wrapping_add(8) | 3, 3));
    Ok(Flow::Branch)
}
