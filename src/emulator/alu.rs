use crate::cpu::native;
use crate::cpu::op::Op;
use crate::cpu::operand::OperandKind;
use crate::emulator::{Context, Flow};
use crate::error::{Error, Gap};

#[cfg(test)]
#[path = "./alu_test.rs"]
mod alu_test;

/// ADD OR ADC SBB AND SUB XOR CMP TEST XCHG INC DEC NEG NOT SHL SAL SHR SAR
pub fn alu(ctx: &mut Context) -> Result<Flow, Error> {
    let op = ctx.instr.op();
    let dst = ctx.operand_id(0)?;
    let (kind, size) = {
        let operand = ctx.arena.get(dst)?;
        (operand.kind(), operand.size())
    };
    let fragments = native::lookup(op, size).ok_or(Gap::OperandKind)?;
    let mask = native::affected_flags(op);
    let guest = ctx.flags();
    let readonly = native::is_readonly(op);

    let mut src = if native::is_unary(op) {
        0
    } else {
        ctx.read_operand(1)?
    };

    let host_flags = match kind {
        OperandKind::Register => {
            let mut val = ctx.read_id(dst)?;
            let host_flags = fragments.run_register(&mut val, &mut src, guest.0 & mask);
            if !readonly {
                ctx.write_id(dst, val)?;
            }
            host_flags
        }
        OperandKind::Memory => {
            let lock = ctx.instr.has_lock_prefix() || op == Op::Xchg;
            let src_ref = &mut src;
            let mem = ctx.arena.get_mut(dst)?.as_memory_mut().ok_or(Gap::OperandKind)?;
            let host_flags = mem.with_location(ctx.vcpu, |loc| {
                fragments.run_memory(loc, src_ref, guest.0 & mask, lock)
            })?;
            let commit = !readonly && !mem.is_host_accessible();
            if commit {
                ctx.arena.get_mut(dst)?.write(ctx.vcpu)?;
            }
            host_flags
        }
        _ => return Err(Gap::OperandKind.into()),
    };

    if op == Op::Xchg {
        ctx.write_operand(1, src)?;
    }
    ctx.set_flags(guest.merge(host_flags, mask));
    Ok(Flow::Next)
}

/// MOVBE in either direction
pub fn movbe(ctx: &mut Context) -> Result<Flow, Error> {
    let size = ctx.operand(0)?.size();
    let val = ctx.read_operand(1)?;
    ctx.write_operand(0, native::swap_bytes(size, val))?;
    Ok(Flow::Next)
}
