use crate::cpu::instruction::RepeatMode;
use crate::cpu::operand::{Gpr, Operand};
use crate::cpu::register::R;
use crate::cpu::segment::Segment;
use crate::emulator::{Context, Flow};
use crate::error::{Error, Gap};

#[cfg(test)]
#[path = "./movement_test.rs"]
mod movement_test;

/// MOV and MOVZX, including loads of segment registers
pub fn mov(ctx: &mut Context) -> Result<Flow, Error> {
    let val = ctx.read_operand(1)?;
    let segment = match *ctx.operand(0)? {
        Operand::Segment(ref s) => Some(s.segment),
        _ => None,
    };
    match segment {
        Some(seg) => {
            let desc = ctx.lookup_segment(seg, val as u16)?;
            ctx.vcpu.write_segment(seg, desc);
            if seg == Segment::SS {
                ctx.vcpu.set_sti_blocking();
            }
        }
        None => ctx.write_operand(0, val)?,
    }
    Ok(Flow::Next)
}

/// LEA, the memory operand is never accessed
pub fn lea(ctx: &mut Context) -> Result<Flow, Error> {
    let src = ctx.operand_id(1)?;
    let ea = ctx.arena.get(src)?
        .as_memory()
        .ok_or(Gap::Addressing)?
        .effective_address(ctx.vcpu);
    ctx.write_operand(0, ea)?;
    Ok(Flow::Next)
}

/// MOVSB MOVSW MOVSD MOVSQ
pub fn movs(ctx: &mut Context) -> Result<Flow, Error> {
    string_op(ctx, true)
}

/// STOSB STOSW STOSD STOSQ
pub fn stos(ctx: &mut Context) -> Result<Flow, Error> {
    string_op(ctx, false)
}

/// Moves one element from operand 1 to ES:DI. `advance_source` steps the
/// SI family along with DI. A REP prefix runs one element per call and leaves
/// RIP on the instruction until the count register reaches zero.
fn string_op(ctx: &mut Context, advance_source: bool) -> Result<Flow, Error> {
    let width = ctx.instr.address_size().operand_size();
    let count = Gpr::new(R::RCX, width);
    let rep = ctx.instr.rep_prefix() != RepeatMode::None;
    if rep && count.read(ctx.vcpu) == 0 {
        return Ok(Flow::Next);
    }

    let size = ctx.operand(0)?.size();
    let val = ctx.read_operand(1)?;
    ctx.write_operand(0, val)?;

    let step = if ctx.flags().direction() {
        (size.bytes() as u64).wrapping_neg()
    } else {
        size.bytes() as u64
    };
    let index: &[R] = if advance_source { &[R::RDI, R::RSI] } else { &[R::RDI] };
    for r in index {
        let reg = Gpr::new(*r, width);
        let val = reg.read(ctx.vcpu).wrapping_add(step);
        reg.write(ctx.vcpu, val);
    }

    if !rep {
        return Ok(Flow::Next);
    }
    let remaining = count.read(ctx.vcpu).wrapping_sub(1);
    count.write(ctx.vcpu, remaining);
    if remaining & width.mask() == 0 {
        Ok(Flow::Next)
    } else {
        Ok(Flow::Repeat)
    }
}
