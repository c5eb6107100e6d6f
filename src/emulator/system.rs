use crate::cpu::flag::FLAG_IF;
use crate::cpu::op::Op;
use crate::cpu::register::{AddressSize, TableRegister};
use crate::cpu::segment::{is_null_selector, SegmentDescriptor, TYPE_LDT, TYPE_TSS16_AVAILABLE, TYPE_TSS_AVAILABLE};
use crate::emulator::{Context, Flow};
use crate::error::{Error, Gap};

#[cfg(test)]
#[path = "./system_test.rs"]
mod system_test;

/// limit:base as stored by SGDT/SIDT with 16 or 32-bit addressing
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TableRecord32 {
    limit: u16,
    base: u32,
}

/// limit:base as stored in 64-bit mode
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TableRecord64 {
    limit: u16,
    base: u64,
}

fn record_len(address_size: AddressSize) -> usize {
    match address_size {
        AddressSize::_64bit => 10,
        _ => 6,
    }
}

fn encode_record(address_size: AddressSize, desc: &SegmentDescriptor) -> Result<Vec<u8>, Error> {
    let limit = desc.limit as u16;
    Ok(match address_size {
        AddressSize::_64bit => bincode::serialize(&TableRecord64 { limit, base: desc.base })?,
        _ => bincode::serialize(&TableRecord32 { limit, base: desc.base as u32 })?,
    })
}

fn decode_record(address_size: AddressSize, data: &[u8]) -> Result<(u32, u64), Error> {
    Ok(match address_size {
        AddressSize::_64bit => {
            let rec: TableRecord64 = bincode::deserialize(data)?;
            (u32::from(rec.limit), rec.base)
        }
        _ => {
            let rec: TableRecord32 = bincode::deserialize(data)?;
            (u32::from(rec.limit), u64::from(rec.base))
        }
    })
}

fn table_register(ctx: &Context) -> TableRegister {
    match ctx.instr.op() {
        Op::Sidt | Op::Lidt => TableRegister::IDTR,
        Op::Str | Op::Ltr => TableRegister::TR,
        Op::Sldt | Op::Lldt => TableRegister::LDTR,
        _ => TableRegister::GDTR,
    }
}

/// SGDT SIDT
pub fn store_table(ctx: &mut Context) -> Result<Flow, Error> {
    let desc = ctx.vcpu.read_table(table_register(ctx));
    let data = encode_record(ctx.instr.address_size(), &desc)?;
    let dst = ctx.operand_id(0)?;
    ctx.arena.get_mut(dst)?
        .as_memory_mut()
        .ok_or(Gap::OperandKind)?
        .write_bytes(ctx.vcpu, &data)?;
    Ok(Flow::Next)
}

/// LGDT LIDT, the record layout follows the address size
pub fn load_table(ctx: &mut Context) -> Result<Flow, Error> {
    let address_size = ctx.instr.address_size();
    let mut data = [0u8; 10];
    let len = record_len(address_size);
    let src = ctx.operand_id(0)?;
    ctx.arena.get_mut(src)?
        .as_memory_mut()
        .ok_or(Gap::OperandKind)?
        .read_bytes(ctx.vcpu, &mut data[..len])?;
    let (limit, base) = decode_record(address_size, &data[..len])?;

    let table = table_register(ctx);
    let mut desc = ctx.vcpu.read_table(table);
    desc.limit = limit;
    desc.base = base;
    ctx.vcpu.write_table(table, desc);
    Ok(Flow::Next)
}

/// STR SLDT
pub fn store_selector(ctx: &mut Context) -> Result<Flow, Error> {
    let selector = ctx.vcpu.read_table(table_register(ctx)).selector;
    ctx.write_operand(0, u64::from(selector))?;
    Ok(Flow::Next)
}

/// loads a system descriptor of one of `kinds` from the GDT
fn system_descriptor(ctx: &mut Context, selector: u16, kinds: &[u32]) -> Result<SegmentDescriptor, Error> {
    if selector & 4 != 0 {
        return Err(Gap::DescriptorException(selector).into());
    }
    let is_64bit = ctx.vcpu.is_long_mode();
    let desc = ctx.descriptors.parse_gdt(ctx.vcpu, selector, is_64bit)?;
    if !desc.is_system() || !desc.is_present() || !kinds.contains(&desc.kind()) {
        return Err(Gap::DescriptorException(selector).into());
    }
    Ok(desc)
}

pub fn lldt(ctx: &mut Context) -> Result<Flow, Error> {
    let selector = ctx.read_operand(0)? as u16;
    let desc = if is_null_selector(selector) {
        SegmentDescriptor::unusable(selector)
    } else {
        system_descriptor(ctx, selector, &[TYPE_LDT])?
    };
    ctx.vcpu.write_table(TableRegister::LDTR, desc);
    Ok(Flow::Next)
}

/// LTR, the descriptor is not marked busy
pub fn ltr(ctx: &mut Context) -> Result<Flow, Error> {
    let selector = ctx.read_operand(0)? as u16;
    if is_null_selector(selector) {
        return Err(Gap::NullTaskRegister.into());
    }
    let desc = system_descriptor(ctx, selector, &[TYPE_TSS_AVAILABLE, TYPE_TSS16_AVAILABLE])?;
    ctx.vcpu.write_table(TableRegister::TR, desc);
    Ok(Flow::Next)
}

fn check_interrupt_privilege(ctx: &Context) -> Result<(), Error> {
    if ctx.is_protected_mode() && ctx.vcpu.cpl() > ctx.vcpu.iopl() {
        return Err(Gap::InterruptFlagPrivilege.into());
    }
    Ok(())
}

/// STI, arms the interrupt shadow when IF was clear
pub fn sti(ctx: &mut Context) -> Result<Flow, Error> {
    check_interrupt_privilege(ctx)?;
    let flags = ctx.flags();
    ctx.set_flags(flags.merge(FLAG_IF, FLAG_IF));
    if !flags.interrupt() {
        ctx.vcpu.set_sti_blocking();
    }
    Ok(Flow::Next)
}

pub fn cli(ctx: &mut Context) -> Result<Flow, Error> {
    check_interrupt_privilege(ctx)?;
    let flags = ctx.flags();
    ctx.set_flags(flags.merge(0, FLAG_IF));
    Ok(Flow::Next)
}

/// OUT imm8/DX, AL/AX/EAX
pub fn out(ctx: &mut Context) -> Result<Flow, Error> {
    let port = ctx.read_operand(0)? as u16;
    let val = ctx.read_operand(1)?;
    let len = ctx.operand(1)?.size().bytes();
    if !ctx.vcpu.write_port(port, len, val as u32) {
        return Err(Error::UnhandledPort(port));
    }
    Ok(Flow::Next)
}

pub fn cpuid(ctx: &mut Context) -> Result<Flow, Error> {
    if !ctx.vcpu.handle_cpuid() {
        return Err(Error::UnhandledCpuid);
    }
    Ok(Flow::Next)
}

pub fn nop(_ctx: &mut Context) -> Result<Flow, Error> {
    Ok(Flow::Next)
}
