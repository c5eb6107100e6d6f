use iced_x86::{Code, Formatter, IntelFormatter, Mnemonic, OpKind, Register};

use crate::cpu::instruction::{Instruction, RepeatMode};
use crate::cpu::op::{Condition, Op};
use crate::cpu::operand::{Gpr, MemoryOperand, Operand};
use crate::cpu::register::{R, AddressSize, OperandSize};
use crate::cpu::segment::Segment;
use crate::cpu::vcpu::Vcpu;
use crate::error::Error;
use crate::memory::PAGE_SIZE;

#[cfg(test)]
#[path = "./decoder_test.rs"]
mod decoder_test;

/// longest legal x86 instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// turns the guest bytes at an instruction pointer into an `Instruction`
pub trait Decoder {
    /// Decodes the instruction at CS:`ip`. Code is fetched under `page_table_root`
    /// when given, and `replacement_byte` stands in for the first fetched byte.
    fn decode(&mut self, vcpu: &mut dyn Vcpu, ip: u64, page_table_root: Option<u64>, replacement_byte: Option<u8>) -> Result<Instruction, Error>;
}

/// decoder backed by iced-x86
#[derive(Clone, Copy, Debug, Default)]
pub struct IcedDecoder;

impl IcedDecoder {
    pub fn new() -> Self {
        IcedDecoder
    }
}

/// prefix state iced does not expose directly
#[derive(Debug, Default, PartialEq)]
struct Prefixes {
    operand_size: bool, // 0x66
    address_size: bool, // 0x67
    rex_w: bool,
}

fn scan_prefixes(bytes: &[u8], bitness: u32) -> Prefixes {
    let mut p = Prefixes::default();
    for &b in bytes {
        match b {
            0x66 => p.operand_size = true,
            0x67 => p.address_size = true,
            0xF0 | 0xF2 | 0xF3 | 0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {}
            0x40..=0x4F if bitness == 64 => {
                // only the REX directly in front of the opcode counts
                p.rex_w = b & 0x08 != 0;
                continue;
            }
            _ => break,
        }
        p.rex_w = false;
    }
    p
}

fn bitness(vcpu: &dyn Vcpu) -> u32 {
    let cs = vcpu.read_segment(Segment::CS);
    if cs.is_long() {
        64
    } else if cs.is_default_big() {
        32
    } else {
        16
    }
}

fn segment_from(reg: Register) -> Option<Segment> {
    Some(match reg {
        Register::ES => Segment::ES,
        Register::CS => Segment::CS,
        Register::SS => Segment::SS,
        Register::DS => Segment::DS,
        Register::FS => Segment::FS,
        Register::GS => Segment::GS,
        _ => return None,
    })
}

fn gpr_from(reg: Register) -> Option<Gpr> {
    let r = match reg.full_register() {
        Register::RAX => R::RAX,
        Register::RCX => R::RCX,
        Register::RDX => R::RDX,
        Register::RBX => R::RBX,
        Register::RSP => R::RSP,
        Register::RBP => R::RBP,
        Register::RSI => R::RSI,
        Register::RDI => R::RDI,
        Register::R8 => R::R8,
        Register::R9 => R::R9,
        Register::R10 => R::R10,
        Register::R11 => R::R11,
        Register::R12 => R::R12,
        Register::R13 => R::R13,
        Register::R14 => R::R14,
        Register::R15 => R::R15,
        _ => return None,
    };
    match reg {
        Register::AH | Register::CH | Register::DH | Register::BH => Some(Gpr::high(r)),
        _ => Some(Gpr::new(r, OperandSize::from_bits(reg.size() * 8)?)),
    }
}

fn condition_from(mnemonic: Mnemonic) -> Option<Condition> {
    Some(match mnemonic {
        Mnemonic::Jo => Condition::O,
        Mnemonic::Jno => Condition::No,
        Mnemonic::Jb => Condition::B,
        Mnemonic::Jae => Condition::Ae,
        Mnemonic::Je => Condition::E,
        Mnemonic::Jne => Condition::Ne,
        Mnemonic::Jbe => Condition::Be,
        Mnemonic::Ja => Condition::A,
        Mnemonic::Js => Condition::S,
        Mnemonic::Jns => Condition::Ns,
        Mnemonic::Jp => Condition::P,
        Mnemonic::Jnp => Condition::Np,
        Mnemonic::Jl => Condition::L,
        Mnemonic::Jge => Condition::Ge,
        Mnemonic::Jle => Condition::Le,
        Mnemonic::Jg => Condition::G,
        _ => return None,
    })
}

fn op_from(instr: &iced_x86::Instruction) -> Op {
    match instr.code() {
        Code::Movsb_m8_m8 => return Op::Movsb,
        Code::Movsw_m16_m16 => return Op::Movsw,
        Code::Movsd_m32_m32 => return Op::Movsd,
        Code::Movsq_m64_m64 => return Op::Movsq,
        Code::Stosb_m8_AL => return Op::Stosb,
        Code::Stosw_m16_AX => return Op::Stosw,
        Code::Stosd_m32_EAX => return Op::Stosd,
        Code::Stosq_m64_RAX => return Op::Stosq,
        Code::Retnw | Code::Retnd | Code::Retnq |
        Code::Retnw_imm16 | Code::Retnd_imm16 | Code::Retnq_imm16 => return Op::Ret,
        Code::Iretw | Code::Iretd | Code::Iretq => return Op::Iret,
        Code::Syscall => return Op::Syscall,
        Code::Sysretd | Code::Sysretq => return Op::Sysret,
        _ => {}
    }
    if let Some(cond) = condition_from(instr.mnemonic()) {
        return Op::Jcc(cond);
    }
    match instr.mnemonic() {
        Mnemonic::Add => Op::Add,
        Mnemonic::Adc => Op::Adc,
        Mnemonic::And => Op::And,
        Mnemonic::Cmp => Op::Cmp,
        Mnemonic::Dec => Op::Dec,
        Mnemonic::Inc => Op::Inc,
        Mnemonic::Neg => Op::Neg,
        Mnemonic::Not => Op::Not,
        Mnemonic::Or => Op::Or,
        Mnemonic::Sar => Op::Sar,
        Mnemonic::Sbb => Op::Sbb,
        Mnemonic::Shl => Op::Shl,
        Mnemonic::Sal => Op::Sal,
        Mnemonic::Shr => Op::Shr,
        Mnemonic::Sub => Op::Sub,
        Mnemonic::Test => Op::Test,
        Mnemonic::Xchg => Op::Xchg,
        Mnemonic::Xor => Op::Xor,
        Mnemonic::Mov => Op::Mov,
        Mnemonic::Movzx => Op::Movzx,
        Mnemonic::Movbe => Op::Movbe,
        Mnemonic::Lea => Op::Lea,
        Mnemonic::Jmp => Op::Jmp,
        Mnemonic::Call => Op::Call,
        Mnemonic::Sgdt => Op::Sgdt,
        Mnemonic::Sidt => Op::Sidt,
        Mnemonic::Lgdt => Op::Lgdt,
        Mnemonic::Lidt => Op::Lidt,
        Mnemonic::Str => Op::Str,
        Mnemonic::Sldt => Op::Sldt,
        Mnemonic::Lldt => Op::Lldt,
        Mnemonic::Ltr => Op::Ltr,
        Mnemonic::Sti => Op::Sti,
        Mnemonic::Cli => Op::Cli,
        Mnemonic::Out => Op::Out,
        Mnemonic::Cpuid => Op::Cpuid,
        Mnemonic::Nop => Op::Nop,
        _ => Op::Unknown,
    }
}

fn is_far(code: Code) -> bool {
    match code {
        Code::Jmp_ptr1616 | Code::Jmp_ptr1632 |
        Code::Jmp_m1616 | Code::Jmp_m1632 | Code::Jmp_m1664 |
        Code::Call_ptr1616 | Code::Call_ptr1632 |
        Code::Call_m1616 | Code::Call_m1632 | Code::Call_m1664 => true,
        _ => false,
    }
}

/// width of the offset part of a far pointer in memory
fn far_offset_size(code: Code) -> OperandSize {
    match code {
        Code::Jmp_m1616 | Code::Call_m1616 => OperandSize::_16bit,
        Code::Jmp_m1664 | Code::Call_m1664 => OperandSize::_64bit,
        _ => OperandSize::_32bit,
    }
}

/// operand size of instructions whose width iced encodes in the code only
fn implied_operand_size(code: Code) -> Option<OperandSize> {
    Some(match code {
        Code::Retnw | Code::Retnw_imm16 | Code::Iretw => OperandSize::_16bit,
        Code::Retnd | Code::Retnd_imm16 | Code::Iretd | Code::Sysretd => OperandSize::_32bit,
        Code::Retnq | Code::Retnq_imm16 | Code::Iretq | Code::Sysretq => OperandSize::_64bit,
        Code::Movsb_m8_m8 | Code::Stosb_m8_AL => OperandSize::_8bit,
        Code::Movsw_m16_m16 | Code::Stosw_m16_AX => OperandSize::_16bit,
        Code::Movsd_m32_m32 | Code::Stosd_m32_EAX => OperandSize::_32bit,
        Code::Movsq_m64_m64 | Code::Stosq_m64_RAX => OperandSize::_64bit,
        _ => return None,
    })
}

fn immediate_size(kind: OpKind) -> Option<OperandSize> {
    Some(match kind {
        OpKind::Immediate8 => OperandSize::_8bit,
        OpKind::Immediate16 | OpKind::Immediate8to16 => OperandSize::_16bit,
        OpKind::Immediate32 | OpKind::Immediate8to32 => OperandSize::_32bit,
        OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => OperandSize::_64bit,
        _ => return None,
    })
}

struct Sizes {
    operand: OperandSize,
    address: AddressSize,
}

fn memory_operand(instr: &iced_x86::Instruction, sizes: &Sizes, segment: Segment, base: Option<Gpr>) -> MemoryOperand {
    let size = OperandSize::from_bits(instr.memory_size().size() * 8).unwrap_or(sizes.operand);
    let mut mem = MemoryOperand::new(size, segment, sizes.address);
    if let Some(base) = base {
        mem = mem.with_base(base);
    }
    mem
}

/// converts operand `i`, None for operand kinds that are not emulated
fn operand_from(instr: &iced_x86::Instruction, i: u32, sizes: &Sizes, next_ip: u64) -> Option<Operand> {
    let kind = instr.op_kind(i);
    if let Some(size) = immediate_size(kind) {
        return Some(Operand::immediate(instr.immediate(i), size));
    }
    let index_size = sizes.address.operand_size();
    let string_segment = segment_from(instr.memory_segment()).unwrap_or(Segment::DS);
    match kind {
        OpKind::Register => {
            let reg = instr.op_register(i);
            if let Some(seg) = segment_from(reg) {
                return Some(Operand::segment(seg));
            }
            gpr_from(reg).map(Operand::gpr)
        }
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            let size = match kind {
                OpKind::NearBranch16 => OperandSize::_16bit,
                OpKind::NearBranch32 => OperandSize::_32bit,
                _ => OperandSize::_64bit,
            };
            let disp = instr.near_branch_target().wrapping_sub(next_ip);
            Some(Operand::immediate(disp, size))
        }
        OpKind::FarBranch16 => Some(Operand::far_pointer(instr.far_branch_selector(), u64::from(instr.far_branch16()), OperandSize::_16bit)),
        OpKind::FarBranch32 => Some(Operand::far_pointer(instr.far_branch_selector(), u64::from(instr.far_branch32()), OperandSize::_32bit)),
        OpKind::MemorySegSI | OpKind::MemorySegESI | OpKind::MemorySegRSI => {
            Some(Operand::memory(memory_operand(instr, sizes, string_segment, Some(Gpr::new(R::RSI, index_size)))))
        }
        OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI => {
            Some(Operand::memory(memory_operand(instr, sizes, Segment::ES, Some(Gpr::new(R::RDI, index_size)))))
        }
        OpKind::Memory => {
            let segment = segment_from(instr.memory_segment())?;
            let mut mem = if is_far(instr.code()) {
                MemoryOperand::new(far_offset_size(instr.code()), segment, sizes.address)
            } else {
                memory_operand(instr, sizes, segment, None)
            };
            if instr.is_ip_rel_memory_operand() {
                // iced resolves the displacement to the absolute target
                return Some(Operand::memory(mem.with_displacement(instr.ip_rel_memory_address() as i64)));
            }
            match instr.memory_base() {
                Register::None => {}
                reg => mem = mem.with_base(gpr_from(reg)?),
            }
            match instr.memory_index() {
                Register::None => {}
                reg => mem = mem.with_index(gpr_from(reg)?, instr.memory_index_scale() as u8),
            }
            if instr.memory_displ_size() != 0 || instr.memory_base() == Register::None {
                mem = mem.with_displacement(instr.memory_displacement64() as i64);
            }
            Some(Operand::memory(mem))
        }
        _ => None,
    }
}

impl Decoder for IcedDecoder {
    fn decode(&mut self, vcpu: &mut dyn Vcpu, ip: u64, page_table_root: Option<u64>, replacement_byte: Option<u8>) -> Result<Instruction, Error> {
        let bitness = bitness(vcpu);
        let cs = vcpu.read_segment(Segment::CS);
        let linear = if bitness == 64 {
            ip
        } else {
            cs.base.wrapping_add(ip) & 0xFFFF_FFFF
        };

        // fetch page by page, a fault past the first page only matters if the decoder needs those bytes
        let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
        let mut len = 0;
        while len < MAX_INSTRUCTION_LENGTH {
            let addr = linear.wrapping_add(len as u64);
            let chunk = (MAX_INSTRUCTION_LENGTH - len).min((PAGE_SIZE - addr % PAGE_SIZE) as usize);
            let fetched = match vcpu.translate(addr, page_table_root) {
                Some(gpa) => vcpu.read_phys(gpa, &mut bytes[len..len + chunk]),
                None => false,
            };
            if !fetched {
                if len == 0 {
                    return Err(Error::Fault(addr));
                }
                break;
            }
            len += chunk;
        }
        if let Some(b) = replacement_byte {
            bytes[0] = b;
        }

        let mut decoder = iced_x86::Decoder::with_ip(bitness, &bytes[..len], ip, iced_x86::DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.code() == Code::INVALID {
            if decoder.last_error() == iced_x86::DecoderError::NoMoreBytes {
                return Err(Error::Fault(linear.wrapping_add(len as u64)));
            }
            return Err(Error::Decode(bytes[..len].to_vec()));
        }

        let length = instr.len();
        let prefixes = scan_prefixes(&bytes[..length], bitness);
        let address_size = match (bitness, prefixes.address_size) {
            (64, false) => AddressSize::_64bit,
            (64, true) | (32, false) | (16, true) => AddressSize::_32bit,
            _ => AddressSize::_16bit,
        };
        let mut operand_size = match (bitness, prefixes.operand_size) {
            (64, _) if prefixes.rex_w => OperandSize::_64bit,
            (16, false) | (32, true) | (64, true) => OperandSize::_16bit,
            _ => OperandSize::_32bit,
        };
        if let Some(size) = implied_operand_size(instr.code()) {
            operand_size = size;
        }
        let stack_address_size = if bitness == 64 {
            AddressSize::_64bit
        } else if vcpu.read_segment(Segment::SS).is_default_big() {
            AddressSize::_32bit
        } else {
            AddressSize::_16bit
        };

        let sizes = Sizes { operand: operand_size, address: address_size };
        let next_ip = ip.wrapping_add(length as u64);
        let mut op = op_from(&instr);
        let mut operands = Vec::with_capacity(instr.op_count() as usize);
        for i in 0..instr.op_count() {
            match operand_from(&instr, i, &sizes, next_ip) {
                Some(operand) => operands.push(operand),
                None => {
                    op = Op::Unknown;
                    break;
                }
            }
        }
        // near branches, rm forms included, take their width from the target operand
        match op {
            Op::Jmp | Op::Call | Op::Jcc(_) if !is_far(instr.code()) => {
                if let Some(operand) = operands.get(0) {
                    operand_size = operand.size();
                }
            }
            _ => {}
        }

        let mut text = String::new();
        IntelFormatter::new().format(&instr, &mut text);

        let mut res = Instruction::new(op, operands);
        res.segment_prefix = segment_from(instr.segment_prefix());
        res.repeat = if instr.has_repne_prefix() {
            RepeatMode::Repne
        } else if instr.has_repe_prefix() {
            if op.is_string() { RepeatMode::Rep } else { RepeatMode::Repe }
        } else {
            RepeatMode::None
        };
        res.lock = instr.has_lock_prefix();
        res.op_size = operand_size;
        res.address_size = address_size;
        res.stack_address_size = stack_address_size;
        res.far = is_far(instr.code());
        res.length = length;
        res.bytes = bytes[..length].to_vec();
        res.text = text;
        Ok(res)
    }
}
