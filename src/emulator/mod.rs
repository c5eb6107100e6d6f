//! Dispatch of decoded instructions to their handlers.

use crate::config::EmulatorConfig;
use crate::cpu::arena::{OperandArena, OperandId};
use crate::cpu::decoder::{Decoder, IcedDecoder};
use crate::cpu::descriptor::{DescriptorTable, GdtParser};
use crate::cpu::flag::Flags;
use crate::cpu::instruction::{Instruction, InstructionInfo};
use crate::cpu::op::Op;
use crate::cpu::operand::{Gpr, MemoryOperand, Operand};
use crate::cpu::register::{OperandSize, CR0_PE, R};
use crate::cpu::segment::{Segment, SegmentDescriptor};
use crate::cpu::vcpu::Vcpu;
use crate::error::Error;

mod alu;
mod branch;
mod movement;
mod system;


/// result of one `Emulator::emulate` call
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// guest state was updated
    Ok,

    /// a guest memory access could not be resolved, RIP was not advanced
    Fault,

    /// no handler for the decoded instruction, nothing was modified
    Unimplemented(Instruction),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Decoding,
    Dispatched,
    Done,
}

/// how a handler leaves the instruction pointer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// advance to the next instruction
    Next,

    /// the handler loaded RIP
    Branch,

    /// stay on this instruction, used by REP iterations
    Repeat,
}

type Handler = fn(&mut Context) -> Result<Flow, Error>;

/// everything a handler works on while executing one instruction
pub struct Context<'a> {
    pub vcpu: &'a mut dyn Vcpu,
    pub instr: &'a Instruction,
    pub arena: &'a mut OperandArena,
    pub descriptors: &'a dyn DescriptorTable,

    /// arena handles of the decoded operands
    ids: [Option<OperandId>; 3],

    pub ip: u64,
    pub next_ip: u64,
}

impl<'a> Context<'a> {
    /// moves the decoded operands into `arena`
    pub fn new(vcpu: &'a mut dyn Vcpu, instr: &'a Instruction, arena: &'a mut OperandArena, descriptors: &'a dyn DescriptorTable, ip: u64) -> Result<Self, Error> {
        let mut ids = [None; 3];
        for (i, operand) in instr.operands.iter().take(3).enumerate() {
            ids[i] = Some(arena.alloc(operand.clone())?);
        }
        Ok(Context {
            vcpu,
            instr,
            arena,
            descriptors,
            ids,
            ip,
            next_ip: ip.wrapping_add(instr.length() as u64),
        })
    }

    pub fn operand_id(&self, i: usize) -> Result<OperandId, Error> {
        match self.ids.get(i) {
            Some(Some(id)) => Ok(*id),
            _ => Err(Error::MissingOperand(i)),
        }
    }

    pub fn operand(&mut self, i: usize) -> Result<&mut Operand, Error> {
        let id = self.operand_id(i)?;
        self.arena.get_mut(id)
    }

    /// reads operand `i` from its source
    pub fn read_operand(&mut self, i: usize) -> Result<u64, Error> {
        let id = self.operand_id(i)?;
        self.read_id(id)
    }

    pub fn write_operand(&mut self, i: usize, val: u64) -> Result<(), Error> {
        let id = self.operand_id(i)?;
        self.write_id(id, val)
    }

    pub fn read_id(&mut self, id: OperandId) -> Result<u64, Error> {
        let operand = self.arena.get_mut(id)?;
        operand.read(self.vcpu)?;
        Ok(operand.value())
    }

    pub fn write_id(&mut self, id: OperandId, val: u64) -> Result<(), Error> {
        let operand = self.arena.get_mut(id)?;
        operand.set(val);
        operand.write(self.vcpu)
    }

    /// places a handler created operand in the arena
    pub fn alloc(&mut self, operand: Operand) -> Result<OperandId, Error> {
        self.arena.alloc(operand)
    }

    pub fn flags(&self) -> Flags {
        self.vcpu.flags()
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.vcpu.write_reg(R::RFLAGS, flags.0);
    }

    pub fn is_protected_mode(&self) -> bool {
        self.vcpu.read_reg(R::CR0) & CR0_PE != 0
    }

    /// Looks up the descriptor `selector` loads into `seg`, without loading it.
    /// Outside protected mode the base is the selector shifted by four.
    pub fn lookup_segment(&mut self, seg: Segment, selector: u16) -> Result<SegmentDescriptor, Error> {
        if !self.is_protected_mode() {
            let mut desc = self.vcpu.read_segment(seg);
            desc.selector = selector;
            desc.base = u64::from(selector) << 4;
            return Ok(desc);
        }
        let is_64bit = self.vcpu.is_long_mode();
        self.descriptors.parse_gdt(self.vcpu, selector, is_64bit)
    }

    /// the stack slot `index` entries of `size` above the stack pointer
    fn stack_slot(&self, size: OperandSize, index: i64) -> Operand {
        let asz = self.instr.stack_address_size();
        let mem = MemoryOperand::new(size, Segment::SS, asz)
            .with_base(Gpr::new(R::RSP, asz.operand_size()))
            .with_displacement(index * size.bytes() as i64);
        Operand::memory(mem)
    }

    fn adjust_stack_pointer(&mut self, delta: i64) {
        let sp = Gpr::new(R::RSP, self.instr.stack_address_size().operand_size());
        let val = sp.read(self.vcpu).wrapping_add(delta as u64);
        sp.write(self.vcpu, val);
    }

    /// Pushes `values` in order. All stack writes happen before the stack
    /// pointer moves, a fault leaves it untouched.
    pub fn push(&mut self, values: &[u64], size: OperandSize) -> Result<(), Error> {
        for (i, val) in values.iter().enumerate() {
            let id = self.alloc(self.stack_slot(size, -(i as i64 + 1)))?;
            self.write_id(id, *val)?;
        }
        self.adjust_stack_pointer(-((values.len() * size.bytes()) as i64));
        Ok(())
    }

    /// Reads `N` stack entries without moving the stack pointer,
    /// `release_stack` commits the pop.
    pub fn peek<const N: usize>(&mut self, size: OperandSize) -> Result<[u64; N], Error> {
        let mut res = [0u64; N];
        for (i, val) in res.iter_mut().enumerate() {
            let id = self.alloc(self.stack_slot(size, i as i64))?;
            *val = self.read_id(id)?;
        }
        Ok(res)
    }

    pub fn release_stack(&mut self, bytes: u64) {
        self.adjust_stack_pointer(bytes as i64);
    }
}

// maps ops to their handlers
macro_rules! gen_handler_match {
    ($value: ident, $( ($module:ident, $handler:ident, $( $op:pat )|+ ) ),* ) => {
        match $value {
            $(
                $( $op )|+ => Some($module::$handler as Handler),
            )*
            _ => None,
        }
    };
}

fn handler_for(op: Op) -> Option<Handler> {
    gen_handler_match!(
        op,
        (alu, alu, Op::Add | Op::Adc | Op::And | Op::Cmp | Op::Dec | Op::Inc | Op::Neg | Op::Not |
                   Op::Or | Op::Sar | Op::Sbb | Op::Shl | Op::Sal | Op::Shr | Op::Sub | Op::Test |
                   Op::Xchg | Op::Xor),
        (alu, movbe, Op::Movbe),
        (movement, mov, Op::Mov | Op::Movzx),
        (movement, movs, Op::Movsb | Op::Movsw | Op::Movsd | Op::Movsq),
        (movement, stos, Op::Stosb | Op::Stosw | Op::Stosd | Op::Stosq),
        (movement, lea, Op::Lea),
        (branch, jmp, Op::Jmp),
        (branch, jcc, Op::Jcc(_)),
        (branch, call, Op::Call),
        (branch, ret, Op::Ret),
        (branch, iret, Op::Iret),
        (branch, syscall, Op::Syscall),
        (branch, sysret, Op::Sysret),
        (system, store_table, Op::Sgdt | Op::Sidt),
        (system, load_table, Op::Lgdt | Op::Lidt),
        (system, store_selector, Op::Str | Op::Sldt),
        (system, lldt, Op::Lldt),
        (system, ltr, Op::Ltr),
        (system, sti, Op::Sti),
        (system, cli, Op::Cli),
        (system, out, Op::Out),
        (system, cpuid, Op::Cpuid),
        (system, nop, Op::Nop)
    )
}

/// instructions whose handler knowingly leaves part of the architecture out
fn known_gap(op: Op) -> bool {
    match op {
        // the TSS busy bit is not set
        Op::Ltr => true,
        _ => false,
    }
}

/// Emulates single guest instructions on behalf of a vcpu.
pub struct Emulator {
    decoder: Box<dyn Decoder + Send>,
    descriptors: Box<dyn DescriptorTable + Send>,
    arena: OperandArena,
    config: EmulatorConfig,
    state: State,

    /// length of the most recently decoded instruction
    last_length: usize,
}

impl Default for Emulator {
    fn default() -> Self {
        Emulator::new(EmulatorConfig::default())
    }
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Emulator::with_collaborators(config, Box::new(IcedDecoder::new()), Box::new(GdtParser::new()))
    }

    pub fn with_collaborators(config: EmulatorConfig, decoder: Box<dyn Decoder + Send>, descriptors: Box<dyn DescriptorTable + Send>) -> Self {
        Emulator {
            decoder,
            descriptors,
            arena: OperandArena::new(),
            config,
            state: State::Done,
            last_length: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn last_length(&self) -> usize {
        self.last_length
    }

    /// releases all operands of the previous emulation
    pub fn reset_operands(&mut self) {
        self.arena.reset();
    }

    /// returns true if `op` has a handler that implements its full architectural behaviour
    pub fn is_fully_implemented(op: Op) -> bool {
        handler_for(op).is_some() && !known_gap(op)
    }

    /// Decodes and executes the instruction at `ip`.
    ///
    /// `page_table_root` fetches the instruction under another address space,
    /// `replacement_byte` is decoded in place of the first instruction byte.
    pub fn emulate(&mut self, vcpu: &mut dyn Vcpu, ip: u64, page_table_root: Option<u64>, replacement_byte: Option<u8>) -> Result<Outcome, Error> {
        self.reset_operands();
        self.state = State::Decoding;

        let instr = match self.decoder.decode(vcpu, ip, page_table_root, replacement_byte) {
            Ok(instr) => instr,
            Err(Error::Fault(linear)) => {
                debug!("instruction fetch at {:016X} faulted on {:016X}", ip, linear);
                self.state = State::Done;
                return Ok(Outcome::Fault);
            }
            Err(e) => {
                self.state = State::Done;
                return Err(e);
            }
        };
        self.last_length = instr.length();

        let info = InstructionInfo { ip, instruction: &instr };
        if self.config.trace {
            trace!("{}", info);
        }

        let handler = match handler_for(instr.op()) {
            Some(handler) => handler,
            None => {
                if self.config.report_unimplemented {
                    warn!("unimplemented instruction {}", info);
                }
                self.state = State::Done;
                return Ok(Outcome::Unimplemented(instr));
            }
        };

        self.state = State::Dispatched;
        let res = Context::new(vcpu, &instr, &mut self.arena, &*self.descriptors, ip)
            .and_then(|mut ctx| handler(&mut ctx).map(|flow| (flow, ctx.next_ip)));
        self.state = State::Done;

        match res {
            Ok((Flow::Next, next_ip)) => {
                vcpu.write_reg(R::RIP, next_ip);
                Ok(Outcome::Ok)
            }
            Ok((Flow::Repeat, _)) => {
                vcpu.write_reg(R::RIP, ip);
                Ok(Outcome::Ok)
            }
            Ok((Flow::Branch, _)) => Ok(Outcome::Ok),
            Err(Error::Fault(linear)) => {
                debug!("{} faulted on {:016X}", info, linear);
                Ok(Outcome::Fault)
            }
            Err(Error::Unsupported(gap)) => {
                warn!("{}: {}", info, gap);
                Err(Error::Unsupported(gap))
            }
            Err(e) => Err(e),
        }
    }
}
