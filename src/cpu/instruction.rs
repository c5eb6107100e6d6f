use std::fmt;

use crate::cpu::op::Op;
use crate::cpu::operand::Operand;
use crate::cpu::register::{AddressSize, OperandSize};
use crate::cpu::segment::Segment;
use crate::hex::hex_bytes;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RepeatMode {
    None,
    Rep,
    Repe, // alias repz
    Repne, // alias repnz
}

impl RepeatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RepeatMode::None => "",
            RepeatMode::Rep => "rep ",
            RepeatMode::Repe => "repe ",
            RepeatMode::Repne => "repne ",
        }
    }
}

/// one decoded instruction, valid for the duration of one emulation
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub operands: Vec<Operand>,
    pub segment_prefix: Option<Segment>,
    pub repeat: RepeatMode,     // REPcc prefix
    pub lock: bool,             // LOCK prefix
    pub op_size: OperandSize,   // 0x66 / REX.W
    pub address_size: AddressSize, // 0x67
    pub stack_address_size: AddressSize,
    pub far: bool,
    pub length: usize,
    pub bytes: Vec<u8>,
    pub text: String,
}

impl Instruction {
    pub fn new(op: Op, operands: Vec<Operand>) -> Self {
        Instruction {
            op,
            operands,
            segment_prefix: None,
            repeat: RepeatMode::None,
            lock: false,
            op_size: OperandSize::_32bit,
            address_size: AddressSize::_64bit,
            stack_address_size: AddressSize::_64bit,
            far: false,
            length: 0,
            bytes: Vec::new(),
            text: String::new(),
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn operand(&self, i: usize) -> Option<&Operand> {
        self.operands.get(i)
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn is_far_branch(&self) -> bool {
        self.far
    }

    pub fn has_lock_prefix(&self) -> bool {
        self.lock
    }

    pub fn rep_prefix(&self) -> RepeatMode {
        self.repeat
    }

    pub fn segment_override(&self) -> Option<Segment> {
        self.segment_prefix
    }

    pub fn address_size(&self) -> AddressSize {
        self.address_size
    }

    pub fn operand_size(&self) -> OperandSize {
        self.op_size
    }

    pub fn stack_address_size(&self) -> AddressSize {
        self.stack_address_size
    }

    fn describe_instruction(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        let cmd = format!("{}{:?}", self.repeat.as_str(), self.op).to_lowercase();
        let operands: Vec<String> = self.operands.iter().map(|o| o.to_string()).collect();
        if operands.is_empty() {
            cmd
        } else {
            format!("{:<9}{}", cmd, operands.join(", "))
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.describe_instruction())
    }
}

/// an instruction with its location, for diagnostics
#[derive(Debug, PartialEq)]
pub struct InstructionInfo<'a> {
    pub ip: u64,
    pub instruction: &'a Instruction,
}

impl<'a> fmt::Display for InstructionInfo<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:016X}] {:<30} {}",
            self.ip,
            hex_bytes(&self.instruction.bytes),
            self.instruction,
        )
    }
}
