pub mod arena;
pub mod decoder;
pub mod descriptor;
pub mod flag;
pub mod instruction;
pub mod native;
pub mod op;
pub mod operand;
pub mod register;
pub mod segment;
pub mod vcpu;

pub use self::arena::{OperandArena, OperandId, MAX_OPERANDS};
pub use self::decoder::{Decoder, IcedDecoder};
pub use self::descriptor::{DescriptorTable, GdtParser};
pub use self::flag::Flags;
pub use self::instruction::{Instruction, RepeatMode};
pub use self::op::{Condition, Op};
pub use self::operand::{Gpr, MemoryOperand, Operand, OperandKind};
pub use self::register::{AddressSize, OperandSize, RegisterState, TableRegister, R};
pub use self::segment::{Segment, SegmentDescriptor};
pub use self::vcpu::Vcpu;
