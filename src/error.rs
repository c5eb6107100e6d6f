use std::fmt;
use std::io;

use simple_error::SimpleError;

/// Architectural situations the emulator knows about but cannot carry out,
/// usually because the correct behaviour is to inject an exception into the guest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Gap {
    /// far branch to a non-conforming segment across privilege levels
    FarBranchPrivilege,

    /// far branch target is not a code segment (#GP)
    FarBranchNotCode,

    /// IRET would return to a more privileged level
    IretPrivilegeIncrease,

    /// IRET outside of 64-bit mode
    IretOutsideLongMode,

    /// NT flag set, IRET would perform a task switch
    TaskSwitch,

    /// VM flag set
    Virtual8086,

    /// LTR with a null selector (#GP)
    NullTaskRegister,

    /// selector outside of the descriptor table, or descriptor of the wrong type
    DescriptorException(u16),

    /// descriptor with the present bit clear (#NP or #SS)
    SegmentNotPresent(u16),

    /// STI/CLI with CPL > IOPL (#GP)
    InterruptFlagPrivilege,

    /// operand kind the handler was not built for
    OperandKind,

    /// addressing form that is not emulated
    Addressing,
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Gap::FarBranchPrivilege => write!(f, "far branch to non-conforming segment across privilege levels"),
            Gap::FarBranchNotCode => write!(f, "far branch target is not a code segment"),
            Gap::IretPrivilegeIncrease => write!(f, "iret to a more privileged level"),
            Gap::IretOutsideLongMode => write!(f, "iret outside of 64-bit mode"),
            Gap::TaskSwitch => write!(f, "task switch"),
            Gap::Virtual8086 => write!(f, "virtual-8086 mode"),
            Gap::NullTaskRegister => write!(f, "null selector loaded into task register"),
            Gap::DescriptorException(sel) => write!(f, "descriptor exception for selector {:04X}", sel),
            Gap::SegmentNotPresent(sel) => write!(f, "segment {:04X} not present", sel),
            Gap::InterruptFlagPrivilege => write!(f, "interrupt flag change with CPL > IOPL"),
            Gap::OperandKind => write!(f, "unexpected operand kind"),
            Gap::Addressing => write!(f, "unsupported addressing form"),
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        /// guest linear address could not be translated or accessed
        Fault(linear: u64) {
            display("guest address {:#X} is not accessible", linear)
        }
        Unsupported(gap: Gap) {
            from()
            display("unsupported: {}", gap)
        }
        UnhandledPort(port: u16) {
            display("unhandled write to port {:04X}", port)
        }
        UnhandledCpuid {
            display("cpuid not handled by vcpu")
        }
        MsrRead(index: u32) {
            display("failed to read msr {:08X}", index)
        }
        Decode(bytes: Vec<u8>) {
            display("invalid instruction encoding {}", crate::hex::hex_bytes(bytes))
        }
        Record(err: bincode::Error) {
            from()
            display("descriptor table record: {}", err)
            cause(err)
        }
        ArenaFull {
            display("operand arena is full")
        }
        StaleOperand {
            display("operand handle belongs to a previous emulation")
        }
        MissingOperand(index: usize) {
            display("instruction has no operand {}", index)
        }
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
            cause(err)
        }
        Toml(err: toml::de::Error) {
            from()
            display("config parse error: {}", err)
            cause(err)
        }
        InvalidConfig(err: SimpleError) {
            from()
            display("invalid config: {}", err)
        }
    }
}
