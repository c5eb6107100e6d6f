// these modules are re-exported as a single module

pub use self::flat_memory::*;
pub use self::mmu::*;

mod mmu;
mod flat_memory;
