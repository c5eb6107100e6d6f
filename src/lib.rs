#![allow(clippy::single_match)]
#![allow(clippy::verbose_bit_mask)]
#![allow(clippy::cognitive_complexity)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("trapemu executes guest ALU semantics natively and requires an x86_64 host");

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate quick_error;

#[macro_use]
extern crate log;

#[cfg(test)] #[macro_use]
extern crate pretty_assertions;

pub mod config;
pub mod cpu;
pub mod emulator;
pub mod error;
pub mod hex;
pub mod machine;
pub mod memory;

pub use crate::emulator::{Emulator, Outcome, State};
pub use crate::error::{Error, Gap};
