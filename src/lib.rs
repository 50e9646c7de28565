//! An emulator of the Zilog Z80 processor
//!
//! The processor owns a flat 64 KiB [`Memory`] image and a [`PortIo`]
//! handler for the I/O space, and executes one complete instruction per
//! [`Z80::step`] call while counting T-states.  All documented
//! instructions and flags are modelled, along with the commonly relied
//! upon undocumented ones: the F3/F5 flag bits, the IXH/IXL/IYH/IYL
//! register halves, SLL, and the indexed bit operations that copy their
//! result into a register.

pub mod debugger;
pub mod decode;
pub mod execute;
pub mod instructions;
pub mod memory;
pub mod port;
pub mod state;
pub mod timing;

pub use crate::debugger::Z80Debugger;
pub use crate::decode::Z80Decoder;
pub use crate::instructions::{Instruction, InterruptMode, Register, RegisterPair};
pub use crate::memory::Memory;
pub use crate::port::{DefaultPortIo, PortIo};
pub use crate::state::{Flags, Z80, Z80Error, Z80State};
