use std::fmt;
use std::fmt::Write as _;

use crate::state::{Z80, Z80Error};

/// Host-facing execution controls: a breakpoint list consulted before
/// each instruction
#[derive(Clone, Default)]
pub struct Z80Debugger {
    pub enabled: bool,
    pub breakpoints: Vec<u16>,
}

impl Z80 {
    pub fn add_breakpoint(&mut self, addr: u16) {
        self.debugger.breakpoints.push(addr);
        self.debugger.enabled = true;
    }

    pub fn remove_breakpoint(&mut self, addr: u16) {
        if let Some(index) = self.debugger.breakpoints.iter().position(|a| *a == addr) {
            self.debugger.breakpoints.remove(index);
            self.debugger.enabled = !self.debugger.breakpoints.is_empty();
        }
    }

    /// Like `step()`, but refuses to execute an instruction at a
    /// breakpoint address so a monitor loop can hand control back to the
    /// user
    pub fn step_checked(&mut self) -> Result<u16, Z80Error> {
        self.check_breakpoints()?;
        self.cycle_one()
    }

    fn check_breakpoints(&self) -> Result<(), Z80Error> {
        if self.debugger.enabled && self.debugger.breakpoints.iter().any(|a| *a == self.state.pc) {
            Err(Z80Error::Breakpoint)
        } else {
            Ok(())
        }
    }

    /// Write the most recently decoded instruction, with the raw bytes
    /// it was decoded from
    pub fn dump_decoded(&self, writer: &mut dyn fmt::Write) -> fmt::Result {
        let bytes = self.decoder.format_instruction_bytes(&self.memory);
        writeln!(writer, "{:#06x}: {}\n\t{:?}", self.decoder.start, bytes, self.decoder.instruction)
    }
}
