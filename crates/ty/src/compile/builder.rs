//! Builder for emitting bytecode during compilation.
//!
//! Handles encoding opcodes and operands into raw bytes, forward jumps with
//! patching, and the per-instruction location map used for diagnostics at
//! runtime.

use crate::{
    compile::{
        code::{Code, LocationEntry},
        op::{AccessKind, Opcode},
    },
    location::Span,
};

/// An unpatched forward jump, returned by the `emit_*jump*` helpers.
#[derive(Debug, Clone, Copy)]
pub struct JumpSite(usize);

/// Emits one function body.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
    locations: Vec<LocationEntry>,
    current_span: Option<Span>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source span recorded for subsequently emitted instructions.
    pub fn set_location(&mut self, span: Span) {
        self.current_span = Some(span);
    }

    /// Current emit offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    fn start_instruction(&mut self) {
        if let Some(span) = self.current_span {
            let offset = u32::try_from(self.bytes.len()).expect("code exceeds u32 offsets");
            // One entry per offset; the latest span wins for padding emits.
            if self.locations.last().is_none_or(|e| e.offset != offset) {
                self.locations.push(LocationEntry { offset, span });
            }
        }
    }

    pub fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytes.push(op as u8);
    }

    pub fn emit_u8(&mut self, op: Opcode, a: u8) {
        self.emit(op);
        self.bytes.push(a);
    }

    pub fn emit_u32(&mut self, op: Opcode, a: u32) {
        self.emit(op);
        self.bytes.extend_from_slice(&a.to_le_bytes());
    }

    pub fn emit_u32_u8(&mut self, op: Opcode, a: u32, b: u8) {
        self.emit_u32(op, a);
        self.bytes.push(b);
    }

    pub fn emit_u32_u32(&mut self, op: Opcode, a: u32, b: u32) {
        self.emit_u32(op, a);
        self.bytes.extend_from_slice(&b.to_le_bytes());
    }

    pub fn emit_u32_u32_u8(&mut self, op: Opcode, a: u32, b: u32, c: u8) {
        self.emit_u32_u32(op, a, b);
        self.bytes.push(c);
    }

    pub fn emit_i64(&mut self, op: Opcode, a: i64) {
        self.emit(op);
        self.bytes.extend_from_slice(&a.to_le_bytes());
    }

    pub fn emit_f64(&mut self, op: Opcode, a: f64) {
        self.emit(op);
        self.bytes.extend_from_slice(&a.to_le_bytes());
    }

    pub fn push_u8(&mut self, a: u8) {
        self.bytes.push(a);
    }

    pub fn push_u32(&mut self, a: u32) {
        self.bytes.extend_from_slice(&a.to_le_bytes());
    }

    /// Emits `op` followed by a placeholder `i32` offset to patch later.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpSite {
        self.emit(op);
        self.jump_placeholder()
    }

    /// Appends a placeholder offset operand (for ops whose jump operand
    /// follows other operands).
    pub fn jump_placeholder(&mut self) -> JumpSite {
        let site = self.bytes.len();
        self.bytes.extend_from_slice(&0i32.to_le_bytes());
        JumpSite(site)
    }

    /// Patches `site` to jump to the current offset.
    pub fn patch_jump(&mut self, site: JumpSite) {
        self.patch_jump_to(site, self.bytes.len());
    }

    /// Patches `site` to jump to `target`. Offsets are relative to the end
    /// of the operand.
    pub fn patch_jump_to(&mut self, site: JumpSite, target: usize) {
        let from = i64::try_from(site.0 + 4).expect("offset fits i64");
        let to = i64::try_from(target).expect("offset fits i64");
        let rel = i32::try_from(to - from).expect("jump offset exceeds i32");
        self.bytes[site.0..site.0 + 4].copy_from_slice(&rel.to_le_bytes());
    }

    /// Emits a backward jump to `target`.
    pub fn emit_jump_back(&mut self, op: Opcode, target: usize) {
        self.emit(op);
        let site = self.jump_placeholder();
        self.patch_jump_to(site, target);
    }

    /// Emits a pattern-bind target access operand.
    pub fn push_access(&mut self, kind: AccessKind, index: u32) {
        self.bytes.push(kind as u8);
        self.push_u32(index);
    }

    /// Finishes the body, appending an implicit `return nil`.
    #[must_use]
    pub fn build(mut self) -> Code {
        self.emit(Opcode::Nil);
        self.emit(Opcode::Return);
        Code {
            bytes: self.bytes,
            locations: self.locations,
        }
    }

    /// Finishes a module top-level body with `Halt` instead of return.
    #[must_use]
    pub fn build_halting(mut self) -> Code {
        self.emit(Opcode::Nil);
        self.emit(Opcode::Halt);
        Code {
            bytes: self.bytes,
            locations: self.locations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_patching() {
        let mut b = CodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.emit(Opcode::Nil);
        b.patch_jump(j);
        let code = b.build();
        // Jump operand starts at 1; it skips the single Nil byte.
        let rel = i32::from_le_bytes(code.bytes[1..5].try_into().unwrap());
        assert_eq!(rel, 1);
    }

    #[test]
    fn location_map_is_sorted_and_dense() {
        let mut b = CodeBuilder::new();
        let mut span = Span::default();
        span.start.offset = 5;
        b.set_location(span);
        b.emit(Opcode::Nil);
        b.emit(Opcode::Pop);
        let code = b.build();
        assert!(code.locations.windows(2).all(|w| w[0].offset <= w[1].offset));
        assert_eq!(code.location_at(0).unwrap().start.offset, 5);
        // The final implicit return is covered by the last entry.
        assert!(code.location_at(code.bytes.len() - 1).is_some());
    }
}
