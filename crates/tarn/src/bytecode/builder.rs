//! Builder for assembling code units.
//!
//! `CodeBuilder` encodes opcodes and operands, handles forward jumps with
//! patching, tracks the operand stack depth and records the line and
//! exception tables. Front ends and tests use it to produce [`CodeUnit`]s.

use std::sync::Arc;

use super::op::{CALL_VARARGS_KWARGS, Opcode};
use crate::code::{CodeFlags, CodeUnit, Constant, ExceptionEntry, LineEntry};

/// Builder for emitting bytecode.
///
/// ```ignore
/// let mut builder = CodeBuilder::new("f");
/// builder.set_line(1);
/// builder.emit_load_const(Constant::Int(1));
/// builder.emit(Opcode::ReturnValue);
/// let unit = builder.build();
/// ```
#[derive(Debug, Default)]
pub struct CodeBuilder {
    name: String,
    qualname: Option<String>,
    arg_count: u16,
    positional_only_count: u16,
    kwonly_count: u16,
    flags: CodeFlags,

    bytecode: Vec<u8>,
    constants: Vec<Constant>,
    names: Vec<String>,
    varnames: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    cell2arg: Vec<Option<u16>>,

    /// Line applied to subsequently emitted instructions.
    current_line: Option<u32>,
    first_line: Option<u32>,
    lines: Vec<LineEntry>,
    exception_table: Vec<ExceptionEntry>,

    current_stack_depth: u16,
    max_stack_depth: u16,
}

/// Label for a forward jump that needs patching.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

impl CodeBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    pub fn set_qualname(&mut self, qualname: &str) {
        self.qualname = Some(qualname.to_owned());
    }

    /// Declares positional, positional-only and keyword-only parameter counts.
    pub fn set_arg_counts(&mut self, arg_count: u16, positional_only_count: u16, kwonly_count: u16) {
        self.arg_count = arg_count;
        self.positional_only_count = positional_only_count;
        self.kwonly_count = kwonly_count;
    }

    pub fn insert_flags(&mut self, flags: CodeFlags) {
        self.flags.insert(flags);
    }

    /// Sets the source line for subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = Some(line);
        self.first_line.get_or_insert(line);
    }

    /// Adds a local slot name, returning its slot. Parameters must be added first.
    ///
    /// # Panics
    ///
    /// Panics if more than 65535 locals are declared.
    pub fn add_varname(&mut self, name: &str) -> u16 {
        intern(&mut self.varnames, name)
    }

    /// Adds a name used by global, namespace and attribute instructions.
    ///
    /// # Panics
    ///
    /// Panics if more than 65535 names are declared.
    pub fn add_name(&mut self, name: &str) -> u16 {
        intern(&mut self.names, name)
    }

    /// Declares a cell variable, optionally aliasing parameter slot `arg`.
    ///
    /// Cell variables must be declared before free variables, since both share
    /// one index space.
    ///
    /// # Panics
    ///
    /// Panics if a free variable was already declared.
    pub fn add_cellvar(&mut self, name: &str, arg: Option<u16>) -> u16 {
        assert!(self.freevars.is_empty(), "cellvars must be declared before freevars");
        let idx = intern(&mut self.cellvars, name);
        if usize::from(idx) == self.cell2arg.len() {
            self.cell2arg.push(arg);
        }
        idx
    }

    /// Declares a free variable, returning its index in the combined cell table.
    ///
    /// # Panics
    ///
    /// Panics if the combined cell table exceeds 65535 entries.
    pub fn add_freevar(&mut self, name: &str) -> u16 {
        let idx = intern(&mut self.freevars, name);
        u16::try_from(self.cellvars.len()).expect("cell table exceeds u16") + idx
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// # Panics
    ///
    /// Panics if the constant pool exceeds 65535 entries.
    #[must_use]
    pub fn add_const(&mut self, value: Constant) -> u16 {
        let idx = u16::try_from(self.constants.len()).expect("constant pool exceeds u16 range (65535)");
        self.constants.push(value);
        idx
    }

    /// Adds a docstring as the first constant.
    ///
    /// # Panics
    ///
    /// Panics if constants were already added.
    pub fn set_docstring(&mut self, doc: &str) {
        assert!(self.constants.is_empty(), "docstring must be the first constant");
        self.constants.push(Constant::Str(doc.to_owned()));
        self.flags.insert(CodeFlags::HAS_DOCSTRING);
    }

    /// Adds an exception table entry. Add inner regions before outer ones.
    pub fn add_exception_entry(&mut self, entry: ExceptionEntry) {
        self.exception_table.push(entry);
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u8 operand.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        let n = i16::from(operand);
        let effect = match op {
            Opcode::CallFunction | Opcode::Raise => -n,
            Opcode::CallFunctionKw => -n - 1,
            Opcode::CallFunctionVarargs => -1 - i16::from(operand & CALL_VARARGS_KWARGS),
            Opcode::BuildSlice => 1 - n,
            Opcode::UnpackSequence => n - 1,
            Opcode::MakeFunction => -i16::try_from(operand.count_ones()).unwrap_or(0),
            _ => op.stack_effect().unwrap_or(0),
        };
        self.adjust_stack(effect);
    }

    /// Emits an instruction with an i8 operand.
    pub fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand.to_le_bytes()[0]);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        let n = operand.cast_signed();
        let effect = match op {
            Opcode::BuildList | Opcode::BuildTuple => 1 - n,
            Opcode::BuildDict => 1 - 2 * n,
            _ => op.stack_effect().unwrap_or(0),
        };
        self.adjust_stack(effect);
    }

    /// Emits `UnpackEx` with the counts of targets before and after the star.
    pub fn emit_unpack_ex(&mut self, before: u8, after: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::UnpackEx as u8);
        self.bytecode.push(before);
        self.bytecode.push(after);
        // pops 1, pushes before + list + after
        self.adjust_stack(i16::from(before) + i16::from(after));
    }

    /// Emits `CallMethod name argc`: pops receiver and arguments, pushes the result.
    pub fn emit_call_method(&mut self, name: &str, argc: u8) {
        let name_idx = self.add_name(name);
        self.start_instruction();
        self.bytecode.push(Opcode::CallMethod as u8);
        self.bytecode.extend_from_slice(&name_idx.to_le_bytes());
        self.bytecode.push(argc);
        self.adjust_stack(-i16::from(argc));
    }

    /// Emits `CallMethodVarargs name flags`: pops receiver, the positional
    /// iterable and, with `CALL_VARARGS_KWARGS`, the keyword dict; pushes the result.
    pub fn emit_call_method_varargs(&mut self, name: &str, flags: u8) {
        let name_idx = self.add_name(name);
        self.start_instruction();
        self.bytecode.push(Opcode::CallMethodVarargs as u8);
        self.bytecode.extend_from_slice(&name_idx.to_le_bytes());
        self.bytecode.push(flags);
        self.adjust_stack(-1 - i16::from(flags & CALL_VARARGS_KWARGS));
    }

    /// Adds `value` to the pool and emits `LoadConst`.
    pub fn emit_load_const(&mut self, value: Constant) {
        let idx = self.add_const(value);
        self.emit_u16(Opcode::LoadConst, idx);
    }

    /// Emits a small integer load, falling back to the constant pool.
    pub fn emit_load_int(&mut self, value: i64) {
        match i8::try_from(value) {
            Ok(small) => self.emit_i8(Opcode::LoadSmallInt, small),
            Err(_) => self.emit_load_const(Constant::Int(value)),
        }
    }

    /// Emits `LoadLocal`, using the wide form for slots above 255.
    pub fn emit_load_local(&mut self, slot: u16) {
        match u8::try_from(slot) {
            Ok(s) => self.emit_u8(Opcode::LoadLocal, s),
            Err(_) => self.emit_u16(Opcode::LoadLocalW, slot),
        }
    }

    /// Emits `StoreLocal`, using the wide form for slots above 255.
    pub fn emit_store_local(&mut self, slot: u16) {
        match u8::try_from(slot) {
            Ok(s) => self.emit_u8(Opcode::StoreLocal, s),
            Err(_) => self.emit_u16(Opcode::StoreLocalW, slot),
        }
    }

    /// Emits `LoadGlobal` for `name`.
    pub fn emit_load_global(&mut self, name: &str) {
        let idx = self.add_name(name);
        self.emit_u16(Opcode::LoadGlobal, idx);
    }

    /// Emits `StoreGlobal` for `name`.
    pub fn emit_store_global(&mut self, name: &str) {
        let idx = self.add_name(name);
        self.emit_u16(Opcode::StoreGlobal, idx);
    }

    /// Emits a forward jump, returning a label to patch later.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
        label
    }

    /// Patches a forward jump to target the current offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset does not fit in an i16, which means the unit is too large.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        let offset = jump_offset(label.0, target);
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a jump to a known (usually earlier) offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset does not fit in an i16.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.start_instruction();
        let offset = jump_offset(self.bytecode.len(), target);
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Returns the current bytecode offset.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Returns the current offset as a `u32`, for exception table entries.
    ///
    /// # Panics
    ///
    /// Panics if the bytecode exceeds `u32::MAX` bytes.
    #[must_use]
    pub fn offset_u32(&self) -> u32 {
        u32::try_from(self.bytecode.len()).expect("bytecode length exceeds u32")
    }

    /// Returns the current tracked stack depth.
    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    /// Sets the tracked stack depth, e.g. at the start of a handler.
    pub fn set_stack_depth(&mut self, depth: u16) {
        self.current_stack_depth = depth;
        self.max_stack_depth = self.max_stack_depth.max(depth);
    }

    /// Adjusts the tracked stack depth where the opcode alone cannot tell.
    pub fn adjust_stack_depth(&mut self, delta: i16) {
        self.adjust_stack(delta);
    }

    /// Finishes the unit.
    #[must_use]
    pub fn build(self) -> CodeUnit {
        CodeUnit {
            qualname: self.qualname.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            arg_count: self.arg_count,
            positional_only_count: self.positional_only_count,
            kwonly_count: self.kwonly_count,
            flags: self.flags,
            stack_size: self.max_stack_depth,
            bytecode: self.bytecode,
            constants: self.constants,
            names: self.names,
            varnames: self.varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            cell2arg: self.cell2arg,
            first_line: self.first_line.unwrap_or(1),
            lines: self.lines,
            exception_table: self.exception_table,
        }
    }

    /// Finishes the unit behind an `Arc`, ready to share.
    #[must_use]
    pub fn build_arc(self) -> Arc<CodeUnit> {
        Arc::new(self.build())
    }

    fn start_instruction(&mut self) {
        let Some(line) = self.current_line else {
            return;
        };
        if self.lines.last().is_some_and(|entry| entry.line == line) {
            return;
        }
        let offset = u32::try_from(self.bytecode.len()).unwrap_or(u32::MAX);
        self.lines.push(LineEntry { offset, line });
    }

    fn adjust_stack(&mut self, delta: i16) {
        let new_depth = i32::from(self.current_stack_depth) + i32::from(delta);
        debug_assert!(new_depth >= 0, "stack depth went negative: {new_depth}");
        self.current_stack_depth = u16::try_from(new_depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }
}

fn intern(table: &mut Vec<String>, name: &str) -> u16 {
    let idx = table.iter().position(|n| n == name).unwrap_or_else(|| {
        table.push(name.to_owned());
        table.len() - 1
    });
    u16::try_from(idx).expect("name table exceeds u16 range (65535)")
}

/// Offset from the end of a 3-byte jump at `at` to `target`.
fn jump_offset(at: usize, target: usize) -> i16 {
    let target = i64::try_from(target).expect("bytecode target exceeds i64");
    let at = i64::try_from(at).expect("bytecode offset exceeds i64");
    i16::try_from(target - at - 3).expect("jump offset exceeds i16 range; code unit too large")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new("f");
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadNone as u8, Opcode::ReturnValue as u8]);
        assert_eq!(code.stack_size(), 1);
    }

    #[test]
    fn u16_operand_is_little_endian() {
        let mut builder = CodeBuilder::new("f");
        builder.emit_u16(Opcode::LoadGlobal, 0x1234);

        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadGlobal as u8, 0x34, 0x12]);
    }

    #[test]
    fn forward_jump() {
        let mut builder = CodeBuilder::new("f");
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build();
        // jump at 0, target 5: offset = 5 - 0 - 3
        assert_eq!(&code.bytecode()[..3], &[Opcode::Jump as u8, 2, 0]);
    }

    #[test]
    fn backward_jump() {
        let mut builder = CodeBuilder::new("f");
        let start = builder.current_offset();
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::Pop);
        builder.emit_jump_to(Opcode::Jump, start);

        let code = builder.build();
        let expected = (-5i16).to_le_bytes();
        assert_eq!(&code.bytecode()[2..], &[Opcode::Jump as u8, expected[0], expected[1]]);
    }

    #[test]
    fn wide_locals() {
        let mut builder = CodeBuilder::new("f");
        builder.emit_load_local(4);
        builder.emit_load_local(256);
        builder.emit_store_local(256);
        builder.emit_store_local(3);

        let code = builder.build();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadLocal as u8,
                4,
                Opcode::LoadLocalW as u8,
                0,
                1,
                Opcode::StoreLocalW as u8,
                0,
                1,
                Opcode::StoreLocal as u8,
                3,
            ]
        );
    }

    #[test]
    fn line_table_records_transitions_only() {
        let mut builder = CodeBuilder::new("f");
        builder.set_line(3);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::Pop);
        builder.set_line(4);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build();
        assert_eq!(code.first_line(), 3);
        assert_eq!(code.line_for(0), Some(3));
        assert_eq!(code.line_for(1), Some(3));
        assert_eq!(code.line_for(2), Some(4));
        assert_eq!(code.line_for(3), Some(4));
    }

    #[test]
    fn names_are_deduplicated() {
        let mut builder = CodeBuilder::new("f");
        assert_eq!(builder.add_name("x"), 0);
        assert_eq!(builder.add_name("y"), 1);
        assert_eq!(builder.add_name("x"), 0);
        assert_eq!(builder.add_cellvar("c", Some(0)), 0);
        assert_eq!(builder.add_freevar("free"), 1);
    }

    #[test]
    fn variable_stack_effects() {
        let mut builder = CodeBuilder::new("f");
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::LoadNone);
        builder.emit_u16(Opcode::BuildTuple, 3);
        assert_eq!(builder.stack_depth(), 1);
        builder.emit_unpack_ex(1, 1);
        assert_eq!(builder.stack_depth(), 3);
        assert_eq!(builder.build().stack_size(), 3);
    }
}
