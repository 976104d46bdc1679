//! Code units: the immutable, serializable description of one callable body.

use std::{
    fmt::{self, Write as _},
    sync::{Arc, OnceLock},
};

use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use tracing::debug;

use crate::bytecode::op::{Opcode, Operands};

/// Bit set of code unit properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CodeFlags(u16);

impl CodeFlags {
    pub const HAS_DEFAULTS: Self = Self(0x0001);
    pub const HAS_KWONLY_DEFAULTS: Self = Self(0x0002);
    pub const HAS_ANNOTATIONS: Self = Self(0x0004);
    pub const HAS_CLOSURE: Self = Self(0x0008);
    pub const HAS_VAR_ARGS: Self = Self(0x0010);
    pub const HAS_VAR_KW_ARGS: Self = Self(0x0020);
    pub const IS_GENERATOR: Self = Self(0x0040);
    pub const IS_COROUTINE: Self = Self(0x0080);
    pub const IS_ASYNC_GENERATOR: Self = Self(0x0100);
    /// The body defines a `__class__` cell for zero-argument `super()`.
    pub const HAS_CLASS_CELL: Self = Self(0x0200);
    /// The first constant is the docstring.
    pub const HAS_DOCSTRING: Self = Self(0x0400);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// True when calling the unit produces a suspendable object instead of running it.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        self.0 & (Self::IS_GENERATOR.0 | Self::IS_COROUTINE.0 | Self::IS_ASYNC_GENERATOR.0) != 0
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A constant pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Tuple(Vec<Constant>),
    /// A nested code unit, e.g. the body of an inner function.
    Code(Arc<CodeUnit>),
    /// A nested code unit kept in serialized form until first use.
    LazyCode(LazyCode),
}

/// One protected region of the exception table.
///
/// Instructions in `start..end` transfer to `handler` when they raise, after the
/// operand stack is cut back to `stack_depth` entries and the exception is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    start: u32,
    end: u32,
    handler: u32,
    stack_depth: u16,
}

impl ExceptionEntry {
    #[must_use]
    pub fn new(start: u32, end: u32, handler: u32, stack_depth: u16) -> Self {
        Self {
            start,
            end,
            handler,
            stack_depth,
        }
    }

    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u32 {
        self.end
    }

    #[must_use]
    pub fn handler(&self) -> u32 {
        self.handler
    }

    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.stack_depth
    }

    fn covers(&self, ip: u32) -> bool {
        self.start <= ip && ip < self.end
    }
}

/// Maps the first instruction of a run to its source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// Error loading or storing a serialized code unit.
#[derive(Debug)]
pub enum CodeError {
    /// The byte form could not be decoded.
    Deserialize(postcard::Error),
    /// The unit could not be encoded.
    Serialize(postcard::Error),
    /// The bytes decoded, but the bytecode is not well formed.
    Malformed { unit: String, offset: usize, reason: String },
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deserialize(err) => write!(f, "failed to deserialize code unit: {err}"),
            Self::Serialize(err) => write!(f, "failed to serialize code unit: {err}"),
            Self::Malformed { unit, offset, reason } => {
                write!(f, "malformed code unit '{unit}' at offset {offset}: {reason}")
            }
        }
    }
}

impl std::error::Error for CodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Deserialize(err) | Self::Serialize(err) => Some(err),
            Self::Malformed { .. } => None,
        }
    }
}

/// Immutable description of one callable body.
///
/// A unit holds no execution state, so one `Arc<CodeUnit>` can back any number
/// of activations in any number of runtimes, including across threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub(crate) name: String,
    pub(crate) qualname: String,
    pub(crate) arg_count: u16,
    pub(crate) positional_only_count: u16,
    pub(crate) kwonly_count: u16,
    pub(crate) flags: CodeFlags,
    pub(crate) stack_size: u16,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) constants: Vec<Constant>,
    pub(crate) names: Vec<String>,
    pub(crate) varnames: Vec<String>,
    pub(crate) cellvars: Vec<String>,
    pub(crate) freevars: Vec<String>,
    /// For each cell variable, the parameter slot whose value it takes at entry.
    pub(crate) cell2arg: Vec<Option<u16>>,
    pub(crate) first_line: u32,
    pub(crate) lines: Vec<LineEntry>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
}

impl CodeUnit {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn arg_count(&self) -> u16 {
        self.arg_count
    }

    #[must_use]
    pub fn positional_only_count(&self) -> u16 {
        self.positional_only_count
    }

    #[must_use]
    pub fn kwonly_count(&self) -> u16 {
        self.kwonly_count
    }

    #[must_use]
    pub fn stack_size(&self) -> u16 {
        self.stack_size
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.freevars
    }

    #[must_use]
    pub fn cell2arg(&self) -> &[Option<u16>] {
        &self.cell2arg
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    #[must_use]
    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    /// Number of parameter slots, counting `*args` and `**kwargs`.
    #[must_use]
    pub fn total_arg_count(&self) -> usize {
        let mut n = usize::from(self.arg_count) + usize::from(self.kwonly_count);
        if self.flags.contains(CodeFlags::HAS_VAR_ARGS) {
            n += 1;
        }
        if self.flags.contains(CodeFlags::HAS_VAR_KW_ARGS) {
            n += 1;
        }
        n
    }

    /// The docstring, when the unit declares one.
    #[must_use]
    pub fn docstring(&self) -> Option<&str> {
        if !self.flags.contains(CodeFlags::HAS_DOCSTRING) {
            return None;
        }
        match self.constants.first() {
            Some(Constant::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Source line of the instruction at `offset`.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> Option<u32> {
        let offset = u32::try_from(offset).ok()?;
        let idx = self.lines.partition_point(|entry| entry.offset <= offset);
        idx.checked_sub(1).map(|i| self.lines[i].line)
    }

    /// Innermost handler covering `ip`. Entries are stored innermost first.
    #[must_use]
    pub fn find_exception_handler(&self, ip: usize) -> Option<&ExceptionEntry> {
        let ip = u32::try_from(ip).ok()?;
        self.exception_table.iter().find(|entry| entry.covers(ip))
    }

    /// Encodes the unit into its durable byte form.
    pub fn dump(&self) -> Result<Vec<u8>, CodeError> {
        postcard::to_allocvec(self).map_err(CodeError::Serialize)
    }

    /// Decodes and validates a unit from its byte form.
    pub fn load(bytes: &[u8]) -> Result<Self, CodeError> {
        let unit: Self = postcard::from_bytes(bytes).map_err(CodeError::Deserialize)?;
        unit.validate()?;
        Ok(unit)
    }

    /// Checks that every instruction decodes and every table index is in range.
    ///
    /// Nested eager units are validated recursively; lazy ones are validated
    /// when they are materialized.
    pub fn validate(&self) -> Result<(), CodeError> {
        let malformed = |offset: usize, reason: String| CodeError::Malformed {
            unit: self.qualname.clone(),
            offset,
            reason,
        };
        let mut ip = 0;
        while ip < self.bytecode.len() {
            let op = Opcode::try_from(self.bytecode[ip]).map_err(|b| malformed(ip, format!("invalid opcode {b}")))?;
            let end = ip + op.size();
            if end > self.bytecode.len() {
                return Err(malformed(ip, format!("truncated {op} instruction")));
            }
            let operand = self.bytecode.get(ip + 1..end).unwrap_or_default();
            let index = match op.operands() {
                Operands::U16 | Operands::U16U8 => usize::from(u16::from_le_bytes([operand[0], operand[1]])),
                Operands::U8 => usize::from(operand[0]),
                _ => 0,
            };
            let table_len = match op {
                Opcode::LoadConst => Some(self.constants.len()),
                Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::CallMethod
                | Opcode::CallMethodVarargs => Some(self.names.len()),
                Opcode::LoadLocal | Opcode::LoadLocalW | Opcode::StoreLocal | Opcode::StoreLocalW | Opcode::DeleteLocal => {
                    Some(self.varnames.len())
                }
                Opcode::LoadCell | Opcode::StoreCell | Opcode::DeleteCell | Opcode::LoadClassCell | Opcode::LoadClosure => {
                    Some(self.cellvars.len() + self.freevars.len())
                }
                _ => None,
            };
            if let Some(len) = table_len
                && index >= len
            {
                return Err(malformed(ip, format!("{op} operand {index} out of range ({len} entries)")));
            }
            if op == Opcode::BuildSlice && !matches!(index, 2 | 3) {
                return Err(malformed(ip, format!("BuildSlice takes 2 or 3 items, not {index}")));
            }
            if op.is_jump() {
                let offset = i16::from_le_bytes([operand[0], operand[1]]);
                let target = i64::try_from(end).unwrap_or(i64::MAX) + i64::from(offset);
                if target < 0 || target > i64::try_from(self.bytecode.len()).unwrap_or(i64::MAX) {
                    return Err(malformed(ip, format!("jump target {target} out of range")));
                }
            }
            ip = end;
        }
        if self.cell2arg.len() != self.cellvars.len() {
            return Err(malformed(0, "cell2arg length does not match cellvars".to_owned()));
        }
        for entry in &self.exception_table {
            let handler = entry.handler as usize;
            if handler >= self.bytecode.len() || entry.start > entry.end {
                return Err(malformed(entry.start as usize, "exception table entry out of range".to_owned()));
            }
        }
        for constant in &self.constants {
            if let Constant::Code(inner) = constant {
                inner.validate()?;
            }
        }
        Ok(())
    }

    /// Renders a listing of the unit and its nested units.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out);
        out
    }

    fn disassemble_into(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "Disassembly of <code {}> (args={}, kwonly={}, flags={:#06x}):",
            self.qualname,
            self.arg_count,
            self.kwonly_count,
            self.flags.bits()
        );
        let mut last_line = None;
        let mut ip = 0;
        while ip < self.bytecode.len() {
            let Ok(op) = Opcode::try_from(self.bytecode[ip]) else {
                let _ = writeln!(out, "{ip:>6} <invalid {}>", self.bytecode[ip]);
                break;
            };
            let line = self.line_for(ip);
            let line_col = if line == last_line {
                String::new()
            } else {
                line.map(|l| l.to_string()).unwrap_or_default()
            };
            last_line = line;
            let end = (ip + op.size()).min(self.bytecode.len());
            let operand = &self.bytecode[ip + 1..end];
            let _ = writeln!(out, "{line_col:>5} {ip:>6} {:<18}{}", op.to_string(), self.describe_operand(op, ip, operand));
            ip = end;
        }
        if !self.exception_table.is_empty() {
            out.push_str("ExceptionTable:\n");
            for entry in &self.exception_table {
                let _ = writeln!(
                    out,
                    "  {} to {} -> {} [{}]",
                    entry.start, entry.end, entry.handler, entry.stack_depth
                );
            }
        }
        for constant in &self.constants {
            if let Constant::Code(inner) = constant {
                out.push('\n');
                inner.disassemble_into(out);
            }
        }
    }

    fn describe_operand(&self, op: Opcode, ip: usize, operand: &[u8]) -> String {
        let u16_at = |i: usize| u16::from_le_bytes([operand[i], operand[i + 1]]);
        let lookup = |table: &[String], idx: u16| {
            table
                .get(usize::from(idx))
                .map_or_else(|| format!("{idx} (?)"), |name| format!("{idx} ({name})"))
        };
        match op.operands() {
            Operands::None => String::new(),
            Operands::I8 => i8::from_le_bytes([operand[0]]).to_string(),
            Operands::U8 => match op {
                Opcode::LoadLocal | Opcode::StoreLocal => lookup(&self.varnames, u16::from(operand[0])),
                _ => operand[0].to_string(),
            },
            Operands::U8U8 => format!("{} {}", operand[0], operand[1]),
            Operands::Jump => {
                let target = i64::try_from(ip + op.size()).unwrap_or(i64::MAX) + i64::from(i16::from_le_bytes([operand[0], operand[1]]));
                format!("to {target}")
            }
            Operands::U16U8 if op == Opcode::CallMethodVarargs => {
                format!("{} flags={:#04x}", lookup(&self.names, u16_at(0)), operand[2])
            }
            Operands::U16U8 => format!("{} argc={}", lookup(&self.names, u16_at(0)), operand[2]),
            Operands::U16 => {
                let idx = u16_at(0);
                match op {
                    Opcode::LoadConst => match self.constants.get(usize::from(idx)) {
                        Some(Constant::Code(inner)) => format!("{idx} (<code {}>)", inner.qualname),
                        Some(Constant::LazyCode(_)) => format!("{idx} (<lazy code>)"),
                        Some(constant) => format!("{idx} ({constant:?})"),
                        None => format!("{idx} (?)"),
                    },
                    Opcode::LoadLocalW | Opcode::StoreLocalW | Opcode::DeleteLocal => lookup(&self.varnames, idx),
                    Opcode::LoadCell | Opcode::StoreCell | Opcode::DeleteCell | Opcode::LoadClassCell | Opcode::LoadClosure => {
                        let name = self.cell_name(usize::from(idx)).unwrap_or("?");
                        format!("{idx} ({name})")
                    }
                    Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildDict => idx.to_string(),
                    _ => lookup(&self.names, idx),
                }
            }
        }
    }

    /// Name of the cell at `index` in the combined cellvars-then-freevars table.
    #[must_use]
    pub fn cell_name(&self, index: usize) -> Option<&str> {
        if index < self.cellvars.len() {
            Some(&self.cellvars[index])
        } else {
            self.freevars.get(index - self.cellvars.len()).map(String::as_str)
        }
    }
}

/// A code unit held in serialized form and materialized on first use.
///
/// Clones share the same materialization slot: every clone, on any thread,
/// observes the single instance that won the first race to materialize. The
/// byte form is never mutated.
#[derive(Clone)]
pub struct LazyCode {
    bytes: Arc<[u8]>,
    unit: Arc<OnceLock<Arc<CodeUnit>>>,
}

impl LazyCode {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            unit: Arc::new(OnceLock::new()),
        }
    }

    /// Serializes `unit` and wraps the bytes for lazy loading.
    pub fn from_unit(unit: &CodeUnit) -> Result<Self, CodeError> {
        Ok(Self::new(unit.dump()?))
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True once some caller has materialized the unit.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.unit.get().is_some()
    }

    /// Returns the executable unit, deserializing it on first use.
    ///
    /// Concurrent callers may each decode the bytes, but only one result is
    /// installed and all of them return it.
    pub fn materialize(&self) -> Result<Arc<CodeUnit>, CodeError> {
        if let Some(unit) = self.unit.get() {
            return Ok(Arc::clone(unit));
        }
        let decoded = Arc::new(CodeUnit::load(&self.bytes)?);
        let winner = self.unit.get_or_init(|| {
            debug!(unit = %decoded.qualname, bytes = self.bytes.len(), "materialized lazy code unit");
            Arc::clone(&decoded)
        });
        Ok(Arc::clone(winner))
    }
}

impl fmt::Debug for LazyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCode")
            .field("bytes", &self.bytes.len())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

impl PartialEq for LazyCode {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Serialize for LazyCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bytes)
    }
}

impl<'de> Deserialize<'de> for LazyCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("serialized code unit bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor).map(Self::new)
    }
}
