//! The instruction catalog.
//!
//! Each opcode is one byte followed by zero or more little-endian operand
//! bytes whose layout is given by [`Opcode::operands`].

use strum::{Display, EnumCount, EnumIter, FromRepr, IntoStaticStr};

/// Operand layout following an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    U8,
    I8,
    U16,
    /// Signed 16-bit offset relative to the end of the instruction.
    Jump,
    U8U8,
    U16U8,
}

impl Operands {
    /// Number of operand bytes.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::None => 0,
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::Jump | Self::U8U8 => 2,
            Self::U16U8 => 3,
        }
    }
}

/// Bytecode opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr, EnumCount, EnumIter)]
#[repr(u8)]
pub enum Opcode {
    // stack manipulation
    Nop,
    Pop,
    Dup,
    Rot2,
    Rot3,
    /// Pushes a copy of the item `n` slots down (1 = TOS).
    Copy,
    /// Swaps TOS with the item `n` slots down.
    Swap,

    // constants
    LoadConst,
    LoadNone,
    LoadTrue,
    LoadFalse,
    LoadSmallInt,
    /// Pushes the `AssertionError` class regardless of any shadowing global.
    LoadAssertionError,

    // local slots
    LoadLocal,
    LoadLocalW,
    StoreLocal,
    StoreLocalW,
    DeleteLocal,

    // globals and namespace mappings
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadName,
    StoreName,
    DeleteName,

    // closure cells
    LoadCell,
    StoreCell,
    DeleteCell,
    /// Class-body cell read: consults the namespace mapping before the cell.
    LoadClassCell,
    /// Pushes the cell object itself, for building closures.
    LoadClosure,

    // attributes and items
    LoadAttr,
    StoreAttr,
    DeleteAttr,
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,
    /// Builds a `slice` from 2 (`start, stop`) or 3 (`start, stop, step`) items.
    BuildSlice,

    // arithmetic
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryTrueDiv,
    BinaryFloorDiv,
    BinaryMod,
    BinaryPow,
    BinaryLShift,
    BinaryRShift,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    UnaryNeg,
    UnaryPos,
    UnaryNot,
    UnaryInvert,

    // comparisons
    CompareEq,
    CompareNe,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    CompareIs,
    CompareIsNot,
    CompareIn,
    CompareNotIn,

    // control flow
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    JumpIfTrueOrPop,
    JumpIfFalseOrPop,
    JumpIfNone,
    JumpIfNotNone,

    // iteration
    GetIter,
    /// Pushes the next item, or pops the iterator and jumps when exhausted.
    ForIter,
    GetYieldFromIter,
    GetAwaitable,
    GetAIter,
    GetANext,
    EndAsyncFor,

    // building and unpacking
    BuildTuple,
    BuildList,
    BuildDict,
    ListAppend,
    ListExtend,
    ListToTuple,
    UnpackSequence,
    /// Star unpacking: operands are the counts before and after the starred target.
    UnpackEx,

    // calls
    MakeFunction,
    CallFunction,
    /// Like `CallFunction`, with a tuple of keyword names on top of the stack.
    CallFunctionKw,
    CallMethod,
    /// `callable(*args, **kwargs)`: an iterable of positional arguments and,
    /// with [`CALL_VARARGS_KWARGS`], a dict of keyword arguments.
    CallFunctionVarargs,
    /// `receiver.name(*args, **kwargs)`; operands are the name index and the flags.
    CallMethodVarargs,
    ReturnValue,

    // generators
    YieldValue,
    /// One delegation step of `yield from`; re-executed on each resumption.
    YieldFrom,
    AsyncGenWrap,

    // exceptions
    Raise,
    Reraise,
    /// Handler prologue: saves the ambient exception under the caught one.
    PushExcInfo,
    /// Handler epilogue: restores the saved ambient exception.
    PopExcept,
    /// Cleanup handler: restores the saved ambient exception, then re-raises.
    ExceptCleanup,
    CheckExcMatch,
    CheckEgMatch,
    PrepReraiseStar,

    // context managers
    /// `[manager] -> [manager, exit, entered]`: calls `__enter__`.
    SetupWith,
    /// `[manager, exit, exc_or_none] -> []`: calls `exit`, re-raising the
    /// exception unless the result is true.
    ExitWith,
    /// `[manager] -> [manager, aexit, awaitable]`: calls `__aenter__`.
    SetupAsyncWith,
    /// `[manager, aexit, exc_or_none] -> [exc_or_none, awaitable]`: calls `__aexit__`.
    GetAExitCoro,
    /// `[exc_or_none, result] -> []`: re-raises the exception unless the result is true.
    ExitAsyncWith,
}

/// `MakeFunction` flag: a tuple of positional defaults is on the stack.
pub const MAKE_FUNCTION_DEFAULTS: u8 = 0x01;
/// `MakeFunction` flag: a dict of keyword-only defaults is on the stack.
pub const MAKE_FUNCTION_KWDEFAULTS: u8 = 0x02;
/// `MakeFunction` flag: a tuple of closure cells is on the stack.
pub const MAKE_FUNCTION_CLOSURE: u8 = 0x08;

/// `CallFunctionVarargs`/`CallMethodVarargs` flag: a dict of keyword arguments is on top.
pub const CALL_VARARGS_KWARGS: u8 = 0x01;

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(byte)
    }
}

impl Opcode {
    /// Operand layout of this opcode.
    #[must_use]
    pub const fn operands(self) -> Operands {
        match self {
            Self::Copy | Self::Swap | Self::LoadLocal | Self::StoreLocal => Operands::U8,
            Self::ListAppend | Self::ListExtend | Self::UnpackSequence => Operands::U8,
            Self::MakeFunction | Self::CallFunction | Self::CallFunctionKw | Self::Raise => Operands::U8,
            Self::CallFunctionVarargs | Self::BuildSlice => Operands::U8,
            Self::LoadSmallInt => Operands::I8,
            Self::LoadConst
            | Self::LoadLocalW
            | Self::StoreLocalW
            | Self::DeleteLocal
            | Self::LoadGlobal
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadName
            | Self::StoreName
            | Self::DeleteName
            | Self::LoadCell
            | Self::StoreCell
            | Self::DeleteCell
            | Self::LoadClassCell
            | Self::LoadClosure
            | Self::LoadAttr
            | Self::StoreAttr
            | Self::DeleteAttr
            | Self::BuildTuple
            | Self::BuildList
            | Self::BuildDict => Operands::U16,
            Self::Jump
            | Self::JumpIfTrue
            | Self::JumpIfFalse
            | Self::JumpIfTrueOrPop
            | Self::JumpIfFalseOrPop
            | Self::JumpIfNone
            | Self::JumpIfNotNone
            | Self::ForIter => Operands::Jump,
            Self::UnpackEx => Operands::U8U8,
            Self::CallMethod | Self::CallMethodVarargs => Operands::U16U8,
            _ => Operands::None,
        }
    }

    /// Total encoded size of the instruction in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        1 + self.operands().width()
    }

    /// True for opcodes whose operand is a relative jump offset.
    #[must_use]
    pub const fn is_jump(self) -> bool {
        matches!(self.operands(), Operands::Jump)
    }

    /// Fixed stack effect, or `None` when it depends on the operand.
    ///
    /// Conditional jumps report the effect on the fall-through path.
    #[must_use]
    pub const fn stack_effect(self) -> Option<i16> {
        let effect = match self {
            Self::Nop
            | Self::Rot2
            | Self::Rot3
            | Self::Swap
            | Self::DeleteLocal
            | Self::DeleteGlobal
            | Self::DeleteName
            | Self::DeleteCell
            | Self::LoadAttr
            | Self::UnaryNeg
            | Self::UnaryPos
            | Self::UnaryNot
            | Self::UnaryInvert
            | Self::Jump
            | Self::GetIter
            | Self::GetYieldFromIter
            | Self::GetAwaitable
            | Self::GetAIter
            | Self::ListToTuple
            | Self::YieldValue
            | Self::AsyncGenWrap
            | Self::CheckExcMatch
            | Self::CheckEgMatch => 0,
            Self::SetupWith | Self::SetupAsyncWith => 2,
            Self::Dup
            | Self::Copy
            | Self::LoadConst
            | Self::LoadNone
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadSmallInt
            | Self::LoadAssertionError
            | Self::LoadLocal
            | Self::LoadLocalW
            | Self::LoadGlobal
            | Self::LoadName
            | Self::LoadCell
            | Self::LoadClassCell
            | Self::LoadClosure
            | Self::ForIter
            | Self::GetANext
            | Self::PushExcInfo => 1,
            Self::Pop
            | Self::StoreLocal
            | Self::StoreLocalW
            | Self::StoreGlobal
            | Self::StoreName
            | Self::StoreCell
            | Self::BinarySubscr
            | Self::BinaryAdd
            | Self::BinarySub
            | Self::BinaryMul
            | Self::BinaryTrueDiv
            | Self::BinaryFloorDiv
            | Self::BinaryMod
            | Self::BinaryPow
            | Self::BinaryLShift
            | Self::BinaryRShift
            | Self::BinaryAnd
            | Self::BinaryOr
            | Self::BinaryXor
            | Self::CompareEq
            | Self::CompareNe
            | Self::CompareLt
            | Self::CompareLe
            | Self::CompareGt
            | Self::CompareGe
            | Self::CompareIs
            | Self::CompareIsNot
            | Self::CompareIn
            | Self::CompareNotIn
            | Self::JumpIfTrue
            | Self::JumpIfFalse
            | Self::JumpIfTrueOrPop
            | Self::JumpIfFalseOrPop
            | Self::JumpIfNone
            | Self::JumpIfNotNone
            | Self::ListAppend
            | Self::ListExtend
            | Self::ReturnValue
            | Self::YieldFrom
            | Self::Reraise
            | Self::PopExcept
            | Self::PrepReraiseStar
            | Self::DeleteAttr
            | Self::GetAExitCoro => -1,
            Self::StoreAttr
            | Self::DeleteSubscr
            | Self::EndAsyncFor
            | Self::ExceptCleanup
            | Self::ExitAsyncWith => -2,
            Self::StoreSubscr | Self::ExitWith => -3,
            Self::BuildTuple
            | Self::BuildList
            | Self::BuildDict
            | Self::UnpackSequence
            | Self::UnpackEx
            | Self::MakeFunction
            | Self::CallFunction
            | Self::CallFunctionKw
            | Self::CallMethod
            | Self::CallFunctionVarargs
            | Self::CallMethodVarargs
            | Self::BuildSlice
            | Self::Raise => return None,
        };
        Some(effect)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn every_opcode_decodes_to_itself() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::try_from(op as u8), Ok(op));
        }
        assert!(u8::try_from(Opcode::COUNT).is_ok());
        assert_eq!(Opcode::try_from(u8::MAX), Err(u8::MAX));
    }

    #[test]
    fn sizes() {
        assert_eq!(Opcode::Pop.size(), 1);
        assert_eq!(Opcode::LoadConst.size(), 3);
        assert_eq!(Opcode::UnpackEx.size(), 3);
        assert_eq!(Opcode::CallMethod.size(), 4);
        assert_eq!(Opcode::CallMethodVarargs.size(), 4);
        assert_eq!(Opcode::BuildSlice.size(), 2);
        assert_eq!(Opcode::ExitWith.size(), 1);
        assert!(Opcode::ForIter.is_jump());
    }
}
