//! Opcode definitions.
//!
//! Each instruction is one opcode byte followed by inline operands:
//! little-endian `u32` indices and counts, `i32` relative jump offsets
//! (relative to the end of the offset operand), embedded `i64`/`f64`
//! constants, and single-byte flags. A count operand of `u32::MAX` means
//! "from the saved stack mark" (conditional elements and spreads make the
//! count dynamic).

/// Sentinel count operand: consume down to the last saved stack position.
pub const FROM_MARK: u32 = u32::MAX;

/// One-byte opcodes. Operand layout is documented per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::IntoStaticStr)]
#[repr(u8)]
pub enum Opcode {
    // Constants. `Int: i64`, `Real: f64`, `Str/Regex/TagVal/ClassVal: u32`.
    Nil,
    True,
    False,
    /// The argument-list None marker.
    NoneVal,
    /// `u32 index`: a compile-time value pinned in the world's const roots.
    ConstRoot,
    Int,
    Real,
    Str,
    Regex,
    TagVal,
    ClassVal,
    /// `u32 count | FROM_MARK`: build an array from the top `count` values.
    Array,
    /// `u32 pair-count | FROM_MARK`: build a dict from key/value pairs.
    Dict,
    /// Pops a default value and attaches it to the dict on top.
    DictDefault,
    /// `u32 count | FROM_MARK, u32 shape`: build a tuple; `shape` indexes the
    /// program's tuple-name shapes (MAX for unnamed).
    Tuple,

    // Variables. Operand: `u32` slot / global slot / capture index.
    LoadVar,
    LoadGlobal,
    LoadRef,
    /// `u32 slot`: push the current value of a local (saving it around a
    /// region that reuses the slot).
    PushVar,
    /// `u32 slot`: pop the stack top back into a local.
    PopVar,
    TargetVar,
    TargetGlobal,
    TargetRef,
    /// `u32 member-name`.
    TargetMember,
    /// Pops index then container into a subscript target.
    TargetSubscript,
    /// Pops a target and assigns the stack top to it; the value stays.
    Assign,
    /// In-place arithmetic through a target; result replaces the value.
    MutAdd,
    MutSub,
    MutMul,
    MutDiv,

    // Functions and calls.
    /// `u32 function-id`: build a closure, popping definition-time default
    /// and constraint values per the function's header.
    MakeClosure,
    /// `u32 nargs | FROM_MARK`: pops callee then arguments.
    Call,
    /// `u32 npos | FROM_MARK`: like `Call` with a kwargs dict under the
    /// callee.
    CallKw,
    /// `u32 method-name, u32 nargs | FROM_MARK`: receiver under arguments.
    CallMethod,
    /// `u32 method-name, u32 npos | FROM_MARK`: with a kwargs dict on top of
    /// the arguments.
    CallMethodKw,
    /// `u32 class-id, u32 method-name, u32 nargs`: method dispatch starting
    /// at the superclass of `class-id`; receiver under arguments.
    CallSuper,
    /// `u32 tag`: push `tag` onto the tag stack of the value on top.
    TagPush,
    Return,
    Yield,
    Halt,

    // Control flow. Operand: `i32` relative offset.
    Jump,
    JumpIf,
    JumpIfNot,
    JumpIfNil,
    /// Jump (and pop) when the top is the iteration-end sentinel.
    JumpIfNone,
    Dup,
    Pop,
    Swap,
    SaveStackPos,
    RestoreStackPos,
    /// Pops an array and pushes its elements (spread at call and literal
    /// sites).
    Splat,

    // Pattern matching. `fail` operands are `i32` relative offsets.
    /// `u8 access-kind, u32 index, i32 fail`: bind the subject unless nil.
    TryAssignNonNil,
    /// `u32 element, i32 fail`: push `subject[element]` of an array/tuple.
    TryIndex,
    /// `u8 access-kind, u32 index, u32 from, i32 fail`: bind the tail of the
    /// subject array.
    ArrayRest,
    /// `u32 len, i32 fail`.
    EnsureLen,
    /// `u32 tag, i32 fail`: pop the subject's top tag if it matches.
    TryTagPop,
    /// `u32 match-spec, i32 fail`: regex match binding named groups.
    TryRegex,
    /// `i32 fail`: pops a key; pushes the dict entry or fails.
    TryKey,
    /// Unmatched subject in a match: throws.
    BadMatch,
    /// `u32 tag`: pop the tag or throw.
    UntagOrDie,

    // Arithmetic and comparison.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    Cmp,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,

    // Aggregates.
    Subscript,
    /// Pops `k`, `j`, `i`, subject (nil for omitted bounds).
    Slice,
    /// `u32 member-name, u8 maybe-flag`.
    Member,
    DynMember,
    /// `u8 inclusive-flag`: pops hi then lo.
    RangeNew,
    Len,
    Keys,
    /// `u8 negated-flag`: membership test.
    Contains,
    /// `u32 count`: concatenate string fragments.
    ConcatStrings,
    /// `u32 format-spec string | FROM_MARK`: stringify the top value.
    ToString,
    TypeOf,

    // Exceptions and scope exit.
    Throw,
    /// `i32 catch-offset (0 none), i32 finally-offset (0 none)`.
    PushTry,
    PopTry,
    /// Dispatch the pending action recorded before entering a finally.
    EndFinally,
    /// `u8 unwind-only-flag`: pops a callable, registering a scope-exit
    /// action on the current frame.
    Defer,
    /// `u8 access-kind, u32 index`: register a resource drop for the bound
    /// variable.
    DeferDrop,

    // Iteration.
    GetIter,
    /// Push the next element, or the end sentinel.
    IterNext,

    // Classes and tags.
    /// `u32 class-id, u32 name, u8 kind (0 method, 1 getter, 2 setter,
    /// 3 static)`: pops the method value.
    ClassMethod,
    /// `u32 class-id, u32 field-index`: pops the field's default value.
    ClassFieldDefault,
    /// `u32 tag, u32 name`: pops the method value.
    TagMethod,

    // Modules, eval, macros.
    /// `u32 module-id`: run the module initializer once.
    ExecCode,
    /// Pops a source string; compiles and runs it in the global scope.
    Eval,
    /// `u32 template-id, u32 hole-count`: pops hole values, pushes AST.
    Render,
}

/// Access-kind byte for pattern binds and resource drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum AccessKind {
    Local,
    Global,
    Capture,
}
