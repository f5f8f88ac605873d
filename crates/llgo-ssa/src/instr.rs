//! The SSA instruction set.
//!
//! Mirrors the instruction vocabulary of Go's SSA form, already typed by
//! the frontend: every value-producing instruction carries its Go result
//! type, so the walker never re-derives types.

use serde::{Deserialize, Serialize};

use crate::types::{Background, GoType, Signature};

/// Identifies the result of a value-producing instruction within one
/// function body. Registers are numbered by the frontend.
pub type RegId = u32;

/// Binary operator tokens (Go's token set, minus short-circuit forms,
/// which SSA expresses as control flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOpToken {
    Add,
    Sub,
    Mul,
    Quo,
    Rem,
    And,
    Or,
    Xor,
    AndNot,
    Shl,
    Shr,
    Eql,
    Neq,
    Lss,
    Leq,
    Gtr,
    Geq,
}

impl BinOpToken {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOpToken::Eql | BinOpToken::Neq | BinOpToken::Lss | BinOpToken::Leq | BinOpToken::Gtr | BinOpToken::Geq
        )
    }
}

/// Unary operator tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOpToken {
    /// Arithmetic negation (`-x`).
    Neg,
    /// Logical not (`!x`).
    Not,
    /// Bitwise complement (`^x`).
    Complement,
    /// Pointer load (`*p`).
    Deref,
    /// Channel receive (`<-ch`).
    Recv,
}

/// A compile-time constant operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Int { value: i64, ty: GoType },
    Float { value: f64, ty: GoType },
    Bool(bool),
    Str(String),
    /// The zero value of a pointer-shaped or aggregate type.
    Nil(GoType),
}

impl Const {
    pub fn ty(&self) -> GoType {
        match self {
            Const::Int { ty, .. } | Const::Float { ty, .. } | Const::Nil(ty) => ty.clone(),
            Const::Bool(_) => GoType::Basic(crate::types::BasicKind::Bool),
            Const::Str(_) => GoType::Basic(crate::types::BasicKind::Str),
        }
    }
}

/// A reference to a function by symbol, carrying everything needed to
/// declare it in a module that has not seen its definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncRef {
    /// Import path of the owning package.
    pub pkg: String,
    /// Name within the package; methods are receiver-mangled
    /// (`(T).Sound`, `(*T).Scan`), anonymous functions parent-mangled
    /// (`main$1`).
    pub name: String,
    pub sig: Signature,
    /// Linkage class the frontend resolved (C for runtime/C-linked
    /// packages).
    pub background: Background,
    /// Set when the reference is a compiler intrinsic from the
    /// `llgo:instr` pseudo package (`cstr`, `alloca`, ...); such
    /// references lower inline and never become calls.
    #[serde(default)]
    pub intrinsic: Option<String>,
}

/// An operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Result of a value-producing instruction in this function.
    Reg(RegId),
    /// The i-th declared parameter (receiver included, closure context
    /// excluded).
    Param(u32),
    /// The i-th free variable of a closure body.
    FreeVar(u32),
    Const(Const),
    /// A package-level variable, by full symbol name; evaluates to its
    /// address. `ty` is the variable's type (not the pointer type), so a
    /// module that has not seen the definition can still declare it.
    Global { sym: String, ty: GoType },
    Func(FuncRef),
}

/// Builtins that survive into SSA as direct calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    Println,
    Print,
    Len,
    Cap,
    Append,
    Copy,
    Recover,
}

/// What a call instruction targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    /// A statically known function.
    Func(FuncRef),
    /// An indirect call through a closure or function value.
    Value(Value),
    /// An interface method invocation: dynamic dispatch through the
    /// receiver's itab. `method_index` is the position in the interface's
    /// sorted method list.
    Invoke {
        iface: Value,
        /// The interface type of the receiver.
        iface_ty: GoType,
        method: String,
        method_index: u32,
        sig: Signature,
    },
    Builtin(Builtin),
}

/// The common parts of Call / Defer / Go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInstr {
    pub callee: Callee,
    pub args: Vec<Value>,
    /// Result type; `Tuple` for multi-result calls, `Tuple([])` for none.
    pub ty: GoType,
}

/// One SSA instruction plus the register its result binds to (when it
/// produces a value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(default)]
    pub reg: Option<RegId>,
    pub kind: Instr,
}

impl Instruction {
    pub fn new(reg: Option<RegId>, kind: Instr) -> Self {
        Self { reg, kind }
    }
}

/// The closed instruction vocabulary. An unknown instruction cannot be
/// represented; the walker treats any unhandled combination (for example
/// an unsupported builtin) as a fatal compile error, never as something
/// to skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    BinOp { op: BinOpToken, x: Value, y: Value, ty: GoType },
    UnOp { op: UnOpToken, x: Value, comma_ok: bool, ty: GoType },
    /// A local or escaping allocation of one `elem`. `comment` carries the
    /// frontend's annotation; the literal `"varargs"` marks candidate
    /// variadic-packaging allocations.
    Alloc { elem: GoType, heap: bool, comment: String, ty: GoType },
    IndexAddr { x: Value, index: Value, ty: GoType },
    Index { x: Value, index: Value, ty: GoType },
    FieldAddr { x: Value, field: u32, ty: GoType },
    Field { x: Value, field: u32, ty: GoType },
    Slice {
        x: Value,
        low: Option<Value>,
        high: Option<Value>,
        max: Option<Value>,
        ty: GoType,
    },
    Lookup { x: Value, index: Value, comma_ok: bool, ty: GoType },
    MakeSlice { len: Value, cap: Option<Value>, ty: GoType },
    MakeMap { reserve: Option<Value>, ty: GoType },
    MakeInterface { x: Value, x_ty: GoType, ty: GoType },
    MakeClosure { func: FuncRef, bindings: Vec<Value>, ty: GoType },
    TypeAssert { x: Value, asserted: GoType, comma_ok: bool, ty: GoType },
    ChangeType { x: Value, ty: GoType },
    Convert { x: Value, x_ty: GoType, ty: GoType },
    ChangeInterface { x: Value, ty: GoType },
    Range { x: Value, ty: GoType },
    Next { iter: Value, is_string: bool, ty: GoType },
    Extract { tuple: Value, index: u32, ty: GoType },
    Phi { edges: Vec<Value>, ty: GoType },
    Call(CallInstr),
    Defer(CallInstr),
    Go(CallInstr),
    Store { addr: Value, val: Value },
    MapUpdate { map: Value, key: Value, value: Value },
    Send { chan: Value, x: Value },
    /// Unconditional branch to `succs[0]`.
    Jump,
    /// Conditional branch: `succs[0]` when true, `succs[1]` when false.
    If { cond: Value },
    Return { results: Vec<Value> },
    RunDefers,
    Panic { x: Value },
}

impl Instr {
    /// The Go type of this instruction's result, if it produces a value.
    pub fn result_ty(&self) -> Option<&GoType> {
        match self {
            Instr::BinOp { ty, .. }
            | Instr::UnOp { ty, .. }
            | Instr::Alloc { ty, .. }
            | Instr::IndexAddr { ty, .. }
            | Instr::Index { ty, .. }
            | Instr::FieldAddr { ty, .. }
            | Instr::Field { ty, .. }
            | Instr::Slice { ty, .. }
            | Instr::Lookup { ty, .. }
            | Instr::MakeSlice { ty, .. }
            | Instr::MakeMap { ty, .. }
            | Instr::MakeInterface { ty, .. }
            | Instr::MakeClosure { ty, .. }
            | Instr::TypeAssert { ty, .. }
            | Instr::ChangeType { ty, .. }
            | Instr::Convert { ty, .. }
            | Instr::ChangeInterface { ty, .. }
            | Instr::Range { ty, .. }
            | Instr::Next { ty, .. }
            | Instr::Extract { ty, .. }
            | Instr::Phi { ty, .. } => Some(ty),
            Instr::Call(call) | Instr::Defer(call) | Instr::Go(call) => Some(&call.ty),
            _ => None,
        }
    }

    /// A short opcode name for diagnostics.
    pub fn opcode(&self) -> &'static str {
        match self {
            Instr::BinOp { .. } => "BinOp",
            Instr::UnOp { .. } => "UnOp",
            Instr::Alloc { .. } => "Alloc",
            Instr::IndexAddr { .. } => "IndexAddr",
            Instr::Index { .. } => "Index",
            Instr::FieldAddr { .. } => "FieldAddr",
            Instr::Field { .. } => "Field",
            Instr::Slice { .. } => "Slice",
            Instr::Lookup { .. } => "Lookup",
            Instr::MakeSlice { .. } => "MakeSlice",
            Instr::MakeMap { .. } => "MakeMap",
            Instr::MakeInterface { .. } => "MakeInterface",
            Instr::MakeClosure { .. } => "MakeClosure",
            Instr::TypeAssert { .. } => "TypeAssert",
            Instr::ChangeType { .. } => "ChangeType",
            Instr::Convert { .. } => "Convert",
            Instr::ChangeInterface { .. } => "ChangeInterface",
            Instr::Range { .. } => "Range",
            Instr::Next { .. } => "Next",
            Instr::Extract { .. } => "Extract",
            Instr::Phi { .. } => "Phi",
            Instr::Call(_) => "Call",
            Instr::Defer(_) => "Defer",
            Instr::Go(_) => "Go",
            Instr::Store { .. } => "Store",
            Instr::MapUpdate { .. } => "MapUpdate",
            Instr::Send { .. } => "Send",
            Instr::Jump => "Jump",
            Instr::If { .. } => "If",
            Instr::Return { .. } => "Return",
            Instr::RunDefers => "RunDefers",
            Instr::Panic { .. } => "Panic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BasicKind;

    #[test]
    fn result_ty_present_only_for_values() {
        let int = GoType::Basic(BasicKind::Int);
        let add = Instr::BinOp {
            op: BinOpToken::Add,
            x: Value::Param(0),
            y: Value::Param(1),
            ty: int.clone(),
        };
        assert_eq!(add.result_ty(), Some(&int));
        assert!(Instr::Jump.result_ty().is_none());
        assert!(Instr::RunDefers.result_ty().is_none());
    }

    #[test]
    fn opcode_names_match_variants() {
        assert_eq!(Instr::Jump.opcode(), "Jump");
        let call = Instr::Call(CallInstr {
            callee: Callee::Builtin(Builtin::Println),
            args: vec![],
            ty: GoType::Tuple(vec![]),
        });
        assert_eq!(call.opcode(), "Call");
    }

    #[test]
    fn const_types() {
        assert_eq!(Const::Bool(true).ty(), GoType::Basic(BasicKind::Bool));
        assert_eq!(Const::Str("x".into()).ty(), GoType::Basic(BasicKind::Str));
    }
}
