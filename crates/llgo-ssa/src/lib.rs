//! The typed Go-SSA program model consumed by the llgo code generator.
//!
//! The frontend (an external tool; see `llgoc`'s loader) delivers a fully
//! type-checked, SSA-form Go program as plain data. This crate defines that
//! contract: the Go type model ([`types`]), the instruction set ([`instr`]),
//! functions and blocks ([`func`]), packages and their kinds ([`package`]),
//! plus the symbol mangling rules ([`symbols`]) and the method-binding
//! attribute codec ([`method_binding`]) shared with the late lowering pass.
//!
//! Everything here derives `Serialize`/`Deserialize`; the structs *are* the
//! wire format.

pub mod func;
pub mod instr;
pub mod method_binding;
pub mod package;
pub mod symbols;
pub mod types;

pub use func::{Block, SsaFunction};
pub use instr::{BinOpToken, Builtin, CallInstr, Callee, Const, FuncRef, Instr, Instruction, RegId, UnOpToken, Value};
pub use package::{Member, PackageKind, SsaPackage, SsaProgram, TypeDef};
pub use types::{Background, BasicKind, Field, GoType, IfaceMethod, InterfaceDef, Param, Signature, StructDef, TypeEnv};
