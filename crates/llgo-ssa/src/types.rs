//! The Go type model.
//!
//! Types arrive from the frontend as plain data. Named types are
//! *references* (`GoType::Named`), resolved through the program-wide
//! [`TypeEnv`]; this keeps recursive types (a struct whose field points
//! back at itself) representable and gives the mirror a stable identity
//! key per named type.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Which ABI rules a type or function is mirrored under.
///
/// `InGo` follows Go layout (string is `{ptr, len}`, variadic tails are
/// slices); `InC` follows the platform C ABI (string is a char pointer,
/// variadic functions use true varargs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Background {
    InGo,
    InC,
}

/// Go's predeclared scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasicKind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Str,
    UnsafePointer,
}

impl BasicKind {
    /// True for the integer kinds (bool and floats excluded).
    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            BasicKind::Bool | BasicKind::Float32 | BasicKind::Float64 | BasicKind::Str
        )
    }

    /// True for kinds whose IR type is a signed integer.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BasicKind::Int | BasicKind::Int8 | BasicKind::Int16 | BasicKind::Int32 | BasicKind::Int64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, BasicKind::Float32 | BasicKind::Float64)
    }

    fn key(self) -> &'static str {
        match self {
            BasicKind::Bool => "bool",
            BasicKind::Int => "int",
            BasicKind::Int8 => "int8",
            BasicKind::Int16 => "int16",
            BasicKind::Int32 => "int32",
            BasicKind::Int64 => "int64",
            BasicKind::Uint => "uint",
            BasicKind::Uint8 => "uint8",
            BasicKind::Uint16 => "uint16",
            BasicKind::Uint32 => "uint32",
            BasicKind::Uint64 => "uint64",
            BasicKind::Uintptr => "uintptr",
            BasicKind::Float32 => "float32",
            BasicKind::Float64 => "float64",
            BasicKind::Str => "string",
            BasicKind::UnsafePointer => "unsafe.Pointer",
        }
    }
}

/// A struct field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: GoType,
    #[serde(default)]
    pub embedded: bool,
}

/// An anonymous struct body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructDef {
    pub fields: Vec<Field>,
}

/// One method of an interface. The frontend delivers methods sorted by
/// name; the method index used by invoke thunks is the position in this
/// list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfaceMethod {
    pub name: String,
    pub sig: Signature,
}

/// An interface body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InterfaceDef {
    pub methods: Vec<IfaceMethod>,
}

impl InterfaceDef {
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// A function parameter (or receiver).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: GoType,
}

/// A function signature. For variadic Go functions the final parameter's
/// type is the slice the tail is packaged into.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub recv: Option<Param>,
    pub params: Vec<Param>,
    pub results: Vec<GoType>,
    #[serde(default)]
    pub variadic: bool,
}

impl Signature {
    /// The flattened parameter list: receiver first when present.
    pub fn all_params(&self) -> Vec<&Param> {
        self.recv.iter().chain(self.params.iter()).collect()
    }
}

/// A Go type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GoType {
    Basic(BasicKind),
    Pointer(Box<GoType>),
    Array { elem: Box<GoType>, len: u64 },
    Slice(Box<GoType>),
    Map { key: Box<GoType>, value: Box<GoType> },
    Chan(Box<GoType>),
    Struct(StructDef),
    Interface(InterfaceDef),
    /// Reference to a named (defined) type; the underlying type lives in
    /// the [`TypeEnv`].
    Named { pkg: String, name: String },
    Func(Box<Signature>),
    /// A multi-value result (the type of a multi-return call or a
    /// comma-ok operation). Never a value type in Go source.
    Tuple(Vec<GoType>),
}

impl GoType {
    pub fn pointer(elem: GoType) -> GoType {
        GoType::Pointer(Box::new(elem))
    }

    pub fn slice(elem: GoType) -> GoType {
        GoType::Slice(Box::new(elem))
    }

    /// The empty interface (`any`).
    pub fn any() -> GoType {
        GoType::Interface(InterfaceDef::default())
    }

    pub fn is_interface(&self, env: &TypeEnv) -> bool {
        matches!(self.underlying(env), GoType::Interface(_))
    }

    /// Resolve a named reference one level; other types return themselves.
    pub fn underlying<'a>(&'a self, env: &'a TypeEnv) -> &'a GoType {
        let mut t = self;
        while let GoType::Named { pkg, name } = t {
            match env.lookup(pkg, name) {
                Some(u) => t = u,
                None => break,
            }
        }
        t
    }

    /// Canonical identity key. Two types share a key iff the mirror must
    /// hand back the same IR type for them; named types key by their
    /// qualified name so structurally identical named types stay distinct.
    pub fn key(&self) -> String {
        let mut out = String::new();
        self.write_key(&mut out);
        out
    }

    fn write_key(&self, out: &mut String) {
        match self {
            GoType::Basic(k) => out.push_str(k.key()),
            GoType::Pointer(e) => {
                out.push('*');
                e.write_key(out);
            }
            GoType::Array { elem, len } => {
                let _ = write!(out, "[{len}]");
                elem.write_key(out);
            }
            GoType::Slice(e) => {
                out.push_str("[]");
                e.write_key(out);
            }
            GoType::Map { key, value } => {
                out.push_str("map[");
                key.write_key(out);
                out.push(']');
                value.write_key(out);
            }
            GoType::Chan(e) => {
                out.push_str("chan ");
                e.write_key(out);
            }
            GoType::Struct(s) => {
                out.push_str("struct{");
                for (i, f) in s.fields.iter().enumerate() {
                    if i > 0 {
                        out.push(';');
                    }
                    out.push_str(&f.name);
                    out.push(' ');
                    f.ty.write_key(out);
                }
                out.push('}');
            }
            GoType::Interface(ifc) => {
                out.push_str("interface{");
                for (i, m) in ifc.methods.iter().enumerate() {
                    if i > 0 {
                        out.push(';');
                    }
                    out.push_str(&m.name);
                    out.push(' ');
                    GoType::Func(Box::new(m.sig.clone())).write_key(out);
                }
                out.push('}');
            }
            GoType::Named { pkg, name } => {
                out.push_str(pkg);
                out.push('.');
                out.push_str(name);
            }
            GoType::Func(sig) => {
                out.push_str("func(");
                for (i, p) in sig.params.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    p.ty.write_key(out);
                }
                if sig.variadic {
                    out.push_str("...");
                }
                out.push(')');
                for r in &sig.results {
                    out.push(' ');
                    r.write_key(out);
                }
            }
            GoType::Tuple(elems) => {
                out.push('(');
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    e.write_key(out);
                }
                out.push(')');
            }
        }
    }
}

/// Program-wide table of named type definitions: qualified name
/// (`pkg.Name`) to underlying type. `BTreeMap` keeps iteration
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeEnv {
    pub defs: BTreeMap<String, GoType>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qualified(pkg: &str, name: &str) -> String {
        format!("{pkg}.{name}")
    }

    pub fn define(&mut self, pkg: &str, name: &str, underlying: GoType) {
        self.defs.insert(Self::qualified(pkg, name), underlying);
    }

    pub fn lookup(&self, pkg: &str, name: &str) -> Option<&GoType> {
        self.defs.get(&Self::qualified(pkg, name))
    }

    /// Merge another environment in; later definitions win, which is what
    /// package patching wants (the patch's definitions replace the
    /// original's).
    pub fn extend(&mut self, other: TypeEnv) {
        self.defs.extend(other.defs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_structural_except_named() {
        let a = GoType::Struct(StructDef {
            fields: vec![Field {
                name: "x".into(),
                ty: GoType::Basic(BasicKind::Int),
                embedded: false,
            }],
        });
        let b = a.clone();
        assert_eq!(a.key(), b.key());

        let named_a = GoType::Named { pkg: "p".into(), name: "A".into() };
        let named_b = GoType::Named { pkg: "p".into(), name: "B".into() };
        assert_ne!(named_a.key(), named_b.key());
    }

    #[test]
    fn underlying_resolves_through_env() {
        let mut env = TypeEnv::new();
        env.define("p", "MyInt", GoType::Basic(BasicKind::Int));
        let t = GoType::Named { pkg: "p".into(), name: "MyInt".into() };
        assert_eq!(t.underlying(&env), &GoType::Basic(BasicKind::Int));
        assert!(!t.is_interface(&env));
    }

    #[test]
    fn interface_detection_via_named() {
        let mut env = TypeEnv::new();
        env.define(
            "main",
            "Animal",
            GoType::Interface(InterfaceDef {
                methods: vec![IfaceMethod {
                    name: "Sound".into(),
                    sig: Signature {
                        recv: None,
                        params: vec![],
                        results: vec![GoType::Basic(BasicKind::Str)],
                        variadic: false,
                    },
                }],
            }),
        );
        let t = GoType::Named { pkg: "main".into(), name: "Animal".into() };
        assert!(t.is_interface(&env));
    }

    #[test]
    fn func_key_includes_variadic_marker() {
        let sig = Signature {
            recv: None,
            params: vec![Param { name: "xs".into(), ty: GoType::slice(GoType::any()) }],
            results: vec![],
            variadic: true,
        };
        let key = GoType::Func(Box::new(sig)).key();
        assert!(key.contains("..."), "variadic signatures must key differently: {key}");
    }
}
