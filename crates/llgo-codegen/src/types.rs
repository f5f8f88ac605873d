//! Go type to LLVM type mapping (the type mirror).
//!
//! Every query goes through [`Program::llvm_type`], which memoizes on the
//! canonical type key plus ABI background. Named struct types become LLVM
//! *named* structs so two structurally identical Go types stay distinct;
//! the body is filled in after the opaque shell is registered, which is
//! what lets self-referential types terminate.
//!
//! ## Mapping
//!
//! | Go type        | InGo                         | InC            |
//! |----------------|------------------------------|----------------|
//! | bool           | i1                           | i1             |
//! | int / uint     | pointer-sized int            | same           |
//! | float32/64     | float / double               | same           |
//! | string         | { ptr, int }                 | ptr            |
//! | slice          | { ptr, int, int }            | same           |
//! | map / chan     | ptr (opaque runtime struct)  | same           |
//! | interface      | { ptr, ptr }                 | same           |
//! | func           | { ptr, ptr } (code + ctx)    | ptr            |
//! | named struct   | named LLVM struct            | literal struct |

use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType};
use inkwell::AddressSpace;

use llgo_ssa::{Background, BasicKind, GoType, Signature, TypeEnv};

use crate::program::Program;

impl<'ctx> Program<'ctx> {
    /// Mirror a Go type into its IR representation.
    ///
    /// Never produces partial IR: any type the mirror cannot express is a
    /// hard error that aborts the package's compilation.
    pub fn llvm_type(&self, ty: &GoType, bg: Background) -> Result<BasicTypeEnum<'ctx>, String> {
        let key = (ty.key(), bg);
        if let Some(cached) = self.mirror.borrow().get(&key) {
            return Ok(*cached);
        }
        let lowered = self.lower_type(ty, bg)?;
        self.mirror.borrow_mut().insert(key, lowered);
        Ok(lowered)
    }

    fn lower_type(&self, ty: &GoType, bg: Background) -> Result<BasicTypeEnum<'ctx>, String> {
        let ctx = self.ctx;
        let ptr = ctx.ptr_type(AddressSpace::default());
        Ok(match ty {
            GoType::Basic(kind) => match kind {
                BasicKind::Bool => ctx.bool_type().into(),
                BasicKind::Int8 | BasicKind::Uint8 => ctx.i8_type().into(),
                BasicKind::Int16 | BasicKind::Uint16 => ctx.i16_type().into(),
                BasicKind::Int32 | BasicKind::Uint32 => ctx.i32_type().into(),
                BasicKind::Int64 | BasicKind::Uint64 => ctx.i64_type().into(),
                BasicKind::Int | BasicKind::Uint | BasicKind::Uintptr => self.int_type().into(),
                BasicKind::Float32 => ctx.f32_type().into(),
                BasicKind::Float64 => ctx.f64_type().into(),
                BasicKind::Str => match bg {
                    Background::InGo => self.string_type().into(),
                    Background::InC => ptr.into(),
                },
                BasicKind::UnsafePointer => ptr.into(),
            },
            GoType::Pointer(_) | GoType::Map { .. } | GoType::Chan(_) => ptr.into(),
            GoType::Array { elem, len } => {
                let elem_ty = self.llvm_type(elem, bg)?;
                elem_ty.array_type(*len as u32).into()
            }
            GoType::Slice(_) => self.slice_type().into(),
            GoType::Struct(def) => {
                let mut fields = Vec::with_capacity(def.fields.len());
                for f in &def.fields {
                    fields.push(self.llvm_type(&f.ty, bg)?);
                }
                ctx.struct_type(&fields, false).into()
            }
            GoType::Interface(_) => self.iface_type().into(),
            GoType::Named { pkg, name } => {
                let qualified = TypeEnv::qualified(pkg, name);
                let underlying = self
                    .type_env
                    .lookup(pkg, name)
                    .cloned()
                    .ok_or_else(|| format!("undefined named type: {qualified}"))?;
                match (&underlying, bg) {
                    // Named Go structs keep their identity as named IR
                    // structs; everything else mirrors the underlying.
                    (GoType::Struct(def), Background::InGo) => {
                        if let Some(st) = self.named_structs.borrow().get(&qualified) {
                            return Ok((*st).as_basic_type_enum());
                        }
                        let shell = ctx.opaque_struct_type(&qualified);
                        self.named_structs
                            .borrow_mut()
                            .insert(qualified.clone(), shell);
                        let mut fields = Vec::with_capacity(def.fields.len());
                        for f in &def.fields {
                            fields.push(self.llvm_type(&f.ty, bg)?);
                        }
                        shell.set_body(&fields, false);
                        shell.as_basic_type_enum()
                    }
                    _ => self.llvm_type(&underlying, bg)?,
                }
            }
            GoType::Func(_) => match bg {
                Background::InGo => self.closure_type().into(),
                Background::InC => ptr.into(),
            },
            GoType::Tuple(elems) => {
                let mut fields = Vec::with_capacity(elems.len());
                for e in elems {
                    fields.push(self.llvm_type(e, bg)?);
                }
                ctx.struct_type(&fields, false).into()
            }
        })
    }

    /// The Go string representation: `{ data ptr, len }`.
    pub fn string_type(&self) -> inkwell::types::StructType<'ctx> {
        let ptr = self.ctx.ptr_type(AddressSpace::default());
        self.ctx
            .struct_type(&[ptr.into(), self.int_type().into()], false)
    }

    /// The slice representation: `{ data ptr, len, cap }`.
    pub fn slice_type(&self) -> inkwell::types::StructType<'ctx> {
        let ptr = self.ctx.ptr_type(AddressSpace::default());
        let int = self.int_type();
        self.ctx
            .struct_type(&[ptr.into(), int.into(), int.into()], false)
    }

    /// The interface representation: `{ itab ptr, data ptr }`.
    pub fn iface_type(&self) -> inkwell::types::StructType<'ctx> {
        let ptr = self.ctx.ptr_type(AddressSpace::default());
        self.ctx.struct_type(&[ptr.into(), ptr.into()], false)
    }

    /// A Go function value: `{ code ptr, context ptr }`. Top-level
    /// functions materialized as values carry a null context.
    pub fn closure_type(&self) -> inkwell::types::StructType<'ctx> {
        let ptr = self.ctx.ptr_type(AddressSpace::default());
        self.ctx.struct_type(&[ptr.into(), ptr.into()], false)
    }

    /// Lower a function signature.
    ///
    /// The receiver (when present) becomes the first parameter; a closure
    /// context pointer is prepended before it when `has_ctx`. Multi-result
    /// signatures return an anonymous struct of the results. In the C
    /// background variadic signatures use true varargs; in the Go
    /// background the variadic tail is an ordinary final slice parameter.
    pub fn fn_sig(
        &self,
        sig: &Signature,
        bg: Background,
        has_ctx: bool,
    ) -> Result<FunctionType<'ctx>, String> {
        let mut params: Vec<BasicMetadataTypeEnum<'ctx>> = Vec::new();
        if has_ctx {
            params.push(self.ctx.ptr_type(AddressSpace::default()).into());
        }
        if let Some(recv) = &sig.recv {
            params.push(self.llvm_type(&recv.ty, bg)?.into());
        }
        for p in &sig.params {
            params.push(self.llvm_type(&p.ty, bg)?.into());
        }
        let c_varargs = bg == Background::InC && sig.variadic;

        Ok(match sig.results.len() {
            0 => self.ctx.void_type().fn_type(&params, c_varargs),
            1 => self
                .llvm_type(&sig.results[0], bg)?
                .fn_type(&params, c_varargs),
            _ => {
                let ret = self.llvm_type(&GoType::Tuple(sig.results.clone()), bg)?;
                ret.fn_type(&params, c_varargs)
            }
        })
    }

    /// The Go-level result type of a call to `sig`: the single result, a
    /// tuple for multi-result, or the empty tuple for none.
    pub fn result_go_type(sig: &Signature) -> GoType {
        match sig.results.len() {
            1 => sig.results[0].clone(),
            _ => GoType::Tuple(sig.results.clone()),
        }
    }

    /// Strip one pointer level off a Go type; used for loads.
    pub fn elem(ty: &GoType) -> Result<&GoType, String> {
        match ty {
            GoType::Pointer(e) => Ok(e),
            _ => Err(format!("element of non-pointer type: {}", ty.key())),
        }
    }
}
