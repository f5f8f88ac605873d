//! The instruction-level façade over the Inkwell builder.
//!
//! Every operation takes already-typed operands from the SSA walker and
//! yields a typed [`Expr`]; the walker never re-derives types. Runtime
//! calls (map access, channel ops, interface machinery) go through
//! [`crate::intrinsics`], which also raises the program's `need_runtime`
//! flag.

use std::rc::Rc;

use inkwell::basic_block::BasicBlock;
use inkwell::values::{
    BasicMetadataValueEnum, BasicValueEnum, IntValue, PhiValue, PointerValue, StructValue,
};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};

use llgo_ssa::symbols;
use llgo_ssa::{
    Background, BasicKind, BinOpToken, Const, GoType, InterfaceDef, Signature, UnOpToken,
};

use crate::abi;
use crate::intrinsics::{runtime_fn, RtFn};
use crate::package::{DeferRecord, DeferTarget, Function, PackageEmitter};
use crate::program::Program;

/// A typed IR value: the raw LLVM value paired with its Go type.
#[derive(Debug, Clone)]
pub struct Expr<'ctx> {
    pub val: BasicValueEnum<'ctx>,
    pub ty: GoType,
}

impl<'ctx> Expr<'ctx> {
    pub fn new(val: impl Into<BasicValueEnum<'ctx>>, ty: GoType) -> Self {
        Expr { val: val.into(), ty }
    }

    pub fn int_val(&self) -> IntValue<'ctx> {
        self.val.into_int_value()
    }

    pub fn ptr_val(&self) -> PointerValue<'ctx> {
        self.val.into_pointer_value()
    }

    pub fn struct_val(&self) -> StructValue<'ctx> {
        self.val.into_struct_value()
    }
}

/// A cursor emitting instructions into basic blocks of one function.
pub struct Builder<'a, 'ctx> {
    pub prog: &'a Program<'ctx>,
    pub pkg: &'a PackageEmitter<'ctx>,
    pub func: Rc<Function<'ctx>>,
    b: inkwell::builder::Builder<'ctx>,
}

impl<'a, 'ctx> Builder<'a, 'ctx> {
    pub fn new(
        prog: &'a Program<'ctx>,
        pkg: &'a PackageEmitter<'ctx>,
        func: Rc<Function<'ctx>>,
    ) -> Self {
        Builder {
            prog,
            pkg,
            func,
            b: prog.context().create_builder(),
        }
    }

    // ── Cursor ───────────────────────────────────────────────────────

    /// Move the insertion point to the end of `blk`.
    pub fn set_block(&self, blk: BasicBlock<'ctx>) {
        self.b.position_at_end(blk);
    }

    /// Move the insertion point to just before `blk`'s terminator (or the
    /// end when the block is not yet terminated). Used when filling phi
    /// edges into already-emitted predecessors.
    pub fn set_block_before_last(&self, blk: BasicBlock<'ctx>) {
        match blk.get_terminator() {
            Some(term) => self.b.position_before(&term),
            None => self.b.position_at_end(blk),
        }
    }

    pub fn current_block(&self) -> Option<BasicBlock<'ctx>> {
        self.b.get_insert_block()
    }

    /// Whether the current block already ends in a terminator.
    pub fn block_terminated(&self) -> bool {
        self.current_block()
            .and_then(|blk| blk.get_terminator())
            .is_some()
    }

    // ── Constants ────────────────────────────────────────────────────

    pub fn const_expr(&self, c: &Const, bg: Background) -> Result<Expr<'ctx>, String> {
        match c {
            Const::Int { value, ty } => self.const_int(*value, ty, bg),
            Const::Float { value, ty } => {
                let lowered = self.prog.llvm_type(ty, bg)?;
                Ok(Expr::new(
                    lowered.into_float_type().const_float(*value),
                    ty.clone(),
                ))
            }
            Const::Bool(v) => Ok(Expr::new(
                self.prog.context().bool_type().const_int(u64::from(*v), false),
                GoType::Basic(BasicKind::Bool),
            )),
            Const::Str(s) => self.const_string(s, bg),
            Const::Nil(ty) => self.zero_value(ty, bg),
        }
    }

    pub fn const_int(&self, value: i64, ty: &GoType, bg: Background) -> Result<Expr<'ctx>, String> {
        let lowered = self.prog.llvm_type(ty, bg)?;
        Ok(Expr::new(
            lowered.into_int_type().const_int(value as u64, true),
            ty.clone(),
        ))
    }

    /// A Go string constant: private bytes global plus `{ptr, len}` (or a
    /// raw char pointer in the C background).
    pub fn const_string(&self, s: &str, bg: Background) -> Result<Expr<'ctx>, String> {
        let data = self
            .b
            .build_global_string_ptr(s, "str")
            .map_err(|e| e.to_string())?;
        let ptr = data.as_pointer_value();
        match bg {
            Background::InC => Ok(Expr::new(ptr, GoType::Basic(BasicKind::Str))),
            Background::InGo => {
                let len = self.prog.int_type().const_int(s.len() as u64, false);
                let val = self
                    .prog
                    .string_type()
                    .const_named_struct(&[ptr.into(), len.into()]);
                Ok(Expr::new(val, GoType::Basic(BasicKind::Str)))
            }
        }
    }

    /// The zero value of a Go type.
    pub fn zero_value(&self, ty: &GoType, bg: Background) -> Result<Expr<'ctx>, String> {
        let lowered = self.prog.llvm_type(ty, bg)?;
        Ok(Expr::new(zero_of(lowered), ty.clone()))
    }

    // ── Arithmetic and logic ─────────────────────────────────────────

    /// Lower a binary operation by its Go token. Strings and interfaces
    /// route through runtime helpers; everything else maps to a native
    /// instruction.
    pub fn binop(&self, op: BinOpToken, x: &Expr<'ctx>, y: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let under = x.ty.underlying(env).clone();

        if let GoType::Basic(BasicKind::Str) = under {
            return self.string_binop(op, x, y);
        }
        if matches!(under, GoType::Interface(_)) {
            return self.iface_binop(op, x, y);
        }
        if x.val.is_pointer_value() {
            let pred = match op {
                BinOpToken::Eql => IntPredicate::EQ,
                BinOpToken::Neq => IntPredicate::NE,
                _ => return Err(format!("invalid pointer operation: {op:?}")),
            };
            let r = self
                .b
                .build_int_compare(pred, x.ptr_val(), y.ptr_val(), "")
                .map_err(|e| e.to_string())?;
            return Ok(Expr::new(r, GoType::Basic(BasicKind::Bool)));
        }
        if x.val.is_float_value() {
            return self.float_binop(op, x, y);
        }
        self.int_binop(op, &under, x, y)
    }

    fn int_binop(
        &self,
        op: BinOpToken,
        under: &GoType,
        x: &Expr<'ctx>,
        y: &Expr<'ctx>,
    ) -> Result<Expr<'ctx>, String> {
        let signed = match under {
            GoType::Basic(k) => k.is_signed(),
            _ => true,
        };
        let (a, b) = (x.int_val(), y.int_val());
        let ty = x.ty.clone();
        let v: IntValue<'ctx> = match op {
            BinOpToken::Add => self.b.build_int_add(a, b, ""),
            BinOpToken::Sub => self.b.build_int_sub(a, b, ""),
            BinOpToken::Mul => self.b.build_int_mul(a, b, ""),
            BinOpToken::Quo => {
                if signed {
                    self.b.build_int_signed_div(a, b, "")
                } else {
                    self.b.build_int_unsigned_div(a, b, "")
                }
            }
            BinOpToken::Rem => {
                if signed {
                    self.b.build_int_signed_rem(a, b, "")
                } else {
                    self.b.build_int_unsigned_rem(a, b, "")
                }
            }
            BinOpToken::And => self.b.build_and(a, b, ""),
            BinOpToken::Or => self.b.build_or(a, b, ""),
            BinOpToken::Xor => self.b.build_xor(a, b, ""),
            BinOpToken::AndNot => {
                let not_b = self.b.build_not(b, "").map_err(|e| e.to_string())?;
                self.b.build_and(a, not_b, "")
            }
            BinOpToken::Shl => self.b.build_left_shift(a, b, ""),
            BinOpToken::Shr => self.b.build_right_shift(a, b, signed, ""),
            cmp => {
                let pred = int_predicate(cmp, signed)?;
                let r = self
                    .b
                    .build_int_compare(pred, a, b, "")
                    .map_err(|e| e.to_string())?;
                return Ok(Expr::new(r, GoType::Basic(BasicKind::Bool)));
            }
        }
        .map_err(|e| e.to_string())?;
        Ok(Expr::new(v, ty))
    }

    fn float_binop(&self, op: BinOpToken, x: &Expr<'ctx>, y: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let (a, b) = (x.val.into_float_value(), y.val.into_float_value());
        let v = match op {
            BinOpToken::Add => self.b.build_float_add(a, b, ""),
            BinOpToken::Sub => self.b.build_float_sub(a, b, ""),
            BinOpToken::Mul => self.b.build_float_mul(a, b, ""),
            BinOpToken::Quo => self.b.build_float_div(a, b, ""),
            BinOpToken::Rem => self.b.build_float_rem(a, b, ""),
            cmp => {
                let pred = match cmp {
                    BinOpToken::Eql => FloatPredicate::OEQ,
                    BinOpToken::Neq => FloatPredicate::UNE,
                    BinOpToken::Lss => FloatPredicate::OLT,
                    BinOpToken::Leq => FloatPredicate::OLE,
                    BinOpToken::Gtr => FloatPredicate::OGT,
                    BinOpToken::Geq => FloatPredicate::OGE,
                    other => return Err(format!("invalid float operation: {other:?}")),
                };
                let r = self
                    .b
                    .build_float_compare(pred, a, b, "")
                    .map_err(|e| e.to_string())?;
                return Ok(Expr::new(r, GoType::Basic(BasicKind::Bool)));
            }
        }
        .map_err(|e| e.to_string())?;
        Ok(Expr::new(v, x.ty.clone()))
    }

    fn string_binop(&self, op: BinOpToken, x: &Expr<'ctx>, y: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        match op {
            BinOpToken::Add => {
                let cat = runtime_fn(self.prog, self.pkg.module(), RtFn::StringCat);
                let r = self.call_raw(cat, &[x.val.into(), y.val.into()])?;
                Ok(Expr::new(r.ok_or("StringCat returned void")?, x.ty.clone()))
            }
            cmp if cmp.is_comparison() => {
                let cmp_fn = runtime_fn(self.prog, self.pkg.module(), RtFn::StringCmp);
                let ord = self
                    .call_raw(cmp_fn, &[x.val.into(), y.val.into()])?
                    .ok_or("StringCmp returned void")?
                    .into_int_value();
                let pred = int_predicate(cmp, true)?;
                let zero = self.prog.context().i32_type().const_zero();
                let r = self
                    .b
                    .build_int_compare(pred, ord, zero, "")
                    .map_err(|e| e.to_string())?;
                Ok(Expr::new(r, GoType::Basic(BasicKind::Bool)))
            }
            other => Err(format!("invalid string operation: {other:?}")),
        }
    }

    fn iface_binop(&self, op: BinOpToken, x: &Expr<'ctx>, y: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let eq_fn = runtime_fn(self.prog, self.pkg.module(), RtFn::IfaceEqual);
        let eq = self
            .call_raw(eq_fn, &[x.val.into(), y.val.into()])?
            .ok_or("IfaceEqual returned void")?
            .into_int_value();
        let r = match op {
            BinOpToken::Eql => eq,
            BinOpToken::Neq => self
                .b
                .build_not(eq, "")
                .map_err(|e| e.to_string())?,
            other => return Err(format!("invalid interface operation: {other:?}")),
        };
        Ok(Expr::new(r, GoType::Basic(BasicKind::Bool)))
    }

    /// Lower a unary operation. Channel receive is handled separately by
    /// [`Builder::recv`] because it may be comma-ok.
    pub fn unop(&self, op: UnOpToken, x: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        match op {
            UnOpToken::Neg => {
                if x.val.is_float_value() {
                    let v = self
                        .b
                        .build_float_neg(x.val.into_float_value(), "")
                        .map_err(|e| e.to_string())?;
                    Ok(Expr::new(v, x.ty.clone()))
                } else {
                    let v = self
                        .b
                        .build_int_neg(x.int_val(), "")
                        .map_err(|e| e.to_string())?;
                    Ok(Expr::new(v, x.ty.clone()))
                }
            }
            UnOpToken::Not | UnOpToken::Complement => {
                let v = self.b.build_not(x.int_val(), "").map_err(|e| e.to_string())?;
                Ok(Expr::new(v, x.ty.clone()))
            }
            UnOpToken::Deref => self.load(x),
            UnOpToken::Recv => Err("channel receive must go through Builder::recv".into()),
        }
    }

    // ── Memory ───────────────────────────────────────────────────────

    /// Allocate one `elem`: a zeroed entry-block alloca, or a zeroed heap
    /// cell when the value escapes.
    pub fn alloc(&self, elem: &GoType, heap: bool) -> Result<Expr<'ctx>, String> {
        let lowered = self.prog.llvm_type(elem, Background::InGo)?;
        let ptr_ty = GoType::pointer(elem.clone());
        if heap {
            let size = self.prog.size_of(&lowered);
            let alloc = runtime_fn(self.prog, self.pkg.module(), RtFn::AllocZ);
            let size_val = self.prog.int_type().const_int(size, false);
            let p = self
                .call_raw(alloc, &[size_val.into()])?
                .ok_or("AllocZ returned void")?;
            Ok(Expr::new(p, ptr_ty))
        } else {
            let p = self.entry_alloca(lowered, "")?;
            self.b
                .build_store(p, zero_of(lowered))
                .map_err(|e| e.to_string())?;
            Ok(Expr::new(p, ptr_ty))
        }
    }

    /// Build an alloca in the function's entry block so loops do not grow
    /// the stack, preserving the current insertion point.
    pub fn entry_alloca(
        &self,
        ty: inkwell::types::BasicTypeEnum<'ctx>,
        name: &str,
    ) -> Result<PointerValue<'ctx>, String> {
        let entry = self
            .func
            .val
            .get_first_basic_block()
            .ok_or("function has no entry block")?;
        let current = self.b.get_insert_block();

        match entry.get_first_instruction() {
            Some(first) => self.b.position_before(&first),
            None => self.b.position_at_end(entry),
        }
        let p = self.b.build_alloca(ty, name).map_err(|e| e.to_string())?;
        if let Some(blk) = current {
            self.b.position_at_end(blk);
        }
        Ok(p)
    }

    pub fn load(&self, ptr: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let elem = Program::elem(&ptr.ty)?.clone();
        let lowered = self.prog.llvm_type(&elem, Background::InGo)?;
        let v = self
            .b
            .build_load(lowered, ptr.ptr_val(), "")
            .map_err(|e| e.to_string())?;
        Ok(Expr::new(v, elem))
    }

    pub fn store(&self, ptr: &Expr<'ctx>, val: &Expr<'ctx>) -> Result<(), String> {
        self.b
            .build_store(ptr.ptr_val(), val.val)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    // ── Aggregates ───────────────────────────────────────────────────

    /// Address of field `index` of the struct `x` points at.
    pub fn field_addr(&self, x: &Expr<'ctx>, index: u32) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let pointee = Program::elem(&x.ty)?.clone();
        let field_ty = match pointee.underlying(env) {
            GoType::Struct(def) => def
                .fields
                .get(index as usize)
                .map(|f| f.ty.clone())
                .ok_or_else(|| format!("no field {index} in {}", pointee.key()))?,
            other => return Err(format!("field address into non-struct: {}", other.key())),
        };
        let struct_ty = self
            .prog
            .llvm_type(&pointee, Background::InGo)?
            .into_struct_type();
        let p = self
            .b
            .build_struct_gep(struct_ty, x.ptr_val(), index, "")
            .map_err(|e| e.to_string())?;
        Ok(Expr::new(p, GoType::pointer(field_ty)))
    }

    /// Field `index` of a struct value.
    pub fn field(&self, x: &Expr<'ctx>, index: u32) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let field_ty = match x.ty.underlying(env) {
            GoType::Struct(def) => def
                .fields
                .get(index as usize)
                .map(|f| f.ty.clone())
                .ok_or_else(|| format!("no field {index} in {}", x.ty.key()))?,
            other => return Err(format!("field of non-struct: {}", other.key())),
        };
        let v = self
            .b
            .build_extract_value(x.struct_val(), index, "")
            .map_err(|e| e.to_string())?;
        Ok(Expr::new(v, field_ty))
    }

    /// Address of element `index` of a slice or pointer-to-array, with a
    /// bounds check.
    pub fn index_addr(&self, x: &Expr<'ctx>, index: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        match x.ty.underlying(env).clone() {
            GoType::Slice(elem) => {
                let data = self.extract_raw(x, 0)?.into_pointer_value();
                let len = self.extract_raw(x, 1)?.into_int_value();
                self.bounds_check(index.int_val(), len, RtFn::PanicIndex)?;
                let p = self.elem_gep(&elem, data, index.int_val())?;
                Ok(Expr::new(p, GoType::pointer((*elem).clone())))
            }
            GoType::Pointer(pointee) => match pointee.underlying(env).clone() {
                GoType::Array { elem, len } => {
                    let len_val = self.prog.int_type().const_int(len, false);
                    self.bounds_check(index.int_val(), len_val, RtFn::PanicIndex)?;
                    let p = self.elem_gep(&elem, x.ptr_val(), index.int_val())?;
                    Ok(Expr::new(p, GoType::pointer((*elem).clone())))
                }
                other => Err(format!("index address into pointer to {}", other.key())),
            },
            other => Err(format!("index address into {}", other.key())),
        }
    }

    /// Element `index` of an array value or string, with a bounds check.
    pub fn index(&self, x: &Expr<'ctx>, index: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        match x.ty.underlying(env).clone() {
            GoType::Array { elem, len } => {
                // Spill the aggregate so we can take an element address.
                let lowered = self.prog.llvm_type(&x.ty, Background::InGo)?;
                let slot = self.entry_alloca(lowered, "")?;
                self.b.build_store(slot, x.val).map_err(|e| e.to_string())?;
                let len_val = self.prog.int_type().const_int(len, false);
                self.bounds_check(index.int_val(), len_val, RtFn::PanicIndex)?;
                let p = self.elem_gep(&elem, slot, index.int_val())?;
                let elem_lowered = self.prog.llvm_type(&elem, Background::InGo)?;
                let v = self.b.build_load(elem_lowered, p, "").map_err(|e| e.to_string())?;
                Ok(Expr::new(v, (*elem).clone()))
            }
            GoType::Basic(BasicKind::Str) => self.string_index(x, index),
            other => Err(format!("index into {}", other.key())),
        }
    }

    fn string_index(&self, x: &Expr<'ctx>, index: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let data = self.extract_raw(x, 0)?.into_pointer_value();
        let len = self.extract_raw(x, 1)?.into_int_value();
        self.bounds_check(index.int_val(), len, RtFn::PanicIndex)?;
        let byte = GoType::Basic(BasicKind::Uint8);
        let p = self.elem_gep(&byte, data, index.int_val())?;
        let v = self
            .b
            .build_load(self.prog.context().i8_type(), p, "")
            .map_err(|e| e.to_string())?;
        Ok(Expr::new(v, byte))
    }

    fn elem_gep(
        &self,
        elem: &GoType,
        base: PointerValue<'ctx>,
        index: IntValue<'ctx>,
    ) -> Result<PointerValue<'ctx>, String> {
        let elem_ty = self.prog.llvm_type(elem, Background::InGo)?;
        unsafe { self.b.build_in_bounds_gep(elem_ty, base, &[index], "") }
            .map_err(|e| e.to_string())
    }

    /// Emit `if !(0 <= index < len) { panic }` using freshly appended
    /// blocks; the cursor continues in the in-bounds block.
    fn bounds_check(
        &self,
        index: IntValue<'ctx>,
        len: IntValue<'ctx>,
        panic_fn: RtFn,
    ) -> Result<(), String> {
        let out = self
            .b
            .build_int_compare(IntPredicate::UGE, index, len, "")
            .map_err(|e| e.to_string())?;
        let panic_blk = self.func.make_block(self.prog);
        let ok_blk = self.func.make_block(self.prog);
        self.b
            .build_conditional_branch(out, panic_blk, ok_blk)
            .map_err(|e| e.to_string())?;
        self.b.position_at_end(panic_blk);
        let f = runtime_fn(self.prog, self.pkg.module(), panic_fn);
        self.call_raw(f, &[])?;
        self.b.build_unreachable().map_err(|e| e.to_string())?;
        self.b.position_at_end(ok_blk);
        Ok(())
    }

    /// Extract a raw field of a struct-shaped value (slice, string,
    /// interface) without Go-type bookkeeping.
    fn extract_raw(&self, x: &Expr<'ctx>, index: u32) -> Result<BasicValueEnum<'ctx>, String> {
        self.b
            .build_extract_value(x.struct_val(), index, "")
            .map_err(|e| e.to_string())
    }

    // ── Slices and strings ───────────────────────────────────────────

    /// The `x[low:high:max]` operation over slices, strings, and pointers
    /// to arrays. Nil bases flow through naturally: a zero slice has a
    /// null data pointer and zero length/capacity.
    pub fn slice_op(
        &self,
        x: &Expr<'ctx>,
        low: Option<&Expr<'ctx>>,
        high: Option<&Expr<'ctx>>,
        max: Option<&Expr<'ctx>>,
        result_ty: &GoType,
    ) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let int = self.prog.int_type();
        let (data, len, cap, elem): (PointerValue<'ctx>, IntValue<'ctx>, IntValue<'ctx>, GoType) =
            match x.ty.underlying(env).clone() {
                GoType::Slice(elem) => (
                    self.extract_raw(x, 0)?.into_pointer_value(),
                    self.extract_raw(x, 1)?.into_int_value(),
                    self.extract_raw(x, 2)?.into_int_value(),
                    (*elem).clone(),
                ),
                GoType::Basic(BasicKind::Str) => {
                    let len = self.extract_raw(x, 1)?.into_int_value();
                    (
                        self.extract_raw(x, 0)?.into_pointer_value(),
                        len,
                        len,
                        GoType::Basic(BasicKind::Uint8),
                    )
                }
                GoType::Pointer(pointee) => match pointee.underlying(env).clone() {
                    GoType::Array { elem, len } => {
                        let n = int.const_int(len, false);
                        (x.ptr_val(), n, n, (*elem).clone())
                    }
                    other => return Err(format!("slice of pointer to {}", other.key())),
                },
                other => return Err(format!("slice of {}", other.key())),
            };

        let low_v = low.map(|e| e.int_val()).unwrap_or_else(|| int.const_zero());
        let high_v = high.map(|e| e.int_val()).unwrap_or(len);
        let max_v = max.map(|e| e.int_val()).unwrap_or(cap);

        // low <= high <= max <= cap, all unsigned.
        let bad1 = self
            .b
            .build_int_compare(IntPredicate::UGT, low_v, high_v, "")
            .map_err(|e| e.to_string())?;
        let bad2 = self
            .b
            .build_int_compare(IntPredicate::UGT, high_v, max_v, "")
            .map_err(|e| e.to_string())?;
        let bad3 = self
            .b
            .build_int_compare(IntPredicate::UGT, max_v, cap, "")
            .map_err(|e| e.to_string())?;
        let bad = self
            .b
            .build_or(
                self.b.build_or(bad1, bad2, "").map_err(|e| e.to_string())?,
                bad3,
                "",
            )
            .map_err(|e| e.to_string())?;
        let panic_blk = self.func.make_block(self.prog);
        let ok_blk = self.func.make_block(self.prog);
        self.b
            .build_conditional_branch(bad, panic_blk, ok_blk)
            .map_err(|e| e.to_string())?;
        self.b.position_at_end(panic_blk);
        let f = runtime_fn(self.prog, self.pkg.module(), RtFn::PanicSlice);
        self.call_raw(f, &[])?;
        self.b.build_unreachable().map_err(|e| e.to_string())?;
        self.b.position_at_end(ok_blk);

        let new_data = self.elem_gep(&elem, data, low_v)?;
        let new_len = self.b.build_int_sub(high_v, low_v, "").map_err(|e| e.to_string())?;

        if matches!(result_ty.underlying(env), GoType::Basic(BasicKind::Str)) {
            let v = self.pack_struct(
                self.prog.string_type(),
                &[new_data.into(), new_len.into()],
            )?;
            return Ok(Expr::new(v, result_ty.clone()));
        }
        let new_cap = self.b.build_int_sub(max_v, low_v, "").map_err(|e| e.to_string())?;
        let v = self.pack_struct(
            self.prog.slice_type(),
            &[new_data.into(), new_len.into(), new_cap.into()],
        )?;
        Ok(Expr::new(v, result_ty.clone()))
    }

    /// `make([]T, len, cap)`: a zeroed heap block wrapped in a slice
    /// header.
    pub fn make_slice(
        &self,
        ty: &GoType,
        len: &Expr<'ctx>,
        cap: Option<&Expr<'ctx>>,
    ) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let elem = match ty.underlying(env) {
            GoType::Slice(e) => (**e).clone(),
            other => return Err(format!("make slice of {}", other.key())),
        };
        let elem_lowered = self.prog.llvm_type(&elem, Background::InGo)?;
        let elem_size = self.prog.int_type().const_int(self.prog.size_of(&elem_lowered), false);
        let cap_v = cap.map(|c| c.int_val()).unwrap_or_else(|| len.int_val());
        let bytes = self
            .b
            .build_int_mul(cap_v, elem_size, "")
            .map_err(|e| e.to_string())?;
        let alloc = runtime_fn(self.prog, self.pkg.module(), RtFn::AllocZ);
        let data = self
            .call_raw(alloc, &[bytes.into()])?
            .ok_or("AllocZ returned void")?;
        let v = self.pack_struct(
            self.prog.slice_type(),
            &[data, len.val, cap_v.into()],
        )?;
        Ok(Expr::new(v, ty.clone()))
    }

    pub fn make_map(&self, ty: &GoType, reserve: Option<&Expr<'ctx>>) -> Result<Expr<'ctx>, String> {
        let new_map = runtime_fn(self.prog, self.pkg.module(), RtFn::NewMap);
        let reserve_v: BasicMetadataValueEnum = match reserve {
            Some(r) => r.val.into(),
            None => self.prog.int_type().const_zero().into(),
        };
        let m = self
            .call_raw(new_map, &[reserve_v])?
            .ok_or("NewMap returned void")?;
        Ok(Expr::new(m, ty.clone()))
    }

    // ── Interfaces ───────────────────────────────────────────────────

    /// Box a concrete value into an interface.
    pub fn make_interface(
        &self,
        iface_ty: &GoType,
        x_ty: &GoType,
        x: &Expr<'ctx>,
    ) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let tdesc = self.type_descriptor(x_ty)?;
        let data = self.box_data(x)?;

        let tab: BasicValueEnum<'ctx> = match iface_ty.underlying(env) {
            GoType::Interface(def) if def.is_empty() => tdesc.into(),
            GoType::Interface(_) => {
                let idesc = self.iface_descriptor(iface_ty)?;
                let new_itab = runtime_fn(self.prog, self.pkg.module(), RtFn::NewItab);
                self.call_raw(new_itab, &[tdesc.into(), idesc.into()])?
                    .ok_or("NewItab returned void")?
            }
            other => return Err(format!("make interface of {}", other.key())),
        };
        let v = self.pack_struct(self.prog.iface_type(), &[tab, data.into()])?;
        Ok(Expr::new(v, iface_ty.clone()))
    }

    /// Encode a value into the interface data word: pointers directly,
    /// word-sized scalars inline, everything else through a heap cell.
    fn box_data(&self, x: &Expr<'ctx>) -> Result<PointerValue<'ctx>, String> {
        let ctx = self.prog.context();
        let ptr_ty = ctx.ptr_type(AddressSpace::default());
        let int = self.prog.int_type();
        match x.val {
            BasicValueEnum::PointerValue(p) => Ok(p),
            BasicValueEnum::IntValue(i) => {
                let widened = self
                    .b
                    .build_int_z_extend_or_bit_cast(i, int, "")
                    .map_err(|e| e.to_string())?;
                self.b
                    .build_int_to_ptr(widened, ptr_ty, "")
                    .map_err(|e| e.to_string())
            }
            BasicValueEnum::FloatValue(f) => {
                let as_int_ty = if f.get_type() == ctx.f32_type() {
                    ctx.i32_type()
                } else {
                    ctx.i64_type()
                };
                let as_int = self
                    .b
                    .build_bit_cast(f, as_int_ty, "")
                    .map_err(|e| e.to_string())?
                    .into_int_value();
                let widened = self
                    .b
                    .build_int_z_extend_or_bit_cast(as_int, int, "")
                    .map_err(|e| e.to_string())?;
                self.b
                    .build_int_to_ptr(widened, ptr_ty, "")
                    .map_err(|e| e.to_string())
            }
            other => {
                let lowered = other.get_type();
                let size = self.prog.size_of(&lowered);
                let alloc = runtime_fn(self.prog, self.pkg.module(), RtFn::AllocU);
                let cell = self
                    .call_raw(alloc, &[int.const_int(size, false).into()])?
                    .ok_or("AllocU returned void")?
                    .into_pointer_value();
                self.b.build_store(cell, other).map_err(|e| e.to_string())?;
                Ok(cell)
            }
        }
    }

    /// The descriptor global for a concrete type. Named types (and
    /// pointers to them) are owned by their defining package, which emits
    /// the full descriptor; everyone else declares. Unnamed types have no
    /// owner, so a link-once empty descriptor is defined at the use site.
    pub fn type_descriptor(&self, ty: &GoType) -> Result<PointerValue<'ctx>, String> {
        let sym = symbols::type_symbol(ty);
        let named = match ty {
            GoType::Named { .. } => true,
            GoType::Pointer(inner) => matches!(**inner, GoType::Named { .. }),
            _ => false,
        };
        let g = if named {
            abi::declare_type_global(self.prog, self.pkg.module(), &sym)
        } else {
            abi::define_type_descriptor(self.prog, self.pkg.module(), &sym, &[])
        };
        Ok(g.as_pointer_value())
    }

    /// The descriptor global for an interface type. Anonymous interfaces
    /// are defined link-once at the use site; named ones by their owning
    /// package.
    pub fn iface_descriptor(&self, iface_ty: &GoType) -> Result<PointerValue<'ctx>, String> {
        let env = self.prog.type_env();
        let sym = symbols::type_symbol(iface_ty);
        let g = match iface_ty {
            GoType::Named { .. } => abi::declare_type_global(self.prog, self.pkg.module(), &sym),
            _ => {
                let def = match iface_ty.underlying(env) {
                    GoType::Interface(def) => def.clone(),
                    other => return Err(format!("interface descriptor of {}", other.key())),
                };
                let methods = iface_method_table(&def);
                abi::define_iface_descriptor(self.prog, self.pkg.module(), &sym, &methods)
            }
        };
        Ok(g.as_pointer_value())
    }

    /// `x.(T)`: runtime-checked down-conversion, optionally comma-ok.
    pub fn type_assert(
        &self,
        x: &Expr<'ctx>,
        asserted: &GoType,
        comma_ok: bool,
    ) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let to_iface = asserted.is_interface(env);
        if to_iface {
            let idesc = self.iface_descriptor(asserted)?;
            if comma_ok {
                let out = self.entry_alloca(self.prog.iface_type().into(), "")?;
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::TryAssertIface);
                let ok = self
                    .call_raw(f, &[x.val.into(), idesc.into(), out.into()])?
                    .ok_or("TryAssertIface returned void")?;
                let v = self
                    .b
                    .build_load(self.prog.iface_type(), out, "")
                    .map_err(|e| e.to_string())?;
                let tuple_ty = GoType::Tuple(vec![asserted.clone(), GoType::Basic(BasicKind::Bool)]);
                let lowered = self.prog.llvm_type(&tuple_ty, Background::InGo)?;
                let packed = self.pack_struct(lowered.into_struct_type(), &[v, ok])?;
                Ok(Expr::new(packed, tuple_ty))
            } else {
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::AssertIface);
                let v = self
                    .call_raw(f, &[x.val.into(), idesc.into()])?
                    .ok_or("AssertIface returned void")?;
                Ok(Expr::new(v, asserted.clone()))
            }
        } else {
            let tdesc = self.type_descriptor(asserted)?;
            let lowered = self.prog.llvm_type(asserted, Background::InGo)?;
            let out = self.entry_alloca(lowered, "")?;
            if comma_ok {
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::TryAssertType);
                let ok = self
                    .call_raw(f, &[x.val.into(), tdesc.into(), out.into()])?
                    .ok_or("TryAssertType returned void")?;
                let v = self.b.build_load(lowered, out, "").map_err(|e| e.to_string())?;
                let tuple_ty = GoType::Tuple(vec![asserted.clone(), GoType::Basic(BasicKind::Bool)]);
                let tuple_lowered = self.prog.llvm_type(&tuple_ty, Background::InGo)?;
                let packed = self.pack_struct(tuple_lowered.into_struct_type(), &[v, ok])?;
                Ok(Expr::new(packed, tuple_ty))
            } else {
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::AssertType);
                self.call_raw(f, &[x.val.into(), tdesc.into(), out.into()])?;
                let v = self.b.build_load(lowered, out, "").map_err(|e| e.to_string())?;
                Ok(Expr::new(v, asserted.clone()))
            }
        }
    }

    /// Interface upcast (`ChangeInterface`): same value, new itab.
    pub fn change_interface(&self, ty: &GoType, x: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        if let GoType::Interface(def) = ty.underlying(env) {
            if def.is_empty() {
                // Upcast to any: reuse the descriptor word as-is.
                return Ok(Expr::new(x.val, ty.clone()));
            }
        }
        let idesc = self.iface_descriptor(ty)?;
        let f = runtime_fn(self.prog, self.pkg.module(), RtFn::ChangeIface);
        let v = self
            .call_raw(f, &[x.val.into(), idesc.into()])?
            .ok_or("ChangeIface returned void")?;
        Ok(Expr::new(v, ty.clone()))
    }

    // ── Maps and channels ────────────────────────────────────────────

    fn spill(&self, x: &Expr<'ctx>) -> Result<PointerValue<'ctx>, String> {
        let slot = self.entry_alloca(x.val.get_type(), "")?;
        self.b.build_store(slot, x.val).map_err(|e| e.to_string())?;
        Ok(slot)
    }

    /// Map (or string) lookup, optionally comma-ok.
    pub fn lookup(
        &self,
        x: &Expr<'ctx>,
        index: &Expr<'ctx>,
        comma_ok: bool,
        result_ty: &GoType,
    ) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let value_ty = match x.ty.underlying(env).clone() {
            GoType::Map { value, .. } => (*value).clone(),
            GoType::Basic(BasicKind::Str) => return self.string_index(x, index),
            other => return Err(format!("lookup into {}", other.key())),
        };
        let key_ptr = self.spill(index)?;
        let value_lowered = self.prog.llvm_type(&value_ty, Background::InGo)?;
        if comma_ok {
            let out = self.entry_alloca(value_lowered, "")?;
            let f = runtime_fn(self.prog, self.pkg.module(), RtFn::MapAccess2);
            let ok = self
                .call_raw(f, &[x.val.into(), key_ptr.into(), out.into()])?
                .ok_or("MapAccess2 returned void")?;
            let v = self
                .b
                .build_load(value_lowered, out, "")
                .map_err(|e| e.to_string())?;
            let lowered = self.prog.llvm_type(result_ty, Background::InGo)?;
            let packed = self.pack_struct(lowered.into_struct_type(), &[v, ok])?;
            Ok(Expr::new(packed, result_ty.clone()))
        } else {
            let f = runtime_fn(self.prog, self.pkg.module(), RtFn::MapAccess1);
            let slot = self
                .call_raw(f, &[x.val.into(), key_ptr.into()])?
                .ok_or("MapAccess1 returned void")?
                .into_pointer_value();
            let v = self
                .b
                .build_load(value_lowered, slot, "")
                .map_err(|e| e.to_string())?;
            Ok(Expr::new(v, value_ty))
        }
    }

    pub fn map_update(&self, m: &Expr<'ctx>, key: &Expr<'ctx>, value: &Expr<'ctx>) -> Result<(), String> {
        let key_ptr = self.spill(key)?;
        let f = runtime_fn(self.prog, self.pkg.module(), RtFn::MapAssign);
        let slot = self
            .call_raw(f, &[m.val.into(), key_ptr.into()])?
            .ok_or("MapAssign returned void")?
            .into_pointer_value();
        self.b.build_store(slot, value.val).map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn send(&self, ch: &Expr<'ctx>, x: &Expr<'ctx>) -> Result<(), String> {
        let slot = self.spill(x)?;
        let f = runtime_fn(self.prog, self.pkg.module(), RtFn::ChanSend);
        self.call_raw(f, &[ch.val.into(), slot.into()])?;
        Ok(())
    }

    /// `<-ch`, optionally comma-ok.
    pub fn recv(&self, ch: &Expr<'ctx>, comma_ok: bool, result_ty: &GoType) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let elem_ty = match ch.ty.underlying(env).clone() {
            GoType::Chan(e) => (*e).clone(),
            other => return Err(format!("receive from {}", other.key())),
        };
        let elem_lowered = self.prog.llvm_type(&elem_ty, Background::InGo)?;
        let out = self.entry_alloca(elem_lowered, "")?;
        if comma_ok {
            let f = runtime_fn(self.prog, self.pkg.module(), RtFn::ChanRecv2);
            let ok = self
                .call_raw(f, &[ch.val.into(), out.into()])?
                .ok_or("ChanRecv2 returned void")?;
            let v = self.b.build_load(elem_lowered, out, "").map_err(|e| e.to_string())?;
            let lowered = self.prog.llvm_type(result_ty, Background::InGo)?;
            let packed = self.pack_struct(lowered.into_struct_type(), &[v, ok])?;
            Ok(Expr::new(packed, result_ty.clone()))
        } else {
            let f = runtime_fn(self.prog, self.pkg.module(), RtFn::ChanRecv);
            self.call_raw(f, &[ch.val.into(), out.into()])?;
            let v = self.b.build_load(elem_lowered, out, "").map_err(|e| e.to_string())?;
            Ok(Expr::new(v, elem_ty))
        }
    }

    // ── Iteration ────────────────────────────────────────────────────

    /// Create an iterator over a map or string.
    pub fn range_iter(&self, x: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let f = match x.ty.underlying(env) {
            GoType::Map { .. } => runtime_fn(self.prog, self.pkg.module(), RtFn::NewMapIter),
            GoType::Basic(BasicKind::Str) => {
                runtime_fn(self.prog, self.pkg.module(), RtFn::NewStringIter)
            }
            other => return Err(format!("range over {}", other.key())),
        };
        let it = self
            .call_raw(f, &[x.val.into()])?
            .ok_or("iterator constructor returned void")?;
        Ok(Expr::new(it, GoType::Basic(BasicKind::UnsafePointer)))
    }

    /// Step an iterator; yields `(ok, key, value)`.
    pub fn next(
        &self,
        iter: &Expr<'ctx>,
        is_string: bool,
        result_ty: &GoType,
    ) -> Result<Expr<'ctx>, String> {
        let elems = match result_ty {
            GoType::Tuple(elems) if elems.len() == 3 => elems,
            other => return Err(format!("iterator step must yield a 3-tuple, got {}", other.key())),
        };
        let k_lowered = self.prog.llvm_type(&elems[1], Background::InGo)?;
        let v_lowered = self.prog.llvm_type(&elems[2], Background::InGo)?;
        let kout = self.entry_alloca(k_lowered, "")?;
        let vout = self.entry_alloca(v_lowered, "")?;
        let f = if is_string {
            runtime_fn(self.prog, self.pkg.module(), RtFn::StringIterNext)
        } else {
            runtime_fn(self.prog, self.pkg.module(), RtFn::MapIterNext)
        };
        let ok = self
            .call_raw(f, &[iter.val.into(), kout.into(), vout.into()])?
            .ok_or("iterator step returned void")?;
        let k = self.b.build_load(k_lowered, kout, "").map_err(|e| e.to_string())?;
        let v = self.b.build_load(v_lowered, vout, "").map_err(|e| e.to_string())?;
        let lowered = self.prog.llvm_type(result_ty, Background::InGo)?;
        let packed = self.pack_struct(lowered.into_struct_type(), &[ok, k, v])?;
        Ok(Expr::new(packed, result_ty.clone()))
    }

    // ── Tuples ───────────────────────────────────────────────────────

    /// Extract a raw field of a struct-shaped value and assign it a Go
    /// type (slice headers, string headers, interface words).
    pub fn extract_field(
        &self,
        x: &Expr<'ctx>,
        index: u32,
        ty: &GoType,
    ) -> Result<Expr<'ctx>, String> {
        let v = self.extract_raw(x, index)?;
        Ok(Expr::new(v, ty.clone()))
    }

    pub fn extract(&self, tuple: &Expr<'ctx>, index: u32) -> Result<Expr<'ctx>, String> {
        let elem_ty = match &tuple.ty {
            GoType::Tuple(elems) => elems
                .get(index as usize)
                .cloned()
                .ok_or_else(|| format!("no tuple element {index}"))?,
            other => return Err(format!("extract from {}", other.key())),
        };
        let v = self.extract_raw(tuple, index)?;
        Ok(Expr::new(v, elem_ty))
    }

    // ── Conversions ──────────────────────────────────────────────────

    /// Re-type a value without changing its representation.
    pub fn change_type(&self, ty: &GoType, x: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let target = self.prog.llvm_type(ty, Background::InGo)?;
        if x.val.get_type() == target {
            return Ok(Expr::new(x.val, ty.clone()));
        }
        self.reinterpret(target, x, ty)
    }

    /// Value-changing conversion between basic types, strings, and byte
    /// slices.
    pub fn convert(&self, ty: &GoType, x: &Expr<'ctx>) -> Result<Expr<'ctx>, String> {
        let env = self.prog.type_env();
        let src = x.ty.underlying(env).clone();
        let dst = ty.underlying(env).clone();
        let target = self.prog.llvm_type(ty, Background::InGo)?;
        let ctx = self.prog.context();

        let v: BasicValueEnum<'ctx> = match (&src, &dst) {
            (GoType::Basic(a), GoType::Basic(b)) if a.is_integer() && b.is_integer() => {
                let from = x.int_val();
                let to_ty = target.into_int_type();
                let fw = from.get_type().get_bit_width();
                let tw = to_ty.get_bit_width();
                if fw == tw {
                    from.into()
                } else if fw > tw {
                    self.b.build_int_truncate(from, to_ty, "").map_err(|e| e.to_string())?.into()
                } else if a.is_signed() {
                    self.b.build_int_s_extend(from, to_ty, "").map_err(|e| e.to_string())?.into()
                } else {
                    self.b.build_int_z_extend(from, to_ty, "").map_err(|e| e.to_string())?.into()
                }
            }
            (GoType::Basic(a), GoType::Basic(b)) if a.is_integer() && b.is_float() => {
                let to_ty = target.into_float_type();
                if a.is_signed() {
                    self.b
                        .build_signed_int_to_float(x.int_val(), to_ty, "")
                        .map_err(|e| e.to_string())?
                        .into()
                } else {
                    self.b
                        .build_unsigned_int_to_float(x.int_val(), to_ty, "")
                        .map_err(|e| e.to_string())?
                        .into()
                }
            }
            (GoType::Basic(a), GoType::Basic(b)) if a.is_float() && b.is_integer() => {
                let from = x.val.into_float_value();
                let to_ty = target.into_int_type();
                if b.is_signed() {
                    self.b
                        .build_float_to_signed_int(from, to_ty, "")
                        .map_err(|e| e.to_string())?
                        .into()
                } else {
                    self.b
                        .build_float_to_unsigned_int(from, to_ty, "")
                        .map_err(|e| e.to_string())?
                        .into()
                }
            }
            (GoType::Basic(a), GoType::Basic(b)) if a.is_float() && b.is_float() => {
                let from = x.val.into_float_value();
                let to_ty = target.into_float_type();
                if from.get_type() == ctx.f64_type() && to_ty == ctx.f32_type() {
                    self.b.build_float_trunc(from, to_ty, "").map_err(|e| e.to_string())?.into()
                } else if from.get_type() == ctx.f32_type() && to_ty == ctx.f64_type() {
                    self.b.build_float_ext(from, to_ty, "").map_err(|e| e.to_string())?.into()
                } else {
                    from.into()
                }
            }
            (GoType::Basic(BasicKind::Str), GoType::Slice(elem))
                if matches!(**elem, GoType::Basic(BasicKind::Uint8)) =>
            {
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::StringToBytes);
                self.call_raw(f, &[x.val.into()])?
                    .ok_or("StringToBytes returned void")?
            }
            (GoType::Slice(elem), GoType::Basic(BasicKind::Str))
                if matches!(**elem, GoType::Basic(BasicKind::Uint8)) =>
            {
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::BytesToString);
                self.call_raw(f, &[x.val.into()])?
                    .ok_or("BytesToString returned void")?
            }
            (GoType::Basic(a), GoType::Basic(BasicKind::Str)) if a.is_integer() => {
                let rune = self
                    .b
                    .build_int_cast(x.int_val(), ctx.i32_type(), "")
                    .map_err(|e| e.to_string())?;
                let f = runtime_fn(self.prog, self.pkg.module(), RtFn::RuneToString);
                self.call_raw(f, &[rune.into()])?
                    .ok_or("RuneToString returned void")?
            }
            (GoType::Basic(BasicKind::Uintptr), _) if target.is_pointer_type() => self
                .b
                .build_int_to_ptr(x.int_val(), target.into_pointer_type(), "")
                .map_err(|e| e.to_string())?
                .into(),
            (_, GoType::Basic(BasicKind::Uintptr)) if x.val.is_pointer_value() => self
                .b
                .build_ptr_to_int(x.ptr_val(), target.into_int_type(), "")
                .map_err(|e| e.to_string())?
                .into(),
            _ => {
                if x.val.get_type() == target {
                    x.val
                } else {
                    return self.reinterpret(target, x, ty);
                }
            }
        };
        Ok(Expr::new(v, ty.clone()))
    }

    /// Reinterpret a value as another IR type: bitcast for scalars,
    /// spill-and-reload for aggregates.
    fn reinterpret(
        &self,
        target: inkwell::types::BasicTypeEnum<'ctx>,
        x: &Expr<'ctx>,
        ty: &GoType,
    ) -> Result<Expr<'ctx>, String> {
        if target.is_struct_type() || target.is_array_type() || x.val.is_struct_value() {
            let slot = self.entry_alloca(x.val.get_type(), "")?;
            self.b.build_store(slot, x.val).map_err(|e| e.to_string())?;
            let v = self.b.build_load(target, slot, "").map_err(|e| e.to_string())?;
            return Ok(Expr::new(v, ty.clone()));
        }
        let v = self
            .b
            .build_bit_cast(x.val, target, "")
            .map_err(|e| e.to_string())?;
        Ok(Expr::new(v, ty.clone()))
    }

    // ── Functions and calls ──────────────────────────────────────────

    /// Pack a code pointer and a context pointer into a Go function
    /// value.
    pub fn make_func_value(
        &self,
        code: PointerValue<'ctx>,
        ctx_ptr: PointerValue<'ctx>,
        ty: GoType,
    ) -> Result<Expr<'ctx>, String> {
        let v = self.pack_struct(self.prog.closure_type(), &[code.into(), ctx_ptr.into()])?;
        Ok(Expr::new(v, ty))
    }

    /// Call a known function with already-lowered arguments. Returns
    /// `None` for void calls.
    pub fn call_fn(
        &self,
        f: &Function<'ctx>,
        args: &[Expr<'ctx>],
    ) -> Result<Option<Expr<'ctx>>, String> {
        let meta: Vec<BasicMetadataValueEnum<'ctx>> = args.iter().map(|a| a.val.into()).collect();
        let ret = self.call_raw(f.val, &meta)?;
        Ok(ret.map(|v| Expr::new(v, Program::result_go_type(&f.sig))))
    }

    /// Call through a Go function value `{code, ctx}`: the context is
    /// always passed as the leading parameter.
    pub fn call_value(
        &self,
        callee: &Expr<'ctx>,
        sig: &Signature,
        args: &[Expr<'ctx>],
    ) -> Result<Option<Expr<'ctx>>, String> {
        let code = self.extract_raw(callee, 0)?.into_pointer_value();
        let ctx_ptr = self.extract_raw(callee, 1)?;
        let fn_ty = self.prog.fn_sig(sig, Background::InGo, true)?;
        let mut meta: Vec<BasicMetadataValueEnum<'ctx>> = vec![ctx_ptr.into()];
        meta.extend(args.iter().map(|a| BasicMetadataValueEnum::from(a.val)));
        let site = self
            .b
            .build_indirect_call(fn_ty, code, &meta, "")
            .map_err(|e| e.to_string())?;
        Ok(site
            .try_as_basic_value()
            .basic()
            .map(|v| Expr::new(v, Program::result_go_type(sig))))
    }

    pub(crate) fn call_raw(
        &self,
        f: inkwell::values::FunctionValue<'ctx>,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> Result<Option<BasicValueEnum<'ctx>>, String> {
        let site = self.b.build_call(f, args, "").map_err(|e| e.to_string())?;
        Ok(site.try_as_basic_value().basic())
    }

    // ── Defers ───────────────────────────────────────────────────────

    /// Record a deferred call. When `in_cond` the defer statement may not
    /// execute on every path, so an entry-block flag guards the exit call.
    pub fn add_defer(
        &self,
        target: DeferTarget<'ctx>,
        args: Vec<Expr<'ctx>>,
        in_cond: bool,
    ) -> Result<(), String> {
        let flag = if in_cond {
            let bool_ty = self.prog.context().bool_type();
            let slot = self.entry_alloca(bool_ty.into(), "defer.flag")?;
            // Initialize in the entry block, before any branching.
            let current = self.b.get_insert_block();
            if let Some(inst) = slot.as_instruction() {
                // Position right after the alloca so the store dominates
                // every use.
                match inst.get_next_instruction() {
                    Some(next) => self.b.position_before(&next),
                    None => {
                        if let Some(entry) = self.func.val.get_first_basic_block() {
                            self.b.position_at_end(entry);
                        }
                    }
                }
            }
            self.b
                .build_store(slot, bool_ty.const_zero())
                .map_err(|e| e.to_string())?;
            if let Some(blk) = current {
                self.b.position_at_end(blk);
            }
            // At the defer site itself the flag becomes true.
            self.b
                .build_store(slot, bool_ty.const_int(1, false))
                .map_err(|e| e.to_string())?;
            Some(slot)
        } else {
            None
        };
        self.func.defers.borrow_mut().push(DeferRecord { target, args, flag });
        Ok(())
    }

    /// Replay the function's defer records in LIFO order.
    pub fn run_defers(&self) -> Result<(), String> {
        let records = self.func.defers.borrow();
        for rec in records.iter().rev() {
            match rec.flag {
                Some(flag) => {
                    let bool_ty = self.prog.context().bool_type();
                    let armed = self
                        .b
                        .build_load(bool_ty, flag, "")
                        .map_err(|e| e.to_string())?
                        .into_int_value();
                    let then_blk = self.func.make_block(self.prog);
                    let cont_blk = self.func.make_block(self.prog);
                    self.b
                        .build_conditional_branch(armed, then_blk, cont_blk)
                        .map_err(|e| e.to_string())?;
                    self.b.position_at_end(then_blk);
                    self.emit_defer_call(rec)?;
                    self.b
                        .build_unconditional_branch(cont_blk)
                        .map_err(|e| e.to_string())?;
                    self.b.position_at_end(cont_blk);
                }
                None => self.emit_defer_call(rec)?,
            }
        }
        Ok(())
    }

    fn emit_defer_call(&self, rec: &DeferRecord<'ctx>) -> Result<(), String> {
        match &rec.target {
            DeferTarget::Direct(f) => {
                self.call_fn(f, &rec.args)?;
            }
            DeferTarget::Indirect { value, sig } => {
                self.call_value(value, sig, &rec.args)?;
            }
            DeferTarget::Runtime(f) => {
                let meta: Vec<BasicMetadataValueEnum<'ctx>> =
                    rec.args.iter().map(|a| a.val.into()).collect();
                self.call_raw(*f, &meta)?;
            }
        }
        Ok(())
    }

    // ── Control flow ─────────────────────────────────────────────────

    pub fn phi(&self, ty: &GoType) -> Result<(PhiValue<'ctx>, Expr<'ctx>), String> {
        let lowered = self.prog.llvm_type(ty, Background::InGo)?;
        let phi = self.b.build_phi(lowered, "").map_err(|e| e.to_string())?;
        let expr = Expr::new(phi.as_basic_value(), ty.clone());
        Ok((phi, expr))
    }

    pub fn jump(&self, blk: BasicBlock<'ctx>) -> Result<(), String> {
        self.b
            .build_unconditional_branch(blk)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn cond_br(
        &self,
        cond: &Expr<'ctx>,
        then_blk: BasicBlock<'ctx>,
        else_blk: BasicBlock<'ctx>,
    ) -> Result<(), String> {
        self.b
            .build_conditional_branch(cond.int_val(), then_blk, else_blk)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn ret(&self, results: &[Expr<'ctx>]) -> Result<(), String> {
        match results.len() {
            0 => {
                self.b.build_return(None).map_err(|e| e.to_string())?;
            }
            1 => {
                self.b
                    .build_return(Some(&results[0].val))
                    .map_err(|e| e.to_string())?;
            }
            _ => {
                let tys: Vec<GoType> = results.iter().map(|r| r.ty.clone()).collect();
                let lowered = self
                    .prog
                    .llvm_type(&GoType::Tuple(tys), Background::InGo)?
                    .into_struct_type();
                let vals: Vec<BasicValueEnum<'ctx>> = results.iter().map(|r| r.val).collect();
                let packed = self.pack_struct(lowered, &vals)?;
                self.b.build_return(Some(&packed)).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    pub fn unreachable(&self) -> Result<(), String> {
        self.b.build_unreachable().map_err(|e| e.to_string())?;
        Ok(())
    }

    /// `panic(v)`: hand the boxed value to the runtime and terminate the
    /// block.
    pub fn panic(&self, v: &Expr<'ctx>) -> Result<(), String> {
        let f = runtime_fn(self.prog, self.pkg.module(), RtFn::Panic);
        self.call_raw(f, &[v.val.into()])?;
        self.unreachable()
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Build a struct value by inserting each field into an undef.
    pub fn pack_struct(
        &self,
        ty: inkwell::types::StructType<'ctx>,
        fields: &[BasicValueEnum<'ctx>],
    ) -> Result<BasicValueEnum<'ctx>, String> {
        let mut agg: inkwell::values::AggregateValueEnum<'ctx> = ty.get_undef().into();
        for (i, f) in fields.iter().enumerate() {
            agg = self
                .b
                .build_insert_value(agg, *f, i as u32, "")
                .map_err(|e| e.to_string())?;
        }
        Ok(agg.into_struct_value().into())
    }

    /// Direct access to the underlying Inkwell builder for walker-level
    /// special cases (memcpy, itab slot loads).
    pub fn raw(&self) -> &inkwell::builder::Builder<'ctx> {
        &self.b
    }
}

fn int_predicate(op: BinOpToken, signed: bool) -> Result<IntPredicate, String> {
    Ok(match (op, signed) {
        (BinOpToken::Eql, _) => IntPredicate::EQ,
        (BinOpToken::Neq, _) => IntPredicate::NE,
        (BinOpToken::Lss, true) => IntPredicate::SLT,
        (BinOpToken::Lss, false) => IntPredicate::ULT,
        (BinOpToken::Leq, true) => IntPredicate::SLE,
        (BinOpToken::Leq, false) => IntPredicate::ULE,
        (BinOpToken::Gtr, true) => IntPredicate::SGT,
        (BinOpToken::Gtr, false) => IntPredicate::UGT,
        (BinOpToken::Geq, true) => IntPredicate::SGE,
        (BinOpToken::Geq, false) => IntPredicate::UGE,
        (other, _) => return Err(format!("not a comparison: {other:?}")),
    })
}

fn zero_of(ty: inkwell::types::BasicTypeEnum<'_>) -> BasicValueEnum<'_> {
    use inkwell::types::BasicTypeEnum as T;
    match ty {
        T::IntType(t) => t.const_zero().into(),
        T::FloatType(t) => t.const_zero().into(),
        T::PointerType(t) => t.const_null().into(),
        T::StructType(t) => t.const_zero().into(),
        T::ArrayType(t) => t.const_zero().into(),
        T::VectorType(t) => t.const_zero().into(),
        T::ScalableVectorType(t) => t.const_zero().into(),
    }
}

/// The `(name, methodTypeSymbol)` rows of an interface's method table, in
/// the interface's sorted method order.
pub fn iface_method_table(def: &InterfaceDef) -> Vec<(String, String)> {
    def.methods
        .iter()
        .map(|m| {
            (
                m.name.clone(),
                symbols::type_symbol(&GoType::Func(Box::new(m.sig.clone()))),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use llgo_ssa::TypeEnv;

    fn setup(ctx: &Context) -> (Program<'_>, PackageEmitter<'_>) {
        let prog = Program::new(ctx, TypeEnv::new(), None).unwrap();
        let pkg = PackageEmitter::new(&prog, "main", "main");
        (prog, pkg)
    }

    fn fn_with_entry<'ctx>(
        prog: &Program<'ctx>,
        pkg: &PackageEmitter<'ctx>,
        name: &str,
    ) -> Rc<Function<'ctx>> {
        let f = pkg
            .new_func(prog, name, Signature::default(), Background::InGo, false)
            .unwrap();
        f.make_blocks(prog, 1);
        f
    }

    #[test]
    fn int_add_emits_native_add() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let one = b.const_int(1, &int, Background::InGo).unwrap();
        let two = b.const_int(2, &int, Background::InGo).unwrap();
        b.binop(BinOpToken::Add, &one, &two).unwrap();
        b.ret(&[]).unwrap();

        // Constant folding may collapse the add; the module must at least
        // verify and keep the block label.
        let ir = pkg.serialize();
        assert!(ir.contains("_llgo_0"), "{ir}");
    }

    #[test]
    fn string_concat_calls_runtime() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let x = b.const_string("a", Background::InGo).unwrap();
        let y = b.const_string("b", Background::InGo).unwrap();
        b.binop(BinOpToken::Add, &x, &y).unwrap();
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("llgo/runtime.StringCat"), "{ir}");
        assert!(prog.need_runtime.get());
    }

    #[test]
    fn index_addr_emits_bounds_check() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let slice_ty = GoType::slice(int.clone());
        let s = b.zero_value(&slice_ty, Background::InGo).unwrap();
        let idx = b.const_int(0, &int, Background::InGo).unwrap();
        b.index_addr(&s, &idx).unwrap();
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("llgo/runtime.PanicIndex"), "{ir}");
        assert!(ir.contains("icmp uge"), "{ir}");
    }

    #[test]
    fn make_interface_of_int_uses_descriptor() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let x = b.const_int(42, &int, Background::InGo).unwrap();
        let boxed = b.make_interface(&GoType::any(), &int, &x).unwrap();
        assert!(matches!(boxed.ty, GoType::Interface(_)));
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("_llgo_int"), "int descriptor must exist: {ir}");
    }

    #[test]
    fn convert_int_to_float_is_signed() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        // A runtime value (load from a slot) so the conversion is not
        // constant-folded away.
        let int = GoType::Basic(BasicKind::Int);
        let slot = b.alloc(&int, false).unwrap();
        let x = b.load(&slot).unwrap();
        let r = b.convert(&GoType::Basic(BasicKind::Float64), &x).unwrap();
        assert_eq!(r.ty, GoType::Basic(BasicKind::Float64));
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("sitofp"), "int is signed: {ir}");
    }

    #[test]
    fn convert_string_to_bytes_calls_runtime() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let s = b.const_string("abc", Background::InGo).unwrap();
        let bytes_ty = GoType::slice(GoType::Basic(BasicKind::Uint8));
        let r = b.convert(&bytes_ty, &s).unwrap();
        assert_eq!(r.ty, bytes_ty);
        b.ret(&[]).unwrap();

        assert!(pkg.serialize().contains("llgo/runtime.StringToBytes"));
    }

    #[test]
    fn map_lookup_comma_ok_yields_value_bool_pair() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let map_ty = GoType::Map {
            key: Box::new(GoType::Basic(BasicKind::Str)),
            value: Box::new(int.clone()),
        };
        let m = b.zero_value(&map_ty, Background::InGo).unwrap();
        let key = b.const_string("k", Background::InGo).unwrap();
        let tuple_ty = GoType::Tuple(vec![int, GoType::Basic(BasicKind::Bool)]);
        let r = b.lookup(&m, &key, true, &tuple_ty).unwrap();
        assert_eq!(r.ty, tuple_ty);
        b.ret(&[]).unwrap();

        assert!(pkg.serialize().contains("llgo/runtime.MapAccess2"));
    }

    #[test]
    fn channel_ops_spill_through_runtime() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let chan_ty = GoType::Chan(Box::new(int.clone()));
        let ch = b.zero_value(&chan_ty, Background::InGo).unwrap();
        let v = b.const_int(9, &int, Background::InGo).unwrap();
        b.send(&ch, &v).unwrap();

        let tuple_ty = GoType::Tuple(vec![int.clone(), GoType::Basic(BasicKind::Bool)]);
        let received = b.recv(&ch, true, &tuple_ty).unwrap();
        assert_eq!(received.ty, tuple_ty);
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("llgo/runtime.ChanSend"), "{ir}");
        assert!(ir.contains("llgo/runtime.ChanRecv2"), "{ir}");
    }

    #[test]
    fn map_iteration_steps_through_runtime() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let map_ty = GoType::Map {
            key: Box::new(GoType::Basic(BasicKind::Str)),
            value: Box::new(int.clone()),
        };
        let m = b.zero_value(&map_ty, Background::InGo).unwrap();
        let it = b.range_iter(&m).unwrap();
        let tuple_ty = GoType::Tuple(vec![
            GoType::Basic(BasicKind::Bool),
            GoType::Basic(BasicKind::Str),
            int,
        ]);
        let step = b.next(&it, false, &tuple_ty).unwrap();
        assert_eq!(step.ty, tuple_ty);
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("llgo/runtime.NewMapIter"), "{ir}");
        assert!(ir.contains("llgo/runtime.MapIterNext"), "{ir}");
    }

    #[test]
    fn type_assert_comma_ok_avoids_panic_helper() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        let int = GoType::Basic(BasicKind::Int);
        let any = GoType::any();
        let x = b.zero_value(&any, Background::InGo).unwrap();
        b.type_assert(&x, &int, true).unwrap();
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        assert!(ir.contains("llgo/runtime.TryAssertType"), "{ir}");
        assert!(!ir.contains("llgo/runtime.AssertType("), "{ir}");
    }

    #[test]
    fn defer_records_replay_in_lifo_order() {
        let ctx = Context::create();
        let (prog, pkg) = setup(&ctx);
        let a = pkg
            .new_func(&prog, "main.A", Signature::default(), Background::InGo, false)
            .unwrap();
        let z = pkg
            .new_func(&prog, "main.B", Signature::default(), Background::InGo, false)
            .unwrap();
        let f = fn_with_entry(&prog, &pkg, "main.f");
        let b = Builder::new(&prog, &pkg, f.clone());
        b.set_block(f.block(0));

        b.add_defer(DeferTarget::Direct(a), vec![], false).unwrap();
        b.add_defer(DeferTarget::Direct(z), vec![], false).unwrap();
        b.run_defers().unwrap();
        b.ret(&[]).unwrap();

        let ir = pkg.serialize();
        let pos_b = ir.find("call void @main.B").expect("B called");
        let pos_a = ir.find("call void @main.A").expect("A called");
        assert!(pos_b < pos_a, "deferred B must run before A:\n{ir}");
    }
}
