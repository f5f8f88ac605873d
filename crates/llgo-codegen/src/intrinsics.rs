//! Runtime function declarations.
//!
//! The emitter calls the runtime by name; this module is the single table
//! of those symbols and their signatures. Declarations are added to a
//! module on first use, and requesting one raises the program's
//! `need_runtime` flag (or `need_py_init` for the Python bridge), which is
//! what later tells the orchestrator to link the runtime IR.
//!
//! Signatures must match the runtime package's public declarations
//! exactly; strings are `{ptr, len}`, slices `{ptr, len, cap}`, interface
//! values `{itab, data}`.

use inkwell::module::{Linkage, Module};
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::values::FunctionValue;
use inkwell::AddressSpace;

use crate::program::Program;

/// The runtime helpers the emitter may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtFn {
    /// `init()`: runtime bring-up, called once at the top of `main`.
    Init,
    /// `AllocZ(size) -> ptr`: zeroed heap allocation.
    AllocZ,
    /// `AllocU(size) -> ptr`: uninitialized heap allocation.
    AllocU,
    /// `Panic(v any)`: run the panic machinery; does not return.
    Panic,
    /// `Recover() -> any`.
    Recover,
    /// `Go(fn ptr, ctx ptr)`: spawn a goroutine.
    Go,
    /// `NewMap(reserve) -> ptr`.
    NewMap,
    /// `MapLen(m) -> int`.
    MapLen,
    /// `MapAssign(m, key ptr) -> ptr`: slot to store the value into.
    MapAssign,
    /// `MapAccess1(m, key ptr) -> ptr`: zero-value slot when missing.
    MapAccess1,
    /// `MapAccess2(m, key ptr, out ptr) -> bool`.
    MapAccess2,
    /// `NewMapIter(m) -> ptr`.
    NewMapIter,
    /// `MapIterNext(it, kout ptr, vout ptr) -> bool`.
    MapIterNext,
    /// `NewStringIter(s) -> ptr`.
    NewStringIter,
    /// `StringIterNext(it, iout ptr, rout ptr) -> bool`.
    StringIterNext,
    /// `ChanSend(ch, elem ptr)`.
    ChanSend,
    /// `ChanRecv(ch, out ptr)`.
    ChanRecv,
    /// `ChanRecv2(ch, out ptr) -> bool`.
    ChanRecv2,
    /// `StringCat(a, b) -> string`.
    StringCat,
    /// `StringCmp(a, b) -> int32`: memcmp ordering.
    StringCmp,
    /// `StringToBytes(s) -> []byte`.
    StringToBytes,
    /// `BytesToString(b) -> string`.
    BytesToString,
    /// `RuneToString(r) -> string`.
    RuneToString,
    /// `IfaceEqual(a, b any) -> bool`.
    IfaceEqual,
    /// `NewItab(tdesc ptr, idesc ptr) -> ptr`: cached itab lookup.
    NewItab,
    /// `ChangeIface(i any, idesc ptr) -> any`: interface upcast.
    ChangeIface,
    /// `AssertType(i any, tdesc ptr, out ptr)`: panics on mismatch.
    AssertType,
    /// `TryAssertType(i any, tdesc ptr, out ptr) -> bool`.
    TryAssertType,
    /// `AssertIface(i any, idesc ptr) -> any`: panics on mismatch.
    AssertIface,
    /// `TryAssertIface(i any, idesc ptr, out ptr) -> bool`.
    TryAssertIface,
    /// `Append(dst slice, src slice, elem_size) -> slice`.
    Append,
    /// `SliceCopy(dst slice, src slice, elem_size) -> int`.
    SliceCopy,
    /// `Println(args []any)`.
    Println,
    /// `Print(args []any)`.
    Print,
    /// `IfacePtrData(i any) -> ptr`: the data word as a pointer.
    IfacePtrData,
    /// `PanicIndex()`: index out of range; does not return.
    PanicIndex,
    /// `PanicSlice()`: slice bounds out of range; does not return.
    PanicSlice,
}

impl RtFn {
    fn name(self) -> &'static str {
        match self {
            RtFn::Init => "init",
            RtFn::AllocZ => "AllocZ",
            RtFn::AllocU => "AllocU",
            RtFn::Panic => "Panic",
            RtFn::Recover => "Recover",
            RtFn::Go => "Go",
            RtFn::NewMap => "NewMap",
            RtFn::MapLen => "MapLen",
            RtFn::MapAssign => "MapAssign",
            RtFn::MapAccess1 => "MapAccess1",
            RtFn::MapAccess2 => "MapAccess2",
            RtFn::NewMapIter => "NewMapIter",
            RtFn::MapIterNext => "MapIterNext",
            RtFn::NewStringIter => "NewStringIter",
            RtFn::StringIterNext => "StringIterNext",
            RtFn::ChanSend => "ChanSend",
            RtFn::ChanRecv => "ChanRecv",
            RtFn::ChanRecv2 => "ChanRecv2",
            RtFn::StringCat => "StringCat",
            RtFn::StringCmp => "StringCmp",
            RtFn::StringToBytes => "StringToBytes",
            RtFn::BytesToString => "BytesToString",
            RtFn::RuneToString => "RuneToString",
            RtFn::IfaceEqual => "IfaceEqual",
            RtFn::NewItab => "NewItab",
            RtFn::ChangeIface => "ChangeIface",
            RtFn::AssertType => "AssertType",
            RtFn::TryAssertType => "TryAssertType",
            RtFn::AssertIface => "AssertIface",
            RtFn::TryAssertIface => "TryAssertIface",
            RtFn::Append => "Append",
            RtFn::SliceCopy => "SliceCopy",
            RtFn::Println => "Println",
            RtFn::Print => "Print",
            RtFn::IfacePtrData => "IfacePtrData",
            RtFn::PanicIndex => "PanicIndex",
            RtFn::PanicSlice => "PanicSlice",
        }
    }
}

/// Get (declaring on first use) a runtime helper in `module`, raising the
/// program's `need_runtime` flag.
pub fn runtime_fn<'ctx>(
    prog: &Program<'ctx>,
    module: &Module<'ctx>,
    f: RtFn,
) -> FunctionValue<'ctx> {
    prog.need_runtime.set(true);
    let sym = format!("{}.{}", prog.runtime_pkg(), f.name());
    if let Some(existing) = module.get_function(&sym) {
        return existing;
    }

    let ctx = prog.context();
    let void = ctx.void_type();
    let bool_ty = ctx.bool_type();
    let i32_ty = ctx.i32_type();
    let int = prog.int_type();
    let ptr = ctx.ptr_type(AddressSpace::default());
    let string = prog.string_type();
    let slice = prog.slice_type();
    let iface = prog.iface_type();

    let p_ptr: BasicMetadataTypeEnum = ptr.into();
    let p_int: BasicMetadataTypeEnum = int.into();
    let p_str: BasicMetadataTypeEnum = string.into();
    let p_slice: BasicMetadataTypeEnum = slice.into();
    let p_iface: BasicMetadataTypeEnum = iface.into();

    let fn_ty = match f {
        RtFn::Init => void.fn_type(&[], false),
        RtFn::AllocZ | RtFn::AllocU => ptr.fn_type(&[p_int], false),
        RtFn::Panic => void.fn_type(&[p_iface], false),
        RtFn::Recover => iface.fn_type(&[], false),
        RtFn::Go => void.fn_type(&[p_ptr, p_ptr], false),
        RtFn::NewMap => ptr.fn_type(&[p_int], false),
        RtFn::MapLen => int.fn_type(&[p_ptr], false),
        RtFn::MapAssign | RtFn::MapAccess1 => ptr.fn_type(&[p_ptr, p_ptr], false),
        RtFn::MapAccess2 => bool_ty.fn_type(&[p_ptr, p_ptr, p_ptr], false),
        RtFn::NewMapIter => ptr.fn_type(&[p_ptr], false),
        RtFn::MapIterNext => bool_ty.fn_type(&[p_ptr, p_ptr, p_ptr], false),
        RtFn::NewStringIter => ptr.fn_type(&[p_str], false),
        RtFn::StringIterNext => bool_ty.fn_type(&[p_ptr, p_ptr, p_ptr], false),
        RtFn::ChanSend => void.fn_type(&[p_ptr, p_ptr], false),
        RtFn::ChanRecv => void.fn_type(&[p_ptr, p_ptr], false),
        RtFn::ChanRecv2 => bool_ty.fn_type(&[p_ptr, p_ptr], false),
        RtFn::StringCat => string.fn_type(&[p_str, p_str], false),
        RtFn::StringCmp => i32_ty.fn_type(&[p_str, p_str], false),
        RtFn::StringToBytes => slice.fn_type(&[p_str], false),
        RtFn::BytesToString => string.fn_type(&[p_slice], false),
        RtFn::RuneToString => string.fn_type(&[i32_ty.into()], false),
        RtFn::IfaceEqual => bool_ty.fn_type(&[p_iface, p_iface], false),
        RtFn::NewItab => ptr.fn_type(&[p_ptr, p_ptr], false),
        RtFn::ChangeIface => iface.fn_type(&[p_iface, p_ptr], false),
        RtFn::AssertType => void.fn_type(&[p_iface, p_ptr, p_ptr], false),
        RtFn::TryAssertType => bool_ty.fn_type(&[p_iface, p_ptr, p_ptr], false),
        RtFn::AssertIface => iface.fn_type(&[p_iface, p_ptr], false),
        RtFn::TryAssertIface => bool_ty.fn_type(&[p_iface, p_ptr, p_ptr], false),
        RtFn::Append => slice.fn_type(&[p_slice, p_slice, p_int], false),
        RtFn::SliceCopy => int.fn_type(&[p_slice, p_slice, p_int], false),
        RtFn::Println | RtFn::Print => void.fn_type(&[p_slice], false),
        RtFn::IfacePtrData => ptr.fn_type(&[p_iface], false),
        RtFn::PanicIndex | RtFn::PanicSlice => void.fn_type(&[], false),
    };
    module.add_function(&sym, fn_ty, Some(Linkage::External))
}

/// The Python bridge helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyFn {
    /// `Init()`: interpreter bring-up.
    Init,
    /// `ImportModule(name cstr) -> ptr`.
    ImportModule,
    /// `List(n, ...) -> ptr`: build a Python list from C varargs.
    List,
}

/// Get (declaring on first use) a Python bridge helper, raising the
/// program's `need_py_init` flag.
pub fn py_fn<'ctx>(prog: &Program<'ctx>, module: &Module<'ctx>, f: PyFn) -> FunctionValue<'ctx> {
    prog.need_py_init.set(true);
    let (name, is_varargs) = match f {
        PyFn::Init => ("Init", false),
        PyFn::ImportModule => ("ImportModule", false),
        PyFn::List => ("List", true),
    };
    let sym = format!("{}.{name}", prog.python_pkg());
    if let Some(existing) = module.get_function(&sym) {
        return existing;
    }
    let ctx = prog.context();
    let ptr = ctx.ptr_type(AddressSpace::default());
    let fn_ty = match f {
        PyFn::Init => ctx.void_type().fn_type(&[], false),
        PyFn::ImportModule => ptr.fn_type(&[ptr.into()], false),
        PyFn::List => ptr.fn_type(&[prog.int_type().into()], is_varargs),
    };
    module.add_function(&sym, fn_ty, Some(Linkage::External))
}
