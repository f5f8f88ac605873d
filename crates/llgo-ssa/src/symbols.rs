//! Symbol naming rules shared by the emitter and the late lowering pass.
//!
//! Everything that crosses a module boundary is identified by a mangled
//! string symbol; this module is the single source of truth for those
//! formats.

use crate::types::{GoType, Signature};

/// Import path of the runtime package the emitter targets.
pub const PKG_RUNTIME: &str = "llgo/runtime";

/// Import path of the Python bridge package.
pub const PKG_PYTHON: &str = "llgo/py";

/// Prefix under which patch (alternate) packages live.
pub const PATCH_PATH_PREFIX: &str = "llgo/internal/lib/";

/// The variadic-tail parameter introduced by Go-ABI variadic signatures.
pub const NAME_VALIST: &str = "__llgo_va_list";

/// Well-known globals the `main` prelude stores argc/argv into.
pub const NAME_ARGC: &str = "__llgo_argc";
pub const NAME_ARGV: &str = "__llgo_argv";

/// Prefix of Python module variables (`__llgo_py.<module>`).
pub const PY_SYM_PREFIX: &str = "__llgo_py.";

/// Prefix of interface-invoke thunks.
pub const INVOKE_THUNK_PREFIX: &str = "__llgo_invoke.";

/// The symbol of the runtime initializer called at the top of `main`.
pub fn runtime_init() -> String {
    format!("{PKG_RUNTIME}.init")
}

/// The symbol of the runtime helper that extracts an interface's data
/// pointer; used by synthesized invoke thunks.
pub fn iface_ptr_data() -> String {
    format!("{PKG_RUNTIME}.IfacePtrData")
}

/// Full symbol of a package-level name: `<path>.<name>`. The main
/// package's `main` is the C entry point and keeps the bare name.
pub fn full_name(pkg_path: &str, name: &str) -> String {
    if pkg_path == "main" && name == "main" {
        return "main".to_string();
    }
    format!("{pkg_path}.{name}")
}

/// The renamed symbol an original `init` keeps when its package is
/// patched, so the patch's `init` can bridge to it.
pub fn init_fn_name_of_has_patch(name: &str) -> String {
    format!("{name}$hasPatch")
}

/// Label of the i-th basic block of a function.
pub fn block_label(index: usize) -> String {
    format!("_llgo_{index}")
}

/// The ABI symbol of a type descriptor global.
pub fn type_symbol(ty: &GoType) -> String {
    format!("_llgo_{}", ty.key())
}

/// Name of an interface-invoke thunk:
/// `__llgo_invoke.<ifaceSym>$m<index>.<sigTag>`.
pub fn invoke_thunk_name(iface_sym: &str, method_index: u32, sig: &Signature) -> String {
    format!(
        "{INVOKE_THUNK_PREFIX}{iface_sym}$m{method_index}.{}",
        signature_tag(sig)
    )
}

/// Parse an invoke thunk name back into `(ifaceSym, methodIndex)`.
/// Returns `None` for anything that does not match the format exactly.
pub fn parse_invoke_thunk_name(name: &str) -> Option<(&str, u32)> {
    let rest = name.strip_prefix(INVOKE_THUNK_PREFIX)?;
    // The signature tag is the final dot-separated token and contains no
    // dots itself; the interface symbol may contain dots freely.
    let dot = rest.rfind('.')?;
    let (head, tag) = (&rest[..dot], &rest[dot + 1..]);
    if tag.is_empty() || tag.contains('.') {
        return None;
    }
    let marker = head.rfind("$m")?;
    let (iface_sym, digits) = (&head[..marker], &head[marker + 2..]);
    if iface_sym.is_empty() || digits.is_empty() {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    Some((iface_sym, index))
}

/// A short, dot-free tag identifying a signature; FNV-1a over the
/// canonical signature key.
pub fn signature_tag(sig: &Signature) -> String {
    let key = GoType::Func(Box::new(sig.clone())).key();
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in key.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// Whether a symbol name is internal machinery never lowered as a package
/// member (cgo shims and the like).
pub fn ignore_name(name: &str) -> bool {
    name.starts_with("_cgo_") || name.contains("._cgo_") || name.starts_with("_Cgo_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BasicKind, Param};

    fn sig_str() -> Signature {
        Signature {
            recv: None,
            params: vec![],
            results: vec![GoType::Basic(BasicKind::Str)],
            variadic: false,
        }
    }

    #[test]
    fn full_names() {
        assert_eq!(full_name("main", "main"), "main");
        assert_eq!(full_name("main", "init"), "main.init");
        assert_eq!(full_name("llgo/runtime", "init"), "llgo/runtime.init");
        assert_eq!(
            init_fn_name_of_has_patch("errors.init"),
            "errors.init$hasPatch"
        );
    }

    #[test]
    fn block_labels_are_indexed() {
        assert_eq!(block_label(0), "_llgo_0");
        assert_eq!(block_label(17), "_llgo_17");
    }

    #[test]
    fn thunk_name_round_trips() {
        let sig = sig_str();
        let name = invoke_thunk_name("_llgo_main.Animal", 0, &sig);
        assert!(name.starts_with("__llgo_invoke._llgo_main.Animal$m0."));
        let (iface, idx) = parse_invoke_thunk_name(&name).expect("must parse");
        assert_eq!(iface, "_llgo_main.Animal");
        assert_eq!(idx, 0);
    }

    #[test]
    fn thunk_name_with_dotted_iface_symbol() {
        let sig = sig_str();
        let name = invoke_thunk_name("_llgo_a/b.c.Iface", 12, &sig);
        let (iface, idx) = parse_invoke_thunk_name(&name).expect("must parse");
        assert_eq!(iface, "_llgo_a/b.c.Iface");
        assert_eq!(idx, 12);
    }

    #[test]
    fn malformed_thunk_names_rejected() {
        assert!(parse_invoke_thunk_name("__llgo_invoke.").is_none());
        assert!(parse_invoke_thunk_name("__llgo_invoke.X$m.tag").is_none());
        assert!(parse_invoke_thunk_name("__llgo_invoke.X$m1").is_none());
        assert!(parse_invoke_thunk_name("not_a_thunk").is_none());
        assert!(parse_invoke_thunk_name("__llgo_invoke.X$mABC.tag").is_none());
    }

    #[test]
    fn signature_tags_differ_by_signature() {
        let a = sig_str();
        let b = Signature {
            recv: None,
            params: vec![Param { name: "n".into(), ty: GoType::Basic(BasicKind::Int) }],
            results: vec![],
            variadic: false,
        };
        assert_ne!(signature_tag(&a), signature_tag(&b));
        assert!(!signature_tag(&a).contains('.'));
    }

    #[test]
    fn cgo_names_ignored() {
        assert!(ignore_name("_cgo_init"));
        assert!(!ignore_name("main"));
    }
}
