//! Packages, package kinds, and the whole-program container.

use serde::{Deserialize, Serialize};

use crate::func::SsaFunction;
use crate::types::{Background, GoType, TypeEnv};

/// How a package participates in the build, derived from its
/// `LLGoPackage` package-level constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageKind {
    /// An ordinary Go package; fully lowered, `init` runs.
    Normal,
    /// A minimal llgo package (C-linked primitives); fully lowered.
    LLGo,
    /// A Python extension module; globals stay uninitialized and `init`
    /// performs a guarded one-shot module import.
    PyModule(String),
    /// Lowered, but no `init` is generated or called.
    NoInit,
    /// Declarations only; nothing is emitted and no export file exists.
    DeclOnly,
    /// Contributes prebuilt LLVM IR artifacts instead of compiled code.
    LinkIR,
    /// Links an external native library; the payload is the
    /// `;`-separated alternatives list of link flags.
    LinkExtern(String),
}

impl PackageKind {
    /// Parse the `LLGoPackage` constant. Absent means a normal package.
    ///
    /// Recognized forms: `"llgo"`, `"noinit"`, `"decl"`, `"link.ir"`,
    /// `"py.<module>"`, `"link: <flags>"`.
    pub fn parse(constant: Option<&str>) -> PackageKind {
        let Some(raw) = constant else {
            return PackageKind::Normal;
        };
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("link:") {
            return PackageKind::LinkExtern(rest.trim().to_string());
        }
        if let Some(module) = raw.strip_prefix("py.") {
            return PackageKind::PyModule(module.to_string());
        }
        match raw {
            "llgo" => PackageKind::LLGo,
            "noinit" => PackageKind::NoInit,
            "decl" => PackageKind::DeclOnly,
            "link.ir" => PackageKind::LinkIR,
            _ => PackageKind::Normal,
        }
    }

    /// Whether packages of this kind run an `init` function.
    pub fn runs_init(&self) -> bool {
        matches!(self, PackageKind::Normal | PackageKind::LLGo | PackageKind::PyModule(_))
    }
}

/// A named type defined at package level, together with its method set.
///
/// Methods cover both the value and the pointer receiver; each appears as
/// a receiver-mangled [`SsaFunction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub underlying: GoType,
    #[serde(default)]
    pub methods: Vec<SsaFunction>,
}

/// One package-level member. Members are lowered in sorted-by-name order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Member {
    Global {
        name: String,
        ty: GoType,
        background: Background,
    },
    Func(SsaFunction),
    Type(TypeDef),
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Global { name, .. } => name,
            Member::Func(f) => &f.name,
            Member::Type(t) => &t.name,
        }
    }
}

/// One compilation unit delivered by the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsaPackage {
    pub name: String,
    /// Import path; `"main"` for the main package.
    pub path: String,
    /// Raw value of the `LLGoPackage` constant, when declared.
    #[serde(default)]
    pub llgo_package: Option<String>,
    /// Raw value of the `LLGoFiles` constant (C sources compiled
    /// alongside), when declared.
    #[serde(default)]
    pub llgo_files: Option<String>,
    /// Import paths of direct dependencies.
    #[serde(default)]
    pub deps: Vec<String>,
    pub members: Vec<Member>,
}

impl SsaPackage {
    pub fn kind(&self) -> PackageKind {
        PackageKind::parse(self.llgo_package.as_deref())
    }

    /// Members sorted by name, the order they are lowered in.
    pub fn sorted_members(&self) -> Vec<&Member> {
        let mut out: Vec<&Member> = self.members.iter().collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }
}

/// The whole typed program: every package reachable from the build
/// patterns, plus the shared named-type table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SsaProgram {
    pub packages: Vec<SsaPackage>,
    pub types: TypeEnv,
}

impl SsaProgram {
    pub fn package(&self, path: &str) -> Option<&SsaPackage> {
        self.packages.iter().find(|p| p.path == path)
    }
}
