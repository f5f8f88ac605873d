use std::fmt;
use std::io;

/// A build failure, classified by how it is reported and which exit code
/// the process terminates with.
///
/// Usage errors abort with exit code 2, everything else with exit code 1.
/// Recoverable degradations (a bitcode file that fails to parse, a skipped
/// optimization pass) are not errors at all; they are printed as
/// `warning:` lines and compilation continues.
#[derive(Debug)]
pub enum BuildError {
    /// Bad flags, unknown subcommand, missing inputs, unresolvable link
    /// library. One-line diagnostic, exit code 2.
    Usage(String),
    /// A package failed to compile: unknown SSA instruction, unmirrorable
    /// type, missing symbol. Fatal; no artifact is produced for the
    /// package. Exit code 1.
    Compile {
        pkg: String,
        func: Option<String>,
        detail: String,
    },
    /// The external C compiler failed. Carries clang's stderr verbatim and
    /// the failing argument vector. Exit code 1.
    Link { args: Vec<String>, stderr: String },
    /// An I/O failure while reading inputs or writing artifacts.
    /// Exit code 1.
    Io { context: String, source: io::Error },
}

impl BuildError {
    /// Create a compile error without function context.
    pub fn compile(pkg: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Compile {
            pkg: pkg.into(),
            func: None,
            detail: detail.into(),
        }
    }

    /// Create a compile error naming the function being lowered.
    pub fn compile_in(
        pkg: impl Into<String>,
        func: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Compile {
            pkg: pkg.into(),
            func: Some(func.into()),
            detail: detail.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(msg) => write!(f, "llgo: {msg}"),
            Self::Compile { pkg, func, detail } => match func {
                Some(func) => write!(f, "{pkg}: {func}: {detail}"),
                None => write!(f, "{pkg}: {detail}"),
            },
            Self::Link { args, stderr } => {
                write!(f, "link failed: clang {}\n{}", args.join(" "), stderr)
            }
            Self::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
