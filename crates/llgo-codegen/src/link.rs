//! Linking via the external C toolchain.
//!
//! clang is the link driver: it accepts textual IR files next to objects
//! and handles platform CRT details. Link-flag strings for external
//! libraries support environment expansion including `$(pkg-config ...)`
//! style subcommand substitution.

use std::path::Path;
use std::process::{Command, Stdio};

use llgo_common::BuildError;

/// Platform-specific linker flags: dead-strip on Darwin, gc-sections plus
/// libpthread elsewhere (libpthread is built into glibc only since 2.34).
pub fn platform_link_args() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["-Xlinker".into(), "-dead_strip".into()]
    } else {
        vec![
            "-Xlinker".into(),
            "--gc-sections".into(),
            "-lpthread".into(),
        ]
    }
}

/// Link the given inputs into an executable at `out`.
///
/// On failure, clang's stderr is reported verbatim together with the
/// failing argument vector.
pub fn link_executable(out: &Path, inputs: &[String], verbose: bool) -> Result<(), BuildError> {
    let mut args: Vec<String> = vec![
        "-o".into(),
        out.display().to_string(),
        "-Wno-override-module".into(),
    ];
    args.extend(platform_link_args());
    args.extend(inputs.iter().cloned());

    if verbose {
        eprintln!("clang {}", args.join(" "));
    }
    let output = Command::new("clang")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BuildError::io("failed to invoke clang", e))?;
    if !output.status.success() {
        return Err(BuildError::Link {
            args,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Compile one textual IR file to an object file.
pub fn compile_ir_to_object(ll: &Path, obj: &Path, verbose: bool) -> Result<(), BuildError> {
    let args = [
        "-o".to_string(),
        obj.display().to_string(),
        "-c".to_string(),
        ll.display().to_string(),
        "-Wno-override-module".to_string(),
    ];
    if verbose {
        eprintln!("clang {}", args.join(" "));
    }
    let output = Command::new("clang")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BuildError::io("failed to invoke clang", e))?;
    if !output.status.success() {
        return Err(BuildError::Link {
            args: args.to_vec(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Sanity-check a textual IR file with `llc`. Failures are reported as a
/// warning by the caller, never fatal.
pub fn llc_check(ll: &Path) -> Result<(), String> {
    let output = Command::new("llc")
        .args(["-filetype=null", &ll.display().to_string()])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to invoke llc: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

/// Resolve a `LinkExtern` parameter: `;`-separated alternatives, each
/// expanded through the environment; the first that expands non-empty
/// wins.
///
/// Example: `$LLGO_LIB_PYTHON; $(pkg-config --libs python3-embed); -lpython3`
pub fn resolve_link_flags(param: &str) -> Result<String, BuildError> {
    for alt in param.split(';') {
        let expanded = expand_env(alt.trim())?;
        let expanded = expanded.trim();
        if !expanded.is_empty() {
            return Ok(normalize_link_flags(expanded));
        }
    }
    Err(BuildError::Usage(format!(
        "'{param}' cannot locate the external library"
    )))
}

/// Turn a resolved value into linker arguments: flag strings pass
/// through, a bare file path becomes `-l<name> -L<dir>`.
fn normalize_link_flags(expanded: &str) -> String {
    if expanded.starts_with('-') {
        return expanded.to_string();
    }
    let path = Path::new(expanded);
    let lib = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| expanded.to_string());
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            format!("-l {lib} -L {}", dir.display())
        }
        _ => format!("-l {lib}"),
    }
}

/// Expand `$VAR`, `${VAR}`, and `$(command args...)` occurrences.
/// Undefined variables expand to nothing; a failing subcommand is an
/// error.
pub fn expand_env(s: &str) -> Result<String, BuildError> {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        if i + 1 < bytes.len() && bytes[i + 1] == b'(' {
            let close = find_closing(&bytes[i + 2..])
                .ok_or_else(|| BuildError::Usage(format!("unbalanced $( in '{s}'")))?;
            let cmdline = &s[i + 2..i + 2 + close];
            out.push_str(&run_subcommand(cmdline)?);
            i += 2 + close + 1;
            continue;
        }
        if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let close = s[i + 2..]
                .find('}')
                .ok_or_else(|| BuildError::Usage(format!("unbalanced ${{ in '{s}'")))?;
            let name = &s[i + 2..i + 2 + close];
            out.push_str(&std::env::var(name).unwrap_or_default());
            i += 2 + close + 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end == start {
            out.push('$');
            i += 1;
            continue;
        }
        out.push_str(&std::env::var(&s[start..end]).unwrap_or_default());
        i = end;
    }
    Ok(out)
}

fn find_closing(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn run_subcommand(cmdline: &str) -> Result<String, BuildError> {
    let mut parts = cmdline.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(String::new());
    };
    let output = Command::new(cmd)
        .args(parts)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BuildError::io(format!("failed to run {cmd}"), e))?;
    if !output.status.success() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Probe that a resolved link-flag set actually links: compile an empty
/// main against it.
pub fn check_link_args(flags: &str) -> Result<(), String> {
    let dir = std::env::temp_dir();
    let probe_src = dir.join(format!("llgo-link-probe-{}.c", std::process::id()));
    let probe_bin = dir.join(format!("llgo-link-probe-{}", std::process::id()));
    std::fs::write(&probe_src, "int main(void) { return 0; }\n")
        .map_err(|e| format!("cannot write link probe: {e}"))?;

    let mut args: Vec<String> = vec![
        probe_src.display().to_string(),
        "-o".into(),
        probe_bin.display().to_string(),
    ];
    args.extend(flags.split_whitespace().map(|s| s.to_string()));
    let output = Command::new("clang")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to invoke clang: {e}"))?;
    std::fs::remove_file(&probe_src).ok();
    std::fs::remove_file(&probe_bin).ok();
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}
