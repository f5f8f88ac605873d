//! The llgo command: compile Go programs to native executables through
//! LLVM, bypassing the standard Go toolchain's runtime.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use llgoc::build::{self, Config, Mode};

#[derive(Parser)]
#[command(name = "llgo", about = "A Go compiler based on LLVM", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compile the packages named by the patterns, without linking
    Build(BuildCmd),
    /// Compile and install the resulting binary into GOBIN
    Install(BuildCmd),
    /// Compile and run a Go program
    Run(RunCmd),
    /// Compile with llgo and go, run both, and diff stdout/stderr/exit code
    Cmptest(RunCmd),
    /// Remove build artifacts
    Clean,
}

#[derive(Args, Clone)]
struct BuildFlags {
    /// Change to dir before running the command
    #[arg(short = 'C', value_name = "dir")]
    chdir: Option<PathBuf>,
    /// Force rebuilding of packages that are already up-to-date
    #[arg(short = 'a')]
    force_rebuild: bool,
    /// Print the commands but do not run them
    #[arg(short = 'n')]
    dry_run: bool,
    /// The number of programs to run in parallel
    #[arg(short = 'p', value_name = "n")]
    parallel: Option<u32>,
    /// Enable data race detection
    #[arg(long)]
    race: bool,
    /// Enable coverage analysis
    #[arg(long)]
    cover: bool,
    /// Set the mode for coverage analysis
    #[arg(long, value_name = "mode")]
    covermode: Option<String>,
    /// Print the names of packages as they are compiled
    #[arg(short = 'v')]
    verbose: bool,
    /// Print the name of the temporary work directory and keep it
    #[arg(long)]
    work: bool,
    /// Print the commands
    #[arg(short = 'x')]
    print_commands: bool,
    /// A comma-separated list of build tags
    #[arg(long, value_name = "list")]
    tags: Option<String>,
    /// Install and load all packages from dir
    #[arg(long, value_name = "dir")]
    pkgdir: Option<PathBuf>,
    /// Arguments to pass on each linker invocation
    #[arg(long, value_name = "flags")]
    ldflags: Option<String>,
    /// Write the resulting binary to the named file
    #[arg(short = 'o', value_name = "file")]
    output: Option<PathBuf>,
    /// Keep generated .ll files in the current directory
    #[arg(long = "gen-ll")]
    gen_ll: bool,
    /// Sanity-check emitted IR with llc
    #[arg(long = "check-ll")]
    check_ll: bool,
}

#[derive(Args)]
struct BuildCmd {
    #[command(flatten)]
    flags: BuildFlags,
    /// Package patterns or .ssa.json inputs
    patterns: Vec<String>,
}

#[derive(Args)]
struct RunCmd {
    #[command(flatten)]
    flags: BuildFlags,
    /// The package pattern or .ssa.json input to run
    package: String,
    /// Arguments forwarded to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn config_from(flags: &BuildFlags, mode: Mode) -> Result<Config, llgo_common::BuildError> {
    if let Some(dir) = &flags.chdir {
        std::env::set_current_dir(dir).map_err(|e| {
            llgo_common::BuildError::io(format!("cannot chdir to {}", dir.display()), e)
        })?;
    }
    let mut conf = Config::new(mode);
    conf.out_file = flags.output.clone();
    conf.verbose = flags.verbose || flags.print_commands;
    conf.gen_ll = flags.gen_ll;
    conf.check_ll = flags.check_ll;
    Ok(conf)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Cmd::Build(cmd) => config_from(&cmd.flags, Mode::Build)
            .and_then(|conf| build::run(&cmd.patterns, conf)),
        Cmd::Install(cmd) => config_from(&cmd.flags, Mode::Install)
            .and_then(|conf| build::run(&cmd.patterns, conf)),
        Cmd::Run(cmd) => config_from(&cmd.flags, Mode::Run).and_then(|mut conf| {
            conf.run_args = cmd.args.clone();
            build::run(std::slice::from_ref(&cmd.package), conf)
        }),
        Cmd::Cmptest(cmd) => config_from(&cmd.flags, Mode::CmpTest).and_then(|mut conf| {
            conf.run_args = cmd.args.clone();
            build::run(std::slice::from_ref(&cmd.package), conf)
        }),
        Cmd::Clean => build::clean(),
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code().clamp(0, 255) as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_flags_parse() {
        let cli = Cli::try_parse_from([
            "llgo", "build", "-v", "-o", "out/app", "--tags", "netgo", "./pkg",
        ])
        .unwrap();
        let Cmd::Build(cmd) = cli.command else {
            panic!("expected build subcommand");
        };
        assert!(cmd.flags.verbose);
        assert_eq!(cmd.flags.output, Some(PathBuf::from("out/app")));
        assert_eq!(cmd.flags.tags.as_deref(), Some("netgo"));
        assert_eq!(cmd.patterns, vec!["./pkg"]);
    }

    #[test]
    fn run_collects_trailing_program_args() {
        let cli =
            Cli::try_parse_from(["llgo", "run", "./app", "--", "-x", "hello"]).unwrap();
        let Cmd::Run(cmd) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(cmd.package, "./app");
        assert!(cmd.args.contains(&"hello".to_string()));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(Cli::try_parse_from(["llgo", "build", "--frobnicate"]).is_err());
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["llgo", "explode"]).is_err());
    }
}
