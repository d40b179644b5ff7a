// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod config;
mod web;

fn parse_app_root() -> impl Parser<PathBuf> {
    bpaf::long("app-root")
        .help("Application root directory (holds video/, config/, logs/).")
        .argument::<PathBuf>("PATH")
        .fallback(PathBuf::from("."))
        .debug_fallback()
}

/// Lays out a fresh application root.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
struct InitArgs {
    #[bpaf(external(parse_app_root))]
    app_root: PathBuf,
}

/// Opens every configured camera's storage read-only and reports failures.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
struct CheckArgs {
    #[bpaf(external(parse_app_root))]
    app_root: PathBuf,
}

/// Runs the recording and query daemon until a shutdown signal arrives.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
struct RunArgs {
    #[bpaf(external(parse_app_root))]
    app_root: PathBuf,
}

/// Vigil NVR: security camera network video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options)]
enum Args {
    Init(#[bpaf(external(init_args))] InitArgs),
    Check(#[bpaf(external(check_args))] CheckArgs),
    Run(#[bpaf(external(run_args))] RunArgs),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Init(a) => {
                cmds::init::run(&a.app_root)?;
                Ok(0)
            }
            Args::Check(a) => cmds::check::run(&a.app_root),
            Args::Run(a) => cmds::run::run(&a.app_root),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
