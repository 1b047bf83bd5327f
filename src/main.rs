//! CLI entry point.
//!
//! The host accepts no arguments except `--version`; everything else is a
//! usage error. The protocol itself runs over stdin/stdout, so diagnostics
//! go to stderr only.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use stylec::engine::builtin::BuiltinEngine;
use stylec::error::{exit, HostError};
use stylec::{version, Config};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [flag] if flag == "--version" => {
            println!("{}", version::json_report());
            std::process::exit(exit::OK);
        }
        _ => {
            eprintln!("Usage: stylec [--version]");
            eprintln!();
            eprintln!("stylec speaks a length-delimited protobuf protocol over stdin and");
            eprintln!("stdout; it is not intended to be invoked directly.");
            std::process::exit(exit::USAGE);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Internal compiler error: failed to start runtime: {err}");
            std::process::exit(exit::PROTOCOL);
        }
    };

    let result = runtime.block_on(stylec::run(
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        Arc::new(BuiltinEngine),
        Config::from_env(),
    ));

    match result {
        Ok(()) => std::process::exit(exit::OK),
        Err(error) => {
            // Protocol errors already wrote their diagnostic inside `run`.
            if let HostError::Io(err) = &error {
                eprintln!("Internal compiler error: {err}");
            }
            std::process::exit(error.exit_code());
        }
    }
}
