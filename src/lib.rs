//! Embedded stylesheet compiler host.
//!
//! A long-running process that speaks a length-delimited protobuf protocol
//! over stdin/stdout, multiplexing concurrent compilations onto a bounded
//! pool of worker threads. Each compilation may call back into the host —
//! importer resolution, file lookup, custom functions, log events — while
//! the root dispatcher keeps per-compilation ordering intact.

pub mod engine;
pub mod error;
pub mod message;
pub mod varint;

mod dispatcher;
mod pool;
mod worker;

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/embedded.rs"));
}

pub use dispatcher::run;
pub use pool::MAX_CONCURRENT_COMPILATIONS;

/// Host configuration.
///
/// The process surface permits no CLI arguments beyond `--version`, so
/// configuration is read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Whether in-flight compilations are drained after stdin closes.
    /// When unset the host exits immediately, abandoning them.
    pub drain_on_eof: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            drain_on_eof: env_flag("STYLEC_DRAIN_ON_EOF"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build-time version constants and the version-request service.
pub mod version {
    use serde::Serialize;

    use crate::proto;

    pub const PROTOCOL_VERSION: &str = "3.2.0";
    pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const IMPLEMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const IMPLEMENTATION_NAME: &str = "stylec";

    pub fn response(id: u32) -> proto::VersionResponse {
        proto::VersionResponse {
            id,
            protocol_version: PROTOCOL_VERSION.to_string(),
            compiler_version: COMPILER_VERSION.to_string(),
            implementation_version: IMPLEMENTATION_VERSION.to_string(),
            implementation_name: IMPLEMENTATION_NAME.to_string(),
        }
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct VersionReport {
        id: u32,
        protocol_version: &'static str,
        compiler_version: &'static str,
        implementation_version: &'static str,
        implementation_name: &'static str,
    }

    /// The `--version` report: the version response in proto3 JSON form.
    pub fn json_report() -> String {
        let report = VersionReport {
            id: 0,
            protocol_version: PROTOCOL_VERSION,
            compiler_version: COMPILER_VERSION,
            implementation_version: IMPLEMENTATION_VERSION,
            implementation_name: IMPLEMENTATION_NAME,
        };
        serde_json::to_string_pretty(&report).expect("version report serializes")
    }

}
