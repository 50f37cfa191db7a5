//! Storage-engine command builder
//!
//! Each operation type is configured through a fluent builder, validated by
//! a list of named predicates and then assembled into a [`CommandLine`]: a
//! pipeline of discrete argument vectors that is never passed through a
//! shell. Validation failures surface as [`Error::Validation`] before any
//! command exists; failures of a command that ran surface as
//! [`Error::CommandFailed`] with the captured output.

mod destroy;
mod pool_add;
mod pool_status;
mod runner;
mod snapshot;

pub use destroy::VolumeDestroy;
pub use pool_add::PoolExpansion;
pub use pool_status::PoolStatus;
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use snapshot::{SnapshotOperation, VolumeSnapshot};

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::validation::{is_safe_token, run_checks, Predicate, ValidationReport};

/// Dataset management binary
pub const ZFS: &str = "zfs";
/// Pool management binary
pub const ZPOOL: &str = "zpool";
/// Network transfer binary used to stream snapshots
pub const NC: &str = "nc";

/// One process of a pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
}

impl Stage {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn arg_if(self, cond: bool, arg: &str) -> Self {
        if cond {
            self.arg(arg)
        } else {
            self
        }
    }
}

/// A built command: one storage-engine stage, optionally piped to or from
/// a transfer stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    stages: Vec<Stage>,
    engine: usize,
}

impl CommandLine {
    fn single(engine: Stage) -> Self {
        Self {
            stages: vec![engine],
            engine: 0,
        }
    }

    fn piped_to(engine: Stage, downstream: Stage) -> Self {
        Self {
            stages: vec![engine, downstream],
            engine: 0,
        }
    }

    fn piped_from(upstream: Stage, engine: Stage) -> Self {
        Self {
            stages: vec![upstream, engine],
            engine: 1,
        }
    }

    /// Stages in pipeline order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The storage-engine stage
    pub fn engine(&self) -> &Stage {
        &self.stages[self.engine]
    }

    /// Full pipeline including program names, for logs and errors
    pub fn pipeline(&self) -> String {
        self.stages
            .iter()
            .map(|s| {
                std::iter::once(s.program.as_str())
                    .chain(s.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Engine arguments without the binary name; other stages are shown in full
impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if i == self.engine {
                    s.args.join(" ")
                } else {
                    std::iter::once(s.program.clone())
                        .chain(s.args.iter().cloned())
                        .collect::<Vec<_>>()
                        .join(" ")
                }
            })
            .collect();
        f.write_str(&rendered.join(" | "))
    }
}

/// `host:port` of the peer that streams snapshot data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`; IPv6 hosts may be bracketed (`[::1]:9000`)
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || {
            Error::Validation(ValidationReport {
                subject: "peer address",
                violations: vec!["address is host:port"],
            })
        };
        let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if !is_safe_token(host) || port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }

    fn nc_stage(&self) -> Stage {
        Stage::new(NC).arg(self.host.clone()).arg(self.port.to_string())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A configured storage-engine operation
pub trait CommandSpec: Sized {
    /// Operation name used in validation reports
    fn operation(&self) -> &'static str;

    /// Built-in predicates followed by caller-supplied ones
    fn checks(&self) -> Vec<Predicate<Self>>;

    /// Assemble the command; only called after validation passed
    fn assemble(&self) -> CommandLine;

    /// Run every predicate and report all that fail
    fn validate(&self) -> std::result::Result<(), ValidationReport> {
        run_checks(self.operation(), self, &self.checks())
    }

    /// Validate, then assemble
    fn build(&self) -> Result<CommandLine> {
        self.validate()?;
        Ok(self.assemble())
    }
}

/// Build a command and run it through `runner`
pub async fn execute<C: CommandSpec>(spec: &C, runner: &dyn CommandRunner) -> Result<CommandOutput> {
    let command = spec.build()?;
    debug!(command = %command.pipeline(), "Executing storage command");
    runner.run(&command).await
}

/// `key=value` properties passed with `-o`
fn property_args(stage: Stage, properties: &[(String, String)]) -> Stage {
    properties
        .iter()
        .fold(stage, |s, (k, v)| s.arg("-o").arg(format!("{}={}", k, v)))
}

fn properties_are_safe(properties: &[(String, String)]) -> bool {
    properties
        .iter()
        .all(|(k, v)| is_safe_token(k) && !k.contains('=') && !v.contains('\0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_addresses() {
        assert_eq!(
            PeerAddress::parse("10.0.0.5:9000").unwrap(),
            PeerAddress::new("10.0.0.5", 9000)
        );
        assert_eq!(PeerAddress::parse("[fd00::1]:9000").unwrap().host, "fd00::1");
        for bad in ["10.0.0.5", "10.0.0.5:port", ":9000", "-e:9000", "host:0"] {
            assert!(PeerAddress::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn pipeline_includes_program_names() {
        let cmd = CommandLine::piped_to(
            Stage::new(ZFS).arg("send").arg("p/v@s"),
            PeerAddress::new("h", 1).nc_stage(),
        );
        assert_eq!(cmd.pipeline(), "zfs send p/v@s | nc h 1");
        assert_eq!(cmd.to_string(), "send p/v@s | nc h 1");
    }
}
