//! Build instructions.
//!
//! Every instruction kind the descriptor supports is a variant of the closed
//! [`Instruction`] enum. Consumers (executor, packager) match exhaustively, so
//! adding a kind is a compile-time checked change.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single parsed instruction. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `COPY [--from=<stage>] <src>... <dest>`
    Copy(CopyInstruction),
    /// `RUN <command>`
    Run(Command),
    /// `ENV <key>=<value>...`
    Env(Vec<(String, String)>),
    /// `USER <user>[:<group>]`
    User(String),
    /// `WORKDIR <path>`
    Workdir(String),
    /// `HEALTHCHECK ...`
    Healthcheck(Healthcheck),
    /// `ENTRYPOINT <command>`
    Entrypoint(Command),
    /// `CMD <command>`
    Cmd(Command),
    /// `EXPOSE <port>[/<protocol>]...`
    Expose(Vec<PortSpec>),
    /// `LABEL <key>=<value>...`
    Label(Vec<(String, String)>),
}

impl Instruction {
    /// Returns true if the instruction changes the filesystem and therefore
    /// produces a layer.
    #[must_use]
    pub const fn is_filesystem(&self) -> bool {
        match self {
            Self::Copy(_) | Self::Run(_) => true,
            Self::Env(_)
            | Self::User(_)
            | Self::Workdir(_)
            | Self::Healthcheck(_)
            | Self::Entrypoint(_)
            | Self::Cmd(_)
            | Self::Expose(_)
            | Self::Label(_) => false,
        }
    }

    /// Stage referenced by `COPY --from`, if any.
    #[must_use]
    pub fn copy_source(&self) -> Option<&str> {
        match self {
            Self::Copy(copy) => copy.from.as_deref(),
            _ => None,
        }
    }
}

/// Canonical text form. This is what cache keys hash and what layer history
/// records, so it must be stable for equal instructions.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy(copy) => {
                f.write_str("COPY")?;
                if let Some(from) = &copy.from {
                    write!(f, " --from={from}")?;
                }
                for source in &copy.sources {
                    write!(f, " {source}")?;
                }
                write!(f, " {}", copy.destination)
            }
            Self::Run(cmd) => write!(f, "RUN {cmd}"),
            Self::Env(vars) => write!(f, "ENV {}", format_pairs(vars)),
            Self::User(user) => write!(f, "USER {user}"),
            Self::Workdir(dir) => write!(f, "WORKDIR {dir}"),
            Self::Healthcheck(check) => write!(f, "HEALTHCHECK {check}"),
            Self::Entrypoint(cmd) => write!(f, "ENTRYPOINT {cmd}"),
            Self::Cmd(cmd) => write!(f, "CMD {cmd}"),
            Self::Expose(ports) => {
                let ports: Vec<String> = ports.iter().map(ToString::to_string).collect();
                write!(f, "EXPOSE {}", ports.join(" "))
            }
            Self::Label(labels) => write!(f, "LABEL {}", format_pairs(labels)),
        }
    }
}

fn format_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", serde_json::Value::String(v.clone())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `COPY` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInstruction {
    /// Source stage alias or index; `None` copies from the build context.
    pub from: Option<String>,
    /// Source paths or glob patterns.
    pub sources: Vec<String>,
    /// Destination, absolute or relative to the working directory.
    pub destination: String,
}

/// Command in shell or exec form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// `RUN apt-get update`
    Shell(String),
    /// `RUN ["apt-get", "update"]`
    Exec(Vec<String>),
}

impl Command {
    /// The argv this command runs as.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec!["/bin/sh".to_string(), "-c".to_string(), line.clone()],
            Self::Exec(args) => args.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Exec(args) => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// `HEALTHCHECK` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Healthcheck {
    /// `HEALTHCHECK NONE`: disable any inherited check.
    Disabled,
    /// `HEALTHCHECK [options] CMD <command>`
    Check(HealthcheckSpec),
}

/// Health check probe and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckSpec {
    /// Probe command.
    pub command: Command,
    /// Time between probes.
    pub interval: Duration,
    /// Time before a probe is considered hung.
    pub timeout: Duration,
    /// Grace period after start during which failures don't count.
    pub start_period: Duration,
    /// Consecutive failures before the container is unhealthy.
    pub retries: u32,
}

impl HealthcheckSpec {
    /// Default time between probes.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    /// Default probe timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default consecutive failures.
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Spec with default timing.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            start_period: Duration::ZERO,
            retries: Self::DEFAULT_RETRIES,
        }
    }
}

impl fmt::Display for Healthcheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("NONE"),
            Self::Check(spec) => write!(
                f,
                "--interval={}ms --timeout={}ms --start-period={}ms --retries={} CMD {}",
                spec.interval.as_millis(),
                spec.timeout.as_millis(),
                spec.start_period.as_millis(),
                spec.retries,
                spec.command
            ),
        }
    }
}

/// Exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port number.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (default).
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{proto}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_classification() {
        assert!(Instruction::Run(Command::Shell("true".into())).is_filesystem());
        assert!(
            Instruction::Copy(CopyInstruction {
                from: None,
                sources: vec!["a".into()],
                destination: "/b".into(),
            })
            .is_filesystem()
        );
        assert!(!Instruction::User("app".into()).is_filesystem());
        assert!(!Instruction::Workdir("/app".into()).is_filesystem());
        assert!(!Instruction::Env(Vec::new()).is_filesystem());
    }

    #[test]
    fn canonical_text() {
        let copy = Instruction::Copy(CopyInstruction {
            from: Some("builder".into()),
            sources: vec!["/app/target/*.jar".into()],
            destination: "app.jar".into(),
        });
        assert_eq!(copy.to_string(), "COPY --from=builder /app/target/*.jar app.jar");

        let env = Instruction::Env(vec![("TZ".into(), "UTC".into())]);
        assert_eq!(env.to_string(), "ENV TZ=\"UTC\"");

        let entry = Instruction::Entrypoint(Command::Exec(vec!["sh".into(), "-c".into()]));
        assert_eq!(entry.to_string(), "ENTRYPOINT [\"sh\",\"-c\"]");
    }

    #[test]
    fn shell_form_argv() {
        let cmd = Command::Shell("echo hi".into());
        assert_eq!(cmd.argv(), vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn port_display() {
        let port = PortSpec {
            port: 8080,
            protocol: Protocol::Tcp,
        };
        assert_eq!(port.to_string(), "8080/tcp");
    }
}
