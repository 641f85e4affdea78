//! Command Execution
//!
//! All block-device tooling (lsblk, losetup, the LVM suite) runs through the
//! [`CommandExecutor`] capability so the scanner, adapter, and engine are
//! testable against a scripted fake. The production implementation enters the
//! host's mount/PID namespaces, since the agent runs containerized but must
//! see the node's real devices.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use std::process::Command;
use tracing::debug;

// =============================================================================
// Executor Capability
// =============================================================================

/// Capability to run an external command and collect its stdout.
///
/// Implementations must return `Error::CommandFailed` (with captured stderr)
/// on a non-zero exit, so callers can fold tool messages into the status
/// document.
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args`, returning trimmed stdout
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

// =============================================================================
// Host Executor
// =============================================================================

/// Runs commands inside the host's mount/PID/UTS namespaces via nsenter.
///
/// Devices attached on the host (including freshly created loop devices) are
/// only visible there, not in the agent's own mount namespace.
pub struct HostExecutor {
    host_pid: u32,
}

impl HostExecutor {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            host_pid: config.host_pid,
        }
    }

    fn nsenter_args(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "-t".to_string(),
            self.host_pid.to_string(),
            "-m".to_string(),
            "-p".to_string(),
            "-u".to_string(),
            program.to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

impl CommandExecutor for HostExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let argv = self.nsenter_args(program, args);
        debug!("Running host command: {} {}", program, args.join(" "));

        let output = Command::new("nsenter")
            .args(&argv)
            .output()
            .map_err(|e| Error::CommandSpawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                program: program.to_string(),
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// =============================================================================
// Test Fake
// =============================================================================

/// Scripted executor for tests: canned responses keyed by command line,
/// with a recorded log of every invocation.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeExecutor {
        responses: Mutex<BTreeMap<String, std::result::Result<String, String>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        fn key(program: &str, args: &[&str]) -> String {
            if args.is_empty() {
                program.to_string()
            } else {
                format!("{} {}", program, args.join(" "))
            }
        }

        /// Script a successful response for an exact command line
        pub fn on_success(&self, program: &str, args: &[&str], stdout: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(Self::key(program, args), Ok(stdout.to_string()));
        }

        /// Script a failure (stderr text) for an exact command line
        pub fn on_failure(&self, program: &str, args: &[&str], stderr: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(Self::key(program, args), Err(stderr.to_string()));
        }

        /// All invocations so far, as full command lines
        pub fn call_log(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Invocations whose program is one of the LVM/loop mutation tools
        pub fn mutation_calls(&self) -> Vec<String> {
            const MUTATORS: &[&str] = &[
                "pvcreate", "pvremove", "vgcreate", "vgextend", "vgreduce", "vgremove",
                "losetup",
            ];
            self.call_log()
                .into_iter()
                .filter(|line| {
                    MUTATORS.iter().any(|m| line.starts_with(m))
                        && !line.contains("losetup -j")
                })
                .collect()
        }
    }

    impl CommandExecutor for FakeExecutor {
        fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            let key = Self::key(program, args);
            self.calls.lock().unwrap().push(key.clone());

            match self.responses.lock().unwrap().get(&key) {
                Some(Ok(stdout)) => Ok(stdout.clone()),
                Some(Err(stderr)) => Err(Error::CommandFailed {
                    program: program.to_string(),
                    args: args.join(" "),
                    stderr: stderr.clone(),
                }),
                // Unscripted commands succeed silently, so tests only script
                // what they assert on.
                None => Ok(String::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nsenter_argv_shape() {
        let config = AgentConfig {
            node_name: "node-1".into(),
            host_pid: 1,
            ..Default::default()
        };
        let executor = HostExecutor::new(&config);
        let argv = executor.nsenter_args("vgs", &["--noheadings"]);

        assert_eq!(argv[0], "-t");
        assert_eq!(argv[1], "1");
        assert!(argv.contains(&"-m".to_string()));
        assert!(argv.contains(&"-p".to_string()));
        assert_eq!(argv[5], "vgs");
        assert_eq!(argv[6], "--noheadings");
    }

    #[test]
    fn test_fake_executor_scripting() {
        let exec = fake::FakeExecutor::new();
        exec.on_success("vgs", &["--noheadings"], "vg1");
        exec.on_failure("vgcreate", &["vg2", "/dev/sdz"], "device not found");

        assert_eq!(exec.run("vgs", &["--noheadings"]).unwrap(), "vg1");
        assert!(exec.run("vgcreate", &["vg2", "/dev/sdz"]).is_err());
        assert_eq!(exec.call_log().len(), 2);
        assert_eq!(exec.mutation_calls(), vec!["vgcreate vg2 /dev/sdz"]);
    }
}
