//! Node process whose output is scanned
//!
//! With a configured command line the node is spawned as a child and both
//! its stdout and stderr are handed to scanners. Without one, the peer
//! finder reads its own stdin (`node | peer-finder`).

use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Node command is empty")]
    EmptyCommand,

    #[error("Failed to start node {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Node {0} pipe unavailable")]
    MissingPipe(&'static str),
}

/// Running node with its captured output streams
pub struct NodeProcess {
    child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl NodeProcess {
    /// Start `command` (program first) with piped output.
    /// The child is killed when this handle is dropped.
    pub fn spawn(command: &[String]) -> Result<Self, SourceError> {
        let (program, args) = command.split_first().ok_or(SourceError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(SourceError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SourceError::MissingPipe("stderr"))?;

        info!(program = %program, pid = ?child.id(), "🚀 Node process started");

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    /// Split into the child handle and its two output streams
    pub fn into_parts(self) -> (Child, ChildStdout, ChildStderr) {
        (self.child, self.stdout, self.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_empty_command() {
        assert!(matches!(NodeProcess::spawn(&[]), Err(SourceError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = NodeProcess::spawn(&["definitely-not-a-node-binary".to_string()]);
        assert!(matches!(result, Err(SourceError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let command = vec!["echo".to_string(), "peer 93.184.216.34:12121".to_string()];
        let (mut child, mut stdout, _stderr) = NodeProcess::spawn(&command).unwrap().into_parts();

        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output.trim(), "peer 93.184.216.34:12121");

        assert!(child.wait().await.unwrap().success());
    }
}
