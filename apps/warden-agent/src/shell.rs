//! Persistent interactive interpreter session.
//!
//! One interpreter process is shared by every connection. A single async
//! mutex serializes command submission, so concurrent callers queue rather
//! than interleave output. Output is framed by the interpreter's own blank
//! lines: reading stops at the first empty line. A command whose output
//! legitimately contains a blank line is therefore truncated at that line —
//! a known limitation of the sentinel framing, not recoverable here.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How the interpreter is launched. Defaults to the platform shell; tests
/// substitute a mock interpreter.
#[derive(Debug, Clone)]
pub struct InterpreterCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for InterpreterCommand {
    #[cfg(windows)]
    fn default() -> Self {
        Self {
            program: "cmd.exe".to_string(),
            args: Vec::new(),
        }
    }

    #[cfg(not(windows))]
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("shell is not running")]
    NotRunning,
    #[error("failed to spawn interpreter: {0}")]
    Spawn(std::io::Error),
    #[error("shell i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command log write failed: {0}")]
    Log(std::io::Error),
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct ShellService {
    command: InterpreterCommand,
    log: CommandLog,
    /// `None` in the not-started and stopped states.
    session: Mutex<Option<Session>>,
    banner_grace: Duration,
}

impl ShellService {
    pub fn new(command: InterpreterCommand, log: CommandLog) -> Self {
        Self {
            command,
            log,
            session: Mutex::new(None),
            banner_grace: Duration::from_millis(250),
        }
    }

    /// Runs one command in the shared session, restarting the interpreter
    /// first if it has never started or has since exited. Blocks until the
    /// session lock is acquired; a long-running command holds the lock until
    /// the interpreter answers or dies.
    pub async fn execute(&self, command: &str) -> Result<String, ShellError> {
        let mut guard = self.session.lock().await;
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.ensure_session(&mut guard).await?;
            let session = guard.as_mut().expect("session present after ensure");
            debug!(command, "executing shell command");
            match submit(session, command).await {
                Ok(()) => break,
                Err(err) => {
                    // Interpreter died between the health check and the
                    // write; one respawn covers it.
                    *guard = None;
                    if attempts >= 2 {
                        return Err(ShellError::Io(err));
                    }
                }
            }
        }

        let session = guard.as_mut().expect("session present after submit");
        match read_response(session, &self.log).await {
            Ok(ReadOutcome { output, eof }) => {
                if eof {
                    warn!("interpreter closed its output stream");
                    *guard = None;
                }
                Ok(output)
            }
            Err(err) => {
                // The output stream is no longer in a known state.
                *guard = None;
                Err(err)
            }
        }
    }

    /// Terminates the interpreter. Fails with `NotRunning` when no live
    /// session exists.
    pub async fn stop(&self) -> Result<(), ShellError> {
        let mut guard = self.session.lock().await;
        match guard.take() {
            Some(mut session) => {
                if session.child.try_wait()?.is_some() {
                    return Err(ShellError::NotRunning);
                }
                session.child.kill().await?;
                info!("interactive shell stopped");
                Ok(())
            }
            None => Err(ShellError::NotRunning),
        }
    }

    async fn ensure_session(&self, guard: &mut Option<Session>) -> Result<(), ShellError> {
        if let Some(session) = guard.as_mut() {
            if session.child.try_wait()?.is_none() {
                return Ok(());
            }
            *guard = None;
        }

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ShellError::Spawn)?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        let mut session = Session {
            child,
            stdin,
            stdout,
        };
        info!(program = %self.command.program, "interactive shell started");

        self.drain_banner(&mut session).await?;
        *guard = Some(session);
        Ok(())
    }

    /// Consumes any startup banner into the command log before the first
    /// command. Banner output ends at the first blank line; interpreters
    /// that print no banner are covered by the short grace deadline.
    async fn drain_banner(&self, session: &mut Session) -> Result<(), ShellError> {
        loop {
            let mut line = String::new();
            let read =
                tokio::time::timeout(self.banner_grace, session.stdout.read_line(&mut line)).await;
            match read {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => {
                    if line.trim().is_empty() {
                        break;
                    }
                    self.log.append(&line).map_err(ShellError::Log)?;
                }
                Ok(Err(err)) => return Err(ShellError::Io(err)),
            }
        }
        Ok(())
    }
}

async fn submit(session: &mut Session, command: &str) -> std::io::Result<()> {
    session
        .stdin
        .write_all(format!("{command}\n").as_bytes())
        .await?;
    session.stdin.flush().await
}

struct ReadOutcome {
    output: String,
    /// The interpreter closed its output stream mid-response.
    eof: bool,
}

/// Reads output lines until the blank-line sentinel or end of stream. Every
/// line reaches the durable log before it is aggregated, so partial output
/// survives a crash mid-command.
async fn read_response(session: &mut Session, log: &CommandLog) -> Result<ReadOutcome, ShellError> {
    let mut output = String::new();
    loop {
        let mut line = String::new();
        let read = session.stdout.read_line(&mut line).await?;
        if read == 0 {
            return Ok(ReadOutcome { output, eof: true });
        }
        if line.trim().is_empty() {
            return Ok(ReadOutcome { output, eof: false });
        }
        log.append(&line).map_err(ShellError::Log)?;
        output.push_str(&line);
    }
}

/// Durable append-only log of raw interpreter output. The file is opened
/// per write and flushed before the line is considered recorded, so partial
/// output survives a crash mid-command.
pub struct CommandLog {
    path: PathBuf,
}

impl CommandLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn append(&self, raw: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(raw.as_bytes())?;
        file.flush()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Interpreter that answers every input line with a tagged echo followed
    /// by the blank-line sentinel.
    fn echo_interpreter() -> InterpreterCommand {
        InterpreterCommand {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"while IFS= read -r line; do echo "echo:$line"; echo; done"#.to_string(),
            ],
        }
    }

    fn service(dir: &tempfile::TempDir) -> ShellService {
        ShellService::new(
            echo_interpreter(),
            CommandLog::new(dir.path().join("command_output.log")),
        )
    }

    #[tokio::test]
    async fn execute_returns_command_output() {
        let dir = tempfile::tempdir().unwrap();
        let shell = service(&dir);
        let output = shell.execute("hello").await.unwrap();
        assert_eq!(output.trim(), "echo:hello");
    }

    #[tokio::test]
    async fn output_is_logged_before_return() {
        let dir = tempfile::tempdir().unwrap();
        let shell = service(&dir);
        shell.execute("logged").await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("command_output.log")).unwrap();
        assert!(log.contains("echo:logged"));
    }

    #[tokio::test]
    async fn concurrent_executes_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let shell = Arc::new(service(&dir));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let shell = Arc::clone(&shell);
            tasks.push(tokio::spawn(async move {
                (i, shell.execute(&format!("tag-{i}")).await.unwrap())
            }));
        }
        for task in tasks {
            let (i, output) = task.await.unwrap();
            let own = format!("echo:tag-{i}");
            assert_eq!(output.trim(), own);
            for j in 0..8 {
                if j != i {
                    assert!(!output.contains(&format!("tag-{j}")));
                }
            }
        }
    }

    #[tokio::test]
    async fn blank_line_in_output_truncates_response() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellService::new(
            InterpreterCommand {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    // Two output lines separated by a blank line.
                    r#"while read line; do echo first; echo; echo second; echo; done"#.to_string(),
                ],
            },
            CommandLog::new(dir.path().join("command_output.log")),
        );
        let output = shell.execute("anything").await.unwrap();
        assert_eq!(output.trim(), "first");
    }

    #[tokio::test]
    async fn stop_without_session_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let shell = service(&dir);
        assert!(matches!(shell.stop().await, Err(ShellError::NotRunning)));
    }

    #[tokio::test]
    async fn session_restarts_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let shell = service(&dir);
        shell.execute("one").await.unwrap();
        shell.stop().await.unwrap();
        let output = shell.execute("two").await.unwrap();
        assert_eq!(output.trim(), "echo:two");
    }

    #[tokio::test]
    async fn session_restarts_after_interpreter_death() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellService::new(
            InterpreterCommand {
                program: "/bin/sh".to_string(),
                // Answers one command, then exits.
                args: vec![
                    "-c".to_string(),
                    r#"read line; echo "echo:$line"; echo; exit 0"#.to_string(),
                ],
            },
            CommandLog::new(dir.path().join("command_output.log")),
        );
        assert_eq!(shell.execute("a").await.unwrap().trim(), "echo:a");
        // Give the one-shot interpreter time to exit so the next call sees
        // a dead session and respawns.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(shell.execute("b").await.unwrap().trim(), "echo:b");
    }
}
