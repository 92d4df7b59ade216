//! External command execution with live output parsing.
//!
//! Every interaction with the system tools (partclone, dd, sfdisk, sgdisk,
//! parted, mount helpers) goes through [`Runner`]. Output is streamed
//! chunk-wise into a pluggable [`OutputParser`] as it arrives, so callers can
//! observe partial progress while the process is still running. Tools that
//! only report progress on a terminal are run behind a pseudo-terminal.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::error::{Error, Result};

/// Interval used when busy-waiting on process state changes. Deliberately a
/// short fixed poll rather than an event: the states it waits out (process
/// start-up, kill delivery) last milliseconds.
pub const BUSY_WAIT_INTERVAL: Duration = Duration::from_millis(10);

const READ_BUFFER_SIZE: usize = 1024;

/// Receives raw chunks of tool output as they arrive.
pub trait OutputParser: Send {
    /// Feed one chunk of output. Returning an error kills the process and
    /// aborts the run with that error.
    fn parse(&mut self, data: &str) -> Result<()>;

    /// The parser's accumulated result, when it produces a textual one.
    fn output(&self) -> Option<String> {
        None
    }
}

/// Default parser: captures all output into a string.
#[derive(Default)]
pub struct Capture {
    buf: String,
}

impl OutputParser for Capture {
    fn parse(&mut self, data: &str) -> Result<()> {
        self.buf.push_str(data);
        Ok(())
    }

    fn output(&self) -> Option<String> {
        Some(self.buf.clone())
    }
}

/// Streams output straight into a file. Used for table dumps (sfdisk -d)
/// where the tool writes the backup to stdout.
pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: std::fs::File::create(path)?,
        })
    }
}

impl OutputParser for FileSink {
    fn parse(&mut self, data: &str) -> Result<()> {
        use std::io::Write;
        self.file.write_all(data.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Exited(i32),
}

#[derive(Clone)]
enum Invocation {
    Argv(Vec<String>),
    Shell(String),
}

/// Runs one external command to completion, feeding its output to the parser.
///
/// All interior state is shared, so a clone of the runner can be polled,
/// killed or read for output from another task while `run()` blocks.
#[derive(Clone)]
pub struct Runner {
    invocation: Invocation,
    use_pty: bool,
    parser: Arc<Mutex<Box<dyn OutputParser>>>,
    pid: Arc<Mutex<Option<Pid>>>,
    state: Arc<Mutex<RunState>>,
}

impl Runner {
    pub fn new(argv: Vec<String>, parser: Box<dyn OutputParser>) -> Self {
        Self {
            invocation: Invocation::Argv(argv),
            use_pty: false,
            parser: Arc::new(Mutex::new(parser)),
            pid: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(RunState::NotStarted)),
        }
    }

    pub fn shell(line: impl Into<String>, parser: Box<dyn OutputParser>) -> Self {
        Self {
            invocation: Invocation::Shell(line.into()),
            ..Self::new(Vec::new(), parser)
        }
    }

    /// Run the command behind a pseudo-terminal. Needed for tools that only
    /// emit progress when talking to a terminal.
    pub fn with_pty(mut self) -> Self {
        self.use_pty = true;
        self
    }

    pub fn poll(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    /// The parser's accumulated result so far; readable while still running.
    pub fn output(&self) -> Option<String> {
        self.parser.lock().unwrap().output()
    }

    /// Execute to completion and return the exit code.
    pub async fn run(&self) -> Result<i32> {
        if self.use_pty {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.run_pty())
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))?
        } else {
            self.run_piped().await
        }
    }

    /// Forcibly terminate the process and wait until it has exited.
    /// No-op when the process was never started or already finished.
    pub async fn kill(&self) {
        // pid and state are published together under both locks, so a
        // running process is never observable without its pid
        let pid = {
            let pid = self.pid.lock().unwrap();
            let state = self.state.lock().unwrap();
            match (*pid, *state) {
                (Some(pid), RunState::Running) => pid,
                _ => return,
            }
        };
        let _ = signal::kill(pid, Signal::SIGKILL);
        while self.poll() == RunState::Running {
            tokio::time::sleep(BUSY_WAIT_INTERVAL).await;
        }
    }

    fn std_command(&self) -> std::process::Command {
        match &self.invocation {
            Invocation::Argv(argv) => {
                let mut cmd = std::process::Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Invocation::Shell(line) => {
                let mut cmd = std::process::Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }

    async fn run_piped(&self) -> Result<i32> {
        let mut cmd = tokio::process::Command::from(self.std_command());
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        {
            let mut pid = self.pid.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            *pid = child.id().map(|id| Pid::from_raw(id as i32));
            *state = RunState::Running;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("no stdout handle")))?;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut parse_err = None;
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = String::from_utf8_lossy(&buf[..n]);
            if let Err(e) = self.parser.lock().unwrap().parse(&chunk) {
                let _ = child.start_kill();
                parse_err = Some(e);
                break;
            }
        }

        let status = child.wait().await?;
        let code = exit_code(&status);
        *self.state.lock().unwrap() = RunState::Exited(code);
        debug!(code, "process finished");

        match parse_err {
            Some(e) => Err(e),
            None => Ok(code),
        }
    }

    fn run_pty(&self) -> Result<i32> {
        let pty = nix::pty::openpty(None, None).map_err(io::Error::from)?;

        let mut cmd = self.std_command();
        cmd.stdin(pty.slave.try_clone()?)
            .stdout(pty.slave.try_clone()?)
            .stderr(pty.slave);

        let mut child = cmd.spawn()?;
        // the child owns the slave side now; our copies live inside `cmd`
        // and must be closed here, or the master read below never sees EOF
        // once the child exits
        drop(cmd);
        {
            let mut pid = self.pid.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            *pid = Some(Pid::from_raw(child.id() as i32));
            *state = RunState::Running;
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let result = loop {
            match nix::unistd::read(pty.master.as_raw_fd(), &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    if let Err(e) = self.parser.lock().unwrap().parse(&chunk) {
                        break Err(e);
                    }
                }
                // The master side reports EIO once the child closes the
                // slave; that is a normal end of output, not a failure.
                Err(Errno::EIO) => break Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => break Err(Error::Io(e.into())),
            }
        };

        // The tool can linger after closing its terminal; make sure it is
        // gone before reporting an exit state.
        let _ = child.kill();
        let status = child.wait()?;
        let code = exit_code(&status);
        *self.state.lock().unwrap() = RunState::Exited(code);

        result.map(|_| code)
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> Box<dyn OutputParser> {
        Box::new(Capture::default())
    }

    #[tokio::test]
    async fn captures_piped_output() {
        let runner = Runner::new(vec!["echo".into(), "hello".into()], capture());
        let code = runner.run().await.unwrap();
        assert_eq!(code, 0);
        assert!(runner.output().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn captures_shell_output() {
        let runner = Runner::shell("echo one && echo two", capture());
        runner.run().await.unwrap();
        let out = runner.output().unwrap();
        assert!(out.contains("one") && out.contains("two"));
    }

    #[tokio::test]
    async fn captures_pty_output() {
        let runner = Runner::new(vec!["echo".into(), "terminal".into()], capture()).with_pty();
        let code = runner.run().await.unwrap();
        assert_eq!(code, 0);
        assert!(runner.output().unwrap().contains("terminal"));
    }

    #[tokio::test]
    async fn poll_reflects_lifecycle() {
        let runner = Runner::new(vec!["true".into()], capture());
        assert_eq!(runner.poll(), RunState::NotStarted);
        runner.run().await.unwrap();
        assert_eq!(runner.poll(), RunState::Exited(0));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let runner = Runner::new(vec!["false".into()], capture());
        let code = runner.run().await.unwrap();
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn pty_run_ends_when_the_child_exits() {
        let runner = Runner::new(vec!["echo".into(), "done".into()], capture()).with_pty();
        let code = tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .expect("pty read loop kept running after the child exited")
            .unwrap();
        assert_eq!(code, 0);
        assert!(runner.output().unwrap().contains("done"));
    }

    #[tokio::test]
    async fn kill_unstarted_process_is_noop() {
        let runner = Runner::new(vec!["echo".into()], capture());
        runner.kill().await;
        assert_eq!(runner.poll(), RunState::NotStarted);
    }

    #[tokio::test]
    async fn kill_terminates_running_process() {
        let runner = Runner::new(vec!["sleep".into(), "30".into()], capture());
        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };
        while runner.poll() == RunState::NotStarted {
            tokio::time::sleep(BUSY_WAIT_INTERVAL).await;
        }
        runner.kill().await;
        assert!(matches!(runner.poll(), RunState::Exited(code) if code != 0));
        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn kill_in_the_startup_window_leaves_no_runaway_process() {
        let runner = Runner::new(vec!["sleep".into(), "30".into()], capture());
        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };
        // races the spawn on purpose; this kill may be a no-op, but only
        // when the process has not started yet
        runner.kill().await;
        while runner.poll() == RunState::NotStarted {
            tokio::time::sleep(BUSY_WAIT_INTERVAL).await;
        }
        runner.kill().await;
        let code = handle.await.unwrap().unwrap();
        assert_ne!(code, 0);
    }

    struct Rejecting;
    impl OutputParser for Rejecting {
        fn parse(&mut self, _data: &str) -> Result<()> {
            Err(Error::Layout("rejected".into()))
        }
    }

    #[tokio::test]
    async fn parser_error_aborts_run() {
        let runner = Runner::new(vec!["echo".into(), "data".into()], Box::new(Rejecting));
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::Layout(_)));
        assert!(matches!(runner.poll(), RunState::Exited(_)));
    }
}
