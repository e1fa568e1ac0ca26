//! Remote command execution over the system `ssh` client.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::bulk::{ItemExecutor, LogSink};

const DEFAULT_SSH_PORT: u16 = 22;
const STDERR_TAIL_LINES: usize = 20;
const OUTPUT_BUFFER: usize = 64;

#[derive(Clone, PartialEq, Eq)]
pub enum RemoteAuth {
    /// Key-based auth. `None` uses the agent or the client's default identities.
    Key { identity: Option<PathBuf> },
    /// Password auth through `sshpass`. The password is passed via the
    /// environment, never on the command line.
    Password(String),
}

impl std::fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteAuth::Key { identity } => f.debug_struct("Key").field("identity", identity).finish(),
            RemoteAuth::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: RemoteAuth,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: RemoteAuth) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            auth,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parses `[user@]host[:port]`, taking whatever is missing from `defaults`.
    pub fn parse(spec: &str, defaults: &RemoteTarget) -> anyhow::Result<Self> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (defaults.user.clone(), spec),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("invalid port in target '{spec}'"))?,
            ),
            None => (rest, defaults.port),
        };
        if host.is_empty() {
            anyhow::bail!("empty host in target '{spec}'");
        }
        Ok(Self {
            host: host.to_string(),
            port,
            user,
            auth: defaults.auth.clone(),
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Runs a command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` on `target`, sending output lines to `output` as they
    /// arrive. Returns the remote exit code.
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &str,
        output: mpsc::Sender<OutputLine>,
    ) -> anyhow::Result<i32>;
}

/// [`RemoteShell`] backed by the `ssh` binary, or `sshpass` for password auth.
#[derive(Clone, Debug)]
pub struct SshCommandShell {
    ssh_program: String,
    sshpass_program: String,
    connect_timeout_secs: u64,
    options: Vec<String>,
}

impl Default for SshCommandShell {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
            connect_timeout_secs: 10,
            options: vec!["StrictHostKeyChecking=accept-new".to_string()],
        }
    }
}

impl SshCommandShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Adds an `-o` option passed to every connection.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    fn build_command(&self, target: &RemoteTarget, command: &str) -> Command {
        let mut cmd = match &target.auth {
            RemoteAuth::Password(password) => {
                let mut cmd = Command::new(&self.sshpass_program);
                cmd.env("SSHPASS", password).arg("-e").arg(&self.ssh_program);
                cmd
            }
            RemoteAuth::Key { .. } => {
                let mut cmd = Command::new(&self.ssh_program);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        if let RemoteAuth::Key {
            identity: Some(path),
        } = &target.auth
        {
            cmd.arg("-i").arg(path);
        }
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        for option in &self.options {
            cmd.arg("-o").arg(option);
        }
        cmd.arg("-p")
            .arg(target.port.to_string())
            .arg(target.destination())
            .arg(command);
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshCommandShell {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &str,
        output: mpsc::Sender<OutputLine>,
    ) -> anyhow::Result<i32> {
        tracing::debug!(host = %target.host, port = target.port, "running remote command");
        let cmd = self.build_command(target, command);
        run_streaming(cmd, output)
            .await
            .with_context(|| format!("ssh to {} failed", target.host))
    }
}

/// Spawns `cmd` and streams both pipes line by line until it exits.
///
/// The child is killed if the returned future is dropped.
async fn run_streaming(mut cmd: Command, output: mpsc::Sender<OutputLine>) -> anyhow::Result<i32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().context("failed to spawn process")?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (_, _, status) = tokio::join!(
        forward_lines(stdout, output.clone(), OutputLine::Stdout),
        forward_lines(stderr, output, OutputLine::Stderr),
        child.wait(),
    );
    Ok(status?.code().unwrap_or(-1))
}

async fn forward_lines<R>(
    pipe: Option<R>,
    output: mpsc::Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else { return };
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                // Keep draining the pipe even when nobody is listening.
                let _ = output.send(wrap(line)).await;
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("failed to read process output: {err}");
                break;
            }
        }
    }
}

/// Runs a command template on each bulk target through a [`RemoteShell`].
///
/// `{target}` in the template is replaced with the target's host. Output
/// lines are forwarded to the item's [`LogSink`]; a non-zero exit fails the
/// item with the tail of stderr.
pub struct RemoteCommandExecutor {
    shell: Arc<dyn RemoteShell>,
    template: String,
    defaults: RemoteTarget,
}

impl std::fmt::Debug for RemoteCommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommandExecutor")
            .field("template", &self.template)
            .field("default_user", &self.defaults.user)
            .finish_non_exhaustive()
    }
}

impl RemoteCommandExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>, template: impl Into<String>, defaults: RemoteTarget) -> Self {
        Self {
            shell,
            template: template.into(),
            defaults,
        }
    }

    fn render(&self, target: &RemoteTarget) -> String {
        self.template.replace("{target}", &target.host)
    }
}

#[async_trait]
impl ItemExecutor for RemoteCommandExecutor {
    async fn execute(&self, target: &str, log: &LogSink) -> anyhow::Result<()> {
        let remote = RemoteTarget::parse(target, &self.defaults)?;
        let command = self.render(&remote);
        let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);

        let exec = self.shell.exec(&remote, &command, tx);
        let collect = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Some(line) = rx.recv().await {
                match line {
                    OutputLine::Stdout(line) => log.line(line),
                    OutputLine::Stderr(line) => {
                        log.line(line.clone());
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            }
            tail
        };
        let (code, tail) = tokio::join!(exec, collect);

        match code? {
            0 => Ok(()),
            code => {
                let tail: Vec<String> = tail.into();
                anyhow::bail!("exit code {code}: {}", tail.join("\n"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::ffi::OsStr;

    fn defaults() -> RemoteTarget {
        RemoteTarget::new("unused", "deploy", RemoteAuth::Key { identity: None })
    }

    #[test]
    fn test_parse_target() {
        let t = RemoteTarget::parse("root@10.0.0.5:2222", &defaults()).unwrap();
        assert_eq!((t.user.as_str(), t.host.as_str(), t.port), ("root", "10.0.0.5", 2222));

        let t = RemoteTarget::parse("web-1", &defaults()).unwrap();
        assert_eq!((t.user.as_str(), t.host.as_str(), t.port), ("deploy", "web-1", 22));

        assert!(RemoteTarget::parse("web-1:ssh", &defaults()).is_err());
        assert!(RemoteTarget::parse("root@", &defaults()).is_err());
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_key_auth_command() {
        let target = RemoteTarget::new(
            "web-1",
            "deploy",
            RemoteAuth::Key {
                identity: Some(PathBuf::from("/keys/id_ed25519")),
            },
        )
        .with_port(2200);
        let cmd = SshCommandShell::new().build_command(&target, "uptime");

        assert_eq!(cmd.as_std().get_program(), "ssh");
        let args = args(&cmd);
        assert!(args.windows(2).any(|w| w == ["-o", "BatchMode=yes"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2200"]));
        assert_eq!(&args[args.len() - 2..], ["deploy@web-1", "uptime"]);
    }

    #[test]
    fn test_password_auth_uses_sshpass_env() {
        let target = RemoteTarget::new("web-1", "deploy", RemoteAuth::Password("hunter2".into()));
        let cmd = SshCommandShell::new().build_command(&target, "uptime");

        assert_eq!(cmd.as_std().get_program(), "sshpass");
        let args = args(&cmd);
        assert_eq!(&args[..2], ["-e", "ssh"]);
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        let env: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(env.contains(&(OsStr::new("SSHPASS"), Some(OsStr::new("hunter2")))));
    }

    #[tokio::test]
    async fn test_run_streaming_collects_both_pipes() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo one; echo two >&2; echo three; exit 3");
        let (tx, mut rx) = mpsc::channel(16);

        let code = run_streaming(cmd, tx).await.unwrap();
        assert_eq!(code, 3);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert!(lines.contains(&OutputLine::Stdout("one".into())));
        assert!(lines.contains(&OutputLine::Stdout("three".into())));
        assert!(lines.contains(&OutputLine::Stderr("two".into())));
    }

    /// Replays canned output and records the commands it was given.
    struct CannedShell {
        code: i32,
        lines: Vec<OutputLine>,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RemoteShell for CannedShell {
        async fn exec(
            &self,
            target: &RemoteTarget,
            command: &str,
            output: mpsc::Sender<OutputLine>,
        ) -> anyhow::Result<i32> {
            self.seen.lock().push((target.host.clone(), command.to_string()));
            for line in &self.lines {
                let _ = output.send(line.clone()).await;
            }
            Ok(self.code)
        }
    }

    #[tokio::test]
    async fn test_executor_fails_with_stderr_tail() {
        let shell = Arc::new(CannedShell {
            code: 2,
            lines: vec![
                OutputLine::Stdout("installing".into()),
                OutputLine::Stderr("E: package not found".into()),
            ],
            seen: Mutex::new(Vec::new()),
        });
        let executor = RemoteCommandExecutor::new(shell.clone(), "apt-get install -y agent # {target}", defaults());

        let err = executor
            .execute("web-3", &LogSink::discard("web-3"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "exit code 2: E: package not found");
        assert_eq!(
            shell.seen.lock().as_slice(),
            [("web-3".to_string(), "apt-get install -y agent # web-3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_executor_success() {
        let shell = Arc::new(CannedShell {
            code: 0,
            lines: vec![OutputLine::Stdout("ok".into())],
            seen: Mutex::new(Vec::new()),
        });
        let executor = RemoteCommandExecutor::new(shell, "true", defaults());
        executor
            .execute("web-1", &LogSink::discard("web-1"))
            .await
            .unwrap();
    }
}
