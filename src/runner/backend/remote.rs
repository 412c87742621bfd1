//! Remote backend over the system `ssh` client
//!
//! The task runs through `ssh host sh -c <wrapper>`. The wrapper creates the
//! channel files on the remote side, runs the body, then prints the channel
//! contents after a sentinel line so they can be written back into the
//! node's local channel files.
//!
//! The session's stdin is held open for as long as the task runs. A watchdog
//! in the wrapper waits for it to close and then kills the session's process
//! group (sshd starts every session in a new one), so killing the local
//! `ssh` on timeout or cancellation also ends the remote body.

use super::process::{supervise, Echo, Input};
use super::{ExecutionResult, Invocation};
use crate::config::HostPolicy;
use crate::error::{ExecutionError, NodeResult};
use crate::runner::env::{ENV_CHANNEL_VAR, OUTPUT_CHANNEL_VAR, PATH_CHANNEL_VAR};
use crate::runner::task::Host;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Exit status `ssh` uses for its own failures
const SSH_FAILURE: i32 = 255;

const CHANNELS: [&str; 3] = ["env", "path", "output"];

/// Run-wide SSH state: the multiplexing socket directory and per-host locks
#[derive(Debug)]
pub struct Connections {
    control_dir: Option<TempDir>,
    policy: HostPolicy,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Connections {
    /// Create the per-run state. `multiplex` enables OpenSSH connection
    /// reuse; it is silently dropped when no socket directory can be made.
    pub fn new(policy: HostPolicy, multiplex: bool) -> Self {
        let control_dir = if multiplex {
            match tempfile::Builder::new().prefix("runbook-ssh-").tempdir() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    warn!(error = %e, "ssh connection reuse disabled");
                    None
                }
            }
        } else {
            None
        };

        Connections {
            control_dir,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control_dir.as_ref().map(|dir| dir.path().join("%C"))
    }

    /// Wait for the host's session slot under `HostPolicy::Serial`
    pub async fn acquire(&self, host: &str) -> Option<OwnedMutexGuard<()>> {
        if self.policy != HostPolicy::Serial {
            return None;
        }
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(host.to_string()).or_default())
        };
        Some(lock.lock_owned().await)
    }
}

impl Default for Connections {
    fn default() -> Self {
        Connections::new(HostPolicy::default(), false)
    }
}

/// Runs the body on a remote host with its interpreter
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    pub host: Arc<Host>,
    pub program: String,
    pub args: Vec<String>,
    pub connections: Arc<Connections>,
}

impl RemoteBackend {
    pub async fn run(&self, invocation: &Invocation<'_>) -> NodeResult<ExecutionResult> {
        let sentinel = sentinel();
        let script = self.wrapper_script(invocation, &sentinel);

        let mut command = Command::new("ssh");
        command
            .args(self.ssh_arguments())
            .args(["sh", "-c"])
            .arg(shell_quote(&script));

        let _slot = self.connections.acquire(&self.host.name).await;
        debug!(
            label = invocation.label,
            host = %self.host.name,
            destination = %self.host.destination(),
            "running remote process"
        );

        let echo = Echo::new(invocation.label, invocation.echo).stop_at(sentinel.clone());
        let captured = supervise(
            command,
            Input::Held,
            &echo,
            invocation.timeout,
            invocation.cancel,
        )
        .await?;

        if captured.exit_code == Some(SSH_FAILURE) {
            let message = captured
                .stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("ssh exited with status 255")
                .trim()
                .to_string();
            return Err(ExecutionError::RemoteConnection {
                host: self.host.name.clone(),
                message,
            });
        }

        let mut result = ExecutionResult::from(captured);
        let (stdout, sections) = split_channel_sections(&result.stdout, &sentinel);
        if let Some(sections) = sections {
            let files = [
                invocation.channels.env_file(),
                invocation.channels.path_file(),
                invocation.channels.output_file(),
            ];
            for (file, content) in files.iter().zip(sections) {
                fs::write(file, content).map_err(|e| {
                    ExecutionError::Environment(format!("{}: {}", file.display(), e))
                })?;
            }
        } else {
            warn!(host = %self.host.name, "remote channel section missing from output");
        }
        result.stdout = stdout;
        Ok(result)
    }

    pub fn ssh_arguments(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(path) = self.connections.control_path() {
            args.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                format!("ControlPath={}", path.display()),
                "-o".to_string(),
                "ControlPersist=10".to_string(),
            ]);
        }
        if let Some(port) = self.host.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.host.destination());
        args
    }

    /// POSIX shell script run by the remote `sh -c`
    pub fn wrapper_script(&self, invocation: &Invocation<'_>, sentinel: &str) -> String {
        let mut script = String::new();
        script.push_str("exec 3<&0\n");
        script.push_str("__rb_dir=$(mktemp -d 2>/dev/null || mktemp -d -t runbook) || exit 1\n");
        for name in CHANNELS {
            let _ = writeln!(script, ": > \"$__rb_dir/{}\"", name);
        }
        for (var, name) in [
            (ENV_CHANNEL_VAR, "env"),
            (PATH_CHANNEL_VAR, "path"),
            (OUTPUT_CHANNEL_VAR, "output"),
        ] {
            let _ = writeln!(script, "export {}=\"$__rb_dir/{}\"", var, name);
        }
        for (key, value) in &invocation.env.vars {
            let _ = writeln!(script, "export {}={}", key, shell_quote(value));
        }
        if !invocation.env.path_prefix.is_empty() {
            let _ = writeln!(
                script,
                "export PATH={}:\"$PATH\"",
                shell_quote(&invocation.env.path_prefix.join(":"))
            );
        }

        let _ = writeln!(
            script,
            "cd {} || exit 1",
            shell_quote(&invocation.working_dir.to_string_lossy())
        );

        let command_line: Vec<String> = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(std::iter::once(invocation.body))
            .map(shell_quote)
            .collect();
        let _ = writeln!(script, "{} < /dev/null 3<&- &", command_line.join(" "));
        script.push_str("__rb_pid=$!\n");
        script.push_str(
            "{ while read -r __rb_line; do :; done; kill -KILL 0; } <&3 > /dev/null 2>&1 &\n",
        );
        script.push_str("__rb_watch=$!\nexec 3<&-\n");
        script.push_str("wait \"$__rb_pid\"\n__rb_status=$?\n");
        script.push_str("kill -KILL \"$__rb_watch\" 2>/dev/null\n");

        for name in CHANNELS {
            let _ = writeln!(script, "printf '\\n%s\\n' '{}:{}'", sentinel, name);
            let _ = writeln!(script, "cat \"$__rb_dir/{}\"", name);
        }
        let _ = writeln!(script, "printf '\\n%s\\n' '{}:end'", sentinel);
        script.push_str("rm -rf \"$__rb_dir\"\nexit $__rb_status\n");
        script
    }
}

/// Quote for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn sentinel() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("__RUNBOOK_CHANNELS_{}_{}__", std::process::id(), nanos)
}

/// Split captured stdout into the body's own output and the three
/// channel sections printed by the wrapper
pub fn split_channel_sections(stdout: &str, sentinel: &str) -> (String, Option<[String; 3]>) {
    let marker = |name: &str| format!("\n{}:{}\n", sentinel, name);

    let Some(start) = stdout.find(&marker("env")) else {
        return (stdout.to_string(), None);
    };
    let body = stdout[..start].to_string();

    let mut sections: [String; 3] = Default::default();
    let mut cursor = start;
    let names = ["env", "path", "output", "end"];
    for (i, pair) in names.windows(2).enumerate() {
        let open = marker(pair[0]);
        let close = marker(pair[1]);
        let from = cursor + open.len();
        let Some(len) = stdout[from..].find(&close) else {
            return (body, None);
        };
        sections[i] = stdout[from..from + len].to_string();
        cursor = from + len;
    }

    (body, Some(sections))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::env::{Channels, TaskEnv};
    use std::path::Path;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn backend(connections: Connections) -> RemoteBackend {
        RemoteBackend {
            host: Arc::new(Host {
                name: "web1".to_string(),
                address: "10.0.0.5".to_string(),
                user: Some("deploy".to_string()),
                port: Some(2222),
                tags: vec![],
            }),
            program: "bash".to_string(),
            args: vec!["-c".to_string()],
            connections: Arc::new(connections),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_ssh_arguments() {
        let args = backend(Connections::default()).ssh_arguments();
        assert_eq!(
            args,
            vec!["-o", "BatchMode=yes", "-p", "2222", "deploy@10.0.0.5"]
        );

        let args = backend(Connections::new(HostPolicy::Parallel, true)).ssh_arguments();
        assert!(args.contains(&"ControlMaster=auto".to_string()));
    }

    #[test]
    fn test_split_channel_sections() {
        let s = "S";
        let stdout = "hello\n\nS:env\nKEY=1\n\nS:path\n\nS:output\nv=2\n\nS:end\n";
        let (body, sections) = split_channel_sections(stdout, s);
        assert_eq!(body, "hello\n");
        let sections = sections.unwrap();
        assert_eq!(sections[0], "KEY=1\n");
        assert_eq!(sections[1], "");
        assert_eq!(sections[2], "v=2\n");

        let (body, sections) = split_channel_sections("no marker\n", s);
        assert_eq!(body, "no marker\n");
        assert!(sections.is_none());
    }

    fn local_wrapper(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    /// Runs the generated wrapper with a local `sh -c` in place of ssh
    #[tokio::test]
    async fn test_wrapper_script_round_trip() {
        let channels = Channels::create().unwrap();
        let mut env = TaskEnv::default();
        env.vars.insert("NAME".to_string(), "it's me".to_string());
        let cancel = CancellationToken::new();
        let invocation = Invocation {
            label: "t",
            body: "echo \"$NAME\"; echo KEY=1 >> \"$RUNBOOK_ENV\"; printf 'v=2' >> \"$RUNBOOK_OUTPUT\"",
            working_dir: Path::new("/"),
            env: &env,
            channels: &channels,
            timeout: None,
            cancel: &cancel,
            echo: false,
        };
        let mut remote = backend(Connections::default());
        remote.program = "sh".to_string();

        let sentinel = "__TEST_SENTINEL__";
        let script = remote.wrapper_script(&invocation, sentinel);
        let captured = supervise(
            local_wrapper(&script),
            Input::Held,
            &Echo::new("t", false),
            None,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(captured.exit_code, Some(0));
        let (body, sections) = split_channel_sections(&captured.stdout, sentinel);
        assert_eq!(body, "it's me\n");
        let sections = sections.unwrap();
        assert_eq!(sections[0], "KEY=1\n");
        assert_eq!(sections[2], "v=2");
    }

    #[tokio::test]
    async fn test_serial_policy_hands_out_one_slot_per_host() {
        let connections = Connections::new(HostPolicy::Serial, false);
        let first = connections.acquire("web1").await;
        assert!(first.is_some());
        let other_host = connections.acquire("web2").await;
        assert!(other_host.is_some());

        let lock = {
            let locks = connections.locks.lock().unwrap();
            Arc::clone(&locks["web1"])
        };
        assert!(lock.try_lock().is_err());
        drop(first);
        assert!(lock.try_lock().is_ok());

        let parallel = Connections::new(HostPolicy::Parallel, false);
        assert!(parallel.acquire("web1").await.is_none());
    }

    #[tokio::test]
    async fn test_closed_session_input_kills_remote_body() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("survived");
        let channels = Channels::create().unwrap();
        let env = TaskEnv::default();
        let cancel = CancellationToken::new();
        let body = format!("sleep 1; touch '{}'", marker.display());
        let invocation = Invocation {
            label: "t",
            body: &body,
            working_dir: Path::new("/"),
            env: &env,
            channels: &channels,
            timeout: None,
            cancel: &cancel,
            echo: false,
        };
        let mut remote = backend(Connections::default());
        remote.program = "sh".to_string();
        let script = remote.wrapper_script(&invocation, "__TEST_SENTINEL__");

        // stdin at end of file stands in for a dropped ssh connection
        let captured = supervise(
            local_wrapper(&script),
            Input::Null,
            &Echo::new("t", false),
            Some(Duration::from_secs(5)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(captured.exit_code, None);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
