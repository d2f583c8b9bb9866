//! Spawns and supervises the external TUN helper process: argument
//! substitution, stdio pumping into the two text sinks, and best-effort
//! termination on shutdown.

use crate::error::HelperError;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// A sink for one stdio-pumped line, prefixed per §4.6.
pub trait LineSink: Send + Sync + 'static {
    fn write_line(&self, line: &str);
}

impl<F> LineSink for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn write_line(&self, line: &str) {
        (self)(line)
    }
}

/// Substitutes the case-insensitive placeholders in an argument template
/// and splits the result into argv, honoring simple double-quoted
/// segments so paths containing spaces survive.
pub fn render_arguments(template: &str, substitutions: &HashMap<&str, String>) -> Vec<String> {
    let mut rendered = template.to_string();
    for (key, value) in substitutions {
        let needle = format!("{{{key}}}");
        rendered = replace_case_insensitive(&rendered, &needle, value);
    }
    split_args(&rendered)
}

fn replace_case_insensitive(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_haystack = haystack.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    let mut lower_rest = lower_haystack.as_str();

    while let Some(pos) = lower_rest.find(&lower_needle) {
        out.push_str(&rest[..pos]);
        out.push_str(replacement);
        rest = &rest[pos + needle.len()..];
        lower_rest = &lower_rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}

fn split_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

pub struct HelperSupervisor {
    child: Child,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    #[cfg(windows)]
    job: Option<crate::job::ProcessJob>,
}

impl HelperSupervisor {
    pub async fn spawn(
        executable: &Path,
        args: &[String],
        working_dir: &Path,
        info_sink: Arc<dyn LineSink>,
    ) -> Result<Self, HelperError> {
        let mut command = Command::new(executable);
        command
            .args(args)
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = command.spawn().map_err(|source| HelperError::Spawn {
            path: executable.to_path_buf(),
            source,
        })?;

        #[cfg(windows)]
        let job = match child.id() {
            Some(pid) => match crate::job::ProcessJob::attach(pid) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(
                        error = %e,
                        "failed to attach helper to a job object, process-tree kill on shutdown will be best-effort"
                    );
                    None
                }
            },
            None => None,
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stdout_task = Some(spawn_pump(stdout, info_sink.clone(), "[helper] "));
        let stderr_task = Some(spawn_pump(stderr, info_sink, "[helper] "));

        Ok(Self {
            child,
            stdout_task,
            stderr_task,
            #[cfg(windows)]
            job,
        })
    }

    /// `None` while the process is still running.
    pub fn try_exit_code(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            _ => None,
        }
    }

    /// Waits for the helper to exit on its own (used by the session's
    /// wait stage, raced against cancellation).
    pub async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "failed to wait on helper process");
                None
            }
        }
    }

    /// Attempts graceful termination (a `CTRL_BREAK_EVENT` to the helper's
    /// own process group), then forcefully kills the whole process tree —
    /// not just the one `Child` handle — if it hasn't exited within the
    /// wait window.
    pub async fn terminate(&mut self) {
        if self.child.try_wait().ok().flatten().is_some() {
            self.join_pumps().await;
            return;
        }

        self.send_graceful_signal();
        if tokio::time::timeout(TERMINATE_WAIT, self.child.wait()).await.is_ok() {
            self.join_pumps().await;
            return;
        }

        #[cfg(windows)]
        if let Some(job) = &self.job {
            job.terminate_tree();
        }

        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "start_kill failed, helper may have already exited");
        }

        let _ = tokio::time::timeout(TERMINATE_WAIT, self.child.wait()).await;
        self.join_pumps().await;
    }

    #[cfg(windows)]
    fn send_graceful_signal(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        unsafe {
            if let Err(e) =
                windows::Win32::System::Console::GenerateConsoleCtrlEvent(windows::Win32::System::Console::CTRL_BREAK_EVENT, pid)
            {
                debug!(error = %e, "failed to send a graceful shutdown signal to the helper");
            }
        }
    }

    #[cfg(not(windows))]
    fn send_graceful_signal(&self) {}

    async fn join_pumps(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
    }
}

fn spawn_pump<R>(reader: R, sink: Arc<dyn LineSink>, prefix: &'static str) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.write_line(&format!("{prefix}{line}")),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "stdio pump read error, stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_placeholders_case_insensitively() {
        let mut subs = HashMap::new();
        subs.insert("proxyUri", "socks5://127.0.0.1:1080".to_string());
        subs.insert("interfaceName", "EpTUN".to_string());

        let rendered = render_arguments("-proxy {PROXYURI} -device {InterfaceName}", &subs);
        assert_eq!(
            rendered,
            vec!["-proxy", "socks5://127.0.0.1:1080", "-device", "EpTUN"]
        );
    }

    #[test]
    fn splits_quoted_arguments() {
        let args = split_args(r#"-proxy socks5://127.0.0.1:1080 -name "My Tunnel""#);
        assert_eq!(args, vec!["-proxy", "socks5://127.0.0.1:1080", "-name", "My Tunnel"]);
    }
}
