// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::app::errors::ConnectError;
use crate::app::ports::{ExecConnector, ExecSession, SessionReader, SessionWriter};
use crate::app::types::{ExecRequest, RemoteExit};

/// How the remote command is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Runs the command on this host; the target only shows up in logs.
    Local,
    /// Wraps the command in `kubectl exec`, which takes care of
    /// authentication and the cluster connection.
    Kubectl {
        program: PathBuf,
        context: Option<String>,
        kubeconfig: Option<PathBuf>,
    },
}

impl Launcher {
    pub fn kubectl() -> Self {
        Launcher::Kubectl {
            program: PathBuf::from("kubectl"),
            context: None,
            kubeconfig: None,
        }
    }
}

/// Exec connector backed by a child process per session.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    launcher: Launcher,
    working_dir: Option<PathBuf>,
}

impl ProcessConnector {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            working_dir: None,
        }
    }

    pub fn local() -> Self {
        Self::new(Launcher::Local)
    }

    /// Directory the child starts in. Relative remote paths resolve against it
    /// with the `Local` launcher.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn argv(&self, request: &ExecRequest) -> Result<(PathBuf, Vec<String>), ConnectError> {
        let args = request.command.args();
        if args.is_empty() {
            return Err(ConnectError::protocol("exec request carries no command"));
        }
        match &self.launcher {
            Launcher::Local => Ok((PathBuf::from(&args[0]), args[1..].to_vec())),
            Launcher::Kubectl {
                program,
                context,
                kubeconfig,
            } => {
                let mut argv = vec!["exec".to_string()];
                if let Some(context) = context {
                    argv.extend(["--context".to_string(), context.clone()]);
                }
                if let Some(kubeconfig) = kubeconfig {
                    argv.extend([
                        "--kubeconfig".to_string(),
                        kubeconfig.display().to_string(),
                    ]);
                }
                if request.flags.stdin {
                    argv.push("-i".to_string());
                }
                argv.extend([
                    "-n".to_string(),
                    request.target.namespace.clone(),
                    request.target.pod.clone(),
                ]);
                if let Some(container) = &request.target.container {
                    argv.extend(["-c".to_string(), container.clone()]);
                }
                argv.push("--".to_string());
                argv.extend(args.iter().cloned());
                Ok((program.clone(), argv))
            }
        }
    }
}

#[async_trait]
impl ExecConnector for ProcessConnector {
    #[tracing::instrument(
        name = "process",
        level = "debug",
        skip(self, request),
        fields(op = "open", pod = %request.target)
    )]
    async fn open(&self, request: &ExecRequest) -> Result<Box<dyn ExecSession>, ConnectError> {
        if request.flags.tty {
            return Err(ConnectError::protocol(
                "process sessions do not allocate a tty",
            ));
        }
        let (program, args) = self.argv(request)?;
        let mut cmd = Command::new(&program);
        cmd.kill_on_drop(true);
        cmd.args(&args)
            .stdin(piped_if(request.flags.stdin))
            .stdout(piped_if(request.flags.stdout))
            .stderr(piped_if(request.flags.stderr));
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|err| {
            ConnectError::network(format!("failed to launch {}", program.display()))
                .with_source(err)
        })?;
        tracing::debug!(program = %program.display(), pid = ?child.id(), "process session started");

        Ok(Box::new(ProcessSession {
            stdin: child
                .stdin
                .take()
                .map(|pipe| Box::pin(pipe) as SessionWriter),
            stdout: child
                .stdout
                .take()
                .map(|pipe| Box::pin(pipe) as SessionReader),
            stderr: child
                .stderr
                .take()
                .map(|pipe| Box::pin(pipe) as SessionReader),
            child,
            closed: false,
        }))
    }
}

fn piped_if(attached: bool) -> Stdio {
    if attached {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

struct ProcessSession {
    child: Child,
    stdin: Option<SessionWriter>,
    stdout: Option<SessionReader>,
    stderr: Option<SessionReader>,
    closed: bool,
}

#[async_trait]
impl ExecSession for ProcessSession {
    fn take_stdin(&mut self) -> Option<SessionWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<SessionReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<SessionReader> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> io::Result<RemoteExit> {
        let status = self.child.wait().await?;
        Ok(match status.code() {
            Some(code) => RemoteExit::code(code),
            None => RemoteExit {
                code: None,
                message: Some(format!("remote process terminated abnormally ({status})")),
            },
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Already exited is fine.
        if let Err(err) = self.child.start_kill() {
            tracing::trace!(error = %err, "process already gone");
        }
    }
}
