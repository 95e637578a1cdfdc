//! Health probes for auxiliary services.

use async_trait::async_trait;
use sieve_core::pipeline::ProbeDefinition;
use sieve_core::ports::{HealthProbe, ProbeFactory};
use sieve_core::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

/// Healthy when a TCP connection can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::ProbeFailed(format!("{addr}: {e}"))),
            Err(_) => Err(Error::ProbeFailed(format!("{addr}: connect timed out"))),
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}:{}", self.host, self.port)
    }
}

/// Healthy when a shell command exits 0, e.g. `pg_isready -h localhost`.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    run: String,
    shell: String,
    workdir: Option<PathBuf>,
}

impl CommandProbe {
    pub fn new(run: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            shell: shell.into(),
            workdir: None,
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self) -> Result<()> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.run)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| Error::ProbeFailed(format!("`{}`: {e}", self.run)))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::ProbeFailed(format!(
                "`{}` exited with {}",
                self.run,
                status
                    .code()
                    .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
            )))
        }
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.run)
    }
}

/// Builds [`TcpProbe`]s and [`CommandProbe`]s from pipeline definitions.
#[derive(Debug, Clone)]
pub struct DefaultProbeFactory {
    connect_timeout: Duration,
    workdir: Option<PathBuf>,
}

impl Default for DefaultProbeFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            workdir: None,
        }
    }
}

impl DefaultProbeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Run command probes in this directory.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl ProbeFactory for DefaultProbeFactory {
    fn build(&self, definition: &ProbeDefinition) -> Result<Arc<dyn HealthProbe>> {
        match definition {
            ProbeDefinition::Tcp { host, port } => Ok(Arc::new(
                TcpProbe::new(host.clone(), *port).with_connect_timeout(self.connect_timeout),
            )),
            ProbeDefinition::Command { run, shell } => {
                if run.trim().is_empty() {
                    return Err(Error::InvalidPipeline(
                        "command probe has an empty `run`".to_string(),
                    ));
                }
                let probe = CommandProbe::new(run.clone(), shell.clone());
                Ok(Arc::new(match &self.workdir {
                    Some(dir) => probe.in_dir(dir.clone()),
                    None => probe,
                }))
            }
        }
    }
}
