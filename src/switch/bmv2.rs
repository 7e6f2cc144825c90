// p4fleet: P4 control-plane bootstrapper for BMv2 switch fleets
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Sessions with BMv2 software switches, backed by the BMv2 runtime CLI.
//!
//! Every request spawns the runtime CLI (`simple_switch_CLI`) against the device's thrift address
//! and feeds it one command on stdin. The CLI exits 0 even for failed commands, so errors are
//! detected in the output text. Mastership has no wire-level primitive on this transport; it is
//! held as a per-device lock file that records the owning user.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{
    ArbitrationError, ConnectionError, PipelineArtifact, PipelineError, SwitchBackend,
    SwitchIdentity, SwitchSession, WriteError,
};
use crate::compiler::TableEntryDescriptor;

/// How long to wait for a single runtime CLI invocation before giving up.
const CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// A backend that reaches every switch through the BMv2 runtime CLI.
#[derive(Debug, Clone)]
pub struct Bmv2Backend {
    cli: String,
    logs_dir: Option<PathBuf>,
    lock_dir: PathBuf,
}

impl Bmv2Backend {
    /// Create a backend invoking the given runtime CLI program. If `logs_dir` is set, every
    /// request sent to a switch is also appended to `<logs_dir>/<name>-requests.txt` (best
    /// effort; dump failures never fail the session).
    pub fn new(cli: impl Into<String>, logs_dir: Option<PathBuf>) -> Self {
        Self {
            cli: cli.into(),
            logs_dir,
            lock_dir: std::env::temp_dir(),
        }
    }
}

#[async_trait]
impl SwitchBackend for Bmv2Backend {
    type Session = Bmv2Session;

    async fn open(&self, identity: &SwitchIdentity) -> Result<Bmv2Session, ConnectionError> {
        let (host, port) = identity
            .addr
            .rsplit_once(':')
            .ok_or_else(|| ConnectionError::BadAddress(identity.addr.clone()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConnectionError::BadAddress(identity.addr.clone()))?;

        let session = Bmv2Session {
            identity: identity.clone(),
            cli: self.cli.clone(),
            host: host.to_string(),
            port,
            dump_file: self
                .logs_dir
                .as_ref()
                .map(|d| d.join(format!("{}-requests.txt", identity.name))),
            lock_file: self.lock_dir.join(format!("p4fleet-{}.lock", identity.name)),
            closed: false,
        };

        // probe the device before handing out the session
        log::trace!("[{}] connecting...", identity.name);
        session.run_cli("show_ports").await.map_err(|e| match e {
            CliError::Timeout => ConnectionError::Timeout,
            e => ConnectionError::Unreachable(e.to_string()),
        })?;
        log::trace!("[{}] connection established!", identity.name);

        Ok(session)
    }
}

/// One live control session with a BMv2 switch.
#[derive(Debug)]
pub struct Bmv2Session {
    identity: SwitchIdentity,
    cli: String,
    host: String,
    port: u16,
    dump_file: Option<PathBuf>,
    lock_file: PathBuf,
    closed: bool,
}

impl Bmv2Session {
    /// Execute commands on the runtime CLI and return the full output.
    async fn run_cli(&self, input: &str) -> Result<String, CliError> {
        log::trace!("[{}] `{input}`", self.identity.name);
        self.dump(input).await;

        let mut cmd = Command::new(&self.cli);
        cmd.arg("--thrift-ip")
            .arg(&self.host)
            .arg("--thrift-port")
            .arg(self.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = cmd.spawn()?;
            let mut stdin = child.stdin.take().expect("stdin is piped");
            stdin.write_all(input.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            drop(stdin);
            child.wait_with_output().await
        };

        let output = timeout(CLI_TIMEOUT, run)
            .await
            .map_err(|_| CliError::Timeout)??;
        check_cli_output(&self.identity.name, input, output)
    }

    /// Append the request to the per-device diagnostic dump. Best effort: failures are logged and
    /// never propagate into the session result.
    async fn dump(&self, line: &str) {
        let Some(path) = &self.dump_file else { return };
        let result = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(format!("{line}\n").as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            log::warn!(
                "[{}] Cannot record the request to {}: {e}",
                self.identity.name,
                path.display(),
            );
        }
    }
}

#[async_trait]
impl SwitchSession for Bmv2Session {
    fn name(&self) -> &str {
        &self.identity.name
    }

    async fn claim_mastership(&mut self) -> Result<(), ArbitrationError> {
        log::trace!("[{}] Obtaining the device lock", self.name());
        match tokio::fs::read_to_string(&self.lock_file).await {
            Ok(owner) => {
                let owner = owner.trim().to_string();
                log::error!(
                    "[{}] Cannot obtain the lock! {owner} is already master of this device.",
                    self.name(),
                );
                return Err(ArbitrationError::NotGranted(owner));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ArbitrationError::Failed(e.to_string())),
        }

        let owner = std::env::var("USER").unwrap_or_else(|_| String::from("unknown"));
        tokio::fs::write(&self.lock_file, &owner)
            .await
            .map_err(|e| ArbitrationError::Failed(e.to_string()))?;
        self.dump(&format!(
            "# mastership claimed by {owner} (device {})",
            self.identity.device_id,
        ))
        .await;
        Ok(())
    }

    async fn install_pipeline(&mut self, artifact: &PipelineArtifact) -> Result<(), PipelineError> {
        log::debug!(
            "[{}] Install the pipeline ({} bytes)",
            self.name(),
            artifact.image.len(),
        );
        let image = artifact.image_path.display();
        self.run_cli(&format!("load_new_config_file {image}\nswap_configs"))
            .await
            .map_err(|e| match e {
                CliError::Failed(msg) => PipelineError::Rejected(msg),
                e => PipelineError::Failed(e.to_string()),
            })?;
        Ok(())
    }

    async fn write_entry(&mut self, entry: &TableEntryDescriptor) -> Result<(), WriteError> {
        let cmd = format!(
            "table_add {} {} {} => {}",
            entry.table,
            entry.action,
            entry.matches.iter().map(|(_, v)| v).join(" "),
            entry.params.iter().map(|(_, v)| v).join(" "),
        );
        self.run_cli(&cmd).await.map_err(|e| match e {
            CliError::Failed(msg) => WriteError::Rejected(msg),
            e => WriteError::Failed(e.to_string()),
        })?;
        log::debug!("[{}] Installed {entry}", self.name());
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::debug!("[{}] Releasing the device lock", self.name());
        match tokio::fs::remove_file(&self.lock_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[{}] Cannot remove the lock file: {e}", self.name()),
        }
    }
}

/// Error while talking to the runtime CLI.
#[derive(Debug, Error)]
enum CliError {
    /// Spawning or driving the CLI process failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The CLI did not finish in time.
    #[error("Timeout while waiting for the runtime CLI")]
    Timeout,
    /// The CLI reported an error.
    #[error("{0}")]
    Failed(String),
}

/// Check the output of one CLI invocation: the exit status must be zero, and no output line may
/// report an error. The CLI exits 0 even when a command fails, so the text has to be scanned.
/// Returns the full stdout on success.
fn check_cli_output(
    name: &str,
    cmd: &str,
    output: std::process::Output,
) -> Result<String, CliError> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        log::error!(
            "[{name}] `{cmd}` exited with exit code {}{}{}",
            output.status.code().unwrap_or_default(),
            fmt_stream("STDOUT", &stdout),
            fmt_stream("STDERR", &stderr),
        );
        return Err(CliError::Failed(format!(
            "exit code {}",
            output.status.code().unwrap_or_default(),
        )));
    }

    if let Some(line) = stdout
        .lines()
        .chain(stderr.lines())
        .find(|l| l.trim_start().starts_with("Error") || l.contains("Invalid"))
    {
        log::error!("[{name}] `{cmd}` failed: {}", line.trim());
        return Err(CliError::Failed(line.trim().to_string()));
    }

    Ok(stdout)
}

fn fmt_stream(label: &str, content: &str) -> impl fmt::Display {
    if content.is_empty() {
        String::new()
    } else {
        format!("\n{label}:\n{content}")
    }
}
