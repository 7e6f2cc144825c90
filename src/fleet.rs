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

//! The fleet orchestrator. It drives every switch session through the bootstrap sequence (open,
//! arbitrate, install the pipeline, apply the rules) and collects the per-switch outcome. Within
//! one switch the steps are strictly ordered; across switches they run concurrently, one task per
//! device. Every opened session is released exactly once, also on errors and on interrupt.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::catalog::{LogicalRule, RuleCatalog};
use crate::compiler::{compile, MalformedRule};
use crate::config::TableNames;
use crate::switch::{
    ArbitrationError, ConnectionError, PipelineArtifact, PipelineError, SwitchBackend,
    SwitchIdentity, SwitchSession, WriteError,
};

/// The bootstrap steps that run on an open session, in their mandatory order. A failure to open
/// the session in the first place is fleet-scoped and has no step: it aborts the entire run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    /// Claim mastership.
    Arbitrate,
    /// Install the pipeline artifact.
    Install,
    /// Compile and write the table entries.
    Apply,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Arbitrate => f.write_str("arbitration"),
            Step::Install => f.write_str("pipeline installation"),
            Step::Apply => f.write_str("rule application"),
        }
    }
}

/// Everything that can go wrong on a single switch after its session is open. Device-scoped: an
/// error on one switch never aborts the sequences of the other switches.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Mastership was not granted. No entry was attempted on this device.
    #[error("{0}")]
    Arbitration(#[from] ArbitrationError),
    /// The device rejected the pipeline. No entry was attempted on this device.
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    /// A rule failed validation. Raised before any write; no entry was written to this device.
    #[error("Rule {index} ({rule}) is malformed: {source}")]
    Malformed {
        /// Position of the rule in the catalog order of this switch.
        index: usize,
        /// The offending rule.
        rule: String,
        #[source]
        source: MalformedRule,
    },
    /// A single entry was rejected. The remaining entries of this switch were not written.
    #[error("Cannot write entry {index} ({rule}): {source}")]
    Write {
        /// Position of the entry in the catalog order of this switch.
        index: usize,
        /// The rule the rejected entry was compiled from.
        rule: String,
        #[source]
        source: WriteError,
    },
}

impl SwitchError {
    /// The step in which the switch failed. All steps before it completed successfully.
    pub fn failed_step(&self) -> Step {
        match self {
            SwitchError::Arbitration(_) => Step::Arbitrate,
            SwitchError::Pipeline(_) => Step::Install,
            SwitchError::Malformed { .. } | SwitchError::Write { .. } => Step::Apply,
        }
    }
}

/// The final state of a single switch after a bootstrap run.
#[derive(Debug)]
pub enum SwitchStatus {
    /// All rules were applied.
    Ready,
    /// The switch failed; its remaining steps were skipped.
    Failed(SwitchError),
    /// The run was interrupted before this switch completed its sequence.
    Aborted,
}

impl SwitchStatus {
    /// Whether the switch has reached `Ready`.
    pub fn is_ready(&self) -> bool {
        matches!(self, SwitchStatus::Ready)
    }
}

/// The per-switch outcome of a bootstrap run.
#[derive(Debug, Default)]
pub struct FleetReport {
    /// The final status of every switch of the fleet.
    pub statuses: BTreeMap<String, SwitchStatus>,
}

impl FleetReport {
    /// The run as a whole succeeded only if every switch reached [`SwitchStatus::Ready`].
    pub fn all_ready(&self) -> bool {
        self.statuses.values().all(SwitchStatus::is_ready)
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, status) in &self.statuses {
            match status {
                SwitchStatus::Ready => writeln!(f, "{name}: Ready")?,
                SwitchStatus::Failed(e) => {
                    writeln!(f, "{name}: Failed during {}: {e}", e.failed_step())?
                }
                SwitchStatus::Aborted => writeln!(f, "{name}: Aborted")?,
            }
        }
        Ok(())
    }
}

/// A fleet-scoped error. Unlike a [`SwitchError`], this aborts the entire bootstrap run.
#[derive(Debug, Error)]
pub enum FleetError {
    /// A session could not be opened. A fleet with a missing device is not operational.
    #[error("Cannot open the session with {name}: {source}")]
    Connection {
        /// The switch whose session could not be opened.
        name: String,
        #[source]
        source: ConnectionError,
    },
    /// A device task panicked.
    #[error("Cannot join a device task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The fleet orchestrator. See the crate documentation for the bootstrap protocol it runs.
pub struct Fleet<B: SwitchBackend> {
    backend: Arc<B>,
    switches: Vec<SwitchIdentity>,
    tables: TableNames,
    catalog: RuleCatalog,
    artifact: Arc<PipelineArtifact>,
}

impl<B: SwitchBackend> Fleet<B> {
    /// Create a new orchestrator over the given backend. This only allocates structures; nothing
    /// is sent to any device before [`Fleet::run`] is called.
    pub fn new(
        backend: B,
        switches: Vec<SwitchIdentity>,
        tables: TableNames,
        catalog: RuleCatalog,
        artifact: PipelineArtifact,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            switches,
            tables,
            catalog,
            artifact: Arc::new(artifact),
        }
    }

    /// Run the bootstrap once and return the per-switch report.
    ///
    /// `shutdown` delivers the operator interrupt: upon reception, no new requests are issued,
    /// in-flight device sequences are abandoned, and all sessions are released. Fleet-scoped
    /// failures (any session that cannot be opened) abort the run with an error; device-scoped
    /// failures are reported in the [`FleetReport`] instead.
    pub async fn run(&self, shutdown: &broadcast::Sender<()>) -> Result<FleetReport, FleetError> {
        // subscribe before the first request leaves. A broadcast receiver only sees messages sent
        // after it subscribed, so a signal racing the open phase would otherwise be lost.
        let mut interrupted = shutdown.subscribe();
        let device_signals: Vec<_> = self.switches.iter().map(|_| shutdown.subscribe()).collect();

        // step 1: open one session per switch, in parallel
        log::info!("Open the sessions with all {} switches", self.switches.len());
        let mut jobs = Vec::new();
        for identity in self.switches.iter().cloned() {
            let backend = self.backend.clone();
            let mut signal = shutdown.subscribe();
            jobs.push(tokio::spawn(async move {
                let session = tokio::select! {
                    _ = signal.recv() => {
                        log::warn!("[{}] Interrupted! The session is not opened.", identity.name);
                        None
                    }
                    session = backend.open(&identity) => Some(session),
                };
                (identity, session)
            }));
        }

        let mut sessions = Vec::new();
        let mut fatal: Option<FleetError> = None;
        for job in jobs {
            let (identity, session) = job.await?;
            match session {
                Some(Ok(session)) => sessions.push((identity, session)),
                Some(Err(e)) => {
                    log::error!("[{}] Cannot open the session: {e}", identity.name);
                    fatal.get_or_insert(FleetError::Connection {
                        name: identity.name,
                        source: e,
                    });
                }
                None => {}
            }
        }

        // a signal during the open phase ends the run before any further request
        if !matches!(
            interrupted.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ) {
            log::warn!("Interrupted during session setup! Releasing the opened sessions.");
            for (_, mut session) in sessions {
                session.close().await;
            }
            return Ok(FleetReport {
                statuses: self
                    .switches
                    .iter()
                    .map(|s| (s.name.clone(), SwitchStatus::Aborted))
                    .collect(),
            });
        }

        if let Some(e) = fatal {
            // release whatever was opened before aborting the run
            for (_, mut session) in sessions {
                session.close().await;
            }
            return Err(e);
        }

        // steps 2 to 4: drive every switch through its sequence, one task per switch. Each task
        // takes one of the receivers subscribed up front, so a signal sent in the meantime is
        // still delivered.
        let mut jobs = Vec::new();
        for ((identity, mut session), mut signal) in sessions.into_iter().zip(device_signals) {
            let artifact = self.artifact.clone();
            let tables = self.tables.clone();
            let rules = self.catalog.rules_for(&identity.name).to_vec();
            jobs.push(tokio::spawn(async move {
                let status = tokio::select! {
                    _ = signal.recv() => {
                        log::warn!("[{}] Interrupted! No further requests are issued.", identity.name);
                        SwitchStatus::Aborted
                    }
                    status = bootstrap_switch(&mut session, &artifact, &tables, &rules) => status,
                };
                (identity, status, session)
            }));
        }

        // steps 5 and 6: collect the per-switch report and release every session exactly once
        let mut statuses = BTreeMap::new();
        for job in jobs {
            let (identity, status, mut session) = job.await?;
            session.close().await;
            statuses.insert(identity.name, status);
        }

        let report = FleetReport { statuses };
        if report.all_ready() {
            log::info!("All switches are ready");
        } else {
            log::warn!("Bootstrap incomplete:\n{report}");
        }
        Ok(report)
    }
}

/// Drive a single switch through arbitration, pipeline installation and rule application. The
/// order of these steps is mandatory; the sequences of different switches run independently.
async fn bootstrap_switch<S: SwitchSession>(
    session: &mut S,
    artifact: &PipelineArtifact,
    tables: &TableNames,
    rules: &[LogicalRule],
) -> SwitchStatus {
    // step 2: arbitration. Entries may only be written to a mastered session.
    if let Err(e) = session.claim_mastership().await {
        log::error!("[{}] Arbitration failed: {e}", session.name());
        return SwitchStatus::Failed(SwitchError::Arbitration(e));
    }
    log::debug!("[{}] Mastership granted", session.name());

    // step 3: install the shared pipeline artifact
    if let Err(e) = session.install_pipeline(artifact).await {
        log::error!("[{}] Cannot install the pipeline: {e}", session.name());
        return SwitchStatus::Failed(SwitchError::Pipeline(e));
    }
    log::debug!("[{}] Pipeline installed", session.name());

    // step 4: compile the full rule sequence before writing anything. A malformed rule must fail
    // before any RPC, and a partially written table is worse than an empty one.
    let mut entries = Vec::with_capacity(rules.len());
    for (index, rule) in rules.iter().enumerate() {
        match compile(rule, tables) {
            Ok(entry) => entries.push(entry),
            Err(source) => {
                log::error!("[{}] Rule {index} is malformed: {source}", session.name());
                return SwitchStatus::Failed(SwitchError::Malformed {
                    index,
                    rule: rule.to_string(),
                    source,
                });
            }
        }
    }

    // write the entries in catalog order, stopping at the first rejected entry
    for (index, (rule, entry)) in rules.iter().zip(&entries).enumerate() {
        if let Err(source) = session.write_entry(entry).await {
            log::error!(
                "[{}] Cannot write entry {index} ({entry}): {source}",
                session.name(),
            );
            return SwitchStatus::Failed(SwitchError::Write {
                index,
                rule: rule.to_string(),
                source,
            });
        }
        log::trace!("[{}] Installed {entry}", session.name());
    }

    log::info!("[{}] All {} entries applied", session.name(), entries.len());
    SwitchStatus::Ready
}
