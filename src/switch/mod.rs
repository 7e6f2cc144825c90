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

//! This module defines the seam between the orchestrator and the wire-level transport: the
//! [`SwitchBackend`] and [`SwitchSession`] traits, the per-switch identity, the shared pipeline
//! artifact, and the session error taxonomy. The orchestrator requires exactly these operations of
//! a transport, nothing more.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::compiler::TableEntryDescriptor;

pub mod bmv2;

/// The static identity of one switch in the fleet. Created once at startup from the fleet
/// configuration and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwitchIdentity {
    /// Human-readable switch name. Also the key into the rule catalog.
    pub name: String,
    /// Control-plane address of the switch, as `host:port`.
    pub addr: String,
    /// Device ID, unique within the fleet.
    pub device_id: u64,
}

/// The data-plane program bundle installed on every switch of the fleet: the program metadata
/// descriptor and the compiled data-plane image. Both are opaque to the controller. The artifact
/// is shared read-only across all sessions; no per-device variation exists.
#[derive(Debug, Clone)]
pub struct PipelineArtifact {
    /// The raw program metadata descriptor (p4info).
    pub p4info: Vec<u8>,
    /// The raw compiled data-plane image.
    pub image: Vec<u8>,
    /// The path of the compiled image, for backends that load the image by filename.
    pub image_path: PathBuf,
}

impl PipelineArtifact {
    /// Load the artifact from the two files produced by the data-plane compiler.
    pub async fn load(
        p4info: impl AsRef<Path>,
        image: impl AsRef<Path>,
    ) -> std::io::Result<Self> {
        let p4info = tokio::fs::read(p4info.as_ref()).await?;
        let image_path = image.as_ref().to_path_buf();
        let image = tokio::fs::read(&image_path).await?;
        log::debug!(
            "Loaded the pipeline artifact ({} bytes of metadata, {} bytes of image)",
            p4info.len(),
            image.len(),
        );
        Ok(Self {
            p4info,
            image,
            image_path,
        })
    }
}

/// A transport that can open control sessions with switches.
#[async_trait]
pub trait SwitchBackend: Send + Sync + 'static {
    /// The session type produced by this backend.
    type Session: SwitchSession;

    /// Open a control session with the given switch. This establishes the connection but claims
    /// nothing yet; mastership is a separate step on the session itself.
    async fn open(&self, identity: &SwitchIdentity) -> Result<Self::Session, ConnectionError>;
}

/// One live control session, bound to exactly one switch.
///
/// The orchestrator guarantees the call order `claim_mastership` → `install_pipeline` →
/// `write_entry`* → `close` on every session, and never issues two calls to the same session
/// concurrently.
#[async_trait]
pub trait SwitchSession: Send + 'static {
    /// The name of the switch this session is bound to.
    fn name(&self) -> &str;

    /// Claim mastership: become the sole authoritative writer for this device. Must succeed
    /// before any other write operation is attempted.
    async fn claim_mastership(&mut self) -> Result<(), ArbitrationError>;

    /// Install the data-plane program on the switch.
    async fn install_pipeline(&mut self, artifact: &PipelineArtifact) -> Result<(), PipelineError>;

    /// Write a single table entry. Each call affects exactly one entry; no batching is assumed.
    async fn write_entry(&mut self, entry: &TableEntryDescriptor) -> Result<(), WriteError>;

    /// Release the session. Idempotent, and must not fail on an already-closed session.
    async fn close(&mut self);
}

/// The device cannot be reached, or refuses the control session. This error is fatal for the
/// entire bootstrap run: a fleet with a missing device is not operational.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The switch address is not of the form `host:port`.
    #[error("Invalid switch address '{0}'")]
    BadAddress(String),
    /// The device did not answer in time.
    #[error("Timeout while establishing the session")]
    Timeout,
    /// The device is not reachable.
    #[error("Cannot reach the device: {0}")]
    Unreachable(String),
}

/// Mastership was not granted. Scoped to one device; other devices continue independently.
#[derive(Debug, Error)]
pub enum ArbitrationError {
    /// Another controller is already master of this device.
    #[error("Mastership not granted: {0} is already master")]
    NotGranted(String),
    /// The arbitration handshake itself failed.
    #[error("Arbitration failed: {0}")]
    Failed(String),
}

/// The device rejected the data-plane program. Scoped to one device.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The device rejected the program (bad artifact, device mismatch).
    #[error("The device rejected the program: {0}")]
    Rejected(String),
    /// The installation did not complete.
    #[error("Pipeline installation failed: {0}")]
    Failed(String),
}

/// A single table entry was rejected. Scoped to one device, and halts the remaining entry
/// sequence of that device.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The device rejected the entry (duplicate, device-side validation, resource exhaustion).
    #[error("The device rejected the entry: {0}")]
    Rejected(String),
    /// The write did not complete.
    #[error("Write failed: {0}")]
    Failed(String),
}
