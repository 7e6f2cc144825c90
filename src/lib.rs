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

//! This library bootstraps the control plane of a small fleet of programmable packet switches: it
//! opens one control session per switch, claims mastership of every device, installs the compiled
//! data-plane program, and populates the match-action tables from a declarative rule catalog.
//!
//! # Bootstrap Protocol
//!
//! One bootstrap run executes the following steps:
//!
//! 1. **Open**: create one control session per switch. A fleet with a missing device is not
//!    operational, so a single failure here aborts the entire run.
//! 2. **Arbitrate**: claim mastership on every open session. From this point on, the devices are
//!    independent: a failure on one device never affects the others.
//! 3. **Install**: install the shared pipeline artifact on every mastered session.
//! 4. **Apply**: compile every rule of the catalog into a table-entry descriptor and write the
//!    entries in catalog order, stopping at the first rejected entry of a device.
//! 5. **Report**: collect the final per-switch status. The run only succeeds if every switch
//!    reaches `Ready`.
//! 6. **Cleanup**: release every opened session exactly once, also on errors and on interrupt.
//!
//! Within one device the order of these steps is mandatory. Across devices, steps 2 to 4 run
//! concurrently, one task per switch.
//!
//! # Example
//!
//! ```rust,no_run
//! use p4fleet::switch::bmv2::Bmv2Backend;
//! use p4fleet::{Fleet, FleetConfig, PipelineArtifact, RuleCatalog};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let config = FleetConfig::load("config/fleet.toml")?;
//! let catalog = RuleCatalog::load("config/rules.toml", &config.switches)?;
//! let artifact = PipelineArtifact::load("build/program.p4info.txt", "build/program.json").await?;
//!
//! let backend = Bmv2Backend::new("simple_switch_CLI", None);
//! let fleet = Fleet::new(backend, config.switches, config.tables, catalog, artifact);
//!
//! let (shutdown, _) = tokio::sync::broadcast::channel(1);
//! let report = fleet.run(&shutdown).await?;
//! assert!(report.all_ready());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod compiler;
pub mod config;
pub mod fleet;
pub mod switch;

pub use catalog::{CatalogError, LogicalRule, RuleCatalog};
pub use compiler::{compile, MalformedRule, TableEntryDescriptor};
pub use config::{ConfigError, FleetConfig, TableNames};
pub use fleet::{Fleet, FleetError, FleetReport, SwitchError, SwitchStatus};
pub use switch::{PipelineArtifact, SwitchBackend, SwitchIdentity, SwitchSession};

#[cfg(test)]
mod test;
