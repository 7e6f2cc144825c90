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

//! The rule catalog holds the intended table contents for every switch of the fleet, expressed at
//! the level of intent ("traffic to 10.0.1.0/24 exits port 3") rather than wire encoding. The
//! catalog is authoritative input, not a planner: it performs no semantic checks beyond rejecting
//! rules that reference a switch outside of the fleet.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::switch::SwitchIdentity;

/// A single rule of the catalog. Each rule is scoped to exactly one switch of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LogicalRule {
    /// Destination-based forwarding: traffic towards the destination prefix leaves the switch
    /// through `egress_port`, with the destination MAC rewritten to `dst_mac`.
    Forwarding {
        /// The new destination MAC address, in canonical colon-hex form.
        dst_mac: String,
        /// The destination IPv4 address.
        dst_addr: Ipv4Addr,
        /// The prefix length of the destination prefix.
        prefix_len: u8,
        /// The port out of which matching traffic leaves the switch.
        egress_port: u32,
    },
    /// Direction tagging for one physical port pair (the access-control variant).
    PortPair {
        /// The port on which traffic enters the switch.
        ingress_port: u32,
        /// The port out of which traffic is about to leave the switch.
        egress_port: u32,
        /// The direction tag assigned to matching traffic.
        direction: u32,
    },
}

impl fmt::Display for LogicalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalRule::Forwarding {
                dst_mac,
                dst_addr,
                prefix_len,
                egress_port,
            } => write!(f, "{dst_addr}/{prefix_len} -> port {egress_port} ({dst_mac})"),
            LogicalRule::PortPair {
                ingress_port,
                egress_port,
                direction,
            } => write!(
                f,
                "port {ingress_port} -> port {egress_port}: direction {direction}"
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    /// The switch this rule is scoped to.
    switch: String,
    #[serde(flatten)]
    rule: LogicalRule,
}

/// The static catalog of intended table contents, keyed by switch name. The per-switch rule order
/// is the declaration order, and it is preserved exactly when the entries are written.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: BTreeMap<String, Vec<LogicalRule>>,
}

impl RuleCatalog {
    /// Build the catalog from `(switch, rule)` pairs, checking every referenced switch against the
    /// fleet. The rules of one switch keep the order in which they are given.
    pub fn from_rules<I, S>(rules: I, fleet: &[SwitchIdentity]) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = (S, LogicalRule)>,
        S: Into<String>,
    {
        let mut catalog = Self::default();
        for (switch, rule) in rules {
            let switch = switch.into();
            if !fleet.iter().any(|s| s.name == switch) {
                return Err(CatalogError::UnknownSwitch(switch));
            }
            catalog.rules.entry(switch).or_default().push(rule);
        }
        Ok(catalog)
    }

    /// Parse the catalog from a TOML string.
    pub fn from_toml_str(raw: &str, fleet: &[SwitchIdentity]) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(raw)?;
        Self::from_rules(file.rules.into_iter().map(|e| (e.switch, e.rule)), fleet)
    }

    /// Read the catalog from a file.
    pub fn load(path: impl AsRef<Path>, fleet: &[SwitchIdentity]) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Read(path.display().to_string(), e))?;
        Self::from_toml_str(&raw, fleet)
    }

    /// All rules scoped to the given switch, in declaration order. A switch without rules yields
    /// an empty slice.
    pub fn rules_for(&self, switch: &str) -> &[LogicalRule] {
        self.rules.get(switch).map(Vec::as_slice).unwrap_or_default()
    }

    /// The total number of rules in the catalog.
    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Whether the catalog contains no rules at all.
    pub fn is_empty(&self) -> bool {
        self.rules.values().all(Vec::is_empty)
    }
}

/// Error kind raised while constructing the rule catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Reading the rules file failed.
    #[error("Cannot read '{0}': {1}")]
    Read(String, #[source] std::io::Error),
    /// The rules file is not valid TOML.
    #[error("Cannot parse the rule catalog: {0}")]
    Parse(#[from] toml::de::Error),
    /// A rule references a switch that is not part of the fleet.
    #[error("Rule references unknown switch '{0}'")]
    UnknownSwitch(String),
}
