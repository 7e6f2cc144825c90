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

//! This module contains the code for reading the fleet configuration.

use std::collections::HashSet;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::switch::SwitchIdentity;

/// The fleet configuration, read from a TOML file. It lists every switch under the controller's
/// mastership, together with the table and action names of the data-plane program.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// All switches of the fleet.
    #[serde(rename = "switch")]
    pub switches: Vec<SwitchIdentity>,
    /// Table, action and field names of the data-plane program.
    #[serde(default)]
    pub tables: TableNames,
}

impl FleetConfig {
    /// Read the fleet configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Self::from_toml_str(&raw)
    }

    /// Parse the fleet configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all switch addresses are of the form `host:port`, and that names and device IDs
    /// are unique within the fleet.
    fn validate(&self) -> Result<(), ConfigError> {
        lazy_static! {
            static ref ADDR_RE: Regex = Regex::new(r"^[0-9a-zA-Z.\-]+:[0-9]{1,5}$").unwrap();
        }
        let mut seen_names = HashSet::new();
        let mut seen_ids = HashSet::new();
        for switch in &self.switches {
            if !ADDR_RE.is_match(&switch.addr) {
                return Err(ConfigError::BadAddress(
                    switch.name.clone(),
                    switch.addr.clone(),
                ));
            }
            if !seen_names.insert(switch.name.as_str()) {
                return Err(ConfigError::DuplicateName(switch.name.clone()));
            }
            if !seen_ids.insert(switch.device_id) {
                return Err(ConfigError::DuplicateDeviceId(switch.device_id));
            }
        }
        Ok(())
    }
}

/// Names of the tables, match fields, actions and action parameters of the installed data-plane
/// program. The defaults match the tutorial forwarding and firewall programs; a fleet running a
/// program with different names overrides them in the `[tables]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TableNames {
    /// The longest-prefix forwarding table.
    pub lpm_table: String,
    /// The destination-address match field of the forwarding table.
    pub lpm_match_field: String,
    /// The forwarding action.
    pub forward_action: String,
    /// The destination MAC parameter of the forwarding action.
    pub forward_mac_param: String,
    /// The egress port parameter of the forwarding action.
    pub forward_port_param: String,
    /// The port-check table of the direction-tagging variant.
    pub port_check_table: String,
    /// The ingress-port match field of the port-check table.
    pub ingress_port_field: String,
    /// The egress-port match field of the port-check table.
    pub egress_port_field: String,
    /// The direction-tagging action.
    pub set_direction_action: String,
    /// The direction tag parameter of the tagging action.
    pub direction_param: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            lpm_table: String::from("MyIngress.ipv4_lpm"),
            lpm_match_field: String::from("hdr.ipv4.dstAddr"),
            forward_action: String::from("MyIngress.ipv4_forward"),
            forward_mac_param: String::from("dstAddr"),
            forward_port_param: String::from("port"),
            port_check_table: String::from("MyIngress.check_ports"),
            ingress_port_field: String::from("standard_metadata.ingress_port"),
            egress_port_field: String::from("standard_metadata.egress_spec"),
            set_direction_action: String::from("MyIngress.set_direction"),
            direction_param: String::from("dir"),
        }
    }
}

/// Error kind raised while reading the fleet configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("Cannot read '{0}': {1}")]
    Read(String, #[source] std::io::Error),
    /// The configuration is not valid TOML.
    #[error("Cannot parse the configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A switch address is not of the form `host:port`.
    #[error("Invalid address '{1}' for switch {0} (expected 'host:port')")]
    BadAddress(String, String),
    /// Two switches carry the same name.
    #[error("Switch {0} is declared twice")]
    DuplicateName(String),
    /// Two switches carry the same device ID.
    #[error("Device ID {0} is assigned twice")]
    DuplicateDeviceId(u64),
}
