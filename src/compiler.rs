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

//! The entry compiler translates a single [`LogicalRule`] into the table-entry descriptor that is
//! written to the device. The translation is a pure function: deterministic, free of side effects,
//! and safe to call concurrently. All shape validation (prefix length, MAC format, port numbers)
//! happens here, so that a malformed rule fails before any request reaches a device.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::catalog::LogicalRule;
use crate::config::TableNames;

/// The value a single match field is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    /// Exact match on a numeric field.
    Exact(u64),
    /// Longest-prefix match on an IPv4 destination.
    Lpm(Ipv4Addr, u8),
}

impl fmt::Display for MatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchValue::Exact(x) => x.fmt(f),
            MatchValue::Lpm(addr, len) => write!(f, "{addr}/{len}"),
        }
    }
}

/// The value of a single action parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionValue {
    /// A MAC address.
    Mac([u8; 6]),
    /// A plain number (port number, direction tag, ...).
    Number(u64),
}

impl fmt::Display for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionValue::Mac(mac) => {
                write!(f, "{}", mac.iter().map(|b| format!("{b:02x}")).join(":"))
            }
            ActionValue::Number(x) => x.fmt(f),
        }
    }
}

/// One match-action entry, ready to be written into a named table on a device.
///
/// The match-field and action-parameter sequences preserve the declared order. Some backends are
/// order-sensitive (in particular for prefix matches), so this is part of the contract, not an
/// implementation detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntryDescriptor {
    /// The table to write into.
    pub table: String,
    /// Ordered match fields, as pairs of field name and match value.
    pub matches: Vec<(String, MatchValue)>,
    /// The action to execute on a match.
    pub action: String,
    /// Ordered action parameters, as pairs of parameter name and value.
    pub params: Vec<(String, ActionValue)>,
}

impl fmt::Display for TableEntryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{ {} }} -> {}({})",
            self.table,
            self.matches.iter().map(|(k, v)| format!("{k}: {v}")).join(", "),
            self.action,
            self.params.iter().map(|(k, v)| format!("{k}: {v}")).join(", "),
        )
    }
}

/// Error kind raised when a rule violates its shape constraints. This is always raised before any
/// request is sent to a device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedRule {
    /// The IPv4 prefix length lies outside of `0..=32`.
    #[error("Invalid IPv4 prefix length /{0}")]
    PrefixLength(u8),
    /// The MAC address is not in canonical 6-octet colon-hex form.
    #[error("Invalid MAC address '{0}'")]
    MacAddress(String),
    /// Port numbers are strictly positive.
    #[error("Invalid port number {0}")]
    Port(u32),
}

/// Compile a logical rule into its table-entry descriptor.
///
/// The same rule always compiles to the same descriptor, and two distinct rules never compile to
/// the same descriptor. Port legality with respect to the device's port count is not checked here;
/// the device itself is the authoritative source for that.
pub fn compile(
    rule: &LogicalRule,
    tables: &TableNames,
) -> Result<TableEntryDescriptor, MalformedRule> {
    match rule {
        LogicalRule::Forwarding {
            dst_mac,
            dst_addr,
            prefix_len,
            egress_port,
        } => {
            Ipv4Net::new(*dst_addr, *prefix_len)
                .map_err(|_| MalformedRule::PrefixLength(*prefix_len))?;
            let mac = parse_mac(dst_mac)?;
            let port = check_port(*egress_port)?;
            Ok(TableEntryDescriptor {
                table: tables.lpm_table.clone(),
                matches: vec![(
                    tables.lpm_match_field.clone(),
                    MatchValue::Lpm(*dst_addr, *prefix_len),
                )],
                action: tables.forward_action.clone(),
                params: vec![
                    (tables.forward_mac_param.clone(), ActionValue::Mac(mac)),
                    (tables.forward_port_param.clone(), ActionValue::Number(port)),
                ],
            })
        }
        LogicalRule::PortPair {
            ingress_port,
            egress_port,
            direction,
        } => {
            let ingress = check_port(*ingress_port)?;
            let egress = check_port(*egress_port)?;
            Ok(TableEntryDescriptor {
                table: tables.port_check_table.clone(),
                matches: vec![
                    (tables.ingress_port_field.clone(), MatchValue::Exact(ingress)),
                    (tables.egress_port_field.clone(), MatchValue::Exact(egress)),
                ],
                action: tables.set_direction_action.clone(),
                params: vec![(
                    tables.direction_param.clone(),
                    ActionValue::Number(u64::from(*direction)),
                )],
            })
        }
    }
}

/// Parse a MAC address in canonical colon-hex form (six two-digit groups).
fn parse_mac(raw: &str) -> Result<[u8; 6], MalformedRule> {
    lazy_static! {
        static ref MAC_RE: Regex = Regex::new(r"^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$").unwrap();
    }
    if !MAC_RE.is_match(raw) {
        return Err(MalformedRule::MacAddress(raw.to_string()));
    }
    let mut mac = [0u8; 6];
    for (byte, group) in mac.iter_mut().zip(raw.split(':')) {
        *byte = u8::from_str_radix(group, 16).expect("already checked");
    }
    Ok(mac)
}

/// Ports are strictly positive. Whether the port exists on the device is up to the device.
fn check_port(port: u32) -> Result<u64, MalformedRule> {
    if port == 0 {
        Err(MalformedRule::Port(port))
    } else {
        Ok(u64::from(port))
    }
}
