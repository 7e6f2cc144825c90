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

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maplit::{hashmap, hashset};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use crate::catalog::{LogicalRule, RuleCatalog};
use crate::compiler::TableEntryDescriptor;
use crate::config::TableNames;
use crate::fleet::{Fleet, FleetError, SwitchError, SwitchStatus};
use crate::switch::{
    ArbitrationError, ConnectionError, PipelineArtifact, PipelineError, SwitchBackend,
    SwitchIdentity, SwitchSession, WriteError,
};

/// Everything a mock session observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Open(String),
    Arbitrate(String),
    Install(String),
    Write(String, String),
    Close(String),
}

use Event::*;

/// A backend whose sessions only record their calls, with per-switch failure injection.
#[derive(Debug, Default, Clone)]
struct MockBackend {
    events: Arc<Mutex<Vec<Event>>>,
    fail_open: HashSet<String>,
    slow_open: HashSet<String>,
    fail_arbitration: HashSet<String>,
    fail_write_at: HashMap<String, usize>,
    hang_install: bool,
}

impl MockBackend {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

struct MockSession {
    name: String,
    events: Arc<Mutex<Vec<Event>>>,
    fail_arbitration: bool,
    fail_write_at: Option<usize>,
    hang_install: bool,
    writes: usize,
}

impl MockSession {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl SwitchBackend for MockBackend {
    type Session = MockSession;

    async fn open(&self, identity: &SwitchIdentity) -> Result<MockSession, ConnectionError> {
        self.events
            .lock()
            .unwrap()
            .push(Open(identity.name.clone()));
        if self.fail_open.contains(&identity.name) {
            return Err(ConnectionError::Unreachable(String::from("no route")));
        }
        if self.slow_open.contains(&identity.name) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(MockSession {
            name: identity.name.clone(),
            events: self.events.clone(),
            fail_arbitration: self.fail_arbitration.contains(&identity.name),
            fail_write_at: self.fail_write_at.get(&identity.name).copied(),
            hang_install: self.hang_install,
            writes: 0,
        })
    }
}

#[async_trait]
impl SwitchSession for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn claim_mastership(&mut self) -> Result<(), ArbitrationError> {
        self.record(Arbitrate(self.name.clone()));
        if self.fail_arbitration {
            return Err(ArbitrationError::NotGranted(String::from("intruder")));
        }
        Ok(())
    }

    async fn install_pipeline(&mut self, _: &PipelineArtifact) -> Result<(), PipelineError> {
        self.record(Install(self.name.clone()));
        if self.hang_install {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn write_entry(&mut self, entry: &TableEntryDescriptor) -> Result<(), WriteError> {
        let index = self.writes;
        self.writes += 1;
        self.record(Write(self.name.clone(), entry.to_string()));
        if self.fail_write_at == Some(index) {
            return Err(WriteError::Rejected(String::from("table is full")));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.record(Close(self.name.clone()));
    }
}

fn identities(names: &[&str]) -> Vec<SwitchIdentity> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| SwitchIdentity {
            name: String::from(*name),
            addr: format!("127.0.0.1:{}", 9090 + i),
            device_id: i as u64,
        })
        .collect()
}

fn forwarding(last: u8, port: u32) -> LogicalRule {
    LogicalRule::Forwarding {
        dst_mac: format!("08:00:00:00:01:{last:02x}"),
        dst_addr: Ipv4Addr::new(10, 0, 1, last),
        prefix_len: 32,
        egress_port: port,
    }
}

fn fleet(
    backend: MockBackend,
    names: &[&str],
    rules: Vec<(&str, LogicalRule)>,
) -> Fleet<MockBackend> {
    let switches = identities(names);
    let catalog = RuleCatalog::from_rules(rules, &switches).unwrap();
    let artifact = PipelineArtifact {
        p4info: Vec::new(),
        image: Vec::new(),
        image_path: PathBuf::from("program.json"),
    };
    Fleet::new(backend, switches, TableNames::default(), catalog, artifact)
}

#[tokio::test]
async fn applies_rules_in_catalog_order() {
    let backend = MockBackend::default();
    let fleet = fleet(
        backend.clone(),
        &["s1"],
        vec![("s1", forwarding(1, 2)), ("s1", forwarding(2, 3))],
    );

    let (shutdown, _) = broadcast::channel(1);
    let report = fleet.run(&shutdown).await.unwrap();
    assert!(report.all_ready());

    assert_eq!(
        backend.events(),
        vec![
            Open(String::from("s1")),
            Arbitrate(String::from("s1")),
            Install(String::from("s1")),
            Write(
                String::from("s1"),
                String::from(
                    "MyIngress.ipv4_lpm { hdr.ipv4.dstAddr: 10.0.1.1/32 } \
                     -> MyIngress.ipv4_forward(dstAddr: 08:00:00:00:01:01, port: 2)"
                ),
            ),
            Write(
                String::from("s1"),
                String::from(
                    "MyIngress.ipv4_lpm { hdr.ipv4.dstAddr: 10.0.1.2/32 } \
                     -> MyIngress.ipv4_forward(dstAddr: 08:00:00:00:01:02, port: 3)"
                ),
            ),
            Close(String::from("s1")),
        ],
    );
}

#[tokio::test]
async fn arbitration_failure_is_isolated() {
    let backend = MockBackend {
        fail_arbitration: hashset! {String::from("s1")},
        ..Default::default()
    };
    let fleet = fleet(
        backend.clone(),
        &["s1", "s2"],
        vec![("s1", forwarding(1, 2)), ("s2", forwarding(2, 3))],
    );

    let (shutdown, _) = broadcast::channel(1);
    let report = fleet.run(&shutdown).await.unwrap();
    assert!(!report.all_ready());

    assert!(matches!(
        report.statuses["s1"],
        SwitchStatus::Failed(SwitchError::Arbitration(_)),
    ));
    assert!(report.statuses["s2"].is_ready());

    // the device without mastership received no further request
    assert_eq!(backend.count(|e| *e == Install(String::from("s1"))), 0);
    assert_eq!(backend.count(|e| matches!(e, Write(s, _) if s == "s1")), 0);
    // but its session was still released, exactly once
    assert_eq!(backend.count(|e| *e == Close(String::from("s1"))), 1);
    assert_eq!(backend.count(|e| *e == Close(String::from("s2"))), 1);
}

#[tokio::test]
async fn write_failure_stops_the_device() {
    let backend = MockBackend {
        fail_write_at: hashmap! {String::from("s1") => 2},
        ..Default::default()
    };
    let rules = (1..=5)
        .map(|i| ("s1", forwarding(i, 2)))
        .chain([("s2", forwarding(9, 4))])
        .collect();
    let fleet = fleet(backend.clone(), &["s1", "s2"], rules);

    let (shutdown, _) = broadcast::channel(1);
    let report = fleet.run(&shutdown).await.unwrap();

    // entries 0 and 1 succeeded, entry 2 was rejected, entries 3 and 4 were never attempted
    assert_eq!(backend.count(|e| matches!(e, Write(s, _) if s == "s1")), 3);
    assert!(matches!(
        report.statuses["s1"],
        SwitchStatus::Failed(SwitchError::Write { index: 2, .. }),
    ));
    // the failure stays scoped to s1
    assert!(report.statuses["s2"].is_ready());
    assert_eq!(backend.count(|e| matches!(e, Close(_))), 2);
}

#[tokio::test]
async fn malformed_rule_writes_nothing() {
    let backend = MockBackend::default();
    let bad = LogicalRule::Forwarding {
        dst_mac: String::from("08:00:00:00:01:01"),
        dst_addr: Ipv4Addr::new(10, 0, 1, 1),
        prefix_len: 33,
        egress_port: 2,
    };
    let fleet = fleet(
        backend.clone(),
        &["s1"],
        vec![("s1", bad), ("s1", forwarding(2, 3))],
    );

    let (shutdown, _) = broadcast::channel(1);
    let report = fleet.run(&shutdown).await.unwrap();

    assert!(matches!(
        report.statuses["s1"],
        SwitchStatus::Failed(SwitchError::Malformed { index: 0, .. }),
    ));
    // the valid rule behind the malformed one was not written either
    assert_eq!(backend.count(|e| matches!(e, Write(_, _))), 0);
    assert_eq!(backend.count(|e| *e == Close(String::from("s1"))), 1);
}

#[tokio::test]
async fn open_failure_aborts_the_run() {
    let backend = MockBackend {
        fail_open: hashset! {String::from("s1")},
        ..Default::default()
    };
    let fleet = fleet(
        backend.clone(),
        &["s1", "s2"],
        vec![("s2", forwarding(2, 3))],
    );

    let (shutdown, _) = broadcast::channel(1);
    let result = fleet.run(&shutdown).await;
    assert!(matches!(result, Err(FleetError::Connection { name, .. }) if name == "s1"));

    // no switch was bootstrapped, and the session that did open was released
    assert_eq!(backend.count(|e| matches!(e, Arbitrate(_))), 0);
    assert_eq!(backend.count(|e| matches!(e, Write(_, _))), 0);
    assert_eq!(backend.count(|e| *e == Close(String::from("s2"))), 1);
    assert_eq!(backend.count(|e| *e == Close(String::from("s1"))), 0);
}

#[tokio::test]
async fn interrupt_during_open_aborts_the_run() {
    let backend = MockBackend {
        slow_open: hashset! {String::from("s1")},
        ..Default::default()
    };
    let fleet = fleet(
        backend.clone(),
        &["s1", "s2"],
        vec![("s1", forwarding(1, 2)), ("s2", forwarding(2, 3))],
    );

    let (shutdown, _) = broadcast::channel(1);
    let tx = shutdown.clone();
    let run = tokio::spawn(async move { fleet.run(&shutdown).await });

    // interrupt while the session with s1 is still being opened
    while backend.count(|e| matches!(e, Open(_))) < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(()).unwrap();

    let report = run.await.unwrap().unwrap();
    assert!(!report.all_ready());
    assert!(matches!(report.statuses["s1"], SwitchStatus::Aborted));
    assert!(matches!(report.statuses["s2"], SwitchStatus::Aborted));

    // nothing was bootstrapped, and the one session that did open was released
    assert_eq!(backend.count(|e| matches!(e, Arbitrate(_))), 0);
    assert_eq!(backend.count(|e| matches!(e, Write(_, _))), 0);
    assert_eq!(backend.count(|e| *e == Close(String::from("s2"))), 1);
    assert_eq!(backend.count(|e| *e == Close(String::from("s1"))), 0);
}

#[tokio::test]
async fn interrupt_releases_all_sessions() {
    let backend = MockBackend {
        hang_install: true,
        ..Default::default()
    };
    let fleet = fleet(
        backend.clone(),
        &["s1", "s2"],
        vec![("s1", forwarding(1, 2)), ("s2", forwarding(2, 3))],
    );

    let (shutdown, _) = broadcast::channel(1);
    let tx = shutdown.clone();
    let run = tokio::spawn(async move { fleet.run(&shutdown).await });

    // wait until both devices are stuck in the pipeline installation, then interrupt
    while backend.count(|e| matches!(e, Install(_))) < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(()).unwrap();

    let report = run.await.unwrap().unwrap();
    assert!(!report.all_ready());
    assert!(matches!(report.statuses["s1"], SwitchStatus::Aborted));
    assert!(matches!(report.statuses["s2"], SwitchStatus::Aborted));

    // after the interrupt, no entry was written and every session was released exactly once
    assert_eq!(backend.count(|e| matches!(e, Write(_, _))), 0);
    assert_eq!(backend.count(|e| *e == Close(String::from("s1"))), 1);
    assert_eq!(backend.count(|e| *e == Close(String::from("s2"))), 1);
}
