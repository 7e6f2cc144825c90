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

//! Bootstrap a fleet of BMv2 switches: install the pipeline and apply the rule catalog.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tokio::sync::broadcast;

use p4fleet::switch::bmv2::Bmv2Backend;
use p4fleet::{Fleet, FleetConfig, PipelineArtifact, RuleCatalog};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Path of the program metadata descriptor produced by the data-plane compiler.
    #[clap(long = "p4info", default_value = "build/program.p4info.txt")]
    p4info: PathBuf,
    /// Path of the compiled data-plane image.
    #[clap(long = "bmv2-json", default_value = "build/program.json")]
    bmv2_json: PathBuf,
    /// Path of the fleet configuration (switch names, addresses, device IDs).
    #[clap(long = "fleet", default_value = "config/fleet.toml")]
    fleet: PathBuf,
    /// Path of the rule catalog.
    #[clap(long = "rules", default_value = "config/rules.toml")]
    rules: PathBuf,
    /// Record every request sent to each switch in this directory.
    #[clap(long = "logs")]
    logs: Option<PathBuf>,
    /// The BMv2 runtime CLI program to invoke.
    #[clap(long = "cli", default_value = "simple_switch_CLI")]
    cli: String,
}

fn main() {
    pretty_env_logger::init_timed();
    let cli = Cli::parse();

    for path in [&cli.p4info, &cli.bmv2_json, &cli.fleet, &cli.rules] {
        if !path.exists() {
            eprintln!("File not found: {}", path.display());
            exit(2);
        }
    }

    let config = match FleetConfig::load(&cli.fleet) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid fleet configuration: {e}");
            exit(2);
        }
    };

    let catalog = match RuleCatalog::load(&cli.rules, &config.switches) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid rule catalog: {e}");
            exit(2);
        }
    };

    log::info!(
        "Bootstrapping {} switches with {} rules",
        config.switches.len(),
        catalog.len(),
    );

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .and_then(|rt| {
            rt.block_on(async move {
                let artifact = PipelineArtifact::load(&cli.p4info, &cli.bmv2_json).await?;
                let backend = Bmv2Backend::new(cli.cli, cli.logs);
                let fleet = Fleet::new(backend, config.switches, config.tables, catalog, artifact);

                // bridge ctrl-c into the shutdown channel
                let (shutdown, _) = broadcast::channel(1);
                let tx = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::warn!("Received an interrupt! Shutting down the fleet...");
                        let _ = tx.send(());
                    }
                });

                match fleet.run(&shutdown).await {
                    Ok(report) => {
                        print!("{report}");
                        Ok(report.all_ready())
                    }
                    Err(e) => {
                        eprintln!("Bootstrap aborted: {e}");
                        Ok(false)
                    }
                }
            })
        });

    match result {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    }
}
