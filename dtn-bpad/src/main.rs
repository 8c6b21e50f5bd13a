// Copyright (C) 2023 Felix Huettner
//
// This file is part of DTRD.
//
// DTRD is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// DTRD is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Thin assembly binary: builds a [`dtn_bpa::bpa::Bpa`] from [`Config`],
//! wires up its convergence layers and neighbor discovery, then drives it
//! with a plain blocking loop. No actor system and no async runtime here:
//! the agent's own concurrency model is the cooperative `update()` tick
//! described in its crate docs, and a daemon sitting on top of it needs
//! nothing more than calling that tick on a timer.

use std::thread;
use std::time::Duration;

use log::{error, info};

use dtn_bpa::bpa::Bpa;
use dtn_bpa::cla::mtcp::{self, MtcpCla};
use dtn_bpa::cla::ClaEntry;
use dtn_bpa::clock::SystemClock;
use dtn_bpa::config::Config;
use dtn_bpa::ipnd::{Beacon, Ipnd};

const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("starting up");

    let config = Config::from_env();
    info!("starting with config: {config:?}");

    let bpa = match Bpa::new(config.clone(), Box::new(SystemClock::default())) {
        Ok(bpa) => bpa,
        Err(e) => {
            error!("invalid configuration: {e}");
            return;
        }
    };

    match MtcpCla::bind(
        config.port.mtcp,
        config.mtcp.max_connections_open_receive,
        config.mtcp.timeout_inactive_receive_ms,
        config.mtcp.timeout_stalled_send_ms,
    ) {
        Ok(cla) => bpa.borrow_mut().register_cla(mtcp::CLA_IDENTIFIER, ClaEntry::Push(Box::new(cla))),
        Err(e) => error!("could not bind mtcp convergence layer on port {}: {e}", config.port.mtcp),
    }

    let eid_specific = config.node_uri.strip_prefix("dtn:").unwrap_or(&config.node_uri).to_string();
    let own_beacon = Beacon::new(Some((1, eid_specific)), (vec![(mtcp::CLA_IDENTIFIER.to_string(), config.port.mtcp)], std::collections::HashMap::new()));
    match Ipnd::bind(
        config.port.beacon_udp,
        config.port.ipnd,
        config.ipnd.beacon_max_size,
        config.ipnd.send_interval_ms,
        vec!["255.255.255.255".to_string()],
        Vec::new(),
        own_beacon,
    ) {
        Ok(ipnd) => bpa.borrow_mut().bind_ipnd(ipnd),
        Err(e) => error!("could not bind ip neighbor discovery on port {}: {e}", config.port.beacon_udp),
    }

    info!("node {} is up, entering the update loop", bpa.borrow().node_uri());
    loop {
        bpa.borrow_mut().update();
        thread::sleep(UPDATE_INTERVAL);
    }
}
