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

//! Plain struct-of-structs configuration, mirroring the workspace's
//! `Settings`/`Settings::from_env()` pattern but kept as ordinary data
//! rather than a process-wide singleton: callers build one, tweak fields,
//! and pass it to [`crate::bpa::Bpa::new`].

use std::env;

#[derive(Debug, Clone)]
pub struct IpndConfig {
    pub send_interval_ms: u64,
    pub beacon_max_size: usize,
}

#[derive(Debug, Clone)]
pub struct MtcpConfig {
    pub max_connections_waiting: usize,
    pub max_connections_open_receive: usize,
    pub timeout_inactive_receive_ms: u64,
    pub timeout_stalled_send_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    pub beacon_udp: u16,
    pub rest: u16,
    pub mtcp: u16,
    pub ipnd: u16,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_stored_bundles: usize,
    pub max_known_bundle_ids: usize,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub min_nodes_to_forward_to: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_uri: String,
    pub send_status_reports_enabled: bool,
    pub attach_previous_node_block: bool,
    pub ipnd: IpndConfig,
    pub mtcp: MtcpConfig,
    pub port: PortConfig,
    pub store: StoreConfig,
    pub router: RouterConfig,
}

impl Default for Config {
    /// The "host" preset: generous caps for a general-purpose machine. See
    /// [`Config::constrained`] for the embedded-device preset.
    fn default() -> Self {
        Config {
            node_uri: "dtn://defaultnodeid/".into(),
            send_status_reports_enabled: false,
            attach_previous_node_block: true,
            ipnd: IpndConfig {
                send_interval_ms: 10_000,
                beacon_max_size: 4096,
            },
            mtcp: MtcpConfig {
                max_connections_waiting: 16,
                max_connections_open_receive: 16,
                timeout_inactive_receive_ms: 60_000,
                timeout_stalled_send_ms: 5_000,
            },
            port: PortConfig {
                beacon_udp: 7000,
                rest: 3000,
                mtcp: 16162,
                ipnd: 3003,
            },
            store: StoreConfig {
                max_stored_bundles: 1024,
                max_known_bundle_ids: 4096,
            },
            router: RouterConfig {
                min_nodes_to_forward_to: 3,
            },
        }
    }
}

impl Config {
    /// The constrained-device preset: small caps and a smaller beacon,
    /// mirroring the original implementation's MicroPython/CPython split.
    pub fn constrained(node_uri: impl Into<String>) -> Self {
        Config {
            node_uri: node_uri.into(),
            ipnd: IpndConfig {
                send_interval_ms: 10_000,
                beacon_max_size: 256,
            },
            mtcp: MtcpConfig {
                max_connections_waiting: 2,
                max_connections_open_receive: 2,
                timeout_inactive_receive_ms: 30_000,
                timeout_stalled_send_ms: 5_000,
            },
            store: StoreConfig {
                max_stored_bundles: 18,
                max_known_bundle_ids: 18,
            },
            ..Config::default()
        }
    }

    /// Reads the handful of deployment-varying values from the environment,
    /// falling back to [`Config::default`] for anything unset.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(value) = env::var("BPA_NODE_URI") {
            config.node_uri = value;
        }
        if let Ok(value) = env::var("BPA_PORT_MTCP") {
            if let Ok(port) = value.parse() {
                config.port.mtcp = port;
            }
        }
        if let Ok(value) = env::var("BPA_PORT_IPND") {
            if let Ok(port) = value.parse() {
                config.port.ipnd = port;
            }
        }
        if let Ok(value) = env::var("BPA_PORT_REST") {
            if let Ok(port) = value.parse() {
                config.port.rest = port;
            }
        }
        if let Ok(value) = env::var("BPA_SEND_STATUS_REPORTS") {
            config.send_status_reports_enabled = value == "true";
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_the_host_preset() {
        let config = Config::default();
        assert_eq!(config.store.max_stored_bundles, 1024);
        assert_eq!(config.ipnd.beacon_max_size, 4096);
    }

    #[test]
    fn constrained_shrinks_caps_and_keeps_node_uri() {
        let config = Config::constrained("dtn://tiny/");
        assert_eq!(config.node_uri, "dtn://tiny/");
        assert_eq!(config.store.max_stored_bundles, 18);
        assert_eq!(config.ipnd.beacon_max_size, 256);
        assert_eq!(config.port.mtcp, 16162);
    }
}
