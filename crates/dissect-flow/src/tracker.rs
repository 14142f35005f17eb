//! 5-tuple keyed connection table with bidirectional reassemblers.
//!
//! Single-writer per key; wrap the tracker in external synchronization (or
//! shard it by key hash) when feeding it from multiple threads.

use crate::reassembly::{ReassemblerConfig, TcpReassembler};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Direction of travel relative to the connection initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Total-ordered 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub is_tcp: bool,
}

impl FlowKey {
    pub fn new(
        src_addr: IpAddr,
        dst_addr: IpAddr,
        src_port: u16,
        dst_port: u16,
        is_tcp: bool,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            is_tcp,
        }
    }

    /// The reply direction's key.
    pub fn reverse(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            is_tcp: self.is_tcp,
        }
    }

    /// A direction-independent key: both directions map to the same value.
    pub fn canonical(&self) -> Self {
        let forward = (self.src_addr, self.src_port);
        let backward = (self.dst_addr, self.dst_port);
        if forward <= backward {
            *self
        } else {
            self.reverse()
        }
    }
}

/// One tracked connection: a reassembler per direction plus its clock.
pub struct Connection {
    pub client_to_server: TcpReassembler,
    pub server_to_client: TcpReassembler,
    pub last_activity_ms: u64,
}

impl Connection {
    fn new(config: &ReassemblerConfig, now_ms: u64) -> Self {
        Self {
            client_to_server: TcpReassembler::new(config.clone()),
            server_to_client: TcpReassembler::new(config.clone()),
            last_activity_ms: now_ms,
        }
    }

    pub fn reassembler(&mut self, direction: Direction) -> &mut TcpReassembler {
        match direction {
            Direction::ClientToServer => &mut self.client_to_server,
            Direction::ServerToClient => &mut self.server_to_client,
        }
    }
}

/// Connection table. Entries are created on first touch and die by explicit
/// removal or inactivity sweep.
pub struct ConnectionTracker {
    connections: BTreeMap<FlowKey, Connection>,
    reassembler_config: ReassemblerConfig,
}

impl ConnectionTracker {
    pub fn new(reassembler_config: ReassemblerConfig) -> Self {
        Self {
            connections: BTreeMap::new(),
            reassembler_config,
        }
    }

    /// Fetch (or create) the connection for `key`, refreshing its clock.
    pub fn touch(&mut self, key: FlowKey, now_ms: u64) -> &mut Connection {
        let config = &self.reassembler_config;
        let connection = self
            .connections
            .entry(key)
            .or_insert_with(|| Connection::new(config, now_ms));
        connection.last_activity_ms = now_ms;
        connection
    }

    /// The reassembler for one direction of `key`.
    pub fn reassembler(
        &mut self,
        key: FlowKey,
        direction: Direction,
        now_ms: u64,
    ) -> &mut TcpReassembler {
        self.touch(key, now_ms).reassembler(direction)
    }

    pub fn get(&self, key: &FlowKey) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn remove_connection(&mut self, key: &FlowKey) -> bool {
        self.connections.remove(key).is_some()
    }

    /// Drop every connection idle longer than `threshold_ms`. Returns the
    /// number removed.
    pub fn cleanup_old_connections(&mut self, now_ms: u64, threshold_ms: u64) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, c| now_ms.saturating_sub(c.last_activity_ms) <= threshold_ms);
        let removed = before - self.connections.len();
        if removed > 0 {
            tracing::debug!(removed, "swept idle connections");
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}
