//! Process-wide map from numeric protocol id to dissector factory.
//!
//! Protocol ids follow wire conventions: EtherTypes for link-layer payloads
//! (0x0800 IPv4, 0x86DD IPv6), IP protocol numbers for L4 (6 TCP, 17 UDP,
//! 132 SCTP, 1 ICMP, 58 ICMPv6). The registry is populated at startup and
//! read-mostly afterwards.

use super::dissector::Dissector;
use dashmap::DashMap;
use dissect_common::RegistryError;
use std::sync::OnceLock;

type Factory = Box<dyn Fn() -> Box<dyn Dissector> + Send + Sync>;

/// Factory registry resolving the next dissector by protocol id.
#[derive(Default)]
pub struct ParserRegistry {
    factories: DashMap<u16, Factory>,
}

impl ParserRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in network and transport
    /// dissectors.
    pub fn with_builtin() -> Self {
        use crate::net::{icmp, icmpv6, ipv4, ipv6};
        use crate::transport::{sctp, tcp, udp};

        let registry = Self::new();
        let register_or_panic = |id: u16, factory: Factory| {
            registry
                .register_factory(id, factory)
                .expect("builtin protocol ids are unique");
        };
        register_or_panic(0x0800, Box::new(|| Box::new(ipv4::Ipv4Dissector::new())));
        register_or_panic(0x86DD, Box::new(|| Box::new(ipv6::Ipv6Dissector::new())));
        register_or_panic(1, Box::new(|| Box::new(icmp::IcmpDissector::new())));
        register_or_panic(6, Box::new(|| Box::new(tcp::TcpDissector::new())));
        register_or_panic(17, Box::new(|| Box::new(udp::UdpDissector::new())));
        register_or_panic(58, Box::new(|| Box::new(icmpv6::Icmpv6Dissector::new())));
        register_or_panic(132, Box::new(|| Box::new(sctp::SctpDissector::new())));
        registry
    }

    /// Process-wide registry holding the built-in set.
    pub fn global() -> &'static ParserRegistry {
        static GLOBAL: OnceLock<ParserRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ParserRegistry::with_builtin)
    }

    /// Register a factory for `protocol_id`. Duplicate registration is an
    /// explicit failure, never a silent overwrite.
    pub fn register_factory(
        &self,
        protocol_id: u16,
        factory: Factory,
    ) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;
        match self.factories.entry(protocol_id) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(protocol_id)),
            Entry::Vacant(slot) => {
                slot.insert(factory);
                Ok(())
            }
        }
    }

    /// Instantiate a fresh dissector for `protocol_id`.
    pub fn create_parser(&self, protocol_id: u16) -> Result<Box<dyn Dissector>, RegistryError> {
        self.factories
            .get(&protocol_id)
            .map(|factory| factory())
            .ok_or(RegistryError::Unknown(protocol_id))
    }

    /// All registered protocol ids, unordered.
    pub fn supported_types(&self) -> Vec<u16> {
        self.factories.iter().map(|entry| *entry.key()).collect()
    }
}
