//! Registry-driven packet pipeline.

use dissect_common::{AtomicCounter, ParseOutcome};
use dissect_core::ByteSlice;
use dissect_detect::{DetectionEngine, ProtocolFingerprint};
use dissect_flow::{ConnectionTracker, Direction, FlowKey, ReassemblerConfig, TcpSegment};
use dissect_protocols::app::{dhcp, grpc, http, sip, snmp};
use dissect_protocols::framework::{Dissector, LayerOutput, ParseContext, ParserRegistry};
use dissect_protocols::industrial::{dnp3, modbus};
use dissect_protocols::link::ethernet::{self, EthernetDissector};
use dissect_protocols::net::{icmpv6, ipv4, ipv6};
use dissect_protocols::security::{ipsec, tls};
use dissect_protocols::transport::{quic, rtp, tcp, udp};
use std::collections::HashMap;
use std::net::IpAddr;

/// Pipeline counters: relaxed atomics, snapshot for a coherent view.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_total: AtomicCounter,
    pub bytes_total: AtomicCounter,
    pub link_errors: AtomicCounter,
    pub ipv4_packets: AtomicCounter,
    pub ipv6_packets: AtomicCounter,
    pub tcp_segments: AtomicCounter,
    pub udp_datagrams: AtomicCounter,
    pub app_dissections: AtomicCounter,
    pub detector_fallbacks: AtomicCounter,
}

/// Plain copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub packets_total: u64,
    pub bytes_total: u64,
    pub link_errors: u64,
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    pub tcp_segments: u64,
    pub udp_datagrams: u64,
    pub app_dissections: u64,
    pub detector_fallbacks: u64,
}

impl PipelineStats {
    fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            packets_total: self.packets_total.get(),
            bytes_total: self.bytes_total.get(),
            link_errors: self.link_errors.get(),
            ipv4_packets: self.ipv4_packets.get(),
            ipv6_packets: self.ipv6_packets.get(),
            tcp_segments: self.tcp_segments.get(),
            udp_datagrams: self.udp_datagrams.get(),
            app_dissections: self.app_dissections.get(),
            detector_fallbacks: self.detector_fallbacks.get(),
        }
    }
}

/// Everything one packet produced.
pub struct PacketReport<'a> {
    pub outcome: ParseOutcome,
    /// The metadata map inside is authoritative for what was extracted.
    pub context: ParseContext<'a>,
    pub flow_key: Option<FlowKey>,
    /// Detector verdict when no dissector claimed the payload.
    pub fingerprint: Option<ProtocolFingerprint>,
}

/// The packet pipeline. One instance per worker thread; the registry it
/// resolves dissectors from is process-wide and read-mostly.
pub struct PacketPipeline {
    registry: &'static ParserRegistry,
    tracker: ConnectionTracker,
    detector: DetectionEngine,
    modbus: modbus::ModbusAnalyzer,
    dnp3: dnp3::Dnp3Analyzer,
    ipsec: ipsec::IpsecAnalyzer,
    tls: tls::TlsInspector,
    /// Per-connection TLS state, keyed by the canonical flow key.
    tls_sessions: HashMap<FlowKey, Box<tls::TlsInfo>>,
    stats: PipelineStats,
}

impl PacketPipeline {
    pub fn new() -> Self {
        Self {
            registry: ParserRegistry::global(),
            tracker: ConnectionTracker::new(ReassemblerConfig::default()),
            detector: DetectionEngine::new(),
            modbus: modbus::ModbusAnalyzer::default(),
            dnp3: dnp3::Dnp3Analyzer::default(),
            ipsec: ipsec::IpsecAnalyzer::default(),
            tls: tls::TlsInspector::default(),
            tls_sessions: HashMap::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Dissect one Ethernet frame. `now_ms` drives every protocol clock.
    pub fn parse_packet<'a>(&mut self, data: &'a [u8], now_ms: u64) -> PacketReport<'a> {
        self.stats.packets_total.inc();
        self.stats.bytes_total.add(data.len() as u64);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(data));
        let mut report_outcome;

        let mut link = EthernetDissector::new();
        report_outcome = link.parse(&mut ctx);
        if !report_outcome.is_success() {
            self.stats.link_errors.inc();
            return PacketReport {
                outcome: report_outcome,
                context: ctx,
                flow_key: None,
                fingerprint: None,
            };
        }

        let next_protocol = ctx
            .get(ethernet::RESULT_KEY)
            .and_then(|o| o.as_ethernet())
            .map(|e| e.next_protocol)
            .unwrap_or(0);

        if let Ok(mut network) = self.registry.create_parser(next_protocol) {
            report_outcome = network.parse(&mut ctx);
            if !report_outcome.is_success() {
                return PacketReport {
                    outcome: report_outcome,
                    context: ctx,
                    flow_key: None,
                    fingerprint: None,
                };
            }
        } else {
            // Not IP: nothing further to dissect.
            return PacketReport {
                outcome: report_outcome,
                context: ctx,
                flow_key: None,
                fingerprint: None,
            };
        }

        let (addresses, ip_protocol) = self.network_summary(&ctx);
        let Some((src_addr, dst_addr)) = addresses else {
            return PacketReport {
                outcome: report_outcome,
                context: ctx,
                flow_key: None,
                fingerprint: None,
            };
        };

        // IPsec rides directly on IP.
        if ip_protocol == ipv4::PROTO_ESP || ip_protocol == ipv4::PROTO_AH {
            let payload = ctx.remaining();
            if let Ok(info) = self.ipsec.parse_ip_payload(&payload, ip_protocol) {
                self.stats.app_dissections.inc();
                ctx.deposit("ipsec_result", LayerOutput::Ipsec(Box::new(info)));
            }
            return PacketReport {
                outcome: report_outcome,
                context: ctx,
                flow_key: None,
                fingerprint: None,
            };
        }

        let outcome = self.parse_transport(&mut ctx, ip_protocol);
        if !outcome.is_success() {
            return PacketReport {
                outcome,
                context: ctx,
                flow_key: None,
                fingerprint: None,
            };
        }

        // Application dispatch plus flow bookkeeping.
        let mut flow_key = None;
        let mut fingerprint = None;
        match ip_protocol {
            ipv4::PROTO_TCP => {
                self.stats.tcp_segments.inc();
                let Some(tcp_result) = ctx.get(tcp::RESULT_KEY).and_then(|o| o.as_tcp()) else {
                    unreachable!("tcp dissector deposits its result on success");
                };
                let (src_port, dst_port) = (tcp_result.src_port, tcp_result.dst_port);
                let (seq, syn, fin) = (tcp_result.seq, tcp_result.is_syn(), tcp_result.is_fin());
                let payload = tcp_result.payload.clone();

                let key = FlowKey::new(src_addr, dst_addr, src_port, dst_port, true);
                let canonical = key.canonical();
                let direction = if key == canonical {
                    Direction::ClientToServer
                } else {
                    Direction::ServerToClient
                };
                self.tracker
                    .reassembler(canonical, direction, now_ms)
                    .add_segment(TcpSegment::with_flags(
                        seq,
                        payload.to_bytes(),
                        syn,
                        fin,
                    ));
                flow_key = Some(key);

                fingerprint =
                    self.dispatch_application(&mut ctx, &payload, src_port, dst_port, now_ms, canonical);
            }
            ipv4::PROTO_UDP => {
                self.stats.udp_datagrams.inc();
                let Some(udp_result) = ctx.get(udp::RESULT_KEY).and_then(|o| o.as_udp()) else {
                    unreachable!("udp dissector deposits its result on success");
                };
                let (src_port, dst_port) = (udp_result.src_port, udp_result.dst_port);
                let payload = udp_result.payload.clone();
                let key = FlowKey::new(src_addr, dst_addr, src_port, dst_port, false);
                flow_key = Some(key);

                fingerprint = self.dispatch_application(
                    &mut ctx,
                    &payload,
                    src_port,
                    dst_port,
                    now_ms,
                    key.canonical(),
                );
            }
            _ => {}
        }

        PacketReport {
            outcome,
            context: ctx,
            flow_key,
            fingerprint,
        }
    }

    fn network_summary(&self, ctx: &ParseContext<'_>) -> (Option<(IpAddr, IpAddr)>, u8) {
        if let Some(v4) = ctx.get(ipv4::RESULT_KEY).and_then(|o| o.as_ipv4()) {
            self.stats.ipv4_packets.inc();
            return (
                Some((IpAddr::V4(v4.src), IpAddr::V4(v4.dst))),
                v4.protocol,
            );
        }
        if let Some(v6) = ctx.get(ipv6::RESULT_KEY).and_then(|o| o.as_ipv6()) {
            self.stats.ipv6_packets.inc();
            return (
                Some((IpAddr::V6(v6.src), IpAddr::V6(v6.dst))),
                v6.next_header,
            );
        }
        (None, 0)
    }

    fn parse_transport(&mut self, ctx: &mut ParseContext<'_>, ip_protocol: u8) -> ParseOutcome {
        // ICMPv6 needs the enclosing addresses for its pseudo-header.
        if ip_protocol == 58 {
            let mut dissector = icmpv6::Icmpv6Dissector::new();
            if let Some(v6) = ctx.get(ipv6::RESULT_KEY).and_then(|o| o.as_ipv6()) {
                dissector.set_addresses(v6.src.octets(), v6.dst.octets());
            }
            return dissector.parse(ctx);
        }
        match self.registry.create_parser(u16::from(ip_protocol)) {
            Ok(mut transport) => transport.parse(ctx),
            Err(_) => ParseOutcome::Success, // unknown L4 stays opaque
        }
    }

    /// Port-directed application dissection; unknown payloads go to the
    /// detector.
    fn dispatch_application<'a>(
        &mut self,
        ctx: &mut ParseContext<'a>,
        payload: &ByteSlice<'a>,
        src_port: u16,
        dst_port: u16,
        now_ms: u64,
        canonical_key: FlowKey,
    ) -> Option<ProtocolFingerprint> {
        if payload.is_empty() {
            return None;
        }
        let port = |p: u16| src_port == p || dst_port == p;

        if port(modbus::MODBUS_TCP_PORT) && self.modbus.can_parse(payload) {
            if let Ok(info) = self.modbus.parse_packet(payload, now_ms) {
                self.stats.app_dissections.inc();
                ctx.deposit("modbus_result", LayerOutput::Modbus(Box::new(info)));
                return None;
            }
        }
        if port(dnp3::DNP3_TCP_PORT) && self.dnp3.can_parse(payload) {
            if let Ok(info) = self.dnp3.parse_packet(payload, now_ms) {
                self.stats.app_dissections.inc();
                ctx.deposit("dnp3_result", LayerOutput::Dnp3(Box::new(info)));
                return None;
            }
        }
        if port(tls::TLS_PORT) && self.tls.can_parse(payload) {
            let info = self
                .tls_sessions
                .entry(canonical_key)
                .or_insert_with(|| Box::new(tls::TlsInfo::default()));
            if self.tls.parse_record(payload, info) {
                self.stats.app_dissections.inc();
                ctx.deposit("tls_result", LayerOutput::Tls(info.clone()));
                return None;
            }
        }
        if port(ipsec::IKE_PORT) || port(ipsec::IKE_NATT_PORT) {
            if let Ok(info) = self.ipsec.parse_ike(payload) {
                self.stats.app_dissections.inc();
                ctx.deposit("ipsec_result", LayerOutput::Ipsec(Box::new(info)));
                return None;
            }
        }

        // Trait-based application dissectors share the uniform driver.
        let mut candidates: Vec<Box<dyn Dissector>> = Vec::new();
        if port(80) || port(8080) {
            candidates.push(Box::new(http::HttpDissector::new()));
        }
        if port(67) || port(68) {
            candidates.push(Box::new(dhcp::DhcpDissector::new()));
        }
        if port(161) || port(162) {
            candidates.push(Box::new(snmp::SnmpDissector::new()));
        }
        if port(5060) {
            candidates.push(Box::new(sip::SipDissector::new()));
        }
        if port(5004) {
            candidates.push(Box::new(rtp::RtpDissector::new()));
        }
        if port(443) {
            // QUIC when TLS-over-TCP did not claim it (UDP 443).
            candidates.push(Box::new(quic::QuicDissector::new()));
        }
        if port(50051) {
            candidates.push(Box::new(grpc::GrpcDissector::new()));
        }
        for mut dissector in candidates {
            if !dissector.can_parse(payload) {
                continue;
            }
            let mut app_ctx = ParseContext::new(payload.clone());
            if dissector.parse(&mut app_ctx).is_success() {
                self.stats.app_dissections.inc();
                for (key, output) in app_ctx.metadata {
                    ctx.deposit(key, output);
                }
                return None;
            }
        }

        // Nothing claimed the payload: ask the detector.
        self.stats.detector_fallbacks.inc();
        tracing::debug!(src_port, dst_port, "no dissector claimed payload, detecting");
        Some(self.detector.detect_with_ports(payload, src_port, dst_port))
    }

    /// The detection engine, for configuration and custom signatures.
    pub fn detector(&self) -> &DetectionEngine {
        &self.detector
    }

    /// The connection tracker, for sweeps and stream consumption.
    pub fn tracker_mut(&mut self) -> &mut ConnectionTracker {
        &mut self.tracker
    }

    /// Drop idle connections and expired TLS session state.
    pub fn cleanup(&mut self, now_ms: u64, threshold_ms: u64) -> usize {
        let removed = self.tracker.cleanup_old_connections(now_ms, threshold_ms);
        self.tls_sessions
            .retain(|key, _| self.tracker.get(key).is_some());
        removed
    }

    pub fn statistics(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for PacketPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_ip_frame_passes_through() {
        // ARP ethertype: link layer parses, nothing further.
        let mut frame = vec![0xFFu8; 6];
        frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 28]);

        let mut pipeline = PacketPipeline::new();
        let report = pipeline.parse_packet(&frame, 0);
        assert_eq!(report.outcome, ParseOutcome::Success);
        assert!(report.context.get(ethernet::RESULT_KEY).is_some());
        assert!(report.context.get(ipv4::RESULT_KEY).is_none());
    }

    #[test]
    fn test_truncated_frame_counted() {
        let mut pipeline = PacketPipeline::new();
        let report = pipeline.parse_packet(&[0u8; 6], 0);
        assert_eq!(report.outcome, ParseOutcome::BufferTooSmall);
        assert_eq!(pipeline.statistics().link_errors, 1);
    }
}
