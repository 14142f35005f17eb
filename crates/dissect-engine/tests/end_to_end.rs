//! End-to-end pipeline scenarios over hand-built frames.

use dissect_common::ParseOutcome;
use dissect_engine::PacketPipeline;
use dissect_flow::{Direction, FlowKey, TcpReassembler, TcpSegment};
use dissect_protocols::net::checksum;

const ETH_IPV4: u16 = 0x0800;
const ETH_IPV6: u16 = 0x86DD;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E];
    frame.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ipv4(protocol: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut header = vec![
        0x45, 0x00, 0, 0, 0x00, 0x01, 0x40, 0x00, 0x40, protocol, 0x00, 0x00,
    ];
    header[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    header.extend_from_slice(&src);
    header.extend_from_slice(&dst);
    checksum::fill(&mut header, 10);
    header.extend_from_slice(payload);
    header
}

fn tcp(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut segment = Vec::new();
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&0u32.to_be_bytes());
    segment.push(0x50);
    segment.push(flags);
    segment.extend_from_slice(&0xFFFFu16.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]);
    segment.extend_from_slice(payload);
    segment
}

fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    datagram
}

/// Scenario 1: Ethernet + IPv4 + TCP SYN.
#[test]
fn scenario_ethernet_ipv4_tcp_syn() {
    init_tracing();
    let frame = ethernet(
        ETH_IPV4,
        &ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(49152, 80, 1000, 0x02, &[])),
    );

    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 1_000);

    assert_eq!(report.outcome, ParseOutcome::Success);
    assert_eq!(report.context.metadata.len(), 3);

    let tcp_result = report
        .context
        .get("tcp_result")
        .and_then(|o| o.as_tcp())
        .expect("tcp result deposited");
    assert_eq!(tcp_result.flags, 0x02);
    assert!(tcp_result.is_syn());
    assert!(tcp_result.payload.is_empty());

    let ip_result = report
        .context
        .get("ipv4_result")
        .and_then(|o| o.as_ipv4())
        .expect("ipv4 result deposited");
    assert_eq!(ip_result.src.octets(), [10, 0, 0, 1]);
    assert_eq!(ip_result.dst.octets(), [10, 0, 0, 2]);
    assert!(ip_result.checksum_valid);

    let key = report.flow_key.expect("tcp packets produce a flow key");
    assert!(key.is_tcp);
    assert_eq!(key.dst_port, 80);
}

/// Scenario 2: IPv6 + Hop-by-Hop + UDP.
#[test]
fn scenario_ipv6_hop_by_hop_udp() {
    let udp_bytes = udp(5353, 5353, &[]);
    let mut ip_payload = vec![17, 0, 0, 0, 0, 0, 0, 0]; // HopByHop, next=UDP
    ip_payload.extend_from_slice(&udp_bytes);

    let mut packet = vec![0x60, 0, 0, 0];
    packet.extend_from_slice(&(ip_payload.len() as u16).to_be_bytes());
    packet.push(0); // next header: Hop-by-Hop
    packet.push(64);
    packet.extend_from_slice(&[0u8; 15]);
    packet.push(1);
    packet.extend_from_slice(&[0u8; 15]);
    packet.push(2);
    packet.extend_from_slice(&ip_payload);

    let frame = ethernet(ETH_IPV6, &packet);
    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 0);

    assert_eq!(report.outcome, ParseOutcome::Success);
    let v6 = report
        .context
        .get("ipv6_result")
        .and_then(|o| o.as_ipv6())
        .expect("ipv6 result deposited");
    assert_eq!(v6.next_header, 17);
    assert_eq!(v6.extensions.len(), 1);

    let udp_result = report
        .context
        .get("udp_result")
        .and_then(|o| o.as_udp())
        .expect("udp result deposited");
    assert!(udp_result.payload.is_empty());
}

/// Scenario 3: TLS ClientHello with SNI `example.com` over TCP 443.
#[test]
fn scenario_tls_client_hello_sni() {
    let hostname = b"example.com";
    let mut sni = Vec::new();
    sni.extend_from_slice(&0u16.to_be_bytes()); // extension type
    let list_len = hostname.len() + 3;
    sni.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
    sni.extend_from_slice(&(list_len as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
    sni.extend_from_slice(hostname);

    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes());
    body.extend_from_slice(&[0x11; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&0xC02Fu16.to_be_bytes());
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni);

    let mut handshake = vec![1u8]; // ClientHello
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![22u8, 0x03, 0x03];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);

    let frame = ethernet(
        ETH_IPV4,
        &ipv4(
            6,
            [192, 168, 1, 10],
            [93, 184, 216, 34],
            &tcp(50000, 443, 1, 0x18, &record),
        ),
    );

    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 5_000);

    assert_eq!(report.outcome, ParseOutcome::Success);
    let tls = report
        .context
        .get("tls_result")
        .and_then(|o| o.as_tls())
        .expect("tls result deposited");
    assert!(tls.handshake_state.client_hello_seen);
    assert_eq!(tls.server_name.as_deref(), Some("example.com"));
    assert!(tls
        .extensions
        .iter()
        .any(|e| e.server_name.as_deref() == Some("example.com")));
    assert!(tls.ja3_hash.is_some());
}

/// Scenario 4: Modbus read-holding-registers request on port 502.
#[test]
fn scenario_modbus_read_holding_registers() {
    let modbus = [
        0x00, 0x01, // transaction id
        0x00, 0x00, // protocol id
        0x00, 0x06, // length
        0x01, // unit id
        0x03, 0x00, 0x00, 0x00, 0x0A, // read holding registers 0..10
    ];
    let frame = ethernet(
        ETH_IPV4,
        &ipv4(
            6,
            [10, 1, 1, 1],
            [10, 1, 1, 2],
            &tcp(50123, 502, 1, 0x18, &modbus),
        ),
    );

    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 9_000);

    let info = report
        .context
        .get("modbus_result")
        .and_then(|o| o.as_modbus())
        .expect("modbus result deposited");
    assert_eq!(info.function_code, 3);
    assert_eq!(info.starting_address, 0);
    assert_eq!(info.quantity, 10);
    assert!(!info.is_exception);
}

/// Scenario 5: DNP3 read class-data frame on port 20000.
#[test]
fn scenario_dnp3_read_class_data() {
    let mut dnp3_frame = vec![0x05, 0x64, 0x0E, 0x44, 0x0A, 0x00, 0x01, 0x00];
    let crc = dissect_protocols::industrial::dnp3::crc16(&dnp3_frame);
    dnp3_frame.extend_from_slice(&crc.to_be_bytes());
    dnp3_frame.extend_from_slice(&[0x81, 0xC0, 0x01, 0x3C, 0x02, 0x06, 0x00, 0x00]);

    let frame = ethernet(
        ETH_IPV4,
        &ipv4(
            6,
            [172, 16, 0, 5],
            [172, 16, 0, 9],
            &tcp(50222, 20000, 1, 0x18, &dnp3_frame),
        ),
    );

    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 12_000);

    let info = report
        .context
        .get("dnp3_result")
        .and_then(|o| o.as_dnp3())
        .expect("dnp3 result deposited");
    assert_eq!(info.datalink.function_code, 4);
    assert_eq!(info.application.function_code, 1);
    assert!(info.crc_valid);
    assert!(info
        .application
        .objects
        .iter()
        .any(|o| o.group == 60 && o.variation == 2));
}

/// Scenario 6: out-of-order TCP segments reassemble without gaps.
#[test]
fn scenario_reassembler_out_of_order() {
    let mut reassembler = TcpReassembler::default();
    reassembler.set_initial_sequence(1000);
    reassembler.add_segment(TcpSegment::new(1000, vec![1u8; 100]));
    reassembler.add_segment(TcpSegment::new(1200, vec![3u8; 100]));
    reassembler.add_segment(TcpSegment::new(1100, vec![2u8; 100]));

    let data = reassembler.get_data();
    assert_eq!(data.len(), 300);
    assert!(data[..100].iter().all(|&b| b == 1));
    assert!(data[100..200].iter().all(|&b| b == 2));
    assert!(data[200..].iter().all(|&b| b == 3));

    let info = reassembler.window_info();
    assert_eq!(info.gap_count, 0);
    assert_eq!(info.expected_seq, 1300);
}

/// The pipeline feeds TCP payloads into the tracker's reassemblers.
#[test]
fn pipeline_reassembles_tcp_stream() {
    let mut pipeline = PacketPipeline::new();
    let src = [10, 0, 0, 1];
    let dst = [10, 0, 0, 2];

    // Two HTTP request halves arriving in reverse order.
    let second = ethernet(
        ETH_IPV4,
        &ipv4(6, src, dst, &tcp(50000, 80, 1008, 0x18, b"HTTP/1.1\r\n\r\n")),
    );
    let first = ethernet(
        ETH_IPV4,
        &ipv4(6, src, dst, &tcp(50000, 80, 1000, 0x18, b"GET /idx ")),
    );
    pipeline.parse_packet(&second, 100);
    let report = pipeline.parse_packet(&first, 200);

    let key = report.flow_key.unwrap().canonical();
    let direction = if report.flow_key.unwrap() == key {
        Direction::ClientToServer
    } else {
        Direction::ServerToClient
    };
    let connection = pipeline.tracker_mut().reassembler(key, direction, 300);
    // First segment pinned the initial sequence at its own seq; the stream
    // is contiguous from there.
    assert_eq!(connection.get_data(), b"HTTP/1.1\r\n\r\n");
}

/// Unknown payloads fall through to the detection engine.
#[test]
fn pipeline_detector_fallback() {
    let frame = ethernet(
        ETH_IPV4,
        &ipv4(
            6,
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            &tcp(50000, 22, 1, 0x18, b"SSH-2.0-OpenSSH_9.4\r\n"),
        ),
    );
    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 0);

    let fingerprint = report.fingerprint.expect("detector consulted");
    assert_eq!(fingerprint.protocol_name, "SSH");
    assert!(fingerprint.score >= 0.8);
    assert_eq!(pipeline.statistics().detector_fallbacks, 1);
}

/// DHCP over UDP 67/68 through the full stack.
#[test]
fn pipeline_dhcp_discover() {
    let mut bootp = vec![0u8; 236];
    bootp[0] = 1;
    bootp[1] = 1;
    bootp[2] = 6;
    bootp.extend_from_slice(&[0x63, 0x82, 0x53, 0x63]);
    bootp.extend_from_slice(&[53, 1, 1, 255]);

    let frame = ethernet(
        ETH_IPV4,
        &ipv4(17, [0, 0, 0, 0], [255, 255, 255, 255], &udp(68, 67, &bootp)),
    );
    let mut pipeline = PacketPipeline::new();
    let report = pipeline.parse_packet(&frame, 0);

    let dhcp = report
        .context
        .get("dhcp_result")
        .and_then(|o| o.as_dhcp())
        .expect("dhcp result deposited");
    assert_eq!(
        dhcp.message_type(),
        Some(dissect_protocols::app::dhcp::DhcpMessageType::Discover)
    );
}

/// Idle connections are swept with their TLS session state.
#[test]
fn pipeline_cleanup_sweeps() {
    let mut pipeline = PacketPipeline::new();
    let frame = ethernet(
        ETH_IPV4,
        &ipv4(6, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(50000, 80, 1, 0x02, &[])),
    );
    pipeline.parse_packet(&frame, 1_000);
    assert_eq!(pipeline.tracker_mut().connection_count(), 1);

    let removed = pipeline.cleanup(120_000, 30_000);
    assert_eq!(removed, 1);
    assert_eq!(pipeline.tracker_mut().connection_count(), 0);
}

/// FlowKey canonicalization is direction independent.
#[test]
fn flow_key_canonical_is_symmetric() {
    let a = FlowKey::new(
        "10.0.0.1".parse().unwrap(),
        "10.0.0.2".parse().unwrap(),
        50000,
        80,
        true,
    );
    assert_eq!(a.canonical(), a.reverse().canonical());
}
