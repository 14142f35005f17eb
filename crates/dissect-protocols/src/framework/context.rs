//! The context object threaded through layered dissectors.

use crate::app::dhcp::DhcpResult;
use crate::app::grpc::GrpcResult;
use crate::app::http::HttpResult;
use crate::app::sip::SipResult;
use crate::app::snmp::SnmpMessage;
use crate::industrial::dnp3::Dnp3Info;
use crate::industrial::modbus::ModbusInfo;
use crate::link::ethernet::EthernetResult;
use crate::net::icmp::IcmpResult;
use crate::net::icmpv6::Icmpv6Result;
use crate::net::ipv4::Ipv4Result;
use crate::net::ipv6::Ipv6Result;
use crate::security::ipsec::IpsecInfo;
use crate::security::tls::TlsInfo;
use crate::transport::quic::QuicResult;
use crate::transport::rtp::RtpResult;
use crate::transport::sctp::SctpResult;
use crate::transport::tcp::TcpResult;
use crate::transport::udp::UdpResult;
use dissect_common::ParsePhase;
use dissect_core::ByteSlice;
use std::collections::HashMap;

/// Typed result record deposited by a dissector.
///
/// Each dissector knows the discriminant for its result, so upper layers
/// read exactly the fields they need without downcasting.
#[derive(Debug, Clone)]
pub enum LayerOutput<'a> {
    Ethernet(EthernetResult<'a>),
    Ipv4(Ipv4Result<'a>),
    Ipv6(Ipv6Result<'a>),
    Icmp(IcmpResult<'a>),
    Icmpv6(Icmpv6Result<'a>),
    Tcp(TcpResult<'a>),
    Udp(UdpResult<'a>),
    Sctp(SctpResult<'a>),
    Quic(QuicResult<'a>),
    Rtp(RtpResult<'a>),
    Http(HttpResult<'a>),
    Dhcp(DhcpResult),
    Snmp(SnmpMessage),
    Grpc(GrpcResult<'a>),
    Sip(SipResult),
    Modbus(Box<ModbusInfo>),
    Dnp3(Box<Dnp3Info>),
    Tls(Box<TlsInfo>),
    Ipsec(Box<IpsecInfo>),
}

macro_rules! layer_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&self) -> Option<&$ty> {
            match self {
                LayerOutput::$variant(r) => Some(r),
                _ => None,
            }
        }
    };
}

macro_rules! boxed_layer_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&self) -> Option<&$ty> {
            match self {
                LayerOutput::$variant(r) => Some(r.as_ref()),
                _ => None,
            }
        }
    };
}

impl<'a> LayerOutput<'a> {
    layer_accessor!(as_ethernet, Ethernet, EthernetResult<'a>);
    layer_accessor!(as_ipv4, Ipv4, Ipv4Result<'a>);
    layer_accessor!(as_ipv6, Ipv6, Ipv6Result<'a>);
    layer_accessor!(as_icmp, Icmp, IcmpResult<'a>);
    layer_accessor!(as_icmpv6, Icmpv6, Icmpv6Result<'a>);
    layer_accessor!(as_tcp, Tcp, TcpResult<'a>);
    layer_accessor!(as_udp, Udp, UdpResult<'a>);
    layer_accessor!(as_sctp, Sctp, SctpResult<'a>);
    layer_accessor!(as_quic, Quic, QuicResult<'a>);
    layer_accessor!(as_rtp, Rtp, RtpResult<'a>);
    layer_accessor!(as_http, Http, HttpResult<'a>);
    layer_accessor!(as_dhcp, Dhcp, DhcpResult);
    layer_accessor!(as_snmp, Snmp, SnmpMessage);
    layer_accessor!(as_grpc, Grpc, GrpcResult<'a>);
    layer_accessor!(as_sip, Sip, SipResult);
    boxed_layer_accessor!(as_modbus, Modbus, ModbusInfo);
    boxed_layer_accessor!(as_dnp3, Dnp3, Dnp3Info);
    boxed_layer_accessor!(as_tls, Tls, TlsInfo);
    boxed_layer_accessor!(as_ipsec, Ipsec, IpsecInfo);
}

/// Mutable carrier threaded through the dissector chain.
///
/// Created per top-level parse call, consumed by the chain, discarded after.
/// The metadata map is authoritative for what was successfully extracted,
/// whatever outcome the chain ultimately returned.
#[derive(Debug, Default)]
pub struct ParseContext<'a> {
    /// The full packet (or stream window) being dissected.
    pub buffer: ByteSlice<'a>,
    /// Bytes consumed by the layers parsed so far.
    pub offset: usize,
    /// Phase of the most recent parse call.
    pub phase: ParsePhase,
    /// `"<proto>_result"` entries deposited by each layer.
    pub metadata: HashMap<&'static str, LayerOutput<'a>>,
}

impl<'a> ParseContext<'a> {
    pub fn new(buffer: ByteSlice<'a>) -> Self {
        Self {
            buffer,
            offset: 0,
            phase: ParsePhase::Initial,
            metadata: HashMap::new(),
        }
    }

    /// The unconsumed tail of the buffer.
    #[inline]
    pub fn remaining(&self) -> ByteSlice<'a> {
        self.buffer.slice_from(self.offset)
    }

    /// Bytes left to consume.
    #[inline]
    pub fn remaining_len(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    /// Store a layer's result record.
    pub fn deposit(&mut self, key: &'static str, output: LayerOutput<'a>) {
        self.metadata.insert(key, output);
    }

    /// Fetch a layer's result record.
    pub fn get(&self, key: &str) -> Option<&LayerOutput<'a>> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_tracks_offset() {
        let data = [1u8, 2, 3, 4, 5];
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(ctx.remaining_len(), 5);
        ctx.offset = 3;
        assert_eq!(ctx.remaining().as_bytes(), &[4, 5]);
        ctx.offset = 9;
        assert_eq!(ctx.remaining_len(), 0);
    }
}
