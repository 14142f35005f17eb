//! Modbus/TCP deep analyzer: MBAP header, function-code dispatch, scan
//! detection over a sliding window, and security scoring.
//!
//! The analyzer keeps cross-packet state (the scan window and the global
//! statistics block); clocks are supplied by the caller in milliseconds.

use dissect_common::{AtomicCounter, ParseOutcome};
use dissect_core::ByteSlice;

pub const MODBUS_TCP_PORT: u16 = 502;

const MBAP_SIZE: usize = 7;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;
pub const FC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;
pub const FC_READ_DEVICE_IDENTIFICATION: u8 = 0x2B;

const VALID_FUNCTION_CODES: &[u8] = &[
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x0B, 0x0C, 0x0F, 0x10, 0x11, 0x14, 0x15,
    0x16, 0x17, 0x18, 0x2B,
];

pub fn is_valid_function_code(code: u8) -> bool {
    VALID_FUNCTION_CODES.contains(&code)
}

pub fn is_write_function(code: u8) -> bool {
    matches!(code, 0x05 | 0x06 | 0x0F | 0x10 | 0x16 | 0x17)
}

pub fn is_read_function(code: u8) -> bool {
    matches!(code, 0x01 | 0x02 | 0x03 | 0x04)
}

pub fn function_name(code: u8) -> &'static str {
    match code {
        FC_READ_COILS => "Read Coils",
        FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_READ_INPUT_REGISTERS => "Read Input Registers",
        FC_WRITE_SINGLE_COIL => "Write Single Coil",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        0x07 => "Read Exception Status",
        0x08 => "Diagnostics",
        FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        0x11 => "Report Slave ID",
        FC_MASK_WRITE_REGISTER => "Mask Write Register",
        FC_READ_WRITE_MULTIPLE_REGISTERS => "Read/Write Multiple Registers",
        FC_READ_DEVICE_IDENTIFICATION => "Read Device Identification",
        _ => "Unknown Function",
    }
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Security findings for a single Modbus message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModbusSecurityAnalysis {
    /// Modbus carries no authentication.
    pub no_authentication: bool,
    /// Modbus carries no encryption.
    pub no_encryption: bool,
    pub scan_detected: bool,
    pub unauthorized_access: bool,
    pub write_to_critical_address: bool,
    pub vulnerabilities: Vec<String>,
    /// 0-100; starts at 100 and loses points per finding.
    pub security_score: u32,
}

/// Decoded Modbus/TCP message plus analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModbusInfo {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub is_exception: bool,
    pub exception_code: u8,
    pub exception_name: &'static str,
    pub starting_address: u16,
    pub quantity: u16,
    pub and_mask: u16,
    pub or_mask: u16,
    pub read_starting_address: u16,
    pub read_quantity: u16,
    pub mei_type: u8,
    pub device_id_code: u8,
    pub object_id: u8,
    pub coil_values: Vec<bool>,
    pub register_values: Vec<u16>,
    pub validation_errors: Vec<String>,
    pub anomalies: Vec<String>,
    pub security: ModbusSecurityAnalysis,
}

impl ModbusInfo {
    pub fn function_name(&self) -> &'static str {
        function_name(self.function_code & 0x7F)
    }

    pub fn is_broadcast(&self) -> bool {
        self.unit_id == 0
    }

    pub fn is_critical_function(&self) -> bool {
        is_write_function(self.function_code)
    }
}

/// Statistics block. All counters are relaxed atomics; `snapshot` gives a
/// coherent copy for reporting.
#[derive(Debug, Default)]
pub struct ModbusStats {
    pub total_packets: AtomicCounter,
    pub read_operations: AtomicCounter,
    pub write_operations: AtomicCounter,
    pub exception_count: AtomicCounter,
    pub anomaly_count: AtomicCounter,
    pub scan_attempts: AtomicCounter,
}

/// Plain copy of [`ModbusStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModbusStatsSnapshot {
    pub total_packets: u64,
    pub read_operations: u64,
    pub write_operations: u64,
    pub exception_count: u64,
    pub anomaly_count: u64,
    pub scan_attempts: u64,
}

impl ModbusStats {
    pub fn snapshot(&self) -> ModbusStatsSnapshot {
        ModbusStatsSnapshot {
            total_packets: self.total_packets.get(),
            read_operations: self.read_operations.get(),
            write_operations: self.write_operations.get(),
            exception_count: self.exception_count.get(),
            anomaly_count: self.anomaly_count.get(),
            scan_attempts: self.scan_attempts.get(),
        }
    }
}

/// Analyzer configuration.
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    /// Scan records within the window before the scan flag trips.
    pub max_scan_requests: usize,
    /// Sliding-window width in milliseconds.
    pub scan_window_ms: u64,
    /// Half-open `(start, end)` address ranges considered critical to write.
    pub critical_ranges: Vec<(u16, u16)>,
    pub security_monitoring: bool,
    pub anomaly_detection: bool,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            max_scan_requests: 100,
            scan_window_ms: 60_000,
            critical_ranges: vec![(0, 100), (1000, 1100), (9000, 9100)],
            security_monitoring: true,
            anomaly_detection: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ScanRecord {
    ts_ms: u64,
    unit_id: u8,
    function_code: u8,
    starting_address: u16,
}

/// Modbus/TCP deep analyzer.
pub struct ModbusAnalyzer {
    config: ModbusConfig,
    scan_window: Vec<ScanRecord>,
    last_packet_ms: Option<u64>,
    stats: ModbusStats,
}

impl ModbusAnalyzer {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            scan_window: Vec::new(),
            last_packet_ms: None,
            stats: ModbusStats::default(),
        }
    }

    /// Cheap probe: MBAP shape plus a plausible function code.
    pub fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        if buffer.len() < MBAP_SIZE + 1 {
            return false;
        }
        if buffer.read_be16(2) != 0 {
            return false;
        }
        let length = buffer.read_be16(4);
        if !(2..=253).contains(&length) {
            return false;
        }
        is_valid_function_code(buffer.read_u8(7) & 0x7F)
    }

    /// Parse one Modbus/TCP message. `now_ms` drives the scan window.
    pub fn parse_packet(
        &mut self,
        buffer: &ByteSlice<'_>,
        now_ms: u64,
    ) -> Result<ModbusInfo, ParseOutcome> {
        if buffer.len() < MBAP_SIZE + 1 {
            return Err(ParseOutcome::BufferTooSmall);
        }

        let mut info = ModbusInfo {
            transaction_id: buffer.read_be16(0),
            protocol_id: buffer.read_be16(2),
            length: buffer.read_be16(4),
            unit_id: buffer.read_u8(6),
            ..ModbusInfo::default()
        };

        if info.protocol_id != 0 {
            return Err(ParseOutcome::InvalidFormat);
        }

        let pdu_len = usize::from(info.length).saturating_sub(1);
        let pdu = buffer.slice(MBAP_SIZE, pdu_len.max(1));
        if pdu.is_empty() {
            return Err(ParseOutcome::NeedMoreData);
        }

        info.function_code = pdu.read_u8(0);
        info.is_exception = info.function_code & 0x80 != 0;

        if info.is_exception {
            if pdu.len() < 2 {
                return Err(ParseOutcome::NeedMoreData);
            }
            info.exception_code = pdu.read_u8(1);
            info.exception_name = exception_name(info.exception_code);
        } else {
            parse_function_data(&pdu, &mut info)?;
        }

        if self.config.security_monitoring {
            info.security = self.analyze_security(&info, now_ms);
        }
        if self.config.anomaly_detection {
            self.analyze_anomalies(&mut info, now_ms);
        }
        self.update_stats(&info);
        self.last_packet_ms = Some(now_ms);

        Ok(info)
    }

    fn analyze_security(&mut self, info: &ModbusInfo, now_ms: u64) -> ModbusSecurityAnalysis {
        let mut analysis = ModbusSecurityAnalysis {
            no_authentication: true,
            no_encryption: true,
            ..ModbusSecurityAnalysis::default()
        };

        analysis.scan_detected = self.detect_scan(info, now_ms);

        if info.unit_id > 247 {
            analysis.unauthorized_access = true;
            analysis
                .vulnerabilities
                .push(format!("unit id {} outside the valid range", info.unit_id));
        }
        if !is_valid_function_code(info.function_code & 0x7F) {
            analysis
                .vulnerabilities
                .push(format!("invalid function code {:#04x}", info.function_code));
        }
        if info.quantity > 100 {
            analysis
                .vulnerabilities
                .push(format!("large range access ({} items)", info.quantity));
        }
        if is_write_function(info.function_code) {
            analysis
                .vulnerabilities
                .push("write operation observed".to_owned());
            let addr = info.starting_address;
            if self
                .config
                .critical_ranges
                .iter()
                .any(|&(start, end)| (start..end).contains(&addr))
            {
                analysis.write_to_critical_address = true;
                analysis
                    .vulnerabilities
                    .push(format!("write to critical address {addr}"));
            }
        }

        analysis.security_score = {
            let mut score: u32 = 100;
            score = score.saturating_sub(analysis.vulnerabilities.len() as u32 * 15);
            if analysis.scan_detected {
                score = score.saturating_sub(25);
            }
            if analysis.no_authentication {
                score = score.saturating_sub(20);
            }
            if analysis.no_encryption {
                score = score.saturating_sub(20);
            }
            score
        };

        analysis
    }

    /// Sliding-window scan detection: trips on window overflow or on a
    /// monotone address run longer than 10 with the same `(unit, fc)`.
    fn detect_scan(&mut self, info: &ModbusInfo, now_ms: u64) -> bool {
        let cutoff = now_ms.saturating_sub(self.config.scan_window_ms);
        self.scan_window.retain(|r| r.ts_ms >= cutoff);
        self.scan_window.push(ScanRecord {
            ts_ms: now_ms,
            unit_id: info.unit_id,
            function_code: info.function_code,
            starting_address: info.starting_address,
        });

        if self.scan_window.len() > self.config.max_scan_requests {
            return true;
        }

        let mut consecutive = 0usize;
        let mut last_address: Option<u16> = None;
        for record in &self.scan_window {
            if record.unit_id != info.unit_id || record.function_code != info.function_code {
                continue;
            }
            if let Some(last) = last_address {
                if record.starting_address == last.wrapping_add(1) {
                    consecutive += 1;
                    if consecutive > 10 {
                        return true;
                    }
                } else {
                    consecutive = 0;
                }
            }
            last_address = Some(record.starting_address);
        }
        false
    }

    fn analyze_anomalies(&self, info: &mut ModbusInfo, now_ms: u64) {
        if let Some(last) = self.last_packet_ms {
            let interval = now_ms.saturating_sub(last);
            if interval < 1 {
                info.anomalies.push("packet interval below 1 ms".to_owned());
            } else if interval > 30_000 {
                info.anomalies.push("packet interval above 30 s".to_owned());
            }
        }

        if is_read_function(info.function_code) && info.register_values.len() > 1 {
            let first = info.register_values[0];
            if info.register_values.iter().all(|&v| v == first) {
                info.anomalies
                    .push("all register values identical".to_owned());
            }
        }

        if info.transaction_id == 0 {
            info.anomalies.push("zero transaction id".to_owned());
        }
    }

    fn update_stats(&self, info: &ModbusInfo) {
        self.stats.total_packets.inc();
        if info.is_exception {
            self.stats.exception_count.inc();
        }
        if is_write_function(info.function_code) {
            self.stats.write_operations.inc();
        } else {
            self.stats.read_operations.inc();
        }
        if !info.anomalies.is_empty() {
            self.stats.anomaly_count.inc();
        }
        if info.security.scan_detected {
            self.stats.scan_attempts.inc();
        }
    }

    pub fn statistics(&self) -> ModbusStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&mut self) {
        self.stats = ModbusStats::default();
        self.scan_window.clear();
        self.last_packet_ms = None;
    }
}

impl Default for ModbusAnalyzer {
    fn default() -> Self {
        Self::new(ModbusConfig::default())
    }
}

fn parse_function_data(pdu: &ByteSlice<'_>, info: &mut ModbusInfo) -> Result<(), ParseOutcome> {
    match info.function_code {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            require(pdu, 5)?;
            info.starting_address = pdu.read_be16(1);
            info.quantity = pdu.read_be16(3);
            if !(1..=2000).contains(&info.quantity) {
                info.validation_errors
                    .push("quantity out of range for bit read".to_owned());
                return Err(ParseOutcome::InvalidFormat);
            }
        }
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            require(pdu, 5)?;
            info.starting_address = pdu.read_be16(1);
            info.quantity = pdu.read_be16(3);
            if !(1..=125).contains(&info.quantity) {
                info.validation_errors
                    .push("quantity out of range for register read".to_owned());
                return Err(ParseOutcome::InvalidFormat);
            }
        }
        FC_WRITE_SINGLE_COIL => {
            require(pdu, 5)?;
            info.starting_address = pdu.read_be16(1);
            let value = pdu.read_be16(3);
            if value != 0x0000 && value != 0xFF00 {
                info.validation_errors.push("invalid coil value".to_owned());
                return Err(ParseOutcome::InvalidFormat);
            }
            info.coil_values.push(value == 0xFF00);
        }
        FC_WRITE_SINGLE_REGISTER => {
            require(pdu, 5)?;
            info.starting_address = pdu.read_be16(1);
            info.register_values.push(pdu.read_be16(3));
        }
        FC_WRITE_MULTIPLE_COILS => {
            require(pdu, 6)?;
            info.starting_address = pdu.read_be16(1);
            info.quantity = pdu.read_be16(3);
            let byte_count = usize::from(pdu.read_u8(5));
            require(pdu, 6 + byte_count)?;
            'bits: for i in 0..byte_count {
                let byte = pdu.read_u8(6 + i);
                for bit in 0..8 {
                    if info.coil_values.len() >= usize::from(info.quantity) {
                        break 'bits;
                    }
                    info.coil_values.push(byte & (1 << bit) != 0);
                }
            }
        }
        FC_WRITE_MULTIPLE_REGISTERS => {
            require(pdu, 6)?;
            info.starting_address = pdu.read_be16(1);
            info.quantity = pdu.read_be16(3);
            let byte_count = usize::from(pdu.read_u8(5));
            if byte_count != usize::from(info.quantity) * 2 {
                return Err(ParseOutcome::InvalidFormat);
            }
            require(pdu, 6 + byte_count)?;
            for i in 0..usize::from(info.quantity) {
                info.register_values.push(pdu.read_be16(6 + i * 2));
            }
        }
        FC_MASK_WRITE_REGISTER => {
            require(pdu, 7)?;
            info.starting_address = pdu.read_be16(1);
            info.and_mask = pdu.read_be16(3);
            info.or_mask = pdu.read_be16(5);
        }
        FC_READ_WRITE_MULTIPLE_REGISTERS => {
            require(pdu, 10)?;
            info.read_starting_address = pdu.read_be16(1);
            info.read_quantity = pdu.read_be16(3);
            info.starting_address = pdu.read_be16(5);
            info.quantity = pdu.read_be16(7);
            let byte_count = usize::from(pdu.read_u8(9));
            require(pdu, 10 + byte_count)?;
            for i in 0..usize::from(info.quantity).min(byte_count / 2) {
                info.register_values.push(pdu.read_be16(10 + i * 2));
            }
        }
        FC_READ_DEVICE_IDENTIFICATION => {
            require(pdu, 4)?;
            info.mei_type = pdu.read_u8(1);
            info.device_id_code = pdu.read_u8(2);
            info.object_id = pdu.read_u8(3);
        }
        _ => {
            // Custom function codes pass through undecoded.
        }
    }
    Ok(())
}

fn require(pdu: &ByteSlice<'_>, len: usize) -> Result<(), ParseOutcome> {
    if pdu.len() < len {
        Err(ParseOutcome::NeedMoreData)
    } else {
        Ok(())
    }
}
