//! DNP3 deep analyzer: data-link framing with CRC validation, transport
//! fragment reassembly, application object walking, and security analysis.
//!
//! Replay and timing detection are driven by caller-supplied millisecond
//! clocks; fragment assembly is keyed by the data-link source address.

use dissect_common::ParseOutcome;
use dissect_core::ByteSlice;
use std::collections::HashMap;

pub const DNP3_TCP_PORT: u16 = 20000;

const START_BYTE_1: u8 = 0x05;
const START_BYTE_2: u8 = 0x64;
const DATALINK_HEADER_SIZE: usize = 10;
const MIN_FRAME_SIZE: usize = 10;

/// Application-layer function codes with a name.
pub fn application_function_name(code: u8) -> &'static str {
    match code {
        0x00 => "Confirm",
        0x01 => "Read",
        0x02 => "Write",
        0x03 => "Select",
        0x04 => "Operate",
        0x05 => "Direct Operate",
        0x06 => "Direct Operate No Response",
        0x07 => "Immediate Freeze",
        0x0D => "Cold Restart",
        0x0E => "Warm Restart",
        0x0F => "Initialize Data",
        0x10 => "Initialize Application",
        0x13 => "Save Configuration",
        0x16 => "Assign Class",
        0x18 => "Record Current Time",
        0x81 => "Response",
        0x82 => "Unsolicited Response",
        0x83 => "Authenticate Response",
        _ => "Unknown",
    }
}

/// Data-link function codes with a name.
pub fn datalink_function_name(code: u8) -> &'static str {
    match code {
        0 => "Reset Link States",
        1 => "Reset User Process",
        2 => "Test Link States",
        3 => "User Data",
        4 => "Request Link Status",
        9 => "Request User Data",
        11 => "Link Status",
        14 => "Not Supported",
        15 => "Not Used",
        _ => "Unknown",
    }
}

pub fn is_critical_function(code: u8) -> bool {
    matches!(code, 0x0D | 0x0E | 0x04 | 0x05 | 0x02)
}

pub fn is_configuration_function(code: u8) -> bool {
    matches!(code, 0x13 | 0x0F | 0x10 | 0x16)
}

/// Decoded data-link header.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Dnp3Datalink {
    pub length: u8,
    pub control: u8,
    pub destination: u16,
    pub source: u16,
    pub crc: u16,
    /// Control bit 0x80: frame travels outstation-to-master.
    pub direction: bool,
    /// Control bit 0x40.
    pub primary: bool,
    /// Frame count bit, control 0x20.
    pub fcb: bool,
    /// Data flow control, control 0x10.
    pub dfc: bool,
    /// Low nibble of control.
    pub function_code: u8,
}

/// Decoded transport header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dnp3Transport {
    pub fin: bool,
    pub fir: bool,
    pub sequence: u8,
    pub data: Vec<u8>,
}

/// One application-layer object header plus its data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dnp3Object {
    pub group: u8,
    pub variation: u8,
    pub qualifier: u8,
    pub range_start: u16,
    pub range_stop: u16,
    pub data: Vec<u8>,
}

impl Dnp3Object {
    pub fn description(&self) -> &'static str {
        match (self.group, self.variation) {
            (1, 1) => "Binary Input - Packed Format",
            (1, 2) => "Binary Input - With Flags",
            (2, 1) => "Binary Input Change - Without Time",
            (2, 2) => "Binary Input Change - With Absolute Time",
            (10, 1) => "Binary Output - Packed Format",
            (10, 2) => "Binary Output Status - With Flags",
            (12, 1) => "Binary Command - CROB",
            (20, 1) => "Binary Counter - 32-bit With Flag",
            (20, 2) => "Binary Counter - 16-bit With Flag",
            (30, 1) => "Analog Input - 32-bit With Flag",
            (30, 2) => "Analog Input - 16-bit With Flag",
            (30, 3) => "Analog Input - 32-bit Without Flag",
            (40, 1) => "Analog Output Status - 32-bit With Flag",
            (40, 2) => "Analog Output Status - 16-bit With Flag",
            (41, 1) => "Analog Output - 32-bit",
            (41, 2) => "Analog Output - 16-bit",
            (50, 1) => "Time and Date",
            (50, 2) => "Time and Date with Interval",
            (60, 1) => "Class 0 Data",
            (60, 2) => "Class 1 Data",
            (60, 3) => "Class 2 Data",
            (60, 4) => "Class 3 Data",
            _ => "Unknown Object",
        }
    }
}

/// Per-item object body size, keyed by `(group, variation)`.
fn object_data_size(group: u8, variation: u8) -> usize {
    match (group, variation) {
        (1, 1) | (10, 1) => 0, // packed formats
        (1, 2) | (10, 2) => 1,
        (20, 1) => 5,
        (20, 2) => 3,
        (30, 1) => 5,
        (30, 2) => 3,
        (30, 3) => 4,
        (40, 1) => 5,
        (40, 2) => 3,
        _ => 1,
    }
}

/// Decoded application header plus objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dnp3Application {
    pub application_control: u8,
    pub function_code: u8,
    /// Internal Indications; present on responses (0x81/0x82).
    pub internal_indications: u16,
    pub fir: bool,
    pub fin: bool,
    pub con: bool,
    pub uns: bool,
    pub sequence: u8,
    pub objects: Vec<Dnp3Object>,
}

/// Security findings for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dnp3SecurityAnalysis {
    pub broadcast_detected: bool,
    pub time_sync_detected: bool,
    pub configuration_change: bool,
    pub critical_function_executed: bool,
    pub replay_possible: bool,
    pub security_issues: Vec<String>,
    pub operational_risks: Vec<String>,
    /// 0-100.
    pub security_score: u32,
    pub risk_level: &'static str,
}

/// Decoded DNP3 frame across all three layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dnp3Info {
    pub datalink: Dnp3Datalink,
    pub transport: Dnp3Transport,
    pub application: Dnp3Application,
    pub crc_valid: bool,
    /// FIR and FIN both set: the frame carries a whole application message.
    pub complete_message: bool,
    /// Reassembled application payload when this frame completed a
    /// multi-fragment message.
    pub reassembled: Option<Vec<u8>>,
    pub parse_errors: Vec<String>,
    pub anomalies: Vec<String>,
    pub anomaly_score: f64,
    pub security: Dnp3SecurityAnalysis,
}

/// CRC-16/DNP lookup table.
static CRC_TABLE: [u16; 256] = [
    0x0000, 0x365E, 0x6CBC, 0x5AE2, 0xD978, 0xEF26, 0xB5C4, 0x839A, 0xFF89, 0xC9D7, 0x9335,
    0xA56B, 0x26F1, 0x10AF, 0x4A4D, 0x7C13, 0xB26B, 0x8435, 0xDED7, 0xE889, 0x6B13, 0x5D4D,
    0x07AF, 0x31F1, 0x4DE2, 0x7BBC, 0x215E, 0x1700, 0x949A, 0xA2C4, 0xF826, 0xCE78, 0x29AF,
    0x1FF1, 0x4513, 0x734D, 0xF0D7, 0xC689, 0x9C6B, 0xAA35, 0xD626, 0xE078, 0xBA9A, 0x8CC4,
    0x0F5E, 0x3900, 0x63E2, 0x55BC, 0x9BC4, 0xAD9A, 0xF778, 0xC126, 0x42BC, 0x74E2, 0x2E00,
    0x185E, 0x644D, 0x5213, 0x08F1, 0x3EAF, 0xBD35, 0x8B6B, 0xD189, 0xE7D7, 0x535E, 0x6500,
    0x3FE2, 0x09BC, 0x8A26, 0xBC78, 0xE69A, 0xD0C4, 0xACD7, 0x9A89, 0xC06B, 0xF635, 0x75AF,
    0x43F1, 0x1913, 0x2F4D, 0xE135, 0xD76B, 0x8D89, 0xBBD7, 0x384D, 0x0E13, 0x54F1, 0x62AF,
    0x1EBC, 0x28E2, 0x7200, 0x445E, 0xC7C4, 0xF19A, 0xAB78, 0x9D26, 0x7AF1, 0x4CAF, 0x164D,
    0x2013, 0xA389, 0x95D7, 0xCF35, 0xF96B, 0x8578, 0xB326, 0xE9C4, 0xDF9A, 0x5C00, 0x6A5E,
    0x30BC, 0x06E2, 0xC89A, 0xFEC4, 0xA426, 0x9278, 0x11E2, 0x27BC, 0x7D5E, 0x4B00, 0x3713,
    0x014D, 0x5BAF, 0x6DF1, 0xEE6B, 0xD835, 0x82D7, 0xB489, 0xA6BC, 0x90E2, 0xCA00, 0xFC5E,
    0x7FC4, 0x499A, 0x1378, 0x2526, 0x5935, 0x6F6B, 0x3589, 0x03D7, 0x804D, 0xB613, 0xECF1,
    0xDAAF, 0x14D7, 0x2289, 0x786B, 0x4E35, 0xCDAF, 0xFBF1, 0xA113, 0x974D, 0xEB5E, 0xDD00,
    0x87E2, 0xB1BC, 0x3226, 0x0478, 0x5E9A, 0x68C4, 0x8F13, 0xB94D, 0xE3AF, 0xD5F1, 0x566B,
    0x6035, 0x3AD7, 0x0C89, 0x709A, 0x46C4, 0x1C26, 0x2A78, 0xA9E2, 0x9FBC, 0xC55E, 0xF300,
    0x3D78, 0x0B26, 0x51C4, 0x679A, 0xE400, 0xD25E, 0x88BC, 0xBEE2, 0xC2F1, 0xF4AF, 0xAE4D,
    0x9813, 0x1B89, 0x2DD7, 0x7735, 0x416B, 0xF5E2, 0xC3BC, 0x995E, 0xAF00, 0x2C9A, 0x1AC4,
    0x4026, 0x7678, 0x0A6B, 0x3C35, 0x66D7, 0x5089, 0xD313, 0xE54D, 0xBFAF, 0x89F1, 0x4789,
    0x71D7, 0x2B35, 0x1D6B, 0x9EF1, 0xA8AF, 0xF24D, 0xC413, 0xB800, 0x8E5E, 0xD4BC, 0xE2E2,
    0x6178, 0x5726, 0x0DC4, 0x3B9A, 0xDC4D, 0xEA13, 0xB0F1, 0x86AF, 0x0535, 0x336B, 0x6989,
    0x5FD7, 0x23C4, 0x159A, 0x4F78, 0x7926, 0xFABC, 0xCCE2, 0x9600, 0xA05E, 0x6E26, 0x5878,
    0x029A, 0x34C4, 0xB75E, 0x8100, 0xDBE2, 0xEDBC, 0x91AF, 0xA7F1, 0xFD13, 0xCB4D, 0x48D7,
    0x7E89, 0x246B, 0x1235,
];

/// Table-driven CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let index = usize::from((crc ^ u16::from(byte)) & 0xFF);
        crc = (crc >> 8) ^ CRC_TABLE[index];
    }
    crc
}

/// DNP3 deep analyzer.
pub struct Dnp3Analyzer {
    /// Transport fragments accumulating per source address.
    fragments: HashMap<u16, Vec<Dnp3Transport>>,
    /// `(source << 16 | app_seq)` to last-seen timestamp.
    sequence_seen: HashMap<u32, u64>,
    last_packet_ms: Option<u64>,
    anomaly_threshold: f64,
}

impl Dnp3Analyzer {
    pub fn new() -> Self {
        Self {
            fragments: HashMap::new(),
            sequence_seen: HashMap::new(),
            last_packet_ms: None,
            anomaly_threshold: 0.8,
        }
    }

    pub fn set_anomaly_threshold(&mut self, threshold: f64) {
        self.anomaly_threshold = threshold;
    }

    /// Cheap probe: start bytes, plausible length and control nibble.
    pub fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= MIN_FRAME_SIZE
            && buffer.read_u8(0) == START_BYTE_1
            && buffer.read_u8(1) == START_BYTE_2
            && buffer.read_u8(2) >= 5
    }

    /// Parse one frame. `now_ms` drives replay and timing detection.
    pub fn parse_packet(
        &mut self,
        buffer: &ByteSlice<'_>,
        now_ms: u64,
    ) -> Result<Dnp3Info, ParseOutcome> {
        if buffer.len() < MIN_FRAME_SIZE {
            return Err(ParseOutcome::BufferTooSmall);
        }
        if buffer.read_u8(0) != START_BYTE_1 || buffer.read_u8(1) != START_BYTE_2 {
            return Err(ParseOutcome::InvalidFormat);
        }

        let mut info = Dnp3Info::default();

        let control = buffer.read_u8(3);
        info.datalink = Dnp3Datalink {
            length: buffer.read_u8(2),
            control,
            destination: buffer.read_be16(4),
            source: buffer.read_be16(6),
            crc: buffer.read_be16(8),
            direction: control & 0x80 != 0,
            primary: control & 0x40 != 0,
            fcb: control & 0x20 != 0,
            dfc: control & 0x10 != 0,
            function_code: control & 0x0F,
        };

        info.crc_valid = crc16(&buffer.as_bytes()[..8]) == info.datalink.crc;
        if !info.crc_valid {
            // Recorded, not fatal: the rest of the frame may still decode.
            info.parse_errors.push("data-link CRC mismatch".to_owned());
            tracing::warn!(source = info.datalink.source, "DNP3 CRC mismatch");
        }

        // The length field covers control + addresses + user data.
        if info.datalink.length > 5 {
            let transport_len = (buffer.len() - DATALINK_HEADER_SIZE)
                .min(usize::from(info.datalink.length) - 5);
            if transport_len > 0 {
                let transport = buffer.slice(DATALINK_HEADER_SIZE, transport_len);
                let control = transport.read_u8(0);
                info.transport = Dnp3Transport {
                    fin: control & 0x80 != 0,
                    fir: control & 0x40 != 0,
                    sequence: control & 0x3F,
                    data: transport.as_bytes()[1..].to_vec(),
                };

                info.complete_message = info.transport.fin && info.transport.fir;
                if info.complete_message {
                    if info.transport.data.len() >= 2 {
                        parse_application(&info.transport.data.clone(), &mut info);
                    }
                } else {
                    info.reassembled = self.accumulate_fragment(&info);
                    if let Some(message) = info.reassembled.clone() {
                        if message.len() >= 2 {
                            parse_application(&message, &mut info);
                        }
                    }
                }
            }
        }

        info.security = self.analyze_security(&info, now_ms);
        self.analyze_anomalies(&mut info, now_ms);
        self.last_packet_ms = Some(now_ms);

        Ok(info)
    }

    /// Sequence-ordered fragment accumulation keyed by source address;
    /// returns the assembled payload once FIN arrives.
    fn accumulate_fragment(&mut self, info: &Dnp3Info) -> Option<Vec<u8>> {
        let source = info.datalink.source;
        if info.transport.fir {
            self.fragments.insert(source, Vec::new());
        }
        let list = self.fragments.entry(source).or_default();
        list.push(info.transport.clone());

        if !info.transport.fin {
            return None;
        }
        let mut list = self.fragments.remove(&source)?;
        list.sort_by_key(|t| t.sequence);
        let mut assembled = Vec::new();
        for fragment in list {
            assembled.extend_from_slice(&fragment.data);
        }
        Some(assembled)
    }

    fn analyze_security(&mut self, info: &Dnp3Info, now_ms: u64) -> Dnp3SecurityAnalysis {
        let mut analysis = Dnp3SecurityAnalysis::default();
        let app_fc = info.application.function_code;

        analysis.broadcast_detected = info.datalink.destination == 0xFFFF;
        analysis.time_sync_detected = app_fc == 0x07;

        if is_configuration_function(app_fc) {
            analysis.configuration_change = true;
            analysis
                .operational_risks
                .push("configuration change requested".to_owned());
        }
        if is_critical_function(app_fc) {
            analysis.critical_function_executed = true;
            analysis
                .operational_risks
                .push(format!("critical function: {}", application_function_name(app_fc)));
        }

        // Broadcast is only expected for time synchronization.
        if analysis.broadcast_detected && app_fc != 0x18 {
            analysis
                .security_issues
                .push("broadcast address abuse".to_owned());
        }

        // Same (source, app sequence) inside a minute smells like replay.
        let seq_key = (u32::from(info.datalink.source) << 16) | u32::from(info.application.sequence);
        if let Some(&seen) = self.sequence_seen.get(&seq_key) {
            if now_ms.saturating_sub(seen) < 60_000 {
                analysis.replay_possible = true;
                analysis
                    .security_issues
                    .push("repeated application sequence".to_owned());
            }
        }
        self.sequence_seen.insert(seq_key, now_ms);

        if let Some(last) = self.last_packet_ms {
            if now_ms.saturating_sub(last) < 10 {
                analysis
                    .security_issues
                    .push("inter-packet interval under 10 ms".to_owned());
            }
        }

        let mut score: u32 = 100;
        score = score.saturating_sub(analysis.security_issues.len() as u32 * 15);
        score = score.saturating_sub(analysis.operational_risks.len() as u32 * 10);
        if analysis.broadcast_detected {
            score = score.saturating_sub(5);
        }
        if analysis.critical_function_executed {
            score = score.saturating_sub(20);
        }
        if analysis.replay_possible {
            score = score.saturating_sub(25);
        }
        analysis.security_score = score;
        analysis.risk_level = match score {
            80..=100 => "LOW",
            60..=79 => "MEDIUM",
            40..=59 => "HIGH",
            _ => "CRITICAL",
        };

        analysis
    }

    fn analyze_anomalies(&self, info: &mut Dnp3Info, now_ms: u64) {
        let mut score: f64 = 0.0;

        if info.datalink.length > 250 {
            info.anomalies.push("unusually large frame".to_owned());
            score += 0.3;
        }
        let app_fc = info.application.function_code;
        if app_fc > 0x82 && app_fc != 0x83 {
            info.anomalies.push("unknown function code".to_owned());
            score += 0.4;
        }
        if info.datalink.source == 0 || info.datalink.destination == 0 {
            info.anomalies.push("zero address".to_owned());
            score += 0.2;
        }
        if !info.crc_valid {
            score += 0.5;
        }
        if let Some(last) = self.last_packet_ms {
            let interval = now_ms.saturating_sub(last);
            if interval < 1 {
                info.anomalies.push("packet interval too short".to_owned());
            } else if interval > 30_000 {
                info.anomalies.push("packet interval too long".to_owned());
            }
        }

        info.anomaly_score = score.min(1.0);
        if info.anomaly_score > self.anomaly_threshold {
            tracing::debug!(score = info.anomaly_score, "DNP3 anomaly threshold exceeded");
        }
    }
}

impl Default for Dnp3Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_application(data: &[u8], info: &mut Dnp3Info) {
    let app_control = data[0];
    let function_code = data[1];
    let mut app = Dnp3Application {
        application_control: app_control,
        function_code,
        fir: app_control & 0x80 != 0,
        fin: app_control & 0x40 != 0,
        con: app_control & 0x20 != 0,
        uns: app_control & 0x10 != 0,
        sequence: app_control & 0x0F,
        ..Dnp3Application::default()
    };

    // Responses carry the Internal Indications word.
    let object_offset = if matches!(function_code, 0x81 | 0x82) && data.len() >= 4 {
        app.internal_indications = u16::from_be_bytes([data[2], data[3]]);
        4
    } else {
        2
    };

    if data.len() > object_offset {
        parse_objects(&data[object_offset..], &mut app);
    }
    info.application = app;
}

fn parse_objects(data: &[u8], app: &mut Dnp3Application) {
    let mut offset = 0;
    while offset + 3 <= data.len() {
        let mut object = Dnp3Object {
            group: data[offset],
            variation: data[offset + 1],
            qualifier: data[offset + 2],
            ..Dnp3Object::default()
        };
        offset += 3;

        if object.qualifier & 0x0F == 0x06 {
            // "All objects": no range field, no body in requests.
            app.objects.push(object);
            continue;
        }

        match object.qualifier & 0x70 {
            0x00 => {
                // Start-stop range.
                if offset + 4 > data.len() {
                    break;
                }
                object.range_start = u16::from_be_bytes([data[offset], data[offset + 1]]);
                object.range_stop = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                offset += 4;
            }
            0x10 => {
                // Start plus count.
                if offset + 4 > data.len() {
                    break;
                }
                object.range_start = u16::from_be_bytes([data[offset], data[offset + 1]]);
                let quantity = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                object.range_stop = object.range_start.wrapping_add(quantity).wrapping_sub(1);
                offset += 4;
            }
            _ => {}
        }

        let item_count = usize::from(object.range_stop.saturating_sub(object.range_start)) + 1;
        let item_size = object_data_size(object.group, object.variation);
        let body = (item_size * item_count).min(data.len() - offset);
        object.data = data[offset..offset + body].to_vec();
        offset += body;

        app.objects.push(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(control: u8, dst: u16, src: u16, user_data: &[u8]) -> Vec<u8> {
        let mut f = vec![
            START_BYTE_1,
            START_BYTE_2,
            (5 + user_data.len()) as u8,
            control,
        ];
        f.extend_from_slice(&dst.to_be_bytes());
        f.extend_from_slice(&src.to_be_bytes());
        let crc = crc16(&f);
        f.extend_from_slice(&crc.to_be_bytes());
        f.extend_from_slice(user_data);
        f
    }

    #[test]
    fn test_crc_table_consistency() {
        // The table must agree with bitwise CRC-16/DNP (poly 0x3D65 reflected
        // = 0xA6BC) on a few probes.
        fn bitwise(data: &[u8]) -> u16 {
            let mut crc: u16 = 0;
            for &byte in data {
                crc ^= u16::from(byte);
                for _ in 0..8 {
                    if crc & 1 != 0 {
                        crc = (crc >> 1) ^ 0xA6BC;
                    } else {
                        crc >>= 1;
                    }
                }
            }
            crc
        }
        for sample in [&b"\x05\x64\x05\xC0"[..], b"", b"\xFF", b"\x01\x02\x03\x04\x05\x06\x07\x08"]
        {
            assert_eq!(crc16(sample), bitwise(sample), "sample {sample:?}");
        }
    }

    #[test]
    fn test_read_class_data_frame() {
        // Read request (app fc 0x01) for class 0 data (group 60 var 2 here).
        let user_data = [0xC1, 0xC0, 0x01, 0x3C, 0x02, 0x06, 0x00, 0x00];
        let data = frame(0x44, 0x000A, 0x0001, &user_data);
        let mut analyzer = Dnp3Analyzer::new();
        assert!(analyzer.can_parse(&ByteSlice::borrowed(&data)));

        let info = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 1_000)
            .unwrap();
        assert_eq!(info.datalink.function_code, 4);
        assert_eq!(info.datalink.destination, 0x000A);
        assert_eq!(info.datalink.source, 0x0001);
        assert!(info.crc_valid);
        assert!(info.complete_message);
        assert_eq!(info.application.function_code, 0x01);
        assert_eq!(info.application.objects.len(), 1);
        assert_eq!(info.application.objects[0].group, 60);
        assert_eq!(info.application.objects[0].variation, 2);
    }

    #[test]
    fn test_crc_mismatch_recorded_not_fatal() {
        let mut data = frame(0x44, 1, 2, &[0xC1, 0x01]);
        data[8] ^= 0xFF;
        let mut analyzer = Dnp3Analyzer::new();
        let info = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 0)
            .unwrap();
        assert!(!info.crc_valid);
        assert!(!info.parse_errors.is_empty());
        assert!(info.anomaly_score >= 0.5);
    }

    #[test]
    fn test_response_carries_iin() {
        // Response fc 0x81, IIN 0x8001.
        let user_data = [0xC3, 0xC1, 0x81, 0x80, 0x01];
        let data = frame(0x44, 1, 10, &user_data);
        let mut analyzer = Dnp3Analyzer::new();
        let info = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 0)
            .unwrap();
        assert_eq!(info.application.function_code, 0x81);
        assert_eq!(info.application.internal_indications, 0x8001);
    }

    #[test]
    fn test_broadcast_abuse_flagged() {
        let user_data = [0xC1, 0xC0, 0x02, 0x00]; // Write via broadcast
        let data = frame(0x44, 0xFFFF, 1, &user_data);
        let mut analyzer = Dnp3Analyzer::new();
        let info = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 0)
            .unwrap();
        assert!(info.security.broadcast_detected);
        assert!(info
            .security
            .security_issues
            .iter()
            .any(|i| i.contains("broadcast")));
        assert!(info.security.critical_function_executed);
    }

    #[test]
    fn test_replay_detection() {
        let user_data = [0xC1, 0xC5, 0x01]; // app seq 5
        let data = frame(0x44, 1, 7, &user_data);
        let mut analyzer = Dnp3Analyzer::new();
        let first = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 1_000)
            .unwrap();
        assert!(!first.security.replay_possible);
        let second = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 2_000)
            .unwrap();
        assert!(second.security.replay_possible);
        // Far outside the window the same sequence is fine again.
        let third = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 2_000 + 120_000)
            .unwrap();
        assert!(!third.security.replay_possible);
    }

    #[test]
    fn test_fragment_reassembly() {
        let mut analyzer = Dnp3Analyzer::new();
        // FIR only (seq 0) carrying the app header, then FIN only (seq 1)
        // carrying the first object header, same source.
        let first = frame(0x44, 1, 33, &[0x40, 0xC1, 0x01]);
        let second = frame(0x44, 1, 33, &[0x81, 0x3C, 0x02]);

        let info1 = analyzer
            .parse_packet(&ByteSlice::borrowed(&first), 0)
            .unwrap();
        assert!(!info1.complete_message);
        assert!(info1.reassembled.is_none());

        let info2 = analyzer
            .parse_packet(&ByteSlice::borrowed(&second), 10)
            .unwrap();
        assert_eq!(info2.reassembled, Some(vec![0xC1, 0x01, 0x3C, 0x02]));
        // The assembled message parses as an application fragment.
        assert_eq!(info2.application.function_code, 0x01);
    }

    #[test]
    fn test_unknown_function_anomaly() {
        let user_data = [0xC1, 0xC0, 0x90];
        let data = frame(0x44, 1, 2, &user_data);
        let mut analyzer = Dnp3Analyzer::new();
        let info = analyzer
            .parse_packet(&ByteSlice::borrowed(&data), 0)
            .unwrap();
        assert!(info.anomalies.iter().any(|a| a.contains("unknown function")));
    }

    #[test]
    fn test_not_dnp3_rejected() {
        let data = [0x01u8; 12];
        let mut analyzer = Dnp3Analyzer::new();
        assert_eq!(
            analyzer.parse_packet(&ByteSlice::borrowed(&data), 0),
            Err(ParseOutcome::InvalidFormat)
        );
    }
}
