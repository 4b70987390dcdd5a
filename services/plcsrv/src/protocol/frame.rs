//! S7 wire framing over ISO-on-TCP
//!
//! Every message is a TPKT frame (`03 00 len_hi len_lo`) carrying a COTP
//! TPDU. Data transfer TPDUs (`02 F0 80`) carry one S7 PDU:
//!
//! ```text
//! +------+--------+----------+---------+-----------+----------+-----------------+
//! | 0x32 | rosctr | reserved | pdu_ref | param_len | data_len | [err_cls err_cd]|
//! +------+--------+----------+---------+-----------+----------+-----------------+
//! ```
//!
//! The error bytes are present only on ack/ack-data PDUs. Both directions are
//! built and parsed here so the simulator and the client share one codec.

use crate::error::{PlcError, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const ISO_TCP_PORT: u16 = 102;
pub const DEFAULT_PDU_SIZE: u16 = 480;
pub const TPKT_HEADER_LEN: usize = 4;
/// Largest frame we accept; a TPKT length is 16 bits
pub const MAX_FRAME_LEN: usize = 65_535;

pub const AREA_DB: u8 = 0x84;

const PROTOCOL_ID: u8 = 0x32;
const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DT: u8 = 0xF0;
const COTP_DT_HEADER: [u8; 3] = [0x02, COTP_DT, 0x80];

pub const ROSCTR_JOB: u8 = 0x01;
pub const ROSCTR_ACK_DATA: u8 = 0x03;

pub const FN_SETUP_COMM: u8 = 0xF0;
pub const FN_READ_VAR: u8 = 0x04;
pub const FN_WRITE_VAR: u8 = 0x05;

pub const RC_SUCCESS: u8 = 0xFF;
pub const RC_ACCESS_DENIED: u8 = 0x03;
pub const RC_ADDRESS_OUT_OF_RANGE: u8 = 0x05;
pub const RC_TYPE_NOT_SUPPORTED: u8 = 0x06;
pub const RC_INCONSISTENT: u8 = 0x07;
pub const RC_OBJECT_MISSING: u8 = 0x0A;

const TS_BYTE: u8 = 0x02;
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE: u8 = 0x04;
const DATA_TS_INT: u8 = 0x05;

/// S7 header + read-var params + one response item header
const READ_OVERHEAD: usize = 18;
/// S7 header + write-var params + one data item header, with ack room
const WRITE_OVERHEAD: usize = 28;

pub fn max_read_payload(pdu_size: u16) -> usize {
    usize::from(pdu_size).saturating_sub(READ_OVERHEAD)
}

pub fn max_write_payload(pdu_size: u16) -> usize {
    usize::from(pdu_size).saturating_sub(WRITE_OVERHEAD)
}

pub fn return_code_message(code: u8) -> &'static str {
    match code {
        RC_SUCCESS => "success",
        RC_ACCESS_DENIED => "access denied",
        RC_ADDRESS_OUT_OF_RANGE => "address out of range",
        RC_TYPE_NOT_SUPPORTED => "data type not supported",
        RC_INCONSISTENT => "data type inconsistent",
        RC_OBJECT_MISSING => "object does not exist",
        _ => "unknown return code",
    }
}

// ============================================================================
// TPKT / COTP
// ============================================================================

/// Total frame length announced by a TPKT header
pub fn tpkt_length(header: &[u8; TPKT_HEADER_LEN]) -> Result<usize> {
    if header[0] != 0x03 {
        return Err(PlcError::protocol(format!(
            "invalid TPKT version {:#04x}",
            header[0]
        )));
    }
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if len < TPKT_HEADER_LEN + 3 {
        return Err(PlcError::protocol(format!("TPKT length {} too short", len)));
    }
    Ok(len)
}

fn tpkt(payload_len: usize) -> BytesMut {
    let total = TPKT_HEADER_LEN + payload_len;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(0x03);
    buf.put_u8(0x00);
    buf.put_u16(total as u16);
    buf
}

/// COTP connection request addressed to `rack`/`slot`
pub fn connection_request(rack: u8, slot: u8) -> Bytes {
    let cotp: [u8; 18] = [
        0x11, // length indicator
        COTP_CR,
        0x00,
        0x00, // destination reference
        0x00,
        0x01, // source reference
        0x00, // class 0
        0xC0,
        0x01,
        0x0A, // TPDU size 1024
        0xC1,
        0x02,
        0x01,
        0x00, // local TSAP
        0xC2,
        0x02,
        0x01,
        rack.wrapping_mul(0x20).wrapping_add(slot), // remote TSAP
    ];
    let mut buf = tpkt(cotp.len());
    buf.put_slice(&cotp);
    buf.freeze()
}

/// Remote TSAP `(rack, slot)` requested by a connection request frame
pub fn parse_connection_request(frame: &[u8]) -> Result<(u8, u8)> {
    if frame.len() < 22 || frame[5] != COTP_CR {
        return Err(PlcError::protocol("expected COTP connection request"));
    }
    let tsap = frame[21];
    Ok((tsap / 0x20, tsap % 0x20))
}

pub fn connection_confirm() -> Bytes {
    let cotp: [u8; 7] = [0x06, COTP_CC, 0x00, 0x01, 0x00, 0x01, 0x00];
    let mut buf = tpkt(cotp.len());
    buf.put_slice(&cotp);
    buf.freeze()
}

pub fn parse_connection_confirm(frame: &[u8]) -> Result<()> {
    match frame.get(5) {
        Some(&COTP_CC) => Ok(()),
        Some(other) => Err(PlcError::connection(format!(
            "connection rejected by device (COTP {:#04x})",
            other
        ))),
        None => Err(PlcError::protocol("truncated COTP confirm")),
    }
}

// ============================================================================
// S7 PDU
// ============================================================================

/// Borrowed view of one S7 PDU inside a frame
#[derive(Debug, Clone, PartialEq)]
pub struct S7Pdu<'a> {
    pub rosctr: u8,
    pub pdu_ref: u16,
    pub error_class: u8,
    pub error_code: u8,
    pub params: &'a [u8],
    pub data: &'a [u8],
}

impl S7Pdu<'_> {
    pub fn function(&self) -> Option<u8> {
        self.params.first().copied()
    }

    fn check_header_error(&self) -> Result<()> {
        if self.error_class != 0 || self.error_code != 0 {
            return Err(PlcError::protocol(format!(
                "device returned error class {:#04x} code {:#04x}",
                self.error_class, self.error_code
            )));
        }
        Ok(())
    }
}

fn s7_frame(rosctr: u8, pdu_ref: u16, params: &[u8], data: &[u8], error: Option<u16>) -> Bytes {
    let header_len = if error.is_some() { 12 } else { 10 };
    let s7_len = header_len + params.len() + data.len();
    let mut buf = tpkt(COTP_DT_HEADER.len() + s7_len);
    buf.put_slice(&COTP_DT_HEADER);
    buf.put_u8(PROTOCOL_ID);
    buf.put_u8(rosctr);
    buf.put_u16(0);
    buf.put_u16(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    if let Some(err) = error {
        buf.put_u16(err);
    }
    buf.put_slice(params);
    buf.put_slice(data);
    buf.freeze()
}

/// Parse a full TPKT frame carrying a COTP DT TPDU
pub fn parse_pdu(frame: &[u8]) -> Result<S7Pdu<'_>> {
    let s7 = frame
        .get(TPKT_HEADER_LEN..)
        .filter(|rest| rest.len() >= COTP_DT_HEADER.len() && rest[1] == COTP_DT)
        .map(|rest| &rest[COTP_DT_HEADER.len()..])
        .ok_or_else(|| PlcError::protocol("expected COTP data TPDU"))?;

    if s7.len() < 10 || s7[0] != PROTOCOL_ID {
        return Err(PlcError::protocol("invalid S7 header"));
    }
    let rosctr = s7[1];
    let header_len = if rosctr == 0x02 || rosctr == ROSCTR_ACK_DATA {
        12
    } else {
        10
    };
    if s7.len() < header_len {
        return Err(PlcError::protocol("truncated S7 header"));
    }
    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
    let data_len = usize::from(u16::from_be_bytes([s7[8], s7[9]]));
    let (error_class, error_code) = if header_len == 12 {
        (s7[10], s7[11])
    } else {
        (0, 0)
    };

    let body = &s7[header_len..];
    if body.len() < param_len + data_len {
        return Err(PlcError::protocol(format!(
            "S7 PDU truncated: need {} bytes, have {}",
            param_len + data_len,
            body.len()
        )));
    }
    Ok(S7Pdu {
        rosctr,
        pdu_ref,
        error_class,
        error_code,
        params: &body[..param_len],
        data: &body[param_len..param_len + data_len],
    })
}

fn expect_ack<'a>(frame: &'a [u8], pdu_ref: u16, function: u8) -> Result<S7Pdu<'a>> {
    let pdu = parse_pdu(frame)?;
    if pdu.rosctr != ROSCTR_ACK_DATA {
        return Err(PlcError::protocol(format!(
            "unexpected S7 message type {:#04x}",
            pdu.rosctr
        )));
    }
    if pdu.pdu_ref != pdu_ref {
        return Err(PlcError::protocol(format!(
            "PDU reference mismatch: sent {}, got {}",
            pdu_ref, pdu.pdu_ref
        )));
    }
    pdu.check_header_error()?;
    if pdu.function() != Some(function) {
        return Err(PlcError::protocol(format!(
            "unexpected function {:?}, expected {:#04x}",
            pdu.function(),
            function
        )));
    }
    Ok(pdu)
}

// ---------- Setup communication ----------

pub fn setup_communication(pdu_ref: u16, pdu_size: u16) -> Bytes {
    let mut params = [FN_SETUP_COMM, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00];
    params[6..8].copy_from_slice(&pdu_size.to_be_bytes());
    s7_frame(ROSCTR_JOB, pdu_ref, &params, &[], None)
}

pub fn setup_communication_response(pdu_ref: u16, pdu_size: u16) -> Bytes {
    let mut params = [FN_SETUP_COMM, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00];
    params[6..8].copy_from_slice(&pdu_size.to_be_bytes());
    s7_frame(ROSCTR_ACK_DATA, pdu_ref, &params, &[], Some(0))
}

/// Requested/negotiated PDU size carried by setup-communication params
pub fn setup_pdu_size(pdu: &S7Pdu<'_>) -> Result<u16> {
    match pdu.params {
        [FN_SETUP_COMM, _, _, _, _, _, hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(PlcError::protocol("malformed setup communication params")),
    }
}

pub fn parse_setup_response(frame: &[u8], pdu_ref: u16) -> Result<u16> {
    let pdu = expect_ack(frame, pdu_ref, FN_SETUP_COMM)?;
    let size = setup_pdu_size(&pdu)?;
    if size < 64 {
        return Err(PlcError::protocol(format!(
            "negotiated PDU size {} too small",
            size
        )));
    }
    Ok(size)
}

// ---------- Read / write var ----------

/// A byte span inside one data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbAddress {
    pub db: u16,
    pub start: u32,
    pub len: u16,
}

fn put_item(buf: &mut Vec<u8>, addr: &DbAddress) {
    let bit_address = addr.start.saturating_mul(8);
    buf.extend_from_slice(&[0x12, 0x0A, 0x10, TS_BYTE]);
    buf.extend_from_slice(&addr.len.to_be_bytes());
    buf.extend_from_slice(&addr.db.to_be_bytes());
    buf.push(AREA_DB);
    buf.extend_from_slice(&bit_address.to_be_bytes()[1..4]);
}

/// Address carried by a single-item read/write params block
pub fn parse_item(params: &[u8]) -> Result<DbAddress> {
    match params {
        [_, 1, 0x12, 0x0A, 0x10, _, l0, l1, d0, d1, area, a0, a1, a2, ..] => {
            if *area != AREA_DB {
                return Err(PlcError::protocol(format!("unsupported area {:#04x}", area)));
            }
            let bits = u32::from_be_bytes([0, *a0, *a1, *a2]);
            Ok(DbAddress {
                db: u16::from_be_bytes([*d0, *d1]),
                start: bits / 8,
                len: u16::from_be_bytes([*l0, *l1]),
            })
        },
        _ => Err(PlcError::protocol("malformed variable specification")),
    }
}

pub fn read_request(pdu_ref: u16, addr: &DbAddress) -> Bytes {
    let mut params = vec![FN_READ_VAR, 0x01];
    put_item(&mut params, addr);
    s7_frame(ROSCTR_JOB, pdu_ref, &params, &[], None)
}

/// Read-var answer carrying `data` on success or a bare return code
pub fn read_response(pdu_ref: u16, result: std::result::Result<&[u8], u8>) -> Bytes {
    let params = [FN_READ_VAR, 0x01];
    let mut data = Vec::new();
    match result {
        Ok(bytes) => {
            data.extend_from_slice(&[RC_SUCCESS, DATA_TS_BYTE]);
            data.extend_from_slice(&((bytes.len() * 8) as u16).to_be_bytes());
            data.extend_from_slice(bytes);
        },
        Err(code) => data.extend_from_slice(&[code, 0x00, 0x00, 0x00]),
    }
    s7_frame(ROSCTR_ACK_DATA, pdu_ref, &params, &data, Some(0))
}

pub fn parse_read_response(frame: &[u8], pdu_ref: u16) -> Result<Vec<u8>> {
    let pdu = expect_ack(frame, pdu_ref, FN_READ_VAR)?;
    let data = pdu.data;
    let return_code = *data
        .first()
        .ok_or_else(|| PlcError::protocol("empty read response"))?;
    if return_code != RC_SUCCESS {
        return Err(PlcError::protocol(format!(
            "read failed: {} ({:#04x})",
            return_code_message(return_code),
            return_code
        )));
    }
    if data.len() < 4 {
        return Err(PlcError::protocol("truncated read response item"));
    }
    let raw_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    let len = match data[1] {
        DATA_TS_BIT | DATA_TS_BYTE | DATA_TS_INT => raw_len.div_ceil(8),
        _ => raw_len,
    };
    data.get(4..4 + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| PlcError::protocol("read response shorter than announced"))
}

pub fn write_request(pdu_ref: u16, db: u16, start: u32, payload: &[u8]) -> Bytes {
    let addr = DbAddress {
        db,
        start,
        len: payload.len() as u16,
    };
    let mut params = vec![FN_WRITE_VAR, 0x01];
    put_item(&mut params, &addr);
    let mut data = vec![0x00, DATA_TS_BYTE];
    data.extend_from_slice(&((payload.len() * 8) as u16).to_be_bytes());
    data.extend_from_slice(payload);
    s7_frame(ROSCTR_JOB, pdu_ref, &params, &data, None)
}

/// Payload bytes of a single-item write request
pub fn write_payload<'a>(pdu: &S7Pdu<'a>) -> Result<&'a [u8]> {
    let data = pdu.data;
    if data.len() < 4 {
        return Err(PlcError::protocol("truncated write data item"));
    }
    let bits = usize::from(u16::from_be_bytes([data[2], data[3]]));
    data.get(4..4 + bits.div_ceil(8))
        .ok_or_else(|| PlcError::protocol("write data shorter than announced"))
}

pub fn write_response(pdu_ref: u16, return_code: u8) -> Bytes {
    s7_frame(
        ROSCTR_ACK_DATA,
        pdu_ref,
        &[FN_WRITE_VAR, 0x01],
        &[return_code],
        Some(0),
    )
}

pub fn parse_write_response(frame: &[u8], pdu_ref: u16) -> Result<()> {
    let pdu = expect_ack(frame, pdu_ref, FN_WRITE_VAR)?;
    match pdu.data.first() {
        Some(&RC_SUCCESS) => Ok(()),
        Some(&code) => Err(PlcError::protocol(format!(
            "write failed: {} ({:#04x})",
            return_code_message(code),
            code
        ))),
        None => Err(PlcError::protocol("empty write response")),
    }
}
