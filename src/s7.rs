//! Minimal S7comm-over-ISO-TCP transport (RFC 1006).
//!
//! Narrow leaf below the fieldbus adapter: connection setup plus single-item
//! area reads and writes. Only the areas the greenhouse PLC program uses are
//! modelled (M flags, process-image outputs, data blocks). Every field the
//! agent touches fits a single negotiated PDU, so no request splitting.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::FieldbusError;

pub const ISO_TCP_PORT: u16 = 102;
const REQUESTED_PDU_LENGTH: u16 = 480;

/// PLC memory areas addressable by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    /// M flag area (sensor float registers live here as MD cells).
    Merker,
    /// Process-image outputs (Q bits driving the actuators).
    ProcessOutputs,
    /// Data blocks (fixed-width status text fields).
    DataBlock,
}

impl Area {
    fn code(self) -> u8 {
        match self {
            Area::Merker => 0x83,
            Area::ProcessOutputs => 0x82,
            Area::DataBlock => 0x84,
        }
    }

    /// Human-readable address for error reporting, e.g. `MD8` or `DB4.0`.
    pub fn describe(self, db: u16, start: u32) -> String {
        match self {
            Area::Merker => format!("MD{start}"),
            Area::ProcessOutputs => format!("Q{start}"),
            Area::DataBlock => format!("DB{db}.{start}"),
        }
    }
}

/// Raw transport contract the fieldbus adapter is built on.
///
/// Implementations own the connection handle. They mark themselves
/// disconnected on any I/O error; retry cadence is the caller's concern.
#[allow(async_fn_in_trait)]
pub trait S7Transport {
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
    async fn connect(&mut self) -> Result<(), FieldbusError>;
    async fn read_area(
        &mut self,
        area: Area,
        db: u16,
        start: u32,
        len: u16,
    ) -> Result<Vec<u8>, FieldbusError>;
    async fn write_area(
        &mut self,
        area: Area,
        db: u16,
        start: u32,
        data: &[u8],
    ) -> Result<(), FieldbusError>;
}

/// Production transport over a plain TCP socket to port 102.
pub struct TcpTransport {
    host: String,
    rack: u16,
    slot: u16,
    stream: Option<TcpStream>,
    pdu_ref: u16,
    negotiated_pdu: u16,
}

impl TcpTransport {
    pub fn new(host: &str, rack: u16, slot: u16) -> Self {
        Self {
            host: host.to_string(),
            rack,
            slot,
            stream: None,
            pdu_ref: 0,
            negotiated_pdu: REQUESTED_PDU_LENGTH,
        }
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    /// Send one TPKT frame and receive the next one (payload after the
    /// 4-byte TPKT header).
    async fn exchange(&mut self, frame: &[u8]) -> std::io::Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected")
        })?;
        stream.write_all(frame).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        let total = u16::from_be_bytes([head[2], head[3]]) as usize;
        if total < 5 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "short TPKT frame",
            ));
        }
        let mut body = vec![0u8; total - 4];
        stream.read_exact(&mut body).await?;
        Ok(body)
    }

    /// Send an S7 job PDU and return the ack-data PDU payload.
    async fn request(&mut self, pdu: Vec<u8>) -> Result<Vec<u8>, String> {
        let body = match self.exchange(&frame_dt(&pdu)).await {
            Ok(body) => body,
            Err(e) => {
                self.stream = None;
                return Err(e.to_string());
            }
        };
        let s7 = strip_dt(&body)?;
        Ok(s7.to_vec())
    }
}

impl S7Transport for TcpTransport {
    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    async fn connect(&mut self) -> Result<(), FieldbusError> {
        self.stream = None;
        let conn_err = |detail: String| FieldbusError::Connection { detail };

        let stream = TcpStream::connect((self.host.as_str(), ISO_TCP_PORT))
            .await
            .map_err(|e| conn_err(format!("{}:{}: {e}", self.host, ISO_TCP_PORT)))?;
        self.stream = Some(stream);

        // COTP connection request with rack/slot-derived remote TSAP.
        let cc = self
            .exchange(&cotp_connect_frame(self.rack, self.slot))
            .await
            .map_err(|e| {
                self.stream = None;
                conn_err(format!("COTP exchange failed: {e}"))
            })?;
        if cc.len() < 2 || cc[1] != 0xD0 {
            self.stream = None;
            return Err(conn_err("COTP connection refused".into()));
        }

        // S7 communication setup, negotiating the PDU length.
        let pdu_ref = self.next_ref();
        let ack = self
            .request(s7_job(pdu_ref, &setup_params(), &[]))
            .await
            .map_err(|detail| {
                self.stream = None;
                conn_err(format!("S7 setup failed: {detail}"))
            })?;
        let (params, _) = parse_ack(&ack).map_err(|detail| {
            self.stream = None;
            conn_err(format!("S7 setup rejected: {detail}"))
        })?;
        if params.len() >= 8 {
            self.negotiated_pdu = u16::from_be_bytes([params[6], params[7]]);
        }
        debug!(
            host = %self.host,
            pdu_length = self.negotiated_pdu,
            "PLC transport connected"
        );
        Ok(())
    }

    async fn read_area(
        &mut self,
        area: Area,
        db: u16,
        start: u32,
        len: u16,
    ) -> Result<Vec<u8>, FieldbusError> {
        let addr = area.describe(db, start);
        let read_err = |detail: String| FieldbusError::Read {
            addr: addr.clone(),
            detail,
        };

        let pdu_ref = self.next_ref();
        let ack = self
            .request(s7_job(pdu_ref, &read_params(area, db, start, len), &[]))
            .await
            .map_err(&read_err)?;
        let (_, data) = parse_ack(&ack).map_err(&read_err)?;
        parse_read_data(data, len as usize).map_err(&read_err)
    }

    async fn write_area(
        &mut self,
        area: Area,
        db: u16,
        start: u32,
        data: &[u8],
    ) -> Result<(), FieldbusError> {
        let addr = area.describe(db, start);
        let write_err = |detail: String| FieldbusError::Write {
            addr: addr.clone(),
            detail,
        };

        let pdu_ref = self.next_ref();
        let pdu = s7_job(
            pdu_ref,
            &write_params(area, db, start, data.len() as u16),
            &write_data(data),
        );
        let ack = self.request(pdu).await.map_err(&write_err)?;
        let (_, ack_data) = parse_ack(&ack).map_err(&write_err)?;
        parse_write_data(ack_data).map_err(&write_err)
    }
}

// --- frame building and parsing (pure, unit-tested) ---

/// TPKT + COTP connection request. Local TSAP 0x0100 (PG), remote TSAP
/// derived from rack/slot the way Step7 clients do it.
fn cotp_connect_frame(rack: u16, slot: u16) -> Vec<u8> {
    let remote_tsap_lo = ((rack << 5) | (slot & 0x1F)) as u8;
    vec![
        0x03, 0x00, 0x00, 0x16, // TPKT, length 22
        0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, // COTP CR
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // source TSAP
        0xC2, 0x02, 0x01, remote_tsap_lo, // destination TSAP
    ]
}

/// Wrap an S7 PDU in TPKT + COTP data TPDU.
fn frame_dt(pdu: &[u8]) -> Vec<u8> {
    let total = (pdu.len() + 7) as u16;
    let mut frame = Vec::with_capacity(total as usize);
    frame.extend([0x03, 0x00]);
    frame.extend(total.to_be_bytes());
    frame.extend([0x02, 0xF0, 0x80]);
    frame.extend_from_slice(pdu);
    frame
}

/// Strip the COTP data header, returning the S7 PDU.
fn strip_dt(body: &[u8]) -> Result<&[u8], String> {
    if body.len() < 4 || body[1] != 0xF0 {
        return Err("unexpected COTP TPDU".into());
    }
    Ok(&body[3..])
}

/// S7 job header + parameters + data.
fn s7_job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(10 + params.len() + data.len());
    pdu.extend([0x32, 0x01, 0x00, 0x00]);
    pdu.extend(pdu_ref.to_be_bytes());
    pdu.extend((params.len() as u16).to_be_bytes());
    pdu.extend((data.len() as u16).to_be_bytes());
    pdu.extend_from_slice(params);
    pdu.extend_from_slice(data);
    pdu
}

fn setup_params() -> [u8; 8] {
    let [hi, lo] = REQUESTED_PDU_LENGTH.to_be_bytes();
    // function 0xF0, max AMQ caller/callee 1, requested PDU length
    [0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, hi, lo]
}

/// Single transport-size-BYTE item specification shared by read and write.
fn item_spec(area: Area, db: u16, start: u32, len: u16) -> [u8; 12] {
    let bit_addr = start * 8;
    let [len_hi, len_lo] = len.to_be_bytes();
    let [db_hi, db_lo] = db.to_be_bytes();
    [
        0x12, 0x0A, 0x10, 0x02, // item head, transport size BYTE
        len_hi, len_lo, db_hi, db_lo,
        area.code(),
        (bit_addr >> 16) as u8,
        (bit_addr >> 8) as u8,
        bit_addr as u8,
    ]
}

fn read_params(area: Area, db: u16, start: u32, len: u16) -> Vec<u8> {
    let mut params = vec![0x04, 0x01];
    params.extend(item_spec(area, db, start, len));
    params
}

fn write_params(area: Area, db: u16, start: u32, len: u16) -> Vec<u8> {
    let mut params = vec![0x05, 0x01];
    params.extend(item_spec(area, db, start, len));
    params
}

fn write_data(data: &[u8]) -> Vec<u8> {
    let bit_len = (data.len() as u16) * 8;
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend([0x00, 0x04]); // reserved, transport size: length in bits
    out.extend(bit_len.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Validate an ack-data PDU, returning its (params, data) sections.
fn parse_ack(pdu: &[u8]) -> Result<(&[u8], &[u8]), String> {
    if pdu.len() < 12 {
        return Err("short S7 ack".into());
    }
    if pdu[0] != 0x32 || pdu[1] != 0x03 {
        return Err(format!("unexpected S7 PDU type {:#04x}", pdu[1]));
    }
    if pdu[10] != 0 || pdu[11] != 0 {
        return Err(format!(
            "S7 error class {:#04x} code {:#04x}",
            pdu[10], pdu[11]
        ));
    }
    let param_len = u16::from_be_bytes([pdu[6], pdu[7]]) as usize;
    let data_len = u16::from_be_bytes([pdu[8], pdu[9]]) as usize;
    let params_end = 12 + param_len;
    let data_end = params_end + data_len;
    if pdu.len() < data_end {
        return Err("truncated S7 ack".into());
    }
    Ok((&pdu[12..params_end], &pdu[params_end..data_end]))
}

/// Extract the payload of a single read item.
fn parse_read_data(data: &[u8], expected: usize) -> Result<Vec<u8>, String> {
    if data.len() < 4 {
        return Err("short read item".into());
    }
    if data[0] != 0xFF {
        return Err(format!("item return code {:#04x}", data[0]));
    }
    let payload = &data[4..];
    if payload.len() < expected {
        return Err(format!(
            "expected {expected} bytes, got {}",
            payload.len()
        ));
    }
    Ok(payload[..expected].to_vec())
}

fn parse_write_data(data: &[u8]) -> Result<(), String> {
    match data.first() {
        Some(0xFF) => Ok(()),
        Some(code) => Err(format!("item return code {code:#04x}")),
        None => Err("empty write ack".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_encodes_rack_and_slot_tsap() {
        let frame = cotp_connect_frame(0, 1);
        assert_eq!(frame.len(), 22);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x16]);
        assert_eq!(frame[21], 0x01); // rack 0 slot 1
        assert_eq!(cotp_connect_frame(0, 2)[21], 0x02);
        assert_eq!(cotp_connect_frame(1, 1)[21], 0x21);
    }

    #[test]
    fn read_request_matches_known_encoding() {
        // Read 4 bytes at MD8: bit address 64.
        let pdu = s7_job(1, &read_params(Area::Merker, 0, 8, 4), &[]);
        assert_eq!(
            pdu,
            vec![
                0x32, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x0E, 0x00, 0x00, // header
                0x04, 0x01, // read var, 1 item
                0x12, 0x0A, 0x10, 0x02, 0x00, 0x04, 0x00, 0x00, 0x83, 0x00, 0x00, 0x40,
            ]
        );
    }

    #[test]
    fn write_request_carries_bit_length_and_payload() {
        let params = write_params(Area::ProcessOutputs, 0, 0, 1);
        assert_eq!(&params[..2], &[0x05, 0x01]);
        // Area code lives at offset 8 of the item spec, after the 2-byte
        // function header.
        assert_eq!(params[10], 0x82);

        let data = write_data(&[0x08]);
        assert_eq!(data, vec![0x00, 0x04, 0x00, 0x08, 0x08]);
    }

    #[test]
    fn db_item_addresses_the_block() {
        let spec = item_spec(Area::DataBlock, 4, 0, 102);
        assert_eq!(&spec[4..6], &[0x00, 0x66]); // length 102
        assert_eq!(&spec[6..8], &[0x00, 0x04]); // DB 4
        assert_eq!(spec[8], 0x84);
        assert_eq!(&spec[9..], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn ack_parsing_checks_error_class() {
        let good = [
            0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x05, 0x00, 0x00, // header
            0x04, 0x01, // params
            0xFF, 0x04, 0x00, 0x08, 0xAB, // data: one byte payload
        ];
        let (params, data) = parse_ack(&good).unwrap();
        assert_eq!(params, &[0x04, 0x01]);
        assert_eq!(parse_read_data(data, 1).unwrap(), vec![0xAB]);

        let mut bad = good;
        bad[10] = 0x81;
        assert!(parse_ack(&bad).unwrap_err().contains("error class"));
    }

    #[test]
    fn read_item_failure_code_is_reported() {
        // 0x0A: object does not exist
        let data = [0x0A, 0x00, 0x00, 0x00];
        assert!(parse_read_data(&data, 4).is_err());
        assert!(parse_read_data(&[0xFF, 0x04, 0x00, 0x08], 4).is_err()); // short payload
    }

    #[test]
    fn write_ack_requires_success_code() {
        assert!(parse_write_data(&[0xFF]).is_ok());
        assert!(parse_write_data(&[0x0A]).is_err());
        assert!(parse_write_data(&[]).is_err());
    }

    #[test]
    fn dt_framing_round_trips() {
        let pdu = s7_job(7, &setup_params(), &[]);
        let frame = frame_dt(&pdu);
        assert_eq!(&frame[..2], &[0x03, 0x00]);
        assert_eq!(
            u16::from_be_bytes([frame[2], frame[3]]) as usize,
            frame.len()
        );
        assert_eq!(strip_dt(&frame[4..]).unwrap(), pdu.as_slice());
    }
}
