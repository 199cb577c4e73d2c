//! Modbus/TCP client (`--features modbus`, on by default).
//!
//! Connection parameters: `host` (required), `port` (default 502),
//! `unit_id` (default 1). Addresses: `hr:<n>` holding register (function 3),
//! `ir:<n>` input register (function 4), bare `<n>` is a holding register.
//! `data_type` selects decoding: u16 (default), i16, u32, i32, f32; the
//! 32-bit types read two registers, high word first.

use std::time::Duration;

use async_trait::async_trait;
use skiff_domain::{DataPoint, SensorConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::AdapterError;
use crate::session::{ProtocolAdapter, ProtocolSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const FC_READ_HOLDING: u8 = 3;
pub const FC_READ_INPUT: u8 = 4;

pub struct ModbusAdapter;

impl ModbusAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ModbusAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusAdapter {
    fn protocol(&self) -> &'static str {
        "modbus"
    }

    async fn connect(
        &self,
        config: &SensorConfig,
    ) -> Result<Box<dyn ProtocolSession>, AdapterError> {
        let host = config
            .connection
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Config("modbus connection requires 'host'".into()))?;
        let port = config
            .connection
            .get("port")
            .and_then(|v| v.as_u64())
            .unwrap_or(502) as u16;
        let unit_id = config
            .connection
            .get("unit_id")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u8;

        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| AdapterError::Connect(format!("connect {addr}: timeout")))?
            .map_err(|e| AdapterError::Connect(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AdapterError::Connect(e.to_string()))?;
        debug!(%addr, unit_id, "modbus session connected");

        Ok(Box::new(ModbusSession {
            stream,
            unit_id,
            txn_id: 0,
        }))
    }
}

// ── Wire codec ────────────────────────────────────────────────────────────────

pub(crate) mod codec {
    use crate::error::AdapterError;

    /// MBAP header + read request PDU.
    pub fn encode_read(txn_id: u16, unit_id: u8, function: u8, address: u16, count: u16) -> [u8; 12] {
        let mut frame = [0u8; 12];
        frame[0..2].copy_from_slice(&txn_id.to_be_bytes());
        // protocol id 0, length = unit + pdu = 6
        frame[4..6].copy_from_slice(&6u16.to_be_bytes());
        frame[6] = unit_id;
        frame[7] = function;
        frame[8..10].copy_from_slice(&address.to_be_bytes());
        frame[10..12].copy_from_slice(&count.to_be_bytes());
        frame
    }

    /// Parse the PDU of a read response (everything after the MBAP header's
    /// unit byte). Exception responses map to protocol errors carrying the
    /// modbus exception code.
    pub fn parse_read_pdu(function: u8, pdu: &[u8]) -> Result<Vec<u16>, AdapterError> {
        let Some(&fc) = pdu.first() else {
            return Err(AdapterError::protocol("empty modbus response"));
        };
        if fc == function | 0x80 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(AdapterError::Protocol {
                message: format!("modbus exception {code}"),
                code: Some(code as i64),
            });
        }
        if fc != function {
            return Err(AdapterError::protocol(format!(
                "unexpected function {fc} in response to {function}"
            )));
        }
        let byte_count = *pdu
            .get(1)
            .ok_or_else(|| AdapterError::protocol("truncated modbus response"))? as usize;
        let data = pdu
            .get(2..2 + byte_count)
            .ok_or_else(|| AdapterError::protocol("truncated modbus register data"))?;
        if byte_count % 2 != 0 {
            return Err(AdapterError::protocol("odd modbus byte count"));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn encodes_the_mbap_frame() {
            let frame = encode_read(0x0102, 9, 3, 100, 2);
            assert_eq!(
                frame,
                [0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 9, 3, 0x00, 100, 0x00, 2]
            );
        }

        #[test]
        fn parses_registers() {
            // fc 3, 4 bytes, registers 0x0102 0x0304
            let pdu = [3u8, 4, 0x01, 0x02, 0x03, 0x04];
            assert_eq!(parse_read_pdu(3, &pdu).unwrap(), vec![0x0102, 0x0304]);
        }

        #[test]
        fn surfaces_exception_codes() {
            let pdu = [0x83u8, 2];
            match parse_read_pdu(3, &pdu) {
                Err(AdapterError::Protocol { code, .. }) => assert_eq!(code, Some(2)),
                other => panic!("expected protocol error, got {other:?}"),
            }
        }

        #[test]
        fn rejects_truncated_data() {
            let pdu = [3u8, 4, 0x01];
            assert!(parse_read_pdu(3, &pdu).is_err());
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ParsedAddress {
    function: u8,
    address: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DataType {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DataType {
    fn of(point: &DataPoint) -> Result<Self, AdapterError> {
        match point.data_type.as_deref() {
            None | Some("u16") => Ok(DataType::U16),
            Some("i16") => Ok(DataType::I16),
            Some("u32") => Ok(DataType::U32),
            Some("i32") => Ok(DataType::I32),
            Some("f32") => Ok(DataType::F32),
            Some(other) => Err(AdapterError::protocol(format!(
                "unsupported modbus data_type '{other}'"
            ))),
        }
    }

    fn register_count(self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
        }
    }

    fn decode(self, registers: &[u16]) -> Result<f64, AdapterError> {
        let need = self.register_count() as usize;
        if registers.len() < need {
            return Err(AdapterError::protocol("short modbus register response"));
        }
        Ok(match self {
            DataType::U16 => registers[0] as f64,
            DataType::I16 => registers[0] as i16 as f64,
            DataType::U32 => (((registers[0] as u32) << 16) | registers[1] as u32) as f64,
            DataType::I32 => (((registers[0] as u32) << 16) | registers[1] as u32) as i32 as f64,
            DataType::F32 => {
                f32::from_bits(((registers[0] as u32) << 16) | registers[1] as u32) as f64
            }
        })
    }
}

fn parse_point_address(point: &DataPoint) -> Result<ParsedAddress, AdapterError> {
    let addr = point.address.as_str();
    let (function, number) = if let Some(rest) = addr.strip_prefix("hr:") {
        (FC_READ_HOLDING, rest)
    } else if let Some(rest) = addr.strip_prefix("ir:") {
        (FC_READ_INPUT, rest)
    } else {
        (FC_READ_HOLDING, addr)
    };
    let address = number.parse::<u16>().map_err(|_| {
        AdapterError::protocol(format!("bad modbus address '{addr}'"))
    })?;
    Ok(ParsedAddress { function, address })
}

struct ModbusSession {
    stream: TcpStream,
    unit_id: u8,
    txn_id: u16,
}

impl ModbusSession {
    async fn request(
        &mut self,
        function: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, AdapterError> {
        self.txn_id = self.txn_id.wrapping_add(1);
        let frame = codec::encode_read(self.txn_id, self.unit_id, function, address, count);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| AdapterError::Connect(format!("write: {e}")))?;

        let response = tokio::time::timeout(READ_TIMEOUT, self.read_frame())
            .await
            .map_err(|_| AdapterError::Transient("modbus read timeout".into()))??;
        let (txn_id, pdu) = response;
        if txn_id != self.txn_id {
            return Err(AdapterError::protocol(format!(
                "transaction id mismatch: sent {} got {txn_id}",
                self.txn_id
            )));
        }
        codec::parse_read_pdu(function, &pdu)
    }

    async fn read_frame(&mut self) -> Result<(u16, Vec<u8>), AdapterError> {
        let mut header = [0u8; 7];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| AdapterError::Connect(format!("read header: {e}")))?;
        let txn_id = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 || length > 256 {
            return Err(AdapterError::protocol(format!(
                "implausible modbus frame length {length}"
            )));
        }
        // length counts the unit byte already consumed with the header
        let mut pdu = vec![0u8; length - 1];
        self.stream
            .read_exact(&mut pdu)
            .await
            .map_err(|e| AdapterError::Connect(format!("read body: {e}")))?;
        Ok((txn_id, pdu))
    }
}

#[async_trait]
impl ProtocolSession for ModbusSession {
    async fn probe(&mut self, point: &DataPoint) -> Result<(), AdapterError> {
        let parsed = parse_point_address(point)?;
        let dtype = DataType::of(point)?;
        self.request(parsed.function, parsed.address, dtype.register_count())
            .await
            .map(|_| ())
    }

    async fn read(&mut self, point: &DataPoint) -> Result<f64, AdapterError> {
        let parsed = parse_point_address(point)?;
        let dtype = DataType::of(point)?;
        let registers = self
            .request(parsed.function, parsed.address, dtype.register_count())
            .await?;
        dtype.decode(&registers)
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn point(address: &str, data_type: Option<&str>) -> DataPoint {
        serde_json::from_value(serde_json::json!({
            "name": "p",
            "address": address,
            "data_type": data_type,
        }))
        .unwrap()
    }

    fn config(port: u16) -> SensorConfig {
        serde_json::from_value(serde_json::json!({
            "config_id": "c1",
            "name": "plc",
            "protocol": "modbus",
            "connection": {"host": "127.0.0.1", "port": port, "unit_id": 1},
        }))
        .unwrap()
    }

    /// Minimal register-file server: answers fc 3/4 reads from `registers`,
    /// exception 2 for out-of-range addresses.
    async fn spawn_server(registers: Vec<u16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let registers = registers.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; 12];
                    while sock.read_exact(&mut request).await.is_ok() {
                        let txn = &request[0..2];
                        let unit = request[6];
                        let function = request[7];
                        let address =
                            u16::from_be_bytes([request[8], request[9]]) as usize;
                        let count =
                            u16::from_be_bytes([request[10], request[11]]) as usize;

                        let mut response = Vec::new();
                        response.extend_from_slice(txn);
                        response.extend_from_slice(&[0, 0]);
                        if address + count <= registers.len() {
                            let byte_count = (count * 2) as u8;
                            response
                                .extend_from_slice(&((3 + byte_count as u16).to_be_bytes()));
                            response.push(unit);
                            response.push(function);
                            response.push(byte_count);
                            for reg in &registers[address..address + count] {
                                response.extend_from_slice(&reg.to_be_bytes());
                            }
                        } else {
                            response.extend_from_slice(&3u16.to_be_bytes());
                            response.push(unit);
                            response.push(function | 0x80);
                            response.push(2); // illegal data address
                        }
                        if sock.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn reads_holding_registers() {
        let port = spawn_server(vec![0, 0, 0, 0, 0, 1234]).await;
        let adapter = ModbusAdapter::new();
        let mut session = adapter.connect(&config(port)).await.unwrap();
        let value = session.read(&point("hr:5", None)).await.unwrap();
        assert_eq!(value, 1234.0);
    }

    #[tokio::test]
    async fn decodes_f32_across_two_registers() {
        let bits = 21.5f32.to_bits();
        let port = spawn_server(vec![(bits >> 16) as u16, (bits & 0xffff) as u16]).await;
        let adapter = ModbusAdapter::new();
        let mut session = adapter.connect(&config(port)).await.unwrap();
        let value = session.read(&point("hr:0", Some("f32"))).await.unwrap();
        assert!((value - 21.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn decodes_signed_values() {
        let port = spawn_server(vec![(-5i16) as u16]).await;
        let adapter = ModbusAdapter::new();
        let mut session = adapter.connect(&config(port)).await.unwrap();
        let value = session.read(&point("hr:0", Some("i16"))).await.unwrap();
        assert_eq!(value, -5.0);
    }

    #[tokio::test]
    async fn probe_of_out_of_range_address_fails_with_exception() {
        let port = spawn_server(vec![0; 4]).await;
        let adapter = ModbusAdapter::new();
        let mut session = adapter.connect(&config(port)).await.unwrap();
        assert!(session.probe(&point("hr:0", None)).await.is_ok());
        match session.probe(&point("hr:100", None)).await {
            Err(AdapterError::Protocol { code, .. }) => assert_eq!(code, Some(2)),
            other => panic!("expected modbus exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_refused_is_a_connect_error() {
        let adapter = ModbusAdapter::new();
        // bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(matches!(
            adapter.connect(&config(port)).await,
            Err(AdapterError::Connect(_))
        ));
    }
}
