//! Modbus TCP. The address grammar and the register decode live here in
//! full; the wire transport is a compact MBAP/PDU client over a TCP stream,
//! kept behind [`ModbusTransport`] so tests can script it.

use std::time::Duration;

use async_trait::async_trait;
use byteorder::{
    BigEndian,
    ByteOrder,
};
use bytes::{
    BufMut,
    BytesMut,
};
use common::{
    data_type::DataType,
    errors::ErrorMetadata,
    value::TagValue,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpStream,
};

use crate::{
    Address,
    DeviceClient,
    Reader,
    Writer,
};

/// Per-request deadline on the wire.
const REQUEST_DEADLINE: Duration = Duration::from_secs(3);

const FN_READ_COILS: u8 = 0x01;
const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
const FN_WRITE_SINGLE_COIL: u8 = 0x05;
const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Which register file an address selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterSpace {
    /// Files 0 and 1: single-bit coils and discrete inputs.
    Bit,
    /// Files 3 and 4: 16-bit registers.
    Register,
}

#[derive(Clone, Debug)]
pub struct ModbusAddress {
    pub space: RegisterSpace,
    pub offset: u16,
    /// Registers occupied; 1 for bit space.
    pub count: u16,
    pub data_type: DataType,
    /// Flips the word order of multi-register values.
    pub reversed: bool,
}

impl ModbusAddress {
    /// Parses a numeric tag address. The first digit selects the register
    /// file; the rest is the zero-based offset within it. The data type
    /// must agree with the file: `BOOLEAN` lives in bit space, everything
    /// else in register space.
    pub fn parse(address: &str, data_type: DataType, reversed: bool) -> anyhow::Result<Self> {
        let address = address.trim();
        let bad = |msg: String| ErrorMetadata::bad_argument("BadModbusAddress", msg);
        let mut chars = address.chars();
        let file = chars
            .next()
            .ok_or_else(|| bad("Empty Modbus address".to_owned()))?;
        let rest = chars.as_str();
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
            anyhow::bail!(bad(format!("Malformed Modbus address {address:?}")));
        }
        let space = match file {
            '0' | '1' => RegisterSpace::Bit,
            '3' | '4' => RegisterSpace::Register,
            _ => anyhow::bail!(bad(format!(
                "Modbus address {address:?} selects unknown register file {file}"
            ))),
        };
        match (space, data_type) {
            (RegisterSpace::Bit, DataType::Boolean) => {},
            (RegisterSpace::Register, DataType::Boolean) => anyhow::bail!(bad(format!(
                "BOOLEAN tag {address:?} must address a bit file (0/1)"
            ))),
            (RegisterSpace::Bit, _) => anyhow::bail!(bad(format!(
                "{data_type} tag {address:?} must address a register file (3/4)"
            ))),
            (RegisterSpace::Register, _) => {},
        }
        let offset: u16 = rest
            .parse()
            .map_err(|_| bad(format!("Modbus offset out of range in {address:?}")))?;
        let count = match space {
            RegisterSpace::Bit => 1,
            RegisterSpace::Register => data_type.register_count(),
        };
        anyhow::ensure!(
            offset as u32 + count as u32 <= 0x1_0000,
            bad(format!("Modbus tag {address:?} overruns the register file"))
        );
        Ok(Self {
            space,
            offset,
            count,
            data_type,
            reversed,
        })
    }

    /// Decodes the registers read for this tag.
    pub fn decode(&self, words: &[u16]) -> anyhow::Result<TagValue> {
        anyhow::ensure!(
            words.len() == self.count as usize,
            ErrorMetadata::decode_error(
                "ShortRead",
                format!("Expected {} registers, got {}", self.count, words.len()),
            )
        );
        let value = match self.data_type {
            DataType::Boolean => TagValue::Bool(words[0] != 0),
            DataType::Integer => TagValue::Int(words[0] as i16 as i64),
            DataType::Byte => TagValue::Int((words[0] & 0xFF) as i64),
            DataType::Word => TagValue::Int(words[0] as i64),
            DataType::DoubleInteger => TagValue::Int(self.combine(words) as i32 as i64),
            DataType::DoubleWord => TagValue::Int(self.combine(words) as i64),
            DataType::Float | DataType::Real => {
                TagValue::Float(f32::from_bits(self.combine(words)) as f64)
            },
            DataType::Text { .. } => {
                let mut bytes = Vec::with_capacity(words.len() * 2);
                for word in words {
                    bytes.push((word >> 8) as u8);
                    bytes.push((word & 0xFF) as u8);
                }
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                TagValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
            },
        };
        Ok(value)
    }

    /// Encodes a writer's value into registers, the inverse of
    /// [`ModbusAddress::decode`]. Bit-space tags encode separately.
    pub fn encode(&self, value: &TagValue) -> anyhow::Result<Vec<u16>> {
        let mismatch = || {
            ErrorMetadata::decode_error(
                "TypeMismatch",
                format!("Cannot encode {value:?} as {}", self.data_type),
            )
        };
        let words = match (self.data_type, value) {
            (DataType::Integer, TagValue::Int(i)) => vec![*i as i16 as u16],
            (DataType::Byte, TagValue::Int(i)) => vec![(*i as u16) & 0xFF],
            (DataType::Word, TagValue::Int(i)) => vec![*i as u16],
            (DataType::DoubleInteger, TagValue::Int(i)) => self.split(*i as i32 as u32),
            (DataType::DoubleWord, TagValue::Int(i)) => self.split(*i as u32),
            (DataType::Float | DataType::Real, TagValue::Float(x)) => {
                self.split((*x as f32).to_bits())
            },
            (DataType::Text { .. }, TagValue::Text(s)) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.resize(self.count as usize * 2, 0);
                bytes
                    .chunks(2)
                    .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
                    .collect()
            },
            _ => anyhow::bail!(mismatch()),
        };
        Ok(words)
    }

    fn combine(&self, words: &[u16]) -> u32 {
        let (high, low) = if self.reversed {
            (words[1], words[0])
        } else {
            (words[0], words[1])
        };
        ((high as u32) << 16) | low as u32
    }

    fn split(&self, value: u32) -> Vec<u16> {
        let high = (value >> 16) as u16;
        let low = (value & 0xFFFF) as u16;
        if self.reversed {
            vec![low, high]
        } else {
            vec![high, low]
        }
    }
}

/// PDU-level transport capability.
#[async_trait]
pub trait ModbusTransport: Send + 'static {
    async fn connect(&mut self) -> anyhow::Result<()>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;

    async fn read_bits(&mut self, offset: u16, count: u16) -> anyhow::Result<Vec<bool>>;

    async fn read_registers(&mut self, offset: u16, count: u16) -> anyhow::Result<Vec<u16>>;

    async fn write_bit(&mut self, offset: u16, value: bool) -> anyhow::Result<()>;

    async fn write_registers(&mut self, offset: u16, values: &[u16]) -> anyhow::Result<()>;
}

/// MBAP framing over one TCP stream.
pub struct TcpModbusTransport {
    host: String,
    port: u16,
    unit_id: u8,
    transaction_id: u16,
    stream: Option<TcpStream>,
}

impl TcpModbusTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id: 1,
            transaction_id: 0,
            stream: None,
        }
    }

    async fn exchange(&mut self, pdu: &[u8]) -> anyhow::Result<Vec<u8>> {
        let result = tokio::time::timeout(REQUEST_DEADLINE, self.exchange_inner(pdu)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => {
                anyhow::bail!(ErrorMetadata::device_read_error(
                    "ModbusTimeout",
                    format!("No response from {}:{}", self.host, self.port),
                ))
            },
        }
    }

    async fn exchange_inner(&mut self, pdu: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let transaction_id = self.transaction_id;
        let unit_id = self.unit_id;
        let stream = self.stream.as_mut().ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::device_unreachable(
                "NotConnected",
                "Modbus transport is not connected",
            ))
        })?;

        let mut frame = BytesMut::with_capacity(7 + pdu.len());
        frame.put_u16(transaction_id);
        frame.put_u16(0); // protocol id
        frame.put_u16(pdu.len() as u16 + 1);
        frame.put_u8(unit_id);
        frame.put_slice(pdu);
        stream.write_all(&frame).await?;

        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await?;
        let reply_transaction = BigEndian::read_u16(&header[0..2]);
        anyhow::ensure!(
            reply_transaction == transaction_id,
            ErrorMetadata::device_read_error(
                "ModbusTransactionMismatch",
                format!("Expected transaction {transaction_id}, got {reply_transaction}"),
            )
        );
        let length = BigEndian::read_u16(&header[4..6]) as usize;
        anyhow::ensure!(
            length >= 2,
            ErrorMetadata::device_read_error("ModbusShortReply", "Reply shorter than a PDU")
        );
        let mut reply = vec![0u8; length - 1];
        stream.read_exact(&mut reply).await?;

        // Exception replies echo the function code with the top bit set.
        if reply[0] == pdu[0] | 0x80 {
            let code = reply.get(1).copied().unwrap_or(0);
            anyhow::bail!(ErrorMetadata::device_read_error(
                "ModbusException",
                format!("Device replied with exception {code:#04x}"),
            ));
        }
        anyhow::ensure!(
            reply[0] == pdu[0],
            ErrorMetadata::device_read_error(
                "ModbusFunctionMismatch",
                format!("Expected function {:#04x}, got {:#04x}", pdu[0], reply[0]),
            )
        );
        Ok(reply)
    }
}

#[async_trait]
impl ModbusTransport for TcpModbusTransport {
    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(REQUEST_DEADLINE, connect)
            .await
            .map_err(|_| {
                anyhow::anyhow!(ErrorMetadata::device_unreachable(
                    "ConnectTimeout",
                    format!("Connect to {}:{} timed out", self.host, self.port),
                ))
            })?
            .map_err(|e| {
                anyhow::Error::from(e).context(ErrorMetadata::device_unreachable(
                    "ConnectFailed",
                    format!("Connect to {}:{} failed", self.host, self.port),
                ))
            })?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn read_bits(&mut self, offset: u16, count: u16) -> anyhow::Result<Vec<bool>> {
        let mut pdu = vec![FN_READ_COILS];
        pdu.extend_from_slice(&offset.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let reply = self.exchange(&pdu).await?;
        let payload = reply.get(2..).unwrap_or_default();
        let mut bits = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let byte = payload.get(i / 8).copied().unwrap_or(0);
            bits.push(byte & (1 << (i % 8)) != 0);
        }
        Ok(bits)
    }

    async fn read_registers(&mut self, offset: u16, count: u16) -> anyhow::Result<Vec<u16>> {
        let mut pdu = vec![FN_READ_HOLDING_REGISTERS];
        pdu.extend_from_slice(&offset.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let reply = self.exchange(&pdu).await?;
        let payload = reply.get(2..).unwrap_or_default();
        anyhow::ensure!(
            payload.len() >= count as usize * 2,
            ErrorMetadata::device_read_error(
                "ModbusShortReply",
                format!("Expected {} registers", count),
            )
        );
        Ok((0..count as usize)
            .map(|i| BigEndian::read_u16(&payload[i * 2..i * 2 + 2]))
            .collect())
    }

    async fn write_bit(&mut self, offset: u16, value: bool) -> anyhow::Result<()> {
        let mut pdu = vec![FN_WRITE_SINGLE_COIL];
        pdu.extend_from_slice(&offset.to_be_bytes());
        pdu.extend_from_slice(&if value { [0xFF, 0x00] } else { [0x00, 0x00] });
        self.exchange(&pdu).await?;
        Ok(())
    }

    async fn write_registers(&mut self, offset: u16, values: &[u16]) -> anyhow::Result<()> {
        let mut pdu = vec![FN_WRITE_MULTIPLE_REGISTERS];
        pdu.extend_from_slice(&offset.to_be_bytes());
        pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
        pdu.push(values.len() as u8 * 2);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        self.exchange(&pdu).await?;
        Ok(())
    }
}

/// The Modbus device client: walks readers/writers and maps their typed
/// addresses onto transport operations.
pub struct ModbusClient {
    transport: Box<dyn ModbusTransport>,
    initialized: bool,
}

impl ModbusClient {
    pub fn new(transport: Box<dyn ModbusTransport>) -> Self {
        Self {
            transport,
            initialized: false,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Box::new(TcpModbusTransport::new(host, port)))
    }
}

fn modbus_address<'a>(address: &'a Address, name: &str) -> anyhow::Result<&'a ModbusAddress> {
    match address {
        Address::Modbus(a) => Ok(a),
        other => anyhow::bail!(ErrorMetadata::bad_argument(
            "AddressKindMismatch",
            format!("Tag {name:?} has non-Modbus address {other:?}"),
        )),
    }
}

#[async_trait]
impl DeviceClient for ModbusClient {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        self.transport.connect().await
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.transport.disconnect().await
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn read(&mut self, readers: &mut [Reader]) -> anyhow::Result<()> {
        for reader in readers {
            let address = modbus_address(&reader.address, reader.variable.name())?;
            let value = match address.space {
                RegisterSpace::Bit => {
                    let bits = self.transport.read_bits(address.offset, 1).await?;
                    TagValue::Bool(bits.first().copied().unwrap_or(false))
                },
                RegisterSpace::Register => {
                    let words = self
                        .transport
                        .read_registers(address.offset, address.count)
                        .await?;
                    match address.decode(&words) {
                        Ok(value) => value,
                        Err(e) => {
                            // A per-tag decode failure leaves the previous
                            // value in place; the row still goes out.
                            tracing::warn!(
                                "Decode failed for {}: {e:#}",
                                reader.variable.name()
                            );
                            continue;
                        },
                    }
                },
            };
            reader.variable.set_value(value);
        }
        Ok(())
    }

    async fn write(&mut self, writers: &mut [Writer]) -> anyhow::Result<()> {
        for writer in writers {
            let address = modbus_address(&writer.address, writer.variable.name())?;
            let Some(value) = writer.variable.value().cloned() else {
                continue;
            };
            match address.space {
                RegisterSpace::Bit => {
                    let bit = matches!(value, TagValue::Bool(true));
                    self.transport.write_bit(address.offset, bit).await?;
                },
                RegisterSpace::Register => {
                    let words = address.encode(&value)?;
                    self.transport
                        .write_registers(address.offset, &words)
                        .await?;
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_grammar() {
        let a = ModbusAddress::parse("40013", DataType::Integer, false).unwrap();
        assert_eq!(a.space, RegisterSpace::Register);
        assert_eq!(a.offset, 13);
        assert_eq!(a.count, 1);

        let b = ModbusAddress::parse("00007", DataType::Boolean, false).unwrap();
        assert_eq!(b.space, RegisterSpace::Bit);
        assert_eq!(b.offset, 7);

        let t = ModbusAddress::parse("30100", DataType::Text { size: None }, false).unwrap();
        assert_eq!(t.count, 127);
    }

    #[test]
    fn test_address_type_agreement() {
        assert!(ModbusAddress::parse("40001", DataType::Boolean, false).is_err());
        assert!(ModbusAddress::parse("00001", DataType::Integer, false).is_err());
        assert!(ModbusAddress::parse("20001", DataType::Integer, false).is_err());
        assert!(ModbusAddress::parse("4", DataType::Integer, false).is_err());
        assert!(ModbusAddress::parse("4xyz", DataType::Integer, false).is_err());
        // TEXT(200) at the top of the file overruns it.
        assert!(ModbusAddress::parse(
            "465500",
            DataType::Text { size: Some(200) },
            false
        )
        .is_err());
    }

    #[test]
    fn test_decode_word_order() {
        let normal = ModbusAddress::parse("40001", DataType::DoubleInteger, false).unwrap();
        let reversed = ModbusAddress::parse("40001", DataType::DoubleInteger, true).unwrap();
        // 0x0001_0002
        assert_eq!(normal.decode(&[0x0001, 0x0002]).unwrap(), TagValue::Int(65538));
        assert_eq!(
            reversed.decode(&[0x0002, 0x0001]).unwrap(),
            TagValue::Int(65538)
        );
    }

    #[test]
    fn test_decode_types() {
        let int = ModbusAddress::parse("40001", DataType::Integer, false).unwrap();
        assert_eq!(int.decode(&[0xFFFF]).unwrap(), TagValue::Int(-1));

        let word = ModbusAddress::parse("40001", DataType::Word, false).unwrap();
        assert_eq!(word.decode(&[0xFFFF]).unwrap(), TagValue::Int(65535));

        let byte = ModbusAddress::parse("40001", DataType::Byte, false).unwrap();
        assert_eq!(byte.decode(&[0x1234]).unwrap(), TagValue::Int(0x34));

        let real = ModbusAddress::parse("40001", DataType::Real, false).unwrap();
        let bits = 1.5f32.to_bits();
        assert_eq!(
            real.decode(&[(bits >> 16) as u16, (bits & 0xFFFF) as u16])
                .unwrap(),
            TagValue::Float(1.5)
        );

        let text = ModbusAddress::parse("40001", DataType::Text { size: Some(3) }, false)
            .unwrap();
        assert_eq!(
            text.decode(&[0x6869, 0x2100, 0x0000]).unwrap(),
            TagValue::Text("hi!".to_owned())
        );
    }

    #[test]
    fn test_encode_round_trip() {
        for (data_type, value) in [
            (DataType::Integer, TagValue::Int(-123)),
            (DataType::Word, TagValue::Int(40000)),
            (DataType::DoubleInteger, TagValue::Int(-70000)),
            (DataType::DoubleWord, TagValue::Int(70000)),
            (DataType::Real, TagValue::Float(2.25)),
        ] {
            for reversed in [false, true] {
                let address = ModbusAddress::parse("40001", data_type, reversed).unwrap();
                let words = address.encode(&value).unwrap();
                assert_eq!(address.decode(&words).unwrap(), value, "{data_type:?}");
            }
        }
    }
}
