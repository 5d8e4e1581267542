//! Typed fieldbus adapter: logical sensor/actuator/status cells over the raw
//! S7 transport.
//!
//! The memory map below is bit-exact convention with the deployed PLC
//! program: five MD float registers for sensors, Q0.x outputs for the eight
//! actuators, and Siemens STRING fields at offset 0 of DB1..DB8 for status
//! text. Control logic never sees raw addresses, only this module's API.

use tracing::warn;

use crate::equipment::OutputBit;
use crate::error::FieldbusError;
use crate::s7::{Area, S7Transport};

/// Sensor float registers in the M area (byte offsets, 4 bytes each,
/// big-endian IEEE-754 singles).
pub const MD_LIGHT: u32 = 0;
pub const MD_CO2: u32 = 2;
pub const MD_SOIL_MOISTURE: u32 = 4;
pub const MD_AIR_HUMIDITY: u32 = 6;
pub const MD_TEMPERATURE: u32 = 8;

/// A fixed-width Siemens STRING field at offset 0 of a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextBlock {
    pub db_number: u16,
    pub capacity: usize,
}

/// Analysis text spans three blocks: 100 + 100 + 50 characters.
pub const ANALYSIS_BLOCKS: [TextBlock; 3] = [
    TextBlock { db_number: 1, capacity: 100 },
    TextBlock { db_number: 2, capacity: 100 },
    TextBlock { db_number: 3, capacity: 50 },
];

/// Up to five warnings, 100 characters each.
pub const WARNING_BLOCKS: [TextBlock; 5] = [
    TextBlock { db_number: 4, capacity: 100 },
    TextBlock { db_number: 5, capacity: 100 },
    TextBlock { db_number: 6, capacity: 100 },
    TextBlock { db_number: 7, capacity: 100 },
    TextBlock { db_number: 8, capacity: 100 },
];

/// Typed fieldbus contract the orchestrator is written against.
#[allow(async_fn_in_trait)]
pub trait Fieldbus {
    async fn read_float(&mut self, md_address: u32) -> Result<f32, FieldbusError>;
    async fn write_bit(&mut self, output: OutputBit, value: bool) -> Result<(), FieldbusError>;
    /// Truncates to the block's fixed width; never fails on oversized input.
    async fn write_text(&mut self, block: TextBlock, text: &str) -> Result<(), FieldbusError>;
}

/// Production adapter. On any I/O error the connection is dropped and the
/// next operation attempts a single reconnect before failing; retry cadence
/// across cycles belongs to the orchestrator.
pub struct PlcConnection<T: S7Transport> {
    transport: T,
}

impl<T: S7Transport> PlcConnection<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Initial connect; a failure here is fatal at startup.
    pub async fn connect(&mut self) -> Result<(), FieldbusError> {
        self.transport.connect().await
    }

    async fn read_area(
        &mut self,
        area: Area,
        db: u16,
        start: u32,
        len: u16,
    ) -> Result<Vec<u8>, FieldbusError> {
        if self.transport.is_connected() {
            match self.transport.read_area(area, db, start, len).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(error = %e, "fieldbus read failed, attempting reconnect");
                    self.transport.disconnect();
                }
            }
        }
        self.transport.connect().await?;
        self.transport.read_area(area, db, start, len).await
    }

    async fn write_area(
        &mut self,
        area: Area,
        db: u16,
        start: u32,
        data: &[u8],
    ) -> Result<(), FieldbusError> {
        if self.transport.is_connected() {
            match self.transport.write_area(area, db, start, data).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "fieldbus write failed, attempting reconnect");
                    self.transport.disconnect();
                }
            }
        }
        self.transport.connect().await?;
        self.transport.write_area(area, db, start, data).await
    }
}

impl<T: S7Transport> Fieldbus for PlcConnection<T> {
    async fn read_float(&mut self, md_address: u32) -> Result<f32, FieldbusError> {
        let bytes = self.read_area(Area::Merker, 0, md_address, 4).await?;
        Ok(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn write_bit(&mut self, output: OutputBit, value: bool) -> Result<(), FieldbusError> {
        // Read-modify-write of the containing process-image byte.
        let current = self
            .read_area(Area::ProcessOutputs, 0, output.byte as u32, 1)
            .await?;
        let mask = 1u8 << output.bit;
        let updated = if value {
            current[0] | mask
        } else {
            current[0] & !mask
        };
        self.write_area(Area::ProcessOutputs, 0, output.byte as u32, &[updated])
            .await
    }

    async fn write_text(&mut self, block: TextBlock, text: &str) -> Result<(), FieldbusError> {
        // Siemens STRING: [max_len][actual_len][bytes...]. Non-ASCII input
        // is expected to be transliterated by the caller; anything left over
        // is dropped rather than mangled.
        let ascii: Vec<u8> = text
            .chars()
            .filter(char::is_ascii)
            .map(|c| c as u8)
            .take(block.capacity)
            .collect();
        let mut buffer = vec![0u8; block.capacity + 2];
        buffer[0] = block.capacity as u8;
        buffer[1] = ascii.len() as u8;
        buffer[2..2 + ascii.len()].copy_from_slice(&ascii);
        self.write_area(Area::DataBlock, block.db_number, 0, &buffer)
            .await
    }
}
