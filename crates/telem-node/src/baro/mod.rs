/// Barometric altimeter: MS56xx command set, the bus seam the acquisition pipeline talks
/// through, and an adapter for embedded-hal I2C drivers.
use thiserror::Error;
use tracing::trace;

pub mod compensate;
pub mod filter;
pub mod pipeline;

/// 7-bit I2C address of the sensor (CSB pin low).
pub const SENSOR_ADDR: u8 = 0x77;

pub const CMD_RESET: u8 = 0x1E;
pub const CMD_ADC_READ: u8 = 0x00;
/// Start D1 (pressure) conversion, OSR 4096. About 9 ms to settle.
pub const CMD_CONVERT_PRESSURE: u8 = 0x48;
/// Start D2 (temperature) conversion, OSR 4096.
pub const CMD_CONVERT_TEMPERATURE: u8 = 0x58;
pub const CMD_PROM_READ: u8 = 0xA0;

/// PROM read command for coefficient `index` (1 through 6). Word 0 holds factory data and
/// word 7 the CRC; neither is used.
pub fn prom_read_command(index: u8) -> u8 {
    CMD_PROM_READ | (index << 1)
}

pub const PROM_WORD_LEN: usize = 2;
pub const ADC_RESULT_LEN: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
}

/// Addressed command/response bus the sensor sits on.
pub trait SensorBus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError>;

    /// Read into `buf`, returning the number of bytes actually received.
    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<usize, BusError>;

    fn command(&mut self, address: u8, command: u8) -> Result<(), BusError> {
        trace!(address, command, "bus command");
        self.write(address, &[command])
    }

    /// Read exactly `N` bytes; anything less is an error, never data.
    fn read_exact<const N: usize>(&mut self, address: u8) -> Result<[u8; N], BusError> {
        let mut buf = [0u8; N];
        let got = self.read(address, &mut buf)?;
        if got != N {
            return Err(BusError::ShortRead { expected: N, got });
        }
        Ok(buf)
    }
}

/// [`SensorBus`] over any blocking embedded-hal I2C driver.
pub struct I2cBus<I> {
    i2c: I,
}

impl<I> I2cBus<I>
where
    I: embedded_hal::i2c::I2c,
{
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn release(self) -> I {
        self.i2c
    }
}

impl<I> SensorBus for I2cBus<I>
where
    I: embedded_hal::i2c::I2c,
{
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.i2c.write(address, bytes).map_err(hal_error)
    }

    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<usize, BusError> {
        self.i2c.read(address, buf).map_err(hal_error)?;
        Ok(buf.len())
    }
}

fn hal_error<E: embedded_hal::i2c::Error>(err: E) -> BusError {
    BusError::Transaction(format!("{:?}", err.kind()))
}
