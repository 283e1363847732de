/// Telemetry node core library.
///
/// Two independent pipelines feed the node's outbound sender:
/// * *Navigation*: raw receiver bytes are framed and validated by [`protocol::ubx::UbxDecoder`],
///   and the latest PVT solution is kept in [`nav::FixStore`].
/// * *Barometer*: [`baro::pipeline::BaroPipeline`] alternates pressure and temperature
///   conversions on the sensor bus, compensates and filters them against a zero reference.
///
/// Both produce values implementing [`protocol::TelemMsg`]; encoding and transport are the
/// consumer's responsibility.
use std::sync::Once;

use thiserror::Error;

pub mod baro;
pub mod clock;
pub mod nav;
pub mod protocol;

pub use baro::BusError;

/// Result type for this library
pub type TNResult<T> = std::result::Result<T, Error>;

/// Error type for this library
#[derive(Debug, Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Sensor bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Payload of {0} bytes exceeds frame capacity")]
    PayloadTooLarge(usize),
    #[error("Acquisition pipeline stepped before begin()")]
    NotStarted,
}

impl From<nom::error::Error<&[u8]>> for Error {
    fn from(err: nom::error::Error<&[u8]>) -> Self {
        Error::ParseError(format!("{:?}", err))
    }
}

/// Test binary helper to init tracing. This is usually the responsibility of the consumer of the
/// library crate.
pub fn lazy_init_tracing() {
    {
        static INIT: Once = Once::new();
        &INIT
    }
    .call_once(|| {
        tracing_subscriber::fmt::init();
    });
}
