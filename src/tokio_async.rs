//! Asynchronous `tokio-modbus` client for the inverter register window.
//!
//! The monitor issues exactly one kind of request: "read the fixed inverter
//! window". [`SunSpecInverter::read_inverter_window`] performs that read and
//! returns a validated [`proto::RegisterWindow`] snapshot.
//!
//! Callers are expected to wrap the future in `tokio::time::timeout`; the
//! poll session treats a timeout as a failed read, not a transport fault.

use crate::protocol as proto;
use tokio_modbus::prelude::Reader;

/// Errors that can occur while reading from the device.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// Wraps `tokio_modbus::ExceptionCode`.
    #[error(transparent)]
    Exception(#[from] tokio_modbus::ExceptionCode),

    /// Wraps `tokio_modbus::Error`.
    #[error(transparent)]
    Modbus(#[from] tokio_modbus::Error),
}

impl Error {
    /// True for faults of the underlying connection. The poll session
    /// reconnects on these; everything else is a single-read failure.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Error::Modbus(tokio_modbus::Error::Transport(_)))
    }
}

/// The result type for device reads.
pub type Result<T> = std::result::Result<T, Error>;

/// Stateless read operations against a `tokio-modbus` context.
#[derive(Debug)]
pub struct SunSpecInverter;

impl SunSpecInverter {
    /// Helper function to map the nested tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()), // Modbus exception
            Err(err) => Err(err.into()),     // IO error
        }
    }

    /// Reads the full inverter window in one request and validates its size.
    pub async fn read_inverter_window(
        ctx: &mut tokio_modbus::client::Context,
    ) -> Result<proto::RegisterWindow> {
        let registers = Self::map_tokio_result(
            ctx.read_holding_registers(
                proto::INVERTER_WINDOW_START,
                proto::INVERTER_WINDOW_QUANTITY,
            )
            .await,
        )?;
        Ok(proto::RegisterWindow::inverter(registers)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn transport_faults_are_classified() {
        let transport: Error = tokio_modbus::Error::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer closed",
        ))
        .into();
        assert!(transport.is_transport_fault());

        let exception: Error = tokio_modbus::ExceptionCode::IllegalDataAddress.into();
        assert!(!exception.is_transport_fault());

        let protocol: Error = proto::Error::WindowSizeMismatch {
            expected: proto::INVERTER_WINDOW_QUANTITY,
            actual: 0,
        }
        .into();
        assert!(!protocol.is_transport_fault());
    }

    #[test]
    fn short_reads_surface_as_protocol_errors() {
        let result: Result<proto::RegisterWindow> =
            proto::RegisterWindow::inverter(vec![0; 5]).map_err(Into::into);
        assert_matches!(
            result,
            Err(Error::Protocol(proto::Error::WindowSizeMismatch { actual: 5, .. }))
        );
    }
}
