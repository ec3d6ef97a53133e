//! Serial links to the two motor controllers.
//!
//! Each controller sits on its own port at 8N1 with no flow control and
//! answers every command with one `\r`-terminated line. Tests substitute
//! `tokio::io::duplex` streams for real ports.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Byte stream a controller can be driven over.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased controller link.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Controller link shared by the commands sent to one axis.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a link for shared, line-buffered use.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open `path` at `baud_rate`, 8N1.
///
/// Opening blocks in the OS driver, so it runs on the blocking pool.
#[cfg(feature = "instrument_serial")]
pub async fn open_controller_port(
    path: &str,
    baud_rate: u32,
) -> std::io::Result<tokio_serial::SerialStream> {
    use std::io;
    use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

    let builder = tokio_serial::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None);
    let path = path.to_string();

    tokio::task::spawn_blocking(move || {
        builder
            .open_native_async()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{path}: {e}")))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Discard whatever a controller sent before this session.
///
/// Reads until the link has been quiet for `quiet`, then returns the number
/// of bytes dropped.
pub async fn discard_pending<R: AsyncRead + Unpin>(port: &mut R, quiet: Duration) -> usize {
    let mut scratch = [0u8; 64];
    let mut dropped = 0;
    loop {
        match tokio::time::timeout(quiet, port.read(&mut scratch)).await {
            Ok(Ok(n)) if n > 0 => dropped += n,
            _ => return dropped,
        }
    }
}
