pub mod cpc;
pub mod router;
pub mod vendor;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};

use crate::common::Version;

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("timed out waiting for a response")]
    TimedOut,
    #[error("unexpected response: {0}")]
    BadResponse(String),
    #[error("connection closed")]
    Closed,
    #[error("no application can be launched")]
    NoFirmware,
    #[error("{0} is not supported over this connection")]
    Unsupported(String),
}

/// True when `err` is a timeout that the caller may treat as "no answer".
pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ProtocolError>(),
        Some(ProtocolError::TimedOut)
    ) || err.is::<tokio::time::error::Elapsed>()
}

/// Runs `fut` with a deadline, mapping expiry to [`ProtocolError::TimedOut`].
pub async fn with_timeout<T, F>(duration: std::time::Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(res) => res,
        Err(_) => Err(ProtocolError::TimedOut.into()),
    }
}

/// Application firmware that can report its version and reboot into the bootloader.
#[async_trait]
pub trait ApplicationProtocol: Send {
    async fn probe(&mut self) -> Result<Version>;
    async fn enter_bootloader(&mut self) -> Result<()>;

    /// Releases the connection; the protocol must not be used afterwards.
    async fn close(&mut self) {}
}

/// Resident bootloader able to receive an image and launch the application.
#[async_trait]
pub trait Bootloader: Send {
    async fn probe(&mut self) -> Result<Version>;

    /// Fails with [`ProtocolError::NoFirmware`] when no application is installed.
    async fn run_firmware(&mut self) -> Result<()>;

    async fn upload_firmware(
        &mut self,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    async fn close(&mut self) {}
}

/// Byte-stream consumer fed by the reader task of a connection.
pub(crate) trait DataReceiver: Send + 'static {
    fn data_received(&mut self, data: &[u8]);
}

/// Reads from `reader` until EOF or error, handing every chunk to `receiver`.
pub(crate) fn spawn_reader<R, D>(mut reader: R, mut receiver: D) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    D: DataReceiver,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 256];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("reader: end of stream");
                    break;
                }
                Ok(n) => {
                    debug!("read {} bytes: {:02x?}", n, &buf[..n]);
                    receiver.data_received(&buf[..n]);
                }
                Err(e) => {
                    warn!("reader: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn timeout_is_classified() {
        let res: Result<()> =
            with_timeout(Duration::from_millis(5), std::future::pending()).await;
        assert!(is_timeout(&res.unwrap_err()));

        let err: anyhow::Error = ProtocolError::Closed.into();
        assert!(!is_timeout(&err));
        assert!(!is_timeout(&anyhow::anyhow!("other")));
    }

    #[tokio::test]
    async fn reader_forwards_chunks() {
        struct Collect(tokio::sync::mpsc::UnboundedSender<Vec<u8>>);

        impl DataReceiver for Collect {
            fn data_received(&mut self, data: &[u8]) {
                let _ = self.0.send(data.to_vec());
            }
        }

        let (mut tx_side, rx_side) = tokio::io::duplex(64);
        let (chunks_tx, mut chunks_rx) = tokio::sync::mpsc::unbounded_channel();
        let reader = spawn_reader(rx_side, Collect(chunks_tx));

        tokio::io::AsyncWriteExt::write_all(&mut tx_side, b"abc").await.unwrap();
        assert_eq!(chunks_rx.recv().await.unwrap(), b"abc");

        drop(tx_side);
        reader.await.unwrap();
    }
}
