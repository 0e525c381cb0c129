mod frame;
mod types;

use std::{convert::TryInto, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};

pub use frame::{
    CommandPayload, CpcFrameDecoder, CpcTransportFrame, FrameError, PropertyCommand,
    UnnumberedFrame, CONTROL_UNNUMBERED_POLL_FINAL, FLAG, HEADER_SIZE,
};
pub use types::{EndpointId, PropertyId, RebootMode, UnnumberedFrameCommandId};

use super::{spawn_reader, with_timeout, ApplicationProtocol, DataReceiver, ProtocolError};
use crate::common::{Version, PROBE_TIMEOUT};

struct FrameForwarder {
    decoder: CpcFrameDecoder,
    frames: mpsc::UnboundedSender<CpcTransportFrame>,
}

impl DataReceiver for FrameForwarder {
    fn data_received(&mut self, data: &[u8]) {
        for frame in self.decoder.feed(data) {
            debug!("frame received: {:?}", frame);
            if self.frames.send(frame).is_err() {
                debug!("frame dropped, no receiver");
            }
        }
    }
}

/// CPC secondary reachable over a byte stream.
pub struct CpcProtocol<T> {
    writer: WriteHalf<T>,
    frames: mpsc::UnboundedReceiver<CpcTransportFrame>,
    reader: JoinHandle<()>,
    command_seq: u8,
    timeout: Duration,
}

impl<T> CpcProtocol<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = FrameForwarder {
            decoder: CpcFrameDecoder::new(),
            frames: tx,
        };

        Self {
            writer,
            frames: rx,
            reader: spawn_reader(reader, forwarder),
            command_seq: 0,
            timeout: PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn send_frame(&mut self, frame: &CpcTransportFrame) -> Result<()> {
        let data = frame.serialize()?;
        debug!("cpc write: {:02X?}", data);
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends an unnumbered system command and returns the sequence number used.
    pub async fn send_unnumbered_frame(
        &mut self,
        command_id: UnnumberedFrameCommandId,
        payload: CommandPayload,
    ) -> Result<u8> {
        let command_seq = self.command_seq;
        self.command_seq = self.command_seq.wrapping_add(1);

        let frame = CpcTransportFrame {
            endpoint: EndpointId::System,
            control: CONTROL_UNNUMBERED_POLL_FINAL,
            payload: UnnumberedFrame {
                command_id,
                command_seq,
                payload,
            },
        };

        self.send_frame(&frame).await?;
        Ok(command_seq)
    }

    async fn wait_for_property_is(&mut self, command_seq: u8) -> Result<PropertyCommand> {
        loop {
            let frame = self.frames.recv().await.ok_or(ProtocolError::Closed)?;
            let unnumbered = frame.payload;

            if unnumbered.command_id != UnnumberedFrameCommandId::PropValueIs
                || unnumbered.command_seq != command_seq
            {
                debug!("ignoring unrelated frame {:?}", unnumbered);
                continue;
            }

            if let CommandPayload::Property(prop) = unnumbered.payload {
                return Ok(prop);
            }
        }
    }

    async fn property_exchange(
        &mut self,
        command_id: UnnumberedFrameCommandId,
        property_id: PropertyId,
        value: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let command_seq = self
            .send_unnumbered_frame(
                command_id,
                CommandPayload::Property(PropertyCommand { property_id, value }),
            )
            .await?;

        let reply = self.wait_for_property_is(command_seq).await?;
        match reply.property_id {
            id if id == property_id => Ok(reply.value),
            PropertyId::LastStatus => Err(ProtocolError::BadResponse(format!(
                "{:?} failed with status {:02x?}",
                property_id, reply.value
            ))
            .into()),
            other => Err(ProtocolError::BadResponse(format!(
                "expected {:?}, got {:?}",
                property_id, other
            ))
            .into()),
        }
    }

    pub async fn get_property(&mut self, property_id: PropertyId) -> Result<Vec<u8>> {
        self.property_exchange(UnnumberedFrameCommandId::PropValueGet, property_id, vec![])
            .await
    }

    pub async fn set_property(&mut self, property_id: PropertyId, value: Vec<u8>) -> Result<Vec<u8>> {
        self.property_exchange(UnnumberedFrameCommandId::PropValueSet, property_id, value)
            .await
    }

    pub async fn probe(&mut self) -> Result<Version> {
        let timeout = self.timeout;
        with_timeout(timeout, async {
            let value = self.get_property(PropertyId::SecondaryCpcVersion).await?;
            parse_cpc_version(&value)
        })
        .await
    }

    pub async fn enter_bootloader(&mut self) -> Result<()> {
        let timeout = self.timeout;
        with_timeout(timeout, async {
            let mode = u32::from(RebootMode::Bootloader).to_le_bytes().to_vec();
            let ack = self
                .set_property(PropertyId::BootloaderRebootMode, mode.clone())
                .await?;
            if ack != mode {
                warn!("unexpected reboot mode acknowledgement {:02x?}", ack);
            }

            // The secondary reboots right away and never answers the reset.
            self.send_unnumbered_frame(UnnumberedFrameCommandId::Reset, CommandPayload::Raw(vec![]))
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn close(&mut self) {
        self.reader.abort();
        let _ = (&mut self.reader).await;
    }
}

impl<T> Drop for CpcProtocol<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl<T> ApplicationProtocol for CpcProtocol<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn probe(&mut self) -> Result<Version> {
        CpcProtocol::probe(self).await
    }

    async fn enter_bootloader(&mut self) -> Result<()> {
        CpcProtocol::enter_bootloader(self).await
    }

    async fn close(&mut self) {
        CpcProtocol::close(self).await
    }
}

/// Decodes the `major.minor.patch` triple of little-endian u32 values.
fn parse_cpc_version(value: &[u8]) -> Result<Version> {
    if value.len() != 12 {
        return Err(ProtocolError::BadResponse(format!("bad CPC version {:02x?}", value)).into());
    }

    let parts: Vec<u32> = value
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    Ok(format!("{}.{}.{}", parts[0], parts[1], parts[2]).parse()?)
}
