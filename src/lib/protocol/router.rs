use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::debug;
use parking_lot::Mutex;
use regex::bytes::Regex;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    task::JoinHandle,
};

use super::{spawn_reader, with_timeout, ApplicationProtocol, DataReceiver, ProtocolError};
use crate::common::{StateMachine, Version, PROBE_TIMEOUT};

const PROMPT: &[u8] = b"\n>";
const BOOTLOADER_BANNER: &[u8] = b"Gecko Bootloader";
const PROMPT_SETTLE_DELAY: Duration = Duration::from_millis(500);

const CMD_INFO: &[u8] = b"version\r\n";
const CMD_BOOTLOADER_REBOOT: &[u8] = b"bootloader reboot\r\n";

lazy_static! {
    static ref INFO_RE: Regex = Regex::new(r"stack ver\. \[(?P<version>.*?)\]\r\n").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Startup,
    Bootwait,
    Info,
    Ready,
}

/// Parses router output; every transition to `Ready` needs a complete match.
pub struct RouterHandler {
    state: Arc<StateMachine<RouterState>>,
    version: Arc<Mutex<Option<String>>>,
    buffer: Vec<u8>,
}

impl RouterHandler {
    pub fn new(state: Arc<StateMachine<RouterState>>, version: Arc<Mutex<Option<String>>>) -> Self {
        Self {
            state,
            version,
            buffer: Vec::new(),
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    fn mark_ready(&mut self) {
        self.buffer.clear();
        self.state.set_state(RouterState::Ready);
    }
}

impl DataReceiver for RouterHandler {
    fn data_received(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        while !self.buffer.is_empty() {
            let state = self.state.state();
            debug!("parsing {:?}: {:?}", state, String::from_utf8_lossy(&self.buffer));

            match state {
                RouterState::Startup => {
                    if !contains(&self.buffer, PROMPT) {
                        return;
                    }
                    self.mark_ready();
                }
                RouterState::Info => {
                    let version = match INFO_RE.captures(&self.buffer) {
                        Some(cap) => String::from_utf8_lossy(&cap["version"]).into_owned(),
                        None => return,
                    };
                    debug!("detected version string {:?}", version);
                    *self.version.lock() = Some(version);
                    self.mark_ready();
                }
                RouterState::Bootwait => {
                    if !contains(&self.buffer, BOOTLOADER_BANNER) {
                        return;
                    }
                    debug!("bootloader started");
                    self.mark_ready();
                }
                RouterState::Ready => self.buffer.clear(),
            }
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Command-line router firmware driven through its text prompt.
pub struct RouterProtocol<T> {
    writer: WriteHalf<T>,
    state: Arc<StateMachine<RouterState>>,
    version: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl<T> RouterProtocol<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let state = Arc::new(StateMachine::new(RouterState::Startup));
        let version = Arc::new(Mutex::new(None));
        let handler = RouterHandler::new(state.clone(), version.clone());

        Self {
            writer,
            state,
            version,
            reader: spawn_reader(reader, handler),
            timeout: PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> RouterState {
        self.state.state()
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        debug!("sending {:?}", String::from_utf8_lossy(data));
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn activate_prompt(&mut self) -> Result<()> {
        if self.state.state() == RouterState::Startup {
            tokio::time::sleep(PROMPT_SETTLE_DELAY).await;
            self.send_data(b"\r\n").await?;
            self.state.wait_for_state(RouterState::Ready).await;
        }
        Ok(())
    }

    pub async fn router_info(&mut self) -> Result<Version> {
        self.activate_prompt().await?;
        self.state.set_state(RouterState::Info);
        self.send_data(CMD_INFO).await?;
        self.state.wait_for_state(RouterState::Ready).await;

        let version = self
            .version
            .lock()
            .take()
            .ok_or_else(|| ProtocolError::BadResponse("no version reported".to_string()))?;
        Ok(version.parse()?)
    }

    pub async fn probe(&mut self) -> Result<Version> {
        let timeout = self.timeout;
        with_timeout(timeout, self.router_info()).await
    }

    pub async fn enter_bootloader(&mut self) -> Result<()> {
        self.activate_prompt().await?;
        self.state.set_state(RouterState::Bootwait);
        self.send_data(CMD_BOOTLOADER_REBOOT).await?;
        self.state.wait_for_state(RouterState::Ready).await;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.reader.abort();
        let _ = (&mut self.reader).await;
    }
}

impl<T> Drop for RouterProtocol<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl<T> ApplicationProtocol for RouterProtocol<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn probe(&mut self) -> Result<Version> {
        RouterProtocol::probe(self).await
    }

    async fn enter_bootloader(&mut self) -> Result<()> {
        RouterProtocol::enter_bootloader(self).await
    }

    async fn close(&mut self) {
        RouterProtocol::close(self).await
    }
}
