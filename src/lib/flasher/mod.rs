mod connector;

use std::{collections::HashMap, fmt::Display, time::Duration};

use anyhow::Result;
use log::{debug, info, warn};
use thiserror::Error;

pub use connector::{Connector, SerialConnector};

use crate::common::{
    default_baudrates, default_probe_methods, pad_to_multiple, ApplicationType, Version,
    PROBE_TIMEOUT,
};
use crate::protocol::{
    is_timeout,
    vendor::{BootloaderMode, Eui64, VendorStack, VendorStatus},
    with_timeout, Bootloader, ProtocolError,
};
use crate::reset::ResetTarget;

pub const XMODEM_BLOCK_SIZE: usize = 128;
const FIRMWARE_FILL_BYTE: u8 = 0xFF;

const BOOTLOADER_LAUNCH_DELAY: Duration = Duration::from_secs(1);
const EZSP_BOOTLOADER_LAUNCH_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FlasherError {
    #[error("failed to probe running application type")]
    ProbeFailed,
    #[error("device is not running {expected}: {actual}")]
    WrongApplication {
        expected: ApplicationType,
        actual: String,
    },
    #[error("bootloader baudrate is unknown, enter the bootloader first")]
    BootloaderUnknown,
    #[error("{app_type} could not enter the bootloader: status {status}")]
    BootloaderRefused {
        app_type: ApplicationType,
        status: VendorStatus,
    },
    #[error("IEEE address has already been written, it cannot be written again")]
    AddressLocked,
    #[error("failed to write IEEE address: status {0}")]
    Refused(VendorStatus),
    #[error("the bootloader cannot be driven over this connection")]
    BootloaderUnsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub version: Option<Version>,
    pub continue_probing: bool,
    pub baudrate: u32,
}

/// What a single (application type, baudrate) probe amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    TimedOut,
    /// Transitional answer, e.g. the bootloader just launched an application.
    Continue(ProbeResult),
    Final(ProbeResult),
}

impl ProbeOutcome {
    /// Timeouts become [`ProbeOutcome::TimedOut`]; other errors stay fatal.
    pub fn classify(res: Result<ProbeResult>) -> Result<Self> {
        match res {
            Ok(result) if result.continue_probing => Ok(ProbeOutcome::Continue(result)),
            Ok(result) => Ok(ProbeOutcome::Final(result)),
            Err(e) if is_timeout(&e) => Ok(ProbeOutcome::TimedOut),
            Err(e) => Err(e),
        }
    }
}

/// What is known about the device during one interaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub app_type: Option<ApplicationType>,
    pub app_version: Option<Version>,
    pub app_baudrate: Option<u32>,
    pub bootloader_baudrate: Option<u32>,
}

struct OptDisplay<'a, T>(&'a Option<T>);

impl<T: Display> Display for OptDisplay<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(v) => v.fmt(f),
            None => "unknown".fmt(f),
        }
    }
}

pub struct Flasher<C> {
    connector: C,
    baudrates: HashMap<ApplicationType, Vec<u32>>,
    probe_methods: Vec<ApplicationType>,
    reset_target: Option<ResetTarget>,
    probe_timeout: Duration,
    bootloader_launch_delay: Duration,
    ezsp_launch_delay: Duration,
}

impl<C: Connector> Flasher<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            baudrates: default_baudrates(),
            probe_methods: default_probe_methods(),
            reset_target: None,
            probe_timeout: PROBE_TIMEOUT,
            bootloader_launch_delay: BOOTLOADER_LAUNCH_DELAY,
            ezsp_launch_delay: EZSP_BOOTLOADER_LAUNCH_DELAY,
        }
    }

    #[must_use]
    pub fn with_baudrates(mut self, baudrates: HashMap<ApplicationType, Vec<u32>>) -> Self {
        self.baudrates = baudrates;
        self
    }

    #[must_use]
    pub fn with_probe_methods(mut self, probe_methods: Vec<ApplicationType>) -> Self {
        self.probe_methods = probe_methods;
        self
    }

    #[must_use]
    pub fn with_bootloader_reset(mut self, reset_target: Option<ResetTarget>) -> Self {
        self.reset_target = reset_target;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Settle times after launching an application and after asking EZSP for the bootloader.
    #[must_use]
    pub fn with_delays(mut self, bootloader_launch: Duration, ezsp_launch: Duration) -> Self {
        self.bootloader_launch_delay = bootloader_launch;
        self.ezsp_launch_delay = ezsp_launch;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Fails unless the connector can talk to the bootloader.
    pub fn check_bootloader_support(&self) -> Result<()> {
        if self.connector.supports(ApplicationType::Bootloader) {
            Ok(())
        } else {
            Err(FlasherError::BootloaderUnsupported.into())
        }
    }

    fn baudrates_for(&self, app_type: ApplicationType) -> &[u32] {
        self.baudrates
            .get(&app_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    async fn trigger_reset(&self, target: ResetTarget) -> Result<()> {
        let baudrate = self
            .baudrates_for(ApplicationType::Bootloader)
            .first()
            .copied()
            .unwrap_or(115200);
        self.connector.trigger_reset(target, baudrate).await
    }

    async fn probe_bootloader(&self, baudrate: u32, run_firmware: bool) -> Result<ProbeResult> {
        let mut bootloader = self.connector.connect_bootloader(baudrate).await?;
        let res = launch_from_bootloader(bootloader.as_mut(), run_firmware).await;
        bootloader.close().await;
        let (version, launched) = res?;

        if launched {
            tokio::time::sleep(self.bootloader_launch_delay).await;
        }

        Ok(ProbeResult {
            version: Some(version),
            continue_probing: launched,
            baudrate,
        })
    }

    async fn probe_ezsp(&self, baudrate: u32) -> Result<ProbeResult> {
        let mut ezsp = self.connector.connect_vendor_stack(baudrate).await?;
        let res = ezsp.get_board_info().await;
        ezsp.close().await;
        let info = res?;
        debug!("board info: {:?}", info);

        Ok(ProbeResult {
            version: Some(info.version.parse()?),
            continue_probing: false,
            baudrate,
        })
    }

    async fn probe_application(&self, app_type: ApplicationType, baudrate: u32) -> Result<ProbeResult> {
        let mut app = self.connector.connect_application(app_type, baudrate).await?;
        let res = app.probe().await;
        app.close().await;

        Ok(ProbeResult {
            version: Some(res?),
            continue_probing: false,
            baudrate,
        })
    }

    async fn probe_one(
        &self,
        app_type: ApplicationType,
        baudrate: u32,
        run_firmware: bool,
    ) -> Result<ProbeResult> {
        match app_type {
            ApplicationType::Bootloader => self.probe_bootloader(baudrate, run_firmware).await,
            ApplicationType::Ezsp => self.probe_ezsp(baudrate).await,
            ApplicationType::Cpc | ApplicationType::Spinel | ApplicationType::Router => {
                self.probe_application(app_type, baudrate).await
            }
        }
    }

    /// Finds out which application the device runs and at which baudrate.
    ///
    /// `types` defaults to the configured probe methods; members of
    /// `try_first` are moved to the front, keeping their relative order.
    pub async fn probe_app_type(
        &self,
        session: &mut Session,
        types: Option<&[ApplicationType]>,
        try_first: &[ApplicationType],
    ) -> Result<()> {
        let types = types.unwrap_or(&self.probe_methods);
        let (first, rest): (Vec<ApplicationType>, Vec<ApplicationType>) =
            types.iter().partition(|t| try_first.contains(t));
        let types: Vec<ApplicationType> = first.into_iter().chain(rest).collect();

        if let Some(target) = self.reset_target {
            // The reset leaves the device in its bootloader.
            self.check_bootloader_support()?;
            self.trigger_reset(target).await?;
        }

        // Launching the application only makes sense if we can get back into
        // the bootloader afterwards and have something else to probe.
        let only_probe_bootloader = types == [ApplicationType::Bootloader];
        let run_firmware = self.reset_target.is_some() && !only_probe_bootloader;

        let mut bootloader_probe: Option<ProbeResult> = None;
        let mut detected: Option<(ApplicationType, ProbeResult)> = None;

        'probe: for &app_type in &types {
            if !self.connector.supports(app_type) {
                debug!("No driver for {}, skipping", app_type);
                continue;
            }

            for &baudrate in self.baudrates_for(app_type) {
                if app_type == ApplicationType::Bootloader && bootloader_probe.is_some() {
                    debug!("Not probing bootloader twice");
                    continue;
                }

                info!("Probing {} at {} baud", app_type, baudrate);
                let outcome =
                    ProbeOutcome::classify(self.probe_one(app_type, baudrate, run_firmware).await)?;

                let result = match &outcome {
                    ProbeOutcome::TimedOut => {
                        debug!("{} did not respond at {} baud", app_type, baudrate);
                        continue;
                    }
                    ProbeOutcome::Continue(result) | ProbeOutcome::Final(result) => result.clone(),
                };

                if app_type == ApplicationType::Bootloader {
                    info!("Detected bootloader version {}", OptDisplay(&result.version));
                    session.bootloader_baudrate = Some(result.baudrate);
                    bootloader_probe = Some(result.clone());
                }

                if let ProbeOutcome::Final(_) = outcome {
                    detected = Some((app_type, result));
                    break 'probe;
                }
            }
        }

        let (app_type, result) = match (detected, bootloader_probe, self.reset_target) {
            (Some(detected), _, _) => detected,
            (None, Some(bootloader), Some(target)) => {
                // No valid application, but the bootloader can still be re-entered.
                self.trigger_reset(target).await?;
                warn!("Bootloader did not launch a valid application");
                (ApplicationType::Bootloader, bootloader)
            }
            _ => return Err(FlasherError::ProbeFailed.into()),
        };

        session.app_type = Some(app_type);
        session.app_version = result.version;
        session.app_baudrate = Some(result.baudrate);
        if app_type == ApplicationType::Bootloader {
            session.bootloader_baudrate = Some(result.baudrate);
        }

        info!(
            "Detected {}, version {} at {} baudrate (bootloader baudrate {})",
            app_type,
            OptDisplay(&session.app_version),
            result.baudrate,
            OptDisplay(&session.bootloader_baudrate),
        );

        Ok(())
    }

    /// Reboots the running application into the bootloader.
    pub async fn enter_bootloader(&self, session: &mut Session) -> Result<()> {
        if session.app_type.is_none() {
            self.probe_app_type(session, None, &[]).await?;
        }

        let (app_type, baudrate) = match (session.app_type, session.app_baudrate) {
            (Some(app_type), Some(baudrate)) => (app_type, baudrate),
            _ => return Err(FlasherError::ProbeFailed.into()),
        };

        match app_type {
            ApplicationType::Bootloader => debug!("Already in the bootloader"),
            ApplicationType::Cpc | ApplicationType::Spinel | ApplicationType::Router => {
                let mut app = self.connector.connect_application(app_type, baudrate).await?;
                let res = with_timeout(self.probe_timeout, app.enter_bootloader()).await;
                app.close().await;
                res?;
            }
            ApplicationType::Ezsp => {
                let mut ezsp = self.connector.connect_vendor_stack(baudrate).await?;
                let res = with_timeout(
                    self.probe_timeout,
                    ezsp.launch_bootloader(BootloaderMode::Standalone),
                )
                .await;
                ezsp.close().await;

                match res {
                    Err(e) if is_timeout(&e) => warn!(
                        "Application failed to respond to bootloader launching command. \
                         Assuming bootloader has launched."
                    ),
                    Err(e) => return Err(e),
                    Ok(status) if !status.is_success() => {
                        return Err(FlasherError::BootloaderRefused { app_type, status }.into())
                    }
                    Ok(_) => tokio::time::sleep(self.ezsp_launch_delay).await,
                }
            }
        }

        if session.bootloader_baudrate.is_none() {
            if self.connector.supports(ApplicationType::Bootloader) {
                self.probe_app_type(session, Some(&[ApplicationType::Bootloader]), &[])
                    .await?;
            } else {
                warn!("Bootloader entered, but its baudrate cannot be probed over this connection");
            }
        }

        Ok(())
    }

    /// Uploads `firmware` through the bootloader, optionally launching it afterwards.
    pub async fn flash_firmware(
        &self,
        session: &Session,
        firmware: &[u8],
        run_firmware: bool,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        self.check_bootloader_support()?;
        let baudrate = session
            .bootloader_baudrate
            .ok_or(FlasherError::BootloaderUnknown)?;
        let data = pad_to_multiple(firmware, XMODEM_BLOCK_SIZE, FIRMWARE_FILL_BYTE);

        let mut bootloader = self.connector.connect_bootloader(baudrate).await?;
        let res = upload_firmware(bootloader.as_mut(), &data, run_firmware, progress).await;
        bootloader.close().await;
        res
    }

    fn expect_app(session: &Session, expected: ApplicationType) -> Result<u32> {
        match (session.app_type, session.app_baudrate) {
            (Some(app_type), Some(baudrate)) if app_type == expected => Ok(baudrate),
            (actual, _) => Err(FlasherError::WrongApplication {
                expected,
                actual: OptDisplay(&actual).to_string(),
            }
            .into()),
        }
    }

    async fn probe_for_ezsp(&self, session: &mut Session) -> Result<u32> {
        self.probe_app_type(
            session,
            None,
            &[ApplicationType::Bootloader, ApplicationType::Ezsp],
        )
        .await?;
        Self::expect_app(session, ApplicationType::Ezsp)
    }

    pub async fn dump_ezsp_config(&self, session: &mut Session) -> Result<Vec<(String, u32)>> {
        let baudrate = self.probe_for_ezsp(session).await?;

        let mut ezsp = self.connector.connect_vendor_stack(baudrate).await?;
        let res = ezsp.dump_config().await;
        ezsp.close().await;
        res
    }

    /// Writes a custom IEEE address. Returns `false` if the device already has it.
    pub async fn write_ezsp_eui64(
        &self,
        session: &mut Session,
        new_eui64: Eui64,
        force: bool,
    ) -> Result<bool> {
        let baudrate = self.probe_for_ezsp(session).await?;

        let mut ezsp = self.connector.connect_vendor_stack(baudrate).await?;
        let res = write_eui64(ezsp.as_mut(), new_eui64, force).await;
        ezsp.close().await;
        res
    }
}

/// Returns the bootloader version and whether an application was launched.
async fn launch_from_bootloader(
    bootloader: &mut dyn Bootloader,
    run_firmware: bool,
) -> Result<(Version, bool)> {
    let version = bootloader.probe().await?;

    if !run_firmware {
        return Ok((version, false));
    }

    match bootloader.run_firmware().await {
        Ok(()) => {
            info!("Launched application from bootloader");
            Ok((version, true))
        }
        Err(e) if e.downcast_ref::<ProtocolError>() == Some(&ProtocolError::NoFirmware) => {
            warn!("No application can be launched");
            Ok((version, false))
        }
        Err(e) => Err(e),
    }
}

async fn upload_firmware(
    bootloader: &mut dyn Bootloader,
    data: &[u8],
    run_firmware: bool,
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> Result<()> {
    // Bootloader state can reset when the port is reopened.
    let version = bootloader.probe().await?;
    info!("Uploading {} bytes to bootloader {}", data.len(), version);

    bootloader.upload_firmware(data, progress).await?;

    if run_firmware {
        bootloader.run_firmware().await?;
    }

    Ok(())
}

async fn write_eui64(ezsp: &mut dyn VendorStack, new_eui64: Eui64, force: bool) -> Result<bool> {
    let current = ezsp.get_eui64().await?;
    info!("Current device IEEE: {}", current);

    if current == new_eui64 {
        info!("Device IEEE address already matches, not overwriting");
        return Ok(false);
    }

    if !ezsp.can_write_custom_eui64().await? {
        return Err(FlasherError::AddressLocked.into());
    }

    let status = ezsp.write_eui64(new_eui64, force).await?;
    if !status.is_success() {
        return Err(FlasherError::Refused(status).into());
    }

    info!("Wrote IEEE address {}", new_eui64);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::protocol::{vendor::BoardInfo, ApplicationProtocol};

    const EUI64: Eui64 = Eui64([0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
    const OTHER_EUI64: Eui64 = Eui64([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x11]);

    #[derive(Debug, Clone, Copy)]
    enum Reply {
        Version(&'static str),
        Fail,
    }

    struct Device {
        replies: HashMap<(ApplicationType, u32), Reply>,
        unsupported: Vec<ApplicationType>,
        has_firmware: bool,
        eui64: Eui64,
        can_write_eui64: bool,
        // None: the application never answers
        launch_status: Option<VendorStatus>,
        reset_fails: bool,
        calls: Vec<String>,
        uploaded: Vec<u8>,
    }

    #[derive(Clone)]
    struct MockConnector(Arc<Mutex<Device>>);

    impl MockConnector {
        fn new(replies: &[(ApplicationType, u32, Reply)]) -> Self {
            Self(Arc::new(Mutex::new(Device {
                replies: replies
                    .iter()
                    .map(|&(app_type, baudrate, reply)| ((app_type, baudrate), reply))
                    .collect(),
                unsupported: vec![],
                has_firmware: true,
                eui64: EUI64,
                can_write_eui64: true,
                launch_status: Some(VendorStatus::SUCCESS),
                reset_fails: false,
                calls: vec![],
                uploaded: vec![],
            })))
        }

        fn with(self, f: impl FnOnce(&mut Device)) -> Self {
            f(&mut self.0.lock());
            self
        }

        fn log(&self, call: String) {
            self.0.lock().calls.push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.0.lock().calls.clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn reply(&self, app_type: ApplicationType, baudrate: u32) -> Result<Version> {
            let reply = self.0.lock().replies.get(&(app_type, baudrate)).copied();
            match reply {
                None => Err(ProtocolError::TimedOut.into()),
                Some(Reply::Version(v)) => Ok(v.parse()?),
                Some(Reply::Fail) => Err(anyhow!("port vanished")),
            }
        }
    }

    struct MockApp(MockConnector, ApplicationType, u32);

    #[async_trait]
    impl ApplicationProtocol for MockApp {
        async fn probe(&mut self) -> Result<Version> {
            self.0.log(format!("probe {}", self.1));
            self.0.reply(self.1, self.2)
        }

        async fn enter_bootloader(&mut self) -> Result<()> {
            self.0.log(format!("enter_bootloader {}", self.1));
            Ok(())
        }

        async fn close(&mut self) {
            self.0.log(format!("close {}", self.1));
        }
    }

    struct MockBootloader(MockConnector, u32);

    #[async_trait]
    impl Bootloader for MockBootloader {
        async fn probe(&mut self) -> Result<Version> {
            self.0.log("probe bootloader".to_string());
            self.0.reply(ApplicationType::Bootloader, self.1)
        }

        async fn run_firmware(&mut self) -> Result<()> {
            self.0.log("run_firmware".to_string());
            if self.0 .0.lock().has_firmware {
                Ok(())
            } else {
                Err(ProtocolError::NoFirmware.into())
            }
        }

        async fn upload_firmware(
            &mut self,
            data: &[u8],
            progress: &mut (dyn FnMut(usize, usize) + Send),
        ) -> Result<()> {
            self.0.log(format!("upload {}", data.len()));
            for (i, chunk) in data.chunks(XMODEM_BLOCK_SIZE).enumerate() {
                progress(i * XMODEM_BLOCK_SIZE + chunk.len(), data.len());
            }
            self.0 .0.lock().uploaded = data.to_vec();
            Ok(())
        }

        async fn close(&mut self) {
            self.0.log("close bootloader".to_string());
        }
    }

    struct MockEzsp(MockConnector, u32);

    #[async_trait]
    impl VendorStack for MockEzsp {
        async fn get_board_info(&mut self) -> Result<BoardInfo> {
            self.0.log("probe ezsp".to_string());
            let version = self.0.reply(ApplicationType::Ezsp, self.1)?;
            Ok(BoardInfo {
                manufacturer: "Nabu Casa".to_string(),
                board: "SkyConnect".to_string(),
                version: version.to_string(),
            })
        }

        async fn get_eui64(&mut self) -> Result<Eui64> {
            Ok(self.0 .0.lock().eui64)
        }

        async fn can_write_custom_eui64(&mut self) -> Result<bool> {
            Ok(self.0 .0.lock().can_write_eui64)
        }

        async fn write_eui64(&mut self, eui64: Eui64, persist: bool) -> Result<VendorStatus> {
            self.0.log(format!("write_eui64 {} {}", eui64, persist));
            self.0 .0.lock().eui64 = eui64;
            Ok(VendorStatus::SUCCESS)
        }

        async fn launch_bootloader(&mut self, _mode: BootloaderMode) -> Result<VendorStatus> {
            self.0.log("launch_bootloader".to_string());
            let status = self.0 .0.lock().launch_status;
            status.ok_or_else(|| ProtocolError::TimedOut.into())
        }

        async fn dump_config(&mut self) -> Result<Vec<(String, u32)>> {
            Ok(vec![("CONFIG_PACKET_BUFFER_COUNT".to_string(), 255)])
        }

        async fn close(&mut self) {
            self.0.log("close ezsp".to_string());
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn supports(&self, app_type: ApplicationType) -> bool {
            !self.0.lock().unsupported.contains(&app_type)
        }

        async fn connect_bootloader(&self, baudrate: u32) -> Result<Box<dyn Bootloader>> {
            self.log(format!("connect bootloader@{}", baudrate));
            Ok(Box::new(MockBootloader(self.clone(), baudrate)))
        }

        async fn connect_application(
            &self,
            app_type: ApplicationType,
            baudrate: u32,
        ) -> Result<Box<dyn ApplicationProtocol>> {
            self.log(format!("connect {}@{}", app_type, baudrate));
            Ok(Box::new(MockApp(self.clone(), app_type, baudrate)))
        }

        async fn connect_vendor_stack(&self, baudrate: u32) -> Result<Box<dyn VendorStack>> {
            self.log(format!("connect ezsp@{}", baudrate));
            Ok(Box::new(MockEzsp(self.clone(), baudrate)))
        }

        async fn trigger_reset(&self, target: ResetTarget, _baudrate: u32) -> Result<()> {
            if self.0.lock().reset_fails {
                return Err(anyhow!("Failed to open /dev/gpiochip0"));
            }
            self.log(format!("reset {}", target));
            Ok(())
        }
    }

    fn flasher(connector: MockConnector) -> Flasher<MockConnector> {
        Flasher::new(connector).with_delays(Duration::ZERO, Duration::ZERO)
    }

    fn flasher_error(err: &anyhow::Error) -> &FlasherError {
        err.downcast_ref::<FlasherError>().unwrap()
    }

    #[test]
    fn classify_outcomes() {
        let result = ProbeResult {
            version: None,
            continue_probing: false,
            baudrate: 115200,
        };

        assert_eq!(
            ProbeOutcome::classify(Ok(result.clone())).unwrap(),
            ProbeOutcome::Final(result.clone())
        );
        let transitional = ProbeResult {
            continue_probing: true,
            ..result
        };
        assert_eq!(
            ProbeOutcome::classify(Ok(transitional.clone())).unwrap(),
            ProbeOutcome::Continue(transitional)
        );
        assert_eq!(
            ProbeOutcome::classify(Err(ProtocolError::TimedOut.into())).unwrap(),
            ProbeOutcome::TimedOut
        );
        assert!(ProbeOutcome::classify(Err(anyhow!("boom"))).is_err());
    }

    #[tokio::test]
    async fn probe_stops_at_first_answer() {
        let connector = MockConnector::new(&[
            (ApplicationType::Ezsp, 115200, Reply::Version("7.4.4.0 build 0")),
            (ApplicationType::Spinel, 460800, Reply::Version("2.4.4.0")),
        ]);
        let flasher = flasher(connector).with_probe_methods(vec![
            ApplicationType::Bootloader,
            ApplicationType::Ezsp,
            ApplicationType::Spinel,
        ]);

        let mut session = Session::default();
        flasher.probe_app_type(&mut session, None, &[]).await.unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Ezsp));
        assert_eq!(session.app_baudrate, Some(115200));
        assert_eq!(session.app_version, Some("7.4.4.0 build 0".parse().unwrap()));
        assert_eq!(session.bootloader_baudrate, None);
        assert_eq!(
            flasher.connector().calls(),
            [
                "connect bootloader@115200",
                "probe bootloader",
                "close bootloader",
                "connect ezsp@115200",
                "probe ezsp",
                "close ezsp",
            ]
        );
    }

    #[tokio::test]
    async fn probe_tries_preferred_types_first() {
        let connector = MockConnector::new(&[
            (ApplicationType::Cpc, 460800, Reply::Version("4.3.1")),
            (ApplicationType::Ezsp, 115200, Reply::Version("7.4.4.0 build 0")),
        ]);
        let flasher = flasher(connector)
            .with_probe_methods(vec![ApplicationType::Cpc, ApplicationType::Ezsp]);

        let mut session = Session::default();
        flasher
            .probe_app_type(&mut session, None, &[ApplicationType::Ezsp])
            .await
            .unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Ezsp));
        assert_eq!(flasher.connector().calls()[0], "connect ezsp@115200");
        assert_eq!(flasher.connector().count("connect cpc"), 0);
    }

    #[tokio::test]
    async fn probe_exhausted() {
        let flasher = flasher(MockConnector::new(&[]));

        let mut session = Session::default();
        let err = flasher
            .probe_app_type(&mut session, None, &[])
            .await
            .unwrap_err();

        assert!(matches!(flasher_error(&err), FlasherError::ProbeFailed));
        assert_eq!(session, Session::default());
        // one bootloader, three CPC, one each for EZSP, Spinel and the router
        assert_eq!(flasher.connector().count("connect"), 7);
    }

    #[tokio::test]
    async fn probe_launches_application_from_bootloader() {
        let connector = MockConnector::new(&[
            (ApplicationType::Bootloader, 115200, Reply::Version("2.00.01")),
            (ApplicationType::Cpc, 115200, Reply::Version("4.3.1")),
        ]);
        let flasher = flasher(connector)
            .with_probe_methods(vec![ApplicationType::Bootloader, ApplicationType::Cpc])
            .with_bootloader_reset(Some(ResetTarget::Yellow));

        let mut session = Session::default();
        flasher.probe_app_type(&mut session, None, &[]).await.unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Cpc));
        assert_eq!(session.app_baudrate, Some(115200));
        assert_eq!(session.app_version, Some("4.3.1".parse().unwrap()));
        assert_eq!(session.bootloader_baudrate, Some(115200));

        let calls = flasher.connector().calls();
        assert_eq!(calls[0], "reset yellow");
        assert!(calls.contains(&"run_firmware".to_string()));
        assert_eq!(flasher.connector().count("connect cpc"), 2);
    }

    #[tokio::test]
    async fn probe_without_reset_stays_in_bootloader() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )]);
        let flasher = flasher(connector);

        let mut session = Session::default();
        flasher.probe_app_type(&mut session, None, &[]).await.unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Bootloader));
        assert_eq!(session.bootloader_baudrate, Some(115200));
        assert_eq!(flasher.connector().count("run_firmware"), 0);
        assert_eq!(flasher.connector().count("reset"), 0);
        assert_eq!(flasher.connector().count("connect cpc"), 0);
    }

    #[tokio::test]
    async fn probe_bootloader_without_firmware() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )])
        .with(|device| device.has_firmware = false);
        let flasher = flasher(connector).with_bootloader_reset(Some(ResetTarget::Sonoff));

        let mut session = Session::default();
        flasher.probe_app_type(&mut session, None, &[]).await.unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Bootloader));
        assert_eq!(session.app_baudrate, Some(115200));
        assert_eq!(session.app_version, Some("2.00.01".parse().unwrap()));
        assert_eq!(flasher.connector().count("connect cpc"), 0);
    }

    #[tokio::test]
    async fn probe_falls_back_to_bootloader() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )]);
        let flasher = flasher(connector).with_bootloader_reset(Some(ResetTarget::Yellow));

        let mut session = Session::default();
        flasher.probe_app_type(&mut session, None, &[]).await.unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Bootloader));
        assert_eq!(session.bootloader_baudrate, Some(115200));
        assert_eq!(flasher.connector().count("reset yellow"), 2);
    }

    #[tokio::test]
    async fn probe_bootloader_only_once() {
        let connector = MockConnector::new(&[
            (ApplicationType::Bootloader, 115200, Reply::Version("2.00.01")),
            (ApplicationType::Bootloader, 57600, Reply::Version("2.00.01")),
        ]);
        let flasher = flasher(connector)
            .with_baudrates(HashMap::from([(
                ApplicationType::Bootloader,
                vec![115200, 57600],
            )]))
            .with_bootloader_reset(Some(ResetTarget::Ihost));

        let mut session = Session::default();
        flasher
            .probe_app_type(
                &mut session,
                Some(&[ApplicationType::Bootloader, ApplicationType::Bootloader]),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(flasher.connector().count("connect bootloader"), 1);
        assert_eq!(flasher.connector().count("run_firmware"), 1);
        assert_eq!(session.app_type, Some(ApplicationType::Bootloader));
        assert_eq!(session.bootloader_baudrate, Some(115200));
    }

    #[tokio::test]
    async fn probe_skips_unsupported_types() {
        let connector = MockConnector::new(&[(
            ApplicationType::Router,
            115200,
            Reply::Version("7.1.3.0"),
        )])
        .with(|device| device.unsupported = vec![ApplicationType::Spinel]);
        let flasher = flasher(connector)
            .with_probe_methods(vec![ApplicationType::Spinel, ApplicationType::Router]);

        let mut session = Session::default();
        flasher.probe_app_type(&mut session, None, &[]).await.unwrap();

        assert_eq!(session.app_type, Some(ApplicationType::Router));
        assert_eq!(flasher.connector().count("connect spinel"), 0);
    }

    #[tokio::test]
    async fn probe_aborts_on_fatal_error() {
        let connector = MockConnector::new(&[
            (ApplicationType::Cpc, 460800, Reply::Fail),
            (ApplicationType::Ezsp, 115200, Reply::Version("7.4.4.0 build 0")),
        ]);
        let flasher = flasher(connector);

        let mut session = Session::default();
        let err = flasher
            .probe_app_type(&mut session, None, &[])
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "port vanished");
        assert_eq!(flasher.connector().count("connect ezsp"), 0);
        // the failed connection is still released
        assert_eq!(flasher.connector().count("close cpc"), 1);
    }

    #[tokio::test]
    async fn enter_bootloader_from_cpc() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )]);
        let flasher = flasher(connector);

        let mut session = Session {
            app_type: Some(ApplicationType::Cpc),
            app_baudrate: Some(460800),
            ..Default::default()
        };
        flasher.enter_bootloader(&mut session).await.unwrap();

        assert_eq!(
            flasher.connector().calls(),
            [
                "connect cpc@460800",
                "enter_bootloader cpc",
                "close cpc",
                "connect bootloader@115200",
                "probe bootloader",
                "close bootloader",
            ]
        );
        assert_eq!(session.app_type, Some(ApplicationType::Bootloader));
        assert_eq!(session.bootloader_baudrate, Some(115200));
    }

    #[tokio::test]
    async fn enter_bootloader_without_bootloader_driver() {
        let connector = MockConnector::new(&[])
            .with(|device| device.unsupported = vec![ApplicationType::Bootloader]);
        let flasher = flasher(connector);

        let mut session = Session {
            app_type: Some(ApplicationType::Cpc),
            app_baudrate: Some(460800),
            ..Default::default()
        };
        flasher.enter_bootloader(&mut session).await.unwrap();

        assert_eq!(
            flasher.connector().calls(),
            ["connect cpc@460800", "enter_bootloader cpc", "close cpc"]
        );
        assert_eq!(session.bootloader_baudrate, None);
    }

    #[tokio::test]
    async fn reset_needs_bootloader_driver() {
        let connector = MockConnector::new(&[(
            ApplicationType::Cpc,
            460800,
            Reply::Version("4.3.1"),
        )])
        .with(|device| device.unsupported = vec![ApplicationType::Bootloader]);
        let flasher = flasher(connector).with_bootloader_reset(Some(ResetTarget::Yellow));

        let mut session = Session::default();
        let err = flasher
            .probe_app_type(&mut session, None, &[])
            .await
            .unwrap_err();

        assert!(matches!(
            flasher_error(&err),
            FlasherError::BootloaderUnsupported
        ));
        assert!(flasher.connector().calls().is_empty());
    }

    #[tokio::test]
    async fn reset_failure_is_fatal() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )])
        .with(|device| device.reset_fails = true);
        let flasher = flasher(connector).with_bootloader_reset(Some(ResetTarget::Yellow));

        let mut session = Session::default();
        let err = flasher
            .probe_app_type(&mut session, None, &[])
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to open /dev/gpiochip0");
        assert_eq!(flasher.connector().count("connect"), 0);
        assert_eq!(session, Session::default());
    }

    #[tokio::test]
    async fn enter_bootloader_tolerates_ezsp_timeout() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )])
        .with(|device| device.launch_status = None);
        let flasher = flasher(connector);

        let mut session = Session {
            app_type: Some(ApplicationType::Ezsp),
            app_baudrate: Some(115200),
            ..Default::default()
        };
        flasher.enter_bootloader(&mut session).await.unwrap();

        assert_eq!(flasher.connector().count("launch_bootloader"), 1);
        assert_eq!(session.bootloader_baudrate, Some(115200));
    }

    #[tokio::test]
    async fn enter_bootloader_refused_by_ezsp() {
        let connector = MockConnector::new(&[])
            .with(|device| device.launch_status = Some(VendorStatus(0x18)));
        let flasher = flasher(connector);

        let mut session = Session {
            app_type: Some(ApplicationType::Ezsp),
            app_baudrate: Some(115200),
            ..Default::default()
        };
        let err = flasher.enter_bootloader(&mut session).await.unwrap_err();

        assert!(matches!(
            flasher_error(&err),
            FlasherError::BootloaderRefused {
                app_type: ApplicationType::Ezsp,
                status: VendorStatus(0x18),
            }
        ));
        assert_eq!(flasher.connector().count("connect bootloader"), 0);
    }

    #[tokio::test]
    async fn enter_bootloader_already_there() {
        let flasher = flasher(MockConnector::new(&[]));

        let mut session = Session {
            app_type: Some(ApplicationType::Bootloader),
            app_baudrate: Some(115200),
            bootloader_baudrate: Some(115200),
            ..Default::default()
        };
        flasher.enter_bootloader(&mut session).await.unwrap();

        assert!(flasher.connector().calls().is_empty());
    }

    fn ezsp_device() -> MockConnector {
        MockConnector::new(&[(
            ApplicationType::Ezsp,
            115200,
            Reply::Version("7.4.4.0 build 0"),
        )])
    }

    #[tokio::test]
    async fn write_eui64_already_set() {
        let flasher = flasher(ezsp_device());

        let mut session = Session::default();
        let written = flasher
            .write_ezsp_eui64(&mut session, EUI64, false)
            .await
            .unwrap();

        assert!(!written);
        assert_eq!(flasher.connector().count("write_eui64"), 0);
    }

    #[tokio::test]
    async fn write_eui64_new_address() {
        let flasher = flasher(ezsp_device());

        let mut session = Session::default();
        let written = flasher
            .write_ezsp_eui64(&mut session, OTHER_EUI64, false)
            .await
            .unwrap();

        assert!(written);
        assert_eq!(
            flasher.connector().count("write_eui64 aa:bb:cc:dd:ee:ff:00:11 false"),
            1
        );
        assert_eq!(flasher.connector().count("write_eui64"), 1);
        assert_eq!(flasher.connector().count("close ezsp"), 2);
    }

    #[tokio::test]
    async fn write_eui64_locked() {
        let flasher = flasher(ezsp_device().with(|device| device.can_write_eui64 = false));

        let mut session = Session::default();
        let err = flasher
            .write_ezsp_eui64(&mut session, OTHER_EUI64, false)
            .await
            .unwrap_err();
        assert!(matches!(flasher_error(&err), FlasherError::AddressLocked));

        // forcing does not unlock a burnt-in address
        let err = flasher
            .write_ezsp_eui64(&mut session, OTHER_EUI64, true)
            .await
            .unwrap_err();
        assert!(matches!(flasher_error(&err), FlasherError::AddressLocked));
        assert_eq!(flasher.connector().count("write_eui64"), 0);
    }

    #[tokio::test]
    async fn write_eui64_forced_persists() {
        let flasher = flasher(ezsp_device());

        let mut session = Session::default();
        let written = flasher
            .write_ezsp_eui64(&mut session, OTHER_EUI64, true)
            .await
            .unwrap();

        assert!(written);
        assert_eq!(
            flasher.connector().count("write_eui64 aa:bb:cc:dd:ee:ff:00:11 true"),
            1
        );
    }

    #[tokio::test]
    async fn write_eui64_requires_ezsp() {
        let connector = MockConnector::new(&[(
            ApplicationType::Cpc,
            460800,
            Reply::Version("4.3.1"),
        )]);
        let flasher = flasher(connector);

        let mut session = Session::default();
        let err = flasher
            .write_ezsp_eui64(&mut session, OTHER_EUI64, true)
            .await
            .unwrap_err();

        assert!(matches!(
            flasher_error(&err),
            FlasherError::WrongApplication {
                expected: ApplicationType::Ezsp,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dump_config() {
        let flasher = flasher(ezsp_device());

        let mut session = Session::default();
        let config = flasher.dump_ezsp_config(&mut session).await.unwrap();

        assert_eq!(config, [("CONFIG_PACKET_BUFFER_COUNT".to_string(), 255)]);
    }

    #[tokio::test]
    async fn flash_pads_image() {
        let connector = MockConnector::new(&[(
            ApplicationType::Bootloader,
            115200,
            Reply::Version("2.00.01"),
        )]);
        let flasher = flasher(connector);

        let session = Session {
            bootloader_baudrate: Some(115200),
            ..Default::default()
        };
        let mut reports = vec![];
        flasher
            .flash_firmware(&session, &[0x01; 200], true, &mut |offset, total| {
                reports.push((offset, total))
            })
            .await
            .unwrap();

        assert_eq!(reports, [(128, 256), (256, 256)]);

        let uploaded = flasher.connector().0.lock().uploaded.clone();
        assert_eq!(uploaded.len(), 256);
        assert!(uploaded[..200].iter().all(|&b| b == 0x01));
        assert!(uploaded[200..].iter().all(|&b| b == 0xFF));
        assert_eq!(
            flasher.connector().calls(),
            [
                "connect bootloader@115200",
                "probe bootloader",
                "upload 256",
                "run_firmware",
                "close bootloader",
            ]
        );
    }

    #[tokio::test]
    async fn flash_needs_bootloader_baudrate() {
        let flasher = flasher(MockConnector::new(&[]));

        let err = flasher
            .flash_firmware(&Session::default(), &[0x01; 16], false, &mut |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(flasher_error(&err), FlasherError::BootloaderUnknown));
        assert!(flasher.connector().calls().is_empty());
    }

    #[tokio::test]
    async fn flash_needs_bootloader_driver() {
        let connector = MockConnector::new(&[])
            .with(|device| device.unsupported = vec![ApplicationType::Bootloader]);
        let flasher = flasher(connector);

        let session = Session {
            bootloader_baudrate: Some(115200),
            ..Default::default()
        };
        let err = flasher
            .flash_firmware(&session, &[0x01; 16], false, &mut |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(
            flasher_error(&err),
            FlasherError::BootloaderUnsupported
        ));
        assert!(flasher.connector().calls().is_empty());
    }
}
