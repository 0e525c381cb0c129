mod cli;

use std::io;
use std::{collections::HashMap, path::Path, process};

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use log::{error, info};

use silabs_flasher::common::ApplicationType;
use silabs_flasher::flasher::{Flasher, SerialConnector, Session};
use silabs_flasher::port;
use silabs_flasher::protocol::vendor::Eui64;

use cli::{Cli, Commands, StructOpt};

enum OutputFormat {
    Plain,
    Json,
}

fn make_flasher(cli: &Cli) -> Result<Flasher<SerialConnector>> {
    let device = if cli.device == "auto" {
        port::guess_port()?
    } else {
        cli.device.clone()
    };
    info!("Using {}", device);

    let baudrates = HashMap::from([
        (ApplicationType::Bootloader, cli.bootloader_baudrate.clone()),
        (ApplicationType::Cpc, cli.cpc_baudrate.clone()),
        (ApplicationType::Ezsp, cli.ezsp_baudrate.clone()),
        (ApplicationType::Spinel, cli.spinel_baudrate.clone()),
        (ApplicationType::Router, cli.router_baudrate.clone()),
    ]);

    Ok(Flasher::new(SerialConnector::new(&device, cli.force))
        .with_baudrates(baudrates)
        .with_probe_methods(cli.probe_method.clone())
        .with_bootloader_reset(cli.bootloader_reset))
}

async fn cmd_probe(
    flasher: &Flasher<SerialConnector>,
    session: &mut Session,
    fmt: OutputFormat,
) -> Result<String> {
    flasher.probe_app_type(session, None, &[]).await?;

    let app_type = session.app_type.map(|t| t.to_string());
    let version = session.app_version.as_ref().map(|v| v.to_string());

    Ok(match fmt {
        OutputFormat::Plain => format!(
            "{} {} (baudrate {}, bootloader baudrate {})",
            app_type.unwrap_or_default(),
            version.unwrap_or_default(),
            session.app_baudrate.unwrap_or_default(),
            session
                .bootloader_baudrate
                .map(|b| b.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ),
        OutputFormat::Json => {
            let mut res = json::JsonValue::new_object();
            res["type"] = app_type.into();
            res["version"] = version.into();
            res["baudrate"] = session.app_baudrate.into();
            res["bootloader_baudrate"] = session.bootloader_baudrate.into();
            res.dump()
        }
    })
}

async fn cmd_flash(
    flasher: &Flasher<SerialConnector>,
    session: &mut Session,
    firmware: &Path,
    run_firmware: bool,
) -> Result<String> {
    let data = std::fs::read(firmware)
        .with_context(|| format!("Failed to read {}", firmware.display()))?;

    flasher.enter_bootloader(session).await?;

    let mut last_percent = 0;
    let mut progress = |offset: usize, total: usize| {
        let percent = offset * 100 / total.max(1);
        if percent / 10 != last_percent / 10 {
            info!("Flashing: {}%", percent);
        }
        last_percent = percent;
    };

    flasher
        .flash_firmware(session, &data, run_firmware, &mut progress)
        .await?;

    info!("Flashed {}", firmware.display());
    Ok(String::default())
}

async fn cmd_dump_config(
    flasher: &Flasher<SerialConnector>,
    session: &mut Session,
    fmt: OutputFormat,
) -> Result<String> {
    let config = flasher.dump_ezsp_config(session).await?;

    Ok(match fmt {
        OutputFormat::Plain => config
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<String>>()
            .join("\n"),
        OutputFormat::Json => {
            let mut res = json::JsonValue::new_object();
            for (name, value) in config {
                res[name.as_str()] = value.into();
            }
            res.dump()
        }
    })
}

async fn cmd_write_ieee(
    flasher: &Flasher<SerialConnector>,
    session: &mut Session,
    ieee: Eui64,
    force: bool,
) -> Result<String> {
    let written = flasher.write_ezsp_eui64(session, ieee, force).await?;
    Ok(write_ieee_outcome(ieee, written))
}

fn write_ieee_outcome(ieee: Eui64, written: bool) -> String {
    if written {
        format!("IEEE address set to {}", ieee)
    } else {
        format!("IEEE address unchanged ({})", ieee)
    }
}

async fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut cli::Cli::command(),
            "silabs-flasher",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let flasher = make_flasher(&cli)?;
    if cli.bootloader_reset.is_some() || matches!(cli.command, Commands::Flash { .. }) {
        flasher
            .check_bootloader_support()
            .context("Bootloader reset and flashing need a bootloader driver")?;
    }

    let mut session = Session::default();

    match cli.command {
        Commands::Probe => cmd_probe(&flasher, &mut session, fmt).await,
        Commands::EnterBootloader => {
            flasher.enter_bootloader(&mut session).await?;
            Ok(String::default())
        }
        Commands::Flash { firmware, no_run } => {
            cmd_flash(&flasher, &mut session, &firmware, !no_run).await
        }
        Commands::DumpConfig => cmd_dump_config(&flasher, &mut session, fmt).await,
        Commands::WriteIeee { ieee, force } => {
            cmd_write_ieee(&flasher, &mut session, ieee, force).await
        }
    }
}

#[tokio::main]
async fn main() {
    match do_main().await {
        Ok(s) => println!("{}", s),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}
