pub use clap::StructOpt;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use silabs_flasher::common::ApplicationType;
use silabs_flasher::protocol::vendor::Eui64;
use silabs_flasher::reset::ResetTarget;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Serial device or 'auto'
    #[clap(long, short = 'p', visible_alias = "port", default_value = "auto")]
    pub device: String,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    /// Bootloader baud rates
    #[clap(long, use_value_delimiter = true, default_values = &["115200"])]
    pub bootloader_baudrate: Vec<u32>,

    /// CPC baud rates
    #[clap(long, use_value_delimiter = true, default_values = &["460800", "115200", "230400"])]
    pub cpc_baudrate: Vec<u32>,

    /// EZSP baud rates
    #[clap(long, use_value_delimiter = true, default_values = &["115200"])]
    pub ezsp_baudrate: Vec<u32>,

    /// Spinel baud rates
    #[clap(long, use_value_delimiter = true, default_values = &["460800"])]
    pub spinel_baudrate: Vec<u32>,

    /// Router baud rates
    #[clap(long, use_value_delimiter = true, default_values = &["115200"])]
    pub router_baudrate: Vec<u32>,

    /// Application types to probe, in order
    #[clap(
        long,
        use_value_delimiter = true,
        default_values = &["bootloader", "cpc", "ezsp", "spinel", "router"]
    )]
    pub probe_method: Vec<ApplicationType>,

    /// Reset the radio into its bootloader before probing (yellow, ihost, sonoff)
    #[clap(long)]
    pub bootloader_reset: Option<ResetTarget>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detect the running firmware
    Probe,

    /// Reboot the radio into its bootloader
    EnterBootloader,

    /// Flash a firmware image
    Flash {
        /// Firmware image
        #[clap(long)]
        firmware: PathBuf,

        /// Stay in the bootloader after flashing
        #[clap(long)]
        no_run: bool,
    },

    /// Dump the EZSP configuration
    DumpConfig,

    /// Write a custom IEEE address
    WriteIeee {
        ieee: Eui64,

        /// Overwrite an address that has already been burnt in
        #[clap(long)]
        force: bool,
    },
}
