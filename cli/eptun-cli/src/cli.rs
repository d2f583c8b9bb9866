use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "eptun-cli", about = "Runs one VPN session to completion")]
pub struct Cli {
    /// Path to the JSON5 configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Validate the configuration and print the resolved settings, then exit.
    #[arg(long)]
    pub dry_run: bool,

    /// Forces CN-CIDR bypass on regardless of the config file's `vpn.bypassCn`.
    #[arg(long, conflicts_with = "no_bypass_cn")]
    pub bypass_cn: bool,

    /// Forces CN-CIDR bypass off regardless of the config file's `vpn.bypassCn`.
    #[arg(long, conflicts_with = "bypass_cn")]
    pub no_bypass_cn: bool,
}
