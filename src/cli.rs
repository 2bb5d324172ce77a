use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "matrix-bridge-mattermost", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Print the appservice registration derived from the configuration and exit.
    #[arg(long)]
    pub print_registration: bool,
}
