#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

use clap::Parser;
use log::LevelFilter;

mod cli;
mod cmd;

use cli::{CliArgs, MainCommand};
use ldappool::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let cfg = args.config_file.as_str();

    match args.cmd {
        MainCommand::Check { pool, legacy } => {
            let config = Config::load_from_file(cfg)?;

            env_logger::builder().filter_level(config.log()).init();
            info!("Checking directory pools configured in {cfg}");

            if let Err(e) = cmd::check_cmd(config, pool, legacy).await {
                error!("Check failed: {e}");
                return Err(e);
            }
        }
        MainCommand::Encrypt => {
            env_logger::builder().filter_level(LevelFilter::Warn).init();
            cmd::encrypt_cmd(cfg)?;
        }
        MainCommand::Keygen => cmd::keygen_cmd(),
    }

    Ok(())
}
