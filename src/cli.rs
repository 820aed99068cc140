use clap::{Parser, Subcommand};

use ldappool::PoolType;

#[derive(Parser)]
#[clap(version, author, about, long_about = None)]
pub struct CliArgs {
    #[arg(short, long, default_value_t = String::from("/etc/ldappool.toml"))]
    /// The config file to use
    pub config_file: String,

    #[command(subcommand)]
    pub cmd: MainCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum MainCommand {
    /// Borrow a connection from each pool, check it and print the pool status.
    Check {
        /// Only check this pool
        #[arg(short, long, value_enum)]
        pool: Option<PoolType>,

        /// Go through the reconnect-and-rebuild manager instead of the plain pools
        #[arg(short, long)]
        legacy: bool,
    },
    /// Encrypt a bind password for use as `password_encrypted`. The key is taken from the
    /// configuration or the LDAPPOOL_KEY environment variable.
    Encrypt,
    /// Print a fresh key for the `[security]` section.
    Keygen,
}
