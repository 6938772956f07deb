use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "elastic-socks",
    about = "Elastic SOCKS5 relay",
    version = env!("CARGO_PKG_VERSION"),
    long_about = "A SOCKS5 dispatcher that forwards requests through dynamically registered workers, with a direct fallback when none are connected."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Run the dispatcher: accept SOCKS clients and worker links
    Server {
        /// SOCKS listen port (overrides the configuration file)
        #[arg(long)]
        socks_port: Option<u16>,

        /// Worker link listen port (overrides the configuration file)
        #[arg(long)]
        link_port: Option<u16>,

        /// Serve Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },

    /// Run a worker: connect to a dispatcher and serve its sessions
    Worker {
        /// Dispatcher address as host:port (repeatable, overrides the file)
        #[arg(short, long = "server", value_name = "HOST:PORT")]
        servers: Vec<String>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "elastic-socks.toml")]
        output: PathBuf,
    },
}
