use anyhow::Result;
use clap::Parser;
use log::info;
use rust_ccnd_fwd::{io, Ccnd, Config};
use std::path::PathBuf;

/// CCN forwarding daemon
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long)]
    verbose: bool,

    /// Override the local-domain socket path (CCN_LOCAL_SOCKNAME)
    #[clap(long)]
    sockname: Option<PathBuf>,

    /// Override the unicast port (CCN_LOCAL_PORT)
    #[clap(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let mut cfg = Config::from_env();
    if let Some(sockname) = cli.sockname {
        cfg.sockname = sockname;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let ccnd = Ccnd::new(cfg);
    info!(
        "ccnd starting, id {}",
        ccnd.ccndid
            .iter()
            .take(6)
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    );
    io::run(ccnd).await
}
