use std::path::PathBuf;

use clap::Parser;

use leechtorrent::{conf::Conf, metainfo::Metainfo, torrent::Torrent};

/// A single-torrent BitTorrent leecher: downloads the file described by a
/// .torrent into the current directory.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .torrent file to download
    torrent: PathBuf,

    /// Log the details of the download
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if args.verbose { "debug" } else { "info" },
    ))
    .init();

    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let buf = std::fs::read(&args.torrent)?;
    let metainfo = Metainfo::from_bytes(&buf)?;
    log::info!(
        "Loaded {:?}, info hash {}",
        args.torrent,
        hex::encode(&metainfo.info_hash)
    );

    let conf = Conf::new(std::env::current_dir()?);
    let mut torrent = Torrent::new(metainfo, conf)?;

    // a ctrl-c stops the download cleanly: sessions shut down and the
    // partial output file is released
    let handle = torrent.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, stopping download");
            handle.stop();
        }
    });

    torrent.start().await?;
    Ok(())
}
