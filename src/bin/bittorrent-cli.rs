//! Thin CLI front-end over `bittorrent_core::client::Controller` (§6),
//! matching `jsondevers-bobby-bit/src/main.rs`'s shape (a `clap::Parser`
//! struct driving straight into library calls) but exposing the full
//! subcommand contract spec.md's §6 defines instead of the teacher's
//! single hard-coded download path.

use bittorrent_core::client::Controller;
use bittorrent_core::conf::Conf;
use bittorrent_core::metainfo::{Magnet, Metainfo};
use bittorrent_core::tracker::client::{self, AnnounceEvent, AnnounceParams};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "bittorrent-cli", about = "Download and seed torrents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Download {
        torrent: PathBuf,
        #[arg(long, default_value_t = 6881)]
        port: u16,
        #[arg(long = "download-dir", default_value = ".")]
        download_dir: PathBuf,
    },
    DownloadMagnet {
        uri: String,
        #[arg(long = "download-dir", default_value = ".")]
        download_dir: PathBuf,
    },
    Seed {
        torrent: PathBuf,
        complete_path: PathBuf,
        #[arg(long, default_value_t = 6881)]
        port: u16,
    },
    Peers {
        torrent: PathBuf,
        #[arg(long)]
        scrape: bool,
        #[arg(long)]
        get: bool,
    },
    Status,
    Stop {
        torrent: PathBuf,
    },
    Remove {
        torrent: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    let conf = Conf::default();
    let controller = Controller::new(conf.clone());

    match command {
        Command::Download { torrent, port, download_dir } => {
            let metainfo = Metainfo::from_file(&torrent)?;
            let info_hash = metainfo.info_hash();
            controller.download(metainfo, &download_dir, port)?;
            wait_for_completion(&controller, info_hash)
        }
        Command::DownloadMagnet { uri, download_dir } => {
            let magnet = Magnet::parse(&uri)?;
            let info_hash = magnet.info_hash;
            controller.download_magnet(&magnet, &download_dir, 6881)?;
            wait_for_completion(&controller, info_hash)
        }
        Command::Seed { torrent, complete_path, port } => {
            let metainfo = Metainfo::from_file(&torrent)?;
            controller.seed(metainfo, &complete_path, port)?;
            println!("seeding; press Ctrl+C to stop");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        Command::Peers { torrent, scrape, get } => {
            let metainfo = Metainfo::from_file(&torrent)?;
            let tracker_url = metainfo.announce_url()?;
            if scrape || !get {
                let response = client::scrape(tracker_url, metainfo.info_hash(), &conf)?;
                for (hash, file) in response.files {
                    println!(
                        "{}: complete={} incomplete={} downloaded={}",
                        hex::encode(&hash),
                        file.complete,
                        file.incomplete,
                        file.downloaded
                    );
                }
            } else {
                let response = client::announce(
                    tracker_url,
                    &AnnounceParams {
                        info_hash: metainfo.info_hash(),
                        peer_id: bittorrent_core::metainfo::PeerId::generate(),
                        port: 0,
                        uploaded: 0,
                        downloaded: 0,
                        left: metainfo.total_length(),
                        event: AnnounceEvent::None,
                    },
                    &conf,
                )?;
                for addr in response.peer_addrs() {
                    println!("{addr}");
                }
            }
            Ok(())
        }
        Command::Status => {
            for info_hash in controller.active_torrents() {
                let status = controller.status(info_hash)?;
                println!("{info_hash}: {}/{} ({:?})", status.pieces_done, status.pieces_total, status.role);
            }
            Ok(())
        }
        Command::Stop { torrent } => {
            let metainfo = Metainfo::from_file(&torrent)?;
            controller.stop(metainfo.info_hash())?;
            Ok(())
        }
        Command::Remove { torrent } => {
            let metainfo = Metainfo::from_file(&torrent)?;
            controller.stop(metainfo.info_hash())?;
            Ok(())
        }
    }
}

fn wait_for_completion(controller: &Controller, info_hash: bittorrent_core::metainfo::InfoHash) -> anyhow::Result<()> {
    loop {
        let status = controller.status(info_hash)?;
        println!("{}/{} pieces verified", status.pieces_done, status.pieces_total);
        if status.pieces_done >= status.pieces_total {
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Minimal hex encoder for the 20-byte scrape keys, kept local since this
/// binary otherwise has no need for a `hex` dependency.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
