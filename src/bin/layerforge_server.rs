//! Standalone sync server: accepts canvas pushes from interactive surfaces,
//! serves backend queries, and runs the stale-transfer reaper.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use layerforge::matting::ThresholdSegmenter;
use layerforge::sync::{ServerState, SyncServer};
use layerforge::{log_err, log_info, logger};

#[derive(Parser)]
#[command(name = "layerforge-server", about = "LayerForge canvas sync server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8765")]
    listen: String,

    /// Directory scanned for backend-produced output images.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Seconds before an unconsumed canvas transfer is reaped.
    #[arg(long, default_value_t = 300)]
    reap_secs: u64,

    /// Write a session log file.
    #[arg(long)]
    log: bool,
}

fn main() {
    let args = Args::parse();

    if args.log {
        logger::init();
        if let Some(path) = logger::log_path() {
            eprintln!("Logging to {}", path.display());
        }
    }

    log_info!(
        "Starting layerforge-server on {} (output dir {:?}, reap after {}s)",
        args.listen,
        args.output_dir,
        args.reap_secs
    );

    let state = Arc::new(ServerState::new(Box::new(ThresholdSegmenter), args.output_dir));

    let server = match SyncServer::bind(&args.listen, Arc::clone(&state)) {
        Ok(server) => server,
        Err(e) => {
            log_err!("Failed to bind {}: {}", args.listen, e);
            eprintln!("Failed to bind {}: {}", args.listen, e);
            std::process::exit(1);
        }
    };

    let reap_after = Duration::from_secs(args.reap_secs);
    let reaper_state = Arc::clone(&state);
    thread::spawn(move || loop {
        thread::sleep(reap_after.min(Duration::from_secs(30)));
        reaper_state.transfers.reap(reap_after);
    });

    server.run();
}
