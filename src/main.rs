use anyhow::Result;
use clap::Parser;
use dht_spider::dht::node::{DhtConfig, DhtNode, InfohashSink};
use dht_spider::dispatcher::{Dispatcher, DispatcherConfig};
use dht_spider::logger::Logger;
use dht_spider::storage::{OutputConfig, OutputSink};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[derive(Parser, Debug)]
#[clap(
    name = "dht_spider",
    version,
    about = "Passive DHT infohash harvester with ut_metadata retrieval"
)]
struct Cli {
    /// Print discoveries only; write neither the text log nor torrent files
    #[clap(short = 's', long)]
    print_only: bool,
    /// Path of the text log of discovered torrents
    #[clap(short = 'p', long, default_value = "hash.log")]
    log_path: PathBuf,
    /// Max concurrent metadata downloads
    #[clap(short = 't', long, default_value_t = 100)]
    threads: usize,
    /// 1 saves reconstructed .torrent files under BT/, 0 disables
    #[clap(short = 'b', long, default_value_t = 1)]
    save_torrents: u8,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Cli::parse();

    println!();
    println!("dht_spider {}", env!("CARGO_PKG_VERSION"));
    println!();

    let logger = Arc::new(Logger::new(true));

    let output = Arc::new(OutputSink::new(
        OutputConfig {
            log_path: (!args.print_only).then(|| args.log_path.clone()),
            save_torrents: !args.print_only && args.save_torrents != 0,
            torrent_dir: PathBuf::from("BT"),
        },
        Arc::clone(&logger),
    )?);

    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            max_workers: args.threads.max(1),
            ..DispatcherConfig::default()
        },
        output,
        Arc::clone(&logger),
    );
    dispatcher.start();

    let sink: Arc<dyn InfohashSink> = dispatcher;
    let dht = DhtNode::spawn(DhtConfig::default(), sink, Arc::clone(&logger))?;
    logger.info(&format!("receiving datagrams on {}", dht.local_addr()));

    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    // Outstanding workers are abandoned; just leave the terminal usable.
    logger.restore();
    logger.line("[EXIT] shutting down");
    Ok(())
}
