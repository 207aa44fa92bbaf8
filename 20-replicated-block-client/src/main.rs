use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use replicated_block_client::{
    cli::{Cli, Command},
    config::ClientConfig,
    protocol::SECTOR_SIZE,
    runtime::{self, ClientHandle},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = cli.server {
        config.server = server;
    }
    if cli.epoch_interval_ms.is_some() {
        config.epoch_interval_ms = cli.epoch_interval_ms;
    }

    // Commit acks are awaited through the handle; the notification stream is
    // not needed here.
    let (handle, _) = runtime::connect(config)?;
    let outcome = run_command(&handle, cli.command);
    let stats = handle.session().stats();
    let closed = handle.shutdown();
    info!(?stats, "done");
    outcome?;
    closed
}

fn run_command(handle: &ClientHandle, command: Command) -> Result<()> {
    match command {
        Command::Read(range) => {
            let data = handle
                .read(range.sector, range.count)
                .with_context(|| format!("read of sector {} failed", range.sector))?;
            print_hex(range.sector, &data);
        }
        Command::Write(args) => {
            let len = usize::try_from(args.range.count).context("sector count must be positive")?
                * SECTOR_SIZE;
            handle.write(args.range.sector, vec![args.fill; len])?;
            println!("wrote {} sector(s) at {}", args.range.count, args.range.sector);
            if args.commit {
                let ack = handle.commit(Duration::from_secs(5))?;
                println!("epoch {} committed", ack.epoch);
            }
        }
        Command::Commit(args) => {
            let ack = handle.commit(Duration::from_millis(args.timeout_ms))?;
            println!("epoch {} committed", ack.epoch);
        }
        Command::Tick => handle.tick()?,
        Command::NotifyFt => handle.notify_ft()?,
    }
    Ok(())
}

fn print_hex(first_sector: i64, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let offset = i * 16;
        if offset % SECTOR_SIZE == 0 {
            println!("sector {}:", first_sector + (offset / SECTOR_SIZE) as i64);
        }
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        println!("  {offset:08x}  {}", hex.join(" "));
    }
}
