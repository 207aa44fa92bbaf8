use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Issue block requests against a replication backend")]
pub struct Cli {
    /// Backend address. Overrides the config file.
    #[arg(long)]
    pub server: Option<String>,

    /// JSON file with client and session settings.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Send EPOCH_TIMER at this interval while the command runs.
    #[arg(long)]
    pub epoch_interval_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read sectors and print them as hex.
    Read(RangeArgs),
    /// Fill sectors with one byte value.
    Write(WriteArgs),
    /// Commit the current epoch and wait for the acknowledgment.
    Commit(CommitArgs),
    /// Send one epoch timer tick.
    Tick,
    /// Send a fault-tolerance notification.
    NotifyFt,
}

#[derive(Args, Debug, Clone)]
pub struct RangeArgs {
    /// First sector.
    #[arg(long)]
    pub sector: i64,

    /// Number of 512 byte sectors.
    #[arg(long, default_value_t = 1)]
    pub count: i32,
}

#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Byte value written to every position.
    #[arg(long, default_value_t = 0)]
    pub fill: u8,

    /// Commit the epoch after writing.
    #[arg(long)]
    pub commit: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CommitArgs {
    /// How long to wait for COMMIT_ACK.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_with_flattened_range() {
        let cli = Cli::try_parse_from([
            "blkctl", "--server", "127.0.0.1:9000", "write", "--sector", "8", "--count", "2",
            "--fill", "255", "--commit",
        ])
        .expect("valid arguments");

        assert_eq!(cli.server.as_deref(), Some("127.0.0.1:9000"));
        match cli.command {
            Command::Write(args) => {
                assert_eq!(args.range.sector, 8);
                assert_eq!(args.range.count, 2);
                assert_eq!(args.fill, 255);
                assert!(args.commit);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn commit_timeout_has_default() {
        let cli = Cli::try_parse_from(["blkctl", "commit"]).expect("valid arguments");
        assert!(matches!(cli.command, Command::Commit(CommitArgs { timeout_ms: 5000 })));
    }
}
