use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "shardstream", about)]
pub struct Cli {
    /// Hosts config file (TOML)
    #[arg(long = "conf")]
    pub conf: String,

    /// Server id this process registers with on the replication stream
    #[arg(long = "replica-server-id", default_value_t = 99900)]
    pub replica_server_id: u32,

    /// Rolling log file prefix; empty logs to stderr
    #[arg(long = "log", default_value = "")]
    pub log_prefix: String,

    /// Log the generated SQL instead of executing it
    #[arg(long = "dry", default_value_t = false)]
    pub dry_run: bool,

    /// Batch backfill instead of tailing the binlog
    #[arg(long = "batch-model", default_value_t = false)]
    pub batch_mode: bool,

    /// Binlog start coordinate override, as FILE:POS
    #[arg(long = "bin", default_value = "")]
    pub binlog_info: String,

    /// Initial per-shard bucket capacity for the batch read
    #[arg(long = "batch-cache", default_value_t = 20_000_000)]
    pub batch_cache: usize,

    /// Checkpoint directory; required in incremental mode
    #[arg(long = "meta-dir", default_value = "")]
    pub meta_dir: String,
}
