use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Run a notification server
    Serve {
        #[clap(long, default_value = "127.0.0.1:6470")]
        bind: String,
        /// Path of the event database; volatile storage when omitted
        #[clap(long)]
        db: Option<std::path::PathBuf>,
        /// Join (or form) an HA group over the shared store
        #[clap(long)]
        ha: bool,
        /// Uri peers and clients should use to reach this server; defaults
        /// to the bind address
        #[clap(long)]
        server_uri: Option<String>,
        #[clap(long, default_value = "1000")]
        heartbeat_ms: u64,
        /// Heartbeat TTL; must be at least twice the heartbeat interval
        #[clap(long)]
        ttl_ms: Option<u64>,
    },
    /// Send one event
    Send {
        #[command(flatten)]
        conn: ConnOpts,
        #[clap(long)]
        key: String,
        #[clap(long, default_value = "")]
        value: String,
        #[clap(long)]
        event_type: Option<String>,
        #[clap(long)]
        namespace: Option<String>,
        #[clap(long)]
        sender: Option<String>,
        #[clap(long)]
        context: Option<String>,
    },
    /// List events matching a filter
    List {
        #[command(flatten)]
        conn: ConnOpts,
        /// Keys to match; repeatable; "*" or absent means any
        #[clap(long)]
        key: Vec<String>,
        /// Exclusive lower version bound
        #[clap(long, default_value = "0")]
        version: u64,
        #[clap(long)]
        event_type: Option<String>,
        #[clap(long)]
        namespace: Option<String>,
        #[clap(long)]
        sender: Option<String>,
    },
    /// Stream events as JSON lines until interrupted
    Listen {
        #[command(flatten)]
        conn: ConnOpts,
        #[clap(long)]
        key: Vec<String>,
        /// Exclusive lower version bound
        #[clap(long)]
        version: Option<u64>,
        /// Inclusive lower bound on create_time (epoch ms); defaults to now
        #[clap(long)]
        start_time: Option<u64>,
        #[clap(long)]
        event_type: Option<String>,
        #[clap(long)]
        namespace: Option<String>,
        #[clap(long)]
        sender: Option<String>,
    },
    /// Show the HA membership as seen by a server
    Members {
        #[command(flatten)]
        conn: ConnOpts,
    },
}

#[derive(Debug, Args)]
pub struct ConnOpts {
    #[clap(long, default_value = "127.0.0.1:6470")]
    pub server: String,
    /// Chase the leader across an HA group
    #[clap(long)]
    pub ha: bool,
    #[clap(long)]
    pub default_namespace: Option<String>,
    #[clap(long)]
    pub default_sender: Option<String>,
}
