//! mcblast CLI: one-shot load runs and example workload descriptors.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use mcblast::{Config, Protocol, WorkloadSpec};

#[derive(Parser)]
#[command(name = "mcblast")]
#[command(about = "Workload generator for memcached-compatible cache servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rate-controlled load test and print the JSON report
    Run(RunArgs),
    /// Print an example workload descriptor as JSON
    Show {
        /// Workload kind: basic or ratecontrolled
        #[arg(long, default_value = "ratecontrolled")]
        kind: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Read the full config from a JSON file instead of flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// ip:port of the cache server under test
    #[arg(long, default_value = "127.0.0.1:11211")]
    server: String,

    /// Domain socket used for connections (overrides --server)
    #[arg(long, default_value = "")]
    socket: String,

    /// Number of client connections to establish
    #[arg(long, default_value_t = 1)]
    conncount: usize,

    /// Length of the test in seconds (0 to run until interrupted)
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Protocol to speak: text, meta, or binary
    #[arg(long, default_value = "text")]
    protocol: String,

    /// Number of GET requests to stack within the same flush
    #[arg(long, default_value_t = 1)]
    pipelines: u32,

    /// Number of random characters to append to each key
    #[arg(long, default_value_t = 10)]
    keylength: usize,

    /// Prefix prepended to all generated keys
    #[arg(long, default_value = "mcblast:")]
    keyprefix: String,

    /// Number of unique keys to generate
    #[arg(long, default_value_t = 1000)]
    keyspace: usize,

    /// Proportion of requests sent as deletes
    #[arg(long, default_value_t = 0)]
    ratiodel: i64,

    /// Proportion of requests sent as gets
    #[arg(long, default_value_t = 90)]
    ratioget: i64,

    /// Proportion of requests sent as sets
    #[arg(long, default_value_t = 10)]
    ratioset: i64,

    /// Seed used when initializing the RNG (defaults to the clock)
    #[arg(long)]
    rngseed: Option<i64>,

    /// Target requests per second (0 for unlimited)
    #[arg(long, default_value_t = 0)]
    rps: u32,

    /// Remove the key prefix before comparing with response keys
    #[arg(long, default_value_t = false)]
    stripkeyprefix: bool,

    /// TTL to set with new items
    #[arg(long, default_value_t = 180)]
    ttl: u32,

    /// Compare values returned from gets to what was set
    #[arg(long, default_value_t = false)]
    validate: bool,

    /// Size of values (in bytes) to store
    #[arg(long, default_value_t = 1000)]
    valuesize: usize,

    /// Percent of keys to set before testing begins
    #[arg(long, default_value_t = 90)]
    warm: i64,

    /// (32bit unsigned) client flag bits to set on stored items
    #[arg(long, default_value_t = 0)]
    clientflags: u32,

    /// Use Zipfian instead of uniform key selection
    #[arg(long, default_value_t = false)]
    zipf: bool,

    /// Zipf S value (general pull toward zero), must be > 1.0
    #[arg(long = "zipfS", default_value_t = 1.01)]
    zipf_s: f64,

    /// Zipf V value (pull below this number)
    #[arg(long = "zipfV", default_value_t = 500.0)]
    zipf_v: f64,

    /// Flags sent with meta gets
    #[arg(long, default_value = "v f")]
    metagetflags: String,

    /// Flags sent with meta sets
    #[arg(long, default_value = "T180")]
    metasetflags: String,

    /// Flags sent with meta deletes
    #[arg(long, default_value = "")]
    metadelflags: String,
}

impl RunArgs {
    fn into_config(self) -> anyhow::Result<Config> {
        let protocol = match self.protocol.as_str() {
            "text" => Protocol::Text,
            "meta" => Protocol::Meta,
            "binary" => Protocol::Binary,
            other => bail!("unknown protocol: {other} (expected text, meta, or binary)"),
        };
        let rng_seed = match self.rngseed {
            Some(seed) => seed,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as i64,
        };
        Ok(Config {
            client_flags: self.clientflags,
            conn_count: self.conncount,
            del_ratio: self.ratiodel,
            duration_secs: self.duration,
            get_ratio: self.ratioget,
            key_length: self.keylength,
            key_prefix: self.keyprefix,
            key_space: self.keyspace,
            key_ttl: self.ttl,
            meta_del_flags: self.metadelflags,
            meta_get_flags: self.metagetflags,
            meta_set_flags: self.metasetflags,
            pipelines: self.pipelines,
            rng_seed,
            rps: self.rps,
            servers: vec![self.server],
            set_ratio: self.ratioset,
            socket: self.socket,
            strip_key_prefix: self.stripkeyprefix,
            protocol,
            use_zipf: self.zipf,
            validate_gets: self.validate,
            value_size: self.valuesize,
            warm_percent: self.warm,
            zipf_s: self.zipf_s,
            zipf_v: self.zipf_v,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Show { kind } => {
            let spec = WorkloadSpec::example(&kind)
                .with_context(|| format!("unknown workload kind: {kind}"))?;
            println!("{}", serde_json::to_string_pretty(&spec)?);
        }
        Commands::Run(args) => {
            let conf = match args.config.clone() {
                Some(path) => {
                    let data = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading config from {}", path.display()))?;
                    serde_json::from_str(&data)
                        .with_context(|| format!("parsing config from {}", path.display()))?
                }
                None => args.into_config()?,
            };
            let report = conf.run().await?;
            report.pretty_print()?;
        }
    }
    Ok(())
}
