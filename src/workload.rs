//! The workload model and the load engine that replays it.
//!
//! A [`Config`] describes one test run: the keyspace shape, the
//! delete/set/get mix, the protocol variant, pacing, and the RNG seed it is
//! all derived from. [`Config::run`] materializes the keyspace, optionally
//! warms the server, fans out one worker per connection, and merges their
//! statistics into a [`Report`](crate::Report) once every worker has
//! finished. The first worker error fails the whole run and discards the
//! partial results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::binary::BinStatus;
use crate::client::{Client, Item, RespCode};
use crate::error::{McError, Result};
use crate::keygen;
use crate::limiter::Limiter;
use crate::report::Report;
use crate::stats::{LatencySampler, Stats};
use crate::zipf::ZipfSampler;

/// Which wire protocol the workers speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Text,
    Meta,
    Binary,
}

/// Parameters for one run. Immutable once the run starts; every worker
/// derives its own seed from `rng_seed` plus its index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client flag bits stored with each set.
    pub client_flags: u32,
    /// Number of concurrent connections (one worker each).
    pub conn_count: usize,
    pub del_ratio: i64,
    /// Run length in seconds; 0 runs until externally stopped.
    pub duration_secs: u64,
    pub get_ratio: i64,
    /// Random characters appended to the prefix for each key.
    pub key_length: usize,
    pub key_prefix: String,
    /// Number of unique keys to generate.
    pub key_space: usize,
    pub key_ttl: u32,
    pub meta_del_flags: String,
    pub meta_get_flags: String,
    pub meta_set_flags: String,
    /// GET requests stacked before each flush (text protocol).
    pub pipelines: u32,
    pub rng_seed: i64,
    /// Target aggregate operations/second; 0 for unlimited.
    pub rps: u32,
    pub servers: Vec<String>,
    pub set_ratio: i64,
    /// Unix domain socket path; overrides `servers` when non-empty.
    pub socket: String,
    pub strip_key_prefix: bool,
    pub protocol: Protocol,
    pub use_zipf: bool,
    /// Compare each get's value to the generated expectation.
    pub validate_gets: bool,
    pub value_size: usize,
    /// Percent of the keyspace to set before the timed phase; 0 disables.
    pub warm_percent: i64,
    /// Zipf exponent (> 1, generally 1.01-2) pulling the curve toward zero.
    pub zipf_s: f64,
    /// Zipf offset (< key_space) placing the bulk of the curve below it.
    pub zipf_v: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_flags: 0,
            conn_count: 1,
            del_ratio: 0,
            duration_secs: 0,
            get_ratio: 90,
            key_length: 10,
            key_prefix: "mcblast:".to_string(),
            key_space: 1000,
            key_ttl: 180,
            meta_del_flags: String::new(),
            meta_get_flags: "v f".to_string(),
            meta_set_flags: "T180".to_string(),
            pipelines: 1,
            rng_seed: 0,
            rps: 0,
            servers: vec!["127.0.0.1:11211".to_string()],
            set_ratio: 10,
            socket: String::new(),
            strip_key_prefix: false,
            protocol: Protocol::Text,
            use_zipf: false,
            validate_gets: false,
            value_size: 1000,
            warm_percent: 90,
            zipf_s: 1.01,
            zipf_v: 500.0,
        }
    }
}

/// A pre-generated key/value pair: warm-up payload and expected-value oracle
/// for validation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// The operation mix, in the fixed selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Delete,
    Set,
    Get,
}

/// Map a draw from `uniform(0, del+set+get)` onto an operation kind.
pub(crate) fn pick_op(draw: i64, del_ratio: i64, set_ratio: i64) -> OpKind {
    if draw < del_ratio {
        OpKind::Delete
    } else if draw < del_ratio + set_ratio {
        OpKind::Set
    } else {
        OpKind::Get
    }
}

/// Materialize the full keyspace for `conf`.
pub fn generate_entries(conf: &Config) -> Vec<CacheEntry> {
    (0..conf.key_space)
        .map(|i| {
            let key = keygen::key_for(conf.rng_seed, i, conf.key_length, &conf.key_prefix);
            let value = keygen::value_for(&key, conf.value_size);
            CacheEntry { key, value }
        })
        .collect()
}

impl Config {
    fn ratio_total(&self) -> i64 {
        self.del_ratio + self.set_ratio + self.get_ratio
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() && self.socket.is_empty() {
            return Err(McError::Config("no servers configured".into()));
        }
        if self.conn_count == 0 {
            return Err(McError::Config("conn_count must be at least 1".into()));
        }
        if self.key_space == 0 {
            return Err(McError::Config("key_space must be at least 1".into()));
        }
        if self.ratio_total() <= 0 {
            return Err(McError::Config(
                "operation ratios must sum to a positive value".into(),
            ));
        }
        if self.key_prefix.len() + self.key_length > crate::client::KEY_MAX_LEN {
            return Err(McError::Config(format!(
                "key prefix plus key length exceeds the {}-byte protocol limit",
                crate::client::KEY_MAX_LEN
            )));
        }
        Ok(())
    }

    pub(crate) fn build_client(&self) -> Result<Client> {
        let host = self.servers.first().map(String::as_str).unwrap_or("");
        let socket = (!self.socket.is_empty()).then_some(self.socket.as_str());
        Client::new(
            host,
            socket,
            self.pipelines,
            &self.key_prefix,
            self.strip_key_prefix,
        )
    }

    /// Run the workload to completion and produce the merged report.
    pub async fn run(&self) -> Result<Report> {
        self.validate()?;
        let conf = Arc::new(self.clone());
        let entries = Arc::new(generate_entries(&conf));

        if conf.warm_percent > 0 {
            warm_cache(&conf, &entries).await?;
        }

        let limiter = Arc::new(Limiter::new(conf.rps));
        let samples = std::cmp::max(1000, conf.rps as usize * conf.conn_count);
        let sampler = Arc::new(LatencySampler::with_capacity(samples));

        let deadline = (conf.duration_secs > 0).then(|| Duration::from_secs(conf.duration_secs));
        let start_time = Utc::now();
        let start = Instant::now();

        let mut handles: Vec<JoinHandle<Result<Stats>>> = Vec::with_capacity(conf.conn_count);
        for index in 0..conf.conn_count {
            let mut worker = Worker::new(
                Arc::clone(&conf),
                Arc::clone(&entries),
                Arc::clone(&limiter),
                Some(Arc::clone(&sampler)),
                index,
            )?;
            handles.push(tokio::spawn(async move { worker.run(deadline).await }));
        }

        // Wait for all; the first error wins and the partial stats are
        // discarded rather than reported as misleading results.
        let mut totals = Stats::default();
        let mut first_err: Option<McError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(stats)) => totals.add(&stats),
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(McError::TaskFailed(err.to_string()));
                    }
                }
            }
        }
        let wall = start.elapsed();
        let end_time = Utc::now();
        if let Some(err) = first_err {
            return Err(err);
        }

        if !self.validate_gets {
            totals.key_collisions = -1;
        }

        Ok(Report {
            start_time,
            end_time,
            config: self.clone(),
            metrics: sampler.metrics(wall),
            stats: totals,
        })
    }
}

/// Pre-populate `warm_percent` of the keyspace so the timed phase starts
/// against a warm server. Uses its own client and the run seed, so the
/// warmed subset is reproducible.
pub async fn warm_cache(conf: &Config, entries: &[CacheEntry]) -> Result<()> {
    let mut mc = conf.build_client()?;
    let mut rng = SmallRng::seed_from_u64(conf.rng_seed as u64);

    for entry in entries {
        if rng.gen_range(0..100) >= conf.warm_percent {
            continue;
        }
        match conf.protocol {
            Protocol::Text => {
                mc.set(&entry.key, conf.client_flags, conf.key_ttl, &entry.value)
                    .await?;
            }
            Protocol::Meta => {
                mc.meta_set(&entry.key, &conf.meta_set_flags, &entry.value).await?;
                let resp = mc.meta_receive().await?;
                if resp.code != RespCode::Hd {
                    warn!(code = ?resp.code, key = %entry.key, "warm meta set not stored");
                }
            }
            Protocol::Binary => {
                let req = Item {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    expiration: conf.key_ttl,
                    flags: conf.client_flags,
                    ..Item::default()
                };
                mc.bin_set(&req).await?;
                let mut resp = Item::default();
                mc.bin_receive(&mut resp).await?;
            }
        }
    }
    Ok(())
}

/// One load worker: an exclusive client plus its own seeded randomness.
pub(crate) struct Worker {
    conf: Arc<Config>,
    entries: Arc<Vec<CacheEntry>>,
    limiter: Arc<Limiter>,
    sampler: Option<Arc<LatencySampler>>,
    mc: Client,
    rng: SmallRng,
    zipf: Option<ZipfSampler>,
    stats: Stats,
    item: Item,
}

impl Worker {
    pub(crate) fn new(
        conf: Arc<Config>,
        entries: Arc<Vec<CacheEntry>>,
        limiter: Arc<Limiter>,
        sampler: Option<Arc<LatencySampler>>,
        index: usize,
    ) -> Result<Worker> {
        let mc = conf.build_client()?;
        // Seed-diversified per worker so workers do not retrace each other's
        // key and operation sequence.
        let worker_seed = conf
            .rng_seed
            .wrapping_add(index as i64)
            .wrapping_add(conf.key_space as i64);
        let rng = SmallRng::seed_from_u64(worker_seed as u64);
        let zipf = build_zipf(&conf)?;

        Ok(Worker {
            conf,
            entries,
            limiter,
            sampler,
            mc,
            rng,
            zipf,
            stats: Stats::default(),
            item: Item::default(),
        })
    }

    /// Replace the workload mid-flight. The connection is kept; only the
    /// workload shape changes.
    pub(crate) fn apply(
        &mut self,
        conf: Arc<Config>,
        entries: Arc<Vec<CacheEntry>>,
        limiter: Arc<Limiter>,
    ) -> Result<()> {
        self.zipf = build_zipf(&conf)?;
        self.mc.set_pipelines(conf.pipelines);
        self.conf = conf;
        self.entries = entries;
        self.limiter = limiter;
        Ok(())
    }

    /// Loop until the deadline elapses, or forever without one.
    pub(crate) async fn run(&mut self, deadline: Option<Duration>) -> Result<Stats> {
        let start = Instant::now();
        loop {
            if let Some(limit) = deadline {
                if start.elapsed() > limit {
                    break;
                }
            }
            self.step().await?;
        }
        debug!(stats = ?self.stats, "worker finished");
        Ok(std::mem::take(&mut self.stats))
    }

    /// One iteration: pick a key, pick an operation, pace, dispatch, record.
    pub(crate) async fn step(&mut self) -> Result<()> {
        let started = Instant::now();

        let index = match &self.zipf {
            Some(z) => z.sample(&mut self.rng) as usize,
            None => self.rng.gen_range(0..self.conf.key_space),
        };
        let entries = Arc::clone(&self.entries);
        let entry = &entries[index];

        let draw = self.rng.gen_range(0..self.conf.ratio_total());
        let op = pick_op(draw, self.conf.del_ratio, self.conf.set_ratio);

        self.limiter.acquire().await;
        match op {
            OpKind::Delete => self.do_delete(entry).await?,
            OpKind::Set => self.do_set(entry).await?,
            OpKind::Get => self.do_get(entry).await?,
        }

        if let Some(sampler) = &self.sampler {
            sampler.record(started.elapsed());
        }
        Ok(())
    }

    pub(crate) fn take_stats(&mut self) -> Stats {
        std::mem::take(&mut self.stats)
    }

    async fn do_delete(&mut self, entry: &CacheEntry) -> Result<()> {
        let code = match self.conf.protocol {
            Protocol::Text => self.mc.delete(&entry.key).await?,
            Protocol::Meta => {
                self.mc.meta_delete(&entry.key, &self.conf.meta_del_flags).await?;
                let resp = self.mc.meta_receive().await?;
                if resp.code != RespCode::Hd && resp.code != RespCode::Nf {
                    warn!(code = ?resp.code, "meta delete not successful");
                }
                resp.code
            }
            Protocol::Binary => {
                self.mc.bin_delete(&entry.key).await?;
                let Worker { mc, item, .. } = self;
                match mc.bin_receive(item).await {
                    Ok(_) => RespCode::Deleted,
                    Err(McError::Status(BinStatus::ItemNotFound)) => RespCode::NotFound,
                    Err(err) => return Err(err),
                }
            }
        };

        match code {
            RespCode::Deleted | RespCode::Hd => self.stats.delete_hits += 1,
            RespCode::NotFound | RespCode::Nf => self.stats.delete_misses += 1,
            _ => {}
        }
        Ok(())
    }

    async fn do_set(&mut self, entry: &CacheEntry) -> Result<()> {
        match self.conf.protocol {
            Protocol::Text => {
                self.mc
                    .set(&entry.key, self.conf.client_flags, self.conf.key_ttl, &entry.value)
                    .await?;
            }
            Protocol::Meta => {
                self.mc
                    .meta_set(&entry.key, &self.conf.meta_set_flags, &entry.value)
                    .await?;
                let resp = self.mc.meta_receive().await?;
                if resp.code != RespCode::Hd {
                    warn!(code = ?resp.code, "meta set not stored");
                }
            }
            Protocol::Binary => {
                let req = Item {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    expiration: self.conf.key_ttl,
                    flags: self.conf.client_flags,
                    ..Item::default()
                };
                self.mc.bin_set(&req).await?;
                let Worker { mc, item, .. } = self;
                mc.bin_receive(item).await?;
            }
        }
        self.stats.sets_total += 1;
        Ok(())
    }

    async fn do_get(&mut self, entry: &CacheEntry) -> Result<()> {
        // None = unclassifiable response; counted as neither hit nor miss.
        let hit: Option<Option<Vec<u8>>> = match self.conf.protocol {
            Protocol::Text => {
                let (_flags, value, code) = self.mc.get(&entry.key).await?;
                match code {
                    RespCode::Hit => Some(Some(value)),
                    RespCode::Miss => Some(None),
                    _ => None,
                }
            }
            Protocol::Meta => {
                self.mc.meta_get(&entry.key, &self.conf.meta_get_flags).await?;
                let resp = self.mc.meta_receive().await?;
                match resp.code {
                    RespCode::Va => Some(Some(resp.value)),
                    RespCode::En => Some(None),
                    _ => None,
                }
            }
            Protocol::Binary => {
                self.mc.bin_get(&entry.key).await?;
                let Worker { mc, item, .. } = self;
                match mc.bin_receive(item).await {
                    Ok(_) if !item.value.is_empty() => {
                        Some(Some(std::mem::take(&mut item.value)))
                    }
                    Ok(_) => Some(None),
                    Err(McError::Status(BinStatus::ItemNotFound)) => Some(None),
                    Err(err) => return Err(err),
                }
            }
        };

        match hit {
            Some(Some(value)) => {
                self.stats.get_hits += 1;
                if self.conf.validate_gets && value != entry.value {
                    self.stats.key_collisions += 1;
                    warn!(
                        key = %entry.key,
                        expected = %String::from_utf8_lossy(&entry.value),
                        actual = %String::from_utf8_lossy(&value),
                        "unexpected value found for key"
                    );
                }
            }
            Some(None) => self.stats.get_misses += 1,
            None => {}
        }
        Ok(())
    }
}

fn build_zipf(conf: &Config) -> Result<Option<ZipfSampler>> {
    if !conf.use_zipf {
        return Ok(None);
    }
    let imax = conf.key_space.saturating_sub(1) as u64;
    match ZipfSampler::new(conf.zipf_s, conf.zipf_v, imax) {
        Some(z) => Ok(Some(z)),
        None => Err(McError::Config(format!(
            "bad zipf arguments: S: {} V: {}",
            conf.zipf_s, conf.zipf_v
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_deterministic() {
        let conf = Config {
            key_space: 100,
            value_size: 64,
            rng_seed: 1234,
            ..Config::default()
        };
        let a = generate_entries(&conf);
        let b = generate_entries(&conf);
        assert_eq!(a.len(), 100);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.key, y.key);
            assert_eq!(x.value, y.value);
            assert!(x.key.starts_with("mcblast:"));
            assert_eq!(x.value.len(), 64);
        }
    }

    #[test]
    fn different_seeds_give_different_keyspaces() {
        let mut conf = Config {
            key_space: 10,
            ..Config::default()
        };
        conf.rng_seed = 1;
        let a = generate_entries(&conf);
        conf.rng_seed = 2;
        let b = generate_entries(&conf);
        assert_ne!(a[0].key, b[0].key);
    }

    #[test]
    fn ratio_dispatch_converges() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let (del, set, get) = (10i64, 30i64, 60i64);
        let total = del + set + get;
        let mut rng = SmallRng::seed_from_u64(99);
        let mut counts = [0u64; 3];
        let iterations = 200_000;
        for _ in 0..iterations {
            match pick_op(rng.gen_range(0..total), del, set) {
                OpKind::Delete => counts[0] += 1,
                OpKind::Set => counts[1] += 1,
                OpKind::Get => counts[2] += 1,
            }
        }
        let share = |n: u64| n as f64 / iterations as f64;
        assert!((share(counts[0]) - 0.10).abs() < 0.01);
        assert!((share(counts[1]) - 0.30).abs() < 0.01);
        assert!((share(counts[2]) - 0.60).abs() < 0.01);
    }

    #[test]
    fn ratios_need_not_sum_to_100() {
        // Weights 1/1/2: delete and set each a quarter, get half.
        assert_eq!(pick_op(0, 1, 1), OpKind::Delete);
        assert_eq!(pick_op(1, 1, 1), OpKind::Set);
        assert_eq!(pick_op(2, 1, 1), OpKind::Get);
        assert_eq!(pick_op(3, 1, 1), OpKind::Get);
    }

    #[test]
    fn validate_rejects_broken_configs() {
        let ok = Config::default();
        assert!(ok.validate().is_ok());

        let mut c = Config::default();
        c.servers.clear();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.conn_count = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.key_space = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.del_ratio = 0;
        c.set_ratio = 0;
        c.get_ratio = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.key_length = 260;
        assert!(c.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let conf = Config {
            protocol: Protocol::Meta,
            use_zipf: true,
            rps: 5000,
            ..Config::default()
        };
        let json = serde_json::to_string(&conf).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rps, 5000);
        assert_eq!(back.protocol, Protocol::Meta);
        assert!(back.use_zipf);
    }

    #[test]
    fn zipf_workers_need_valid_shape() {
        let conf = Config {
            use_zipf: true,
            zipf_s: 0.5,
            ..Config::default()
        };
        assert!(build_zipf(&conf).is_err());
    }
}
