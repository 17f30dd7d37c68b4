//! Worker-group lifecycle: the boundary an external control plane drives.
//!
//! A [`WorkloadSpec`] is a named, typed workload descriptor. Spawning one
//! yields a [`WorkerGroup`] that can be updated in place — the replacement
//! config is broadcast to the running workers, who adopt it at their next
//! pacing boundary without reconnecting — or shut down gracefully, draining
//! every worker and returning the merged stats. The HTTP (or other) surface
//! that feeds descriptors in lives outside this crate.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{Client, RespCode};
use crate::error::{McError, Result};
use crate::keygen;
use crate::limiter::Limiter;
use crate::stats::Stats;
use crate::workload::{generate_entries, CacheEntry, Config, Worker};
use crate::zipf::ZipfSampler;

/// A get-heavy soak workload: read a random key, refill it on miss, with an
/// optional slice of deletes, paced by sleeping between request bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    pub servers: Vec<String>,
    pub socket: String,
    pub pipelines: u32,
    pub strip_key_prefix: bool,
    pub conn_count: usize,
    /// Requests issued back-to-back before each sleep.
    pub requests_per_sleep: u32,
    /// Bundles before the worker retires; -1 to run until stopped.
    pub request_bundles_per_conn: i64,
    pub sleep_per_bundle_ms: u64,
    /// Deletes per thousand requests.
    pub delete_percent: i64,
    pub key_length: usize,
    pub key_prefix: String,
    pub key_space: usize,
    pub key_ttl: u32,
    pub use_zipf: bool,
    pub zipf_s: f64,
    pub zipf_v: f64,
    pub value_size: usize,
    pub client_flags: u32,
}

impl Default for BasicConfig {
    fn default() -> Self {
        BasicConfig {
            servers: vec!["127.0.0.1:11211".to_string()],
            socket: String::new(),
            pipelines: 1,
            strip_key_prefix: false,
            conn_count: 1,
            requests_per_sleep: 1,
            request_bundles_per_conn: -1,
            sleep_per_bundle_ms: 1,
            delete_percent: 0,
            key_length: 10,
            key_prefix: "mcblast:".to_string(),
            key_space: 1000,
            key_ttl: 180,
            use_zipf: false,
            zipf_s: 1.01,
            zipf_v: 500.0,
            value_size: 1000,
            client_flags: 0,
        }
    }
}

impl BasicConfig {
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
        Ok(())
    }

    fn build_client(&self) -> Result<Client> {
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
}

/// The closed set of workload kinds the engine can run, each carrying its
/// own strongly-typed config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkloadSpec {
    Basic(BasicConfig),
    RateControlled(Config),
}

impl WorkloadSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkloadSpec::Basic(_) => "basic",
            WorkloadSpec::RateControlled(_) => "ratecontrolled",
        }
    }

    pub fn conn_count(&self) -> usize {
        match self {
            WorkloadSpec::Basic(cfg) => cfg.conn_count,
            WorkloadSpec::RateControlled(conf) => conf.conn_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            WorkloadSpec::Basic(cfg) => cfg.validate(),
            WorkloadSpec::RateControlled(conf) => conf.validate(),
        }
    }

    /// An example descriptor for `kind`, the shape `show` prints for
    /// operators to start from.
    pub fn example(kind: &str) -> Option<WorkloadSpec> {
        match kind {
            "basic" => Some(WorkloadSpec::Basic(BasicConfig::default())),
            "rate" | "ratecontrolled" => Some(WorkloadSpec::RateControlled(Config::default())),
            _ => None,
        }
    }

    /// Parse a descriptor from JSON, e.g. one read from a file or stdin.
    pub fn from_json(data: &str) -> Result<WorkloadSpec> {
        serde_json::from_str(data).map_err(|err| McError::Config(err.to_string()))
    }
}

/// Everything the workers of one group share. Rebuilt wholesale on update so
/// a worker adopts the new entries/limiter/config as one unit.
struct GroupState {
    spec: WorkloadSpec,
    entries: Arc<Vec<CacheEntry>>,
    limiter: Arc<Limiter>,
}

impl GroupState {
    fn build(spec: WorkloadSpec) -> Result<Arc<GroupState>> {
        spec.validate()?;
        let (entries, limiter) = match &spec {
            WorkloadSpec::RateControlled(conf) => (
                Arc::new(generate_entries(conf)),
                Arc::new(Limiter::new(conf.rps)),
            ),
            WorkloadSpec::Basic(_) => (Arc::new(Vec::new()), Arc::new(Limiter::new(0))),
        };
        Ok(Arc::new(GroupState {
            spec,
            entries,
            limiter,
        }))
    }
}

/// A running, named group of workers.
pub struct WorkerGroup {
    name: String,
    tx: watch::Sender<Arc<GroupState>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<Result<Stats>>>,
}

impl WorkerGroup {
    /// Start `spec` with its configured number of workers. Connections are
    /// established lazily by each worker's first request.
    pub fn spawn(name: impl Into<String>, spec: WorkloadSpec) -> Result<WorkerGroup> {
        let name = name.into();
        let state = GroupState::build(spec)?;
        let conn_count = state.spec.conn_count();
        let (tx, rx) = watch::channel(Arc::clone(&state));
        let cancel = CancellationToken::new();

        let mut handles = Vec::with_capacity(conn_count);
        for index in 0..conn_count {
            let rx = rx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(group_worker(index, rx, cancel)));
        }
        info!(name = %name, workers = conn_count, "workload started");
        Ok(WorkerGroup {
            name,
            tx,
            cancel,
            handles,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broadcast a replacement config. Workers pick it up at their next
    /// pacing boundary, never mid-pipeline, and keep their connections. The
    /// workload kind must match the running one. The worker count is fixed
    /// at spawn time; a changed `conn_count` does not add or remove workers.
    pub fn update(&self, spec: WorkloadSpec) -> Result<()> {
        let running = self.tx.borrow().spec.kind();
        if spec.kind() != running {
            return Err(McError::Config(format!(
                "workload kind mismatch: {} is running, {} requested",
                running,
                spec.kind()
            )));
        }
        let state = GroupState::build(spec)?;
        self.tx
            .send(state)
            .map_err(|_| McError::Config("no running workers to update".into()))?;
        debug!(name = %self.name, "workload update broadcast");
        Ok(())
    }

    /// Signal shutdown and wait for every worker to drain. Returns the
    /// merged stats, or the first worker error.
    pub async fn shutdown(self) -> Result<Stats> {
        self.cancel.cancel();
        let mut totals = Stats::default();
        for handle in self.handles {
            match handle.await {
                Ok(Ok(stats)) => totals.add(&stats),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(McError::TaskFailed(err.to_string())),
            }
        }
        info!(name = %self.name, "workload stopped");
        Ok(totals)
    }
}

async fn group_worker(
    index: usize,
    mut rx: watch::Receiver<Arc<GroupState>>,
    cancel: CancellationToken,
) -> Result<Stats> {
    let state = rx.borrow_and_update().clone();
    match &state.spec {
        WorkloadSpec::RateControlled(_) => rate_worker(index, state, rx, cancel).await,
        WorkloadSpec::Basic(_) => basic_worker(index, state, rx, cancel).await,
    }
}

async fn rate_worker(
    index: usize,
    mut state: Arc<GroupState>,
    mut rx: watch::Receiver<Arc<GroupState>>,
    cancel: CancellationToken,
) -> Result<Stats> {
    let conf = match &state.spec {
        WorkloadSpec::RateControlled(conf) => Arc::new(conf.clone()),
        WorkloadSpec::Basic(_) => {
            return Err(McError::Config("spawned against the wrong workload kind".into()))
        }
    };
    let mut worker = Worker::new(
        conf,
        Arc::clone(&state.entries),
        Arc::clone(&state.limiter),
        None,
        index,
    )?;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match rx.has_changed() {
            Ok(true) => {
                state = rx.borrow_and_update().clone();
                if let WorkloadSpec::RateControlled(conf) = &state.spec {
                    worker.apply(
                        Arc::new(conf.clone()),
                        Arc::clone(&state.entries),
                        Arc::clone(&state.limiter),
                    )?;
                }
            }
            Ok(false) => {}
            // Controller dropped without a shutdown; wind down gracefully.
            Err(_) => break,
        }
        worker.step().await?;
    }
    debug!(worker = index, "rate-controlled worker finished");
    Ok(worker.take_stats())
}

async fn basic_worker(
    index: usize,
    mut state: Arc<GroupState>,
    mut rx: watch::Receiver<Arc<GroupState>>,
    cancel: CancellationToken,
) -> Result<Stats> {
    let mut cfg = match &state.spec {
        WorkloadSpec::Basic(cfg) => cfg.clone(),
        WorkloadSpec::RateControlled(_) => {
            return Err(McError::Config("spawned against the wrong workload kind".into()))
        }
    };
    let mut mc = cfg.build_client()?;
    let mut rng = SmallRng::from_entropy();
    let mut zipf = basic_zipf(&cfg)?;
    let mut stats = Stats::default();
    let mut bundles = cfg.request_bundles_per_conn;

    // -1 keeps going until the group is stopped.
    while bundles != 0 {
        if bundles > 0 {
            bundles -= 1;
        }
        for _ in 0..cfg.requests_per_sleep {
            let idx = match &zipf {
                Some(z) => z.sample(&mut rng) as usize,
                None => rng.gen_range(0..cfg.key_space),
            };
            let key = keygen::key_for(0, idx, cfg.key_length, &cfg.key_prefix);

            if cfg.delete_percent != 0 && rng.gen_range(0..1000) < cfg.delete_percent {
                match mc.delete(&key).await? {
                    RespCode::Deleted => stats.delete_hits += 1,
                    RespCode::NotFound => stats.delete_misses += 1,
                    _ => {}
                }
            } else {
                let (_flags, _value, code) = mc.get(&key).await?;
                match code {
                    RespCode::Hit => stats.get_hits += 1,
                    RespCode::Miss => {
                        stats.get_misses += 1;
                        // Refill on miss so the working set stays warm.
                        let value = keygen::value_for(&key, cfg.value_size);
                        mc.set(&key, cfg.client_flags, cfg.key_ttl, &value).await?;
                        stats.sets_total += 1;
                    }
                    _ => {}
                }
            }
        }

        // Updates and shutdown are observed between bundles, never
        // mid-pipeline.
        if cancel.is_cancelled() {
            break;
        }
        match rx.has_changed() {
            Ok(true) => {
                state = rx.borrow_and_update().clone();
                if let WorkloadSpec::Basic(new_cfg) = &state.spec {
                    cfg = new_cfg.clone();
                    zipf = basic_zipf(&cfg)?;
                    mc.set_pipelines(cfg.pipelines);
                }
            }
            Ok(false) => {}
            Err(_) => break,
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(cfg.sleep_per_bundle_ms)) => {}
        }
    }
    debug!(worker = index, "basic worker finished");
    Ok(stats)
}

fn basic_zipf(cfg: &BasicConfig) -> Result<Option<ZipfSampler>> {
    if !cfg.use_zipf {
        return Ok(None);
    }
    let imax = cfg.key_space.saturating_sub(1) as u64;
    match ZipfSampler::new(cfg.zipf_s, cfg.zipf_v, imax) {
        Some(z) => Ok(Some(z)),
        None => Err(McError::Config(format!(
            "bad zipf arguments: S: {} V: {}",
            cfg.zipf_s, cfg.zipf_v
        ))),
    }
}
