use anyhow::{anyhow, bail, Context, Result};
use diagnostics::Programs;
use lg_core::ratelimiter::{AdmissionMode, BucketConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "lookingglass.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub trust_proxy: Option<bool>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct BucketSettings {
    pub capacity: Option<u32>,
    pub refill_per_sec: Option<f64>,
    /// `reject` or `wait`; only meaningful for the per-client bucket.
    pub mode: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LimitsConfig {
    pub client: Option<BucketSettings>,
    pub global: Option<BucketSettings>,
    pub client_idle_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RunnerConfig {
    pub timeout_secs: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub storage: Option<StorageConfig>,
    pub server: Option<ServerConfig>,
    pub limits: Option<LimitsConfig>,
    pub runner: Option<RunnerConfig>,
    pub programs: Option<Programs>,
}

/// Load `path`, or `./lookingglass.yaml` when no path is given and it exists.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(cfg))
}

/// Fully resolved settings: file values over built-in defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_path: PathBuf,
    pub bind: String,
    pub trust_proxy: bool,
    pub shutdown_grace: Duration,
    pub client_bucket: BucketConfig,
    pub client_mode: AdmissionMode,
    pub client_idle: Duration,
    pub global_bucket: BucketConfig,
    pub run_timeout: Duration,
    pub max_output_bytes: usize,
    pub programs: Programs,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            storage_path: PathBuf::from("/var/lib/lookingglass"),
            bind: "localhost:8080".into(),
            trust_proxy: false,
            shutdown_grace: Duration::from_secs(30),
            client_bucket: BucketConfig { capacity: 3, refill_per_sec: 0.2 },
            client_mode: AdmissionMode::Reject,
            client_idle: Duration::from_secs(600),
            global_bucket: BucketConfig { capacity: 5, refill_per_sec: 5.0 },
            run_timeout: Duration::from_secs(60),
            max_output_bytes: 1024 * 1024,
            programs: Programs::default(),
        }
    }
}

impl Settings {
    pub fn resolve(cfg: Option<&Config>) -> Result<Self> {
        let mut s = Settings::default();
        let Some(cfg) = cfg else { return Ok(s) };
        if let Some(st) = &cfg.storage {
            if let Some(p) = &st.path { s.storage_path = p.clone(); }
        }
        if let Some(sv) = &cfg.server {
            if let Some(b) = &sv.bind { s.bind = b.clone(); }
            if let Some(t) = sv.trust_proxy { s.trust_proxy = t; }
            if let Some(g) = sv.shutdown_grace_secs { s.shutdown_grace = Duration::from_secs(g); }
        }
        if let Some(l) = &cfg.limits {
            if let Some(c) = &l.client {
                s.client_bucket = merge_bucket(s.client_bucket, c, "limits.client")?;
                if let Some(m) = &c.mode { s.client_mode = parse_mode(m)?; }
            }
            if let Some(g) = &l.global {
                if g.mode.as_deref().is_some_and(|m| m != "wait") {
                    bail!("limits.global.mode: the global bucket always waits");
                }
                s.global_bucket = merge_bucket(s.global_bucket, g, "limits.global")?;
            }
            if let Some(i) = l.client_idle_secs {
                if i == 0 { bail!("limits.client_idle_secs must be > 0"); }
                s.client_idle = Duration::from_secs(i);
            }
            let refill = s.client_bucket.refill_per_sec;
            if refill > 0.0 {
                let full_refill = f64::from(s.client_bucket.capacity) / refill;
                if s.client_idle.as_secs_f64() + 1e-9 < full_refill {
                    bail!(
                        "limits.client_idle_secs must be at least {}s, the time limits.client takes to refill",
                        full_refill.ceil()
                    );
                }
            }
        }
        if let Some(r) = &cfg.runner {
            if let Some(t) = r.timeout_secs {
                if t == 0 { bail!("runner.timeout_secs must be > 0"); }
                s.run_timeout = Duration::from_secs(t);
            }
            if let Some(m) = r.max_output_bytes { s.max_output_bytes = m; }
        }
        if let Some(p) = &cfg.programs { s.programs = p.clone(); }
        Ok(s)
    }
}

fn merge_bucket(mut b: BucketConfig, set: &BucketSettings, name: &str) -> Result<BucketConfig> {
    if let Some(c) = set.capacity {
        if c == 0 { bail!("{name}.capacity must be > 0"); }
        b.capacity = c;
    }
    if let Some(r) = set.refill_per_sec {
        // 0 disables the bucket
        if !r.is_finite() || r < 0.0 { bail!("{name}.refill_per_sec must be a non-negative number"); }
        b.refill_per_sec = r;
    }
    Ok(b)
}

fn parse_mode(s: &str) -> Result<AdmissionMode> {
    match s {
        "reject" => Ok(AdmissionMode::Reject),
        "wait" => Ok(AdmissionMode::Wait),
        other => Err(anyhow!("unknown limiter mode {other:?}, expected reject or wait")),
    }
}
