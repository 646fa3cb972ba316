//! Resolution of cluster connection configs from the environment.
//!
//! An explicit list of API server URLs, when given, is used as is. Otherwise
//! sources are tried in order: the in-cluster service account, then every
//! kubeconfig named by the colon-separated `KUBECONFIG` value (files, or
//! directories read one level deep). When nothing resolves, a local
//! `kubectl proxy` endpoint is assumed. Every failing source is logged and
//! skipped.

use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use tracing::{info, warn};

/// Endpoint of `kubectl proxy` used when no other source resolves.
pub const PROXY_FALLBACK_URL: &str = "http://localhost:8001";

/// Where to look for cluster credentials.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// Explicit API server URLs. When non-empty no other source is read.
    pub clusters: Vec<String>,
    /// Colon-separated kubeconfig files or directories.
    pub kubeconfig: Option<String>,
    /// Contexts to load from each kubeconfig; empty means the current one.
    pub contexts: Vec<String>,
    /// Skip the in-cluster service account.
    pub skip_in_cluster: bool,
}

impl DiscoveryConfig {
    /// Create a discovery config for the given `KUBECONFIG` value.
    #[must_use]
    pub fn new(kubeconfig: Option<String>) -> Self {
        Self {
            kubeconfig,
            ..Self::default()
        }
    }

    /// Serve exactly these API server URLs.
    #[must_use]
    pub fn with_clusters(mut self, clusters: Vec<String>) -> Self {
        self.clusters = clusters;
        self
    }

    /// Restrict loading to the named contexts.
    #[must_use]
    pub fn with_contexts(mut self, contexts: Vec<String>) -> Self {
        self.contexts = contexts;
        self
    }

    /// Enable or disable the in-cluster source.
    #[must_use]
    pub const fn with_in_cluster(mut self, enabled: bool) -> Self {
        self.skip_in_cluster = !enabled;
        self
    }
}

/// Resolve every reachable cluster config.
///
/// Never returns an empty list: falls back to [`PROXY_FALLBACK_URL`].
pub async fn discover(config: &DiscoveryConfig) -> Vec<Config> {
    let mut configs = if config.clusters.is_empty() {
        discover_environment(config).await
    } else {
        static_configs(&config.clusters)
    };

    if configs.is_empty() {
        info!(url = PROXY_FALLBACK_URL, "no configs found, falling back to kubectl proxy");
        match PROXY_FALLBACK_URL.parse() {
            Ok(url) => configs.push(Config::new(url)),
            Err(e) => warn!(error = %e, "invalid proxy fallback url"),
        }
    }

    configs
}

/// Unauthenticated configs for explicit API server URLs, in the given order.
fn static_configs(urls: &[String]) -> Vec<Config> {
    let mut configs = Vec::with_capacity(urls.len());
    for url in urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        match url.parse() {
            Ok(uri) => {
                info!(url = %url, "using static cluster url");
                configs.push(Config::new(uri));
            }
            Err(e) => warn!(url = %url, error = %e, "invalid cluster url, skipping"),
        }
    }
    configs
}

async fn discover_environment(config: &DiscoveryConfig) -> Vec<Config> {
    let mut configs = Vec::new();

    if !config.skip_in_cluster {
        match tokio::task::spawn_blocking(Config::incluster).await {
            Ok(Ok(c)) => configs.push(c),
            Ok(Err(e)) => info!(error = %e, "unable to read in-cluster config"),
            Err(e) => warn!(error = %e, "in-cluster config task failed"),
        }
    }

    if let Some(kubeconfig) = config.kubeconfig.clone().filter(|v| !v.is_empty()) {
        let files = match tokio::task::spawn_blocking(move || read_kubeconfigs(&kubeconfig)).await
        {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "kubeconfig reading task failed");
                Vec::new()
            }
        };
        for (path, kubeconfig) in files {
            configs.extend(load_kubeconfig(&path, kubeconfig, &config.contexts).await);
        }
    }

    configs
}

/// Expand a `KUBECONFIG` value into individual files.
///
/// Entries keep their `KUBECONFIG` order, files within one directory are
/// sorted by name, and a path listed twice is kept at its first position.
#[must_use]
pub fn kubeconfig_candidates(kubeconfig: &str) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    };

    for entry in kubeconfig.split(':').filter(|e| !e.is_empty()) {
        let path = Path::new(entry);
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => match std::fs::read_dir(path) {
                Ok(dir) => {
                    let mut files: Vec<PathBuf> = Vec::new();
                    for item in dir.flatten() {
                        let item_path = item.path();
                        if item_path.is_dir() {
                            info!(path = %item_path.display(), "not walking subdirectory");
                        } else {
                            files.push(item_path);
                        }
                    }
                    files.sort();
                    files.into_iter().for_each(&mut push);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "unable to walk directory"),
            },
            Ok(_) => push(path.to_path_buf()),
            Err(e) => warn!(path = %path.display(), error = %e, "unable to read config candidate"),
        }
    }

    candidates
}

/// Read and parse every candidate file. Runs on the blocking pool.
fn read_kubeconfigs(kubeconfig: &str) -> Vec<(PathBuf, Kubeconfig)> {
    kubeconfig_candidates(kubeconfig)
        .into_iter()
        .filter_map(|path| match Kubeconfig::read_from(&path) {
            Ok(parsed) => Some((path, parsed)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to parse kubeconfig");
                None
            }
        })
        .collect()
}

/// Load the configs a single kubeconfig file yields.
async fn load_kubeconfig(path: &Path, kubeconfig: Kubeconfig, contexts: &[String]) -> Vec<Config> {
    let selected: Vec<Option<String>> = if contexts.is_empty() {
        vec![None]
    } else {
        kubeconfig
            .contexts
            .iter()
            .filter(|named| contexts.contains(&named.name))
            .map(|named| Some(named.name.clone()))
            .collect()
    };

    let mut configs = Vec::with_capacity(selected.len());
    for context in selected {
        let options = KubeConfigOptions {
            context: context.clone(),
            ..KubeConfigOptions::default()
        };
        match Config::from_custom_kubeconfig(kubeconfig.clone(), &options).await {
            Ok(config) => {
                info!(
                    path = %path.display(),
                    context = context.as_deref().unwrap_or("<current>"),
                    url = %config.cluster_url,
                    "loaded cluster config"
                );
                configs.push(config);
            }
            Err(e) => warn!(
                path = %path.display(),
                context = context.as_deref().unwrap_or("<current>"),
                error = %e,
                "unable to build client config"
            ),
        }
    }
    configs
}
