//! Process-wide agent lifecycle: one instance per process, constructed by
//! `init`, torn down by `cleanup`. Between those calls, multiple threads
//! may read the lookup index concurrently; only the fault-handler thread
//! writes to statistics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::Config;
use crate::fault::{FaultHandler, FaultHandlerConfig};
use crate::loader::Loader;
use crate::mapping::{self, MmapDecision, MmapStats};
use crate::warmup;

static ACTIVE_AGENT: OnceLock<Mutex<Option<Arc<Agent>>>> = OnceLock::new();

fn active_slot() -> &'static Mutex<Option<Arc<Agent>>> {
    ACTIVE_AGENT.get_or_init(|| Mutex::new(None))
}

/// Aggregate statistics surfaced by `cleanup` and by the CLI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStats {
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub total_faults: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub zero_fills: u64,
    pub kernel_errors: u64,
    pub mmap_intercepted: u64,
    pub mmap_bypassed: u64,
}

/// The process-wide resident object orchestrating the loader, the fault
/// handler, and the registered-region façade.
pub struct Agent {
    config: Config,
    loader: Option<Arc<Loader>>,
    handler: Mutex<Option<FaultHandler>>,
    enabled: AtomicBool,
    mmap_stats: MmapStats,
}

impl Agent {
    /// Idempotent under the process-wide lock: reads environment and
    /// optional config file, loads the bundle, warms it up, and starts a
    /// high-priority fault handler. If any step after the loader is
    /// constructed fails, partial state is torn down and the agent is
    /// marked disabled; `is_enabled` then returns `false` rather than the
    /// call returning an error, matching the "disabled is indistinguishable
    /// from no acceleration" contract in the error design.
    pub fn init() -> Arc<Agent> {
        let mut slot = active_slot().lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let config = Config::discover();
        let agent = Arc::new(Self::init_with_config(config));
        *slot = Some(agent.clone());
        agent
    }

    fn init_with_config(config: Config) -> Agent {
        if !config.enabled {
            tracing::info!("BigCache agent disabled by configuration");
            return Agent {
                config,
                loader: None,
                handler: Mutex::new(None),
                enabled: AtomicBool::new(false),
                mmap_stats: MmapStats::default(),
            };
        }

        let loader = match Loader::load(&config.bundle_path) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                tracing::warn!(error = %e, path = %config.bundle_path.display(), "failed to load bundle; agent disabled");
                return Agent {
                    config,
                    loader: None,
                    handler: Mutex::new(None),
                    enabled: AtomicBool::new(false),
                    mmap_stats: MmapStats::default(),
                };
            }
        };

        let warm_report = warmup::warm_blob(&loader);
        tracing::info!(
            pages = warm_report.pages_touched,
            failed = warm_report.pages_failed,
            "blob warm-up complete"
        );

        let handler_config = FaultHandlerConfig {
            zero_fill: true,
            high_priority: true,
        };
        let mut handler = match FaultHandler::new(loader.clone(), handler_config) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create fault handler; agent disabled");
                return Agent {
                    config,
                    loader: Some(loader),
                    handler: Mutex::new(None),
                    enabled: AtomicBool::new(false),
                    mmap_stats: MmapStats::default(),
                };
            }
        };
        if let Err(e) = handler.start() {
            tracing::warn!(error = %e, "failed to start fault handler; agent disabled");
            return Agent {
                config,
                loader: Some(loader),
                handler: Mutex::new(None),
                enabled: AtomicBool::new(false),
                mmap_stats: MmapStats::default(),
            };
        }

        Agent {
            config,
            loader: Some(loader),
            handler: Mutex::new(Some(handler)),
            enabled: AtomicBool::new(true),
            mmap_stats: MmapStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn loader(&self) -> Option<&Arc<Loader>> {
        self.loader.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> AgentStats {
        let (lookup_hits, lookup_misses) = self
            .loader
            .as_ref()
            .map(|l| l.stats())
            .unwrap_or((0, 0));
        let handler_guard = self.handler.lock().unwrap();
        let (total_faults, cache_hits, cache_misses, zero_fills, kernel_errors) =
            match handler_guard.as_ref() {
                Some(h) => {
                    let s = h.stats();
                    (
                        s.total_faults.get(),
                        s.cache_hits.get(),
                        s.cache_misses.get(),
                        s.zero_fills.get(),
                        s.kernel_errors.get(),
                    )
                }
                None => (0, 0, 0, 0, 0),
            };
        let (mmap_intercepted, mmap_bypassed) = self.mmap_stats.snapshot();
        AgentStats {
            lookup_hits,
            lookup_misses,
            total_faults,
            cache_hits,
            cache_misses,
            zero_fills,
            kernel_errors,
            mmap_intercepted,
            mmap_bypassed,
        }
    }

    /// The `mmap_file` hook offered to the preload shim collaborator: asks
    /// whether a would-be ordinary file mapping should be intercepted,
    /// counting the outcome in this agent's statistics. Bypasses (with the
    /// call counted, not silently dropped) when the agent has no loader.
    pub fn decide_mmap_file(&self, path: &str, offset: u64, is_private: bool) -> MmapDecision {
        match self.loader.as_ref() {
            Some(loader) => mapping::decide_mmap_file(loader, &self.mmap_stats, path, offset, is_private),
            None => {
                self.mmap_stats.bypassed.fetch_add(1, Ordering::SeqCst);
                MmapDecision::Bypassed
            }
        }
    }

    /// Stops the handler, logs final statistics, and drops the loader and
    /// handler. Clears the process-wide slot so a subsequent `init` can
    /// construct a fresh agent.
    pub fn cleanup(self: &Arc<Self>) {
        if let Some(mut handler) = self.handler.lock().unwrap().take() {
            handler.stop();
        }
        let stats = self.stats();
        tracing::info!(
            lookup_hits = stats.lookup_hits,
            lookup_misses = stats.lookup_misses,
            total_faults = stats.total_faults,
            cache_hits = stats.cache_hits,
            cache_misses = stats.cache_misses,
            zero_fills = stats.zero_fills,
            mmap_intercepted = stats.mmap_intercepted,
            mmap_bypassed = stats.mmap_bypassed,
            "BigCache agent shutting down"
        );
        let mut slot = active_slot().lock().unwrap();
        if let Some(active) = slot.as_ref() {
            if Arc::ptr_eq(active, self) {
                *slot = None;
            }
        }
    }
}

/// Returns the currently active agent, if one has been initialized in
/// this process.
pub fn current() -> Option<Arc<Agent>> {
    active_slot().lock().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::Packer;

    fn build_bundle_with_so(dir: &tempfile::TempDir) -> (std::path::PathBuf, String) {
        let source = dir.path().join("libfoo.so");
        std::fs::write(&source, [0u8; 4096]).unwrap();
        let source_str = source.to_str().unwrap().to_string();
        let mut packer = Packer::new();
        packer.add_page(&source_str, 0, 0).unwrap();
        let out = dir.path().join("bundle.bin");
        packer.build(&out).unwrap();
        (out, source_str)
    }

    #[test]
    fn disabled_by_config_reports_no_loader_and_bypasses_mmap_decisions() {
        let config = Config {
            enabled: false,
            ..Config::default()
        };
        let agent = Agent::init_with_config(config);
        assert!(!agent.is_enabled());
        assert!(agent.loader().is_none());
        assert_eq!(agent.decide_mmap_file("/whatever.so", 0, true), MmapDecision::Bypassed);
        assert_eq!(agent.stats().mmap_bypassed, 1);
        assert_eq!(agent.stats().mmap_intercepted, 0);
    }

    #[test]
    fn mmap_decisions_against_a_loaded_bundle_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (bundle_path, source) = build_bundle_with_so(&dir);
        let config = Config {
            bundle_path,
            enabled: true,
            verbosity: 1,
        };
        let agent = Agent::init_with_config(config);
        assert!(agent.loader().is_some());

        assert_eq!(
            agent.decide_mmap_file(&source, 0, true),
            MmapDecision::Intercepted
        );
        assert_eq!(
            agent.decide_mmap_file("/not/tracked.txt", 0, true),
            MmapDecision::Bypassed
        );

        let stats = agent.stats();
        assert_eq!(stats.mmap_intercepted, 1);
        assert_eq!(stats.mmap_bypassed, 1);
    }
}
