//! Parameter provider: the engine's view of its configuration surface.
//!
//! The CLI, parameter parsing, and wiring-file loading are external
//! collaborators; this module only defines the narrow contract the engine
//! consumes from them — a typed key/value lookup plus the handful of
//! derived values (thread count, pool sizing, affinity/locality) that
//! depend on more than a single raw key.

use std::path::PathBuf;

use config::Config;
use serde::{Deserialize, Serialize};

use crate::error::JanaResult;

/// CPU affinity strategy for worker pinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Affinity {
    /// No pinning.
    None,
    /// Favor spreading across fewer hyperthreads per core.
    ComputeBound,
    /// Favor spreading across fewer NUMA domains.
    MemoryBound,
}

/// Queue/pool locality strategy for worker placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locality {
    /// No locality preference; any worker may use any location.
    Global,
    /// Workers share a location per CPU socket.
    SocketLocal,
    /// Workers share a location per NUMA domain.
    NumaDomainLocal,
    /// Workers share a location per physical core.
    CoreLocal,
    /// Each worker is its own location.
    CpuLocal,
}

/// Resolved engine parameters, after applying defaults and the
/// `"Ncores"` special case for `nthreads`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    /// Desired worker count.
    pub nthreads: usize,
    /// Per-source event bound (`jana:nevents`), `None` for unbounded.
    pub nevents: Option<u64>,
    /// Per-source skip count (`jana:nskip`).
    pub nskip: u64,
    /// Per-location event pool size (`jana:event_pool_size`).
    pub event_pool_size: usize,
    /// Soft queue capacity before arrows are told to back off.
    pub event_queue_threshold: usize,
    /// Max events a source arrow pulls per `fire`.
    pub event_source_chunksize: usize,
    /// Max events a sink arrow processes per `fire`.
    pub event_processor_chunksize: usize,
    /// CPU affinity strategy.
    pub affinity: Affinity,
    /// Queue/pool locality strategy.
    pub locality: Locality,
    /// Whether idle workers may steal from other locations.
    pub enable_stealing: bool,
    /// Status ticker interval.
    pub ticker_interval_ms: u64,
    /// Whether to print the extended per-arrow report on exit.
    pub extended_report: bool,
    /// Whether arrow-fire wall-clock timeouts are enforced.
    pub timeout_enabled: bool,
    /// Optional path to a TOML wiring file.
    pub wiring_file: Option<PathBuf>,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            nthreads: 1,
            nevents: None,
            nskip: 0,
            event_pool_size: 16,
            event_queue_threshold: 80,
            event_source_chunksize: 16,
            event_processor_chunksize: 16,
            affinity: Affinity::None,
            locality: Locality::Global,
            enable_stealing: false,
            ticker_interval_ms: 1000,
            extended_report: false,
            timeout_enabled: false,
            wiring_file: None,
        }
    }
}

/// Narrow contract the engine needs from whatever loads configuration.
///
/// Implementors typically wrap a `config::Config` populated from CLI
/// flags, environment variables, and config files (in that precedence
/// order) — assembling that stack is outside this crate's scope.
pub trait ParameterProvider: Send + Sync {
    /// Resolve every recognized engine key into an [`EngineParams`],
    /// applying defaults for anything unset.
    fn engine_params(&self) -> JanaResult<EngineParams>;
}

/// A [`ParameterProvider`] backed directly by a `config::Config`.
pub struct TomlParameterProvider {
    config: Config,
}

impl TomlParameterProvider {
    /// Wrap an already-built `config::Config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn nthreads(&self) -> JanaResult<usize> {
        match self.config.get_string("nthreads") {
            Ok(s) if s.eq_ignore_ascii_case("ncores") => {
                Ok(std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
            }
            Ok(s) => Ok(s.parse().unwrap_or(1)),
            Err(_) => match self.config.get_int("nthreads") {
                Ok(n) => Ok(n.max(1) as usize),
                Err(_) => Ok(EngineParams::default().nthreads),
            },
        }
    }
}

impl ParameterProvider for TomlParameterProvider {
    fn engine_params(&self) -> JanaResult<EngineParams> {
        let defaults = EngineParams::default();
        Ok(EngineParams {
            nthreads: self.nthreads()?,
            nevents: self.config.get_int("jana:nevents").ok().map(|n| n as u64),
            nskip: self
                .config
                .get_int("jana:nskip")
                .map(|n| n as u64)
                .unwrap_or(defaults.nskip),
            event_pool_size: self
                .config
                .get_int("jana:event_pool_size")
                .map(|n| n as usize)
                .unwrap_or(defaults.event_pool_size),
            event_queue_threshold: self
                .config
                .get_int("jana:event_queue_threshold")
                .map(|n| n as usize)
                .unwrap_or(defaults.event_queue_threshold),
            event_source_chunksize: self
                .config
                .get_int("jana:event_source_chunksize")
                .map(|n| n as usize)
                .unwrap_or(defaults.event_source_chunksize),
            event_processor_chunksize: self
                .config
                .get_int("jana:event_processor_chunksize")
                .map(|n| n as usize)
                .unwrap_or(defaults.event_processor_chunksize),
            affinity: match self.config.get_int("jana:affinity") {
                Ok(1) => Affinity::ComputeBound,
                Ok(2) => Affinity::MemoryBound,
                _ => defaults.affinity,
            },
            locality: match self.config.get_int("jana:locality") {
                Ok(1) => Locality::SocketLocal,
                Ok(2) => Locality::NumaDomainLocal,
                Ok(3) => Locality::CoreLocal,
                Ok(4) => Locality::CpuLocal,
                _ => defaults.locality,
            },
            enable_stealing: self
                .config
                .get_bool("jana:enable_stealing")
                .unwrap_or(defaults.enable_stealing),
            ticker_interval_ms: self
                .config
                .get_int("jana:ticker_interval_ms")
                .map(|n| n as u64)
                .unwrap_or(defaults.ticker_interval_ms),
            extended_report: self
                .config
                .get_bool("jana:extended_report")
                .unwrap_or(defaults.extended_report),
            timeout_enabled: self
                .config
                .get_bool("jana:timeout_enabled")
                .unwrap_or(defaults.timeout_enabled),
            wiring_file: self
                .config
                .get_string("jana:wiring_file")
                .ok()
                .map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn provider_from_toml(toml: &str) -> TomlParameterProvider {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        TomlParameterProvider::new(config)
    }

    #[test]
    fn defaults_apply_when_unset() {
        let provider = provider_from_toml("");
        let params = provider.engine_params().unwrap();
        assert_eq!(params, EngineParams::default());
    }

    #[test]
    fn ncores_resolves_to_available_parallelism() {
        let provider = provider_from_toml("nthreads = \"Ncores\"");
        let params = provider.engine_params().unwrap();
        assert!(params.nthreads >= 1);
    }

    #[test]
    fn nskip_and_nevents_parse_as_bounds() {
        let provider = provider_from_toml(
            r#"
            "jana:nskip" = 30
            "jana:nevents" = 20
            "#,
        );
        let params = provider.engine_params().unwrap();
        assert_eq!(params.nskip, 30);
        assert_eq!(params.nevents, Some(20));
    }

    #[test]
    fn affinity_and_locality_map_from_integers() {
        let provider = provider_from_toml(
            r#"
            "jana:affinity" = 1
            "jana:locality" = 3
            "#,
        );
        let params = provider.engine_params().unwrap();
        assert_eq!(params.affinity, Affinity::ComputeBound);
        assert_eq!(params.locality, Locality::CoreLocal);
    }
}
