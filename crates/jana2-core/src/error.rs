//! Error types for the event-processing engine.
//!
//! `JanaError` consolidates every error kind the engine itself can raise.
//! It does not wrap user exceptions directly — those are caught at the
//! factory/arrow boundary and re-packaged as [`JanaError::UserComponentFailure`]
//! with enough context (plugin, prefix, source name) to locate the failing
//! component without a backtrace.
//!
//! ## Error Categories
//!
//! - **Configuration** — `Configuration`, `DuplicatePrefix`, `MissingWiring`.
//!   Permanent; abort before any worker starts.
//! - **Topology** — `UnwiredPort`, `TopologyCycle`, `PortTypeMismatch`,
//!   `SourceUnreachable`. Permanent; abort before any worker starts.
//! - **Runtime** — `ResourceExhausted`, `HierarchyMismatch`, `Timeout`,
//!   `Shutdown`. `ResourceExhausted` is recovered locally by the caller
//!   (arrow returns `ComeBackLater`); the rest propagate to the supervisor.
//! - **User** — `UserComponentFailure`: the only error kind blamed on
//!   plugin code rather than the engine itself.

use thiserror::Error;

/// Convenience alias for results using the engine's error type.
pub type JanaResult<T> = std::result::Result<T, JanaError>;

/// Primary error type for the event-processing engine.
#[derive(Error, Debug)]
pub enum JanaError {
    /// A configuration value failed validation (bad type, out-of-range,
    /// unrecognized key treated as required).
    ///
    /// **Recovery**: fix configuration and restart; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two wiring entries claimed the same prefix.
    ///
    /// **Recovery**: fix the wiring file; aborts before any worker starts.
    #[error("duplicate wiring prefix: {0}")]
    DuplicatePrefix(String),

    /// A wiring entry referenced a component type with no matching
    /// registration.
    #[error("wiring entry '{prefix}' references unknown component type '{type_name}'")]
    MissingWiring {
        /// Prefix of the offending wiring entry.
        prefix: String,
        /// Component type name it asked for.
        type_name: String,
    },

    /// An arrow port was never connected to a queue or pool during wiring.
    #[error("arrow '{arrow}' has unwired {direction} port '{port}'")]
    UnwiredPort {
        /// Name of the arrow with the dangling port.
        arrow: String,
        /// `"input"` or `"output"`.
        direction: &'static str,
        /// Name of the unwired port.
        port: String,
    },

    /// Topology construction detected a cycle other than the explicitly
    /// tagged sink-to-source pool recycle edge.
    #[error("topology contains an unexpected cycle through arrow '{arrow}'")]
    TopologyCycle {
        /// One arrow on the offending cycle.
        arrow: String,
    },

    /// A source arrow's output, followed through the wired graph, never
    /// reaches any sink arrow.
    #[error("source arrow '{arrow}' does not reach any sink arrow")]
    SourceUnreachable {
        /// Name of the offending source arrow.
        arrow: String,
    },

    /// Two connected ports disagree on payload type.
    #[error("port type mismatch wiring '{from}' to '{to}': expected {expected}, found {found}")]
    PortTypeMismatch {
        /// Producer port name.
        from: String,
        /// Consumer port name.
        to: String,
        /// Type name the consumer expected.
        expected: String,
        /// Type name the producer actually offered.
        found: String,
    },

    /// A strict pool was empty and the caller could not wait.
    ///
    /// **Recovery**: recovered locally; the arrow simply reports
    /// `ComeBackLater` rather than propagating this further.
    #[error("pool for '{location_kind}' at location {location} is exhausted")]
    ResourceExhausted {
        /// What the pool holds (e.g. `"PhysicsEvent"`).
        location_kind: String,
        /// Location id that ran dry.
        location: usize,
    },

    /// User code (`Init`, `Process`, `Emit`, `Unfold`, ...) threw or
    /// returned an error.
    ///
    /// **Recovery**: the first one is latched on the supervisor and
    /// re-thrown on the main thread once shutdown completes.
    #[error("component '{prefix}' (plugin '{plugin}') failed in {entry_point} on source '{source}': {message}")]
    UserComponentFailure {
        /// Plugin the failing component came from.
        plugin: String,
        /// Configured prefix of the failing component instance.
        prefix: String,
        /// Name of the entry point that failed (`"Process"`, `"Emit"`, ...).
        entry_point: &'static str,
        /// Name of the originating event source, if known.
        source: String,
        /// The underlying message.
        message: String,
    },

    /// A `GetParent`/`ReleaseParent` call requested a level the event does
    /// not have a parent at, or the parent pointer was null.
    #[error("event has no parent at level {level:?}")]
    HierarchyMismatch {
        /// The requested, unsatisfiable level.
        level: crate::event::EventLevel,
    },

    /// An arrow's `fire` exceeded its configured wall-clock budget.
    ///
    /// **Recovery**: fatal; the worker logs a backtrace and requests stop.
    #[error("arrow '{arrow}' exceeded its {limit_ms}ms fire timeout")]
    Timeout {
        /// Name of the offending arrow.
        arrow: String,
        /// The configured limit, in milliseconds.
        limit_ms: u64,
    },

    /// Cooperative termination was requested while this call was in
    /// flight.
    #[error("shutdown requested")]
    Shutdown,

    /// Wraps a TOML wiring-file parse failure.
    #[error("wiring file error: {0}")]
    Wiring(#[from] toml::de::Error),

    /// Wraps a `config` crate parameter-provider error.
    #[error("parameter provider error: {0}")]
    Config(#[from] config::ConfigError),

    /// Wraps a standard I/O failure (e.g. reading a wiring file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
