//! Static catalog of flow types.
//!
//! A [`FlowTypeConfig`] declares the ordered phase list and capability flags
//! for one flow type; the [`FlowRegistry`] is a pure lookup over those
//! configs. The registry holds no mutable state: it is built once (usually
//! from [`FlowRegistry::standard`] or the builder) and shared behind an
//! `Arc` by the orchestrator.
//!
//! # Examples
//!
//! ```rust
//! use flowline::registry::FlowRegistry;
//!
//! let registry = FlowRegistry::standard();
//! let discovery = registry.resolve("discovery").unwrap();
//! assert_eq!(discovery.phase_names()[0], "validate");
//! assert!(registry.resolve("no-such-flow").is_err());
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::time::Duration;
use thiserror::Error;

/// Retry policy for one phase.
///
/// Timeouts are treated as transient failures and consume one attempt;
/// a fatal executor error short-circuits the remaining budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Wall-clock budget for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries (one attempt).
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Declaration of one phase within a flow type.
///
/// Built fluently:
///
/// ```rust
/// use flowline::registry::{PhaseDef, RetryPolicy};
/// use std::time::Duration;
///
/// let phase = PhaseDef::new("map_fields")
///     .pausable()
///     .requires("mappings")
///     .with_retry(RetryPolicy { max_attempts: 2, timeout: Duration::from_secs(60) });
/// assert!(phase.pausable);
/// ```
#[derive(Clone, Debug)]
pub struct PhaseDef {
    /// Phase name, unique within its flow type.
    pub name: String,
    /// Inputs that must be present in the merged state before execution
    /// (for pausable phases this doubles as the resume-input schema).
    pub required_inputs: Vec<String>,
    /// Inputs the executor may use when present.
    pub optional_inputs: Vec<String>,
    /// Whether this phase may park the flow awaiting user input.
    pub pausable: bool,
    /// Whether an upstream signal may skip this phase.
    pub skippable: bool,
    /// Retry budget and per-attempt timeout.
    pub retry: RetryPolicy,
    /// Non-empty for a parallel node: branch phases executed concurrently,
    /// fanned in only once all report success.
    pub fan_out: Vec<String>,
}

impl PhaseDef {
    /// A sequential phase with default retry policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_inputs: Vec::new(),
            optional_inputs: Vec::new(),
            pausable: false,
            skippable: false,
            retry: RetryPolicy::default(),
            fan_out: Vec::new(),
        }
    }

    /// A parallel node whose branches run concurrently.
    pub fn parallel(
        name: impl Into<String>,
        branches: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            fan_out: branches.into_iter().map(Into::into).collect(),
            ..Self::new(name)
        }
    }

    /// Mark this phase as allowed to pause the flow for user input.
    #[must_use]
    pub fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }

    /// Mark this phase as skippable on an upstream signal.
    #[must_use]
    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    /// Add a required input key.
    #[must_use]
    pub fn requires(mut self, input: impl Into<String>) -> Self {
        self.required_inputs.push(input.into());
        self
    }

    /// Add an optional input key.
    #[must_use]
    pub fn accepts(mut self, input: impl Into<String>) -> Self {
        self.optional_inputs.push(input.into());
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether this is a fan-out node.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        !self.fan_out.is_empty()
    }
}

/// Declaration of one flow type: ordered phases plus capability flags.
#[derive(Clone, Debug)]
pub struct FlowTypeConfig {
    /// Flow type name, the registry key.
    pub flow_type: String,
    /// Phases in declared execution order.
    pub phases: Vec<PhaseDef>,
    /// Whether paused flows of this type may be resumed.
    pub resumable: bool,
    /// Whether flows of this type honor cooperative cancellation.
    pub cancellable: bool,
}

impl FlowTypeConfig {
    /// A resumable, cancellable flow type.
    pub fn new(flow_type: impl Into<String>, phases: Vec<PhaseDef>) -> Self {
        Self {
            flow_type: flow_type.into(),
            phases,
            resumable: true,
            cancellable: true,
        }
    }

    /// Look up a phase definition by name.
    #[must_use]
    pub fn phase(&self, name: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Position of a phase in the declared order.
    #[must_use]
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Phase names in declared order.
    #[must_use]
    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Pure lookup over flow type configurations.
#[derive(Clone, Debug, Default)]
pub struct FlowRegistry {
    configs: FxHashMap<String, FlowTypeConfig>,
}

impl FlowRegistry {
    /// An empty registry; use [`builder`](Self::builder) to populate it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a custom catalog.
    #[must_use]
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder {
            registry: Self::new(),
        }
    }

    /// The built-in catalog of analysis flow types.
    #[must_use]
    pub fn standard() -> Self {
        Self::builder()
            .register(FlowTypeConfig::new(
                "discovery",
                vec![
                    PhaseDef::new("validate").with_retry(RetryPolicy::none()),
                    PhaseDef::new("map_fields").pausable().requires("mappings"),
                    PhaseDef::new("cleanse").skippable(),
                    PhaseDef::new("build_inventory"),
                ],
            ))
            .register(FlowTypeConfig::new(
                "data_collection",
                vec![
                    PhaseDef::new("plan_collection"),
                    PhaseDef::parallel("collect", ["pull_documents", "pull_systems"]),
                    PhaseDef::new("consolidate"),
                ],
            ))
            .register(FlowTypeConfig::new(
                "assessment",
                vec![
                    PhaseDef::new("load_inventory"),
                    PhaseDef::new("score_controls"),
                    PhaseDef::new("draft_findings").pausable().requires("review"),
                    PhaseDef::new("compile_report"),
                ],
            ))
            .build()
    }

    /// Resolve a flow type configuration.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownFlowType`] when no such type is registered.
    pub fn resolve(&self, flow_type: &str) -> Result<&FlowTypeConfig, RegistryError> {
        self.configs
            .get(flow_type)
            .ok_or_else(|| RegistryError::UnknownFlowType {
                flow_type: flow_type.to_string(),
            })
    }

    /// Registered flow type names.
    #[must_use]
    pub fn flow_types(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }
}

/// Builder for a [`FlowRegistry`].
#[derive(Debug)]
pub struct FlowRegistryBuilder {
    registry: FlowRegistry,
}

impl FlowRegistryBuilder {
    /// Register a flow type; a later registration with the same name wins.
    #[must_use]
    pub fn register(mut self, config: FlowTypeConfig) -> Self {
        self.registry
            .configs
            .insert(config.flow_type.clone(), config);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> FlowRegistry {
        self.registry
    }
}

/// Errors raised by registry lookups.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    /// The requested flow type is not in the catalog.
    #[error("unknown flow type: {flow_type}")]
    #[diagnostic(
        code(flowline::registry::unknown_flow_type),
        help("Register the flow type on the FlowRegistry before creating flows of it.")
    )]
    UnknownFlowType { flow_type: String },
}
