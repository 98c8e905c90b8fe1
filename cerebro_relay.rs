//! # Cerebro Relay - Telemetry Acquisition & Normalization
//!
//! The relay sits between heterogeneous backend systems (application servers,
//! HA clusters, metric endpoints) and the Cerebro ingestion pipeline. For each
//! collection cycle it fetches a raw exposition snapshot, normalizes it into a
//! canonical record set and hands one compact JSON payload to a sink.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           CEREBRO TELEMETRY RELAY                           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SOURCE → SNAPSHOT CACHE → PARSER → FILTER → RELABEL → SUPPRESS → RECORDS   │
//! │          (single-flight)                                  ↓                 │
//! │                                                   liveness + self → SINK    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Single-flight snapshots**: concurrent cycles against the same backend
//!   share one in-flight remote call and one TTL-bounded cache entry
//! - **Exposition parsing**: lazy, restartable text exposition parser
//! - **Canonical relabeling**: enum-dispatched rewrite of vendor cluster metrics
//! - **Degradation, not abort**: every cycle yields liveness + self-identity
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::future::Future;
use std::iter::Enumerate;
use std::path::{Path, PathBuf};
use std::str::{FromStr, Lines};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};

// ----------------------------------------------------------------------------
// Futures & Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize, Serializer};

// ----------------------------------------------------------------------------
// String Optimization & Hashing
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{bail, Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, writer::BoxMakeWriter},
    layer::SubscriberExt,
    EnvFilter,
};

// ----------------------------------------------------------------------------
// Time, Networking, Patterns, Identifiers
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client as HttpClient;
use sysinfo::System as SysInfoSystem;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior of the relay. Metric and label
// names here are part of the downstream ingestion schema.
// ============================================================================

/// Relay version - follows semantic versioning
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RELAY_NAME: &str = "cerebro-relay";
pub const RELAY_FULL_NAME: &str = "Cerebro Telemetry Relay";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default lifetime of a cached remote snapshot (seconds)
pub const DEFAULT_SNAPSHOT_TTL_SECS: u64 = 5 * 60;

/// Longest snapshot lifetime accepted from configuration (seconds)
pub const MAX_SNAPSHOT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Default bound on one remote snapshot call, including all waiters (seconds)
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default trailing time window requested from a backend (seconds)
pub const DEFAULT_FETCH_WINDOW_SECS: u64 = 5 * 60;

/// Longest trailing window accepted from configuration (seconds)
pub const MAX_FETCH_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// HTTP connect timeout for exposition endpoints (seconds)
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 2;

/// HTTP request timeout for exposition endpoints (seconds)
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 5;

// ----------------------------------------------------------------------------
// Retry Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 1;
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

// ----------------------------------------------------------------------------
// Record Schema
// ----------------------------------------------------------------------------

/// Liveness metric emitted once per cycle (1 = data read, 0 = cycle failed)
pub const LIVENESS_METRIC: &str = "up";

/// Self-identity metric describing the collector instance
pub const SELF_METRIC: &str = "cerebro_relay";
pub const SELF_VERSION_LABEL: &str = "collector_version";
pub const SELF_INSTANCE_LABEL: &str = "provider_instance";

/// Metadata key carrying the local hostname
pub const HOSTNAME_METADATA_KEY: &str = "hostname";

/// Name of the remote call guarded by the snapshot cache
pub const FETCH_CALL_NAME: &str = "fetch_exposition";

/// Families whose names match this pattern are exposition runtime noise
pub const EXCLUDED_FAMILY_PATTERN: &str = r"^(?:go|promhttp|process)_";

/// Upper bound for serialized payload excerpts written to the log
pub const LOG_EXCERPT_CHARS: usize = 1000;

/// Upper bound for records included in a serialization failure report
pub const LOG_EXCERPT_RECORDS: usize = 50;

// ----------------------------------------------------------------------------
// Cluster Metric Schema
// ----------------------------------------------------------------------------

pub const CLUSTER_METRIC_PREFIX: &str = "ha_cluster";
pub const NODE_STATUS_PREFIX: &str = "ha_cluster_pacemaker_nodes_status_";
pub const RESOURCE_STATUS_PREFIX: &str = "ha_cluster_pacemaker_resources_status_";
pub const CLUSTER_NODES_METRIC: &str = "ha_cluster_pacemaker_nodes";
pub const CLUSTER_RESOURCES_METRIC: &str = "ha_cluster_pacemaker_resources";
pub const CLUSTER_LOCATION_CONSTRAINTS_METRIC: &str = "ha_cluster_pacemaker_location_constraints";

pub const INSTANCE_NAME_LABEL: &str = "instname";
pub const HOSTNAME_LABEL: &str = "hostname";
pub const NODE_LABEL: &str = "node";
pub const RESOURCE_LABEL: &str = "resource";
pub const STATUS_LABEL: &str = "status";
pub const TYPE_LABEL: &str = "type";
pub const MANAGED_LABEL: &str = "managed";
pub const ROLE_LABEL: &str = "role";

/// `status` value marking the cluster's designated coordinator node
pub const COORDINATOR_STATUS: &str = "dc";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data that flows through one collection cycle. Everything here is
// created fresh per cycle and dropped after serialization.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Get the current timestamp
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Labels & Samples
// ----------------------------------------------------------------------------

/// Label set of one sample. Keys are unique and iterate in sorted order,
/// which is also the order they are encoded in.
pub type LabelSet = BTreeMap<CompactString, CompactString>;

/// A single labeled measurement.
///
/// Samples are never mutated after parsing: relabeling builds a new sample
/// through [`Sample::derive`], so the parsed input stays intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: CompactString,
    pub labels: LabelSet,
    pub value: f64,
    pub timestamp: Option<Timestamp>,
}

impl Sample {
    pub fn new(name: impl Into<CompactString>, labels: LabelSet, value: f64) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<Timestamp>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Look up a label value
    #[inline]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(CompactString::as_str)
    }

    /// Build a new sample carrying this sample's value and timestamp
    pub fn derive(&self, name: impl Into<CompactString>, labels: LabelSet) -> Self {
        Self {
            name: name.into(),
            labels,
            value: self.value,
            timestamp: self.timestamp,
        }
    }

    /// The per-cycle liveness sample
    pub fn liveness(healthy: bool) -> Self {
        Self::new(LIVENESS_METRIC, LabelSet::new(), if healthy { 1.0 } else { 0.0 })
    }

    #[inline]
    pub fn is_cluster_metric(&self) -> bool {
        self.name.starts_with(CLUSTER_METRIC_PREFIX)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Families
// ----------------------------------------------------------------------------

/// Declared type of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    /// Sample-name suffixes that still belong to a family of this kind.
    /// A counter only takes samples named exactly as declared.
    pub fn sample_suffixes(&self) -> &'static [&'static str] {
        match self {
            MetricKind::Counter => &[],
            MetricKind::Histogram => &["_bucket", "_sum", "_count", "_created"],
            MetricKind::Summary => &["_sum", "_count", "_created"],
            MetricKind::Gauge | MetricKind::Untyped => &[],
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "histogram" => Ok(MetricKind::Histogram),
            "summary" => Ok(MetricKind::Summary),
            "untyped" | "unknown" => Ok(MetricKind::Untyped),
            other => Err(format!("unknown metric type '{}'", other)),
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
            MetricKind::Summary => write!(f, "summary"),
            MetricKind::Untyped => write!(f, "untyped"),
        }
    }
}

/// Ordered group of samples sharing a declared name and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: CompactString,
    pub kind: MetricKind,
    pub help: Option<String>,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<CompactString>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            help: None,
            samples: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_sample(mut self, sample: Sample) -> Self {
        self.samples.push(sample);
        self
    }

    /// Whether a sample with this name belongs to the family
    pub fn accepts(&self, sample_name: &str) -> bool {
        match sample_name.strip_prefix(self.name.as_str()) {
            Some("") => true,
            Some(suffix) => self.kind.sample_suffixes().contains(&suffix),
            None => false,
        }
    }

    /// Counter families are named without `_total` and their samples with it:
    /// `x_total` declared as a counter becomes family `x`, and a bare counter
    /// sample `x` becomes `x_total`.
    fn normalize_counter(mut self) -> Self {
        if self.kind != MetricKind::Counter {
            return self;
        }
        let base = self.name.strip_suffix("_total").map(CompactString::from);
        match base {
            Some(base) => self.name = base,
            None => {
                for sample in &mut self.samples {
                    if !sample.name.ends_with("_total") {
                        sample.name.push_str("_total");
                    }
                }
            }
        }
        self
    }
}

// ----------------------------------------------------------------------------
// 3.4 Instance Identity
// ----------------------------------------------------------------------------

/// Free-form metadata describing the collecting instance.
pub type InstanceMetadata = BTreeMap<String, String>;

/// Supplies the identity attached to every record of a cycle.
pub trait IdentityProvider: Send + Sync {
    /// Identity of the monitored provider instance
    fn instance_identity(&self) -> &str;

    /// Metadata attached to every record; carries at least the hostname
    fn instance_metadata(&self) -> &InstanceMetadata;

    fn hostname(&self) -> Option<&str> {
        self.instance_metadata()
            .get(HOSTNAME_METADATA_KEY)
            .map(String::as_str)
    }
}

/// Identity fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    identity: String,
    metadata: InstanceMetadata,
}

impl StaticIdentity {
    pub fn new(identity: impl Into<String>, hostname: impl Into<String>) -> Self {
        let mut metadata = InstanceMetadata::new();
        metadata.insert(HOSTNAME_METADATA_KEY.to_string(), hostname.into());
        Self {
            identity: identity.into(),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Identity for one configured provider. The hostname comes from the
    /// configuration, falling back to the local system's hostname.
    pub fn for_provider(general: &GeneralConfig, provider: &ProviderConfig) -> Self {
        let hostname = general
            .hostname
            .clone()
            .or_else(detect_hostname)
            .unwrap_or_else(|| "unknown".to_string());

        let mut identity = Self::new(provider.id.clone(), hostname);
        for (key, value) in &general.metadata {
            if key != HOSTNAME_METADATA_KEY {
                identity.metadata.insert(key.clone(), value.clone());
            }
        }
        identity
    }
}

impl IdentityProvider for StaticIdentity {
    fn instance_identity(&self) -> &str {
        &self.identity
    }

    fn instance_metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }
}

/// Local hostname, as reported by the OS.
pub fn detect_hostname() -> Option<String> {
    SysInfoSystem::host_name()
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
}

// ----------------------------------------------------------------------------
// 3.5 Normalized Records
// ----------------------------------------------------------------------------

/// Flattened, JSON-serializable projection of a sample.
///
/// Field order is alphabetical so the encoded object has sorted keys; the
/// label set is encoded as its own compact JSON string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    pub correlation_id: Uuid,
    pub generated_at_utc: DateTime<Utc>,
    pub instance_identity: String,
    pub instance_metadata: InstanceMetadata,
    #[serde(serialize_with = "serialize_labels")]
    pub labels: LabelSet,
    pub name: CompactString,
    pub value: f64,
}

fn serialize_labels<S: Serializer>(labels: &LabelSet, serializer: S) -> Result<S::Ok, S::Error> {
    let encoded = serde_json::to_string(labels).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&encoded)
}

/// Context shared by every record of one collection cycle.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub correlation_id: Uuid,
    pub fallback_time: DateTime<Utc>,
    pub instance_identity: String,
    pub instance_metadata: InstanceMetadata,
}

impl RecordContext {
    pub fn new(identity: &dyn IdentityProvider) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            fallback_time: Utc::now(),
            instance_identity: identity.instance_identity().to_string(),
            instance_metadata: identity.instance_metadata().clone(),
        }
    }

    pub fn record(&self, sample: &Sample) -> NormalizedRecord {
        NormalizedRecord {
            correlation_id: self.correlation_id,
            generated_at_utc: sample
                .timestamp
                .map(|ts| ts.to_datetime())
                .unwrap_or(self.fallback_time),
            instance_identity: self.instance_identity.clone(),
            instance_metadata: self.instance_metadata.clone(),
            labels: sample.labels.clone(),
            name: sample.name.clone(),
            value: sample.value,
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every stage of a collection cycle:
// - configuration errors are fatal and surface before any I/O
// - snapshot errors are shared by every waiter of one remote call
// - parse errors degrade the cycle to its sentinel records
// - serialization errors fail the cycle without a payload
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Relay Errors
// ----------------------------------------------------------------------------

/// The main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            RelayError::Config(_) => false,
            RelayError::Snapshot(e) => e.is_retryable(),
            RelayError::Parse(_) => true,
            RelayError::Serialization(_) => false,
            RelayError::Sink(_) => true,
            RelayError::Io(_) => true,
            RelayError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Snapshot(_) => "snapshot",
            RelayError::Parse(_) => "parse",
            RelayError::Serialization(_) => "serialization",
            RelayError::Sink(_) => "sink",
            RelayError::Io(_) => "io",
            RelayError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            RelayError::Config(_) => RecoveryHint::FixConfiguration,
            RelayError::Snapshot(e) => e.recovery_hint(),
            RelayError::Parse(_) => RecoveryHint::Skip,
            RelayError::Serialization(_) => RecoveryHint::AlertOperator,
            RelayError::Sink(_) => RecoveryHint::RetryWithBackoff,
            _ => RecoveryHint::None,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the backend
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this cycle and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    Malformed { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("{field} ({pattern}) must be a valid regular expression: {message}")]
    InvalidPattern {
        field: String,
        pattern: String,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Snapshot Errors
// ----------------------------------------------------------------------------

/// Failure of a remote snapshot call.
///
/// `Clone` because one failed call is reported to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("communication error for {call} on '{system}': {message}")]
    Transport {
        system: String,
        call: String,
        message: String,
    },

    #[error("{call} on '{system}' timed out after {timeout_ms}ms")]
    Timeout {
        system: String,
        call: String,
        timeout_ms: u64,
    },

    #[error("{call} on '{system}' failed: {message}")]
    Failed {
        system: String,
        call: String,
        message: String,
    },
}

impl SnapshotError {
    pub fn transport(system: impl Into<String>, call: impl Into<String>, message: impl Into<String>) -> Self {
        SnapshotError::Transport {
            system: system.into(),
            call: call.into(),
            message: message.into(),
        }
    }

    pub fn failed(system: impl Into<String>, call: impl Into<String>, message: impl Into<String>) -> Self {
        SnapshotError::Failed {
            system: system.into(),
            call: call.into(),
            message: message.into(),
        }
    }

    pub fn timeout(system: impl Into<String>, call: impl Into<String>, after: Duration) -> Self {
        SnapshotError::Timeout {
            system: system.into(),
            call: call.into(),
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Communication failures and timeouts may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SnapshotError::Transport { .. } | SnapshotError::Timeout { .. })
    }

    /// Log classification of the failure
    pub fn class(&self) -> &'static str {
        match self {
            SnapshotError::Transport { .. } => "communication",
            SnapshotError::Timeout { .. } => "timeout",
            SnapshotError::Failed { .. } => "error",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SnapshotError::Transport { .. } => RecoveryHint::Reconnect,
            SnapshotError::Timeout { .. } => RecoveryHint::RetryWithBackoff,
            SnapshotError::Failed { .. } => RecoveryHint::Skip,
        }
    }

    pub fn system(&self) -> &str {
        match self {
            SnapshotError::Transport { system, .. }
            | SnapshotError::Timeout { system, .. }
            | SnapshotError::Failed { system, .. } => system,
        }
    }
}

/// Result type for snapshot calls
pub type SnapshotResult<T> = Result<T, SnapshotError>;

// ----------------------------------------------------------------------------
// 4.4 Parse, Serialization & Sink Errors
// ----------------------------------------------------------------------------

/// Malformed or empty exposition text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty exposition payload")]
    Empty,

    #[error("exposition payload declares no metric families")]
    NoFamilies,

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// The record set could not be encoded
#[derive(Error, Debug, Clone)]
#[error("could not encode record set: {message}")]
pub struct SerializationError {
    pub message: String,
    /// Truncated rendering of the offending records
    pub excerpt: String,
}

/// A sink refused or failed to accept a payload
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink rejected payload for '{system}': {message}")]
    Rejected { system: String, message: String },
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration is loaded from TOML with environment overrides
// (CEREBRO_RELAY_ prefix, `__` as section separator). Every pattern is
// compiled during validation so a bad pattern fails before any fetch.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the relay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// General relay settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Snapshot cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Default family / sample filters
    #[serde(default)]
    pub filters: FilterConfig,

    /// Retry policy around remote snapshot calls
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Monitored backend systems
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CEREBRO_RELAY_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::Malformed {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::Malformed {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::invalid_value("cache.ttl", "TTL must be greater than zero"));
        }
        if self.cache.ttl > Duration::from_secs(MAX_SNAPSHOT_TTL_SECS) {
            return Err(ConfigError::invalid_value(
                "cache.ttl",
                format!("TTL must not exceed {}s", MAX_SNAPSHOT_TTL_SECS),
            ));
        }

        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid_value(
                "retry.backoff_multiplier",
                format!("must be at least 1.0, got {}", self.retry.backoff_multiplier),
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "compact" | "pretty") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}' (expected json, compact or pretty)", self.logging.format),
            ));
        }

        FilterChain::compile(
            self.filters.include.as_deref(),
            self.filters.suppress_if_zero.as_deref(),
        )?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::invalid_value("providers.id", "provider id cannot be empty"));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "providers.id",
                    format!("duplicate provider id '{}'", provider.id),
                ));
            }
            if provider.url.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("providers.{}.url", provider.id),
                    "url cannot be empty",
                ));
            }
            if provider.timeout.is_zero() {
                return Err(ConfigError::invalid_value(
                    format!("providers.{}.timeout", provider.id),
                    "timeout must be greater than zero",
                ));
            }
            if provider.window > Duration::from_secs(MAX_FETCH_WINDOW_SECS) {
                return Err(ConfigError::invalid_value(
                    format!("providers.{}.window", provider.id),
                    format!("window must not exceed {}s", MAX_FETCH_WINDOW_SECS),
                ));
            }
            self.filter_chain_for(provider)?;
        }

        Ok(())
    }

    /// Compiled filters for one provider; provider patterns win over the
    /// global ones.
    pub fn filter_chain_for(&self, provider: &ProviderConfig) -> ConfigResult<FilterChain> {
        let include = provider.include.as_deref().or(self.filters.include.as_deref());
        let suppress = provider
            .suppress_if_zero
            .as_deref()
            .or(self.filters.suppress_if_zero.as_deref());
        FilterChain::compile(include, suppress)
    }

    /// Cache policy implied by `cache.enabled`
    pub fn cache_policy(&self) -> CachePolicy {
        if self.cache.enabled {
            CachePolicy::UseCached
        } else {
            CachePolicy::Refresh
        }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let mut config = Self::default();
        config.providers.push(ProviderConfig::new("ha-cluster", "http://localhost:9664/metrics"));
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General, Cache & Filter Configuration
// ----------------------------------------------------------------------------

/// General relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of this relay instance
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Hostname used for coordinator gating; detected when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Extra metadata attached to every record
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            hostname: None,
            metadata: BTreeMap::new(),
        }
    }
}

fn default_instance_name() -> String {
    RELAY_NAME.into()
}

/// Snapshot cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a cached snapshot
    #[serde(default = "default_snapshot_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// When false every cycle asks for a fresh snapshot
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_snapshot_ttl(),
            enabled: true,
        }
    }
}

fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(DEFAULT_SNAPSHOT_TTL_SECS)
}

fn default_true() -> bool {
    true
}

/// Family inclusion and sample suppression patterns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Keep only families whose name matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,

    /// Drop zero-valued samples whose name matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_if_zero: Option<String>,
}

// ----------------------------------------------------------------------------
// 5.3 Retry Policy
// ----------------------------------------------------------------------------

/// Exponential backoff around retryable snapshot failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub delay: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            delay: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

fn default_retries() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(DEFAULT_RETRY_DELAY_SECS)
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_RETRY_BACKOFF_MULTIPLIER
}

// ----------------------------------------------------------------------------
// 5.4 Provider Configuration
// ----------------------------------------------------------------------------

/// One monitored backend system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend system id; also the snapshot cache key
    pub id: String,

    /// Exposition endpoint
    pub url: String,

    /// Bound on one snapshot call
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Trailing time window requested from the backend
    #[serde(default = "default_fetch_window", with = "humantime_serde")]
    pub window: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_if_zero: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            timeout: default_fetch_timeout(),
            window: default_fetch_window(),
            include: None,
            suppress_if_zero: None,
        }
    }
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)
}

fn default_fetch_window() -> Duration {
    Duration::from_secs(DEFAULT_FETCH_WINDOW_SECS)
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING
// ============================================================================
// Payloads go to stdout, so every log line is written to stderr or to the
// configured file.
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> RelayResult<Option<WorkerGuard>> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| RelayError::Config(ConfigError::invalid_value(
                    "logging.file",
                    format!("'{}' is not a file path", path.display()),
                )))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, config.colors),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        "pretty" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            ),
        ),
    };
    installed.map_err(|e| RelayError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "cerebro_relay::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(guard)
}

// ============================================================================
// SECTION 7: SNAPSHOT CACHE
// ============================================================================
// Single-flight TTL cache in front of expensive remote snapshot calls.
//
// - Live entries are served without a remote call
// - At most one call per key is in flight; concurrent callers share it
// - A failed call never replaces the last good entry
// - Expired entries are evicted lazily, on access
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Entries & Policy
// ----------------------------------------------------------------------------

/// Whether a lookup may be served from a live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Serve a live entry when one exists
    #[default]
    UseCached,
    /// Skip the live entry; still joins an in-flight call and stores the result
    Refresh,
}

/// A payload the snapshot cache may hold.
pub trait Snapshot: Send + Sync + 'static {
    /// Whether a later lookup may be served this payload. Empty snapshots are
    /// handed to the callers of the call that produced them but never stored.
    fn is_reusable(&self) -> bool {
        true
    }
}

impl Snapshot for String {
    fn is_reusable(&self) -> bool {
        !self.trim().is_empty()
    }
}

/// A successfully fetched snapshot and its expiry.
#[derive(Debug)]
pub struct CacheEntry<T> {
    payload: Arc<T>,
    expires_at: Instant,
    expires_at_utc: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn new(payload: Arc<T>, ttl: Duration) -> Self {
        let ttl = ttl.min(Duration::from_secs(MAX_SNAPSHOT_TTL_SECS));
        let now = Instant::now();
        let wall_now = Utc::now();
        let expires_at_utc = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|wall_ttl| wall_now.checked_add_signed(wall_ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            payload,
            expires_at: now.checked_add(ttl).unwrap_or(now),
            expires_at_utc,
        }
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn payload(&self) -> Arc<T> {
        Arc::clone(&self.payload)
    }

    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        self.expires_at_utc
    }
}

type SnapshotFuture<T> = BoxFuture<'static, SnapshotResult<Arc<T>>>;
type SharedSnapshot<T> = Shared<SnapshotFuture<T>>;

/// The shared call for one key, held weakly so that the call is dropped
/// once every waiter has gone.
struct InFlightCall<T> {
    attempt: u64,
    call: WeakShared<SnapshotFuture<T>>,
}

// ----------------------------------------------------------------------------
// 7.2 Statistics
// ----------------------------------------------------------------------------

/// Lookup counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    joins: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(AtomicOrdering::Relaxed),
            joins: self.joins.load(AtomicOrdering::Relaxed),
            fetches: self.fetches.load(AtomicOrdering::Relaxed),
            failures: self.failures.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from a live entry
    pub hits: u64,
    /// Lookups that joined a call already in flight
    pub joins: u64,
    /// Remote calls started
    pub fetches: u64,
    /// Remote calls that failed or timed out
    pub failures: u64,
}

// ----------------------------------------------------------------------------
// 7.3 Cache
// ----------------------------------------------------------------------------

/// Single-flight TTL cache keyed by backend system id.
///
/// Cloning yields another handle to the same cache.
pub struct SnapshotCache<T> {
    ttl: Duration,
    call_name: &'static str,
    entries: Arc<DashMap<String, CacheEntry<T>>>,
    in_flight: Arc<Mutex<HashMap<String, InFlightCall<T>>>>,
    next_attempt: Arc<AtomicU64>,
    stats: Arc<CacheStats>,
}

impl<T> Clone for SnapshotCache<T> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            call_name: self.call_name,
            entries: Arc::clone(&self.entries),
            in_flight: Arc::clone(&self.in_flight),
            next_attempt: Arc::clone(&self.next_attempt),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> fmt::Debug for SnapshotCache<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("ttl", &self.ttl)
            .field("call_name", &self.call_name)
            .field("entries", &self.entries.len())
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl<T: Snapshot> SnapshotCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            call_name: FETCH_CALL_NAME,
            entries: Arc::new(DashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_attempt: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Name of the guarded remote call, used in errors and logs
    pub fn with_call_name(mut self, call_name: &'static str) -> Self {
        self.call_name = call_name;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wall-clock expiry of the live entry for `key`
    pub fn expires_at_utc(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at_utc())
    }

    /// Live payload for `key`. An expired entry is evicted.
    pub fn peek(&self, key: &str) -> Option<Arc<T>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) && entry.payload.is_reusable() {
                return Some(entry.payload());
            }
        }
        if self.entries.remove_if(key, |_, entry| entry.is_expired(now)).is_some() {
            debug!(target: "cerebro_relay::cache", system = key, "Evicted expired snapshot");
        }
        None
    }

    /// Fetch-or-reuse the snapshot for `key`.
    ///
    /// `fetch` is only invoked when this caller starts a new remote call; it
    /// runs while the in-flight table is locked and should just build the
    /// future. The call is bounded by `call_timeout`, and every caller that
    /// joined it observes the same outcome.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        policy: CachePolicy,
        call_timeout: Duration,
        fetch: F,
    ) -> SnapshotResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SnapshotResult<T>> + Send + 'static,
    {
        if policy == CachePolicy::UseCached {
            if let Some(payload) = self.peek(key) {
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "cerebro_relay::cache", system = key, "Serving cached snapshot");
                return Ok(payload);
            }
        }

        let call: SharedSnapshot<T> = {
            let mut in_flight = self.in_flight.lock();

            // An attempt that finished between the lookup above and taking
            // the lock has already stored its entry.
            if policy == CachePolicy::UseCached {
                if let Some(payload) = self.peek(key) {
                    self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                    return Ok(payload);
                }
            }

            match in_flight.get(key).and_then(|record| record.call.upgrade()) {
                Some(call) => {
                    self.stats.joins.fetch_add(1, AtomicOrdering::Relaxed);
                    debug!(target: "cerebro_relay::cache", system = key, "Joining in-flight snapshot call");
                    call
                }
                None => {
                    let attempt = self.next_attempt.fetch_add(1, AtomicOrdering::Relaxed);
                    self.stats.fetches.fetch_add(1, AtomicOrdering::Relaxed);
                    let call = self.start_call(key, attempt, call_timeout, fetch()).shared();
                    if let Some(weak) = call.downgrade() {
                        in_flight.insert(key.to_string(), InFlightCall { attempt, call: weak });
                    }
                    call
                }
            }
        };

        call.await
    }

    fn start_call<Fut>(&self, key: &str, attempt: u64, call_timeout: Duration, fetch: Fut) -> SnapshotFuture<T>
    where
        Fut: Future<Output = SnapshotResult<T>> + Send + 'static,
    {
        let key = key.to_string();
        let ttl = self.ttl;
        let call_name = self.call_name;
        let entries = Arc::clone(&self.entries);
        let in_flight = Arc::clone(&self.in_flight);
        let stats = Arc::clone(&self.stats);

        async move {
            debug!(target: "cerebro_relay::cache", system = %key, call = call_name, attempt, "Starting snapshot call");

            let outcome = match timeout(call_timeout, fetch).await {
                Ok(Ok(payload)) => {
                    let payload = Arc::new(payload);
                    if payload.is_reusable() {
                        entries.insert(key.clone(), CacheEntry::new(Arc::clone(&payload), ttl));
                    } else {
                        debug!(target: "cerebro_relay::cache", system = %key, call = call_name, "Empty snapshot not cached");
                    }
                    Ok(payload)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SnapshotError::timeout(key.as_str(), call_name, call_timeout)),
            };

            if let Err(e) = &outcome {
                stats.failures.fetch_add(1, AtomicOrdering::Relaxed);
                if e.is_retryable() {
                    warn!(
                        target: "cerebro_relay::cache",
                        system = %key,
                        call = call_name,
                        class = e.class(),
                        error = %e,
                        "Communication error during snapshot call, previous entry kept"
                    );
                } else {
                    error!(
                        target: "cerebro_relay::cache",
                        system = %key,
                        call = call_name,
                        class = e.class(),
                        error = %e,
                        "Error occurred during snapshot call, previous entry kept"
                    );
                }
            }

            let mut in_flight = in_flight.lock();
            if in_flight.get(&key).map_or(false, |record| record.attempt == attempt) {
                in_flight.remove(&key);
            }

            outcome
        }
        .boxed()
    }
}

// ----------------------------------------------------------------------------
// 7.4 Process-wide Cache
// ----------------------------------------------------------------------------

static GLOBAL_SNAPSHOT_CACHE: OnceCell<SnapshotCache<String>> = OnceCell::new();

impl SnapshotCache<String> {
    /// Initialise the process-wide cache. Later calls return the existing
    /// instance unchanged.
    pub fn init_global(ttl: Duration) -> &'static Self {
        let cache = GLOBAL_SNAPSHOT_CACHE.get_or_init(|| {
            info!(target: "cerebro_relay::cache", ttl = %humantime::format_duration(ttl), "Snapshot cache initialized");
            Self::new(ttl)
        });
        if cache.ttl != ttl {
            warn!(
                target: "cerebro_relay::cache",
                requested = %humantime::format_duration(ttl),
                active = %humantime::format_duration(cache.ttl),
                "Snapshot cache already initialized, keeping active TTL"
            );
        }
        cache
    }

    /// The process-wide cache, initialised with the default TTL on first use
    pub fn global() -> &'static Self {
        GLOBAL_SNAPSHOT_CACHE.get_or_init(|| Self::new(Duration::from_secs(DEFAULT_SNAPSHOT_TTL_SECS)))
    }
}

// ============================================================================
// SECTION 8: EXPOSITION PARSER
// ============================================================================
// Line-oriented text exposition format:
//
//   # HELP <name> <text>
//   # TYPE <name> <counter|gauge|histogram|summary|untyped>
//   <name>[{<label>="<value>",...}] <value> [<timestamp_ms>]
//
// Families are produced lazily; each call to `parse_families` starts over
// from the first line and shares no state with earlier calls.
// ============================================================================

/// Parse exposition text into a lazy sequence of metric families.
pub fn parse_families(text: &str) -> Result<FamilyIter<'_>, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(FamilyIter {
        lines: text.lines().enumerate(),
        current: None,
        finished: false,
    })
}

/// Iterator over the families of one exposition payload.
///
/// Yields `Err` at most once; the iterator is exhausted afterwards.
pub struct FamilyIter<'a> {
    lines: Enumerate<Lines<'a>>,
    current: Option<MetricFamily>,
    finished: bool,
}

impl FamilyIter<'_> {
    fn fail(&mut self, error: ParseError) -> Option<Result<MetricFamily, ParseError>> {
        self.finished = true;
        self.current = None;
        Some(Err(error))
    }

    /// Make `name` the open family. Returns the family it replaces, if any.
    fn open_family(&mut self, name: &str) -> Option<MetricFamily> {
        let reusable = matches!(
            &self.current,
            Some(family) if family.name == name && family.samples.is_empty()
        );
        if reusable {
            return None;
        }
        self.current.replace(MetricFamily::new(name, MetricKind::Untyped))
    }
}

impl Iterator for FamilyIter<'_> {
    type Item = Result<MetricFamily, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while let Some((index, raw)) = self.lines.next() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(comment) = line.strip_prefix('#') {
                let directive = match parse_directive(comment, line_no) {
                    Ok(Some(directive)) => directive,
                    Ok(None) => continue,
                    Err(e) => return self.fail(e),
                };
                let closed = self.open_family(directive.name());
                if let Some(family) = self.current.as_mut() {
                    match directive {
                        Directive::Help { text, .. } => family.help = Some(text),
                        Directive::Type { kind, .. } => family.kind = kind,
                    }
                }
                if let Some(family) = closed {
                    return Some(Ok(family.normalize_counter()));
                }
                continue;
            }

            let sample = match LineCursor::new(line, line_no).sample() {
                Ok(sample) => sample,
                Err(e) => return self.fail(e),
            };

            match self.current.as_mut() {
                Some(family) if family.accepts(&sample.name) => family.samples.push(sample),
                _ => {
                    let family = MetricFamily::new(sample.name.clone(), MetricKind::Untyped).with_sample(sample);
                    if let Some(closed) = self.current.replace(family) {
                        return Some(Ok(closed.normalize_counter()));
                    }
                }
            }
        }

        self.finished = true;
        self.current.take().map(|family| Ok(family.normalize_counter()))
    }
}

enum Directive {
    Help { name: String, text: String },
    Type { name: String, kind: MetricKind },
}

impl Directive {
    fn name(&self) -> &str {
        match self {
            Directive::Help { name, .. } | Directive::Type { name, .. } => name,
        }
    }
}

/// `HELP` / `TYPE` directive of a comment line; `None` for plain comments.
fn parse_directive(comment: &str, line_no: usize) -> Result<Option<Directive>, ParseError> {
    let comment = comment.trim_start();
    let (keyword, rest) = match comment.split_once(char::is_whitespace) {
        Some(split) => split,
        None => return Ok(None),
    };
    if keyword != "HELP" && keyword != "TYPE" {
        return Ok(None);
    }

    let rest = rest.trim_start();
    let (name, tail) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    if !is_metric_name(name) {
        return Err(ParseError::Syntax {
            line: line_no,
            message: format!("invalid metric name '{}' in {} directive", name, keyword),
        });
    }

    let directive = if keyword == "HELP" {
        Directive::Help {
            name: name.to_string(),
            text: unescape_help(tail.trim()),
        }
    } else {
        let kind = tail.trim().parse::<MetricKind>().map_err(|message| ParseError::Syntax {
            line: line_no,
            message,
        })?;
        Directive::Type {
            name: name.to_string(),
            kind,
        }
    };
    Ok(Some(directive))
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn unescape_help(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Cursor over a single sample line.
struct LineCursor<'a> {
    line: &'a str,
    pos: usize,
    line_no: usize,
}

impl<'a> LineCursor<'a> {
    fn new(line: &'a str, line_no: usize) -> Self {
        Self { line, pos: 0, line_no }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            line: self.line_no,
            message: message.into(),
        }
    }

    #[inline]
    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    #[inline]
    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.line[start..self.pos]
    }

    fn sample(mut self) -> Result<Sample, ParseError> {
        let name = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
        if !is_metric_name(name) {
            return Err(self.error(format!("invalid metric name in '{}'", self.line)));
        }

        self.skip_whitespace();
        let labels = if self.peek() == Some('{') {
            self.bump();
            self.labels()?
        } else {
            LabelSet::new()
        };

        self.skip_whitespace();
        let value_token = self.take_while(|c| !c.is_whitespace());
        if value_token.is_empty() {
            return Err(self.error(format!("missing value for '{}'", name)));
        }
        let value = parse_sample_value(value_token)
            .ok_or_else(|| self.error(format!("invalid value '{}'", value_token)))?;

        self.skip_whitespace();
        let timestamp = match self.take_while(|c| !c.is_whitespace()) {
            "" => None,
            token => {
                let millis: i64 = token
                    .parse()
                    .map_err(|_| self.error(format!("invalid timestamp '{}'", token)))?;
                Some(Timestamp::from_millis(millis))
            }
        };

        self.skip_whitespace();
        if !self.rest().is_empty() {
            return Err(self.error(format!("unexpected trailing input '{}'", self.rest())));
        }

        Ok(Sample::new(name, labels, value).with_timestamp(timestamp))
    }

    /// Label set after the opening brace, through the closing one.
    fn labels(&mut self) -> Result<LabelSet, ParseError> {
        let mut labels = LabelSet::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(labels);
            }

            let key = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
            if key.is_empty() || key.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(self.error("invalid or unterminated label set"));
            }
            self.skip_whitespace();
            if self.bump() != Some('=') {
                return Err(self.error(format!("expected '=' after label '{}'", key)));
            }
            self.skip_whitespace();
            if self.bump() != Some('"') {
                return Err(self.error(format!("expected quoted value for label '{}'", key)));
            }
            let value = self.label_value()?;

            if labels.insert(CompactString::from(key), value).is_some() {
                return Err(self.error(format!("duplicate label '{}'", key)));
            }

            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(labels),
                _ => return Err(self.error("unterminated label set")),
            }
        }
    }

    /// Quoted label value after the opening quote, through the closing one.
    fn label_value(&mut self) -> Result<CompactString, ParseError> {
        let mut value = CompactString::default();
        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(self.error("unterminated label value")),
                },
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated label value")),
            }
        }
    }
}

fn parse_sample_value(token: &str) -> Option<f64> {
    match token {
        "NaN" => Some(f64::NAN),
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

// ============================================================================
// SECTION 9: RELABEL ENGINE
// ============================================================================
// Rewrites vendor cluster metrics into the canonical downstream schema.
// Dispatch is by exact sample name; names without a rule pass through.
// ============================================================================

/// Canonical rewrite applied to a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelabelRule {
    NodeStatus,
    ResourceBulk,
    ResourceManagedBulk,
    ResourceStatus,
    FailMigration,
    LocationConstraint,
}

static RELABEL_TABLE: Lazy<HashMap<&'static str, RelabelRule>> = Lazy::new(|| {
    use RelabelRule::*;
    HashMap::from([
        ("ha_cluster_pacemaker_nodes_status_dc", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_online", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_standby", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_standby_on_fail", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_maintenance", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_pending", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_shutdown", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_expected_up", NodeStatus),
        ("ha_cluster_pacemaker_nodes_status_unclean", NodeStatus),
        ("ha_cluster_pacemaker_resources_all", ResourceBulk),
        ("ha_cluster_pacemaker_resources_managed", ResourceManagedBulk),
        ("ha_cluster_pacemaker_resources_status_active", ResourceStatus),
        ("ha_cluster_pacemaker_resources_status_blocked", ResourceStatus),
        ("ha_cluster_pacemaker_resources_status_failed", ResourceStatus),
        ("ha_cluster_pacemaker_resources_status_failure_ignored", ResourceStatus),
        ("ha_cluster_pacemaker_resources_status_orphaned", ResourceStatus),
        ("ha_cluster_pacemaker_fail_count", FailMigration),
        ("ha_cluster_pacemaker_migration_threshold", FailMigration),
        ("ha_cluster_pacemaker_location_constraints_all", LocationConstraint),
    ])
});

impl RelabelRule {
    /// Rule registered for an exact sample name
    pub fn for_name(name: &str) -> Option<Self> {
        RELABEL_TABLE.get(name).copied()
    }

    pub fn apply(&self, sample: &Sample) -> Sample {
        match self {
            RelabelRule::NodeStatus => relabel_node_status(sample),
            RelabelRule::ResourceBulk => relabel_resource_bulk(sample),
            RelabelRule::ResourceManagedBulk => relabel_resource_managed(sample),
            RelabelRule::ResourceStatus => relabel_resource_status(sample),
            RelabelRule::FailMigration => relabel_fail_migration(sample),
            RelabelRule::LocationConstraint => sample.derive(CLUSTER_LOCATION_CONSTRAINTS_METRIC, sample.labels.clone()),
        }
    }
}

/// Stateless relabeler over the fixed rule table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelabelEngine;

impl RelabelEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn relabel(&self, sample: &Sample) -> Sample {
        match RelabelRule::for_name(&sample.name) {
            Some(rule) => rule.apply(sample),
            None => sample.clone(),
        }
    }

    /// Relabel a batch, preserving input order
    pub fn relabel_all<'s>(&self, samples: impl IntoIterator<Item = &'s Sample>) -> Vec<Sample> {
        samples.into_iter().map(|s| self.relabel(s)).collect()
    }
}

fn relabel_node_status(sample: &Sample) -> Sample {
    let mut labels = sample.labels.clone();
    let status = match sample.name.strip_prefix(NODE_STATUS_PREFIX).unwrap_or_default() {
        "on_fail" => "onfail",
        status => status,
    };
    labels.insert(STATUS_LABEL.into(), status.into());
    if let Some(instance) = sample.label(INSTANCE_NAME_LABEL) {
        labels.insert(NODE_LABEL.into(), instance.into());
    }
    labels.insert(TYPE_LABEL.into(), "member".into());
    sample.derive(CLUSTER_NODES_METRIC, labels)
}

fn relabel_resource_bulk(sample: &Sample) -> Sample {
    let mut labels = sample.labels.clone();
    match sample.label(MANAGED_LABEL) {
        Some("1") => {
            labels.insert(MANAGED_LABEL.into(), "true".into());
        }
        Some("0") => {
            labels.insert(MANAGED_LABEL.into(), "false".into());
        }
        _ => {}
    }
    if let Some(role) = sample.label(ROLE_LABEL) {
        labels.insert(ROLE_LABEL.into(), lowercase_first(role));
    }
    sample.derive(CLUSTER_RESOURCES_METRIC, labels)
}

fn relabel_resource_status(sample: &Sample) -> Sample {
    let mut labels = sample.labels.clone();
    let status = sample.name.strip_prefix(RESOURCE_STATUS_PREFIX).unwrap_or_default();
    labels.insert(STATUS_LABEL.into(), status.into());
    assign_resource_and_node(sample, &mut labels, false);
    sample.derive(CLUSTER_RESOURCES_METRIC, labels)
}

fn relabel_resource_managed(sample: &Sample) -> Sample {
    let mut labels = sample.labels.clone();
    labels.insert(MANAGED_LABEL.into(), "True".into());
    assign_resource_and_node(sample, &mut labels, false);
    sample.derive(CLUSTER_RESOURCES_METRIC, labels)
}

fn relabel_fail_migration(sample: &Sample) -> Sample {
    if sample.label(INSTANCE_NAME_LABEL).is_none() {
        return sample.clone();
    }
    let mut labels = sample.labels.clone();
    assign_resource_and_node(sample, &mut labels, true);
    sample.derive(sample.name.clone(), labels)
}

/// Set `resource` and `node` from a composite `instname` of the form
/// `a:b`. Any other shape falls back to `instname` / `hostname`; labels
/// missing from the source are left unset.
fn assign_resource_and_node(sample: &Sample, labels: &mut LabelSet, reversed: bool) {
    let instance = sample.label(INSTANCE_NAME_LABEL);

    let (resource, node) = match instance.and_then(split_composite) {
        Some((first, second)) if reversed => (Some(second), Some(first)),
        Some((first, second)) => (Some(first), Some(second)),
        None => (instance, sample.label(HOSTNAME_LABEL)),
    };

    if let Some(resource) = resource {
        labels.insert(RESOURCE_LABEL.into(), resource.into());
    }
    if let Some(node) = node {
        labels.insert(NODE_LABEL.into(), node.into());
    }
}

/// `a:b` into `(a, b)`; values with no colon or more than one are not
/// composite.
fn split_composite(value: &str) -> Option<(&str, &str)> {
    let (first, second) = value.split_once(':')?;
    if second.contains(':') {
        return None;
    }
    Some((first, second))
}

fn lowercase_first(value: &str) -> CompactString {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => {
            let mut out: CompactString = first.to_lowercase().collect();
            out.push_str(chars.as_str());
            out
        }
        None => CompactString::default(),
    }
}

// ============================================================================
// SECTION 10: FILTER CHAIN
// ============================================================================
// Family exclusion / inclusion and per-sample zero suppression. All matches
// are anchored at the start of the name.
// ============================================================================

static EXCLUDED_FAMILIES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(EXCLUDED_FAMILY_PATTERN).expect("built-in exclusion pattern is valid")
});

/// Compiled family and sample filters for one provider.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    include: Option<Regex>,
    suppress_if_zero: Option<Regex>,
}

impl FilterChain {
    /// Compile the configured patterns. Empty patterns are treated as unset.
    pub fn compile(include: Option<&str>, suppress_if_zero: Option<&str>) -> ConfigResult<Self> {
        Ok(Self {
            include: compile_anchored("include", include)?,
            suppress_if_zero: compile_anchored("suppress_if_zero", suppress_if_zero)?,
        })
    }

    /// Whether a family survives exclusion and inclusion
    pub fn accepts_family(&self, name: &str) -> bool {
        if EXCLUDED_FAMILIES.is_match(name) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(name),
            None => true,
        }
    }

    pub fn filter_families(&self, families: impl IntoIterator<Item = MetricFamily>) -> Vec<MetricFamily> {
        families
            .into_iter()
            .filter(|family| self.accepts_family(&family.name))
            .collect()
    }

    /// Whether a (relabeled) sample is dropped for being zero
    pub fn suppresses(&self, sample: &Sample) -> bool {
        match &self.suppress_if_zero {
            Some(pattern) => sample.value == 0.0 && pattern.is_match(&sample.name),
            None => false,
        }
    }
}

/// Compile `pattern` so that it only matches at the start of the input.
fn compile_anchored(field: &str, pattern: Option<&str>) -> ConfigResult<Option<Regex>> {
    let pattern = match pattern {
        Some(p) if !p.trim().is_empty() => p,
        _ => return Ok(None),
    };
    let invalid = |message: String| ConfigError::InvalidPattern {
        field: field.to_string(),
        pattern: pattern.to_string(),
        message,
    };

    // Validate the pattern on its own first so errors point at user input.
    Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
    Regex::new(&format!("^(?:{})", pattern))
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

// ============================================================================
// SECTION 11: NORMALIZATION PIPELINE
// ============================================================================
// One collection cycle: parse → filter → relabel → suppress → gate →
// liveness + self-identity → serialize. A cycle never errors before
// serialization; failures degrade it to the sentinel records.
// ============================================================================

/// Records produced by one cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub correlation_id: Uuid,
    pub records: Vec<NormalizedRecord>,
    /// Why the cycle degraded to its sentinel records
    pub failure: Option<ParseError>,
}

impl CycleOutcome {
    pub fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }
}

/// Per-provider normalization pipeline.
pub struct NormalizationPipeline {
    filters: FilterChain,
    relabel: RelabelEngine,
    identity: Arc<dyn IdentityProvider>,
}

impl NormalizationPipeline {
    pub fn new(filters: FilterChain, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            filters,
            relabel: RelabelEngine::new(),
            identity,
        }
    }

    pub fn identity(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    /// Normalize one exposition payload. `None` means nothing was fetched.
    pub fn normalize(&self, text: Option<&str>) -> CycleOutcome {
        let context = RecordContext::new(self.identity.as_ref());

        let mut records = Vec::new();
        let failure = match text.map(|t| self.process(t)).unwrap_or(Err(ParseError::Empty)) {
            Ok(samples) => {
                records.extend(samples.iter().map(|s| context.record(s)));
                None
            }
            Err(e) => {
                error!(
                    target: "cerebro_relay::pipeline",
                    instance = context.instance_identity.as_str(),
                    error = %e,
                    payload = %excerpt(text.unwrap_or_default(), LOG_EXCERPT_CHARS),
                    "Could not parse exposition payload"
                );
                Some(e)
            }
        };

        records.push(context.record(&Sample::liveness(failure.is_none())));
        records.push(context.record(&self.self_identity_sample()));

        CycleOutcome {
            correlation_id: context.correlation_id,
            records,
            failure,
        }
    }

    /// Parse, filter, relabel and gate; the samples to report as data.
    fn process(&self, text: &str) -> Result<Vec<Sample>, ParseError> {
        let mut samples = Vec::new();
        for family in parse_families(text)? {
            let family = family?;
            if !self.filters.accepts_family(&family.name) {
                continue;
            }
            samples.extend(
                family
                    .samples
                    .iter()
                    .map(|s| self.relabel.relabel(s))
                    .filter(|s| !self.filters.suppresses(s)),
            );
        }

        if is_cluster_only(&samples) && !self.is_coordinator(&samples) {
            info!(
                target: "cerebro_relay::pipeline",
                instance = self.identity.instance_identity(),
                "Cluster data from non-coordinator node, skipping data records"
            );
            samples.clear();
        }

        Ok(samples)
    }

    /// This node is the coordinator according to the payload
    fn is_coordinator(&self, samples: &[Sample]) -> bool {
        let Some(hostname) = self.identity.hostname() else {
            return false;
        };
        samples.iter().any(|s| {
            s.name == CLUSTER_NODES_METRIC
                && s.label(STATUS_LABEL) == Some(COORDINATOR_STATUS)
                && s.label(NODE_LABEL) == Some(hostname)
        })
    }

    fn self_identity_sample(&self) -> Sample {
        let mut labels = LabelSet::new();
        labels.insert(SELF_VERSION_LABEL.into(), RELAY_VERSION.into());
        labels.insert(SELF_INSTANCE_LABEL.into(), self.identity.instance_identity().into());
        Sample::new(SELF_METRIC, labels, 1.0)
    }

    /// Encode the record set as one compact JSON array.
    pub fn serialize(&self, records: &[NormalizedRecord]) -> Result<String, SerializationError> {
        match serde_json::to_string(records) {
            Ok(payload) => {
                debug!(
                    target: "cerebro_relay::pipeline",
                    instance = self.identity.instance_identity(),
                    records = records.len(),
                    payload = %excerpt(&payload, LOG_EXCERPT_CHARS),
                    "Serialized record set"
                );
                Ok(payload)
            }
            Err(e) => {
                let shown = &records[..records.len().min(LOG_EXCERPT_RECORDS)];
                let error = SerializationError {
                    message: e.to_string(),
                    excerpt: excerpt(&format!("{:?}", shown), LOG_EXCERPT_CHARS).to_string(),
                };
                error!(
                    target: "cerebro_relay::pipeline",
                    instance = self.identity.instance_identity(),
                    error = %error.message,
                    records = %error.excerpt,
                    "Could not encode record set"
                );
                Err(error)
            }
        }
    }
}

/// At least one cluster-domain sample and nothing else besides liveness
/// samples.
fn is_cluster_only(samples: &[Sample]) -> bool {
    let mut any_cluster = false;
    for sample in samples {
        if sample.is_cluster_metric() {
            any_cluster = true;
        } else if sample.name != LIVENESS_METRIC {
            return false;
        }
    }
    any_cluster
}

/// At most `max_chars` characters of `text`, cut on a char boundary
fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// SECTION 12: EXTERNAL INTERFACES
// ============================================================================
// Seams to the outside world: where exposition text comes from and where
// serialized payloads go. Identity lives with the core types (3.4).
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Exposition Sources
// ----------------------------------------------------------------------------

/// Time window requested from a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    /// The window of length `span` ending now
    pub fn trailing(span: Duration) -> Self {
        let end = Utc::now();
        let span = span.min(Duration::from_secs(MAX_FETCH_WINDOW_SECS));
        let start = chrono::Duration::from_std(span)
            .ok()
            .and_then(|span| end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }
}

/// Produces raw exposition text for a backend system.
#[async_trait]
pub trait ExpositionSource: Send + Sync {
    async fn fetch(&self, system_id: &str, window: FetchWindow) -> SnapshotResult<String>;
}

/// Scrapes an HTTP exposition endpoint.
pub struct HttpExpositionSource {
    client: HttpClient,
    url: String,
}

impl HttpExpositionSource {
    pub fn new(url: impl Into<String>) -> RelayResult<Self> {
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .user_agent(format!("{}/{}", RELAY_NAME, RELAY_VERSION))
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ExpositionSource for HttpExpositionSource {
    async fn fetch(&self, system_id: &str, window: FetchWindow) -> SnapshotResult<String> {
        debug!(
            target: "cerebro_relay::source::http",
            system = system_id,
            url = %self.url,
            window_start = %window.start,
            "Requesting exposition"
        );

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SnapshotError::transport(system_id, FETCH_CALL_NAME, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::transport(
                system_id,
                FETCH_CALL_NAME,
                format!("{} returned HTTP {}", self.url, status),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| SnapshotError::failed(system_id, FETCH_CALL_NAME, format!("could not read body: {}", e)))
    }
}

// ----------------------------------------------------------------------------
// 12.2 Record Sinks
// ----------------------------------------------------------------------------

/// Accepts serialized record payloads.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn deliver(&self, system_id: &str, payload: &str) -> Result<(), SinkError>;
}

/// Writes one payload per line to stdout.
pub struct StdoutSink {
    out: TokioMutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: TokioMutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSink for StdoutSink {
    async fn deliver(&self, system_id: &str, payload: &str) -> Result<(), SinkError> {
        let mut out = self.out.lock().await;
        out.write_all(payload.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        debug!(target: "cerebro_relay::sink", system = system_id, bytes = payload.len(), "Payload delivered");
        Ok(())
    }
}

// ============================================================================
// SECTION 13: EXPOSITION CHECK
// ============================================================================
// One monitored backend: source + shared cache + compiled pipeline + retry
// policy. A check runs complete collection cycles; it never decides when.
// ============================================================================

/// Result of one collection cycle
#[derive(Debug)]
pub struct CycleReport {
    pub system_id: String,
    pub correlation_id: Uuid,
    pub record_count: usize,
    /// Compact JSON array of normalized records
    pub payload: String,
    /// xxh3 of the payload, for duplicate detection downstream
    pub payload_hash: u64,
    /// Why the cycle degraded to its sentinel records
    pub failure: Option<RelayError>,
}

impl CycleReport {
    pub fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }
}

/// Collection check for a single backend system.
pub struct ExpositionCheck {
    system_id: String,
    source: Arc<dyn ExpositionSource>,
    pipeline: NormalizationPipeline,
    cache: SnapshotCache<String>,
    policy: CachePolicy,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    window: Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl ExpositionCheck {
    pub fn new(
        system_id: impl Into<String>,
        source: Arc<dyn ExpositionSource>,
        pipeline: NormalizationPipeline,
        cache: SnapshotCache<String>,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            source,
            pipeline,
            cache,
            policy: CachePolicy::UseCached,
            retry: RetryPolicy::default(),
            fetch_timeout: default_fetch_timeout(),
            window: default_fetch_window(),
            last_run: Mutex::new(None),
        }
    }

    /// Build the check for one configured provider. Patterns are compiled
    /// here, before anything is fetched.
    pub fn from_config(
        config: &RelayConfig,
        provider: &ProviderConfig,
        cache: SnapshotCache<String>,
    ) -> RelayResult<Self> {
        let filters = config.filter_chain_for(provider)?;
        let identity = Arc::new(StaticIdentity::for_provider(&config.general, provider));
        let source = Arc::new(HttpExpositionSource::new(provider.url.clone())?);

        info!(
            target: "cerebro_relay::check",
            system = %provider.id,
            url = %provider.url,
            hostname = identity.hostname().unwrap_or("unknown"),
            "Exposition check configured"
        );

        Ok(Self::new(
            provider.id.clone(),
            source,
            NormalizationPipeline::new(filters, identity),
            cache,
        )
        .with_policy(config.cache_policy())
        .with_retry(config.retry.clone())
        .with_fetch_timeout(provider.timeout)
        .with_window(provider.window))
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// Start of the most recent cycle
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock()
    }

    /// Run one cycle: fetch (through the cache), normalize, serialize.
    ///
    /// A failed fetch or parse still yields a payload with the sentinel
    /// records; only an encoding failure returns `Err`.
    pub async fn run_cycle(&self) -> RelayResult<CycleReport> {
        *self.last_run.lock() = Some(Utc::now());

        let (outcome, fetch_failure) = match self.fetch_with_retry().await {
            Ok(text) => (self.pipeline.normalize(Some(text.as_str())), None),
            Err(e) => {
                error!(
                    target: "cerebro_relay::check",
                    system = %self.system_id,
                    error = %e,
                    "Snapshot unavailable, reporting liveness only"
                );
                (self.pipeline.normalize(None), Some(RelayError::Snapshot(e)))
            }
        };

        let payload = self.pipeline.serialize(&outcome.records)?;
        let failure = fetch_failure.or_else(|| outcome.failure.clone().map(RelayError::Parse));

        info!(
            target: "cerebro_relay::check",
            system = %self.system_id,
            correlation_id = %outcome.correlation_id,
            records = outcome.records.len(),
            healthy = failure.is_none(),
            "Collection cycle complete"
        );

        Ok(CycleReport {
            system_id: self.system_id.clone(),
            correlation_id: outcome.correlation_id,
            record_count: outcome.records.len(),
            payload_hash: xxh3_64(payload.as_bytes()),
            payload,
            failure,
        })
    }

    /// Run one cycle and hand its payload to `sink`
    pub async fn collect_into(&self, sink: &dyn RecordSink) -> RelayResult<CycleReport> {
        let report = self.run_cycle().await?;
        sink.deliver(&report.system_id, &report.payload).await?;
        Ok(report)
    }

    async fn fetch_with_retry(&self) -> SnapshotResult<Arc<String>> {
        let mut retry = 0;
        loop {
            let source = Arc::clone(&self.source);
            let system_id = self.system_id.clone();
            let window = FetchWindow::trailing(self.window);

            let result = self
                .cache
                .get(&self.system_id, self.policy, self.fetch_timeout, move || async move {
                    source.fetch(&system_id, window).await
                })
                .await;

            match result {
                Err(e) if e.is_retryable() && retry < self.retry.retries => {
                    let delay = self.retry.delay_for(retry);
                    warn!(
                        target: "cerebro_relay::check",
                        system = %self.system_id,
                        attempt = retry + 1,
                        delay = %humantime::format_duration(delay),
                        error = %e,
                        "Retrying snapshot call"
                    );
                    sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }

    /// Fetch once, bypassing the cache, and check that the payload parses
    /// into at least one family. Filters are not applied; returns the number
    /// of parsed families.
    pub async fn validate_source(&self) -> RelayResult<usize> {
        let window = FetchWindow::trailing(self.window);
        let text = match timeout(self.fetch_timeout, self.source.fetch(&self.system_id, window)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SnapshotError::timeout(self.system_id.as_str(), FETCH_CALL_NAME, self.fetch_timeout).into())
            }
        };

        let families = parse_families(&text)?.collect::<Result<Vec<_>, _>>()?;
        let parsed = families.len();
        if parsed == 0 {
            return Err(ParseError::NoFamilies.into());
        }
        let accepted = self.pipeline.filters.filter_families(families).len();

        info!(
            target: "cerebro_relay::check",
            system = %self.system_id,
            families = parsed,
            accepted,
            "Exposition source validated"
        );
        Ok(parsed)
    }
}

// ============================================================================
// SECTION 14: CLI & MAIN ENTRY POINT
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Definition
// ----------------------------------------------------------------------------

/// Cerebro Relay CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-relay",
    author = "AIOps Team",
    version,
    about = "Telemetry acquisition and normalization relay for AIOps",
    long_about = "Cerebro Relay fetches exposition snapshots from monitored backend systems, \
                  deduplicates concurrent remote calls through a shared snapshot cache and \
                  emits normalized, correlated JSON records for ingestion."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cerebro-relay.toml", env = "CEREBRO_RELAY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "CEREBRO_RELAY_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one collection cycle per provider and print the payloads
    Collect {
        /// Only collect from this provider id
        #[arg(short, long)]
        provider: Option<String>,

        /// Ignore cached snapshots
        #[arg(long)]
        refresh: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,

        /// Also fetch once from every provider
        #[arg(long)]
        fetch: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show relay version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
async fn handle_validate(config_path: &Path, verbose: bool, fetch: bool) -> RelayResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match RelayConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            return Err(RelayError::Config(e));
        }
    };
    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Instance name: {}", config.general.instance_name);
    println!("  • Snapshot TTL: {}", humantime::format_duration(config.cache.ttl));
    println!("  • Cache enabled: {}", config.cache.enabled);
    println!("  • Retries: {}", config.retry.retries);
    println!("  • Providers defined: {}", config.providers.len());
    for provider in &config.providers {
        println!("    - {} ({})", provider.id, provider.url);
    }

    if fetch {
        println!("\n🔎 Fetching from providers:");
        let cache = SnapshotCache::new(config.cache.ttl);
        let mut failed = 0;
        for provider in &config.providers {
            let check = ExpositionCheck::from_config(&config, provider, cache.clone())?;
            match check.validate_source().await {
                Ok(families) => println!("  ✅ {}: {} metric families", provider.id, families),
                Err(e) => {
                    failed += 1;
                    println!("  ❌ {}: {}", provider.id, e);
                }
            }
        }
        if failed > 0 {
            return Err(RelayError::Internal(format!("{} provider(s) failed validation", failed)));
        }
    }

    Ok(())
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> RelayResult<()> {
    let config_str = RelayConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📡 {} v{}", RELAY_FULL_NAME, RELAY_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • Single-flight snapshot cache");
    println!("  • Text exposition parsing");
    println!("  • Cluster metric relabeling");
    println!("  • Compact JSON record output");
}

/// Handle the collect subcommand: one concurrent cycle per provider
async fn handle_collect(config: &RelayConfig, only: Option<&str>, refresh: bool) -> RelayResult<()> {
    let providers: Vec<&ProviderConfig> = match only {
        Some(id) => vec![config
            .provider(id)
            .ok_or_else(|| ConfigError::invalid_value("provider", format!("unknown provider '{}'", id)))?],
        None => config.providers.iter().collect(),
    };

    if providers.is_empty() {
        warn!(target: "cerebro_relay::cli", "No providers configured, nothing to collect");
        return Ok(());
    }

    let cache = SnapshotCache::<String>::init_global(config.cache.ttl).clone();
    let policy = if refresh { CachePolicy::Refresh } else { config.cache_policy() };
    let sink: Arc<dyn RecordSink> = Arc::new(StdoutSink::new());

    let mut tasks = JoinSet::new();
    for provider in providers {
        let check = ExpositionCheck::from_config(config, provider, cache.clone())?.with_policy(policy);
        let sink = Arc::clone(&sink);
        tasks.spawn(async move { check.collect_into(sink.as_ref()).await });
    }

    let total = tasks.len();
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(report)) => {
                if let Some(e) = &report.failure {
                    warn!(
                        target: "cerebro_relay::cli",
                        system = %report.system_id,
                        category = e.category(),
                        hint = ?e.recovery_hint(),
                        error = %e,
                        "Cycle degraded"
                    );
                }
            }
            Ok(Err(e)) => {
                failed += 1;
                error!(target: "cerebro_relay::cli", category = e.category(), error = %e, "Cycle failed");
            }
            Err(e) => {
                failed += 1;
                error!(target: "cerebro_relay::cli", error = %e, "Collection task aborted");
            }
        }
    }

    let stats = cache.stats();
    info!(
        target: "cerebro_relay::cli",
        providers = total,
        failed,
        cache_hits = stats.hits,
        cache_fetches = stats.fetches,
        "Collection finished"
    );

    if failed > 0 {
        return Err(RelayError::Internal(format!("{} of {} cycles failed", failed, total)));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 14.3 Main
// ----------------------------------------------------------------------------

/// Main entry point for the Cerebro relay
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose, fetch }) => {
            handle_validate(&cli.config, *verbose, *fetch).await?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config_found = cli.config.exists();
    let config = if config_found {
        RelayConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        RelayConfig::default()
    };

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    let _log_guard = init_logging(&logging_config)?;
    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    info!("📡 {} v{}", RELAY_FULL_NAME, RELAY_VERSION);

    let (only, refresh) = match &cli.command {
        Some(Commands::Collect { provider, refresh }) => (provider.as_deref(), *refresh),
        _ => (None, false),
    };

    if let Err(e) = handle_collect(&config, only, refresh).await {
        bail!("collection failed ({}): {}", e.category(), e);
    }

    Ok(())
}

// ============================================================================
// SECTION 15: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use test_case::test_case;

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (CompactString::from(*k), CompactString::from(*v)))
            .collect()
    }

    fn pipeline_for(hostname: &str) -> NormalizationPipeline {
        NormalizationPipeline::new(
            FilterChain::default(),
            Arc::new(StaticIdentity::new("ha-test", hostname)),
        )
    }

    fn names(outcome: &CycleOutcome) -> Vec<&str> {
        outcome.records.iter().map(|r| r.name.as_str()).collect()
    }

    fn record<'a>(outcome: &'a CycleOutcome, name: &str) -> &'a NormalizedRecord {
        outcome
            .records
            .iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no record named {}", name))
    }

    fn transport(system: &str) -> SnapshotError {
        SnapshotError::transport(system, FETCH_CALL_NAME, "connection refused")
    }

    /// A fetch that counts its invocations and resolves after `delay`.
    fn counted_fetch(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        result: SnapshotResult<String>,
    ) -> impl FnOnce() -> BoxFuture<'static, SnapshotResult<String>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, AtomicOrdering::SeqCst);
            async move {
                sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    /// Source replaying a fixed script of results.
    struct ScriptedSource {
        script: Mutex<VecDeque<SnapshotResult<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<SnapshotResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl ExpositionSource for ScriptedSource {
        async fn fetch(&self, system_id: &str, _window: FetchWindow) -> SnapshotResult<String> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SnapshotError::failed(system_id, FETCH_CALL_NAME, "script exhausted")))
        }
    }

    #[derive(Default)]
    struct VecSink {
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RecordSink for VecSink {
        async fn deliver(&self, system_id: &str, payload: &str) -> Result<(), SinkError> {
            self.delivered.lock().push((system_id.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn check_with(source: Arc<ScriptedSource>, hostname: &str) -> ExpositionCheck {
        ExpositionCheck::new(
            "ha-test",
            source,
            pipeline_for(hostname),
            SnapshotCache::new(Duration::from_secs(300)),
        )
    }

    // ------------------------------------------------------------------------
    // Core types
    // ------------------------------------------------------------------------

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
        assert_eq!(ts.as_secs(), 1_700_000_000);
        assert_eq!(Timestamp::from_datetime(ts.to_datetime()), ts);
    }

    #[test]
    fn test_family_accepts_kind_suffixes() {
        let histogram = MetricFamily::new("latency", MetricKind::Histogram);
        assert!(histogram.accepts("latency_bucket"));
        assert!(histogram.accepts("latency_count"));
        assert!(!histogram.accepts("latency_total"));
        assert!(!histogram.accepts("latency2"));

        let counter = MetricFamily::new("jobs_total", MetricKind::Counter);
        assert!(counter.accepts("jobs_total"));
        assert!(!counter.accepts("jobs_total_created"));

        let gauge = MetricFamily::new("temp", MetricKind::Gauge);
        assert!(gauge.accepts("temp"));
        assert!(!gauge.accepts("temp_sum"));
    }

    #[test]
    fn test_error_classification() {
        assert!(transport("sys").is_retryable());
        assert!(SnapshotError::timeout("sys", FETCH_CALL_NAME, Duration::from_secs(1)).is_retryable());
        assert!(!SnapshotError::failed("sys", FETCH_CALL_NAME, "boom").is_retryable());

        assert_eq!(transport("sys").class(), "communication");
        assert_eq!(SnapshotError::timeout("sys", FETCH_CALL_NAME, Duration::from_secs(1)).class(), "timeout");
        assert_eq!(SnapshotError::failed("sys", FETCH_CALL_NAME, "boom").class(), "error");

        let err = RelayError::from(ConfigError::invalid_value("cache.ttl", "zero"));
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);

        let err = RelayError::from(transport("sys"));
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Reconnect);
    }

    // ------------------------------------------------------------------------
    // Exposition parser
    // ------------------------------------------------------------------------

    const EXPOSITION: &str = r#"
# HELP http_requests_total Total requests
# TYPE http_requests_total counter
http_requests_total{method="get"} 10
http_requests_total{method="post"} 3 1700000000000
# TYPE latency histogram
latency_bucket{le="0.1"} 1
latency_bucket{le="+Inf"} 2
latency_sum 0.3
latency_count 2
# just a comment
plain 7
"#;

    #[test]
    fn test_parse_groups_families() {
        let families: Vec<MetricFamily> = parse_families(EXPOSITION)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let summary: Vec<(&str, MetricKind, usize)> = families
            .iter()
            .map(|f| (f.name.as_str(), f.kind, f.samples.len()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("http_requests", MetricKind::Counter, 2),
                ("latency", MetricKind::Histogram, 4),
                ("plain", MetricKind::Untyped, 1),
            ]
        );

        let requests = &families[0];
        assert_eq!(requests.help.as_deref(), Some("Total requests"));
        assert_eq!(requests.samples[0].name, "http_requests_total");
        assert_eq!(requests.samples[0].label("method"), Some("get"));
        assert_eq!(requests.samples[0].timestamp, None);
        assert_eq!(requests.samples[1].timestamp, Some(Timestamp::from_millis(1_700_000_000_000)));
        assert_eq!(families[1].samples[1].label("le"), Some("+Inf"));
    }

    #[test]
    fn test_counter_families_drop_total_suffix() {
        let text = "# TYPE node_cpu_seconds_total counter\n\
                    node_cpu_seconds_total 5\n\
                    # TYPE http_requests counter\n\
                    http_requests{code=\"200\"} 3\n\
                    http_requests{code=\"500\"} 1\n";
        let families: Vec<MetricFamily> = parse_families(text).unwrap().collect::<Result<_, _>>().unwrap();

        let summary: Vec<(&str, Vec<&str>)> = families
            .iter()
            .map(|f| (f.name.as_str(), f.samples.iter().map(|s| s.name.as_str()).collect()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("node_cpu_seconds", vec!["node_cpu_seconds_total"]),
                ("http_requests", vec!["http_requests_total", "http_requests_total"]),
            ]
        );
    }

    #[test]
    fn test_counter_family_takes_only_declared_name() {
        let text = "# TYPE jobs_total counter\njobs_total 4\njobs_created 1700000000\n";
        let families: Vec<MetricFamily> = parse_families(text).unwrap().collect::<Result<_, _>>().unwrap();
        let summary: Vec<(&str, MetricKind)> = families.iter().map(|f| (f.name.as_str(), f.kind)).collect();
        assert_eq!(
            summary,
            vec![("jobs", MetricKind::Counter), ("jobs_created", MetricKind::Untyped)]
        );
    }

    #[test]
    fn test_parse_label_escapes_and_trailing_comma() {
        let text = r#"msg{text="a \"quoted\" \\ back\nline",other="x",} 1"#;
        let family = parse_families(text).unwrap().next().unwrap().unwrap();
        let sample = &family.samples[0];
        assert_eq!(sample.label("text"), Some("a \"quoted\" \\ back\nline"));
        assert_eq!(sample.label("other"), Some("x"));
    }

    #[test]
    fn test_parse_special_values() {
        let families: Vec<MetricFamily> = parse_families("a NaN\nb +Inf\nc -Inf\nd 1e3")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let values: Vec<f64> = families.iter().map(|f| f.samples[0].value).collect();
        assert!(values[0].is_nan());
        assert_eq!(values[1], f64::INFINITY);
        assert_eq!(values[2], f64::NEG_INFINITY);
        assert_eq!(values[3], 1000.0);
    }

    #[test]
    fn test_parse_empty_input() {
        assert_eq!(parse_families("").err(), Some(ParseError::Empty));
        assert_eq!(parse_families("  \n\t\n").err(), Some(ParseError::Empty));
    }

    #[test_case("foo{a=\"1\",a=\"2\"} 1" ; "duplicate label")]
    #[test_case("foo{a=\"1\" 1" ; "unterminated label set")]
    #[test_case("foo{a=\"1} 1" ; "unterminated label value")]
    #[test_case("foo abc" ; "non numeric value")]
    #[test_case("foo 1 xyz" ; "non numeric timestamp")]
    #[test_case("foo" ; "missing value")]
    #[test_case("# TYPE foo bogus" ; "unknown type")]
    fn test_parse_syntax_errors(line: &str) {
        let mut families = parse_families(line).unwrap();
        match families.next() {
            Some(Err(ParseError::Syntax { line, .. })) => assert_eq!(line, 1),
            other => panic!("expected syntax error, got {:?}", other),
        }
        assert!(families.next().is_none());
    }

    #[test]
    fn test_parse_error_reports_line_number() {
        let result: Result<Vec<_>, _> = parse_families("ok 1\n\nbad{ 1").unwrap().collect();
        match result {
            Err(ParseError::Syntax { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_is_restartable() {
        let first: Vec<_> = parse_families(EXPOSITION).unwrap().collect();
        let second: Vec<_> = parse_families(EXPOSITION).unwrap().collect();
        assert_eq!(first, second);
    }

    // ------------------------------------------------------------------------
    // Relabel engine
    // ------------------------------------------------------------------------

    #[test_case("ha_cluster_pacemaker_nodes_status_dc", "dc" ; "coordinator")]
    #[test_case("ha_cluster_pacemaker_nodes_status_online", "online" ; "online")]
    #[test_case("ha_cluster_pacemaker_nodes_status_expected_up", "expected_up" ; "expected up")]
    #[test_case("ha_cluster_pacemaker_nodes_status_standby_on_fail", "standby_on_fail" ; "standby on fail")]
    fn test_node_status_relabel(name: &str, status: &str) {
        let sample = Sample::new(name, labels(&[("instname", "node1")]), 1.0);
        let relabeled = RelabelEngine::new().relabel(&sample);

        assert_eq!(relabeled.name, CLUSTER_NODES_METRIC);
        assert_eq!(
            relabeled.labels,
            labels(&[("instname", "node1"), ("node", "node1"), ("status", status), ("type", "member")])
        );
        assert_eq!(relabeled.value, 1.0);
    }

    #[test]
    fn test_node_status_on_fail_suffix() {
        let sample = Sample::new("ha_cluster_pacemaker_nodes_status_on_fail", LabelSet::new(), 1.0);
        let relabeled = RelabelRule::NodeStatus.apply(&sample);
        assert_eq!(relabeled.label("status"), Some("onfail"));
        assert_eq!(relabeled.label("node"), None);
    }

    #[test_case("rsc_ip:node1", "rsc_ip", "node1" ; "composite")]
    #[test_case("rsc_ip", "rsc_ip", "host-a" ; "plain instance")]
    #[test_case("a:b:c", "a:b:c", "host-a" ; "too many parts")]
    fn test_resource_status_relabel(instname: &str, resource: &str, node: &str) {
        let sample = Sample::new(
            "ha_cluster_pacemaker_resources_status_active",
            labels(&[("instname", instname), ("hostname", "host-a")]),
            1.0,
        );
        let relabeled = RelabelEngine::new().relabel(&sample);

        assert_eq!(relabeled.name, CLUSTER_RESOURCES_METRIC);
        assert_eq!(relabeled.label("status"), Some("active"));
        assert_eq!(relabeled.label("resource"), Some(resource));
        assert_eq!(relabeled.label("node"), Some(node));
    }

    #[test]
    fn test_fail_migration_split_is_reversed() {
        let sample = Sample::new(
            "ha_cluster_pacemaker_fail_count",
            labels(&[("instname", "node1:rsc_ip")]),
            2.0,
        );
        let relabeled = RelabelEngine::new().relabel(&sample);
        assert_eq!(relabeled.name, "ha_cluster_pacemaker_fail_count");
        assert_eq!(relabeled.label("resource"), Some("rsc_ip"));
        assert_eq!(relabeled.label("node"), Some("node1"));

        let bare = Sample::new("ha_cluster_pacemaker_migration_threshold", labels(&[("x", "y")]), 5.0);
        assert_eq!(RelabelEngine::new().relabel(&bare), bare);
    }

    #[test]
    fn test_resource_bulk_normalizes_managed_and_role() {
        let engine = RelabelEngine::new();
        let sample = Sample::new(
            "ha_cluster_pacemaker_resources_all",
            labels(&[("managed", "1"), ("role", "Started")]),
            1.0,
        );
        let relabeled = engine.relabel(&sample);
        assert_eq!(relabeled.name, CLUSTER_RESOURCES_METRIC);
        assert_eq!(relabeled.label("managed"), Some("true"));
        assert_eq!(relabeled.label("role"), Some("started"));

        let other = Sample::new("ha_cluster_pacemaker_resources_all", labels(&[("managed", "yes")]), 1.0);
        assert_eq!(engine.relabel(&other).label("managed"), Some("yes"));

        let managed = Sample::new("ha_cluster_pacemaker_resources_managed", labels(&[("instname", "r:n")]), 1.0);
        let relabeled = engine.relabel(&managed);
        assert_eq!(relabeled.label("managed"), Some("True"));
        assert_eq!(relabeled.label("resource"), Some("r"));
        assert_eq!(relabeled.label("node"), Some("n"));
    }

    #[test]
    fn test_relabel_missing_labels_are_skipped() {
        let engine = RelabelEngine::new();

        let status = engine.relabel(&Sample::new(
            "ha_cluster_pacemaker_resources_status_failed",
            LabelSet::new(),
            1.0,
        ));
        assert_eq!(status.labels, labels(&[("status", "failed")]));

        let bulk = engine.relabel(&Sample::new("ha_cluster_pacemaker_resources_all", LabelSet::new(), 1.0));
        assert!(bulk.labels.is_empty());
    }

    #[test]
    fn test_relabel_passthrough_and_rename() {
        let engine = RelabelEngine::new();
        let sample = Sample::new("node_load1", labels(&[("cpu", "0")]), 0.5);
        assert_eq!(engine.relabel(&sample), sample);

        let constraint = Sample::new(
            "ha_cluster_pacemaker_location_constraints_all",
            labels(&[("constraint", "cli-ban")]),
            1.0,
        );
        let relabeled = engine.relabel(&constraint);
        assert_eq!(relabeled.name, CLUSTER_LOCATION_CONSTRAINTS_METRIC);
        assert_eq!(relabeled.labels, constraint.labels);
    }

    proptest! {
        #[test]
        fn prop_relabel_is_deterministic(
            name in prop::sample::select(vec![
                "ha_cluster_pacemaker_nodes_status_dc",
                "ha_cluster_pacemaker_resources_all",
                "ha_cluster_pacemaker_resources_managed",
                "ha_cluster_pacemaker_resources_status_blocked",
                "ha_cluster_pacemaker_fail_count",
                "ha_cluster_pacemaker_location_constraints_all",
                "unrelated_metric",
            ]),
            instname in proptest::option::of("[a-z0-9:]{0,12}"),
            managed in proptest::option::of("[01a-z]{0,3}"),
            value in -1e6f64..1e6f64,
        ) {
            let mut set = LabelSet::new();
            if let Some(instname) = &instname {
                set.insert("instname".into(), instname.as_str().into());
            }
            if let Some(managed) = &managed {
                set.insert("managed".into(), managed.as_str().into());
            }
            let sample = Sample::new(name, set, value);
            let before = sample.clone();

            let engine = RelabelEngine::new();
            let first = engine.relabel(&sample);
            let second = engine.relabel(&sample);

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(&sample, &before);
            prop_assert_eq!(first.value, value);
        }
    }

    // ------------------------------------------------------------------------
    // Filter chain
    // ------------------------------------------------------------------------

    #[test_case("go_gc_duration_seconds", false ; "go runtime")]
    #[test_case("promhttp_metric_handler_requests_total", false ; "promhttp")]
    #[test_case("process_cpu_seconds_total", false ; "process")]
    #[test_case("gopher_count", true ; "go prefix without underscore")]
    #[test_case("ha_cluster_pacemaker_nodes", true ; "cluster metric")]
    fn test_builtin_exclusion(name: &str, accepted: bool) {
        assert_eq!(FilterChain::default().accepts_family(name), accepted);
    }

    #[test]
    fn test_include_is_anchored() {
        let chain = FilterChain::compile(Some("ha_cluster"), None).unwrap();
        assert!(chain.accepts_family("ha_cluster_pacemaker_nodes"));
        assert!(!chain.accepts_family("node_load1"));

        let chain = FilterChain::compile(Some("cluster"), None).unwrap();
        assert!(!chain.accepts_family("ha_cluster_pacemaker_nodes"));
    }

    #[test]
    fn test_pattern_whitespace_is_significant() {
        let chain = FilterChain::compile(Some(" ha_cluster"), Some("foo_ ")).unwrap();
        assert!(!chain.accepts_family("ha_cluster_pacemaker_nodes"));
        assert!(chain.accepts_family(" ha_cluster_pacemaker_nodes"));
        assert!(!chain.suppresses(&Sample::new("foo_bar", LabelSet::new(), 0.0)));
        assert!(chain.suppresses(&Sample::new("foo_ bar", LabelSet::new(), 0.0)));

        // Blank patterns still mean "unset".
        let chain = FilterChain::compile(Some("   "), None).unwrap();
        assert!(chain.accepts_family("ha_cluster_pacemaker_nodes"));
    }

    #[test]
    fn test_suppress_if_zero() {
        let chain = FilterChain::compile(None, Some("^foo_")).unwrap();
        assert!(chain.suppresses(&Sample::new("foo_bar", LabelSet::new(), 0.0)));
        assert!(!chain.suppresses(&Sample::new("foo_bar", LabelSet::new(), 1.0)));
        assert!(!chain.suppresses(&Sample::new("bar_foo_", LabelSet::new(), 0.0)));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = FilterChain::compile(Some("ha_("), None).unwrap_err();
        match &err {
            ConfigError::InvalidPattern { field, pattern, .. } => {
                assert_eq!(field, "include");
                assert_eq!(pattern, "ha_(");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("must be a valid regular expression"));

        assert!(matches!(
            FilterChain::compile(None, Some("[")),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(FilterChain::compile(Some(""), Some("  ")).is_ok());
    }

    proptest! {
        #[test]
        fn prop_family_filter_is_idempotent(
            family_names in prop::collection::vec("(go_|process_|ha_|node_)?[a-z_]{1,10}", 0..16),
            include in proptest::option::of(prop::sample::select(vec!["ha_", "node_|ha_", "[a-m]"])),
        ) {
            let chain = FilterChain::compile(include, None).unwrap();
            let families: Vec<MetricFamily> = family_names
                .iter()
                .map(|n| MetricFamily::new(n.as_str(), MetricKind::Gauge))
                .collect();

            let once = chain.filter_families(families);
            let twice = chain.filter_families(once.clone());
            prop_assert_eq!(once, twice);
        }
    }

    // ------------------------------------------------------------------------
    // Normalization pipeline
    // ------------------------------------------------------------------------

    const COORDINATOR_EXPOSITION: &str = "up 1\nha_cluster_pacemaker_nodes_status_dc{instname=\"node1\"} 1\n";

    #[test]
    fn test_coordinator_node_reports_cluster_data() {
        let outcome = pipeline_for("node1").normalize(Some(COORDINATOR_EXPOSITION));

        assert!(outcome.is_healthy());
        let nodes = record(&outcome, CLUSTER_NODES_METRIC);
        assert_eq!(nodes.labels.get("status").map(|v| v.as_str()), Some("dc"));
        assert_eq!(nodes.labels.get("node").map(|v| v.as_str()), Some("node1"));
        assert_eq!(nodes.labels.get("type").map(|v| v.as_str()), Some("member"));

        let tail = &outcome.records[outcome.records.len() - 2..];
        assert_eq!(tail[0].name, LIVENESS_METRIC);
        assert_eq!(tail[0].value, 1.0);
        assert_eq!(tail[1].name, SELF_METRIC);
    }

    #[test]
    fn test_non_coordinator_node_reports_only_sentinels() {
        let outcome = pipeline_for("node2").normalize(Some(COORDINATOR_EXPOSITION));

        assert!(outcome.is_healthy());
        assert_eq!(names(&outcome), vec![LIVENESS_METRIC, SELF_METRIC]);
        assert_eq!(outcome.records[0].value, 1.0);
    }

    #[test]
    fn test_empty_input_reports_liveness_zero() {
        for text in [Some(""), None] {
            let outcome = pipeline_for("node1").normalize(text);
            assert_eq!(outcome.failure, Some(ParseError::Empty));
            assert_eq!(names(&outcome), vec![LIVENESS_METRIC, SELF_METRIC]);
            assert_eq!(outcome.records[0].value, 0.0);
        }
    }

    #[test]
    fn test_malformed_input_reports_liveness_zero() {
        let outcome = pipeline_for("node1").normalize(Some("foo{bar 1"));
        assert!(matches!(outcome.failure, Some(ParseError::Syntax { .. })));
        assert_eq!(names(&outcome), vec![LIVENESS_METRIC, SELF_METRIC]);
        assert_eq!(outcome.records[0].value, 0.0);
    }

    #[test]
    fn test_suppress_if_zero_in_pipeline() {
        let filters = FilterChain::compile(None, Some("^foo_")).unwrap();
        let pipeline = NormalizationPipeline::new(filters, Arc::new(StaticIdentity::new("ha-test", "node1")));

        let dropped = pipeline.normalize(Some("foo_bar{} 0"));
        assert_eq!(names(&dropped), vec![LIVENESS_METRIC, SELF_METRIC]);

        let kept = pipeline.normalize(Some("foo_bar{} 1"));
        assert_eq!(names(&kept), vec!["foo_bar", LIVENESS_METRIC, SELF_METRIC]);
    }

    #[test]
    fn test_mixed_payload_is_not_gated() {
        let text = "node_load1 0.5\nha_cluster_pacemaker_nodes_status_online{instname=\"node1\"} 1\n";
        let outcome = pipeline_for("node2").normalize(Some(text));
        assert_eq!(
            names(&outcome),
            vec!["node_load1", CLUSTER_NODES_METRIC, LIVENESS_METRIC, SELF_METRIC]
        );
    }

    #[test]
    fn test_excluded_families_never_reach_records() {
        let text = "go_goroutines 12\nprocess_open_fds 9\nnode_load1 0.5\n";
        let outcome = pipeline_for("node1").normalize(Some(text));
        assert_eq!(names(&outcome), vec!["node_load1", LIVENESS_METRIC, SELF_METRIC]);
    }

    #[test]
    fn test_records_share_correlation_and_identity() {
        let identity = StaticIdentity::new("ha-test", "node1").with_metadata("sid", "HA1");
        let pipeline = NormalizationPipeline::new(FilterChain::default(), Arc::new(identity));
        let outcome = pipeline.normalize(Some("a 1 1700000000000\nb 2\n"));

        assert!(outcome.records.iter().all(|r| r.correlation_id == outcome.correlation_id));
        assert!(outcome.records.iter().all(|r| r.instance_identity == "ha-test"));
        assert_eq!(outcome.records[0].generated_at_utc, Timestamp::from_millis(1_700_000_000_000).to_datetime());
        assert_eq!(outcome.records[0].instance_metadata.get("sid").map(String::as_str), Some("HA1"));

        let self_record = record(&outcome, SELF_METRIC);
        assert_eq!(self_record.labels.get(SELF_VERSION_LABEL).map(|v| v.as_str()), Some(RELAY_VERSION));
        assert_eq!(self_record.labels.get(SELF_INSTANCE_LABEL).map(|v| v.as_str()), Some("ha-test"));

        let other = pipeline.normalize(Some("a 1"));
        assert_ne!(other.correlation_id, outcome.correlation_id);
    }

    #[test]
    fn test_serialized_record_layout() {
        let pipeline = pipeline_for("node1");
        let outcome = pipeline.normalize(Some("m{zeta=\"1\",alpha=\"2\"} 3"));
        let payload = pipeline.serialize(&outcome.records).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let first = &parsed[0];
        assert_eq!(first["name"], "m");
        assert_eq!(first["labels"], "{\"alpha\":\"2\",\"zeta\":\"1\"}");
        assert_eq!(first["value"], 3.0);
        assert_eq!(first["instanceMetadata"]["hostname"], "node1");

        let keys = [
            "\"correlationId\"",
            "\"generatedAtUtc\"",
            "\"instanceIdentity\"",
            "\"instanceMetadata\"",
            "\"labels\"",
            "\"name\"",
            "\"value\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| payload.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(!payload.contains(": ") && !payload.contains(", "));
    }

    #[test]
    fn test_non_finite_values_serialize_as_null() {
        let pipeline = pipeline_for("node1");
        let outcome = pipeline.normalize(Some("m NaN"));
        let payload = pipeline.serialize(&outcome.records).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert!(parsed[0]["value"].is_null());
    }

    proptest! {
        #[test]
        fn prop_every_cycle_has_sentinel_records(text in "\\PC{0,200}") {
            let outcome = pipeline_for("node1").normalize(Some(&text));
            let n = outcome.records.len();
            prop_assert!(n >= 2);
            prop_assert_eq!(outcome.records[n - 2].name.as_str(), LIVENESS_METRIC);
            prop_assert_eq!(outcome.records[n - 1].name.as_str(), SELF_METRIC);
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot cache
    // ------------------------------------------------------------------------

    const TTL: Duration = Duration::from_secs(300);
    const CALL_TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_cache_single_flight() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..16).map(|_| {
            cache.get(
                "hana-ha",
                CachePolicy::UseCached,
                CALL_TIMEOUT,
                counted_fetch(&calls, Duration::from_millis(100), Ok("payload".to_string())),
            )
        });
        let results = futures::future::join_all(waiters).await;

        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.joins, 15);

        let cached = cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("other".into())))
            .await
            .unwrap();
        assert_eq!(cached.as_str(), "payload");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_shares_errors_without_storing() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..8).map(|_| {
            cache.get(
                "hana-ha",
                CachePolicy::UseCached,
                CALL_TIMEOUT,
                counted_fetch(&calls, Duration::from_millis(50), Err(transport("hana-ha"))),
            )
        });
        let results = futures::future::join_all(waiters).await;

        assert!(results.iter().all(|r| r.as_ref().err() == Some(&transport("hana-ha"))));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().failures, 1);

        cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("v".into())))
            .await
            .unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_boundary() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));
        let get = |value: &str| {
            cache.get(
                "hana-ha",
                CachePolicy::UseCached,
                CALL_TIMEOUT,
                counted_fetch(&calls, Duration::ZERO, Ok(value.to_string())),
            )
        };

        assert_eq!(get("v1").await.unwrap().as_str(), "v1");
        assert!(cache.expires_at_utc("hana-ha").is_some());

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert_eq!(get("v2").await.unwrap().as_str(), "v1");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.peek("hana-ha").is_none());
        assert!(cache.is_empty());
        assert_eq!(get("v3").await.unwrap().as_str(), "v3");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_empty_snapshot_is_not_reused() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let payload = cache
                .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok(String::new())))
                .await
                .unwrap();
            assert!(payload.is_empty());
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert!(cache.is_empty());
        assert!(cache.peek("hana-ha").is_none());

        let payload = cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("up 1".into())))
            .await
            .unwrap();
        assert_eq!(payload.as_str(), "up 1");
        assert_eq!(cache.peek("hana-ha").unwrap().as_str(), "up 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_oversized_ttl_is_clamped() {
        let cache = SnapshotCache::<String>::new(Duration::from_secs(u64::MAX));
        let calls = Arc::new(AtomicUsize::new(0));

        let payload = cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("v1".into())))
            .await
            .unwrap();
        assert_eq!(payload.as_str(), "v1");
        assert!(cache.expires_at_utc("hana-ha").is_some());

        tokio::time::advance(Duration::from_secs(MAX_SNAPSHOT_TTL_SECS)).await;
        assert!(cache.peek("hana-ha").is_none());
    }

    #[test]
    fn test_fetch_window_clamps_span() {
        let window = FetchWindow::trailing(Duration::MAX);
        assert_eq!(
            window.end - window.start,
            chrono::Duration::seconds(MAX_FETCH_WINDOW_SECS as i64)
        );

        let window = FetchWindow::trailing(Duration::from_secs(60));
        assert_eq!(window.end - window.start, chrono::Duration::seconds(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_failed_refresh_keeps_entry() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("good".into())))
            .await
            .unwrap();

        let refreshed = cache
            .get("hana-ha", CachePolicy::Refresh, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Err(transport("hana-ha"))))
            .await;
        assert!(refreshed.is_err());

        let cached = cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("unused".into())))
            .await
            .unwrap();
        assert_eq!(cached.as_str(), "good");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_refresh_replaces_live_entry() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        for (policy, value) in [(CachePolicy::UseCached, "v1"), (CachePolicy::Refresh, "v2")] {
            cache
                .get("hana-ha", policy, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok(value.into())))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(cache.peek("hana-ha").unwrap().as_str(), "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_timeout_reaches_every_waiter() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..4).map(|_| {
            cache.get(
                "hana-ha",
                CachePolicy::UseCached,
                Duration::from_secs(1),
                counted_fetch(&calls, Duration::from_secs(10), Ok("late".into())),
            )
        });
        let results = futures::future::join_all(waiters).await;

        for result in &results {
            match result {
                Err(SnapshotError::Timeout { system, timeout_ms, .. }) => {
                    assert_eq!(system, "hana-ha");
                    assert_eq!(*timeout_ms, 1000);
                }
                other => panic!("expected timeout, got {:?}", other),
            }
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_abandoned_waiter_does_not_cancel_call() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let spawn_waiter = |cache: SnapshotCache<String>, calls: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                cache
                    .get(
                        "hana-ha",
                        CachePolicy::UseCached,
                        CALL_TIMEOUT,
                        counted_fetch(&calls, Duration::from_secs(5), Ok("v".into())),
                    )
                    .await
            })
        };

        let first = spawn_waiter(cache.clone(), Arc::clone(&calls));
        while cache.stats().fetches == 0 {
            tokio::task::yield_now().await;
        }
        let second = spawn_waiter(cache.clone(), Arc::clone(&calls));
        while cache.stats().joins == 0 {
            tokio::task::yield_now().await;
        }

        first.abort();
        let result = second.await.unwrap();
        assert_eq!(result.unwrap().as_str(), "v");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_call_dropped_when_all_waiters_leave() {
        let cache = SnapshotCache::<String>::new(TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let cache = cache.clone();
            let fetch = counted_fetch(&calls, Duration::from_secs(5), Ok("v".into()));
            tokio::spawn(async move { cache.get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, fetch).await })
        };
        while cache.stats().fetches == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        let result = cache
            .get("hana-ha", CachePolicy::UseCached, CALL_TIMEOUT, counted_fetch(&calls, Duration::ZERO, Ok("fresh".into())))
            .await
            .unwrap();
        assert_eq!(result.as_str(), "fresh");
        assert_eq!(cache.stats().fetches, 2);
        assert_eq!(cache.stats().joins, 0);
    }

    #[tokio::test]
    async fn test_global_cache_is_shared() {
        let a = SnapshotCache::<String>::init_global(TTL);
        let b = SnapshotCache::<String>::global();
        assert!(std::ptr::eq(a, b));
        assert_eq!(b.ttl(), TTL);
    }

    // ------------------------------------------------------------------------
    // Exposition check
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_check_retries_transport_failures() {
        let source = ScriptedSource::new(vec![
            Err(transport("ha-test")),
            Err(transport("ha-test")),
            Ok("node_load1 0.5".into()),
        ]);
        let check = check_with(Arc::clone(&source), "node1");

        let report = check.run_cycle().await.unwrap();
        assert!(report.is_healthy());
        assert_eq!(source.calls(), 3);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.payload_hash, xxh3_64(report.payload.as_bytes()));
        assert!(check.last_run().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_gives_up_after_retries() {
        let source = ScriptedSource::new((0..5).map(|_| Err(transport("ha-test"))).collect());
        let check = check_with(Arc::clone(&source), "node1").with_retry(RetryPolicy {
            retries: 2,
            ..RetryPolicy::default()
        });

        let report = check.run_cycle().await.unwrap();
        assert_eq!(source.calls(), 3);
        assert!(matches!(report.failure, Some(RelayError::Snapshot(SnapshotError::Transport { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_does_not_retry_generic_failures() {
        let source = ScriptedSource::new(vec![Err(SnapshotError::failed("ha-test", FETCH_CALL_NAME, "bad credentials"))]);
        let check = check_with(Arc::clone(&source), "node1");

        let report = check.run_cycle().await.unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(report.record_count, 2);

        let parsed: serde_json::Value = serde_json::from_str(&report.payload).unwrap();
        assert_eq!(parsed[0]["name"], LIVENESS_METRIC);
        assert_eq!(parsed[0]["value"], 0.0);
        assert_eq!(parsed[1]["name"], SELF_METRIC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_uses_cached_snapshot() {
        let source = ScriptedSource::new(vec![Ok("a 1".into()), Ok("b 1".into())]);
        let check = check_with(Arc::clone(&source), "node1");

        check.run_cycle().await.unwrap();
        let second = check.run_cycle().await.unwrap();
        assert_eq!(source.calls(), 1);
        assert!(second.payload.contains("\"name\":\"a\""));

        let refreshed = check.with_policy(CachePolicy::Refresh).run_cycle().await.unwrap();
        assert!(refreshed.payload.contains("\"name\":\"b\""));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_refetches_after_empty_snapshot() {
        let source = ScriptedSource::new(vec![Ok(String::new()), Ok("a 1".into())]);
        let check = check_with(Arc::clone(&source), "node1");

        let first = check.run_cycle().await.unwrap();
        assert!(matches!(first.failure, Some(RelayError::Parse(ParseError::Empty))));

        let second = check.run_cycle().await.unwrap();
        assert!(second.is_healthy());
        assert!(second.payload.contains("\"name\":\"a\""));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_check_collect_into_sink() {
        let source = ScriptedSource::new(vec![Ok(COORDINATOR_EXPOSITION.into())]);
        let check = check_with(source, "node1");
        let sink = VecSink::default();

        let report = check.collect_into(&sink).await.unwrap();
        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "ha-test");
        assert_eq!(delivered[0].1, report.payload);
    }

    #[tokio::test]
    async fn test_validate_source() {
        let check = check_with(ScriptedSource::new(vec![Ok("go_gc 1\nha_cluster_x 1\n".into())]), "node1");
        assert_eq!(check.validate_source().await.unwrap(), 2);

        // Runtime-only endpoints are still valid sources.
        let check = check_with(ScriptedSource::new(vec![Ok("go_gc 1\nprocess_open_fds 9\n".into())]), "node1");
        assert_eq!(check.validate_source().await.unwrap(), 2);

        let check = check_with(ScriptedSource::new(vec![Ok("# plain comment\n# another one\n".into())]), "node1");
        assert!(matches!(
            check.validate_source().await,
            Err(RelayError::Parse(ParseError::NoFamilies))
        ));

        let check = check_with(ScriptedSource::new(vec![Ok(String::new())]), "node1");
        assert!(matches!(check.validate_source().await, Err(RelayError::Parse(ParseError::Empty))));
    }

    #[test]
    fn test_invalid_pattern_fails_before_fetch() {
        let mut config = RelayConfig::default();
        let mut provider = ProviderConfig::new("ha-test", "http://127.0.0.1:9/metrics");
        provider.suppress_if_zero = Some("(unclosed".into());
        config.providers.push(provider.clone());

        let err = ExpositionCheck::from_config(&config, &provider, SnapshotCache::new(TTL)).err();
        assert!(matches!(err, Some(RelayError::Config(ConfigError::InvalidPattern { .. }))));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPattern { .. })));
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.cache.ttl, Duration::from_secs(DEFAULT_SNAPSHOT_TTL_SECS));
        assert!(config.cache.enabled);
        assert_eq!(config.cache_policy(), CachePolicy::UseCached);
        assert_eq!(config.retry.retries, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(config.retry.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.retry.delay_for(2), Duration::from_secs(4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_str() {
        let config = RelayConfig::from_str(
            r#"
            [cache]
            ttl = "10m"
            enabled = false

            [filters]
            suppress_if_zero = "ha_cluster_pacemaker_fail_count"

            [[providers]]
            id = "hana-ha"
            url = "http://10.0.0.5:9664/metrics"
            timeout = "3s"
            include = "ha_cluster"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.cache_policy(), CachePolicy::Refresh);
        let provider = config.provider("hana-ha").unwrap();
        assert_eq!(provider.timeout, Duration::from_secs(3));
        assert_eq!(provider.window, Duration::from_secs(DEFAULT_FETCH_WINDOW_SECS));

        let chain = config.filter_chain_for(provider).unwrap();
        assert!(!chain.accepts_family("node_load1"));
        assert!(chain.suppresses(&Sample::new("ha_cluster_pacemaker_fail_count", LabelSet::new(), 0.0)));
    }

    #[test_case("[cache]\nttl = \"0s\"" ; "zero ttl")]
    #[test_case("[retry]\nbackoff_multiplier = 0.5" ; "shrinking backoff")]
    #[test_case("[cache]\nttl = \"1000000years\"" ; "ttl beyond bound")]
    #[test_case("[[providers]]\nid = \"a\"\nurl = \"http://x\"\nwindow = \"100years\"" ; "window beyond bound")]
    #[test_case("[logging]\nformat = \"xml\"" ; "unknown log format")]
    #[test_case("[[providers]]\nid = \"a\"\nurl = \"http://x\"\n[[providers]]\nid = \"a\"\nurl = \"http://y\"" ; "duplicate provider")]
    fn test_config_rejects_invalid_values(toml_str: &str) {
        assert!(matches!(
            RelayConfig::from_str(toml_str),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_rejects_malformed_toml() {
        assert!(matches!(
            RelayConfig::from_str("[cache\nttl = 1"),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_config_load_with_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "[cache]\nttl = \"2m\"\n\n[[providers]]\nid = \"hana-ha\"\nurl = \"http://localhost:9664/metrics\"\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.cache.ttl, Duration::from_secs(120));
        assert_eq!(config.providers.len(), 1);

        std::env::set_var("CEREBRO_RELAY_CACHE__TTL", "45s");
        let overridden = RelayConfig::load(&path);
        std::env::remove_var("CEREBRO_RELAY_CACHE__TTL");
        assert_eq!(overridden.unwrap().cache.ttl, Duration::from_secs(45));

        assert!(matches!(
            RelayConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = RelayConfig::generate_default_config();
        let config = RelayConfig::from_str(&generated).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_identity_for_provider() {
        let mut general = GeneralConfig::default();
        general.hostname = Some("node1".into());
        general.metadata.insert("sid".into(), "HA1".into());
        let provider = ProviderConfig::new("hana-ha", "http://localhost:9664/metrics");

        let identity = StaticIdentity::for_provider(&general, &provider);
        assert_eq!(identity.instance_identity(), "hana-ha");
        assert_eq!(identity.hostname(), Some("node1"));
        assert_eq!(identity.instance_metadata().get("sid").map(String::as_str), Some("HA1"));
    }
}
