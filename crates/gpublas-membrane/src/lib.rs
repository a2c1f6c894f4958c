//! Object tracking membrane for gpublas.
//!
//! This crate holds the bookkeeping that sits between intercepted allocator
//! calls and BLAS placement decisions. Nothing here touches an accelerator;
//! the runtime-facing pieces live in `gpublas-core`.
//!
//! # Architecture
//!
//! - **Exclusion regions** (`regions`): address ranges of accelerator runtime
//!   libraries, read from the live memory map, inside which tracking is bypassed
//! - **Allocation records** (`record`): immutable provenance for a call pattern
//! - **Call-site table** (`callsite`): composite-key deduplication of records and
//!   pinned patterns from tracking definition files
//! - **Object registry** (`registry`): live pointer to `ObjectInfo` map with
//!   interior-pointer lookup
//! - **Heuristics** (`heuristic`): host/device decision policies, including
//!   deterministic oracle replay
//! - **Lifecycle** (`lifecycle`): atomic once-only init/teardown state machine
//! - **Configuration** (`config`): `GPUBLAS_OPTIONS` parsing
//! - **Logging** (`log`): structured JSONL events
//! - **Metrics** (`metrics`): atomic hit/miss counters and the teardown report

#![deny(unsafe_code)]

pub mod callsite;
pub mod config;
pub mod heuristic;
pub mod lifecycle;
pub mod log;
pub mod metrics;
pub mod record;
pub mod regions;
pub mod registry;

pub use callsite::{CallSiteTable, DefinitionError, SiteKey, TrackingDefinition};
pub use config::{ConfigError, HeuristicSpec, Options, ParsedOptions};
pub use heuristic::{Heuristic, HeuristicError, HeuristicPolicy, OracleEntry, OracleTrace};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use log::{CopyDirection, LogEvent, LogLevel, LogSink, Logger, MemoryLog};
pub use metrics::{MetricsSnapshot, PlacementMetrics, ReportError, parse_report};
pub use record::{AllocSym, AllocationRecord, CallSite, ObjectAllocator, Placement};
pub use regions::{ExcludedRegion, ExcludedRegions, RegionError};
pub use registry::{ObjectInfo, ObjectRegistry};
