//! Process session.
//!
//! [`GpuBlasBuilder`] wires options, heuristic, exclusion regions, the
//! interceptor and the placer into one [`GpuBlas`]. The process-wide
//! session used by the interposed symbols lives in a [`Lifecycle`] and is
//! created on first use from `GPUBLAS_OPTIONS`.

use std::sync::Arc;

use gpublas_membrane::config::HELP;
use gpublas_membrane::{
    ConfigError, DefinitionError, ExcludedRegions, Heuristic, HeuristicError, Lifecycle,
    LogEvent, LogLevel, Logger, MetricsSnapshot, ObjectAllocator, ObjectRegistry, Options,
    ParsedOptions, PlacementMetrics, RegionError, TrackingDefinition,
};
use serde_json::json;
use thiserror::Error;

use crate::allocator::{ManagedAllocator, SystemAllocator};
use crate::fatal::fatal;
use crate::interceptor::{Interceptor, ReentryGuard};
use crate::placement::{CallPlacement, Placer, Tracing};
use crate::runtime::{DeviceRuntime, RuntimeError};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Heuristic(#[from] HeuristicError),
    #[error(transparent)]
    Regions(#[from] RegionError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Runtime selected at compile time: CUDA, then OpenCL, then host emulation.
#[cfg(feature = "cuda")]
pub fn default_runtime() -> Result<Arc<dyn DeviceRuntime>, RuntimeError> {
    Ok(Arc::new(crate::runtime::cuda::CudaRuntime::new()?))
}

#[cfg(all(feature = "opencl", not(feature = "cuda")))]
pub fn default_runtime() -> Result<Arc<dyn DeviceRuntime>, RuntimeError> {
    Ok(Arc::new(crate::runtime::opencl::OpenClRuntime::new()?))
}

#[cfg(not(any(feature = "cuda", feature = "opencl")))]
pub fn default_runtime() -> Result<Arc<dyn DeviceRuntime>, RuntimeError> {
    Ok(Arc::new(crate::runtime::host::HostRuntime::new()))
}

#[derive(Debug, Default)]
pub struct GpuBlasBuilder {
    parsed: ParsedOptions,
    runtime: Option<Arc<dyn DeviceRuntime>>,
    host: Option<Arc<dyn ObjectAllocator>>,
    logger: Option<Arc<Logger>>,
    regions: Option<ExcludedRegions>,
}

impl GpuBlasBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an options string (`GPUBLAS_OPTIONS` syntax).
    pub fn options_str(self, text: &str) -> Result<Self, ConfigError> {
        Ok(self.parsed(Options::parse(text)?))
    }

    #[must_use]
    pub fn parsed(mut self, parsed: ParsedOptions) -> Self {
        self.parsed = parsed;
        self
    }

    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.parsed = ParsedOptions {
            options,
            warnings: Vec::new(),
        };
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn DeviceRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Allocator for host-placed objects. Defaults to the C heap.
    #[must_use]
    pub fn host_allocator(mut self, host: Arc<dyn ObjectAllocator>) -> Self {
        self.host = Some(host);
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Use these regions instead of scanning the live memory map.
    #[must_use]
    pub fn regions(mut self, regions: ExcludedRegions) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn build(self) -> Result<GpuBlas, ContextError> {
        let logger = self.logger.unwrap_or_else(|| Arc::new(Logger::stderr()));
        let ParsedOptions { options, warnings } = self.parsed;

        for warning in &warnings {
            logger.emit(&LogEvent::new(LogLevel::Warn, "option_warning").with_message(warning.as_str()));
        }
        if options.help {
            logger.raw(HELP);
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => default_runtime()?,
        };
        let heuristic = options
            .heuristic
            .as_ref()
            .map(|spec| Heuristic::from_spec(spec, options.seed))
            .transpose()?;
        let regions = match self.regions {
            Some(regions) => regions,
            None => ExcludedRegions::scan(options.exclusion_patterns().as_slice())?,
        };
        let definition = options.track.as_deref().map(TrackingDefinition::load).transpose()?;

        let registry = Arc::new(ObjectRegistry::new());
        let metrics = Arc::new(PlacementMetrics::new());
        let interceptor = Interceptor::new(
            self.host.unwrap_or_else(SystemAllocator::shared),
            ManagedAllocator::shared(Arc::clone(&runtime), Arc::clone(&logger)),
            Arc::clone(&registry),
            regions,
            heuristic,
            Arc::clone(&metrics),
        );
        if let Some(definition) = &definition {
            interceptor.pin(definition);
        }
        let placer = Placer::new(
            Arc::clone(&runtime),
            registry,
            Arc::clone(&metrics),
            Arc::clone(&logger),
            Tracing::from(&options),
        );

        logger.emit(
            &LogEvent::new(LogLevel::Info, "init")
                .with_symbol(runtime.name())
                .with_message("initialized")
                .with_details(json!({
                    "policy": interceptor.heuristic().map(Heuristic::policy),
                    "excluded_regions": interceptor.regions().len(),
                    "pinned": interceptor.registry().sites().pinned_len(),
                    "concurrent_managed_access": runtime.concurrent_managed_access(),
                })),
        );

        Ok(GpuBlas {
            options,
            runtime,
            interceptor,
            placer,
            metrics,
            logger,
        })
    }
}

/// One configured session.
#[derive(Debug)]
pub struct GpuBlas {
    options: Options,
    runtime: Arc<dyn DeviceRuntime>,
    interceptor: Interceptor,
    placer: Placer,
    metrics: Arc<PlacementMetrics>,
    logger: Arc<Logger>,
}

impl GpuBlas {
    #[must_use]
    pub fn builder() -> GpuBlasBuilder {
        GpuBlasBuilder::new()
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    #[must_use]
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    #[must_use]
    pub fn placer(&self) -> &Placer {
        &self.placer
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        self.interceptor.registry()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Start placing the operands of one BLAS call.
    #[must_use]
    pub fn call(&self) -> CallPlacement<'_> {
        self.placer.call()
    }

    /// Write the statistics report (when `stats=` is set) and log teardown.
    /// Report failures are logged, not fatal.
    pub fn shutdown(&self) {
        let _guard = ReentryGuard::hold();
        if let Some(path) = &self.options.stats {
            if let Err(err) = self.metrics.write_report(path) {
                self.logger.emit(
                    &LogEvent::new(LogLevel::Error, "report_failure").with_message(err.to_string()),
                );
            }
        }
        let snapshot = self.metrics.snapshot();
        self.logger.emit(
            &LogEvent::new(LogLevel::Info, "shutdown")
                .with_symbol(self.runtime.name())
                .with_message("decommissioned")
                .with_details(json!(snapshot)),
        );
    }
}

static GLOBAL: Lifecycle<GpuBlas> = Lifecycle::new();

/// Process-wide session, created from `GPUBLAS_OPTIONS` on first call.
///
/// Returns `None` for a reentrant call made while the session is being
/// built and after teardown. Configuration errors abort.
pub fn init_global(host: Arc<dyn ObjectAllocator>) -> Option<&'static GpuBlas> {
    let built = GLOBAL.try_get_or_init(|| {
        let _guard = ReentryGuard::hold();
        GpuBlasBuilder::new()
            .parsed(Options::from_env()?)
            .host_allocator(host)
            .build()
    });
    match built {
        Ok(session) => session,
        Err(err) => fatal(&Logger::stderr(), "init", err),
    }
}

/// The process-wide session if it is ready.
#[must_use]
pub fn global() -> Option<&'static GpuBlas> {
    GLOBAL.get()
}

/// The process-wide session in any state after it was first ready. Objects
/// allocated during the session may be released after teardown.
#[must_use]
pub fn last_session() -> Option<&'static GpuBlas> {
    GLOBAL.peek()
}

/// Tear the process-wide session down once. Returns false if it was never
/// ready or already torn down.
pub fn shutdown_global() -> bool {
    GLOBAL.shutdown(GpuBlas::shutdown)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::placement::Direction;
    use crate::runtime::host::HostRuntime;
    use gpublas_membrane::{CallSite, CopyDirection, HeuristicPolicy, MemoryLog, parse_report};

    fn session(options: &str) -> (GpuBlas, Arc<HostRuntime>, MemoryLog) {
        let rt = Arc::new(HostRuntime::new());
        let (logger, log) = Logger::memory();
        let gpublas = GpuBlasBuilder::new()
            .options_str(options)
            .unwrap()
            .runtime(rt.clone())
            .logger(Arc::new(logger))
            .regions(ExcludedRegions::empty())
            .build()
            .unwrap();
        (gpublas, rt, log)
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("gpublas-context-{}-{name}", std::process::id()))
    }

    #[test]
    fn host_placed_vector_is_one_miss_and_one_copy() {
        let (gpublas, rt, log) = session("trace_copy;heuristic=false");
        let site = CallSite(0x4005d6);
        let x = gpublas.interceptor().allocate(16, site).unwrap();
        assert!(gpublas.registry().lookup(x.as_ptr() as usize).is_some());

        let mut call = gpublas.call();
        unsafe { call.place(x.as_ptr(), 16) }.unwrap();
        call.finish().unwrap();

        let snap = gpublas.metrics();
        assert_eq!((snap.hits, snap.misses), (0, 1));
        let copies = log.named("copy");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].bytes, Some(16));
        assert_eq!(copies[0].direction, Some(CopyDirection::HostToDevice));
        assert_eq!(rt.live_device_buffers(), 0);

        unsafe { gpublas.interceptor().release(x.as_ptr(), site) };
        assert!(gpublas.registry().is_empty());
    }

    #[test]
    fn managed_vector_is_a_hit_without_copies() {
        let (gpublas, rt, log) = session("trace_copy;heuristic=true");
        let site = CallSite(0x1000);
        let y = gpublas.interceptor().allocate(64, site).unwrap();
        assert_eq!(rt.live_managed_buffers(), 1);

        let mut call = gpublas.call();
        let d = unsafe { call.place_output(y.as_ptr(), 64) }.unwrap();
        assert_eq!(d.addr(), y.as_ptr() as usize);
        call.finish().unwrap();

        let snap = gpublas.metrics();
        assert_eq!((snap.hits, snap.misses), (1, 0));
        assert_eq!(snap.managed_bytes, 64);
        assert!(log.named("copy").is_empty());

        unsafe { gpublas.interceptor().release(y.as_ptr(), site) };
        assert_eq!(rt.live_managed_buffers(), 0);
    }

    #[test]
    fn no_heuristic_means_no_tracking() {
        let (gpublas, _rt, _log) = session("");
        assert!(!gpublas.interceptor().tracking_enabled());
        let p = gpublas.interceptor().allocate(8, CallSite(1)).unwrap();
        assert!(gpublas.registry().is_empty());
        unsafe { gpublas.interceptor().release(p.as_ptr(), CallSite(1)) };
    }

    #[test]
    fn unknown_tokens_are_logged_as_warnings() {
        let (_gpublas, _rt, log) = session("frobnicate;heuristic=false");
        let warnings = log.named("option_warning");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.as_deref().unwrap_or("").contains("frobnicate"));
    }

    #[test]
    fn help_is_printed_raw() {
        let (_gpublas, _rt, log) = session("help");
        assert!(log.lines().iter().any(|l| l.starts_with("gpublas options:")));
    }

    #[test]
    fn init_event_reports_policy() {
        let (_gpublas, _rt, log) = session("heuristic=random;seed=7");
        let init = &log.named("init")[0];
        assert_eq!(init.message.as_deref(), Some("initialized"));
        assert_eq!(init.symbol.as_deref(), Some("host"));
        let details = init.details.as_ref().unwrap();
        assert_eq!(details["policy"], json!(HeuristicPolicy::Random));
    }

    #[test]
    fn invalid_heuristic_is_a_config_error() {
        let err = GpuBlasBuilder::new().options_str("heuristic=sometimes").unwrap_err();
        assert_eq!(err, ConfigError::InvalidHeuristic("sometimes".to_string()));
    }

    #[test]
    fn missing_oracle_trace_fails_build() {
        let (logger, _log) = Logger::memory();
        let err = GpuBlasBuilder::new()
            .options_str("heuristic=oracle:/nonexistent/gpublas/trace.jsonl")
            .unwrap()
            .runtime(Arc::new(HostRuntime::new()))
            .logger(Arc::new(logger))
            .regions(ExcludedRegions::empty())
            .build()
            .unwrap_err();
        assert!(matches!(err, ContextError::Heuristic(HeuristicError::Read { .. })));
    }

    #[test]
    fn track_file_pins_call_sites() {
        let path = temp_path("track.jsonl");
        std::fs::write(&path, "{\"alloc\": \"malloc\", \"call_site\": \"0x77\", \"size\": 32}\n").unwrap();
        let (gpublas, rt, _log) = session(&format!("track={}", path.display()));
        assert!(gpublas.interceptor().tracking_enabled());

        let pinned = gpublas.interceptor().allocate(32, CallSite(0x77)).unwrap();
        let other = gpublas.interceptor().allocate(32, CallSite(0x78)).unwrap();
        assert!(gpublas.registry().lookup(pinned.as_ptr() as usize).unwrap().is_device_visible());
        assert!(gpublas.registry().lookup(other.as_ptr() as usize).is_none());
        assert_eq!(rt.live_managed_buffers(), 1);

        unsafe {
            gpublas.interceptor().release(pinned.as_ptr(), CallSite(0x77));
            gpublas.interceptor().release(other.as_ptr(), CallSite(0x78));
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn shutdown_writes_report_and_logs() {
        let path = temp_path("stats.csv");
        let (gpublas, _rt, log) = session(&format!("heuristic=false;stats={}", path.display()));
        let host = [0u8; 8];
        let mut call = gpublas.call();
        unsafe { call.place(host.as_ptr(), 8) }.unwrap();
        call.finish().unwrap();

        gpublas.shutdown();
        let report = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_report(&report).unwrap(), (0, 1));
        let shutdown = &log.named("shutdown")[0];
        assert_eq!(shutdown.message.as_deref(), Some("decommissioned"));
        assert_eq!(shutdown.details.as_ref().unwrap()["misses"], json!(1));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn matrix_call_through_session() {
        let (gpublas, rt, _log) = session("heuristic=false");
        let shape = crate::runtime::MatrixShape::dense(3, 2, crate::runtime::ElementKind::F32);
        let mut a: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut call = gpublas.call();
        unsafe { call.place_matrix(a.as_mut_ptr().cast(), shape, Direction::InOut) }.unwrap();
        call.finish().unwrap();
        assert_eq!(a, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(rt.live_device_buffers(), 0);
    }
}
