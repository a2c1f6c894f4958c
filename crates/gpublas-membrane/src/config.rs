//! Runtime options.
//!
//! Options come from the `GPUBLAS_OPTIONS` environment variable as a
//! semicolon-separated list:
//!
//! - `help`: print usage once
//! - `debug_execfail`: log backend call failures
//! - `debug_exec`: log every backend call
//! - `trace_copy`: log every host/device copy with its byte count
//! - `heuristic=<random|true|false|oracle:PATH>`: placement policy for tracked allocations
//! - `track=PATH`: object-tracking definition file
//! - `stats=PATH`: where to write the hit/miss report at teardown
//! - `seed=N`: seed for the `random` heuristic
//! - `exclude=PATTERN`: extra library pattern whose mappings are never tracked
//!
//! Unknown tokens produce a warning and are otherwise ignored. A bad
//! heuristic value is a hard error: continuing with a guessed policy would
//! make a run silently non-reproducible.

use std::path::PathBuf;

use thiserror::Error;

/// Environment variable holding the options string.
pub const OPTIONS_ENV: &str = "GPUBLAS_OPTIONS";

/// Libraries whose mappings are always excluded from tracking.
pub const DEFAULT_EXCLUDED_LIBRARIES: &[&str] = &[
    "libcuda",
    "libcudart",
    "libcublas",
    "libnvidia",
    "libOpenCL",
    "libclblast",
    "libgpublas",
];

/// Usage text for the `help` option.
pub const HELP: &str = "\
gpublas options:
You can chain these options with a semicolon (;)
help                 -- print help
debug_execfail       -- debug kernel failures
debug_exec           -- debug kernel invocations
trace_copy           -- trace copies between CPU and GPU
heuristic=<policy>   -- placement of tracked allocations:
                        random, true, false, oracle:<trace file>
track=<file>         -- use an object tracking definition
stats=<file>         -- write hit/miss statistics at exit
seed=<n>             -- seed for heuristic=random
exclude=<pattern>    -- never track allocations from matching libraries
";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid heuristic '{0}' (expected random, true, false or oracle:<path>)")]
    InvalidHeuristic(String),
    #[error("option '{0}' requires a value")]
    MissingValue(&'static str),
    #[error("invalid seed '{0}'")]
    InvalidSeed(String),
}

/// Placement policy requested by the options string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeuristicSpec {
    Random,
    AlwaysDevice,
    AlwaysHost,
    Oracle(PathBuf),
}

impl HeuristicSpec {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "random" => Ok(Self::Random),
            "true" => Ok(Self::AlwaysDevice),
            "false" => Ok(Self::AlwaysHost),
            _ => match value.strip_prefix("oracle:") {
                Some(path) if !path.is_empty() => Ok(Self::Oracle(PathBuf::from(path))),
                _ => Err(ConfigError::InvalidHeuristic(value.to_string())),
            },
        }
    }
}

/// Parsed option set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub help: bool,
    pub debug_execfail: bool,
    pub debug_exec: bool,
    pub trace_copy: bool,
    pub heuristic: Option<HeuristicSpec>,
    pub track: Option<PathBuf>,
    pub stats: Option<PathBuf>,
    pub seed: Option<u64>,
    pub exclude: Vec<String>,
}

/// Options plus the warnings produced while parsing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    pub options: Options,
    pub warnings: Vec<String>,
}

impl Options {
    /// Parse an options string.
    pub fn parse(text: &str) -> Result<ParsedOptions, ConfigError> {
        let mut options = Self::default();
        let mut warnings = Vec::new();

        for token in text.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (token, None),
            };
            match (name, value) {
                ("help", None) => options.help = true,
                ("debug_execfail", None) => options.debug_execfail = true,
                ("debug_exec", None) => options.debug_exec = true,
                ("trace_copy", None) => options.trace_copy = true,
                ("heuristic", Some(v)) => options.heuristic = Some(HeuristicSpec::parse(v)?),
                ("heuristic", None) => return Err(ConfigError::MissingValue("heuristic")),
                ("track", Some(v)) if !v.is_empty() => options.track = Some(PathBuf::from(v)),
                ("track", _) => return Err(ConfigError::MissingValue("track")),
                ("stats", Some(v)) if !v.is_empty() => options.stats = Some(PathBuf::from(v)),
                ("stats", _) => return Err(ConfigError::MissingValue("stats")),
                ("seed", Some(v)) => {
                    options.seed = Some(
                        v.parse::<u64>()
                            .map_err(|_| ConfigError::InvalidSeed(v.to_string()))?,
                    );
                }
                ("exclude", Some(v)) if !v.is_empty() => options.exclude.push(v.to_string()),
                _ => warnings.push(format!(
                    "unknown option '{token}'. Set {OPTIONS_ENV}=help."
                )),
            }
        }

        Ok(ParsedOptions { options, warnings })
    }

    /// Parse `GPUBLAS_OPTIONS`; an unset variable yields defaults.
    pub fn from_env() -> Result<ParsedOptions, ConfigError> {
        match std::env::var(OPTIONS_ENV) {
            Ok(text) => Self::parse(&text),
            Err(_) => Ok(ParsedOptions::default()),
        }
    }

    /// Whether allocations are tracked at all.
    #[must_use]
    pub fn tracking_enabled(&self) -> bool {
        self.heuristic.is_some() || self.track.is_some()
    }

    /// Default runtime library patterns plus any `exclude=` entries.
    #[must_use]
    pub fn exclusion_patterns(&self) -> Vec<String> {
        DEFAULT_EXCLUDED_LIBRARIES
            .iter()
            .map(|s| (*s).to_string())
            .chain(self.exclude.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_heuristic() {
        let parsed = Options::parse("trace_copy;heuristic=false").unwrap();
        assert!(parsed.warnings.is_empty());
        assert!(parsed.options.trace_copy);
        assert!(!parsed.options.debug_exec);
        assert_eq!(parsed.options.heuristic, Some(HeuristicSpec::AlwaysHost));
        assert!(parsed.options.tracking_enabled());
    }

    #[test]
    fn parses_every_heuristic_value() {
        assert_eq!(HeuristicSpec::parse("random"), Ok(HeuristicSpec::Random));
        assert_eq!(HeuristicSpec::parse("true"), Ok(HeuristicSpec::AlwaysDevice));
        assert_eq!(HeuristicSpec::parse("false"), Ok(HeuristicSpec::AlwaysHost));
        assert_eq!(
            HeuristicSpec::parse("oracle:/tmp/run.trace"),
            Ok(HeuristicSpec::Oracle(PathBuf::from("/tmp/run.trace")))
        );
    }

    #[test]
    fn invalid_heuristic_is_an_error() {
        assert_eq!(
            Options::parse("heuristic=sometimes"),
            Err(ConfigError::InvalidHeuristic("sometimes".into()))
        );
        assert_eq!(
            Options::parse("heuristic=oracle:"),
            Err(ConfigError::InvalidHeuristic("oracle:".into()))
        );
    }

    #[test]
    fn unknown_tokens_warn_and_are_ignored() {
        let parsed = Options::parse("debug_exec;;bogus;debug_execfail").unwrap();
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("bogus"));
        assert!(parsed.options.debug_exec);
        assert!(parsed.options.debug_execfail);
        assert!(!parsed.options.tracking_enabled());
    }

    #[test]
    fn valued_options() {
        let parsed =
            Options::parse("help;track=/tmp/defs;stats=/tmp/out.csv;seed=7;exclude=libfoo").unwrap();
        let o = parsed.options;
        assert!(o.help);
        assert_eq!(o.track, Some(PathBuf::from("/tmp/defs")));
        assert_eq!(o.stats, Some(PathBuf::from("/tmp/out.csv")));
        assert_eq!(o.seed, Some(7));
        assert!(o.exclusion_patterns().iter().any(|p| p == "libfoo"));
        assert!(o.exclusion_patterns().iter().any(|p| p == "libcublas"));
    }

    #[test]
    fn missing_values_are_errors() {
        assert_eq!(Options::parse("track="), Err(ConfigError::MissingValue("track")));
        assert_eq!(Options::parse("heuristic"), Err(ConfigError::MissingValue("heuristic")));
        assert_eq!(Options::parse("seed=x"), Err(ConfigError::InvalidSeed("x".into())));
    }

    #[test]
    fn empty_string_is_default() {
        assert_eq!(Options::parse("").unwrap(), ParsedOptions::default());
    }
}
