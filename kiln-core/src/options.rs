//! The public configuration surface: plain, `serde`-deserializable option
//! structs assembled either programmatically via [`BuildOptionsBuilder`] or
//! from environment variables via [`BuildOptions::from_env`], rather than
//! one boolean-heavy struct literal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::Strategy;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BuildOptions {
    pub target: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub platforms: Vec<String>,
    #[serde(default)]
    pub no_cache: bool,
}

impl BuildOptions {
    /// Reads `KILN_TARGET`, `KILN_PLATFORMS` (comma-separated), and
    /// `KILN_NO_CACHE` (`"1"`/`"true"`), mirroring the `KILN_*` environment
    /// convention. Build args and labels come only from the programmatic
    /// builder; `--build-arg`/`--label` flag parsing is the embedding CLI's
    /// concern.
    #[must_use]
    pub fn from_env() -> Self {
        let platforms = std::env::var("KILN_PLATFORMS")
            .ok()
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default();
        let no_cache = std::env::var("KILN_NO_CACHE").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        Self { target: std::env::var("KILN_TARGET").ok(), build_args: BTreeMap::new(), labels: BTreeMap::new(), platforms, no_cache }
    }

    #[must_use]
    pub fn builder() -> BuildOptionsBuilder {
        BuildOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptionsBuilder {
    opts: BuildOptions,
}

impl BuildOptionsBuilder {
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.opts.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn build_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.build_args.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.labels.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.opts.platforms.push(platform.into());
        self
    }

    #[must_use]
    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.opts.no_cache = no_cache;
        self
    }

    #[must_use]
    pub fn build(self) -> BuildOptions {
        self.opts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CacheConfig {
    pub root: String,
    pub max_size_bytes: Option<u64>,
    pub max_entries: Option<usize>,
    pub max_age_secs: Option<i64>,
    pub eviction_strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { root: default_cache_root(), max_size_bytes: None, max_entries: None, max_age_secs: None, eviction_strategy: EvictionStrategy::Lru }
    }
}

fn default_cache_root() -> String {
    std::env::var("KILN_CACHE_DIR").unwrap_or_else(|_| "/var/cache/kiln".to_owned())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Fifo,
    LargestFirst,
    Random,
    ExpiredOnly,
}

impl From<EvictionStrategy> for Strategy {
    fn from(value: EvictionStrategy) -> Self {
        match value {
            EvictionStrategy::Lru => Strategy::Lru,
            EvictionStrategy::Lfu => Strategy::Lfu,
            EvictionStrategy::Fifo => Strategy::Fifo,
            EvictionStrategy::LargestFirst => Strategy::LargestFirst,
            EvictionStrategy::Random => Strategy::Random,
            EvictionStrategy::ExpiredOnly => Strategy::ExpiredOnly,
        }
    }
}
