//! Configuration loading and per-host resolution.
//!
//! The effective configuration seen by a request is composed from three
//! layers: host override, then global document, then built-in default. The
//! document lives at `./config.json`; recognized environment variables are
//! overlaid on top of it at startup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Built-in crawler substrings matched case-insensitively against the
/// request user-agent.
pub const DEFAULT_BOTS: &[&str] = &[
    "Googlebot",
    "bingbot",
    "Slurp",
    "DuckDuckBot",
    "Baiduspider",
    "YandexBot",
    "Applebot",
    "facebookexternalhit",
    "Twitterbot",
    "LinkedInBot",
    "Pinterestbot",
    "Slack",
    "WhatsApp",
    "TelegramBot",
    "vkShare",
    "GPTBot",
    "ChatGPT-User",
    "Google-Extended",
    "ClaudeBot",
    "Claude-Web",
    "GrokBot",
    "meta-externalagent",
    "meta-externalfetcher",
    "PerplexityBot",
    "Amazonbot",
    "CCBot",
    "ia_archiver",
    "YouBot",
    "Neevabot",
    "headlessbot",
];

/// Serving strategy for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Strategy {
    /// Render for bots, serve the static bundle to everyone else.
    #[serde(rename = "smart-ssr")]
    SmartSsr,
    /// Render for every non-internal request.
    #[serde(rename = "ssr")]
    Ssr,
    /// Never render.
    #[serde(rename = "csr")]
    Csr,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "smart-ssr" => Some(Strategy::SmartSsr),
            "ssr" => Some(Strategy::Ssr),
            "csr" => Some(Strategy::Csr),
            _ => None,
        }
    }
}

/// Which serving-classification lines are logged per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsMode {
    None,
    /// Only render-path classifications (SSR, SSR-CACHE, SSR-FALLBACK).
    Ssr,
    All,
}

impl LogsMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(LogsMode::None),
            "ssr" => Some(LogsMode::Ssr),
            "all" => Some(LogsMode::All),
            _ => None,
        }
    }
}

/// Toggles for the post-render HTML optimizer. Everything defaults to on.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerOptions {
    pub remove_data_attributes: bool,
    pub remove_aria_attributes: bool,
    pub remove_style_attributes: bool,
    pub remove_inline_styles: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            remove_data_attributes: true,
            remove_aria_attributes: true,
            remove_style_attributes: true,
            remove_inline_styles: true,
        }
    }
}

/// One SPA deployment. `host` is an exact hostname or a glob pattern where
/// `*` matches any run of characters. Immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Directory name under the hosts root holding the static bundle.
    pub source: String,
    pub host: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub parallel_renders: Option<usize>,
    #[serde(default)]
    pub bots: Option<Vec<String>>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub root_selector: Option<String>,
    #[serde(default)]
    pub optimizer_options: Option<OptimizerOptions>,
}

fn default_true() -> bool {
    true
}

fn default_bots() -> Vec<String> {
    DEFAULT_BOTS.iter().map(|s| s.to_string()).collect()
}

/// Process-wide defaults, loaded from `config.json` and overlaid with
/// environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub port: u16,
    pub parallel_renders: usize,
    pub bots: Vec<String>,
    pub cache_cleanup_interval_minutes: u64,
    pub strategy: Strategy,
    pub hosts: Vec<HostConfig>,
    pub logs: LogsMode,
    pub clear_cache_on_startup: bool,
    pub root_selector: String,
    pub optimizer_options: OptimizerOptions,
    pub timeout_ms: u64,
    pub cache_dir: PathBuf,
    pub hosts_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            parallel_renders: 10,
            bots: default_bots(),
            cache_cleanup_interval_minutes: 60,
            strategy: Strategy::SmartSsr,
            hosts: Vec::new(),
            logs: LogsMode::Ssr,
            clear_cache_on_startup: true,
            root_selector: "#root".to_string(),
            optimizer_options: OptimizerOptions::default(),
            timeout_ms: 20_000,
            cache_dir: PathBuf::from("./.cache"),
            hosts_dir: PathBuf::from("./hosts"),
        }
    }
}

/// Per-request composition of host override, global value and built-in
/// default. Shared-immutable: built once per request, only read afterwards.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub source: String,
    pub host: String,
    pub strategy: Strategy,
    pub timeout_ms: u64,
    pub parallel_renders: usize,
    pub bots: Vec<String>,
    pub root_selector: String,
    pub optimizer_options: OptimizerOptions,
    /// Render only for bots. Derived: true for `smart-ssr` and `csr`.
    pub bot_only: bool,
}

/// Outcome of resolving a hostname against the configured hosts.
#[derive(Debug)]
pub enum HostMatch {
    Active(EffectiveConfig),
    /// A host entry matched but is marked inactive.
    Inactive,
    NoMatch,
}

impl GlobalConfig {
    /// Read the configuration document if it exists, otherwise start from
    /// defaults. A malformed document is an error; a missing one is not.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Overlay recognized environment variables. Unparseable values are
    /// logged and ignored rather than aborting startup.
    pub fn apply_env(&mut self) {
        self.apply_env_overrides(|name| std::env::var(name).ok());
    }

    pub fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("PORT") {
            match v.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!("ignoring unparseable PORT={}", v),
            }
        }
        if let Some(v) = var("MAX_CONCURRENCY") {
            match v.parse() {
                Ok(n) => self.parallel_renders = n,
                Err(_) => warn!("ignoring unparseable MAX_CONCURRENCY={}", v),
            }
        }
        if let Some(v) = var("CACHE_CLEANUP_INTERVAL") {
            match v.parse() {
                Ok(minutes) => self.cache_cleanup_interval_minutes = minutes,
                Err(_) => warn!("ignoring unparseable CACHE_CLEANUP_INTERVAL={}", v),
            }
        }
        if let Some(v) = var("STRATEGY") {
            match Strategy::parse(&v) {
                Some(s) => self.strategy = s,
                None => warn!("ignoring unknown STRATEGY={}", v),
            }
        }
        if let Some(v) = var("LOGS") {
            match LogsMode::parse(&v) {
                Some(mode) => self.logs = mode,
                None => warn!("ignoring unknown LOGS={}", v),
            }
        }
        if let Some(v) = var("TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.timeout_ms = ms,
                Err(_) => warn!("ignoring unparseable TIMEOUT_MS={}", v),
            }
        }
        if let Some(v) = var("CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
    }

    /// Resolve a hostname to its effective configuration. Exact matches
    /// against active hosts win; otherwise the first active glob match.
    pub fn effective(&self, hostname: &str) -> HostMatch {
        if let Some(host) = self
            .hosts
            .iter()
            .filter(|h| h.active)
            .find(|h| h.host == hostname)
        {
            return HostMatch::Active(self.compose(host));
        }
        if let Some(host) = self
            .hosts
            .iter()
            .filter(|h| h.active)
            .find(|h| host_matches(&h.host, hostname))
        {
            return HostMatch::Active(self.compose(host));
        }
        if self
            .hosts
            .iter()
            .any(|h| !h.active && (h.host == hostname || host_matches(&h.host, hostname)))
        {
            return HostMatch::Inactive;
        }
        HostMatch::NoMatch
    }

    fn compose(&self, host: &HostConfig) -> EffectiveConfig {
        let strategy = host.strategy.unwrap_or(self.strategy);
        EffectiveConfig {
            source: host.source.clone(),
            host: host.host.clone(),
            strategy,
            timeout_ms: host.timeout_ms.unwrap_or(self.timeout_ms),
            parallel_renders: host.parallel_renders.unwrap_or(self.parallel_renders),
            bots: host.bots.clone().unwrap_or_else(|| self.bots.clone()),
            root_selector: host
                .root_selector
                .clone()
                .unwrap_or_else(|| self.root_selector.clone()),
            optimizer_options: host.optimizer_options.unwrap_or(self.optimizer_options),
            bot_only: matches!(strategy, Strategy::SmartSsr | Strategy::Csr),
        }
    }

    /// Entry TTL is tied to the sweep interval by design.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_minutes * 60)
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.hosts_dir.join(source)
    }

    pub fn active_hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.iter().filter(|h| h.active)
    }
}

/// Glob match for host patterns: `*` matches any run of characters, every
/// other regex metacharacter is escaped, and the match is anchored.
pub fn host_matches(pattern: &str, hostname: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == hostname;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    match Regex::new(&format!("^{escaped}$")) {
        Ok(re) => re.is_match(hostname),
        Err(e) => {
            warn!(pattern, "invalid host pattern: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(host: &str, source: &str) -> HostConfig {
        HostConfig {
            source: source.to_string(),
            host: host.to_string(),
            active: true,
            timeout_ms: None,
            parallel_renders: None,
            bots: None,
            strategy: None,
            root_selector: None,
            optimizer_options: None,
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = GlobalConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.parallel_renders, 10);
        assert_eq!(config.cache_cleanup_interval_minutes, 60);
        assert_eq!(config.strategy, Strategy::SmartSsr);
        assert_eq!(config.logs, LogsMode::Ssr);
        assert!(config.clear_cache_on_startup);
        assert_eq!(config.root_selector, "#root");
        assert_eq!(config.bots.len(), DEFAULT_BOTS.len());
    }

    #[test]
    fn ttl_is_tied_to_sweep_interval() {
        let config = GlobalConfig {
            cache_cleanup_interval_minutes: 5,
            ..Default::default()
        };
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
    }

    #[test]
    fn glob_matching_is_anchored_and_escaped() {
        assert!(host_matches("*.example", "app.example"));
        assert!(host_matches("*.example", "a.b.example"));
        assert!(!host_matches("*.example", "example"));
        assert!(!host_matches("*.example", "app.example.com"));
        // Dots in the pattern are literal, not regex wildcards.
        assert!(!host_matches("app.example", "appxexample"));
        assert!(host_matches("app.*", "app.anything.tld"));
        assert!(host_matches("app.example", "app.example"));
    }

    #[test]
    fn exact_match_wins_over_glob() {
        let config = GlobalConfig {
            hosts: vec![host("*.example", "wild"), host("app.example", "exact")],
            ..Default::default()
        };
        match config.effective("app.example") {
            HostMatch::Active(eff) => assert_eq!(eff.source, "exact"),
            other => panic!("expected active match, got {other:?}"),
        }
    }

    #[test]
    fn inactive_host_is_reported_as_inactive() {
        let mut inactive = host("app.example", "app");
        inactive.active = false;
        let config = GlobalConfig {
            hosts: vec![inactive],
            ..Default::default()
        };
        assert!(matches!(config.effective("app.example"), HostMatch::Inactive));
        assert!(matches!(config.effective("other.tld"), HostMatch::NoMatch));
    }

    #[test]
    fn host_overrides_shadow_global_values() {
        let mut overridden = host("app.example", "app");
        overridden.timeout_ms = Some(5000);
        overridden.strategy = Some(Strategy::Ssr);
        overridden.root_selector = Some("#app".to_string());
        let config = GlobalConfig {
            hosts: vec![overridden],
            ..Default::default()
        };
        match config.effective("app.example") {
            HostMatch::Active(eff) => {
                assert_eq!(eff.timeout_ms, 5000);
                assert_eq!(eff.strategy, Strategy::Ssr);
                assert_eq!(eff.root_selector, "#app");
                assert_eq!(eff.parallel_renders, 10);
                assert!(!eff.bot_only);
            }
            other => panic!("expected active match, got {other:?}"),
        }
    }

    #[test]
    fn bot_only_derivation() {
        for (strategy, bot_only) in [
            (Strategy::SmartSsr, true),
            (Strategy::Csr, true),
            (Strategy::Ssr, false),
        ] {
            let mut h = host("app.example", "app");
            h.strategy = Some(strategy);
            let config = GlobalConfig {
                hosts: vec![h],
                ..Default::default()
            };
            match config.effective("app.example") {
                HostMatch::Active(eff) => assert_eq!(eff.bot_only, bot_only),
                other => panic!("expected active match, got {other:?}"),
            }
        }
    }

    #[test]
    fn env_overrides_supersede_document_values() {
        let mut config = GlobalConfig::default();
        config.apply_env_overrides(|name| match name {
            "PORT" => Some("8080".to_string()),
            "MAX_CONCURRENCY" => Some("3".to_string()),
            "STRATEGY" => Some("csr".to_string()),
            "LOGS" => Some("all".to_string()),
            "TIMEOUT_MS" => Some("9000".to_string()),
            "CACHE_DIR" => Some("/tmp/rx-cache".to_string()),
            _ => None,
        });
        assert_eq!(config.port, 8080);
        assert_eq!(config.parallel_renders, 3);
        assert_eq!(config.strategy, Strategy::Csr);
        assert_eq!(config.logs, LogsMode::All);
        assert_eq!(config.timeout_ms, 9000);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/rx-cache"));
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let mut config = GlobalConfig::default();
        config.apply_env_overrides(|name| match name {
            "PORT" => Some("not-a-port".to_string()),
            "STRATEGY" => Some("turbo".to_string()),
            _ => None,
        });
        assert_eq!(config.port, 3000);
        assert_eq!(config.strategy, Strategy::SmartSsr);
    }

    #[test]
    fn config_document_round_trips() {
        let json = r#"{
            "port": 4000,
            "strategy": "ssr",
            "hosts": [
                {"source": "app", "host": "app.example", "timeoutMs": 1500},
                {"source": "old", "host": "old.example", "active": false}
            ]
        }"#;
        let config: GlobalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.strategy, Strategy::Ssr);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].timeout_ms, Some(1500));
        assert!(config.hosts[0].active);
        assert!(!config.hosts[1].active);
    }
}
