use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use log::LevelFilter;
use regex::Regex;
use serde::Deserialize;
use serde::Deserializer;

pub(crate) const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8081";
pub(crate) const DEFAULT_ASSETS_DIR: &str = "./assets";
pub(crate) const DEFAULT_CACHE_DIR: &str = "/var/lib/mitmcdn/data";
pub(crate) const DEFAULT_CONFIGURATION_PATH: &str = "config.toml";
pub(crate) const DEFAULT_DATABASE_PATH: &str = "mitmcdn.db";
pub(crate) const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024; /* 5G */
pub(crate) const DEFAULT_MAX_TOTAL_SIZE: u64 = 100 * 1024 * 1024 * 1024; /* 100G */
pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(72 * 60 * 60); /* 72h */
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;
pub(crate) const DEFAULT_BUF_SIZE: usize = 32 * 1024; /* 32 KiB */
pub(crate) const DEFAULT_DATABASE_SLOW_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30 * 60); /* large files */

/// Which protocol handlers the unified listener instantiates.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ProxyMode {
    Http,
    Socks5,
    UrlPath,
    #[default]
    All,
}

impl ProxyMode {
    #[must_use]
    pub(crate) fn socks5_enabled(self) -> bool {
        matches!(self, Self::Socks5 | Self::All)
    }

    #[must_use]
    pub(crate) fn http_enabled(self) -> bool {
        matches!(self, Self::Http | Self::All)
    }

    #[must_use]
    pub(crate) fn url_path_enabled(self) -> bool {
        matches!(self, Self::UrlPath | Self::All)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DedupStrategy {
    FullUrl,
    FilenameOnly,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CdnRule {
    pub(crate) domain: String,

    /// Regex matched against the full URL; empty matches everything.
    #[serde(default)]
    pub(crate) match_pattern: String,

    pub(crate) dedup_strategy: DedupStrategy,

    /// Fallback cookie used for fingerprinting and upstream fetches
    /// when the client request carries none.
    #[serde(default)]
    pub(crate) request_cookie: String,

    #[serde(skip)]
    pattern: Option<Regex>,
}

impl CdnRule {
    #[must_use]
    pub(crate) fn matches(&self, url: &str) -> bool {
        if !url.contains(&self.domain) {
            return false;
        }

        match &self.pattern {
            Some(re) => re.is_match(url),
            None => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpstreamKind {
    Http,
    Socks5,
}

/// Parsed `upstream_proxy` target.
#[derive(Clone, Debug)]
pub(crate) struct UpstreamProxy {
    pub(crate) kind: UpstreamKind,
    pub(crate) host: String,
    pub(crate) port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CacheConfig {
    /// Directory holding one file per fingerprint.
    #[serde(default = "default_cache_dir")]
    pub(crate) cache_dir: PathBuf,

    /// Sanity bound for a single cached file (informational).
    #[serde(default = "default_max_file_size", deserialize_with = "from_size")]
    pub(crate) max_file_size: u64,

    /// Budget enforced by LRU eviction.
    #[serde(default = "default_max_total_size", deserialize_with = "from_size")]
    pub(crate) max_total_size: u64,

    /// Retention time of complete entries since last access.
    #[serde(default = "default_ttl", deserialize_with = "from_duration")]
    pub(crate) ttl: Duration,
}

impl CacheConfig {
    fn default_values() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            ttl: DEFAULT_TTL,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::default_values()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// host:port of the unified listener.
    #[serde(default = "default_listen_address")]
    pub(crate) listen_address: String,

    /// Which protocol handlers to instantiate.
    #[serde(default)]
    pub(crate) proxy_mode: ProxyMode,

    /// `{http|socks5}://host:port` used for non-intercepted forwarding.
    /// Empty means direct connections.
    #[serde(default)]
    pub(crate) upstream_proxy: String,

    /// Static fallback directory for requests without a usable target URL.
    #[serde(default = "default_assets_dir")]
    pub(crate) assets_dir: PathBuf,

    /// Size of buffer used for internal data transfer.
    #[serde(default = "default_buffer_size")]
    pub(crate) buffer_size: usize,

    /// Timeout of database operations after which a warning is generated.
    #[serde(
        default = "default_db_slow_timeout",
        deserialize_with = "from_secs_f32"
    )]
    pub(crate) database_slow_timeout: Duration,

    /// Timeout for establishing upstream connections.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "from_secs_f32"
    )]
    pub(crate) connect_timeout: Duration,

    /// Per-operation timeout of the upstream HTTP client.
    /// Generous by default to suit multi-gigabyte downloads.
    #[serde(default = "default_http_timeout", deserialize_with = "from_secs_f32")]
    pub(crate) http_timeout: Duration,

    #[serde(default)]
    pub(crate) cache: CacheConfig,

    #[serde(default)]
    pub(crate) cdn_rules: Vec<CdnRule>,

    #[serde(skip)]
    listen_socket: Option<SocketAddr>,

    #[serde(skip)]
    upstream: Option<UpstreamProxy>,
}

impl Config {
    fn default_values() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            proxy_mode: ProxyMode::All,
            upstream_proxy: String::new(),
            assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
            buffer_size: DEFAULT_BUF_SIZE,
            database_slow_timeout: DEFAULT_DATABASE_SLOW_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            cache: CacheConfig::default_values(),
            cdn_rules: Vec::new(),
            listen_socket: None,
            upstream: None,
        }
    }

    pub(crate) fn new(file: &Path) -> anyhow::Result<(Self, bool)> {
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && file == Path::new(DEFAULT_CONFIGURATION_PATH) =>
            {
                let mut config = Self::default_values();
                config.validate()?;
                return Ok((config, true));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read file `{}`", file.display()));
            }
        };

        let mut config: Self = toml::from_str(&content).context("Failed to parse configuration")?;

        config.validate()?;

        Ok((config, false))
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        self.listen_socket = Some(
            self.listen_address
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid listen_address `{}`", self.listen_address))?,
        );

        if self.buffer_size < 1024 || self.buffer_size > 1024 * 1024 * 1024 {
            bail!(
                "Invalid buffer_size value of {}: must be in between 1K and 1G",
                self.buffer_size
            );
        }

        if self.database_slow_timeout > Duration::from_secs(60) {
            bail!(
                "Invalid database_slow_timeout value of {}: must be less or equal to 60s",
                self.database_slow_timeout.as_secs_f32()
            );
        }

        if !self.upstream_proxy.is_empty() {
            let url = url::Url::parse(&self.upstream_proxy)
                .with_context(|| format!("Invalid upstream_proxy `{}`", self.upstream_proxy))?;

            let kind = match url.scheme() {
                "http" => UpstreamKind::Http,
                "socks5" | "socks5h" => UpstreamKind::Socks5,
                other => bail!("Unsupported upstream_proxy scheme `{other}`"),
            };
            let host = url
                .host_str()
                .ok_or_else(|| anyhow!("upstream_proxy `{}` has no host", self.upstream_proxy))?
                .to_string();
            let port = url.port().unwrap_or(match kind {
                UpstreamKind::Http => 8080,
                UpstreamKind::Socks5 => 1080,
            });

            self.upstream = Some(UpstreamProxy { kind, host, port });
        }

        for rule in &mut self.cdn_rules {
            if rule.domain.is_empty() {
                bail!("CDN rule without a domain");
            }

            rule.pattern = if rule.match_pattern.is_empty() {
                None
            } else {
                Some(Regex::new(&rule.match_pattern).with_context(|| {
                    format!("Invalid match_pattern `{}`", rule.match_pattern)
                })?)
            };
        }

        Ok(())
    }

    #[must_use]
    pub(crate) fn listen_socket(&self) -> SocketAddr {
        self.listen_socket
            .expect("validate() was run by Config::new()")
    }

    #[must_use]
    pub(crate) fn upstream(&self) -> Option<&UpstreamProxy> {
        self.upstream.as_ref()
    }

    /// First rule matching the full URL wins, in configuration order.
    #[must_use]
    pub(crate) fn find_rule(&self, url: &str) -> Option<&CdnRule> {
        self.cdn_rules.iter().find(|rule| rule.matches(url))
    }

    /// Cheap host-level test used before a tunneled stream is decrypted,
    /// when only the CONNECT/SOCKS5 target is known.
    #[must_use]
    pub(crate) fn host_intercepted(&self, host: &str) -> bool {
        self.cdn_rules.iter().any(|rule| host.contains(&rule.domain))
    }
}

fn from_level_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    use std::str::FromStr as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

fn from_secs_f32<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: f32 = Deserialize::deserialize(deserializer)?;

    Duration::try_from_secs_f32(s).map_err(D::Error::custom)
}

fn from_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_size(&s).map_err(D::Error::custom)
}

fn from_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_duration(&s).map_err(D::Error::custom)
}

/// Parses a size like `5G` or `100M` to bytes, base 1024.
pub(crate) fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();

    if s.is_empty() {
        bail!("Empty size value");
    }

    if let Ok(val) = s.parse::<u64>() {
        return Ok(val);
    }

    let Some(x) = s.find(|c| !char::is_ascii_digit(&c)) else {
        bail!("Could not split size input `{s}`");
    };
    if x == 0 {
        bail!("Size `{s}` does not start with a number");
    }

    let (val, unit) = s.split_at(x);
    let val = val.parse::<u64>()?;

    let factor: u64 = match unit.trim() {
        "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        other => bail!("Unknown size unit `{other}`"),
    };

    val.checked_mul(factor)
        .ok_or_else(|| anyhow!("Size `{s}` overflows"))
}

/// Parses a duration of concatenated `<n>d`/`<n>h`/`<n>m`/`<n>s` segments
/// like `72h` or `1h30m`; a bare integer counts as seconds.
pub(crate) fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        bail!("Empty duration value");
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if digits.is_empty() {
            bail!("Duration segment in `{s}` has no number");
        }

        let val = digits.parse::<u64>()?;
        digits.clear();

        let factor = match c {
            'd' => 24 * 60 * 60,
            'h' => 60 * 60,
            'm' => 60,
            's' => 1,
            other => bail!("Unknown duration unit `{other}` in `{s}`"),
        };

        total = val
            .checked_mul(factor)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| anyhow!("Duration `{s}` overflows"))?;
    }

    if !digits.is_empty() {
        bail!("Trailing number without unit in duration `{s}`");
    }

    Ok(Duration::from_secs(total))
}

const fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ASSETS_DIR)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

const fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

const fn default_max_total_size() -> u64 {
    DEFAULT_MAX_TOTAL_SIZE
}

const fn default_ttl() -> Duration {
    DEFAULT_TTL
}

const fn default_buffer_size() -> usize {
    DEFAULT_BUF_SIZE
}

const fn default_db_slow_timeout() -> Duration {
    DEFAULT_DATABASE_SLOW_TIMEOUT
}

const fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

const fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

#[cfg(test)]
pub(crate) fn for_tests() -> Config {
    let mut config = Config::default_values();
    config.validate().expect("default configuration is valid");
    config
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(0, parse_size("0").unwrap());
        assert_eq!(1024, parse_size("1024").unwrap());
        assert_eq!(42, parse_size("42B").unwrap());
        assert_eq!(1024, parse_size("1K").unwrap());
        assert_eq!(2048, parse_size("2KB").unwrap());
        assert_eq!(5 * 1024 * 1024, parse_size("5M").unwrap());
        assert_eq!(5 * 1024 * 1024, parse_size("5MB").unwrap());
        assert_eq!(5 * 1024 * 1024 * 1024, parse_size("5G").unwrap());
        assert_eq!(100 * 1024 * 1024 * 1024, parse_size("100GB").unwrap());
        assert_eq!(2 * 1024 * 1024 * 1024 * 1024, parse_size("2T").unwrap());

        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("0x1000").is_err());
        assert!(parse_size("-9999").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("999999999999T").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(Duration::from_secs(0), parse_duration("0").unwrap());
        assert_eq!(Duration::from_secs(300), parse_duration("300").unwrap());
        assert_eq!(Duration::from_secs(45), parse_duration("45s").unwrap());
        assert_eq!(Duration::from_secs(90 * 60), parse_duration("90m").unwrap());
        assert_eq!(
            Duration::from_secs(72 * 60 * 60),
            parse_duration("72h").unwrap()
        );
        assert_eq!(
            Duration::from_secs(60 * 60 + 30 * 60),
            parse_duration("1h30m").unwrap()
        );
        assert_eq!(
            Duration::from_secs(24 * 60 * 60 + 1),
            parse_duration("1d1s").unwrap()
        );

        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("1h30").is_err());
        assert!(parse_duration("5y").is_err());
    }

    #[test]
    fn test_rule_matching() {
        let mut config: Config = toml::from_str(
            r#"
            [[cdn_rules]]
            domain = "cdn.example.com"
            match_pattern = ".*\\.mp4"
            dedup_strategy = "filename_only"

            [[cdn_rules]]
            domain = "origin.test"
            dedup_strategy = "full_url"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let rule = config
            .find_rule("https://cdn.example.com/videos/a.mp4")
            .unwrap();
        assert_eq!(rule.dedup_strategy, DedupStrategy::FilenameOnly);

        /* pattern mismatch */
        assert!(config.find_rule("https://cdn.example.com/a.jpg").is_none());

        /* empty pattern matches everything under the domain */
        assert!(config.find_rule("https://origin.test/a.jpg").is_some());

        /* unknown domain */
        assert!(config.find_rule("https://elsewhere.test/a.mp4").is_none());

        assert!(config.host_intercepted("cdn.example.com"));
        assert!(config.host_intercepted("eu1.cdn.example.com"));
        assert!(!config.host_intercepted("example.org"));
    }

    #[test]
    fn test_invalid_rule_regex_fails_validation() {
        let mut config: Config = toml::from_str(
            r#"
            [[cdn_rules]]
            domain = "cdn.example.com"
            match_pattern = "("
            dedup_strategy = "full_url"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_and_upstream() {
        let mut config: Config = toml::from_str(
            r#"
            listen_address = "127.0.0.1:9000"
            upstream_proxy = "socks5://10.0.0.1:1080"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen_socket().port(), 9000);
        assert_eq!(config.proxy_mode, ProxyMode::All);
        assert_eq!(config.cache.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.cache.ttl, DEFAULT_TTL);

        let upstream = config.upstream().unwrap();
        assert_eq!(upstream.kind, UpstreamKind::Socks5);
        assert_eq!(upstream.host, "10.0.0.1");
        assert_eq!(upstream.port, 1080);
    }
}
