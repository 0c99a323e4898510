use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, WardenError};
use crate::upstream::Upstream;

/// A duration configuration value. Accepts `h`/`m`/`s`/`ms` suffixed strings
/// (`"2h"`, `"1h30m"`, `"250ms"`); a bare integer is interpreted as minutes
/// and logs a deprecation warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSetting(pub Duration);

impl DurationSetting {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

pub(crate) fn parse_duration_str(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration: {}", s));
        }
        let value: u64 = digits.parse().map_err(|_| format!("invalid duration: {}", s))?;
        digits.clear();
        let unit_ms = match c {
            'h' => 3_600_000,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    1
                } else {
                    60_000
                }
            }
            's' => 1_000,
            _ => return Err(format!("invalid duration unit in: {}", s)),
        };
        total_ms += value * unit_ms;
    }
    if !digits.is_empty() {
        return Err(format!("duration is missing a unit: {}", s));
    }
    Ok(Duration::from_millis(total_ms))
}

impl<'de> Deserialize<'de> for DurationSetting {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = DurationSetting;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a duration string such as \"2h\" or \"30s\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                warn!("bare integer durations are deprecated, interpreting {} as minutes", v);
                Ok(DurationSetting(Duration::from_secs(v * 60)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                parse_duration_str(v).map(DurationSetting).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Like [`DurationSetting`] but signed: `maxTime = 0` means "respect the
/// upstream TTL", a negative value disables the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedDuration(pub i64);

impl SignedDuration {
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0.max(0) as u64)
    }
}

impl<'de> Deserialize<'de> for SignedDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SignedVisitor;

        impl Visitor<'_> for SignedVisitor {
            type Value = SignedDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a duration string, optionally negative")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Ok(SignedDuration(-1));
                }
                warn!("bare integer durations are deprecated, interpreting {} as minutes", v);
                Ok(SignedDuration(v * 60_000))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                self.visit_i64(v as i64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                if let Some(rest) = v.trim().strip_prefix('-') {
                    let d = parse_duration_str(rest).map_err(E::custom)?;
                    Ok(SignedDuration(-(d.as_millis() as i64)))
                } else {
                    let d = parse_duration_str(v).map_err(E::custom)?;
                    Ok(SignedDuration(d.as_millis() as i64))
                }
            }
        }

        deserializer.deserialize_any(SignedVisitor)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStrategy {
    #[default]
    ParallelBest,
    Strict,
    Random,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InitStrategy {
    Fast,
    FailOnError,
    #[default]
    Blocking,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamsConfig {
    pub groups: HashMap<String, Vec<Upstream>>,
    pub timeout: DurationSetting,
    pub strategy: UpstreamStrategy,
    pub init: InitConfig,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            timeout: DurationSetting::from_secs(2),
            strategy: UpstreamStrategy::default(),
            init: InitConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct InitConfig {
    pub strategy: InitStrategy,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CachingConfig {
    pub min_time: DurationSetting,
    pub max_time: SignedDuration,
    pub cache_time_negative: DurationSetting,
    pub max_items_count: usize,
    pub prefetching: bool,
    pub prefetch_expires: DurationSetting,
    pub prefetch_threshold: u32,
    pub prefetch_max_items_count: usize,
    pub clean_up_interval: DurationSetting,
    pub exclude: Vec<String>,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            min_time: DurationSetting::from_secs(0),
            max_time: SignedDuration(0),
            cache_time_negative: DurationSetting::from_secs(30 * 60),
            max_items_count: 0,
            prefetching: false,
            prefetch_expires: DurationSetting::from_secs(2 * 3600),
            prefetch_threshold: 5,
            prefetch_max_items_count: 0,
            clean_up_interval: DurationSetting::from_secs(10),
            exclude: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadingStrategy {
    #[default]
    Blocking,
    FailOnError,
    Fast,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadingConfig {
    pub strategy: LoadingStrategy,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Weekday names, e.g. `[Mon, Tue, Sat]`.
    pub days: Vec<String>,
    /// Time ranges, e.g. `["08:00-13:00", "18:00-22:00"]`.
    pub times: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BlockingConfig {
    pub denylists: HashMap<String, Vec<String>>,
    pub allowlists: HashMap<String, Vec<String>>,
    /// Client-group → denylist group names. The `default` entry applies to
    /// every client.
    pub client_groups_block: HashMap<String, Vec<String>>,
    /// `zeroIP`, `nxDomain` or a comma-separated list of IPs.
    pub block_type: String,
    pub block_ttl: DurationSetting,
    pub loading: LoadingConfig,
    /// Optional periodic list refresh.
    pub refresh_period: Option<DurationSetting>,
    /// Per-group active windows; a group without a schedule is always on.
    pub schedules: HashMap<String, ScheduleConfig>,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            denylists: HashMap::new(),
            allowlists: HashMap::new(),
            client_groups_block: HashMap::new(),
            block_type: "zeroIP".to_string(),
            block_ttl: DurationSetting::from_secs(6 * 3600),
            loading: LoadingConfig::default(),
            refresh_period: None,
            schedules: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomDnsConfig {
    /// `name: ip[,ip…]` or `name: CNAME:target`.
    pub mapping: HashMap<String, String>,
    /// Inline zone data. Carried for an external zone loader to turn into
    /// mappings; the resolver itself only serves the parsed map.
    pub zone: Option<String>,
    pub custom_ttl: DurationSetting,
    pub filter_unmapped_types: bool,
}

impl Default for CustomDnsConfig {
    fn default() -> Self {
        Self {
            mapping: HashMap::new(),
            zone: None,
            custom_ttl: DurationSetting::from_secs(3600),
            filter_unmapped_types: true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ConditionalConfig {
    /// Suffix → upstream group name; `.` catches single-label names.
    pub mapping: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FilteringConfig {
    pub query_types: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HostsFileConfig {
    /// Paths to already-materialised hosts tables.
    pub sources: Vec<PathBuf>,
    pub hosts_ttl: DurationSetting,
}

impl Default for HostsFileConfig {
    fn default() -> Self {
        Self { sources: Vec::new(), hosts_ttl: DurationSetting::from_secs(120) }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientLookupConfig {
    /// Upstream used for reverse (PTR) client-name lookups.
    pub upstream: Option<Upstream>,
    /// Static client name → IPs.
    pub clients: HashMap<String, Vec<IpAddr>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EcsConfig {
    /// Take the client address from an inbound ECS option.
    pub use_as_client: bool,
    /// Keep a client-supplied ECS option when forwarding.
    pub forward: bool,
    /// Prefix length added for IPv4 clients, 0 disables.
    pub ipv4_mask: u8,
    /// Prefix length added for IPv6 clients, 0 disables.
    pub ipv6_mask: u8,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RewriterConfig {
    /// Suffix → replacement applied to the tail of the question name.
    pub mapping: HashMap<String, String>,
    pub fallback_upstream: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecialUseConfig {
    pub enable: bool,
    /// Also cover the RFC 6762 appendix G home-network names
    /// (`lan`, `home`, `internal`, …). Off by default so conditional
    /// mappings for those zones keep working.
    pub rfc6762_appendix_g: bool,
}

impl Default for SpecialUseConfig {
    fn default() -> Self {
        Self { enable: true, rfc6762_appendix_g: false }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FqdnOnlyConfig {
    pub enable: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryLogConfig {
    pub flush_interval: DurationSetting,
    pub buffer_size: usize,
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self { flush_interval: DurationSetting::from_secs(30), buffer_size: 1024 }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RedisConfig {
    pub addresses: Vec<String>,
}

impl RedisConfig {
    pub fn enabled(&self) -> bool {
        !self.addresses.is_empty()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PortsConfig {
    pub dns: String,
    pub tls: Option<String>,
    pub http: Option<String>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self { dns: "0.0.0.0:53".to_string(), tls: None, http: None }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub ports: PortsConfig,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub upstreams: UpstreamsConfig,
    pub caching: CachingConfig,
    pub blocking: BlockingConfig,
    #[serde(rename = "customDNS")]
    pub custom_dns: CustomDnsConfig,
    pub conditional: ConditionalConfig,
    pub filtering: FilteringConfig,
    pub hosts_file: HostsFileConfig,
    pub client_lookup: ClientLookupConfig,
    pub ecs: EcsConfig,
    pub rewriter: RewriterConfig,
    pub special_use_domains: SpecialUseConfig,
    pub fqdn_only: FqdnOnlyConfig,
    pub query_log: QueryLogConfig,
    pub redis: RedisConfig,
    /// Maximum concurrently processed queries.
    pub max_concurrent_queries: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| WardenError::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WARDEN_DNS_ADDR") {
            self.ports.dns = addr;
        }
        if let Ok(addr) = std::env::var("WARDEN_HTTP_ADDR") {
            self.ports.http = Some(addr);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let default = self
            .upstreams
            .groups
            .get("default")
            .ok_or_else(|| WardenError::Config("upstreams.groups.default is required".into()))?;
        if default.is_empty() {
            return Err(WardenError::Config("upstreams.groups.default must not be empty".into()));
        }
        for (group, upstreams) in &self.upstreams.groups {
            if upstreams.iter().any(Upstream::is_unset) {
                return Err(WardenError::Config(format!("group {} contains an unset upstream", group)));
            }
        }
        for group in self.conditional.mapping.values() {
            if !self.upstreams.groups.contains_key(group) {
                return Err(WardenError::Config(format!(
                    "conditional mapping references unknown upstream group {}",
                    group
                )));
            }
        }
        for qtype in &self.filtering.query_types {
            qtype
                .parse::<crate::dns::enums::RecordType>()
                .map_err(WardenError::Config)?;
        }
        crate::resolver::blocking::parse_block_type(&self.blocking.block_type)
            .map_err(|e| WardenError::Config(e))?;
        for groups in self.blocking.client_groups_block.values() {
            for g in groups {
                if !self.blocking.denylists.contains_key(g) && !self.blocking.allowlists.contains_key(g) {
                    warn!("clientGroupsBlock references unknown list group {}", g);
                }
            }
        }
        Ok(())
    }

    pub fn dns_bind_addr(&self) -> Result<std::net::SocketAddr> {
        self.ports
            .dns
            .parse()
            .map_err(|_| WardenError::Config(format!("invalid DNS bind address {}", self.ports.dns)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration_str("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration_str("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration_str("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration_str("10s").unwrap(), Duration::from_secs(10));
        assert!(parse_duration_str("10x").is_err());
        assert!(parse_duration_str("10").is_err());
    }

    #[test]
    fn bare_integer_is_minutes() {
        let d: DurationSetting = serde_yaml::from_str("5").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(300));
    }

    #[test]
    fn signed_duration_negative_disables() {
        let d: SignedDuration = serde_yaml::from_str("\"-1s\"").unwrap();
        assert!(d.is_negative());
        let d: SignedDuration = serde_yaml::from_str("\"5m\"").unwrap();
        assert_eq!(d.0, 300_000);
    }

    #[test]
    fn minimal_config_parses() {
        let yaml = r#"
upstreams:
  groups:
    default:
      - 1.1.1.1
      - tcp-tls:dns.example.com:853
  timeout: 500ms
  strategy: strict
blocking:
  denylists:
    ads:
      - "*.tracker.example"
  clientGroupsBlock:
    default: [ads]
  blockType: zeroIP
  blockTTL: 6h
customDNS:
  mapping:
    printer.lan: 192.168.1.9
conditional:
  mapping:
    lan: default
filtering:
  queryTypes: [AAAA]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.upstreams.groups["default"].len(), 2);
        assert_eq!(config.upstreams.strategy, UpstreamStrategy::Strict);
        assert_eq!(config.upstreams.timeout.as_duration(), Duration::from_millis(500));
        assert_eq!(config.blocking.block_ttl.as_secs(), 21600);
    }

    #[test]
    fn custom_dns_zone_key_is_accepted() {
        let yaml = r#"
upstreams:
  groups:
    default: [1.1.1.1]
customDNS:
  zone: |
    www 3600 A 192.168.1.20
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert!(config.custom_dns.zone.is_some());
    }

    #[test]
    fn missing_default_group_is_rejected() {
        let yaml = r#"
upstreams:
  groups:
    other: [1.1.1.1]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
