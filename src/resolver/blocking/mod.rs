pub mod matcher;
pub mod schedule;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::matcher::PatternSet;
use self::schedule::Schedules;
use super::{NextResolver, Resolver, client_group_lookup};
use crate::config::{BlockingConfig, LoadingStrategy};
use crate::dns::enums::{Rcode, RecordType};
use crate::dns::{DnsMessage, ResourceRecord};
use crate::error::{Result, WardenError};
use crate::metrics::Metrics;
use crate::model::{Request, Response, ResponseType};

/// How a blocked query is answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockType {
    ZeroIp,
    NxDomain,
    CustomIps(Vec<IpAddr>),
}

pub fn parse_block_type(raw: &str) -> std::result::Result<BlockType, String> {
    match raw.trim() {
        t if t.eq_ignore_ascii_case("zeroip") => Ok(BlockType::ZeroIp),
        t if t.eq_ignore_ascii_case("nxdomain") => Ok(BlockType::NxDomain),
        other => {
            let ips = other
                .split(',')
                .map(|p| {
                    p.trim()
                        .parse::<IpAddr>()
                        .map_err(|_| format!("invalid blockType {}", other))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if ips.is_empty() {
                return Err(format!("invalid blockType {}", other));
            }
            Ok(BlockType::CustomIps(ips))
        }
    }
}

/// Where one list's entries come from: a URL, a file, or inline text.
#[derive(Clone, Debug)]
enum ListSource {
    Url(String),
    File(String),
    Inline(String),
}

impl ListSource {
    fn classify(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ListSource::Url(raw.to_string())
        } else if raw.contains('\n') {
            ListSource::Inline(raw.to_string())
        } else if Path::new(raw).exists() {
            ListSource::File(raw.to_string())
        } else {
            ListSource::Inline(raw.to_string())
        }
    }

    async fn fetch(&self) -> Result<String> {
        match self {
            ListSource::Inline(text) => Ok(text.clone()),
            ListSource::File(path) => Ok(std::fs::read_to_string(path)?),
            ListSource::Url(url) => {
                let response = reqwest::get(url)
                    .await
                    .map_err(|e| WardenError::Blocklist(format!("download {}: {}", url, e)))?;
                response
                    .text()
                    .await
                    .map_err(|e| WardenError::Blocklist(format!("download {}: {}", url, e)))
            }
        }
    }
}

/// Compiled deny- and allowlists, swapped atomically on refresh.
#[derive(Default)]
struct GroupStore {
    deny: HashMap<String, PatternSet>,
    allow: HashMap<String, PatternSet>,
}

impl GroupStore {
    fn denylist_entries(&self) -> usize {
        self.deny.values().map(PatternSet::len).sum()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BlockingStatus {
    pub enabled: bool,
    /// Groups currently disabled; empty while fully enabled.
    pub disabled_groups: Vec<String>,
    /// Seconds until automatic re-enable, if a disable duration was given.
    pub auto_enable_in_sec: Option<u64>,
}

struct ControlState {
    enabled: bool,
    disabled_groups: Vec<String>,
    enable_at: Option<std::time::Instant>,
}

/// Deny/allow-list resolver with client-group selection, schedules and a
/// runtime enable/disable control surface.
pub struct BlockingResolver {
    store: RwLock<Arc<GroupStore>>,
    deny_sources: HashMap<String, Vec<ListSource>>,
    allow_sources: HashMap<String, Vec<ListSource>>,
    client_groups_block: HashMap<String, Vec<String>>,
    block_type: BlockType,
    block_ttl: u32,
    schedules: Arc<Schedules>,
    control: Mutex<ControlState>,
    disable_generation: AtomicU64,
    metrics: Arc<Metrics>,
    next: NextResolver,
}

impl BlockingResolver {
    /// Build the resolver and load all list sources according to
    /// `loading.strategy`. Spawns the schedule refresher and, if configured,
    /// the periodic list-refresh ticker.
    pub async fn bootstrap(
        config: &BlockingConfig,
        metrics: Arc<Metrics>,
        next: NextResolver,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let schedules = Arc::new(Schedules::from_config(&config.schedules)?);
        schedules.clone().spawn_refresher(cancel.clone());

        let classify = |map: &HashMap<String, Vec<String>>| {
            map.iter()
                .map(|(group, sources)| {
                    (group.clone(), sources.iter().map(|s| ListSource::classify(s)).collect())
                })
                .collect::<HashMap<String, Vec<ListSource>>>()
        };

        let resolver = Arc::new(Self {
            store: RwLock::new(Arc::new(GroupStore::default())),
            deny_sources: classify(&config.denylists),
            allow_sources: classify(&config.allowlists),
            client_groups_block: config.client_groups_block.clone(),
            block_type: parse_block_type(&config.block_type).map_err(WardenError::Config)?,
            block_ttl: config.block_ttl.as_secs() as u32,
            schedules,
            control: Mutex::new(ControlState {
                enabled: true,
                disabled_groups: Vec::new(),
                enable_at: None,
            }),
            disable_generation: AtomicU64::new(0),
            metrics,
            next,
        });

        match config.loading.strategy {
            LoadingStrategy::FailOnError => resolver.refresh_lists().await?,
            LoadingStrategy::Blocking => {
                if let Err(e) = resolver.refresh_lists().await {
                    warn!("blocklist loading finished with errors: {}", e);
                }
            }
            LoadingStrategy::Fast => {
                let background = resolver.clone();
                tokio::spawn(async move {
                    if let Err(e) = background.refresh_lists().await {
                        warn!("background blocklist loading failed: {}", e);
                    }
                });
            }
        }

        if let Some(period) = config.refresh_period {
            let ticker_target = resolver.clone();
            let period = period.as_duration();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period.max(Duration::from_secs(60)));
                ticker.tick().await; // first tick fires immediately, skip it
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = ticker_target.refresh_lists().await {
                                warn!("periodic list refresh failed: {}", e);
                            }
                        }
                    }
                }
            });
        }

        Ok(resolver)
    }

    /// Re-fetch every source and swap the compiled store in one step;
    /// readers see either the old or the new lists, never a mix.
    pub async fn refresh_lists(&self) -> Result<()> {
        let mut fresh = GroupStore::default();
        for (group, sources) in &self.deny_sources {
            fresh
                .deny
                .insert(group.clone(), Self::load_sources(group, sources).await?);
        }
        for (group, sources) in &self.allow_sources {
            fresh
                .allow
                .insert(group.clone(), Self::load_sources(group, sources).await?);
        }
        let entries = fresh.denylist_entries();
        *self.store.write() = Arc::new(fresh);
        self.metrics.denylist_entries.set(entries as i64);
        info!("blocklists loaded: {} denylist entries", entries);
        Ok(())
    }

    async fn load_sources(group: &str, sources: &[ListSource]) -> Result<PatternSet> {
        let mut merged = PatternSet::default();
        for source in sources {
            let text = source.fetch().await?;
            for line in text.lines() {
                merged
                    .insert_line(line)
                    .map_err(|e| WardenError::Blocklist(format!("group {}: {}", group, e)))?;
            }
        }
        Ok(merged)
    }

    /// Denylist groups applying to this client: its mapped groups plus the
    /// `default` ones, minus inactive and disabled groups.
    fn groups_for(&self, request: &Request) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        if let Some(key) = client_group_lookup(
            self.client_groups_block.keys().filter(|k| k.as_str() != "default"),
            &request.client_names,
            request.client_ip,
        ) {
            groups.extend(self.client_groups_block[&key].iter().cloned());
        }
        if let Some(default_groups) = self.client_groups_block.get("default") {
            groups.extend(default_groups.iter().cloned());
        }
        groups.sort();
        groups.dedup();

        let control = self.control.lock();
        groups
            .into_iter()
            .filter(|g| self.schedules.is_active(g))
            .filter(|g| !control.disabled_groups.contains(g))
            .collect()
    }

    fn synthesize_block(&self, request: &Request, reason: String) -> Response {
        self.metrics.blocked_queries.inc();
        let question = request.message.question().cloned().unwrap_or_default();
        let mut message = DnsMessage::response_for(&request.message);
        match &self.block_type {
            BlockType::NxDomain => message.set_rcode(Rcode::NxDomain),
            BlockType::ZeroIp => match question.qtype {
                RecordType::A => message.answers.push(ResourceRecord::a(
                    question.name.clone(),
                    self.block_ttl,
                    std::net::Ipv4Addr::UNSPECIFIED,
                )),
                RecordType::AAAA => message.answers.push(ResourceRecord::aaaa(
                    question.name.clone(),
                    self.block_ttl,
                    std::net::Ipv6Addr::UNSPECIFIED,
                )),
                _ => {}
            },
            BlockType::CustomIps(ips) => {
                for ip in ips {
                    let matches_qtype = match question.qtype {
                        RecordType::A => ip.is_ipv4(),
                        RecordType::AAAA => ip.is_ipv6(),
                        _ => false,
                    };
                    if matches_qtype {
                        message.answers.push(ResourceRecord::from_ip(
                            question.name.clone(),
                            self.block_ttl,
                            *ip,
                        ));
                    }
                }
            }
        }
        Response::new(message, ResponseType::Blocked, reason)
    }

    // Control surface, used by the HTTP API.

    pub fn enable(&self) {
        self.disable_generation.fetch_add(1, Ordering::SeqCst);
        let mut control = self.control.lock();
        control.enabled = true;
        control.disabled_groups.clear();
        control.enable_at = None;
        info!("blocking enabled");
    }

    /// Disable blocking, fully or for named groups only, optionally
    /// re-enabling automatically after `duration`.
    pub fn disable(self: Arc<Self>, duration: Option<Duration>, groups: Vec<String>) {
        let generation = self.disable_generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut control = self.control.lock();
            if groups.is_empty() {
                control.enabled = false;
                control.disabled_groups.clear();
            } else {
                control.disabled_groups = groups.clone();
            }
            control.enable_at = duration.map(|d| std::time::Instant::now() + d);
        }
        info!(
            "blocking disabled{}{}",
            if groups.is_empty() { String::new() } else { format!(" for groups {:?}", groups) },
            duration.map(|d| format!(" for {:?}", d)).unwrap_or_default(),
        );

        if let Some(duration) = duration {
            let resolver = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                // A later enable/disable supersedes this timer.
                if resolver.disable_generation.load(Ordering::SeqCst) == generation {
                    resolver.enable();
                    info!("blocking automatically re-enabled");
                }
            });
        }
    }

    pub fn status(&self) -> BlockingStatus {
        let control = self.control.lock();
        BlockingStatus {
            enabled: control.enabled && control.disabled_groups.is_empty(),
            disabled_groups: control.disabled_groups.clone(),
            auto_enable_in_sec: control
                .enable_at
                .map(|at| at.saturating_duration_since(std::time::Instant::now()).as_secs()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.control.lock().enabled
    }
}

#[async_trait]
impl Resolver for BlockingResolver {
    fn name(&self) -> &'static str {
        "blocking"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        if !self.is_enabled() {
            return self.next.resolve(request).await;
        }
        let groups = self.groups_for(request);
        if groups.is_empty() {
            return self.next.resolve(request).await;
        }

        let qname = request.question_name().to_lowercase();
        let store = self.store.read().clone();

        let allow = |name: &str| {
            groups
                .iter()
                .any(|g| store.allow.get(g).is_some_and(|set| set.matches_name(name)))
        };
        let deny = |name: &str| -> Option<&str> {
            groups
                .iter()
                .find(|g| store.deny.get(*g).is_some_and(|set| set.matches_name(name)))
                .map(|g| g.as_str())
        };

        // The allowlist wins at the original name, also against later CNAME
        // denylist hits.
        if allow(&qname) {
            debug!("{} is allowlisted", qname);
            return self.next.resolve(request).await;
        }
        if let Some(group) = deny(&qname) {
            debug!("{} blocked by group {}", qname, group);
            return Ok(self.synthesize_block(request, format!("BLOCKED ({})", group)));
        }

        let response = self.next.resolve(request).await?;

        // Response-side checks: answer IPs against the literal-IP index and
        // every CNAME target against the name lists.
        for ip in response.message.answer_ips() {
            let hit = groups
                .iter()
                .find(|g| store.deny.get(*g).is_some_and(|set| set.matches_ip(&ip)));
            if let Some(group) = hit {
                debug!("response IP {} blocked by group {}", ip, group);
                return Ok(self.synthesize_block(request, format!("BLOCKED IP ({})", group)));
            }
        }
        let cname_hit = response
            .message
            .cname_targets()
            .map(|t| t.trim_end_matches('.').to_lowercase())
            .find(|target| !allow(target) && deny(target).is_some());
        if let Some(target) = cname_hit {
            let group = deny(&target).unwrap_or("?").to_string();
            debug!("CNAME target {} blocked by group {}", target, group);
            return Ok(self.synthesize_block(request, format!("BLOCKED CNAME ({})", group)));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurationSetting;
    use crate::resolver::test_support::{StaticResolver, request_for};

    fn base_config() -> BlockingConfig {
        BlockingConfig {
            denylists: HashMap::from([(
                "ads".to_string(),
                vec!["blockeddomain.com\n*.blocked.com".to_string()],
            )]),
            allowlists: HashMap::from([(
                "ads".to_string(),
                vec!["good.blocked.com".to_string()],
            )]),
            client_groups_block: HashMap::from([(
                "default".to_string(),
                vec!["ads".to_string()],
            )]),
            block_ttl: DurationSetting::from_secs(21600),
            ..BlockingConfig::default()
        }
    }

    async fn resolver_with(config: BlockingConfig, next: NextResolver) -> Arc<BlockingResolver> {
        BlockingResolver::bootstrap(
            &config,
            Arc::new(Metrics::new().unwrap()),
            next,
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn denylisted_name_is_blocked_with_zero_ip() {
        let resolver = resolver_with(base_config(), StaticResolver::resolved("9.9.9.9").arc()).await;
        let mut request = request_for("blockeddomain.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);
        assert_eq!(response.message.answers[0].rdata.ip().unwrap().to_string(), "0.0.0.0");
        assert_eq!(response.message.answers[0].ttl, 21600);
    }

    #[tokio::test]
    async fn wildcard_blocks_subdomains_only() {
        let resolver = resolver_with(base_config(), StaticResolver::resolved("9.9.9.9").arc()).await;
        let mut request = request_for("sub.blocked.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);

        let mut request = request_for("blocked.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn allowlist_bypasses_denylist() {
        let resolver = resolver_with(base_config(), StaticResolver::resolved("9.9.9.9").arc()).await;
        let mut request = request_for("good.blocked.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn nxdomain_block_type() {
        let mut config = base_config();
        config.block_type = "nxDomain".to_string();
        let resolver = resolver_with(config, StaticResolver::resolved("9.9.9.9").arc()).await;
        let mut request = request_for("blockeddomain.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.message.rcode(), Rcode::NxDomain);
        assert!(response.message.answers.is_empty());
    }

    #[tokio::test]
    async fn custom_ip_block_type() {
        let mut config = base_config();
        config.block_type = "203.0.113.1,2001:db8::1".to_string();
        let resolver = resolver_with(config, StaticResolver::resolved("9.9.9.9").arc()).await;
        let mut request = request_for("blockeddomain.com", RecordType::AAAA);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.message.answers.len(), 1);
        assert_eq!(response.message.answers[0].rdata.ip().unwrap().to_string(), "2001:db8::1");
    }

    #[tokio::test]
    async fn cname_target_is_rechecked() {
        let next = StaticResolver::with_answers(vec![
            ResourceRecord::cname("innocent.example.com", 60, "ads.blockeddomain.com"),
            ResourceRecord::a("ads.blockeddomain.com", 60, "198.51.100.7".parse().unwrap()),
        ])
        .arc();
        let resolver = resolver_with(base_config(), next).await;
        let mut request = request_for("innocent.example.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);
    }

    #[tokio::test]
    async fn allowlisted_name_wins_over_cname_target() {
        // good.blocked.com is allowlisted; its CNAME chain points into a
        // denylisted zone and must still be allowed.
        let next = StaticResolver::with_answers(vec![ResourceRecord::cname(
            "good.blocked.com",
            60,
            "tracker.blockeddomain.com",
        )])
        .arc();
        let resolver = resolver_with(base_config(), next).await;
        let mut request = request_for("good.blocked.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn response_ip_in_denylist_is_blocked() {
        let mut config = base_config();
        config
            .denylists
            .insert("ips".to_string(), vec!["198.51.100.66".to_string()]);
        config
            .client_groups_block
            .insert("default".to_string(), vec!["ads".to_string(), "ips".to_string()]);
        let resolver =
            resolver_with(config, StaticResolver::resolved("198.51.100.66").arc()).await;
        let mut request = request_for("innocent.example.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);
    }

    #[tokio::test]
    async fn disable_and_auto_reenable() {
        let resolver = resolver_with(base_config(), StaticResolver::resolved("9.9.9.9").arc()).await;
        resolver.clone().disable(Some(Duration::from_millis(50)), Vec::new());
        assert!(!resolver.status().enabled);

        let mut request = request_for("blockeddomain.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(resolver.status().enabled);
        let mut request = request_for("blockeddomain.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);
    }

    #[tokio::test]
    async fn group_scoped_disable() {
        let resolver = resolver_with(base_config(), StaticResolver::resolved("9.9.9.9").arc()).await;
        resolver.clone().disable(None, vec!["ads".to_string()]);
        let mut request = request_for("blockeddomain.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
        resolver.enable();
        let mut request = request_for("blockeddomain.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);
    }

    #[tokio::test]
    async fn client_specific_groups_apply() {
        let mut config = base_config();
        config.denylists.insert(
            "kids".to_string(),
            vec!["games.example.com".to_string()],
        );
        config.client_groups_block.insert("192.168.1.50".to_string(), vec!["kids".to_string()]);
        let resolver = resolver_with(config, StaticResolver::resolved("9.9.9.9").arc()).await;

        let mut request = request_for("games.example.com", RecordType::A);
        request.client_ip = "192.168.1.50".parse().unwrap();
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Blocked);

        // Other clients only get the default groups.
        let mut request = request_for("games.example.com", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
    }
}
