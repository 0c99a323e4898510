pub mod blocking;
pub mod caching;
pub mod client_name;
pub mod conditional;
pub mod custom_dns;
pub mod ecs;
pub mod filtering;
pub mod hosts_file;
pub mod metrics_tee;
pub mod query_log;
pub mod rewriter;
pub mod special_use;
pub mod upstream_group;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::redis_sync::RedisSync;
use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::{Request, Response};

/// One link of the resolver chain.
///
/// A resolver either answers the request itself or delegates to the `next`
/// link it was built with; observe-only links call `next` and annotate the
/// returned response. The chain is wired once at startup and never
/// reordered.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, request: &mut Request) -> Result<Response>;
}

pub type NextResolver = Arc<dyn Resolver>;

/// Match a client against a set of group keys: exact name first, then exact
/// IP, then CIDR containment. Used for upstream-group selection and for
/// `clientGroupsBlock`.
pub fn client_group_lookup<'a, I>(keys: I, names: &[String], ip: IpAddr) -> Option<String>
where
    I: IntoIterator<Item = &'a String> + Clone,
{
    for name in names {
        if let Some(key) = keys
            .clone()
            .into_iter()
            .find(|k| k.eq_ignore_ascii_case(name))
        {
            return Some(key.clone());
        }
    }
    let ip_string = ip.to_string();
    for key in keys.clone() {
        if *key == ip_string {
            return Some(key.clone());
        }
    }
    keys.into_iter().find(|k| cidr_contains(k, ip)).cloned()
}

/// `true` when `cidr` parses as `addr/prefix` and contains `ip`.
pub fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let Some((network, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u32>() else {
        return false;
    };
    match (network.parse::<IpAddr>(), ip) {
        (Ok(IpAddr::V4(network)), IpAddr::V4(ip)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(network) & mask == u32::from(ip) & mask
        }
        (Ok(IpAddr::V6(network)), IpAddr::V6(ip)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(network) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// The assembled chain plus the handles the control surface needs.
pub struct Chain {
    pub head: NextResolver,
    pub blocking: Arc<blocking::BlockingResolver>,
    pub query_log: Arc<query_log::QueryLogSink>,
    pub groups: Arc<upstream_group::UpstreamGroups>,
}

/// Wire the chain, tail first. Ordering is fixed:
/// filtering → special-use → client-name → ECS → query-log → metrics →
/// rewriter → custom DNS → hosts → conditional → blocking → caching →
/// upstream.
pub async fn build_chain(
    config: &Config,
    hosts_table: hosts_file::HostsTable,
    metrics: Arc<Metrics>,
    redis: Option<Arc<RedisSync>>,
    cancel: CancellationToken,
) -> Result<Chain> {
    let groups = Arc::new(upstream_group::UpstreamGroups::from_config(
        &config.upstreams,
        metrics.clone(),
    )?);

    let upstream: NextResolver = Arc::new(upstream_group::UpstreamResolver::new(
        groups.clone(),
        config.fqdn_only.enable,
    ));
    let caching: NextResolver = caching::CachingResolver::spawn(
        &config.caching,
        metrics.clone(),
        redis,
        upstream,
        cancel.clone(),
    );
    let blocking =
        blocking::BlockingResolver::bootstrap(&config.blocking, metrics.clone(), caching, cancel.clone())
            .await?;
    let conditional: NextResolver = Arc::new(conditional::ConditionalResolver::new(
        &config.conditional,
        groups.clone(),
        blocking.clone(),
    ));
    let hosts: NextResolver = Arc::new(hosts_file::HostsFileResolver::with_table(
        hosts_table,
        config.hosts_file.hosts_ttl.as_secs() as u32,
        conditional,
    ));
    let custom: NextResolver = Arc::new(custom_dns::CustomDnsResolver::new(&config.custom_dns, hosts)?);
    let rewriter: NextResolver = Arc::new(rewriter::RewriterResolver::new(&config.rewriter, custom));
    let metrics_tee: NextResolver =
        Arc::new(metrics_tee::MetricsTeeResolver::new(metrics.clone(), rewriter));

    let query_log_sink = Arc::new(query_log::QueryLogSink::new(&config.query_log, metrics.clone()));
    query_log_sink
        .clone()
        .spawn_writer(config.query_log.flush_interval.as_duration(), cancel.clone());
    let query_log: NextResolver = Arc::new(query_log::QueryLogResolver::new(
        query_log_sink.clone(),
        metrics_tee,
    ));

    let ecs: NextResolver = Arc::new(ecs::EcsResolver::new(&config.ecs, query_log));
    let group_keys: HashSet<String> = config.upstreams.groups.keys().cloned().collect();
    let client_name: NextResolver = Arc::new(client_name::ClientNameResolver::new(
        &config.client_lookup,
        group_keys,
        config.upstreams.timeout.as_duration(),
        ecs,
    )?);
    let special: NextResolver = Arc::new(special_use::SpecialUseResolver::new(
        &config.special_use_domains,
        client_name,
    ));
    let head: NextResolver =
        Arc::new(filtering::FilteringResolver::new(&config.filtering, special)?);

    info!("resolver chain assembled with {} upstream groups", config.upstreams.groups.len());
    Ok(Chain { head, blocking, query_log: query_log_sink, groups })
}
