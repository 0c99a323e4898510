use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Resolver;
use crate::config::{InitStrategy, UpstreamStrategy, UpstreamsConfig};
use crate::dns::DnsMessage;
use crate::dns::enums::{Rcode, RecordType};
use crate::error::{Result, WardenError};
use crate::metrics::Metrics;
use crate::model::{Request, Response, ResponseType};
use crate::upstream::transport::UpstreamClient;

static QUERY_ID: AtomicU16 = AtomicU16::new(1);

fn next_query_id() -> u16 {
    loop {
        let id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Exponentially decayed error counter; the decay half-life is the
/// configured window. Failures bump it, successes only let it decay.
pub struct ErrorEwma {
    state: Mutex<(f64, Instant)>,
    half_life: Duration,
}

impl ErrorEwma {
    pub fn new(half_life: Duration) -> Self {
        Self { state: Mutex::new((0.0, Instant::now())), half_life }
    }

    fn decayed(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        let elapsed = now.duration_since(state.1).as_secs_f64();
        let factor = 0.5f64.powf(elapsed / self.half_life.as_secs_f64().max(0.001));
        state.0 *= factor;
        state.1 = now;
        state.0
    }

    pub fn bump(&self) {
        let now = Instant::now();
        let value = self.decayed(now);
        self.state.lock().0 = value + 1.0;
    }

    pub fn relax(&self) {
        self.decayed(Instant::now());
    }

    /// Weight for the parallel-best draw: `1 / (errors + 1)`.
    pub fn weight(&self) -> f64 {
        1.0 / (self.decayed(Instant::now()) + 1.0)
    }
}

struct UpstreamEntry {
    client: UpstreamClient,
    errors: ErrorEwma,
    label: String,
}

impl UpstreamEntry {
    /// One exchange with id management, error bookkeeping and metrics.
    /// Success means the rcode is NOERROR or NXDOMAIN.
    async fn query(
        &self,
        message: &DnsMessage,
        timeout: Duration,
        cancel: &CancellationToken,
        metrics: &Metrics,
    ) -> Result<DnsMessage> {
        let original_id = message.id();
        let mut upstream_query = message.clone();
        upstream_query.set_id(next_query_id());

        let started = Instant::now();
        let outcome = self.client.exchange(&upstream_query, timeout, cancel).await;
        let elapsed = started.elapsed();
        metrics
            .upstream_duration
            .with_label_values(&[&self.label])
            .observe(elapsed.as_secs_f64());

        let result = match outcome {
            Ok(mut response) => match response.rcode() {
                Rcode::NoError | Rcode::NxDomain => {
                    response.set_id(original_id);
                    Ok(response)
                }
                rcode => Err(WardenError::Upstream(self.label.clone(), format!("rcode {}", rcode))),
            },
            Err(WardenError::Cancelled) => return Err(WardenError::Cancelled),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                self.errors.relax();
                metrics.upstream_requests.with_label_values(&[&self.label, "ok"]).inc();
            }
            Err(e) => {
                self.errors.bump();
                metrics.upstream_requests.with_label_values(&[&self.label, "error"]).inc();
                debug!("upstream {} failed after {:?}: {}", self.label, elapsed, e);
            }
        }
        result
    }
}

/// A named set of upstreams sharing a dispatch strategy and timeout.
pub struct UpstreamGroup {
    name: String,
    entries: Vec<Arc<UpstreamEntry>>,
    strategy: UpstreamStrategy,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl UpstreamGroup {
    fn new(
        name: String,
        upstreams: &[crate::upstream::Upstream],
        strategy: UpstreamStrategy,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let entries = upstreams
            .iter()
            .map(|upstream| {
                Ok(Arc::new(UpstreamEntry {
                    client: UpstreamClient::build(upstream)?,
                    errors: ErrorEwma::new(Duration::from_secs(60)),
                    label: upstream.to_string(),
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { name, entries, strategy, timeout, metrics })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn dispatch(&self, message: &DnsMessage, cancel: &CancellationToken) -> Result<DnsMessage> {
        if self.entries.is_empty() {
            return Err(WardenError::Upstream(self.name.clone(), "group has no upstreams".into()));
        }
        match self.strategy {
            UpstreamStrategy::ParallelBest => self.dispatch_parallel_best(message, cancel).await,
            UpstreamStrategy::Strict => self.dispatch_strict(message, cancel).await,
            UpstreamStrategy::Random => self.dispatch_random(message, cancel).await,
        }
    }

    /// Race two upstreams picked by weighted random draw; the first
    /// successful response wins and the loser is dropped (its socket
    /// closes). Both failing yields the last error.
    async fn dispatch_parallel_best(
        &self,
        message: &DnsMessage,
        cancel: &CancellationToken,
    ) -> Result<DnsMessage> {
        if self.entries.len() == 1 {
            return self.entries[0]
                .query(message, self.timeout, cancel, &self.metrics)
                .await;
        }
        let (first, second) = self.pick_two_weighted();
        let contenders = [first, second].map(|entry| {
            let message = message.clone();
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            let timeout = self.timeout;
            async move { entry.query(&message, timeout, &cancel, &metrics).await }.boxed()
        });
        match futures::future::select_ok(contenders).await {
            Ok((response, _losers)) => Ok(response),
            Err(last_error) => Err(last_error),
        }
    }

    async fn dispatch_strict(&self, message: &DnsMessage, cancel: &CancellationToken) -> Result<DnsMessage> {
        let mut last_error = None;
        for entry in &self.entries {
            match entry.query(message, self.timeout, cancel, &self.metrics).await {
                Ok(response) => return Ok(response),
                Err(WardenError::Cancelled) => return Err(WardenError::Cancelled),
                Err(e) => {
                    warn!("upstream {} failed, trying next in declared order: {}", entry.label, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("group has at least one upstream"))
    }

    async fn dispatch_random(&self, message: &DnsMessage, cancel: &CancellationToken) -> Result<DnsMessage> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.shuffle(&mut rand::rng());
        let mut last_error = None;
        for index in order {
            let entry = &self.entries[index];
            match entry.query(message, self.timeout, cancel, &self.metrics).await {
                Ok(response) => return Ok(response),
                Err(WardenError::Cancelled) => return Err(WardenError::Cancelled),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.expect("group has at least one upstream"))
    }

    /// Two distinct upstreams drawn with probability proportional to
    /// `1/(errors+1)`, so a flapping upstream still gets the occasional
    /// probe instead of starving.
    fn pick_two_weighted(&self) -> (Arc<UpstreamEntry>, Arc<UpstreamEntry>) {
        let weights: Vec<f64> = self.entries.iter().map(|e| e.errors.weight()).collect();
        let first = weighted_index(&weights, &mut rand::rng());
        let mut remaining_weights = weights.clone();
        remaining_weights[first] = 0.0;
        let second = weighted_index(&remaining_weights, &mut rand::rng());
        (self.entries[first].clone(), self.entries[second].clone())
    }

    /// Startup canary: an NS query for the root.
    async fn check_reachable(&self, entry: &Arc<UpstreamEntry>, cancel: &CancellationToken) -> Result<()> {
        let canary = DnsMessage::new_query("", RecordType::NS);
        entry
            .query(&canary, self.timeout, cancel, &self.metrics)
            .await
            .map(|_| ())
    }

    async fn init(&self, strategy: InitStrategy, cancel: &CancellationToken) -> Result<()> {
        match strategy {
            InitStrategy::Fast => {
                for entry in self.entries.clone() {
                    let group = self.name.clone();
                    let label = entry.label.clone();
                    let metrics = self.metrics.clone();
                    let timeout = self.timeout;
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let canary = DnsMessage::new_query("", RecordType::NS);
                        if let Err(e) = entry.query(&canary, timeout, &cancel, &metrics).await {
                            warn!("group {}: upstream {} is unreachable: {}", group, label, e);
                        }
                    });
                }
                Ok(())
            }
            InitStrategy::FailOnError => {
                for entry in &self.entries {
                    self.check_reachable(entry, cancel).await.map_err(|e| {
                        WardenError::Startup(format!(
                            "group {}: upstream {} failed init: {}",
                            self.name, entry.label, e
                        ))
                    })?;
                }
                Ok(())
            }
            InitStrategy::Blocking => loop {
                for entry in &self.entries {
                    if cancel.is_cancelled() {
                        return Err(WardenError::Cancelled);
                    }
                    if self.check_reachable(entry, cancel).await.is_ok() {
                        info!("group {}: upstream {} answered the canary", self.name, entry.label);
                        return Ok(());
                    }
                }
                warn!("group {}: no upstream reachable yet, retrying", self.name);
                tokio::time::sleep(Duration::from_secs(2)).await;
            },
        }
    }
}

fn weighted_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0;
    }
    let mut draw = rng.random_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return index;
        }
        draw -= weight;
    }
    weights.len() - 1
}

/// All configured upstream groups, shared between the chain tail and the
/// conditional resolver.
pub struct UpstreamGroups {
    groups: HashMap<String, Arc<UpstreamGroup>>,
    init_strategy: InitStrategy,
}

impl UpstreamGroups {
    pub fn from_config(config: &UpstreamsConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let mut groups = HashMap::new();
        for (name, upstreams) in &config.groups {
            let group = UpstreamGroup::new(
                name.clone(),
                upstreams,
                config.strategy,
                config.timeout.as_duration(),
                metrics.clone(),
            )?;
            groups.insert(name.clone(), Arc::new(group));
        }
        Ok(Self { groups, init_strategy: config.init.strategy })
    }

    pub fn get(&self, name: &str) -> Option<Arc<UpstreamGroup>> {
        self.groups.get(name).cloned()
    }

    /// Dispatch through `group_name`, falling back to `default`.
    pub async fn resolve_group(
        &self,
        group_name: &str,
        message: &DnsMessage,
        cancel: &CancellationToken,
    ) -> Result<(DnsMessage, String)> {
        let (name, group) = match self.groups.get(group_name) {
            Some(group) => (group_name.to_string(), group),
            None => (
                "default".to_string(),
                self.groups.get("default").ok_or_else(|| {
                    WardenError::Upstream("default".into(), "default group missing".into())
                })?,
            ),
        };
        let response = group.dispatch(message, cancel).await?;
        Ok((response, name))
    }

    /// Run the configured startup policy over every group.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        for group in self.groups.values() {
            group.init(self.init_strategy, cancel).await?;
        }
        Ok(())
    }
}

/// Chain tail: forwards the residual query to the group selected for the
/// request's client-group.
pub struct UpstreamResolver {
    groups: Arc<UpstreamGroups>,
    fqdn_only: bool,
}

impl UpstreamResolver {
    pub fn new(groups: Arc<UpstreamGroups>, fqdn_only: bool) -> Self {
        Self { groups, fqdn_only }
    }
}

#[async_trait]
impl Resolver for UpstreamResolver {
    fn name(&self) -> &'static str {
        "upstream"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let qname = request.question_name();
        if self.fqdn_only && !qname.is_empty() && !qname.contains('.') {
            debug!("refusing to forward non-FQDN {}", qname);
            let response = DnsMessage::error_response(&request.message, Rcode::NxDomain);
            return Ok(Response::new(response, ResponseType::NotFwd, "only FQDNs are forwarded"));
        }

        let (message, group) = self
            .groups
            .resolve_group(&request.client_group, &request.message, &request.cancel)
            .await?;
        Ok(Response::new(
            message,
            ResponseType::Resolved,
            format!("forwarded via group {}", group),
        ))
    }
}
