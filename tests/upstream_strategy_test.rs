mod common;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use common::{MockUpstream, request_for};
use warden::config::{Config, UpstreamsConfig};
use warden::dns::enums::RecordType;
use warden::metrics::Metrics;
use warden::model::ResponseType;
use warden::resolver::upstream_group::UpstreamGroups;
use warden::resolver::{Resolver, build_chain};

fn groups_for(yaml: &str) -> UpstreamsConfig {
    let config: UpstreamsConfig = serde_yaml::from_str(yaml).unwrap();
    config
}

/// Parallel-best with one blackholed upstream: every answer comes from the
/// healthy one, within the group timeout.
#[tokio::test]
async fn parallel_best_survives_a_dead_upstream() {
    let blackhole = MockUpstream::spawn_blackhole().await;
    let healthy = MockUpstream::spawn(
        HashMap::from([("example.com".to_string(), Ipv4Addr::new(1, 1, 1, 1))]),
        60,
    )
    .await;

    let config = groups_for(&format!(
        r#"
groups:
  default:
    - "tcp+udp:{}:{}"
    - "{}"
timeout: 500ms
strategy: parallel_best
"#,
        blackhole.ip(),
        blackhole.port(),
        healthy.upstream_string()
    ));
    let groups = Arc::new(
        UpstreamGroups::from_config(&config, Arc::new(Metrics::new().unwrap())).unwrap(),
    );
    let cancel = CancellationToken::new();

    for _ in 0..10 {
        let query = warden::DnsMessage::new_query("example.com", RecordType::A);
        let started = Instant::now();
        let (response, group) = groups.resolve_group("default", &query, &cancel).await.unwrap();
        assert_eq!(group, "default");
        assert_eq!(response.answers[0].rdata.ip().unwrap().to_string(), "1.1.1.1");
        // Group timeout plus scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(900));
    }
}

/// Strict strategy tries upstreams in declared order and fails over.
#[tokio::test]
async fn strict_fails_over_in_declared_order() {
    let blackhole = MockUpstream::spawn_blackhole().await;
    let healthy = MockUpstream::spawn(
        HashMap::from([("example.com".to_string(), Ipv4Addr::new(2, 2, 2, 2))]),
        60,
    )
    .await;

    let config = groups_for(&format!(
        r#"
groups:
  default:
    - "tcp+udp:{}:{}"
    - "{}"
timeout: 200ms
strategy: strict
"#,
        blackhole.ip(),
        blackhole.port(),
        healthy.upstream_string()
    ));
    let groups = Arc::new(
        UpstreamGroups::from_config(&config, Arc::new(Metrics::new().unwrap())).unwrap(),
    );
    let cancel = CancellationToken::new();

    let query = warden::DnsMessage::new_query("example.com", RecordType::A);
    let (response, _) = groups.resolve_group("default", &query, &cancel).await.unwrap();
    assert_eq!(response.answers[0].rdata.ip().unwrap().to_string(), "2.2.2.2");
}

/// Random strategy retries without replacement, so a dead upstream cannot
/// make the whole group fail.
#[tokio::test]
async fn random_retries_without_replacement() {
    let blackhole = MockUpstream::spawn_blackhole().await;
    let healthy = MockUpstream::spawn(
        HashMap::from([("example.com".to_string(), Ipv4Addr::new(3, 3, 3, 3))]),
        60,
    )
    .await;

    let config = groups_for(&format!(
        r#"
groups:
  default:
    - "tcp+udp:{}:{}"
    - "{}"
timeout: 200ms
strategy: random
"#,
        blackhole.ip(),
        blackhole.port(),
        healthy.upstream_string()
    ));
    let groups = Arc::new(
        UpstreamGroups::from_config(&config, Arc::new(Metrics::new().unwrap())).unwrap(),
    );
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let query = warden::DnsMessage::new_query("example.com", RecordType::A);
        let (response, _) = groups.resolve_group("default", &query, &cancel).await.unwrap();
        assert_eq!(response.answers[0].rdata.ip().unwrap().to_string(), "3.3.3.3");
    }
}

/// All upstreams failing surfaces as a chain error, which the server layer
/// turns into SERVFAIL.
#[tokio::test]
async fn all_upstreams_failing_is_an_error() {
    let blackhole = MockUpstream::spawn_blackhole().await;
    let config = groups_for(&format!(
        r#"
groups:
  default: ["tcp+udp:{}:{}"]
timeout: 100ms
"#,
        blackhole.ip(),
        blackhole.port()
    ));
    let groups = Arc::new(
        UpstreamGroups::from_config(&config, Arc::new(Metrics::new().unwrap())).unwrap(),
    );
    let cancel = CancellationToken::new();
    let query = warden::DnsMessage::new_query("example.com", RecordType::A);
    assert!(groups.resolve_group("default", &query, &cancel).await.is_err());
}

/// An unknown client-group falls back to `default` through the whole chain.
#[tokio::test]
async fn unknown_client_group_falls_back_to_default() {
    let upstream = MockUpstream::spawn(
        HashMap::from([("example.com".to_string(), Ipv4Addr::new(4, 4, 4, 4))]),
        60,
    )
    .await;
    let yaml = format!(
        r#"
upstreams:
  groups:
    default: ["{}"]
"#,
        upstream.upstream_string()
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let chain = build_chain(
        &config,
        warden::resolver::hosts_file::HostsTable::default(),
        Arc::new(Metrics::new().unwrap()),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut request = request_for("example.com", RecordType::A);
    request.client_group = "nonexistent".to_string();
    let response = chain.head.resolve(&mut request).await.unwrap();
    assert_eq!(response.response_type, ResponseType::Resolved);
    assert_eq!(response.message.answers[0].rdata.ip().unwrap().to_string(), "4.4.4.4");
}
