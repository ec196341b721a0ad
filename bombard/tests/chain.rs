use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bombard::{
    Bombardier, Campaign, Exchange, RequestTemplate, RunArgs, Supply, Transport,
    template::Request,
};
use serde_json::json;

/// Answers from a routing function instead of the network.
struct InMemory<F> {
    route: F,
    delay: Duration,
    calls: AtomicUsize,
}

impl<F> InMemory<F>
where
    F: Fn(&Request) -> Exchange + Send + Sync,
{
    fn new(route: F) -> Arc<Self> {
        Self::with_delay(route, Duration::ZERO)
    }

    fn with_delay(route: F, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            route,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Transport for InMemory<F>
where
    F: Fn(&Request) -> Exchange + Send + Sync,
{
    async fn dispatch(&self, request: &Request, _timeout: Duration) -> Exchange {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.route)(request)
    }
}

fn args(workers: usize) -> RunArgs {
    RunArgs {
        workers,
        ..Default::default()
    }
}

fn template(url: &str) -> RequestTemplate {
    RequestTemplate::builder().url(url).build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waits_for_every_chained_request() {
    let campaign = Campaign::from_yaml(
        r#"
ammo:
  root:
    url: http://target/root
    extract: v
    reload: [leaf, leaf]
  leaf:
    url: http://target/leaf
"#,
    )
    .unwrap();
    let transport = InMemory::with_delay(|_| Exchange::new(200, r#"{"v": 1}"#), Duration::from_millis(1));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(3))
            .campaign(Arc::new(campaign))
            .transport(transport.clone())
            .build(),
    );

    let root = engine.campaign().get("root").unwrap().clone();
    engine.reload(&[root], Some(5), Supply::new());
    let summary = engine.bombard().await.unwrap();

    // 5 roots, each firing two leaves.
    assert_eq!(summary.count, 15);
    assert_eq!(summary.successes, 15);
    assert_eq!(engine.reporter().len(), 15);
    assert_eq!(transport.calls(), 15);
}

#[tokio::test]
async fn dry_run_chain_passes_extracted_values() {
    let campaign = Campaign::default()
        .with_prepare(
            "a",
            RequestTemplate::builder()
                .url("http://target/login")
                .name("a")
                .extract(serde_json::from_value(json!({"token": "id"})).unwrap())
                .reload("b".to_string())
                .dry(json!({"id": 42}))
                .build(),
        )
        .with_ammo(
            "b",
            RequestTemplate::builder()
                .url("http://target/items/{token}")
                .name("b-{token}")
                .build(),
        );
    let transport = InMemory::new(|_| Exchange::new(500, "should not be called"));
    let engine = Arc::new(
        Bombardier::builder()
            .args(RunArgs {
                dry: true,
                ..args(2)
            })
            .campaign(Arc::new(campaign))
            .transport(transport.clone())
            .build(),
    );

    engine.fire_campaign();
    let summary = engine.bombard().await.unwrap();

    assert_eq!(transport.calls(), 0);
    assert_eq!(engine.supply().get("token"), Some(json!(42)));
    assert_eq!(summary.count, 2);
    assert_eq!(summary.failures, 0);
    let labels: HashSet<_> = engine
        .reporter()
        .outcomes()
        .iter()
        .filter_map(|o| o.label.clone())
        .collect();
    assert!(labels.contains("b-42"), "labels: {labels:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_runs_again_after_a_finished_run() {
    let transport = InMemory::new(|_| Exchange::new(200, "ok"));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(3))
            .transport(transport.clone())
            .build(),
    );
    let target = Arc::new(template("http://target/"));

    engine.reload(&[target.clone()], Some(3), Supply::new());
    assert_eq!(engine.bombard().await.unwrap().count, 3);

    engine.reporter().reset();
    engine.reload(&[target], Some(50), Supply::new());
    let summary = tokio::time::timeout(Duration::from_secs(3), engine.bombard())
        .await
        .expect("second run did not finish")
        .unwrap();

    assert_eq!(summary.count, 50);
    assert_eq!(transport.calls(), 53);
}

#[tokio::test]
async fn repeat_allocates_distinct_increasing_ids() {
    let transport = InMemory::new(|_| Exchange::new(200, "ok"));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(2))
            .transport(transport.clone())
            .build(),
    );

    let ids = engine.reload(&[Arc::new(template("http://target/"))], Some(3), Supply::new());
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // The template's own repeat multiplies the outer one.
    let twice = Arc::new(RequestTemplate::builder().url("http://target/").repeat(2).build());
    let more = engine.reload(&[twice], Some(3), Supply::new());
    assert_eq!(more.len(), 6);
    assert!(more[0] > ids[2]);

    engine.bombard().await.unwrap();
    assert_eq!(transport.calls(), 9);
}

#[tokio::test]
async fn classification_only_counts_ok_statuses_as_success() {
    let transport = InMemory::new(|request: &Request| {
        let status = request.url.rsplit('/').next().unwrap().parse().unwrap();
        Exchange::new(status, "")
    });
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(4))
            .transport(transport)
            .build(),
    );

    let templates: Vec<_> = [200, 502, 504, 404]
        .iter()
        .map(|s| Arc::new(template(&format!("http://target/{s}"))))
        .collect();
    engine.reload(&templates, None, Supply::new());
    let summary = engine.bombard().await.unwrap();

    assert_eq!(summary.count, 4);
    assert_eq!(summary.successes, 1);
    assert_eq!(summary.failures, 3);
}

#[tokio::test]
async fn transport_failures_are_counted_not_raised() {
    let transport = InMemory::new(|_| Exchange::failure("connection refused"));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(1))
            .transport(transport)
            .build(),
    );
    engine.reload(&[Arc::new(template("http://target/"))], Some(2), Supply::new());

    let summary = engine.bombard().await.unwrap();
    assert_eq!(summary.failures, 2);
}

#[tokio::test]
async fn missing_extract_path_keeps_supply_and_success() {
    let campaign = Campaign::default()
        .with_supply("seed", json!("s"))
        .with_ammo(
            "probe",
            RequestTemplate::builder()
                .url("http://target/")
                .extract(serde_json::from_value(json!({"token": "data.id"})).unwrap())
                .reload("follow".to_string())
                .build(),
        )
        .with_ammo("follow", template("http://target/follow"));
    let transport = InMemory::new(|_| Exchange::new(200, r#"{"data": {"other": 1}}"#));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(2))
            .campaign(Arc::new(campaign))
            .transport(transport.clone())
            .build(),
    );
    let before = engine.supply().snapshot();

    let probe = engine.campaign().get("probe").unwrap().clone();
    engine.reload(&[probe], None, Supply::new());
    let summary = engine.bombard().await.unwrap();

    assert_eq!(engine.supply().snapshot(), before);
    assert_eq!(summary.count, 1);
    assert_eq!(summary.successes, 1);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_extractions_keep_both_keys() {
    let campaign = Campaign::default()
        .with_ammo(
            "left",
            RequestTemplate::builder()
                .url("http://target/left")
                .extract(serde_json::from_value(json!({"left": "value"})).unwrap())
                .build(),
        )
        .with_ammo(
            "right",
            RequestTemplate::builder()
                .url("http://target/right")
                .extract(serde_json::from_value(json!({"right": "value"})).unwrap())
                .build(),
        );
    let transport = InMemory::with_delay(
        |request: &Request| Exchange::new(200, json!({"value": request.url}).to_string()),
        Duration::from_millis(5),
    );
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(2))
            .campaign(Arc::new(campaign))
            .transport(transport)
            .build(),
    );

    engine.fire_campaign();
    engine.bombard().await.unwrap();

    assert_eq!(engine.supply().get("left"), Some(json!("http://target/left")));
    assert_eq!(engine.supply().get("right"), Some(json!("http://target/right")));
}

#[tokio::test]
async fn scripts_reload_and_update_supply() {
    let campaign = Campaign::from_yaml(
        r#"
prepare:
  start:
    url: http://target/start
    script: |
      supply.total = resp.items.length;
      reload("item", resp.items.length, {page: 7});
ammo:
  item:
    url: http://target/item/{page}
"#,
    )
    .unwrap();
    let transport = InMemory::new(|request: &Request| match request.url.as_str() {
        "http://target/start" => Exchange::new(200, r#"{"items": [1, 2, 3]}"#),
        "http://target/item/7" => Exchange::new(200, "{}"),
        _ => Exchange::new(404, ""),
    });
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(2))
            .campaign(Arc::new(campaign))
            .transport(transport.clone())
            .build(),
    );

    engine.fire_campaign();
    let summary = engine.bombard().await.unwrap();

    assert_eq!(engine.supply().get("total"), Some(json!(3)));
    assert_eq!(summary.count, 4);
    assert_eq!(summary.successes, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reloads_before_a_script_error_still_fire() {
    let campaign = Campaign::from_yaml(
        r#"
prepare:
  start:
    url: http://target/start
    script: |
      supply.stage = "reloaded";
      reload("item");
      throw new Error("late failure");
ammo:
  item:
    url: http://target/item
"#,
    )
    .unwrap();
    let transport = InMemory::new(|_| Exchange::new(200, "{}"));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(2))
            .campaign(Arc::new(campaign))
            .transport(transport.clone())
            .build(),
    );

    engine.fire_campaign();
    let summary = engine.bombard().await.unwrap();

    assert_eq!(summary.count, 2);
    assert_eq!(transport.calls(), 2);
    assert_eq!(engine.supply().get("stage"), Some(json!("reloaded")));
}

#[tokio::test]
async fn broken_jobs_never_abort_the_run() {
    let campaign = Campaign::default()
        .with_ammo(
            "unknown-target",
            RequestTemplate::builder()
                .url("http://target/")
                .extract(serde_json::from_value(json!("id")).unwrap())
                .reload("nowhere".to_string())
                .build(),
        )
        .with_ammo(
            "throws",
            RequestTemplate::builder()
                .url("http://target/")
                .script("throw new Error('boom')")
                .build(),
        )
        .with_ammo("unresolved", template("http://target/{missing}"));
    let transport = InMemory::new(|_| Exchange::new(200, r#"{"id": 1}"#));
    let engine = Arc::new(
        Bombardier::builder()
            .args(args(3))
            .campaign(Arc::new(campaign))
            .transport(transport.clone())
            .build(),
    );

    engine.fire_campaign();
    let summary = engine.bombard().await.unwrap();

    assert_eq!(summary.count, 3);
    assert_eq!(summary.successes, 2);
    assert_eq!(summary.failures, 1);
    assert_eq!(transport.calls(), 2);
    assert_eq!(engine.supply().get("id"), Some(json!(1)));
}
