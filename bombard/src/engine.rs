use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use tracing::Instrument;
use typed_builder::TypedBuilder;

use crate::{
    campaign::Campaign,
    config::RunArgs,
    error::{AmmoError, ConfigError},
    path::ValuePath,
    pool::WorkerPool,
    report::{Reporter, Summary},
    script::{ReloadCall, ScriptScope},
    supply::{Supply, SupplyContext},
    template::{Ammo, Extract, RequestTemplate},
    transport::{Exchange, Transport},
};

/// Statuses counted as success.
pub const DEFAULT_OK: &[u16] = &[200];
/// Statuses that mean the target is saturated. Only affects logging.
pub const DEFAULT_OVERLOAD: &[u16] = &[502, 504];

/// Drives a campaign: queues ammo, fires it through a [`Transport`] from a
/// [`WorkerPool`] and follows the extract/reload/script chains until nothing
/// is left to do.
///
/// ```ignore
/// let engine = Arc::new(
///     Bombardier::builder()
///         .campaign(Arc::new(Campaign::load("campaign.yaml")?))
///         .transport(Arc::new(HttpTransport::default()))
///         .build(),
/// );
/// engine.fire_campaign();
/// let summary = engine.bombard().await?;
/// ```
#[derive(TypedBuilder)]
pub struct Bombardier {
    #[builder(default)]
    args: RunArgs,
    #[builder(default)]
    campaign: Arc<Campaign>,
    #[builder(default = Arc::new(SupplyContext::new(campaign.supply.clone())))]
    supply: Arc<SupplyContext>,
    #[builder(default = Arc::new(Reporter::new(args.report_settings())))]
    reporter: Arc<Reporter>,
    transport: Arc<dyn Transport>,
    #[builder(default = DEFAULT_OK.to_vec())]
    ok: Vec<u16>,
    #[builder(default = DEFAULT_OVERLOAD.to_vec())]
    overload: Vec<u16>,
    #[builder(default = WorkerPool::builder().workers(args.workers).build(), setter(skip))]
    pool: WorkerPool<Ammo>,
    #[builder(default, setter(skip))]
    last_id: AtomicU64,
    #[builder(default, setter(skip))]
    ammo_table: OnceLock<Arc<Value>>,
}

impl Bombardier {
    pub fn args(&self) -> &RunArgs {
        &self.args
    }

    pub fn supply(&self) -> &Arc<SupplyContext> {
        &self.supply
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    pub fn campaign(&self) -> &Arc<Campaign> {
        &self.campaign
    }

    /// Queue `repeat` (or the run default) times `template.repeat` ammo for
    /// every template, each with `supply` as its local supply.
    ///
    /// Returns the allocated ids in submission order.
    pub fn reload(
        &self,
        requests: &[Arc<RequestTemplate>],
        repeat: Option<usize>,
        supply: Supply,
    ) -> Vec<u64> {
        let repeat = repeat.unwrap_or(self.args.repeat);
        let mut ids = Vec::with_capacity(requests.len() * repeat);
        for request in requests {
            for _ in 0..repeat * request.repeat {
                let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
                self.pool.submit(Ammo {
                    id,
                    request: request.clone(),
                    local_supply: supply.clone(),
                });
                ids.push(id);
            }
        }
        ids
    }

    /// [`reload`](Self::reload) templates by campaign name.
    ///
    /// Nothing is queued if any name is unknown.
    pub fn reload_named<S: AsRef<str>>(
        &self,
        names: &[S],
        repeat: Option<usize>,
        supply: Supply,
    ) -> Result<Vec<u64>, AmmoError> {
        let templates = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.campaign
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AmmoError::ReloadTargetUnknown(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.reload(&templates, repeat, supply))
    }

    /// Queue the campaign's opening templates.
    pub fn fire_campaign(&self) -> Vec<u64> {
        self.reload(&self.campaign.firing(), None, Supply::new())
    }

    /// Run until the queue drains, stop the workers and summarize.
    pub async fn bombard(self: &Arc<Self>) -> Result<Summary, ConfigError> {
        self.args.validate()?;

        let engine = self.clone();
        let worker_fn = move |ammo: Ammo| {
            let engine = engine.clone();
            let span = tracing::info_span!("ammo", id = ammo.id, label = %ammo.label());
            async move {
                engine.process(ammo).await;
                Ok::<(), AmmoError>(())
            }
            .instrument(span)
        };

        tracing::info!("Bombarding with {} workers...", self.args.workers);
        self.pool.start(worker_fn).await;
        self.pool.stop().await;
        tracing::info!("Done: {} requests", self.reporter.len());
        Ok(self.reporter.report())
    }

    /// The worker body for one ammo.
    ///
    /// Every failure is logged here; nothing reaches the pool.
    pub async fn process(&self, ammo: Ammo) {
        let effective = self.supply.layered(&ammo.local_supply);
        let request = match ammo.request.substitute(&effective) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("{e}");
                self.reporter
                    .append(false, Duration::ZERO, ammo.request.name.as_deref(), 0);
                return;
            }
        };

        if ammo.id == 1 {
            self.milestone("Sent 1st request..");
        }
        tracing::info!("{request}");
        if let Some(body) = request.body_text() {
            tracing::debug!("Request body:\n{body}");
        }

        let started = Instant::now();
        let exchange = if self.args.dry {
            let payload = request.dry.as_ref().unwrap_or(&Value::Null);
            Exchange::new(self.ok.first().copied().unwrap_or(200), payload.to_string())
        } else {
            self.transport.dispatch(&request, self.args.timeout).await
        };
        let elapsed = started.elapsed();
        let size = exchange.size();
        let status = exchange.status;

        if self.ok.contains(&status) {
            self.reporter.append(true, elapsed, request.label.as_deref(), size);
            tracing::info!(status, size, elapsed_ms = elapsed.as_millis() as u64, "{request}");
            tracing::debug!("Response:\n{}", exchange.body);
            self.on_success(&ammo, &exchange.body).await;
        } else {
            self.reporter.append(false, elapsed, request.label.as_deref(), size);
            if exchange.is_failure() {
                let e = AmmoError::Transport(exchange.body.clone());
                tracing::error!(status, "{request}: {e}");
            } else if self.overload.contains(&status) {
                tracing::warn!(status, size, "Overloaded: {request}");
            } else {
                tracing::warn!(status, size, "{request}");
            }
        }

        if ammo.id == 1 {
            self.milestone("Got 1st response..");
        } else if self.is_milestone(ammo.id) {
            self.milestone(&format!("Got {} responses...", ammo.id));
        }
    }

    async fn on_success(&self, ammo: &Ammo, body: &str) {
        let template = &ammo.request;

        if let Some(extract) = &template.extract {
            match extract_values(extract, body) {
                Ok(values) => {
                    self.supply.merge(values);
                    if let Some(targets) = &template.reload {
                        if let Err(e) = self.reload_named(targets.as_slice(), None, Supply::new()) {
                            tracing::error!("{e}");
                        }
                    }
                }
                Err(e) => tracing::error!("{e}\nResponse:\n{body}"),
            }
        }

        if let Some(script) = template.compiled_script() {
            let script = script.clone();
            let response = body.to_string();
            let args = serde_json::to_value(&self.args).unwrap_or(Value::Null);
            let supply = self.supply.layered(&ammo.local_supply);
            let table = self
                .ammo_table
                .get_or_init(|| Arc::new(self.campaign.to_json()))
                .clone();
            let span = tracing::Span::current();

            // QuickJS blocks; keep it off the threads that time requests
            let run = tokio::task::spawn_blocking(move || {
                span.in_scope(|| {
                    script.run(ScriptScope {
                        response: &response,
                        args: &args,
                        supply: &supply,
                        ammo: table.as_ref(),
                    })
                })
            })
            .await;

            match run {
                Ok(run) => {
                    self.supply.merge(run.effects.supply_updates);
                    for call in run.effects.reloads {
                        if let Err(e) = self.apply_reload(call) {
                            tracing::error!("{e}");
                        }
                    }
                    if let Some(e) = run.error {
                        tracing::error!(
                            "{e}\nScript:\n{}\nResponse:\n{body}",
                            template.script.as_deref().unwrap_or_default()
                        );
                    }
                }
                Err(e) => tracing::error!("Script task failed: {e}"),
            }
        }
    }

    /// Queue a `reload(...)` recorded by a script.
    fn apply_reload(&self, call: ReloadCall) -> Result<Vec<u64>, AmmoError> {
        let targets = match call.targets {
            Value::Array(items) => items,
            single => vec![single],
        };
        let templates = targets
            .into_iter()
            .map(|target| match target {
                Value::String(name) => self
                    .campaign
                    .get(&name)
                    .cloned()
                    .ok_or(AmmoError::ReloadTargetUnknown(name)),
                other => serde_json::from_value::<RequestTemplate>(other)
                    .map(Arc::new)
                    .map_err(|e| AmmoError::Script(format!("invalid reload target: {e}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.reload(&templates, call.repeat, call.supply))
    }

    /// Progress lines shown in quiet mode: every id that is a multiple of the
    /// worker count, and every tenth id before the first multiple.
    fn is_milestone(&self, id: u64) -> bool {
        let workers = self.args.workers.max(1) as u64;
        id % workers == 0 || (id < workers && id % 10 == 0)
    }

    fn milestone(&self, message: &str) {
        if self.args.quiet {
            tracing::warn!("{message}");
        } else {
            tracing::debug!("{message}");
        }
    }
}

/// Resolve every `extract` pair against a JSON body.
///
/// Either every name resolves or nothing is returned, so a partial
/// extraction never reaches the supply.
pub fn extract_values(extract: &Extract, body: &str) -> Result<Supply, AmmoError> {
    let pairs = extract.pairs();
    let fail = |name: &str, path: &str, reason: String| AmmoError::Extraction {
        name: name.to_string(),
        path: path.to_string(),
        reason,
    };

    let data: Value = serde_json::from_str(body).map_err(|e| {
        let (name, path) = pairs
            .first()
            .map(|(n, p)| (n.as_str(), p.as_str()))
            .unwrap_or_default();
        fail(name, path, format!("response is not JSON: {e}"))
    })?;

    pairs
        .iter()
        .map(|(name, path)| {
            let value = ValuePath::parse(path)
                .and_then(|p| p.resolve(&data).cloned())
                .map_err(|e| fail(name, path, e.to_string()))?;
            Ok((name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::template::Request;

    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn dispatch(&self, _: &Request, _: Duration) -> Exchange {
            Exchange::new(200, "{}")
        }
    }

    fn engine(workers: usize) -> Bombardier {
        Bombardier::builder()
            .args(RunArgs {
                workers,
                ..Default::default()
            })
            .transport(Arc::new(Silent))
            .build()
    }

    #[test]
    fn extraction_is_all_or_nothing() {
        let extract: Extract = serde_json::from_value(json!({"a": "x", "b": "y.z"})).unwrap();
        let err = extract_values(&extract, r#"{"x": 1}"#).unwrap_err();
        assert!(matches!(err, AmmoError::Extraction { .. }));

        let values = extract_values(&extract, r#"{"x": 1, "y": {"z": [2]}}"#).unwrap();
        assert_eq!(values["a"], json!(1));
        assert_eq!(values["b"], json!([2]));
    }

    #[test]
    fn extraction_needs_json() {
        let extract = Extract::Single("id".into());
        assert!(extract_values(&extract, "<html>").is_err());
    }

    #[test]
    fn milestones_follow_worker_count() {
        let engine = engine(25);
        let hits: Vec<u64> = (1..=60).filter(|id| engine.is_milestone(*id)).collect();
        assert_eq!(hits, vec![10, 20, 25, 50]);
    }

    #[test]
    fn reload_named_rejects_unknown_targets_without_queueing() {
        let engine = engine(2);
        let err = engine
            .reload_named(&["nope"], None, Supply::new())
            .unwrap_err();
        assert!(matches!(err, AmmoError::ReloadTargetUnknown(name) if name == "nope"));
        assert!(engine.pool.backlog().is_drained());
    }

    #[tokio::test]
    async fn invalid_args_are_fatal() {
        let engine = Arc::new(engine(0));
        assert_eq!(engine.bombard().await.unwrap_err(), ConfigError::NoWorkers);
    }
}
