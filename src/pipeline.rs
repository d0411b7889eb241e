//! Three-stage hook pipeline around a pool of transfers.
//!
//! ```text
//!  items ──▶ pre hooks ──▶ ┌──────────── worker pool (N permits) ────────────┐ ──▶ post hooks ──▶ summary
//!            (one thread)  │ transport.fetch(entry) ──▶ file hooks([item])   │     (one thread)
//!                          │ transport.fetch(entry) ──▶ file hooks([item])   │
//!                          │            ...                                  │
//!                          └──────────────────────────────────────────────────┘
//! ```
//!
//! - Hooks of one stage run in the order they were given to
//!   [`Pipeline::new`], not registration order.
//! - A `pre` stage that leaves the queue empty ends the run: no transfer,
//!   no `file` or `post` hook is invoked.
//! - A transport error or panic marks the entry `status = -1`; it still
//!   goes through the `file` stage.
//! - With [`HookErrorPolicy::Continue`] a failing hook is logged and the
//!   stage continues with the items as they were before that hook. With
//!   [`HookErrorPolicy::Abort`] the failure ends the run.
//!
//! Hook bodies are synchronous and run on blocking threads.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::hooks::{Hook, Stage};
use crate::models::{Entry, Item};
use crate::traits::{ConnectorRegistry, Transport};

/// What to do when a hook's `run` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookErrorPolicy {
    /// Log, restore the items from before the hook, carry on.
    #[default]
    Continue,
    /// Stop the run with [`PipelineError::Hook`].
    Abort,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("hook '{hook}' failed in the {stage} stage")]
    Hook {
        hook: String,
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error("pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("transfer pool closed")]
    PoolClosed,
}

/// Outcome of [`Pipeline::run`].
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Items left after the `pre` stage.
    pub queued: usize,
    /// Transfers attempted.
    pub transferred: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items after the `post` stage.
    pub items: Vec<Item>,
}

pub struct Pipeline {
    hooks: Vec<Arc<dyn Hook>>,
    policy: HookErrorPolicy,
    workers: usize,
}

impl Pipeline {
    pub fn new(hooks: Vec<Box<dyn Hook>>) -> Self {
        Self {
            hooks: hooks.into_iter().map(Arc::from).collect(),
            policy: HookErrorPolicy::default(),
            workers: 4,
        }
    }

    pub fn with_policy(mut self, policy: HookErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Size of the transfer pool. Values below one are raised to one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn policy(&self) -> HookErrorPolicy {
        self.policy
    }

    /// Hooks bound to `stage`, in run order.
    pub fn hooks_for(&self, stage: Stage) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .iter()
            .filter(|h| h.stage() == stage)
            .cloned()
            .collect()
    }

    /// Run every `stage` hook over `items` on the current thread.
    pub fn run_stage(&self, stage: Stage, items: Vec<Item>) -> Result<Vec<Item>, PipelineError> {
        run_hooks(&self.hooks_for(stage), stage, self.policy, items)
    }

    async fn run_stage_blocking(
        &self,
        stage: Stage,
        items: Vec<Item>,
    ) -> Result<Vec<Item>, PipelineError> {
        let hooks = self.hooks_for(stage);
        if hooks.is_empty() {
            return Ok(items);
        }
        let policy = self.policy;
        tokio::task::spawn_blocking(move || run_hooks(&hooks, stage, policy, items)).await?
    }

    /// Pre stage, transfers with per-transfer file stage, post stage.
    pub async fn run(
        &self,
        items: Vec<Item>,
        transport: Arc<dyn Transport>,
    ) -> Result<RunSummary, PipelineError> {
        let incoming = items.len();
        let queue = self.run_stage_blocking(Stage::Pre, items).await?;
        if queue.is_empty() {
            info!(incoming, "Queue empty after pre stage, nothing to transfer");
            return Ok(RunSummary::default());
        }

        let queued = queue.len();
        info!(queued, workers = self.workers, "Starting transfers");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let file_hooks = Arc::new(self.hooks_for(Stage::File));
        let policy = self.policy;
        let mut transfers = JoinSet::new();

        for (idx, item) in queue.into_iter().enumerate() {
            let sem = Arc::clone(&semaphore);
            let transport = Arc::clone(&transport);
            let hooks = Arc::clone(&file_hooks);

            transfers.spawn(async move {
                let _permit = match sem.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(PipelineError::PoolClosed),
                };
                let mut item = item;

                let fetched = AssertUnwindSafe(transport.fetch(&mut item.entry, &*item.connector))
                    .catch_unwind()
                    .await;
                match fetched {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(url = %item.entry.url, error = %format!("{e:#}"), "Transfer failed");
                        item.entry.status = Some(Entry::TRANSFER_FAILED);
                    }
                    Err(payload) => {
                        error!(url = %item.entry.url, error = %panic_message(&*payload), "Transfer panicked");
                        item.entry.status = Some(Entry::TRANSFER_FAILED);
                    }
                }
                let ok = item.entry.is_success();

                if hooks.is_empty() {
                    return Ok((idx, ok, vec![item]));
                }
                let fallback = item.clone();
                let processed =
                    tokio::task::spawn_blocking(move || run_hooks(&hooks, Stage::File, policy, vec![item]))
                        .await;
                match processed {
                    Ok(result) => result.map(|items| (idx, ok, items)),
                    Err(join) if policy == HookErrorPolicy::Continue => {
                        error!(url = %fallback.entry.url, error = %join, "File stage worker failed");
                        Ok((idx, ok, vec![fallback]))
                    }
                    Err(join) => Err(PipelineError::Worker(join)),
                }
            });
        }

        let mut done: Vec<(usize, Vec<Item>)> = Vec::with_capacity(queued);
        let (mut succeeded, mut failed) = (0, 0);
        while let Some(joined) = transfers.join_next().await {
            let (idx, ok, items) = match joined {
                Ok(result) => result?,
                Err(join) if policy == HookErrorPolicy::Continue => {
                    error!(error = %join, "Transfer worker failed");
                    failed += 1;
                    continue;
                }
                Err(join) => return Err(join.into()),
            };
            if ok {
                succeeded += 1;
            } else {
                failed += 1;
            }
            done.push((idx, items));
        }
        // Completion order is arbitrary; hand the post stage queue order.
        done.sort_by_key(|(idx, _)| *idx);
        let processed: Vec<Item> = done.into_iter().flat_map(|(_, items)| items).collect();

        info!(succeeded, failed, items = processed.len(), "Transfers complete");
        let items = self.run_stage_blocking(Stage::Post, processed).await?;

        Ok(RunSummary {
            queued,
            transferred: succeeded + failed,
            succeeded,
            failed,
            items,
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn run_hooks(
    hooks: &[Arc<dyn Hook>],
    stage: Stage,
    policy: HookErrorPolicy,
    mut items: Vec<Item>,
) -> Result<Vec<Item>, PipelineError> {
    for hook in hooks {
        let before = match policy {
            HookErrorPolicy::Continue => Some(items.clone()),
            HookErrorPolicy::Abort => None,
        };
        let count = items.len();
        match hook.run(items) {
            Ok(next) => {
                debug!(hook = %hook.name(), %stage, before = count, after = next.len(), "Hook ran");
                items = next;
            }
            Err(e) => match before {
                Some(previous) => {
                    error!(hook = %hook.name(), %stage, error = %format!("{e:#}"), "Hook failed, continuing");
                    items = previous;
                }
                None => {
                    error!(hook = %hook.name(), %stage, error = %format!("{e:#}"), "Hook failed, aborting");
                    return Err(PipelineError::Hook {
                        hook: hook.name().to_string(),
                        stage,
                        source: e,
                    });
                }
            },
        }
    }
    Ok(items)
}

/// Enumerate every connector in registration order. A connector that
/// fails to enumerate is logged and contributes nothing.
pub async fn collect_entries(connectors: &ConnectorRegistry) -> Vec<Item> {
    let mut items = Vec::new();
    for connector in connectors.connectors() {
        match connector.enumerate().await {
            Ok(entries) => {
                debug!(connector = %connector.name(), count = entries.len(), "Enumerated");
                items.extend(entries.into_iter().map(|e| Item::new(Arc::clone(connector), e)));
            }
            Err(e) => {
                error!(connector = %connector.name(), error = %format!("{e:#}"), "Enumeration failed")
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookInfo;
    use crate::traits::testing::StubConnector;
    use crate::traits::Connector;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Succeeds unless the URL contains "fail"; panics on "panic".
    struct FakeTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch(&self, entry: &mut Entry, connector: &dyn Connector) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if entry.url.contains("panic") {
                panic!("transport bug on {}", entry.url);
            }
            if entry.url.contains("fail") {
                bail!("refused");
            }
            entry.dst_fn = Some(connector.outdir().join(entry.url.rsplit('/').next().unwrap_or("x")));
            entry.status = Some(0);
            Ok(())
        }
    }

    fn transport() -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            calls: AtomicUsize::new(0),
        })
    }

    type Action = Box<dyn Fn(Vec<Item>) -> Result<Vec<Item>> + Send + Sync>;

    /// Records its invocations into a shared log and applies `action`.
    struct Recorder {
        info: HookInfo,
        log: Arc<Mutex<Vec<String>>>,
        action: Action,
    }

    impl Hook for Recorder {
        fn info(&self) -> &HookInfo {
            &self.info
        }

        fn run(&self, items: Vec<Item>) -> Result<Vec<Item>> {
            self.log.lock().unwrap().push(self.info.name.clone());
            (self.action)(items)
        }
    }

    fn recorder(
        name: &str,
        stage: Stage,
        log: &Arc<Mutex<Vec<String>>>,
        action: impl Fn(Vec<Item>) -> Result<Vec<Item>> + Send + Sync + 'static,
    ) -> Box<dyn Hook> {
        Box::new(Recorder {
            info: HookInfo::new(name, "", stage, "test"),
            log: Arc::clone(log),
            action: Box::new(action),
        })
    }

    fn queue(urls: &[&str]) -> Vec<Item> {
        let c = StubConnector::new("c", "/out/c").arc();
        urls.iter().map(|u| Item::new(c.clone(), Entry::new(*u))).collect()
    }

    #[tokio::test]
    async fn empty_pre_stage_cancels_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("drop_all", Stage::Pre, &log, |_| Ok(Vec::new())),
            recorder("per_file", Stage::File, &log, Ok),
            recorder("report", Stage::Post, &log, Ok),
        ]);
        let t = transport();

        let summary = pipeline.run(queue(&["http://h/a", "http://h/b"]), t.clone()).await.unwrap();

        assert_eq!(summary.transferred, 0);
        assert!(summary.items.is_empty());
        assert_eq!(t.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec!["drop_all"]);
    }

    #[tokio::test]
    async fn stages_run_in_order_with_failed_transfers_flowing_through() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        let pipeline = Pipeline::new(vec![
            recorder("report", Stage::Post, &log, Ok),
            recorder("per_file", Stage::File, &log, move |items| {
                seen.lock().unwrap().push(items[0].entry.status);
                Ok(items)
            }),
            recorder("first", Stage::Pre, &log, Ok),
            recorder("second", Stage::Pre, &log, Ok),
        ])
        .with_workers(2);

        let summary = pipeline
            .run(queue(&["http://h/a", "http://h/fail", "http://h/c"]), transport())
            .await
            .unwrap();

        assert_eq!(summary.queued, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.items.len(), 3);
        assert_eq!(summary.items[1].entry.status, Some(Entry::TRANSFER_FAILED));
        assert_eq!(summary.items[0].entry.dst_fn.as_deref(), Some(std::path::Path::new("/out/c/a")));

        let log = log.lock().unwrap();
        assert_eq!(log[..2], ["first", "second"]);
        assert_eq!(log.iter().filter(|n| *n == "per_file").count(), 3);
        assert_eq!(log.last().map(String::as_str), Some("report"));

        let mut statuses = statuses.lock().unwrap().clone();
        statuses.sort();
        assert_eq!(statuses, vec![Some(-1), Some(0), Some(0)]);
    }

    #[test]
    fn continue_policy_restores_items_before_failed_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("tag", Stage::Pre, &log, |mut items| {
                items[0].entry.set("tag", 1);
                Ok(items)
            }),
            recorder("broken", Stage::Pre, &log, |mut items| {
                items.clear();
                bail!("boom")
            }),
            recorder("after", Stage::Pre, &log, Ok),
        ]);

        let out = pipeline.run_stage(Stage::Pre, queue(&["u"])).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.get("tag"), Some(&serde_json::json!(1)));
        assert_eq!(*log.lock().unwrap(), vec!["tag", "broken", "after"]);
    }

    #[test]
    fn abort_policy_stops_at_failed_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recorder("broken", Stage::Post, &log, |_| bail!("boom")),
            recorder("after", Stage::Post, &log, Ok),
        ])
        .with_policy(HookErrorPolicy::Abort);

        let err = pipeline.run_stage(Stage::Post, queue(&["u"])).unwrap_err();
        assert!(matches!(err, PipelineError::Hook { ref hook, stage: Stage::Post, .. } if hook == "broken"));
        assert_eq!(*log.lock().unwrap(), vec!["broken"]);
    }

    #[tokio::test]
    async fn abort_policy_fails_run_from_file_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![recorder("broken", Stage::File, &log, |_| bail!("boom"))])
            .with_policy(HookErrorPolicy::Abort);
        let result = pipeline.run(queue(&["http://h/a"]), transport()).await;
        assert!(matches!(result, Err(PipelineError::Hook { .. })));
    }

    #[tokio::test]
    async fn panicking_transfer_does_not_sink_the_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reached = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&reached);
        let pipeline = Pipeline::new(vec![recorder("report", Stage::Post, &log, move |items| {
            seen.lock()
                .unwrap()
                .extend(items.iter().map(|i| i.entry.url.clone()));
            Ok(items)
        })])
        .with_workers(2);

        let summary = pipeline
            .run(queue(&["http://h/a", "http://h/panic", "http://h/c"]), transport())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.items[1].entry.status, Some(Entry::TRANSFER_FAILED));
        assert_eq!(
            *reached.lock().unwrap(),
            vec!["http://h/a", "http://h/panic", "http://h/c"]
        );
        assert_eq!(*log.lock().unwrap(), vec!["report"]);
    }

    #[tokio::test]
    async fn file_stage_can_expand_items() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![recorder("split", Stage::File, &log, |items| {
            let base = items[0].clone();
            let mut out = items;
            out.push(base.derive(Entry::new("derived")));
            Ok(out)
        })]);
        let summary = pipeline.run(queue(&["http://h/a", "http://h/b"]), transport()).await.unwrap();
        let urls: Vec<&str> = summary.items.iter().map(|i| i.entry.url.as_str()).collect();
        assert_eq!(urls, vec!["http://h/a", "derived", "http://h/b", "derived"]);
    }

    #[tokio::test]
    async fn collect_entries_skips_failing_connector() {
        struct Broken;
        #[async_trait]
        impl Connector for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn description(&self) -> &str {
                ""
            }
            fn outdir(&self) -> &std::path::Path {
                std::path::Path::new("/out/broken")
            }
            async fn enumerate(&self) -> Result<Vec<Entry>> {
                bail!("service down")
            }
        }

        let mut reg = ConnectorRegistry::new();
        reg.register(Arc::new(Broken));
        reg.register(
            StubConnector::new("ok", "/out/ok")
                .with_entries(vec![Entry::new("a"), Entry::new("b")])
                .arc(),
        );
        let items = collect_entries(&reg).await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.connector.name() == "ok"));
    }

    #[test]
    fn policy_serde_names() {
        let p: HookErrorPolicy = serde_json::from_str("\"abort\"").unwrap();
        assert_eq!(p, HookErrorPolicy::Abort);
        assert_eq!(HookErrorPolicy::default(), HookErrorPolicy::Continue);
    }
}
