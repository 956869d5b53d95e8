//! Retrieval stage: concurrent fan-out to every retrieval handler, fan-in into
//! a report ordered by handler priority.

use std::time::Instant;

use {
    futures::future::join_all,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    switchyard_common::Message,
    tracing::debug,
};

use crate::{
    dispatch::Dispatcher,
    error::Error,
    handler::{Enrichment, Stage},
};

#[cfg(feature = "metrics")]
use crate::metrics;

/// A retrieval handler that failed or timed out; omitted from the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
}

/// Aggregated retrieval results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalReport {
    /// Non-empty enrichments, by producer priority then registration order.
    pub entries: Vec<Enrichment>,
    pub failures: Vec<HandlerFailure>,
}

impl RetrievalReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handler: &str) -> Option<&Enrichment> {
        self.entries.iter().find(|e| e.handler == handler)
    }

    /// Render the entries as prompt text, one section per producer.
    /// Returns `None` when nothing was retrieved.
    pub fn render(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let mut lines = Vec::new();
        for entry in &self.entries {
            if entry.tag.is_empty() {
                lines.push(format!("Context from {}:", entry.handler));
            } else {
                lines.push(format!("Context from {} ({}):", entry.handler, entry.tag));
            }
            match &entry.content {
                Value::Object(map) => {
                    for (key, value) in map {
                        lines.push(format!("{key}: {}", plain(value)));
                    }
                },
                other => lines.push(plain(other)),
            }
        }
        Some(lines.join("\n"))
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Dispatcher {
    /// Retrieval stage: call every retrieval handler concurrently, each under
    /// its own deadline. A failure or timeout is recorded in the report and
    /// never affects the other handlers.
    pub async fn dispatch_retrieval(&self, query: &Message) -> RetrievalReport {
        let (skipped, handlers): (Vec<_>, Vec<_>) = self
            .registry()
            .handlers_for(Stage::Retrieval, &query.kind)
            .into_iter()
            .partition(|entry| self.is_skipped(entry));
        debug!(
            stage = %Stage::Retrieval,
            kind = %query.kind,
            count = handlers.len(),
            skipped = skipped.len(),
            "dispatching"
        );

        let deadline = self.config().retrieval_timeout();
        let calls = handlers.iter().map(|entry| async move {
            let start = Instant::now();
            let result = tokio::time::timeout(deadline, entry.handler().retrieve(query)).await;
            (start.elapsed(), result)
        });
        let results = join_all(calls).await;

        let mut report = RetrievalReport::default();
        for entry in &skipped {
            report.failures.push(HandlerFailure {
                handler: entry.name().to_string(),
                error: "circuit open".into(),
            });
        }
        for (entry, (latency, result)) in handlers.iter().zip(results) {
            #[cfg(feature = "metrics")]
            metrics::handler_call(entry.name(), Stage::Retrieval, latency);
            match result {
                Ok(Ok(Some(mut enrichment))) => {
                    entry.stats().record_success(latency);
                    if enrichment.is_empty() {
                        continue;
                    }
                    enrichment.handler = entry.name().to_string();
                    report.entries.push(enrichment);
                },
                Ok(Ok(None)) => entry.stats().record_success(latency),
                Ok(Err(e)) => {
                    self.record_fault(entry, Stage::Retrieval, &e, latency);
                    if !Error::is_context_missing(&e) {
                        report.failures.push(HandlerFailure {
                            handler: entry.name().to_string(),
                            error: e.to_string(),
                        });
                    }
                },
                Err(_) => {
                    let e = anyhow::anyhow!("timed out after {}ms", deadline.as_millis());
                    self.record_fault(entry, Stage::Retrieval, &e, latency);
                    report.failures.push(HandlerFailure {
                        handler: entry.name().to_string(),
                        error: e.to_string(),
                    });
                },
            }
        }
        report
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use {
        anyhow::Result, async_trait::async_trait, serde_json::json,
        switchyard_config::DispatchConfig,
    };

    use {
        super::*,
        crate::{
            handler::{Capabilities, Handler, HandlerMetadata},
            registry::Registry,
            stats::CircuitBreaker,
        },
    };

    enum Reply {
        Value(Value),
        Nothing,
        Fail,
        Hang,
    }

    struct Source {
        name: &'static str,
        priority: i32,
        delay: Duration,
        reply: Reply,
    }

    fn source(name: &'static str, priority: i32, reply: Reply) -> Arc<Source> {
        Arc::new(Source {
            name,
            priority,
            delay: Duration::ZERO,
            reply,
        })
    }

    #[async_trait]
    impl Handler for Source {
        fn metadata(&self) -> HandlerMetadata {
            HandlerMetadata::new(self.name)
                .with_priority(self.priority)
                .with_capabilities(Capabilities::RETRIEVAL)
        }

        async fn retrieve(&self, _query: &Message) -> Result<Option<Enrichment>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.reply {
                Reply::Value(v) => Ok(Some(Enrichment::new("memory", v.clone()))),
                Reply::Nothing => Ok(None),
                Reply::Fail => anyhow::bail!("index offline"),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    Ok(None)
                },
            }
        }
    }

    /// Always fails, counting calls.
    #[derive(Default)]
    struct Counted {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Counted {
        fn metadata(&self) -> HandlerMetadata {
            HandlerMetadata::new("counted").with_capabilities(Capabilities::RETRIEVAL)
        }

        async fn retrieve(&self, _query: &Message) -> Result<Option<Enrichment>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("index offline")
        }
    }

    fn dispatcher(handlers: Vec<Arc<dyn Handler>>, config: DispatchConfig) -> Dispatcher {
        let registry = Arc::new(Registry::new());
        for h in handlers {
            registry.register(h).unwrap();
        }
        Dispatcher::new(registry, config)
    }

    #[tokio::test]
    async fn failures_are_isolated_and_entries_ordered_by_priority() {
        let d = dispatcher(
            vec![
                source("low", 1, Reply::Value(json!("l"))),
                source("broken", 5, Reply::Fail),
                source("high", 9, Reply::Value(json!("h"))),
                source("empty", 3, Reply::Nothing),
            ],
            DispatchConfig::default(),
        );
        let report = d.dispatch_retrieval(&Message::text("q")).await;
        let producers: Vec<_> = report.entries.iter().map(|e| e.handler.as_str()).collect();
        assert_eq!(producers, ["high", "low"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler, "broken");
        assert!(report.failures[0].error.contains("index offline"));
    }

    #[tokio::test]
    async fn runs_concurrently() {
        let slow = |name| {
            Arc::new(Source {
                name,
                priority: 0,
                delay: Duration::from_millis(100),
                reply: Reply::Value(json!(name)),
            }) as Arc<dyn Handler>
        };
        let d = dispatcher(
            vec![slow("a"), slow("b"), slow("c")],
            DispatchConfig::default(),
        );
        let start = Instant::now();
        let report = d.dispatch_retrieval(&Message::text("q")).await;
        assert_eq!(report.entries.len(), 3);
        assert!(start.elapsed() < Duration::from_millis(290));
    }

    #[tokio::test]
    async fn timeout_is_a_failure() {
        let config = DispatchConfig {
            retrieval_timeout_secs: 0,
            ..Default::default()
        };
        let d = dispatcher(
            vec![
                source("stuck", 10, Reply::Hang),
                source("fine", 0, Reply::Value(json!({"k": "v"}))),
            ],
            config,
        );
        let report = d.dispatch_retrieval(&Message::text("q")).await;
        assert_eq!(report.failures[0].handler, "stuck");
        assert!(report.failures[0].error.contains("timed out"));
        // A zero deadline still lets an immediately ready handler finish.
        assert_eq!(report.entries.len(), 1);
    }

    #[tokio::test]
    async fn failing_handler_is_called_every_time() {
        let broken = Arc::new(Counted::default());
        let d = dispatcher(vec![broken.clone()], DispatchConfig::default());
        for _ in 0..5 {
            let report = d.dispatch_retrieval(&Message::text("q")).await;
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].error, "index offline");
        }
        assert_eq!(broken.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn open_circuit_is_reported() {
        let broken = Arc::new(Counted::default());
        let d = dispatcher(vec![broken.clone()], DispatchConfig::default())
            .with_circuit_breaker(CircuitBreaker::new(2, Duration::from_secs(60)));
        for _ in 0..2 {
            d.dispatch_retrieval(&Message::text("q")).await;
        }
        let report = d.dispatch_retrieval(&Message::text("q")).await;
        assert_eq!(report.failures, [HandlerFailure {
            handler: "counted".into(),
            error: "circuit open".into(),
        }]);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn renders_sections() {
        let report = RetrievalReport {
            entries: vec![
                Enrichment {
                    handler: "memory".into(),
                    tag: "history".into(),
                    content: json!({"last_topic": "rust", "turns": 4}),
                },
                Enrichment {
                    handler: "notes".into(),
                    tag: String::new(),
                    content: json!("buy milk"),
                },
            ],
            failures: Vec::new(),
        };
        assert_eq!(
            report.render().unwrap(),
            "Context from memory (history):\nlast_topic: rust\nturns: 4\nContext from notes:\nbuy milk"
        );
        assert_eq!(RetrievalReport::default().render(), None);
    }
}
