use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cdc::client::{RowEvent, RowEventType};
use crate::core::broker::BrokerGateway;
use crate::core::error::RuntimeError;

/// Routes a consumer to a subset of the stream: one `(database, table)`
/// pair plus the event types it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFilter {
    pub database: String,
    pub table: String,
    #[serde(default = "all_event_types")]
    pub event_types: BTreeSet<RowEventType>,
}

fn all_event_types() -> BTreeSet<RowEventType> {
    [
        RowEventType::Insert,
        RowEventType::Update,
        RowEventType::Delete,
    ]
    .into()
}

impl TableFilter {
    pub fn new(database: &str, table: &str, event_types: &[RowEventType]) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            event_types: if event_types.is_empty() {
                all_event_types()
            } else {
                event_types.iter().copied().collect()
            },
        }
    }

    pub fn matches(&self, event: &RowEvent) -> bool {
        self.database == event.database
            && self.table == event.table
            && self.event_types.contains(&event.event_type)
    }
}

/// A binlog consumer. Consumers must be fast; anything heavier than a
/// lookup should go back out through the broker.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    fn filters(&self) -> &[TableFilter];

    async fn process_event(&self, event: &RowEvent) -> Result<()>;
}

struct Registered {
    consumer: Arc<dyn Consumer>,
    enabled: AtomicBool,
}

/// Holds the consumer set and fans incoming events out to every enabled,
/// matching consumer. One consumer failing never suppresses delivery to
/// the rest.
pub struct ConsumerManager {
    consumers: RwLock<Vec<Registered>>,
}

impl Default for ConsumerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerManager {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, consumer: Arc<dyn Consumer>) {
        info!("registered consumer {}", consumer.name());
        self.consumers.write().await.push(Registered {
            consumer,
            enabled: AtomicBool::new(true),
        });
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        for registered in self.consumers.read().await.iter() {
            if registered.consumer.name() == name {
                registered.enabled.store(enabled, Ordering::Relaxed);
                info!(
                    "consumer {} {}",
                    name,
                    if enabled { "enabled" } else { "disabled" }
                );
                return true;
            }
        }
        false
    }

    /// Name, enabled flag, and filter count per consumer.
    pub async fn statuses(&self) -> Vec<(String, bool, usize)> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|r| {
                (
                    r.consumer.name().to_string(),
                    r.enabled.load(Ordering::Relaxed),
                    r.consumer.filters().len(),
                )
            })
            .collect()
    }

    /// Deliver one event. A consumer with no filters sees everything.
    pub async fn dispatch(&self, event: &RowEvent) {
        debug!(
            "dispatching {:?} on {}.{}",
            event.event_type, event.database, event.table
        );
        for registered in self.consumers.read().await.iter() {
            if !registered.enabled.load(Ordering::Relaxed) {
                continue;
            }
            let consumer = &registered.consumer;
            let filters = consumer.filters();
            let interested =
                filters.is_empty() || filters.iter().any(|f| f.matches(event));
            if !interested {
                continue;
            }
            if let Err(e) = consumer.process_event(event).await {
                let e = RuntimeError::ConsumerError(consumer.name().to_string(), e.to_string());
                warn!("{e}");
            }
        }
    }
}

/// Declarative consumer definition, loaded from the consumers file: when a
/// matching event arrives, trigger `plugin` with `parameters` plus the
/// event itself.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub filters: Vec<TableFilter>,
    pub plugin: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub high_priority: bool,
}

fn default_true() -> bool {
    true
}

/// The consumer built from a [`ConsumerSpec`]: a thin mapping from row
/// events to plugin submissions.
pub struct TriggerConsumer {
    spec: ConsumerSpec,
    gateway: Arc<BrokerGateway>,
}

impl TriggerConsumer {
    pub fn new(spec: ConsumerSpec, gateway: Arc<BrokerGateway>) -> Self {
        Self { spec, gateway }
    }
}

#[async_trait]
impl Consumer for TriggerConsumer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn filters(&self) -> &[TableFilter] {
        &self.spec.filters
    }

    async fn process_event(&self, event: &RowEvent) -> Result<()> {
        let mut parameters = match &self.spec.parameters {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        parameters.insert("change_event".into(), serde_json::to_value(event)?);
        let submission_id = self
            .gateway
            .trigger_plugin(
                &self.spec.plugin,
                &serde_json::Value::Object(parameters),
                self.spec.high_priority,
            )
            .await?;
        info!(
            "consumer {} triggered {} as {}",
            self.spec.name, self.spec.plugin, submission_id
        );
        Ok(())
    }
}

/// Load the declarative consumer set and register each entry. A missing
/// file just means no consumers are configured.
pub async fn load_consumers(
    path: &Path,
    manager: &ConsumerManager,
    gateway: &Arc<BrokerGateway>,
) -> Result<usize> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            info!("no consumers file at {}", path.display());
            return Ok(0);
        }
    };
    let specs: Vec<ConsumerSpec> = serde_json::from_str(&raw)?;
    let mut count = 0;
    for spec in specs {
        let enabled = spec.enabled;
        let name = spec.name.clone();
        let consumer = Arc::new(TriggerConsumer::new(spec, Arc::clone(gateway)));
        manager.register(consumer).await;
        if !enabled {
            manager.set_enabled(&name, false).await;
        }
        count += 1;
    }
    info!("loaded {count} consumer(s) from {}", path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    fn event(db: &str, table: &str, event_type: RowEventType) -> RowEvent {
        RowEvent {
            database: db.into(),
            table: table.into(),
            event_type,
            data: serde_json::json!({"id": 1}),
            timestamp: Utc::now(),
        }
    }

    struct Recording {
        name: String,
        filters: Vec<TableFilter>,
        seen: Mutex<Vec<RowEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl Consumer for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn filters(&self) -> &[TableFilter] {
            &self.filters
        }

        async fn process_event(&self, event: &RowEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.clone());
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn recording(name: &str, filters: Vec<TableFilter>, fail: bool) -> Arc<Recording> {
        Arc::new(Recording {
            name: name.into(),
            filters,
            seen: Mutex::new(Vec::new()),
            fail,
        })
    }

    #[test]
    fn filter_matches_database_table_and_type() {
        let filter = TableFilter::new("app", "users", &[RowEventType::Insert]);
        assert!(filter.matches(&event("app", "users", RowEventType::Insert)));
        assert!(!filter.matches(&event("app", "users", RowEventType::Update)));
        assert!(!filter.matches(&event("app", "orders", RowEventType::Insert)));
        assert!(!filter.matches(&event("other", "users", RowEventType::Insert)));
    }

    #[test]
    fn empty_event_types_means_all() {
        let filter = TableFilter::new("app", "users", &[]);
        assert!(filter.matches(&event("app", "users", RowEventType::Delete)));
    }

    #[tokio::test]
    async fn dispatch_routes_by_filter() {
        let manager = ConsumerManager::new();
        let users = recording(
            "users",
            vec![TableFilter::new("app", "users", &[RowEventType::Insert])],
            false,
        );
        let orders = recording(
            "orders",
            vec![TableFilter::new("app", "orders", &[])],
            false,
        );
        manager.register(users.clone()).await;
        manager.register(orders.clone()).await;

        manager.dispatch(&event("app", "users", RowEventType::Insert)).await;
        manager.dispatch(&event("app", "users", RowEventType::Update)).await;
        manager.dispatch(&event("app", "orders", RowEventType::Update)).await;

        assert_eq!(users.seen.lock().unwrap().len(), 1);
        assert_eq!(orders.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_consumer_does_not_suppress_others() {
        let manager = ConsumerManager::new();
        let broken = recording("broken", vec![], true);
        let healthy = recording("healthy", vec![], false);
        manager.register(broken.clone()).await;
        manager.register(healthy.clone()).await;

        manager.dispatch(&event("app", "users", RowEventType::Insert)).await;

        assert_eq!(broken.seen.lock().unwrap().len(), 1);
        assert_eq!(healthy.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_consumer_sees_nothing() {
        let manager = ConsumerManager::new();
        let consumer = recording("sleepy", vec![], false);
        manager.register(consumer.clone()).await;
        assert!(manager.set_enabled("sleepy", false).await);

        manager.dispatch(&event("app", "users", RowEventType::Insert)).await;
        assert!(consumer.seen.lock().unwrap().is_empty());

        assert!(manager.set_enabled("sleepy", true).await);
        manager.dispatch(&event("app", "users", RowEventType::Insert)).await;
        assert_eq!(consumer.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn consumer_spec_parses_with_defaults() {
        let specs: Vec<ConsumerSpec> = serde_json::from_str(
            r#"[{
                "name": "user-sync",
                "filters": [{"database": "app", "table": "users", "event_types": ["INSERT"]}],
                "plugin": "indexer"
            }]"#,
        )
        .expect("specs");
        assert_eq!(specs.len(), 1);
        assert!(specs[0].enabled);
        assert!(!specs[0].high_priority);
        assert_eq!(specs[0].filters.len(), 1);
    }
}
