//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_engine::realtime::ChannelRegistry;
use herald_engine::stats::StatsAggregator;
use herald_engine::store::QueueStore;
use herald_engine::tracker::StatusTracker;
use herald_notifier::dispatcher::{Dispatcher, DispatcherConfig};
use herald_notifier::sender::EmailSender;
use herald_notifier::template::PlaceholderRenderer;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QueueStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: StatusTracker,
    pub stats: StatsAggregator,
    pub registry: Arc<ChannelRegistry>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn QueueStore>, sender: Arc<dyn EmailSender>, config: AppConfig) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            sender,
            Arc::new(PlaceholderRenderer),
            DispatcherConfig::from_app_config(&config),
        );
        Self {
            tracker: StatusTracker::new(store.clone()),
            stats: StatsAggregator::new(store.clone()),
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(ChannelRegistry::new()),
            store,
            config,
        }
    }
}
