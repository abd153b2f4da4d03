use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use leadflow_core::clock::SystemClock;
use leadflow_core::compliance::ComplianceGate;
use leadflow_core::config::{AppConfig, ConfigError, LoadOptions};
use leadflow_core::dispatch::DispatchEngine;
use leadflow_core::notify::NotificationSink;
use leadflow_db::repositories::{
    SqlConversationRepository, SqlEventDedupRepository, SqlMessageRepository,
};
use leadflow_db::{connect_with_settings, migrations, DbPool};
use leadflow_orchestrator::{
    DispatcherOptions, EventRouter, MessageDispatcher, NoopLeadDataProvider, PeriodicScanner,
    RouterConfig, ScannerConfig, TemplateContentGenerator, TracingNotificationSink,
    WebhookNotificationSink,
};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub router: Arc<EventRouter>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub scanner: Arc<PeriodicScanner>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        "database migrations applied"
    );

    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let messages = Arc::new(SqlMessageRepository::new(db_pool.clone()));
    let dedup = Arc::new(SqlEventDedupRepository::new(db_pool.clone()));
    let clock = Arc::new(SystemClock);

    let notifications: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookNotificationSink::new(url.clone())),
        None => Arc::new(TracingNotificationSink),
    };

    let dispatcher = Arc::new(MessageDispatcher::new(
        DispatchEngine::with_config(config.orchestrator.dispatch_config()),
        ComplianceGate::new(config.compliance.send_window()),
        conversations.clone(),
        messages.clone(),
        // The real transport is an external collaborator; the logging
        // sender stands in until one is wired up.
        Arc::new(leadflow_orchestrator::LoggingChannelSender),
        notifications.clone(),
        clock.clone(),
        DispatcherOptions {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            batch_size: config.orchestrator.dispatch_batch_size,
            cas_retry_limit: config.orchestrator.cas_retry_limit,
        },
    ));

    let router = Arc::new(EventRouter::new(
        conversations.clone(),
        messages.clone(),
        dedup,
        dispatcher.clone(),
        Arc::new(TemplateContentGenerator),
        Arc::new(NoopLeadDataProvider),
        notifications,
        clock.clone(),
        RouterConfig::from_orchestrator(&config.orchestrator),
    ));

    let scanner = Arc::new(PeriodicScanner::new(
        router.clone(),
        dispatcher.clone(),
        conversations,
        messages,
        clock,
        ScannerConfig::from_orchestrator(&config.orchestrator),
    ));

    Ok(Application { config, db_pool, router, dispatcher, scanner })
}
