//! Process wiring: adapters, providers, workers, reconciliation, recovery.
//!
//! Start-up order matters: recovery reconciles whatever the previous process left
//! in flight before any worker reserves from a queue.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clipforge_events::InMemoryRealtimeHub;
use clipforge_generation::JobKind;
use clipforge_infra::config::{AppConfig, ProviderSettings};
use clipforge_infra::jobs::{Broker, BrokerError, InMemoryBroker, QueueWorker, QueueWorkerHandle};
use clipforge_infra::monitor::QueueMonitor;
use clipforge_infra::notifications::{
    InMemoryUserDirectory, LoggingPushDelivery, Notifier, StaticTranslator, UserDirectory,
};
use clipforge_infra::outcome::OutcomeHandler;
use clipforge_infra::recovery::{RecoveryError, RecoveryManager, RecoveryReport};
use clipforge_infra::repo::{
    InMemoryJobRepository, InMemoryNotificationStore, InMemoryRecordRepository, JobRepository,
    NotificationStore, PgCreditStore, PgJobRepository, PgNotificationStore, PgRecordRepository,
    PgUserDirectory, RecordRepository, RepositoryError, RepositoryJobLookup,
};
use clipforge_infra::service::JobService;
use clipforge_ledger::{CreditLedger, CreditStore, InMemoryCreditStore};
use clipforge_pipeline::{
    EffectConfig, EffectExecutor, FfmpegComposer, GenerationLibExecutor,
    HttpMediaFetcher, HttpObjectStorage, HttpProviderClient, MediaFetcher, ModelGateway,
    ModelInvoker, ObjectStorage, PipelineDispatcher, PollConfig, PollingInvoker, ProviderError,
    StoryConfig, StoryExecutor, StoryModels, StoryProviders,
};

use crate::app::services::AppServices;

const OUTCOME_BUFFER: usize = 256;
const PG_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{0} must be set")]
    MissingSetting(&'static str),
    #[error("REDIS_URL is set but this build has no redis support (enable the `redis` feature)")]
    RedisUnsupported,
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

/// Storage and transport adapters.
#[derive(Clone)]
pub struct Adapters {
    pub jobs: Arc<dyn JobRepository>,
    pub records: Arc<dyn RecordRepository>,
    pub notifications: Arc<dyn NotificationStore>,
    pub credits: Arc<dyn CreditStore>,
    pub users: Arc<dyn UserDirectory>,
    pub broker: Arc<dyn Broker>,
}

impl Adapters {
    /// Process-local adapters. Nothing survives a restart.
    pub fn in_memory(credits: Arc<dyn CreditStore>) -> Self {
        Self {
            jobs: InMemoryJobRepository::arc(),
            records: InMemoryRecordRepository::arc(),
            notifications: InMemoryNotificationStore::arc(),
            credits,
            users: InMemoryUserDirectory::arc(),
            broker: InMemoryBroker::arc(),
        }
    }

    /// Postgres when `DATABASE_URL` is set, Redis when `REDIS_URL` is set; in-memory otherwise.
    pub async fn from_config(config: &AppConfig) -> Result<Self, BootstrapError> {
        let mut adapters = match &config.database_url {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(PG_MAX_CONNECTIONS)
                    .connect(url)
                    .await?;
                clipforge_infra::repo::migrate(&pool).await?;
                info!("using postgres persistence");
                Self {
                    jobs: Arc::new(PgJobRepository::new(pool.clone())),
                    records: Arc::new(PgRecordRepository::new(pool.clone())),
                    notifications: Arc::new(PgNotificationStore::new(pool.clone())),
                    credits: Arc::new(PgCreditStore::new(pool.clone())),
                    users: Arc::new(PgUserDirectory::new(pool)),
                    broker: InMemoryBroker::arc(),
                }
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory persistence (balances start empty)");
                Self::in_memory(InMemoryCreditStore::arc())
            }
        };

        if let Some(url) = &config.redis_url {
            adapters.broker = connect_broker(url).await?;
        } else {
            warn!("REDIS_URL not set; queues are in-memory and lost on restart");
        }
        Ok(adapters)
    }
}

#[cfg(feature = "redis")]
async fn connect_broker(url: &str) -> Result<Arc<dyn Broker>, BootstrapError> {
    let broker = clipforge_infra::jobs::RedisBroker::connect(url, None).await?;
    info!("using redis broker");
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(_url: &str) -> Result<Arc<dyn Broker>, BootstrapError> {
    Err(BootstrapError::RedisUnsupported)
}

/// Model and media providers used by the pipelines.
#[derive(Clone)]
pub struct Providers {
    pub story: StoryProviders,
    pub invoker: Arc<dyn ModelInvoker>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl Providers {
    /// Hosted models over HTTP, ffmpeg for composition, HTTP object storage.
    pub fn http(settings: &ProviderSettings) -> Result<Self, BootstrapError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(BootstrapError::MissingSetting("PROVIDER_API_KEY"))?;
        let upload_url = settings
            .storage_upload_url
            .clone()
            .ok_or(BootstrapError::MissingSetting("STORAGE_UPLOAD_URL"))?;
        let public_url = settings
            .storage_public_url
            .clone()
            .ok_or(BootstrapError::MissingSetting("STORAGE_PUBLIC_URL"))?;

        let client = HttpProviderClient::new(settings.base_url.clone(), api_key)?;
        let invoker: Arc<dyn ModelInvoker> =
            Arc::new(PollingInvoker::new(client, PollConfig::default()));
        let fetcher: Arc<dyn MediaFetcher> = Arc::new(HttpMediaFetcher::new()?);
        let storage: Arc<dyn ObjectStorage> = Arc::new(HttpObjectStorage::new(
            upload_url,
            public_url,
            settings.storage_token.clone(),
        )?);

        let gateway = Arc::new(ModelGateway::new(
            invoker.clone(),
            fetcher.clone(),
            StoryModels::default(),
        ));
        let composer =
            Arc::new(FfmpegComposer::new(fetcher.clone()).with_binary(&settings.ffmpeg_path));

        Ok(Self {
            story: StoryProviders {
                text: gateway.clone(),
                speech: gateway.clone(),
                image: gateway.clone(),
                video: gateway,
                composer,
                storage: storage.clone(),
            },
            invoker,
            fetcher,
            storage,
        })
    }
}

/// Everything running behind the HTTP surface.
pub struct Runtime {
    services: Arc<AppServices>,
    recovery: RecoveryReport,
    shutdown: CancellationToken,
    workers: Vec<QueueWorkerHandle>,
    background: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(
        config: &AppConfig,
        adapters: Adapters,
        providers: Providers,
    ) -> Result<Self, BootstrapError> {
        let realtime = Arc::new(InMemoryRealtimeHub::new());
        let ledger = CreditLedger::new(adapters.credits.clone(), config.credit_band);

        let notifier = Notifier::new(
            Arc::new(StaticTranslator::new()),
            adapters.users.clone(),
            Arc::new(LoggingPushDelivery),
            adapters.notifications.clone(),
            realtime.clone(),
        )
        .with_ttl(config.notification_ttl);

        let outcomes = OutcomeHandler::new(
            adapters.jobs.clone(),
            adapters.records.clone(),
            ledger.clone(),
            notifier,
            realtime.clone(),
        );

        let shutdown = CancellationToken::new();
        let recovery = RecoveryManager::new(
            adapters.broker.clone(),
            adapters.jobs.clone(),
            outcomes.clone(),
        );
        let monitor = QueueMonitor::new(
            adapters.broker.clone(),
            adapters.notifications.clone(),
            config.monitor.clone(),
        );
        let (report, monitor_handle) = monitor.start(&recovery, shutdown.clone()).await?;

        let dispatcher = Arc::new(
            PipelineDispatcher::new(
                StoryExecutor::new(providers.story, StoryConfig::default()),
                EffectExecutor::new(providers.invoker.clone(), EffectConfig::default()),
                GenerationLibExecutor::new(
                    providers.invoker,
                    providers.fetcher,
                    providers.storage,
                    EffectConfig::default(),
                ),
                Arc::new(RepositoryJobLookup::new(adapters.jobs.clone())),
                realtime.clone(),
            )
            .with_progress_interval(config.progress_tick),
        );

        let (tx, rx) = mpsc::channel(OUTCOME_BUFFER);
        let reconciler = outcomes.spawn_reconciler(rx, shutdown.clone());

        let workers = JobKind::ALL
            .into_iter()
            .map(|queue| {
                QueueWorker::new(
                    adapters.broker.clone(),
                    dispatcher.clone(),
                    tx.clone(),
                    config.worker_config(queue),
                )
                .spawn(shutdown.child_token())
            })
            .collect();

        let mut jobs = JobService::new(
            adapters.jobs,
            adapters.records,
            ledger,
            adapters.broker,
            config.pricing,
        );
        for queue in JobKind::ALL {
            jobs = jobs.with_queue_options(queue, config.queue(queue).job_options());
        }

        info!(
            broker_reconciled = report.broker_reconciled,
            orphans_reconciled = report.orphans_reconciled,
            "runtime started"
        );

        Ok(Self {
            services: Arc::new(AppServices::new(jobs, realtime)),
            recovery: report,
            shutdown,
            workers,
            background: vec![reconciler, monitor_handle],
        })
    }

    pub fn services(&self) -> Arc<AppServices> {
        self.services.clone()
    }

    /// What start-up recovery reconciled.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Drain workers first so their last outcomes still reach the reconciler.
    pub async fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown().await;
        }
        self.shutdown.cancel();
        for handle in self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("runtime stopped");
    }
}
