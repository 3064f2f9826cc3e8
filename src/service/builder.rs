use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};
use crate::archive::cold_store::{ColdStore, SqliteColdStore};
use crate::archive::worker::ArchivalWorker;
use crate::cache::{CacheCleaner, ConcCacheMap};
use crate::compute::ConcCalculator;
use crate::core::auth::{Authenticator, StaticAuth};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::engine::CorpusEngine;
use crate::flight::{SingleFlight, StalePolicy, TaskAwareLiveness};
use crate::kvs::{JournaledKvs, KeyValueStore, MemoryKvs};
use crate::query::chain::QueryChain;
use crate::query::persistence::{KvsQueryPersistence, QueryPersistence};
use crate::service::concordance::ConcordanceService;
use crate::tasks::{TaskArgs, TaskContext, TaskDispatcher, TaskLimits, ThreadPoolDispatcher};

/// Task name the calculator is registered under
pub const CALC_TASK: &str = "conc_calculate";

/// Wires the components together. Only the corpus engine is mandatory;
/// everything else falls back to what `Config` describes.
pub struct CoreBuilder {
    config: Config,
    engine: Option<Arc<dyn CorpusEngine>>,
    auth: Option<Arc<dyn Authenticator>>,
    kvs: Option<Arc<dyn KeyValueStore>>,
    persistence: Option<Arc<dyn QueryPersistence>>,
    cold: Option<Arc<dyn ColdStore>>,
}

impl CoreBuilder {
    pub fn new(config: Config) -> Self {
        CoreBuilder {
            config,
            engine: None,
            auth: None,
            kvs: None,
            persistence: None,
            cold: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn CorpusEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_kvs(mut self, kvs: Arc<dyn KeyValueStore>) -> Self {
        self.kvs = Some(kvs);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn QueryPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_cold_store(mut self, cold: Arc<dyn ColdStore>) -> Self {
        self.cold = Some(cold);
        self
    }

    pub fn build(self) -> Result<ConcordanceService> {
        let config = self.config;
        config.validate()?;

        let engine = self
            .engine
            .ok_or_else(|| Error::new(ErrorKind::BadInput, "a corpus engine is required".to_string()))?;
        let auth: Arc<dyn Authenticator> = match self.auth {
            Some(auth) => auth,
            None => Arc::new(StaticAuth::default()),
        };

        // Storage
        let mut journal = None;
        let kvs: Arc<dyn KeyValueStore> = match (self.kvs, &config.kvs_journal_dir) {
            (Some(kvs), _) => kvs,
            (None, Some(dir)) => {
                let journaled = Arc::new(JournaledKvs::open(dir)?);
                journal = Some(journaled.clone());
                journaled
            }
            (None, None) => Arc::new(MemoryKvs::new()),
        };
        let cold: Arc<dyn ColdStore> = match self.cold {
            Some(cold) => cold,
            None => Arc::new(SqliteColdStore::open(&config.archive_db_path)?),
        };
        let persistence: Arc<dyn QueryPersistence> = match self.persistence {
            Some(persistence) => persistence,
            None => Arc::new(KvsQueryPersistence::new(
                kvs.clone(),
                cold.clone(),
                auth.clone(),
                config.registered_ttl_days,
                config.anonymous_ttl_days,
            )),
        };

        // Cache map, self-healed before anyone claims
        let map = Arc::new(ConcCacheMap::open(&config.cache_dir, config.lock_timeout())?);
        for corpname in map.corpora()? {
            let dropped = map.refresh_map(&corpname)?;
            if dropped > 0 {
                warn!(corpus = %corpname, dropped, "dropped cache entries without files");
            }
        }

        // Tasks and single-flight
        let dispatcher = Arc::new(ThreadPoolDispatcher::new(
            config.workers,
            TaskLimits {
                soft: config.soft_time_limit(),
                hard: config.hard_time_limit(),
            },
            Duration::from_secs(config.task_record_ttl_secs),
        )?);
        let tasks: Arc<dyn TaskDispatcher> = dispatcher.clone();
        let policy = StalePolicy::new(config.pidfile_grace(), Arc::new(TaskAwareLiveness::new(tasks)));
        let flight = Arc::new(SingleFlight::new(map.clone(), policy, config.backoff_bounds()));
        let calculator = Arc::new(ConcCalculator::new(engine.clone(), flight.clone(), config.progress_interval()));

        {
            let calculator = calculator.clone();
            dispatcher.register(CALC_TASK, move |ctx: &TaskContext, args: &TaskArgs| {
                let chain: QueryChain = serde_json::from_value(
                    args.get("chain", 1)
                        .cloned()
                        .ok_or_else(|| Error::new(ErrorKind::BadInput, "missing argument 'chain'".to_string()))?,
                )?;
                let outcome = calculator.compute(ctx, &chain)?;
                Ok(serde_json::to_value(outcome)?)
            });
        }

        // Archival
        let archiver = Arc::new(ArchivalWorker::new(
            kvs.clone(),
            cold.clone(),
            config.hot_ttl_days,
            config.cold_ttl_days,
            config.archive_batch_size,
        ));
        let archival_handle = (config.archive_interval_secs > 0)
            .then(|| archiver.clone().spawn(Duration::from_secs(config.archive_interval_secs)));

        let cleaner = CacheCleaner::new(
            map.clone(),
            Duration::from_secs(config.cache_max_age_secs),
            config.cache_max_bytes,
        );

        info!(
            cache_dir = %config.cache_dir.display(),
            workers = config.workers,
            journaled = journal.is_some(),
            "concordance service ready"
        );

        Ok(ConcordanceService {
            config,
            kvs,
            persistence,
            cold,
            engine,
            auth,
            map,
            flight,
            dispatcher,
            archiver,
            cleaner,
            journal,
            archival_handle: Mutex::new(archival_handle),
            closed: AtomicBool::new(false),
            start_time: SystemTime::now(),
        })
    }
}

/// Keyword arguments of a `conc_calculate` task
pub fn calc_task_args(chain_id: &str, chain: &QueryChain) -> Result<TaskArgs> {
    Ok(TaskArgs::keyword(&[
        ("chain_id", Value::String(chain_id.to_string())),
        ("chain", serde_json::to_value(chain)?),
    ]))
}
