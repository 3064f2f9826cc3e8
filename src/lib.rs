pub mod core;
pub mod storage;
pub mod engine;
pub mod kvs;
pub mod query;
pub mod archive;
pub mod cache;
pub mod tasks;
pub mod flight;
pub mod compute;
pub mod service;

pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::service::{ConcordanceService, CoreBuilder};

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                             CONCCACHE STRUCT ARCHITECTURE                                   │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── SERVICE LAYER ───────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                           struct ConcordanceService                                 │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ config: Config                      // Paths, TTLs, limits                   │ │    │
│  │  │ kvs: Arc<dyn KeyValueStore>         // Hot records, task ids, archive queue  │ │    │
│  │  │ persistence: Arc<dyn QueryPersistence> // Chain ids and records             │ │    │
│  │  │ cold: Arc<dyn ColdStore>            // SQLite archive                        │ │    │
│  │  │ engine: Arc<dyn CorpusEngine>       // Query evaluation                      │ │    │
│  │  │ map: Arc<ConcCacheMap>              // 00CONCS.map per corpus                │ │    │
│  │  │ flight: Arc<SingleFlight>           // One producer per cache key            │ │    │
│  │  │ dispatcher: Arc<ThreadPoolDispatcher> // conc_calculate tasks               │ │    │
│  │  │ archiver: Arc<ArchivalWorker>       // Hot -> cold migration                 │ │    │
│  │  │ cleaner: CacheCleaner               // Age / byte budget eviction            │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│          built by CoreBuilder (engine required, everything else injectable)                 │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── COMPUTATION LAYER ──────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐    ┌─────────────────────────┐    ┌────────────────────────┐   │
│  │ ThreadPoolDispatcher   │───►│ ConcCalculator          │───►│ SingleFlight           │   │
│  │ • crossbeam job queue  │    │ • cached prefix reuse   │    │ • claim / attach       │   │
│  │ • conc-worker-N        │    │ • streamed query phase  │    │ • publish / complete   │   │
│  │ • conc-watchdog        │    │ • filter/sort/sample/.. │    │ • StalePolicy          │   │
│  │ • CancelToken          │    │ • intermediate results  │    │   (grace + liveness)   │   │
│  └────────────────────────┘    └─────────────────────────┘    └────────────────────────┘   │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── STORAGE LAYER ────────────────────────────────────────┐
│                                                                                              │
│  <cache_dir>/<corpus>/                                                                       │
│    00CONCS.map        bincode ConcMapState   (key -> CacheEntry)                            │
│    00CONCS.map.lock   flock(2), held for every map mutation                                 │
│    <slug>.conc        [len u32][crc32 u32][bincode ConcLine]*                               │
│    <slug>.pid         JSON {pid, task_id, started_at}, created with link(2)                 │
│                                                                                              │
│  KVS: MemoryKvs | JournaledKvs (bincode journal + JSON snapshot)                            │
│  ColdStore: SqliteColdStore (rusqlite)                                                       │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

Lock order: map lock -> pidfile. The map is saved before files are unlinked.
*/
