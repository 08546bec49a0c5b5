//! Application state shared by all HTTP handlers.
//!
//! Cheap to clone: everything inside is an `Arc` or an internally
//! pooled client. Built once in `main` after the worker pool and the
//! Redis connection are up.

use std::sync::Arc;

use crate::access::AccessGate;
use crate::cache::Cache;
use crate::config::Config;
use crate::helpers::Commit;
use crate::templates::Pages;
use crate::workers::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub pool: Arc<WorkerPool>,
    pub cache: Cache,
    pub gate: Arc<AccessGate>,
    pub pages: Arc<Pages>,
    /// Last three commits of the running checkout, read once at startup.
    pub commits: Arc<Vec<Commit>>,
}
