//! Session pool
//!
//! Requests run concurrently but share a bounded, reused set of sessions;
//! nothing is recreated per request except the grant rule map, which is
//! loaded fresh on every check so rule edits apply immediately.
//!
//! A `Session` bundles the store handle with the engine configuration and
//! exposes the request-level entry points: resolve, authorize, report,
//! dump.

use crate::config::Config;
use crate::dump::{DumpCodec, RestoreStats};
use crate::error::{CoreError, Result};
use crate::grants::{GrantLevel, GrantResolver, Principal};
use crate::ops::Ops;
use crate::report::{ReportCompiler, ReportPlan};
use crate::report_exec::{Filter, OrderSpec, Page, ReportExecutor, ReportResult};
use crate::schema::{FieldDef, ResolvedInstance, SchemaResolver};
use crate::store::RelationStore;
use crate::types::{RowId, ROOT};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Configuration for the session pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions created up front
    pub min_size: usize,
    /// Hard bound on concurrently checked-out sessions
    pub max_size: usize,
    /// Maximum time to wait for a free session
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 2,
            max_size: 8,
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

/// One request-scoped handle on the core
pub struct Session<S: RelationStore + ?Sized> {
    store: Arc<S>,
    config: Config,
}

impl<S: RelationStore + ?Sized> Session<S> {
    pub fn new(store: Arc<S>, config: Config) -> Self {
        Session { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ops(&self) -> Ops<'_, S> {
        Ops::new(&*self.store)
    }

    /// Ordered field list of a type.
    pub fn resolve_fields(&self, type_id: RowId) -> Result<Vec<FieldDef>> {
        SchemaResolver::new(&*self.store).resolve_fields(type_id)
    }

    /// Authorize, then join one instance against its field list.
    pub fn read_instance(
        &self,
        type_id: RowId,
        object_id: RowId,
        principal: &Principal,
    ) -> Result<ResolvedInstance> {
        let grants = GrantResolver::new(&*self.store, &self.config);
        grants.require(object_id, type_id, GrantLevel::Read, principal)?;
        SchemaResolver::new(&*self.store).resolve_instance(type_id, object_id)
    }

    pub fn check_grant(
        &self,
        id: RowId,
        type_id: RowId,
        level: GrantLevel,
        principal: &Principal,
    ) -> bool {
        GrantResolver::new(&*self.store, &self.config).check_grant(id, type_id, level, principal)
    }

    pub fn grant_one_level(&self, id: RowId, principal: &Principal) -> bool {
        GrantResolver::new(&*self.store, &self.config).grant_one_level(id, principal)
    }

    pub fn compile_report(&self, report_id: RowId) -> Result<ReportPlan> {
        ReportCompiler::new(&*self.store).compile(report_id)
    }

    /// The full report path: authorize the report row, compile, execute.
    pub fn run_report(
        &self,
        report_id: RowId,
        principal: &Principal,
        filters: &[Filter],
        page: Page,
        order: &OrderSpec,
    ) -> Result<ReportResult> {
        let grants = GrantResolver::new(&*self.store, &self.config);
        grants.require(report_id, ROOT, GrantLevel::Read, principal)?;
        let plan = self.compile_report(report_id)?;
        ReportExecutor::new(&*self.store, &self.config).execute(&plan, filters, page, order)
    }

    pub fn dump<W: Write>(&self, writer: W) -> Result<usize> {
        DumpCodec::new(&*self.store, &self.config).encode(writer)
    }

    pub fn dump_compressed<W: Write>(&self, writer: W) -> Result<usize> {
        DumpCodec::new(&*self.store, &self.config).encode_compressed(writer)
    }

    pub fn restore<R: Read>(&self, reader: R) -> Result<RestoreStats> {
        DumpCodec::new(&*self.store, &self.config).decode(reader)
    }
}

/// Bounded pool of reusable sessions over one shared store
pub struct SessionPool<S: RelationStore + ?Sized> {
    idle: Mutex<VecDeque<Session<S>>>,
    available: Condvar,
    created: Mutex<usize>,
    store: Arc<S>,
    config: Config,
    pool_config: PoolConfig,
}

impl<S: RelationStore + ?Sized> SessionPool<S> {
    pub fn new(store: Arc<S>, config: Config, pool_config: PoolConfig) -> Result<Self> {
        if pool_config.min_size > pool_config.max_size {
            return Err(CoreError::invalid("min_size cannot exceed max_size"));
        }
        let pool = SessionPool {
            idle: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            created: Mutex::new(0),
            store,
            config,
            pool_config,
        };
        for _ in 0..pool.pool_config.min_size {
            if pool.try_reserve_slot() {
                pool.idle.lock().unwrap().push_back(pool.create_session());
            }
        }
        Ok(pool)
    }

    fn create_session(&self) -> Session<S> {
        Session::new(Arc::clone(&self.store), self.config.clone())
    }

    /// Reserve a creation slot; check and increment are one step so
    /// concurrent checkouts cannot overshoot `max_size`.
    fn try_reserve_slot(&self) -> bool {
        let mut created = self.created.lock().unwrap();
        if *created < self.pool_config.max_size {
            *created += 1;
            true
        } else {
            false
        }
    }

    /// Check out a session, waiting up to the configured timeout when the
    /// pool is at capacity.
    pub fn checkout(&self) -> Result<PooledSession<'_, S>> {
        let mut idle = self.idle.lock().unwrap();
        loop {
            if let Some(session) = idle.pop_front() {
                return Ok(PooledSession {
                    session: Some(session),
                    pool: self,
                });
            }
            if self.try_reserve_slot() {
                drop(idle);
                return Ok(PooledSession {
                    session: Some(self.create_session()),
                    pool: self,
                });
            }
            let (guard, outcome) = self
                .available
                .wait_timeout(idle, self.pool_config.checkout_timeout)
                .unwrap();
            idle = guard;
            if outcome.timed_out() && idle.is_empty() {
                return Err(CoreError::storage("session checkout"));
            }
        }
    }

    fn checkin(&self, session: Session<S>) {
        self.idle.lock().unwrap().push_back(session);
        self.available.notify_one();
    }

    /// Sessions created over the pool's lifetime (checked out or idle).
    pub fn size(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

/// A checked-out session; returns itself to the pool on drop
pub struct PooledSession<'a, S: RelationStore + ?Sized> {
    session: Option<Session<S>>,
    pool: &'a SessionPool<S>,
}

impl<S: RelationStore + ?Sized> Deref for PooledSession<'_, S> {
    type Target = Session<S>;

    fn deref(&self) -> &Session<S> {
        self.session.as_ref().expect("session present until drop")
    }
}

impl<S: RelationStore + ?Sized> Drop for PooledSession<'_, S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.checkin(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pool(pool_config: PoolConfig) -> SessionPool<MemoryStore> {
        SessionPool::new(
            Arc::new(MemoryStore::with_base_types()),
            Config::default(),
            pool_config,
        )
        .unwrap()
    }

    #[test]
    fn test_min_size_precreated() {
        let pool = pool(PoolConfig::default());
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_checkout_grows_to_max() {
        let pool = pool(PoolConfig {
            min_size: 1,
            max_size: 2,
            checkout_timeout: Duration::from_millis(50),
        });

        let first = pool.checkout().unwrap();
        let second = pool.checkout().unwrap();
        assert_eq!(pool.size(), 2);

        // At capacity with nothing idle: the third checkout times out.
        assert!(pool.checkout().is_err());

        drop(first);
        let third = pool.checkout().unwrap();
        drop(second);
        drop(third);
    }

    #[test]
    fn test_sessions_are_reused() {
        let pool = pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            checkout_timeout: Duration::from_millis(50),
        });
        for _ in 0..5 {
            let session = pool.checkout().unwrap();
            session.resolve_fields(crate::types::BaseType::Number.id()).unwrap();
        }
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SessionPool::new(
            Arc::new(MemoryStore::with_base_types()),
            Config::default(),
            PoolConfig {
                min_size: 5,
                max_size: 2,
                checkout_timeout: Duration::from_secs(1),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_checkouts() {
        let pool = Arc::new(pool(PoolConfig {
            min_size: 2,
            max_size: 4,
            checkout_timeout: Duration::from_secs(5),
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let session = pool.checkout().unwrap();
                session
                    .resolve_fields(crate::types::BaseType::ShortText.id())
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.size() <= 4);
    }
}
