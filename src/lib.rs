//! Moderation core: a persistence/permission/retry/coordinator stack that
//! a Discord bot's command layer drives, independent of any particular
//! gateway connection.

pub mod adapter;
pub mod audit;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod embed;
pub mod error;
pub mod lock;
pub mod permissions;
pub mod retry;
pub mod store;
pub mod timeout;

use std::sync::Arc;

pub use adapter::DiscordAdapter;
pub use audit::AuditMonitor;
pub use coordinator::{ActionContext, ActionStep, ModerationCoordinator, ModerationOutcome, ModerationRequest};
pub use error::ModerationError;
pub use permissions::PermissionEngine;
pub use store::{CaseStore, CaseType, PermissionStore};

use cache::CacheBackend;
use lock::LockManager;
use retry::RetryRegistry;

/// Wires every component (cache, permissions, store, lock manager, retry
/// registry, audit monitor) into the one entry point the bot's command
/// layer calls: `coordinator()`.
pub struct ModerationCore {
    pub permissions: Arc<PermissionEngine>,
    pub store: Arc<dyn CaseStore>,
    pub permission_store: Arc<dyn PermissionStore>,
    pub audit: Arc<AuditMonitor>,
    coordinator: Arc<ModerationCoordinator>,
}

/// Default bounded capacity for the Audit Monitor's in-memory event deque.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

impl ModerationCore {
    pub fn new(
        adapter: Arc<dyn DiscordAdapter>,
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn CaseStore>,
        permission_store: Arc<dyn PermissionStore>,
    ) -> Self {
        let permissions = Arc::new(PermissionEngine::new(cache, permission_store.clone()));
        let audit = Arc::new(AuditMonitor::new(DEFAULT_AUDIT_CAPACITY));
        let coordinator = Arc::new(ModerationCoordinator::new(
            adapter,
            permissions.clone(),
            store.clone(),
            LockManager::new(),
            RetryRegistry::new(),
            audit.clone(),
        ));

        Self {
            permissions,
            store,
            permission_store,
            audit,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> Arc<ModerationCoordinator> {
        self.coordinator.clone()
    }
}
