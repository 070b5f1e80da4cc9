//! Backend dispatch
//!
//! Picks the backend for each request. The mode comes from a setting record
//! stored on the managed backend; it is read once and cached for the process
//! lifetime. Until a read succeeds, requests go to the managed backend.

use crate::config::settings::{DispatchSettings, Settings};
use crate::config::{ConnectionConfig, resolve_credentials};
use crate::db::managed::ManagedBackend;
use crate::db::pool::PoolManager;
use crate::db::postgres::PostgresBackend;
use crate::db::provider::EntityBackend;
use crate::db::query::{Filter, ListQuery};
use crate::db::schema::SchemaCache;
use crate::db::types::CoercionRules;
use crate::error::DbResult;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

/// Field of the setting record matched against the setting key
const SETTING_KEY_FIELD: &str = "key";

/// Which backend serves entity requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Relational,
    Managed,
}

impl BackendMode {
    /// Interpret a stored mode value; anything unrecognized is managed
    pub fn parse(value: &Value) -> Self {
        let Some(raw) = value.as_str() else {
            return BackendMode::Managed;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "relational" | "sql" | "mysql" => BackendMode::Relational,
            _ => BackendMode::Managed,
        }
    }
}

/// Reads and caches the process-wide backend mode
#[derive(Debug)]
pub struct ModeResolver {
    settings: DispatchSettings,
    cached: OnceLock<BackendMode>,
}

impl ModeResolver {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            settings,
            cached: OnceLock::new(),
        }
    }

    /// The cached mode, if one has been read
    pub fn cached(&self) -> Option<BackendMode> {
        self.cached.get().copied()
    }

    /// Whether `entity` must stay on the managed backend whatever the mode
    pub fn always_managed(&self, entity: &str) -> bool {
        self.settings.always_managed.iter().any(|e| e == entity)
    }

    pub async fn resolve(&self, config_store: &dyn EntityBackend) -> BackendMode {
        if let Some(mode) = self.cached.get() {
            return *mode;
        }
        match self.read(config_store).await {
            Ok(mode) => {
                let mode = *self.cached.get_or_init(|| mode);
                tracing::info!(?mode, "resolved backend mode");
                mode
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read backend mode, using managed backend");
                BackendMode::Managed
            }
        }
    }

    async fn read(&self, config_store: &dyn EntityBackend) -> DbResult<BackendMode> {
        let filter = Filter::default().eq(
            SETTING_KEY_FIELD,
            Value::String(self.settings.setting_key.clone()),
        );
        let rows = config_store
            .list(&self.settings.setting_entity, &ListQuery::filtered(filter).limit(1))
            .await?;
        Ok(rows
            .first()
            .and_then(|record| record.get(&self.settings.setting_field))
            .map_or(BackendMode::Managed, BackendMode::parse))
    }
}

/// Supplies the relational backend for a set of tenant credentials
pub trait RelationalSource: Send + Sync {
    fn backend(&self, credentials: &ConnectionConfig) -> DbResult<Arc<dyn EntityBackend>>;
}

/// Relational backends over the shared pool registry
pub struct PooledSource {
    pools: PoolManager,
    schema: Arc<SchemaCache>,
    rules: Arc<CoercionRules>,
}

impl PooledSource {
    pub fn new(pools: PoolManager, rules: CoercionRules) -> Self {
        Self {
            pools,
            schema: Arc::new(SchemaCache::new()),
            rules: Arc::new(rules),
        }
    }
}

impl RelationalSource for PooledSource {
    fn backend(&self, credentials: &ConnectionConfig) -> DbResult<Arc<dyn EntityBackend>> {
        let (key, pool) = self.pools.pool(credentials)?;
        Ok(Arc::new(PostgresBackend::new(
            pool,
            key,
            Arc::clone(&self.schema),
            Arc::clone(&self.rules),
        )))
    }
}

/// Routes entity operations to the configured backend
pub struct Dispatcher {
    managed: Arc<dyn EntityBackend>,
    relational: Arc<dyn RelationalSource>,
    default_credentials: ConnectionConfig,
    resolver: ModeResolver,
}

impl Dispatcher {
    pub fn new(
        managed: Arc<dyn EntityBackend>,
        relational: Arc<dyn RelationalSource>,
        default_credentials: ConnectionConfig,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            managed,
            relational,
            default_credentials,
            resolver: ModeResolver::new(settings),
        }
    }

    /// Wire up the production backends from settings
    pub fn from_settings(settings: &Settings) -> DbResult<Self> {
        let managed = ManagedBackend::new(&settings.managed)?;
        let relational = PooledSource::new(
            PoolManager::new(settings.pool.clone()),
            CoercionRules::from_settings(&settings.coercion),
        );
        Ok(Self::new(
            Arc::new(managed),
            Arc::new(relational),
            settings.database.clone(),
            settings.dispatch.clone(),
        ))
    }

    pub fn resolver(&self) -> &ModeResolver {
        &self.resolver
    }

    /// Backend for one request on `entity`, using the request's credential
    /// token when the relational backend is selected
    pub async fn backend_for(
        &self,
        entity: &str,
        credential_token: Option<&str>,
    ) -> DbResult<Arc<dyn EntityBackend>> {
        if self.resolver.always_managed(entity) {
            return Ok(Arc::clone(&self.managed));
        }
        match self.resolver.resolve(self.managed.as_ref()).await {
            BackendMode::Managed => Ok(Arc::clone(&self.managed)),
            BackendMode::Relational => {
                let credentials = resolve_credentials(&self.default_credentials, credential_token);
                self.relational.backend(&credentials)
            }
        }
    }
}
