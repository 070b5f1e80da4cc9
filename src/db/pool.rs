//! Per-tenant connection pools
//!
//! One bounded pool per distinct (host, port, user, database), created on
//! first use and kept for the lifetime of the process. Requests presenting
//! the same credentials share the pool; callers beyond `max_size` wait for a
//! free connection without a timeout.

use crate::config::ConnectionConfig;
use crate::config::connections::SslMode;
use crate::config::settings::PoolSettings;
use crate::error::{DbError, DbResult};
use dashmap::DashMap;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Stable identity of a tenant store, derived from its credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn for_config(config: &ConnectionConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.host.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.port.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(config.username.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.database.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell tenants apart in logs
        write!(f, "{}", &self.0[..12])
    }
}

/// Process-wide registry of tenant pools
pub struct PoolManager {
    pools: DashMap<PoolKey, Pool>,
    settings: PoolSettings,
}

impl PoolManager {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
        }
    }

    /// Get the shared pool for these credentials, creating it if needed
    pub fn pool(&self, config: &ConnectionConfig) -> DbResult<(PoolKey, Pool)> {
        let key = PoolKey::for_config(config);
        if let Some(pool) = self.pools.get(&key) {
            return Ok((key, pool.value().clone()));
        }

        let entry = self
            .pools
            .entry(key.clone())
            .or_try_insert_with(|| self.build_pool(config, &key))?;
        Ok((key, entry.value().clone()))
    }

    fn build_pool(&self, config: &ConnectionConfig, key: &PoolKey) -> DbResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.username.clone());
        cfg.password = config.password.clone();
        // Timestamps travel as UTC wall-clock values; casts inside statements
        // must agree with that.
        cfg.options = Some("-c TimeZone=UTC".to_string());
        cfg.keepalives = Some(true);
        cfg.keepalives_idle = Some(Duration::from_secs(self.settings.keepalive_idle_secs));
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        // Default timeouts are all `None`: a saturated pool makes callers wait.
        cfg.pool = Some(PoolConfig::new(self.settings.max_size));

        let pool = match config.ssl_mode {
            SslMode::Disable => cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls),
            SslMode::Prefer | SslMode::Require => {
                cfg.ssl_mode = Some(match config.ssl_mode {
                    SslMode::Require => deadpool_postgres::SslMode::Require,
                    _ => deadpool_postgres::SslMode::Prefer,
                });
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_tls_config());
                cfg.create_pool(Some(Runtime::Tokio1), tls)
            }
        }
        .map_err(|e| DbError::Pool(format!("Failed to create pool: {}", e)))?;

        tracing::info!(
            pool = %key,
            target_db = %config.connection_string(),
            max_size = self.settings.max_size,
            "created connection pool"
        );
        Ok(pool)
    }

    /// Number of distinct tenant pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Build a rustls ClientConfig that trusts OS certificates (with Mozilla roots as fallback)
fn make_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    let mut loaded = 0;
    for cert in native_certs.certs {
        if root_store.add(cert).is_ok() {
            loaded += 1;
        }
    }
    if loaded == 0 {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
