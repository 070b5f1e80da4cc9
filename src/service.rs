//! Proxy service
//!
//! Shared state behind the HTTP layer: the dispatcher, the atomic operation
//! engine and the access rules. Command execution lives in
//! `commands::handlers`.

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::error::{ProxyError, Result};
use crate::ops::{AtomicOps, CellSpec};

/// Role allowed to run admin-only actions
pub const ADMIN_ROLE: &str = "admin";

/// Caller identity resolved upstream of the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub role: Option<String>,
}

impl Identity {
    /// Build an identity from header values; a missing email is unauthorized
    pub fn from_parts(email: Option<&str>, role: Option<&str>) -> Result<Self> {
        let email = email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(ProxyError::Unauthorized)?;
        Ok(Self {
            email: email.to_string(),
            role: role
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case(ADMIN_ROLE))
    }
}

pub struct ProxyService {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) ops: AtomicOps,
    pub(crate) cell: CellSpec,
    admin_only: Vec<String>,
}

impl ProxyService {
    pub fn new(dispatcher: Dispatcher, settings: &Settings) -> Self {
        Self {
            dispatcher,
            ops: AtomicOps::new(),
            cell: CellSpec::from(&settings.staffing),
            admin_only: settings.access.admin_only_actions.clone(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Reject admin-only commands for non-admin callers
    pub fn authorize(&self, identity: &Identity, command_name: &str) -> Result<()> {
        if self.admin_only.iter().any(|a| a == command_name) && !identity.is_admin() {
            tracing::info!(user = %identity.email, command = command_name, "forbidden");
            return Err(ProxyError::Forbidden(format!(
                "{} requires the {} role",
                command_name, ADMIN_ROLE
            )));
        }
        Ok(())
    }
}
