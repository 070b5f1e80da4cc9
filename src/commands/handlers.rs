//! Command execution handlers
//!
//! Executes parsed commands against the selected backend and shapes the
//! response body.

use crate::commands::{Command, EntityCommand, EntityRequest, parse_action, parse_operation};
use crate::error::{ProxyError, Result};
use crate::service::{Identity, ProxyService};
use serde_json::{Value, json};

impl ProxyService {
    /// Handle a plain entity action body
    pub async fn handle_action(
        &self,
        identity: &Identity,
        credential_token: Option<&str>,
        request: EntityRequest,
    ) -> Result<Value> {
        let command = parse_action(request)?;
        self.execute_command(identity, credential_token, command).await
    }

    /// Handle a guarded operation body
    pub async fn handle_operation(
        &self,
        identity: &Identity,
        credential_token: Option<&str>,
        request: EntityRequest,
    ) -> Result<Value> {
        let command = parse_operation(request)?;
        self.execute_command(identity, credential_token, command).await
    }

    /// Execute a command and return the response body
    pub async fn execute_command(
        &self,
        identity: &Identity,
        credential_token: Option<&str>,
        command: EntityCommand,
    ) -> Result<Value> {
        self.authorize(identity, &command.name)?;
        let backend = self
            .dispatcher
            .backend_for(&command.entity, credential_token)
            .await?;
        let backend = backend.as_ref();
        let entity = command.entity.as_str();
        tracing::debug!(
            entity,
            command = %command.name,
            backend = backend.name(),
            user = %identity.email,
            "executing"
        );

        match command.command {
            Command::List(query) => Ok(Value::Array(
                backend
                    .list(entity, &query)
                    .await?
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            )),

            Command::Get(None) => Ok(Value::Null),
            Command::Get(Some(id)) => Ok(backend
                .get(entity, &id)
                .await?
                .map_or(Value::Null, Value::Object)),

            Command::Create(data) => Ok(Value::Object(
                backend.create(entity, data, &identity.email).await?,
            )),

            Command::Update { id, data } => backend
                .update(entity, &id, data)
                .await?
                .map(Value::Object)
                .ok_or(ProxyError::NotFound),

            Command::Delete(id) => {
                backend.delete(entity, &id).await?;
                Ok(json!({"success": true}))
            }

            Command::BulkCreate(records) => Ok(Value::Array(
                backend
                    .bulk_create(entity, records, &identity.email)
                    .await?
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            )),

            Command::CheckAndUpdate { id, data, token } => self
                .ops
                .check_and_update(backend, entity, &id, data, token.as_ref())
                .await
                .map(Value::Object),

            Command::CheckAndCreate { data, unique_keys } => self
                .ops
                .check_and_create(backend, entity, data, &unique_keys, &identity.email)
                .await
                .map(Value::Object),

            Command::UpsertCell { data, token } => self
                .ops
                .upsert_cell(backend, entity, data, token, &self.cell, &identity.email)
                .await
                .map(|outcome| outcome.into_json()),
        }
    }
}
