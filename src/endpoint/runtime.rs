//! In-process endpoint registry and dispatch.

use super::Endpoint;
use crate::context::{Context, Principal, TransactionAddress};
use crate::core::{DacError, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::Instrument;

lazy_static! {
    static ref RUNTIME: Arc<Runtime> = Arc::new(Runtime::new());
}

/// The process-wide runtime.
pub fn runtime() -> Arc<Runtime> {
    RUNTIME.clone()
}

/// What crosses the boundary with every call: the function, its payload and
/// the caller's request identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub function: String,
    pub process_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub principal: Option<Principal>,
    #[serde(default)]
    pub transaction: Option<TransactionAddress>,
    /// Remaining time of the caller's deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    fn outbound(ctx: &Context, function: &str, payload: serde_json::Value) -> Self {
        let timeout_ms = ctx.deadline().map(|deadline| {
            deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .as_millis() as u64
        });
        Self {
            function: function.to_string(),
            process_id: ctx.process_id().to_string(),
            request_id: ctx
                .request_id()
                .map(|id| String::from_utf8_lossy(id).into_owned()),
            principal: ctx.principal().cloned(),
            transaction: ctx.transaction_address(),
            timeout_ms,
            payload,
        }
    }

    /// The context the receiving side runs the function under.
    pub fn inbound_context(&self) -> Context {
        let mut ctx = Context::for_process(self.process_id.clone());
        if let Some(request_id) = &self.request_id {
            ctx = ctx.with_request_id(request_id.as_bytes().to_vec());
        }
        if let Some(principal) = &self.principal {
            ctx = ctx.with_principal(principal.clone());
        }
        if let Some(timeout) = self.timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(timeout));
        }
        if let Some(address) = &self.transaction {
            ctx.attach_transaction(address.clone());
        }
        ctx
    }
}

struct Instances {
    members: Vec<Arc<dyn Endpoint>>,
    next: AtomicUsize,
}

#[derive(Default)]
pub struct Runtime {
    names: RwLock<HashMap<String, Instances>>,
    ids: RwLock<HashMap<String, Arc<dyn Endpoint>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: Arc<dyn Endpoint>) -> Result<()> {
        let mut ids = self.ids.write()?;
        if ids.contains_key(endpoint.id()) {
            return Err(DacError::ConfigInvalid(format!(
                "endpoint instance '{}' is already registered",
                endpoint.id()
            )));
        }
        ids.insert(endpoint.id().to_string(), endpoint.clone());
        self.names
            .write()?
            .entry(endpoint.name().to_string())
            .or_insert_with(|| Instances {
                members: Vec::new(),
                next: AtomicUsize::new(0),
            })
            .members
            .push(endpoint.clone());
        tracing::info!(endpoint = endpoint.name(), id = endpoint.id(), "endpoint registered");
        Ok(())
    }

    pub fn deregister(&self, id: &str) -> Option<Arc<dyn Endpoint>> {
        let removed = self.ids.write().ok()?.remove(id)?;
        if let Ok(mut names) = self.names.write() {
            if let Some(instances) = names.get_mut(removed.name()) {
                instances.members.retain(|member| member.id() != id);
                if instances.members.is_empty() {
                    names.remove(removed.name());
                }
            }
        }
        Some(removed)
    }

    pub fn instance(&self, id: &str) -> Option<Arc<dyn Endpoint>> {
        self.ids.read().ok()?.get(id).cloned()
    }

    pub fn instances(&self, name: &str) -> usize {
        self.names
            .read()
            .ok()
            .and_then(|names| names.get(name).map(|instances| instances.members.len()))
            .unwrap_or(0)
    }

    fn pick(&self, name: &str, pinned: Option<&str>) -> Result<Arc<dyn Endpoint>> {
        if let Some(id) = pinned {
            return self
                .instance(id)
                .filter(|endpoint| endpoint.name() == name)
                .ok_or_else(|| {
                    DacError::database("dispatch", format!("endpoint instance '{}' is gone", id))
                        .with_endpoint(name)
                });
        }
        let names = self.names.read()?;
        let instances = names
            .get(name)
            .filter(|instances| !instances.members.is_empty())
            .ok_or_else(|| {
                DacError::database("dispatch", "no endpoint registered under this name").with_endpoint(name)
            })?;
        let idx = instances.next.fetch_add(1, Ordering::Relaxed) % instances.members.len();
        Ok(instances.members[idx].clone())
    }

    /// Calls `function` on an instance of `name`, or on instance `pinned`
    /// when given. Only internal callers may reach endpoint functions.
    pub async fn request(
        &self,
        ctx: &Context,
        name: &str,
        function: &str,
        payload: serde_json::Value,
        pinned: Option<&str>,
    ) -> Result<serde_json::Value> {
        if !ctx.is_internal() {
            return Err(DacError::database("dispatch", "endpoint functions are internal").with_endpoint(name));
        }
        let endpoint = self.pick(name, pinned)?;
        let wire = serde_json::to_vec(&Envelope::outbound(ctx, function, payload))?;

        let span = tracing::info_span!("dac.endpoint", function, endpoint = name, id = endpoint.id());
        ctx.run(
            async move {
                let envelope: Envelope = serde_json::from_slice(&wire)?;
                let inbound = envelope.inbound_context();
                let response = endpoint
                    .handle(&inbound, &envelope.function, envelope.payload)
                    .await
                    .map_err(|err| err.with_endpoint(name))?;
                // Responses cross the boundary as bytes too.
                Ok(serde_json::from_slice(&serde_json::to_vec(&response)?)?)
            }
            .instrument(span),
        )
        .await
    }
}
