//! Providers behind the gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::join_all;
use mcp::{CallToolResult, RequestId, Server, ServerConfig, Tool};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::descriptor::{ID_SEPARATOR, ToolDescriptor, split_id};
use crate::{Error, Result};

/// The set of connected tool providers.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// Every tool from every provider. May be slow; may fail.
    async fn list_all(&self) -> Result<Vec<ToolDescriptor>>;

    /// Call a tool by id. `call_id`, when given, is the handle [`abort`]
    /// later uses to target this call.
    ///
    /// [`abort`]: ProviderRegistry::abort
    async fn call_by_id(
        &self,
        id: &str,
        params: Value,
        call_id: Option<&str>,
    ) -> Result<CallToolResult>;

    /// Tell the provider running `call_id` to stop. Returns false when no
    /// such call is in flight.
    async fn abort(&self, call_id: &str) -> bool;

    /// Changes whenever providers connect or disconnect.
    fn generation(&self) -> u64 {
        0
    }
}

/// How to start one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub server: ServerConfig,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, server: ServerConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            server,
        }
    }
}

/// Reject ids that would make tool ids ambiguous.
pub fn validate_provider_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("provider id is empty".into()));
    }
    if id.contains(ID_SEPARATOR) {
        return Err(Error::InvalidArgument(format!(
            "provider id {id:?} contains reserved separator {ID_SEPARATOR:?}"
        )));
    }
    Ok(())
}

struct Provider {
    name: String,
    server: Arc<Server>,
}

type Inflight = Mutex<HashMap<String, String>>;

fn lock(inflight: &Inflight) -> MutexGuard<'_, HashMap<String, String>> {
    inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of stdio tool servers.
pub struct McpRegistry {
    providers: RwLock<HashMap<String, Provider>>,
    /// Correlation id -> provider id. An entry leaves when its call
    /// completes or is aborted; a call whose future was dropped stays
    /// listed so a later `abort` still reaches the provider.
    inflight: Inflight,
    generation: AtomicU64,
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl McpRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Spawn and initialize one provider. Replaces any provider with the same id.
    pub async fn connect(&self, config: ProviderConfig) -> Result<()> {
        validate_provider_id(&config.id)?;

        let server = Server::spawn(config.server).await?;
        server.initialize().await?;
        let server = Arc::new(server);

        let previous = self.providers.write().await.insert(
            config.id.clone(),
            Provider {
                name: config.name,
                server,
            },
        );
        if let Some(previous) = previous {
            self.forget_calls(&config.id);
            stop(&config.id, &previous.server).await;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(provider = %config.id, "provider connected");
        Ok(())
    }

    /// Connect every provider, skipping ones that fail. Returns how many connected.
    pub async fn connect_all(&self, configs: impl IntoIterator<Item = ProviderConfig>) -> usize {
        let mut connected = 0;
        for config in configs {
            let id = config.id.clone();
            match self.connect(config).await {
                Ok(()) => connected += 1,
                Err(e) => warn!(provider = %id, error = %e, "failed to connect provider"),
            }
        }
        connected
    }

    pub async fn disconnect(&self, id: &str) -> bool {
        let Some(provider) = self.providers.write().await.remove(id) else {
            return false;
        };
        self.forget_calls(id);
        stop(id, &provider.server).await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(provider = %id, "provider disconnected");
        true
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(&self) {
        let drained: Vec<(String, Provider)> = self.providers.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        for (id, provider) in drained {
            self.forget_calls(&id);
            stop(&id, &provider.server).await;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop in-flight records for a provider that is going away.
    fn forget_calls(&self, provider_id: &str) {
        lock(&self.inflight).retain(|_, owner| owner.as_str() != provider_id);
    }

    async fn server(&self, provider_id: &str) -> Option<Arc<Server>> {
        self.providers
            .read()
            .await
            .get(provider_id)
            .map(|p| p.server.clone())
    }
}

#[async_trait]
impl ProviderRegistry for McpRegistry {
    async fn list_all(&self) -> Result<Vec<ToolDescriptor>> {
        let providers: Vec<(String, String, Arc<Server>)> = self
            .providers
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), p.name.clone(), p.server.clone()))
            .collect();
        if providers.is_empty() {
            return Ok(Vec::new());
        }

        let listings = join_all(
            providers
                .iter()
                .map(|(_, _, server)| async move { server.refresh_tools().await }),
        )
        .await;

        let mut tools = Vec::new();
        let mut failures = Vec::new();
        for ((id, name, _), listing) in providers.iter().zip(listings) {
            match listing {
                Ok(listed) => tools.extend(listed.into_iter().map(|t| descriptor(id, name, t))),
                Err(e) => {
                    warn!(provider = %id, error = %e, "failed to list tools, skipping provider");
                    failures.push(format!("{id}: {e}"));
                }
            }
        }

        if failures.len() == providers.len() {
            return Err(Error::Unavailable(failures.join("; ")));
        }
        Ok(tools)
    }

    async fn call_by_id(
        &self,
        id: &str,
        params: Value,
        call_id: Option<&str>,
    ) -> Result<CallToolResult> {
        let (provider_id, local_name) =
            split_id(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        let server = self
            .server(provider_id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let arguments = (!params.is_null()).then_some(params);
        debug!(tool = %id, call_id = ?call_id, "dispatching tool call");

        let result = match call_id {
            Some(call_id) => {
                lock(&self.inflight).insert(call_id.to_string(), provider_id.to_string());
                let result = server
                    .call_tool_with_id(local_name, arguments, RequestId::from(call_id))
                    .await;
                lock(&self.inflight).remove(call_id);
                result
            }
            None => server.call_tool(local_name, arguments).await,
        };

        result.map_err(|e| match e {
            mcp::Error::Timeout { .. } => Error::Timeout(format!("tool call {id}")),
            other => Error::Provider(format!("tool call failed: {other}")),
        })
    }

    async fn abort(&self, call_id: &str) -> bool {
        let Some(provider_id) = lock(&self.inflight).remove(call_id) else {
            return false;
        };
        let Some(server) = self.server(&provider_id).await else {
            return false;
        };
        if let Err(e) = server
            .cancel(&RequestId::from(call_id), Some("aborted by orchestration"))
            .await
        {
            warn!(provider = %provider_id, call_id, error = %e, "failed to send cancellation");
        }
        info!(provider = %provider_id, call_id, "tool call aborted");
        true
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

async fn stop(provider_id: &str, server: &Server) {
    match server.shutdown().await {
        Ok(()) => debug!(provider = %provider_id, "provider shut down"),
        Err(e) => warn!(provider = %provider_id, error = %e, "failed to shut down provider"),
    }
}

fn descriptor(provider_id: &str, provider_name: &str, tool: Tool) -> ToolDescriptor {
    let mut descriptor = ToolDescriptor::new(provider_id, provider_name, tool.name);
    descriptor.description = tool.description;
    if !tool.input_schema.is_null() {
        descriptor.input_schema = Some(tool.input_schema);
    }
    descriptor
}
