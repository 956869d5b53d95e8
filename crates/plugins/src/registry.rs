//! Live handler set and routing queries.
//!
//! The registry keeps an immutable [`Snapshot`] behind a lock. Dispatch takes
//! a cheap `Arc` clone of the current snapshot (its read view) and never
//! holds the lock across a handler call; every mutation rebuilds the ordered
//! list and tool index and swaps the snapshot in one step.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use {
    switchyard_common::{MessageKind, ToolSchema},
    switchyard_config::HandlersConfig,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    handler::{Capabilities, Handler, HandlerMetadata, Stage},
    stats::HandlerStats,
};

// ── HandlerEntry ────────────────────────────────────────────────────────────

/// A registered handler together with the metadata and tool schemas captured
/// at registration.
pub struct HandlerEntry {
    handler: Arc<dyn Handler>,
    metadata: HandlerMetadata,
    tools: Vec<ToolSchema>,
    seq: u64,
    stats: Arc<HandlerStats>,
    cleaned_up: AtomicBool,
}

impl HandlerEntry {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn priority(&self) -> i32 {
        self.metadata.priority
    }

    pub fn metadata(&self) -> &HandlerMetadata {
        &self.metadata
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn tools(&self) -> &[ToolSchema] {
        &self.tools
    }

    pub fn stats(&self) -> &Arc<HandlerStats> {
        &self.stats
    }

    /// Position in registration order; lower registered earlier.
    pub fn registration_seq(&self) -> u64 {
        self.seq
    }

    /// Runs the handler's cleanup unless it already ran for this entry.
    pub(crate) async fn cleanup_once(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.handler.cleanup().await {
            Ok(()) => debug!(handler = self.name(), "handler cleaned up"),
            Err(e) => warn!(handler = self.name(), error = %e, "handler cleanup failed"),
        }
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("metadata", &self.metadata)
            .field("tools", &self.tools.len())
            .field("seq", &self.seq)
            .finish()
    }
}

// ── Snapshot ────────────────────────────────────────────────────────────────

/// Read view of the registry at one point in time.
#[derive(Default)]
pub struct Snapshot {
    /// Sorted by priority descending, then registration order ascending.
    ordered: Vec<Arc<HandlerEntry>>,
    tool_index: HashMap<String, Arc<HandlerEntry>>,
}

impl Snapshot {
    fn build(mut entries: Vec<Arc<HandlerEntry>>) -> Self {
        entries.sort_by_key(|e| e.seq);
        let mut tool_index: HashMap<String, Arc<HandlerEntry>> = HashMap::new();
        for entry in &entries {
            for tool in &entry.tools {
                tool_index
                    .entry(tool.name.clone())
                    .or_insert_with(|| Arc::clone(entry));
            }
        }
        entries.sort_by_key(|e| (Reverse(e.metadata.priority), e.seq));
        Self {
            ordered: entries,
            tool_index,
        }
    }

    pub fn entries(&self) -> &[Arc<HandlerEntry>] {
        &self.ordered
    }

    pub fn handlers_for(&self, stage: Stage, kind: &MessageKind) -> Vec<Arc<HandlerEntry>> {
        self.ordered
            .iter()
            .filter(|e| e.metadata.accepts(stage, kind))
            .cloned()
            .collect()
    }

    pub fn tool_provider(&self, tool: &str) -> Option<Arc<HandlerEntry>> {
        self.tool_index.get(tool).cloned()
    }

    fn get(&self, name: &str) -> Option<&Arc<HandlerEntry>> {
        self.ordered.iter().find(|e| e.name() == name)
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Holds the active handlers and answers routing queries.
pub struct Registry {
    snapshot: RwLock<Arc<Snapshot>>,
    next_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Current read view.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Register an already set-up handler.
    ///
    /// Registering the same instance twice is a no-op. A different instance
    /// under an existing name fails with [`Error::DuplicateHandler`]; use
    /// [`Registry::replace`] for that.
    pub fn register(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let (metadata, tools) = inspect(handler.as_ref())?;
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = guard.get(&metadata.name) {
            if Arc::ptr_eq(&existing.handler, &handler) {
                debug!(handler = %metadata.name, "handler already registered");
                return Ok(());
            }
            return Err(Error::DuplicateHandler {
                name: metadata.name,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tool_collisions(&guard.ordered, &metadata.name, seq, &tools);
        info!(
            handler = %metadata.name,
            priority = metadata.priority,
            capabilities = ?metadata.capabilities,
            tools = tools.len(),
            "handler registered"
        );
        let entry = new_entry(handler, metadata, tools, seq);
        let mut entries = guard.ordered.clone();
        entries.push(entry);
        *guard = Arc::new(Snapshot::build(entries));
        Ok(())
    }

    /// Register `handler`, replacing any handler with the same name.
    ///
    /// The replacement inherits the previous handler's registration slot, so
    /// equal-priority ordering and tool ownership stay where they were. The
    /// previous handler is returned without being cleaned up.
    pub fn replace(&self, handler: Arc<dyn Handler>) -> Result<Option<Arc<dyn Handler>>> {
        let (metadata, tools) = inspect(handler.as_ref())?;
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());

        let previous = guard.get(&metadata.name).cloned();
        let seq = previous
            .as_ref()
            .map_or_else(|| self.next_seq.fetch_add(1, Ordering::Relaxed), |p| p.seq);
        let mut entries: Vec<Arc<HandlerEntry>> = guard
            .ordered
            .iter()
            .filter(|e| e.name() != metadata.name)
            .cloned()
            .collect();
        tool_collisions(&entries, &metadata.name, seq, &tools);
        info!(
            handler = %metadata.name,
            replaced = previous.is_some(),
            "handler registered"
        );
        entries.push(new_entry(handler, metadata, tools, seq));
        *guard = Arc::new(Snapshot::build(entries));
        Ok(previous.map(|p| Arc::clone(&p.handler)))
    }

    /// Remove a handler by name. Absent names are a no-op.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let Some(removed) = guard.get(name).cloned() else {
            debug!(handler = name, "unregister: no such handler");
            return None;
        };
        let entries = guard
            .ordered
            .iter()
            .filter(|e| e.name() != name)
            .cloned()
            .collect();
        *guard = Arc::new(Snapshot::build(entries));
        info!(handler = name, "handler unregistered");
        Some(Arc::clone(&removed.handler))
    }

    /// Run `setup()` and register. A handler that set up but could not be
    /// registered is cleaned up again.
    pub async fn load(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let name = handler.metadata().name;
        handler
            .setup()
            .await
            .map_err(|e| Error::setup(name.clone(), e))?;
        if let Err(e) = self.register(Arc::clone(&handler)) {
            if let Err(cleanup) = handler.cleanup().await {
                warn!(handler = %name, error = %cleanup, "cleanup after failed registration failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Load every handler not disabled by `config`. Stops at the first error.
    pub async fn load_all(
        &self,
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
        config: &HandlersConfig,
    ) -> Result<usize> {
        let mut loaded = 0;
        for handler in handlers {
            let name = handler.metadata().name;
            if !config.is_enabled(&name) {
                info!(handler = %name, "handler disabled by config, skipping");
                continue;
            }
            self.load(handler).await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Unregister and clean up. Returns false if no such handler existed.
    pub async fn unload(&self, name: &str) -> bool {
        let entry = {
            let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = guard.get(name).cloned() else {
                return false;
            };
            let entries = guard
                .ordered
                .iter()
                .filter(|e| e.name() != name)
                .cloned()
                .collect();
            *guard = Arc::new(Snapshot::build(entries));
            entry
        };
        info!(handler = name, "handler unloaded");
        entry.cleanup_once().await;
        true
    }

    /// Clean up every handler exactly once and empty the registry.
    pub async fn shutdown(&self) {
        let previous = {
            let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        info!(count = previous.ordered.len(), "shutting down handlers");
        for entry in &previous.ordered {
            entry.cleanup_once().await;
        }
    }

    /// Handlers taking part in `stage` for `kind`, ordered by priority
    /// descending then registration order ascending.
    pub fn handlers_for(&self, stage: Stage, kind: &MessageKind) -> Vec<Arc<HandlerEntry>> {
        self.snapshot().handlers_for(stage, kind)
    }

    /// First-registered handler declaring `tool`.
    pub fn tool_provider(&self, tool: &str) -> Option<Arc<HandlerEntry>> {
        self.snapshot().tool_provider(tool)
    }

    /// Every exposed tool schema; shadowed duplicates are left out.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        let snapshot = self.snapshot();
        let index = &snapshot.tool_index;
        let mut by_seq: Vec<&Arc<HandlerEntry>> = snapshot.ordered.iter().collect();
        by_seq.sort_by_key(|e| e.seq);
        by_seq
            .into_iter()
            .flat_map(|entry| {
                entry.tools.iter().filter(move |tool| {
                    index
                        .get(&tool.name)
                        .is_some_and(|owner| Arc::ptr_eq(owner, entry))
                })
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.snapshot().get(name).map(|e| Arc::clone(&e.handler))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().get(name).is_some()
    }

    /// Names in dispatch order.
    pub fn handler_names(&self) -> Vec<String> {
        self.snapshot()
            .ordered
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn handler_stats(&self, name: &str) -> Option<Arc<HandlerStats>> {
        self.snapshot().get(name).map(|e| Arc::clone(&e.stats))
    }

    pub fn len(&self) -> usize {
        self.snapshot().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn new_entry(
    handler: Arc<dyn Handler>,
    metadata: HandlerMetadata,
    tools: Vec<ToolSchema>,
    seq: u64,
) -> Arc<HandlerEntry> {
    Arc::new(HandlerEntry {
        handler,
        metadata,
        tools,
        seq,
        stats: Arc::new(HandlerStats::new()),
        cleaned_up: AtomicBool::new(false),
    })
}

/// Tools in `tools` that one of `others` also provides. Each collision is
/// logged; the earlier registration keeps the tool.
fn tool_collisions(
    others: &[Arc<HandlerEntry>],
    handler: &str,
    seq: u64,
    tools: &[ToolSchema],
) -> Vec<String> {
    let mut collided = Vec::new();
    for tool in tools {
        let Some(other) = others
            .iter()
            .filter(|e| e.tools.iter().any(|t| t.name == tool.name))
            .min_by_key(|e| e.seq)
        else {
            continue;
        };
        let (provider, shadowed) = if other.seq < seq {
            (other.name(), handler)
        } else {
            (handler, other.name())
        };
        warn!(
            tool = %tool.name,
            provider,
            shadowed,
            "tool name provided by more than one handler, keeping first registration"
        );
        collided.push(tool.name.clone());
    }
    collided
}

/// Read and validate metadata and tool schemas once, at registration.
fn inspect(handler: &dyn Handler) -> Result<(HandlerMetadata, Vec<ToolSchema>)> {
    let metadata = handler.metadata();
    if metadata.name.trim().is_empty() {
        return Err(Error::invalid_metadata(&metadata.name, "empty handler name"));
    }
    if metadata.capabilities.is_empty() {
        warn!(handler = %metadata.name, "handler declares no capabilities");
    }

    if !metadata.capabilities.contains(Capabilities::TOOLS) {
        return Ok((metadata, Vec::new()));
    }

    let tools = handler.tool_schemas();
    if tools.is_empty() {
        return Err(Error::invalid_metadata(
            &metadata.name,
            "declares the tool capability but exposes no tools",
        ));
    }
    let mut seen = HashSet::new();
    for tool in &tools {
        tool.validate()
            .map_err(|e| Error::invalid_metadata(&metadata.name, e.to_string()))?;
        if !seen.insert(tool.name.as_str()) {
            return Err(Error::invalid_metadata(
                &metadata.name,
                format!("tool `{}` declared twice", tool.name),
            ));
        }
    }
    Ok((metadata, tools))
}
