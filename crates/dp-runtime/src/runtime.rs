//! The dependency-injected runtime context.
//!
//! One `Runtime` is created at server start and threaded to request
//! handlers; its operations mirror the external HTTP/WS contract
//! one-to-one. Test doubles replace the router/registry/executor at
//! build time — there is no process-global state anywhere.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use dp_context::{CompressionEngine, CompressionRecord, CompressionStore};
use dp_domain::config::Config;
use dp_domain::error::{Error, Result};
use dp_domain::event::{Event, EventBody};
use dp_domain::message::Message;
use dp_domain::stream::Purpose;
use dp_providers::health::HealthSnapshot;
use dp_providers::ModelRouter;
use dp_sandbox::SandboxExecutor;
use dp_sessions::{LogLine, SessionMeta, SessionStore, TurnLog};
use dp_skills::{ToolEntry, ToolRegistry};
use dp_workspace::preview::Preview;
use dp_workspace::store::FileMeta;
use dp_workspace::SessionWorkspace;

use crate::bus::EventBus;
use crate::cancel::CancelMap;
use crate::lane::LaneMap;
use crate::tools;
use crate::turn::{self, SessionHandles, TurnDeps};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RuntimeBuilder {
    config: Config,
    router: Option<Arc<ModelRouter>>,
    registry: Option<Arc<ToolRegistry>>,
    executor: Option<Arc<SandboxExecutor>>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            router: None,
            registry: None,
            executor: None,
        }
    }

    /// Replace the model router (tests inject scripted providers).
    pub fn with_router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_executor(mut self, executor: Arc<SandboxExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = Arc::new(self.config);

        let router = match self.router {
            Some(router) => router,
            None => Arc::new(ModelRouter::from_config(&config.llm)?),
        };
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(ToolRegistry::new(
                tools::builtin_entries(),
                &config.skills.path,
            )?),
        };
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(SandboxExecutor::new(config.sandbox.clone())),
        };
        let sessions = Arc::new(SessionStore::new(&config.workspace.root)?);
        let compression = Arc::new(CompressionEngine::new(config.compression.clone()));

        Ok(Runtime {
            deps: Arc::new(TurnDeps {
                config,
                router,
                registry,
                executor,
                sessions,
                compression,
            }),
            lanes: Arc::new(LaneMap::new()),
            cancels: Arc::new(CancelMap::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Runtime {
    deps: Arc<TurnDeps>,
    lanes: Arc<LaneMap>,
    cancels: Arc<CancelMap>,
    handles: Mutex<HashMap<String, Arc<SessionHandles>>>,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn create_session(&self, title: Option<String>) -> Result<SessionMeta> {
        self.deps.sessions.create(title)
    }

    pub fn list_sessions(&self) -> Vec<SessionMeta> {
        self.deps.sessions.list()
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionMeta> {
        self.deps.sessions.get(session_id)
    }

    /// The persisted turn log (messages contract).
    pub fn session_log(&self, session_id: &str) -> Result<Vec<LogLine>> {
        self.handles_for(session_id)?.turn_log.read()
    }

    /// Raw turn-log bytes (export contract).
    pub fn export_session(&self, session_id: &str) -> Result<Vec<u8>> {
        self.handles_for(session_id)?.turn_log.raw()
    }

    /// Delete the session, its workspace, and its runtime handles.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.cancels.cancel(session_id);
        self.handles.lock().remove(session_id);
        self.deps.sessions.delete(session_id)
    }

    // ── Chat lifecycle ─────────────────────────────────────────────

    /// Start a turn for a user message. Returns the allocated turn id
    /// and the event stream; the turn runs behind the session lane, so
    /// events begin once the prior turn is terminal.
    pub fn chat(
        &self,
        session_id: &str,
        content: &str,
        dataset_refs: &[String],
    ) -> Result<(u64, mpsc::UnboundedReceiver<Event>)> {
        let mut message = content.to_string();
        if !dataset_refs.is_empty() {
            message.push_str(&format!(
                "\n\n[attached datasets: {}]",
                dataset_refs.join(", ")
            ));
        }
        self.start_turn(session_id, Message::user(message))
    }

    /// Cancel the in-flight turn. A stop on an idle session is a no-op.
    pub fn stop(&self, session_id: &str) -> bool {
        self.cancels.cancel(session_id)
    }

    /// Re-run the last turn's user message. The superseded turn stays
    /// in the log, flagged, with its events intact.
    pub fn retry(&self, session_id: &str) -> Result<(u64, mpsc::UnboundedReceiver<Event>)> {
        let handles = self.handles_for(session_id)?;
        if self.cancels.is_running(session_id) {
            return Err(Error::Validation(
                "a turn is in flight; stop it before retrying".into(),
            ));
        }

        let lines = handles.turn_log.read()?;
        let last_turn = lines
            .iter()
            .map(LogLine::turn_id)
            .max()
            .ok_or_else(|| Error::Validation("nothing to retry".into()))?;
        let user_message = lines
            .iter()
            .filter_map(|l| match l {
                LogLine::Message {
                    turn_id, message, ..
                } if *turn_id == last_turn
                    && message.role == dp_domain::message::Role::User =>
                {
                    Some(message.clone())
                }
                _ => None,
            })
            .next_back()
            .ok_or_else(|| Error::Validation("last turn has no user message".into()))?;

        handles.turn_log.append(&[TurnLog::superseded(last_turn)])?;
        self.start_turn(session_id, user_message)
    }

    /// Direct skill invocation (the `skill` client message).
    pub fn invoke_skill(
        &self,
        session_id: &str,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Event>)> {
        if self.deps.registry.get(name).is_none() {
            return Err(Error::SkillUnavailable(name.to_string()));
        }
        let content = format!(
            "Run the `{name}` skill now, with these arguments: {args}. \
             Follow its procedure step by step."
        );
        self.start_turn(session_id, Message::user(content))
    }

    fn start_turn(
        &self,
        session_id: &str,
        user_message: Message,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Event>)> {
        let handles = self.handles_for(session_id)?;
        let turn_id = handles.next_turn.fetch_add(1, Ordering::SeqCst);

        let (bus, rx) = EventBus::channel(turn_id);
        let cancel = self.cancels.register(session_id);

        let deps = self.deps.clone();
        let lanes = self.lanes.clone();
        let cancels = self.cancels.clone();
        let session = session_id.to_string();
        let handles_for_task = handles.clone();

        tokio::spawn(async move {
            // Strictly sequential per session: wait out the prior turn.
            let permit = lanes.acquire(&session).await;
            *handles_for_task.current_bus.lock() = Some(bus.clone());

            turn::run_turn(
                deps,
                handles_for_task.clone(),
                session.clone(),
                turn_id,
                user_message,
                bus,
                cancel,
            )
            .await;

            *handles_for_task.current_bus.lock() = None;
            cancels.remove(&session);
            drop(permit);
        });

        Ok((turn_id, rx))
    }

    // ── Compression ────────────────────────────────────────────────

    /// Force a compression pass now (the compress contract).
    pub async fn compress_session(&self, session_id: &str) -> Result<CompressionRecord> {
        let handles = self.handles_for(session_id)?;
        let (history, _) = handles.turn_log.replay_messages()?;
        let summary = handles.comp_store.read_summary()?;
        let provider = self.deps.router.resolve(Purpose::Summarization, None)?;
        let last_turn = handles.turn_log.last_turn_id()?;

        let outcome = self
            .deps
            .compression
            .compress(
                &history,
                &summary,
                (1, last_turn),
                provider.as_ref(),
                &handles.comp_store,
            )
            .await?;
        handles.turn_log.append(&[TurnLog::compression_marker(
            last_turn,
            outcome.summary.len(),
            outcome.kept.len(),
        )])?;
        Ok(outcome.record)
    }

    // ── Workspace ──────────────────────────────────────────────────

    pub fn workspace_files(&self, session_id: &str) -> Result<Vec<FileMeta>> {
        self.handles_for(session_id)?.workspace.list_tree()
    }

    pub fn preview_file(&self, session_id: &str, path: &str) -> Result<Preview> {
        let handles = self.handles_for(session_id)?;
        dp_workspace::preview::preview(&handles.workspace, &self.deps.config.workspace, path)
    }

    pub fn bundle_files(&self, session_id: &str, paths: &[String]) -> Result<Vec<u8>> {
        let handles = self.handles_for(session_id)?;
        dp_workspace::bundle::bundle_zip(&handles.workspace, paths)
    }

    // ── Catalog & models ───────────────────────────────────────────

    pub fn tool_catalog(&self) -> Vec<ToolEntry> {
        self.deps.registry.list()
    }

    pub fn refresh_skills(&self) -> Result<usize> {
        self.deps.registry.refresh_skills()
    }

    /// Current binding for general use, with health state.
    pub fn active_model(&self) -> Result<HealthSnapshot> {
        self.deps.router.active_binding()
    }

    /// Update routing preferences (models/config contract).
    pub fn configure_models(
        &self,
        preferred: Option<String>,
        purposes: &[(String, Option<String>)],
    ) {
        self.deps.router.set_preferred(preferred);
        for (purpose, provider) in purposes {
            self.deps.router.set_purpose(purpose, provider.clone());
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Session handles, created on first use. Wires the workspace's
    /// update sink to a forwarder that publishes through whichever
    /// turn bus is current.
    fn handles_for(&self, session_id: &str) -> Result<Arc<SessionHandles>> {
        // The lock is held through creation so two callers cannot
        // build competing workspace handles (per-path write locks live
        // inside them).
        let mut map = self.handles.lock();
        if let Some(handles) = map.get(session_id) {
            return Ok(handles.clone());
        }

        let meta = self
            .deps
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::Validation(format!("no such session: {session_id}")))?;
        let session_root = self.deps.sessions.session_root(&meta.id);

        let workspace = Arc::new(SessionWorkspace::open(
            &session_root,
            &self.deps.config.workspace,
        )?);
        let comp_store = Arc::new(CompressionStore::new(workspace.root())?);
        let turn_log = Arc::new(TurnLog::new(&session_root));
        let next_turn = turn_log.last_turn_id()? + 1;

        let handles = Arc::new(SessionHandles {
            workspace: workspace.clone(),
            comp_store,
            turn_log,
            skills_read: Mutex::new(HashSet::new()),
            skill_constraint: Mutex::new(None),
            next_turn: AtomicU64::new(next_turn),
            current_bus: Mutex::new(None),
        });

        // Workspace → event-bus forwarder (message passing, no direct
        // reference in either direction).
        let (tx, mut rx) = mpsc::unbounded_channel();
        workspace.set_sink(tx);
        let forwarder_handles = handles.clone();
        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                let bus = forwarder_handles.current_bus.lock().clone();
                if let Some(bus) = bus {
                    bus.emit(EventBody::WorkspaceUpdate {
                        tree_delta: json!(delta),
                    });
                }
            }
        });

        map.insert(session_id.to_string(), handles.clone());
        Ok(handles)
    }
}
