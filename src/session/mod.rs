//! Per-identity sandboxes with idle eviction and optional persistent
//! workspaces.

mod sweeper;
mod workspace;

pub use sweeper::CleanupLoop;
pub use workspace::{validate_session_id, workspace_path};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::engine::{Engine, VolumeMount};
use crate::error::Result;
use crate::guard::GuardedSandbox;
use crate::permissions::PermissionEngine;
use crate::sandbox::{self, SandboxController, SandboxOptions, SandboxState};
use crate::types::RuntimeConfig;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub runtime: RuntimeConfig,
    /// When set, each session gets `{root}/{id}/workspace` mounted at the
    /// runtime work dir. Otherwise workspaces are ephemeral.
    pub workspace_root: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub sandbox: SandboxOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            workspace_root: None,
            idle_timeout: Duration::from_secs(3600),
            sandbox: SandboxOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: String,
    sandbox: Arc<SandboxController>,
    workspace: Option<PathBuf>,
    created_at: Instant,
    idle_timeout: Duration,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sandbox(&self) -> &Arc<SandboxController> {
        &self.sandbox
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        self.sandbox.last_active()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn is_idle(&self, max_idle: Duration) -> bool {
        !self.sandbox.is_busy() && self.sandbox.idle_for() > max_idle
    }
}

/// Registry of live sessions.
///
/// All registry mutations happen under one lock; sandboxes are stopped after
/// the lock is released so a slow teardown never blocks other sessions.
#[derive(Debug)]
pub struct SessionManager {
    options: SessionOptions,
    engine: Arc<dyn Engine>,
    permissions: Arc<PermissionEngine>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(options: SessionOptions, engine: Arc<dyn Engine>) -> Self {
        Self {
            options,
            engine,
            permissions: Arc::new(PermissionEngine::default()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<PermissionEngine>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The sandbox for `id`, creating the session if it does not exist.
    ///
    /// A session whose sandbox was stopped is replaced by a fresh one backed
    /// by the same workspace. The environment itself starts lazily on the
    /// first operation.
    pub fn get_or_create(&self, id: &str) -> Result<Arc<SandboxController>> {
        validate_session_id(id)?;
        let mut sessions = self.registry();

        if let Some(session) = sessions.get(id)
            && session.sandbox.state() != SandboxState::Stopped
        {
            session.sandbox.touch();
            return Ok(Arc::clone(&session.sandbox));
        }

        let session = Arc::new(self.new_session(id)?);
        info!(
            session_id = id,
            workspace = ?session.workspace,
            "session:create"
        );
        let sandbox = Arc::clone(&session.sandbox);
        sessions.insert(id.to_string(), session);
        Ok(sandbox)
    }

    fn new_session(&self, id: &str) -> Result<Session> {
        let workspace = match &self.options.workspace_root {
            Some(root) => Some(workspace::ensure_workspace(root, id)?),
            None => None,
        };
        let volumes = workspace
            .iter()
            .map(|host| VolumeMount::new(host, self.options.runtime.work_dir.clone()))
            .collect();

        let sandbox = SandboxController::new(id, self.options.runtime.clone(), Arc::clone(&self.engine))
            .with_volumes(volumes)
            .with_options(self.options.sandbox.clone());

        Ok(Session {
            id: id.to_string(),
            sandbox: Arc::new(sandbox),
            workspace,
            created_at: Instant::now(),
            idle_timeout: self.options.idle_timeout,
        })
    }

    /// The live sandbox for `id`, without creating or refreshing it.
    pub fn get(&self, id: &str) -> Option<Arc<SandboxController>> {
        self.registry().get(id).map(|s| Arc::clone(&s.sandbox))
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.registry().get(id).cloned()
    }

    /// [`get_or_create`](Self::get_or_create) wrapped with this manager's
    /// permission engine.
    pub fn guarded(&self, id: &str) -> Result<GuardedSandbox> {
        let sandbox = self.get_or_create(id)?;
        Ok(GuardedSandbox::new(sandbox, Arc::clone(&self.permissions)))
    }

    /// End a session explicitly. Returns whether it existed.
    pub fn release(&self, id: &str) -> bool {
        let removed = self.registry().remove(id);
        match removed {
            Some(session) => {
                info!(session_id = id, "session:release");
                self.stop_session(session);
                true
            }
            None => false,
        }
    }

    /// Remove sessions idle for longer than their own idle timeout.
    pub fn cleanup_idle(&self) -> usize {
        self.sweep(|session| session.is_idle(session.idle_timeout))
    }

    /// Remove sessions idle for longer than `max_idle`, regardless of their
    /// configured timeout.
    pub fn cleanup_idle_older_than(&self, max_idle: Duration) -> usize {
        self.sweep(|session| session.is_idle(max_idle))
    }

    fn sweep(&self, expired: impl Fn(&Session) -> bool) -> usize {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.registry();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| expired(session))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut evicted = 0;
        for session in removed {
            info!(
                session_id = %session.id,
                idle_secs = session.sandbox.idle_for().as_secs(),
                "session:evict"
            );
            if self.stop_session(session) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Stop and remove every session, returning how many were stopped.
    /// Sessions whose environment could not be removed stay registered, so
    /// calling it again retries them.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.registry().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "session:shutdown");
        }
        let mut stopped = 0;
        for session in drained {
            if self.stop_session(session) {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.registry().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry().contains_key(id)
    }

    /// Stop a session already taken out of the registry. A session whose
    /// environment could not be removed goes back in, unless its id has been
    /// reused meanwhile, so a later sweep or shutdown retries it.
    fn stop_session(&self, session: Arc<Session>) -> bool {
        match session.sandbox.stop() {
            Ok(()) => {
                debug!(session_id = %session.id, "session:sandbox stopped");
                true
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "session:failed to stop sandbox");
                self.registry()
                    .entry(session.id.clone())
                    .or_insert(session);
                false
            }
        }
    }

    /// A random id suitable for [`get_or_create`](Self::get_or_create).
    pub fn generate_session_id(&self) -> String {
        sandbox::random_hex(8)
    }
}
