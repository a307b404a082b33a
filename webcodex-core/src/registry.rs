//! Registry of open terminal sessions.
//!
//! Entries are weak: the relay task owns its [`SessionRegistration`] and the
//! entry disappears when that is dropped. The registry is only read to drive
//! liveness sweeps and to tell every session to stop on shutdown.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::liveness::LivenessCell;

pub type SessionId = Uuid;

/// Instructions from the monitor (or shutdown) to a session's relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a ping frame to the client.
    Ping,
    /// Drop the transport and kill the process.
    Terminate,
}

#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    working_directory: PathBuf,
    liveness: LivenessCell,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn liveness(&self) -> &LivenessCell {
        &self.liveness
    }

    /// Deliver a command to the relay. Returns `false` if the relay is gone.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Weak<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. The returned registration keeps the entry alive; the
    /// receiver yields the commands addressed to this session.
    pub fn register(
        &self,
        working_directory: PathBuf,
    ) -> (SessionRegistration, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle {
            id: Uuid::new_v4(),
            working_directory,
            liveness: LivenessCell::default(),
            commands,
        });

        self.sessions.insert(handle.id, Arc::downgrade(&handle));
        debug!(session_id = %handle.id, "Registered terminal session");

        (
            SessionRegistration {
                handle,
                registry: self.clone(),
            },
            commands_rx,
        )
    }

    /// Live handles. Entries whose owner is gone are pruned on the way.
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        let mut live = Vec::with_capacity(self.sessions.len());
        self.sessions.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                live.push(handle);
                true
            }
            None => false,
        });
        live
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every session to terminate. Returns how many were notified.
    pub fn terminate_all(&self) -> usize {
        let mut notified = 0;
        for handle in self.handles() {
            handle.liveness().terminate();
            if handle.send(SessionCommand::Terminate) {
                notified += 1;
            }
        }
        notified
    }

    fn remove(&self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            debug!(session_id = %id, "Removed terminal session");
        }
    }
}

/// Owning side of a registry entry. Dropping it removes the entry.
pub struct SessionRegistration {
    handle: Arc<SessionHandle>,
    registry: SessionRegistry,
}

impl SessionRegistration {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.registry.remove(&self.handle.id);
    }
}
