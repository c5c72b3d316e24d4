//! Where the client keeps its session id between connections.
//!
//! The id outlives the process so that a restarted client (the terminal
//! equivalent of a page reload) resumes the same shell.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::ClientResult;

pub trait SessionStore: Send + Sync {
    fn load(&self) -> ClientResult<Option<String>>;
    fn save(&self, session_id: &str) -> ClientResult<()>;
    fn clear(&self) -> ClientResult<()>;
}

/// In-process store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> ClientResult<Option<String>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, session_id: &str) -> ClientResult<()> {
        *self.slot.lock() = Some(session_id.to_string());
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// One file per scope, holding just the session id.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the user's runtime directory (falling back to the temp
    /// directory), keyed by `scope`. Typically the scope is the relay URL.
    pub fn for_scope(scope: &str) -> Self {
        let base = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(
            base.join("cmux-relay")
                .join(format!("session-{}", sanitize_scope(scope))),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> ClientResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, session_id: &str) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, session_id)?;
        debug!("Saved session {} to {}", session_id, self.path.display());
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn sanitize_scope(scope: &str) -> String {
    scope
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
