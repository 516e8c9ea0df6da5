//! Tracks active sessions and their on-disk upload directories, grounded
//! on the original's `SessionManager`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{DepthError, Result};
use crate::session::Session;
use crate::video::{DecoderPool, FrameSource};

pub struct SessionManager {
    settings: Arc<Settings>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(SessionManager {
            settings,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates a session id and the path its upload should be written to,
    /// without opening a decoder yet. The HTTP layer owns the multipart
    /// stream, so it writes the upload to this path itself before calling
    /// [`SessionManager::register_session`] to finish setting up the session.
    pub fn reserve_upload_path(&self) -> (String, PathBuf) {
        let session_id = Uuid::new_v4().simple().to_string();
        let path = self.settings.data_root.join(&session_id).join("source.mp4");
        (session_id, path)
    }

    /// Opens a decoder pool over `source` (already written to disk by the
    /// caller, at the path handed back by [`SessionManager::reserve_upload_path`])
    /// and registers the session under `session_id`.
    pub async fn register_session(&self, session_id: String, source: PathBuf) -> Result<Arc<Session>> {
        let decoder = DecoderPool::open(&source, self.settings.max_concurrent_tasks)?;
        let metadata = FrameSource::metadata(&decoder);
        let session = Session::new(
            session_id.clone(),
            source,
            metadata,
            Arc::new(decoder),
            self.settings.video_cache_size,
            self.settings.depth_process_res,
        );

        self.insert(session.clone()).await;
        Ok(session)
    }

    /// Tracks an already-constructed session directly, bypassing decoder
    /// setup. `register_session` is the normal entry point; this exists for
    /// callers (and tests) that build a `Session` out of band, e.g. over a
    /// non-ffmpeg `FrameSource` double.
    pub async fn insert(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.session_id.clone(), session);
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).cloned()
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        match session {
            Some(session) => {
                remove_session_files(&session.source_path);
                Ok(())
            }
            None => Err(DepthError::SessionNotFound),
        }
    }

    /// Clears every tracked session and its upload directory. Skipped
    /// (with a warning) unless `data_root` is the default path or the
    /// operator opted in via `VIDEO_DEPTH_CLEAR_CACHE`, so a
    /// custom data directory is never nuked by surprise on startup.
    pub async fn clear_cache(&self) {
        if !self.clear_cache_allowed() {
            warn!(
                data_root = %self.settings.data_root.display(),
                "skipping cache cleanup; set VIDEO_DEPTH_CLEAR_CACHE=1 to override",
            );
            return;
        }

        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            remove_session_files(&session.source_path);
        }

        if let Ok(entries) = std::fs::read_dir(&self.settings.data_root) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }

    fn clear_cache_allowed(&self) -> bool {
        self.settings.clear_cache_on_startup_override || self.settings.data_root_is_default()
    }
}

fn remove_session_files(source_path: &Path) {
    let _ = std::fs::remove_file(source_path);
    if let Some(dir) = source_path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deleting_an_unknown_session_is_a_not_found_error() {
        let manager = SessionManager::new(Arc::new(Settings::default()));
        let result = manager.delete_session("does-not-exist").await;
        assert!(matches!(result, Err(DepthError::SessionNotFound)));
    }

    #[tokio::test]
    async fn clear_cache_skips_a_non_default_data_root_without_override() {
        let mut settings = Settings::default();
        settings.data_root = PathBuf::from("/tmp/some/custom/operator/chosen/root");
        settings.clear_cache_on_startup_override = false;
        let manager = SessionManager::new(Arc::new(settings));
        assert!(!manager.clear_cache_allowed());
        manager.clear_cache().await; // must not panic or touch the filesystem
    }

    #[tokio::test]
    async fn clear_cache_override_bypasses_the_default_path_check() {
        let mut settings = Settings::default();
        settings.data_root = PathBuf::from("/tmp/some/custom/operator/chosen/root");
        settings.clear_cache_on_startup_override = true;
        let manager = SessionManager::new(Arc::new(settings));
        assert!(manager.clear_cache_allowed());
    }
}
