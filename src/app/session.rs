use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::core::error::StoreError;
use crate::core::models::{CachedThread, Thread};
use crate::core::store::CacheHandle;

/// Meta key holding the viewer the thread cache was last written for.
pub const META_LAST_VIEWER: &str = "last_viewer_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub viewer_id: String,
    /// Tenant scope. `None` while the account has no team yet.
    pub tenant_id: Option<String>,
}

/// Where the signed-in viewer comes from.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn resolve(&self) -> Result<Identity, String>;
}

/// An identity known up front, e.g. from config.
pub struct StaticIdentity(pub Identity);

#[async_trait]
impl IdentitySource for StaticIdentity {
    async fn resolve(&self) -> Result<Identity, String> {
        Ok(self.0.clone())
    }
}

/// Lazily resolved viewer identity. A failed resolution is not cached, so
/// the next caller tries again.
pub struct Session {
    source: Arc<dyn IdentitySource>,
    /// Never held across an await.
    resolved: Mutex<Option<Identity>>,
    /// Serializes calls into the source.
    resolving: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Session {
            source,
            resolved: Mutex::new(None),
            resolving: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn identity(&self) -> Result<Identity, String> {
        if let Some(identity) = self.current() {
            return Ok(identity);
        }
        let _resolving = self.resolving.lock().await;
        if let Some(identity) = self.current() {
            return Ok(identity);
        }
        let identity = self.source.resolve().await?;
        log::info!("Session resolved for viewer {}", identity.viewer_id);
        *self.resolved.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
        Ok(identity)
    }

    /// The identity if it has been resolved already. Never waits on the source.
    pub fn current(&self) -> Option<Identity> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// What [`ChatEngine::start_session`](crate::ChatEngine::start_session) found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub identity: Identity,
    /// The viewer the cache belonged to before this one, when it changed.
    pub replaced_viewer: Option<String>,
}

/// Drop cached threads written for a different viewer, then record the
/// current one. Returns the previous viewer when the cache was invalidated.
///
/// With no recorded viewer there is nothing to compare against; the viewer
/// is recorded and rows without provenance are left to [`visible_threads`].
pub async fn guard_partition(
    cache: &CacheHandle,
    viewer_id: &str,
) -> Result<Option<String>, StoreError> {
    let last = cache.get_meta(META_LAST_VIEWER).await?;
    let mismatch = matches!(&last, Some(prev) if prev != viewer_id);
    if mismatch {
        let removed = cache.clear_threads().await?;
        log::info!(
            "Viewer changed ({} -> {}), dropped {} cached threads",
            last.as_deref().unwrap_or_default(),
            viewer_id,
            removed
        );
    }
    cache
        .set_meta(META_LAST_VIEWER, viewer_id.to_string())
        .await?;
    Ok(last.filter(|_| mismatch))
}

/// Keep only the cached threads that belong to `identity`: stamped for this
/// viewer, or unstamped but inside the viewer's tenant.
pub fn visible_threads(cached: Vec<CachedThread>, identity: &Identity) -> Vec<Thread> {
    cached
        .into_iter()
        .filter(|row| match &row.viewer_id {
            Some(viewer) => *viewer == identity.viewer_id,
            None => identity.tenant_id.as_deref() == Some(row.thread.tenant_id.as_str()),
        })
        .map(|row| row.thread)
        .collect()
}
