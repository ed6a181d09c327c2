//! User profile lookup seam.
//!
//! Assignment and handshake payloads embed peer details, so the same
//! profiles are fetched repeatedly during re-dispatch loops;
//! [`CachedDirectory`] keeps a small LRU in front of the backing lookup.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::events::UserId;

/// Profile cache capacity (entries).
const PROFILE_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub vehicle: Option<String>,
}

impl UserProfile {
    /// Fallback profile when the directory has no record; notifications
    /// still carry a usable identity.
    pub fn unlisted(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            phone: None,
            vehicle: None,
        }
    }
}

pub trait UserDirectory: Send + Sync {
    fn profile(&self, user_id: &str) -> Option<UserProfile>;
}

impl<T: UserDirectory + ?Sized> UserDirectory for std::sync::Arc<T> {
    fn profile(&self, user_id: &str) -> Option<UserProfile> {
        (**self).profile(user_id)
    }
}

/// In-memory directory for tests and local runs.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    profiles: Mutex<HashMap<UserId, UserProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.insert(profile.user_id.clone(), profile);
    }
}

impl UserDirectory for StaticDirectory {
    fn profile(&self, user_id: &str) -> Option<UserProfile> {
        let profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.get(user_id).cloned()
    }
}

/// LRU cache in front of a directory lookup. Misses are not cached; an
/// unknown user may appear after registration.
pub struct CachedDirectory<D> {
    inner: D,
    cache: Mutex<LruCache<UserId, UserProfile>>,
}

impl<D: UserDirectory> CachedDirectory<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PROFILE_CACHE_SIZE).expect("cache size must be non-zero"),
            )),
        }
    }
}

impl<D: UserDirectory> UserDirectory for CachedDirectory<D> {
    fn profile(&self, user_id: &str) -> Option<UserProfile> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            // Fallback: look up uncached if the mutex is poisoned
            Err(_) => return self.inner.profile(user_id),
        };
        if let Some(hit) = cache.get(user_id) {
            return Some(hit.clone());
        }
        let profile = self.inner.profile(user_id)?;
        cache.put(user_id.to_string(), profile.clone());
        Some(profile)
    }
}
