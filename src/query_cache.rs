//! Persisted `dom query` results, so index-based DOM commands can refer to
//! "the Nth result of the last query" across CLI invocations without
//! silently using references the page has navigated away from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::sessiondir;
use crate::telemetry::DomQueryResult;

/// Why an index-based resolution was refused.
#[derive(Debug)]
pub enum CacheError {
    /// No cache file exists (or it failed to parse).
    NoCache,
    /// The page has navigated since the query ran.
    Stale {
        /// Selector of the cached query, for the rerun suggestion.
        selector: String,
    },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCache => write!(f, "No cached query results found"),
            Self::Stale { .. } => {
                write!(
                    f,
                    "Query cache is stale (page has navigated since query was run)"
                )
            }
        }
    }
}

impl std::error::Error for CacheError {}

impl CacheError {
    /// The actionable follow-up for this failure.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::NoCache => "Run `dom query <selector>` first".into(),
            Self::Stale { selector } => format!("Run `dom query {selector}` again"),
        }
    }
}

/// Manages the single `query-cache.json` file under the session directory.
///
/// Reads are safe across processes because writes go through a temp file and
/// an atomic rename; a parse error on read is treated as "no cache".
#[derive(Debug)]
pub struct QueryCacheManager {
    path: PathBuf,
}

impl QueryCacheManager {
    #[must_use]
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: sessiondir::query_cache_path(session_dir),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically overwrite the cache with a fresh query result.
    ///
    /// # Errors
    ///
    /// Returns `SessionDirError::Io` on I/O failure.
    pub fn write(&self, result: &DomQueryResult) -> Result<(), sessiondir::SessionDirError> {
        sessiondir::write_json_atomic(&self.path, result)
    }

    /// The raw cached record, if a readable one exists.
    ///
    /// Any parse error is treated as "no cache".
    #[must_use]
    pub fn get_raw(&self) -> Option<DomQueryResult> {
        sessiondir::read_json(&self.path).ok().flatten()
    }

    /// Remove the cache file.
    pub fn clear(&self) {
        let _ = sessiondir::remove_file(&self.path);
    }

    /// Validate the cache against the current navigation id and return it.
    ///
    /// `current_nav_id` is `None` when the authoritative id could not be
    /// fetched; validation then accepts the cache (fail-open, so daemon
    /// hiccups do not block index commands). Records without a stored
    /// navigation id predate navigation tracking and are accepted as-is.
    ///
    /// # Errors
    ///
    /// `CacheError::NoCache` when no readable cache exists;
    /// `CacheError::Stale` when the page has navigated since the query.
    pub fn validate(&self, current_nav_id: Option<u64>) -> Result<DomQueryResult, CacheError> {
        let cached = self.get_raw().ok_or(CacheError::NoCache)?;

        let Some(stored) = cached.navigation_id else {
            return Ok(cached);
        };
        let Some(current) = current_nav_id else {
            return Ok(cached);
        };

        if stored == current {
            Ok(cached)
        } else {
            Err(CacheError::Stale {
                selector: cached.selector,
            })
        }
    }
}

/// Default TTL for the navigation-id read cache.
pub const NAV_ID_TTL: Duration = Duration::from_millis(500);

/// A tiny TTL cache in front of the navigation-id fetch, so bursts of index
/// commands within one "thought" avoid redundant round-trips.
#[derive(Debug)]
pub struct NavIdCache {
    ttl: Duration,
    cached: Option<(Instant, u64)>,
}

impl NavIdCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, cached: None }
    }

    /// The cached id if fresh, otherwise the result of `fetch` (cached on
    /// success). `fetch` returning `None` is not cached.
    pub fn get_with<F>(&mut self, fetch: F) -> Option<u64>
    where
        F: FnOnce() -> Option<u64>,
    {
        if let Some((at, id)) = self.cached {
            if at.elapsed() < self.ttl {
                return Some(id);
            }
        }
        let id = fetch()?;
        self.cached = Some((Instant::now(), id));
        Some(id)
    }

    /// Drop the cached value; called when a navigation is observed.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

impl Default for NavIdCache {
    fn default() -> Self {
        Self::new(NAV_ID_TTL)
    }
}
