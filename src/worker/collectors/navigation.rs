use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use super::CollectorHandle;
use crate::cdp::{CdpConnection, CdpError};
use crate::query_cache::NavIdCache;
use crate::telemetry::{NavigationKind, TelemetryStore};

/// Start the navigation tracker.
///
/// Subscribes to `Page.frameNavigated` (top frame only) and
/// `Page.navigatedWithinDocument`, increments the session navigation counter,
/// and invalidates the navigation-id read cache used by index-based DOM
/// commands.
///
/// # Errors
///
/// Returns `CdpError` if enabling the domain or subscribing fails.
pub async fn start_navigation_collector(
    conn: &Arc<CdpConnection>,
    store: Arc<Mutex<TelemetryStore>>,
    nav_cache: Arc<Mutex<NavIdCache>>,
) -> Result<CollectorHandle, CdpError> {
    conn.ensure_domain("Page").await?;

    let mut frame_rx = conn.subscribe("Page.frameNavigated").await?;
    let mut same_doc_rx = conn.subscribe("Page.navigatedWithinDocument").await?;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = frame_rx.recv() => {
                    let Some(ev) = event else { break };
                    on_frame_navigated(&store, &nav_cache, &ev.params);
                }
                event = same_doc_rx.recv() => {
                    let Some(ev) = event else { break };
                    on_navigated_within_document(&store, &nav_cache, &ev.params);
                }
            }
        }
        debug!("navigation collector stopped");
    });

    Ok(CollectorHandle::new("navigation", task))
}

fn on_frame_navigated(
    store: &Mutex<TelemetryStore>,
    nav_cache: &Mutex<NavIdCache>,
    params: &Value,
) {
    // Subframes carry a parentId; only the top frame advances the counter.
    if params["frame"]["parentId"].is_string() {
        return;
    }
    let url = params["frame"]["url"].as_str().unwrap_or("").to_owned();

    let mut guard = store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let kind = if guard.navigation_id() == 0 {
        NavigationKind::Initial
    } else {
        NavigationKind::Frame
    };
    guard.record_navigation(&url, crate::sessiondir::epoch_secs_f64(), kind);
    drop(guard);

    nav_cache
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .invalidate();
}

fn on_navigated_within_document(
    store: &Mutex<TelemetryStore>,
    nav_cache: &Mutex<NavIdCache>,
    params: &Value,
) {
    let url = params["url"].as_str().unwrap_or("").to_owned();

    store
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .record_navigation(
            &url,
            crate::sessiondir::epoch_secs_f64(),
            NavigationKind::SameDocument,
        );

    nav_cache
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .invalidate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn fixtures() -> (Mutex<TelemetryStore>, Mutex<NavIdCache>) {
        (
            Mutex::new(TelemetryStore::new(0.0)),
            Mutex::new(NavIdCache::new(Duration::from_secs(60))),
        )
    }

    #[test]
    fn first_top_frame_navigation_is_initial() {
        let (store, cache) = fixtures();
        on_frame_navigated(
            &store,
            &cache,
            &json!({"frame": {"url": "http://example.test/"}}),
        );

        let guard = store.lock().unwrap();
        assert_eq!(guard.navigation_id(), 1);
        assert_eq!(guard.navigations()[0].kind, NavigationKind::Initial);
        assert_eq!(guard.navigations()[0].url, "http://example.test/");
    }

    #[test]
    fn later_navigations_are_frame_kind() {
        let (store, cache) = fixtures();
        let params = json!({"frame": {"url": "http://example.test/"}});
        on_frame_navigated(&store, &cache, &params);
        on_frame_navigated(&store, &cache, &params);

        let guard = store.lock().unwrap();
        assert_eq!(guard.navigation_id(), 2);
        assert_eq!(guard.navigations()[1].kind, NavigationKind::Frame);
    }

    #[test]
    fn subframe_navigations_are_ignored() {
        let (store, cache) = fixtures();
        on_frame_navigated(
            &store,
            &cache,
            &json!({"frame": {"url": "http://ads.example.test/", "parentId": "F1"}}),
        );
        assert_eq!(store.lock().unwrap().navigation_id(), 0);
    }

    #[test]
    fn same_document_navigation_increments_counter() {
        let (store, cache) = fixtures();
        on_frame_navigated(
            &store,
            &cache,
            &json!({"frame": {"url": "http://example.test/"}}),
        );
        on_navigated_within_document(
            &store,
            &cache,
            &json!({"url": "http://example.test/#section"}),
        );

        let guard = store.lock().unwrap();
        assert_eq!(guard.navigation_id(), 2);
        assert_eq!(guard.navigations()[1].kind, NavigationKind::SameDocument);
    }

    #[test]
    fn navigation_invalidates_nav_id_cache() {
        let (store, cache) = fixtures();
        assert_eq!(cache.lock().unwrap().get_with(|| Some(0)), Some(0));

        on_frame_navigated(
            &store,
            &cache,
            &json!({"frame": {"url": "http://example.test/"}}),
        );

        // The cached 0 is gone; the next read refetches.
        assert_eq!(cache.lock().unwrap().get_with(|| Some(1)), Some(1));
    }
}
