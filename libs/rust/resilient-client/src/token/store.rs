//! Per-profile token cache with single-flight refresh.
//!
//! Each profile owns one slot. A slot is only locked for short synchronous
//! sections; the identity endpoint call runs in a spawned task whose result
//! is shared between every caller waiting on it. Dropping a waiter does not
//! cancel the fetch, so the cache is still populated for the others.

use crate::error::{ClassifiedError, codes};
use crate::monitoring::{MonitoringSink, TokenEvent, TokenOutcome, TracingSink};
use crate::profile::ClientProfile;
use crate::token::fetcher::TokenFetcher;
use crate::token::types::{AccessToken, TokenCacheEntry, TokenState, now_millis};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Tokens expiring within this many milliseconds are treated as expired.
pub const DEFAULT_SAFETY_MARGIN_MS: i64 = 5_000;

type InflightFetch = Shared<BoxFuture<'static, Result<AccessToken, ClassifiedError>>>;

struct Slot {
    entry: TokenCacheEntry,
    inflight: Option<InflightFetch>,
}

/// Cached access tokens keyed by profile name.
pub struct TokenStore {
    fetcher: Arc<dyn TokenFetcher>,
    sink: Arc<dyn MonitoringSink>,
    safety_margin_ms: i64,
    slots: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("safety_margin_ms", &self.safety_margin_ms)
            .field("profiles", &self.slots.read().len())
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Create a store backed by `fetcher`, reporting to `tracing`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            sink: Arc::new(TracingSink),
            safety_margin_ms: DEFAULT_SAFETY_MARGIN_MS,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Report token events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override the expiry safety margin.
    #[must_use]
    pub const fn with_safety_margin(mut self, margin_ms: i64) -> Self {
        self.safety_margin_ms = margin_ms;
        self
    }

    /// Return a usable token for `profile`, fetching one if needed.
    ///
    /// Concurrent callers for the same profile share one in-flight fetch and
    /// all observe its outcome.
    ///
    /// # Errors
    ///
    /// Returns the classified fetch failure. The entry is left `Empty` so
    /// the next call starts over.
    #[instrument(skip_all, fields(destination = %profile.name))]
    pub async fn get_token(&self, profile: &ClientProfile) -> Result<AccessToken, ClassifiedError> {
        let slot = self.slot(&profile.name);
        let fetch = {
            let mut guard = slot.lock();
            if let Some(token) = guard.entry.token.as_ref() {
                if token.is_usable_at(now_millis(), self.safety_margin_ms) {
                    return Ok(token.clone());
                }
            }
            if let Some(inflight) = &guard.inflight {
                debug!("Joining in-flight token fetch");
                inflight.clone()
            } else {
                self.start_fetch(&slot, &mut guard, profile)
            }
        };
        fetch.await
    }

    /// Drop the cached token so the next call fetches a new one.
    ///
    /// An in-flight fetch is left alone; its result replaces the entry.
    pub fn invalidate(&self, profile_name: &str) {
        let Some(slot) = self.existing(profile_name) else {
            return;
        };
        let mut guard = slot.lock();
        if guard.inflight.is_none() {
            guard.entry.token = None;
            guard.entry.state = TokenState::Empty;
            debug!(destination = profile_name, "Token invalidated");
        }
    }

    /// Drop the cached token only if it is still `rejected`.
    ///
    /// Returns whether the entry was cleared. When another caller already
    /// replaced the token this is a no-op.
    pub fn invalidate_token(&self, profile_name: &str, rejected: &AccessToken) -> bool {
        let Some(slot) = self.existing(profile_name) else {
            return false;
        };
        let mut guard = slot.lock();
        let matches = guard
            .entry
            .token
            .as_ref()
            .is_some_and(|current| current.value == rejected.value);
        if matches && guard.inflight.is_none() {
            guard.entry.token = None;
            guard.entry.state = TokenState::Empty;
            debug!(destination = profile_name, "Rejected token invalidated");
            return true;
        }
        false
    }

    /// Current lifecycle state for a profile.
    #[must_use]
    pub fn state(&self, profile_name: &str) -> TokenState {
        self.existing(profile_name)
            .map_or(TokenState::Empty, |slot| slot.lock().entry.state)
    }

    /// Snapshot of the cache entry for a profile.
    #[must_use]
    pub fn entry(&self, profile_name: &str) -> Option<TokenCacheEntry> {
        self.existing(profile_name).map(|slot| slot.lock().entry.clone())
    }

    fn existing(&self, profile_name: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().get(profile_name).cloned()
    }

    fn slot(&self, profile_name: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.existing(profile_name) {
            return slot;
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(profile_name.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                entry: TokenCacheEntry::empty(profile_name),
                inflight: None,
            }))
        }))
    }

    fn start_fetch(
        &self,
        slot: &Arc<Mutex<Slot>>,
        guard: &mut Slot,
        profile: &ClientProfile,
    ) -> InflightFetch {
        let refresh_token = guard
            .entry
            .token
            .as_ref()
            .and_then(|token| token.refresh_token.clone());
        guard.entry.state = if guard.entry.token.is_some() {
            TokenState::Refreshing
        } else {
            TokenState::Fetching
        };
        debug!(state = ?guard.entry.state, "Starting token fetch");

        let destination = profile.name.clone();
        let task = tokio::spawn(run_fetch(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.sink),
            Arc::clone(slot),
            profile.clone(),
            refresh_token,
        ));
        let shared = async move {
            task.await.unwrap_or_else(|e| {
                Err(ClassifiedError::transient(
                    codes::INTERNAL,
                    format!("token fetch task failed: {e}"),
                )
                .with_param(destination))
            })
        }
        .boxed()
        .shared();

        guard.inflight = Some(shared.clone());
        shared
    }
}

async fn run_fetch(
    fetcher: Arc<dyn TokenFetcher>,
    sink: Arc<dyn MonitoringSink>,
    slot: Arc<Mutex<Slot>>,
    profile: ClientProfile,
    refresh_token: Option<String>,
) -> Result<AccessToken, ClassifiedError> {
    let started = Instant::now();
    let refreshing = refresh_token.is_some();
    let result = match refresh_token {
        Some(refresh_token) => fetcher.refresh(&profile, &refresh_token).await,
        None => fetcher.fetch(&profile).await,
    };

    {
        let mut guard = slot.lock();
        guard.inflight = None;
        match &result {
            Ok(token) => {
                guard.entry.token = Some(token.clone());
                guard.entry.state = TokenState::Valid;
            }
            Err(_) => {
                guard.entry.token = None;
                guard.entry.state = TokenState::Empty;
            }
        }
    }

    let outcome = match &result {
        Ok(_) if refreshing => TokenOutcome::Refreshed,
        Ok(_) => TokenOutcome::Issued,
        Err(e) => TokenOutcome::Failed {
            kind: e.kind,
            code: e.code.clone(),
        },
    };
    sink.record_token(&TokenEvent {
        destination: profile.name.clone(),
        outcome,
        duration: started.elapsed(),
        timestamp: chrono::Utc::now(),
    });
    result
}
