//! Status writes with conflict handling and event buffering.
//!
//! All status goes through the `/status` subresource: a merge patch first,
//! retried briefly on 404 while a fresh object's subresource materializes,
//! and switched to refetch-plus-replace on a 409 version conflict. The main
//! object endpoint is never used as a fallback; with the subresource
//! declared, status sent there is dropped and a replace could clobber spec.
//!
//! While a write is in flight the key is locked: the event router buffers
//! everything it sees for that key, and the buffered events are replayed
//! through the injected replay callback shortly after the write completes.
//! The callback is injected (rather than calling the router directly) to
//! keep the router -> status -> router cycle out of the module graph.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource as _};
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::state::{ControlState, Key, Operated, ResourceKind};

/// How long the key stays locked after a completed write, giving the watch
/// stream time to deliver the operator's own update (which dedup absorbs).
const UNLOCK_DELAY: Duration = Duration::from_millis(300);
/// Attempts against a 404 from a not-yet-materialized status subresource.
const NOT_FOUND_RETRIES: u32 = 5;
/// Attempts against 409 version conflicts.
const CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("status write failed: {0}")]
    Write(#[source] kube::Error),
    #[error("status write conflicted {CONFLICT_RETRIES} times: {0}")]
    Conflict(#[source] kube::Error),
    #[error("status subresource still absent after {NOT_FOUND_RETRIES} retries: {0}")]
    NotFound(#[source] kube::Error),
    #[error("failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("object has no name or namespace")]
    UnnamedObject,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Callback replaying buffered events for a key back into the router.
pub type ReplayFn = Box<dyn Fn(ResourceKind, Key) + Send + Sync>;

pub struct StatusWriter {
    client: Client,
    state: Arc<ControlState>,
    replay: Arc<OnceLock<ReplayFn>>,
}

impl StatusWriter {
    pub fn new(client: Client, state: Arc<ControlState>) -> Arc<Self> {
        Arc::new(Self {
            client,
            state,
            replay: Arc::new(OnceLock::new()),
        })
    }

    /// Registers the event-replay handler. Called once by the router at
    /// startup; later calls are ignored.
    pub fn set_replayer(&self, replay: ReplayFn) {
        let _ = self.replay.set(replay);
    }

    /// Applies `mutate` to the object's status and writes it.
    ///
    /// The key is locked for the duration of the write plus a short grace
    /// period; buffered events are replayed afterwards.
    pub async fn update<K: Operated>(
        &self,
        obj: &K,
        mutate: impl FnOnce(&mut K::Status),
    ) -> Result<()> {
        let key = Key::from_object(obj).ok_or(Error::UnnamedObject)?;
        K::kind_state(&self.state).lock().lock_status(&key);
        let result = self.write(&key, obj, mutate).await;
        self.unlock_later::<K>(key);
        result
    }

    /// Writes the given phase, stamping `observedGeneration`.
    ///
    /// A write that would change neither is skipped: the `Ready` condition
    /// carries a transition timestamp, so rewriting an identical phase would
    /// bump the resource version and echo another watch event.
    pub async fn write_phase<K: Operated>(
        &self,
        obj: &K,
        phase: qdrant_operator_api::Phase,
    ) -> Result<()> {
        let generation = obj.meta().generation;
        if obj.phase() == Some(phase) && obj.observed_generation() == generation {
            return Ok(());
        }
        self.update(obj, |status| K::set_phase(status, phase, generation))
            .await
    }

    /// Writes an `Error` status with reason, message and a false `Ready`
    /// condition.
    pub async fn write_error<K: Operated>(
        &self,
        obj: &K,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let generation = obj.meta().generation;
        self.update(obj, |status| K::set_error(status, reason, message, generation))
            .await
    }

    async fn write<K: Operated>(
        &self,
        key: &Key,
        obj: &K,
        mutate: impl FnOnce(&mut K::Status),
    ) -> Result<()> {
        let mut updated = obj.clone();
        mutate(updated.status_mut());
        let status_value = serde_json::to_value(updated.status_mut())?;
        let body = json!({ "status": status_value });
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);

        let mut not_found_attempts = 0;
        loop {
            match api
                .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&body))
                .await
            {
                Ok(_) => {
                    debug!(%key, "status patched");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    // Fresh objects answer 404 on /status until the
                    // subresource materializes; give it a moment.
                    if not_found_attempts >= NOT_FOUND_RETRIES {
                        return Err(Error::NotFound(kube::Error::Api(response)));
                    }
                    not_found_attempts += 1;
                    sleep(Duration::from_millis(200) * not_found_attempts).await;
                }
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    return self.replace(&api, key, &updated).await;
                }
                Err(err) => {
                    if let kube::Error::Api(response) = &err {
                        error!(%key, code = response.code, error = %err, "status patch rejected");
                    } else {
                        error!(%key, error = %err, "status patch failed");
                    }
                    return Err(Error::Write(err));
                }
            }
        }
    }

    /// Conflict path: refetch for a fresh resourceVersion and replace the
    /// status subresource wholesale.
    async fn replace<K: Operated>(&self, api: &Api<K>, key: &Key, updated: &K) -> Result<()> {
        let mut last_conflict = None;
        for attempt in 0..CONFLICT_RETRIES {
            if attempt > 0 {
                sleep(Duration::from_millis(100) * attempt).await;
            }
            let mut fresh = api.get(&key.name).await.map_err(Error::Write)?;
            *fresh.status_mut() = updated.status().cloned().unwrap_or_default();
            match api
                .replace_status(&key.name, &PostParams::default(), serde_json::to_vec(&fresh)?)
                .await
            {
                Ok(_) => {
                    debug!(%key, attempt, "status replaced after conflict");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    warn!(%key, attempt, "status replace conflicted, refetching");
                    last_conflict = Some(kube::Error::Api(response));
                }
                Err(err) => return Err(Error::Write(err)),
            }
        }
        // Unreachable without at least one stored conflict.
        Err(last_conflict.map_or(Error::UnnamedObject, Error::Conflict))
    }

    /// Releases the key lock after a grace period, then replays whatever the
    /// router buffered meanwhile.
    fn unlock_later<K: Operated>(&self, key: Key) {
        let state = Arc::clone(&self.state);
        let replay = Arc::clone(&self.replay);
        tokio::spawn(async move {
            sleep(UNLOCK_DELAY).await;
            if let Some(replay) = replay.get() {
                replay(K::KIND, key);
            } else {
                // No router registered (startup or tests): drop the buffer,
                // the resync sweep covers anything missed.
                let _ = K::kind_state(&state).lock().unlock_status(&key);
            }
        });
    }
}
