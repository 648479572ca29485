//! Long-lived event streams over the watched kinds, with error recovery.
//!
//! [`watch_stream`] is the bare list+watch state machine: it always relists
//! on startup (emitting [`Event::Restarted`] so caches can be replaced
//! atomically) and resumes or relists after interruptions, surfacing errors
//! as stream items. [`events`] layers the reconnect policy on top: failures
//! pause the stream for a [`WatchBackoff`] delay, aborts via the
//! cancellation token end it silently.

use futures::stream::BoxStream;
use futures::{stream, Stream, StreamExt};
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, ResourceExt};
use prometheus::IntCounterVec;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::WatchBackoff;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] kube::Error),
    #[error("failed to start watching objects: {0}")]
    WatchStartFailed(#[source] kube::Error),
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] kube::error::ErrorResponse),
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the apiserver asked us to slow down.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::WatchError(response) => response.code == 429,
            Error::InitialListFailed(err)
            | Error::WatchStartFailed(err)
            | Error::WatchFailed(err) => {
                matches!(err, kube::Error::Api(response) if response.code == 429)
            }
        }
    }

    /// Label for the watch-restart metric.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        if self.is_rate_limited() {
            return "rate_limited";
        }
        match self {
            Error::InitialListFailed(_) => "list",
            Error::WatchStartFailed(_) => "watch_start",
            Error::WatchError(_) => "watch_error",
            Error::WatchFailed(_) => "stream",
        }
    }
}

/// Watch events after flattening the raw phases.
#[derive(Debug, Clone)]
pub enum Event<K> {
    /// An object was added or modified.
    Applied(K),
    /// An object was deleted. May be missed across stream restarts; deletion
    /// safety comes from finalizers, not from this event.
    Deleted(K),
    /// The stream was (re)started from a full list. Cache contents should be
    /// replaced: objects absent from the list were deleted while the stream
    /// was down.
    Restarted(Vec<K>),
}

/// The finite state machine driving [`watch_stream`].
enum State<K> {
    /// The next poll starts the initial list.
    Empty,
    /// The list succeeded; start the watch from its resource version.
    InitListed { resource_version: String },
    /// Events are flowing. On interruption we fall back to `InitListed` to
    /// resume from the last seen version, or to `Empty` on a 410 desync.
    Watching {
        resource_version: String,
        stream: BoxStream<'static, kube::Result<WatchEvent<K>>>,
    },
}

/// Progresses the state machine a single step, returning `(event, state)`.
/// `None` events mean "step again" (bookmarks, stream handoffs).
async fn step_trampolined<K>(
    api: &Api<K>,
    wp: &WatchParams,
    state: State<K>,
) -> (Option<Result<Event<K>>>, State<K>)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    match state {
        State::Empty => match api.list(&ListParams::default()).await {
            Ok(list) => {
                let resource_version = list.metadata.resource_version.unwrap_or_default();
                (Some(Ok(Event::Restarted(list.items))), State::InitListed { resource_version })
            }
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed { resource_version } => {
            match api.watch(wp, &resource_version).await {
                Ok(stream) => (None, State::Watching {
                    resource_version,
                    stream: stream.boxed(),
                }),
                Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::InitListed {
                    resource_version,
                }),
            }
        }
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Applied(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Deleted(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bookmark))) => (None, State::Watching {
                resource_version: bookmark.metadata.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // 410 Gone: our resource version fell out of the watch
                // window, start over with a fresh list.
                let new_state = if err.code == 410 {
                    State::Empty
                } else {
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::Watching {
                resource_version,
                stream,
            }),
            None => (None, State::InitListed { resource_version }),
        },
    }
}

async fn step<K>(
    api: &Api<K>,
    wp: &WatchParams,
    mut state: State<K>,
) -> (Result<Event<K>>, State<K>)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    loop {
        match step_trampolined(api, wp, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a kind continuously, recovering the stream across interruptions.
///
/// Errors are emitted as items; the next poll resumes (or relists). Apply a
/// reconnect delay by not polling after errors, which is exactly what
/// [`events`] does.
pub fn watch_stream<K>(api: Api<K>, wp: WatchParams) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    stream::unfold((api, wp, State::Empty), |(api, wp, state)| async {
        let (event, state) = step(&api, &wp, state).await;
        Some((event, (api, wp, state)))
    })
}

/// The resilient event stream consumed by the router.
///
/// Failures increment the restart counter and pause the stream for the
/// backoff delay (capped per error class, reset once events flow again).
/// Cancelling `token` ends the stream without a reconnect attempt.
pub fn events<K>(
    api: Api<K>,
    wp: WatchParams,
    token: CancellationToken,
    restarts: IntCounterVec,
) -> impl Stream<Item = Event<K>> + Send
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let inner = watch_stream(api, wp).boxed();
    let backoff = WatchBackoff::new();
    stream::unfold(
        (inner, backoff, token, restarts),
        |(mut inner, mut backoff, token, restarts)| async move {
            loop {
                let item = tokio::select! {
                    () = token.cancelled() => return None,
                    item = inner.next() => item,
                };
                match item {
                    Some(Ok(event)) => {
                        backoff.reset();
                        return Some((event, (inner, backoff, token, restarts)));
                    }
                    Some(Err(err)) => {
                        let delay = backoff.next_delay(err.is_rate_limited());
                        restarts.with_label_values(&[err.reason()]).inc();
                        warn!(error = %err, ?delay, "watch interrupted, backing off");
                        tokio::select! {
                            () = token.cancelled() => return None,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        debug!("watch stream completed");
                        return None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::WatchError(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "too many requests".to_string(),
            reason: "TooManyRequests".to_string(),
            code,
        })
    }

    #[test]
    fn rate_limit_classification() {
        assert!(api_error(429).is_rate_limited());
        assert!(!api_error(500).is_rate_limited());
        assert_eq!(api_error(429).reason(), "rate_limited");
        assert_eq!(api_error(500).reason(), "watch_error");
    }
}
