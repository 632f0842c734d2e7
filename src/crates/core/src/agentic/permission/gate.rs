//! Permission gate
//!
//! Tracks outstanding approval requests per session and the patterns the
//! user approved with `always`. `ask` blocks until the request is answered,
//! withdrawn through the caller's token, or disposed.

use super::types::{AskInput, PermissionDecision, PermissionRequest, PermissionResponse, PermissionTime};
use crate::agentic::events::{CoreEvent, EventBus};
use crate::agentic::hooks::HookRegistry;
use crate::util::errors::{PermissionRejectedError, StewardError, StewardResult};
use crate::util::identifier::{ascending, IdPrefix};
use crate::util::wildcard;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type Responder = oneshot::Sender<Result<(), PermissionRejectedError>>;

struct PendingRequest {
    info: PermissionRequest,
    responder: Responder,
}

#[derive(Default)]
struct SessionPermissions {
    /// Keyed by request id, so iteration follows creation order
    pending: BTreeMap<String, PendingRequest>,
    approved: BTreeSet<String>,
}

impl SessionPermissions {
    fn covers(&self, keys: &[String]) -> bool {
        keys.iter()
            .all(|key| wildcard::matches_any(key, self.approved.iter()))
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.approved.is_empty()
    }
}

pub struct PermissionGate {
    sessions: Mutex<HashMap<String, SessionPermissions>>,
    events: Arc<EventBus>,
    hooks: Arc<HookRegistry>,
}

impl PermissionGate {
    pub fn new(events: Arc<EventBus>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            events,
            hooks,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionPermissions>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves immediately when already approved, otherwise waits for a reply.
    pub async fn ask(&self, input: AskInput, cancel: &CancellationToken) -> StewardResult<()> {
        let info = PermissionRequest {
            id: ascending(IdPrefix::Permission),
            permission_type: input.permission_type,
            pattern: input.pattern,
            session_id: input.session_id,
            message_id: input.message_id,
            call_id: input.call_id,
            message: input.message,
            metadata: input.metadata,
            time: PermissionTime {
                created: chrono::Utc::now().timestamp_millis(),
            },
        };
        let keys = info.keys();

        if self.is_approved(&info.session_id, &keys) {
            debug!(
                "Permission already approved: session_id={}, type={}",
                info.session_id, info.permission_type
            );
            return Ok(());
        }

        match self.hooks.permission_ask(&info).await? {
            PermissionDecision::Deny => {
                info!(
                    "Permission denied by hook: session_id={}, type={}",
                    info.session_id, info.permission_type
                );
                return Err(rejection(&info, None).into());
            }
            PermissionDecision::Allow => return Ok(()),
            PermissionDecision::Ask => {}
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut sessions = self.sessions();
            let state = sessions.entry(info.session_id.clone()).or_default();
            // A reply may have landed while the hook ran.
            if state.covers(&keys) {
                return Ok(());
            }
            state.pending.insert(
                info.id.clone(),
                PendingRequest {
                    info: info.clone(),
                    responder: tx,
                },
            );
        }
        debug!(
            "Permission requested: session_id={}, permission_id={}, type={}",
            info.session_id, info.id, info.permission_type
        );
        self.events.publish(CoreEvent::PermissionUpdated(info.clone()));

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(())) => Ok(()),
                Ok(Err(rejected)) => Err(rejected.into()),
                Err(_) => Err(StewardError::cancelled(format!(
                    "Permission request dropped: {}",
                    info.id
                ))),
            },
            _ = cancel.cancelled() => {
                self.withdraw(&info.session_id, &info.id);
                Err(StewardError::cancelled(format!(
                    "Permission request withdrawn: {}",
                    info.id
                )))
            }
        }
    }

    /// Answers a pending request. `always` also approves its keys for the
    /// session and resolves every other pending request they now cover.
    ///
    /// Returns `false` when no such request is pending; that is not an error,
    /// the request may have been withdrawn or answered already.
    pub fn respond(
        &self,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> bool {
        let mut replied = Vec::new();
        {
            let mut sessions = self.sessions();
            let Some(pending) = sessions
                .get_mut(session_id)
                .and_then(|state| state.pending.remove(permission_id))
            else {
                debug!(
                    "Permission response ignored: session_id={}, permission_id={}",
                    session_id, permission_id
                );
                return false;
            };
            let Some(state) = sessions.get_mut(session_id) else {
                return false;
            };
            replied.push(pending.info.id.clone());

            match response {
                PermissionResponse::Reject => {
                    let _ = pending.responder.send(Err(rejection(&pending.info, None)));
                }
                PermissionResponse::Once => {
                    let _ = pending.responder.send(Ok(()));
                }
                PermissionResponse::Always => {
                    state.approved.extend(pending.info.keys());
                    let _ = pending.responder.send(Ok(()));

                    // Resolving a request adds its keys too, so repeat until stable.
                    loop {
                        let next = state
                            .pending
                            .iter()
                            .find(|(_, p)| state.covers(&p.info.keys()))
                            .map(|(id, _)| id.clone());
                        let Some(id) = next else { break };
                        if let Some(covered) = state.pending.remove(&id) {
                            state.approved.extend(covered.info.keys());
                            let _ = covered.responder.send(Ok(()));
                            replied.push(id);
                        }
                    }
                }
            }
        }

        for id in replied {
            info!(
                "Permission replied: session_id={}, permission_id={}, response={:?}",
                session_id, id, response
            );
            self.events.publish(CoreEvent::PermissionReplied {
                session_id: session_id.to_string(),
                permission_id: id,
                response,
            });
        }
        true
    }

    /// All pending requests, oldest first.
    pub fn list(&self) -> Vec<PermissionRequest> {
        let sessions = self.sessions();
        let mut all: Vec<PermissionRequest> = sessions
            .values()
            .flat_map(|s| s.pending.values().map(|p| p.info.clone()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn is_approved(&self, session_id: &str, keys: &[String]) -> bool {
        self.sessions()
            .get(session_id)
            .is_some_and(|state| state.covers(keys))
    }

    /// Rejects the session's pending requests and forgets its approvals.
    pub fn dispose_session(&self, session_id: &str) {
        let removed = self.sessions().remove(session_id);
        if let Some(state) = removed {
            reject_all(state);
        }
    }

    pub fn dispose_all(&self) {
        let drained: Vec<SessionPermissions> = self.sessions().drain().map(|(_, s)| s).collect();
        for state in drained {
            reject_all(state);
        }
    }

    fn withdraw(&self, session_id: &str, permission_id: &str) {
        let mut sessions = self.sessions();
        if let Some(state) = sessions.get_mut(session_id) {
            if state.pending.remove(permission_id).is_some() {
                debug!(
                    "Permission request withdrawn: session_id={}, permission_id={}",
                    session_id, permission_id
                );
            }
            if state.is_empty() {
                sessions.remove(session_id);
            }
        }
    }
}

fn rejection(info: &PermissionRequest, reason: Option<String>) -> PermissionRejectedError {
    PermissionRejectedError::new(
        info.session_id.clone(),
        info.id.clone(),
        info.call_id.clone(),
        info.metadata.clone(),
        reason,
    )
}

fn reject_all(state: SessionPermissions) {
    for (_, pending) in state.pending {
        let _ = pending.responder.send(Err(rejection(&pending.info, None)));
    }
}
