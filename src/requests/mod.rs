//! Request correlator - turn "fire a request" into "observe its outcome"
//!
//! `submit` registers every id whose terminal event completes the request
//! *before* the request is sent, so a reply that races ahead of the caller's
//! wait is never lost. Completion state lives in the correlator under its
//! own mutex; `await_completion` checks it under the same lock it waits on.

pub mod order;

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::{Error, RequestId, Result, TableKind, Transport, columns};
use crate::events::{EventBus, EventPump, ResponseEvent};
use crate::tables::UpdateOp;

pub use order::{OrderKind, OrderSpec, RequestSpec, Side, TimeInForce, ValueMap, WireRequest};

/// Caller's reference to a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHandle {
    id: u64,
    request_id: RequestId,
    children: Vec<RequestId>,
}

impl RequestHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Ids awaited for completion (the request's own id for simple requests).
    pub fn children(&self) -> &[RequestId] {
        &self.children
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRequest {
    pub request_id: RequestId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    AllSucceeded,
    /// Every child reached a terminal event and at least one was a failure.
    /// Nothing is rolled back.
    PartialFailure(Vec<FailedRequest>),
    /// Deadline hit with children still pending; final state unknown.
    Timeout {
        pending: Vec<RequestId>,
        failed: Vec<FailedRequest>,
    },
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::AllSucceeded)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            RequestOutcome::AllSucceeded => Ok(()),
            RequestOutcome::PartialFailure(failed) => Err(Error::RequestRejected {
                failed: failed.into_iter().map(|f| f.request_id.to_string()).collect(),
            }),
            RequestOutcome::Timeout { pending, .. } => {
                let ids: Vec<String> = pending.iter().map(ToString::to_string).collect();
                Err(Error::Timeout(format!("no response for {}", ids.join(", "))))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Child,
    Parent,
}

struct PendingRequest {
    request_id: RequestId,
    children: Vec<RequestId>,
    pending: HashSet<RequestId>,
    failed: Vec<FailedRequest>,
}

#[derive(Default)]
struct CorrelatorState {
    requests: HashMap<u64, PendingRequest>,
    index: HashMap<RequestId, (u64, Role)>,
    next_handle: u64,
}

impl CorrelatorState {
    fn forget(&mut self, handle: u64) -> Option<PendingRequest> {
        let request = self.requests.remove(&handle)?;
        self.index.remove(&request.request_id);
        for child in &request.children {
            self.index.remove(child);
        }
        Some(request)
    }
}

pub struct RequestCorrelator {
    transport: Arc<dyn Transport>,
    state: Mutex<CorrelatorState>,
    resolved: Condvar,
}

impl RequestCorrelator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(CorrelatorState::default()),
            resolved: Condvar::new(),
        }
    }

    /// Route the bus's response stream into this correlator.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<EventPump> {
        let correlator = Arc::clone(self);
        EventPump::spawn("fxsync-requests", bus.subscribe_responses(), move |event| {
            correlator.handle_response(event)
        })
    }

    /// Build, register and send a request.
    ///
    /// A failure here is synchronous and leaves nothing registered. The
    /// returned handle stays registered until it is passed to
    /// [`await_completion`](Self::await_completion) or
    /// [`abandon`](Self::abandon).
    pub fn submit(&self, spec: &RequestSpec) -> Result<RequestHandle> {
        let message = spec.to_value_map()?;
        let request = self
            .transport
            .create_request(message)
            .map_err(|e| Error::RequestSend(format!("cannot create request: {}", e)))?;

        let handle = self.register(&request)?;
        if let Err(e) = self.transport.send_request(&request) {
            self.state.lock().forget(handle.id);
            return Err(Error::RequestSend(format!("cannot send {}: {}", request.id, e)));
        }

        info!(
            "sent {} {} awaiting {:?}",
            request.message.command(),
            request.id,
            handle.children
        );
        Ok(handle)
    }

    fn register(&self, request: &WireRequest) -> Result<RequestHandle> {
        let children = request.terminal_ids();
        let mut state = self.state.lock();
        if let Some(dup) = children.iter().find(|id| state.index.contains_key(*id)) {
            return Err(Error::InvalidState(format!("request id {} already pending", dup)));
        }

        state.next_handle += 1;
        let handle = state.next_handle;
        for child in &children {
            state.index.insert(child.clone(), (handle, Role::Child));
        }
        if !request.children.is_empty() {
            state.index.insert(request.id.clone(), (handle, Role::Parent));
        }
        state.requests.insert(
            handle,
            PendingRequest {
                request_id: request.id.clone(),
                children: children.clone(),
                pending: children.iter().cloned().collect(),
                failed: Vec::new(),
            },
        );

        Ok(RequestHandle {
            id: handle,
            request_id: request.id.clone(),
            children,
        })
    }

    /// Block until every child is resolved or `timeout` elapses.
    ///
    /// The handle is consumed either way: later events for it are ignored.
    pub fn await_completion(&self, handle: &RequestHandle, timeout: Duration) -> Result<RequestOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let request = state.requests.get(&handle.id).ok_or_else(|| {
                Error::InvalidState(format!("request {} is not pending", handle.request_id))
            })?;
            if request.pending.is_empty() {
                break;
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let request = state
            .forget(handle.id)
            .ok_or_else(|| Error::InvalidState(format!("request {} is not pending", handle.request_id)))?;
        drop(state);

        let outcome = if !request.pending.is_empty() {
            let mut pending: Vec<RequestId> = request.pending.into_iter().collect();
            pending.sort();
            warn!("request {} timed out waiting for {:?}", request.request_id, pending);
            RequestOutcome::Timeout {
                pending,
                failed: request.failed,
            }
        } else if !request.failed.is_empty() {
            warn!("request {} partially failed: {:?}", request.request_id, request.failed);
            RequestOutcome::PartialFailure(request.failed)
        } else {
            info!("request {} completed", request.request_id);
            RequestOutcome::AllSucceeded
        };
        Ok(outcome)
    }

    /// Match one inbound event against every pending request.
    pub fn handle_response(&self, event: ResponseEvent) {
        match event {
            ResponseEvent::RequestCompleted { request_id } => self.resolve(&request_id, None),
            ResponseEvent::RequestFailed { request_id, error } => {
                self.resolve(&request_id, Some(error))
            }
            ResponseEvent::TablesUpdates(updates) => {
                for update in updates {
                    if update.kind() != TableKind::Orders || update.op == UpdateOp::Delete {
                        continue;
                    }
                    if let Some(request_id) = update.row.str(columns::REQUEST_ID) {
                        self.resolve(&RequestId::new(request_id), None);
                    }
                }
            }
        }
    }

    fn resolve(&self, request_id: &RequestId, error: Option<String>) {
        let mut state = self.state.lock();
        let Some(&(handle, role)) = state.index.get(request_id) else {
            return;
        };
        let Some(request) = state.requests.get_mut(&handle) else {
            return;
        };

        let mut resolved = Vec::new();
        match (role, error) {
            (Role::Child, error) => {
                request.pending.remove(request_id);
                resolved.push(request_id.clone());
                match error {
                    Some(error) => {
                        warn!("request {} rejected: {}", request_id, error);
                        request.failed.push(FailedRequest {
                            request_id: request_id.clone(),
                            error,
                        });
                    }
                    None => debug!("request {} confirmed", request_id),
                }
            }
            (Role::Parent, Some(error)) => {
                warn!("composite {} rejected: {}", request_id, error);
                let mut children: Vec<RequestId> = request.pending.drain().collect();
                children.sort();
                for child in children {
                    request.failed.push(FailedRequest {
                        request_id: child.clone(),
                        error: error.clone(),
                    });
                    resolved.push(child);
                }
                resolved.push(request_id.clone());
            }
            // Acceptance of the parent says nothing about its legs.
            (Role::Parent, None) => return,
        }

        for id in resolved {
            state.index.remove(&id);
        }
        self.resolved.notify_all();
    }

    /// Stop tracking a request without waiting for it. Later events for its
    /// ids are ignored. Returns false if the handle was already consumed.
    pub fn abandon(&self, handle: &RequestHandle) -> bool {
        let forgotten = self.state.lock().forget(handle.id).is_some();
        if forgotten {
            debug!("request {} abandoned", handle.request_id);
            self.resolved.notify_all();
        }
        forgotten
    }

    /// Requests submitted and not yet awaited or abandoned.
    pub fn pending_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}
