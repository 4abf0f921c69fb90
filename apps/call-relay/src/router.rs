use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::calls::{CallError, CallEvent, CallSession, CallSessionStore, CallState};
use crate::error::RelayError;
use crate::protocol::{ClientMessage, ConnectionId, Payload, ServerMessage, UserId};
use crate::registry::ConnectionRegistry;

/// Delivery side of the transport. Returns `false` when the connection is
/// gone or its outbox is full; the router never blocks on it.
pub trait Outbound: Send + Sync {
    fn deliver(&self, connection: ConnectionId, message: ServerMessage) -> bool;
}

struct RelayState {
    registry: ConnectionRegistry,
    calls: CallSessionStore,
}

#[derive(Debug, Serialize)]
pub struct RelaySnapshot {
    pub registered_users: usize,
    pub calls: Vec<CallSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct CallSnapshot {
    pub initiator: UserId,
    pub responder: UserId,
    pub state: CallState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Validates client messages against the registry and call state, then
/// forwards them to the addressed peer.
///
/// Registry and call store live behind one lock. Every message, disconnect
/// and expiry sweep runs start to finish under it, deliveries included, so
/// check-then-forward sequences cannot interleave with a teardown.
#[derive(Clone)]
pub struct SignalingRouter {
    state: Arc<Mutex<RelayState>>,
    outbound: Arc<dyn Outbound>,
}

impl SignalingRouter {
    pub fn new(
        registry: ConnectionRegistry,
        calls: CallSessionStore,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState { registry, calls })),
            outbound,
        }
    }

    /// Route one decoded message from `sender`. Failures are answered with
    /// `call-error` on the sender's connection.
    pub fn handle(&self, sender: ConnectionId, message: ClientMessage) {
        let kind = message.kind();
        counter!("call_relay_messages_total", 1, "kind" => kind);

        let mut state = self.state.lock();
        let result = match message {
            ClientMessage::Register { user_id } => self.register(&mut state, sender, user_id),
            ClientMessage::Call { from, to, offer } => {
                self.call(&mut state, sender, from, to, offer)
            }
            ClientMessage::Answer { to, answer } => self.answer(&mut state, sender, to, answer),
            ClientMessage::IceCandidate { to, candidate } => {
                self.ice_candidate(&mut state, sender, to, candidate)
            }
            ClientMessage::EndCall { to } => self.end_call(&mut state, sender, to),
        };

        if let Err(err) = result {
            debug!(connection_id = %sender, kind, error = %err, "rejected client message");
            self.reject(sender, &err);
        }
        record_gauges(&state);
    }

    /// Answer a frame that could not be decoded.
    pub fn reject_malformed(&self, sender: ConnectionId, reason: impl Into<String>) {
        counter!("call_relay_call_errors_total", 1, "reason" => "invalid_message");
        self.outbound.deliver(
            sender,
            ServerMessage::CallError {
                reason: reason.into(),
            },
        );
    }

    /// Tear down everything owned by a closed connection: its registry entry
    /// and any call its user was in. The surviving peer gets `end-call`.
    pub fn disconnect(&self, connection: ConnectionId) -> Option<UserId> {
        let mut state = self.state.lock();
        let user = state.registry.unbind_by_handle(connection)?;
        let ended = self.end_calls_involving(&mut state, &user);
        info!(
            connection_id = %connection,
            user_id = %user,
            calls_ended = ended,
            "user went offline"
        );
        record_gauges(&state);
        Some(user)
    }

    /// Drop ringing calls older than `max_age`, notifying both participants.
    pub fn expire_stale(&self, now: Instant, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let expired = state.calls.expire_ringing(now, max_age);
        for session in &expired {
            info!(
                initiator = %session.initiator,
                responder = %session.responder,
                "ringing call timed out"
            );
            for user in [&session.initiator, &session.responder] {
                if let Some(connection) = state.registry.resolve(user) {
                    self.outbound.deliver(connection, ServerMessage::EndCall);
                }
            }
        }
        if !expired.is_empty() {
            counter!("call_relay_calls_expired_total", expired.len() as u64);
            record_gauges(&state);
        }
        expired.len()
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let state = self.state.lock();
        RelaySnapshot {
            registered_users: state.registry.len(),
            calls: state
                .calls
                .sessions()
                .map(|session| CallSnapshot {
                    initiator: session.initiator.clone(),
                    responder: session.responder.clone(),
                    state: session.state,
                    created_at: session.created_at,
                })
                .collect(),
        }
    }

    fn register(
        &self,
        state: &mut RelayState,
        sender: ConnectionId,
        user_id: UserId,
    ) -> Result<(), RelayError> {
        if !user_id.is_valid() {
            return Err(RelayError::InvalidIdentifier);
        }

        // Calls of the old name end before the rebind, while their peers
        // still resolve to their own connections.
        let previous = state
            .registry
            .identity_of(sender)
            .filter(|previous| **previous != user_id)
            .cloned();
        if let Some(previous) = previous {
            info!(
                connection_id = %sender,
                previous = %previous,
                "connection switched identity"
            );
            self.end_calls_involving(state, &previous);
        }

        let rebind = state.registry.bind(user_id.clone(), sender);
        if let Some(detached) = rebind.detached {
            warn!(
                user_id = %user_id,
                detached = %detached,
                "user registered again from a new connection"
            );
        }
        info!(connection_id = %sender, user_id = %user_id, "user registered");
        Ok(())
    }

    fn call(
        &self,
        state: &mut RelayState,
        sender: ConnectionId,
        from: UserId,
        to: UserId,
        offer: Payload,
    ) -> Result<(), RelayError> {
        let caller = registered(state, sender)?;
        if from != caller {
            return Err(RelayError::IdentityMismatch { registered: caller });
        }
        if to == caller {
            return Err(RelayError::SelfCall);
        }
        let target = state
            .registry
            .resolve(&to)
            .ok_or_else(|| RelayError::TargetUnresolved(to.clone()))?;

        let placed = state
            .calls
            .place(&caller, &to)
            .map_err(|err| RelayError::from_call(err, &to))?;
        if let Some(old) = placed.superseded {
            // The replaced caller gets no notification.
            counter!("call_relay_calls_superseded_total", 1);
            info!(
                initiator = %old.initiator,
                responder = %old.responder,
                "ringing call superseded by a new call"
            );
        }

        let incoming = ServerMessage::IncomingCall {
            from: caller.clone(),
            offer,
        };
        if let Err(err) = self.forward(target, &to, incoming) {
            state.calls.terminate(&caller, &to);
            return Err(err);
        }
        info!(initiator = %caller, responder = %to, "call ringing");
        Ok(())
    }

    fn answer(
        &self,
        state: &mut RelayState,
        sender: ConnectionId,
        to: UserId,
        answer: Payload,
    ) -> Result<(), RelayError> {
        let responder = registered(state, sender)?;
        let target = state
            .registry
            .resolve(&to)
            .ok_or_else(|| RelayError::TargetUnresolved(to.clone()))?;
        state
            .calls
            .transition(&responder, &to, CallEvent::Answer)
            .map_err(|err| RelayError::from_call(err, &to))?;

        self.forward(target, &to, ServerMessage::CallAnswered { answer })?;
        info!(initiator = %to, responder = %responder, "call answered");
        Ok(())
    }

    fn ice_candidate(
        &self,
        state: &mut RelayState,
        sender: ConnectionId,
        to: UserId,
        candidate: Payload,
    ) -> Result<(), RelayError> {
        let from = registered(state, sender)?;
        let target = state
            .registry
            .resolve(&to)
            .ok_or_else(|| RelayError::TargetUnresolved(to.clone()))?;
        state
            .calls
            .transition(&from, &to, CallEvent::IceCandidate)
            .map_err(|err| RelayError::from_call(err, &to))?;

        self.forward(target, &to, ServerMessage::IceCandidate { candidate })
    }

    fn end_call(
        &self,
        state: &mut RelayState,
        sender: ConnectionId,
        to: UserId,
    ) -> Result<(), RelayError> {
        let from = registered(state, sender)?;
        match state.calls.transition(&from, &to, CallEvent::EndCall) {
            Ok(_) => {
                info!(user_id = %from, peer = %to, "call ended");
                if let Some(target) = state.registry.resolve(&to) {
                    self.outbound.deliver(target, ServerMessage::EndCall);
                }
                Ok(())
            }
            Err(CallError::NotFound) => {
                debug!(user_id = %from, peer = %to, "end-call for a call that is already gone");
                Ok(())
            }
            Err(err) => Err(RelayError::from_call(err, &to)),
        }
    }

    fn end_calls_involving(&self, state: &mut RelayState, user: &UserId) -> usize {
        let ended: Vec<CallSession> = state.calls.terminate_all_involving(user);
        for session in &ended {
            let Some(peer) = session.peer_of(user) else {
                continue;
            };
            if let Some(connection) = state.registry.resolve(peer) {
                self.outbound.deliver(connection, ServerMessage::EndCall);
            }
        }
        ended.len()
    }

    fn forward(
        &self,
        connection: ConnectionId,
        user: &UserId,
        message: ServerMessage,
    ) -> Result<(), RelayError> {
        let kind = message.kind();
        if self.outbound.deliver(connection, message) {
            debug!(connection_id = %connection, user_id = %user, kind, "forwarded");
            Ok(())
        } else {
            Err(RelayError::TargetUnresolved(user.clone()))
        }
    }

    fn reject(&self, sender: ConnectionId, err: &RelayError) {
        counter!("call_relay_call_errors_total", 1, "reason" => err.metric_label());
        self.outbound.deliver(
            sender,
            ServerMessage::CallError {
                reason: err.reason(),
            },
        );
    }
}

fn registered(state: &RelayState, sender: ConnectionId) -> Result<UserId, RelayError> {
    state
        .registry
        .identity_of(sender)
        .cloned()
        .ok_or(RelayError::NotRegistered)
}

fn record_gauges(state: &RelayState) {
    gauge!("call_relay_users_registered", state.registry.len() as f64);
    gauge!("call_relay_calls_active", state.calls.len() as f64);
}
