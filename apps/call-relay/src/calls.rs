//! Call sessions keyed by the unordered pair of participants.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::protocol::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Offer delivered, waiting for the responder's answer.
    Ringing,
    /// Answer delivered; candidates may still be flowing.
    Active,
    /// Absorbing. Terminated sessions are removed from the store.
    Terminated,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::Ringing => "ringing",
            CallState::Active => "active",
            CallState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Answer,
    IceCandidate,
    EndCall,
    Disconnect,
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallEvent::Answer => "answer",
            CallEvent::IceCandidate => "ice-candidate",
            CallEvent::EndCall => "end-call",
            CallEvent::Disconnect => "disconnect",
        };
        f.write_str(label)
    }
}

impl CallState {
    /// Transition table for events on an existing session. `call` is not an
    /// event here: it creates or supersedes sessions through the store.
    pub fn on(self, event: CallEvent) -> Option<CallState> {
        match (self, event) {
            (CallState::Ringing, CallEvent::Answer) => Some(CallState::Active),
            (state @ (CallState::Ringing | CallState::Active), CallEvent::IceCandidate) => {
                Some(state)
            }
            (
                CallState::Ringing | CallState::Active,
                CallEvent::EndCall | CallEvent::Disconnect,
            ) => Some(CallState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("a call between these users already exists")]
    Conflict,
    #[error("no call between these users")]
    NotFound,
    #[error("{event} is not allowed while the call is {state}")]
    InvalidTransition { state: CallState, event: CallEvent },
    #[error("only {expected} may answer this call")]
    WrongParty { expected: UserId },
}

/// Unordered pair of participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(UserId, UserId);

impl PairKey {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub initiator: UserId,
    pub responder: UserId,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    started: Instant,
}

impl CallSession {
    fn new(initiator: UserId, responder: UserId, now: Instant) -> Self {
        Self {
            initiator,
            responder,
            state: CallState::Ringing,
            created_at: Utc::now(),
            started: now,
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.initiator == user || &self.responder == user
    }

    /// The other participant, if `user` takes part in this call.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.initiator == user {
            Some(&self.responder)
        } else if &self.responder == user {
            Some(&self.initiator)
        } else {
            None
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

/// Outcome of a `call` that was allowed to proceed.
#[derive(Debug)]
pub struct Placed {
    pub session: CallSession,
    pub superseded: Option<CallSession>,
}

#[derive(Debug, Default)]
pub struct CallSessionStore {
    sessions: HashMap<PairKey, CallSession>,
}

impl CallSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a ringing session; fails if the pair already has one.
    pub fn create(&mut self, initiator: &UserId, responder: &UserId) -> Result<CallSession, CallError> {
        self.create_at(initiator, responder, Instant::now())
    }

    fn create_at(
        &mut self,
        initiator: &UserId,
        responder: &UserId,
        now: Instant,
    ) -> Result<CallSession, CallError> {
        let key = PairKey::new(initiator, responder);
        if self.sessions.contains_key(&key) {
            return Err(CallError::Conflict);
        }
        let session = CallSession::new(initiator.clone(), responder.clone(), now);
        self.sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Open a ringing session, replacing one that is still ringing for the
    /// same pair (last caller wins). Active calls are never replaced.
    pub fn place(&mut self, initiator: &UserId, responder: &UserId) -> Result<Placed, CallError> {
        self.place_at(initiator, responder, Instant::now())
    }

    pub(crate) fn place_at(
        &mut self,
        initiator: &UserId,
        responder: &UserId,
        now: Instant,
    ) -> Result<Placed, CallError> {
        let key = PairKey::new(initiator, responder);
        let superseded = match self.sessions.get(&key).map(|s| s.state) {
            Some(CallState::Ringing) => self.sessions.remove(&key),
            Some(_) => return Err(CallError::Conflict),
            None => None,
        };
        let session = self.create_at(initiator, responder, now)?;
        Ok(Placed {
            session,
            superseded,
        })
    }

    pub fn get(&self, a: &UserId, b: &UserId) -> Option<&CallSession> {
        self.sessions.get(&PairKey::new(a, b))
    }

    /// Apply `event` raised by `actor` to the session between `actor` and
    /// `peer`. Terminating events remove the session.
    pub fn transition(
        &mut self,
        actor: &UserId,
        peer: &UserId,
        event: CallEvent,
    ) -> Result<CallState, CallError> {
        let key = PairKey::new(actor, peer);
        let session = self.sessions.get_mut(&key).ok_or(CallError::NotFound)?;
        let next = session
            .state
            .on(event)
            .ok_or(CallError::InvalidTransition {
                state: session.state,
                event,
            })?;

        if event == CallEvent::Answer && &session.responder != actor {
            return Err(CallError::WrongParty {
                expected: session.responder.clone(),
            });
        }

        if next == CallState::Terminated {
            self.sessions.remove(&key);
        } else {
            session.state = next;
        }
        Ok(next)
    }

    /// Remove the pair's session if there is one.
    pub fn terminate(&mut self, a: &UserId, b: &UserId) -> Option<CallSession> {
        self.sessions.remove(&PairKey::new(a, b))
    }

    /// Remove every session `user` takes part in.
    pub fn terminate_all_involving(&mut self, user: &UserId) -> Vec<CallSession> {
        let keys: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.involves(user))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .collect()
    }

    /// Remove ringing sessions older than `max_age`.
    pub fn expire_ringing(&mut self, now: Instant, max_age: Duration) -> Vec<CallSession> {
        let keys: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state == CallState::Ringing && session.age(now) > max_age)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &CallSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> (UserId, UserId) {
        (UserId::new("alice"), UserId::new("bob"))
    }

    #[test_timeout::timeout]
    fn create_starts_ringing_and_rejects_duplicates() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();

        let session = store.create(&alice, &bob).unwrap();
        assert_eq!(session.state, CallState::Ringing);
        assert_eq!(session.initiator, alice);

        // The pair is unordered.
        assert_eq!(store.create(&bob, &alice).unwrap_err(), CallError::Conflict);
        assert_eq!(store.len(), 1);
        assert!(store.get(&bob, &alice).is_some());
    }

    #[test_timeout::timeout]
    fn answer_moves_ringing_to_active() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        store.create(&alice, &bob).unwrap();

        assert_eq!(
            store.transition(&bob, &alice, CallEvent::Answer),
            Ok(CallState::Active)
        );
        assert_eq!(store.get(&alice, &bob).unwrap().state, CallState::Active);

        assert_eq!(
            store.transition(&bob, &alice, CallEvent::Answer),
            Err(CallError::InvalidTransition {
                state: CallState::Active,
                event: CallEvent::Answer,
            })
        );
    }

    #[test_timeout::timeout]
    fn initiator_cannot_answer_own_call() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        store.create(&alice, &bob).unwrap();

        assert_eq!(
            store.transition(&alice, &bob, CallEvent::Answer),
            Err(CallError::WrongParty {
                expected: bob.clone()
            })
        );
        assert_eq!(store.get(&alice, &bob).unwrap().state, CallState::Ringing);
    }

    #[test_timeout::timeout]
    fn answer_without_session_is_not_found() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        assert_eq!(
            store.transition(&bob, &alice, CallEvent::Answer),
            Err(CallError::NotFound)
        );
    }

    #[test_timeout::timeout]
    fn candidates_keep_state() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        store.create(&alice, &bob).unwrap();

        assert_eq!(
            store.transition(&alice, &bob, CallEvent::IceCandidate),
            Ok(CallState::Ringing)
        );
        store.transition(&bob, &alice, CallEvent::Answer).unwrap();
        assert_eq!(
            store.transition(&bob, &alice, CallEvent::IceCandidate),
            Ok(CallState::Active)
        );
    }

    #[test_timeout::timeout]
    fn end_call_removes_the_session() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        store.create(&alice, &bob).unwrap();

        assert_eq!(
            store.transition(&bob, &alice, CallEvent::EndCall),
            Ok(CallState::Terminated)
        );
        assert!(store.is_empty());
        assert_eq!(
            store.transition(&bob, &alice, CallEvent::EndCall),
            Err(CallError::NotFound)
        );
    }

    #[test_timeout::timeout]
    fn terminate_is_idempotent() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        store.create(&alice, &bob).unwrap();

        assert!(store.terminate(&bob, &alice).is_some());
        assert!(store.terminate(&bob, &alice).is_none());
    }

    #[test_timeout::timeout]
    fn place_supersedes_only_ringing_calls() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();

        let first = store.place(&alice, &bob).unwrap();
        assert!(first.superseded.is_none());

        let second = store.place(&bob, &alice).unwrap();
        let old = second.superseded.expect("ringing call replaced");
        assert_eq!(old.initiator, alice);
        assert_eq!(second.session.initiator, bob);
        assert_eq!(store.len(), 1);

        store.transition(&alice, &bob, CallEvent::Answer).unwrap();
        assert_eq!(store.place(&alice, &bob).unwrap_err(), CallError::Conflict);
        assert_eq!(store.get(&alice, &bob).unwrap().state, CallState::Active);
    }

    #[test_timeout::timeout]
    fn terminate_all_involving_leaves_other_pairs() {
        let mut store = CallSessionStore::new();
        let (alice, bob) = users();
        let carol = UserId::new("carol");
        let dave = UserId::new("dave");
        store.create(&alice, &bob).unwrap();
        store.create(&carol, &alice).unwrap();
        store.create(&carol, &dave).unwrap();

        let ended = store.terminate_all_involving(&alice);
        assert_eq!(ended.len(), 2);
        assert!(ended.iter().all(|s| s.involves(&alice)));
        assert_eq!(store.len(), 1);
        assert!(store.get(&carol, &dave).is_some());
        assert!(store.terminate_all_involving(&alice).is_empty());
    }

    #[test_timeout::timeout]
    fn expire_ringing_skips_active_and_fresh_calls() {
        let mut store = CallSessionStore::new();
        let (alice, bob) = users();
        let carol = UserId::new("carol");
        let dave = UserId::new("dave");
        let start = Instant::now();

        store.place_at(&alice, &bob, start).unwrap();
        store.place_at(&carol, &dave, start).unwrap();
        store.transition(&dave, &carol, CallEvent::Answer).unwrap();

        let later = start + Duration::from_secs(30);
        assert!(store.expire_ringing(later, Duration::from_secs(60)).is_empty());

        let much_later = start + Duration::from_secs(90);
        let expired = store.expire_ringing(much_later, Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].initiator, alice);
        assert_eq!(store.len(), 1);
    }

    #[test_timeout::timeout]
    fn peer_of_returns_the_other_side() {
        let (alice, bob) = users();
        let mut store = CallSessionStore::new();
        let session = store.create(&alice, &bob).unwrap();
        assert_eq!(session.peer_of(&alice), Some(&bob));
        assert_eq!(session.peer_of(&bob), Some(&alice));
        assert_eq!(session.peer_of(&UserId::new("eve")), None);
    }

    #[test_timeout::timeout]
    fn terminated_is_absorbing() {
        for event in [
            CallEvent::Answer,
            CallEvent::IceCandidate,
            CallEvent::EndCall,
            CallEvent::Disconnect,
        ] {
            assert_eq!(CallState::Terminated.on(event), None);
        }
    }
}
