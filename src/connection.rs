use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::media::ConnectionKey;

/// Offer/answer state of one media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
    Failed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::New => write!(f, "new"),
            NegotiationState::HaveLocalOffer => write!(f, "have-local-offer"),
            NegotiationState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            NegotiationState::Stable => write!(f, "stable"),
            NegotiationState::Closed => write!(f, "closed"),
            NegotiationState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationInput {
    LocalOffer,
    RemoteOffer,
    LocalAnswer,
    RemoteAnswer,
    IceFailed,
    Close,
}

impl NegotiationState {
    /// Transition table. `None` means the input is not valid in this state.
    pub fn next(self, input: NegotiationInput) -> Option<NegotiationState> {
        use NegotiationInput::*;
        use NegotiationState::*;

        match (self, input) {
            (Closed, _) => None,
            (_, Close) => Some(Closed),
            (New, LocalOffer) => Some(HaveLocalOffer),
            (New, RemoteOffer) => Some(HaveRemoteOffer),
            (HaveRemoteOffer, LocalAnswer) => Some(Stable),
            (HaveLocalOffer, RemoteAnswer) => Some(Stable),
            (New | HaveLocalOffer | HaveRemoteOffer | Stable, IceFailed) => Some(Failed),
            _ => None,
        }
    }

    /// Remote candidates can only be applied once a remote description is set.
    pub fn accepts_remote_candidates(self) -> bool {
        matches!(self, NegotiationState::HaveRemoteOffer | NegotiationState::Stable)
    }
}

/// Which side sent the offer for the current transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Read-only view of every connection's negotiation state, for observers
/// that must not touch the connection map.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<BTreeMap<ConnectionKey, NegotiationState>>>,
    receiver: watch::Receiver<BTreeMap<ConnectionKey, NegotiationState>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(BTreeMap::new());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, key: &ConnectionKey, state: NegotiationState) {
        self.status.send_modify(|states| {
            states.insert(key.clone(), state);
        });
    }

    pub fn remove(&self, key: &ConnectionKey) {
        self.status.send_modify(|states| {
            states.remove(key);
        });
    }

    pub fn snapshot(&self) -> BTreeMap<ConnectionKey, NegotiationState> {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<ConnectionKey, NegotiationState>> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationInput::*;
    use super::NegotiationState::*;
    use super::*;

    #[test]
    fn offerer_path() {
        let s = New.next(LocalOffer).unwrap();
        assert_eq!(s, HaveLocalOffer);
        assert!(!s.accepts_remote_candidates());
        assert_eq!(s.next(RemoteAnswer), Some(Stable));
    }

    #[test]
    fn answerer_path() {
        let s = New.next(RemoteOffer).unwrap();
        assert!(s.accepts_remote_candidates());
        assert_eq!(s.next(LocalAnswer), Some(Stable));
    }

    #[test]
    fn offers_only_from_new() {
        for state in [HaveLocalOffer, HaveRemoteOffer, Stable, Failed] {
            assert_eq!(state.next(RemoteOffer), None, "{state}");
            assert_eq!(state.next(LocalOffer), None, "{state}");
        }
    }

    #[test]
    fn close_from_anywhere_but_closed() {
        for state in [New, HaveLocalOffer, HaveRemoteOffer, Stable, Failed] {
            assert_eq!(state.next(Close), Some(Closed));
        }
        assert_eq!(Closed.next(Close), None);
        assert_eq!(Failed.next(IceFailed), None);
    }

    #[test]
    fn monitor_tracks_keys() {
        let monitor = ConnectionMonitor::new();
        let key = ConnectionKey::audio("a");
        monitor.update_state(&key, HaveLocalOffer);
        assert_eq!(monitor.snapshot().get(&key), Some(&HaveLocalOffer));
        monitor.remove(&key);
        assert!(monitor.snapshot().is_empty());
    }
}
