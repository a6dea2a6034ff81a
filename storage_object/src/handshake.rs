//! The cross-SP agreement checks behind quiesce and unquiesce.
//!
//! Each check is a pure function of the local state and what we can see of the
//! peer. It returns an [`Outcome`] describing whether the caller may proceed
//! and which side effects to apply to metadata memory; the caller applies them
//! under the object lock.

use crate::metadata_memory::QuiesceState;

/// What this SP can currently see of its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    /// CMI link is up and the metadata service sees the peer object.
    pub present: bool,
    /// Present and the peer advertises `JOINED`.
    pub joined: bool,
    /// Peer's quiesce state, `NotStarted` without peer memory.
    pub state: QuiesceState,
}

impl PeerView {
    pub const ABSENT: PeerView = PeerView {
        present: false,
        joined: false,
        state: QuiesceState::NotStarted,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Proceed,
    /// Not agreed yet; retry on the next monitor cycle.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub step: Step,
    /// New local quiesce state to publish.
    pub set_local: Option<QuiesceState>,
    /// Arm the unquiesce condition so a later unquiesce runs.
    pub arm_unquiesce: bool,
    /// Reopen the metadata abort gate before publishing `set_local`.
    pub clear_abort: bool,
    /// Local state that must not be observed here.
    pub violation: Option<QuiesceState>,
}

impl Outcome {
    fn proceed() -> Self {
        Outcome {
            step: Step::Proceed,
            set_local: None,
            arm_unquiesce: false,
            clear_abort: false,
            violation: None,
        }
    }

    fn wait() -> Self {
        Outcome {
            step: Step::Wait,
            ..Self::proceed()
        }
    }

    fn with_local(mut self, state: QuiesceState) -> Self {
        self.set_local = Some(state);
        self
    }

    fn violated(local: QuiesceState) -> Self {
        Outcome {
            violation: Some(local),
            ..Self::wait()
        }
    }

    pub fn proceeds(&self) -> bool {
        self.step == Step::Proceed
    }
}

/// Can this SP start quiescing?
///
/// A local state of `NotStarted` or `UnquiesceReady` is advanced to `Ready`
/// and we wait one cycle for the peer to see it. Quiesce takes precedence over
/// a pending unquiesce, so unquiesce is armed unless the quiesce was requested
/// by the user.
pub fn start_check(local: QuiesceState, peer: &PeerView, user_init_quiesce: bool) -> Outcome {
    match local {
        QuiesceState::NotStarted | QuiesceState::UnquiesceReady => Outcome {
            arm_unquiesce: !user_init_quiesce,
            ..Outcome::wait().with_local(QuiesceState::Ready)
        },
        QuiesceState::Ready | QuiesceState::Complete => {
            if peer.joined && !matches!(peer.state, QuiesceState::Ready | QuiesceState::Complete) {
                // Peer is mid-unquiesce from an older round: restart the handshake.
                if peer.state != QuiesceState::NotStarted {
                    return Outcome::wait().with_local(QuiesceState::NotStarted);
                }
                return Outcome::wait();
            }
            Outcome::proceed()
        }
    }
}

/// Can this SP declare quiesce complete?
pub fn complete_check(local: QuiesceState, peer: &PeerView) -> Outcome {
    match local {
        QuiesceState::Ready => {
            let outcome = Outcome::wait().with_local(QuiesceState::Complete);
            // nobody to wait for
            if !peer.joined {
                return Outcome {
                    step: Step::Proceed,
                    ..outcome
                };
            }
            outcome
        }
        QuiesceState::Complete => {
            if peer.joined
                && !matches!(
                    peer.state,
                    QuiesceState::Complete | QuiesceState::UnquiesceReady
                )
            {
                return Outcome::wait();
            }
            Outcome::proceed()
        }
        QuiesceState::NotStarted | QuiesceState::UnquiesceReady => Outcome::violated(local),
    }
}

/// Can this SP unquiesce? The caller has already ruled out a peer that is
/// still quiescing.
pub fn unquiesce_check(local: QuiesceState, peer: &PeerView) -> Outcome {
    match local {
        QuiesceState::Complete => {
            if peer.joined
                && !matches!(
                    peer.state,
                    QuiesceState::Complete | QuiesceState::UnquiesceReady
                )
            {
                return Outcome::wait();
            }
            // The peer may start unquiescing as soon as it sees UnquiesceReady and
            // will then ask us for stripe locks, so the abort gate opens first.
            let outcome = Outcome {
                clear_abort: true,
                ..Outcome::wait().with_local(QuiesceState::UnquiesceReady)
            };
            if !peer.joined {
                return Outcome {
                    step: Step::Proceed,
                    ..outcome
                };
            }
            outcome
        }
        QuiesceState::UnquiesceReady => {
            if peer.joined
                && peer.state != QuiesceState::NotStarted
                && peer.state != QuiesceState::UnquiesceReady
            {
                return Outcome::wait();
            }
            Outcome::proceed()
        }
        // Already unquiesced; repeating is harmless.
        QuiesceState::NotStarted => Outcome::proceed(),
        QuiesceState::Ready => Outcome::violated(local),
    }
}

/// Drain at the transport only when both sides asked for it.
pub fn should_quiesce_drain(local_hold: bool, peer: &PeerView, peer_hold: bool) -> bool {
    local_hold && (!peer.present || peer_hold)
}
