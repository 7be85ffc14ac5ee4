//! The ticket transition table.
//!
//! ```text
//! waiting ──call──▶ called ──start──▶ serving ──complete──▶ served
//!    │                │  └──────────complete──────────────▶ served
//!    │                ├──no_show──▶ no_show
//!    └────cancel──────┴──cancel───▶ cancelled
//! ```
//!
//! Guards are checked before any field is touched, so a rejected transition
//! leaves the ticket exactly as it was. Stores use [`Ticket::apply`] and
//! [`Ticket::cancel`] to mutate records so every backend shares one table.

use crate::types::{CancellationRecord, Ticket, TicketState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A staff-driven state change. Cancellation has its own protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// `waiting → called`
    Call,
    /// `called → serving`
    StartService,
    /// `called | serving → served`
    CompleteService,
    /// `called → no_show`
    MarkNoShow,
}

impl Transition {
    /// Label used in logs, metrics and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::StartService => "start_service",
            Self::CompleteService => "complete_service",
            Self::MarkNoShow => "mark_no_show",
        }
    }

    /// State reached on success.
    #[must_use]
    pub const fn target(self) -> TicketState {
        match self {
            Self::Call => TicketState::Called,
            Self::StartService => TicketState::Serving,
            Self::CompleteService => TicketState::Served,
            Self::MarkNoShow => TicketState::NoShow,
        }
    }

    /// Whether the transition may start from `from`.
    #[must_use]
    pub const fn allowed_from(self, from: TicketState) -> bool {
        matches!(
            (self, from),
            (Self::Call, TicketState::Waiting)
                | (Self::StartService | Self::MarkNoShow, TicketState::Called)
                | (Self::CompleteService, TicketState::Called | TicketState::Serving)
        )
    }

    /// States the transition may start from, for queries that filter by state.
    #[must_use]
    pub const fn sources(self) -> &'static [TicketState] {
        match self {
            Self::Call => &[TicketState::Waiting],
            Self::StartService | Self::MarkNoShow => &[TicketState::Called],
            Self::CompleteService => &[TicketState::Called, TicketState::Serving],
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A guard rejected the change; the ticket was not modified.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot {action} a ticket in state {from}")]
pub struct Rejected {
    /// What was attempted.
    pub action: &'static str,
    /// State the ticket was in.
    pub from: TicketState,
}

impl Ticket {
    /// Apply a staff transition at `at`.
    ///
    /// `call` stamps `called_at`, `start_service` stamps `served_at`,
    /// `complete_service` stamps `completed_at` (and `served_at` when the start
    /// step was skipped). `mark_no_show` only changes the state.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] if the transition is not allowed from the current state.
    pub fn apply(&mut self, transition: Transition, at: DateTime<Utc>) -> Result<(), Rejected> {
        if !transition.allowed_from(self.state) {
            return Err(Rejected {
                action: transition.name(),
                from: self.state,
            });
        }
        match transition {
            Transition::Call => self.called_at = Some(at),
            Transition::StartService => self.served_at = Some(at),
            Transition::CompleteService => {
                self.served_at.get_or_insert(at);
                self.completed_at = Some(at);
            }
            Transition::MarkNoShow => {}
        }
        self.state = transition.target();
        Ok(())
    }

    /// Write a cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] unless the ticket is waiting or called.
    pub fn cancel(&mut self, record: CancellationRecord) -> Result<(), Rejected> {
        if !self.state.is_cancellable() {
            return Err(Rejected {
                action: "cancel",
                from: self.state,
            });
        }
        self.state = TicketState::Cancelled;
        self.cancellation = Some(record);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{Actor, ContactInfo, Priority, ServiceId, TicketId, TicketReference};
    use chrono::{Duration, TimeZone};

    fn ticket() -> Ticket {
        Ticket {
            id: TicketId::new(),
            service_id: ServiceId::new(),
            ticket_number: 7,
            reference: TicketReference::new("GEN", 2026, 7),
            short_code: "GEN07QX".into(),
            security_token: "t".into(),
            priority: Priority::Normal,
            state: TicketState::Waiting,
            contact: ContactInfo::default(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
            called_at: None,
            served_at: None,
            completed_at: None,
            cancellation: None,
            feedback: None,
        }
    }

    const ALL: [TicketState; 6] = [
        TicketState::Waiting,
        TicketState::Called,
        TicketState::Serving,
        TicketState::Served,
        TicketState::Cancelled,
        TicketState::NoShow,
    ];

    const TRANSITIONS: [Transition; 4] = [
        Transition::Call,
        Transition::StartService,
        Transition::CompleteService,
        Transition::MarkNoShow,
    ];

    #[test]
    fn nothing_leaves_a_terminal_state() {
        for state in ALL.into_iter().filter(|s| s.is_terminal()) {
            for transition in TRANSITIONS {
                assert!(!transition.allowed_from(state), "{transition} from {state}");
            }
        }
    }

    #[test]
    fn sources_agree_with_guard() {
        for transition in TRANSITIONS {
            for state in ALL {
                assert_eq!(
                    transition.allowed_from(state),
                    transition.sources().contains(&state)
                );
            }
        }
    }

    #[test]
    fn happy_path_stamps_times_in_order() {
        let mut t = ticket();
        let t0 = t.created_at;
        t.apply(Transition::Call, t0 + Duration::minutes(3)).unwrap();
        t.apply(Transition::StartService, t0 + Duration::minutes(4)).unwrap();
        t.apply(Transition::CompleteService, t0 + Duration::minutes(9)).unwrap();

        assert_eq!(t.state, TicketState::Served);
        assert!(t.called_at <= t.served_at);
        assert!(t.served_at <= t.completed_at);
        assert_eq!(t.served_at, Some(t0 + Duration::minutes(4)));
    }

    #[test]
    fn completing_from_called_fills_served_at() {
        let mut t = ticket();
        let at = t.created_at + Duration::minutes(2);
        t.apply(Transition::Call, at).unwrap();
        t.apply(Transition::CompleteService, at).unwrap();
        assert_eq!(t.served_at, Some(at));
        assert_eq!(t.completed_at, Some(at));
    }

    #[test]
    fn rejected_transition_leaves_ticket_unchanged() {
        let mut t = ticket();
        let before = t.clone();
        let err = t.apply(Transition::StartService, t.created_at).unwrap_err();
        assert_eq!(err.from, TicketState::Waiting);
        assert_eq!(err.action, "start_service");
        assert_eq!(t, before);
    }

    proptest::proptest! {
        #[test]
        fn any_walk_keeps_timestamps_ordered(steps in proptest::collection::vec(0usize..4, 0..12)) {
            let mut t = ticket();
            let mut at = t.created_at;
            for step in steps {
                at += Duration::minutes(1);
                let before = t.clone();
                let was_terminal = t.state.is_terminal();
                if t.apply(TRANSITIONS[step], at).is_err() {
                    proptest::prop_assert_eq!(&t, &before);
                }
                if was_terminal {
                    proptest::prop_assert_eq!(t.state, before.state);
                }
                if let (Some(called), Some(served)) = (t.called_at, t.served_at) {
                    proptest::prop_assert!(called <= served);
                }
                if let (Some(served), Some(completed)) = (t.served_at, t.completed_at) {
                    proptest::prop_assert!(served <= completed);
                }
                if t.state == TicketState::Served {
                    proptest::prop_assert!(t.called_at.is_some());
                }
            }
        }
    }

    #[test]
    fn cancel_only_before_service() {
        let mut t = ticket();
        let record = CancellationRecord {
            by: Actor::Client,
            reason: Some("changed my mind".into()),
            at: t.created_at,
        };
        t.cancel(record.clone()).unwrap();
        assert_eq!(t.state, TicketState::Cancelled);
        assert_eq!(t.cancellation.as_ref(), Some(&record));

        let before = t.clone();
        assert!(t.cancel(record).is_err());
        assert_eq!(t, before);

        let mut serving = ticket();
        serving.state = TicketState::Serving;
        assert!(serving
            .cancel(CancellationRecord {
                by: Actor::System,
                reason: None,
                at: serving.created_at,
            })
            .is_err());
    }
}
