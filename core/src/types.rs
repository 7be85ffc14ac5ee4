//! Domain records for services and tickets.
//!
//! A [`Service`] is a counter or desk with its own hours, capacity and ticket
//! sequence. A [`Ticket`] is one customer's place in a service's queue. Both are
//! plain data: every mutation that matters goes through the engine, which guards
//! transitions and keeps the per-service counter consistent.

use crate::schedule::{Availability, OperatingHours};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a stored string does not map onto a domain enum or code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a [`Service`].
    ServiceId
);

uuid_id!(
    /// Identifier of a [`Ticket`].
    TicketId
);

/// Priority tier. The derived ordering is the ranking order: `Urgent` is greatest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Regular walk-in.
    #[default]
    Normal,
    /// Elevated, e.g. elderly or pregnant customers.
    High,
    /// Always served before any other tier.
    Urgent,
}

impl Priority {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(ParseError::new("priority", other)),
        }
    }
}

/// Lifecycle state of a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// In the queue, not yet called.
    Waiting,
    /// Called to a counter, customer not yet being served.
    Called,
    /// Being served.
    Serving,
    /// Service completed. Terminal.
    Served,
    /// Cancelled by the client, staff, the system or a timeout. Terminal.
    Cancelled,
    /// Called but never showed up. Terminal.
    NoShow,
}

impl TicketState {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Called => "called",
            Self::Serving => "serving",
            Self::Served => "served",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }

    /// No transition leaves a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Served | Self::Cancelled | Self::NoShow)
    }

    /// Cancellation is only possible before service starts.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Waiting | Self::Called)
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "called" => Ok(Self::Called),
            "serving" => Ok(Self::Serving),
            "served" => Ok(Self::Served),
            "cancelled" => Ok(Self::Cancelled),
            "no_show" => Ok(Self::NoShow),
            other => Err(ParseError::new("ticket state", other)),
        }
    }
}

/// Who initiated a cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The ticket holder.
    Client,
    /// A staff member, identified by an opaque id.
    Agent(String),
    /// An administrative or automated process.
    System,
    /// The call-timeout sweep.
    Timeout,
}

impl Actor {
    /// Actor kind without the agent id, used for grouping and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent(_) => "agent",
            Self::System => "system",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent:{id}"),
            other => f.write_str(other.kind()),
        }
    }
}

impl FromStr for Actor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "system" => Ok(Self::System),
            "timeout" => Ok(Self::Timeout),
            other => other
                .strip_prefix("agent:")
                .map(|id| Self::Agent(id.to_string()))
                .ok_or_else(|| ParseError::new("actor", other)),
        }
    }
}

/// Long-form ticket reference: `{prefix}-{year}-{sequence:05}` with an optional
/// two-digit collision suffix, e.g. `PAS-2026-00012` or `PAS-2026-00012-37`.
///
/// The sequence counts tickets per prefix and calendar year, independently of
/// the per-service ticket number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketReference {
    /// Service prefix.
    pub prefix: String,
    /// Calendar year of issuance.
    pub year: i32,
    /// Sequence within prefix and year, starting at 1.
    pub sequence: u32,
    /// Random suffix appended when two generations raced for the same sequence.
    pub suffix: Option<u8>,
}

impl TicketReference {
    /// Reference without a collision suffix.
    #[must_use]
    pub fn new(prefix: impl Into<String>, year: i32, sequence: u32) -> Self {
        Self {
            prefix: prefix.into(),
            year,
            sequence,
            suffix: None,
        }
    }

    /// The same reference with a collision suffix.
    #[must_use]
    pub fn with_suffix(mut self, suffix: u8) -> Self {
        self.suffix = Some(suffix % 100);
        self
    }
}

impl fmt::Display for TicketReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:05}", self.prefix, self.year, self.sequence)?;
        if let Some(suffix) = self.suffix {
            write!(f, "-{suffix:02}")?;
        }
        Ok(())
    }
}

impl FromStr for TicketReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::new("ticket reference", s);
        // The prefix may itself contain dashes, so parse from the right.
        let parts: Vec<&str> = s.rsplitn(4, '-').collect();
        let (prefix, year, sequence, suffix) = match parts.as_slice() {
            [last, seq, year, prefix] if last.len() == 2 && seq.len() >= 5 && year.len() == 4 => {
                (*prefix, *year, *seq, Some(*last))
            }
            [seq, year, rest @ ..] if !rest.is_empty() => {
                let prefix = &s[..s.len() - seq.len() - year.len() - 2];
                (prefix, *year, *seq, None)
            }
            _ => return Err(err()),
        };
        if prefix.is_empty() {
            return Err(err());
        }
        Ok(Self {
            prefix: prefix.to_string(),
            year: year.parse().map_err(|_| err())?,
            sequence: sequence.parse().map_err(|_| err())?,
            suffix: suffix.map(str::parse::<u8>).transpose().map_err(|_| err())?,
        })
    }
}

/// Free-form customer contact fields. No engine logic depends on them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// Customer name.
    pub name: Option<String>,
    /// Phone number for SMS notifications.
    pub phone: Option<String>,
    /// Email address for email notifications.
    pub email: Option<String>,
    /// Anything the customer wants staff to know.
    pub notes: Option<String>,
}

/// A satisfaction rating between 1 and 5.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    /// Lowest accepted rating.
    pub const MIN: u8 = 1;
    /// Highest accepted rating.
    pub const MAX: u8 = 5;

    /// Returns `None` outside `1..=5`.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        if value >= Self::MIN && value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// The numeric value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| ParseError::new("rating", &value.to_string()))
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// Post-service feedback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// Rating between 1 and 5.
    pub rating: Rating,
    /// Optional free-text comment.
    pub comment: Option<String>,
    /// When the feedback was recorded.
    pub submitted_at: DateTime<Utc>,
}

/// Everything a cancellation writes onto a ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRecord {
    /// Who cancelled.
    pub by: Actor,
    /// Optional reason.
    pub reason: Option<String>,
    /// When the cancellation took effect.
    pub at: DateTime<Utc>,
}

/// A queue-serving counter or desk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Identifier.
    pub id: ServiceId,
    /// Display name.
    pub name: String,
    /// Prefix used for references and short codes.
    pub ticket_prefix: String,
    /// Administrative open/closed switch.
    pub is_open: bool,
    /// Opening hours with optional break and lunch windows.
    pub hours: OperatingHours,
    /// Average minutes per customer, used for wait estimation.
    pub estimated_service_minutes: u32,
    /// Capacity per local day.
    pub max_tickets_per_day: u32,
    /// Last ticket number handed out. Only the sequence allocator moves it.
    pub last_issued_number: u64,
    /// Tickets issued on `issued_on`.
    pub issued_today: u32,
    /// Local day `issued_today` refers to.
    pub issued_on: Option<NaiveDate>,
    /// Ticket number most recently called, for display. Zero after the daily reset.
    pub current_ticket_number: u64,
}

impl Service {
    /// Default capacity per day.
    pub const DEFAULT_MAX_TICKETS_PER_DAY: u32 = 100;
    /// Default minutes per customer.
    pub const DEFAULT_SERVICE_MINUTES: u32 = 15;

    /// A new open service with default hours, capacity and service time.
    #[must_use]
    pub fn new(name: impl Into<String>, ticket_prefix: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(),
            name: name.into(),
            ticket_prefix: ticket_prefix.into(),
            is_open: true,
            hours: OperatingHours::default(),
            estimated_service_minutes: Self::DEFAULT_SERVICE_MINUTES,
            max_tickets_per_day: Self::DEFAULT_MAX_TICKETS_PER_DAY,
            last_issued_number: 0,
            issued_today: 0,
            issued_on: None,
            current_ticket_number: 0,
        }
    }

    /// Replace the operating hours.
    #[must_use]
    pub fn with_hours(mut self, hours: OperatingHours) -> Self {
        self.hours = hours;
        self
    }

    /// Set minutes per customer.
    #[must_use]
    pub const fn with_service_minutes(mut self, minutes: u32) -> Self {
        self.estimated_service_minutes = minutes;
        self
    }

    /// Set daily capacity.
    #[must_use]
    pub const fn with_daily_limit(mut self, limit: u32) -> Self {
        self.max_tickets_per_day = limit;
        self
    }

    /// Tickets already issued on `day`, accounting for the daily rollover.
    #[must_use]
    pub fn issued_on_day(&self, day: NaiveDate) -> u32 {
        if self.issued_on == Some(day) {
            self.issued_today
        } else {
            0
        }
    }

    /// Whether the service accepts tickets at the given local time.
    #[must_use]
    pub fn availability(&self, local: NaiveDateTime) -> Availability {
        if self.is_open {
            self.hours.availability_at(local.time())
        } else {
            Availability::Closed
        }
    }
}

/// One customer's place in a service's queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Identifier.
    pub id: TicketId,
    /// Owning service; never changes.
    pub service_id: ServiceId,
    /// Number unique within the service, in order of issuance.
    pub ticket_number: u64,
    /// Globally unique long reference.
    pub reference: TicketReference,
    /// Globally unique seven-character code for QR and SMS.
    pub short_code: String,
    /// Proof-of-ownership token.
    pub security_token: String,
    /// Ranking tier.
    pub priority: Priority,
    /// Lifecycle state.
    pub state: TicketState,
    /// Customer contact details.
    pub contact: ContactInfo,
    /// Issued at.
    pub created_at: DateTime<Utc>,
    /// Called to a counter at.
    pub called_at: Option<DateTime<Utc>>,
    /// Service started at.
    pub served_at: Option<DateTime<Utc>>,
    /// Service completed at.
    pub completed_at: Option<DateTime<Utc>>,
    /// Cancellation details, set once cancelled.
    pub cancellation: Option<CancellationRecord>,
    /// Feedback, only on served tickets.
    pub feedback: Option<Feedback>,
}

impl Ticket {
    /// Whether `code` is this ticket's reference, short code or security token.
    #[must_use]
    pub fn answers_to(&self, code: &str) -> bool {
        self.short_code == code || self.security_token == code || self.reference.to_string() == code
    }

    /// When the ticket was cancelled, if it was.
    #[must_use]
    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancellation.as_ref().map(|c| c.at)
    }

    /// Minutes spent waiting: creation until called, or until `now` while still waiting.
    #[must_use]
    pub fn waiting_minutes(&self, now: DateTime<Utc>) -> f64 {
        let end = match (self.called_at, self.state) {
            (Some(called), _) => called,
            (None, TicketState::Waiting) => now,
            (None, _) => return 0.0,
        };
        minutes_between(self.created_at, end)
    }

    /// Minutes spent at the counter: service start until completion, or until `now`
    /// while still serving.
    #[must_use]
    pub fn service_minutes(&self, now: DateTime<Utc>) -> f64 {
        match (self.served_at, self.completed_at, self.state) {
            (Some(start), Some(end), _) => minutes_between(start, end),
            (Some(start), None, TicketState::Serving) => minutes_between(start, now),
            _ => 0.0,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / 60_000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn priority_orders_urgent_first() {
        let mut tiers = vec![Priority::Normal, Priority::Urgent, Priority::High];
        tiers.sort_by(|a, b| b.cmp(a));
        assert_eq!(tiers, vec![Priority::Urgent, Priority::High, Priority::Normal]);
    }

    #[test]
    fn terminal_states() {
        assert!(TicketState::Served.is_terminal());
        assert!(TicketState::Cancelled.is_terminal());
        assert!(TicketState::NoShow.is_terminal());
        assert!(!TicketState::Serving.is_terminal());
        assert!(TicketState::Called.is_cancellable());
        assert!(!TicketState::Serving.is_cancellable());
    }

    #[test]
    fn state_names_parse_back() {
        for state in [
            TicketState::Waiting,
            TicketState::Called,
            TicketState::Serving,
            TicketState::Served,
            TicketState::Cancelled,
            TicketState::NoShow,
        ] {
            assert_eq!(state.as_str().parse::<TicketState>().unwrap(), state);
        }
        assert!("done".parse::<TicketState>().is_err());
    }

    #[test]
    fn actor_storage_form() {
        let agent = Actor::Agent("desk-3".into());
        assert_eq!(agent.to_string(), "agent:desk-3");
        assert_eq!("agent:desk-3".parse::<Actor>().unwrap(), agent);
        assert_eq!("timeout".parse::<Actor>().unwrap(), Actor::Timeout);
        assert_eq!(agent.kind(), "agent");
        assert!("robot".parse::<Actor>().is_err());
    }

    #[test]
    fn reference_format() {
        let reference = TicketReference::new("PAS", 2026, 12);
        assert_eq!(reference.to_string(), "PAS-2026-00012");
        assert_eq!(reference.clone().with_suffix(7).to_string(), "PAS-2026-00012-07");
    }

    #[test]
    fn reference_parses_prefixes_with_dashes() {
        let parsed: TicketReference = "CIVIL-REG-2026-00003-41".parse().unwrap();
        assert_eq!(parsed.prefix, "CIVIL-REG");
        assert_eq!(parsed.year, 2026);
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.suffix, Some(41));

        let plain: TicketReference = "PAS-2026-00012".parse().unwrap();
        assert_eq!(plain, TicketReference::new("PAS", 2026, 12));
        assert!("garbage".parse::<TicketReference>().is_err());
    }

    #[test]
    fn rating_bounds() {
        assert!(Rating::new(0).is_none());
        assert_eq!(Rating::new(5).map(Rating::value), Some(5));
        assert!(Rating::new(6).is_none());
        assert!(serde_json::from_str::<Rating>("9").is_err());
    }

    #[test]
    fn issued_count_rolls_over_with_the_day() {
        let mut service = Service::new("Passports", "PAS");
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        service.issued_on = Some(day);
        service.issued_today = 40;
        assert_eq!(service.issued_on_day(day), 40);
        assert_eq!(service.issued_on_day(day.succ_opt().unwrap()), 0);
    }

    #[test]
    fn waiting_and_service_minutes() {
        let created = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut ticket = Ticket {
            id: TicketId::new(),
            service_id: ServiceId::new(),
            ticket_number: 1,
            reference: TicketReference::new("PAS", 2026, 1),
            short_code: "PAS01AB".into(),
            security_token: "token".into(),
            priority: Priority::Normal,
            state: TicketState::Waiting,
            contact: ContactInfo::default(),
            created_at: created,
            called_at: None,
            served_at: None,
            completed_at: None,
            cancellation: None,
            feedback: None,
        };

        let now = created + Duration::minutes(12);
        assert!((ticket.waiting_minutes(now) - 12.0).abs() < f64::EPSILON);

        ticket.state = TicketState::Serving;
        ticket.called_at = Some(created + Duration::minutes(5));
        ticket.served_at = Some(created + Duration::minutes(6));
        assert!((ticket.waiting_minutes(now) - 5.0).abs() < f64::EPSILON);
        assert!((ticket.service_minutes(now) - 6.0).abs() < f64::EPSILON);

        assert!(ticket.answers_to("PAS-2026-00001"));
        assert!(ticket.answers_to("PAS01AB"));
        assert!(!ticket.answers_to("PAS01AC"));
    }
}
