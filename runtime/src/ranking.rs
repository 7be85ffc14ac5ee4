//! Queue ordering, positions and wait estimates.
//!
//! Waiting tickets are ordered by priority tier (urgent, then high, then normal)
//! and by ticket number within a tier. Positions are 1-based; a ticket that is
//! not waiting has position 0 and no estimated wait.

use queueline_core::error::{Missing, QueueError};
use queueline_core::store::QueueStore;
use queueline_core::types::{Priority, ServiceId, Ticket, TicketId, TicketState};
use std::cmp::Reverse;
use std::sync::Arc;

/// Sort key of a waiting ticket: smaller is served sooner.
#[must_use]
pub fn rank_key(ticket: &Ticket) -> (Reverse<Priority>, u64) {
    (Reverse(ticket.priority), ticket.ticket_number)
}

/// Sort waiting tickets into calling order.
pub fn sort_by_rank(tickets: &mut [Ticket]) {
    tickets.sort_by_key(rank_key);
}

/// 1-based position of `ticket` among `waiting`, or 0 when it is not waiting.
///
/// `waiting` may be in any order and may or may not contain `ticket` itself.
#[must_use]
pub fn position_among(ticket: &Ticket, waiting: &[Ticket]) -> usize {
    if ticket.state != TicketState::Waiting {
        return 0;
    }
    let key = rank_key(ticket);
    let ahead = waiting
        .iter()
        .filter(|other| other.id != ticket.id && other.state == TicketState::Waiting && rank_key(other) < key)
        .count();
    ahead + 1
}

/// Minutes until `position` is reached at `minutes_per_customer`.
#[must_use]
pub fn estimated_wait(position: usize, minutes_per_customer: u32) -> u64 {
    u64::try_from(position)
        .unwrap_or(u64::MAX)
        .saturating_mul(u64::from(minutes_per_customer))
}

/// Store-backed ranking queries.
#[derive(Clone)]
pub struct QueueRanker {
    store: Arc<dyn QueueStore>,
}

impl QueueRanker {
    /// Rank over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Waiting tickets of a service in calling order.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] for backend failures
    pub async fn ranked_waiting(&self, service_id: ServiceId) -> Result<Vec<Ticket>, QueueError> {
        let mut waiting = self.store.waiting_tickets(service_id).await?;
        sort_by_rank(&mut waiting);
        Ok(waiting)
    }

    /// The ticket `call_next` would pick, if any.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] for backend failures
    pub async fn next_to_call(&self, service_id: ServiceId) -> Result<Option<Ticket>, QueueError> {
        let waiting = self.store.waiting_tickets(service_id).await?;
        Ok(waiting.into_iter().min_by_key(rank_key))
    }

    /// Position of a ticket; 0 when it is not waiting.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::Storage`] for backend failures
    pub async fn position(&self, ticket_id: TicketId) -> Result<usize, QueueError> {
        let ticket = self.load(ticket_id).await?;
        self.position_of(&ticket).await
    }

    /// Position of an already loaded ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] for backend failures
    pub async fn position_of(&self, ticket: &Ticket) -> Result<usize, QueueError> {
        if ticket.state != TicketState::Waiting {
            return Ok(0);
        }
        let waiting = self.store.waiting_tickets(ticket.service_id).await?;
        Ok(position_among(ticket, &waiting))
    }

    /// Estimated minutes until the ticket is called; `None` when it is not waiting.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket or service
    /// - [`QueueError::Storage`] for backend failures
    pub async fn estimated_wait_minutes(&self, ticket_id: TicketId) -> Result<Option<u64>, QueueError> {
        let ticket = self.load(ticket_id).await?;
        self.estimated_wait_of(&ticket).await
    }

    /// Estimated wait of an already loaded ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    /// - [`QueueError::Storage`] for backend failures
    pub async fn estimated_wait_of(&self, ticket: &Ticket) -> Result<Option<u64>, QueueError> {
        let position = self.position_of(ticket).await?;
        if position == 0 {
            return Ok(None);
        }
        let service = self
            .store
            .service(ticket.service_id)
            .await?
            .ok_or(QueueError::NotFound(Missing::Service(ticket.service_id)))?;
        Ok(Some(estimated_wait(position, service.estimated_service_minutes)))
    }

    async fn load(&self, ticket_id: TicketId) -> Result<Ticket, QueueError> {
        self.store
            .ticket(ticket_id)
            .await?
            .ok_or(QueueError::NotFound(Missing::Ticket(ticket_id)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use queueline_testing::fixtures::{open_service, waiting_ticket};
    use queueline_testing::mocks::test_time;
    use queueline_testing::properties;

    fn queue(priorities: &[Priority]) -> Vec<Ticket> {
        let service = open_service("Passports", "PAS");
        priorities
            .iter()
            .enumerate()
            .map(|(i, priority)| {
                let number = u64::try_from(i).unwrap() + 1;
                let mut ticket = waiting_ticket(&service, number, test_time() + Duration::minutes(i64::try_from(i).unwrap()));
                ticket.priority = *priority;
                ticket
            })
            .collect()
    }

    #[test]
    fn urgent_jumps_the_queue() {
        let tickets = queue(&[Priority::Normal, Priority::Normal, Priority::Normal, Priority::Urgent]);
        assert_eq!(position_among(&tickets[3], &tickets), 1);
        assert_eq!(position_among(&tickets[0], &tickets), 2);
        assert_eq!(position_among(&tickets[1], &tickets), 3);
        assert_eq!(estimated_wait(1, 5), 5);
    }

    #[test]
    fn high_sits_between_urgent_and_normal() {
        let mut tickets = queue(&[Priority::Normal, Priority::High, Priority::Urgent, Priority::High]);
        sort_by_rank(&mut tickets);
        let numbers: Vec<u64> = tickets.iter().map(|t| t.ticket_number).collect();
        assert_eq!(numbers, vec![3, 2, 4, 1]);
    }

    #[test]
    fn not_waiting_has_no_position() {
        let mut tickets = queue(&[Priority::Normal, Priority::Normal]);
        tickets[0].state = TicketState::Called;
        assert_eq!(position_among(&tickets[0], &tickets), 0);
        assert_eq!(position_among(&tickets[1], &tickets), 1);
    }

    #[test]
    fn wait_saturates() {
        assert_eq!(estimated_wait(usize::MAX, u32::MAX), u64::MAX);
        assert_eq!(estimated_wait(0, 15), 0);
    }

    proptest! {
        #[test]
        fn positions_are_a_permutation_respecting_tiers(
            priorities in properties::arrivals(30)
        ) {
            let tickets = queue(&priorities);
            let mut positions: Vec<usize> = tickets.iter().map(|t| position_among(t, &tickets)).collect();

            for a in &tickets {
                for b in &tickets {
                    if a.priority > b.priority {
                        prop_assert!(position_among(a, &tickets) < position_among(b, &tickets));
                    }
                }
            }

            positions.sort_unstable();
            let expected: Vec<usize> = (1..=tickets.len()).collect();
            prop_assert_eq!(positions, expected);
        }
    }
}
