//! Reference, short code and security token derivation, plus lookup by any of them.
//!
//! - **Reference**: `{prefix}-{year}-{sequence:05}`. The sequence is the highest
//!   one issued for the prefix and year plus one. If that string is already
//!   taken, a random two-digit suffix is appended and re-checked.
//! - **Short code**: three letters from the prefix, the ticket number modulo 100
//!   as two digits, and two random uppercase letters (`PAS07QK`).
//! - **Security token**: SHA-256 over a server secret, the ticket id, reference,
//!   creation time and service id, encoded as unpadded base64url. Proofs are
//!   compared in constant time.
//!
//! Candidates are checked against the store before insertion; the unique
//! indexes on insert remain the final arbiter for races between checks.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use queueline_core::error::{Missing, QueueError};
use queueline_core::store::QueueStore;
use queueline_core::types::{Service, ServiceId, Ticket, TicketId, TicketReference};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, PoisonError};

/// The three handles derived for a new ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketCodes {
    /// Long-form reference.
    pub reference: TicketReference,
    /// Seven-character code.
    pub short_code: String,
    /// Proof-of-ownership token.
    pub security_token: String,
}

/// Derives and resolves ticket codes.
pub struct ReferenceCodec {
    store: Arc<dyn QueueStore>,
    secret: String,
    short_code_attempts: u32,
    reference_attempts: u32,
    rng: Mutex<StdRng>,
}

impl ReferenceCodec {
    /// Create a codec with an entropy-seeded generator.
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>, secret: impl Into<String>, short_code_attempts: u32, reference_attempts: u32) -> Self {
        Self {
            store,
            secret: secret.into(),
            short_code_attempts: short_code_attempts.max(1),
            reference_attempts,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the random source, for reproducible codes in tests.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Derive reference, short code and token for a ticket about to be inserted.
    ///
    /// # Errors
    ///
    /// - [`QueueError::AllocationFailure`] when no unused reference or short code
    ///   was found within the configured attempts
    /// - [`QueueError::Storage`] for backend failures
    pub async fn generate(
        &self,
        service: &Service,
        ticket_id: TicketId,
        ticket_number: u64,
        created_at: DateTime<Utc>,
        year: i32,
    ) -> Result<TicketCodes, QueueError> {
        let reference = self.reference(service, year).await?;
        let short_code = self.short_code(service, ticket_number).await?;
        let security_token = self.security_token(ticket_id, &reference, created_at, service.id);
        Ok(TicketCodes {
            reference,
            short_code,
            security_token,
        })
    }

    async fn reference(&self, service: &Service, year: i32) -> Result<TicketReference, QueueError> {
        let prefix = service.ticket_prefix.as_str();
        let sequence = self.store.max_reference_sequence(prefix, year).await?.saturating_add(1);
        let base = TicketReference::new(prefix, year, sequence);
        if !self.store.code_in_use(&base.to_string()).await? {
            return Ok(base);
        }
        self.suffixed_reference(service, &base).await
    }

    /// A suffixed variant of `taken` that is not in use yet.
    ///
    /// Keeps the prefix, year and sequence of `taken`, so a reference that lost
    /// an insert race is resolved without re-reading the highest sequence.
    ///
    /// # Errors
    ///
    /// - [`QueueError::AllocationFailure`] when every suffix tried was taken
    /// - [`QueueError::Storage`] for backend failures
    pub async fn suffixed_reference(
        &self,
        service: &Service,
        taken: &TicketReference,
    ) -> Result<TicketReference, QueueError> {
        let base = TicketReference {
            suffix: None,
            ..taken.clone()
        };
        for _ in 0..self.reference_attempts {
            let candidate = base.clone().with_suffix(self.random_suffix());
            if candidate.suffix == taken.suffix {
                continue;
            }
            if !self.store.code_in_use(&candidate.to_string()).await? {
                tracing::debug!(reference = %candidate, "reference_collision_resolved");
                return Ok(candidate);
            }
        }
        Err(QueueError::AllocationFailure {
            service_id: service.id,
            reason: format!("no free reference for {base} after {} attempts", self.reference_attempts),
        })
    }

    /// A short code for `ticket_number` that is not in use yet.
    ///
    /// # Errors
    ///
    /// - [`QueueError::AllocationFailure`] after the configured attempts
    /// - [`QueueError::Storage`] for backend failures
    pub async fn short_code(&self, service: &Service, ticket_number: u64) -> Result<String, QueueError> {
        let stem = format!("{}{:02}", short_code_letters(&service.ticket_prefix), ticket_number % 100);
        for _ in 0..self.short_code_attempts {
            let candidate = format!("{stem}{}", self.random_letters());
            if !self.store.code_in_use(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(QueueError::AllocationFailure {
            service_id: service.id,
            reason: format!("no free short code for {stem} after {} attempts", self.short_code_attempts),
        })
    }

    /// How many suffixes a reference collision may try.
    #[must_use]
    pub const fn reference_attempts(&self) -> u32 {
        self.reference_attempts
    }

    /// Deterministic one-way token for a ticket.
    #[must_use]
    pub fn security_token(
        &self,
        ticket_id: TicketId,
        reference: &TicketReference,
        created_at: DateTime<Utc>,
        service_id: ServiceId,
    ) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.secret.clone(),
            ticket_id.to_string(),
            reference.to_string(),
            created_at.timestamp_micros().to_string(),
            service_id.to_string(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Whether `proof` is the ticket's security token.
    #[must_use]
    pub fn verify(ticket: &Ticket, proof: &str) -> bool {
        constant_time_eq::constant_time_eq(ticket.security_token.as_bytes(), proof.as_bytes())
    }

    /// Resolve a reference, short code or security token to its ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] when nothing answers to `code`
    /// - [`QueueError::Storage`] for backend failures
    pub async fn lookup(&self, code: &str) -> Result<Ticket, QueueError> {
        let code = code.trim();
        self.store
            .find_by_code(code)
            .await?
            .ok_or_else(|| QueueError::NotFound(Missing::Code(code.to_string())))
    }

    fn random_suffix(&self) -> u8 {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen_range(0..100)
    }

    fn random_letters(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        (0..2).map(|_| char::from(rng.gen_range(b'A'..=b'Z'))).collect()
    }
}

/// First three ASCII letters of the prefix, uppercased, padded with `X`.
fn short_code_letters(prefix: &str) -> String {
    prefix
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .chain(std::iter::repeat('X'))
        .take(3)
        .collect()
}
