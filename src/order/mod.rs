//! Message order calculator.
//!
//! Assigns a locally comparable sort key (`order`, a dense real number) to
//! every message without decrypting and re-sorting the whole history and
//! without any global sequence counter. Cost is O(log n) timestamp
//! decryptions per insertion: one probe of the most recent record, one of
//! the least recent, then a bracketing binary search over the rank-indexed
//! store for interior candidates.
//!
//! `order` is a local display-sort aid, not a distributed sequence number:
//! two devices may legitimately assign different values to the same message.

pub mod store;

use chrono::{DateTime, Utc};
use log::warn;
use uuid::Uuid;

use crate::crypto::{BubblesCrypto, ContactLocalKey};
use crate::error::{BubblesError, ProtocolError, Result};
use crate::protocol::envelope::{timestamp_from_micros, timestamp_micros};
use store::MessageOrderStore;

/// One stored `(messageId, encryptedSentAt, order)` record.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub message_id: Uuid,
    /// Locally encrypted wire timestamp (see [`encrypt_sent_at`]).
    pub enc_sent_at: Vec<u8>,
    pub order: f64,
}

/// Result of an order computation.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderResult {
    /// No existing record shares the candidate's timestamp; store this value.
    Found { order: f64 },
    /// An existing record has the exact same decrypted timestamp — a probable
    /// re-delivery. `duplicated_order` identifies it; callers may skip the
    /// insertion or insert anyway using `candidate_order`.
    Duplicated { candidate_order: f64, duplicated_order: f64 },
}

/// Move past one end of the history. Integral orders step by one; fractional
/// orders round toward the next integer in the direction of travel, so
/// repeatedly appending at an end re-aligns the sequence (1.3 → 2 → 3)
/// instead of accumulating fractional drift (1.3 → 2.3 → 3.3). Strict
/// ordering is preserved either way since floor(x) < x < ceil(x) for any
/// non-integral x.
fn bump_up(order: f64) -> f64 {
    if order.fract() == 0.0 {
        order + 1.0
    } else {
        order.ceil()
    }
}

fn bump_down(order: f64) -> f64 {
    if order.fract() == 0.0 {
        order - 1.0
    } else {
        order.floor()
    }
}

fn midpoint(a: f64, b: f64) -> f64 {
    (a + b) / 2.0
}

/// Encrypt a timestamp for an [`OrderRecord`] with the contact local key.
pub fn encrypt_sent_at<C: BubblesCrypto + ?Sized>(
    crypto: &C,
    key: &ContactLocalKey,
    sent_at: DateTime<Utc>,
) -> std::result::Result<Vec<u8>, ProtocolError> {
    crypto.local_encrypt(key, &timestamp_micros(sent_at).to_le_bytes())
}

/// Computes where a message belongs among a contact's stored records.
///
/// Never fails on well-formed input; an undecryptable `encSentAt` in a
/// probed record is a data-integrity fault from the persistence layer and is
/// surfaced rather than skipped — skipping would silently corrupt the
/// binary-search invariant and misplace the message in the visible history.
pub struct MessageOrderCalculator<'a, O: MessageOrderStore + ?Sized, C: BubblesCrypto + ?Sized> {
    store: &'a O,
    crypto: &'a C,
}

impl<'a, O: MessageOrderStore + ?Sized, C: BubblesCrypto + ?Sized>
    MessageOrderCalculator<'a, O, C>
{
    pub fn new(store: &'a O, crypto: &'a C) -> Self {
        Self { store, crypto }
    }

    pub fn compute(
        &self,
        candidate_sent_at: DateTime<Utc>,
        contact_id: Uuid,
        key: &ContactLocalKey,
    ) -> Result<OrderResult> {
        let most_recent = self
            .store
            .most_recent(contact_id)
            .map_err(|e| BubblesError::Storage(e.to_string()))?;

        // Empty history: the first message anchors the sequence at zero.
        let Some(most_recent) = most_recent else {
            return Ok(OrderResult::Found { order: 0.0 });
        };

        let most_recent_at = self.decrypt_sent_at(&most_recent, key)?;
        if candidate_sent_at > most_recent_at {
            return Ok(OrderResult::Found { order: bump_up(most_recent.order) });
        }
        if candidate_sent_at == most_recent_at {
            return Ok(OrderResult::Duplicated {
                candidate_order: bump_up(most_recent.order),
                duplicated_order: most_recent.order,
            });
        }

        let least_recent = self
            .store
            .least_recent(contact_id)
            .map_err(|e| BubblesError::Storage(e.to_string()))?
            .ok_or_else(|| BubblesError::Storage("least recent missing".to_string()))?;
        let least_recent_at = self.decrypt_sent_at(&least_recent, key)?;

        // A tie with the single oldest message pushes the candidate further
        // back instead of reporting a duplicate: the earliest message in a
        // conversation is never displaced.
        if candidate_sent_at <= least_recent_at {
            return Ok(OrderResult::Found { order: bump_down(least_recent.order) });
        }

        self.bracketing_search(
            candidate_sent_at,
            contact_id,
            key,
            most_recent.order,
            least_recent.order,
        )
    }

    /// Narrow down to two adjacent records `lower` (closer to most recent)
    /// and `upper` such that `upper.sentAt < candidate < lower.sentAt`,
    /// decrypting only probed midpoints. Records are most-recent-first by
    /// descending order; both ends are already known strict bounds.
    fn bracketing_search(
        &self,
        candidate_sent_at: DateTime<Utc>,
        contact_id: Uuid,
        key: &ContactLocalKey,
        most_recent_order: f64,
        least_recent_order: f64,
    ) -> Result<OrderResult> {
        let count = self
            .store
            .count(contact_id)
            .map_err(|e| BubblesError::Storage(e.to_string()))?;

        let mut lower = (0usize, most_recent_order);
        let mut upper = (count - 1, least_recent_order);

        while upper.0 - lower.0 > 1 {
            let mid = lower.0 + (upper.0 - lower.0) / 2;
            let probe = self.get_at_rank(contact_id, mid)?;
            let probe_at = self.decrypt_sent_at(&probe, key)?;

            if probe_at == candidate_sent_at {
                // The interior match always has a more recent neighbor; the
                // candidate slots between the two.
                let neighbor = self.get_at_rank(contact_id, mid - 1)?;
                return Ok(OrderResult::Duplicated {
                    candidate_order: midpoint(neighbor.order, probe.order),
                    duplicated_order: probe.order,
                });
            } else if probe_at > candidate_sent_at {
                lower = (mid, probe.order);
            } else {
                upper = (mid, probe.order);
            }
        }

        Ok(OrderResult::Found { order: midpoint(lower.1, upper.1) })
    }

    fn get_at_rank(&self, contact_id: Uuid, rank: usize) -> Result<OrderRecord> {
        self.store
            .get_at_rank(contact_id, rank)
            .map_err(|e| BubblesError::Storage(e.to_string()))?
            .ok_or_else(|| BubblesError::Storage(format!("missing order record at rank {rank}")))
    }

    fn decrypt_sent_at(&self, record: &OrderRecord, key: &ContactLocalKey) -> Result<DateTime<Utc>> {
        let plain = self.crypto.local_decrypt(key, &record.enc_sent_at).map_err(|e| {
            warn!("Undecryptable sentAt in order record {}", record.message_id);
            BubblesError::Protocol(e)
        })?;
        let micros: [u8; 8] = plain
            .as_slice()
            .try_into()
            .map_err(|_| BubblesError::Protocol(ProtocolError::LocalDecryptionFailed))?;
        timestamp_from_micros(i64::from_le_bytes(micros))
            .ok_or(BubblesError::Protocol(ProtocolError::LocalDecryptionFailed))
    }
}
