//! Read-only scans over the card table used by admission and policy checks.

use crate::protocol::Card;

/// Indices of cards that can be handed out right now: unreserved, not in the
/// post-release lock window, and with no process observed on them. Order is
/// card-index order, which keeps grants stable.
pub fn free_indices(cards: &[Card]) -> Vec<usize> {
    cards
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_free() && !c.locked_until_update && c.processes.is_empty())
        .map(|(i, _)| i)
        .collect()
}

/// Number of cards currently reserved by `uid`.
pub fn reserved_count(cards: &[Card], uid: u32) -> usize {
    cards.iter().filter(|c| c.reserved_by_uid == uid).count()
}
