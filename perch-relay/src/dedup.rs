//! Dedup & ordering engine.
//!
//! The cursor alone is not enough for at-most-once delivery: upstream may
//! return items at or before the stored cursor during retries or clock skew.
//! Filtering against the retained delivered-id set closes that gap.
use std::collections::HashSet;

use perch_common::{Cursor, Item};

/// Result of sieving one fetched page against the delivered-id window.
#[derive(Debug, Clone, Default)]
pub struct Sieved {
    /// Items not yet delivered, in the order the adapter produced them.
    pub fresh: Vec<Item>,
    /// Max `(timestamp, item_id)` across ALL fetched items, duplicates
    /// included, so a page consisting only of already-delivered items can
    /// still advance the cursor.
    pub fetched_tip: Option<Cursor>,
}

/// Pure function: drop already-delivered items, keep the adapter's order.
pub fn sieve(items: Vec<Item>, delivered: &HashSet<String>) -> Sieved {
    let fetched_tip = items.iter().map(Item::position).max();
    let fresh = items
        .into_iter()
        .filter(|item| !delivered.contains(&item.item_id))
        .collect();
    Sieved { fresh, fetched_tip }
}
