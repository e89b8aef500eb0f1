//! Filter predicates and membership tracking (§4.4, §4.5, §9).
//!
//! A `Filter` pairs a match predicate with an optional unmatch predicate,
//! giving subscribers and triggers the same hysteresis band: once a row is
//! inside, it stays inside until `unmatch` fires, not merely until `match`
//! stops holding. `MembershipTracker` is the shared piece of state machine
//! both `subscriber.rs` and `trigger.rs` drive — a filtered subscription and
//! a trigger are the same membership problem with different output encodings
//! (synthesized row events vs. FIRE/CLEAR).

use std::collections::{HashMap, HashSet};

use tycostream_protocol::{Key, Predicate, Row};

#[derive(Debug, Clone)]
pub struct Filter {
    r#match: Predicate,
    unmatch: Option<Predicate>,
    dependent_columns: HashSet<String>,
}

impl Filter {
    pub fn new(r#match: Predicate, unmatch: Option<Predicate>) -> Self {
        let mut dependent_columns = r#match.dependent_columns();
        if let Some(u) = &unmatch {
            dependent_columns.extend(u.dependent_columns());
        }
        Filter {
            r#match,
            unmatch,
            dependent_columns,
        }
    }

    pub fn dependent_columns(&self) -> &HashSet<String> {
        &self.dependent_columns
    }

    /// Whether an update's changed fields could possibly flip this filter's
    /// membership verdict. When they can't, the caller may skip
    /// re-evaluation entirely (§4.4's disjoint-changed-fields optimization).
    pub fn may_be_affected_by(&self, changed_fields: &HashSet<String>) -> bool {
        !self.dependent_columns.is_disjoint(changed_fields)
    }

    /// Evaluate `match` alone, bypassing the hysteresis band entirely. Used
    /// for the "reborn key" rule (§4.4): an `Insert` arriving for a key
    /// already tracked as a member means the row was deleted and recreated
    /// upstream, and the band's "previously inside, stays inside" rule must
    /// not paper over that — only `match` decides whether it resyncs.
    pub fn matches(&self, row: &Row) -> bool {
        self.r#match.evaluate(row)
    }

    /// Whether `row` belongs inside the filter, given whether it was inside
    /// before. `match` takes precedence: a row satisfying both `match` and
    /// `unmatch` simultaneously is inside (§9's documented tie-break).
    pub fn membership_for(&self, previously_inside: bool, row: &Row) -> bool {
        if self.r#match.evaluate(row) {
            return true;
        }
        match &self.unmatch {
            Some(unmatch) => {
                if unmatch.evaluate(row) {
                    false
                } else {
                    previously_inside
                }
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    Left,
}

/// Per-key membership state for one filter, shared by every row event this
/// filter observes.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    members: HashMap<Key, bool>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        MembershipTracker::default()
    }

    pub fn is_member(&self, key: &Key) -> bool {
        self.members.get(key).copied().unwrap_or(false)
    }

    /// Update membership for `key` given the filter and the row's
    /// post-event state (`None` when the row no longer exists, e.g. a
    /// delete). Returns the transition, if the membership verdict changed.
    pub fn observe(&mut self, filter: &Filter, key: &Key, row: Option<&Row>) -> Option<Transition> {
        let was_member = self.is_member(key);
        let is_member = match row {
            Some(row) => filter.membership_for(was_member, row),
            None => false,
        };

        match (was_member, is_member) {
            (false, true) => {
                self.members.insert(key.clone(), true);
                Some(Transition::Entered)
            }
            (true, false) => {
                self.members.remove(key);
                Some(Transition::Left)
            }
            (true, true) => {
                self.members.insert(key.clone(), true);
                None
            }
            (false, false) => None,
        }
    }

    pub fn remove(&mut self, key: &Key) {
        self.members.remove(key);
    }
}
