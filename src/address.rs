//! Recipient addresses and the chain being delivered.
//!
//! Addresses form a graph: alias and forwarding expansion gives each
//! address an optional parent, and an address that resolved to the same
//! destination as an earlier one is recorded as a duplicate of it.  The
//! chain is an arena indexed by position, which keeps the duplicate
//! graph walkable even when misconfiguration makes it cyclic.

use std::{
    collections::HashSet,
    ops::{Deref, DerefMut},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Outcome of a delivery attempt, reported back into the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Whether the message was written out successfully.
    pub ok: bool,
    /// Failure detail, when `ok` is false.
    pub error: Option<String>,
    /// Time spent writing the message.
    pub timing: Option<Duration>,
}

/// One recipient address in the delivery chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipient {
    /// The envelope address text.
    pub address: String,
    /// Index of the address this one was expanded from.
    pub parent: Option<usize>,
    /// Index of an earlier address this one duplicates.
    pub duplicate_of: Option<usize>,
    /// Per-address header removal patterns, in addition to the
    /// transport-wide list.
    pub remove_headers: Vec<String>,
    /// Headers attached to this address during routing, emitted after
    /// the stored headers in original order.
    pub extra_headers: Vec<String>,
    /// Delivery outcome slot, filled by the transport.
    #[serde(skip)]
    pub outcome: Option<DeliveryOutcome>,
}

impl Recipient {
    /// A plain top-level recipient.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

/// The ordered recipient chain for one delivery attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientChain(pub Vec<Recipient>);

impl Deref for RecipientChain {
    type Target = Vec<Recipient>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RecipientChain {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Recipient>> for RecipientChain {
    fn from(value: Vec<Recipient>) -> Self {
        Self(value)
    }
}

impl RecipientChain {
    /// Walk parent links up to the top-level progenitor of `index`.
    #[must_use]
    pub fn progenitor(&self, index: usize) -> usize {
        let mut current = index;
        let mut seen = HashSet::new();
        while let Some(parent) = self.0.get(current).and_then(|r| r.parent) {
            // A parent cycle would otherwise loop forever.
            if !seen.insert(current) || parent >= self.0.len() {
                break;
            }
            current = parent;
        }
        current
    }

    /// The set of ancestor indices of `index`, inclusive.
    fn ancestry(&self, index: usize) -> HashSet<usize> {
        let mut out = HashSet::new();
        let mut current = index;
        loop {
            if !out.insert(current) {
                break;
            }
            match self.0.get(current).and_then(|r| r.parent) {
                Some(parent) if parent < self.0.len() => current = parent,
                _ => break,
            }
        }
        out
    }

    /// The distinct original envelope addresses covered by `delivered`,
    /// each printed exactly once.
    ///
    /// For every delivered address, any address recorded as a duplicate
    /// of one of its ancestors is resolved first, so that recipients
    /// folded away by duplicate collapsing still appear.  A
    /// fully-processed set guards against cyclic duplicate graphs and a
    /// printed set against repeated output.
    #[must_use]
    pub fn envelope_addresses(&self, delivered: &[usize]) -> Vec<String> {
        let mut processed = HashSet::new();
        let mut printed = HashSet::new();
        let mut out = Vec::new();
        for &index in delivered {
            if index < self.0.len() {
                self.collect_envelope(index, &mut processed, &mut printed, &mut out);
            }
        }
        out
    }

    fn collect_envelope(
        &self,
        index: usize,
        processed: &mut HashSet<usize>,
        printed: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !processed.insert(index) {
            return;
        }
        let ancestry = self.ancestry(index);
        for (other, recipient) in self.0.iter().enumerate() {
            if let Some(target) = recipient.duplicate_of
                && ancestry.contains(&target)
                && other != index
            {
                self.collect_envelope(other, processed, printed, out);
            }
        }
        let top = self.progenitor(index);
        let address = &self.0[top].address;
        if printed.insert(address.clone()) {
            out.push(address.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progenitor_climbs_parent_links() {
        let chain = RecipientChain(vec![
            Recipient::new("top@example.com"),
            Recipient {
                address: "mid@example.com".into(),
                parent: Some(0),
                ..Recipient::default()
            },
            Recipient {
                address: "leaf@example.com".into(),
                parent: Some(1),
                ..Recipient::default()
            },
        ]);
        assert_eq!(chain.progenitor(2), 0);
        assert_eq!(chain.progenitor(0), 0);
    }

    #[test]
    fn envelope_addresses_prints_distinct_top_levels_once() {
        let chain = RecipientChain(vec![
            Recipient::new("a@example.com"),
            Recipient::new("b@example.com"),
        ]);
        assert_eq!(
            chain.envelope_addresses(&[0, 1]),
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
        // Delivering both children of one progenitor prints it once
        let chain = RecipientChain(vec![
            Recipient::new("list@example.com"),
            Recipient {
                address: "x@example.com".into(),
                parent: Some(0),
                ..Recipient::default()
            },
            Recipient {
                address: "y@example.com".into(),
                parent: Some(0),
                ..Recipient::default()
            },
        ]);
        assert_eq!(
            chain.envelope_addresses(&[1, 2]),
            vec!["list@example.com".to_string()]
        );
    }

    #[test]
    fn duplicates_of_an_ancestor_are_resolved_first() {
        // other@example.com was folded into child as a duplicate; its own
        // progenitor must still be reported.
        let chain = RecipientChain(vec![
            Recipient::new("list@example.com"),
            Recipient {
                address: "child@example.com".into(),
                parent: Some(0),
                ..Recipient::default()
            },
            Recipient::new("other@example.com"),
            Recipient {
                address: "dup@example.com".into(),
                parent: Some(2),
                duplicate_of: Some(1),
                ..Recipient::default()
            },
        ]);
        assert_eq!(
            chain.envelope_addresses(&[1]),
            vec!["other@example.com".to_string(), "list@example.com".to_string()]
        );
    }

    #[test]
    fn cyclic_duplicate_graph_terminates() {
        let chain = RecipientChain(vec![
            Recipient {
                address: "a@example.com".into(),
                duplicate_of: Some(1),
                ..Recipient::default()
            },
            Recipient {
                address: "b@example.com".into(),
                duplicate_of: Some(0),
                ..Recipient::default()
            },
        ]);
        let out = chain.envelope_addresses(&[0]);
        assert_eq!(
            out,
            vec!["b@example.com".to_string(), "a@example.com".to_string()]
        );
    }

    #[test]
    fn parent_cycle_terminates() {
        let chain = RecipientChain(vec![
            Recipient {
                address: "a@example.com".into(),
                parent: Some(1),
                ..Recipient::default()
            },
            Recipient {
                address: "b@example.com".into(),
                parent: Some(0),
                ..Recipient::default()
            },
        ]);
        // Just must not hang; the progenitor of a cycle is whichever
        // member the walk settles on.
        let _ = chain.envelope_addresses(&[0]);
    }
}
