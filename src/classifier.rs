// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity kind classification for replay.
//!
//! Every mutation and deletion in a commit-log manifest is tagged with an
//! entity kind. The classifier decides, per kind:
//!
//! - whether the kind is replicated at all (`included`), and
//! - its replay weight, used to order operations *within* one manifest so
//!   that parents land before children (referential integrity).
//!
//! Excluded kinds fall into two groups, both silently skipped with zero
//! side effects:
//!
//! - **Dually written**: the producer writes these natively to both stores,
//!   so re-applying them from the log would clobber newer data.
//! - **Never replicated**: source-store bookkeeping (indexes, cache
//!   markers) with no SQL counterpart.
//!
//! An unknown kind is treated as excluded. Failing safe here means a new,
//! not-yet-classified kind is dropped from replay rather than upserted into
//! an unrelated table.

use std::collections::HashMap;

/// Classification of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Whether mutations and deletions of this kind are replayed.
    pub included: bool,
    /// Intra-manifest ordering weight; lower applies first.
    pub weight: u8,
}

impl Classification {
    /// A replicated kind with the given replay weight.
    pub const fn replicated(weight: u8) -> Self {
        Self {
            included: true,
            weight,
        }
    }

    /// A kind that never reaches the target store's write path.
    pub const fn excluded() -> Self {
        Self {
            included: false,
            weight: 0,
        }
    }
}

/// Conceptual weight of a deletion.
///
/// Deletions of a manifest always apply after all of that manifest's
/// mutations, which is equivalent to sorting them with a weight above any
/// insert weight. The replay planner enforces this structurally; the
/// constant documents the ordering contract.
pub const DELETION_WEIGHT: u8 = u8::MAX;

/// Static kind → classification table, built once at process start.
#[derive(Debug, Clone)]
pub struct EntityClassifier {
    table: HashMap<&'static str, Classification>,
}

impl EntityClassifier {
    /// The registry's entity graph, weighted by foreign-key depth.
    ///
    /// Independent kinds are weight 0; each level of dependency adds one.
    /// History, billing, and poll entities reference domains, contacts, and
    /// hosts, so they apply last.
    pub fn registry() -> Self {
        let table = HashMap::from([
            // Independent parents.
            ("registrar", Classification::replicated(0)),
            ("tld", Classification::replicated(0)),
            // Reference registrars.
            ("registrar-contact", Classification::replicated(1)),
            ("contact", Classification::replicated(1)),
            ("host", Classification::replicated(1)),
            // References contacts and hosts.
            ("domain", Classification::replicated(2)),
            // Reference domains (and the rest of the graph).
            ("domain-history", Classification::replicated(3)),
            ("contact-history", Classification::replicated(3)),
            ("host-history", Classification::replicated(3)),
            ("billing-event", Classification::replicated(3)),
            ("poll-message", Classification::replicated(3)),
            ("grace-period", Classification::replicated(3)),
            // Dually written by the producer; replaying would clobber.
            ("premium-list", Classification::excluded()),
            ("claims-list", Classification::excluded()),
            // Source-store bookkeeping with no SQL counterpart.
            ("epp-resource-index", Classification::excluded()),
            ("foreign-key-index", Classification::excluded()),
            ("cache-invalidation", Classification::excluded()),
        ]);
        Self { table }
    }

    /// Classify an entity kind. Unknown kinds are excluded.
    pub fn classify(&self, kind: &str) -> Classification {
        self.table
            .get(kind)
            .copied()
            .unwrap_or_else(Classification::excluded)
    }

    /// Check whether a kind is replicated.
    pub fn is_included(&self, kind: &str) -> bool {
        self.classify(kind).included
    }
}

impl Default for EntityClassifier {
    fn default() -> Self {
        Self::registry()
    }
}
