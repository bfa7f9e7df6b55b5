// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit-log data model and diff-file codec.
//!
//! A **manifest** is the replicated projection of one source-store
//! transaction: its upserts ([`Mutation`]) and deletions ([`EntityKey`]),
//! tagged with the transaction's commit time. A **diff file** is an
//! immutable, time-ranged batch of manifests exported to object storage,
//! carrying a copy of the [`Checkpoint`] that produced it.
//!
//! # Ranges
//!
//! A diff file covers `(lower_bound_exclusive, checkpoint_time]`. The
//! watermark only ever advances to a file's upper bound, so replay windows
//! and file ranges always line up on file boundaries.
//!
//! # Wire Format
//!
//! JSON with RFC3339 timestamps, optionally zstd-compressed. Decoding
//! sniffs the zstd magic bytes and falls back to plain JSON, so exporters
//! may enable compression independently of consumers.
//!
//! Parsing validates structure eagerly: manifests must be strictly
//! ascending by commit time and every commit time must fall inside the
//! file's range. A file violating either rule is corrupt at the source and
//! fails with a non-retryable [`ReplayError::Decode`].

use crate::error::{ReplayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Blob name prefix for exported diff files.
///
/// Names are a convenience for humans and listings; consumers filter by the
/// parsed header range, never by name.
pub const DIFF_FILE_PREFIX: &str = "commit-diff-until-";

/// A monotonic export checkpoint.
///
/// Marks "everything committed at or before this time has been exported".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Upper bound (inclusive) of the export cycle that produced it.
    pub checkpoint_time: DateTime<Utc>,
}

/// Identity of one replicated entity: kind plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub key: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

/// One upsert belonging to a manifest.
///
/// The entity payload is an opaque serialized document as produced by the
/// exporter; the target store is responsible for decoding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Entity kind, resolved through the classifier at replay time.
    pub kind: String,
    /// Serialized entity bytes.
    pub entity: Vec<u8>,
}

/// The replicated record of one source-store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Commit time of the original transaction. The single source of truth
    /// for cross-manifest application order.
    pub commit_time: DateTime<Utc>,
    /// Upserts, in original transaction order.
    pub mutations: Vec<Mutation>,
    /// Keys deleted by the transaction.
    pub deleted_keys: Vec<EntityKey>,
}

impl Manifest {
    /// Create an empty manifest at the given commit time.
    pub fn new(commit_time: DateTime<Utc>) -> Self {
        Self {
            commit_time,
            mutations: Vec::new(),
            deleted_keys: Vec::new(),
        }
    }

    /// Total operation count (mutations + deletions).
    pub fn op_count(&self) -> usize {
        self.mutations.len() + self.deleted_keys.len()
    }
}

/// One operation against the target store, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Upsert a serialized entity.
    Upsert { kind: String, entity: Vec<u8> },
    /// Delete by key. Deleting an absent key is a no-op, not an error.
    Delete { kind: String, key: String },
}

impl Operation {
    /// The entity kind this operation touches.
    pub fn kind(&self) -> &str {
        match self {
            Operation::Upsert { kind, .. } => kind,
            Operation::Delete { kind, .. } => kind,
        }
    }
}

/// An immutable, time-ranged batch of manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    /// Lower bound (exclusive): the checkpoint time of the previous export
    /// cycle.
    pub lower_bound_exclusive: DateTime<Utc>,
    /// The checkpoint that produced this file; its time is the file's upper
    /// bound (inclusive) and its identity.
    pub checkpoint: Checkpoint,
    /// Manifests, strictly ascending by commit time.
    pub manifests: Vec<Manifest>,
}

impl DiffFile {
    /// Build a diff file, validating range and ordering.
    pub fn new(
        lower_bound_exclusive: DateTime<Utc>,
        checkpoint_time: DateTime<Utc>,
        manifests: Vec<Manifest>,
    ) -> Result<Self> {
        let file = Self {
            lower_bound_exclusive,
            checkpoint: Checkpoint { checkpoint_time },
            manifests,
        };
        file.validate()?;
        Ok(file)
    }

    /// Lower bound of the covered range (exclusive).
    pub fn lower_bound(&self) -> DateTime<Utc> {
        self.lower_bound_exclusive
    }

    /// Upper bound of the covered range (inclusive); the file's identity.
    pub fn upper_bound(&self) -> DateTime<Utc> {
        self.checkpoint.checkpoint_time
    }

    /// Whether this file's range intersects the window `(lower, upper]`.
    pub fn intersects(&self, lower: DateTime<Utc>, upper: DateTime<Utc>) -> bool {
        self.upper_bound() > lower && self.lower_bound() < upper
    }

    /// Canonical blob name for this file.
    pub fn blob_name(&self) -> String {
        format!(
            "{}{}",
            DIFF_FILE_PREFIX,
            self.upper_bound().timestamp_millis()
        )
    }

    /// Serialize to plain JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ReplayError::Decode(e.to_string()))
    }

    /// Serialize to zstd-compressed JSON bytes.
    pub fn to_bytes_compressed(&self) -> Result<Vec<u8>> {
        let plain = self.to_bytes()?;
        zstd::stream::encode_all(&plain[..], 0)
            .map_err(|e| ReplayError::Decode(format!("zstd encode: {}", e)))
    }

    /// Decode from bytes, sniffing for zstd compression, and validate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let plain = if bytes.len() >= 4 && bytes[..4] == ZSTD_MAGIC {
            zstd::stream::decode_all(bytes)
                .map_err(|e| ReplayError::Decode(format!("zstd decode: {}", e)))?
        } else {
            bytes.to_vec()
        };

        let file: DiffFile = serde_json::from_slice(&plain)
            .map_err(|e| ReplayError::Decode(format!("diff file: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    /// Check range sanity and strict manifest ordering.
    fn validate(&self) -> Result<()> {
        if self.lower_bound() >= self.upper_bound() {
            return Err(ReplayError::Decode(format!(
                "diff file range is empty or inverted: ({}, {}]",
                self.lower_bound(),
                self.upper_bound()
            )));
        }

        let mut prev: Option<DateTime<Utc>> = None;
        for manifest in &self.manifests {
            let t = manifest.commit_time;
            if t <= self.lower_bound() || t > self.upper_bound() {
                return Err(ReplayError::Decode(format!(
                    "manifest at {} outside file range ({}, {}]",
                    t,
                    self.lower_bound(),
                    self.upper_bound()
                )));
            }
            if let Some(p) = prev {
                if t <= p {
                    return Err(ReplayError::Decode(format!(
                        "manifests out of order: {} follows {}",
                        t, p
                    )));
                }
            }
            prev = Some(t);
        }
        Ok(())
    }
}
