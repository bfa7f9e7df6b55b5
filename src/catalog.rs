// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Diff-file catalog over object storage.
//!
//! Given a replay window `(lower, upper]`, the catalog produces the minimal
//! ordered sequence of diff files whose ranges cover the window exactly.
//!
//! # Listing Strategy
//!
//! Every blob in the bucket is fetched and parsed - filtering is by each
//! file's embedded time range, never by blob name, because the bucket may
//! contain unrelated objects. Blobs that do not parse as diff files are
//! skipped with a warning; if one of them *was* a needed diff file, the
//! tiling check below still catches the resulting gap.
//!
//! Fetches run on a bounded worker pool: the blobs are immutable and
//! read-only, so concurrent reads are safe, and listing is I/O-bound.
//!
//! # Tiling
//!
//! The surviving files, sorted by upper bound, must tile the window with no
//! gap and no overlap. Partial coverage is never silently accepted - a gap
//! means exported transactions are missing, and consuming around it would
//! silently drop them. Gaps and overlaps fail the run with
//! [`ReplayError::CatalogIncomplete`].

use crate::error::{ReplayError, Result};
use crate::manifest::DiffFile;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::{ObjectMeta, ObjectStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Catalog of exported diff files in one bucket.
pub struct DiffFileCatalog {
    store: Arc<dyn ObjectStore>,
    fetch_concurrency: usize,
}

impl DiffFileCatalog {
    /// Create a catalog over the given object store.
    pub fn new(store: Arc<dyn ObjectStore>, fetch_concurrency: usize) -> Self {
        Self {
            store,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// List the ordered diff files covering `(lower, upper]` exactly.
    ///
    /// Files wholly outside the window are ignored; a window that cannot be
    /// tiled exactly is a fatal [`ReplayError::CatalogIncomplete`].
    pub async fn list_files(
        &self,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<DiffFile>> {
        let metas: Vec<ObjectMeta> = self
            .store
            .list(None)
            .try_collect()
            .await
            .map_err(|e| ReplayError::blob("list", e))?;

        debug!(blobs = metas.len(), "Listed bucket");

        let fetched: Vec<Option<DiffFile>> = futures::stream::iter(metas)
            .map(|meta| {
                let store = Arc::clone(&self.store);
                async move { fetch_and_parse(store, meta).await }
            })
            .buffer_unordered(self.fetch_concurrency)
            .try_collect()
            .await?;

        let mut files: Vec<DiffFile> = fetched
            .into_iter()
            .flatten()
            .filter(|f| f.intersects(lower, upper))
            .collect();
        files.sort_by_key(|f| f.upper_bound());

        verify_tiling(&files, lower, upper)?;

        debug!(
            files = files.len(),
            window_start = %lower,
            window_end = %upper,
            "Catalog window complete"
        );
        Ok(files)
    }
}

/// Fetch one blob and try to parse it as a diff file.
///
/// I/O failures are retryable errors; parse failures mean "not a diff
/// file" and yield `None`.
async fn fetch_and_parse(
    store: Arc<dyn ObjectStore>,
    meta: ObjectMeta,
) -> Result<Option<DiffFile>> {
    let result = store
        .get(&meta.location)
        .await
        .map_err(|e| ReplayError::blob("get", e))?;
    let bytes = result
        .bytes()
        .await
        .map_err(|e| ReplayError::blob("get", e))?;

    match DiffFile::from_bytes(&bytes) {
        Ok(file) => Ok(Some(file)),
        Err(e) => {
            warn!(blob = %meta.location, error = %e, "Skipping blob that is not a diff file");
            Ok(None)
        }
    }
}

/// Verify that `files` (sorted by upper bound) tile `(lower, upper]` with
/// no gap and no overlap.
fn verify_tiling(files: &[DiffFile], lower: DateTime<Utc>, upper: DateTime<Utc>) -> Result<()> {
    let incomplete = |detail: String| ReplayError::CatalogIncomplete {
        window_start: lower,
        window_end: upper,
        detail,
    };

    let mut cursor = lower;
    for file in files {
        if file.lower_bound() > cursor {
            return Err(incomplete(format!(
                "gap between {} and {}",
                cursor,
                file.lower_bound()
            )));
        }
        if file.lower_bound() < cursor {
            return Err(incomplete(format!(
                "file ({}, {}] overlaps consumed range ending at {}",
                file.lower_bound(),
                file.upper_bound(),
                cursor
            )));
        }
        if file.upper_bound() > upper {
            return Err(incomplete(format!(
                "file ({}, {}] extends past the window end",
                file.lower_bound(),
                file.upper_bound()
            )));
        }
        cursor = file.upper_bound();
    }

    if cursor < upper {
        return Err(incomplete(format!("no coverage after {}", cursor)));
    }
    Ok(())
}
