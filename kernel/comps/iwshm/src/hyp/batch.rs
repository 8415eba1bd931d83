// SPDX-License-Identifier: MPL-2.0

//! Splitting page lists into chunks and chunks into batches.
//!
//! Packing happens on two levels. Chunking merges physically contiguous
//! pages so that each scatter-list entry covers as much memory as possible.
//! Batching then bounds the number of entries and the amount of memory
//! handed to a single hypervisor call.

use core::ops::Range;

use crate::prelude::*;

/// A run of physically contiguous pages within a page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// The index of the first page in the page list.
    pub start: usize,
    pub nr_pages: usize,
}

impl Chunk {
    /// Returns the size of the chunk in bytes.
    pub const fn size(&self) -> usize {
        self.nr_pages * PAGE_SIZE
    }

    /// Returns the range of the chunk within the page list.
    pub const fn pages(&self) -> Range<usize> {
        self.start..self.start + self.nr_pages
    }
}

/// Splits `pages` into chunks.
///
/// A new chunk starts whenever physical contiguity breaks or the running
/// chunk reaches `max_chunk_size` bytes. The chunks cover `pages` in order,
/// without gaps or overlaps.
pub fn split_chunks(pages: &[Paddr], max_chunk_size: usize) -> Vec<Chunk> {
    let max_chunk_pages = (max_chunk_size / PAGE_SIZE).max(1);
    let mut chunks: Vec<Chunk> = Vec::new();

    for (idx, paddr) in pages.iter().enumerate() {
        if let Some(last) = chunks.last_mut() {
            let prev = pages[idx - 1];
            if prev.checked_add(PAGE_SIZE) == Some(*paddr) && last.nr_pages < max_chunk_pages {
                last.nr_pages += 1;
                continue;
            }
        }
        chunks.push(Chunk {
            start: idx,
            nr_pages: 1,
        });
    }

    chunks
}

/// Groups consecutive chunks into batches.
///
/// Chunks are packed greedily. A batch holds at most `max_chunks` chunks and
/// at most `max_size` bytes. Each returned range indexes into `chunks`.
///
/// A single chunk larger than `max_size` still forms a batch of its own;
/// callers keep chunks below the batch size.
pub fn group_batches(chunks: &[Chunk], max_chunks: usize, max_size: usize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut size = 0;

    for (idx, chunk) in chunks.iter().enumerate() {
        let nr_chunks = idx - start;
        if nr_chunks > 0 && (nr_chunks >= max_chunks || size + chunk.size() > max_size) {
            batches.push(start..idx);
            start = idx;
            size = 0;
        }
        size += chunk.size();
    }
    if start < chunks.len() {
        batches.push(start..chunks.len());
    }

    batches
}
