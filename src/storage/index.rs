//! Bounded selection over a lazy photo enumeration.
//!
//! Directory scans are streamed; only as many names as the caller asked for
//! are ever held in memory, so there is no cap on how many files the card may
//! contain.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::PhotoName;

/// The `limit` lowest-sequence photos, ascending.
pub fn oldest(photos: impl Iterator<Item = PhotoName>, limit: usize) -> Vec<PhotoName> {
    if limit == 0 {
        return Vec::new();
    }
    let mut heap = BinaryHeap::with_capacity(limit + 1);
    for photo in photos {
        heap.push(photo);
        if heap.len() > limit {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
}

/// Count and newest photo in one pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhotoSummary {
    pub count: u64,
    pub newest: Option<PhotoName>,
}

pub fn summarize(photos: impl Iterator<Item = PhotoName>) -> PhotoSummary {
    photos.fold(PhotoSummary::default(), |acc, photo| PhotoSummary {
        count: acc.count + 1,
        newest: acc.newest.max(Some(photo)),
    })
}

/// One page of the gallery, newest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhotoPage {
    pub photos: Vec<String>,
    pub page: usize,
    pub per_page: usize,
    pub total: u64,
    pub has_more: bool,
}

/// Page `page` (zero-based) of `per_page` photos, newest first.
pub fn newest_page(photos: impl Iterator<Item = PhotoName>, page: usize, per_page: usize) -> PhotoPage {
    let skip = page.saturating_mul(per_page);
    let keep = skip.saturating_add(per_page);
    let mut heap: BinaryHeap<Reverse<PhotoName>> = BinaryHeap::new();
    let mut total = 0u64;
    for photo in photos {
        total += 1;
        if keep == 0 {
            continue;
        }
        heap.push(Reverse(photo));
        if heap.len() > keep {
            heap.pop();
        }
    }

    // Sorted ascending by Reverse, i.e. newest first.
    let photos: Vec<String> = heap
        .into_sorted_vec()
        .into_iter()
        .skip(skip)
        .map(|Reverse(photo)| photo.file_name())
        .collect();
    let shown = (skip + photos.len()) as u64;
    PhotoPage {
        photos,
        page,
        per_page,
        total,
        has_more: shown < total,
    }
}
