use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use serde::Serialize;

/// Counters for the process a resolver launched.
///
/// A fresh instance is created for every launch; hooks of an older process
/// keep their own instance, so late events never touch the newer counters.
#[derive(Debug, Default)]
pub(crate) struct ProcessState {
    end_of_life: AtomicBool,
    created_pages: AtomicU32,
    active_pages: AtomicI64,
    disposed: AtomicBool,
}

impl ProcessState {
    pub(crate) fn page_opened(&self) -> i64 {
        self.active_pages.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn page_closed(&self) -> i64 {
        self.active_pages.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn record_created(&self) -> u32 {
        self.created_pages.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns `true` when this call flipped the flag.
    pub(crate) fn mark_end_of_life(&self) -> bool {
        !self.end_of_life.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_end_of_life(&self) -> bool {
        self.end_of_life.load(Ordering::SeqCst)
    }

    pub(crate) fn active_pages(&self) -> i64 {
        self.active_pages.load(Ordering::SeqCst)
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> ResolverState {
        ResolverState {
            end_of_life: self.is_end_of_life(),
            created_page_count: self.created_pages.load(Ordering::SeqCst),
            active_page_count: self.active_pages(),
        }
    }
}

/// Point-in-time view of a resolver's current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolverState {
    pub end_of_life: bool,
    pub created_page_count: u32,
    pub active_page_count: i64,
}
