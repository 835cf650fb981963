//! Readdir cursor manager (C5). Kernel readdir is a sequence of
//! `(dir, size, offset)` calls; since directories mutate between calls,
//! a session takes a stable snapshot of the children on its first call
//! and iterates that snapshot thereafter.

use crate::inode::DirEntry;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

/// Default cap on entries returned per call, matching the
/// implementation-defined ceiling the design notes call out.
pub const DEFAULT_MAX_ENTRIES: usize = 255;

struct Session {
    children: Vec<DirEntry>,
    position: usize,
}

pub struct ReaddirManager {
    sessions: Mutex<HashMap<u16, Session>>,
    pending_gc: Mutex<Vec<u16>>,
}

impl ReaddirManager {
    pub fn new() -> ReaddirManager {
        ReaddirManager {
            sessions: Mutex::new(HashMap::new()),
            pending_gc: Mutex::new(Vec::new()),
        }
    }

    fn sweep(&self) {
        let mut pending = self.pending_gc.lock();
        if pending.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock();
        for key in pending.drain(..) {
            sessions.remove(&key);
        }
    }

    /// Reads the next batch for a readdir session. `offset == 0` starts a
    /// fresh session, taking `snapshot()` as the stable view. `is_live`
    /// filters out entries whose target has since been destroyed. `fits`
    /// is handed the session's cookie (so the caller can compute the right
    /// per-entry reply offset) alongside each candidate entry, and decides
    /// whether that entry can still be appended to the caller's reply
    /// buffer; the first entry it rejects is not consumed — the cursor
    /// backs up and stops, to be retried on the next call.
    ///
    /// Returns `(cookie, batch)`; an empty batch with the same cookie the
    /// caller passed in (when non-zero and unknown) signals a missing
    /// session, which the façade reports as an empty reply rather than an
    /// error, per the cursor manager's interface contract.
    pub fn read(
        &self,
        offset: u64,
        snapshot: impl FnOnce() -> Vec<DirEntry>,
        is_live: &dyn Fn(u64) -> bool,
        mut fits: impl FnMut(u64, &DirEntry) -> bool,
        max_entries: usize,
    ) -> (u64, Vec<DirEntry>) {
        self.sweep();
        let mut sessions = self.sessions.lock();

        let key = if offset == 0 {
            let mut rng = rand::rng();
            loop {
                let candidate: u16 = rng.random();
                if candidate != 0 && !sessions.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            ((offset >> 16) & 0xFFFF) as u16
        };

        if offset == 0 {
            sessions.insert(
                key,
                Session {
                    children: snapshot(),
                    position: 0,
                },
            );
        }

        let cookie = (key as u64) << 16;
        let Some(session) = sessions.get_mut(&key) else {
            return (cookie, Vec::new());
        };

        let mut batch = Vec::new();
        while session.position < session.children.len() && batch.len() < max_entries {
            let entry = &session.children[session.position];
            if !is_live(entry.ino) {
                session.position += 1;
                continue;
            }
            if !fits(cookie, entry) {
                break;
            }
            batch.push(entry.clone());
            session.position += 1;
        }

        if session.position >= session.children.len() {
            self.pending_gc.lock().push(key);
        }

        (cookie, batch)
    }
}

impl Default for ReaddirManager {
    fn default() -> ReaddirManager {
        ReaddirManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn children(n: usize) -> Vec<DirEntry> {
        (0..n).map(|i| DirEntry::new(format!("e{i}"), i as u64 + 10)).collect()
    }

    #[test]
    fn first_call_starts_a_session_and_returns_entries() {
        let mgr = ReaddirManager::new();
        let (cookie, batch) = mgr.read(0, || children(3), &|_| true, |_, _| true, 255);
        assert_ne!(cookie, 0);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn resuming_with_the_cookie_continues_the_same_session() {
        let mgr = ReaddirManager::new();
        let (cookie, first) = mgr.read(0, || children(5), &|_| true, |_, _| true, 2);
        assert_eq!(first.len(), 2);
        let (cookie2, second) = mgr.read(cookie, || panic!("must not resnapshot"), &|_| true, |_, _| true, 2);
        assert_eq!(cookie2, cookie);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].name, "e2");
    }

    #[test]
    fn dead_entries_are_filtered_without_stopping_the_cursor() {
        let mgr = ReaddirManager::new();
        let (_cookie, batch) = mgr.read(
            0,
            || children(4),
            &|ino| ino % 2 == 0, // only even inos (10, 12) are "live"
            |_, _| true,
            255,
        );
        let names: Vec<_> = batch.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["e0", "e2"]);
    }

    #[test]
    fn fits_false_stops_without_consuming_that_entry() {
        let mgr = ReaddirManager::new();
        let mut allowed = 1;
        let (cookie, batch) = mgr.read(
            0,
            || children(3),
            &|_| true,
            |_cookie, _entry| {
                if allowed == 0 {
                    return false;
                }
                allowed -= 1;
                true
            },
            255,
        );
        assert_eq!(batch.len(), 1);
        let (_cookie2, rest) = mgr.read(cookie, || panic!("no resnapshot"), &|_| true, |_, _| true, 255);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].name, "e1");
    }

    #[test]
    fn unknown_session_key_yields_empty_batch() {
        let mgr = ReaddirManager::new();
        let bogus_cookie = 0xABCDu64 << 16;
        let (cookie, batch) = mgr.read(bogus_cookie, || children(2), &|_| true, |_, _| true, 255);
        assert_eq!(cookie, bogus_cookie);
        assert!(batch.is_empty());
    }

    #[test]
    fn fits_is_handed_the_session_cookie_before_it_is_returned() {
        let mgr = ReaddirManager::new();
        let mut seen_cookie = None;
        let (cookie, batch) = mgr.read(
            0,
            || children(1),
            &|_| true,
            |c, _entry| {
                seen_cookie = Some(c);
                true
            },
            255,
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(seen_cookie, Some(cookie));
    }
}
