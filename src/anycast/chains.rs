// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Latest-tick registry per priority + reliability class.
//!
//! Each value tick granted by the supplier records a backward link to the
//! previous value of the same class, forming the audit chain used for
//! recovery ordering. The chain is strictly decreasing and acyclic by
//! construction: a grant always links to a strictly smaller tick.

use crate::types::{Reliability, Tick};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct TickChains {
    latest: Mutex<FxHashMap<(Reliability, u8), Tick>>,
}

impl TickChains {
    pub fn new() -> Self {
        TickChains {
            latest: Mutex::new(FxHashMap::default()),
        }
    }

    /// Record `tick` as the latest value of its class and return the
    /// previous latest, which becomes the new value's backward link.
    /// Out-of-order grants (tick not above the latest) keep the registry
    /// unchanged and link to nothing.
    pub fn grant(&self, reliability: Reliability, priority: u8, tick: Tick) -> Option<Tick> {
        let mut latest = self.latest.lock();
        match latest.get(&(reliability, priority)).copied() {
            Some(previous) if previous >= tick => {
                tracing::warn!(%tick, %previous, "out-of-order grant; chain link skipped");
                None
            }
            previous => {
                latest.insert((reliability, priority), tick);
                previous
            }
        }
    }

    /// Re-seed a class from a restored value tick, keeping the highest.
    pub fn observe_restored(&self, reliability: Reliability, priority: u8, tick: Tick) {
        let mut latest = self.latest.lock();
        let entry = latest.entry((reliability, priority)).or_insert(tick);
        if *entry < tick {
            *entry = tick;
        }
    }

    pub fn latest(&self, reliability: Reliability, priority: u8) -> Option<Tick> {
        self.latest.lock().get(&(reliability, priority)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_are_strictly_decreasing() {
        let chains = TickChains::new();
        let class = (Reliability::AssuredPersistent, 4);
        assert_eq!(chains.grant(class.0, class.1, Tick(3)), None);
        assert_eq!(chains.grant(class.0, class.1, Tick(5)), Some(Tick(3)));
        assert_eq!(chains.grant(class.0, class.1, Tick(9)), Some(Tick(5)));
        // Walking backwards from 9: 9 -> 5 -> 3, no repeats.
    }

    #[test]
    fn classes_are_independent() {
        let chains = TickChains::new();
        chains.grant(Reliability::AssuredPersistent, 1, Tick(10));
        assert_eq!(chains.grant(Reliability::AssuredPersistent, 2, Tick(11)), None);
        assert_eq!(
            chains.latest(Reliability::AssuredPersistent, 1),
            Some(Tick(10))
        );
    }

    #[test]
    fn out_of_order_grant_does_not_regress() {
        let chains = TickChains::new();
        chains.grant(Reliability::ReliablePersistent, 0, Tick(8));
        assert_eq!(chains.grant(Reliability::ReliablePersistent, 0, Tick(6)), None);
        assert_eq!(
            chains.latest(Reliability::ReliablePersistent, 0),
            Some(Tick(8))
        );
    }

    #[test]
    fn restored_ticks_reseed_the_registry() {
        let chains = TickChains::new();
        chains.observe_restored(Reliability::AssuredPersistent, 3, Tick(20));
        chains.observe_restored(Reliability::AssuredPersistent, 3, Tick(15));
        assert_eq!(
            chains.grant(Reliability::AssuredPersistent, 3, Tick(21)),
            Some(Tick(20))
        );
    }
}
