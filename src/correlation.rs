//! Correlation of inbound responses with in-flight requests.
//!
//! `HeldRequests` maps an Initiator Task Tag to the tracked PDU awaiting its
//! response. The transmit engine inserts a request before writing it to the
//! transport so a fast response can never race ahead of the bookkeeping; the
//! receive engine removes it when the final response arrives.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, mapref::one::MappedRefMut};

use crate::pdu::{Location, Pdu, PduId};

/// A held request and the point at which it was admitted.
#[derive(Debug)]
pub struct Held {
    admitted: u64,
    pdu: Pdu,
}

/// Concurrent table of in-flight requests keyed by ITT.
#[derive(Debug, Default)]
pub struct HeldRequests {
    entries: DashMap<u32, Held>,
    admissions: AtomicU64,
}

impl HeldRequests {
    /// Hold `pdu` under its ITT, returning any request it displaced.
    pub fn insert(&self, mut pdu: Pdu) -> Option<Pdu> {
        pdu.set_location(Location::Held);
        let admitted = self.admissions.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(pdu.itt(), Held { admitted, pdu })
            .map(|held| detach(held.pdu))
    }

    /// Release the request for `itt`.
    pub fn remove(&self, itt: u32) -> Option<Pdu> {
        self.entries.remove(&itt).map(|(_, held)| detach(held.pdu))
    }

    /// Borrow the request for `itt` mutably, e.g. to append Data-In.
    ///
    /// The returned guard locks one shard; drop it before awaiting.
    pub fn get_mut(&self, itt: u32) -> Option<MappedRefMut<'_, u32, Held, Pdu>> {
        self.entries.get_mut(&itt).map(|entry| entry.map(|held| &mut held.pdu))
    }

    /// Whether a request is held for `itt`.
    #[must_use]
    pub fn contains(&self, itt: u32) -> bool { self.entries.contains_key(&itt) }

    /// Remove every held request in the order it was admitted.
    ///
    /// ITT values wrap and may span any distance, so the order comes from a
    /// 64-bit admission count rather than from the tags themselves.
    pub fn drain(&self) -> Vec<Pdu> {
        let keys: Vec<u32> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut held: Vec<Held> = keys
            .into_iter()
            .filter_map(|itt| self.entries.remove(&itt).map(|(_, held)| held))
            .collect();
        held.sort_unstable_by_key(|held| held.admitted);
        held.into_iter().map(|held| detach(held.pdu)).collect()
    }

    /// List every held PDU with its location tag.
    #[must_use]
    pub fn census(&self) -> Vec<(PduId, Location)> {
        self.entries
            .iter()
            .map(|entry| (entry.pdu.id(), entry.pdu.location()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

fn detach(mut pdu: Pdu) -> Pdu {
    pdu.set_location(Location::Detached);
    pdu
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::pdu::{Bhs, Opcode};

    fn request(itt: u32) -> Pdu {
        let mut header = Bhs::new(Opcode::ScsiCommand);
        header.set_itt(itt);
        Pdu::new(header)
    }

    #[test]
    fn insert_marks_held_and_remove_detaches() {
        let held = HeldRequests::default();
        assert!(held.insert(request(3)).is_none());
        assert_eq!(held.get_mut(3).map(|p| p.location()), Some(Location::Held));
        let pdu = held.remove(3).expect("held");
        assert_eq!(pdu.location(), Location::Detached);
        assert!(held.is_empty());
    }

    #[rstest]
    #[case::across_wrap(vec![u32::MAX - 2, u32::MAX - 1, 0, 1])]
    #[case::half_the_tag_space_apart(vec![0x7fff_fff0, 0xffff_fff8, 5, 0x8000_0000])]
    #[case::not_monotonic(vec![9, 3, 0x9000_0000, 4])]
    fn drain_follows_admission_order(#[case] itts: Vec<u32>) {
        let held = HeldRequests::default();
        for itt in &itts {
            held.insert(request(*itt));
        }
        let order: Vec<u32> = held.drain().iter().map(Pdu::itt).collect();
        assert_eq!(order, itts);
        assert!(held.is_empty());
    }

    #[test]
    fn displaced_request_is_detached() {
        let held = HeldRequests::default();
        held.insert(request(4));
        let displaced = held.insert(request(4)).expect("displaced");
        assert_eq!(displaced.location(), Location::Detached);
        assert_eq!(held.len(), 1);
    }
}
