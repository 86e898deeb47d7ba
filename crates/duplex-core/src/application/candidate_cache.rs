//! Buffer for remote ICE candidates that arrive before the peer connection
//! can take them.

use std::collections::VecDeque;

use crate::domain::peer::IceCandidate;

#[derive(Debug, Default)]
pub struct IceCandidateCache {
    candidates: VecDeque<IceCandidate>,
}

impl IceCandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, candidate: IceCandidate) {
        self.candidates.push_back(candidate);
    }

    /// Oldest buffered candidate (arrival order).
    pub fn pop_next(&mut self) -> Option<IceCandidate> {
        self.candidates.pop_front()
    }

    /// Most recently buffered candidate.
    pub fn pop_last(&mut self) -> Option<IceCandidate> {
        self.candidates.pop_back()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: i32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mline_index: n,
            sdp_mid: None,
        }
    }

    #[test]
    fn pops_from_both_ends() {
        let mut cache = IceCandidateCache::new();
        for n in 0..3 {
            cache.store(candidate(n));
        }
        assert_eq!(cache.pop_next(), Some(candidate(0)));
        assert_eq!(cache.pop_last(), Some(candidate(2)));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.pop_next(), None);
    }
}
