//! Immutable chains of headers and navigation between them

use crate::core::chain_builder::ChainBuilder;
use crate::core::chained_header::ChainedHeader;
use crate::crypto::Hash256;
use num_bigint::BigUint;
use std::iter::FusedIterator;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Chain structure errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("A chain needs at least a genesis header")]
    Empty,
    #[error("Header {hash} at height {height} does not extend tip {tip}")]
    NotExtendingTip {
        hash: Hash256,
        height: u32,
        tip: Hash256,
    },
    #[error("Cannot remove the genesis header")]
    RemoveGenesis,
    #[error("Chains do not share a genesis header")]
    NoCommonAncestor,
    #[error("Unknown header {0}")]
    UnknownHeader(Hash256),
    #[error("Navigation cancelled")]
    Cancelled,
}

/// An ordered, immutable sequence of headers from genesis to a tip.
///
/// `chain[i].height == i` and every header's previous hash is the hash of the
/// header before it. Clones share storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    headers: Arc<Vec<ChainedHeader>>,
}

impl Chain {
    pub fn new(headers: Vec<ChainedHeader>) -> Result<Self, ChainError> {
        let first = headers.first().ok_or(ChainError::Empty)?;
        if first.height != 0 {
            return Err(ChainError::NotExtendingTip {
                hash: first.hash,
                height: first.height,
                tip: Hash256::ZERO,
            });
        }
        for pair in headers.windows(2) {
            if pair[1].previous_hash() != pair[0].hash || pair[1].height != pair[0].height + 1 {
                return Err(ChainError::NotExtendingTip {
                    hash: pair[1].hash,
                    height: pair[1].height,
                    tip: pair[0].hash,
                });
            }
        }
        Ok(Self {
            headers: Arc::new(headers),
        })
    }

    pub fn genesis(header: ChainedHeader) -> Self {
        Self {
            headers: Arc::new(vec![header]),
        }
    }

    pub(crate) fn from_checked(headers: Vec<ChainedHeader>) -> Self {
        Self {
            headers: Arc::new(headers),
        }
    }

    /// Append `header` on top of the tip.
    ///
    /// Copies the headers only when another clone still shares them.
    pub fn push(&mut self, header: ChainedHeader) -> Result<(), ChainError> {
        let tip = self.tip();
        if header.previous_hash() != tip.hash || header.height != tip.height + 1 {
            return Err(ChainError::NotExtendingTip {
                hash: header.hash,
                height: header.height,
                tip: tip.hash,
            });
        }
        Arc::make_mut(&mut self.headers).push(header);
        Ok(())
    }

    pub fn genesis_header(&self) -> &ChainedHeader {
        &self.headers[0]
    }

    pub fn tip(&self) -> &ChainedHeader {
        &self.headers[self.headers.len() - 1]
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn total_work(&self) -> &BigUint {
        &self.tip().total_work
    }

    pub fn get(&self, height: u32) -> Option<&ChainedHeader> {
        self.headers.get(height as usize)
    }

    pub fn headers(&self) -> &[ChainedHeader] {
        &self.headers
    }

    /// Whether `header` sits at its height in this chain
    pub fn contains(&self, header: &ChainedHeader) -> bool {
        self.get(header.height)
            .is_some_and(|ours| ours.hash == header.hash)
    }

    pub fn contains_hash(&self, hash: &Hash256) -> bool {
        self.headers.iter().rev().any(|header| header.hash == *hash)
    }

    /// Last header shared with `other`
    pub fn find_fork_point<'a>(&'a self, other: &Chain) -> Result<&'a ChainedHeader, ChainError> {
        let mut height = self.height().min(other.height());
        loop {
            match (self.get(height), other.get(height)) {
                (Some(ours), Some(theirs)) if ours.hash == theirs.hash => return Ok(ours),
                _ if height == 0 => return Err(ChainError::NoCommonAncestor),
                _ => height -= 1,
            }
        }
    }

    /// Whether `candidate` should replace `self` as the best chain.
    ///
    /// Requires strictly more work, so on a tie the chain seen first stays.
    pub fn is_better_chain(&self, candidate: &Chain) -> bool {
        candidate.total_work() > self.total_work()
    }

    /// Steps that walk this chain towards whatever `target` returns.
    ///
    /// `target` is asked again before every step, so the walk follows a
    /// best chain that changes underneath it.
    pub fn navigate_towards<F>(&self, target: F) -> NavigateTowards<F>
    where
        F: FnMut() -> Option<Chain>,
    {
        NavigateTowards {
            current: ChainBuilder::from_chain(self),
            target,
            cancel: None,
            done: false,
        }
    }
}

// =============================================================================
// Navigation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pop the header off the current chain
    Rewind,
    /// Push the header onto the current chain
    Advance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationStep {
    pub direction: Direction,
    pub header: ChainedHeader,
}

/// Iterator produced by [`Chain::navigate_towards`]
pub struct NavigateTowards<F> {
    current: ChainBuilder,
    target: F,
    cancel: Option<CancellationToken>,
    /// Set once the walk ends or fails; later calls yield nothing
    done: bool,
}

impl<F> NavigateTowards<F>
where
    F: FnMut() -> Option<Chain>,
{
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The chain as it stands after the steps yielded so far
    pub fn current(&self) -> &ChainBuilder {
        &self.current
    }

    fn next_step(&mut self, target: &Chain) -> Result<Option<NavigationStep>, ChainError> {
        let tip = self.current.tip().clone();

        if target.contains(&tip) {
            let Some(next) = target.get(tip.height + 1) else {
                return Ok(None);
            };
            let next = next.clone();
            self.current.add_block(next.clone())?;
            return Ok(Some(NavigationStep {
                direction: Direction::Advance,
                header: next,
            }));
        }

        if target.genesis_header().hash != self.current.genesis_header().hash {
            return Err(ChainError::NoCommonAncestor);
        }

        let removed = self.current.remove_block()?;
        Ok(Some(NavigationStep {
            direction: Direction::Rewind,
            header: removed,
        }))
    }
}

impl<F> Iterator for NavigateTowards<F>
where
    F: FnMut() -> Option<Chain>,
{
    type Item = Result<NavigationStep, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            self.done = true;
            return Some(Err(ChainError::Cancelled));
        }
        let step = match (self.target)() {
            Some(target) => self.next_step(&target).transpose(),
            None => None,
        };
        if !matches!(step, Some(Ok(_))) {
            self.done = true;
        }
        step
    }
}

impl<F> FusedIterator for NavigateTowards<F> where F: FnMut() -> Option<Chain> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockHeader;
    use chrono::Utc;

    fn extend(builder: &mut ChainBuilder, count: usize, salt: u32) {
        for _ in 0..count {
            let tip = builder.tip().clone();
            let header = BlockHeader {
                version: 1,
                previous_hash: tip.hash,
                merkle_root: Hash256::ZERO,
                time: tip.header.time + 600,
                bits: 0x207fffff,
                nonce: salt,
            };
            builder
                .add_block(ChainedHeader::from_parent(&tip, header, Utc::now()))
                .unwrap();
        }
    }

    fn genesis() -> ChainedHeader {
        let header = BlockHeader {
            version: 1,
            previous_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        };
        ChainedHeader::genesis(&header, Utc::now())
    }

    fn fork(base_len: usize, a_len: usize, b_len: usize) -> (Chain, Chain) {
        let mut base = ChainBuilder::new(genesis());
        extend(&mut base, base_len, 0);
        let mut a = base.clone();
        extend(&mut a, a_len, 1);
        let mut b = base;
        extend(&mut b, b_len, 2);
        (a.to_immutable(), b.to_immutable())
    }

    #[test]
    fn test_new_rejects_broken_link() {
        let (a, b) = fork(1, 1, 1);
        let headers = vec![a.headers()[0].clone(), a.headers()[1].clone(), b.headers()[2].clone()];
        assert!(Chain::new(headers.clone()).is_ok());

        let broken = vec![a.headers()[0].clone(), b.headers()[2].clone()];
        assert!(matches!(
            Chain::new(broken),
            Err(ChainError::NotExtendingTip { .. })
        ));
        assert_eq!(Chain::new(vec![]), Err(ChainError::Empty));
    }

    #[test]
    fn test_find_fork_point() {
        let (a, b) = fork(3, 2, 5);
        let fork_point = a.find_fork_point(&b).unwrap();
        assert_eq!(fork_point.height, 3);
        assert_eq!(b.find_fork_point(&a).unwrap().hash, fork_point.hash);
        assert_eq!(a.find_fork_point(&a).unwrap().hash, a.tip().hash);
    }

    #[test]
    fn test_navigation_step_counts() {
        let (a, b) = fork(4, 3, 6);
        let target = b.clone();
        let steps: Vec<NavigationStep> = a
            .navigate_towards(|| Some(target.clone()))
            .collect::<Result<_, _>>()
            .unwrap();

        let rewinds = steps
            .iter()
            .take_while(|s| s.direction == Direction::Rewind)
            .count();
        assert_eq!(rewinds, 3);
        assert_eq!(steps.len() - rewinds, 6);
        assert!(steps[rewinds..]
            .iter()
            .all(|s| s.direction == Direction::Advance));

        // Rewinds walk down from the tip, advances walk up the target
        assert_eq!(steps[0].header.hash, a.tip().hash);
        assert_eq!(steps.last().unwrap().header.hash, b.tip().hash);
    }

    #[test]
    fn test_navigation_follows_moving_target() {
        let (a, b) = fork(2, 2, 2);
        let mut calls = 0;
        let mut nav = a.navigate_towards(|| {
            calls += 1;
            // Target switches back to `a` after two steps
            Some(if calls <= 2 { b.clone() } else { a.clone() })
        });

        let first = nav.next().unwrap().unwrap();
        let second = nav.next().unwrap().unwrap();
        assert_eq!(first.direction, Direction::Rewind);
        assert_eq!(second.direction, Direction::Rewind);

        let rest: Vec<NavigationStep> = nav.collect::<Result<_, _>>().unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|s| s.direction == Direction::Advance));
        assert_eq!(rest[1].header.hash, a.tip().hash);
    }

    #[test]
    fn test_navigation_cancelled() {
        let (a, b) = fork(1, 1, 1);
        let token = CancellationToken::new();
        token.cancel();
        let mut nav = a
            .navigate_towards(|| Some(b.clone()))
            .with_cancellation(token);
        assert_eq!(nav.next(), Some(Err(ChainError::Cancelled)));
        assert_eq!(nav.next(), None);
        assert_eq!(nav.next(), None);
    }

    #[test]
    fn test_navigation_stops_after_error() {
        let (a, _) = fork(1, 1, 1);
        let other = ChainBuilder::new(ChainedHeader::genesis(
            &BlockHeader {
                version: 1,
                previous_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 1_700_000_000,
                bits: 0x207fffff,
                nonce: 9,
            },
            Utc::now(),
        ))
        .to_immutable();

        let mut calls = 0;
        let mut nav = a.navigate_towards(|| {
            calls += 1;
            Some(other.clone())
        });
        assert_eq!(nav.next(), Some(Err(ChainError::NoCommonAncestor)));
        assert_eq!(nav.next(), None);
        drop(nav);
        // The target is not consulted again once the walk failed
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_push_extends_shared_chain() {
        let (a, b) = fork(2, 1, 1);
        let shared = a.clone();
        let mut grown = Chain::new(a.headers()[..3].to_vec()).unwrap();
        grown.push(a.tip().clone()).unwrap();
        assert_eq!(grown, shared);

        let mut copy = shared.clone();
        assert!(matches!(
            copy.push(b.tip().clone()),
            Err(ChainError::NotExtendingTip { .. })
        ));
        // A failed push leaves both clones untouched
        assert_eq!(copy, a);
    }

    #[test]
    fn test_better_chain_requires_more_work() {
        let (a, b) = fork(1, 2, 2);
        assert!(!a.is_better_chain(&b));
        assert!(!b.is_better_chain(&a));

        let (short, long) = fork(1, 1, 2);
        assert!(short.is_better_chain(&long));
    }
}
