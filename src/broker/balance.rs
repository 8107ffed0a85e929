//! Load-balancing strategies used to pick a broker connection.
//!
//! A strategy sees only the weights of the live candidates, in pool order,
//! and returns the index of the chosen one.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::Deserialize;

pub trait LoadBalance: Send + Sync + Debug {
    /// Pick one of `weights.len()` candidates. `None` only for an empty set.
    fn select(&self, weights: &[u32], key: Option<&str>) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceKind {
    RoundRobin,
    #[default]
    WeightRoundRobin,
    Random,
    WeightRandom,
    ConsistentHash,
}

impl LoadBalanceKind {
    pub fn build(self) -> Arc<dyn LoadBalance> {
        match self {
            LoadBalanceKind::RoundRobin => Arc::new(RoundRobin::default()),
            LoadBalanceKind::WeightRoundRobin => Arc::new(WeightRoundRobin::default()),
            LoadBalanceKind::Random => Arc::new(RandomChoice),
            LoadBalanceKind::WeightRandom => Arc::new(WeightRandom),
            LoadBalanceKind::ConsistentHash => Arc::new(ConsistentHash),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "weight_round_robin" => Some(Self::WeightRoundRobin),
            "random" => Some(Self::Random),
            "weight_random" => Some(Self::WeightRandom),
            "consistent_hash" => Some(Self::ConsistentHash),
            _ => None,
        }
    }
}

/// Effective weight: zero weights still get picked, just rarely.
fn weight_of(w: u32) -> u64 {
    u64::from(w.max(1))
}

/// Walk the cumulative weights and return the slot covering `point`.
fn slot_for(weights: &[u32], point: u64) -> usize {
    let mut acc = 0u64;
    for (i, w) in weights.iter().enumerate() {
        acc += weight_of(*w);
        if point < acc {
            return i;
        }
    }
    weights.len() - 1
}

fn total_weight(weights: &[u32]) -> u64 {
    weights.iter().map(|w| weight_of(*w)).sum()
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalance for RoundRobin {
    fn select(&self, weights: &[u32], _key: Option<&str>) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % weights.len())
    }
}

/// Round robin over the weight-expanded sequence: a weight-3 candidate is
/// chosen three times per cycle.
#[derive(Debug, Default)]
pub struct WeightRoundRobin {
    next: AtomicUsize,
}

impl LoadBalance for WeightRoundRobin {
    fn select(&self, weights: &[u32], _key: Option<&str>) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let total = total_weight(weights);
        let tick = self.next.fetch_add(1, Ordering::Relaxed) as u64;
        Some(slot_for(weights, tick % total))
    }
}

#[derive(Debug, Default)]
pub struct RandomChoice;

impl LoadBalance for RandomChoice {
    fn select(&self, weights: &[u32], _key: Option<&str>) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..weights.len()))
    }
}

#[derive(Debug, Default)]
pub struct WeightRandom;

impl LoadBalance for WeightRandom {
    fn select(&self, weights: &[u32], _key: Option<&str>) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let point = rand::thread_rng().gen_range(0..total_weight(weights));
        Some(slot_for(weights, point))
    }
}

/// Deterministic: the same key over the same weights always lands on the
/// same candidate. Keyless selections hash the empty key.
#[derive(Debug, Default)]
pub struct ConsistentHash;

impl ConsistentHash {
    /// 64-bit FNV-1a; stable across processes, unlike `DefaultHasher`.
    fn hash(key: &str) -> u64 {
        key.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }
}

impl LoadBalance for ConsistentHash {
    fn select(&self, weights: &[u32], key: Option<&str>) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let point = Self::hash(key.unwrap_or_default()) % total_weight(weights);
        Some(slot_for(weights, point))
    }
}
