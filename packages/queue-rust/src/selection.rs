//! Pending-operation selection policies.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SelectionPolicy;

/// Picks the next item to dispatch from the pending collection.
#[derive(Debug)]
pub(crate) enum Selector {
    Fifo,
    Random(StdRng),
}

impl Selector {
    pub(crate) fn new(policy: SelectionPolicy, seed: Option<u64>) -> Self {
        match policy {
            SelectionPolicy::Fifo => Self::Fifo,
            SelectionPolicy::Random => Self::Random(match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            }),
        }
    }

    /// Removes and returns the next item, or `None` when `pending` is empty.
    pub(crate) fn select<T>(&mut self, pending: &mut VecDeque<T>) -> Option<T> {
        match self {
            Self::Fifo => pending.pop_front(),
            Self::Random(rng) => {
                if pending.is_empty() {
                    return None;
                }
                let index = rng.random_range(0..pending.len());
                pending.remove(index)
            }
        }
    }
}
