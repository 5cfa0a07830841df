//! Lane allocation for process chains
//!
//! Each live process occupies one numbered lane (rendered as a `tid` in the
//! trace). A child started while its parent is the current occupant of a lane
//! stacks onto that lane, so an unbroken parent → child → grandchild chain
//! stays on one track. When the child leaves, the parent is the occupant
//! again. Siblings fork onto the first empty lane, or a new one.
//!
//! ```text
//! lane 0: [42] → [42, 420] → [42] → []
//! lane 1:        [421]     → []
//! ```
//!
//! The lane count is bounded by the number of concurrently live chains, not by
//! the number of processes seen over the run.

use std::sync::{Mutex, PoisonError};

/// Assigns and reclaims lane numbers for tracked processes
///
/// # Example
///
/// ```
/// use forktrail::lanes::LaneAllocator;
///
/// let lanes = LaneAllocator::new();
/// assert_eq!(lanes.add_child(42, 0), 0);
/// assert_eq!(lanes.add_child(420, 42), 0); // chain continues on lane 0
/// assert_eq!(lanes.add_child(421, 42), 1); // sibling forks to lane 1
/// assert_eq!(lanes.remove_child(421), Some(1));
/// assert_eq!(lanes.remove_child(420), Some(0));
/// assert_eq!(lanes.remove_child(42), Some(0)); // parent kept its lane
/// ```
#[derive(Debug, Default)]
pub struct LaneAllocator {
    /// Per lane, the live members of its chain; the last one is the occupant
    slots: Mutex<Vec<Vec<i32>>>,
}

impl LaneAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `child` on its parent's lane if the parent is the current
    /// occupant of one, otherwise on the lowest empty lane, otherwise on a
    /// new lane.
    pub fn add_child(&self, child: i32, parent: i32) -> i32 {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        let lane = match slots.iter().position(|chain| chain.last() == Some(&parent)) {
            Some(lane) => lane,
            None => match slots.iter().position(Vec::is_empty) {
                Some(free) => free,
                None => {
                    slots.push(Vec::new());
                    slots.len() - 1
                }
            },
        };

        slots[lane].push(child);
        lane as i32
    }

    /// Take `child` off its lane; `None` if it holds no lane
    ///
    /// The lane stays occupied while other members of its chain are live.
    pub fn remove_child(&self, child: i32) -> Option<i32> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        for (lane, chain) in slots.iter_mut().enumerate() {
            if let Some(at) = chain.iter().rposition(|pid| *pid == child) {
                chain.remove(at);
                return Some(lane as i32);
            }
        }
        None
    }

    /// Release every lane
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .for_each(Vec::clear);
    }

    /// Number of lanes currently occupied
    pub fn occupied(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|chain| !chain.is_empty())
            .count()
    }

    /// Number of lanes ever created
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
