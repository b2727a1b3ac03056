use serde::{Deserialize, Serialize};

use crate::ShortId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: ShortId,
    pub value: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    Greater,
    Lesser,
    ConcurrentGreater,
    ConcurrentLesser,
}

impl VectorOrdering {
    pub fn is_concurrent(&self) -> bool {
        matches!(
            self,
            VectorOrdering::ConcurrentGreater | VectorOrdering::ConcurrentLesser
        )
    }
}

/// Per-file causal history: one counter per device that ever changed the file.
/// The empty vector is strictly older than every non-empty one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counters: Vec<Counter>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self {
            counters: Vec::new(),
        }
    }

    pub fn from_counters(counters: Vec<Counter>) -> Self {
        let mut vector = Self::new();
        for counter in counters {
            vector.set(counter.id, counter.value);
        }
        vector
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn counter(&self, id: ShortId) -> u64 {
        self.counters
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.value)
            .unwrap_or(0)
    }

    /// True when `id` is the only device in the history, i.e. the file was
    /// created here and never touched elsewhere.
    pub fn is_single_origin(&self, id: ShortId) -> bool {
        self.counters.len() == 1 && self.counters[0].id == id
    }

    pub fn update(&mut self, id: ShortId) {
        let next = self.counter(id) + 1;
        self.set(id, next);
    }

    // Counters are kept sorted by id.
    fn set(&mut self, id: ShortId, value: u64) {
        match self.counters.binary_search_by(|c| c.id.cmp(&id)) {
            Ok(pos) => self.counters[pos].value = value,
            Err(pos) => self.counters.insert(pos, Counter { id, value }),
        }
    }

    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        let mut greater = false;
        let mut lesser = false;

        let mut ids: Vec<ShortId> = self
            .counters
            .iter()
            .chain(other.counters.iter())
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids.dedup();

        for id in ids {
            let mine = self.counter(id);
            let theirs = other.counter(id);
            if mine > theirs {
                greater = true;
            } else if mine < theirs {
                lesser = true;
            }
        }

        match (greater, lesser) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Greater,
            (false, true) => VectorOrdering::Lesser,
            (true, true) => {
                if self.tiebreak_key() >= other.tiebreak_key() {
                    VectorOrdering::ConcurrentGreater
                } else {
                    VectorOrdering::ConcurrentLesser
                }
            }
        }
    }

    fn tiebreak_key(&self) -> (u64, u64) {
        let total = self.counters.iter().map(|c| c.value).sum();
        let top = self.counters.iter().map(|c| c.id.0).max().unwrap_or(0);
        (total, top)
    }
}
