//! Id maps between the two tracks of a harness.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use reciperun::error::{LaunchError, LaunchResult};
use reciperun::recipe::{NodeId, SectionId, TensorId};

/// One-to-one map from first-track ids to second-track ids.
#[derive(Debug, Clone)]
pub struct IdMap<K> {
    kind: &'static str,
    pairs: BTreeMap<K, K>,
    seconds: BTreeSet<K>,
}

impl<K> IdMap<K>
where
    K: Copy + Ord + fmt::LowerHex,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pairs: BTreeMap::new(),
            seconds: BTreeSet::new(),
        }
    }

    /// Records a pair; either side already being mapped is a contract violation.
    pub fn insert(&mut self, first: K, second: K) -> LaunchResult<()> {
        if self.pairs.contains_key(&first) {
            return Err(LaunchError::contract(format!(
                "{} {first:#x} is already mirrored",
                self.kind
            )));
        }
        if !self.seconds.insert(second) {
            return Err(LaunchError::contract(format!(
                "{} {second:#x} mirrors more than one id",
                self.kind
            )));
        }
        self.pairs.insert(first, second);
        Ok(())
    }

    pub fn get(&self, first: K) -> LaunchResult<K> {
        self.pairs.get(&first).copied().ok_or_else(|| {
            LaunchError::contract(format!("{} {first:#x} has no mirror", self.kind))
        })
    }

    pub fn translate(&self, firsts: &[K]) -> LaunchResult<Vec<K>> {
        firsts.iter().map(|id| self.get(*id)).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, K)> + '_ {
        self.pairs.iter().map(|(first, second)| (*first, *second))
    }
}

/// Tensor, section and node maps of a harness.
#[derive(Debug, Clone)]
pub struct Mirror {
    pub tensors: IdMap<TensorId>,
    pub sections: IdMap<SectionId>,
    pub nodes: IdMap<NodeId>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            tensors: IdMap::new("tensor"),
            sections: IdMap::new("section"),
            nodes: IdMap::new("node"),
        }
    }
}
