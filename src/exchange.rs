//! Keyed exchange: master aggregation whose output is scattered back to
//! specific shards instead of being merged into one global value.

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregator::Contributions;
use crate::error::{DiapError, Result};
use crate::fields::{FieldId, FieldValue, Variant};
use crate::partial::{PartialResult, ShardId};

/// Mapping from destination shard to the value addressed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedCollection<V> {
    entries: BTreeMap<ShardId, V>,
}

impl<V> Default for KeyedCollection<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> KeyedCollection<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `shard`.
    pub fn insert(&mut self, shard: ShardId, value: V) -> Option<V> {
        self.entries.insert(shard, value)
    }

    /// Address `value` to `shard`; a second value for the same shard is a
    /// routing failure.
    pub fn route(&mut self, shard: ShardId, value: V) -> Result<()> {
        match self.entries.entry(shard) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
            btree_map::Entry::Occupied(_) => Err(DiapError::RoutingFailure {
                shard,
                reason: "more than one entry addressed to the same shard".into(),
            }),
        }
    }

    pub fn get(&self, shard: ShardId) -> Option<&V> {
        self.entries.get(&shard)
    }

    pub fn remove(&mut self, shard: ShardId) -> Option<V> {
        self.entries.remove(&shard)
    }

    pub fn keys(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShardId, &V)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn map<W>(self, mut f: impl FnMut(ShardId, V) -> W) -> KeyedCollection<W> {
        KeyedCollection {
            entries: self
                .entries
                .into_iter()
                .map(|(k, v)| (k, f(k, v)))
                .collect(),
        }
    }
}

impl<V> FromIterator<(ShardId, V)> for KeyedCollection<V> {
    fn from_iter<I: IntoIterator<Item = (ShardId, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<V> IntoIterator for KeyedCollection<V> {
    type Item = (ShardId, V);
    type IntoIter = btree_map::IntoIter<ShardId, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Master rule of a keyed step.
pub trait KeyedMerge: Sync {
    type Value: Send + Sync;

    fn input_variant(&self) -> Variant;

    /// `partials` arrive in ascending [`ShardId`] order; `active` is the set
    /// of shards that must each receive exactly one entry.
    fn merge_keyed(
        &self,
        partials: &[&PartialResult],
        active: &BTreeSet<ShardId>,
    ) -> Result<KeyedCollection<Self::Value>>;
}

/// Aggregator specialisation that routes its output per shard.
pub struct KeyedExchange<K: KeyedMerge> {
    strategy: K,
    inner: Mutex<Contributions>,
}

impl<K: KeyedMerge> KeyedExchange<K> {
    pub fn new(strategy: K, expected: BTreeSet<ShardId>, round: u32) -> Self {
        let variant = strategy.input_variant();
        Self {
            strategy,
            inner: Mutex::new(Contributions::new(variant, expected, round)),
        }
    }

    pub fn strategy(&self) -> &K {
        &self.strategy
    }

    pub fn add_partial_result(&self, shard: ShardId, partial: PartialResult) -> Result<()> {
        self.inner.lock().add(shard, partial)
    }

    pub fn submit_all(&self, partials: Vec<PartialResult>) -> Result<()> {
        partials
            .into_par_iter()
            .try_for_each(|partial| self.add_partial_result(partial.shard(), partial))
    }

    pub fn mark_missing(&self, shard: ShardId) -> Result<()> {
        self.inner.lock().mark_missing(shard)
    }

    /// Run the keyed merge and check that every active contributor gets
    /// exactly one entry and nothing is addressed elsewhere.
    pub fn merge_keyed(&self) -> Result<KeyedCollection<K::Value>> {
        let inner = self.inner.lock();
        inner.ensure_complete()?;
        let active = inner.expected().clone();
        let routed = self.strategy.merge_keyed(&inner.ordered(), &active)?;
        if let Some(stray) = routed.keys().find(|id| !active.contains(id)) {
            return Err(DiapError::RoutingFailure {
                shard: stray,
                reason: "keyed merge addressed a shard outside the active set".into(),
            });
        }
        if let Some(&unserved) = active.iter().find(|id| routed.get(**id).is_none()) {
            return Err(DiapError::RoutingFailure {
                shard: unserved,
                reason: "keyed merge produced no entry for an active contributor".into(),
            });
        }
        tracing::debug!(
            round = inner.round(),
            destinations = routed.len(),
            "keyed exchange routed"
        );
        Ok(routed)
    }
}

/// Regroup a keyed field by destination.
///
/// Each partial carries `field` as a [`FieldValue::Keyed`] map from
/// destination shard to value. The result lists, for every shard in
/// `active`, the `(source, value)` pairs addressed to it in source order;
/// shards that receive nothing get an empty list.
pub fn shuffle(
    partials: &[&PartialResult],
    field: FieldId,
    active: &BTreeSet<ShardId>,
) -> Result<KeyedCollection<Vec<(ShardId, FieldValue)>>> {
    let mut routed: KeyedCollection<Vec<(ShardId, FieldValue)>> =
        active.iter().map(|id| (*id, Vec::new())).collect();
    for partial in partials {
        let source = partial.shard();
        for (destination, value) in partial.fields().keyed(field)? {
            if *destination == source {
                return Err(DiapError::RoutingFailure {
                    shard: source,
                    reason: format!("'{field}' entry addressed back to its own source"),
                });
            }
            match routed.entries.get_mut(destination) {
                Some(inbox) => inbox.push((source, value.clone())),
                None => {
                    return Err(DiapError::RoutingFailure {
                        shard: *destination,
                        reason: format!("'{field}' from shard {source} addressed to an inactive shard"),
                    })
                }
            }
        }
    }
    Ok(routed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::NamedFields;

    struct HaloRouting;

    impl KeyedMerge for HaloRouting {
        type Value = Vec<(ShardId, FieldValue)>;

        fn input_variant(&self) -> Variant {
            Variant::DbscanHalo
        }

        fn merge_keyed(
            &self,
            partials: &[&PartialResult],
            active: &BTreeSet<ShardId>,
        ) -> Result<KeyedCollection<Self::Value>> {
            shuffle(partials, FieldId::HaloData, active)
        }
    }

    fn halo(source: u32, to: &[(u32, FieldValue)]) -> PartialResult {
        let map: BTreeMap<ShardId, FieldValue> =
            to.iter().map(|(k, v)| (ShardId(*k), v.clone())).collect();
        let fields = NamedFields::new(Variant::DbscanHalo)
            .with(FieldId::HaloData, FieldValue::Keyed(map))
            .and_then(|f| f.with(FieldId::HaloDataIndices, FieldValue::Keyed(BTreeMap::new())))
            .expect("valid");
        PartialResult::new(ShardId(source), 0, fields)
    }

    #[test]
    fn value_addressed_to_shard_zero_reaches_only_shard_zero() {
        let active: BTreeSet<ShardId> = (0..4).map(ShardId).collect();
        let exchange = KeyedExchange::new(HaloRouting, active.clone(), 0);
        let payload = FieldValue::Indices(vec![42, 43]);
        exchange
            .submit_all(vec![
                halo(0, &[]),
                halo(1, &[]),
                halo(2, &[(0, payload.clone())]),
                halo(3, &[]),
            ])
            .expect("submit");
        let routed = exchange.merge_keyed().expect("merge");
        assert_eq!(routed.len(), 4);
        assert_eq!(routed.get(ShardId(0)), Some(&vec![(ShardId(2), payload)]));
        for other in 1..4 {
            assert!(routed.get(ShardId(other)).expect("entry").is_empty());
        }
    }

    #[test]
    fn keyed_merge_before_barrier_is_incomplete() {
        let active: BTreeSet<ShardId> = (0..2).map(ShardId).collect();
        let exchange = KeyedExchange::new(HaloRouting, active, 0);
        exchange.add_partial_result(ShardId(1), halo(1, &[])).expect("add");
        let err = exchange.merge_keyed().unwrap_err();
        assert!(matches!(err, DiapError::IncompleteRound { .. }));
    }

    #[test]
    fn value_addressed_to_unknown_shard_is_a_routing_failure() {
        let active: BTreeSet<ShardId> = (0..2).map(ShardId).collect();
        let exchange = KeyedExchange::new(HaloRouting, active, 0);
        exchange.add_partial_result(ShardId(0), halo(0, &[(7, FieldValue::Count(1))])).expect("add");
        exchange.add_partial_result(ShardId(1), halo(1, &[])).expect("add");
        let err = exchange.merge_keyed().unwrap_err();
        assert!(matches!(err, DiapError::RoutingFailure { shard: ShardId(7), .. }));
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let mut keyed = KeyedCollection::new();
        keyed.route(ShardId(1), 1).expect("first");
        let err = keyed.route(ShardId(1), 2).unwrap_err();
        assert!(matches!(err, DiapError::RoutingFailure { .. }));
    }
}
