//! Fork plans and the process-wide plan cache.
//!
//! A plan is everything the fork compiler learns from a (base shape, batch shape)
//! pair: the sorted template of the new layer, which base runs get fresh cells,
//! and which keys need a reducer marker. Applying a plan only allocates cells and
//! one layer, so repeating a fork shape on another scope skips graph work.
//!
//! Batches are compiled in canonical order: bindings stably sorted by [`Shape`].
//! Forking with the same bindings in another order hits the same plan, and the
//! caller's order is restored per key when the plan is applied. Scopes with one
//! signature can therefore hold a reducible run in different orders, so a plan
//! names the keys that changed and each carried entry is checked against them.
//!
//! The cache is append-only for the life of the process. Concurrent misses may
//! compile the same plan twice; the first insert wins and the loser is dropped.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;
use strata_types::TypeKey;

use crate::provider::Shape;
use crate::reducer::Reduction;

/// Structural identity of a scope: the chain of batch shapes it was forked from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature(u128);

impl Signature {
	/// Signature of the empty scope.
	pub const EMPTY: Signature = Signature(0);

	/// Hash of a batch of provider shapes in canonical order.
	pub(crate) fn of_batch(shapes: &[Shape]) -> Self {
		Self::hash_with(|h| {
			h.write_usize(shapes.len());
			shapes.hash(h);
		})
	}

	/// Signature of a scope forked from `self` with a batch hashing to `batch`.
	pub(crate) fn chain(self, batch: Signature) -> Self {
		Self::hash_with(|h| {
			h.write_u128(self.0);
			h.write_u128(batch.0);
		})
	}

	fn hash_with(feed: impl Fn(&mut FxHasher)) -> Self {
		let mut lo = FxHasher::default();
		lo.write_u64(0x243f_6a88_85a3_08d3);
		feed(&mut lo);
		let mut hi = FxHasher::default();
		hi.write_u64(0x1319_8a2e_0370_7344);
		feed(&mut hi);
		Signature((u128::from(hi.finish()) << 64) | u128::from(lo.finish()))
	}
}

/// What happens to one entry of a base run that is re-emitted in the new layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Carry {
	/// Shares the base cell and its cached value.
	Keep,
	/// Gets a fresh cell with the same identity.
	Reset,
}

/// Template of one key's run in the new layer.
#[derive(Debug, Clone)]
pub(crate) struct KeyPlan {
	pub key: TypeKey,
	/// Whether the base run is re-emitted ahead of the new bindings.
	pub carry_base: bool,
	/// `(canonical batch index, output position)` of each new binding of this key.
	pub new: SmallVec<[(u32, u16); 1]>,
	/// Combiner of the run's reducer marker, if the run needs one.
	pub marker: Option<Reduction>,
}

#[derive(Debug)]
pub(crate) struct ForkPlan {
	/// Canonical batch shapes.
	pub batch: Box<[Shape]>,
	pub keys: Box<[KeyPlan]>,
	/// Sorted keys whose value differs from the base, the scope handle included.
	pub changed: Box<[TypeKey]>,
	/// Base keys re-emitted because something they read changed.
	pub reset: Box<[TypeKey]>,
	/// Keys that carry a reducer marker in the new layer.
	pub reducers: Box<[TypeKey]>,
	pub signature: Signature,
}

impl ForkPlan {
	/// Action for a carried base entry whose cell reads `inputs`.
	pub fn carry(&self, inputs: &[TypeKey]) -> Carry {
		if inputs.iter().any(|input| self.changed.binary_search(input).is_ok()) {
			Carry::Reset
		} else {
			Carry::Keep
		}
	}
}

/// Memoized fork plans keyed by `(base signature, batch signature)`.
pub struct PlanCache {
	plans: RwLock<FxHashMap<(Signature, Signature), Arc<ForkPlan>>>,
}

static GLOBAL: LazyLock<PlanCache> = LazyLock::new(PlanCache::new);

impl Default for PlanCache {
	fn default() -> Self {
		Self::new()
	}
}

impl PlanCache {
	pub fn new() -> Self {
		Self {
			plans: RwLock::new(FxHashMap::default()),
		}
	}

	/// Returns the cache used by [`crate::Scope::fork`].
	pub fn global() -> &'static PlanCache {
		&GLOBAL
	}

	/// Number of cached plans.
	pub fn len(&self) -> usize {
		self.plans.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Drops every cached plan. Scopes already built are unaffected.
	pub fn clear(&self) {
		self.plans.write().clear();
	}

	pub(crate) fn get(&self, base: Signature, batch: Signature, shapes: &[Shape]) -> Option<Arc<ForkPlan>> {
		let plan = self.plans.read().get(&(base, batch)).cloned()?;
		// Signatures are hashes; the batch itself is compared exactly.
		(*plan.batch == *shapes).then_some(plan)
	}

	pub(crate) fn insert(&self, base: Signature, batch: Signature, plan: ForkPlan) -> Arc<ForkPlan> {
		let plan = Arc::new(plan);
		let mut plans = self.plans.write();
		let slot = plans.entry((base, batch)).or_insert_with(|| plan.clone());
		if slot.batch == plan.batch {
			slot.clone()
		} else {
			plan
		}
	}
}
