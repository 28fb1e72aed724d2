//! Persistent layered binding store.
//!
//! # Mental model
//!
//! * A [`Stack`] is a singly linked chain of immutable [`Layer`]s, newest on top.
//! * Each layer is a sorted array of [`Entry`]s. Entries for one [`Slot`] are
//!   contiguous, so a lookup is one binary search per layer.
//! * Shadowing is exact: the first layer (top-down) holding any entry for a slot
//!   answers the lookup alone. Runs never merge across layers.
//! * Pushing a layer is O(1) and shares the whole chain below it.
//!
//! # Invariants
//!
//! * Layers are never mutated after construction.
//! * [`Stack::flatten`] preserves the effective run of every slot
//!   (see `tests::test_flatten_preserves_effective_runs`).

use std::sync::Arc;

use rustc_hash::FxHashSet;
use strata_types::TypeKey;

use crate::init::Initializer;

/// Lookup position of an entry.
///
/// Every bound type has a value slot. Types bound more than once also carry a
/// reducer marker slot, whose cell combines the value slot's run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Slot {
	pub key: TypeKey,
	pub marker: bool,
}

impl Slot {
	pub fn value(key: TypeKey) -> Self {
		Self { key, marker: false }
	}

	pub fn marker(key: TypeKey) -> Self {
		Self { key, marker: true }
	}
}

/// One bound output: which cell produces it and at which output position.
#[derive(Clone)]
pub(crate) struct Entry {
	pub slot: Slot,
	pub output: u16,
	pub cell: Arc<Initializer>,
}

/// Immutable sorted run of entries.
#[derive(Default)]
pub(crate) struct Layer {
	entries: Box<[Entry]>,
}

impl Layer {
	/// Builds a layer. Entries are stably sorted by slot, so a run keeps the
	/// relative order it was given in.
	pub fn new(mut entries: Vec<Entry>) -> Self {
		entries.sort_by_key(|entry| entry.slot);
		Self {
			entries: entries.into_boxed_slice(),
		}
	}

	pub fn run(&self, slot: Slot) -> Option<&[Entry]> {
		let start = self.entries.partition_point(|entry| entry.slot < slot);
		let len = self.entries[start..]
			.iter()
			.take_while(|entry| entry.slot == slot)
			.count();
		(len > 0).then(|| &self.entries[start..start + len])
	}

	/// Iterates the layer as `(slot, run)` pairs in slot order.
	pub fn runs(&self) -> impl Iterator<Item = (Slot, &[Entry])> + '_ {
		self.entries
			.chunk_by(|a, b| a.slot == b.slot)
			.map(|run| (run[0].slot, run))
	}
}

struct Frame {
	layer: Layer,
	below: Option<Arc<Frame>>,
	depth: usize,
}

/// Chain of layers shared by every scope forked from it.
#[derive(Clone, Default)]
pub(crate) struct Stack {
	top: Option<Arc<Frame>>,
}

impl Stack {
	/// Number of layers in the chain.
	pub fn depth(&self) -> usize {
		self.top.as_ref().map_or(0, |frame| frame.depth)
	}

	fn frames(&self) -> impl Iterator<Item = &Frame> + '_ {
		let mut next = self.top.as_deref();
		std::iter::from_fn(move || {
			let frame = next?;
			next = frame.below.as_deref();
			Some(frame)
		})
	}

	/// Returns the run for `slot` from the newest layer that has one.
	pub fn load(&self, slot: Slot) -> Option<&[Entry]> {
		self.frames().find_map(|frame| frame.layer.run(slot))
	}

	/// Returns the first entry of the effective run for `slot`.
	pub fn load_one(&self, slot: Slot) -> Option<&Entry> {
		self.load(slot).and_then(|run| run.first())
	}

	/// Visits every slot's effective run exactly once, newest layer first.
	pub fn range(&self, mut f: impl FnMut(Slot, &[Entry])) {
		let mut seen: FxHashSet<Slot> = FxHashSet::default();
		for frame in self.frames() {
			for (slot, run) in frame.layer.runs() {
				if seen.insert(slot) {
					f(slot, run);
				}
			}
		}
	}

	/// Returns a new stack with `layer` on top, sharing this chain.
	pub fn push(&self, layer: Layer) -> Stack {
		let depth = self.depth() + 1;
		Stack {
			top: Some(Arc::new(Frame {
				layer,
				below: self.top.clone(),
				depth,
			})),
		}
	}

	/// Collapses the chain into a single layer holding each slot's effective run.
	pub fn flatten(&self) -> Stack {
		if self.depth() <= 1 {
			return self.clone();
		}
		let mut entries = Vec::new();
		self.range(|_, run| entries.extend_from_slice(run));
		tracing::debug!(
			layers = self.depth(),
			entries = entries.len(),
			"flattening binding layers"
		);
		Stack::default().push(Layer::new(entries))
	}
}
