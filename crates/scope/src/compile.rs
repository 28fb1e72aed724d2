//! Fork compilation: validation and change propagation for one batch of bindings.
//!
//! # Data flow
//!
//! 1. Classify the batch: every binding must declare at least one output, no
//!    output twice, and never the scope handle itself.
//! 2. Group new outputs by key. A key bound more than once (counting the base run
//!    for reducible keys) must be reducible. Reducibility is read from the batch
//!    shapes, which are also the plan's cache key.
//! 3. Check every new input against the union of base and batch.
//! 4. Walk the union graph from the new keys with three colors to find loops.
//! 5. Propagate change downstream from the new keys and the scope handle through
//!    the base's reverse dependency index. Reached base keys are reset. Custom
//!    reducer markers read the scope handle, so their keys reset on every fork.
//! 6. Emit a [`KeyPlan`] per affected key, in key order.
//!
//! Nothing is built on error, so a failed fork leaves no trace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use strata_types::TypeKey;

use crate::binding::{Binding, Definition, Origin};
use crate::error::{Error, Result};
use crate::plan::{ForkPlan, KeyPlan, Signature};
use crate::provider::Shape;
use crate::reducer::{self, Reduction};
use crate::scope::{Scope, scope_key};
use crate::store::{Entry, Slot, Stack};

type NewOutputs = SmallVec<[(u32, u16); 1]>;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Color {
	Gray,
	Black,
}

struct Compiler<'a> {
	base: &'a Stack,
	batch: &'a [Binding],
	new_by_key: BTreeMap<TypeKey, NewOutputs>,
	/// Reducibility of each new key as recorded in the batch shapes.
	reductions: FxHashMap<TypeKey, Option<Reduction>>,
	/// New keys whose base run stays visible next to the new bindings.
	carries_base: FxHashSet<TypeKey>,
}

/// Compiles the plan for forking `base` with `batch`.
pub(crate) fn compile(
	base: &Scope,
	batch: &[Binding],
	shapes: Box<[Shape]>,
	batch_signature: Signature,
) -> Result<ForkPlan> {
	let mut compiler = Compiler {
		base: base.stack(),
		batch,
		new_by_key: BTreeMap::new(),
		reductions: FxHashMap::default(),
		carries_base: FxHashSet::default(),
	};
	compiler.classify(&shapes)?;
	compiler.check_multiplicity()?;
	compiler.check_inputs()?;
	compiler.check_loops()?;
	let (changed, reset) = compiler.propagate();
	let plan = compiler.emit(changed, reset, shapes, base.signature().chain(batch_signature));
	tracing::debug!(
		bindings = batch.len(),
		keys = plan.keys.len(),
		reset = plan.reset.len(),
		reducers = plan.reducers.len(),
		"compiled fork plan"
	);
	Ok(plan)
}

fn base_run(stack: &Stack, key: TypeKey) -> &[Entry] {
	stack.load(Slot::value(key)).unwrap_or_default()
}

impl<'a> Compiler<'a> {
	fn classify(&mut self, shapes: &[Shape]) -> Result<()> {
		let scope = scope_key();
		for ((index, binding), shape) in self.batch.iter().enumerate().zip(shapes) {
			let Definition { provider, origin } = &*binding.def;
			let outputs = provider.outputs();
			if outputs.is_empty() {
				return Err(Error::definition(origin, "provider declares no outputs"));
			}
			let index = u32::try_from(index)
				.map_err(|_| Error::definition(origin, "too many bindings in one fork"))?;
			for (position, key) in outputs.iter().enumerate() {
				if *key == scope {
					return Err(Error::definition(origin, "the scope handle cannot be bound"));
				}
				if outputs[..position].contains(key) {
					return Err(Error::definition(origin, format!("{key} is returned more than once")));
				}
				// Shapes taken on both sides of a registration disagree; treat as unreducible.
				let reduction = shape.reduction(position);
				self.reductions
					.entry(*key)
					.and_modify(|seen| {
						if *seen != reduction {
							*seen = None;
						}
					})
					.or_insert(reduction);
				let position = u16::try_from(position)
					.map_err(|_| Error::definition(origin, "too many outputs"))?;
				self.new_by_key.entry(*key).or_default().push((index, position));
			}
		}
		Ok(())
	}

	fn check_multiplicity(&mut self) -> Result<()> {
		for (key, news) in &self.new_by_key {
			let reducible = self.reductions.get(key).copied().flatten().is_some();
			let base = if reducible { base_run(self.base, *key).len() } else { 0 };
			if base > 0 {
				self.carries_base.insert(*key);
			}
			if news.len() + base > 1 && !reducible {
				let origins = news
					.iter()
					.map(|(index, _)| self.batch[*index as usize].def.origin.to_string())
					.collect::<Vec<_>>()
					.join(", ");
				let first = &self.batch[news[0].0 as usize].def.origin;
				return Err(Error::definition(
					first,
					format!("multiple definitions of {key}: {origins}"),
				));
			}
		}
		Ok(())
	}

	fn check_inputs(&self) -> Result<()> {
		let scope = scope_key();
		for binding in self.batch {
			for input in binding.def.provider.inputs() {
				if *input == scope
					|| self.new_by_key.contains_key(input)
					|| self.base.load_one(Slot::value(*input)).is_some()
				{
					continue;
				}
				return Err(Error::not_found(*input, Some(&binding.def.origin)));
			}
		}
		Ok(())
	}

	/// Dependency edges of `key` in the union: `(origin of the reader, input)`.
	fn edges(&self, key: TypeKey) -> SmallVec<[(&'a Origin, TypeKey); 4]> {
		let mut out = SmallVec::new();
		let mut push = |def: &'a Arc<Definition>| {
			out.extend(def.provider.inputs().iter().map(|input| (&def.origin, *input)));
		};
		let batch = self.batch;
		match self.new_by_key.get(&key) {
			Some(news) => {
				if self.carries_base.contains(&key) {
					for entry in base_run(self.base, key) {
						if let Some(def) = entry.cell.definition() {
							push(def);
						}
					}
				}
				for (index, _) in news {
					push(&batch[*index as usize].def);
				}
			}
			None => {
				for entry in base_run(self.base, key) {
					if let Some(def) = entry.cell.definition() {
						push(def);
					}
				}
			}
		}
		out
	}

	fn check_loops(&self) -> Result<()> {
		struct Frame<'o> {
			key: TypeKey,
			edges: SmallVec<[(&'o Origin, TypeKey); 4]>,
			next: usize,
		}

		let scope = scope_key();
		let mut colors: FxHashMap<TypeKey, Color> = FxHashMap::default();
		for &start in self.new_by_key.keys() {
			if colors.contains_key(&start) {
				continue;
			}
			colors.insert(start, Color::Gray);
			let mut path = vec![Frame {
				key: start,
				edges: self.edges(start),
				next: 0,
			}];
			while let Some(frame) = path.last_mut() {
				let Some(&(origin, input)) = frame.edges.get(frame.next) else {
					let done = frame.key;
					path.pop();
					colors.insert(done, Color::Black);
					continue;
				};
				frame.next += 1;
				if input == scope {
					continue;
				}
				match colors.get(&input) {
					Some(Color::Black) => {}
					Some(Color::Gray) => {
						let mut cycle: Vec<TypeKey> = path
							.iter()
							.map(|frame| frame.key)
							.skip_while(|key| *key != input)
							.collect();
						cycle.push(input);
						return Err(Error::DependencyLoop {
							origin: origin.clone(),
							path: cycle,
						});
					}
					None => {
						colors.insert(input, Color::Gray);
						path.push(Frame {
							key: input,
							edges: self.edges(input),
							next: 0,
						});
					}
				}
			}
		}
		Ok(())
	}

	/// Returns every changed key and the base keys that must be reset.
	fn propagate(&self) -> (FxHashSet<TypeKey>, BTreeSet<TypeKey>) {
		let mut changed: FxHashSet<TypeKey> = self.new_by_key.keys().copied().collect();
		changed.insert(scope_key());

		// Marker cells count too: a custom reducer reads the scope handle.
		let mut dependents: FxHashMap<TypeKey, SmallVec<[TypeKey; 4]>> = FxHashMap::default();
		self.base.range(|slot, run| {
			for entry in run {
				for input in entry.cell.inputs() {
					dependents.entry(*input).or_default().push(slot.key);
				}
			}
		});

		let mut reset = BTreeSet::new();
		let mut queue: Vec<TypeKey> = changed.iter().copied().collect();
		while let Some(key) = queue.pop() {
			let Some(users) = dependents.get(&key) else {
				continue;
			};
			for user in users {
				if changed.insert(*user) {
					queue.push(*user);
					reset.insert(*user);
				}
			}
		}
		(changed, reset)
	}

	fn emit(
		&self,
		changed: FxHashSet<TypeKey>,
		reset: BTreeSet<TypeKey>,
		shapes: Box<[Shape]>,
		signature: Signature,
	) -> ForkPlan {
		let mut affected: BTreeSet<TypeKey> = self.new_by_key.keys().copied().collect();
		affected.extend(reset.iter().copied());

		let mut keys = Vec::with_capacity(affected.len());
		let mut reducers = Vec::new();
		for key in affected {
			let new = self.new_by_key.get(&key).cloned().unwrap_or_default();
			let carry_base = new.is_empty() || self.carries_base.contains(&key);
			let base = if carry_base { base_run(self.base, key).len() } else { 0 };
			let marker = (base + new.len() > 1).then(|| {
				// A longer base run only exists for a type registered before it was built.
				self.reductions
					.get(&key)
					.copied()
					.flatten()
					.or_else(|| reducer::reduction(key))
					.unwrap_or(Reduction::Custom)
			});
			if marker.is_some() {
				reducers.push(key);
			}
			keys.push(KeyPlan {
				key,
				carry_base,
				new,
				marker,
			});
		}

		let mut changed: Vec<TypeKey> = changed.into_iter().collect();
		changed.sort_unstable();
		ForkPlan {
			batch: shapes,
			keys: keys.into_boxed_slice(),
			changed: changed.into_boxed_slice(),
			reset: reset.into_iter().collect(),
			reducers: reducers.into_boxed_slice(),
			signature,
		}
	}
}
