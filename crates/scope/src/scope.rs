//! The scope: an immutable, forkable view over a layered binding store.
//!
//! # Lifecycle
//!
//! 1. [`Scope::new`] forks the empty scope.
//! 2. [`Scope::fork`] looks up or compiles a plan, then applies it: fresh cells for
//!    the new bindings and the plan's reset set, one new layer on top of the
//!    shared chain.
//! 3. Reads ([`Scope::get`], [`Scope::call`], [`Scope::assign`]) evaluate cells
//!    lazily. A cell shared with an ancestor serves its cached value to both.
//!
//! # Concurrency
//!
//! A scope is immutable and `Send + Sync`. Forks and reads from many threads need
//! no locking beyond the once-only guard inside each cell.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, LazyLock};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use strata_types::TypeKey;

use crate::binding::{Binding, Origin};
use crate::compile;
use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::invoke::{self, Outputs, Targets};
use crate::plan::{Carry, ForkPlan, PlanCache, Signature};
use crate::provider::{Provider, ProviderFn, Shape, Value};
use crate::store::{Entry, Layer, Slot, Stack};

/// Layer count above which the next fork flattens the base chain first.
pub const MAX_LAYER_DEPTH: usize = 32;

/// Key of the scope handle. Providers that read it get the scope they run in.
pub(crate) fn scope_key() -> TypeKey {
	static KEY: LazyLock<TypeKey> = LazyLock::new(TypeKey::of::<Scope>);
	*KEY
}

/// Declared inputs of a cell that reads only the scope handle.
pub(crate) fn scope_inputs() -> &'static [TypeKey] {
	static INPUTS: LazyLock<[TypeKey; 1]> = LazyLock::new(|| [scope_key()]);
	&*INPUTS
}

struct ScopeInner {
	stack: Stack,
	signature: Signature,
}

/// Immutable mapping from types to lazily computed values.
#[derive(Clone)]
pub struct Scope {
	inner: Arc<ScopeInner>,
}

/// One effective binding, for diagnostics and graph export.
#[derive(Debug, Clone)]
pub struct BindingInfo {
	pub key: TypeKey,
	pub origin: Origin,
	pub inputs: Vec<TypeKey>,
	/// Whether this binding is one of several combined by a reducer.
	pub reduced: bool,
}

impl Default for Scope {
	fn default() -> Self {
		Self::empty()
	}
}

impl fmt::Debug for Scope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Scope")
			.field("signature", &self.inner.signature)
			.field("depth", &self.depth())
			.field("types", &self.type_keys())
			.finish()
	}
}

impl Scope {
	/// Scope with no bindings.
	pub fn empty() -> Self {
		Self::from_parts(Stack::default(), Signature::EMPTY)
	}

	/// Builds a scope from `bindings`.
	pub fn new(bindings: impl IntoIterator<Item = Binding>) -> Result<Self> {
		Self::empty().fork(bindings)
	}

	fn from_parts(stack: Stack, signature: Signature) -> Self {
		Self {
			inner: Arc::new(ScopeInner { stack, signature }),
		}
	}

	pub(crate) fn stack(&self) -> &Stack {
		&self.inner.stack
	}

	/// Structural signature; scopes with equal signatures share fork plans.
	pub fn signature(&self) -> Signature {
		self.inner.signature
	}

	/// Number of layers in the underlying store.
	pub fn depth(&self) -> usize {
		self.inner.stack.depth()
	}

	/// Returns a new scope extending or overriding this one with `bindings`.
	///
	/// On error nothing is built and `self` is untouched.
	pub fn fork(&self, bindings: impl IntoIterator<Item = Binding>) -> Result<Scope> {
		let mut shaped: Vec<(Shape, usize, Binding)> = bindings
			.into_iter()
			.enumerate()
			.map(|(position, binding)| (binding.shape(), position, binding))
			.collect();
		// Stable: equal shapes keep the caller's order.
		shaped.sort_by(|a, b| a.0.cmp(&b.0));
		let mut shapes = Vec::with_capacity(shaped.len());
		let mut positions = Vec::with_capacity(shaped.len());
		let mut batch = Vec::with_capacity(shaped.len());
		for (shape, position, binding) in shaped {
			shapes.push(shape);
			positions.push(position);
			batch.push(binding);
		}

		let batch_signature = Signature::of_batch(&shapes);
		let cache = PlanCache::global();
		let plan = match cache.get(self.signature(), batch_signature, &shapes) {
			Some(plan) => {
				tracing::trace!(bindings = batch.len(), "fork plan cache hit");
				plan
			}
			None => {
				let plan = compile::compile(self, &batch, shapes.into_boxed_slice(), batch_signature)?;
				cache.insert(self.signature(), batch_signature, plan)
			}
		};
		Ok(self.apply(&plan, &batch, &positions))
	}

	/// Builds the forked scope. `batch` is in canonical order and `positions[i]`
	/// is where `batch[i]` stood in the caller's list.
	fn apply(&self, plan: &ForkPlan, batch: &[Binding], positions: &[usize]) -> Scope {
		let base = &self.inner.stack;
		let cells: Vec<Arc<Initializer>> = batch
			.iter()
			.map(|binding| Initializer::provide(binding.def.clone()))
			.collect();
		let mut resets: FxHashMap<u64, Arc<Initializer>> = FxHashMap::default();
		let mut entries = Vec::with_capacity(plan.keys.len() + batch.len());

		for kp in plan.keys.iter() {
			if kp.carry_base {
				for entry in base.load(Slot::value(kp.key)).unwrap_or_default() {
					let cell = match plan.carry(entry.cell.inputs()) {
						Carry::Keep => entry.cell.clone(),
						// Outputs of one binding keep sharing one cell.
						Carry::Reset => resets
							.entry(entry.cell.id())
							.or_insert_with(|| entry.cell.reset())
							.clone(),
					};
					entries.push(Entry {
						slot: entry.slot,
						output: entry.output,
						cell,
					});
				}
			}
			let mut new: SmallVec<[(usize, u32, u16); 2]> = kp
				.new
				.iter()
				.map(|&(index, output)| (positions[index as usize], index, output))
				.collect();
			new.sort_unstable_by_key(|&(position, ..)| position);
			for (_, index, output) in new {
				entries.push(Entry {
					slot: Slot::value(kp.key),
					output,
					cell: cells[index as usize].clone(),
				});
			}
			if let Some(reduction) = kp.marker {
				entries.push(Entry {
					slot: Slot::marker(kp.key),
					output: 0,
					cell: Initializer::reduce(kp.key, reduction),
				});
			}
		}

		let stack = if base.depth() > MAX_LAYER_DEPTH {
			base.flatten()
		} else {
			base.clone()
		};
		let stack = if entries.is_empty() {
			stack
		} else {
			stack.push(Layer::new(entries))
		};
		Scope::from_parts(stack, plan.signature)
	}

	/// Resolves the value bound to `key`.
	pub fn get_value(&self, key: TypeKey) -> Result<Value> {
		self.resolve_for(key, None)
	}

	pub(crate) fn resolve_for(&self, key: TypeKey, required_by: Option<&Origin>) -> Result<Value> {
		if key == scope_key() {
			return Ok(Arc::new(self.clone()));
		}
		let stack = &self.inner.stack;
		let run = stack
			.load(Slot::value(key))
			.ok_or_else(|| Error::not_found(key, required_by))?;
		match run {
			[entry] => entry.cell.value(self, entry.output),
			_ => {
				let marker = stack
					.load_one(Slot::marker(key))
					.ok_or_else(|| Error::not_found(key, required_by))?;
				marker.cell.value(self, 0)
			}
		}
	}

	/// Resolves `T` and returns a clone of it.
	pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Result<T> {
		let value = self.get_value(TypeKey::of::<T>())?;
		value.downcast_ref::<T>().cloned().ok_or_else(|| mismatch::<T>())
	}

	/// Resolves `T` and returns the cached value itself.
	///
	/// Repeated calls on scopes sharing the binding's cell return the same `Arc`.
	pub fn get_arc<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
		let value = self.get_value(TypeKey::of::<T>())?;
		value.downcast::<T>().map_err(|_| mismatch::<T>())
	}

	/// Returns true if `T` is bound. Does not evaluate anything.
	pub fn contains<T: ?Sized + 'static>(&self) -> bool {
		self.contains_key(TypeKey::of::<T>())
	}

	pub fn contains_key(&self, key: TypeKey) -> bool {
		key == scope_key() || self.inner.stack.load_one(Slot::value(key)).is_some()
	}

	/// Fills each target whose type is bound. Unbound targets are left untouched.
	pub fn assign<T: Targets>(&self, targets: T) -> Result<()> {
		targets.assign_from(&|key: TypeKey| {
			if self.contains_key(key) {
				self.get_value(key).map(Some)
			} else {
				Ok(None)
			}
		})
	}

	/// Calls `f` with its arguments resolved from this scope.
	pub fn call<F, Args>(&self, f: F) -> Result<F::Output>
	where
		F: ProviderFn<Args>,
	{
		f.call_scope(self)
	}

	/// Calls a provider with resolved inputs and returns its outputs tagged by key.
	#[track_caller]
	pub fn invoke(&self, provider: &dyn Provider) -> Result<Outputs> {
		invoke::invoke(self, provider, Origin::Location(Location::caller()))
	}

	/// Every bound type, in key order.
	pub fn type_keys(&self) -> Vec<TypeKey> {
		let mut keys = Vec::new();
		self.inner.stack.range(|slot, _| {
			if !slot.marker {
				keys.push(slot.key);
			}
		});
		keys.sort_unstable();
		keys
	}

	/// Every effective binding, in key order.
	pub fn bindings(&self) -> Vec<BindingInfo> {
		let mut infos = Vec::new();
		self.inner.stack.range(|slot, run| {
			if slot.marker {
				return;
			}
			let reduced = run.len() > 1;
			for entry in run {
				let Some(def) = entry.cell.definition() else {
					continue;
				};
				infos.push(BindingInfo {
					key: slot.key,
					origin: def.origin.clone(),
					inputs: def.provider.inputs().to_vec(),
					reduced,
				});
			}
		});
		infos.sort_by_key(|info| info.key);
		infos
	}

	/// Declared inputs of the bindings of `key`, deduplicated.
	pub fn dependencies(&self, key: TypeKey) -> Option<Vec<TypeKey>> {
		let run = self.inner.stack.load(Slot::value(key))?;
		let mut inputs: Vec<TypeKey> = run.iter().flat_map(|entry| entry.cell.inputs().iter().copied()).collect();
		inputs.sort_unstable();
		inputs.dedup();
		Some(inputs)
	}

	/// Whether the binding of `key` has been evaluated in this scope.
	pub fn is_evaluated(&self, key: TypeKey) -> bool {
		let stack = &self.inner.stack;
		match stack.load(Slot::value(key)) {
			Some([entry]) => entry.cell.is_evaluated(),
			Some(_) => stack
				.load_one(Slot::marker(key))
				.is_some_and(|marker| marker.cell.is_evaluated()),
			None => false,
		}
	}
}

fn mismatch<T>() -> Error {
	Error::BadArgument(format!("bound value is not a {}", std::any::type_name::<T>()))
}
