//! Once-only evaluation cells.
//!
//! Every binding entering a scope gets an [`Initializer`]. The first reader runs
//! the provider; concurrent readers block until that single run finishes and then
//! observe the same outcome. Outcomes are cached whether they are values or
//! errors, so a failed provider stays failed for the lifetime of the cell.
//!
//! A reset builds a new cell with the same id and an empty cache. The old cell
//! keeps serving the scopes it already belongs to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use smallvec::{SmallVec, smallvec};
use strata_types::TypeKey;

use crate::binding::{Definition, Origin};
use crate::error::{Error, Result};
use crate::provider::{Provider, Value, Values};
use crate::reducer::{self, Reduction};
use crate::scope::{Scope, scope_inputs};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub(crate) enum CellKind {
	/// Runs a binding's provider.
	Provide(Arc<Definition>),
	/// Combines every binding of one key through its reducer.
	Reduce(TypeKey, Reduction),
}

pub(crate) struct Initializer {
	id: u64,
	kind: CellKind,
	once: OnceLock<Result<Values>>,
}

impl Initializer {
	pub fn provide(def: Arc<Definition>) -> Arc<Self> {
		Self::with_kind(CellKind::Provide(def))
	}

	pub fn reduce(key: TypeKey, reduction: Reduction) -> Arc<Self> {
		Self::with_kind(CellKind::Reduce(key, reduction))
	}

	fn with_kind(kind: CellKind) -> Arc<Self> {
		Arc::new(Self {
			id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
			kind,
			once: OnceLock::new(),
		})
	}

	/// Fresh cell for the same binding: same id, nothing cached.
	pub fn reset(&self) -> Arc<Self> {
		Arc::new(Self {
			id: self.id,
			kind: self.kind.clone(),
			once: OnceLock::new(),
		})
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn definition(&self) -> Option<&Arc<Definition>> {
		match &self.kind {
			CellKind::Provide(def) => Some(def),
			CellKind::Reduce(..) => None,
		}
	}

	/// Declared inputs of the underlying provider. Reducer cells read their own
	/// key's run; a custom reducer also reads the scope handle.
	pub fn inputs(&self) -> &[TypeKey] {
		match &self.kind {
			CellKind::Provide(def) => def.provider.inputs(),
			CellKind::Reduce(_, Reduction::Custom) => scope_inputs(),
			CellKind::Reduce(_, Reduction::Concat) => &[],
		}
	}

	pub fn origin(&self) -> Option<&Origin> {
		self.definition().map(|def| &def.origin)
	}

	pub fn is_evaluated(&self) -> bool {
		self.once.get().is_some()
	}

	/// Evaluates once and returns every output.
	pub fn get(&self, scope: &Scope) -> Result<&Values> {
		self.once
			.get_or_init(|| self.evaluate(scope))
			.as_ref()
			.map_err(Clone::clone)
	}

	/// Evaluates once and returns the output at `output`.
	pub fn value(&self, scope: &Scope, output: u16) -> Result<Value> {
		let values = self.get(scope)?;
		values.get(usize::from(output)).cloned().ok_or_else(|| {
			Error::BadArgument(format!(
				"output {output} requested from a cell with {} outputs",
				values.len()
			))
		})
	}

	fn evaluate(&self, scope: &Scope) -> Result<Values> {
		match &self.kind {
			CellKind::Provide(def) => {
				tracing::trace!(cell = self.id, origin = %def.origin, "evaluating binding");
				call_provider(&*def.provider, &def.origin, scope)
			}
			CellKind::Reduce(key, _) => {
				tracing::trace!(cell = self.id, key = %key, "reducing bindings");
				reducer::combine(scope, *key).map(|value| smallvec![value])
			}
		}
	}
}

/// Resolves `provider`'s inputs from `scope` and calls it.
pub(crate) fn call_provider(provider: &dyn Provider, origin: &Origin, scope: &Scope) -> Result<Values> {
	let inputs = provider.inputs();
	// Zero and one argument providers skip the argument buffer.
	let called = match inputs {
		[] => provider.call(&[]),
		[only] => {
			let arg = scope.resolve_for(*only, Some(origin))?;
			provider.call(std::slice::from_ref(&arg))
		}
		_ => {
			let args = inputs
				.iter()
				.map(|key| scope.resolve_for(*key, Some(origin)))
				.collect::<Result<SmallVec<[Value; 4]>>>()?;
			provider.call(&args)
		}
	};
	let values = called.map_err(|source| Error::Provider {
		origin: origin.clone(),
		source,
	})?;
	if values.len() != provider.outputs().len() {
		return Err(Error::definition(
			origin,
			format!(
				"provider returned {} values for {} declared outputs",
				values.len(),
				provider.outputs().len()
			),
		));
	}
	Ok(values)
}
