//! Self-evolving root scope with atomic publication.
//!
//! # Mental model
//!
//! * [`Evolving`] owns one atomically swapped pointer to the current [`Scope`].
//! * Deriving forks the current snapshot and publishes the result with CAS.
//! * A failed CAS means another thread published first; the loser retries
//!   against the newer snapshot, so no derivation is lost.
//! * The root scope binds a [`Deriver`] that points back at the same pointer
//!   through a weak reference, so providers can derive without an ownership cycle.
//!
//! # Invariants
//!
//! * Every returned scope is a fork of a snapshot that was current when it was
//!   read, and the current scope after return is at least as new as it.
//! * Retrying is bounded; past the ceiling the call fails with
//!   [`Error::ContentionExceeded`].

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

use crate::binding::Binding;
use crate::error::{Error, Result};
use crate::provider::ProviderFn;
use crate::scope::Scope;

/// Default retry ceiling for one derivation.
pub const MAX_DERIVE_ATTEMPTS: usize = 1024;

struct Shared {
	current: ArcSwap<Scope>,
	max_attempts: usize,
}

/// Owner of an evolving scope.
#[derive(Clone)]
pub struct Evolving {
	shared: Arc<Shared>,
}

/// Handle bound inside every version of an evolving scope.
///
/// Holds the shared pointer weakly; deriving after the [`Evolving`] owner is
/// dropped fails with [`Error::BadArgument`].
#[derive(Clone)]
pub struct Deriver {
	shared: Weak<Shared>,
}

impl std::fmt::Debug for Evolving {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Evolving")
			.field("current", &self.shared.current.load().signature())
			.field("max_attempts", &self.shared.max_attempts)
			.finish()
	}
}

impl std::fmt::Debug for Deriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Deriver")
			.field("attached", &(self.shared.strong_count() > 0))
			.finish()
	}
}

impl Evolving {
	/// Builds the root scope from `bindings` plus a [`Deriver`] for itself.
	pub fn new(bindings: impl IntoIterator<Item = Binding>) -> Result<Self> {
		Self::with_max_attempts(bindings, MAX_DERIVE_ATTEMPTS)
	}

	/// Like [`Evolving::new`] with a custom retry ceiling.
	pub fn with_max_attempts(
		bindings: impl IntoIterator<Item = Binding>,
		max_attempts: usize,
	) -> Result<Self> {
		let shared = Arc::new(Shared {
			current: ArcSwap::from_pointee(Scope::empty()),
			max_attempts,
		});
		let deriver = Deriver {
			shared: Arc::downgrade(&shared),
		};
		let root = Scope::new(
			bindings
				.into_iter()
				.chain([Binding::value(deriver).named("evolving scope deriver")]),
		)?;
		shared.current.store(Arc::new(root));
		Ok(Self { shared })
	}

	/// Returns the current version.
	pub fn current(&self) -> Scope {
		Scope::clone(&self.shared.current.load())
	}

	/// Returns a handle that can derive from this scope without owning it.
	pub fn deriver(&self) -> Deriver {
		Deriver {
			shared: Arc::downgrade(&self.shared),
		}
	}

	/// Forks the current version with `bindings` and installs the result.
	pub fn derive(&self, bindings: impl IntoIterator<Item = Binding>) -> Result<Scope> {
		let bindings: Vec<Binding> = bindings.into_iter().collect();
		evolve(&self.shared, |_| Ok(bindings.clone()))
	}

	/// Calls `f` against the current version to get bindings, forks with them and
	/// installs the result. `f` is called again on every retry.
	pub fn derive_from_call<F, Args, B>(&self, f: F) -> Result<Scope>
	where
		F: ProviderFn<Args, Output = B>,
		B: IntoIterator<Item = Binding>,
	{
		evolve(&self.shared, |scope| Ok(f.call_scope(scope)?.into_iter().collect()))
	}
}

impl Deriver {
	fn shared(&self) -> Result<Arc<Shared>> {
		self.shared
			.upgrade()
			.ok_or_else(|| Error::BadArgument("evolving scope was dropped".into()))
	}

	/// See [`Evolving::derive`].
	pub fn derive(&self, bindings: impl IntoIterator<Item = Binding>) -> Result<Scope> {
		let shared = self.shared()?;
		let bindings: Vec<Binding> = bindings.into_iter().collect();
		evolve(&shared, |_| Ok(bindings.clone()))
	}

	/// See [`Evolving::derive_from_call`].
	pub fn derive_from_call<F, Args, B>(&self, f: F) -> Result<Scope>
	where
		F: ProviderFn<Args, Output = B>,
		B: IntoIterator<Item = Binding>,
	{
		let shared = self.shared()?;
		evolve(&shared, |scope| Ok(f.call_scope(scope)?.into_iter().collect()))
	}
}

fn evolve(shared: &Shared, mut bindings_for: impl FnMut(&Scope) -> Result<Vec<Binding>>) -> Result<Scope> {
	for attempt in 1..=shared.max_attempts {
		let old = shared.current.load_full();
		let derived = old.fork(bindings_for(&old)?)?;
		let prev = shared.current.compare_and_swap(&old, Arc::new(derived.clone()));
		if Arc::ptr_eq(&prev, &old) {
			return Ok(derived);
		}
		// CAS failed, retry with the newer scope
		tracing::trace!(attempt, "evolving scope moved, retrying derivation");
	}
	tracing::warn!(attempts = shared.max_attempts, "evolving scope retry ceiling reached");
	Err(Error::ContentionExceeded {
		attempts: shared.max_attempts,
	})
}

#[cfg(test)]
mod tests;
