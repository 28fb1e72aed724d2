//! Invocation against a scope and moving results into caller slots.
//!
//! [`crate::Scope::invoke`] is the generic path: inputs resolved by key, outputs
//! returned tagged by key in [`Outputs`]. From there, [`Outputs::extract`] maps
//! by position and fails on arity or type mismatch, while [`Outputs::assign`] and
//! [`crate::Scope::assign`] map by type and skip anything not present.

use smallvec::SmallVec;
use strata_types::TypeKey;

use crate::binding::Origin;
use crate::error::{Error, Result};
use crate::init::call_provider;
use crate::provider::{Provider, Value};
use crate::scope::Scope;

pub(crate) fn invoke(scope: &Scope, provider: &dyn Provider, origin: Origin) -> Result<Outputs> {
	let values = call_provider(provider, &origin, scope)?;
	Ok(Outputs {
		entries: provider.outputs().iter().copied().zip(values).collect(),
	})
}

/// Values returned by an invocation, tagged by type key, in output order.
#[derive(Clone, Default)]
pub struct Outputs {
	entries: SmallVec<[(TypeKey, Value); 2]>,
}

impl std::fmt::Debug for Outputs {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list().entries(self.entries.iter().map(|(key, _)| key)).finish()
	}
}

impl Outputs {
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
		self.entries.iter().map(|(key, _)| *key)
	}

	/// Returns the first output of type `T`.
	pub fn get<T: Clone + 'static>(&self) -> Option<T> {
		let key = TypeKey::of::<T>();
		self.entries
			.iter()
			.find(|(k, _)| *k == key)
			.and_then(|(_, value)| value.downcast_ref::<T>().cloned())
	}

	/// Returns the output at `index`.
	pub fn value(&self, index: usize) -> Option<&Value> {
		self.entries.get(index).map(|(_, value)| value)
	}

	/// Maps outputs to `T` by position.
	pub fn extract<T: Extract>(&self) -> Result<T> {
		T::extract(&self.entries)
	}

	/// Fills each target whose type is among the outputs.
	pub fn assign<T: Targets>(&self, targets: T) -> Result<()> {
		targets.assign_from(&|key: TypeKey| {
			Ok(self
				.entries
				.iter()
				.find(|(k, _)| *k == key)
				.map(|(_, value)| value.clone()))
		})
	}
}

/// Lookup used by [`Targets`]: `Ok(None)` means "not bound, skip".
pub type Source<'a> = dyn Fn(TypeKey) -> Result<Option<Value>> + 'a;

/// Caller-supplied slots filled by type.
pub trait Targets {
	fn assign_from(self, source: &Source<'_>) -> Result<()>;
}

fn fill<T: Clone + 'static>(slot: &mut T, source: &Source<'_>) -> Result<()> {
	if let Some(value) = source(TypeKey::of::<T>())? {
		*slot = value.downcast_ref::<T>().cloned().ok_or_else(|| {
			Error::BadArgument(format!("target is not a {}", std::any::type_name::<T>()))
		})?;
	}
	Ok(())
}

impl<T: Clone + 'static> Targets for &mut T {
	fn assign_from(self, source: &Source<'_>) -> Result<()> {
		fill(self, source)
	}
}

macro_rules! impl_targets {
	($($t:ident => $idx:tt),+) => {
		impl<$($t: Clone + 'static),+> Targets for ($(&mut $t,)+) {
			fn assign_from(self, source: &Source<'_>) -> Result<()> {
				$(fill(self.$idx, source)?;)+
				Ok(())
			}
		}
	};
}

impl_targets!(T0 => 0);
impl_targets!(T0 => 0, T1 => 1);
impl_targets!(T0 => 0, T1 => 1, T2 => 2);
impl_targets!(T0 => 0, T1 => 1, T2 => 2, T3 => 3);
impl_targets!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4);
impl_targets!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5);

/// Positional conversion from invocation outputs.
pub trait Extract: Sized {
	fn extract(outputs: &[(TypeKey, Value)]) -> Result<Self>;
}

fn take<T: Clone + 'static>(outputs: &[(TypeKey, Value)], index: usize) -> Result<T> {
	let (key, value) = &outputs[index];
	value.downcast_ref::<T>().cloned().ok_or_else(|| {
		Error::BadArgument(format!(
			"output {index} is a {key}, not a {}",
			std::any::type_name::<T>()
		))
	})
}

macro_rules! impl_extract {
	($arity:expr; $($t:ident => $idx:tt),+) => {
		impl<$($t: Clone + 'static),+> Extract for ($($t,)+) {
			fn extract(outputs: &[(TypeKey, Value)]) -> Result<Self> {
				if outputs.len() != $arity {
					return Err(Error::BadArgument(format!(
						"expected {} outputs, got {}",
						$arity,
						outputs.len()
					)));
				}
				Ok(($(take::<$t>(outputs, $idx)?,)+))
			}
		}
	};
}

impl_extract!(1; T0 => 0);
impl_extract!(2; T0 => 0, T1 => 1);
impl_extract!(3; T0 => 0, T1 => 1, T2 => 2);
impl_extract!(4; T0 => 0, T1 => 1, T2 => 2, T3 => 3);
impl_extract!(5; T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4);
impl_extract!(6; T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5);
