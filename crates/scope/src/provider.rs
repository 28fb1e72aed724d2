//! Providers: the functions and fixed values that bindings are built from.
//!
//! A [`Provider`] declares its input and output type keys up front. Inputs are the
//! edges the fork compiler validates; outputs are the keys a binding contributes.
//! Typed closures are adapted through [`ProviderFn`], implemented for `Fn` of up
//! to eight arguments. Arguments are resolved by type and cloned out of the scope.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::{SmallVec, smallvec};
use strata_types::TypeKey;

use crate::error::{ProviderError, Result};
use crate::reducer::{self, Reduction};
use crate::scope::Scope;

/// Type-erased resolved value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Output values of one provider call, positionally aligned with [`Provider::outputs`].
pub type Values = SmallVec<[Value; 2]>;

/// Declared input keys.
pub type Inputs = SmallVec<[TypeKey; 4]>;

/// Declared output keys.
pub type OutputKeys = SmallVec<[TypeKey; 2]>;

/// Something that can produce values for a binding.
pub trait Provider: Send + Sync + 'static {
	/// Keys this provider reads, in argument order.
	fn inputs(&self) -> &[TypeKey];

	/// Keys this provider binds, in output order.
	fn outputs(&self) -> &[TypeKey];

	/// Identity of the provider's concrete type.
	///
	/// Two providers of the same concrete type with the same declared keys have the
	/// same shape, which is what fork plans are cached by.
	fn provider_type(&self) -> TypeId;

	/// Calls the provider with arguments resolved for [`Provider::inputs`].
	fn call(&self, args: &[Value]) -> Result<Values, ProviderError>;

	/// Human-readable description for diagnostics.
	fn describe(&self) -> &'static str {
		"provider"
	}
}

/// Structural identity of a provider.
///
/// Fork plans are cached by shape, so the shape also records how each output
/// combines at the time it is taken. Registering a reducer changes the shape of
/// later bindings of that type and they never reuse a plan compiled before it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
	pub provider: TypeId,
	pub inputs: Inputs,
	pub outputs: OutputKeys,
	/// Reducibility of each output, aligned with `outputs`.
	pub reductions: SmallVec<[Option<Reduction>; 2]>,
}

impl Shape {
	pub fn of(provider: &dyn Provider) -> Self {
		let outputs: OutputKeys = provider.outputs().into();
		Self {
			provider: provider.provider_type(),
			inputs: provider.inputs().into(),
			reductions: outputs.iter().map(|key| reducer::reduction(*key)).collect(),
			outputs,
		}
	}

	/// Reducibility of the output at `position`.
	pub fn reduction(&self, position: usize) -> Option<Reduction> {
		self.reductions.get(position).copied().flatten()
	}
}

/// Argument value did not have the type its key promised.
#[derive(Debug, thiserror::Error)]
#[error("argument {position} is not a {expected}")]
pub struct ArgumentMismatch {
	pub position: usize,
	pub expected: &'static str,
}

fn downcast_arg<A: Clone + 'static>(args: &[Value], position: usize) -> Result<A, ProviderError> {
	args.get(position)
		.and_then(|value| value.downcast_ref::<A>())
		.cloned()
		.ok_or_else(|| {
			Arc::new(ArgumentMismatch {
				position,
				expected: std::any::type_name::<A>(),
			}) as ProviderError
		})
}

/// Typed function whose arguments are resolved by type.
///
/// `Args` is the argument tuple; it only exists to keep the arity impls apart.
pub trait ProviderFn<Args>: Send + Sync + 'static {
	type Output;

	/// Keys of the argument types, in order.
	fn input_keys() -> Inputs;

	/// Calls with already resolved, type-erased arguments.
	fn call_values(&self, args: &[Value]) -> Result<Self::Output, ProviderError>;

	/// Resolves each argument from `scope` and calls.
	fn call_scope(&self, scope: &Scope) -> Result<Self::Output>;
}

macro_rules! impl_provider_fn {
	($($arg:ident => $idx:tt),*) => {
		impl<Func, Ret, $($arg,)*> ProviderFn<($($arg,)*)> for Func
		where
			Func: Fn($($arg),*) -> Ret + Send + Sync + 'static,
			$($arg: Clone + Send + Sync + 'static,)*
		{
			type Output = Ret;

			fn input_keys() -> Inputs {
				smallvec![$(TypeKey::of::<$arg>()),*]
			}

			#[allow(non_snake_case, unused_variables)]
			fn call_values(&self, args: &[Value]) -> Result<Ret, ProviderError> {
				$(let $arg = downcast_arg::<$arg>(args, $idx)?;)*
				Ok((self)($($arg),*))
			}

			#[allow(non_snake_case, unused_variables)]
			fn call_scope(&self, scope: &Scope) -> Result<Ret> {
				$(let $arg = scope.get::<$arg>()?;)*
				Ok((self)($($arg),*))
			}
		}
	};
}

impl_provider_fn!();
impl_provider_fn!(A0 => 0);
impl_provider_fn!(A0 => 0, A1 => 1);
impl_provider_fn!(A0 => 0, A1 => 1, A2 => 2);
impl_provider_fn!(A0 => 0, A1 => 1, A2 => 2, A3 => 3);
impl_provider_fn!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4);
impl_provider_fn!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5);
impl_provider_fn!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6);
impl_provider_fn!(A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6, A7 => 7);

/// Marker: the return value is a single output.
pub enum Single {}
/// Marker: the return value is a tuple of outputs.
pub enum Tuple {}
/// Marker: the return value is `Result<T, E>` with a single output.
pub enum Fallible {}

/// Conversion of a provider's return value into bound outputs.
///
/// `M` picks the interpretation, so a tuple can be bound either as one value or
/// as several.
pub trait Returns<M>: Sized {
	fn output_keys() -> OutputKeys;

	fn into_values(self) -> Result<Values, ProviderError>;
}

impl<T: Send + Sync + 'static> Returns<Single> for T {
	fn output_keys() -> OutputKeys {
		smallvec![TypeKey::of::<T>()]
	}

	fn into_values(self) -> Result<Values, ProviderError> {
		Ok(smallvec![Arc::new(self) as Value])
	}
}

impl<T, E> Returns<Fallible> for Result<T, E>
where
	T: Send + Sync + 'static,
	E: std::error::Error + Send + Sync + 'static,
{
	fn output_keys() -> OutputKeys {
		smallvec![TypeKey::of::<T>()]
	}

	fn into_values(self) -> Result<Values, ProviderError> {
		match self {
			Ok(value) => Ok(smallvec![Arc::new(value) as Value]),
			Err(err) => Err(Arc::new(err)),
		}
	}
}

macro_rules! impl_returns_tuple {
	($($out:ident => $idx:tt),*) => {
		impl<$($out: Send + Sync + 'static,)*> Returns<Tuple> for ($($out,)*) {
			fn output_keys() -> OutputKeys {
				smallvec![$(TypeKey::of::<$out>()),*]
			}

			#[allow(clippy::unused_unit)]
			fn into_values(self) -> Result<Values, ProviderError> {
				Ok(smallvec![$(Arc::new(self.$idx) as Value),*])
			}
		}
	};
}

impl_returns_tuple!();
impl_returns_tuple!(O0 => 0);
impl_returns_tuple!(O0 => 0, O1 => 1);
impl_returns_tuple!(O0 => 0, O1 => 1, O2 => 2);
impl_returns_tuple!(O0 => 0, O1 => 1, O2 => 2, O3 => 3);
impl_returns_tuple!(O0 => 0, O1 => 1, O2 => 2, O3 => 3, O4 => 4);
impl_returns_tuple!(O0 => 0, O1 => 1, O2 => 2, O3 => 3, O4 => 4, O5 => 5);

/// Adapter from a typed closure to [`Provider`].
pub struct FnProvider<F, Args, M> {
	f: F,
	inputs: Inputs,
	outputs: OutputKeys,
	_marker: PhantomData<fn() -> (Args, M)>,
}

impl<F, Args, M> FnProvider<F, Args, M>
where
	F: ProviderFn<Args>,
	F::Output: Returns<M>,
{
	pub fn new(f: F) -> Self {
		Self {
			f,
			inputs: F::input_keys(),
			outputs: <F::Output as Returns<M>>::output_keys(),
			_marker: PhantomData,
		}
	}
}

impl<F, Args, M> Provider for FnProvider<F, Args, M>
where
	F: ProviderFn<Args>,
	F::Output: Returns<M>,
	Args: 'static,
	M: 'static,
{
	fn inputs(&self) -> &[TypeKey] {
		&self.inputs
	}

	fn outputs(&self) -> &[TypeKey] {
		&self.outputs
	}

	fn provider_type(&self) -> TypeId {
		TypeId::of::<F>()
	}

	fn call(&self, args: &[Value]) -> Result<Values, ProviderError> {
		self.f.call_values(args)?.into_values()
	}

	fn describe(&self) -> &'static str {
		std::any::type_name::<F>()
	}
}

/// Fixed value bound to its own type. Never reads anything.
pub struct ValueProvider<T> {
	value: Value,
	outputs: [TypeKey; 1],
	_marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ValueProvider<T> {
	pub fn new(value: T) -> Self {
		Self {
			value: Arc::new(value),
			outputs: [TypeKey::of::<T>()],
			_marker: PhantomData,
		}
	}
}

impl<T: Send + Sync + 'static> Provider for ValueProvider<T> {
	fn inputs(&self) -> &[TypeKey] {
		&[]
	}

	fn outputs(&self) -> &[TypeKey] {
		&self.outputs
	}

	fn provider_type(&self) -> TypeId {
		TypeId::of::<Self>()
	}

	fn call(&self, _args: &[Value]) -> Result<Values, ProviderError> {
		Ok(smallvec![self.value.clone()])
	}

	fn describe(&self) -> &'static str {
		std::any::type_name::<T>()
	}
}
