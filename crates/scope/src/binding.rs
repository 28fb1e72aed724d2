use std::borrow::Cow;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::provider::{
	Fallible, FnProvider, Provider, ProviderFn, Returns, Shape, Single, Tuple, ValueProvider,
};

/// Where a binding was declared. Used in every error that points at a binding.
#[derive(Clone, PartialEq, Eq)]
pub enum Origin {
	Location(&'static Location<'static>),
	Named(Cow<'static, str>),
}

impl fmt::Display for Origin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Origin::Location(loc) => write!(f, "{}:{}:{}", loc.file(), loc.line(), loc.column()),
			Origin::Named(name) => f.write_str(name),
		}
	}
}

impl fmt::Debug for Origin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

pub(crate) struct Definition {
	pub(crate) provider: Arc<dyn Provider>,
	pub(crate) origin: Origin,
}

/// A provider together with where it was declared, ready to be put into a scope.
///
/// Cloning is cheap. Every fork that receives a binding gives it a fresh
/// evaluation cell, so the same `Binding` can be forked into many scopes.
#[derive(Clone)]
pub struct Binding {
	pub(crate) def: Arc<Definition>,
}

impl fmt::Debug for Binding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Binding")
			.field("provider", &self.def.provider.describe())
			.field("inputs", &self.def.provider.inputs())
			.field("outputs", &self.def.provider.outputs())
			.field("origin", &self.def.origin)
			.finish()
	}
}

impl Binding {
	/// Wraps an arbitrary provider.
	#[track_caller]
	pub fn from_provider(provider: Arc<dyn Provider>) -> Self {
		Self {
			def: Arc::new(Definition {
				provider,
				origin: Origin::Location(Location::caller()),
			}),
		}
	}

	/// Binds a fixed value to its own type.
	#[track_caller]
	pub fn value<T: Send + Sync + 'static>(value: T) -> Self {
		Self::from_provider(Arc::new(ValueProvider::new(value)))
	}

	/// Binds the return type of `f`, computed lazily from `f`'s argument types.
	#[track_caller]
	pub fn func<F, Args>(f: F) -> Self
	where
		F: ProviderFn<Args>,
		F::Output: Returns<Single>,
		Args: 'static,
	{
		Self::from_provider(Arc::new(FnProvider::<F, Args, Single>::new(f)))
	}

	/// Like [`Binding::func`] for providers returning `Result<T, E>`.
	///
	/// An `Err` poisons the evaluation cell: every reader of this binding in the
	/// scope sees the same [`crate::Error::Provider`].
	#[track_caller]
	pub fn try_func<F, Args>(f: F) -> Self
	where
		F: ProviderFn<Args>,
		F::Output: Returns<Fallible>,
		Args: 'static,
	{
		Self::from_provider(Arc::new(FnProvider::<F, Args, Fallible>::new(f)))
	}

	/// Binds every element of the returned tuple to its own type.
	#[track_caller]
	pub fn funcs<F, Args>(f: F) -> Self
	where
		F: ProviderFn<Args>,
		F::Output: Returns<Tuple>,
		Args: 'static,
	{
		Self::from_provider(Arc::new(FnProvider::<F, Args, Tuple>::new(f)))
	}

	/// Replaces the recorded origin with a name.
	pub fn named(self, name: impl Into<Cow<'static, str>>) -> Self {
		Self {
			def: Arc::new(Definition {
				provider: self.def.provider.clone(),
				origin: Origin::Named(name.into()),
			}),
		}
	}

	pub fn origin(&self) -> &Origin {
		&self.def.origin
	}

	pub fn provider(&self) -> &Arc<dyn Provider> {
		&self.def.provider
	}

	pub(crate) fn shape(&self) -> Shape {
		Shape::of(&*self.def.provider)
	}
}
