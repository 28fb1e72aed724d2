//! Combining several bindings of one type.
//!
//! A type may be bound more than once in a scope only if it is reducible.
//! Reducibility is a property of the type, recorded once per process with
//! [`register`] (custom [`Reducer`]) or [`register_concat`] (the built-in
//! [`Concat`] combiner). The effective value is the left-to-right combination of
//! every binding's value, oldest first. It is computed once per reducer cell and
//! recomputed only when the cell is reset.
//!
//! A custom [`Reducer`] receives the scope it is evaluated in, so its cell is a
//! reader of the scope handle and gets a fresh cell in every fork. [`Concat`]
//! never sees the scope; its cell is shared with forks until a contributor
//! changes.

use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use strata_types::TypeKey;

use crate::binding::Origin;
use crate::error::{Error, Result};
use crate::provider::Value;
use crate::scope::Scope;
use crate::store::Slot;

/// Custom combination of every bound value of `Self`.
pub trait Reducer: Clone + Send + Sync + 'static {
	/// Combines `values`, oldest binding first. Always called with at least two.
	fn reduce(scope: &Scope, values: Vec<Self>) -> Self;
}

/// Associative concatenation, the built-in combiner.
pub trait Concat: Clone + Send + Sync + 'static {
	fn concat(self, other: Self) -> Self;
}

impl<T: Clone + Send + Sync + 'static> Concat for Vec<T> {
	fn concat(mut self, other: Self) -> Self {
		self.extend(other);
		self
	}
}

impl Concat for String {
	fn concat(mut self, other: Self) -> Self {
		self.push_str(&other);
		self
	}
}

type Callback<A, R> = Arc<dyn Fn(&A) -> R + Send + Sync>;

/// Callables that are invoked in sequence; concatenating two lists chains them.
pub struct Callbacks<A, R> {
	fns: Vec<Callback<A, R>>,
}

impl<A, R> Clone for Callbacks<A, R> {
	fn clone(&self) -> Self {
		Self {
			fns: self.fns.clone(),
		}
	}
}

impl<A, R> fmt::Debug for Callbacks<A, R> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Callbacks").field("len", &self.fns.len()).finish()
	}
}

impl<A, R> Callbacks<A, R> {
	pub fn new(f: impl Fn(&A) -> R + Send + Sync + 'static) -> Self {
		Self {
			fns: vec![Arc::new(f)],
		}
	}

	/// Calls every callable in order and collects the results.
	pub fn call(&self, arg: &A) -> Vec<R> {
		self.fns.iter().map(|f| f(arg)).collect()
	}

	pub fn len(&self) -> usize {
		self.fns.len()
	}

	pub fn is_empty(&self) -> bool {
		self.fns.is_empty()
	}
}

impl<A: 'static, R: 'static> Concat for Callbacks<A, R> {
	fn concat(mut self, other: Self) -> Self {
		self.fns.extend(other.fns);
		self
	}
}

/// How a reducible type combines its bindings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reduction {
	/// [`Concat`] in binding order.
	Concat,
	/// A [`Reducer`] impl, which may read the scope it runs in.
	Custom,
}

type ReduceFn = fn(&Scope, Vec<Value>) -> Result<Value>;

static REDUCERS: LazyLock<RwLock<FxHashMap<TypeKey, (Reduction, ReduceFn)>>> =
	LazyLock::new(|| RwLock::new(FxHashMap::default()));

/// Makes `T` reducible through its [`Reducer`] impl.
pub fn register<T: Reducer>() -> TypeKey {
	install(TypeKey::of::<T>(), Reduction::Custom, reduce_custom::<T>)
}

/// Makes `T` reducible through [`Concat`].
pub fn register_concat<T: Concat>() -> TypeKey {
	install(TypeKey::of::<T>(), Reduction::Concat, reduce_concat::<T>)
}

/// Returns how `key` combines, or `None` if it may be bound only once.
pub fn reduction(key: TypeKey) -> Option<Reduction> {
	REDUCERS.read().get(&key).map(|(reduction, _)| *reduction)
}

/// Returns true if `key` may be bound more than once.
pub fn is_reducible(key: TypeKey) -> bool {
	reduction(key).is_some()
}

fn install(key: TypeKey, reduction: Reduction, f: ReduceFn) -> TypeKey {
	// First registration wins; a type has one combiner for the life of the process.
	REDUCERS.write().entry(key).or_insert((reduction, f));
	key
}

fn downcast_all<T: Clone + 'static>(values: Vec<Value>) -> Result<Vec<T>> {
	values
		.iter()
		.map(|value| {
			value.downcast_ref::<T>().cloned().ok_or_else(|| {
				Error::BadArgument(format!("reduced value is not a {}", std::any::type_name::<T>()))
			})
		})
		.collect()
}

fn reduce_custom<T: Reducer>(scope: &Scope, values: Vec<Value>) -> Result<Value> {
	let values = downcast_all::<T>(values)?;
	Ok(Arc::new(T::reduce(scope, values)))
}

fn reduce_concat<T: Concat>(_scope: &Scope, values: Vec<Value>) -> Result<Value> {
	let combined = downcast_all::<T>(values)?
		.into_iter()
		.reduce(Concat::concat)
		.ok_or_else(|| Error::BadArgument("nothing to reduce".into()))?;
	Ok(Arc::new(combined))
}

/// Evaluates every binding of `key` visible in `scope` and combines them.
pub(crate) fn combine(scope: &Scope, key: TypeKey) -> Result<Value> {
	let run = scope
		.stack()
		.load(Slot::value(key))
		.ok_or_else(|| Error::not_found(key, None))?;
	let Some((_, reduce)) = REDUCERS.read().get(&key).copied() else {
		let origin = run
			.iter()
			.find_map(|entry| entry.cell.origin().cloned())
			.unwrap_or(Origin::Named("reducer".into()));
		return Err(Error::definition(
			&origin,
			format!("multiple definitions of {key} and no reducer registered"),
		));
	};
	let values = run
		.iter()
		.map(|entry| entry.cell.value(scope, entry.output))
		.collect::<Result<Vec<_>>>()?;
	reduce(scope, values)
}
