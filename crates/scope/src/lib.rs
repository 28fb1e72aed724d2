//! Forkable dependency scopes with lazy, once-only evaluation.
//!
//! A [`Scope`] maps types to providers. Values are computed on first read and
//! cached in the scope. [`Scope::fork`] produces a new scope that extends or
//! overrides its base; bindings whose inputs did not change keep sharing their
//! cells (and cached values) with the base, everything downstream of an override
//! is evaluated again.
//!
//! ```
//! use strata_scope::{Binding, Scope};
//!
//! let base = Scope::new([
//! 	Binding::value(2_u32),
//! 	Binding::func(|n: u32| n.to_string()),
//! ])?;
//! let forked = base.fork([Binding::value(40_u32)])?;
//!
//! assert_eq!(base.get::<String>()?, "2");
//! assert_eq!(forked.get::<String>()?, "40");
//! # Ok::<(), strata_scope::Error>(())
//! ```

/// Bindings and their origins.
pub mod binding;
mod compile;
/// Error taxonomy.
pub mod error;
/// Self-evolving root scope.
pub mod evolve;
mod init;
/// Invocation outputs, extraction and assignment.
pub mod invoke;
/// Fork plans and the plan cache.
pub mod plan;
/// Provider trait and closure adapters.
pub mod provider;
/// Combining several bindings of one type.
pub mod reducer;
mod scope;
mod store;

pub use binding::{Binding, Origin};
pub use error::{Error, ProviderError, Result};
pub use evolve::{Deriver, Evolving, MAX_DERIVE_ATTEMPTS};
pub use invoke::{Extract, Outputs, Source, Targets};
pub use plan::{PlanCache, Signature};
pub use provider::{
	ArgumentMismatch, Fallible, FnProvider, Provider, ProviderFn, Returns, Shape, Single, Tuple,
	Value, ValueProvider, Values,
};
pub use reducer::{Callbacks, Concat, Reducer, Reduction};
pub use scope::{BindingInfo, MAX_LAYER_DEPTH, Scope};
pub use strata_types::{TypeInfo, TypeKey, TypeRegistry};
