use std::sync::Arc;

use strata_types::TypeKey;

use crate::binding::Origin;

/// Boxed failure raised by a provider itself.
pub type ProviderError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by forking, resolving and invoking.
///
/// Every variant is fatal to the call that produced it. `Clone` lets a single
/// once-evaluation failure be handed to every waiter on the same cell.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// Malformed binding: no outputs, repeated outputs, or several bindings for a
	/// type that has no reducer.
	#[error("bad definition at {origin}: {reason}")]
	Definition { origin: Origin, reason: String },

	/// A required type is not bound in the scope.
	#[error("dependency not found: {key}{}", required_by_suffix(.required_by))]
	DependencyNotFound {
		key: TypeKey,
		required_by: Option<Origin>,
	},

	/// Bindings read each other's outputs in a cycle.
	#[error("dependency loop at {origin}: {}", format_path(.path))]
	DependencyLoop { origin: Origin, path: Vec<TypeKey> },

	/// Caller misuse of extraction or assignment.
	#[error("bad argument: {0}")]
	BadArgument(String),

	/// The evolving scope could not install a new version within the retry ceiling.
	#[error("loop or too much contention: gave up after {attempts} attempts")]
	ContentionExceeded { attempts: usize },

	/// The provider itself reported failure.
	#[error("provider at {origin} failed: {source}")]
	Provider {
		origin: Origin,
		#[source]
		source: ProviderError,
	},
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
	pub(crate) fn definition(origin: &Origin, reason: impl Into<String>) -> Self {
		Self::Definition {
			origin: origin.clone(),
			reason: reason.into(),
		}
	}

	pub(crate) fn not_found(key: TypeKey, required_by: Option<&Origin>) -> Self {
		Self::DependencyNotFound {
			key,
			required_by: required_by.cloned(),
		}
	}
}

fn required_by_suffix(origin: &Option<Origin>) -> String {
	match origin {
		Some(origin) => format!(", required by {origin}"),
		None => String::new(),
	}
}

fn format_path(path: &[TypeKey]) -> String {
	path.iter()
		.map(|key| key.name())
		.collect::<Vec<_>>()
		.join(" -> ")
}
