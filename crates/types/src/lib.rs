//! Interned runtime type keys.
//!
//! # Purpose
//!
//! Turn runtime type descriptors ([`TypeId`] plus a diagnostic name) into compact
//! [`TypeKey`]s that are cheap to compare, hash and sort, and map them back again.
//!
//! # Mental model
//!
//! * Readers load an immutable tables snapshot and look up keys without locking.
//! * The first sighting of a type takes the write lock, re-checks, then publishes a
//!   replacement snapshot containing both directions of the mapping at once.
//! * Keys are dense indices into the reverse table. They are never reused or freed.
//!
//! # Invariants
//!
//! * One type maps to exactly one key, even when several threads intern it for the
//!   first time concurrently (see `tests::concurrent_first_use_agrees`).
//! * Reverse lookup is visible no later than forward lookup: both live in the same
//!   published snapshot, so a reader that observed a key can always resolve it.

use std::any::{TypeId, type_name};
use std::fmt;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Compact identity of an interned runtime type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(u32);

impl TypeKey {
	/// Interns `T` in the global registry and returns its key.
	#[inline]
	pub fn of<T: ?Sized + 'static>() -> Self {
		TypeRegistry::global().intern::<T>()
	}

	/// Returns the raw dense index.
	#[inline]
	pub const fn as_u32(self) -> u32 {
		self.0
	}

	/// Returns the descriptor this key was interned from in the global registry.
	///
	/// # Panics
	///
	/// Panics if the key was never produced by the global registry.
	pub fn info(self) -> TypeInfo {
		TypeRegistry::global().resolve(self)
	}

	/// Returns the type name recorded for this key in the global registry.
	pub fn name(self) -> &'static str {
		TypeRegistry::global()
			.try_resolve(self)
			.map_or("<unknown>", |info| info.name)
	}
}

impl fmt::Debug for TypeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "TypeKey({}:{})", self.0, self.name())
	}
}

impl fmt::Display for TypeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Runtime type descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TypeInfo {
	pub id: TypeId,
	pub name: &'static str,
}

impl TypeInfo {
	pub fn of<T: ?Sized + 'static>() -> Self {
		Self {
			id: TypeId::of::<T>(),
			name: type_name::<T>(),
		}
	}
}

/// Published registry state. Both directions are swapped in together.
#[derive(Default, Clone)]
struct Tables {
	by_id: FxHashMap<TypeId, TypeKey>,
	infos: Vec<TypeInfo>,
}

/// Append-only intern table for runtime types.
pub struct TypeRegistry {
	tables: ArcSwap<Tables>,
	write: Mutex<()>,
}

static GLOBAL: LazyLock<TypeRegistry> = LazyLock::new(TypeRegistry::new);

impl Default for TypeRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl TypeRegistry {
	/// Creates an empty registry, independent of the global one.
	pub fn new() -> Self {
		Self {
			tables: ArcSwap::from_pointee(Tables::default()),
			write: Mutex::new(()),
		}
	}

	/// Returns the process-wide registry used by [`TypeKey::of`].
	pub fn global() -> &'static TypeRegistry {
		&GLOBAL
	}

	/// Interns `T`, returning the existing key if it was seen before.
	#[inline]
	pub fn intern<T: ?Sized + 'static>(&self) -> TypeKey {
		self.intern_info(TypeInfo::of::<T>())
	}

	/// Interns a descriptor. Idempotent and thread-safe.
	pub fn intern_info(&self, info: TypeInfo) -> TypeKey {
		if let Some(key) = self.tables.load().by_id.get(&info.id) {
			return *key;
		}

		let _guard = self.write.lock();
		// Another writer may have published this type while we waited.
		let current = self.tables.load_full();
		if let Some(key) = current.by_id.get(&info.id) {
			return *key;
		}

		let index = u32::try_from(current.infos.len()).unwrap_or_else(|_| {
			panic!("type registry exhausted while interning {}", info.name)
		});
		let key = TypeKey(index);
		let mut next = Tables::clone(&current);
		next.infos.push(info);
		next.by_id.insert(info.id, key);
		self.tables.store(Arc::new(next));
		key
	}

	/// Returns the key for `id` if it was interned.
	pub fn lookup(&self, id: TypeId) -> Option<TypeKey> {
		self.tables.load().by_id.get(&id).copied()
	}

	/// Returns the descriptor for `key`.
	///
	/// # Panics
	///
	/// Panics if `key` was never interned by this registry. Keys only come from
	/// [`TypeRegistry::intern`], so this indicates a key from a different registry.
	pub fn resolve(&self, key: TypeKey) -> TypeInfo {
		self.try_resolve(key)
			.unwrap_or_else(|| panic!("type key {} was never interned", key.0))
	}

	/// Returns the descriptor for `key`, or `None` if it was never interned.
	pub fn try_resolve(&self, key: TypeKey) -> Option<TypeInfo> {
		self.tables.load().infos.get(key.0 as usize).copied()
	}

	/// Returns the number of interned types.
	pub fn len(&self) -> usize {
		self.tables.load().infos.len()
	}

	/// Returns true if nothing was interned yet.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
