use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Deriver, Evolving};
use crate::binding::Binding;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
struct Count(u64);

#[test]
fn test_derive_installs_new_version() {
	let evolving = Evolving::new([Binding::value(Count(0))]).unwrap();
	let root = evolving.current();
	let derived = evolving.derive([Binding::value(Count(5))]).unwrap();

	assert_eq!(derived.get::<Count>().unwrap(), Count(5));
	assert_eq!(evolving.current().signature(), derived.signature());
	assert_eq!(root.get::<Count>().unwrap(), Count(0));
}

#[test]
fn test_derive_from_call_reads_current() {
	let evolving = Evolving::new([Binding::value(Count(1))]).unwrap();
	for _ in 0..3 {
		evolving
			.derive_from_call(|count: Count| [Binding::value(Count(count.0 * 2))])
			.unwrap();
	}
	assert_eq!(evolving.current().get::<Count>().unwrap(), Count(8));
}

#[test]
fn test_deriver_is_bound_in_every_version() {
	let evolving = Evolving::new([Binding::value(Count(0))]).unwrap();
	let deriver = evolving.current().get::<Deriver>().unwrap();
	deriver.derive([Binding::value(Count(3))]).unwrap();
	let next = evolving.current();
	assert_eq!(next.get::<Count>().unwrap(), Count(3));
	assert!(next.contains::<Deriver>());
}

#[test]
fn test_deriver_derives_from_call() {
	let evolving = Evolving::new([Binding::value(Count(2))]).unwrap();
	let deriver = evolving.deriver();
	let derived = deriver
		.derive_from_call(|count: Count| [Binding::value(Count(count.0 + 1))])
		.unwrap();
	assert_eq!(derived.get::<Count>().unwrap(), Count(3));
	assert_eq!(evolving.current().signature(), derived.signature());
}

#[test]
fn test_deriver_outliving_owner_fails() {
	let evolving = Evolving::new([Binding::value(Count(0))]).unwrap();
	let deriver = evolving.deriver();
	drop(evolving);
	let err = deriver.derive([Binding::value(Count(1))]).unwrap_err();
	assert!(matches!(err, Error::BadArgument(_)), "{err}");
}

#[test]
fn test_retry_ceiling() {
	let evolving = Evolving::with_max_attempts([Binding::value(Count(0))], 0).unwrap();
	let err = evolving.derive([Binding::value(Count(1))]).unwrap_err();
	assert!(matches!(err, Error::ContentionExceeded { attempts: 0 }), "{err}");
	assert_eq!(evolving.current().get::<Count>().unwrap(), Count(0));
}

#[test]
fn test_retry_ceiling_under_contention() {
	let evolving = Evolving::with_max_attempts([Binding::value(Count(0))], 3).unwrap();
	let calls = Arc::new(AtomicUsize::new(0));
	let seen = calls.clone();
	let err = evolving
		.derive_from_call(move |deriver: Deriver, count: Count| {
			seen.fetch_add(1, Ordering::SeqCst);
			// Another writer publishes between this read and the CAS.
			deriver.derive([Binding::value(Count(count.0 + 1))]).unwrap();
			[Binding::value(Count(100))]
		})
		.unwrap_err();
	assert!(matches!(err, Error::ContentionExceeded { attempts: 3 }), "{err}");
	assert_eq!(calls.load(Ordering::SeqCst), 3);
	assert_eq!(evolving.current().get::<Count>().unwrap(), Count(3));
}

#[test]
fn test_failed_derive_keeps_current() {
	let evolving = Evolving::new([Binding::value(Count(0))]).unwrap();
	let before = evolving.current().signature();
	let err = evolving
		.derive([Binding::func(|missing: u128| Count(missing as u64))])
		.unwrap_err();
	assert!(matches!(err, Error::DependencyNotFound { .. }), "{err}");
	assert_eq!(evolving.current().signature(), before);
}
