//! Integration tests for sharing scopes across threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use strata_scope::{Binding, Deriver, Error, Evolving, Outputs, PlanCache, Scope};

const THREADS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
struct Source(u64);
#[derive(Debug, Clone, PartialEq)]
struct Tag(&'static str);
#[derive(Debug, Clone, PartialEq)]
struct Counter(i64);

#[derive(Debug, thiserror::Error)]
#[error("source unavailable")]
struct Unavailable;

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_public_types_are_send_sync() {
	assert_send_sync::<Scope>();
	assert_send_sync::<Binding>();
	assert_send_sync::<Error>();
	assert_send_sync::<Outputs>();
	assert_send_sync::<Evolving>();
	assert_send_sync::<Deriver>();
	assert_send_sync::<PlanCache>();
}

#[test]
fn test_source_runs_once_under_contention() {
	let calls = Arc::new(AtomicUsize::new(0));
	let seen = calls.clone();
	let scope = Scope::new([Binding::func(move || {
		seen.fetch_add(1, Ordering::SeqCst);
		thread::yield_now();
		Source(11)
	})])
	.unwrap();
	let barrier = Barrier::new(THREADS);

	thread::scope(|s| {
		for n in 0..THREADS {
			let scope = &scope;
			let barrier = &barrier;
			s.spawn(move || {
				barrier.wait();
				match n % 3 {
					0 => assert_eq!(scope.get::<Source>().unwrap(), Source(11)),
					1 => {
						let mut source = Source(0);
						scope.assign(&mut source).unwrap();
						assert_eq!(source, Source(11));
					}
					_ => {
						let forked = scope.fork([Binding::value(Tag("thread"))]).unwrap();
						assert_eq!(forked.get::<Source>().unwrap(), Source(11));
					}
				}
			});
		}
	});

	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_forks_of_one_scope() {
	let scope = Scope::new([
		Binding::value(Source(1)),
		Binding::func(|source: Source| Counter(source.0 as i64 * 10)),
	])
	.unwrap();

	let results: Vec<i64> = thread::scope(|s| {
		let handles: Vec<_> = (0..THREADS as u64)
			.map(|n| {
				let scope = &scope;
				s.spawn(move || {
					let forked = scope.fork([Binding::value(Source(n))]).unwrap();
					forked.get::<Counter>().unwrap().0
				})
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});

	let expected: Vec<i64> = (0..THREADS as i64).map(|n| n * 10).collect();
	assert_eq!(results, expected);
	assert_eq!(scope.get::<Counter>().unwrap(), Counter(10));
}

#[test]
fn test_failure_is_shared_by_concurrent_readers() {
	let calls = Arc::new(AtomicUsize::new(0));
	let seen = calls.clone();
	let scope = Scope::new([Binding::try_func(move || -> Result<Source, Unavailable> {
		seen.fetch_add(1, Ordering::SeqCst);
		thread::yield_now();
		Err(Unavailable)
	})])
	.unwrap();
	let barrier = Barrier::new(THREADS);

	let errors: Vec<Error> = thread::scope(|s| {
		let handles: Vec<_> = (0..THREADS)
			.map(|_| {
				s.spawn(|| {
					barrier.wait();
					scope.get::<Source>().unwrap_err()
				})
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});

	assert_eq!(calls.load(Ordering::SeqCst), 1);
	let first = errors[0].to_string();
	assert!(first.contains("source unavailable"), "{first}");
	assert!(errors.iter().all(|err| err.to_string() == first));
}

#[test]
fn test_failure_stays_until_reset() {
	#[derive(Debug, Clone)]
	struct Attempt(u32);

	let calls = Arc::new(AtomicUsize::new(0));
	let seen = calls.clone();
	let scope = Scope::new([
		Binding::value(Attempt(0)),
		Binding::try_func(move |attempt: Attempt| -> Result<Source, Unavailable> {
			seen.fetch_add(1, Ordering::SeqCst);
			if attempt.0 == 0 { Err(Unavailable) } else { Ok(Source(u64::from(attempt.0))) }
		}),
	])
	.unwrap();

	assert!(matches!(scope.get::<Source>(), Err(Error::Provider { .. })));
	assert!(matches!(scope.get::<Source>(), Err(Error::Provider { .. })));
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	// A fork that does not touch the binding shares the poisoned cell.
	let unrelated = scope.fork([Binding::value(Tag("x"))]).unwrap();
	assert!(unrelated.get::<Source>().is_err());
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	// Overriding an input resets the cell and evaluates it again.
	let retried = scope.fork([Binding::value(Attempt(3))]).unwrap();
	assert_eq!(retried.get::<Source>().unwrap(), Source(3));
	assert_eq!(calls.load(Ordering::SeqCst), 2);
	assert!(scope.get::<Source>().is_err());
}

#[test]
fn test_concurrent_derive_loses_no_update() {
	let evolving = Evolving::new([Binding::value(Counter(0))]).unwrap();
	let barrier = Barrier::new(THREADS);

	thread::scope(|s| {
		for n in 1..=THREADS as i64 {
			let evolving = &evolving;
			let barrier = &barrier;
			s.spawn(move || {
				barrier.wait();
				for _ in 0..8 {
					evolving
						.derive_from_call(move |counter: Counter| [Binding::value(Counter(counter.0 + n))])
						.unwrap();
				}
			});
		}
	});

	let expected: i64 = (1..=THREADS as i64).map(|n| n * 8).sum();
	assert_eq!(evolving.current().get::<Counter>().unwrap(), Counter(expected));
}

#[test]
fn test_derive_from_inside_a_provider() {
	let evolving = Evolving::new([Binding::value(Counter(1))]).unwrap();
	let scope = evolving.current();
	let derived = scope
		.call(|deriver: Deriver, counter: Counter| deriver.derive([Binding::value(Counter(counter.0 + 1))]))
		.unwrap()
		.unwrap();
	assert_eq!(derived.get::<Counter>().unwrap(), Counter(2));
	assert_eq!(evolving.current().get::<Counter>().unwrap(), Counter(2));
}
