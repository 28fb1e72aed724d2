//! Integration tests for reducible types bound across several forks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;
use strata_scope::{Binding, Callbacks, Concat, Reducer, Scope, reducer};

#[derive(Debug, Clone, PartialEq)]
struct Total(u64);

impl Reducer for Total {
	fn reduce(_scope: &Scope, values: Vec<Self>) -> Self {
		Total(values.iter().map(|total| total.0).sum())
	}
}

/// Adds the scope's `Offset` to the sum, so its value depends on where it runs.
#[derive(Debug, Clone, PartialEq)]
struct Shifted(u64);

impl Reducer for Shifted {
	fn reduce(scope: &Scope, values: Vec<Self>) -> Self {
		let offset = scope.get::<Offset>().map_or(0, |offset| offset.0);
		Shifted(values.iter().map(|shifted| shifted.0).sum::<u64>() + offset)
	}
}

#[derive(Debug, Clone, PartialEq)]
struct Parts(Vec<u64>);

impl Concat for Parts {
	fn concat(mut self, other: Self) -> Self {
		self.0.extend(other.0);
		self
	}
}

#[derive(Debug, Clone, PartialEq)]
struct Offset(u64);
#[derive(Debug, Clone, PartialEq)]
struct Report(u64);

fn build(groups: &[Vec<u64>]) -> Scope {
	reducer::register::<Total>();
	let mut scope = Scope::empty();
	for group in groups {
		scope = scope
			.fork(group.iter().map(|&value| Binding::value(Total(value))))
			.unwrap();
	}
	scope
}

fn split(cuts: (usize, usize)) -> Vec<Vec<u64>> {
	let values = [1_u64, 2, 3];
	let (a, b) = (cuts.0.min(cuts.1), cuts.0.max(cuts.1));
	vec![values[..a].to_vec(), values[a..b].to_vec(), values[b..].to_vec()]
}

proptest! {
	#[test]
	fn test_reduction_ignores_fork_boundaries(cuts in (0..=3_usize, 0..=3_usize)) {
		let scope = build(&split(cuts));
		prop_assert_eq!(scope.get::<Total>().unwrap(), Total(6));
	}

	#[test]
	fn test_reduction_adds_later_bindings(cuts in (0..=3_usize, 0..=3_usize), extra in 0..100_u64) {
		let scope = build(&split(cuts));
		let extended = scope.fork([Binding::value(Total(extra))]).unwrap();
		prop_assert_eq!(extended.get::<Total>().unwrap(), Total(6 + extra));
		prop_assert_eq!(scope.get::<Total>().unwrap(), Total(6));
	}
}

#[test]
fn test_reduction_is_cached_until_contributor_changes() {
	reducer::register_concat::<Parts>();
	let scope = Scope::new([
		Binding::value(Offset(10)),
		Binding::value(Parts(vec![1])),
		Binding::func(|offset: Offset| Parts(vec![offset.0])),
	])
	.unwrap();

	let first = scope.get_arc::<Parts>().unwrap();
	assert_eq!(*first, Parts(vec![1, 10]));
	let unrelated = scope.fork([Binding::value(Report(0))]).unwrap();
	assert!(Arc::ptr_eq(&first, &unrelated.get_arc::<Parts>().unwrap()));
	assert!(Arc::ptr_eq(&first, &scope.get_arc::<Parts>().unwrap()));

	let shifted = scope.fork([Binding::value(Offset(20))]).unwrap();
	let second = shifted.get_arc::<Parts>().unwrap();
	assert_eq!(*second, Parts(vec![1, 20]));
	assert!(!Arc::ptr_eq(&first, &second));
	assert_eq!(*scope.get_arc::<Parts>().unwrap(), Parts(vec![1, 10]));
}

#[test]
fn test_reader_of_reduced_value_follows_contributors() {
	reducer::register_concat::<Parts>();
	let counter = Arc::new(AtomicUsize::new(0));
	let seen = counter.clone();
	let scope = Scope::new([
		Binding::value(Parts(vec![2])),
		Binding::func(move |parts: Parts| {
			seen.fetch_add(1, Ordering::SeqCst);
			Report(parts.0.iter().sum::<u64>() * 100)
		}),
	])
	.unwrap();
	assert_eq!(scope.get::<Report>().unwrap(), Report(200));

	let more = scope.fork([Binding::value(Parts(vec![3]))]).unwrap();
	assert_eq!(more.get::<Report>().unwrap(), Report(500));
	let unrelated = more.fork([Binding::value(Offset(0))]).unwrap();
	assert_eq!(unrelated.get::<Report>().unwrap(), Report(500));
	assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_combiner_runs_once_per_cell() {
	#[derive(Debug, Clone, PartialEq)]
	struct Tally(u64);

	static TALLIED: AtomicUsize = AtomicUsize::new(0);

	impl Reducer for Tally {
		fn reduce(_scope: &Scope, values: Vec<Self>) -> Self {
			TALLIED.fetch_add(1, Ordering::SeqCst);
			Tally(values.iter().map(|tally| tally.0).sum())
		}
	}

	reducer::register::<Tally>();
	let scope = Scope::new([Binding::value(Tally(1)), Binding::value(Tally(1))]).unwrap();
	for _ in 0..5 {
		assert_eq!(scope.get::<Tally>().unwrap(), Tally(2));
	}
	assert_eq!(TALLIED.load(Ordering::SeqCst), 1);
	assert!(Arc::ptr_eq(
		&scope.get_arc::<Tally>().unwrap(),
		&scope.get_arc::<Tally>().unwrap()
	));

	// A custom reducer sees the scope it runs in, so every fork combines again.
	let forked = scope.fork([Binding::value(Report(0))]).unwrap();
	for _ in 0..5 {
		assert_eq!(forked.get::<Tally>().unwrap(), Tally(2));
	}
	assert_eq!(TALLIED.load(Ordering::SeqCst), 2);
}

#[test]
fn test_custom_reducer_reads_the_scope_it_runs_in() {
	reducer::register::<Shifted>();
	let base = Scope::new([
		Binding::value(Offset(0)),
		Binding::value(Shifted(1)),
		Binding::value(Shifted(2)),
	])
	.unwrap();

	let forked = base.fork([Binding::value(Offset(100))]).unwrap();
	assert_eq!(forked.get::<Shifted>().unwrap(), Shifted(103));
	assert_eq!(base.get::<Shifted>().unwrap(), Shifted(3));

	// Same with the base evaluated first.
	let other = base.fork([Binding::value(Offset(50))]).unwrap();
	assert_eq!(other.get::<Shifted>().unwrap(), Shifted(53));
	assert_eq!(base.get::<Shifted>().unwrap(), Shifted(3));

	let unrelated = base.fork([Binding::value(Report(0))]).unwrap();
	assert_eq!(unrelated.get::<Shifted>().unwrap(), Shifted(3));
}

#[test]
fn test_registering_after_a_cached_fork() {
	#[derive(Debug, Clone, PartialEq)]
	struct Items(u64);

	impl Reducer for Items {
		fn reduce(_scope: &Scope, values: Vec<Self>) -> Self {
			Items(values.iter().map(|items| items.0).sum())
		}
	}

	let base = Scope::new([Binding::value(Items(1))]).unwrap();
	let overridden = base.fork([Binding::value(Items(2))]).unwrap();
	assert_eq!(overridden.get::<Items>().unwrap(), Items(2));

	reducer::register::<Items>();
	let combined = base.fork([Binding::value(Items(2))]).unwrap();
	assert_eq!(combined.get::<Items>().unwrap(), Items(3));
	assert_eq!(overridden.get::<Items>().unwrap(), Items(2));
	assert_ne!(overridden.signature(), combined.signature());
}

#[test]
fn test_callbacks_chain_across_forks() {
	reducer::register_concat::<Callbacks<String, usize>>();
	let scope = Scope::new([Binding::value(Callbacks::new(|s: &String| s.len()))])
		.unwrap()
		.fork([Binding::value(Callbacks::new(|s: &String| s.matches('a').count()))])
		.unwrap();
	let callbacks = scope.get::<Callbacks<String, usize>>().unwrap();
	assert_eq!(callbacks.call(&"banana".to_string()), vec![6, 3]);
}
