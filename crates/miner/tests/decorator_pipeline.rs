//! Decorator pipeline tests over the in-memory store backend.

use lode_miner::{Decorator, DecoratorConfig, DecoratorHandle, DecoratorSignal};
use lode_store::{memory::MemoryStore, sparql};

use std::{sync::Arc, time::Duration};

use tokio::{sync::broadcast, time::timeout};
use tokio_util::sync::CancellationToken;

fn seed(store: &MemoryStore, graph: &str, count: usize) {
	for i in 0..count {
		store.insert_file(
			&format!("file:///library/{graph}/{i:04}.bin"),
			graph,
			None,
			false,
			Some("application/octet-stream"),
			None,
		);
	}
}

async fn wait_for_finished(signals: &mut broadcast::Receiver<DecoratorSignal>) {
	loop {
		let signal = timeout(Duration::from_secs(15), signals.recv())
			.await
			.expect("timed out waiting for finished signal")
			.expect("signal stream closed");

		if matches!(signal, DecoratorSignal::Finished) {
			return;
		}
	}
}

/// Consumes items until the pipeline reports finished, answering each with a
/// fresh extractor hash. Returns how many items were processed.
async fn consume_all(handle: DecoratorHandle) -> usize {
	let mut signals = handle.subscribe();
	let mut processed = 0;

	loop {
		tokio::select! {
			item = handle.next() => {
				let Some(item) = item else { break };
				handle.complete(&item, sparql::set_extractor_hash(&item.urn, "hash-v1"));
				processed += 1;
			}
			signal = signals.recv() => {
				if matches!(signal, Ok(DecoratorSignal::Finished) | Err(_)) {
					break;
				}
			}
		}
	}

	processed
}

#[tokio::test(flavor = "multi_thread")]
async fn processes_a_multi_page_workload_to_completion() {
	let store = MemoryStore::new();
	seed(&store, "g:media", 500);

	let (decorator, handle) = Decorator::new(
		Arc::new(store.clone()),
		DecoratorConfig {
			page_size: 200,
			batch_size: 200,
			priority_graphs: Vec::new(),
		},
	);

	let mut signals = handle.subscribe();
	let cancel = CancellationToken::new();
	let run = tokio::spawn(decorator.run(cancel.clone()));
	let consumer = tokio::spawn(consume_all(handle.clone()));

	wait_for_finished(&mut signals).await;

	let processed = timeout(Duration::from_secs(5), consumer)
		.await
		.expect("consumer hung")
		.expect("consumer panicked");
	assert_eq!(processed, 500);

	// Every seeded record carries the new hash.
	for i in 0..500 {
		let record = store
			.record(&format!("file:///library/g:media/{i:04}.bin"))
			.expect("record");
		assert_eq!(record.extractor_hash.as_deref(), Some("hash-v1"));
	}

	cancel.cancel();
	let _ = run.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn priority_graphs_are_served_first() {
	let store = MemoryStore::new();
	seed(&store, "g:normal", 8);
	seed(&store, "g:hot", 4);

	let (decorator, handle) = Decorator::new(
		Arc::new(store.clone()),
		DecoratorConfig {
			page_size: 4,
			batch_size: 4,
			priority_graphs: vec!["g:hot".to_string()],
		},
	);

	let cancel = CancellationToken::new();
	let run = tokio::spawn(decorator.run(cancel.clone()));

	// The first page must be entirely hot-graph items.
	for _ in 0..4 {
		let item = timeout(Duration::from_secs(10), handle.next())
			.await
			.expect("item")
			.expect("pipeline stopped early");
		assert!(
			item.url.contains("g:hot"),
			"expected a priority item, got {}",
			item.url
		);
		handle.complete(&item, sparql::set_extractor_hash(&item.urn, "hash-v1"));
	}

	cancel.cancel();
	let _ = run.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_failure_falls_back_to_individual_commits() {
	let store = MemoryStore::new();
	seed(&store, "g:media", 6);
	store.fail_next_batches(1);

	let (decorator, handle) = Decorator::new(
		Arc::new(store.clone()),
		DecoratorConfig {
			page_size: 6,
			batch_size: 6,
			priority_graphs: Vec::new(),
		},
	);

	let mut signals = handle.subscribe();
	let cancel = CancellationToken::new();
	let run = tokio::spawn(decorator.run(cancel.clone()));
	let consumer = tokio::spawn(consume_all(handle.clone()));

	wait_for_finished(&mut signals).await;
	let _ = timeout(Duration::from_secs(5), consumer).await;

	for i in 0..6 {
		let record = store
			.record(&format!("file:///library/g:media/{i:04}.bin"))
			.expect("record");
		assert_eq!(
			record.extractor_hash.as_deref(),
			Some("hash-v1"),
			"item {i} missed the individual fallback"
		);
	}

	cancel.cancel();
	let _ = run.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_tasks_are_reported_without_stopping_the_pipeline() {
	let store = MemoryStore::new();
	seed(&store, "g:media", 3);

	let (decorator, handle) = Decorator::new(
		Arc::new(store.clone()),
		DecoratorConfig {
			page_size: 3,
			batch_size: 1,
			priority_graphs: Vec::new(),
		},
	);

	let mut signals = handle.subscribe();
	let cancel = CancellationToken::new();
	let run = tokio::spawn(decorator.run(cancel.clone()));

	let first = timeout(Duration::from_secs(10), handle.next())
		.await
		.expect("item")
		.expect("pipeline stopped early");
	handle.fail(&first, "codec exploded".to_string());

	// The failure is surfaced as an error signal...
	let error = loop {
		let signal = timeout(Duration::from_secs(10), signals.recv())
			.await
			.expect("signal")
			.expect("stream");
		if let DecoratorSignal::Error { url, message, .. } = signal {
			break (url, message);
		}
	};
	assert_eq!(error.0, first.url);
	assert_eq!(error.1, "codec exploded");

	// ...and other items keep flowing.
	let second = timeout(Duration::from_secs(10), handle.next())
		.await
		.expect("item")
		.expect("pipeline stopped early");
	handle.complete(&second, sparql::set_extractor_hash(&second.urn, "hash-v1"));

	cancel.cancel();
	let _ = run.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_cancels_outstanding_consumer_tasks() {
	let store = MemoryStore::new();
	seed(&store, "g:media", 2);

	let (decorator, handle) = Decorator::new(Arc::new(store), DecoratorConfig::default());

	let cancel = CancellationToken::new();
	let run = tokio::spawn(decorator.run(cancel.clone()));

	let item = timeout(Duration::from_secs(10), handle.next())
		.await
		.expect("item")
		.expect("pipeline stopped early");
	assert!(!item.cancel.is_cancelled());

	let (cached, handed_out) = handle.queue_depth();
	assert_eq!(cached, 1);
	assert_eq!(handed_out, 1);

	handle.pause().await;

	timeout(Duration::from_secs(5), item.cancel.cancelled())
		.await
		.expect("pause did not cancel the outstanding task");

	cancel.cancel();
	let _ = run.await;
}
