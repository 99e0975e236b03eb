//! Integration tests for a single feed generation.
//!
//! These drive real feeds over in-memory local sources and check the
//! events a consumer sees as it moves its viewport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use feedkit::prelude::*;
use futures::StreamExt;
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

/// Helper: feed over a fixed list with no remote source.
fn list_feed(items: Vec<i32>, options: FeedOptions, anchor: u64) -> Feed<i32> {
    FeedBuilder::new(
        single_snapshot(local_source_of(items)),
        Arc::new(EmptyRemoteSource),
        options,
    )
    .initial_offset(move || async move { anchor })
    .build()
    .unwrap()
}

/// Helper: wait for the next successful emission.
async fn next(feed: &mut Feed<i32>) -> FeedData<i32> {
    tokio::time::timeout(WAIT, feed.next())
        .await
        .expect("timed out waiting for event")
        .expect("feed ended")
        .expect("feed failed")
}

/// Helper: assert nothing else arrives.
async fn assert_quiet(feed: &mut Feed<i32>) {
    if let Ok(event) = tokio::time::timeout(QUIET, feed.next()).await {
        panic!("unexpected event: {event:?}");
    }
}

fn small() -> FeedOptions {
    FeedOptions::new(3).with_initial_load_size(3)
}

// ── Initial load ────────────────────────────────────────────────────

#[tokio::test]
async fn three_items_emit_one_initial_and_nothing_else() {
    let mut feed = list_feed(vec![1, 2, 3], FeedOptions::default(), 0);
    let data = next(&mut feed).await;
    assert_eq!(
        data.kind,
        FeedEventKind::Initial {
            first_visible_position: 0
        }
    );
    assert_eq!(data.items, vec![1, 2, 3]);
    assert_quiet(&mut feed).await;
}

#[tokio::test]
async fn initial_page_centres_on_anchor() {
    let mut feed = list_feed(vec![1, 2, 3, 4], small(), 2);
    let data = next(&mut feed).await;
    assert_eq!(data.items, vec![2, 3, 4]);
    // Anchor 2 is the second item of a window starting at 1.
    assert_eq!(
        data.kind,
        FeedEventKind::Initial {
            first_visible_position: 1
        }
    );
}

#[tokio::test]
async fn anchor_past_the_end_clamps_first_visible() {
    let mut feed = list_feed(vec![1, 2, 3, 4], small(), 4);
    let data = next(&mut feed).await;
    assert_eq!(data.items, vec![4]);
    assert_eq!(
        data.kind,
        FeedEventKind::Initial {
            first_visible_position: 0
        }
    );
}

// ── Boundary loading ────────────────────────────────────────────────

#[tokio::test]
async fn loads_next_page_once() {
    let mut feed = list_feed(vec![1, 2, 3, 4, 5], small(), 0);
    let data = next(&mut feed).await;
    assert_eq!(data.items, vec![1, 2, 3]);

    data.callbacks.update_visible_window(3, 3);
    let append = next(&mut feed).await;
    assert_eq!(append.kind, FeedEventKind::Append);
    assert_eq!(append.items, vec![4, 5]);

    data.callbacks.update_visible_window(3, 3);
    assert_quiet(&mut feed).await;
}

#[tokio::test]
async fn loads_previous_page() {
    let options = small().with_prefetch_distance(0);
    let mut feed = list_feed(vec![1, 2, 3, 4], options, 3);
    let data = next(&mut feed).await;
    assert_eq!(data.items, vec![3, 4]);

    data.callbacks.update_visible_window(0, 3);
    let prepend = next(&mut feed).await;
    assert_eq!(prepend.kind, FeedEventKind::Prepend);
    assert_eq!(prepend.items, vec![1, 2]);
    assert_quiet(&mut feed).await;
}

/// Helper: apply everything that arrives until the feed goes quiet.
async fn drain_into(feed: &mut Feed<i32>, list: &mut FeedList<i32>) {
    while let Ok(Some(data)) = tokio::time::timeout(QUIET, feed.next()).await {
        list.submit(data.expect("feed failed"));
    }
}

#[tokio::test]
async fn scrolling_through_everything_yields_each_item_once() {
    let items: Vec<i32> = (0..50).collect();
    let mut feed = list_feed(items.clone(), FeedOptions::new(5).with_initial_load_size(5), 25);
    let mut list = FeedList::new();
    list.submit(next(&mut feed).await);

    // One page per viewport move: walk to the end, then back to the start.
    for _ in 0..20 {
        if list.items().last() == Some(&49) {
            break;
        }
        list.update_visible_window(list.len() - 1, 1);
        drain_into(&mut feed, &mut list).await;
    }
    for _ in 0..20 {
        if list.get(0) == Some(&0) {
            break;
        }
        list.update_visible_window(0, 1);
        drain_into(&mut feed, &mut list).await;
    }

    let seen: Vec<i32> = list.items().copied().collect();
    assert_eq!(seen, items);
}

// ── Failures and cancellation ───────────────────────────────────────

#[tokio::test]
async fn local_read_failure_ends_the_stream() {
    let source = FnLocalSource::new(|position: u64, _count: usize| async move {
        if position == 0 {
            Ok(vec![1, 2, 3])
        } else {
            Err(FeedError::Config("disk gone".into()))
        }
    });
    let mut feed = FeedBuilder::new(single_snapshot(source), Arc::new(EmptyRemoteSource), small())
        .build()
        .unwrap();
    let data = next(&mut feed).await;
    data.callbacks.update_visible_window(2, 3);

    let err = tokio::time::timeout(WAIT, feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, FeedError::LocalRead { position: 3, .. }), "{err:?}");
    assert!(err.is_fatal());
    assert!(tokio::time::timeout(WAIT, feed.next()).await.unwrap().is_none());
}

/// Source whose reads past position 2 block until released.
struct GatedSource {
    items: Vec<i32>,
    gate: Arc<Notify>,
    blocked: Arc<AtomicUsize>,
}

impl LocalSource<i32> for GatedSource {
    fn load(&self, position: u64, count: usize) -> LoadFuture<'_, Vec<i32>> {
        Box::pin(async move {
            if position > 2 {
                self.blocked.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
            }
            let start = (position as usize).min(self.items.len());
            let end = (start + count).min(self.items.len());
            Ok(self.items[start..end].to_vec())
        })
    }
}

#[tokio::test]
async fn new_snapshot_discards_in_flight_boundary_load() {
    let gate = Arc::new(Notify::new());
    let blocked = Arc::new(AtomicUsize::new(0));
    let (snapshot_tx, snapshot_rx) = futures::channel::mpsc::unbounded::<SharedLocalSource<i32>>();
    snapshot_tx
        .unbounded_send(Arc::new(GatedSource {
            items: (1..10).collect(),
            gate: Arc::clone(&gate),
            blocked: Arc::clone(&blocked),
        }))
        .unwrap();

    let options = small().with_prefetch_distance(0);
    let mut feed = FeedBuilder::new(snapshot_rx.boxed(), Arc::new(EmptyRemoteSource), options)
        .build()
        .unwrap();
    let data = next(&mut feed).await;
    assert_eq!(data.items, vec![1, 2, 3]);

    data.callbacks.update_visible_window(3, 3);
    tokio::time::timeout(WAIT, async {
        while blocked.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    snapshot_tx
        .unbounded_send(Arc::new(local_source_of(10..20)))
        .unwrap();
    let restarted = next(&mut feed).await;
    assert!(restarted.is_initial());
    assert!(restarted.items.iter().all(|i| *i >= 10), "{:?}", restarted.items);

    // The stale read finishing now must not reach the consumer.
    gate.notify_waiters();
    assert_quiet(&mut feed).await;

    // The old callbacks are stale; the new ones are live.
    data.callbacks.update_visible_window(0, 1);
    assert_quiet(&mut feed).await;
}

#[tokio::test]
async fn dropping_the_feed_stops_reads() {
    let reads = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&reads);
    let source = FnLocalSource::new(move |position: u64, count: usize| {
        r.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, FeedError>((position as i32..position as i32 + count as i32).collect::<Vec<i32>>()) }
    });
    let mut feed = FeedBuilder::new(single_snapshot(source), Arc::new(EmptyRemoteSource), small())
        .build()
        .unwrap();
    let data = next(&mut feed).await;
    drop(feed);

    let before = reads.load(Ordering::SeqCst);
    data.callbacks.update_visible_window(3, 3);
    tokio::time::sleep(QUIET).await;
    assert_eq!(reads.load(Ordering::SeqCst), before);
}

// ── Mapping ─────────────────────────────────────────────────────────

#[tokio::test]
async fn map_items_keeps_event_shape() {
    let feed = list_feed(vec![1, 2, 3], small(), 0);
    let mut mapped = Box::pin(feed.map_items(|i| format!("#{i}")));
    let data = tokio::time::timeout(WAIT, mapped.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(data.is_initial());
    assert_eq!(data.items, vec!["#1", "#2", "#3"]);
}
