//! Simulated consumer for feedkit.
//!
//! Builds an in-memory dataset, optionally keeps its tail behind a simulated
//! remote source, then scrolls a viewport through the feed and prints every
//! mutation event as one JSON line on stdout. Engine logs go to stderr.
//!
//! # Examples
//!
//! ```sh
//! # Scroll through 200 local items, 10 at a time
//! feedkit --total 200 --step 10
//!
//! # Keep the last 3 pages remote, start in the middle, then refresh
//! feedkit --total 200 --remote-pages 3 --start 100 --refresh-in-place --full-refresh
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use feedkit::prelude::*;
use feedkit::trace::{FeedTraceLayer, TraceLevel};
use futures::StreamExt;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Scroll a simulated viewport through a feed and print its events.
#[derive(Parser)]
#[command(name = "feedkit")]
struct Cli {
    /// Items in the full dataset.
    #[arg(long, default_value_t = 100)]
    total: u64,

    /// Trailing pages served by the remote source instead of the local cache.
    #[arg(long, default_value_t = 0)]
    remote_pages: u64,

    /// Page size (ignored with --config).
    #[arg(long, default_value_t = 10)]
    page_size: usize,

    /// JSON file with feed options.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial scroll position.
    #[arg(long, default_value_t = 0)]
    start: u64,

    /// Items scrolled per step.
    #[arg(long, default_value_t = 5)]
    step: usize,

    /// Number of scroll steps.
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// Visible items in the viewport.
    #[arg(long, default_value_t = 5)]
    visible: usize,

    /// Milliseconds without events before a step is considered settled.
    #[arg(long, default_value_t = 50)]
    settle_ms: u64,

    /// Refresh in place after scrolling.
    #[arg(long)]
    refresh_in_place: bool,

    /// Discard everything and start a new generation at the end.
    #[arg(long)]
    full_refresh: bool,

    /// Print engine logs at debug level instead of info.
    #[arg(long)]
    verbose: bool,
}

/// One printed event.
#[derive(Serialize)]
struct EventLine<'a> {
    generation: u64,
    #[serde(flatten)]
    kind: FeedEventKind,
    items: &'a [u64],
    list_len: usize,
}

/// Viewport position in list coordinates.
struct Viewport {
    first: usize,
    visible: usize,
}

impl Viewport {
    fn apply(&mut self, kind: FeedEventKind, added: usize) {
        match kind {
            FeedEventKind::Initial {
                first_visible_position,
            } => self.first = first_visible_position,
            FeedEventKind::Prepend => self.first += added,
            FeedEventKind::Append => {}
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let min_level = if cli.verbose {
        TraceLevel::Debug
    } else {
        TraceLevel::Info
    };
    let (tracing_layer, trace_buffer) = FeedTraceLayer::with_min_level(min_level);
    tracing_subscriber::registry().with(tracing_layer).init();

    let result = run(&cli).await;

    for line in trace_buffer.drain() {
        eprintln!("{line}");
    }
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<(), FeedError> {
    let options = match &cli.config {
        Some(path) => FeedOptions::load(path)?,
        None => FeedOptions::new(cli.page_size),
    };

    let page = options.page_size as u64;
    let remote_items = (cli.remote_pages * page).min(cli.total);
    let local_end = cli.total - remote_items;

    let store = InMemoryDataStore::with_items((0..local_end).collect::<Vec<u64>>());
    let remote = InMemoryRemoteSource::new(store.clone());
    let mut next = local_end;
    while next < cli.total {
        let end = (next + page).min(cli.total);
        remote.push_page_after((next..end).collect(), end == cli.total);
        next = end;
    }
    info!(local = local_end, remote = remote_items, "dataset ready");

    let snapshots = {
        let store = store.clone();
        move || store.snapshots()
    };
    let pager = FeedPager::new(
        snapshots,
        Arc::new(remote.clone()),
        options,
        StartPolicy::from_store(Arc::new(FixedScrollPositionStore::new(cli.start))),
    )?;
    let connection = pager.connection();
    let mut stream = pager.stream();
    let mut list = FeedList::new();
    let mut viewport = Viewport {
        first: 0,
        visible: cli.visible,
    };
    let settle = Duration::from_millis(cli.settle_ms);

    settle_events(&mut stream, &mut list, &mut viewport, settle).await?;
    for _ in 0..cli.steps {
        if list.is_empty() {
            break;
        }
        viewport.first = (viewport.first + cli.step).min(list.len() - 1);
        connection.update_visible_window(viewport.first, viewport.visible);
        settle_events(&mut stream, &mut list, &mut viewport, settle).await?;
    }

    if cli.refresh_in_place {
        remote.set_refresh_content((0..cli.total).collect());
        connection.refresh_in_place().await?;
        settle_events(&mut stream, &mut list, &mut viewport, settle).await?;
    }

    if cli.full_refresh {
        connection.refresh(|action| action.run()).await?;
        settle_events(&mut stream, &mut list, &mut viewport, settle).await?;
    }

    info!(items = list.len(), generation = pager.generation(), "done");
    Ok(())
}

/// Print and apply events until none arrive for `settle`.
async fn settle_events<S>(
    stream: &mut S,
    list: &mut FeedList<u64>,
    viewport: &mut Viewport,
    settle: Duration,
) -> Result<(), FeedError>
where
    S: futures::Stream<Item = Result<FeedData<u64>, FeedError>> + Unpin,
{
    while let Ok(Some(data)) = tokio::time::timeout(settle, stream.next()).await {
        let data = data?;
        let generation = data.generation;
        let items = data.items.clone();
        let kind = list.submit(data);
        viewport.apply(kind, items.len());

        let line = EventLine {
            generation,
            kind,
            items: &items,
            list_len: list.len(),
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}
