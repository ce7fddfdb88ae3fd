use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

use labslot::calendar::{self, LiveCalendar, LiveView};
use labslot::config::Config;
use labslot::console::{self, Session};
use labslot::engine::Engine;
use labslot::feedback::NoticeBoard;
use labslot::storage::compactor::run_compactor;
use labslot::storage::local::LocalBackend;

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    labslot::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let backend = LocalBackend::open(&config.wal_path())?;
    info!("labslot starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    tokio::spawn(run_compactor(
        backend.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    let engine = Engine::connect(backend.clone(), config.retry).await;
    if config.seed_defaults {
        match engine.instruments().seed_defaults().await {
            Ok(0) => {}
            Ok(n) => info!("registry was empty, added {n} default instruments"),
            Err(e) => tracing::warn!("could not seed default instruments: {e}"),
        }
    }

    let mut session = Session::new(config.weeks, NoticeBoard::new(config.notice_ttl));
    // The live log projects the same weeks `calendar` prints.
    let (offset_tx, offset_rx) = watch::channel(session.week_offset);
    let live = LiveCalendar::new(engine.subscribe(), session.week_start(today()), config.weeks);
    let live_task = tokio::spawn(log_live_calendar(live, offset_rx));

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    println!("labslot ready, type `help` for commands");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        tracing::error!("stdin error: {e}");
                        break;
                    }
                    None => {
                        info!("stdin closed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match console::parse_line(&line) {
                    Ok(cmd) => console::execute(&engine, &mut session, cmd, today()).await,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                offset_tx.send_if_modified(|offset| {
                    let moved = *offset != session.week_offset;
                    *offset = session.week_offset;
                    moved
                });
                for out in &reply.lines {
                    println!("{out}");
                }
                if let Some(notice) = session.notices.visible() {
                    println!("{notice}");
                }
                if reply.quit {
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    live_task.abort();
    drop(engine);
    if let Err(e) = backend.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("labslot stopped");
    Ok(())
}

fn log_view(view: &LiveView) {
    debug!(
        "calendar v{} ({}): {} booked over {}",
        view.version,
        view.status.label(),
        view.grid.booked_count(),
        view.grid.weeks.first().map_or_else(String::new, |w| w.label())
    );
}

/// Re-project on every snapshot, on every week move in the console and when
/// the date rolls over into a new week.
async fn log_live_calendar(mut live: LiveCalendar, mut offset: watch::Receiver<i64>) {
    let mut clock = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            view = live.next() => match view {
                Some(view) => log_view(&view),
                None => break,
            },
            changed = offset.changed() => if changed.is_err() {
                break;
            },
            _ = clock.tick() => {}
        }
        let start = calendar::shifted_week_start(today(), *offset.borrow_and_update());
        if start != live.start() {
            live.set_start(start);
            log_view(&live.current());
        }
    }
}
