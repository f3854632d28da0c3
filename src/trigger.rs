//! Cycle Triggers
//!
//! Polling is always active. When native filesystem events are available they
//! wake the supervisor early, after a short quiet period, so bursts of writes
//! from the control plane collapse into a single cycle. Both sources lead to
//! the same snapshot comparison.

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Why the supervisor woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Poll,
    FsEvent,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Poll => write!(f, "poll"),
            TriggerSource::FsEvent => write!(f, "fs-event"),
        }
    }
}

enum Wake {
    Tick,
    Event,
    EventsClosed,
}

/// Source of "run a cycle now" wake-ups
pub struct Trigger {
    interval: Interval,
    debounce: Duration,
    /// Upper bound on one settle phase, so a busy writer cannot hold off cycles
    max_settle: Duration,
    events: Option<mpsc::UnboundedReceiver<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl Trigger {
    /// Fixed-interval polling only. The first tick fires immediately.
    pub fn polling(poll_interval: Duration) -> Self {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            interval,
            debounce: Duration::ZERO,
            max_settle: poll_interval,
            events: None,
            _watcher: None,
        }
    }

    /// Polling plus native events on `dir`.
    ///
    /// Falls back to polling alone if the platform watcher cannot be set up.
    /// A `debounce` longer than `poll_interval` is capped to it.
    pub fn with_native_events(dir: &Path, poll_interval: Duration, debounce: Duration) -> Self {
        let mut trigger = Self::polling(poll_interval);
        if debounce > poll_interval {
            debug!(?debounce, ?poll_interval, "Debounce capped to the poll interval");
        }
        trigger.debounce = debounce.min(poll_interval);

        match Self::spawn_watcher(dir) {
            Ok((watcher, events)) => {
                info!(directory = %dir.display(), "Native filesystem events enabled");
                trigger.events = Some(events);
                trigger._watcher = Some(watcher);
            }
            Err(e) => {
                warn!(
                    directory = %dir.display(),
                    error = %e,
                    "Native filesystem events unavailable, falling back to polling every {:?}",
                    poll_interval
                );
            }
        }

        trigger
    }

    /// Whether a native watcher is feeding this trigger
    pub fn has_native_events(&self) -> bool {
        self.events.is_some()
    }

    fn spawn_watcher(
        dir: &Path,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>), notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                        debug!(kind = ?event.kind, paths = ?event.paths, "Snippet directory event");
                        let _ = tx.send(());
                    }
                    _ => {}
                },
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok((watcher, rx))
    }

    /// Wait until the next cycle should run
    pub async fn next(&mut self) -> TriggerSource {
        loop {
            let wake = tokio::select! {
                _ = self.interval.tick() => Wake::Tick,
                event = recv_event(&mut self.events) => match event {
                    Some(()) => Wake::Event,
                    None => Wake::EventsClosed,
                },
            };

            match wake {
                Wake::Tick => return TriggerSource::Poll,
                Wake::Event => {
                    self.settle().await;
                    self.interval.reset();
                    return TriggerSource::FsEvent;
                }
                Wake::EventsClosed => {
                    warn!("Native filesystem watcher stopped, continuing with polling only");
                    self.events = None;
                    self._watcher = None;
                }
            }
        }
    }

    /// Swallow further events until `debounce` passes without one,
    /// giving up after `max_settle` from the first event
    async fn settle(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let deadline = Instant::now() + self.max_settle;
        let mut coalesced = 0usize;
        loop {
            let quiet_until = (Instant::now() + self.debounce).min(deadline);
            match tokio::time::timeout_at(quiet_until, events.recv()).await {
                Ok(Some(())) => {
                    coalesced += 1;
                    if Instant::now() >= deadline {
                        debug!(coalesced, "Directory still busy, running cycle anyway");
                        return;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        if coalesced > 0 {
            debug!(coalesced, "Coalesced filesystem events");
        }
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_polling_first_tick_is_immediate() {
        let mut trigger = Trigger::polling(Duration::from_secs(60));
        assert!(!trigger.has_native_events());

        let source = timeout(Duration::from_secs(1), trigger.next()).await.unwrap();
        assert_eq!(source, TriggerSource::Poll);
    }

    #[tokio::test]
    async fn test_polling_interval() {
        let mut trigger = Trigger::polling(Duration::from_millis(50));
        trigger.next().await;

        let start = Instant::now();
        assert_eq!(trigger.next().await, TriggerSource::Poll);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    /// Native trigger on `dir` with the immediate first poll tick consumed
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    async fn native_trigger(dir: &Path, poll_interval: Duration, debounce: Duration) -> Trigger {
        let mut trigger = Trigger::with_native_events(dir, poll_interval, debounce);
        if !trigger.has_native_events() {
            eprintln!("native filesystem watcher could not be attached to {}", dir.display());
        }
        assert!(trigger.has_native_events(), "native watcher expected on this platform");
        assert_eq!(trigger.next().await, TriggerSource::Poll);
        trigger
    }

    /// Rewrites `path` every `every` until the returned flag is set
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn spawn_writer(path: PathBuf, every: Duration) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            let mut n = 0u64;
            while !flag.load(Ordering::SeqCst) {
                n += 1;
                let _ = std::fs::write(&path, format!("# revision {}\n", n));
                std::thread::sleep(every);
            }
        });
        (stop, handle)
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[tokio::test]
    async fn test_native_event_wakes_before_poll() {
        let temp_dir = TempDir::new().unwrap();
        let mut trigger =
            native_trigger(temp_dir.path(), Duration::from_secs(30), Duration::from_millis(50)).await;

        std::fs::write(temp_dir.path().join("a.conf"), "location /a/ {}").unwrap();

        let source = timeout(Duration::from_secs(5), trigger.next())
            .await
            .expect("filesystem event not delivered");
        assert_eq!(source, TriggerSource::FsEvent);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[tokio::test]
    async fn test_burst_of_writes_wakes_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut trigger =
            native_trigger(temp_dir.path(), Duration::from_secs(30), Duration::from_millis(300)).await;

        for i in 0..10 {
            std::fs::write(temp_dir.path().join(format!("s{}.conf", i)), "location / {}").unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        let source = timeout(Duration::from_secs(5), trigger.next())
            .await
            .expect("filesystem event not delivered");
        assert_eq!(source, TriggerSource::FsEvent);

        // Everything in the burst was absorbed by the first wake-up
        assert!(timeout(Duration::from_secs(1), trigger.next()).await.is_err());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[tokio::test]
    async fn test_busy_directory_still_wakes_within_poll_interval() {
        let temp_dir = TempDir::new().unwrap();
        let mut trigger =
            native_trigger(temp_dir.path(), Duration::from_millis(200), Duration::from_millis(100)).await;

        let (stop, writer) = spawn_writer(temp_dir.path().join("busy.conf"), Duration::from_millis(20));

        let start = Instant::now();
        let first = timeout(Duration::from_secs(2), trigger.next()).await;
        let second = timeout(Duration::from_secs(2), trigger.next()).await;
        let elapsed = start.elapsed();

        stop.store(true, Ordering::SeqCst);
        writer.join().unwrap();

        assert!(first.is_ok(), "no wake-up while the directory was busy");
        assert!(second.is_ok(), "no second wake-up while the directory was busy");
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_debounce_capped_to_poll_interval() {
        let temp_dir = TempDir::new().unwrap();
        let trigger =
            Trigger::with_native_events(temp_dir.path(), Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(trigger.debounce, Duration::from_millis(100));
        assert_eq!(trigger.max_settle, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_missing_directory_falls_back_to_polling() {
        let temp_dir = TempDir::new().unwrap();
        let mut trigger = Trigger::with_native_events(
            &temp_dir.path().join("missing"),
            Duration::from_millis(20),
            Duration::from_millis(5),
        );
        assert!(!trigger.has_native_events());
        assert_eq!(trigger.next().await, TriggerSource::Poll);
    }
}
