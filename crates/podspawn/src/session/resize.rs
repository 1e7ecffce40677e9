//! Forwards terminal size changes to an in-flight exec.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::terminal::Terminal;
use crate::runtime::{ExecHandle, Runtime};

/// Push the current size once, then again on every change until `cancel`
/// fires. Never fails; every error is logged and skipped.
pub async fn watch_resize(
    runtime: Arc<dyn Runtime>,
    handle: ExecHandle,
    terminal: Arc<dyn Terminal>,
    cancel: CancellationToken,
) {
    // Subscribe before the first query so a change in between is not lost
    let mut events = match terminal.resize_events() {
        Ok(events) => Some(events),
        Err(e) => {
            debug!(exec = %handle, "resize notifications unavailable: {e}");
            None
        }
    };

    forward(runtime.as_ref(), &handle, terminal.as_ref(), &cancel).await;

    let Some(events) = events.as_mut() else {
        return;
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.next() => {
                if event.is_none() {
                    break;
                }
                forward(runtime.as_ref(), &handle, terminal.as_ref(), &cancel).await;
            }
        }
    }
    debug!(exec = %handle, "resize watcher stopped");
}

async fn forward(
    runtime: &dyn Runtime,
    handle: &ExecHandle,
    terminal: &dyn Terminal,
    cancel: &CancellationToken,
) {
    let size = match terminal.window_size() {
        Ok(size) => size,
        Err(e) => {
            debug!(exec = %handle, "skipping resize, size unavailable: {e}");
            return;
        }
    };
    if let Err(e) = runtime.resize(cancel, handle, size).await {
        debug!(exec = %handle, rows = size.rows, cols = size.cols, "resize failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RecordingRuntime, WindowSize};
    use crate::session::terminal::{RawModeGuard, ResizeEvents};
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FakeTerminal {
        /// `None` makes size queries fail.
        size: Mutex<Option<WindowSize>>,
        queries: AtomicUsize,
        events: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    }

    impl FakeTerminal {
        fn new(size: Option<WindowSize>) -> (Arc<Self>, mpsc::UnboundedSender<()>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let term = Arc::new(Self {
                size: Mutex::new(size),
                queries: AtomicUsize::new(0),
                events: Mutex::new(Some(rx)),
            });
            (term, tx)
        }

        fn set_size(&self, size: Option<WindowSize>) {
            *self.size.lock().unwrap() = size;
        }

        async fn wait_for_queries(&self, n: usize) {
            for _ in 0..200 {
                if self.queries.load(Ordering::SeqCst) >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {n} size queries");
        }
    }

    impl Terminal for FakeTerminal {
        fn is_terminal(&self) -> bool {
            true
        }

        fn enter_raw_mode(&self) -> io::Result<RawModeGuard> {
            Ok(RawModeGuard::noop())
        }

        fn window_size(&self) -> io::Result<WindowSize> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.size
                .lock()
                .unwrap()
                .ok_or_else(|| io::Error::other("not a tty"))
        }

        fn resize_events(&self) -> io::Result<ResizeEvents> {
            let rx = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::other("already subscribed"))?;
            Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|()| ((), rx))
            })))
        }
    }

    async fn wait_for_resizes(rt: &RecordingRuntime, n: usize) {
        for _ in 0..200 {
            if rt.resizes().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} resizes, got {:?}", rt.resizes());
    }

    #[tokio::test]
    async fn sends_initial_size_then_each_change() {
        let rt = Arc::new(RecordingRuntime::new());
        let (term, tx) = FakeTerminal::new(Some(WindowSize::new(24, 80)));
        let cancel = CancellationToken::new();
        let handle = ExecHandle::new("exec-1");

        let task = tokio::spawn(watch_resize(
            rt.clone(),
            handle.clone(),
            term.clone(),
            cancel.clone(),
        ));

        wait_for_resizes(&rt, 1).await;
        term.set_size(Some(WindowSize::new(50, 200)));
        tx.send(()).unwrap();
        wait_for_resizes(&rt, 2).await;

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            rt.resizes(),
            vec![
                (handle.clone(), WindowSize::new(24, 80)),
                (handle, WindowSize::new(50, 200)),
            ]
        );
    }

    #[tokio::test]
    async fn size_query_failures_are_skipped() {
        let rt = Arc::new(RecordingRuntime::new());
        let (term, tx) = FakeTerminal::new(None);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(watch_resize(
            rt.clone(),
            ExecHandle::new("exec-1"),
            term.clone(),
            cancel.clone(),
        ));

        term.wait_for_queries(1).await;
        tx.send(()).unwrap();
        term.wait_for_queries(2).await;
        assert!(rt.resizes().is_empty());

        term.set_size(Some(WindowSize::new(30, 100)));
        tx.send(()).unwrap();
        wait_for_resizes(&rt, 1).await;

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(rt.resizes().len(), 1);
        assert_eq!(rt.resizes()[0].1, WindowSize::new(30, 100));
    }

    #[tokio::test]
    async fn exits_when_cancelled_without_events() {
        let rt = Arc::new(RecordingRuntime::new());
        let (term, _tx) = FakeTerminal::new(Some(WindowSize::new(24, 80)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            watch_resize(rt.clone(), ExecHandle::new("exec-1"), term, cancel),
        )
        .await
        .unwrap();
        // The initial resize sees the cancelled token and is dropped
        assert!(rt.resizes().is_empty());
    }

    #[tokio::test]
    async fn exits_when_event_source_closes() {
        let rt = Arc::new(RecordingRuntime::new());
        let (term, tx) = FakeTerminal::new(Some(WindowSize::new(24, 80)));
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            watch_resize(
                rt.clone(),
                ExecHandle::new("exec-1"),
                term,
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap();
        assert_eq!(rt.resizes().len(), 1);
    }
}
