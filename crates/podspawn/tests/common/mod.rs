//! Test utilities and common setup.
#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use podspawn::identity::Identity;
use podspawn::runtime::{ExecStreams, RecordingRuntime, WindowSize};
use podspawn::session::{RawModeGuard, ResizeEvents, Session, SessionConfig, Terminal};
use tokio::sync::mpsc;

/// Terminal double: fixed answers, counted raw-mode transitions and a
/// channel-driven resize event source.
pub struct ScriptedTerminal {
    attached: bool,
    size: Mutex<WindowSize>,
    raw_entered: AtomicUsize,
    raw_restored: Arc<AtomicUsize>,
    events: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl ScriptedTerminal {
    /// A terminal that is attached and reports `rows`x`cols`. Send on the
    /// returned channel to simulate SIGWINCH.
    pub fn attached(rows: u16, cols: u16) -> (Arc<Self>, mpsc::UnboundedSender<()>) {
        Self::build(true, rows, cols)
    }

    /// stdin is not a terminal (e.g. `ssh -T`).
    pub fn detached() -> Arc<Self> {
        Self::build(false, 24, 80).0
    }

    fn build(attached: bool, rows: u16, cols: u16) -> (Arc<Self>, mpsc::UnboundedSender<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let term = Arc::new(Self {
            attached,
            size: Mutex::new(WindowSize::new(rows, cols)),
            raw_entered: AtomicUsize::new(0),
            raw_restored: Arc::new(AtomicUsize::new(0)),
            events: Mutex::new(Some(rx)),
        });
        (term, tx)
    }

    pub fn set_size(&self, rows: u16, cols: u16) {
        *self.size.lock().unwrap() = WindowSize::new(rows, cols);
    }

    pub fn raw_entered(&self) -> usize {
        self.raw_entered.load(Ordering::SeqCst)
    }

    pub fn raw_restored(&self) -> usize {
        self.raw_restored.load(Ordering::SeqCst)
    }
}

impl Terminal for ScriptedTerminal {
    fn is_terminal(&self) -> bool {
        self.attached
    }

    fn enter_raw_mode(&self) -> io::Result<RawModeGuard> {
        self.raw_entered.fetch_add(1, Ordering::SeqCst);
        let restored = self.raw_restored.clone();
        Ok(RawModeGuard::new(move || {
            restored.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn window_size(&self) -> io::Result<WindowSize> {
        Ok(*self.size.lock().unwrap())
    }

    fn resize_events(&self) -> io::Result<ResizeEvents> {
        let rx = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::other("resize events already taken"))?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|()| ((), rx))
        })))
    }
}

/// A session against `runtime` with null stdio and a detached terminal.
pub fn session(runtime: &Arc<RecordingRuntime>, identity: &str, command: Option<&str>) -> Session {
    Session::new(
        Identity::parse(identity).unwrap(),
        runtime.clone(),
        SessionConfig::default(),
    )
    .with_command(command.map(str::to_string))
    .with_streams(ExecStreams::null())
    .with_terminal(ScriptedTerminal::detached())
}

/// Write a key file for `user` under `dir`.
pub fn write_key_file(dir: &Path, user: &str, content: &str) {
    std::fs::write(dir.join(user), content).unwrap();
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
