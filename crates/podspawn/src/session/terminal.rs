//! Controlling-terminal access: raw mode, window size, resize notifications.

use std::io::{self, IsTerminal};
use std::pin::Pin;

use futures::Stream;
use tokio::signal::unix::{SignalKind, signal};

use crate::runtime::WindowSize;

/// Stream that yields once per terminal size change.
pub type ResizeEvents = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// The terminal a session is attached to.
pub trait Terminal: Send + Sync {
    fn is_terminal(&self) -> bool;

    /// Switch to raw input mode until the returned guard is dropped.
    fn enter_raw_mode(&self) -> io::Result<RawModeGuard>;

    fn window_size(&self) -> io::Result<WindowSize>;

    fn resize_events(&self) -> io::Result<ResizeEvents>;
}

/// Restores the previous terminal mode when dropped, including during a
/// panic unwind.
#[must_use = "raw mode is restored as soon as the guard is dropped"]
pub struct RawModeGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl RawModeGuard {
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    /// A guard with nothing to restore.
    pub fn noop() -> Self {
        Self { restore: None }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

impl std::fmt::Debug for RawModeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawModeGuard")
            .field("armed", &self.restore.is_some())
            .finish()
    }
}

/// The process's own stdin, as set up by sshd.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTerminal;

impl HostTerminal {
    const FD: libc::c_int = libc::STDIN_FILENO;
}

impl Terminal for HostTerminal {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn enter_raw_mode(&self) -> io::Result<RawModeGuard> {
        let fd = Self::FD;

        let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let original = termios;
        unsafe { libc::cfmakeraw(&mut termios) };
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(RawModeGuard::new(move || {
            unsafe { libc::tcsetattr(fd, libc::TCSANOW, &original) };
        }))
    }

    fn window_size(&self) -> io::Result<WindowSize> {
        let mut ws = unsafe { std::mem::zeroed::<libc::winsize>() };
        if unsafe { libc::ioctl(Self::FD, libc::TIOCGWINSZ, &mut ws) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if ws.ws_row == 0 || ws.ws_col == 0 {
            return Err(io::Error::other("terminal reported a zero size"));
        }
        Ok(WindowSize::new(ws.ws_row, ws.ws_col))
    }

    fn resize_events(&self) -> io::Result<ResizeEvents> {
        let winch = signal(SignalKind::window_change())?;
        let events = futures::stream::unfold(winch, |mut winch| async move {
            winch.recv().await.map(|()| ((), winch))
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn guard_restores_once_on_drop() {
        let restored = Arc::new(AtomicUsize::new(0));
        let counter = restored.clone();
        let guard = RawModeGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(restored.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_restores_during_panic() {
        let restored = Arc::new(AtomicUsize::new(0));
        let counter = restored.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = RawModeGuard::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            panic!("relay blew up");
        });
        assert!(result.is_err());
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_guard_does_nothing() {
        drop(RawModeGuard::noop());
    }

    #[test]
    fn host_terminal_matches_stdin() {
        assert_eq!(HostTerminal.is_terminal(), io::stdin().is_terminal());
    }
}
