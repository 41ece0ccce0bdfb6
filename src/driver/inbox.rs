//! Per-socket receive backlog shared by all drivers.
//!
//! An inbox is a bounded channel plus a close signal. Receivers wait on both,
//! so closing the socket wakes a blocked receive instead of leaving it
//! parked forever.

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex};

use super::{Received, RecvMode, TransportError};

/// Receive side of a socket backlog.
pub(crate) struct Inbox<T> {
    rx: Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
}

/// Create an inbox holding at most `capacity` queued items.
pub(crate) fn inbox<T>(capacity: usize) -> (mpsc::Sender<T>, Inbox<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed, _) = watch::channel(false);
    (
        tx,
        Inbox {
            rx: Mutex::new(rx),
            closed,
        },
    )
}

impl<T: Send> Inbox<T> {
    /// Receive the next item.
    pub(crate) async fn recv(&self, mode: RecvMode) -> Result<Received<T>, TransportError> {
        self.recv_matching(mode, |_| true).await
    }

    /// Receive the next item accepted by `accept`, discarding the rest.
    pub(crate) async fn recv_matching<F>(
        &self,
        mode: RecvMode,
        mut accept: F,
    ) -> Result<Received<T>, TransportError>
    where
        F: FnMut(&T) -> bool + Send,
    {
        let mut closed = self.closed.subscribe();
        let already_closed = *closed.borrow();
        if already_closed {
            return Err(TransportError::SocketClosed);
        }

        match mode {
            RecvMode::NonBlocking => {
                // Another task is already receiving; nothing is available to us.
                let Ok(mut rx) = self.rx.try_lock() else {
                    return Ok(Received::Empty);
                };
                loop {
                    match rx.try_recv() {
                        Ok(item) if accept(&item) => return Ok(Received::Message(item)),
                        Ok(_) => continue,
                        Err(TryRecvError::Empty) => return Ok(Received::Empty),
                        Err(TryRecvError::Disconnected) => return Err(TransportError::Disconnected),
                    }
                }
            }
            RecvMode::Blocking => self
                .wait(&mut closed, &mut accept)
                .await
                .map(Received::Message),
            RecvMode::Timed(timeout) => {
                match tokio::time::timeout(timeout, self.wait(&mut closed, &mut accept)).await {
                    Ok(result) => result.map(Received::Message),
                    Err(_) => Ok(Received::TimedOut),
                }
            }
        }
    }

    async fn wait<F>(
        &self,
        closed: &mut watch::Receiver<bool>,
        accept: &mut F,
    ) -> Result<T, TransportError>
    where
        F: FnMut(&T) -> bool + Send,
    {
        let mut rx = tokio::select! {
            rx = self.rx.lock() => rx,
            _ = close_signal(closed) => return Err(TransportError::Interrupted),
        };

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) if accept(&item) => return Ok(item),
                    Some(_) => continue,
                    None => return Err(TransportError::Disconnected),
                },
                _ = close_signal(closed) => return Err(TransportError::Interrupted),
            }
        }
    }
}

impl<T> Inbox<T> {
    /// Mark the inbox closed and wake pending receivers.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }
}

async fn close_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}
