use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::Notify;

use super::{
    INITIAL_WINDOW, Mux, MuxError, REPLENISH_THRESHOLD,
    frame::ErrorCode,
};
use crate::aefrp::tunnel::protocol::Headers;

#[derive(Debug)]
pub(super) struct RecvState {
    pub chunks: VecDeque<Bytes>,
    pub headers: VecDeque<Headers>,
    pub fin: bool,
    pub reset: Option<ErrorCode>,
    pub window: i64,
}

/// State shared between the reader task and the stream's users.
///
/// Receive side: one consumer per stream, woken through `recv_notify` (`notify_one`
/// keeps a permit, so a wake-up that races the check is not lost).
#[derive(Debug)]
pub(super) struct StreamShared {
    pub id: u32,
    pub send_window: AtomicI64,
    pub send_notify: Notify,
    pub local_fin: AtomicBool,
    recv: Mutex<RecvState>,
    pub recv_notify: Notify,
}

impl StreamShared {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            send_window: AtomicI64::new(INITIAL_WINDOW),
            send_notify: Notify::new(),
            local_fin: AtomicBool::new(false),
            recv: Mutex::new(RecvState {
                chunks: VecDeque::new(),
                headers: VecDeque::new(),
                fin: false,
                reset: None,
                window: INITIAL_WINDOW,
            }),
            recv_notify: Notify::new(),
        }
    }

    pub fn recv(&self) -> MutexGuard<'_, RecvState> {
        self.recv.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_code(&self) -> Option<ErrorCode> {
        self.recv().reset
    }

    /// Marks the stream dead and wakes every waiter.
    pub fn mark_reset(&self, code: ErrorCode) {
        {
            let mut st = self.recv();
            if st.reset.is_none() {
                st.reset = Some(code);
            }
        }
        self.wake_all();
    }

    pub fn wake_all(&self) {
        self.recv_notify.notify_one();
        self.send_notify.notify_one();
        self.send_notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        let st = self.recv();
        st.reset.is_some() || (st.fin && self.local_fin.load(Ordering::Acquire))
    }
}

/// Handle to one multiplexed stream.
#[derive(Clone)]
pub struct MuxStream {
    pub(super) shared: std::sync::Arc<StreamShared>,
    pub(super) mux: Mux,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    /// Racy snapshot of how many bytes may be sent right now.
    pub fn send_window(&self) -> i64 {
        self.shared.send_window.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn recv_window(&self) -> i64 {
        self.shared.recv().window
    }

    /// Next HEADERS block from the peer.
    pub async fn recv_headers(&self) -> Result<Headers, MuxError> {
        loop {
            {
                let mut st = self.shared.recv();
                if let Some(h) = st.headers.pop_front() {
                    return Ok(h);
                }
                if let Some(code) = st.reset {
                    return Err(MuxError::StreamReset(code));
                }
                if st.fin {
                    return Err(MuxError::Protocol("stream ended before headers"));
                }
            }
            self.shared.recv_notify.notified().await;
        }
    }

    /// Next DATA chunk; `None` once the peer half-closed. Cancel safe.
    ///
    /// Popping a chunk replenishes the receive window back to its initial size once it
    /// has dropped to the threshold.
    pub async fn recv_data(&self) -> Result<Option<Bytes>, MuxError> {
        loop {
            let replenish = {
                let mut st = self.shared.recv();
                match st.chunks.pop_front() {
                    Some(chunk) => {
                        let inc = if st.window <= REPLENISH_THRESHOLD && st.reset.is_none() {
                            let inc = INITIAL_WINDOW - st.window;
                            st.window = INITIAL_WINDOW;
                            Some(inc)
                        } else {
                            None
                        };
                        Some((chunk, inc))
                    }
                    None => {
                        if let Some(code) = st.reset {
                            return Err(MuxError::StreamReset(code));
                        }
                        if st.fin {
                            return Ok(None);
                        }
                        None
                    }
                }
            };
            if let Some((chunk, inc)) = replenish {
                // Spawned so this future has no await point after the pop.
                if let Some(inc) = inc {
                    let mux = self.mux.clone();
                    let id = self.shared.id;
                    tokio::spawn(async move {
                        if let Ok(mut w) = mux.lock().await {
                            let _ = w.send_window_update(id, inc as u32).await;
                        }
                    });
                }
                return Ok(Some(chunk));
            }
            self.shared.recv_notify.notified().await;
        }
    }

    /// Waits until the send window exceeds `min`, returning the window seen.
    pub async fn wait_send_window(&self, min: i64) -> Result<i64, MuxError> {
        loop {
            let notified = self.shared.send_notify.notified();
            let w = self.send_window();
            if w > min {
                return Ok(w);
            }
            if let Some(code) = self.shared.reset_code() {
                return Err(MuxError::StreamReset(code));
            }
            notified.await;
        }
    }

    pub async fn send_headers(&self, headers: &Headers, end_stream: bool) -> Result<(), MuxError> {
        let mut w = self.mux.lock().await?;
        w.send_headers(self, headers, end_stream).await
    }

    pub async fn send_data(&self, data: &[u8], is_final: bool) -> Result<(), MuxError> {
        let mut w = self.mux.lock().await?;
        w.send_data(self, data, is_final).await
    }

    /// Resets the stream with `code` and forgets it.
    pub async fn reset(&self, code: ErrorCode) {
        if self.shared.reset_code().is_some() {
            return;
        }
        if let Ok(mut w) = self.mux.lock().await {
            let _ = w.stream_error(self.shared.id, code).await;
        } else {
            self.shared.mark_reset(code);
        }
    }

    #[cfg(test)]
    pub fn is_reset(&self) -> bool {
        self.shared.reset_code().is_some()
    }
}
