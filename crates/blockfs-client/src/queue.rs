//! Shared state of one output stream: the pending and in-flight packet
//! queues plus the flags both background workers and foreground callers
//! coordinate through.
//!
//! One async mutex guards the whole state; a single [`Notify`] plays the
//! role of the three condition variables ("capacity available", "work
//! available", "sequence acknowledged") — every waiter re-checks its own
//! predicate after a wake-up, so one broadcast channel suffices.

use std::collections::VecDeque;

use tokio::sync::{Mutex, MutexGuard, Notify};

use blockfs_proto::Packet;
use blockfs_types::SequenceNumber;

use crate::error::{ClientError, ClientResult};

pub(crate) struct StreamState {
    /// Packets waiting to be transmitted, oldest first.
    pub pending: VecDeque<Packet>,
    /// Packets transmitted but not yet acknowledged, oldest first.
    pub inflight: VecDeque<Packet>,
    /// Highest sequence number handed to the pending queue.
    pub last_queued: SequenceNumber,
    /// Highest sequence number acknowledged in order.
    pub last_acked: SequenceNumber,
    /// Fatal-error flag; makes the streamer run pipeline recovery.
    pub has_error: bool,
    /// Pipeline index of the replica to evict on the next recovery pass.
    pub error_index: Option<usize>,
    /// First fatal error observed; set at most once between recoveries and
    /// replayed to every blocked caller once the stream is closed.
    pub error: Option<ClientError>,
    /// Closed flag; both workers observe it and exit instead of retrying.
    pub closed: bool,
    /// Whether blocks were allocated since the last metadata-service fsync.
    pub persist_blocks: bool,
    /// Size of the live pipeline, when one is connected.
    pub pipeline_len: Option<usize>,
}

impl StreamState {
    /// Total packets the writer is on the hook for.
    pub fn queued_len(&self) -> usize {
        self.pending.len() + self.inflight.len()
    }

    /// Record the first error; later errors are dropped.
    pub fn set_error_once(&mut self, err: ClientError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// The stored error if the stream is already closed with one.
    pub fn closed_error(&self) -> Option<ClientError> {
        if self.closed {
            self.error.clone()
        } else {
            None
        }
    }
}

pub(crate) struct StreamShared {
    /// Cap on `queued_len`; writers block above it.
    pub max_queued: usize,
    state: Mutex<StreamState>,
    changed: Notify,
}

impl StreamShared {
    pub fn new(max_queued: usize) -> Self {
        Self {
            max_queued,
            state: Mutex::new(StreamState {
                pending: VecDeque::new(),
                inflight: VecDeque::new(),
                last_queued: SequenceNumber(-1),
                last_acked: SequenceNumber(-1),
                has_error: false,
                error_index: None,
                error: None,
                closed: false,
                persist_blocks: false,
                pipeline_len: None,
            }),
            changed: Notify::new(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().await
    }

    /// Wake every waiter so it re-checks its predicate.
    pub fn notify(&self) {
        self.changed.notify_waiters();
    }

    /// Apply `f` under the lock, then wake all waiters.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut StreamState) -> T) -> T {
        let out = {
            let mut st = self.state.lock().await;
            f(&mut st)
        };
        self.changed.notify_waiters();
        out
    }

    /// Block until `f` yields a value.
    ///
    /// The notification is armed before the predicate runs, so a state
    /// change between the check and the await is never lost.
    pub async fn wait_until<T, F>(&self, mut f: F) -> T
    where
        F: FnMut(&mut StreamState) -> Option<T>,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if let Some(v) = f(&mut st) {
                    return v;
                }
            }
            notified.await;
        }
    }

    /// Block the caller until everything up to `target` is acknowledged.
    ///
    /// Returns the stored error if the stream closes with one first; a clean
    /// close releases the waiter silently.
    pub async fn wait_for_acked(&self, target: SequenceNumber) -> ClientResult<()> {
        self.wait_until(|st| {
            if st.closed {
                return Some(match &st.error {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                });
            }
            if st.last_acked >= target {
                Some(Ok(()))
            } else {
                None
            }
        })
        .await
    }

    /// Block the writer while the combined queue length is above the cap.
    pub async fn wait_for_space(&self) -> ClientResult<()> {
        let max = self.max_queued;
        self.wait_until(move |st| {
            if st.closed {
                return Some(Err(st
                    .error
                    .clone()
                    .unwrap_or(ClientError::StreamClosed)));
            }
            if st.queued_len() <= max {
                Some(Ok(()))
            } else {
                None
            }
        })
        .await
    }

    /// Record a fatal error and flag recovery.
    ///
    /// Only the response processor and pipeline setup ever name a replica
    /// index; the first accusation wins so a racing send failure cannot
    /// redirect the eviction.
    pub async fn raise_error(&self, err: ClientError, error_index: Option<usize>) {
        self.mutate(|st| {
            st.set_error_once(err);
            st.has_error = true;
            if st.error_index.is_none() {
                st.error_index = error_index;
            }
        })
        .await;
    }
}
