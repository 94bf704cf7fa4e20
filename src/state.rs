//! The connection state machine: an atomic bitset with gated transitions.
//!
//! READING and WRITING are acquired independently by the two I/O tasks so
//! they start in parallel; both set means the connection is alive. RECONNECT
//! tells the supervisor to rebuild the socket and blocks fresh I/O acquires
//! until it does. CLOSED is terminal and absorbing. SCHEMA_UPDATING is
//! orthogonal to liveness and acts as a one-shot guard around catalog
//! refresh.
//!
//! Transitions run as read-modify-writes inside a watch channel so every
//! waiter observes them without missed wakeups.

use tokio::sync::watch;

pub const UNINITIALIZED: u32 = 0;
pub const READING: u32 = 1;
pub const WRITING: u32 = 2;
pub const ALIVE: u32 = READING | WRITING;
pub const SCHEMA_UPDATING: u32 = 1 << 2;
pub const RECONNECT: u32 = 1 << 3;
pub const CLOSED: u32 = 1 << 4;

pub(crate) struct ConnState {
    tx: watch::Sender<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Acquired {
    pub ok: bool,
    /// The transition that reached ALIVE; fires the reconnect hook.
    pub became_alive: bool,
}

impl ConnState {
    pub fn new(initial: u32) -> Self {
        Self { tx: watch::Sender::new(initial) }
    }

    #[inline]
    pub fn get(&self) -> u32 {
        *self.tx.borrow()
    }

    #[inline]
    pub fn is_set(&self, mask: u32) -> bool {
        self.get() & mask == mask
    }

    /// Tries to set `mask`. Refused when CLOSED, when RECONNECT gates the
    /// requested bits, or when the bits are already set.
    pub fn acquire(&self, mask: u32) -> Acquired {
        let mut became_alive = false;
        let ok = self.tx.send_if_modified(|s| {
            if *s & CLOSED != 0 {
                return false;
            }
            if (*s & RECONNECT) > mask {
                return false;
            }
            if *s & mask == mask {
                return false;
            }
            let was_alive = *s & ALIVE == ALIVE;
            *s |= mask;
            if !was_alive && *s & ALIVE == ALIVE {
                became_alive = true;
            }
            true
        });
        Acquired { ok, became_alive }
    }

    pub fn release(&self, mask: u32) {
        self.tx.send_if_modified(|s| {
            let old = *s;
            *s &= !mask;
            *s != old
        });
    }

    /// Clears everything and sets CLOSED. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if *s & CLOSED != 0 {
                return false;
            }
            *s = CLOSED;
            true
        })
    }

    /// Fires the reconnect signal, but only from the fully released state;
    /// of the two I/O tasks only the last one to release gets through here.
    pub fn try_signal_reconnect(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if *s == UNINITIALIZED {
                *s = RECONNECT;
                return true;
            }
            false
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }

    /// Blocks until every bit of `mask` is set or the machine is closed.
    /// Returns the observed state.
    pub async fn await_state(&self, mask: u32) -> u32 {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| *s & mask == mask || *s & CLOSED != 0)
            .await
            .map(|s| *s)
            .unwrap_or(CLOSED);
        state
    }

    /// Blocks until the supervisor should run again.
    pub async fn await_reconnect(&self) -> u32 {
        let mut rx = self.subscribe();
        rx.wait_for(|s| *s & (RECONNECT | CLOSED) != 0).await.map(|s| *s).unwrap_or(CLOSED)
    }
}
