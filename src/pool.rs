//! The transfer pool: deduplicates concurrent pulls/pushes of the same
//! key (spec.md §4.3).

use crate::error::{PoolError, PoolResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

/// Which side of a transfer a key belongs to. A key may only be
/// in-flight under one kind at a time; `acquire` checks both maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Pull,
    Push,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Pull => "pull",
            Kind::Push => "push",
        }
    }
}

/// A write-only fan-out sink with terminal-value close semantics
/// (spec.md §9 "Concurrency primitives"). Subscribers attached before
/// close observe every subsequent write and the terminal result;
/// subscribers attached after close observe only the terminal result.
#[derive(Debug)]
pub struct Broadcaster {
    writes: broadcast::Sender<Vec<u8>>,
    terminal: watch::Sender<Option<PoolResult<()>>>,
}

impl Broadcaster {
    fn new() -> (Self, BroadcasterHandle) {
        let (writes, _) = broadcast::channel(256);
        let (terminal, terminal_rx) = watch::channel(None);
        let broadcaster = Broadcaster { writes, terminal };
        let handle = BroadcasterHandle { terminal: terminal_rx };
        (broadcaster, handle)
    }

    /// Fans a chunk of output out to every current subscriber. Errors if
    /// there are no subscribers are ignored: a slow or absent follower
    /// must never block the owner.
    pub fn write(&self, chunk: Vec<u8>) {
        let _ = self.writes.send(chunk);
    }

    /// A fresh receiver that will see every write from this point
    /// forward, plus the terminal value once closed.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.writes.subscribe()
    }

    /// Closes the broadcaster with a terminal result, delivered to every
    /// current and future subscriber of [`BroadcasterHandle::wait`].
    pub fn close(self, result: PoolResult<()>) {
        let _ = self.terminal.send(Some(result));
    }
}

/// What a follower (a caller that found an in-flight transfer already
/// under way) holds on to: a way to wait for the owner's terminal value.
pub struct BroadcasterHandle {
    terminal: watch::Receiver<Option<PoolResult<()>>>,
}

impl BroadcasterHandle {
    /// Blocks until the owning transfer closes the broadcaster, then
    /// returns its terminal result. Late subscribers (attached after
    /// close) return immediately.
    pub async fn wait(mut self) -> PoolResult<()> {
        loop {
            if let Some(result) = self.terminal.borrow().clone() {
                return result;
            }
            if self.terminal.changed().await.is_err() {
                return Err(PoolError::Failed("pool".into(), "owner dropped without closing".into()));
            }
        }
    }
}

/// Either the owner (performs the transfer) or a follower (subscribes
/// and waits) role returned by [`TransferPool::acquire`].
pub enum Role {
    Owner(Broadcaster),
    Follower(BroadcasterHandle),
}

/// Two keyed maps — `pulls` and `pushes` — each guaranteeing at most one
/// active transfer per key (spec.md §4.3).
#[derive(Default)]
pub struct TransferPool {
    pulls: Mutex<HashMap<String, BroadcasterHandle>>,
    pushes: Mutex<HashMap<String, BroadcasterHandle>>,
}

impl TransferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_for(&self, kind: Kind) -> &Mutex<HashMap<String, BroadcasterHandle>> {
        match kind {
            Kind::Pull => &self.pulls,
            Kind::Push => &self.pushes,
        }
    }

    /// Looks the key up under *both* kinds (a key being pulled can't
    /// simultaneously be pushed); if found, the caller is a follower.
    /// Otherwise it becomes the owner and must eventually call
    /// [`Broadcaster::close`] (directly, or via [`Self::release`]).
    pub fn acquire(&self, kind: Kind, key: &str) -> Role {
        if let Some(handle) = self.pulls.lock().unwrap().get(key).cloned() {
            return Role::Follower(handle);
        }
        if let Some(handle) = self.pushes.lock().unwrap().get(key).cloned() {
            return Role::Follower(handle);
        }

        let (broadcaster, handle) = Broadcaster::new();
        self.map_for(kind).lock().unwrap().insert(key.to_string(), handle);
        Role::Owner(broadcaster)
    }

    /// Like [`Self::acquire`] but fails with [`PoolError::AlreadyInProgress`]
    /// instead of returning a follower role, for callers that explicitly
    /// opt out of waiting (spec.md §7 "AlreadyInProgress").
    pub fn try_acquire(&self, kind: Kind, key: &str) -> PoolResult<Broadcaster> {
        match self.acquire(kind, key) {
            Role::Owner(b) => Ok(b),
            Role::Follower(_) => Err(PoolError::AlreadyInProgress { kind: kind.label(), key: key.to_string() }),
        }
    }

    /// Removes the entry for `key` under `kind` and closes it with
    /// `result`, delivering the terminal value to every follower.
    pub fn release(&self, kind: Kind, key: &str, broadcaster: Broadcaster, result: PoolResult<()>) {
        self.map_for(kind).lock().unwrap().remove(key);
        broadcaster.close(result);
    }
}

impl Clone for BroadcasterHandle {
    fn clone(&self) -> Self {
        BroadcasterHandle { terminal: self.terminal.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn exactly_one_caller_is_owner() {
        let pool = Arc::new(TransferPool::new());
        let owner_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let owner_count = owner_count.clone();
            handles.push(tokio::spawn(async move {
                match pool.acquire(Kind::Pull, "busybox:latest") {
                    Role::Owner(b) => {
                        owner_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        pool.release(Kind::Pull, "busybox:latest", b, Ok(()));
                        Ok(())
                    }
                    Role::Follower(h) => h.wait().await,
                }
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(owner_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn followers_observe_owner_error() {
        let pool = Arc::new(TransferPool::new());
        let owner = match pool.acquire(Kind::Pull, "img:abc") {
            Role::Owner(b) => b,
            Role::Follower(_) => panic!("expected owner"),
        };
        let follower = match pool.acquire(Kind::Pull, "img:abc") {
            Role::Follower(h) => h,
            Role::Owner(_) => panic!("expected follower"),
        };

        pool.release(Kind::Pull, "img:abc", owner, Err(PoolError::Failed("img:abc".into(), "boom".into())));
        let result = follower.wait().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn late_subscriber_sees_terminal_value_without_replay() {
        let pool = Arc::new(TransferPool::new());
        let owner = match pool.acquire(Kind::Pull, "layer:zzz") {
            Role::Owner(b) => b,
            Role::Follower(_) => panic!("expected owner"),
        };
        pool.release(Kind::Pull, "layer:zzz", owner, Ok(()));

        // A caller arriving after the transfer already finished finds no
        // in-flight entry at all and becomes a fresh owner, not a
        // follower — the pool only dedups concurrent work.
        match pool.acquire(Kind::Pull, "layer:zzz") {
            Role::Owner(b) => pool.release(Kind::Pull, "layer:zzz", b, Ok(())),
            Role::Follower(h) => assert!(h.wait().await.is_ok()),
        }
    }

    #[test]
    fn try_acquire_fails_when_already_in_progress() {
        let pool = TransferPool::new();
        let _owner = pool.try_acquire(Kind::Push, "repo:tag").unwrap();
        let err = pool.try_acquire(Kind::Push, "repo:tag").unwrap_err();
        assert!(matches!(err, PoolError::AlreadyInProgress { .. }));
    }
}
