use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::{CkptError, CkptResult};

pub type PendingRecv = Pin<Box<dyn Future<Output = CkptResult<Vec<u8>>> + Send>>;
pub type PendingSend = Pin<Box<dyn Future<Output = CkptResult<()>> + Send>>;

/// Collective messaging fabric. One endpoint per process of the parallel job.
///
/// All collectives (barrier, broadcast, all_and, and the tree exchange built
/// on send/recv) must be entered in the same global sequence on every rank.
/// Point-to-point messages between a (src, dst) pair are delivered FIFO.
#[async_trait]
pub trait Fabric: Send + Sync {
    fn rank(&self) -> u32;
    fn world_size(&self) -> u32;

    async fn barrier(&self) -> CkptResult<()>;

    /// Root's payload is returned on every rank.
    async fn broadcast(&self, root: u32, payload: Vec<u8>) -> CkptResult<Vec<u8>>;

    async fn send(&self, to: u32, payload: Vec<u8>) -> CkptResult<()>;
    async fn recv(&self, from: u32) -> CkptResult<Vec<u8>>;

    /// Logical AND of `value` across all ranks.
    async fn all_and(&self, value: bool) -> CkptResult<bool>;

    /// Post a non-blocking receive for the next message from `from`.
    fn post_recv(&self, from: u32) -> PendingRecv;

    /// Post a non-blocking send. The returned future completes when the
    /// message has been handed to the transport.
    fn post_send(&self, to: u32, payload: Vec<u8>) -> PendingSend;
}

type Inbox = Arc<Mutex<UnboundedReceiver<Vec<u8>>>>;

/// In-process fabric over per-pair unbounded channels. Used by the test
/// harness to run world-size SPMD tasks inside one process.
#[derive(Clone)]
pub struct LocalFabric {
    rank: u32,
    world: u32,
    // senders[dst][src]
    senders: Arc<Vec<Vec<UnboundedSender<Vec<u8>>>>>,
    // this endpoint's inbox per source rank
    inboxes: Arc<HashMap<u32, Inbox>>,
}

impl LocalFabric {
    /// Build all endpoints of an `n`-rank world.
    pub fn world(n: u32) -> Vec<LocalFabric> {
        assert!(n > 0, "world size must be positive");
        let mut senders: Vec<Vec<UnboundedSender<Vec<u8>>>> = Vec::with_capacity(n as usize);
        let mut inboxes: Vec<HashMap<u32, Inbox>> = Vec::with_capacity(n as usize);
        for _dst in 0..n {
            let mut row = Vec::with_capacity(n as usize);
            let mut boxes = HashMap::new();
            for src in 0..n {
                let (tx, rx) = unbounded_channel();
                row.push(tx);
                boxes.insert(src, Arc::new(Mutex::new(rx)));
            }
            senders.push(row);
            inboxes.push(boxes);
        }
        let senders = Arc::new(senders);
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, boxes)| LocalFabric {
                rank: rank as u32,
                world: n,
                senders: senders.clone(),
                inboxes: Arc::new(boxes),
            })
            .collect()
    }

    fn sender(&self, to: u32) -> CkptResult<&UnboundedSender<Vec<u8>>> {
        self.senders
            .get(to as usize)
            .map(|row| &row[self.rank as usize])
            .ok_or_else(|| CkptError::FabricError(format!("no such rank {}", to)))
    }

    fn inbox(&self, from: u32) -> CkptResult<Inbox> {
        self.inboxes
            .get(&from)
            .cloned()
            .ok_or_else(|| CkptError::FabricError(format!("no such rank {}", from)))
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world
    }

    async fn barrier(&self) -> CkptResult<()> {
        if self.rank == 0 {
            for src in 1..self.world {
                self.recv(src).await?;
            }
            for dst in 1..self.world {
                self.send(dst, Vec::new()).await?;
            }
        } else {
            self.send(0, Vec::new()).await?;
            self.recv(0).await?;
        }
        Ok(())
    }

    async fn broadcast(&self, root: u32, payload: Vec<u8>) -> CkptResult<Vec<u8>> {
        if self.rank == root {
            for dst in 0..self.world {
                if dst != root {
                    self.send(dst, payload.clone()).await?;
                }
            }
            Ok(payload)
        } else {
            self.recv(root).await
        }
    }

    async fn send(&self, to: u32, payload: Vec<u8>) -> CkptResult<()> {
        self.sender(to)?
            .send(payload)
            .map_err(|_| CkptError::FabricError(format!("rank {} is gone", to)))
    }

    async fn recv(&self, from: u32) -> CkptResult<Vec<u8>> {
        let inbox = self.inbox(from)?;
        let mut rx = inbox.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| CkptError::FabricError(format!("rank {} closed its channel", from)))
    }

    async fn all_and(&self, value: bool) -> CkptResult<bool> {
        if self.rank == 0 {
            let mut acc = value;
            for src in 1..self.world {
                let data = self.recv(src).await?;
                acc &= data.first().copied() == Some(1);
            }
            for dst in 1..self.world {
                self.send(dst, vec![acc as u8]).await?;
            }
            Ok(acc)
        } else {
            self.send(0, vec![value as u8]).await?;
            let data = self.recv(0).await?;
            Ok(data.first().copied() == Some(1))
        }
    }

    fn post_recv(&self, from: u32) -> PendingRecv {
        let inbox = self.inbox(from);
        Box::pin(async move {
            let inbox = inbox?;
            let mut rx = inbox.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| CkptError::FabricError("peer closed its channel".to_string()))
        })
    }

    fn post_send(&self, to: u32, payload: Vec<u8>) -> PendingSend {
        let sender = self.sender(to).cloned();
        Box::pin(async move {
            sender?
                .send(payload)
                .map_err(|_| CkptError::FabricError("peer is gone".to_string()))
        })
    }
}
