use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::time::interval;

use kale_common::config::BLOCK_QUEUE_DEPTH;
use kale_common::model::BlockIndex;
use kale_common::time::block_age_secs;
use kale_wallet::{BlockHead, ChainAdapter};

use crate::planter::Planter;

// Heads wait here while a plant burst is in flight. Depth is bounded;
// when full the oldest queued head is dropped with a warning, since it
// would be past the plant cutoff by the time its turn came anyway.
pub struct BlockQueue {
    inner: Mutex<VecDeque<BlockHead>>,
    ready: Notify,
    depth: usize,
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new(BLOCK_QUEUE_DEPTH)
    }
}

impl BlockQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(depth)),
            ready: Notify::new(),
            depth,
        }
    }

    pub fn push(&self, head: BlockHead) {
        {
            let mut queue = self.inner.lock().expect("block queue lock poisoned");
            if queue.len() == self.depth {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        "block queue full, dropping block {} (age {}s)",
                        dropped.block_index,
                        block_age_secs(dropped.timestamp)
                    );
                }
            }
            queue.push_back(head);
        }
        self.ready.notify_one();
    }

    pub async fn next(&self) -> BlockHead {
        loop {
            if let Some(head) = self.inner.lock().expect("block queue lock poisoned").pop_front() {
                return head;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("block queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Watches the chain head on a fixed cadence and feeds new blocks to the
// queue. Bursts never run on this task, so polling is never starved.
pub struct Poller {
    chain: Arc<dyn ChainAdapter>,
    queue: Arc<BlockQueue>,
    poll_interval: Duration,
    last_seen: Option<BlockIndex>,
}

impl Poller {
    pub fn new(chain: Arc<dyn ChainAdapter>, queue: Arc<BlockQueue>, poll_interval: Duration) -> Self {
        Self {
            chain,
            queue,
            poll_interval,
            last_seen: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("poller started, interval {:?}", self.poll_interval);
        let mut ticker = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
        info!("poller stopped");
    }

    async fn poll_once(&mut self) {
        let head = match self.chain.head().await {
            Ok(head) => head,
            Err(err) => {
                warn!("head poll failed: {err}");
                return;
            }
        };

        match self.last_seen {
            Some(last) if head.block_index == last => {}
            Some(last) if head.block_index < last => {
                // reorg: history stays as recorded, the newer index wins
                warn!(
                    "head regressed from {last} to {}, ignoring the older index",
                    head.block_index
                );
            }
            Some(last) => {
                let gap = head.block_index - last;
                if gap > 1 {
                    // intermediate indices were never observed as head;
                    // by now they are past the plant cutoff
                    warn!("missed {} block(s) between {last} and {}", gap - 1, head.block_index);
                }
                self.accept(head);
            }
            None => {
                info!("first head observed: block {}", head.block_index);
                self.accept(head);
            }
        }
    }

    fn accept(&mut self, head: BlockHead) {
        debug!(
            "new block {} (age {}s, plantable: {})",
            head.block_index,
            block_age_secs(head.timestamp),
            head.plantable
        );
        self.last_seen = Some(head.block_index);
        self.queue.push(head);
    }
}

// Drains the queue one block at a time; a burst for block n completes
// before the burst for n+1 starts, which keeps every custodial wallet at
// a single in-flight plant tx.
pub struct BurstWorker {
    planter: Planter,
    queue: Arc<BlockQueue>,
}

impl BurstWorker {
    pub fn new(planter: Planter, queue: Arc<BlockQueue>) -> Self {
        Self { planter, queue }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("burst worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                head = self.queue.next() => {
                    let block_index = head.block_index;
                    if let Err(err) = self.planter.process_block(&head).await {
                        error!("block {block_index} pipeline failed: {err}");
                    }
                }
            }
        }
        info!("burst worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(index: BlockIndex) -> BlockHead {
        BlockHead {
            block_index: index,
            entropy: "00".repeat(32),
            timestamp: kale_common::time::now_secs(),
            plantable: true,
            min_stake: 0,
            max_stake: 10_000_000,
            min_zeros: 4,
            max_zeros: 9,
        }
    }

    #[tokio::test]
    async fn queue_drops_oldest_when_full() {
        let queue = BlockQueue::new(2);
        queue.push(head(1));
        queue.push(head(2));
        queue.push(head(3));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.block_index, 2);
        assert_eq!(queue.next().await.block_index, 3);
    }

    #[tokio::test]
    async fn queue_wakes_a_waiting_consumer() {
        let queue = Arc::new(BlockQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.block_index })
        };
        // give the consumer time to park
        tokio::task::yield_now().await;
        queue.push(head(7));
        assert_eq!(consumer.await.unwrap(), 7);
    }
}
