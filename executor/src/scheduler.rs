use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use kale_common::api::notify::PlantedFarmersPayload;
use kale_common::config::WORK_DELAY_SECS;
use kale_common::model::{BlockIndex, Stroops};
use kale_common::time::now_secs;

// Timers are first-class entries in a wake-time ordered queue rather
// than detached sleeps; a duplicate notification for a block simply
// replaces its pending entry.

#[derive(Debug, Clone)]
pub struct ScheduledFarmer {
    pub farmer_id: Uuid,
    pub custodial_wallet: String,
    // Forwarded by the discoverer; lives only in this in-memory schedule
    // and dies with the block's pipeline.
    pub custodial_secret: String,
    pub stake: Stroops,
}

#[derive(Debug, Clone)]
pub struct WorkJob {
    pub block_index: BlockIndex,
    pub entropy: String,
    pub block_timestamp: u64,
    pub farmers: Vec<ScheduledFarmer>,
}

impl WorkJob {
    pub fn from_payload(payload: PlantedFarmersPayload) -> Self {
        let farmers = payload
            .planted_farmers
            .into_iter()
            .map(|entry| ScheduledFarmer {
                farmer_id: entry.farmer_id,
                custodial_wallet: entry.custodial_wallet,
                custodial_secret: entry.custodial_secret_key,
                stake: entry.stake_amount.parse().unwrap_or(0),
            })
            .collect();
        Self {
            block_index: payload.block_index,
            entropy: payload.entropy,
            block_timestamp: payload.block_timestamp,
            farmers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestJob {
    pub block_index: BlockIndex,
    pub farmers: Vec<ScheduledFarmer>,
}

#[derive(Debug)]
pub enum SchedulerCommand {
    // Wakes at block_timestamp + work delay
    ScheduleWork(WorkJob),
    // Wakes immediately; queued so work and harvest share one timeline
    ScheduleHarvest(HarvestJob),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobKind {
    Work,
    Harvest,
}

type JobKey = (JobKind, BlockIndex);

enum TimerJob {
    Work(WorkJob),
    Harvest(HarvestJob),
}

struct HeapEntry {
    wake_at: Instant,
    seq: u64,
    key: JobKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    // reversed so the earliest wake time sits on top of the max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler {
    cmd_rx: mpsc::Receiver<SchedulerCommand>,
    work_tx: mpsc::Sender<WorkJob>,
    harvest_tx: mpsc::Sender<HarvestJob>,
    work_delay: Duration,
    heap: BinaryHeap<HeapEntry>,
    jobs: HashMap<JobKey, (u64, TimerJob)>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new(
        cmd_rx: mpsc::Receiver<SchedulerCommand>,
        work_tx: mpsc::Sender<WorkJob>,
        harvest_tx: mpsc::Sender<HarvestJob>,
    ) -> Self {
        Self::with_work_delay(cmd_rx, work_tx, harvest_tx, Duration::from_secs(WORK_DELAY_SECS))
    }

    pub fn with_work_delay(
        cmd_rx: mpsc::Receiver<SchedulerCommand>,
        work_tx: mpsc::Sender<WorkJob>,
        harvest_tx: mpsc::Sender<HarvestJob>,
        work_delay: Duration,
    ) -> Self {
        Self {
            cmd_rx,
            work_tx,
            harvest_tx,
            work_delay,
            heap: BinaryHeap::new(),
            jobs: HashMap::new(),
            next_seq: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started, work delay {:?}", self.work_delay);
        loop {
            let next_wake = self.heap.peek().map(|entry| entry.wake_at);
            tokio::select! {
                _ = shutdown.changed() => break,
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = conditional_sleep(next_wake), if next_wake.is_some() => {
                    self.fire_due().await;
                }
            }
        }
        info!("scheduler stopped, {} timer(s) cancelled", self.jobs.len());
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::ScheduleWork(job) => {
                let due_unix = job.block_timestamp + self.work_delay.as_secs();
                let wake_in = Duration::from_secs(due_unix.saturating_sub(now_secs()));
                info!(
                    "block {}: work due in {wake_in:?} for {} farmers",
                    job.block_index,
                    job.farmers.len()
                );
                self.insert(
                    (JobKind::Work, job.block_index),
                    Instant::now() + wake_in,
                    TimerJob::Work(job),
                );
            }
            SchedulerCommand::ScheduleHarvest(job) => {
                debug!("block {}: harvest queued", job.block_index);
                self.insert(
                    (JobKind::Harvest, job.block_index),
                    Instant::now(),
                    TimerJob::Harvest(job),
                );
            }
        }
    }

    fn insert(&mut self, key: JobKey, wake_at: Instant, job: TimerJob) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if self.jobs.insert(key, (seq, job)).is_some() {
            // the stale heap entry stays behind and is dropped on pop
            warn!("duplicate schedule for {key:?}, replacing the pending entry");
        }
        self.heap.push(HeapEntry { wake_at, seq, key });
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.heap.peek() {
            if entry.wake_at > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry vanished");

            // lazy deletion: only the latest generation of a key fires
            let current = match self.jobs.get(&entry.key) {
                Some((seq, _)) if *seq == entry.seq => true,
                _ => false,
            };
            if !current {
                continue;
            }
            let (_, job) = self.jobs.remove(&entry.key).expect("job vanished");

            match job {
                TimerJob::Work(job) => {
                    if self.work_tx.send(job).await.is_err() {
                        warn!("work runner is gone, dropping job");
                    }
                }
                TimerJob::Harvest(job) => {
                    if self.harvest_tx.send(job).await.is_err() {
                        warn!("harvester is gone, dropping job");
                    }
                }
            }
        }
    }
}

async fn conditional_sleep(wake_at: Option<Instant>) {
    match wake_at {
        Some(instant) => sleep_until(instant).await,
        // guarded by `if next_wake.is_some()`, never polled
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    fn farmer() -> ScheduledFarmer {
        ScheduledFarmer {
            farmer_id: Uuid::new_v4(),
            custodial_wallet: "GWALLET".into(),
            custodial_secret: "SSECRET".into(),
            stake: 1_000_000,
        }
    }

    fn work_job(block_index: BlockIndex, block_timestamp: u64) -> WorkJob {
        WorkJob {
            block_index,
            entropy: "ab".repeat(32),
            block_timestamp,
            farmers: vec![farmer()],
        }
    }

    struct Harness {
        cmd_tx: mpsc::Sender<SchedulerCommand>,
        work_rx: mpsc::Receiver<WorkJob>,
        harvest_rx: mpsc::Receiver<HarvestJob>,
        _shutdown: watch::Sender<bool>,
    }

    fn spawn_scheduler(work_delay: Duration) -> Harness {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (work_tx, work_rx) = mpsc::channel(16);
        let (harvest_tx, harvest_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::with_work_delay(cmd_rx, work_tx, harvest_tx, work_delay);
        tokio::spawn(scheduler.run(shutdown_rx));
        Harness {
            cmd_tx,
            work_rx,
            harvest_rx,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn work_fires_only_after_the_delay() {
        let mut harness = spawn_scheduler(Duration::from_secs(240));
        harness
            .cmd_tx
            .send(SchedulerCommand::ScheduleWork(work_job(42, now_secs())))
            .await
            .unwrap();

        // one second short of the delay: nothing may fire
        advance(Duration::from_secs(239)).await;
        assert!(harness.work_rx.try_recv().is_err());

        // past the delay the job is dispatched
        advance(Duration::from_secs(2)).await;
        let job = harness.work_rx.recv().await.unwrap();
        assert_eq!(job.block_index, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn work_for_an_old_block_fires_immediately() {
        let mut harness = spawn_scheduler(Duration::from_secs(240));
        // block timestamp already past the work delay
        harness
            .cmd_tx
            .send(SchedulerCommand::ScheduleWork(work_job(7, now_secs().saturating_sub(400))))
            .await
            .unwrap();

        advance(Duration::from_millis(10)).await;
        let job = harness.work_rx.recv().await.unwrap();
        assert_eq!(job.block_index, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_schedule_replaces_the_entry() {
        let mut harness = spawn_scheduler(Duration::from_secs(240));

        let first = work_job(42, now_secs());
        harness
            .cmd_tx
            .send(SchedulerCommand::ScheduleWork(first))
            .await
            .unwrap();

        let mut second = work_job(42, now_secs());
        second.farmers.push(farmer());
        harness
            .cmd_tx
            .send(SchedulerCommand::ScheduleWork(second))
            .await
            .unwrap();

        advance(Duration::from_secs(242)).await;
        let job = harness.work_rx.recv().await.unwrap();
        // only the second generation fired, with its two farmers
        assert_eq!(job.farmers.len(), 2);
        assert!(harness.work_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn harvest_jobs_fire_right_away() {
        let mut harness = spawn_scheduler(Duration::from_secs(240));
        harness
            .cmd_tx
            .send(SchedulerCommand::ScheduleHarvest(HarvestJob {
                block_index: 42,
                farmers: vec![farmer()],
            }))
            .await
            .unwrap();

        advance(Duration::from_millis(10)).await;
        let job = harness.harvest_rx.recv().await.unwrap();
        assert_eq!(job.block_index, 42);
    }
}
