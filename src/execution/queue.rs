//! Work queue of one pool.
//!
//! The [`QueueActor`] owns every test of its pool. A test is either
//! *pending* (owed an attempt, waiting for a device) or *active* (part of
//! a batch running on exactly one device). Moving tests between the two is
//! done only here, one message at a time, which is what keeps two devices
//! from ever running the same test concurrently.
//!
//! # Reconciliation
//!
//! | Outcome | Condition | Effect |
//! |---------|-----------|--------|
//! | passed / ignored | strict run with attempts still owed | recorded, not final |
//! | passed / ignored | otherwise | preventive flaky copies cancelled, final once nothing is owed |
//! | failed | strict run | final failure |
//! | failed | matches an ignore-crash pattern, quota left | requeued against the uncompleted quota |
//! | failed | attempts still owed | recorded, not final |
//! | failed | retry strategy allows it | requeued, not final |
//! | failed | otherwise | final failure |
//! | uncompleted | quota left | requeued, not tracked |
//! | uncompleted | quota exhausted | recorded as failure, final unless attempts are owed |

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{PoolMessage, QueueMessage};
use super::{ExecutionContext, INBOX_CAPACITY};
use crate::analytics::Tracker;
use crate::logs::BatchLogs;
use crate::model::{
    DeviceInfo, DevicePoolId, Test, TestBatch, TestBatchResults, TestResult, TestShard, TestStatus,
};

struct ActiveBatch {
    device: DeviceInfo,
    batch: TestBatch,
}

#[derive(Debug, Default)]
struct TestState {
    /// Attempts not yet reconciled, pending or running.
    owed: usize,
    /// Part of `owed` added as preventive flaky copies. These are consumed
    /// last and cancelled by a pass.
    flaky: usize,
    /// Retries granted by the retry strategy.
    retries: u32,
    results: Vec<TestResult>,
    terminal: bool,
}

enum Outcome {
    Finished,
    Failed,
    Uncompleted,
}

/// Sequential owner of one pool's tests.
pub struct QueueActor {
    pool_id: DevicePoolId,
    ctx: ExecutionContext,
    pool: mpsc::Sender<PoolMessage>,
    pending: VecDeque<Test>,
    active: HashMap<String, ActiveBatch>,
    tests: HashMap<Test, TestState>,
    uncompleted_quota: u32,
    total_retries: u32,
    stop_requested: bool,
    terminated: bool,
}

impl QueueActor {
    pub fn new(pool_id: DevicePoolId, ctx: ExecutionContext, pool: mpsc::Sender<PoolMessage>) -> Self {
        let uncompleted_quota = ctx.run.uncompleted_test_retry_quota;
        Self {
            pool_id,
            ctx,
            pool,
            pending: VecDeque::new(),
            active: HashMap::new(),
            tests: HashMap::new(),
            uncompleted_quota,
            total_retries: 0,
            stop_requested: false,
            terminated: false,
        }
    }

    /// Starts the actor on its own task.
    pub fn spawn(
        pool_id: DevicePoolId,
        ctx: ExecutionContext,
        pool: mpsc::Sender<PoolMessage>,
    ) -> (mpsc::Sender<QueueMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let actor = Self::new(pool_id, ctx, pool);
        (tx, tokio::spawn(actor.run(rx)))
    }

    /// Processes messages until every sender is dropped.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<QueueMessage>) {
        while let Some(message) = inbox.recv().await {
            self.handle(message).await;
        }
        debug!("[{}] queue inbox closed", self.pool_id);
    }

    pub async fn handle(&mut self, message: QueueMessage) {
        match message {
            QueueMessage::AddShard(shard) => self.add_shard(shard).await,
            QueueMessage::RequestBatch(device) => self.request_batch(device).await,
            QueueMessage::Completed(device, results) => self.completed(device, results).await,
            QueueMessage::ReturnBatch(device, batch) => self.return_batch(device, batch).await,
            QueueMessage::IsEmpty(reply) => {
                let _ = reply.send(self.is_empty());
            }
            QueueMessage::Stop => {
                info!("[{}] stop requested, abandoning {} pending tests", self.pool_id, self.pending.len());
                self.stop_requested = true;
                self.check_terminated().await;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    pub fn uncompleted_quota(&self) -> u32 {
        self.uncompleted_quota
    }

    /// All reconciled attempts of a test, oldest first.
    pub fn results(&self, test: &Test) -> &[TestResult] {
        self.tests.get(test).map(|s| s.results.as_slice()).unwrap_or(&[])
    }

    async fn send(&self, message: PoolMessage) {
        if self.pool.send(message).await.is_err() {
            debug!("[{}] pool is gone, dropping message", self.pool_id);
        }
    }

    async fn add_shard(&mut self, shard: TestShard) {
        if self.terminated {
            warn!("[{}] queue already terminated, ignoring shard", self.pool_id);
            return;
        }

        let added: Vec<(Test, bool)> = shard
            .tests
            .into_iter()
            .map(|t| (t, false))
            .chain(shard.flaky_tests.into_iter().map(|t| (t, true)))
            .filter(|(t, _)| !self.tests.contains_key(t))
            .collect();

        for (test, preventive) in &added {
            let state = self.tests.entry(test.clone()).or_default();
            state.owed += 1;
            if *preventive {
                state.flaky += 1;
            }
            self.pending.push_back(test.clone());
        }

        info!("[{}] added {} test executions", self.pool_id, added.len());
        if !added.is_empty() {
            self.ctx.progress.add_tests(&self.pool_id, added.len());
            self.send(PoolMessage::Notify).await;
        }
        self.check_terminated().await;
    }

    async fn request_batch(&mut self, device: DeviceInfo) {
        match self.next_batch(&device) {
            Some(batch) => {
                debug!(
                    "[{}] dispatching batch {} ({} tests) to {}",
                    self.pool_id,
                    batch.id,
                    batch.len(),
                    device.serial_number
                );
                self.active.insert(
                    batch.id.clone(),
                    ActiveBatch {
                        device: device.clone(),
                        batch: batch.clone(),
                    },
                );
                self.send(PoolMessage::ExecuteBatch(device, batch)).await;
            }
            None => self.send(PoolMessage::NoWork(device)).await,
        }
    }

    /// Distinct pending tests that are not running anywhere, in queue order.
    fn candidates(&self) -> Vec<Test> {
        let running: HashSet<&Test> = self
            .active
            .values()
            .flat_map(|a| a.batch.tests.iter())
            .collect();
        let mut seen = HashSet::new();
        self.pending
            .iter()
            .filter(|t| !running.contains(*t) && seen.insert(*t))
            .cloned()
            .collect()
    }

    fn next_batch(&mut self, device: &DeviceInfo) -> Option<TestBatch> {
        if self.stop_requested || self.terminated {
            return None;
        }
        if self
            .active
            .values()
            .any(|a| a.device.serial_number == device.serial_number)
        {
            warn!(
                "[{}] {} requested a batch while still running one",
                self.pool_id, device.serial_number
            );
            return None;
        }

        let candidates = self.candidates();
        let first = candidates.first()?.clone();

        let mut seen = HashSet::new();
        let mut chosen = self.ctx.strategies.batching.next_batch(&candidates);
        chosen.retain(|t| candidates.contains(t) && seen.insert(t.clone()));
        if chosen.is_empty() {
            chosen.push(first.clone());
        }

        let batch = match TestBatch::from_tests(chosen) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("[{}] batching strategy produced an invalid batch: {}", self.pool_id, e);
                TestBatch::from_tests(vec![first]).ok()?
            }
        };

        for test in &batch.tests {
            if let Some(idx) = self.pending.iter().position(|t| t == test) {
                self.pending.remove(idx);
            }
        }
        Some(batch)
    }

    async fn completed(&mut self, device: DeviceInfo, results: TestBatchResults) {
        let Some(active) = self.active.remove(&results.batch_id) else {
            warn!(
                "[{}] dropping results of unknown batch {} from {}",
                self.pool_id, results.batch_id, device.serial_number
            );
            return;
        };
        if active.device.serial_number != device.serial_number {
            warn!(
                "[{}] batch {} was dispatched to {} but completed by {}",
                self.pool_id, active.batch.id, active.device.serial_number, device.serial_number
            );
        }

        let outcomes = Self::outcomes(&active.batch, &device, results);
        let logs = if outcomes.iter().any(|(o, _)| matches!(o, Outcome::Failed))
            && !self.ctx.crash_patterns.is_empty()
        {
            self.batch_logs(&active.batch.id).await
        } else {
            None
        };

        let mut requeued = false;
        for (outcome, result) in outcomes {
            requeued |= match outcome {
                Outcome::Finished => self.on_finished(result),
                Outcome::Failed => self.on_failed(result, logs.as_ref()),
                Outcome::Uncompleted => self.on_uncompleted(result),
            };
        }

        if requeued {
            self.send(PoolMessage::Notify).await;
        }
        self.check_terminated().await;
    }

    /// Pairs each batch test with exactly one result.
    ///
    /// Later duplicates and results for foreign tests are dropped; tests
    /// without a result are reconciled as uncompleted.
    fn outcomes(
        batch: &TestBatch,
        device: &DeviceInfo,
        results: TestBatchResults,
    ) -> Vec<(Outcome, TestResult)> {
        let TestBatchResults {
            finished,
            failed,
            uncompleted,
            ..
        } = results;

        let tagged = finished
            .into_iter()
            .map(|r| (Outcome::Finished, r))
            .chain(failed.into_iter().map(|r| (Outcome::Failed, r)))
            .chain(uncompleted.into_iter().map(|r| (Outcome::Uncompleted, r)));

        let mut seen = HashSet::new();
        let mut outcomes = Vec::with_capacity(batch.len());
        for (outcome, result) in tagged {
            if !batch.contains(&result.test) {
                warn!("Dropping result for {} which is not part of batch {}", result.test, batch.id);
            } else if seen.insert(result.test.clone()) {
                outcomes.push((outcome, result));
            }
        }
        for test in batch.tests.iter().filter(|t| !seen.contains(*t)) {
            outcomes.push((
                Outcome::Uncompleted,
                TestResult::new(test.clone(), device.clone(), TestStatus::Incomplete, &batch.id)
                    .with_stacktrace("Test was not reported by the device"),
            ));
        }
        outcomes
    }

    async fn batch_logs(&self, batch_id: &str) -> Option<BatchLogs> {
        let wait = self.ctx.run.logs_wait_timeout();
        match tokio::time::timeout(wait, self.ctx.logs.batch_report(batch_id)).await {
            Ok(logs) => logs,
            Err(_) => {
                debug!("[{}] logs of batch {} not ready after {:?}", self.pool_id, batch_id, wait);
                None
            }
        }
    }

    fn is_ignored_crash(&self, result: &TestResult, logs: Option<&BatchLogs>) -> bool {
        let in_stacktrace = result
            .stacktrace
            .as_deref()
            .is_some_and(|s| self.ctx.is_ignored_crash(s));
        let in_logs = logs
            .and_then(|l| l.for_test(&result.test))
            .is_some_and(|log| log.crash_messages().any(|m| self.ctx.is_ignored_crash(m)));
        in_stacktrace || in_logs
    }

    fn mark_strict(&self, result: TestResult) -> TestResult {
        let is_strict_run = result.is_strict_run || self.ctx.strict.is_strict_run(&result.test);
        TestResult {
            is_strict_run,
            ..result
        }
    }

    /// Consumes one owed attempt and returns how many are still owed.
    fn take_attempt(&mut self, result: &TestResult) -> Option<usize> {
        let Some(state) = self.tests.get_mut(&result.test) else {
            warn!("[{}] dropping result for unknown test {}", self.pool_id, result.test);
            return None;
        };
        if state.terminal {
            warn!(
                "[{}] dropping result for {} which already has a final verdict",
                self.pool_id, result.test
            );
            return None;
        }
        state.owed = state.owed.saturating_sub(1);
        state.flaky = state.flaky.min(state.owed);
        Some(state.owed)
    }

    /// Drops the pending flaky copies of a test that just passed and
    /// returns how many attempts are still owed.
    fn cancel_flaky_copies(&mut self, test: &Test) -> usize {
        let Some(state) = self.tests.get_mut(test) else {
            return 0;
        };
        let mut cancelled = 0;
        while cancelled < state.flaky {
            match self.pending.iter().rposition(|t| t == test) {
                Some(idx) => {
                    self.pending.remove(idx);
                    cancelled += 1;
                }
                None => break,
            }
        }
        state.flaky -= cancelled;
        state.owed = state.owed.saturating_sub(cancelled);
        if cancelled > 0 {
            debug!("[{}] cancelled {} flaky copies of {}", self.pool_id, cancelled, test);
            self.ctx.progress.remove_tests(&self.pool_id, cancelled);
        }
        state.owed
    }

    fn requeue(&mut self, test: &Test) {
        if let Some(state) = self.tests.get_mut(test) {
            state.owed += 1;
        }
        self.pending.push_back(test.clone());
    }

    /// Stores an attempt and reports it. A final attempt cancels whatever
    /// is still owed for its test.
    fn record(&mut self, result: TestResult, is_final: bool) {
        self.ctx
            .track
            .test(&self.pool_id, &result.device, &result, is_final);

        let test = result.test.clone();
        let Some(state) = self.tests.get_mut(&test) else {
            return;
        };
        state.results.push(result);
        if !is_final {
            return;
        }

        state.terminal = true;
        let before = self.pending.len();
        self.pending.retain(|t| t != &test);
        let cancelled = before - self.pending.len();
        state.owed = state.owed.saturating_sub(cancelled);
        if cancelled > 0 {
            debug!("[{}] cancelled {} owed attempts of {}", self.pool_id, cancelled, test);
            self.ctx.progress.remove_tests(&self.pool_id, cancelled);
        }
    }

    fn on_finished(&mut self, result: TestResult) -> bool {
        let result = self.mark_strict(result);
        let Some(owed) = self.take_attempt(&result) else {
            return false;
        };

        if result.is_ignored() {
            self.ctx.progress.test_ignored(&self.pool_id, &result.device, &result.test);
        } else {
            self.ctx.progress.test_passed(&self.pool_id, &result.device, &result.test);
        }

        let owed = if result.is_strict_run {
            owed
        } else {
            self.cancel_flaky_copies(&result.test)
        };
        self.record(result, owed == 0);
        false
    }

    fn on_failed(&mut self, result: TestResult, logs: Option<&BatchLogs>) -> bool {
        let result = self.mark_strict(result);
        let crashed = !result.is_strict_run && self.is_ignored_crash(&result, logs);
        let Some(owed) = self.take_attempt(&result) else {
            return false;
        };

        if crashed && self.uncompleted_quota > 0 {
            self.uncompleted_quota -= 1;
            info!(
                "[{}] {} crashed with an ignored signature, requeueing ({} uncompleted retries left)",
                self.pool_id, result.test, self.uncompleted_quota
            );
            self.requeue(&result.test);
            return true;
        }

        self.ctx.progress.test_failed(&self.pool_id, &result.device, &result.test);

        if result.is_strict_run || owed > 0 {
            let is_final = result.is_strict_run;
            self.record(result, is_final);
            return false;
        }

        let test_retries = self.tests.get(&result.test).map(|s| s.retries).unwrap_or(0);
        if !self
            .ctx
            .strategies
            .retry
            .should_retry(test_retries, self.total_retries)
        {
            self.record(result, true);
            return false;
        }

        if let Some(state) = self.tests.get_mut(&result.test) {
            state.retries += 1;
        }
        self.total_retries += 1;
        self.ctx.progress.add_tests(&self.pool_id, 1);
        debug!("[{}] retrying {} (retry {})", self.pool_id, result.test, test_retries + 1);
        let test = result.test.clone();
        self.record(result, false);
        self.requeue(&test);
        true
    }

    fn on_uncompleted(&mut self, result: TestResult) -> bool {
        let result = self.mark_strict(result);
        let Some(owed) = self.take_attempt(&result) else {
            return false;
        };

        if self.uncompleted_quota > 0 {
            self.uncompleted_quota -= 1;
            debug!(
                "[{}] {} uncompleted, requeueing ({} uncompleted retries left)",
                self.pool_id, result.test, self.uncompleted_quota
            );
            self.requeue(&result.test);
            return true;
        }

        warn!(
            "[{}] {} uncompleted and the uncompleted retry quota is exhausted",
            self.pool_id, result.test
        );
        let failure = result.with_status(TestStatus::Failure);
        self.ctx.progress.test_failed(&self.pool_id, &failure.device, &failure.test);
        self.record(failure, owed == 0);
        false
    }

    async fn return_batch(&mut self, device: DeviceInfo, batch: TestBatch) {
        let Some(active) = self.active.remove(&batch.id) else {
            warn!(
                "[{}] {} returned unknown batch {}",
                self.pool_id, device.serial_number, batch.id
            );
            return;
        };

        info!(
            "[{}] {} returned batch {} ({} tests)",
            self.pool_id,
            device.serial_number,
            active.batch.id,
            active.batch.len()
        );
        for test in active.batch.tests.into_iter().rev() {
            self.pending.push_front(test);
        }
        self.send(PoolMessage::Notify).await;
        self.check_terminated().await;
    }

    async fn check_terminated(&mut self) {
        if self.terminated {
            return;
        }
        let drained = self.is_empty();
        let stopped = self.stop_requested && self.active.is_empty();
        if drained || stopped {
            self.terminated = true;
            info!("[{}] queue terminated", self.pool_id);
            self.send(PoolMessage::QueueTerminated).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use crate::analytics::{RecordingTracker, Track};
    use crate::config::{Config, RunConfig};
    use crate::logs::{Log, LogEvent, LogTest, LogsProvider};
    use crate::model::ComponentInfo;
    use crate::strategy::{
        BatchingStrategy, CountShardingStrategy, FixedQuotaRetryStrategy, FixedSizeBatchingStrategy,
        NoRetryStrategy, RetryStrategy, ShardingStrategy, Strategies,
    };

    fn test(method: &str) -> Test {
        Test::new("", "", method, ComponentInfo::default())
    }

    fn device() -> DeviceInfo {
        DeviceInfo::new("emulator-5554")
    }

    struct Harness {
        actor: QueueActor,
        pool_rx: mpsc::Receiver<PoolMessage>,
        recorder: Arc<RecordingTracker>,
        ctx: ExecutionContext,
    }

    struct Setup {
        run: RunConfig,
        batching: Arc<dyn BatchingStrategy>,
        retry: Arc<dyn RetryStrategy>,
        logs: Option<Arc<dyn LogsProvider>>,
    }

    impl Setup {
        fn quota(quota: u32) -> Self {
            Self {
                run: RunConfig {
                    uncompleted_test_retry_quota: quota,
                    ..RunConfig::default()
                },
                batching: Arc::new(FixedSizeBatchingStrategy::new(1)),
                retry: Arc::new(NoRetryStrategy),
                logs: None,
            }
        }

        fn build(self) -> Harness {
            let config = Config {
                run: self.run,
                ..Config::default()
            };
            let track = Track::new();
            let recorder = Arc::new(RecordingTracker::default());
            track.register_arc(recorder.clone());

            let mut ctx = ExecutionContext::from_config(&config, track)
                .unwrap()
                .with_strategies(Strategies {
                    batching: self.batching,
                    retry: self.retry,
                    ..Strategies::default()
                });
            if let Some(logs) = self.logs {
                ctx = ctx.with_logs_provider(logs);
            }

            let (pool_tx, pool_rx) = mpsc::channel(64);
            Harness {
                actor: QueueActor::new(DevicePoolId::new("omni"), ctx.clone(), pool_tx),
                pool_rx,
                recorder,
                ctx,
            }
        }
    }

    impl Harness {
        async fn add(&mut self, tests: Vec<Test>) {
            self.actor
                .handle(QueueMessage::AddShard(TestShard::new(tests)))
                .await;
        }

        fn drain(&mut self) -> Vec<PoolMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.pool_rx.try_recv() {
                messages.push(message);
            }
            messages
        }

        async fn request(&mut self, device: &DeviceInfo) -> Option<TestBatch> {
            self.drain();
            self.actor
                .handle(QueueMessage::RequestBatch(device.clone()))
                .await;
            self.drain().into_iter().find_map(|m| match m {
                PoolMessage::ExecuteBatch(_, batch) => Some(batch),
                _ => None,
            })
        }

        async fn complete(&mut self, batch: &TestBatch, statuses: &[TestStatus], stacktrace: Option<&str>) {
            let results = batch
                .tests
                .iter()
                .zip(statuses)
                .map(|(t, status)| {
                    let result = TestResult::new(t.clone(), device(), *status, &batch.id);
                    match stacktrace {
                        Some(s) => result.with_stacktrace(s),
                        None => result,
                    }
                })
                .collect();
            let results = TestBatchResults::partition(batch, &device(), results);
            self.actor
                .handle(QueueMessage::Completed(device(), results))
                .await;
        }

        async fn is_empty(&mut self) -> bool {
            let (tx, rx) = oneshot::channel();
            self.actor.handle(QueueMessage::IsEmpty(tx)).await;
            rx.await.unwrap()
        }

        fn terminated(messages: &[PoolMessage]) -> usize {
            messages
                .iter()
                .filter(|m| matches!(m, PoolMessage::QueueTerminated))
                .count()
        }
    }

    #[tokio::test]
    async fn test_uncompleted_without_quota_is_failure() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Incomplete], None).await;

        assert!(h.is_empty().await);
        let finals = h.recorder.finals();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].test, test("test1"));
        assert_eq!(finals[0].status, TestStatus::Failure);
        assert_eq!(h.recorder.all().len(), 1);
        assert_eq!(Harness::terminated(&h.drain()), 1);
    }

    #[tokio::test]
    async fn test_uncompleted_twice_with_quota_one_is_failure() {
        let mut h = Setup::quota(1).build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Incomplete], None).await;
        assert!(!h.is_empty().await);
        assert!(h.recorder.all().is_empty());
        assert_eq!(h.actor.uncompleted_quota(), 0);

        let batch = h.request(&device()).await.unwrap();
        assert_eq!(batch.tests, vec![test("test1")]);
        h.complete(&batch, &[TestStatus::Incomplete], None).await;

        assert!(h.is_empty().await);
        let finals = h.recorder.finals();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].status, TestStatus::Failure);
        assert_eq!(h.actor.uncompleted_quota(), 0);
    }

    #[tokio::test]
    async fn test_uncompleted_then_passed() {
        let mut h = Setup::quota(1).build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Incomplete], None).await;
        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Passed], None).await;

        assert!(h.is_empty().await);
        let finals = h.recorder.finals();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].status, TestStatus::Passed);
    }

    fn crash_setup() -> Setup {
        let mut setup = Setup::quota(1);
        setup.run.ignore_crash_regexes = vec![".*SIGSEGV.*".into()];
        setup
    }

    /// Provider that reports a SIGSEGV crash for every test of every batch.
    struct CrashingLogsProvider;

    #[async_trait]
    impl LogsProvider for CrashingLogsProvider {
        async fn batch_report(&self, _batch_id: &str) -> Option<BatchLogs> {
            let log = Log::new(vec![LogEvent::Crash {
                message: "Process exited with signal 11 (SIGSEGV)".into(),
            }]);
            Some(BatchLogs {
                tests: HashMap::from([(LogTest::from(&test("test1")), log.clone())]),
                log,
            })
        }
    }

    #[tokio::test]
    async fn test_crash_failure_is_dispatched_again() {
        let mut setup = crash_setup();
        setup.logs = Some(Arc::new(CrashingLogsProvider));
        let mut h = setup.build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], None).await;

        let batch = h.request(&device()).await.unwrap();
        assert_eq!(batch.tests, vec![test("test1")]);
        assert_eq!(h.actor.uncompleted_quota(), 0);
        assert!(h.recorder.all().is_empty());
    }

    #[tokio::test]
    async fn test_crash_failure_after_quota_is_failure() {
        let mut setup = crash_setup();
        setup.logs = Some(Arc::new(CrashingLogsProvider));
        let mut h = setup.build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], None).await;
        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], None).await;

        assert!(h.is_empty().await);
        let all = h.recorder.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0.status, TestStatus::Failure);
        assert!(all[0].1);
    }

    #[tokio::test]
    async fn test_crash_in_stacktrace_uses_quota() {
        let mut h = crash_setup().build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(
            &batch,
            &[TestStatus::Failure],
            Some("java.lang.RuntimeException\nFatal signal 11 (SIGSEGV)"),
        )
        .await;

        assert!(h.request(&device()).await.is_some());
        assert_eq!(h.actor.uncompleted_quota(), 0);
    }

    #[tokio::test]
    async fn test_failure_without_crash_match_is_final() {
        let mut h = crash_setup().build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], Some("AssertionError")).await;

        assert!(h.is_empty().await);
        assert_eq!(h.actor.uncompleted_quota(), 1);
        assert_eq!(h.recorder.finals()[0].status, TestStatus::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_logs_provider_is_not_awaited_forever() {
        struct SlowLogsProvider;

        #[async_trait]
        impl LogsProvider for SlowLogsProvider {
            async fn batch_report(&self, _batch_id: &str) -> Option<BatchLogs> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                None
            }
        }

        let mut setup = crash_setup();
        setup.logs = Some(Arc::new(SlowLogsProvider));
        let mut h = setup.build();
        h.add(vec![test("test1")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], None).await;

        assert!(h.is_empty().await);
        assert_eq!(h.recorder.finals().len(), 1);
    }

    #[tokio::test]
    async fn test_no_double_dispatch() {
        let mut setup = Setup::quota(0);
        setup.batching = Arc::new(FixedSizeBatchingStrategy::new(2));
        let mut h = setup.build();
        h.add(vec![test("a"), test("b"), test("c")]).await;

        let first = h.request(&DeviceInfo::new("d1")).await.unwrap();
        let second = h.request(&DeviceInfo::new("d2")).await.unwrap();
        let third = h.request(&DeviceInfo::new("d3")).await;

        assert_eq!(first.tests, vec![test("a"), test("b")]);
        assert_eq!(second.tests, vec![test("c")]);
        assert!(third.is_none());
        assert!(first.tests.iter().all(|t| !second.contains(t)));
    }

    #[tokio::test]
    async fn test_same_device_never_holds_two_batches() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a"), test("b")]).await;

        assert!(h.request(&device()).await.is_some());
        h.drain();
        h.actor
            .handle(QueueMessage::RequestBatch(device()))
            .await;

        let messages = h.drain();
        assert!(matches!(messages.as_slice(), [PoolMessage::NoWork(_)]));
    }

    #[tokio::test]
    async fn test_is_empty_is_idempotent() {
        let mut h = Setup::quota(0).build();
        assert!(h.is_empty().await);
        assert!(h.is_empty().await);

        h.add(vec![test("a")]).await;
        assert!(!h.is_empty().await);
        assert!(!h.is_empty().await);

        h.request(&device()).await.unwrap();
        assert!(!h.is_empty().await);
        assert!(!h.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_shard_ignores_known_tests_and_notifies() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a")]).await;
        assert!(matches!(h.drain().as_slice(), [PoolMessage::Notify]));

        h.add(vec![test("a")]).await;
        assert!(h.drain().is_empty());
        assert_eq!(h.ctx.progress.expected(&DevicePoolId::new("omni")), 1);
    }

    #[tokio::test]
    async fn test_empty_shard_terminates() {
        let mut h = Setup::quota(0).build();
        h.add(Vec::new()).await;
        assert_eq!(Harness::terminated(&h.drain()), 1);
    }

    #[tokio::test]
    async fn test_return_batch_requeues_without_quota() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a"), test("b")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.actor
            .handle(QueueMessage::ReturnBatch(device(), batch.clone()))
            .await;
        assert!(h.drain().iter().any(|m| matches!(m, PoolMessage::Notify)));

        let again = h.request(&device()).await.unwrap();
        assert_eq!(again.tests, batch.tests);
        assert!(h.recorder.all().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_batch_is_dropped() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a")]).await;
        h.drain();

        let foreign = TestBatch::from_tests(vec![test("a")]).unwrap();
        let results = TestBatchResults::all_uncompleted(&foreign, &device(), "late");
        h.actor
            .handle(QueueMessage::Completed(device(), results))
            .await;

        assert!(h.drain().is_empty());
        assert!(h.recorder.all().is_empty());
        assert!(!h.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_dropped() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Passed], None).await;
        h.complete(&batch, &[TestStatus::Failure], None).await;

        assert_eq!(h.recorder.all().len(), 1);
        assert_eq!(h.recorder.finals()[0].status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_retry_strategy_requeues_failures() {
        let mut setup = Setup::quota(0);
        setup.retry = Arc::new(FixedQuotaRetryStrategy::new(10, 2));
        let mut h = setup.build();
        h.add(vec![test("a")]).await;

        for _ in 0..3 {
            let batch = h.request(&device()).await.unwrap();
            h.complete(&batch, &[TestStatus::Failure], None).await;
        }

        assert!(h.is_empty().await);
        let all = h.recorder.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|(_, f)| *f).count(), 1);
        assert!(all[2].1);
        let pool = DevicePoolId::new("omni");
        assert_eq!(h.ctx.progress.expected(&pool), 3);
        assert_eq!(h.ctx.progress.completed(&pool), 3);
    }

    #[tokio::test]
    async fn test_strict_run_failure_is_final() {
        let mut setup = Setup::quota(0);
        setup.run.strict_mode = true;
        setup.retry = Arc::new(FixedQuotaRetryStrategy::new(10, 2));
        let mut h = setup.build();
        h.add(vec![test("a")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], None).await;

        assert!(h.is_empty().await);
        let finals = h.recorder.finals();
        assert_eq!(finals.len(), 1);
        assert!(finals[0].is_strict_run);
        assert_eq!(finals[0].status, TestStatus::Failure);
    }

    #[tokio::test]
    async fn test_flaky_copies_are_cancelled_after_pass() {
        let mut h = Setup::quota(0).build();
        h.actor
            .handle(QueueMessage::AddShard(
                TestShard::new(vec![test("a")]).with_flaky_tests(vec![test("a"), test("a")]),
            ))
            .await;
        let pool = DevicePoolId::new("omni");
        assert_eq!(h.ctx.progress.expected(&pool), 3);

        let batch = h.request(&device()).await.unwrap();
        // one copy runs, the others are not dispatchable concurrently
        assert!(h.request(&DeviceInfo::new("other")).await.is_none());
        h.complete(&batch, &[TestStatus::Passed], None).await;

        assert!(h.is_empty().await);
        assert_eq!(h.ctx.progress.expected(&pool), 1);
        assert_eq!(h.recorder.finals().len(), 1);
    }

    #[tokio::test]
    async fn test_flaky_copies_run_after_failure() {
        let mut h = Setup::quota(0).build();
        h.actor
            .handle(QueueMessage::AddShard(
                TestShard::new(vec![test("a")]).with_flaky_tests(vec![test("a")]),
            ))
            .await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Failure], None).await;
        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Passed], None).await;

        assert!(h.is_empty().await);
        let all = h.recorder.all();
        assert_eq!(all.len(), 2);
        assert!(!all[0].1);
        assert_eq!(all[1].0.status, TestStatus::Passed);
        assert!(all[1].1);
    }

    #[tokio::test]
    async fn test_count_sharding_runs_every_execution() {
        let mut h = Setup::quota(0).build();
        let shard = CountShardingStrategy::new(3).create_shard(vec![test("a")]);
        h.actor.handle(QueueMessage::AddShard(shard)).await;

        let mut executions = 0;
        while let Some(batch) = h.request(&device()).await {
            h.complete(&batch, &[TestStatus::Passed], None).await;
            executions += 1;
            assert!(executions < 10, "queue did not converge");
        }

        assert_eq!(executions, 3);
        assert!(h.is_empty().await);
        let all = h.recorder.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|(_, f)| *f).count(), 1);
        assert!(all[2].1);
        let pool = DevicePoolId::new("omni");
        assert_eq!(h.ctx.progress.expected(&pool), 3);
        assert_eq!(h.ctx.progress.completed(&pool), 3);
    }

    #[tokio::test]
    async fn test_pass_cancels_only_flaky_copies() {
        let mut h = Setup::quota(0).build();
        let shard = TestShard::new(vec![test("a"), test("a")]).with_flaky_tests(vec![test("a")]);
        h.actor.handle(QueueMessage::AddShard(shard)).await;

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Passed], None).await;
        assert!(!h.is_empty().await);
        assert!(h.recorder.finals().is_empty());

        let batch = h.request(&device()).await.unwrap();
        h.complete(&batch, &[TestStatus::Passed], None).await;

        assert!(h.request(&device()).await.is_none());
        assert!(h.is_empty().await);
        assert_eq!(h.recorder.all().len(), 2);
        assert_eq!(h.recorder.finals().len(), 1);
        assert_eq!(h.ctx.progress.expected(&DevicePoolId::new("omni")), 2);
    }

    #[tokio::test]
    async fn test_stop_abandons_pending_after_active_finish() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a"), test("b")]).await;

        let batch = h.request(&device()).await.unwrap();
        h.actor.handle(QueueMessage::Stop).await;
        assert_eq!(Harness::terminated(&h.drain()), 0);
        assert!(h.request(&DeviceInfo::new("other")).await.is_none());

        h.complete(&batch, &[TestStatus::Passed], None).await;
        assert_eq!(Harness::terminated(&h.drain()), 1);
        assert_eq!(h.recorder.finals().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_active_batches_terminates_once() {
        let mut h = Setup::quota(0).build();
        h.add(vec![test("a")]).await;
        h.actor.handle(QueueMessage::Stop).await;
        h.actor.handle(QueueMessage::Stop).await;
        assert_eq!(Harness::terminated(&h.drain()), 1);
    }

    #[tokio::test]
    async fn test_every_test_gets_one_final_result() {
        let mut setup = Setup::quota(2);
        setup.batching = Arc::new(FixedSizeBatchingStrategy::new(3));
        setup.retry = Arc::new(FixedQuotaRetryStrategy::new(100, 1));
        let mut h = setup.build();
        let tests: Vec<Test> = (0..10).map(|i| test(&format!("t{}", i))).collect();
        h.add(tests.clone()).await;

        let statuses = [
            TestStatus::Passed,
            TestStatus::Failure,
            TestStatus::Incomplete,
        ];
        let mut round = 0;
        while let Some(batch) = h.request(&device()).await {
            let batch_statuses: Vec<_> = (0..batch.len())
                .map(|i| statuses[(round + i) % statuses.len()])
                .collect();
            h.complete(&batch, &batch_statuses, None).await;
            round += 1;
            assert!(round < 100, "queue did not converge");
        }

        assert!(h.is_empty().await);
        let finals = h.recorder.finals();
        assert_eq!(finals.len(), tests.len());
        for t in &tests {
            assert_eq!(finals.iter().filter(|r| &r.test == t).count(), 1);
            assert!(!h.actor.results(t).is_empty());
        }
    }
}
