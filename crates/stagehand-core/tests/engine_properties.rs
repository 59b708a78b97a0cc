//! End-to-end engine properties: resumability, idempotent termination,
//! exclusivity, continuation exactly-once, retry bound and fault isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use stagehand_core::domain::audit::actions;
use stagehand_core::domain::payload::{CANCEL_KEY, CHILD_RESULT_KEY};
use stagehand_core::domain::{RemoteError, StageEntry};
use stagehand_core::impls::{InMemoryLockTable, InMemoryReadyQueue, InMemoryResources, InMemoryTaskStore, MemoryAuditSink};
use stagehand_core::ports::{Resource, ResourceLock, ResourceProvider, TaskQuery, TaskStore};
use stagehand_core::retry::RetryPolicy;
use stagehand_core::{
    Actor, DispatchOutcome, Engine, EngineBuilder, EngineConfig, EngineError, NewTask, Payload, StageContext,
    StageTable, TargetRef, TaskId, TaskRecord, TaskStatus, Workflow,
};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 5,
            multiplier: 2.0,
            max_delay_ms: 50,
        },
        requeue_delay_ms: 5,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

fn volume(id: &str) -> TargetRef {
    TargetRef::new("volume", id)
}

struct Harness {
    engine: Engine,
    store: Arc<InMemoryTaskStore>,
    resources: Arc<InMemoryResources>,
    audit: Arc<MemoryAuditSink>,
    locks: Arc<InMemoryLockTable>,
}

impl Harness {
    fn build(config: EngineConfig, register: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Self {
        Self::with_store(Arc::new(InMemoryTaskStore::new()), Arc::new(InMemoryResources::new()), config, register)
    }

    fn with_store(
        store: Arc<InMemoryTaskStore>,
        resources: Arc<InMemoryResources>,
        config: EngineConfig,
        register: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        Self::with_ports(store.clone(), store, resources.clone(), resources, config, register)
    }

    /// The engine talks to `store_port` / `resource_port`; the harness keeps
    /// the plain in-memory handles for seeding and inspection.
    fn with_ports(
        store: Arc<InMemoryTaskStore>,
        store_port: Arc<dyn TaskStore>,
        resources: Arc<InMemoryResources>,
        resource_port: Arc<dyn ResourceProvider>,
        config: EngineConfig,
        register: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        let audit = Arc::new(MemoryAuditSink::new());
        let locks = Arc::new(InMemoryLockTable::new());
        let engine = register(EngineBuilder::new())
            .store(store_port)
            .queue(Arc::new(InMemoryReadyQueue::new()))
            .resources(resource_port)
            .locks(locks.clone())
            .audit(audit.clone())
            .config(config)
            .build()
            .unwrap();
        Self {
            engine,
            store,
            resources,
            audit,
            locks,
        }
    }

    async fn create(&self, type_name: &str, target: TargetRef, payload: Payload) -> TaskId {
        self.resources.add(target.clone(), "available").await;
        self.engine
            .create_task(NewTask::new(type_name, target, Actor::new("u-1", "alice")).with_payload(payload))
            .await
            .unwrap()
    }
}

fn reason_of(payload: &Payload) -> String {
    payload.failure_reason().unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Fault-injecting ports
// ---------------------------------------------------------------------------

enum StoreFault {
    /// Fail the next save that moves the record to this stage.
    FailSaveAt(&'static str),
    /// Another writer flags cancellation right before the next `running` save.
    CancelBeforeClaim,
}

/// Delegates to an in-memory store and injects one fault into `save_stage`.
struct FlakyStore {
    inner: Arc<InMemoryTaskStore>,
    fault: Mutex<Option<StoreFault>>,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryTaskStore>, fault: StoreFault) -> Self {
        Self {
            inner,
            fault: Mutex::new(Some(fault)),
        }
    }

    fn take_fault(&self, record: &TaskRecord) -> Option<StoreFault> {
        let mut fault = self.fault.lock().unwrap();
        let hit = match fault.as_ref() {
            Some(StoreFault::FailSaveAt(stage)) => record.stage == *stage,
            Some(StoreFault::CancelBeforeClaim) => record.status == TaskStatus::Running,
            None => false,
        };
        if hit { fault.take() } else { None }
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), EngineError> {
        self.inner.insert(record).await
    }

    async fn load(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        self.inner.load(id).await
    }

    async fn save_stage(&self, record: &TaskRecord) -> Result<TaskRecord, EngineError> {
        match self.take_fault(record) {
            Some(StoreFault::FailSaveAt(_)) => return Err(EngineError::Storage("disk full".into())),
            Some(StoreFault::CancelBeforeClaim) => {
                let mut current = self.inner.load(record.id).await?;
                current.payload.set(CANCEL_KEY, true);
                self.inner.save_stage(&current).await?;
            }
            None => {}
        }
        self.inner.save_stage(record).await
    }

    async fn spawn_child(&self, parent: &TaskRecord, child: &TaskRecord) -> Result<TaskRecord, EngineError> {
        self.inner.spawn_child(parent, child).await
    }

    async fn list_resumable(&self) -> Result<Vec<TaskRecord>, EngineError> {
        self.inner.list_resumable().await
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, EngineError> {
        self.inner.query(query).await
    }

    async fn stage_history(&self, id: TaskId) -> Result<Vec<StageEntry>, EngineError> {
        self.inner.stage_history(id).await
    }
}

/// Fails the next `failures` resolves with a storage error.
struct FlakyResources {
    inner: Arc<InMemoryResources>,
    failures: AtomicUsize,
}

#[async_trait]
impl ResourceProvider for FlakyResources {
    async fn resolve(&self, target: &TargetRef) -> Result<Option<Resource>, EngineError> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(EngineError::Storage("resource catalog unavailable".into()));
        }
        self.inner.resolve(target).await
    }

    async fn set_status(
        &self,
        target: &TargetRef,
        actor: &Actor,
        status: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.inner.set_status(target, actor, status, reason).await
    }
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// OnInit -> Second -> complete, logging every stage it runs.
struct Steps {
    log: Arc<Mutex<Vec<String>>>,
}

impl Steps {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        self.log.lock().unwrap().push(ctx.stage().to_string());
        ctx.set_stage("Second", Some(Payload::new().with("step", 1)))
    }

    async fn second(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        self.log.lock().unwrap().push(ctx.stage().to_string());
        ctx.set_stage_complete(Some(Payload::new().with("step", 2)))
    }
}

impl Workflow for Steps {
    const TYPE: &'static str = "Steps";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .stage("Second", |w, ctx| w.second(ctx).boxed())
            .complete_status("ready");
    }
}

/// Tracks how many instances run at once.
struct Exclusive {
    active: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    hold: Duration,
}

impl Exclusive {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        ctx.set_stage_complete(None)
    }
}

impl Workflow for Exclusive {
    const TYPE: &'static str = "Exclusive";

    fn stages(table: &mut StageTable<Self>) {
        table.stage("OnInit", |w, ctx| w.on_init(ctx).boxed());
    }
}

#[derive(Default)]
struct ContinuationCounts {
    complete: AtomicUsize,
    failed: AtomicUsize,
}

struct Parent {
    counts: Arc<ContinuationCounts>,
}

impl Parent {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let child_payload = Payload::new().with("fail", ctx.payload().get_bool("child_fails", false));
        let target = ctx.target().clone();
        ctx.start_subtask("Child", target, "Child", child_payload).await?;
        Ok(())
    }

    async fn on_child_complete(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        self.counts.complete.fetch_add(1, Ordering::SeqCst);
        ctx.set_stage_complete(None)
    }

    async fn on_child_failed(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        self.counts.failed.fetch_add(1, Ordering::SeqCst);
        let reason = ctx
            .payload()
            .get(CHILD_RESULT_KEY)
            .and_then(|r| r.get("reason"))
            .and_then(|r| r.as_str())
            .unwrap_or("child failed")
            .to_string();
        ctx.fail(format!("child: {reason}"))
    }
}

impl Workflow for Parent {
    const TYPE: &'static str = "Parent";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .stage("OnChildComplete", |w, ctx| w.on_child_complete(ctx).boxed())
            .stage("OnChildCompleteFailed", |w, ctx| w.on_child_failed(ctx).boxed());
    }
}

struct Child;

impl Child {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        if ctx.payload().get_bool("fail", false) {
            return ctx.fail("child broke");
        }
        ctx.set_stage_complete(Some(Payload::new().with("answer", 42)))
    }
}

impl Workflow for Child {
    const TYPE: &'static str = "Child";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .keep_status_on_failure();
    }
}

/// Always sees a transient failure from its remote call.
struct Flaky {
    calls: Arc<AtomicUsize>,
}

impl Flaky {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let calls = self.calls.clone();
        ctx.retry("fetch", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::timeout("backend slow"))
            }
        })
        .await?;
        ctx.set_stage_complete(None)
    }
}

impl Workflow for Flaky {
    const TYPE: &'static str = "Flaky";

    fn stages(table: &mut StageTable<Self>) {
        table.stage("OnInit", |w, ctx| w.on_init(ctx).boxed());
    }
}

/// Misbehaving handlers, selected by the `mode` payload key.
struct Faulty {
    runs: Arc<AtomicUsize>,
}

impl Faulty {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mode = ctx.payload().get_str("mode").unwrap_or_default().to_string();
        match mode.as_str() {
            "panic" => panic!("handler exploded"),
            "silent" => Ok(()),
            "bad_stage" => ctx.set_stage("Nowhere", None),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(80)).await;
                ctx.set_stage_complete(None)
            }
            "twice" => {
                ctx.set_stage_complete(None)?;
                ctx.set_stage_failed(None)
            }
            _ => ctx.set_stage_complete(None),
        }
    }
}

impl Workflow for Faulty {
    const TYPE: &'static str = "Faulty";

    fn stages(table: &mut StageTable<Self>) {
        table.stage("OnInit", |w, ctx| w.on_init(ctx).boxed());
    }
}

/// OnInit (optionally holding for `hold_ms`) -> Wait; Wait fails itself once
/// cancellation was requested.
struct Cancellable;

impl Cancellable {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let hold = ctx.payload().get("hold_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(hold)).await;
        ctx.set_stage("Wait", Some(Payload::new().with("armed", true)))
    }

    async fn wait(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        if ctx.is_cancel_requested() {
            return ctx.fail("cancelled by operator");
        }
        ctx.set_stage_complete(None)
    }
}

impl Workflow for Cancellable {
    const TYPE: &'static str = "Cancellable";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .stage("Wait", |w, ctx| w.wait(ctx).boxed());
    }
}

fn running_entries(history: &[StageEntry], stage: &str) -> usize {
    history
        .iter()
        .filter(|e| e.stage == stage && e.status == TaskStatus::Running)
        .count()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resumes_at_persisted_stage_exactly_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemoryTaskStore::new());
    let resources = Arc::new(InMemoryResources::new());

    let first = Harness::with_store(store.clone(), resources.clone(), fast_config(), |b| {
        b.register(Steps { log: log.clone() }).unwrap()
    });
    let id = first.create(Steps::TYPE, volume("1"), Payload::new()).await;
    assert_eq!(first.engine.dispatch(id).await.unwrap(), DispatchOutcome::Advanced);
    drop(first);

    // 新しいプロセス: キューは空、ストアだけが残っている
    let second = Harness::with_store(store.clone(), resources.clone(), fast_config(), |b| {
        b.register(Steps { log: log.clone() }).unwrap()
    });
    assert_eq!(second.engine.resume().await.unwrap(), 1);
    let scheduler = second.engine.start();
    let done = second.engine.wait_for_terminal(id, WAIT).await.unwrap().unwrap();
    scheduler.shutdown_and_join().await;

    assert_eq!(done.status, TaskStatus::Complete);
    assert_eq!(*log.lock().unwrap(), vec!["OnInit", "Second"]);
    assert_eq!(done.payload.get("step").unwrap(), 2);
    assert_eq!(resources.get(&volume("1")).await.unwrap().status, "ready");

    let history = second.engine.stage_history(id).await.unwrap();
    assert_eq!(running_entries(&history, "OnInit"), 1);
    assert_eq!(running_entries(&history, "Second"), 1);
    assert_eq!(second.engine.resume().await.unwrap(), 0);
}

#[tokio::test]
async fn termination_is_idempotent() {
    let h = Harness::build(fast_config(), |b| {
        b.register(Steps {
            log: Arc::new(Mutex::new(Vec::new())),
        })
        .unwrap()
    });
    let id = h.create(Steps::TYPE, volume("2"), Payload::new()).await;

    let once = h.engine.complete_task(id, None).await.unwrap();
    let twice = h.engine.complete_task(id, None).await.unwrap();
    let failed_after = h.engine.fail_task(id, "too late").await.unwrap();

    assert_eq!(once.status, TaskStatus::Complete);
    assert_eq!(once, twice);
    assert_eq!(once, failed_after);
    assert_eq!(h.audit.with_action(actions::TASK_COMPLETE).await.len(), 1);
    assert!(h.audit.with_action(actions::TASK_FAILED).await.is_empty());
    assert_eq!(h.resources.status_changes(&volume("2")).await.len(), 1);

    // 終端後の dispatch は何もしない
    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Skipped);
}

#[tokio::test]
async fn tasks_on_the_same_target_never_overlap() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let h = Harness::build(fast_config(), |b| {
        b.register(Exclusive {
            active: active.clone(),
            max_seen: max_seen.clone(),
            hold: Duration::from_millis(30),
        })
        .unwrap()
    });

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(h.create(Exclusive::TYPE, volume("shared"), Payload::new()).await);
    }
    let scheduler = h.engine.start();
    for id in &ids {
        let done = h.engine.wait_for_terminal(*id, WAIT).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Complete);
    }
    scheduler.shutdown_and_join().await;

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(h.locks.holder(&volume("shared")).await, None);
}

#[tokio::test]
async fn tasks_on_different_targets_run_concurrently() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let h = Harness::build(fast_config(), |b| {
        b.register(Exclusive {
            active: active.clone(),
            max_seen: max_seen.clone(),
            hold: Duration::from_millis(300),
        })
        .unwrap()
    });

    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(h.create(Exclusive::TYPE, volume(&format!("v{n}")), Payload::new()).await);
    }
    let scheduler = h.engine.start();
    for id in &ids {
        h.engine.wait_for_terminal(*id, WAIT).await.unwrap().unwrap();
    }
    scheduler.shutdown_and_join().await;

    assert!(max_seen.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn busy_target_requeues_instead_of_blocking() {
    let h = Harness::build(fast_config(), |b| b.register(Faulty { runs: Arc::new(AtomicUsize::new(0)) }).unwrap());
    let id = h.create(Faulty::TYPE, volume("3"), Payload::new()).await;

    let other: TaskId = "task-01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
    assert!(h.locks.try_acquire(&volume("3"), other).await.unwrap());
    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Requeue);
    assert_eq!(h.engine.load(id).await.unwrap().status, TaskStatus::Pending);

    h.locks.release(&volume("3"), other).await.unwrap();
    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Completed);
}

#[tokio::test]
async fn continuation_fires_exactly_once_on_success() {
    let counts = Arc::new(ContinuationCounts::default());
    let h = Harness::build(fast_config(), |b| {
        b.register(Parent { counts: counts.clone() })
            .unwrap()
            .register(Child)
            .unwrap()
    });
    let parent_id = h.create(Parent::TYPE, volume("4"), Payload::new()).await;

    let scheduler = h.engine.start();
    let parent = h.engine.wait_for_terminal(parent_id, WAIT).await.unwrap().unwrap();

    assert_eq!(parent.status, TaskStatus::Complete);
    assert_eq!(counts.complete.load(Ordering::SeqCst), 1);
    assert_eq!(counts.failed.load(Ordering::SeqCst), 0);
    assert_eq!(parent.payload.get(CHILD_RESULT_KEY).unwrap()["answer"], 42);

    let children = h
        .engine
        .query(&TaskQuery::new().with_parent(parent_id))
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, TaskStatus::Complete);
    assert_eq!(children[0].actor, parent.actor);

    // 重複配送されても継続は増えない
    assert_eq!(h.engine.dispatch(children[0].id).await.unwrap(), DispatchOutcome::Skipped);
    assert_eq!(h.engine.dispatch(parent_id).await.unwrap(), DispatchOutcome::Skipped);
    scheduler.shutdown_and_join().await;
    assert_eq!(counts.complete.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn continuation_routes_child_failure() {
    let counts = Arc::new(ContinuationCounts::default());
    let h = Harness::build(fast_config(), |b| {
        b.register(Parent { counts: counts.clone() })
            .unwrap()
            .register(Child)
            .unwrap()
    });
    let parent_id = h
        .create(Parent::TYPE, volume("5"), Payload::new().with("child_fails", true))
        .await;

    let scheduler = h.engine.start();
    let parent = h.engine.wait_for_terminal(parent_id, WAIT).await.unwrap().unwrap();
    scheduler.shutdown_and_join().await;

    assert_eq!(parent.status, TaskStatus::Failed);
    assert_eq!(reason_of(&parent.payload), "child: child broke");
    assert_eq!(counts.complete.load(Ordering::SeqCst), 0);
    assert_eq!(counts.failed.load(Ordering::SeqCst), 1);

    // 子は status を変えず、親の失敗だけが 1 回反映される
    let changes = h.resources.status_changes(&volume("5")).await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].status, "failed");
}

#[tokio::test]
async fn waiting_parent_is_continued_by_resume() {
    let counts = Arc::new(ContinuationCounts::default());
    let h = Harness::build(fast_config(), |b| {
        b.register(Parent { counts: counts.clone() })
            .unwrap()
            .register(Child)
            .unwrap()
    });
    let parent_id = h.create(Parent::TYPE, volume("6"), Payload::new()).await;
    assert_eq!(h.engine.dispatch(parent_id).await.unwrap(), DispatchOutcome::WaitingForChild);

    let waiting = h.engine.load(parent_id).await.unwrap();
    assert!(waiting.is_waiting());
    let child_id = waiting.waiting_on.unwrap();

    // 生きている子を待っている親は再投入されない（子だけ）
    assert_eq!(h.engine.resume().await.unwrap(), 1);

    // 子の終端だけが書かれ、親の継続前に落ちた状態を作る
    let mut child = h.store.load(child_id).await.unwrap();
    child
        .finish(TaskStatus::Complete, Payload::new().with("answer", 7), chrono::Utc::now())
        .unwrap();
    h.store.save_stage(&child).await.unwrap();

    assert_eq!(h.engine.resume().await.unwrap(), 1);
    let resumed = h.engine.load(parent_id).await.unwrap();
    assert_eq!(resumed.stage, "OnChildComplete");
    assert_eq!(resumed.waiting_on, None);

    assert_eq!(h.engine.dispatch(parent_id).await.unwrap(), DispatchOutcome::Completed);
    assert_eq!(counts.complete.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failures_stop_at_the_attempt_bound() {
    let calls = Arc::new(AtomicUsize::new(0));
    let h = Harness::build(fast_config(), |b| b.register(Flaky { calls: calls.clone() }).unwrap());
    let id = h.create(Flaky::TYPE, volume("7"), Payload::new()).await;

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let record = h.engine.load(id).await.unwrap();
    assert!(reason_of(&record.payload).contains("after 3 attempt(s)"));
    assert_eq!(h.audit.with_action(actions::REMOTE_ATTEMPT).await.len(), 3);
    assert_eq!(h.audit.with_action(actions::TASK_FAILED).await.len(), 1);

    // 途中で failed が書かれていない
    let history = h.engine.stage_history(id).await.unwrap();
    let failed_rows: Vec<_> = history.iter().filter(|e| e.status == TaskStatus::Failed).collect();
    assert_eq!(failed_rows.len(), 1);
    assert_eq!(history.last().unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn handler_panic_becomes_failure() {
    let h = Harness::build(fast_config(), |b| b.register(Faulty { runs: Arc::new(AtomicUsize::new(0)) }).unwrap());
    let id = h.create(Faulty::TYPE, volume("8"), Payload::new().with("mode", "panic")).await;

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
    let record = h.engine.load(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(reason_of(&record.payload).contains("handler exploded"));
    assert_eq!(h.locks.holder(&volume("8")).await, None);
    assert_eq!(h.resources.get(&volume("8")).await.unwrap().status, "failed");
}

#[tokio::test]
async fn returning_without_transition_is_a_fault() {
    let h = Harness::build(fast_config(), |b| b.register(Faulty { runs: Arc::new(AtomicUsize::new(0)) }).unwrap());
    let id = h.create(Faulty::TYPE, volume("9"), Payload::new().with("mode", "silent")).await;

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
    let record = h.engine.load(id).await.unwrap();
    assert!(reason_of(&record.payload).contains("without a transition"));
}

#[tokio::test]
async fn unknown_next_stage_and_double_transition_fail_the_task() {
    let h = Harness::build(fast_config(), |b| b.register(Faulty { runs: Arc::new(AtomicUsize::new(0)) }).unwrap());

    let bad = h.create(Faulty::TYPE, volume("10"), Payload::new().with("mode", "bad_stage")).await;
    assert_eq!(h.engine.dispatch(bad).await.unwrap(), DispatchOutcome::Failed);
    assert!(reason_of(&h.engine.load(bad).await.unwrap().payload).contains("Nowhere"));

    let twice = h.create(Faulty::TYPE, volume("11"), Payload::new().with("mode", "twice")).await;
    assert_eq!(h.engine.dispatch(twice).await.unwrap(), DispatchOutcome::Failed);
    assert!(reason_of(&h.engine.load(twice).await.unwrap().payload).contains("already requested"));
}

#[tokio::test]
async fn vanished_target_fails_without_running_the_handler() {
    let runs = Arc::new(AtomicUsize::new(0));
    let h = Harness::build(fast_config(), |b| b.register(Faulty { runs: runs.clone() }).unwrap());
    let id = h.create(Faulty::TYPE, volume("12"), Payload::new()).await;
    h.resources.remove(&volume("12")).await;

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let record = h.engine.load(id).await.unwrap();
    assert!(reason_of(&record.payload).contains("no longer exists"));
    assert_eq!(h.audit.with_action(actions::TARGET_GONE).await.len(), 1);
}

#[tokio::test]
async fn soft_deadline_is_audited_not_enforced() {
    let config = EngineConfig {
        stage_soft_deadline_ms: 20,
        ..fast_config()
    };
    let h = Harness::build(config, |b| b.register(Faulty { runs: Arc::new(AtomicUsize::new(0)) }).unwrap());
    let id = h.create(Faulty::TYPE, volume("13"), Payload::new().with("mode", "slow")).await;

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Completed);
    assert_eq!(h.audit.with_action(actions::DEADLINE_EXCEEDED).await.len(), 1);
}

#[tokio::test]
async fn cancel_request_is_seen_at_the_next_stage() {
    let h = Harness::build(fast_config(), |b| b.register(Cancellable).unwrap());
    let id = h.create(Cancellable::TYPE, volume("14"), Payload::new()).await;

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Advanced);
    assert!(h.engine.request_cancel(id).await.unwrap());
    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);

    let record = h.engine.load(id).await.unwrap();
    assert_eq!(reason_of(&record.payload), "cancelled by operator");
    assert!(!h.engine.request_cancel(id).await.unwrap());
}

#[tokio::test]
async fn cancel_during_a_running_stage_survives_the_advance() {
    let h = Harness::build(fast_config(), |b| b.register(Cancellable).unwrap());
    let id = h
        .create(Cancellable::TYPE, volume("17"), Payload::new().with("hold_ms", 150))
        .await;

    // ハンドラ実行中に cancel が version を進め、advance は reload してマージする
    let (outcome, cancelled) = tokio::join!(h.engine.dispatch(id), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.engine.request_cancel(id).await
    });
    assert_eq!(outcome.unwrap(), DispatchOutcome::Advanced);
    assert!(cancelled.unwrap());

    let record = h.engine.load(id).await.unwrap();
    assert_eq!(record.stage, "Wait");
    assert!(record.payload.is_cancel_requested());
    assert!(record.payload.get_bool("armed", false));

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
    assert_eq!(reason_of(&h.engine.load(id).await.unwrap().payload), "cancelled by operator");
}

#[tokio::test]
async fn failed_transition_save_is_dispatched_again() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemoryTaskStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone(), StoreFault::FailSaveAt("Second")));
    let resources = Arc::new(InMemoryResources::new());
    let h = Harness::with_ports(store, flaky, resources.clone(), resources, fast_config(), |b| {
        b.register(Steps { log: log.clone() }).unwrap()
    });
    let id = h.create(Steps::TYPE, volume("18"), Payload::new()).await;

    let scheduler = h.engine.start();
    let done = h.engine.wait_for_terminal(id, WAIT).await.unwrap();
    scheduler.shutdown_and_join().await;

    let done = done.expect("task left running after a failed save");
    assert_eq!(done.status, TaskStatus::Complete);
    // 保存に失敗した OnInit はもう一度走る（at-least-once）
    assert_eq!(*log.lock().unwrap(), vec!["OnInit", "OnInit", "Second"]);
    let history = h.engine.stage_history(id).await.unwrap();
    assert_eq!(running_entries(&history, "OnInit"), 2);
    assert_eq!(running_entries(&history, "Second"), 1);
}

#[tokio::test]
async fn resolve_error_requeues_the_task() {
    let runs = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryTaskStore::new());
    let resources = Arc::new(InMemoryResources::new());
    let flaky = Arc::new(FlakyResources {
        inner: resources.clone(),
        failures: AtomicUsize::new(0),
    });
    let h = Harness::with_ports(store.clone(), store, resources, flaky.clone(), fast_config(), |b| {
        b.register(Faulty { runs: runs.clone() }).unwrap()
    });
    let id = h.create(Faulty::TYPE, volume("19"), Payload::new()).await;

    // 作成時の検証は通し、ディスパッチ時の解決だけを 1 回失敗させる
    flaky.failures.store(1, Ordering::SeqCst);
    let scheduler = h.engine.start();
    let done = h.engine.wait_for_terminal(id, WAIT).await.unwrap();
    scheduler.shutdown_and_join().await;

    let done = done.expect("task abandoned after a resolve error");
    assert_eq!(done.status, TaskStatus::Complete);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(flaky.failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_running_record_is_claimed_despite_a_concurrent_write() {
    let store = Arc::new(InMemoryTaskStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone(), StoreFault::CancelBeforeClaim));
    let resources = Arc::new(InMemoryResources::new());
    let h = Harness::with_ports(store.clone(), flaky, resources.clone(), resources, fast_config(), |b| {
        b.register(Cancellable).unwrap()
    });
    let id = h.create(Cancellable::TYPE, volume("20"), Payload::new()).await;

    // 前のプロセスが OnInit を running にしたまま落ちた
    let mut stale = store.load(id).await.unwrap();
    stale.start_dispatch(chrono::Utc::now()).unwrap();
    store.save_stage(&stale).await.unwrap();

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Advanced);
    let record = h.engine.load(id).await.unwrap();
    assert_eq!(record.stage, "Wait");
    assert!(record.payload.is_cancel_requested());

    assert_eq!(h.engine.dispatch(id).await.unwrap(), DispatchOutcome::Failed);
}

#[tokio::test]
async fn create_task_validates_type_target_and_parent() {
    let h = Harness::build(fast_config(), |b| b.register(Cancellable).unwrap());
    let actor = Actor::system();

    let unknown = h
        .engine
        .create_task(NewTask::new("Nope", volume("15"), actor.clone()))
        .await;
    assert!(matches!(unknown, Err(EngineError::UnknownTaskType(_))));

    let missing = h
        .engine
        .create_task(NewTask::new(Cancellable::TYPE, volume("absent"), actor.clone()))
        .await;
    assert!(matches!(missing, Err(EngineError::InvalidTarget { .. })));

    let parent = h.create(Cancellable::TYPE, volume("16"), Payload::new()).await;
    h.engine.fail_task(parent, "stop").await.unwrap();
    let orphan = h
        .engine
        .create_task(NewTask::new(Cancellable::TYPE, volume("16"), actor).with_parent(parent))
        .await;
    assert!(matches!(orphan, Err(EngineError::InvalidTransition { .. })));
}
