//! Integration tests for the dispatch core.
//!
//! Each test spins up a real axum server on a random port backed by an
//! in-memory store, drives the worker protocol over HTTP, and watches
//! the event bus for fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use agentboard::automation::AutomationEngine;
use agentboard::config::WorkerDirectives;
use agentboard::events::{Event, EventBus};
use agentboard::registry::{sweeper, WorkerRegistry};
use agentboard::server::{build_router, AppState, StaticTokenAuth};
use agentboard::store::model::{
    AgentStatus, Card, Column, NewTask, TaskStatus, TaskType, WorkerStatus,
};
use agentboard::store::{LibSqlStore, Store, TaskFilter};
use agentboard::tasks::TaskService;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

const BOARD: &str = "b1";
const ALICE_TOKEN: &str = "tok-alice";
const BOB_TOKEN: &str = "tok-bob";

struct TestServer {
    base: String,
    http: reqwest::Client,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    registry: Arc<WorkerRegistry>,
    tasks: Arc<TaskService>,
}

/// Start a server on a random port with a seeded board.
async fn start_server() -> TestServer {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::open_memory().await.unwrap());
    store
        .insert_board(BOARD, "Sprint", &["alice".to_string(), "bob".to_string()])
        .await
        .unwrap();

    let bus = Arc::new(EventBus::new());
    let automation = Arc::new(AutomationEngine::new(Arc::clone(&store), Arc::clone(&bus)));
    let tasks = Arc::new(TaskService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&automation),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        WorkerDirectives {
            max_concurrent_tasks: 2,
            poll_interval_seconds: 1,
            heartbeat_interval_seconds: 1,
        },
    ));

    let auth = StaticTokenAuth::new(HashMap::from([
        ("alice".to_string(), String::new()),
        ("bob".to_string(), String::new()),
    ]));
    auth.insert_token(ALICE_TOKEN, "alice");
    auth.insert_token(BOB_TOKEN, "bob");

    let state = AppState {
        store: Arc::clone(&store),
        bus: Arc::clone(&bus),
        registry: Arc::clone(&registry),
        tasks: Arc::clone(&tasks),
        automation,
        auth: Arc::new(auth),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        http: reqwest::Client::new(),
        store,
        bus,
        registry,
        tasks,
    }
}

impl TestServer {
    async fn post(
        &self,
        token: &str,
        path: &str,
        body: serde_json::Value,
    ) -> reqwest::Response {
        self.http
            .post(format!("{}{path}", self.base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, token: &str, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    /// Register a worker for the given token, returning its id.
    async fn register_worker(&self, token: &str) -> String {
        let resp = self
            .post(
                token,
                "/api/workers/register",
                serde_json::json!({
                    "hostname": "test-host",
                    "worker_version": "0.3.0",
                    "capabilities": ["agent"],
                }),
            )
            .await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["worker_id"].as_str().unwrap().to_string()
    }

    /// Seed a column directly in the store.
    async fn add_column(&self, column: Column) {
        self.store.insert_column(&column).await.unwrap();
    }

    /// Seed a card directly in the store.
    async fn add_card(&self, id: &str, column_id: &str, title: &str, description: &str) {
        self.store
            .insert_card(&Card {
                id: id.to_string(),
                column_id: column_id.to_string(),
                board_id: BOARD.to_string(),
                title: title.to_string(),
                description: description.to_string(),
                labels: Vec::new(),
                priority: "medium".to_string(),
                assignee_id: None,
                agent_status: AgentStatus::None,
                position: 0,
                version: 0,
            })
            .await
            .unwrap();
    }

    /// Move a card through the HTTP surface as `alice`.
    async fn move_card(&self, card_id: &str, to_column_id: &str) {
        let resp = self
            .post(
                ALICE_TOKEN,
                &format!("/api/cards/{card_id}/move"),
                serde_json::json!({ "to_column_id": to_column_id }),
            )
            .await;
        assert_eq!(resp.status(), 200);
    }

    /// Pending tasks on the seeded board, oldest first.
    async fn pending_tasks(&self) -> Vec<serde_json::Value> {
        let resp = self
            .get(
                ALICE_TOKEN,
                &format!("/api/tasks?board_id={BOARD}&status=pending"),
            )
            .await;
        assert_eq!(resp.status(), 200);
        let mut tasks: Vec<serde_json::Value> = resp.json().await.unwrap();
        tasks.reverse(); // listing is newest-first
        tasks
    }

    async fn claim(&self, worker_id: &str, task_id: &str) -> reqwest::Response {
        self.post(
            ALICE_TOKEN,
            &format!("/api/workers/tasks/{task_id}/claim"),
            serde_json::json!({ "worker_id": worker_id }),
        )
        .await
    }

    async fn complete(&self, worker_id: &str, task_id: &str, output: &str) -> reqwest::Response {
        self.post(
            ALICE_TOKEN,
            &format!("/api/workers/tasks/{task_id}/complete"),
            serde_json::json!({ "worker_id": worker_id, "output_text": output }),
        )
        .await
    }
}

fn plain_column(id: &str, name: &str, position: i64) -> Column {
    Column {
        id: id.to_string(),
        board_id: BOARD.to_string(),
        name: name.to_string(),
        position,
        auto_run: false,
        agent_type: String::new(),
        agent_model: "smart".to_string(),
        prompt_template: String::new(),
        on_success_column_id: String::new(),
        on_failure_column_id: String::new(),
        max_loop_count: 3,
    }
}

fn agent_column(
    id: &str,
    name: &str,
    position: i64,
    agent_type: &str,
    on_success: &str,
    on_failure: &str,
) -> Column {
    Column {
        auto_run: true,
        agent_type: agent_type.to_string(),
        on_success_column_id: on_success.to_string(),
        on_failure_column_id: on_failure.to_string(),
        ..plain_column(id, name, position)
    }
}

/// Wait for the next event with the given tag on an open subscription.
async fn next_tagged(rx: &mut broadcast::Receiver<Event>, tag: &str) -> Event {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.tag() == tag => return event,
                Ok(_) => continue,
                Err(e) => panic!("subscription closed while waiting for {tag}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {tag} event"))
}

// ── Registration & heartbeat ─────────────────────────────────────────

#[tokio::test]
async fn register_is_idempotent_per_user() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let first = server.register_worker(ALICE_TOKEN).await;
        let second = server.register_worker(ALICE_TOKEN).await;
        assert_eq!(first, second);

        let resp = server.get(ALICE_TOKEN, "/api/workers").await;
        let workers: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0]["status"], "online");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn heartbeat_returns_cancel_directives() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let worker_id = server.register_worker(ALICE_TOKEN).await;

        let task = server
            .tasks
            .create(&NewTask::new(TaskType::AgentRun, BOARD, "alice"))
            .await
            .unwrap();
        server.claim(&worker_id, &task.id).await;

        // Cancel server-side, then heartbeat with the task still listed
        // as running.
        let resp = server
            .post(
                ALICE_TOKEN,
                &format!("/api/tasks/{}/cancel", task.id),
                serde_json::json!({}),
            )
            .await;
        assert_eq!(resp.status(), 204);

        let resp = server
            .post(
                ALICE_TOKEN,
                "/api/workers/heartbeat",
                serde_json::json!({
                    "worker_id": worker_id,
                    "running_task_ids": [task.id],
                    "system_load": 0.5,
                }),
            )
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(
            body["directives"]["cancel_task_ids"],
            serde_json::json!([task.id])
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn heartbeat_for_foreign_worker_is_forbidden() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let worker_id = server.register_worker(ALICE_TOKEN).await;

        let resp = server
            .post(
                BOB_TOKEN,
                "/api/workers/heartbeat",
                serde_json::json!({ "worker_id": worker_id, "running_task_ids": [] }),
            )
            .await;
        assert_eq!(resp.status(), 403);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn poll_is_rate_limited_per_worker() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let worker_id = server.register_worker(ALICE_TOKEN).await;

        let first = server
            .get(
                ALICE_TOKEN,
                &format!("/api/workers/tasks/poll?worker_id={worker_id}&limit=1"),
            )
            .await;
        assert_eq!(first.status(), 200);

        let second = server
            .get(
                ALICE_TOKEN,
                &format!("/api/workers/tasks/poll?worker_id={worker_id}&limit=1"),
            )
            .await;
        assert_eq!(second.status(), 429);
    })
    .await
    .expect("test timed out");
}

// ── Scenario 1: happy path ───────────────────────────────────────────

#[tokio::test]
async fn happy_path_single_step() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.add_column(plain_column("backlog", "Backlog", 0)).await;
        server
            .add_column(agent_column("plan", "Plan", 1, "architect", "done", ""))
            .await;
        server.add_column(plain_column("done", "Done", 2)).await;
        server.add_card("c1", "backlog", "Design login", "OAuth2").await;

        let mut rx = server.bus.subscribe("board:b1");
        let worker_id = server.register_worker(ALICE_TOKEN).await;

        // User drags the card into the automation column.
        server.move_card("c1", "plan").await;

        let created = next_tagged(&mut rx, "task_created").await;
        let task_id = match created {
            Event::TaskCreated { task } => {
                assert_eq!(task.agent_type, "architect");
                assert!(task.prompt_text.contains("Design login"));
                assert!(task.prompt_text.contains("OAuth2"));
                assert_eq!(task.source_column_id, "plan");
                assert_eq!(task.target_column_id, "done");
                task.id
            }
            _ => unreachable!(),
        };

        // Worker lifecycle: claim, progress, complete.
        let resp = server.claim(&worker_id, &task_id).await;
        assert_eq!(resp.status(), 200);
        next_tagged(&mut rx, "task_claimed").await;

        let resp = server
            .post(
                ALICE_TOKEN,
                &format!("/api/workers/tasks/{task_id}/progress"),
                serde_json::json!({ "worker_id": worker_id, "progress_text": "thinking" }),
            )
            .await;
        assert_eq!(resp.status(), 200);
        next_tagged(&mut rx, "task_progress").await;

        let resp = server.complete(&worker_id, &task_id, "Use OIDC+PKCE").await;
        assert_eq!(resp.status(), 200);

        // Ordering: completion is published before the routing move.
        next_tagged(&mut rx, "task_completed").await;
        next_tagged(&mut rx, "card_moved").await;

        let card = server.store.get_card("c1").await.unwrap();
        assert_eq!(card.column_id, "done");
        assert_eq!(card.agent_status, AgentStatus::Completed);

        let comments = server.store.list_comments("c1").await.unwrap();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].is_agent_output);
        assert_eq!(comments[0].content, "Use OIDC+PKCE");

        let task = server.store.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output_comment_id, comments[0].id);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    })
    .await
    .expect("test timed out");
}

// ── Scenario 2: reviewer rejection loop ──────────────────────────────

#[tokio::test]
async fn reviewer_rejection_loops_until_bound() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server
            .add_column(agent_column("code", "Code", 0, "coder", "review", ""))
            .await;
        server
            .add_column(agent_column("review", "Review", 1, "reviewer", "done", "code"))
            .await;
        server.add_column(plain_column("done", "Done", 2)).await;
        server.add_card("c2", "done", "Implement search", "").await;

        let worker_id = server.register_worker(ALICE_TOKEN).await;

        // Entering Code creates the first coder task.
        server.move_card("c2", "code").await;

        // Drive the loop: coder completes, reviewer rejects, repeat.
        for round in 0..3 {
            let pending = server.pending_tasks().await;
            assert_eq!(pending.len(), 1, "round {round}: expected one coder task");
            let coder_task = &pending[0];
            assert_eq!(coder_task["agent_type"], "coder");
            assert_eq!(coder_task["loop_count"], round);
            let coder_id = coder_task["id"].as_str().unwrap();

            server.claim(&worker_id, coder_id).await;
            let resp = server
                .complete(&worker_id, coder_id, &format!("impl v{}", round + 1))
                .await;
            assert_eq!(resp.status(), 200);

            // Success routing moved the card to Review and triggered the
            // reviewer.
            let card = server.store.get_card("c2").await.unwrap();
            assert_eq!(card.column_id, "review", "round {round}");

            let pending = server.pending_tasks().await;
            assert_eq!(pending.len(), 1);
            let review_task = &pending[0];
            assert_eq!(review_task["agent_type"], "reviewer");
            let review_id = review_task["id"].as_str().unwrap();

            server.claim(&worker_id, review_id).await;
            let resp = server
                .complete(&worker_id, review_id, "REJECTED: missing tests")
                .await;
            assert_eq!(resp.status(), 200);

            // The completion was reinterpreted as a failure.
            let rejected = server.store.get_task(review_id).await.unwrap();
            assert_eq!(rejected.status, TaskStatus::Failed);
            assert_eq!(rejected.error_summary, "rejected by reviewer");

            // Failure routing sent the card back to Code.
            let card = server.store.get_card("c2").await.unwrap();
            assert_eq!(card.column_id, "code", "round {round}");
        }

        // Three coder runs exhausted the loop bound: no fourth task, and
        // the card is unlocked for manual intervention.
        assert!(server.pending_tasks().await.is_empty());
        let card = server.store.get_card("c2").await.unwrap();
        assert_eq!(card.column_id, "code");
        assert_eq!(card.agent_status, AgentStatus::None);

        let coder_tasks = server
            .tasks
            .list(&TaskFilter {
                card_id: Some("c2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.agent_type == "coder")
            .count();
        assert_eq!(coder_tasks, 3);
    })
    .await
    .expect("test timed out");
}

// ── Scenario 3: claim race ───────────────────────────────────────────

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let alice_worker = server.register_worker(ALICE_TOKEN).await;
        let bob_worker = server.register_worker(BOB_TOKEN).await;

        let task = server
            .tasks
            .create(&NewTask::new(TaskType::AgentRun, BOARD, "alice"))
            .await
            .unwrap();

        let alice_claim_path = format!("/api/workers/tasks/{}/claim", task.id);
        let alice_claim = server.post(
            ALICE_TOKEN,
            &alice_claim_path,
            serde_json::json!({ "worker_id": alice_worker }),
        );
        let bob_claim_path = format!("/api/workers/tasks/{}/claim", task.id);
        let bob_claim = server.post(
            BOB_TOKEN,
            &bob_claim_path,
            serde_json::json!({ "worker_id": bob_worker }),
        );

        let (alice_resp, bob_resp) = tokio::join!(alice_claim, bob_claim);
        let mut statuses = [alice_resp.status().as_u16(), bob_resp.status().as_u16()];
        statuses.sort();
        assert_eq!(statuses, [200, 409]);

        let task = server.store.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert!(task.claimed_by_worker.is_some());
    })
    .await
    .expect("test timed out");
}

// ── Scenario 4: offline worker ───────────────────────────────────────

#[tokio::test]
async fn offline_worker_fails_held_tasks_and_routes() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server
            .add_column(agent_column("code", "Code", 0, "coder", "done", "failed_col"))
            .await;
        server.add_column(plain_column("failed_col", "Needs attention", 1)).await;
        server.add_column(plain_column("done", "Done", 2)).await;
        server.add_card("c4", "code", "Doomed work", "").await;

        let worker_id = server.register_worker(ALICE_TOKEN).await;
        let mut rx = server.bus.subscribe("board:b1");

        // T4 running (card-linked, failure routing set), T5 claimed.
        let mut with_card = NewTask::new(TaskType::AgentRun, BOARD, "alice");
        with_card.card_id = Some("c4".to_string());
        with_card.source_column_id = "code".to_string();
        with_card.failure_column_id = "failed_col".to_string();
        let t4 = server.tasks.create(&with_card).await.unwrap();
        let t5 = server
            .tasks
            .create(&NewTask::new(TaskType::AgentRun, BOARD, "alice"))
            .await
            .unwrap();

        server.claim(&worker_id, &t4.id).await;
        server
            .post(
                ALICE_TOKEN,
                &format!("/api/workers/tasks/{}/progress", t4.id),
                serde_json::json!({ "worker_id": worker_id, "progress_text": "working" }),
            )
            .await;
        server.claim(&worker_id, &t5.id).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        // First sweep: past the stale threshold only.
        sweeper::sweep_once_with(
            &server.registry,
            &server.tasks,
            Duration::ZERO,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        next_tagged(&mut rx, "worker_stale").await;

        let worker = server.store.get_worker(&worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Stale);
        // Stale is not offline: held tasks are untouched.
        assert_eq!(
            server.store.get_task(&t4.id).await.unwrap().status,
            TaskStatus::Running
        );

        // Second sweep: past the offline threshold.
        sweeper::sweep_once_with(
            &server.registry,
            &server.tasks,
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
        .unwrap();
        next_tagged(&mut rx, "worker_offline").await;

        let worker = server.store.get_worker(&worker_id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);

        for task_id in [&t4.id, &t5.id] {
            let task = server.store.get_task(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error_summary, "worker offline");
        }

        // T4 had failure routing: the card moved there.
        let card = server.store.get_card("c4").await.unwrap();
        assert_eq!(card.column_id, "failed_col");
        assert_eq!(card.agent_status, AgentStatus::Failed);
    })
    .await
    .expect("test timed out");
}

// ── Scenario 5: out-of-band move ─────────────────────────────────────

#[tokio::test]
async fn out_of_band_move_skips_routing() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.add_column(plain_column("backlog", "Backlog", 0)).await;
        server
            .add_column(agent_column("code", "Code", 1, "coder", "next", ""))
            .await;
        server.add_column(plain_column("next", "Next", 2)).await;
        server.add_column(plain_column("done", "Done", 3)).await;
        server.add_card("c3", "backlog", "Refactor", "").await;

        let worker_id = server.register_worker(ALICE_TOKEN).await;
        server.move_card("c3", "code").await;

        let pending = server.pending_tasks().await;
        let task_id = pending[0]["id"].as_str().unwrap().to_string();
        server.claim(&worker_id, &task_id).await;

        // The user drags the card away while the task is in flight.
        server.move_card("c3", "done").await;

        let mut rx = server.bus.subscribe("board:b1");
        let resp = server.complete(&worker_id, &task_id, "refactored").await;
        assert_eq!(resp.status(), 200);

        match next_tagged(&mut rx, "task_routing_skipped").await {
            Event::TaskRoutingSkipped { task_id: skipped, .. } => {
                assert_eq!(skipped, task_id);
            }
            _ => unreachable!(),
        }

        // The card stays where the human put it; the output comment is
        // still attached.
        let card = server.store.get_card("c3").await.unwrap();
        assert_eq!(card.column_id, "done");

        let comments = server.store.list_comments("c3").await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "refactored");

        let task = server.store.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    })
    .await
    .expect("test timed out");
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test]
async fn late_reports_on_cancelled_tasks_are_noops() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.add_column(plain_column("backlog", "Backlog", 0)).await;
        server.add_card("c5", "backlog", "Slow work", "").await;

        let worker_id = server.register_worker(ALICE_TOKEN).await;
        let mut with_card = NewTask::new(TaskType::AgentRun, BOARD, "alice");
        with_card.card_id = Some("c5".to_string());
        let task = server.tasks.create(&with_card).await.unwrap();

        server.claim(&worker_id, &task.id).await;
        let resp = server
            .post(
                ALICE_TOKEN,
                &format!("/api/tasks/{}/cancel", task.id),
                serde_json::json!({}),
            )
            .await;
        assert_eq!(resp.status(), 204);

        // The worker didn't notice and reports completion anyway.
        let resp = server.complete(&worker_id, &task.id, "too late").await;
        assert_eq!(resp.status(), 200);

        let task = server.store.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        // The output comment is still attached for the audit trail.
        let comments = server.store.list_comments("c5").await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "too late");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn progress_is_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let worker_id = server.register_worker(ALICE_TOKEN).await;
        let task = server
            .tasks
            .create(&NewTask::new(TaskType::AgentRun, BOARD, "alice"))
            .await
            .unwrap();
        server.claim(&worker_id, &task.id).await;

        for text in ["step 1", "step 2", "step 3"] {
            let resp = server
                .post(
                    ALICE_TOKEN,
                    &format!("/api/workers/tasks/{}/progress", task.id),
                    serde_json::json!({ "worker_id": worker_id, "progress_text": text }),
                )
                .await;
            assert_eq!(resp.status(), 200);
        }

        let after_first = server.store.get_task(&task.id).await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Running);
        let started = after_first.started_at.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        server
            .post(
                ALICE_TOKEN,
                &format!("/api/workers/tasks/{}/progress", task.id),
                serde_json::json!({ "worker_id": worker_id, "progress_text": "again" }),
            )
            .await;
        let after_more = server.store.get_task(&task.id).await.unwrap();
        assert_eq!(after_more.started_at.unwrap(), started);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reports_from_non_claiming_worker_are_forbidden() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let alice_worker = server.register_worker(ALICE_TOKEN).await;
        let bob_worker = server.register_worker(BOB_TOKEN).await;

        let task = server
            .tasks
            .create(&NewTask::new(TaskType::AgentRun, BOARD, "alice"))
            .await
            .unwrap();
        server.claim(&alice_worker, &task.id).await;

        let resp = server
            .post(
                BOB_TOKEN,
                &format!("/api/workers/tasks/{}/complete", task.id),
                serde_json::json!({ "worker_id": bob_worker, "output_text": "hijack" }),
            )
            .await;
        assert_eq!(resp.status(), 403);
    })
    .await
    .expect("test timed out");
}

// ── Stream endpoint ──────────────────────────────────────────────────

#[tokio::test]
async fn stream_delivers_tagged_events() {
    use futures_util::StreamExt;

    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .http
            .get(format!(
                "{}/api/events/stream?board_id={BOARD}&token={ALICE_TOKEN}",
                server.base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let mut body = resp.bytes_stream();
        let mut buffer = String::new();

        // The first frame is the immediate heartbeat.
        while !buffer.contains("\"type\":\"heartbeat\"") {
            let chunk = body.next().await.unwrap().unwrap();
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }

        // A task created on the board shows up with its type tag.
        server
            .tasks
            .create(&NewTask::new(TaskType::AgentRun, BOARD, "alice"))
            .await
            .unwrap();
        while !buffer.contains("\"type\":\"task_created\"") {
            let chunk = body.next().await.unwrap().unwrap();
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_requires_a_valid_token() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .http
            .get(format!("{}/api/events/stream?board_id={BOARD}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = server
            .http
            .get(format!(
                "{}/api/events/stream?board_id={BOARD}&token=bogus",
                server.base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    })
    .await
    .expect("test timed out");
}

// ── Worker runtime end-to-end ────────────────────────────────────────

#[tokio::test]
async fn worker_runtime_executes_an_automation_task() {
    use agentboard::worker::{ServerClient, WorkerConfig, WorkerRunner};

    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        // The prompt template is a shell script: `sh -s` stands in for
        // the agent CLI, so the column's "prompt" is what the fake agent
        // prints.
        server
            .add_column(Column {
                prompt_template: "echo Use OIDC+PKCE".to_string(),
                ..agent_column("plan", "Plan", 0, "architect", "done", "")
            })
            .await;
        server.add_column(plain_column("backlog", "Backlog", 1)).await;
        server.add_column(plain_column("done", "Done", 2)).await;
        server.add_card("c6", "backlog", "Design login", "OAuth2").await;

        let mut client = ServerClient::new(&server.base);
        client.set_token(ALICE_TOKEN);

        let config = WorkerConfig {
            server_url: server.base.clone(),
            agent_cli: "sh".to_string(),
            agent_cli_args: vec!["-s".to_string()],
            ..WorkerConfig::default()
        };
        let runner = Arc::new(
            WorkerRunner::register(config, Arc::new(client))
                .await
                .unwrap(),
        );
        let loop_runner = Arc::clone(&runner);
        let run_handle = tokio::spawn(async move { loop_runner.run().await });

        server.move_card("c6", "plan").await;

        // The runner polls, claims, executes the shell "agent", and
        // completes; routing then moves the card.
        let mut landed = false;
        for _ in 0..100 {
            let card = server.store.get_card("c6").await.unwrap();
            if card.column_id == "done" {
                landed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(landed, "card never reached the Done column");

        let comments = server.store.list_comments("c6").await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "Use OIDC+PKCE");

        runner.shutdown().await;
        run_handle.abort();
    })
    .await
    .expect("test timed out");
}
