mod common;

use std::sync::Arc;

use taskhub::events::EventKind;
use taskhub::hub::NewTask;
use taskhub::task::execution::{ExecutionStatus, NO_LOGS};
use taskhub::task::model::TaskStatus;

use common::hub_at;

async fn create(hub: &taskhub::hub::TaskHub, title: &str) -> String {
    hub.create_task(NewTask {
        title: title.to_owned(),
        ..NewTask::default()
    })
    .await
    .expect("create")
    .id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_launches_are_single_flight() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, mux) = hub_at(td.path());
    let id = create(&hub, "Build release").await;

    let a = {
        let hub = Arc::clone(&hub);
        let id = id.clone();
        tokio::spawn(async move { hub.execute_task(&id, Some("make release\n")).await })
    };
    let b = {
        let hub = Arc::clone(&hub);
        let id = id.clone();
        tokio::spawn(async move { hub.execute_task(&id, Some("make release\n")).await })
    };
    let results = [a.await.expect("join"), b.await.expect("join")];

    let started: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let rejected: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(started.len(), 1);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].category(), "already_running");
    assert_eq!(mux.launches.lock().len(), 1);

    let running: Vec<_> = hub
        .executions()
        .history(&id)
        .expect("history")
        .into_iter()
        .filter(|r| r.status == ExecutionStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);
    assert_eq!(hub.get_task(&id).expect("task").status, TaskStatus::InProgress);

    hub.shutdown().await;
}

#[tokio::test]
async fn execute_unknown_task_is_not_found() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, mux) = hub_at(td.path());
    let err = hub.execute_task("missing", None).await.unwrap_err();
    assert_eq!(err.category(), "not_found");
    assert!(mux.launches.lock().is_empty());
}

#[tokio::test]
async fn stop_without_a_session_changes_nothing() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, _mux) = hub_at(td.path());
    let id = create(&hub, "Idle task").await;
    let before = hub.list_tasks(None);
    let mut events = hub.subscribe();

    assert!(!hub.stop_task_execution(&id).await.expect("stop"));
    assert_eq!(hub.list_tasks(None), before);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn stop_moves_the_task_to_review() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, _mux) = hub_at(td.path());
    let id = create(&hub, "Long job").await;
    let record = hub.execute_task(&id, None).await.expect("execute");
    assert!(
        td.path()
            .join("tasks")
            .join(&id)
            .join("execute.sh")
            .exists()
    );
    assert_eq!(
        hub.attach_command(&id).await.expect("attach"),
        format!("tmux attach-session -t {}", record.session_name)
    );

    let mut events = hub.subscribe();
    assert!(hub.stop_task_execution(&id).await.expect("stop"));
    assert_eq!(hub.get_task(&id).expect("task").status, TaskStatus::Review);

    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        seen.push(ev);
    }
    assert!(seen.iter().any(|e| e.event == EventKind::TaskUpdated && e.data["status"] == "review"));
    assert!(seen.iter().any(|e| e.event == EventKind::ExecutionEvent
        && e.data["execution_event"] == "stopped"));

    let info = hub.execution_status(&id).await.expect("status");
    assert!(!info.is_running);
    assert_eq!(info.status, Some(ExecutionStatus::Stopped));
    assert_eq!(hub.attach_command(&id).await.unwrap_err().category(), "not_found");

    hub.shutdown().await;
}

#[tokio::test]
async fn finished_session_is_reconciled_on_read() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, mux) = hub_at(td.path());
    let id = create(&hub, "Quick job").await;
    let record = hub.execute_task(&id, Some("echo done\n")).await.expect("execute");

    let running = hub.execution_status(&id).await.expect("status");
    assert!(running.is_running);
    assert_eq!(running.status, Some(ExecutionStatus::Running));

    std::fs::write(&record.log_file, "done\nExit code: 0\n").expect("log");
    mux.finish(&record.session_name);

    let info = hub.execution_status(&id).await.expect("status");
    assert!(!info.is_running);
    assert_eq!(info.status, Some(ExecutionStatus::Completed));
    let exec = info.execution.expect("execution");
    assert_eq!(exec.exit_code, Some(0));
    assert!(exec.completed_at.is_some());

    // A new launch is allowed once the old session is gone.
    hub.execute_task(&id, Some("echo again\n"))
        .await
        .expect("relaunch");

    hub.shutdown().await;
}

#[tokio::test]
async fn log_tail_never_exceeds_the_log() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, _mux) = hub_at(td.path());
    let id = create(&hub, "Chatty job").await;
    assert_eq!(hub.execution_logs(&id, 10), vec![NO_LOGS.to_owned()]);

    let record = hub.execute_task(&id, None).await.expect("execute");
    std::fs::write(&record.log_file, "l1\nl2\nl3\nl4\nl5\n").expect("log");

    let all = vec!["l1", "l2", "l3", "l4", "l5"];
    assert_eq!(hub.execution_logs(&id, 0), all);
    assert_eq!(hub.execution_logs(&id, -1), all);
    assert_eq!(hub.execution_logs(&id, 100), all);
    assert_eq!(hub.execution_logs(&id, 2), vec!["l4", "l5"]);

    hub.shutdown().await;
}

#[tokio::test]
async fn launch_stands_when_the_index_cannot_be_written() {
    let td = tempfile::tempdir().expect("tempdir");
    let (hub, mux) = hub_at(td.path());
    let id = create(&hub, "Stubborn job").await;

    // A directory in place of the store file makes every persist fail.
    let db = td.path().join("db").join("tasks_db.json");
    std::fs::remove_file(&db).expect("remove store");
    std::fs::create_dir_all(&db).expect("mkdir");
    std::fs::write(db.join("occupied"), "x").expect("occupy");

    let mut events = hub.subscribe();
    let record = hub.execute_task(&id, Some("sleep 60\n")).await.expect("execute");
    assert_eq!(mux.launches.lock().len(), 1);
    assert_eq!(hub.get_task(&id).expect("task").status, TaskStatus::Todo);

    let ev = events.try_recv().expect("started event");
    assert_eq!(ev.event, EventKind::ExecutionEvent);
    assert_eq!(ev.data["execution_event"], "started");
    assert_eq!(ev.data["execution_id"], record.execution_id.as_str());

    let info = hub.execution_status(&id).await.expect("status");
    assert!(info.is_running);

    hub.shutdown().await;
}
