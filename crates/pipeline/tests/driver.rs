//! End-to-end driver runs against real `sh` child processes, the in-memory
//! store and the local bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use a6hub_core::job_events::{JobUpdate, UpdateKind};
use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::types::DbId;
use a6hub_db::models::job::CreateJob;
use a6hub_db::store::{JobStore, MemoryStore};
use a6hub_events::{LocalBus, ProgressPublisher, UpdateBus, UpdateStream, MAX_PAYLOAD_BYTES};
use a6hub_pipeline::plan::CommandSpec;
use a6hub_pipeline::{
    BuildDriver, DriveOutcome, DriverConfig, LocalArtifactUploader, MemoryFileSource, ToolPaths,
};
use assert_matches::assert_matches;
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<LocalBus>,
    workspaces: TempDir,
    artifacts: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(LocalBus::default()),
            workspaces: tempfile::tempdir().unwrap(),
            artifacts: tempfile::tempdir().unwrap(),
        }
    }

    /// Create a PENDING job; returns `(job_id, project_id)`.
    async fn job(&self, job_type: JobType, config: serde_json::Value) -> (DbId, DbId) {
        let project = self.store.insert_project(1, "private").await;
        let job = self
            .store
            .create_job(&CreateJob {
                job_type,
                config,
                project_id: project.id,
                user_id: 1,
            })
            .await
            .unwrap();
        (job.id, project.id)
    }

    fn driver(&self, files: MemoryFileSource, tools: ToolPaths) -> BuildDriver {
        self.driver_with(files, tools, |_| {})
    }

    fn driver_with(
        &self,
        files: MemoryFileSource,
        tools: ToolPaths,
        tweak: impl FnOnce(&mut DriverConfig),
    ) -> BuildDriver {
        let mut config = DriverConfig::new(self.workspaces.path());
        config.cancel_poll_interval = Duration::from_millis(50);
        config.log_flush_interval = Duration::from_millis(100);
        config.tools = tools;
        tweak(&mut config);

        BuildDriver::new(
            self.store.clone(),
            Arc::new(files),
            Arc::new(LocalArtifactUploader::new(self.artifacts.path())),
            ProgressPublisher::new(self.bus.clone()),
            config,
            "test-worker",
        )
    }

    async fn subscribe(&self, job_id: DbId) -> UpdateStream {
        self.bus.subscribe(job_id).await.unwrap()
    }
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::with_args("sh", ["-c", script])
}

/// Drain updates up to and including the `complete` event.
async fn until_complete(rx: &mut UpdateStream) -> Vec<JobUpdate> {
    let mut updates = Vec::new();
    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for updates")
            .expect("bus closed");
        let done = matches!(update.kind, UpdateKind::Complete { .. });
        updates.push(update);
        if done {
            return updates;
        }
    }
}

fn step_names(updates: &[JobUpdate]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|u| match &u.kind {
            UpdateKind::Step { step_name, .. } => Some(step_name.clone()),
            _ => None,
        })
        .collect()
}

fn marker(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).display().to_string()
}

const ICARUS_COMPILE: &str = r#"echo "Compiling design"; echo "Elaborating top module tb"; echo compiled > sim.vvp"#;
const ICARUS_RUN: &str = r#"echo "VCD info: dumpfile wave.vcd opened for output."; echo "Simulation finished"; echo wave > wave.vcd"#;

fn icarus_tools() -> ToolPaths {
    ToolPaths {
        iverilog: sh(ICARUS_COMPILE),
        vvp: sh(ICARUS_RUN),
        ..ToolPaths::default()
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stage_lines_in_order_complete_every_stage() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(
            JobType::Simulation,
            json!({ "simulator": "icarus", "testbench": "tb.v" }),
        )
        .await;
    let files = MemoryFileSource::new()
        .with_file(project_id, "alu.v", Some("module alu; endmodule"))
        .with_file(project_id, "tb.v", Some("module tb; endmodule"))
        .with_file(project_id, "README.md", Some("# alu"));
    let mut rx = h.subscribe(job_id).await;

    let outcome = h.driver(files, icarus_tools()).drive(job_id).await;
    assert_eq!(outcome, DriveOutcome::Completed);

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Completed));
    let expected_artifacts = format!("jobs/{job_id}/artifacts");
    assert_eq!(job.artifacts_path.as_deref(), Some(expected_artifacts.as_str()));
    let progress = job.progress();
    assert_eq!(progress.completed_steps, vec!["compile", "elaborate", "simulate"]);
    assert_eq!(progress.progress_percent, 100);
    assert_eq!(progress.steps_info.len(), 3);

    let logs = h.store.logs(job_id).await;
    assert!(logs.contains("Elaborating top module tb"));
    assert!(logs.contains("Simulation finished"));
    assert!(logs.ends_with("Job completed successfully\n"));

    let artifacts = h.artifacts.path().join(&expected_artifacts);
    assert!(artifacts.join("sim.vvp").exists());
    assert!(artifacts.join("wave.vcd").exists());
    assert!(!artifacts.join("alu.v").exists());

    let updates = until_complete(&mut rx).await;
    assert_matches!(
        updates[0].kind,
        UpdateKind::Status { status: JobStatus::Running }
    );
    assert_eq!(step_names(&updates), vec!["compile", "elaborate", "simulate"]);
    assert_matches!(
        updates.last().unwrap().kind,
        UpdateKind::Complete { status: JobStatus::Completed, .. }
    );

    let percents: Vec<i16> = updates
        .iter()
        .filter_map(|u| match u.kind {
            UpdateKind::Progress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));
}

#[tokio::test]
async fn build_job_writes_librelane_config() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(
            JobType::Build,
            json!({ "design_name": "counter", "use_docker": false, "clock_period": "25" }),
        )
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "src/counter.v", Some("module counter; endmodule"));
    let tools = ToolPaths {
        librelane: sh(r#"echo "[STEP 1] Running Yosys.Synthesis"; echo "[STEP 5] OpenROAD.Floorplan"; test -f config.json"#),
        ..ToolPaths::default()
    };

    let outcome = h.driver(files, tools).drive(job_id).await;
    assert_eq!(outcome, DriveOutcome::Completed);

    let workspace = h.workspaces.path().join(format!("job_{job_id}"));
    let rendered: serde_json::Value =
        serde_json::from_slice(&std::fs::read(workspace.join("config.json")).unwrap()).unwrap();
    assert_eq!(rendered["DESIGN_NAME"], "counter");
    assert_eq!(rendered["CLOCK_PERIOD"], 25.0);
    assert_eq!(rendered["VERILOG_FILES"], json!(["dir::src/counter.v"]));

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.progress().completed_steps.len(), 9);
    assert_eq!(job.current_step.as_deref(), Some("lvs"));

    // config.json is an input, not an artifact.
    let artifacts = h.artifacts.path().join(format!("jobs/{job_id}/artifacts"));
    assert!(!artifacts.join("config.json").exists());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_project_files_fails_before_spawn() {
    let h = Harness::new();
    let spawned = tempfile::tempdir().unwrap();
    let (job_id, _) = h
        .job(JobType::Build, json!({ "design_name": "empty", "use_docker": false }))
        .await;
    let tools = ToolPaths {
        librelane: sh(&format!("touch {}", marker(&spawned, "spawned"))),
        ..ToolPaths::default()
    };
    let mut rx = h.subscribe(job_id).await;

    let outcome = h.driver(MemoryFileSource::new(), tools).drive(job_id).await;
    assert_matches!(outcome, DriveOutcome::Failed(ref msg) if msg.starts_with("Input error"));
    assert!(!spawned.path().join("spawned").exists());

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Failed));
    assert!(job.error_message.unwrap().starts_with("Input error"));
    assert!(h.store.logs(job_id).await.contains("ERROR: Input error"));

    let updates = until_complete(&mut rx).await;
    assert!(updates
        .iter()
        .any(|u| matches!(u.kind, UpdateKind::Error { .. })));
    assert_matches!(
        updates.last().unwrap().kind,
        UpdateKind::Complete { status: JobStatus::Failed, message: Some(_) }
    );
}

#[tokio::test]
async fn files_without_content_are_warnings_then_input_error() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "x", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new()
        .with_file(project_id, "top.v", None)
        .with_file(project_id, "../escape.v", Some("module escape; endmodule"));

    let outcome = h.driver(files, ToolPaths::default()).drive(job_id).await;
    assert_matches!(outcome, DriveOutcome::Failed(_));

    let logs = h.store.logs(job_id).await;
    assert!(logs.contains("WARNING: skipped top.v: no stored content"));
    assert!(logs.contains("WARNING: skipped ../escape.v"));
    assert!(!h.workspaces.path().join("escape.v").exists());
}

#[tokio::test]
async fn malformed_config_is_a_configuration_error() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "x", "pl_target_density": 3.5 }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "x.v", Some("module x; endmodule"));

    let outcome = h.driver(files, ToolPaths::default()).drive(job_id).await;
    assert_matches!(outcome, DriveOutcome::Failed(ref msg) if msg.starts_with("Configuration error"));
}

#[tokio::test]
async fn missing_testbench_is_an_input_error() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Simulation, json!({ "simulator": "icarus", "testbench": "tb_missing.v" }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "alu.v", Some("module alu; endmodule"));

    let outcome = h.driver(files, icarus_tools()).drive(job_id).await;
    assert_matches!(outcome, DriveOutcome::Failed(ref msg) if msg.contains("tb_missing.v"));
}

#[tokio::test]
async fn non_zero_exit_fails_with_output_tail() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "alu", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "alu.v", Some("module alu; endmodule"));
    let tools = ToolPaths {
        librelane: sh(r#"echo "running synthesis"; echo "fatal: bad netlist" >&2; exit 2"#),
        ..ToolPaths::default()
    };

    let outcome = h.driver(files, tools).drive(job_id).await;
    let message = assert_matches!(outcome, DriveOutcome::Failed(msg) => msg);
    assert!(message.contains("exit code 2"));
    assert!(message.contains("fatal: bad netlist"));

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Failed));
    assert_eq!(job.error_message.as_deref(), Some(message.as_str()));
    assert_eq!(job.current_step.as_deref(), Some("synthesis"));
}

#[tokio::test]
async fn verbose_failure_completion_fits_the_bus_limit() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "noisy", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "noisy.v", Some("module noisy; endmodule"));
    let tools = ToolPaths {
        librelane: sh(r#"i=0; while [ $i -lt 60 ]; do printf '%03d "%0196d"\n' $i 0; i=$((i+1)); done; exit 1"#),
        ..ToolPaths::default()
    };
    let mut rx = h.subscribe(job_id).await;

    let outcome = h.driver(files, tools).drive(job_id).await;
    let message = assert_matches!(outcome, DriveOutcome::Failed(msg) => msg);
    assert!(message.len() > MAX_PAYLOAD_BYTES);

    let updates = until_complete(&mut rx).await;
    let complete = updates.last().unwrap();
    assert!(serde_json::to_string(complete).unwrap().len() <= MAX_PAYLOAD_BYTES);
    assert_matches!(
        complete.kind,
        UpdateKind::Complete { status: JobStatus::Failed, message: Some(ref m) }
            if m.starts_with("sh failed with exit code 1")
    );

    // The job row keeps the whole message.
    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.error_message.as_deref(), Some(message.as_str()));
}

#[tokio::test]
async fn deadline_kills_the_tool() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "slow", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "slow.v", Some("module slow; endmodule"));
    let tools = ToolPaths {
        librelane: sh(r#"echo $$ > tool.pid; echo started; exec sleep 30"#),
        ..ToolPaths::default()
    };
    let driver = h.driver_with(files, tools, |c| c.max_job_duration = Duration::from_secs(1));

    let outcome = tokio::time::timeout(Duration::from_secs(10), driver.drive(job_id))
        .await
        .expect("driver did not honour its deadline");
    assert_matches!(outcome, DriveOutcome::Failed(ref msg) if msg.contains("exceeded time limit"));

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Failed));

    let pid_file = h.workspaces.path().join(format!("job_{job_id}/tool.pid"));
    let pid = std::fs::read_to_string(pid_file).unwrap();
    if Path::new("/proc").exists() {
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    }
}

#[cfg(target_os = "linux")]
/// Script whose real work runs in a backgrounded child, the way a wrapper
/// script launches yosys or openroad.
const BACKGROUND_HELPER: &str =
    r#"sleep 30 & echo $! > helper.pid; echo "running synthesis"; wait"#;

#[cfg(target_os = "linux")]
fn helper_pid(h: &Harness, job_id: DbId) -> u32 {
    let pid_file = h.workspaces.path().join(format!("job_{job_id}/helper.pid"));
    std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap()
}

#[cfg(target_os = "linux")]
/// Zombies count as gone; whoever inherited them may not reap promptly.
fn is_running(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    !matches!(state, Some('Z' | 'X') | None)
}

#[cfg(target_os = "linux")]
async fn exits_within(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while is_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn deadline_kills_backgrounded_helpers() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "bg", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "bg.v", Some("module bg; endmodule"));
    let tools = ToolPaths {
        librelane: sh(BACKGROUND_HELPER),
        ..ToolPaths::default()
    };
    let driver = h.driver_with(files, tools, |c| c.max_job_duration = Duration::from_secs(1));

    let outcome = tokio::time::timeout(Duration::from_secs(10), driver.drive(job_id))
        .await
        .expect("driver did not honour its deadline");
    assert_matches!(outcome, DriveOutcome::Failed(ref msg) if msg.contains("exceeded time limit"));
    assert!(exits_within(helper_pid(&h, job_id), Duration::from_secs(5)).await);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_pending_job_never_spawns() {
    let h = Harness::new();
    let spawned = tempfile::tempdir().unwrap();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "c", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "c.v", Some("module c; endmodule"));
    let tools = ToolPaths {
        librelane: sh(&format!("touch {}", marker(&spawned, "spawned"))),
        ..ToolPaths::default()
    };

    assert!(h.store.cancel(job_id).await.unwrap());
    let outcome = h.driver(files, tools).drive(job_id).await;

    assert_eq!(outcome, DriveOutcome::Skipped);
    assert_eq!(h.store.job_status(job_id).await.unwrap(), Some(JobStatus::Cancelled));
    assert!(!spawned.path().join("spawned").exists());
}

#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Simulation, json!({ "simulator": "icarus", "testbench": "tb.v" }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "tb.v", Some("module tb; endmodule"));
    let driver = h.driver(files, icarus_tools());

    assert_eq!(driver.drive(job_id).await, DriveOutcome::Completed);
    assert!(!h.store.cancel(job_id).await.unwrap());
    assert_eq!(h.store.job_status(job_id).await.unwrap(), Some(JobStatus::Completed));

    // Redelivery of a finished job is a guarded no-op too.
    assert_eq!(driver.drive(job_id).await, DriveOutcome::Skipped);
}

#[tokio::test]
async fn cancel_while_running_kills_container_and_cleans_up() {
    let h = Harness::new();
    let cleaned = tempfile::tempdir().unwrap();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "long" }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "long.v", Some("module long; endmodule"));
    // Stands in for the docker CLI: `run` streams output, `rm` is the cleanup.
    let docker = format!(
        r#"if [ "$0" = rm ]; then touch {}; else echo "running synthesis"; exec sleep 30; fi"#,
        marker(&cleaned, "cleaned")
    );
    let tools = ToolPaths {
        docker: sh(&docker),
        ..ToolPaths::default()
    };
    let driver = Arc::new(h.driver(files, tools));
    let mut rx = h.subscribe(job_id).await;

    let task = tokio::spawn({
        let driver = driver.clone();
        async move { driver.drive(job_id).await }
    });

    // Wait until the tool is producing output.
    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .unwrap()
            .unwrap();
        if matches!(update.kind, UpdateKind::Step { ref step_name, .. } if step_name == "synthesis") {
            break;
        }
    }
    assert!(h.store.cancel(job_id).await.unwrap());

    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("cancel was not observed")
        .unwrap();
    assert_eq!(outcome, DriveOutcome::Cancelled);
    assert!(cleaned.path().join("cleaned").exists());

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Cancelled));
    assert!(h.store.logs(job_id).await.contains("Job cancelled"));

    let updates = until_complete(&mut rx).await;
    assert_matches!(
        updates.last().unwrap().kind,
        UpdateKind::Complete { status: JobStatus::Cancelled, .. }
    );
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancel_kills_backgrounded_helpers() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Build, json!({ "design_name": "bg", "use_docker": false }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "bg.v", Some("module bg; endmodule"));
    let tools = ToolPaths {
        librelane: sh(BACKGROUND_HELPER),
        ..ToolPaths::default()
    };
    let driver = Arc::new(h.driver(files, tools));
    let mut rx = h.subscribe(job_id).await;

    let task = tokio::spawn({
        let driver = driver.clone();
        async move { driver.drive(job_id).await }
    });

    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .unwrap()
            .unwrap();
        if matches!(update.kind, UpdateKind::Log { ref log_line } if log_line == "running synthesis") {
            break;
        }
    }
    let helper = helper_pid(&h, job_id);
    assert!(is_running(helper));
    assert!(h.store.cancel(job_id).await.unwrap());

    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("cancel was not observed")
        .unwrap();
    assert_eq!(outcome, DriveOutcome::Cancelled);
    assert!(exits_within(helper, Duration::from_secs(5)).await);
}

// ---------------------------------------------------------------------------
// Redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_running_job_reruns_without_regressing_progress() {
    let h = Harness::new();
    let (job_id, project_id) = h
        .job(JobType::Simulation, json!({ "simulator": "icarus", "testbench": "tb.v" }))
        .await;
    let files = MemoryFileSource::new().with_file(project_id, "tb.v", Some("module tb; endmodule"));

    // An earlier attempt got as far as elaboration and left a workspace behind.
    h.store.mark_running(job_id, "lost-worker").await.unwrap();
    let earlier = a6hub_core::progress::ProgressData {
        current_step: Some("elaborate".into()),
        progress_percent: 33,
        completed_steps: vec!["compile".into()],
        steps_info: Vec::new(),
    };
    assert!(h.store.update_progress(job_id, &earlier).await.unwrap());
    let stale = h.workspaces.path().join(format!("job_{job_id}"));
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("leftover.txt"), "old").unwrap();

    let outcome = h.driver(files, icarus_tools()).drive(job_id).await;
    assert_eq!(outcome, DriveOutcome::Completed);

    let job = h.store.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.worker_id.as_deref(), Some("test-worker"));
    assert_eq!(job.progress().progress_percent, 100);
    assert!(!stale.join("leftover.txt").exists());
}
