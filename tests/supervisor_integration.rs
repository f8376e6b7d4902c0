//! End-to-end supervisor behaviour against real `/bin/sh` scripts.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use runsh_core::profile::{EnvVar, Profile, ProfileStore};
use runsh_core::supervisor::{
    process, LaunchError, LogSource, MonitorError, Phase, StopOutcome, StopRequest, Supervisor,
    SupervisorError, SupervisorSettings,
};

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        stop_grace: Duration::from_secs(3),
        kill_wait: Duration::from_secs(3),
        shutdown_grace: Duration::from_secs(15),
        drain_timeout: Duration::from_millis(500),
        log_buffer_lines: 500,
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn new_supervisor(dir: &Path, settings: SupervisorSettings) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(ProfileStore::new(dir.join("data")), settings))
}

async fn wait_for_phase(sup: &Supervisor, name: &str, want: Phase, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if sup.snapshot(name).unwrap().phase == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn added_profile_starts_idle() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");

    sup.add_profile(Profile::new("srv", script)).await.unwrap();
    let snap = sup.snapshot("srv").unwrap();
    assert_eq!(snap.phase, Phase::Idle);
    assert_eq!(snap.pid, None);
    assert_eq!(snap.restart_count, 0);
    assert!(!snap.start_scheduled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_stop_never_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");
    let mut profile = Profile::new("srv", script);
    profile.restart_wait_secs = 0.2;
    sup.add_profile(profile).await.unwrap();

    let snap = sup.start_profile("srv").await.unwrap();
    assert_eq!(snap.phase, Phase::Running);
    assert!(snap.pid.is_some());

    let request = sup.stop_profile("srv").await.unwrap();
    assert!(matches!(request, StopRequest::Stopping { .. }));
    assert!(wait_for_phase(&sup, "srv", Phase::Idle, Duration::from_secs(5)).await);

    // Well past the restart wait: still idle.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let snap = sup.snapshot("srv").unwrap();
    assert_eq!(snap.phase, Phase::Idle);
    assert_eq!(snap.restart_count, 0);
    assert_eq!(snap.pid, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_restarts_after_wait() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let marker = dir.path().join("runs.txt");
    let script = write_script(
        dir.path(),
        "crash.sh",
        &format!("echo run >> '{}'\nexit 1", marker.display()),
    );
    let mut profile = Profile::new("crash", script);
    profile.restart_wait_secs = 2.0;
    sup.add_profile(profile).await.unwrap();

    sup.start_profile("crash").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(count_lines(&marker), 1, "restarted before the wait elapsed");
    assert_eq!(sup.snapshot("crash").unwrap().phase, Phase::RestartPending);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(count_lines(&marker) >= 2, "no restart after the wait");
    assert!(sup.snapshot("crash").unwrap().restart_count >= 1);

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_pending_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let marker = dir.path().join("runs.txt");
    let script = write_script(
        dir.path(),
        "crash.sh",
        &format!("echo run >> '{}'\nexit 3", marker.display()),
    );
    let mut profile = Profile::new("crash", script);
    profile.restart_wait_secs = 1.0;
    sup.add_profile(profile).await.unwrap();

    sup.start_profile("crash").await.unwrap();
    assert!(wait_for_phase(&sup, "crash", Phase::RestartPending, Duration::from_secs(3)).await);

    let request = sup.stop_profile("crash").await.unwrap();
    assert_eq!(request, StopRequest::Done { outcome: StopOutcome::Cancelled });

    tokio::time::sleep(Duration::from_millis(1800)).await;
    let snap = sup.snapshot("crash").unwrap();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(!snap.start_scheduled);
    assert_eq!(count_lines(&marker), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_profile_cannot_be_removed_or_updated() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");
    sup.add_profile(Profile::new("srv", &script)).await.unwrap();
    sup.start_profile("srv").await.unwrap();

    let err = sup.remove_profile("srv").await.unwrap_err();
    assert!(matches!(err, SupervisorError::ProfileInUse { phase: Phase::Running, .. }));

    let mut changed = Profile::new("srv", &script);
    changed.restart_wait_secs = 9.0;
    let err = sup.update_profile("srv", changed).await.unwrap_err();
    assert!(matches!(err, SupervisorError::ProfileInUse { .. }));

    // Registry and store unchanged.
    assert_eq!(sup.profiles().len(), 1);
    assert_eq!(sup.profile("srv").unwrap().restart_wait_secs, 5.0);
    assert_eq!(sup.snapshot("srv").unwrap().phase, Phase::Running);

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn staggered_auto_start() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");

    let mut a = Profile::new("a", &script);
    a.auto_start = true;
    let mut b = Profile::new("b", &script);
    b.auto_start = true;
    b.startup_delay_secs = 5.0;
    let idle = Profile::new("manual", &script);

    let begun = std::time::Instant::now();
    assert_eq!(sup.load_profiles(vec![a, b, idle]), 3);
    assert!(begun.elapsed() < Duration::from_millis(500), "load_profiles blocked");
    assert!(sup.snapshot("b").unwrap().start_scheduled);

    assert!(wait_for_phase(&sup, "a", Phase::Running, Duration::from_secs(2)).await);
    assert_eq!(sup.snapshot("b").unwrap().phase, Phase::Idle);
    assert_eq!(sup.snapshot("manual").unwrap().phase, Phase::Idle);

    assert!(wait_for_phase(&sup, "b", Phase::Running, Duration::from_secs(6)).await);
    assert!(begun.elapsed() >= Duration::from_millis(4900));
    assert_eq!(sup.snapshot("manual").unwrap().phase, Phase::Idle);

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_before_staggered_start_cancels_it() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");
    let mut late = Profile::new("late", &script);
    late.auto_start = true;
    late.startup_delay_secs = 1.0;
    sup.load_profiles(vec![late]);

    let request = sup.stop_profile("late").await.unwrap();
    assert_eq!(request, StopRequest::Done { outcome: StopOutcome::Cancelled });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(sup.snapshot("late").unwrap().phase, Phase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_escalates_stubborn_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let mut fast = settings();
    fast.stop_grace = Duration::from_secs(1);
    fast.kill_wait = Duration::from_secs(2);
    fast.shutdown_grace = Duration::from_secs(8);
    let sup = new_supervisor(dir.path(), fast);

    let polite = write_script(dir.path(), "polite.sh", "exec sleep 30");
    let stubborn = write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\nwhile true; do sleep 1; done",
    );
    for (name, script) in [("one", &polite), ("two", &polite), ("stubborn", &stubborn)] {
        sup.add_profile(Profile::new(name, script)).await.unwrap();
        sup.start_profile(name).await.unwrap();
    }
    // Let the trap get installed.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let begun = std::time::Instant::now();
    let report = sup.shutdown().await;
    assert!(begun.elapsed() < Duration::from_secs(8));
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.forced, vec!["stubborn".to_string()]);
    assert_eq!(report.graceful.len(), 2);

    for snap in sup.snapshot_all() {
        assert_eq!(snap.phase, Phase::Idle, "{} still {}", snap.name, snap.phase);
    }
    // Shut-down monitors stay down.
    assert!(matches!(
        sup.start_profile("one").await,
        Err(SupervisorError::Monitor(MonitorError::Retired(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_errors_leave_profile_idle() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());

    sup.add_profile(Profile::new("missing", dir.path().join("nope.sh")))
        .await
        .unwrap();
    let err = sup.start_profile("missing").await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Monitor(MonitorError::Launch { source: LaunchError::ScriptNotFound(_), .. })
    ));
    let snap = sup.snapshot("missing").unwrap();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(snap.last_error.is_some());

    let script = write_script(dir.path(), "run.sh", "exit 0");
    let mut bad_dir = Profile::new("bad-dir", script);
    bad_dir.working_dir = Some(dir.path().join("does-not-exist"));
    sup.add_profile(bad_dir).await.unwrap();
    let err = sup.start_profile("bad-dir").await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Monitor(MonitorError::Launch { source: LaunchError::WorkingDirMissing(_), .. })
    ));
    assert_eq!(sup.snapshot("bad-dir").unwrap().phase, Phase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_launch_once() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let marker = dir.path().join("runs.txt");
    let script = write_script(
        dir.path(),
        "run.sh",
        &format!("echo run >> '{}'\nexec sleep 30", marker.display()),
    );
    sup.add_profile(Profile::new("srv", script)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sup = sup.clone();
        handles.push(tokio::spawn(async move { sup.start_profile("srv").await }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(SupervisorError::Monitor(MonitorError::AlreadyActive { .. })) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(ok, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count_lines(&marker), 1);
    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_env_and_working_dir_reach_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let work = dir.path().join("work");
    std::fs::create_dir(&work).unwrap();
    let script = write_script(
        dir.path(),
        "talk.sh",
        "echo \"greeting=$GREETING\"\necho \"cwd=$(pwd)\"\necho oops >&2",
    );
    let mut profile = Profile::new("talk", script);
    profile.working_dir = Some(work.clone());
    profile.restart_on_exit = false;
    profile.environment = vec![EnvVar { key: "GREETING".into(), value: "hello there".into() }];
    let added = sup.add_profile(profile).await.unwrap();
    let log_path = added.log_path.clone().unwrap();

    sup.start_profile("talk").await.unwrap();
    assert!(wait_for_phase(&sup, "talk", Phase::Idle, Duration::from_secs(5)).await);

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("greeting=hello there"), "{}", log);
    assert!(log.contains(&format!("cwd={}", work.canonicalize().unwrap().display())), "{}", log);
    assert!(log.contains("oops"), "{}", log);

    let lines = sup.recent_output("talk", None, None).unwrap();
    assert!(lines.iter().any(|l| l.content == "oops" && l.source == LogSource::Output));
    let last = lines.last().unwrap();
    assert!(last.content.contains("exited with exit code 0"), "{:?}", last);
    assert_eq!(last.source, LogSource::System);
    let newer = sup.recent_output("talk", Some(last.id), None).unwrap();
    assert!(newer.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interpreter_runs_non_executable_script() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = dir.path().join("plain.sh");
    std::fs::write(&script, "echo via-interpreter\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

    let mut profile = Profile::new("plain", &script);
    profile.restart_on_exit = false;
    sup.add_profile(profile.clone()).await.unwrap();
    assert!(sup.start_profile("plain").await.is_err());

    profile.interpreter = Some("/bin/sh".into());
    sup.update_profile("plain", profile).await.unwrap();
    sup.start_profile("plain").await.unwrap();
    assert!(wait_for_phase(&sup, "plain", Phase::Idle, Duration::from_secs(5)).await);
    let lines = sup.recent_output("plain", None, Some(10)).unwrap();
    assert!(lines.iter().any(|l| l.content == "via-interpreter"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_gives_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");
    sup.add_profile(Profile::new("srv", script)).await.unwrap();

    let first = sup.start_profile("srv").await.unwrap().pid.unwrap();
    let second = sup.restart_profile("srv").await.unwrap();
    assert_eq!(second.phase, Phase::Running);
    assert_ne!(second.pid.unwrap(), first);
    assert_eq!(second.restart_count, 0);

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn profiles_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "run.sh", "exec sleep 30");
    {
        let sup = new_supervisor(dir.path(), settings());
        let mut web = Profile::new("web", &script);
        web.environment = vec![EnvVar { key: "PORT".into(), value: "8080".into() }];
        sup.add_profile(web).await.unwrap();
        sup.add_profile(Profile::new("db", &script)).await.unwrap();
        sup.add_profile(Profile::new("tmp", &script)).await.unwrap();
        sup.remove_profile("tmp").await.unwrap();
    }

    let sup = new_supervisor(dir.path(), settings());
    assert_eq!(sup.initialize().await.unwrap(), 2);
    let names: Vec<_> = sup.profiles().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["web", "db"]);
    assert_eq!(sup.profile("web").unwrap().environment[0].value, "8080");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn usage_is_reported_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let script = write_script(dir.path(), "run.sh", "sleep 30");
    sup.add_profile(Profile::new("srv", script)).await.unwrap();

    assert!(!sup.resource_usage("srv").await.unwrap().is_available());
    sup.start_profile("srv").await.unwrap();
    let usage = sup.resource_usage("srv").await.unwrap();
    assert!(usage.is_available());
    assert!(usage.memory_mb.unwrap() > 0.0);

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_profile_does_not_block_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let sup = new_supervisor(dir.path(), settings());
    let stubborn = write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\nwhile true; do sleep 0.1; done",
    );
    sup.add_profile(Profile::new("stubborn", &stubborn)).await.unwrap();
    sup.start_profile("stubborn").await.unwrap();
    let request = sup.stop_profile("stubborn").await.unwrap();
    assert!(matches!(request, StopRequest::Stopping { .. }));

    let started = std::time::Instant::now();
    let err = sup
        .update_profile("stubborn", Profile::new("stubborn", &stubborn))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ProfileInUse { phase: Phase::Stopping, .. }));
    assert!(matches!(
        sup.remove_profile("stubborn").await,
        Err(SupervisorError::ProfileInUse { .. })
    ));
    sup.add_profile(Profile::new("unrelated", &stubborn)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    assert!(wait_for_phase(&sup, "stubborn", Phase::Idle, Duration::from_secs(10)).await);
    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_profile_is_skipped_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran.txt");
    let script = write_script(
        dir.path(),
        "run.sh",
        &format!("echo ran >> '{}'\nexec sleep 30", marker.display()),
    );
    let mut profile = Profile::new("off", &script);
    profile.enabled = false;
    profile.auto_start = true;
    {
        let sup = new_supervisor(dir.path(), settings());
        sup.add_profile(profile).await.unwrap();
    }

    let sup = new_supervisor(dir.path(), settings());
    assert_eq!(sup.initialize().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sup.snapshot("off").unwrap().phase, Phase::Idle);
    assert!(matches!(
        sup.start_profile("off").await,
        Err(SupervisorError::ProfileDisabled(_))
    ));
    assert_eq!(count_lines(&marker), 0);
}

/// A script must outlive a daemon that exits without stopping it, and keep
/// writing to its log.
#[test]
fn scripts_keep_running_after_the_supervisor_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "tick.sh",
        "while true; do echo tick; sleep 0.2; done",
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let (pid, log_path) = runtime.block_on(async {
        let sup = new_supervisor(dir.path(), settings());
        let added = sup.add_profile(Profile::new("tick", &script)).await.unwrap();
        let pid = sup.start_profile("tick").await.unwrap().pid.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        (pid, added.log_path.unwrap())
    });
    drop(runtime);

    let ticks = || {
        std::fs::read_to_string(&log_path)
            .unwrap()
            .lines()
            .filter(|l| *l == "tick")
            .count()
    };
    let before = ticks();
    std::thread::sleep(Duration::from_secs(1));
    let after = ticks();
    process::force_kill(pid).unwrap();

    assert!(after > before, "script stopped writing: {} then {}", before, after);
}
