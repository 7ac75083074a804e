/// Cluster backend integration tests
///
/// A fake submission program stands in for qsub: it keeps a copy of every
/// submitted script and prints increasing job ids. Scripts are then run
/// with `sh` and `PBS_ARRAYID` set to check what each array element does.
use stagegraph_orchestration::{
    BackendKind, JobHandle, OrchestratorConfig, OutputTemplate, RangePolicy, StageOrchestrator,
    StageRunState, StageTemplate, TemplateVars,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const FINISHED_LOG: &str =
    "# Started at Mon, 19 Oct 2026 09:00:00 +0000\nDone\n# Ended (code 0) at Mon, 19 Oct 2026 10:00:00 +0000\n";

fn install_fake_qsub(dir: &Path) -> PathBuf {
    let bin = dir.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let path = bin.join("qsub");
    fs::write(
        &path,
        r#"#!/bin/sh
state="$(dirname "$0")/count"
n=$(cat "$state" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$state"
cp "$1" "$(dirname "$0")/submitted.$n.sh"
echo "$n.headnode.cluster"
"#,
    )
    .unwrap();
    path
}

fn cluster_config(work: &Path, qsub: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(work).with_backend(BackendKind::Cluster);
    config.cluster.submit_program = "sh".to_string();
    config.cluster.submit_args = vec![qsub.display().to_string()];
    config
}

fn submitted(qsub: &Path, n: usize) -> String {
    fs::read_to_string(qsub.parent().unwrap().join(format!("submitted.{}.sh", n))).unwrap()
}

fn decode() -> StageTemplate {
    StageTemplate::new("decode", "echo lattice-{index} > {output}; echo Done")
        .with_output(OutputTemplate::new("lat.{index}"))
        .with_success_marker("Done")
}

fn run_element(script: &Path, index: u32) -> bool {
    Command::new("sh")
        .arg(script)
        .env("PBS_ARRAYID", index.to_string())
        .status()
        .unwrap()
        .success()
}

#[tokio::test]
async fn test_nothing_complete_submits_full_range() {
    let dir = TempDir::new().unwrap();
    let qsub = install_fake_qsub(dir.path());
    let config = cluster_config(dir.path(), &qsub);
    let mut orch = StageOrchestrator::new(config.clone()).unwrap();

    let spec = decode()
        .instantiate("decode", 3, &TemplateVars::new(), &config)
        .unwrap();
    let outcome = orch.run_stage(spec).await.unwrap();

    assert_eq!(outcome.plan.pending, vec![1, 2, 3]);
    assert_eq!(outcome.range.unwrap().to_string(), "1-3");
    assert_eq!(outcome.handle, JobHandle::Scheduler("1".to_string()));
    assert!(matches!(outcome.run.state, StageRunState::Submitted { .. }));

    let script = submitted(&qsub, 1);
    assert!(script.contains("#PBS -t 1-3\n"));
    assert!(!script.contains("depend="));
    for i in 1..=3 {
        assert!(script.contains(&format!("\"$PBS_ARRAYID\" -eq {} ]", i)));
    }
}

#[tokio::test]
async fn test_complete_task_inside_span_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let qsub = install_fake_qsub(dir.path());
    let config = cluster_config(dir.path(), &qsub);
    let spec = decode()
        .instantiate("decode", 3, &TemplateVars::new(), &config)
        .unwrap();

    // Task 2 finished earlier with its marker
    fs::create_dir_all(dir.path().join("log")).unwrap();
    fs::write(&spec.tasks[1].artifacts[0].path, "lattice-2\n").unwrap();
    fs::write(&spec.tasks[1].log, FINISHED_LOG).unwrap();

    let mut orch = StageOrchestrator::new(config.clone()).unwrap();
    let outcome = orch.run_stage(spec).await.unwrap();
    assert_eq!(outcome.plan.pending, vec![1, 3]);
    assert_eq!(outcome.range.unwrap().to_string(), "1-3");

    let text = submitted(&qsub, 1);
    assert!(text.contains("#PBS -t 1-3\n"));
    assert!(!text.contains("-eq 2 ]"));

    let script = dir.path().join("q/decode.sh");
    for i in 1..=3 {
        assert!(run_element(&script, i), "array element {} failed", i);
    }
    assert_eq!(fs::read_to_string(dir.path().join("lat.1")).unwrap(), "lattice-1\n");
    assert_eq!(fs::read_to_string(dir.path().join("lat.3")).unwrap(), "lattice-3\n");
    // Untouched: the no-op element did not rewrite task 2's log
    assert_eq!(
        fs::read_to_string(dir.path().join("log/decode.2.log")).unwrap(),
        FINISHED_LOG
    );
}

#[tokio::test]
async fn test_array_element_fails_without_marker() {
    let dir = TempDir::new().unwrap();
    let qsub = install_fake_qsub(dir.path());
    let config = cluster_config(dir.path(), &qsub);

    let quiet = StageTemplate::new("decode", "echo lattice > {output}")
        .with_output(OutputTemplate::new("lat.{index}"))
        .with_success_marker("Done");
    let mut orch = StageOrchestrator::new(config.clone()).unwrap();
    orch.run_stage(
        quiet
            .instantiate("decode", 1, &TemplateVars::new(), &config)
            .unwrap(),
    )
    .await
    .unwrap();

    assert!(!run_element(&dir.path().join("q/decode.sh"), 1));
}

#[tokio::test]
async fn test_dependent_stage_waits_on_predecessor() {
    let dir = TempDir::new().unwrap();
    let qsub = install_fake_qsub(dir.path());
    let config = cluster_config(dir.path(), &qsub);
    let mut orch = StageOrchestrator::new(config.clone()).unwrap();

    let acc = StageTemplate::new("acc", "acc {index} > {output}")
        .with_output(OutputTemplate::new("1.{index}.acc"));
    let update = StageTemplate::new("update", "est 1.mdl > {output}")
        .with_output(OutputTemplate::new("2.mdl"));

    let vars = TemplateVars::new();
    let a = orch
        .run_stage(acc.instantiate("acc.1", 4, &vars, &config).unwrap())
        .await
        .unwrap();
    let b = orch
        .run_stage(update.instantiate("update.1", 1, &vars, &config).unwrap())
        .await
        .unwrap();

    assert_eq!(a.handle, JobHandle::Scheduler("1".to_string()));
    assert_eq!(b.handle, JobHandle::Scheduler("2".to_string()));
    assert!(!submitted(&qsub, 1).contains("depend="));
    assert!(submitted(&qsub, 2).contains("#PBS -W depend=afterokarray:1\n"));
    assert_eq!(orch.chain().predecessor().scheduler_id(), Some("2"));
}

#[tokio::test]
async fn test_scattered_pending_uses_list_under_adaptive_policy() {
    let dir = TempDir::new().unwrap();
    let qsub = install_fake_qsub(dir.path());
    let mut config = cluster_config(dir.path(), &qsub);
    config.range_policy = RangePolicy::Adaptive { max_list_len: 4 };
    let spec = decode()
        .instantiate("decode", 10, &TemplateVars::new(), &config)
        .unwrap();

    fs::create_dir_all(dir.path().join("log")).unwrap();
    for task in spec.tasks.iter().filter(|t| t.index != 2 && t.index != 9) {
        fs::write(&task.artifacts[0].path, "lattice\n").unwrap();
        fs::write(&task.log, FINISHED_LOG).unwrap();
    }

    let mut orch = StageOrchestrator::new(config.clone()).unwrap();
    let outcome = orch.run_stage(spec).await.unwrap();
    assert_eq!(outcome.range.unwrap().to_string(), "2,9");
    assert!(submitted(&qsub, 1).contains("#PBS -t 2,9\n"));
}

#[tokio::test]
async fn test_job_name_and_options_in_header() {
    let dir = TempDir::new().unwrap();
    let qsub = install_fake_qsub(dir.path());
    let mut config = cluster_config(dir.path(), &qsub);
    config.backend_options = Some("-l walltime=2:00:00 -q long".to_string());
    config.cluster.job_prefix = Some("tri1_".to_string());

    let mut orch = StageOrchestrator::new(config.clone()).unwrap();
    orch.run_stage(
        decode()
            .instantiate("decode", 2, &TemplateVars::new(), &config)
            .unwrap(),
    )
    .await
    .unwrap();

    let script = submitted(&qsub, 1);
    assert!(script.starts_with("#!/bin/bash\n#PBS -N tri1_decode\n"));
    assert!(script.contains("#PBS -l walltime=2:00:00 -q long\n"));
}
