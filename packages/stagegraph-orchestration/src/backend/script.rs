//! Structured batch-array job description and its PBS/Torque rendering.

use crate::completion::marker_check;
use crate::range::RangeSpec;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Quote for POSIX sh: always single-quoted, embedded quotes escaped
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Scheduler-facing header of an array job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayHeader {
    pub job_name: String,
    pub range: RangeSpec,
    /// Job id the whole array waits on
    pub wait_for: Option<String>,
    /// Opaque scheduler options, passed through verbatim
    pub options: Option<String>,
    pub work_dir: PathBuf,
    /// Where the scheduler's own stdout/stderr go
    pub scheduler_log: PathBuf,
}

/// One per pending index: re-check completion, then run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardedCommand {
    pub index: u32,
    /// Shell condition that holds when the task is already complete
    pub guard: String,
    pub command: String,
    pub log: PathBuf,
    pub success_marker: Option<String>,
    /// Touched after a verified run
    pub sentinel: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchScript {
    pub shell: String,
    pub header: ArrayHeader,
    pub blocks: Vec<GuardedCommand>,
}

impl BatchScript {
    /// Indices that carry a command block
    pub fn guarded_indices(&self) -> Vec<u32> {
        self.blocks.iter().map(|b| b.index).collect()
    }
}

/// Serializes a [`BatchScript`] for a concrete scheduler
pub trait ScriptRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    fn render(&self, script: &BatchScript) -> String;

    /// Job id from the submission program's stdout
    fn parse_job_id(&self, stdout: &str) -> Option<String>;
}

/// PBS / Torque dialect (`#PBS -t`, `$PBS_ARRAYID`, `afterokarray`)
#[derive(Debug, Clone, Copy, Default)]
pub struct PbsRenderer;

impl ScriptRenderer for PbsRenderer {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn render(&self, script: &BatchScript) -> String {
        let header = &script.header;
        let mut out = String::new();

        let _ = writeln!(out, "#!{}", script.shell);
        let _ = writeln!(out, "#PBS -N {}", header.job_name);
        let _ = writeln!(out, "#PBS -t {}", header.range);
        if let Some(id) = &header.wait_for {
            let _ = writeln!(out, "#PBS -W depend=afterokarray:{}", id);
        }
        let _ = writeln!(out, "#PBS -j oe");
        let _ = writeln!(
            out,
            "#PBS -o {}",
            shell_quote(&header.scheduler_log.to_string_lossy())
        );
        if let Some(options) = header.options.as_deref().filter(|o| !o.trim().is_empty()) {
            let _ = writeln!(out, "#PBS {}", options.trim());
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "cd {} || exit 1",
            shell_quote(&header.work_dir.to_string_lossy())
        );
        out.push('\n');

        for block in &script.blocks {
            let log = shell_quote(&block.log.to_string_lossy());
            let _ = writeln!(out, "if [ \"$PBS_ARRAYID\" -eq {} ]; then", block.index);
            let _ = writeln!(out, "  if ! {{ {}; }}; then", block.guard);
            if let Some(parent) = block.log.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = writeln!(out, "    mkdir -p {}", shell_quote(&parent.to_string_lossy()));
            }
            // Command text stays out of the log so it cannot satisfy the marker check
            let _ = writeln!(out, "    echo \"# Started at $(date)\" > {}", log);
            // Subshell: an `exit` in the command still reaches the footer
            let _ = writeln!(out, "    ( {}\n    ) >> {} 2>&1", block.command, log);
            let _ = writeln!(out, "    code=$?");
            let _ = writeln!(out, "    echo \"# Ended (code $code) at $(date)\" >> {}", log);
            let _ = writeln!(out, "    [ \"$code\" -eq 0 ] || exit 1");
            if let Some(marker) = &block.success_marker {
                let _ = writeln!(out, "    {} || exit 1", marker_check(marker, &log));
            }
            if let Some(sentinel) = &block.sentinel {
                let _ = writeln!(out, "    : > {}", shell_quote(&sentinel.to_string_lossy()));
            }
            let _ = writeln!(out, "  fi");
            let _ = writeln!(out, "fi");
        }

        let _ = writeln!(out, "exit 0");
        out
    }

    /// `1234[].headnode` -> `1234[]`, `5678.server extra` -> `5678`
    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        let token = stdout.split_whitespace().next()?;
        let id = token.split('.').next().unwrap_or_default();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(wait_for: Option<&str>, options: Option<&str>) -> BatchScript {
        BatchScript {
            shell: "/bin/bash".to_string(),
            header: ArrayHeader {
                job_name: "decode".to_string(),
                range: RangeSpec::Span { start: 1, end: 3 },
                wait_for: wait_for.map(str::to_string),
                options: options.map(str::to_string),
                work_dir: PathBuf::from("/exp/tri1"),
                scheduler_log: PathBuf::from("/exp/tri1/q/decode.pbs.log"),
            },
            blocks: vec![
                GuardedCommand {
                    index: 1,
                    guard: "[ -f '/exp/tri1/log/decode.1.log' ]".to_string(),
                    command: "decode in.1 > lat.1".to_string(),
                    log: PathBuf::from("/exp/tri1/log/decode.1.log"),
                    success_marker: Some("Done".to_string()),
                    sentinel: None,
                },
                GuardedCommand {
                    index: 3,
                    guard: "[ -f '/exp/tri1/log/decode.3.log' ]".to_string(),
                    command: "decode in.3 > lat.3".to_string(),
                    log: PathBuf::from("/exp/tri1/log/decode.3.log"),
                    success_marker: None,
                    sentinel: Some(PathBuf::from("/exp/tri1/log/decode.3.done")),
                },
            ],
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_header() {
        let text = PbsRenderer.render(&script(None, Some("-l walltime=2:00:00 ")));
        assert!(text.starts_with("#!/bin/bash\n#PBS -N decode\n#PBS -t 1-3\n"));
        assert!(text.contains("#PBS -l walltime=2:00:00\n"));
        assert!(!text.contains("depend="));
    }

    #[test]
    fn test_render_quotes_scheduler_log() {
        let mut script = script(None, None);
        script.header.scheduler_log = PathBuf::from("/exp/my run/q/decode.pbs.log");
        let text = PbsRenderer.render(&script);
        assert!(text.contains("#PBS -o '/exp/my run/q/decode.pbs.log'\n"));
    }

    #[test]
    fn test_render_wait_directive() {
        let text = PbsRenderer.render(&script(Some("1234[]"), None));
        assert!(text.contains("#PBS -W depend=afterokarray:1234[]\n"));
    }

    #[test]
    fn test_render_blocks_only_for_pending() {
        let text = PbsRenderer.render(&script(None, None));
        assert!(text.contains("if [ \"$PBS_ARRAYID\" -eq 1 ]; then"));
        assert!(!text.contains("-eq 2 ]"));
        assert!(text.contains("if [ \"$PBS_ARRAYID\" -eq 3 ]; then"));
        assert!(text.contains(
            "grep -v -e '^# Started at ' -e '^# Ended (' '/exp/tri1/log/decode.1.log' \
             | grep -qF -- 'Done' || exit 1"
        ));
        assert!(text.contains("echo \"# Ended (code $code) at $(date)\" >> '/exp/tri1/log/decode.3.log'"));
        assert!(text.contains(": > '/exp/tri1/log/decode.3.done'"));
        assert!(text.trim_end().ends_with("exit 0"));
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            PbsRenderer.parse_job_id("1234[].headnode.cluster\n"),
            Some("1234[]".to_string())
        );
        assert_eq!(PbsRenderer.parse_job_id("5678"), Some("5678".to_string()));
        assert_eq!(PbsRenderer.parse_job_id("   \n"), None);
        assert_eq!(PbsRenderer.parse_job_id(".server"), None);
    }
}
