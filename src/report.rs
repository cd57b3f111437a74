/// Verification results and their presentation.
/// `VerificationReport` is what a run produces: the verdict, every race and
/// barrier finding, instruction statistics and optional stage timings. It
/// renders as plain text for the terminal or serializes to JSON.
use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::graph::BarrierFinding;
use crate::kernel::Dim3;
use crate::race::Race;

/// Process exit status of the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// Bad arguments, unreadable input, no thread count
    Usage,
    /// Malformed source or a structurally invalid barrier usage
    Structural,
    /// A race or barrier finding was reported
    VerificationFailure,
    Internal,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Usage => 1,
            ExitStatus::Structural => 2,
            ExitStatus::VerificationFailure => 3,
            ExitStatus::Internal => 4,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Emulate,
    Graph,
    Validate,
    Happens,
    Races,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Decode,
        Stage::Emulate,
        Stage::Graph,
        Stage::Validate,
        Stage::Happens,
        Stage::Races,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Emulate => "emulate",
            Stage::Graph => "graph",
            Stage::Validate => "validate",
            Stage::Happens => "happens",
            Stage::Races => "races",
        }
    }

    /// 1-based position in the pipeline
    pub fn ordinal(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).unwrap_or(0) + 1
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub millis: f64,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub kernel: String,
    pub block_dim: Dim3,
    pub threads: usize,
    pub lock_step: bool,
    pub static_counts: BTreeMap<String, u64>,
    pub dynamic_counts: BTreeMap<String, u64>,
    /// Dynamic instruction total of every thread, by flat id
    pub thread_instructions: Vec<u64>,
    pub barrier_instances: usize,
    pub shared_accesses: usize,
    pub races: Vec<Race>,
    pub barrier_findings: Vec<BarrierFinding>,
    /// False when an ordering cycle left happens-before undefined
    pub races_checked: bool,
    pub timings: Vec<StageTiming>,
    pub verdict: Verdict,
}

/// What `render_text` includes beyond the verdict and findings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOptions {
    /// Print at most this many races (all when `None`)
    pub max_races: Option<usize>,
    pub statistics: bool,
    pub timings: bool,
}

impl VerificationReport {
    pub fn verdict_for(races: &[Race], findings: &[BarrierFinding]) -> Verdict {
        if races.is_empty() && findings.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self.verdict {
            Verdict::Pass => ExitStatus::Success,
            Verdict::Fail => ExitStatus::VerificationFailure,
        }
    }

    pub fn total_dynamic_instructions(&self) -> u64 {
        self.thread_instructions.iter().sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self, options: &TextOptions) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[ptxverify] kernel '{}': block={} threads={} mode={}",
            self.kernel,
            self.block_dim,
            self.threads,
            if self.lock_step { "warp lock-step" } else { "scalar" }
        );

        if options.statistics {
            let _ = writeln!(out, "Static instructions:");
            for (kind, count) in &self.static_counts {
                let _ = writeln!(out, "  {kind:<12} {count}");
            }
            let _ = writeln!(out, "Dynamic instructions:");
            for (kind, count) in &self.dynamic_counts {
                let _ = writeln!(out, "  {kind:<12} {count}");
            }
            let max = self.thread_instructions.iter().max().copied().unwrap_or(0);
            let min = self.thread_instructions.iter().min().copied().unwrap_or(0);
            let _ = writeln!(
                out,
                "  total {} | per thread min {} max {}",
                self.total_dynamic_instructions(),
                min,
                max
            );
            let _ = writeln!(
                out,
                "Barrier instances: {} | shared accesses: {}",
                self.barrier_instances, self.shared_accesses
            );
        }

        for finding in &self.barrier_findings {
            let _ = writeln!(out, "ERROR: {finding}");
        }

        let shown = options.max_races.unwrap_or(self.races.len());
        for race in self.races.iter().take(shown) {
            let _ = writeln!(out, "ERROR: {race}");
        }
        if self.races.len() > shown {
            let _ = writeln!(out, "... {} more race(s) not shown", self.races.len() - shown);
        }
        if !self.races_checked {
            let _ = writeln!(
                out,
                "WARNING: race detection skipped because barrier generations are out of order"
            );
        }

        if options.timings {
            let _ = writeln!(out, "Stage timings:");
            for t in &self.timings {
                let _ = writeln!(out, "  {:<10} {:>10.3} ms", t.stage.name(), t.millis);
            }
        }

        match self.verdict {
            Verdict::Pass => {
                let _ = writeln!(
                    out,
                    "Verification PASSED: no races and no barrier errors"
                );
            }
            Verdict::Fail => {
                let _ = writeln!(
                    out,
                    "Verification FAILED: {} race(s), {} barrier error(s)",
                    self.races.len(),
                    self.barrier_findings.len()
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BarrierRef;
    use crate::race::AccessSite;

    fn report(races: Vec<Race>, findings: Vec<BarrierFinding>) -> VerificationReport {
        let verdict = VerificationReport::verdict_for(&races, &findings);
        VerificationReport {
            kernel: "k".into(),
            block_dim: Dim3::x(64),
            threads: 64,
            lock_step: false,
            static_counts: BTreeMap::from([("bar.sync".to_string(), 1)]),
            dynamic_counts: BTreeMap::from([("bar.sync".to_string(), 64)]),
            thread_instructions: vec![1; 64],
            barrier_instances: 1,
            shared_accesses: 0,
            races,
            barrier_findings: findings,
            races_checked: true,
            timings: vec![StageTiming {
                stage: Stage::Emulate,
                millis: 1.5,
            }],
            verdict,
        }
    }

    fn race(address: i64) -> Race {
        let site = |thread| AccessSite {
            thread,
            tid: Dim3::new(thread as u32, 0, 0),
            pc: 1,
            line: 2,
            is_write: true,
        };
        Race {
            address,
            first: site(0),
            second: site(1),
        }
    }

    #[test]
    fn test_exit_codes() {
        let codes: Vec<u8> = [
            ExitStatus::Success,
            ExitStatus::Usage,
            ExitStatus::Structural,
            ExitStatus::VerificationFailure,
            ExitStatus::Internal,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clean_report_passes() {
        let r = report(vec![], vec![]);
        assert!(r.passed());
        assert_eq!(r.exit_status(), ExitStatus::Success);
        let text = r.render_text(&TextOptions::default());
        assert!(text.contains("Verification PASSED"));
        assert!(!text.contains("Static instructions"));
        assert_eq!(r.total_dynamic_instructions(), 64);
    }

    #[test]
    fn test_race_limit_and_sections() {
        let r = report(vec![race(0), race(4), race(8)], vec![]);
        assert_eq!(r.exit_status(), ExitStatus::VerificationFailure);
        let text = r.render_text(&TextOptions {
            max_races: Some(1),
            statistics: true,
            timings: true,
        });
        assert_eq!(text.matches("ERROR: race").count(), 1);
        assert!(text.contains("2 more race(s) not shown"));
        assert!(text.contains("Static instructions"));
        assert!(text.contains("emulate"));
        assert!(text.contains("3 race(s)"));
    }

    #[test]
    fn test_json_shape() {
        let r = report(
            vec![],
            vec![BarrierFinding::OrderingCycle {
                barriers: vec![BarrierRef {
                    name: 1,
                    generation: 0,
                }],
            }],
        );
        let value: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();
        assert_eq!(value["verdict"], "fail");
        assert_eq!(value["barrier_findings"][0]["kind"], "ordering_cycle");
        assert_eq!(value["timings"][0]["stage"], "emulate");
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Decode.ordinal(), 1);
        assert_eq!(Stage::Races.ordinal(), Stage::ALL.len());
    }
}
