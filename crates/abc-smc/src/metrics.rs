//! Per-generation reports and their CSV export.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-generation diagnostics collected by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationReport {
    /// Generation index.
    pub generation: usize,
    /// Threshold the generation was sampled with.
    pub epsilon: Option<f64>,
    /// Threshold scheduled for the following generation.
    pub next_epsilon: f64,
    /// Accepted particles.
    pub acceptance_count: usize,
    /// Trials consumed.
    pub proposal_count: u64,
    /// Trials rejected by the threshold or the prior support.
    pub rejected: u64,
    /// Trials whose simulation failed.
    pub failed: u64,
    /// Accepted over proposed trials.
    pub acceptance_rate: f64,
    /// Kish effective sample size of the weights.
    pub effective_sample_size: f64,
    /// Model probabilities after the generation.
    pub model_probabilities: BTreeMap<usize, f64>,
    /// Models absorbed in this generation.
    pub absorbed: Vec<usize>,
    /// The next threshold did not decrease.
    pub stalled: bool,
}

/// Collects generation reports and exports them as CSV.
#[derive(Debug, Default, Clone)]
pub struct MetricsRecorder {
    reports: Vec<GenerationReport>,
}

impl MetricsRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a report.
    pub fn push(&mut self, report: GenerationReport) {
        self.reports.push(report);
    }

    /// Reports in recording order.
    pub fn reports(&self) -> &[GenerationReport] {
        &self.reports
    }

    /// Consumes the recorder.
    pub fn into_reports(self) -> Vec<GenerationReport> {
        self.reports
    }

    /// Writes one CSV row per generation with a probability column per model.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let nr_models = self
            .reports
            .iter()
            .map(|report| report.model_probabilities.len())
            .max()
            .unwrap_or(0);
        let mut file = File::create(path)?;
        write!(
            file,
            "generation,epsilon,next_epsilon,accepted,proposed,rejected,failed,\
             acceptance_rate,ess,stalled"
        )?;
        for model in 0..nr_models {
            write!(file, ",p_model_{model}")?;
        }
        writeln!(file)?;
        for report in &self.reports {
            let epsilon = report
                .epsilon
                .map(|epsilon| format!("{epsilon:.6}"))
                .unwrap_or_default();
            write!(
                file,
                "{},{},{:.6},{},{},{},{},{:.6},{:.3},{}",
                report.generation,
                epsilon,
                report.next_epsilon,
                report.acceptance_count,
                report.proposal_count,
                report.rejected,
                report.failed,
                report.acceptance_rate,
                report.effective_sample_size,
                report.stalled
            )?;
            for model in 0..nr_models {
                let probability = report.model_probabilities.get(&model).copied().unwrap_or(0.0);
                write!(file, ",{probability:.6}")?;
            }
            writeln!(file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn report(
        generation: usize,
        epsilon: Option<f64>,
        probabilities: &[(usize, f64)],
    ) -> GenerationReport {
        GenerationReport {
            generation,
            epsilon,
            next_epsilon: 1.5,
            acceptance_count: 10,
            proposal_count: 20,
            rejected: 8,
            failed: 2,
            acceptance_rate: 0.5,
            effective_sample_size: 9.0,
            model_probabilities: probabilities.iter().copied().collect(),
            absorbed: Vec::new(),
            stalled: false,
        }
    }

    #[test]
    fn csv_has_one_probability_column_per_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut recorder = MetricsRecorder::new();
        recorder.push(report(0, None, &[(0, 1.0)]));
        recorder.push(report(1, Some(2.0), &[(0, 0.75), (1, 0.25)]));
        recorder.write_csv(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "generation,epsilon,next_epsilon,accepted,proposed,rejected,failed,\
             acceptance_rate,ess,stalled,p_model_0,p_model_1"
        );
        assert_eq!(lines[1], "0,,1.500000,10,20,8,2,0.500000,9.000,false,1.000000,0.000000");
        assert_eq!(
            lines[2],
            "1,2.000000,1.500000,10,20,8,2,0.500000,9.000,false,0.750000,0.250000"
        );
    }
}

