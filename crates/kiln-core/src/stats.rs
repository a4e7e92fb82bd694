//! Aggregate statistics over execution records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::language::Language;
use crate::types::{ExecutionOutcome, ExecutionRecord};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Average, minimum and maximum of a millisecond timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub avg: f64,
    pub min: u64,
    pub max: u64,
}

impl Timing {
    pub fn of(values: impl IntoIterator<Item = u64>) -> Self {
        let mut count = 0u64;
        let mut sum = 0u128;
        let mut min = u64::MAX;
        let mut max = 0;
        for v in values {
            count += 1;
            sum += v as u128;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            avg: sum as f64 / count as f64,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmCold {
    pub warm: usize,
    pub cold: usize,
}

/// Statistics for one function (or any set of records).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub total_executions: usize,
    /// Percentage of executions without an error.
    pub success_rate: f64,
    pub initialization_time: Timing,
    pub execution_time: Timing,
    pub total_time: Timing,
    pub runtime_distribution: BTreeMap<BackendKind, usize>,
    pub warm_vs_cold: WarmCold,
}

impl FunctionStats {
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        let mut runtime_distribution: BTreeMap<BackendKind, usize> =
            BackendKind::ALL.iter().map(|b| (*b, 0)).collect();
        let mut warm_vs_cold = WarmCold::default();

        for record in records {
            *runtime_distribution.entry(record.backend).or_default() += 1;
            if record.outcome.warm_start {
                warm_vs_cold.warm += 1;
            } else {
                warm_vs_cold.cold += 1;
            }
        }

        let outcomes = || records.iter().map(|r| &r.outcome);
        Self {
            total_executions: records.len(),
            success_rate: success_rate(outcomes()),
            initialization_time: Timing::of(outcomes().map(|o| o.init_time_ms)),
            execution_time: Timing::of(outcomes().map(|o| o.exec_time_ms)),
            total_time: Timing::of(outcomes().map(|o| o.total_time_ms)),
            runtime_distribution,
            warm_vs_cold,
        }
    }
}

/// System-wide statistics over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_functions: usize,
    pub total_executions: usize,
    pub executions_per_day: f64,
    pub success_rate: f64,
    pub avg_initialization_time: f64,
    pub avg_execution_time: f64,
    pub avg_total_time: f64,
    pub runtime_distribution: BTreeMap<BackendKind, usize>,
    pub language_distribution: BTreeMap<String, usize>,
}

impl SystemStats {
    pub fn from_records(records: &[ExecutionRecord], total_functions: usize, days: u64) -> Self {
        let function = FunctionStats::from_records(records);

        let mut language_distribution: BTreeMap<String, usize> = Language::ALL
            .iter()
            .map(|l| (l.as_str().to_string(), 0))
            .collect();
        for record in records {
            *language_distribution
                .entry(record.language.clone())
                .or_default() += 1;
        }

        Self {
            total_functions,
            total_executions: records.len(),
            executions_per_day: if days > 0 {
                records.len() as f64 / days as f64
            } else {
                0.0
            },
            success_rate: function.success_rate,
            avg_initialization_time: function.initialization_time.avg,
            avg_execution_time: function.execution_time.avg,
            avg_total_time: function.total_time.avg,
            runtime_distribution: function.runtime_distribution,
            language_distribution,
        }
    }
}

/// Timings of repeated runs on one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub count: usize,
    pub initialization_time: Timing,
    pub execution_time: Timing,
    pub total_time: Timing,
}

impl RuntimeStats {
    /// Statistics over the successful outcomes only.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ExecutionOutcome>) -> Self {
        let ok: Vec<&ExecutionOutcome> = outcomes.into_iter().filter(|o| o.is_success()).collect();
        Self {
            count: ok.len(),
            initialization_time: Timing::of(ok.iter().map(|o| o.init_time_ms)),
            execution_time: Timing::of(ok.iter().map(|o| o.exec_time_ms)),
            total_time: Timing::of(ok.iter().map(|o| o.total_time_ms)),
        }
    }
}

/// Group records by function name, skipping ad-hoc executions.
pub fn stats_by_function(records: &[ExecutionRecord]) -> BTreeMap<String, FunctionStats> {
    let mut grouped: BTreeMap<String, Vec<ExecutionRecord>> = BTreeMap::new();
    for record in records {
        if let Some(name) = &record.function_name {
            grouped.entry(name.clone()).or_default().push(record.clone());
        }
    }
    grouped
        .into_iter()
        .map(|(name, records)| (name, FunctionStats::from_records(&records)))
        .collect()
}

/// Unix-millisecond cutoff for "the last `days` days".
pub fn days_cutoff(now_ms: u64, days: u64) -> u64 {
    now_ms.saturating_sub(days.saturating_mul(MILLIS_PER_DAY))
}

fn success_rate<'a>(outcomes: impl Iterator<Item = &'a ExecutionOutcome>) -> f64 {
    let (total, ok) = outcomes.fold((0usize, 0usize), |(total, ok), o| {
        (total + 1, ok + usize::from(o.is_success()))
    });
    if total == 0 {
        0.0
    } else {
        ok as f64 / total as f64 * 100.0
    }
}
