//! Metric definitions shared by the service crates. Each crate declares its
//! metrics as `MetricDef` constants and records them through the macros below,
//! so names and units are kept in one table.

use metrics::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub unit: Unit,
    pub description: &'static str,
}

/// Registers units and descriptions with the installed recorder.
pub fn describe_metrics(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.unit, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.unit, def.description),
            MetricType::Histogram => {
                metrics::describe_histogram!(def.name, def.unit, def.description)
            }
        }
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        metrics::counter!($def.name, $($label => $value),+)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        metrics::gauge!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Panics if two definitions share a name.
    fn assert_unique_names(defs: &[MetricDef]) {
        let mut names = HashSet::new();
        for def in defs {
            assert!(names.insert(def.name), "duplicate metric {}", def.name);
        }
    }

    #[test]
    fn test_describe_without_recorder() {
        let defs = [
            MetricDef {
                name: "test.counter",
                metric_type: MetricType::Counter,
                unit: Unit::Count,
                description: "counter",
            },
            MetricDef {
                name: "test.duration",
                metric_type: MetricType::Histogram,
                unit: Unit::Seconds,
                description: "duration",
            },
        ];
        assert_unique_names(&defs);

        // Describing and recording are no-ops until a recorder is installed
        describe_metrics(&defs);
        counter!(defs[0]).increment(1);
        counter!(defs[0], "result" => "ok").increment(1);
        histogram!(defs[1]).record(0.5);
    }
}
