//! Metrics definitions for release assembly.

use metrics::Unit;
use shared::metrics_defs::{MetricDef, MetricType};

pub const RELEASE_AS_ARTIFACT_BUNDLE: MetricDef = MetricDef {
    name: "sourcemaps.upload.release_as_artifact_bundle",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of validated release assemble requests",
};

pub const ASSEMBLE_STATUS_HIT: MetricDef = MetricDef {
    name: "assemble.status.hit",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of status lookups that found a record",
};

pub const ASSEMBLE_STATUS_MISS: MetricDef = MetricDef {
    name: "assemble.status.miss",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of status lookups without a record",
};

pub const ASSEMBLE_TASK_ENQUEUED: MetricDef = MetricDef {
    name: "assemble.task.enqueued",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of assemble tasks handed to the worker pool",
};

pub const ASSEMBLE_TASK_RACE_LOST: MetricDef = MetricDef {
    name: "assemble.task.race_lost",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of requests that found a concurrently created record and did not enqueue",
};

pub const ASSEMBLE_TASK_RESULT: MetricDef = MetricDef {
    name: "assemble.task.result",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of finished assemble tasks, tagged by result",
};

pub const ASSEMBLE_TASK_DURATION: MetricDef = MetricDef {
    name: "assemble.task.duration",
    metric_type: MetricType::Histogram,
    unit: Unit::Seconds,
    description: "Time to assemble a bundle in seconds",
};

pub const ASSEMBLE_TASK_IN_FLIGHT: MetricDef = MetricDef {
    name: "assemble.task.in_flight",
    metric_type: MetricType::Gauge,
    unit: Unit::Count,
    description: "Number of assemble tasks currently running",
};

pub const ASSEMBLE_BUNDLE_SIZE: MetricDef = MetricDef {
    name: "assemble.bundle.size",
    metric_type: MetricType::Histogram,
    unit: Unit::Bytes,
    description: "Size of assembled bundles in bytes",
};

pub const CHUNK_UPLOADED: MetricDef = MetricDef {
    name: "chunk.uploaded",
    metric_type: MetricType::Counter,
    unit: Unit::Count,
    description: "Number of chunks written to the chunk store",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RELEASE_AS_ARTIFACT_BUNDLE,
    ASSEMBLE_STATUS_HIT,
    ASSEMBLE_STATUS_MISS,
    ASSEMBLE_TASK_ENQUEUED,
    ASSEMBLE_TASK_RACE_LOST,
    ASSEMBLE_TASK_RESULT,
    ASSEMBLE_TASK_DURATION,
    ASSEMBLE_TASK_IN_FLIGHT,
    ASSEMBLE_BUNDLE_SIZE,
    CHUNK_UPLOADED,
];
