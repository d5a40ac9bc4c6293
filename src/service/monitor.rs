// Threshold evaluation.
//
// Detection is deliberately separated from action: evaluation is a pure
// read over the live view and the runtime states, emitting triggers that
// the restart state machine (the single point of mutual exclusion) acts
// on.

use crate::service::queue::QueueProbe;
use crate::service::types::{BreachReason, RestartRuntimeState, RestartTrigger, ServiceRecord};
use std::collections::HashMap;

/// Evaluate every live record with an enabled, non-restarting runtime
/// state against its thresholds. A breach on any configured dimension
/// (logical OR, strict comparisons) yields one trigger per record; the
/// first breached dimension is recorded as the reason.
pub fn evaluate_once(
    records: &[ServiceRecord],
    states: &HashMap<u32, RestartRuntimeState>,
    probe: &dyn QueueProbe,
) -> Vec<RestartTrigger> {
    let mut triggers = Vec::new();

    for record in records {
        let Some(state) = states.get(&record.pid) else {
            continue;
        };
        if !state.policy.enabled || state.restarting {
            continue;
        }

        if let Some(reason) = breach_reason(record, state, probe) {
            triggers.push(RestartTrigger {
                pid: record.pid,
                logical_name: record.logical_name.clone(),
                artifact_path: record.artifact_path.clone(),
                kind: record.kind,
                reason,
            });
        }
    }

    triggers
}

fn breach_reason(
    record: &ServiceRecord,
    state: &RestartRuntimeState,
    probe: &dyn QueueProbe,
) -> Option<BreachReason> {
    let policy = &state.policy;

    if f64::from(record.cpu_percent) > policy.cpu_threshold {
        return Some(BreachReason::Cpu {
            observed: record.cpu_percent,
            threshold: policy.cpu_threshold,
        });
    }

    let threshold_bytes = policy.memory_threshold_bytes();
    if record.memory_bytes > threshold_bytes {
        return Some(BreachReason::Memory {
            observed_bytes: record.memory_bytes,
            threshold_bytes,
        });
    }

    if let Some(threshold) = policy.queue_threshold {
        // An unavailable queue can never breach; that is not an error.
        if let Some(depth) = probe.queue_depth(&record.logical_name) {
            if depth > threshold {
                return Some(BreachReason::Queue { depth, threshold });
            }
        }
    }

    None
}
