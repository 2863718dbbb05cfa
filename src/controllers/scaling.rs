//! Scaling decision logic
//!
//! Pure functions mapping observed queue state to a desired replica count,
//! plus the scale-operation classification that enforces the scale-down
//! cooldown. Kept free of Kubernetes types so the whole decision surface is
//! unit-testable.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{OperatorError, Result};

/// Relative change below which the desired count is pinned to the current
/// count, so small backlog wobbles do not flap the fleet.
pub const TOLERANCE: f64 = 0.1;

/// The action the reconciler takes against the workload this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOperation {
    NoOp,
    ScaleUp,
    ScaleDown,
}

impl fmt::Display for ScaleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleOperation::NoOp => write!(f, "NoOp"),
            ScaleOperation::ScaleUp => write!(f, "ScaleUp"),
            ScaleOperation::ScaleDown => write!(f, "ScaleDown"),
        }
    }
}

/// Parse an integer-or-percent expression ("3", "10%") against a total.
/// Percentages round up when `round_up` is set.
pub fn parse_int_or_percent(expr: &str, total: i32, round_up: bool) -> Result<i32> {
    let invalid = |reason: &str| OperatorError::InvalidMaxDisruption {
        expr: expr.to_string(),
        reason: reason.to_string(),
    };
    let expr = expr.trim();
    let parsed = if let Some(percent) = expr.strip_suffix('%') {
        let percent: f64 = percent
            .trim()
            .parse()
            .map_err(|_| invalid("percentage is not a number"))?;
        let value = percent * total as f64 / 100.0;
        if round_up {
            value.ceil() as i64
        } else {
            value.floor() as i64
        }
    } else {
        expr.parse::<i64>()
            .map_err(|_| invalid("not an integer or percentage"))?
    };
    if parsed < 0 {
        return Err(invalid("value is negative"));
    }
    Ok(parsed as i32)
}

/// Cap on the magnitude of one scale-down step, as an absolute worker count.
/// Percentages are taken against the current replicas, rounded up, so small
/// fleets can still lose at least one worker per step.
pub fn max_disruptable_workers(max_disruption: &str, current_workers: i32) -> Result<i32> {
    parse_int_or_percent(max_disruption, current_workers, true)
}

/// Lower bound lifted by the velocity floor: enough workers to absorb the
/// observed enqueue rate given the per-job processing time. Disabled while
/// the policy does not set a processing time.
fn min_workers_with_velocity(
    messages_sent_per_minute: f64,
    min_workers: i32,
    seconds_to_process_one_job: f64,
) -> i32 {
    if seconds_to_process_one_job == 0.0 {
        return min_workers;
    }
    let by_velocity =
        ((seconds_to_process_one_job * messages_sent_per_minute) / 60.0).ceil() as i32;
    by_velocity.max(min_workers)
}

fn is_change_too_small(desired: i32, current: i32, tolerance: f64) -> bool {
    ((desired - current) as f64).abs() / current as f64 <= tolerance
}

/// Desired replica count for one policy given the observed queue state.
///
/// Branches, first match wins: cold start scales straight to the backlog
/// target; a visible backlog scales proportionally inside the stability
/// band; an empty-but-flowing queue holds the velocity floor; a fully idle
/// fleet collapses past the disruption bound; otherwise scale down partially
/// to the floor.
#[allow(clippy::too_many_arguments)]
pub fn desired_workers(
    queue_name: &str,
    queue_messages: i32,
    messages_sent_per_minute: f64,
    seconds_to_process_one_job: f64,
    target_messages_per_worker: i32,
    current_workers: i32,
    idle_workers: i32,
    min_workers: i32,
    max_workers: i32,
    max_disruption: &str,
) -> Result<i32> {
    let min_workers = min_workers_with_velocity(
        messages_sent_per_minute,
        min_workers,
        seconds_to_process_one_job,
    );
    let max_disruptable = max_disruptable_workers(max_disruption, current_workers)?;
    let raw_desired =
        (queue_messages as f64 / target_messages_per_worker as f64).ceil() as i32;

    debug!(
        queue = queue_name,
        messages = queue_messages,
        sent_per_minute = messages_sent_per_minute,
        current = current_workers,
        idle = idle_workers,
        min_computed = min_workers,
        max = max_workers,
        max_disruptable,
        "computing desired workers"
    );

    if current_workers == 0 {
        return Ok(bound_desired(
            current_workers,
            raw_desired,
            min_workers,
            max_workers,
            max_disruptable,
        ));
    }

    if queue_messages > 0 {
        if is_change_too_small(raw_desired, current_workers, TOLERANCE) {
            return Ok(bound_desired(
                current_workers,
                current_workers,
                min_workers,
                max_workers,
                max_disruptable,
            ));
        }
        return Ok(bound_desired(
            current_workers,
            raw_desired,
            min_workers,
            max_workers,
            max_disruptable,
        ));
    } else if messages_sent_per_minute > 0.0 && seconds_to_process_one_job > 0.0 {
        // No backlog visible but the queue has throughput: workers drain
        // jobs faster than they accumulate. Hold the velocity floor.
        return Ok(bound_desired(
            current_workers,
            min_workers,
            min_workers,
            max_workers,
            max_disruptable,
        ));
    }

    if current_workers == idle_workers {
        // Every worker is idle: collapsing interrupts nothing, so the
        // disruption bound is replaced by the full fleet size.
        return Ok(bound_desired(
            current_workers,
            0,
            min_workers,
            max_workers,
            current_workers,
        ));
    }

    Ok(bound_desired(
        current_workers,
        min_workers,
        min_workers,
        max_workers,
        max_disruptable,
    ))
}

/// Clamp a candidate desired count to the policy bounds and the scale-down
/// disruption cap.
fn bound_desired(
    current: i32,
    mut desired: i32,
    min: i32,
    max: i32,
    max_disruptable: i32,
) -> i32 {
    if min >= max {
        return max;
    }
    if (current - desired) > max_disruptable {
        desired = current - max_disruptable;
    }
    if desired > max {
        return max;
    }
    if desired < min {
        return min;
    }
    desired
}

/// Classify the transition from `current` to `desired`, suppressing a scale
/// down that falls inside the cooldown window after the last scale action.
pub fn scale_operation(
    queue_name: &str,
    desired: i32,
    current: i32,
    last_scale_time: Option<DateTime<Utc>>,
    scale_down_delay: Duration,
) -> ScaleOperation {
    if desired == current {
        return ScaleOperation::NoOp;
    }
    if desired > current {
        return ScaleOperation::ScaleUp;
    }
    match last_scale_time {
        None => ScaleOperation::ScaleDown,
        Some(last) => {
            let elapsed_ms = Utc::now().signed_duration_since(last).num_milliseconds();
            if elapsed_ms >= scale_down_delay.as_millis() as i64 {
                ScaleOperation::ScaleDown
            } else {
                info!(
                    queue = queue_name,
                    elapsed_seconds = elapsed_ms / 1000,
                    delay_seconds = scale_down_delay.as_secs(),
                    "scale down blocked by cooldown"
                );
                ScaleOperation::NoOp
            }
        }
    }
}

/// Parse an RFC 3339 timestamp from the status sub-resource.
pub fn parse_scale_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::too_many_arguments)]
    fn desired(
        messages: i32,
        sent_per_minute: f64,
        seconds_per_job: f64,
        target: i32,
        current: i32,
        idle: i32,
        min: i32,
        max: i32,
        max_disruption: &str,
    ) -> i32 {
        desired_workers(
            "otpsms",
            messages,
            sent_per_minute,
            seconds_per_job,
            target,
            current,
            idle,
            min,
            max,
            max_disruption,
        )
        .unwrap()
    }

    #[test]
    fn test_scale_down_when_messages_less_than_target() {
        // Small backlog: raw desired is 1, but the 10% disruption cap only
        // allows dropping 2 workers in one step.
        assert_eq!(desired(10, 10.0, 0.3, 200, 20, 0, 0, 20, "10%"), 18);
    }

    #[test]
    fn test_scale_up_when_computed_min_greater_than_max() {
        // Velocity floor of ceil(10 * 2136.6 / 60) = 357 exceeds max, which
        // pins the result to max.
        assert_eq!(desired(1, 2136.6, 10.0, 2500, 10, 0, 2, 20, "0%"), 20);
    }

    #[test]
    fn test_massive_scale_down_when_fleet_idle() {
        // Every worker idle: collapse to zero, past the disruption cap.
        assert_eq!(desired(0, 0.0, 0.0, 100, 5, 5, 0, 10, "10%"), 0);
    }

    #[test]
    fn test_cold_start_scales_to_backlog() {
        assert_eq!(desired(800, 0.0, 0.0, 200, 0, 0, 1, 10, "50%"), 4);
    }

    #[test]
    fn test_stability_band_pins_small_changes() {
        // raw desired 21 vs current 20 is a 5% change: inside the band.
        assert_eq!(desired(4100, 0.0, 0.0, 200, 20, 0, 1, 100, "100%"), 20);
        // 11 vs 20 is a 45% change: outside the band, disruption allows it.
        assert_eq!(desired(2100, 0.0, 0.0, 200, 20, 0, 1, 100, "100%"), 11);
    }

    #[test]
    fn test_stability_band_snaps_to_min_when_min_above_current() {
        // Inside the band the current count is fed to the bounding rules, so
        // a policy minimum above current lifts the result to min.
        assert_eq!(desired(4100, 0.0, 0.0, 200, 20, 0, 25, 100, "100%"), 25);
    }

    #[test]
    fn test_velocity_floor_when_no_backlog() {
        // ceil(0.5 * 240 / 60) = 2 workers to keep up with the senders.
        assert_eq!(desired(0, 240.0, 0.5, 100, 10, 0, 0, 10, "100%"), 2);
    }

    #[test]
    fn test_velocity_floor_disabled_without_processing_time() {
        // No processing time: empty queue with traffic falls through to the
        // partial scale-down branch and the plain minimum.
        assert_eq!(desired(0, 240.0, 0.0, 100, 10, 3, 1, 10, "100%"), 1);
    }

    #[test]
    fn test_partial_scale_down_respects_disruption() {
        // Not all workers idle, so the fallback branch keeps the cap.
        assert_eq!(desired(0, 0.0, 0.0, 100, 10, 4, 0, 10, "20%"), 8);
    }

    #[test]
    fn test_min_at_or_above_max_pins_to_max() {
        assert_eq!(desired(1000, 0.0, 0.0, 10, 5, 0, 10, 10, "100%"), 10);
        assert_eq!(desired(0, 0.0, 0.0, 10, 5, 5, 12, 10, "100%"), 10);
    }

    #[test]
    fn test_bounds_hold_for_every_branch() {
        let disruptions = ["0%", "10%", "50%", "100%", "1", "3"];
        for messages in [0, 1, 10, 500, 5000] {
            for current in [0, 1, 5, 20] {
                for idle in [0, current] {
                    for disruption in disruptions {
                        let got = desired(
                            messages, 30.0, 0.2, 100, current, idle, 2, 15, disruption,
                        );
                        assert!(
                            (2..=15).contains(&got),
                            "messages={} current={} idle={} disruption={} got={}",
                            messages,
                            current,
                            idle,
                            disruption,
                            got
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_disruption_cap_limits_step_size() {
        for disruption in ["0%", "10%", "25%", "2"] {
            let current = 20;
            let cap = max_disruptable_workers(disruption, current).unwrap();
            let got = desired(1, 0.0, 0.0, 100, current, 0, 0, 20, disruption);
            assert!(
                current - got <= cap,
                "disruption={} cap={} got={}",
                disruption,
                cap,
                got
            );
        }
    }

    #[test]
    fn test_parse_int_or_percent() {
        assert_eq!(parse_int_or_percent("3", 20, true).unwrap(), 3);
        assert_eq!(parse_int_or_percent("10%", 20, true).unwrap(), 2);
        assert_eq!(parse_int_or_percent("10%", 15, true).unwrap(), 2);
        assert_eq!(parse_int_or_percent("10%", 15, false).unwrap(), 1);
        assert_eq!(parse_int_or_percent("0%", 20, true).unwrap(), 0);
        assert_eq!(parse_int_or_percent("100%", 20, true).unwrap(), 20);
        assert_eq!(parse_int_or_percent("50%", 0, true).unwrap(), 0);
        assert!(parse_int_or_percent("nope", 20, true).is_err());
        assert!(parse_int_or_percent("-5", 20, true).is_err());
        assert!(parse_int_or_percent("-10%", 20, true).is_err());
    }

    #[test]
    fn test_scale_operation_classification() {
        let delay = Duration::from_secs(120);
        assert_eq!(
            scale_operation("q", 5, 5, None, delay),
            ScaleOperation::NoOp
        );
        assert_eq!(
            scale_operation("q", 8, 5, None, delay),
            ScaleOperation::ScaleUp
        );
        assert_eq!(
            scale_operation("q", 3, 5, None, delay),
            ScaleOperation::ScaleDown
        );
    }

    #[test]
    fn test_scale_down_blocked_inside_cooldown() {
        let last = Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(
            scale_operation("q", 5, 10, Some(last), Duration::from_secs(120)),
            ScaleOperation::NoOp
        );
    }

    #[test]
    fn test_scale_down_allowed_after_cooldown() {
        let last = Utc::now() - chrono::Duration::seconds(300);
        assert_eq!(
            scale_operation("q", 5, 10, Some(last), Duration::from_secs(120)),
            ScaleOperation::ScaleDown
        );
    }

    #[test]
    fn test_cooldown_never_blocks_scale_up() {
        let last = Utc::now() - chrono::Duration::seconds(1);
        assert_eq!(
            scale_operation("q", 15, 10, Some(last), Duration::from_secs(120)),
            ScaleOperation::ScaleUp
        );
    }

    #[test]
    fn test_parse_scale_time() {
        let parsed = parse_scale_time("2025-06-01T10:00:00Z").unwrap();
        assert_eq!(parsed.timestamp(), 1748772000);
        assert!(parse_scale_time("not-a-time").is_none());
    }
}
