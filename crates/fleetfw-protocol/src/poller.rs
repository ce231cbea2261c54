use std::time::Duration;

use fleetfw_domain::{
    Credentials, Host, Inventory, InventoryObservation, ProgressEvent, ProgressKind,
    TaskCompletion, TaskObservation, UpdateError,
};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::inventory::{collect_software_inventory, diff_inventories};
use crate::redfish::RedfishClient;

const INITIAL_INTERVAL: Duration = Duration::from_secs(2);
const INTERVAL_FACTOR: f64 = 1.5;
const MAX_INTERVAL: Duration = Duration::from_secs(15);
/// Consecutive fetch failures that promote the whole poll to `failed`.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

pub struct PollOptions {
    /// Overall deadline for the task. Transient fetch failures do not
    /// reset it.
    pub timeout: Duration,
    /// Inventory snapshot taken before the update was submitted; enables
    /// the before/after diff on the observation.
    pub baseline: Option<Inventory>,
}

/// Poll a Redfish task to a terminal state, streaming new task messages as
/// structured events through `on_event`.
pub async fn poll_task(
    redfish: &RedfishClient,
    host: &Host,
    creds: &Credentials,
    task_location: &str,
    options: PollOptions,
    cancel: &CancellationToken,
    on_event: &mut (dyn FnMut(ProgressEvent) + Send),
) -> Result<TaskObservation, UpdateError> {
    let deadline = Instant::now() + options.timeout;
    let mut interval = INITIAL_INTERVAL;
    let mut consecutive_failures: u32 = 0;
    let mut seen_messages: usize = 0;
    let mut last_percent: Option<u8> = None;
    let mut messages: Vec<String> = Vec::new();

    let completion = loop {
        if cancel.is_cancelled() {
            return Err(UpdateError::cancelled().with_host(&host.id));
        }

        match redfish.get_json(host, creds, task_location).await {
            Ok(task) => {
                consecutive_failures = 0;

                for message in task_messages(&task).into_iter().skip(seen_messages) {
                    on_event(ProgressEvent::now(classify_message(&message), message.clone()));
                    messages.push(message);
                    seen_messages += 1;
                }

                let percent = task["PercentComplete"].as_u64().map(|p| p.min(100) as u8);
                if percent.is_some() && percent != last_percent {
                    last_percent = percent;
                    on_event(ProgressEvent::now(
                        ProgressKind::Progress,
                        format!("task at {}%", percent.unwrap_or(0)),
                    ));
                }

                let state = task["TaskState"].as_str().unwrap_or("Running");
                match state {
                    "Completed" => {
                        let ok = task["TaskStatus"].as_str().map_or(true, |s| s == "OK");
                        break if ok {
                            TaskCompletion::Completed
                        } else {
                            TaskCompletion::Failed
                        };
                    }
                    "Exception" | "Killed" | "Cancelled" => break TaskCompletion::Failed,
                    _ => {}
                }
            }
            Err(e) if e.is_retryable() => {
                consecutive_failures += 1;
                warn!(
                    host_id = %host.id,
                    %task_location,
                    failures = consecutive_failures,
                    error = %e,
                    "task fetch failed"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    messages.push(format!(
                        "task polling gave up after {} consecutive fetch failures: {}",
                        consecutive_failures, e
                    ));
                    break TaskCompletion::Failed;
                }
            }
            // A 404 right after submission: the task resource can lag the
            // Location header. Treat like a transient fetch failure.
            Err(e) if e.kind == fleetfw_domain::ErrorKind::Protocol && e.message.contains("404") => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    messages.push(format!("task resource never appeared: {}", e));
                    break TaskCompletion::Failed;
                }
            }
            Err(e) => return Err(e),
        }

        if Instant::now() >= deadline {
            break TaskCompletion::TimedOut;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(UpdateError::cancelled().with_host(&host.id));
            }
            _ = tokio::time::sleep(interval.min(deadline - Instant::now())) => {}
        }
        interval = Duration::from_secs_f64(
            (interval.as_secs_f64() * INTERVAL_FACTOR).min(MAX_INTERVAL.as_secs_f64()),
        );
    };

    debug!(host_id = %host.id, %task_location, state = ?completion, "task poll finished");

    // Terminal: capture the post-task inventory; failures here degrade to a
    // message rather than sinking the observation.
    let inventory = match collect_software_inventory(redfish, host, creds).await {
        Ok(after) => options.baseline.map(|before| {
            let changes = diff_inventories(&before, &after);
            InventoryObservation { before, after, changes }
        }),
        Err(e) => {
            messages.push(format!("post-task inventory collection failed: {}", e));
            None
        }
    };

    Ok(TaskObservation {
        task_location: task_location.to_string(),
        state: completion,
        percent: last_percent,
        messages,
        inventory,
    })
}

fn task_messages(task: &Value) -> Vec<String> {
    task["Messages"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m["Message"].as_str().or_else(|| m.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn classify_message(message: &str) -> ProgressKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fail") {
        ProgressKind::Error
    } else if lower.contains("warn") {
        ProgressKind::Warning
    } else {
        ProgressKind::Info
    }
}
