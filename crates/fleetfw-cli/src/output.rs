use fleetfw_domain::{ErrorKind, HostRun, ProtocolHealth, RunState, UpdateError};
use fleetfw_protocol::Detection;

/// Exit codes for the CLI wrappers: 0 success, 2 validation, 3 auth,
/// 4 no-compatible-firmware, 5 cancelled, 1 anything else.
pub fn exit_code_for_error(error: &UpdateError) -> i32 {
    match error.kind {
        ErrorKind::Validation if error.message.contains("no compatible firmware") => 4,
        ErrorKind::Validation => 2,
        ErrorKind::Auth => 3,
        ErrorKind::Cancelled => 5,
        _ => 1,
    }
}

/// Worst exit code across a plan's runs; 0 when every run is DONE.
pub fn exit_code_for_runs(runs: &[HostRun]) -> i32 {
    let mut worst = 0;
    for run in runs {
        if run.state == RunState::Done {
            continue;
        }
        let code = run
            .ctx
            .error
            .as_ref()
            .map(exit_code_for_error)
            .unwrap_or(1);
        // Prefer the most specific non-zero code.
        worst = match (worst, code) {
            (0, c) => c,
            (w, c) if c > w => c,
            (w, _) => w,
        };
    }
    worst
}

pub fn print_runs(runs: &[HostRun]) {
    println!(
        "{:<38} {:<18} {:<12} {:>8}  {}",
        "RUN", "HOST", "STATE", "ATTEMPT", "DETAIL"
    );
    for run in runs {
        let detail = match &run.ctx.error {
            Some(e) => format!("{} ({})", e.message, e.class),
            None => run
                .ctx
                .progress
                .last()
                .map(|p| p.message.clone())
                .unwrap_or_default(),
        };
        println!(
            "{:<38} {:<18} {:<12} {:>8}  {}",
            run.id,
            run.host_id,
            run.state.to_string(),
            run.ctx.attempt,
            detail
        );
    }
}

pub fn print_detection(detection: &Detection, health: &[ProtocolHealth]) {
    println!("healthiest: {}", detection.healthiest);
    println!("{:<10} {:<10} {:>10}  {}", "PROTOCOL", "STATUS", "LATENCY", "DETAIL");
    for h in health {
        println!(
            "{:<10} {:<10} {:>8}ms  {}",
            h.protocol.to_string(),
            format!("{:?}", h.status).to_lowercase(),
            h.latency_ms,
            h.details.as_deref().unwrap_or("")
        );
    }
    for candidate in &detection.candidates {
        if let Some(cap) = detection.capabilities.get(&candidate.protocol) {
            let modes: Vec<String> = cap.update_modes.iter().map(|m| m.to_string()).collect();
            println!(
                "{}: generation={} firmware={} modes=[{}]",
                candidate.protocol,
                cap.generation.map(|g| g.to_string()).unwrap_or_else(|| "?".into()),
                cap.firmware_version.as_deref().unwrap_or("?"),
                modes.join(", ")
            );
        }
    }
}
