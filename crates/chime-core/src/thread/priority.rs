//! Real-time scheduling for audio threads
//!
//! Each playback or capture loop promotes itself once at startup.
//! Failure is expected on unprivileged processes (SCHED_FIFO needs
//! CAP_SYS_NICE) and is harmless: the loop still runs, just at normal
//! priority.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    Elevated,
    Refused,
    Unsupported,
}

pub fn promote_current_thread() -> PriorityResult {
    let result = platform_promote();
    match result {
        PriorityResult::Elevated => log::info!("audio thread running with real-time priority"),
        PriorityResult::Refused => {
            log::debug!("real-time priority refused, continuing at normal priority")
        }
        PriorityResult::Unsupported => {}
    }
    result
}

#[cfg(target_os = "linux")]
fn platform_promote() -> PriorityResult {
    use libc::{sched_param, sched_setscheduler, SCHED_FIFO, SCHED_RR};

    // Leave headroom below kernel threads
    let mut param = sched_param { sched_priority: 75 };
    if unsafe { sched_setscheduler(0, SCHED_FIFO, &param) } == 0 {
        return PriorityResult::Elevated;
    }
    param.sched_priority = 65;
    if unsafe { sched_setscheduler(0, SCHED_RR, &param) } == 0 {
        return PriorityResult::Elevated;
    }
    PriorityResult::Refused
}

#[cfg(not(target_os = "linux"))]
fn platform_promote() -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_never_panics() {
        // Either outcome is fine; the call must just come back
        let _ = promote_current_thread();
    }
}
