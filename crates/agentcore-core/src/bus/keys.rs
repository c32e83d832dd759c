//! Key layout of the stream bus.

/// Common prefix of every per-run key and channel.
pub fn run_key_prefix(run_id: &str) -> String {
    format!("agent_run:{}:", run_id)
}

pub fn responses_key(run_id: &str) -> String {
    format!("agent_run:{}:responses", run_id)
}

pub fn control_key(run_id: &str) -> String {
    format!("agent_run:{}:control", run_id)
}

pub fn instance_control_key(run_id: &str, instance_id: &str) -> String {
    format!("agent_run:{}:control:{}", run_id, instance_id)
}

pub fn ended_key(run_id: &str) -> String {
    format!("agent_run:{}:ended", run_id)
}

pub fn active_run_key(instance_id: &str, run_id: &str) -> String {
    format!("active_run:{}:{}", instance_id, run_id)
}

pub const ACTIVE_RUN_PREFIX: &str = "active_run:";

/// Instance id of a liveness key that belongs to `run_id`.
pub fn instance_of_active_key<'a>(key: &'a str, run_id: &str) -> Option<&'a str> {
    key.strip_prefix(ACTIVE_RUN_PREFIX)?
        .strip_suffix(run_id)?
        .strip_suffix(':')
        .filter(|instance| !instance.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_of_active_key() {
        let key = active_run_key("worker-1", "run-9");
        assert_eq!(key, "active_run:worker-1:run-9");
        assert_eq!(instance_of_active_key(&key, "run-9"), Some("worker-1"));
        assert_eq!(instance_of_active_key(&key, "run-8"), None);
        assert_eq!(instance_of_active_key("active_run::run-9", "run-9"), None);
    }
}
