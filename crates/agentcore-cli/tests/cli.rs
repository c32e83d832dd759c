use assert_cmd::Command;
use predicates::str::{contains, starts_with};
use tempfile::TempDir;

fn agentcore(dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("agentcore"));
    cmd.env("AGENTCORE_DB_PATH", dir.path().join("agentcore.db"))
        .env("AGENTCORE_CONFIG", dir.path().join("config.toml"))
        .env_remove("AGENTCORE_LLM_API_KEY")
        .env_remove("OPENAI_API_KEY");
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("agentcore"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("AgentCore"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("agentcore"));
    cmd.arg("--version").assert().success();
}

#[test]
fn test_cli_completions() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("agentcore"));
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(starts_with("_agentcore"));
}

#[test]
fn test_credits_grant_and_balance() {
    let dir = TempDir::new().unwrap();
    agentcore(&dir)
        .args(["credits", "grant", "acct", "5"])
        .assert()
        .success()
        .stdout(contains("balance $5.00"));
    agentcore(&dir)
        .args(["credits", "grant", "acct", "-0.25", "--type", "adjustment"])
        .assert()
        .success();
    agentcore(&dir)
        .args(["credits", "balance", "acct"])
        .assert()
        .success()
        .stdout(contains("$4.75"));
    agentcore(&dir)
        .args(["--format", "json", "credits", "history", "acct"])
        .assert()
        .success()
        .stdout(contains("\"entry_type\": \"adjustment\""));
}

#[test]
fn test_credits_grant_rejects_usage_type() {
    let dir = TempDir::new().unwrap();
    agentcore(&dir)
        .args(["credits", "grant", "acct", "1", "--type", "usage"])
        .assert()
        .failure();
}

#[test]
fn test_schedule_add_list_pause() {
    let dir = TempDir::new().unwrap();
    let output = agentcore(&dir)
        .args([
            "--format", "json", "schedule", "add", "--account", "acct", "--agent", "digest",
            "--every", "weekly", "--at", "09:30", "--days", "mon,wed", "--prompt", "Summarize",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let task: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let id = task["id"].as_str().unwrap().to_string();
    assert_eq!(task["schedule"]["days_of_week"], serde_json::json!([1, 3]));

    agentcore(&dir)
        .args(["--format", "json", "schedule", "list", "--account", "acct"])
        .assert()
        .success()
        .stdout(contains(id.as_str()));
    agentcore(&dir)
        .args(["--format", "json", "schedule", "pause", &id])
        .assert()
        .success()
        .stdout(contains("\"is_active\": false"));
}

#[test]
fn test_schedule_add_rejects_invalid_weekday() {
    let dir = TempDir::new().unwrap();
    agentcore(&dir)
        .args([
            "schedule", "add", "--account", "acct", "--agent", "digest", "--every", "weekly",
            "--at", "09:30", "--days", "8",
        ])
        .assert()
        .failure();
}

#[test]
fn test_run_requires_llm_key() {
    let dir = TempDir::new().unwrap();
    agentcore(&dir)
        .args(["run", "hello"])
        .assert()
        .failure()
        .stderr(contains("No LLM API key"));
}

#[test]
fn test_stop_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    agentcore(&dir)
        .args(["stop", "missing-run"])
        .assert()
        .failure()
        .stderr(contains("Agent run not found"));
}
