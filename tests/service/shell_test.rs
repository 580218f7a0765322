//! Shell transport against real processes, with `/bin/sh` standing in for `su`.

use std::path::PathBuf;
use std::time::Duration;

use hymoctl::privilege::PrivilegeTier;
use hymoctl::service::shell::{shell_escape, ShellBackend};
use hymoctl::service::{Command, ServiceBackend, ServiceError};

fn backend(engine_cli: &str) -> ShellBackend {
    ShellBackend::new(
        PathBuf::from("/bin/sh"),
        engine_cli.to_owned(),
        Duration::from_secs(5),
    )
}

#[test]
fn escape_keeps_metacharacters_inert() {
    assert_eq!(shell_escape("echo $HOME && ls"), "'echo $HOME && ls'");
    assert_eq!(shell_escape("it's"), r"'it'\''s'");
}

#[tokio::test]
async fn exit_status_and_output_become_reply() {
    let reply = match backend("echo").call(&Command::ClearRules).await {
        Ok(reply) => reply,
        Err(e) => panic!("call: {e}"),
    };
    assert_eq!(reply.status, 0);
    assert_eq!(reply.text, "rule clear");
    assert!(!reply.structured);
}

#[tokio::test]
async fn failing_cli_reports_nonzero_status() {
    let reply = match backend("false").call(&Command::FixMounts).await {
        Ok(reply) => reply,
        Err(e) => panic!("call: {e}"),
    };
    assert_ne!(reply.status, 0);
}

#[tokio::test]
async fn trailing_integer_is_extracted_for_versions() {
    // `echo 7 #` prints 7 and comments out the rest of the rendered line.
    let reply = match backend("echo 7 #").call(&Command::ServiceVersion).await {
        Ok(reply) => reply,
        Err(e) => panic!("call: {e}"),
    };
    assert_eq!(reply.value, Some(7));
}

#[tokio::test]
async fn kernel_probe_follows_engine_status() {
    let granted = match backend("true")
        .call(&Command::ProbeTier(PrivilegeTier::Kernel))
        .await
    {
        Ok(reply) => reply,
        Err(e) => panic!("probe: {e}"),
    };
    assert_eq!(granted.value, Some(i64::from(PrivilegeTier::Kernel.code())));

    let refused = match backend("false")
        .call(&Command::ProbeTier(PrivilegeTier::Kernel))
        .await
    {
        Ok(reply) => reply,
        Err(e) => panic!("probe: {e}"),
    };
    assert_eq!(refused.value, Some(-1));
}

#[tokio::test]
async fn slow_call_times_out() {
    let backend = ShellBackend::new(
        PathBuf::from("/bin/sh"),
        "sleep 5 #".to_owned(),
        Duration::from_secs(1),
    );
    match backend.call(&Command::FixMounts).await {
        Err(ServiceError::Timeout { seconds }) => assert_eq!(seconds, 1),
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_su_is_unavailable() {
    let backend = ShellBackend::new(
        PathBuf::from("/nonexistent/bin/su"),
        "hymod".to_owned(),
        Duration::from_secs(1),
    );
    match backend.call(&Command::ListRules).await {
        Err(ServiceError::Unavailable(_)) => {}
        other => panic!("expected Unavailable, got {other:?}"),
    }
}
