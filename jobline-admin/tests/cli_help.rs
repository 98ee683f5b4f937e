use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

/// Exit codes per `main.rs`'s own constants: 0 success, 1 user error, 2 remote error.
const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_REMOTE_ERROR: i32 = 2;

#[test]
fn top_level_help_lists_every_subcommand() {
    let mut cmd = cargo_bin_cmd!("jobline-admin");
    cmd.arg("--help")
        .assert()
        .success()
        .code(EXIT_OK)
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("peek"))
        .stdout(predicate::str::contains("purge-dlq"));
}

#[test]
fn peek_help_documents_the_since_filter() {
    let mut cmd = cargo_bin_cmd!("jobline-admin");
    cmd.arg("peek")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--since"));
}

#[test]
fn purge_dlq_help_documents_all_and_confirm() {
    let mut cmd = cargo_bin_cmd!("jobline-admin");
    cmd.arg("purge-dlq")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--all"))
        .stdout(predicate::str::contains("--confirm"));
}

#[test]
fn purge_dlq_without_queue_or_all_is_a_user_error() {
    let mut cmd = cargo_bin_cmd!("jobline-admin");
    cmd.arg("purge-dlq").arg("--confirm").assert().failure().code(EXIT_USER_ERROR);
}

#[test]
fn purge_dlq_with_both_queue_and_all_is_a_user_error() {
    let mut cmd = cargo_bin_cmd!("jobline-admin");
    cmd.arg("purge-dlq")
        .arg("some-queue")
        .arg("--all")
        .arg("--confirm")
        .assert()
        .failure()
        .code(EXIT_USER_ERROR);
}

/// No server is started for this test; connecting to a closed local port fails fast and
/// deterministically with a transport error, which `remote_error` maps to `EXIT_REMOTE_ERROR`.
#[test]
fn stats_against_an_unreachable_server_is_a_remote_error() {
    let mut cmd = cargo_bin_cmd!("jobline-admin");
    cmd.arg("--server-url")
        .arg("http://127.0.0.1:1")
        .arg("stats")
        .assert()
        .failure()
        .code(EXIT_REMOTE_ERROR);
}
