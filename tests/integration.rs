use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn logtab_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("logtab");
    path
}

/// One record per minute from `from` to `to` (inclusive), all on 2011-01-01.
fn minutes(from: u32, to: u32) -> String {
    let mut body = String::from("# Application Server\n");
    for m in from..=to {
        body.push_str(&format!(
            "2011-01-01 00:{:02}:00,000 INFO PrintJob:{} - job {} printed [{}@http-1]\n",
            m,
            20 + m % 3,
            m,
            m % 2
        ));
    }
    body
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Files 1 and 3 partition time; file 2 starts where file 1 ends.
    let good = root.join("logs").join("good");
    fs::create_dir_all(&good).unwrap();
    fs::write(good.join("server.log.1"), minutes(0, 10)).unwrap();
    fs::write(good.join("server.log.3"), minutes(30, 40)).unwrap();
    fs::write(good.join("server.log.4.zip"), "not a log").unwrap();

    let bad = root.join("logs").join("bad");
    fs::create_dir_all(&bad).unwrap();
    fs::write(bad.join("server.log.1"), minutes(0, 10)).unwrap();
    fs::write(bad.join("server.log.2"), minutes(10, 20)).unwrap();

    let xmlrpc = root.join("logs").join("xmlrpc");
    fs::create_dir_all(&xmlrpc).unwrap();
    fs::write(
        xmlrpc.join("server.log"),
        "2011-03-10 15:10:34,687 ERROR BaseXMLRPCServlet:110 - Error during XMLRPC request on: client-xmlrpc, IP: 10.203.0.122 [3751531@http-436]\n\
         this line is noise\n\
         2011-03-10 15:10:35,001 INFO PrintJob:22 - job queued [7@http-1]\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[store]
root = "{}/data"

[stats]
min_observations = 3
"#,
        root.display()
    );

    let config_path = config_dir.join("logtab.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_logtab(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = logtab_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run logtab binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn glob(config_path: &Path, dir: &str) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    format!("{}/logs/{}/server.log*", root.display(), dir)
}

fn data_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("data")
}

#[test]
fn test_load_non_overlapping_files() {
    let (_tmp, config_path) = setup_test_env();

    let pattern = glob(&config_path, "good");
    let (stdout, stderr, success) = run_logtab(&config_path, &["load", "good", "--glob", &pattern]);
    assert!(success, "load failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files:   2"));
    assert!(stdout.contains("records: 22"));
    assert!(stdout.contains("ok"));

    let run = data_dir(&config_path).join("good");
    assert!(run.join("logs.sqlite").exists());
    assert!(run.join("history.json").exists());
    assert!(run.join("temp").exists());
}

#[test]
fn test_load_overlapping_files_fails() {
    let (_tmp, config_path) = setup_test_env();

    let pattern = glob(&config_path, "bad");
    let (stdout, stderr, success) = run_logtab(&config_path, &["load", "bad", "--glob", &pattern]);
    assert!(!success, "overlapping load should fail: stdout={}", stdout);
    assert!(stderr.contains("overlap"), "stderr={}", stderr);
    assert!(!data_dir(&config_path).join("bad").join("logs.sqlite").exists());
}

#[test]
fn test_load_rerun_is_noop() {
    let (_tmp, config_path) = setup_test_env();
    let pattern = glob(&config_path, "good");

    let (_, _, success) = run_logtab(&config_path, &["load", "good", "--glob", &pattern]);
    assert!(success);
    let logs = data_dir(&config_path).join("good").join("logs.sqlite");
    let before = fs::read(&logs).unwrap();

    let (stdout, stderr, success) = run_logtab(&config_path, &["load", "good", "--glob", &pattern]);
    assert!(success, "rerun failed: {}", stderr);
    assert!(stdout.contains("already complete"));
    assert_eq!(fs::read(&logs).unwrap(), before);
}

#[test]
fn test_load_with_cleanup_and_cleanup_command() {
    let (_tmp, config_path) = setup_test_env();
    let pattern = glob(&config_path, "good");

    // Nothing loaded yet: cleanup refuses.
    let (_, _, success) = run_logtab(&config_path, &["cleanup", "good"]);
    assert!(!success);

    let (_, _, success) = run_logtab(
        &config_path,
        &["load", "good", "--glob", &pattern, "--cleanup"],
    );
    assert!(success);
    let run = data_dir(&config_path).join("good");
    assert!(!run.join("temp").exists());

    let (stdout, _, success) = run_logtab(&config_path, &["cleanup", "good"]);
    assert!(success);
    assert!(stdout.contains("nothing to clean up"));
}

#[test]
fn test_summary_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    let pattern = glob(&config_path, "good");
    run_logtab(&config_path, &["load", "good", "--glob", &pattern, "--extra"]);

    let (stdout, stderr, success) = run_logtab(&config_path, &["summary", "good"]);
    assert!(success, "summary failed: {}", stderr);
    assert!(stdout.contains("Records:       22"));
    assert!(stdout.contains("INFO"));
    assert!(stdout.contains("server.log.3"));
    assert!(stdout.contains("# Application Server"));

    let (stdout, stderr, success) = run_logtab(&config_path, &["stats", "good"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Message types:  3"));
    assert!(data_dir(&config_path).join("good").join("stats.sqlite").exists());
}

#[test]
fn test_stats_without_load_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_logtab(&config_path, &["stats", "missing"]);
    assert!(!success);
    assert!(stderr.contains("logtab load"));
}

#[test]
fn test_show_matches_and_no_matches() {
    let (_tmp, config_path) = setup_test_env();
    let pattern = glob(&config_path, "xmlrpc");

    let (stdout, stderr, success) = run_logtab(
        &config_path,
        &["show", &pattern, "-E", "--include", "xmlrpc"],
    );
    assert!(success, "show failed: {}", stderr);
    assert!(stdout.contains("BaseXMLRPCServlet:110 - Error during XMLRPC request"));
    assert!(stdout.contains("[3751531@http-436]"));
    assert!(!stdout.contains("job queued"));

    let (stdout, _, success) = run_logtab(&config_path, &["show", &pattern, "-D"]);
    assert!(success);
    assert!(stdout.contains("No matches found"));
}

#[test]
fn test_show_rejects_bad_timestamp() {
    let (_tmp, config_path) = setup_test_env();
    let pattern = glob(&config_path, "xmlrpc");
    let (_, stderr, success) = run_logtab(&config_path, &["show", &pattern, "--since", "yesterday"]);
    assert!(!success);
    assert!(stderr.contains("invalid timestamp"));
}

#[test]
fn test_batch_processes_bug_directories() {
    let (tmp, config_path) = setup_test_env();
    let bugs = tmp.path().join("bugs");
    fs::create_dir_all(bugs.join("ABC-123-45678")).unwrap();
    fs::write(
        bugs.join("ABC-123-45678").join("server.log"),
        minutes(0, 20),
    )
    .unwrap();

    let (stdout, stderr, success) = run_logtab(
        &config_path,
        &["batch", bugs.to_str().unwrap(), "--jobs", "2"],
    );
    assert!(success, "batch failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("ABC-123-45678.0"));

    let run = data_dir(&config_path).join("ABC-123-45678.0");
    assert!(run.join("logs.sqlite").exists());
    assert!(run.join("stats.sqlite").exists());
    assert!(!run.join("temp").exists());
}
