use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::env;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "harmony-server";

#[derive(Deserialize)]
struct ReadyReport {
    status: String,
}

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Harmony backend")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Task {
    #[command(about = "Check formatting, run clippy with and without `metrics`, then test")]
    Ci,
    #[command(about = "Start the server with metrics and verify `/ready` and `/metrics`")]
    CiMetricsSmoke,
}

const CI: [(&str, &[&str]); 4] = [
    ("cargo", &["fmt", "--all", "--", "--check"]),
    ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
    (
        "cargo",
        &["clippy", "-p", SERVER_PACKAGE, "--features", "metrics", "--", "-D", "warnings"],
    ),
    ("cargo", &["test", "--workspace"]),
];

fn main() {
    let cli = Cli::parse();

    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .expect("workspace root");

    let ok = match cli.command {
        Task::Ci => run_commands(&workspace_root, CI),
        Task::CiMetricsSmoke => run_ci_metrics_smoke(&workspace_root),
    };

    if !ok {
        exit(1);
    }
}

fn run_ci_metrics_smoke(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        [(
            "cargo",
            &["build", "--features", "metrics", "-p", SERVER_PACKAGE],
        )],
    ) {
        return false;
    }

    let Some(port) = reserve_port() else {
        eprintln!("failed to reserve a free TCP port");
        return false;
    };
    let bind_addr = format!("127.0.0.1:{port}");

    let mut child = match spawn_server(workspace_root, &bind_addr) {
        Ok(child) => child,
        Err(err) => {
            eprintln!("failed to launch {SERVER_PACKAGE}: {err}");
            return false;
        }
    };

    let result = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => {
            let base_url = format!("http://{bind_addr}");
            if !wait_for_ready(&client, &format!("{base_url}/ready"), Duration::from_secs(30)) {
                eprintln!("server failed to report ready state within timeout");
                false
            } else {
                verify_metrics(&client, &format!("{base_url}/metrics"))
            }
        }
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            false
        }
    };

    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            eprintln!("failed to terminate server process: {err}");
        }
    }
    let _ = child.wait();

    result
}

fn spawn_server(workspace_root: &Path, bind_addr: &str) -> std::io::Result<Child> {
    Command::new("cargo")
        .args([
            "run",
            "--quiet",
            "--features",
            "metrics",
            "-p",
            SERVER_PACKAGE,
            "--",
            "--bind-addr",
            bind_addr,
            "--metrics-enabled",
            "true",
        ])
        .env("RUST_LOG", "warn")
        .current_dir(workspace_root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

/// Polls until `/ready` answers with `"status": "ready"`.
fn wait_for_ready(client: &Client, url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let ready = client
            .get(url)
            .send()
            .ok()
            .filter(|response| response.status().is_success())
            .and_then(|response| response.json::<ReadyReport>().ok())
            .is_some_and(|report| report.status == "ready");
        if ready {
            return true;
        }
        sleep(Duration::from_millis(500));
    }
    false
}

fn verify_metrics(client: &Client, url: &str) -> bool {
    const EXPECTED: [&str; 2] = [
        "harmony_http_requests_total",
        "harmony_fanout_upstream_channels",
    ];

    match client.get(url).send() {
        Ok(response) if response.status() == StatusCode::OK => match response.text() {
            Ok(body) => match EXPECTED.iter().find(|name| !body.contains(*name)) {
                None => true,
                Some(missing) => {
                    eprintln!("metrics endpoint responded without {missing}");
                    false
                }
            },
            Err(err) => {
                eprintln!("failed to read metrics body: {err}");
                false
            }
        },
        Ok(response) => {
            eprintln!("unexpected metrics response status: {}", response.status());
            false
        }
        Err(err) => {
            eprintln!("failed to call metrics endpoint: {err}");
            false
        }
    }
}

fn run_commands<const N: usize>(workspace_root: &Path, commands: [(&str, &[&str]); N]) -> bool {
    for (program, args) in commands {
        let status = Command::new(program)
            .args(args)
            .current_dir(workspace_root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command '{program} {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn '{program}': {err}");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_only_the_ci_tasks() {
        let ci = Cli::try_parse_from(["xtask", "ci"]).unwrap();
        assert_eq!(ci.command, Task::Ci);
        let smoke = Cli::try_parse_from(["xtask", "ci-metrics-smoke"]).unwrap();
        assert_eq!(smoke.command, Task::CiMetricsSmoke);
        for retired in ["fmt", "lint", "test"] {
            assert!(Cli::try_parse_from(["xtask", retired]).is_err());
        }
    }

    #[test]
    fn ci_lints_the_metrics_build() {
        assert!(CI
            .iter()
            .any(|(_, args)| args.contains(&"clippy") && args.contains(&"metrics")));
    }
}
