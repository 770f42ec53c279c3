use sandbox::{build_from_value, Activation};
use serde_json::json;
use std::os::unix::process::CommandExt;
use std::process::Command;

fn run_confined(activation: Activation, script: &str) -> std::io::Result<std::process::Output> {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(script);
    unsafe {
        command.pre_exec(move || activation.activate().map_err(std::io::Error::from));
    }
    command.output()
}

#[test]
fn given_open_file_limit_when_child_runs_then_limit_is_visible() {
    let activation = build_from_value(Some(&json!({"limits": {"num_open_files": 64}}))).unwrap();

    let output = run_confined(activation, "ulimit -n").unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "64");
}

#[test]
fn given_noop_activation_when_child_runs_then_it_is_unaffected() {
    let output = run_confined(Activation::noop(), "echo ok").unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ok");
}

#[test]
fn given_unknown_limit_when_building_then_no_activation_is_produced() {
    let result = build_from_value(Some(&json!({"limits": {"gpu_hours": 1}})));
    assert!(result.is_err());
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn given_empty_whitelist_when_child_execs_then_workload_never_succeeds() {
    let activation = build_from_value(Some(&json!({
        "seccomp": {"mode": "whitelist", "filter_items": []}
    })))
    .unwrap();

    // execve itself is rejected, so the child dies before the script runs
    match run_confined(activation, "echo escaped") {
        Ok(output) => {
            assert!(!output.status.success());
            assert!(output.stdout.is_empty());
        }
        Err(_) => {}
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn given_blacklisted_syscall_when_child_uses_it_then_only_that_call_fails() {
    let activation = build_from_value(Some(&json!({
        "seccomp": {
            "mode": "blacklist",
            "filter_items": [{"syscall": "mkdirat"}, {"syscall": "mkdir"}],
            "termination_exit_code": 13
        }
    })))
    .unwrap();
    let dir = std::env::temp_dir().join(format!("sandbox-spec-{}", std::process::id()));

    let output = run_confined(
        activation,
        &format!("mkdir {} || echo denied", dir.display()),
    )
    .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "denied");
    assert!(!dir.exists());
}
