use std::process::Command;

const VERSION: &str = "0.2.0";

/// The installed `proto-gen` version, if any.
fn installed_version() -> Option<String> {
    let output = Command::new("proto-gen").arg("-V").output().ok()?;
    if !output.status.success() {
        return None;
    }

    let version = String::from_utf8(output.stdout).ok()?;
    version
        .strip_prefix("proto-gen ")
        .map(|version| version.trim().to_owned())
}

fn install() {
    match installed_version() {
        Some(version) if version == VERSION => return,
        Some(version) => println!("proto-gen {version} is installed, {VERSION} is required"),
        None => println!("proto-gen not installed (or not in PATH)"),
    }

    let status = Command::new("cargo")
        .args(["install", "--locked", "--version", VERSION, "proto-gen"])
        .status()
        .expect("cargo not installed");
    if !status.success() {
        panic!("failed to install proto-gen {VERSION} via cargo");
    }
}

/// Regenerates `src/generated` from `proto/sdk.proto`, or checks the checked
/// in code is up to date when `which` is `validate`.
fn execute(which: &str) {
    let status = Command::new("proto-gen")
        .arg("--format")
        .arg("--build-server")
        .arg("--build-client")
        .arg("--generate-transport")
        .arg(which)
        .args(["-o", "src/generated"])
        .args(["-d", "proto"])
        .args(["-f", "proto/sdk.proto"])
        .status()
        .expect("proto-gen was not installed");

    if !status.success() {
        panic!("proto-gen {which} failed");
    }
}

fn main() {
    let subcmd = std::env::args()
        .nth(1)
        .expect("expected a subcommand to execute");

    if !matches!(subcmd.as_str(), "generate" | "validate") {
        panic!("unexpected subcommmand '{subcmd}', expected 'generate' or 'validate'");
    }

    install();
    execute(&subcmd);
}
