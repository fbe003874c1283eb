/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

use std::process::Command;

/// The commit the binary is built from, logged on startup.
fn commit_hash() -> Result<String, String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .map_err(|error| format!("failed to run `git`: {error}"))?;

    if !output.status.success() {
        return Err(format!(
            "`git` failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    String::from_utf8(output.stdout)
        .map(|commit| commit.trim().to_owned())
        .map_err(|_| "`git` output was not utf-8".to_owned())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    // Builds outside a checkout only lose the commit in the startup log.
    match commit_hash() {
        Ok(commit) => println!("cargo:rustc-env=GIT_COMMIT_HASH={commit}"),
        Err(error) => println!("cargo:warning={error}"),
    }
}
