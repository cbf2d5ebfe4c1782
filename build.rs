//! Stamps the `tunnlr` binary with GIT_HASH, GIT_TAG and BUILD_TIME for `--version`.

use std::process::Command;

/// Trimmed stdout of a successful git command; `None` outside a checkout or on empty output
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // Source tarballs have no history; fall back to the crate version
    let tag = git(&["describe", "--tags", "--abbrev=0"])
        .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")));
    let hash = git(&["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".into());

    for (key, value) in [
        ("GIT_TAG", tag),
        ("GIT_HASH", hash),
        ("BUILD_TIME", chrono::Utc::now().to_rfc3339()),
    ] {
        println!("cargo:rustc-env={}={}", key, value);
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/tags");
}
