use std::process::Command;

fn main() {
    let mut sha = "None".to_string();
    if let Ok(output) = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
    {
        if output.status.success() {
            if let Ok(rev) = String::from_utf8(output.stdout) {
                sha = format!("Some(\"{}\")", rev.trim());
            }
        }
    }

    let out = std::env::var("OUT_DIR").unwrap();
    std::fs::write(format!("{out}/sha"), sha.as_bytes()).unwrap();

    // Avoid rebuilding everything when any file changes
    println!("cargo:rerun-if-changed=build.rs");
}
