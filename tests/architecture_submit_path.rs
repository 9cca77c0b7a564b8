use std::fs;
use std::path::{Path, PathBuf};

/// Only the slice scheduler may send orders; adapters define the call.
const ALLOWED_SUBMIT_CALLERS: &[&str] = &["src/services/slice_scheduler.rs"];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// (relative path, 1-based line, trimmed text) for every source line matching `pred`
fn matching_lines(pred: impl Fn(&str) -> bool) -> Vec<(String, usize, String)> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut hits = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if pred(trimmed) {
                hits.push((rel.clone(), idx + 1, trimmed.to_string()));
            }
        }
    }
    hits
}

#[test]
fn broker_submissions_only_come_from_the_slice_scheduler() {
    let offenders: Vec<String> = matching_lines(|line| line.contains(".submit_order("))
        .into_iter()
        .filter(|(rel, _, _)| !rel.starts_with("src/adapters/"))
        .filter(|(rel, _, _)| !ALLOWED_SUBMIT_CALLERS.contains(&rel.as_str()))
        .map(|(rel, line, text)| format!("{rel}:{line}: {text}"))
        .collect();

    assert!(
        offenders.is_empty(),
        "broker submit path detected outside the slice scheduler:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn order_rows_are_only_updated_inside_the_ledger() {
    let offenders: Vec<String> = matching_lines(|line| line.contains("UPDATE orders"))
        .into_iter()
        .filter(|(rel, _, _)| rel != "src/ledger/postgres.rs")
        .map(|(rel, line, text)| format!("{rel}:{line}: {text}"))
        .collect();

    assert!(
        offenders.is_empty(),
        "raw order updates outside the ledger store:\n{}",
        offenders.join("\n")
    );
}
