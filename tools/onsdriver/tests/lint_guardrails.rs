use std::fs;
use std::path::{Path, PathBuf};

fn collect_rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => panic!("read {}: {err}", dir.display()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Source up to the first `#[cfg(test)]` item.
fn non_test_source(source: &str) -> &str {
    match source.find("#[cfg(test)]") {
        Some(idx) => &source[..idx],
        None => source,
    }
}

#[test]
fn manifest_keeps_unwrap_and_expect_lints() {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let manifest = fs::read_to_string(manifest_dir.join("Cargo.toml"))
        .unwrap_or_else(|e| panic!("package manifest must be readable: {e}"));
    assert!(manifest.contains("[lints.clippy]"));
    assert!(manifest.contains("unwrap_used = \"warn\""));
    assert!(manifest.contains("expect_used = \"warn\""));

    let workspace = manifest_dir
        .parent()
        .and_then(Path::parent)
        .unwrap_or_else(|| panic!("workspace root should be two levels up"));
    let workspace_manifest = fs::read_to_string(workspace.join("Cargo.toml"))
        .unwrap_or_else(|e| panic!("workspace manifest must be readable: {e}"));
    assert!(workspace_manifest.contains("unwrap_used = \"deny\""));
}

#[test]
fn library_code_never_unwraps() {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut files = Vec::new();
    collect_rust_files(&src_root, &mut files);
    files.sort();
    assert!(!files.is_empty());

    let offenders = files
        .iter()
        .filter_map(|file| {
            let source = fs::read_to_string(file)
                .unwrap_or_else(|e| panic!("read {}: {e}", file.display()));
            let hits = non_test_source(&source)
                .lines()
                .enumerate()
                .filter(|(_, line)| line.contains(".unwrap()"))
                .map(|(idx, _)| format!("{}:{}", file.display(), idx + 1))
                .collect::<Vec<_>>();
            (!hits.is_empty()).then_some(hits)
        })
        .flatten()
        .collect::<Vec<_>>();

    assert!(offenders.is_empty(), "unwrap() in library code: {offenders:?}");
}

#[test]
fn side_effecting_modules_emit_run_log_events() {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    for module in [
        "session.rs",
        "readiness.rs",
        "rpc.rs",
        "shutdown.rs",
        "exit.rs",
        "harness.rs",
    ] {
        let source = fs::read_to_string(src_root.join(module))
            .unwrap_or_else(|e| panic!("read {module}: {e}"));
        assert!(
            non_test_source(&source).contains("append_run_log("),
            "{module} performs side effects without run-log events"
        );
    }
}
