//! Fixture helpers shared by the unit test modules.

use std::io::{Cursor, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Build an in-memory zip. Names ending in `/` become directories.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, body) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("add dir");
        } else {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(body.as_bytes()).expect("write entry");
        }
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("parent dirs");
    }
    std::fs::write(path, contents).expect("write fixture");
}

pub fn read_file(root: &Path, relative: &str) -> String {
    std::fs::read_to_string(root.join(relative)).expect("read fixture")
}

/// A minimal live installation at `version` with a secrets file.
pub fn installation(root: &Path, version: &str) {
    write_file(
        root,
        "manifest.json",
        &format!("{{\"name\":\"till\",\"version\":\"{version}\"}}"),
    );
    write_file(root, ".env", "DB_PASSWORD=hunter2\n");
    write_file(root, "server/app.js", "// old server\n");
}

/// Sorted relative file list and contents, for byte-identity checks.
pub fn snapshot_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .into_owned();
            let bytes = std::fs::read(entry.path()).expect("read");
            (relative, bytes)
        })
        .collect();
    files.sort();
    files
}
