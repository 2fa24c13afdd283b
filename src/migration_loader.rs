use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::migration::{Migration, ScriptMigration};

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext))
}

/// The migration name of a script: its file stem.
pub fn migration_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 收集迁移文件：路径可以是单个文件，也可以是目录（只读取目录下一层）
///
/// Missing paths are skipped with a warning. The result is sorted by migration name.
pub fn discover(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            warn!(path = %path.display(), "migration path does not exist");
            continue;
        }
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("failed to read {}", path.display()))?;
            if entry.file_type().is_file() && is_script(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort_by_key(|f| migration_name(f));
    Ok(files)
}

/// Parses one script; `.json` as JSON, anything else as YAML.
pub fn load_file(path: &Path) -> Result<ScriptMigration> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read migration {}", path.display()))?;
    let script: ScriptMigration = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("invalid migration {}", path.display()))?,
        _ => serde_yaml::from_str(&content)
            .with_context(|| format!("invalid migration {}", path.display()))?,
    };
    debug!(path = %path.display(), up = script.up.len(), down = script.down.len(), "loaded migration");
    Ok(script.named(migration_name(path)))
}

/// Discovers and parses every script under `paths`, ready for the runner.
pub fn load(paths: &[PathBuf]) -> Result<Vec<Box<dyn Migration>>> {
    discover(paths)?
        .iter()
        .map(|path| load_file(path).map(|m| Box::new(m) as Box<dyn Migration>))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("umongo-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn discovers_scripts_sorted_by_stem() {
        let dir = scratch_dir("discover");
        fs::write(dir.join("2024_02_b.yaml"), "up: []\n").unwrap();
        fs::write(dir.join("2024_01_a.json"), r#"{"up": []}"#).unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("2023_x.yml"), "up: []\n").unwrap();

        let files = discover(&[dir.clone(), dir.join("missing")]).unwrap();
        let names: Vec<String> = files.iter().map(|f| migration_name(f)).collect();
        assert_eq!(names, vec!["2024_01_a", "2024_02_b"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_named_scripts() {
        let dir = scratch_dir("load");
        let file = dir.join("2024_create_test.yaml");
        fs::write(
            &file,
            "up:\n  - op: create_collection\n    collection: test\ndown:\n  - op: result\n    value: error\n",
        )
        .unwrap();
        let script = load_file(&file).unwrap();
        assert_eq!(script.name, "2024_create_test");
        assert_eq!(script.up.len(), 1);

        let all = load(&[file]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), "2024_create_test");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn broken_script_is_an_error() {
        let dir = scratch_dir("broken");
        let file = dir.join("bad.yaml");
        fs::write(&file, "up:\n  - op: nope\n").unwrap();
        assert!(load_file(&file).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
