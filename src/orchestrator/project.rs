//! Project-type detection and launch commands for tool server sources.

use std::path::Path;

use crate::error::ToolError;
use crate::orchestrator::server::ProjectType;

/// Detect the project type of a server source directory.
///
/// Priority order matters: a TypeScript server also has `package.json`, and
/// a Python server may vendor a `go.mod` in a subdirectory; only the root
/// is inspected.
pub fn detect_project_type(dir: &Path) -> Result<ProjectType, ToolError> {
    if dir.join("package.json").is_file() {
        return Ok(if dir.join("tsconfig.json").is_file() {
            ProjectType::Ts
        } else {
            ProjectType::Node
        });
    }
    if dir.join("pyproject.toml").is_file() || dir.join("requirements.txt").is_file() {
        return Ok(ProjectType::Python);
    }
    if dir.join("Cargo.toml").is_file() {
        return Ok(ProjectType::Rust);
    }
    if dir.join("go.mod").is_file() {
        return Ok(ProjectType::Go);
    }
    Err(ToolError::UnknownProjectType {
        path: dir.display().to_string(),
    })
}

/// Default launch command for a project type.
///
/// The first element is the program, the rest are arguments; the process is
/// spawned with the server root as its working directory and `PORT` /
/// `WORKING_DIR` in its environment. A `launch` array in the server's
/// capability document overrides this entirely.
pub fn launch_command(
    project_type: ProjectType,
    dir: &Path,
    entry: Option<&str>,
) -> Vec<String> {
    match project_type {
        ProjectType::Python => {
            let entry = entry.unwrap_or("server.py");
            // Prefer the isolated environment created at install time.
            let venv_python = dir.join(".venv").join("bin").join("python");
            let python = if venv_python.is_file() {
                venv_python.display().to_string()
            } else {
                "python3".to_string()
            };
            vec![python, entry.to_string()]
        }
        ProjectType::Node => match entry {
            Some(entry) => vec!["node".to_string(), entry.to_string()],
            None => vec!["npm".to_string(), "start".to_string()],
        },
        ProjectType::Ts => {
            let entry = entry.unwrap_or("src/index.ts");
            vec!["npx".to_string(), "ts-node".to_string(), entry.to_string()]
        }
        // cargo/go build before running, which satisfies build-then-run
        // without guessing the output binary's name.
        ProjectType::Rust => vec![
            "cargo".to_string(),
            "run".to_string(),
            "--release".to_string(),
            "--quiet".to_string(),
        ],
        ProjectType::Go => vec!["go".to_string(), "run".to_string(), ".".to_string()],
    }
}

/// Dependency installation commands run once at install time, in order,
/// in the server root.
pub fn install_commands(project_type: ProjectType) -> Vec<Vec<String>> {
    match project_type {
        ProjectType::Python => vec![
            vec!["python3".to_string(), "-m".to_string(), "venv".to_string(), ".venv".to_string()],
            vec![
                ".venv/bin/pip".to_string(),
                "install".to_string(),
                "-r".to_string(),
                "requirements.txt".to_string(),
            ],
        ],
        ProjectType::Node | ProjectType::Ts => vec![vec![
            "npm".to_string(),
            "install".to_string(),
            "--omit=dev".to_string(),
        ]],
        // Build happens on first launch via cargo/go run.
        ProjectType::Rust | ProjectType::Go => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dir_with(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            fs::write(dir.path().join(file), "{}").unwrap();
        }
        dir
    }

    #[test]
    fn test_detect_node_vs_ts() {
        let node = dir_with(&["package.json"]);
        assert_eq!(detect_project_type(node.path()).unwrap(), ProjectType::Node);

        let ts = dir_with(&["package.json", "tsconfig.json"]);
        assert_eq!(detect_project_type(ts.path()).unwrap(), ProjectType::Ts);
    }

    #[test]
    fn test_detect_python_both_markers() {
        let pyproject = dir_with(&["pyproject.toml"]);
        assert_eq!(
            detect_project_type(pyproject.path()).unwrap(),
            ProjectType::Python
        );

        let requirements = dir_with(&["requirements.txt"]);
        assert_eq!(
            detect_project_type(requirements.path()).unwrap(),
            ProjectType::Python
        );
    }

    #[test]
    fn test_node_beats_python_in_priority() {
        let mixed = dir_with(&["package.json", "requirements.txt"]);
        assert_eq!(
            detect_project_type(mixed.path()).unwrap(),
            ProjectType::Node
        );
    }

    #[test]
    fn test_detect_rust_and_go() {
        let rust = dir_with(&["Cargo.toml"]);
        assert_eq!(detect_project_type(rust.path()).unwrap(), ProjectType::Rust);

        let go = dir_with(&["go.mod"]);
        assert_eq!(detect_project_type(go.path()).unwrap(), ProjectType::Go);
    }

    #[test]
    fn test_unknown_project_type() {
        let empty = dir_with(&[]);
        let err = detect_project_type(empty.path()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ToolError::UnknownProjectType { .. }
        ));
    }

    #[test]
    fn test_python_launch_prefers_venv() {
        let dir = dir_with(&["requirements.txt"]);
        let cmd = launch_command(ProjectType::Python, dir.path(), Some("main.py"));
        assert_eq!(cmd, vec!["python3", "main.py"]);

        fs::create_dir_all(dir.path().join(".venv/bin")).unwrap();
        fs::write(dir.path().join(".venv/bin/python"), "").unwrap();
        let cmd = launch_command(ProjectType::Python, dir.path(), Some("main.py"));
        assert!(cmd[0].ends_with(".venv/bin/python"));
    }

    #[test]
    fn test_node_launch_uses_entry_or_npm_start() {
        let dir = dir_with(&["package.json"]);
        assert_eq!(
            launch_command(ProjectType::Node, dir.path(), Some("index.js")),
            vec!["node", "index.js"]
        );
        assert_eq!(
            launch_command(ProjectType::Node, dir.path(), None),
            vec!["npm", "start"]
        );
    }
}
