//! Script execution for deployment hooks.
//!
//! The ordered instruction lines of a hook are written to a temporary script
//! file and handed to the configured shell, with the deployment environment
//! injected and the version directory as the working directory. Output is
//! captured combined, the way an operator would see it in a terminal.

use depro_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

pub struct Executor {
    shell: String,
    directory: PathBuf,
    environment: HashMap<String, String>,
}

impl Executor {
    pub fn new(shell: &str, directory: PathBuf, environment: HashMap<String, String>) -> Executor {
        Executor {
            shell: shell.to_string(),
            directory,
            environment,
        }
    }

    /// Run the instructions as one script. Returns the combined output, or
    /// [`Error::Script`] carrying the output when the script exits nonzero.
    pub async fn run(&self, instructions: &[String]) -> Result<String> {
        if instructions.is_empty() {
            return Ok(String::new());
        }

        let script = self.prepare_script(instructions)?;
        debug!(
            shell = %self.shell,
            script = %script.path().display(),
            directory = %self.directory.display(),
            "Running script"
        );

        let output = Command::new(&self.shell)
            .arg(script.path())
            .current_dir(&self.directory)
            .envs(&self.environment)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(Error::Script {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }

    fn prepare_script(&self, instructions: &[String]) -> Result<tempfile::NamedTempFile> {
        let script = tempfile::Builder::new()
            .prefix("depro_")
            .suffix(self.extension())
            .tempfile()?;
        std::fs::write(script.path(), instructions.join("\n"))?;
        Ok(script)
    }

    fn extension(&self) -> &'static str {
        match self.shell.as_str() {
            "powershell" | "pwsh" => ".ps1",
            "cmd" => ".bat",
            _ => ".sh",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_in(dir: &std::path::Path, env: HashMap<String, String>) -> Executor {
        Executor::new("sh", dir.to_path_buf(), env)
    }

    #[tokio::test]
    async fn captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_in(dir.path(), HashMap::new());

        let output = executor
            .run(&["echo one".to_string(), "echo two".to_string()])
            .await
            .unwrap();
        assert_eq!(output, "one\ntwo\n");
    }

    #[tokio::test]
    async fn injects_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("VERSION".to_string(), "v42".to_string());
        let executor = executor_in(dir.path(), env);

        let output = executor
            .run(&["echo $VERSION".to_string(), "pwd".to_string()])
            .await
            .unwrap();
        assert!(output.starts_with("v42\n"));
        assert!(output.contains(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_in(dir.path(), HashMap::new());

        let err = executor
            .run(&["echo broken".to_string(), "exit 3".to_string()])
            .await
            .unwrap_err();
        match err {
            Error::Script { code, output } => {
                assert_eq!(code, 3);
                assert_eq!(output, "broken\n");
            }
            other => panic!("expected a script error, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_instructions_are_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_in(dir.path(), HashMap::new());
        assert_eq!(executor.run(&[]).await.unwrap(), "");
    }
}
