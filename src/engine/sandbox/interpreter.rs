use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;

use crate::engine::config::InterpreterConfig;

/// Builds the interpreter invocation: configured args first, then every
/// source path, with the workspace as cwd and stdin closed.
pub fn build_command(config: &InterpreterConfig, work_dir: &Path, sources: &[PathBuf]) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    cmd.args(sources);
    cmd.current_dir(work_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    // Own process group so a timeout can take down anything the
    // interpreter forks.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}
