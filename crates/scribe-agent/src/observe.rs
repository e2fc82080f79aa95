use chrono::Utc;
use scribe_core::{Result, runtime_dir};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only file log for the agent core. Warnings also go to stderr;
/// per-turn milestones only reach the file unless verbose mode is on.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path, verbose: bool) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("agent.log"),
            verbose,
        })
    }

    /// Log a turn milestone to the file, and to stderr when verbose.
    pub fn info_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[scribe] {msg}");
        }
        let _ = self.append_log_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a warning — always written to the log file and stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[scribe WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_log_lines_to_runtime_dir() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(workspace.path(), false).expect("observer");
        observer.info_log("turn started");
        observer.warn_log("summary refresh failed");
        let log = fs::read_to_string(runtime_dir(workspace.path()).join("agent.log"))
            .expect("log file");
        assert!(log.contains("INFO turn started"));
        assert!(log.contains("WARN summary refresh failed"));
    }

    #[test]
    fn verbose_mode_still_appends_to_the_file() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(workspace.path(), true).expect("observer");
        observer.info_log("verbose milestone");
        let log = fs::read_to_string(runtime_dir(workspace.path()).join("agent.log"))
            .expect("log file");
        assert!(log.contains("INFO verbose milestone"));
    }
}
