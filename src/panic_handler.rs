//! Panic hook that leaves a crash report behind.
//!
//! An alarm daemon that dies silently is the worst failure mode, so every
//! panic is written to stderr and appended to `crash.log` in the data
//! directory before the process goes down.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};

/// Install the crash-reporting panic hook. Call first thing in `main`.
pub fn install() {
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    panic::set_hook(Box::new(|info| {
        handle_panic(info);
    }));
}

fn crash_report_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "reveille", "reveille")
        .map(|dirs| dirs.data_dir().join("crash.log"))
}

fn handle_panic(info: &PanicHookInfo) {
    let report = format_crash_report(
        &panic_message(info),
        &info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string()),
    );

    eprintln!("{}", report);

    if let Some(path) = crash_report_path() {
        if append_report(&path, &report).is_ok() {
            eprintln!("\nCrash report appended to: {}", path.display());
        }
    }
}

fn panic_message(info: &PanicHookInfo) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Append one report to the crash log, keeping earlier reports.
fn append_report(path: &Path, report: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(b"\n\n========================================\n\n")?;
    file.write_all(report.as_bytes())?;
    file.flush()
}

fn format_crash_report(message: &str, location: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::force_capture();

    format!(
        r"
================================================================================
REVEILLE CRASH REPORT
================================================================================
Time:     {}
Thread:   {} ({:?})
Location: {}
Message:  {}

Backtrace:
{}
================================================================================

The alarm daemon stopped unexpectedly. Alarms will not ring until it is
started again with `reveille start`. An alarm that was ringing is restored
on the next start.
",
        timestamp,
        thread_name,
        thread.id(),
        location,
        message,
        backtrace,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_crash_report_contents() {
        let report = format_crash_report("lock poisoned", "src/engine/gate.rs:10:5");
        assert!(report.contains("REVEILLE CRASH REPORT"));
        assert!(report.contains("Message:  lock poisoned"));
        assert!(report.contains("Location: src/engine/gate.rs:10:5"));
        assert!(report.contains("reveille start"));
    }

    #[test]
    fn test_append_report_keeps_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("crash.log");

        append_report(&path, "first").unwrap();
        append_report(&path, "second").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
        assert!(contents.find("first") < contents.find("second"));
    }
}
