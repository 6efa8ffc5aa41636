//! Process enumeration for locating the game executable.
//!
//! Each platform lists running processes its own way; the results are
//! normalized to [`ProcessInfo`] and matched against the configured executable
//! name by file stem, ignoring case, directories and extension.

use crate::types::Pid;
use std::io;
use tracing::trace;

/// A running process as seen by the platform process list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Executable name or path as reported by the platform
    pub executable: String,
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::fs;

    /// Walk `/proc`, reading the first argument of each command line.
    ///
    /// `comm` is truncated to 15 bytes, which would miss long game names.
    pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();

        for entry in fs::read_dir("/proc")? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };

            let pid: Pid = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };

            // Processes can exit between listing and reading
            let cmdline = match fs::read(entry.path().join("cmdline")) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };

            let executable = cmdline
                .split(|b| *b == 0)
                .next()
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .unwrap_or_default();

            if executable.is_empty() {
                continue;
            }

            processes.push(ProcessInfo { pid, executable });
        }

        Ok(processes)
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::process::Command;

    pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
        let output = Command::new("tasklist").args(["/FO", "CSV", "/NH"]).output()?;

        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("tasklist exited with {}", output.status),
            ));
        }

        Ok(parse_tasklist_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::*;
    use std::process::Command;

    pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
        let output = Command::new("ps").args(["-A", "-o", "pid=,comm="]).output()?;

        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }

        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::*;

    pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process enumeration is not supported on this platform",
        ))
    }
}

/// List all processes currently running.
///
/// Blocking; callers on the async runtime should go through `spawn_blocking`.
pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
    let processes = platform::list_processes()?;
    trace!("Enumerated {} processes", processes.len());
    Ok(processes)
}

/// Processes whose executable matches `target`, in enumeration order
pub fn find_by_executable<'a>(
    processes: &'a [ProcessInfo],
    target: &str,
) -> impl Iterator<Item = &'a ProcessInfo> + 'a {
    let target = executable_stem(target);
    processes
        .iter()
        .filter(move |p| executable_stem(&p.executable) == target)
}

/// Normalize an executable name or path to its lowercase file stem.
///
/// Both separators are honored so Windows paths reported under Wine or
/// Proton match on Unix hosts too.
pub fn executable_stem(name: &str) -> String {
    let file = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
        .trim();

    let stem = match file.rfind('.') {
        Some(idx) if idx > 0 => &file[..idx],
        _ => file,
    };

    stem.to_lowercase()
}

/// Parse `ps -A -o pid=,comm=` output
pub fn parse_ps_output(text: &str) -> Vec<ProcessInfo> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, executable) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let executable = executable.trim();
            if executable.is_empty() {
                return None;
            }
            Some(ProcessInfo {
                pid,
                executable: executable.to_string(),
            })
        })
        .collect()
}

/// Parse `tasklist /FO CSV /NH` output (`"image","pid",...`)
pub fn parse_tasklist_output(text: &str) -> Vec<ProcessInfo> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split("\",\"");
            let image = fields.next()?.trim().trim_start_matches('"');
            let pid = fields.next()?.trim_matches('"').parse().ok()?;
            if image.is_empty() {
                return None;
            }
            Some(ProcessInfo {
                pid,
                executable: image.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_stem() {
        assert_eq!(executable_stem("HellbladeGame-Win64-Shipping"), "hellbladegame-win64-shipping");
        assert_eq!(executable_stem("HellbladeGame-Win64-Shipping.exe"), "hellbladegame-win64-shipping");
        assert_eq!(
            executable_stem(r"Z:\Games\Hellblade\HellbladeGame-Win64-Shipping.exe"),
            "hellbladegame-win64-shipping"
        );
        assert_eq!(executable_stem("/usr/bin/game.bin"), "game");
        assert_eq!(executable_stem(".hidden"), ".hidden");
    }

    #[test]
    fn test_find_by_executable_keeps_order() {
        let processes = vec![
            ProcessInfo { pid: 10, executable: "/bin/bash".into() },
            ProcessInfo { pid: 20, executable: r"C:\Game\Game.exe".into() },
            ProcessInfo { pid: 30, executable: "game".into() },
        ];

        let pids: Vec<_> = find_by_executable(&processes, "Game.exe").map(|p| p.pid).collect();
        assert_eq!(pids, vec![20, 30]);
    }

    #[test]
    fn test_parse_ps_output() {
        let text = "    1 /sbin/launchd\n  412 /Applications/Game.app/Contents/MacOS/Game Helper\nbogus\n";
        let processes = parse_ps_output(text);

        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0], ProcessInfo { pid: 1, executable: "/sbin/launchd".into() });
        assert_eq!(processes[1].pid, 412);
        assert!(processes[1].executable.ends_with("Game Helper"));
    }

    #[test]
    fn test_parse_tasklist_output() {
        let text = "\"System Idle Process\",\"0\",\"Services\",\"0\",\"8 K\"\r\n\
                    \"HellbladeGame-Win64-Shipping.exe\",\"4242\",\"Console\",\"1\",\"2,100,000 K\"\r\n";
        let processes = parse_tasklist_output(text);

        assert_eq!(processes.len(), 2);
        assert_eq!(processes[1].pid, 4242);
        assert_eq!(processes[1].executable, "HellbladeGame-Win64-Shipping.exe");
    }

    #[test]
    fn test_list_processes_includes_self() {
        let processes = match list_processes() {
            Ok(p) => p,
            // Sandboxed environments may forbid enumeration
            Err(_) => return,
        };
        let own = std::process::id();
        assert!(processes.iter().any(|p| p.pid == own));
    }
}
