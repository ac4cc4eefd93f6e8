//! Supervisor: spawns the database commit process and the worker pool as
//! separate OS processes via self-re-exec, publishes the worker-pid set
//! for the DCP to discover, and waits for the DCP to exit.

use crate::config::Config;
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PID_FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(59);
const PID_FILE_LOCK_POLL: Duration = Duration::from_millis(20);

/// Role a re-exec'd child process should take on, passed via an internal
/// CLI flag rather than an environment variable so `ps` output stays
/// legible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Supervisor,
    Dcp,
    Worker,
}

fn pid_file_dir() -> PathBuf {
    std::env::temp_dir()
}

fn pid_file_path() -> PathBuf {
    pid_file_dir().join("DatabaseCommitProcess_pids")
}

fn pid_lock_path() -> PathBuf {
    pid_file_dir().join("DatabaseCommitProcess_pids.lock")
}

/// Remove a pid-file/lock pair left behind by a process that did not shut
/// down cleanly. Mirrors [`crate::shm::cleanup_stale_segments`]: both
/// cleanups run once, at supervisor startup, before anything is spawned.
pub fn clean_stale_pid_file() {
    for path in [pid_file_path(), pid_lock_path()] {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale pid file");
            }
        }
    }
}

/// Publish the worker pid set under an exclusive lock so the DCP can read a
/// consistent view regardless of spawn ordering.
fn publish_worker_pids(pids: &[u32]) -> anyhow::Result<()> {
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(pid_lock_path())?;

    let deadline = Instant::now() + PID_FILE_LOCK_TIMEOUT;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => break,
            Err(_) if Instant::now() < deadline => std::thread::sleep(PID_FILE_LOCK_POLL),
            Err(_) => anyhow::bail!("timed out acquiring worker pid-file lock"),
        }
    }

    let body = pids.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("\n");
    let result = std::fs::write(pid_file_path(), body);
    let _ = FileExt::unlock(&lock_file);
    result?;
    Ok(())
}

/// Block until the worker pid file exists and contains exactly
/// `expected_count` entries, or time out. Used by the DCP, which does not
/// itself spawn the workers.
pub fn read_worker_pids(expected_count: usize, timeout: Duration) -> anyhow::Result<Vec<u32>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(mut f) = OpenOptions::new().read(true).open(pid_file_path()) {
            let mut body = String::new();
            if f.read_to_string(&mut body).is_ok() {
                let pids: Vec<u32> = body
                    .lines()
                    .filter_map(|l| l.trim().parse().ok())
                    .collect();
                if pids.len() == expected_count {
                    return Ok(pids);
                }
            }
        }
        if Instant::now() > deadline {
            anyhow::bail!("timed out waiting for worker pid publication");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Re-exec the current binary with `--role <role>` plus the original
/// config flags, the Rust analogue of the original's
/// `multiprocessing.Process` child spawn.
fn respawn(role: Role, config: &Config) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    let role_str = match role {
        Role::Supervisor => "supervisor",
        Role::Dcp => "dcp",
        Role::Worker => "worker",
    };
    let mut command = Command::new(exe);
    command
        .arg("--role")
        .arg(role_str)
        .arg("--data-dir")
        .arg(&config.data_dir)
        .arg("--host")
        .arg(&config.host)
        .arg("--port")
        .arg(config.port.to_string())
        .arg("--model")
        .arg(&config.default_model)
        .arg("--db-type")
        .arg(match config.db_type {
            crate::config::DbType::Sqlite => "sqlite",
            crate::config::DbType::Leveldb => "leveldb",
        })
        .arg("--workers")
        .arg(config.workers.to_string());
    for origin in &config.cors_origins {
        command.arg("--cors-origin").arg(origin);
    }
    command.spawn()
}

pub struct Supervisor {
    dcp: Child,
    workers: Vec<Child>,
}

impl Supervisor {
    /// Spawn the DCP first, then the worker pool, publish the worker pid
    /// set, and return a handle that can wait for the DCP to exit.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        clean_stale_pid_file();

        let dcp = respawn(Role::Dcp, config)?;
        info!(pid = dcp.id(), "database commit process spawned");

        let mut workers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            workers.push(respawn(Role::Worker, config)?);
        }
        let pids: Vec<u32> = workers.iter().map(|c| c.id()).collect();
        info!(?pids, "worker pool spawned");

        publish_worker_pids(&pids)?;

        Ok(Self { dcp, workers })
    }

    /// Block until the DCP exits, then terminate any still-running workers.
    pub fn wait(mut self) -> anyhow::Result<()> {
        let status = self.dcp.wait()?;
        info!(?status, "database commit process exited");

        for worker in &mut self.workers {
            if let Ok(None) = worker.try_wait() {
                let _ = worker.kill();
                let _ = worker.wait();
            }
        }

        clean_stale_pid_file();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_read_roundtrip() {
        // Exercises the file format only; uses the real temp-dir paths, so
        // run serially with other tests touching the same fixed filename.
        let pids = vec![111, 222, 333];
        publish_worker_pids(&pids).unwrap();
        let read_back = read_worker_pids(3, Duration::from_secs(1)).unwrap();
        assert_eq!(read_back, pids);
        clean_stale_pid_file();
    }

    #[test]
    fn read_times_out_when_count_never_matches() {
        clean_stale_pid_file();
        let err = read_worker_pids(7, Duration::from_millis(50));
        assert!(err.is_err());
    }
}
