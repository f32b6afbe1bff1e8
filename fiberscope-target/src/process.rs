//! プロセス制御機能

use crate::Result;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// スレッドID
pub type ThreadId = i32;

/// アタッチ中に新しいスレッドを探し直す回数の上限
const MAX_ATTACH_ROUNDS: usize = 16;

/// アタッチ済みで停止しているデバッグ対象プロセス
///
/// スレッドグループの全スレッドを停止させます（all-stop）。
/// ドロップ時に全スレッドからデタッチします。デタッチするとプロセスは実行を再開するので、
/// それまでにレジスタを元に戻しておく必要があります。
pub struct Process {
    pid: Pid,
    /// 停止させたスレッド（リーダーを含む）
    threads: Vec<ThreadId>,
}

impl Process {
    /// 既存のプロセスにアタッチし、全スレッドが停止するまで待機する
    pub fn attach(pid: i32) -> Result<Self> {
        let leader = Pid::from_raw(pid);
        ptrace::attach(leader)
            .map_err(|e| anyhow::anyhow!("Failed to attach to process {}: {}", leader, e))?;

        if let Err(e) = wait_stopped(leader) {
            let _ = ptrace::detach(leader, None);
            return Err(e);
        }

        let mut process = Self {
            pid: leader,
            threads: vec![pid],
        };

        // アタッチしている間にスレッドが増えることがあるので、新しいものがなくなるまで繰り返す
        for _ in 0..MAX_ATTACH_ROUNDS {
            let known: BTreeSet<ThreadId> = process.threads.iter().copied().collect();
            let fresh: Vec<ThreadId> = list_threads(pid)?
                .into_iter()
                .filter(|tid| !known.contains(tid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for tid in fresh {
                if process.attach_thread(tid)? {
                    process.threads.push(tid);
                }
            }
        }

        debug!(
            "process {} stopped ({} threads)",
            process.pid,
            process.threads.len()
        );
        Ok(process)
    }

    /// リーダー以外のスレッドを停止させる（終了済みならfalse）
    fn attach_thread(&self, tid: ThreadId) -> Result<bool> {
        let thread = Pid::from_raw(tid);
        match ptrace::attach(thread) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("thread {} exited before attach", tid);
                return Ok(false);
            }
            Err(e) => {
                return Err(anyhow::anyhow!("Failed to attach to thread {}: {}", tid, e));
            }
        }

        match wait_stopped(thread) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("thread {} did not stop: {}", tid, e);
                let _ = ptrace::detach(thread, None);
                Ok(false)
            }
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// 停止させたスレッドのIDを取得する
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        for &tid in &self.threads {
            if let Err(e) = ptrace::detach(Pid::from_raw(tid), None) {
                warn!("Failed to detach from thread {}: {}", tid, e);
            }
        }
    }
}

/// アタッチ直後のSIGSTOPによる停止を待つ
fn wait_stopped(tid: Pid) -> Result<()> {
    match waitpid(tid, Some(WaitPidFlag::__WALL))? {
        WaitStatus::Stopped(_, signal) => {
            debug!("thread {} stopped with {:?}", tid, signal);
            Ok(())
        }
        status => Err(anyhow::anyhow!(
            "Unexpected wait status after attach: {:?}",
            status
        )),
    }
}

/// `/proc/<pid>/task` からスレッドIDの一覧を得る
pub fn list_threads(pid: i32) -> Result<Vec<ThreadId>> {
    let dir = format!("/proc/{}/task", pid);
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", dir, e))?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc, Barrier};

    #[test]
    fn test_list_threads_includes_spawned_thread() {
        let pid = std::process::id() as i32;
        let barrier = Arc::new(Barrier::new(2));
        let (tx, rx) = mpsc::channel();

        let worker = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                tx.send(nix::unistd::gettid().as_raw()).unwrap();
                barrier.wait();
            })
        };

        let tid = rx.recv().unwrap();
        let tids = list_threads(pid).unwrap();
        barrier.wait();
        worker.join().unwrap();

        assert!(tids.contains(&pid));
        assert!(tids.contains(&tid));
        assert!(tids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_list_threads_of_missing_process() {
        assert!(list_threads(i32::MAX).is_err());
    }
}
