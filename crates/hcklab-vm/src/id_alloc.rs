//! Run-id leasing shared by independent host processes.
//!
//! The only synchronization is the `PRIMARY KEY` on `run_leases.id`: two
//! allocators that pick the same free id race on the insert and exactly one
//! wins; the loser rescans. No file lock, no daemon.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{IdRange, RigConfig};
use crate::process_group::{pid_alive, signal_group, Signal};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS run_leases (
    id          INTEGER PRIMARY KEY,
    owner_pid   INTEGER NOT NULL,
    acquired_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS run_lease_groups (
    id   INTEGER NOT NULL,
    pgid INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS run_lease_groups_id ON run_lease_groups(id);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub id: u32,
    pub owner_pid: u32,
    pub acquired_at_unix_ms: u64,
}

/// Backoff for [`IdAllocator::allocate_blocking`].
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl PollPolicy {
    pub fn from_config(cfg: &RigConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.alloc_poll_initial_ms.max(1)),
            max: Duration::from_millis(cfg.alloc_poll_max_ms.max(cfg.alloc_poll_initial_ms).max(1)),
        }
    }
}

enum Attempt {
    Allocated(u32),
    Exhausted,
    Conflict,
}

pub struct IdAllocator {
    db_path: PathBuf,
    conn: Mutex<Connection>,
    range: IdRange,
    stale_after: Duration,
    owner_pid: u32,
}

impl IdAllocator {
    pub fn open(db_path: &Path, range: IdRange, stale_after: Duration) -> Result<Self> {
        if range.lo > range.hi {
            anyhow::bail!("empty id range {}..={}", range.lo, range.hi);
        }
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lease dir: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("open lease store: {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)
            .with_context(|| format!("create lease schema: {}", db_path.display()))?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
            range,
            stale_after,
            owner_pid: std::process::id(),
        })
    }

    /// Records leases under another pid; the launcher uses its own.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn range(&self) -> IdRange {
        self.range
    }

    /// Leases the lowest free id, or returns `None` when the range is
    /// exhausted or the store is unusable.
    pub fn allocate(&self) -> Option<u32> {
        if let Err(err) = self.reclaim_stale() {
            warn!(db = %self.db_path.display(), error = format!("{err:#}"), "stale lease reclaim failed");
        }

        let span = (self.range.hi - self.range.lo) as usize + 1;
        for _ in 0..=span {
            match self.try_allocate_once() {
                Ok(Attempt::Allocated(id)) => {
                    info!(id, owner_pid = self.owner_pid, "run id leased");
                    return Some(id);
                }
                Ok(Attempt::Exhausted) => {
                    debug!(lo = self.range.lo, hi = self.range.hi, "run id range exhausted");
                    return None;
                }
                Ok(Attempt::Conflict) => {
                    debug!("lost run id race; rescanning");
                    continue;
                }
                Err(err) => {
                    warn!(db = %self.db_path.display(), error = format!("{err:#}"), "run id allocation failed");
                    return None;
                }
            }
        }
        None
    }

    /// Polls [`IdAllocator::allocate`] with exponential backoff until an id
    /// frees up or `cx` is cancelled.
    pub fn allocate_blocking(&self, cx: &CancelToken, poll: PollPolicy) -> Result<u32> {
        let mut delay = poll.initial;
        loop {
            cx.checkpoint()?;
            if let Some(id) = self.allocate() {
                return Ok(id);
            }
            info!(retry_in_ms = delay.as_millis() as u64, "no free run id; waiting");
            cx.sleep(delay)?;
            delay = (delay * 2).min(poll.max);
        }
    }

    fn try_allocate_once(&self) -> Result<Attempt> {
        let conn = self.lock_conn();
        let taken: BTreeSet<u32> = {
            let mut stmt = conn.prepare("SELECT id FROM run_leases")?;
            let ids = stmt.query_map([], |row| row.get::<_, u32>(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        };

        let Some(id) = (self.range.lo..=self.range.hi).find(|id| !taken.contains(id)) else {
            return Ok(Attempt::Exhausted);
        };

        let res = conn.execute(
            "INSERT INTO run_leases (id, owner_pid, acquired_at) VALUES (?1, ?2, ?3)",
            params![id, self.owner_pid, now_unix_ms() as i64],
        );
        match res {
            Ok(_) => Ok(Attempt::Allocated(id)),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(Attempt::Conflict)
            }
            Err(e) => Err(e).with_context(|| format!("insert lease {id}")),
        }
    }

    /// Drops the lease on `id`. Releasing an id nobody holds is fine.
    pub fn release(&self, id: u32) {
        let conn = self.lock_conn();
        let res = (|| -> rusqlite::Result<usize> {
            conn.execute("DELETE FROM run_lease_groups WHERE id = ?1", params![id])?;
            conn.execute("DELETE FROM run_leases WHERE id = ?1", params![id])
        })();
        match res {
            Ok(0) => debug!(id, "release of unleased run id ignored"),
            Ok(_) => info!(id, "run id released"),
            Err(err) => warn!(id, error = %err, "run id release failed"),
        }
    }

    /// Records a process group started under `id` so a later reclaim can
    /// kill it if this process dies without releasing.
    pub fn attach_group(&self, id: u32, pgid: i32) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO run_lease_groups (id, pgid) VALUES (?1, ?2)",
            params![id, pgid],
        )
        .with_context(|| format!("record process group {pgid} for run id {id}"))?;
        Ok(())
    }

    pub fn leases(&self) -> Result<Vec<Lease>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT id, owner_pid, acquired_at FROM run_leases ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Lease {
                id: row.get(0)?,
                owner_pid: row.get(1)?,
                acquired_at_unix_ms: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn lease(&self, id: u32) -> Result<Option<Lease>> {
        let conn = self.lock_conn();
        let lease = conn
            .query_row(
                "SELECT id, owner_pid, acquired_at FROM run_leases WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Lease {
                        id: row.get(0)?,
                        owner_pid: row.get(1)?,
                        acquired_at_unix_ms: row.get::<_, i64>(2)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }

    /// Deletes leases older than the staleness threshold whose owner is
    /// dead and kills the process groups recorded under them. Returns how
    /// many leases were reclaimed.
    pub fn reclaim_stale(&self) -> Result<usize> {
        let cutoff = now_unix_ms().saturating_sub(self.stale_after.as_millis() as u64);
        let candidates: Vec<Lease> = self
            .leases()?
            .into_iter()
            .filter(|l| l.acquired_at_unix_ms <= cutoff && !pid_alive(l.owner_pid))
            .collect();

        let mut reclaimed = 0;
        for lease in candidates {
            if self.reclaim_one(&lease, cutoff)? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Deletes `lease` if its row is still the one the scan saw, then kills
    /// the groups that were recorded under it. Groups are read and deleted
    /// in the same transaction as the lease row, so a lease taken over by
    /// another allocator since the scan keeps both its row and its groups.
    fn reclaim_one(&self, lease: &Lease, cutoff: u64) -> Result<bool> {
        let groups = {
            let mut conn = self.lock_conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let n = tx.execute(
                "DELETE FROM run_leases WHERE id = ?1 AND owner_pid = ?2 AND acquired_at <= ?3",
                params![lease.id, lease.owner_pid, cutoff as i64],
            )?;
            if n == 0 {
                debug!(id = lease.id, "stale lease changed hands before reclaim");
                return Ok(false);
            }
            let groups = select_groups(&tx, lease.id)?;
            tx.execute("DELETE FROM run_lease_groups WHERE id = ?1", params![lease.id])?;
            tx.commit()
                .with_context(|| format!("commit reclaim of run id {}", lease.id))?;
            groups
        };

        info!(id = lease.id, owner_pid = lease.owner_pid, "reclaimed stale lease");
        kill_groups_of(lease.id, &groups);
        Ok(true)
    }

    /// SIGKILLs every process group recorded under `id`, leaving the lease
    /// itself in place. Returns how many groups still existed.
    pub fn kill_groups(&self, id: u32) -> Result<usize> {
        let groups = select_groups(&self.lock_conn(), id)?;
        Ok(kill_groups_of(id, &groups))
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn select_groups(conn: &Connection, id: u32) -> rusqlite::Result<Vec<i32>> {
    let mut stmt = conn.prepare("SELECT pgid FROM run_lease_groups WHERE id = ?1")?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, i32>(0))?;
    rows.collect()
}

fn kill_groups_of(id: u32, groups: &[i32]) -> usize {
    let mut killed = 0;
    for &pgid in groups {
        match signal_group(pgid, Signal::Kill) {
            Ok(true) => {
                info!(id, pgid, "killed process group of run id");
                killed += 1;
            }
            Ok(false) => {}
            Err(err) => warn!(id, pgid, error = %err, "kill recorded process group failed"),
        }
    }
    killed
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    fn allocator(dir: &Path, lo: u32, hi: u32) -> IdAllocator {
        IdAllocator::open(
            &dir.join("leases.sqlite"),
            IdRange { lo, hi },
            Duration::from_secs(300),
        )
        .expect("open allocator")
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn exhaust_then_reuse_released_id() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path(), 1, 3);

        let got: HashSet<u32> = (0..3).filter_map(|_| a.allocate()).collect();
        assert_eq!(got, HashSet::from([1, 2, 3]));
        assert_eq!(a.allocate(), None);

        a.release(2);
        assert_eq!(a.allocate(), Some(2));
    }

    #[test]
    fn release_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path(), 1, 2);
        a.release(1);
        let id = a.allocate().unwrap();
        a.release(id);
        a.release(id);
        assert!(a.leases().unwrap().is_empty());
    }

    #[test]
    fn separate_allocators_share_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path(), 5, 6);
        let b = allocator(tmp.path(), 5, 6);
        assert_eq!(a.allocate(), Some(5));
        assert_eq!(b.allocate(), Some(6));
        assert_eq!(b.allocate(), None);
        a.release(5);
        assert_eq!(b.allocate(), Some(5));
    }

    #[test]
    fn concurrent_allocators_never_share_an_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_path_buf();
        let _init = allocator(&path, 1, 4);

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let live: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                let live = Arc::clone(&live);
                std::thread::spawn(move || {
                    let a = allocator(&path, 1, 4);
                    barrier.wait();
                    for _ in 0..20 {
                        if let Some(id) = a.allocate() {
                            assert!(live.lock().unwrap().insert(id), "id {id} handed out twice");
                            std::thread::yield_now();
                            assert!(live.lock().unwrap().remove(&id));
                            a.release(id);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("worker panicked");
        }
        assert!(live.lock().unwrap().is_empty());
    }

    #[test]
    fn stale_lease_of_dead_owner_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("leases.sqlite");
        let ghost = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::ZERO)
            .unwrap()
            .with_owner_pid(dead_pid());
        assert_eq!(ghost.allocate(), Some(1));

        let live = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::ZERO).unwrap();
        assert_eq!(live.allocate(), Some(1));
        assert_eq!(live.lease(1).unwrap().unwrap().owner_pid, std::process::id());
    }

    #[test]
    fn lease_of_live_owner_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("leases.sqlite");
        let a = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::ZERO).unwrap();
        assert_eq!(a.allocate(), Some(1));
        assert_eq!(a.reclaim_stale().unwrap(), 0);
        assert_eq!(a.allocate(), None);
    }

    #[test]
    fn young_lease_of_dead_owner_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("leases.sqlite");
        let ghost = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::from_secs(3600))
            .unwrap()
            .with_owner_pid(dead_pid());
        assert_eq!(ghost.allocate(), Some(1));
        assert_eq!(ghost.reclaim_stale().unwrap(), 0);
        assert_eq!(ghost.leases().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn reclaim_kills_recorded_process_group() {
        use crate::process_group::ProcessGroup;

        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("leases.sqlite");
        let ghost = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::ZERO)
            .unwrap()
            .with_owner_pid(dead_pid());
        let id = ghost.allocate().unwrap();

        let pg = ProcessGroup::spawn().unwrap();
        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("30");
        pg.attach(&mut cmd);
        let mut member = cmd.spawn().unwrap();
        ghost.attach_group(id, pg.pgid()).unwrap();

        assert_eq!(ghost.reclaim_stale().unwrap(), 1);
        let status = member.wait().unwrap();
        assert!(!status.success());
        assert!(ghost.leases().unwrap().is_empty());
    }

    #[cfg(unix)]
    fn sleeper_group() -> (crate::process_group::ProcessGroup, std::process::Child) {
        let pg = crate::process_group::ProcessGroup::spawn().unwrap();
        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("30");
        pg.attach(&mut cmd);
        let member = cmd.spawn().unwrap();
        (pg, member)
    }

    #[cfg(unix)]
    #[test]
    fn reclaim_spares_a_lease_taken_over_since_the_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("leases.sqlite");
        let ghost = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::ZERO)
            .unwrap()
            .with_owner_pid(dead_pid());
        let id = ghost.allocate().unwrap();
        let seen = ghost.lease(id).unwrap().unwrap();
        let cutoff = now_unix_ms();

        // Another allocator reclaims the id, takes it, and starts a VM group.
        let other = IdAllocator::open(&db, IdRange { lo: 1, hi: 1 }, Duration::ZERO).unwrap();
        assert_eq!(other.allocate(), Some(id));
        let (pg, mut member) = sleeper_group();
        other.attach_group(id, pg.pgid()).unwrap();

        assert!(!ghost.reclaim_one(&seen, cutoff).unwrap());
        assert_eq!(member.try_wait().unwrap(), None, "live vm group was killed");
        assert_eq!(other.lease(id).unwrap().unwrap().owner_pid, std::process::id());
        assert_eq!(select_groups(&other.lock_conn(), id).unwrap(), [pg.pgid()]);

        drop(pg);
        let _ = member.wait();
    }

    #[cfg(unix)]
    #[test]
    fn kill_groups_leaves_the_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path(), 1, 1);
        let id = a.allocate().unwrap();
        let (pg, mut member) = sleeper_group();
        a.attach_group(id, pg.pgid()).unwrap();

        assert_eq!(a.kill_groups(id).unwrap(), 1);
        assert!(!member.wait().unwrap().success());
        assert!(a.lease(id).unwrap().is_some());
    }

    #[test]
    fn failed_reclaim_does_not_block_allocation() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("leases.sqlite");
        let ghost = IdAllocator::open(&db, IdRange { lo: 1, hi: 2 }, Duration::ZERO)
            .unwrap()
            .with_owner_pid(dead_pid());
        assert_eq!(ghost.allocate(), Some(1));

        let a = IdAllocator::open(&db, IdRange { lo: 1, hi: 2 }, Duration::ZERO).unwrap();
        a.lock_conn().execute_batch("DROP TABLE run_lease_groups").unwrap();
        assert!(a.reclaim_stale().is_err());
        assert_eq!(a.allocate(), Some(2));
    }

    #[test]
    fn allocate_blocking_observes_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path(), 1, 1);
        a.allocate().unwrap();

        let cx = CancelToken::new();
        let canceller = cx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let err = a
            .allocate_blocking(
                &cx,
                PollPolicy {
                    initial: Duration::from_millis(10),
                    max: Duration::from_millis(20),
                },
            )
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
    }
}
