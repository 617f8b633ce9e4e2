//! Lock-set coordination: acquiring every lockfile of a set, atomically.
//!
//! One [`acquire`] call owns one reservation per lockfile and drives the
//! acquisition state machine:
//!
//! 1. Each tick, count how many reservations are first in their line.
//! 2. When all of them are, confirm with a short advisory hold on every
//!    lockfile; success is HELD, a partial hold pass is rolled back.
//! 3. When some but not all are confirmed for too many consecutive ticks,
//!    the set is probably interleaved with a peer holding the complement;
//!    every reservation goes to the back of every line so one of the two
//!    callers can get through.
//!
//! A background refresher re-stamps every spot record so the line survives
//! long waits. Losing a record during acquisition re-queues that one
//! reservation; losing one while HELD means a peer may already consider our
//! spot abandoned, so the whole set is treated as lost and cancellation is
//! tripped.

use crate::cancel::CancelFlag;
use crate::config::Tuning;
use crate::error::{Result, TurnstileError};
use crate::flock::ExclusiveHold;
use crate::reservation::Reservation;
use crate::spot::SpotScanner;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared between the acquisition loop and the refresher thread.
#[derive(Debug)]
struct Shared {
    reservations: Mutex<Vec<Reservation>>,
    held: AtomicBool,
    stop_refresher: AtomicBool,
    cancel: CancelFlag,
    tuning: Tuning,
}

impl Shared {
    fn lock_reservations(&self) -> MutexGuard<'_, Vec<Reservation>> {
        self.reservations
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Block until every lockfile in `paths` is exclusively held.
///
/// Duplicate paths (after canonicalization) are collapsed. Returns the HELD
/// handle, [`TurnstileError::Cancelled`] when `cancel` trips first, or a
/// fatal error when a lock directory disappears.
pub fn acquire(paths: &[PathBuf], tuning: Tuning, cancel: CancelFlag) -> Result<AcquiredLocks> {
    tuning.validate()?;

    if paths.is_empty() {
        return Err(TurnstileError::Usage(
            "at least one lockfile is required".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    let mut lockfiles = Vec::new();
    for path in paths {
        let canonical = SpotScanner::new(path)?.lockfile().to_path_buf();
        if seen.insert(canonical.clone()) {
            lockfiles.push(canonical);
        }
    }

    // The holds double as lockfile creation: every target exists before the
    // first spot is written.
    let mut holds = Vec::with_capacity(lockfiles.len());
    let mut reservations = Vec::with_capacity(lockfiles.len());
    for lockfile in &lockfiles {
        holds.push(ExclusiveHold::open(lockfile)?);
        reservations.push(Reservation::new(lockfile, &tuning, &cancel)?);
    }

    let shared = Arc::new(Shared {
        reservations: Mutex::new(reservations),
        held: AtomicBool::new(false),
        stop_refresher: AtomicBool::new(false),
        cancel: cancel.clone(),
        tuning: tuning.clone(),
    });

    let refresher = spawn_refresher(Arc::clone(&shared))?;

    let mut stalled: u32 = 0;
    let outcome = loop {
        if cancel.is_cancelled() {
            break Err(TurnstileError::Cancelled);
        }

        match tick(&shared, &mut holds, &mut stalled) {
            Ok(true) => {
                shared.held.store(true, Ordering::SeqCst);
                break Ok(());
            }
            Ok(false) => {}
            Err(e) => break Err(e),
        }

        thread::sleep(tuning.acquire_tick());
    };

    match outcome {
        Ok(()) => {
            tracing::debug!(count = lockfiles.len(), "all lockfiles held");
            Ok(AcquiredLocks {
                shared,
                holds,
                refresher: Some(refresher),
                released: false,
            })
        }
        Err(e) => {
            shared.stop_refresher.store(true, Ordering::SeqCst);
            let _ = refresher.join();
            shared.lock_reservations().clear();
            drop(holds);
            Err(e)
        }
    }
}

/// One pass of the acquisition loop. Returns `Ok(true)` once every hold is
/// taken.
fn tick(shared: &Shared, holds: &mut [ExclusiveHold], stalled: &mut u32) -> Result<bool> {
    let tuning = &shared.tuning;
    let mut reservations = shared.lock_reservations();

    for reservation in reservations.iter_mut() {
        if reservation.needs_reacquire() {
            tracing::debug!(
                lockfile = %reservation.lockfile().display(),
                "spot was lost, taking a new place in line"
            );
            reservation.reacquire(tuning, &shared.cancel)?;
        }
    }

    let mut first = 0usize;
    for reservation in reservations.iter_mut() {
        if reservation.is_first(tuning.spot_lifetime_secs)? {
            first += 1;
        }
    }

    let mut acquired_all = false;
    if first == reservations.len() {
        acquired_all = true;
        for hold in holds.iter_mut() {
            if !hold.try_hold(tuning.hold_timeout()) {
                acquired_all = false;
                break;
            }
        }

        if !acquired_all {
            // Never sit on a partial set of advisory locks.
            for hold in holds.iter_mut() {
                hold.release();
            }
        }
    }

    if acquired_all {
        return Ok(true);
    }

    if first > 0 {
        *stalled += 1;

        // Progress on some lines but not all of them for this long means a
        // peer with an overlapping set is probably stuck the same way.
        // Everybody out; fresh spots break the cycle.
        if *stalled > tuning.stall_threshold {
            tracing::debug!(
                stalled_ticks = *stalled,
                "partial acquisition stalled, re-queueing every reservation"
            );
            *stalled = 0;
            for reservation in reservations.iter_mut() {
                reservation.reacquire(tuning, &shared.cancel)?;
            }
        }
    }

    Ok(false)
}

/// Keep every spot record fresh until told to stop.
fn spawn_refresher(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("turnstile-refresh".to_string())
        .spawn(move || {
            let step = Duration::from_millis(25);

            loop {
                let mut slept = Duration::ZERO;
                while slept < shared.tuning.refresh_interval() {
                    if shared.stop_refresher.load(Ordering::SeqCst)
                        || shared.cancel.is_cancelled()
                    {
                        return;
                    }
                    thread::sleep(step);
                    slept += step;
                }

                let mut reservations = shared.lock_reservations();
                for reservation in reservations.iter_mut() {
                    if reservation.needs_reacquire() {
                        continue;
                    }

                    if let Err(e) = reservation.refresh() {
                        if shared.held.load(Ordering::SeqCst) {
                            tracing::warn!(
                                lockfile = %reservation.lockfile().display(),
                                error = %e,
                                "spot refresh failed while holding locks, releasing"
                            );
                            shared.cancel.cancel();
                            return;
                        }

                        tracing::debug!(
                            lockfile = %reservation.lockfile().display(),
                            error = %e,
                            "spot refresh failed, queueing reacquire"
                        );
                        reservation.mark_lost();
                    }
                }
            }
        })
        .map_err(|e| TurnstileError::Runtime(format!("failed to spawn refresher thread: {}", e)))
}

/// The HELD state: every lockfile of the set is exclusively owned.
///
/// Dropping the handle releases everything; [`AcquiredLocks::release`] does
/// the same eagerly and is safe to call more than once.
#[derive(Debug)]
pub struct AcquiredLocks {
    shared: Arc<Shared>,
    holds: Vec<ExclusiveHold>,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl AcquiredLocks {
    /// Release every hold and spot record. Each step is best-effort and
    /// independent; whatever a crash leaves behind is reclaimed by peers via
    /// expiry.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.shared.stop_refresher.store(true, Ordering::SeqCst);
        if let Some(refresher) = self.refresher.take() {
            let _ = refresher.join();
        }

        for hold in &mut self.holds {
            hold.release();
        }

        self.shared.lock_reservations().clear();
        tracing::debug!("released all lockfiles");
    }
}

impl Drop for AcquiredLocks {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::{SpotRecord, now_secs};
    use crate::test_support::{foreign_spot, lock_dir, spot_indices};
    use serial_test::serial;
    use std::time::Instant;

    fn acquire_one(lockfile: &std::path::Path, tuning: &Tuning) -> Result<AcquiredLocks> {
        acquire(
            &[lockfile.to_path_buf()],
            tuning.clone(),
            CancelFlag::new(),
        )
    }

    /// Assert that every tag in `log` forms one unbroken run.
    fn assert_unbroken_runs(log: &[char], expected: &[(char, usize)]) {
        let mut runs: Vec<(char, usize)> = Vec::new();
        for &c in log {
            match runs.last_mut() {
                Some((tag, count)) if *tag == c => *count += 1,
                _ => runs.push((c, 1)),
            }
        }

        assert_eq!(
            runs.len(),
            expected.len(),
            "interleaved writes detected: {:?}",
            runs
        );
        for (tag, count) in expected {
            assert!(
                runs.contains(&(*tag, *count)),
                "missing unbroken run of {}x'{}' in {:?}",
                count,
                tag,
                runs
            );
        }
    }

    #[test]
    fn uncontested_acquire_holds_and_releases() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();

        let mut held = acquire_one(&lockfile, &tuning).unwrap();
        assert!(lockfile.exists());
        assert_eq!(spot_indices(&lockfile), vec![0]);

        held.release();
        assert!(spot_indices(&lockfile).is_empty());

        // A fresh caller gets straight through.
        let _again = acquire_one(&lockfile, &tuning).unwrap();
    }

    #[test]
    fn release_is_idempotent() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();

        let mut held = acquire_one(&lockfile, &tuning).unwrap();
        held.release();
        held.release();
        assert!(spot_indices(&lockfile).is_empty());
    }

    #[test]
    fn duplicate_paths_collapse() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();

        let held = acquire(
            &[lockfile.clone(), lockfile.clone()],
            tuning.clone(),
            CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(spot_indices(&lockfile), vec![0]);
        drop(held);
    }

    #[test]
    fn empty_set_is_a_usage_error() {
        let result = acquire(&[], Tuning::fast(), CancelFlag::new());
        assert!(matches!(result, Err(TurnstileError::Usage(_))));
    }

    #[test]
    fn missing_directory_is_fatal() {
        let result = acquire(
            &[PathBuf::from("/definitely/not/here/test.lock")],
            Tuning::fast(),
            CancelFlag::new(),
        );
        assert!(matches!(result, Err(TurnstileError::LockDir { .. })));
    }

    #[test]
    fn stale_foreign_spot_is_reclaimed() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();

        foreign_spot(&lockfile, 0, now_secs() - tuning.spot_lifetime_secs - 10);

        let _held = acquire_one(&lockfile, &tuning).unwrap();
        assert_eq!(spot_indices(&lockfile).len(), 1);
    }

    #[test]
    fn cancellation_aborts_and_cleans_up() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();

        // A live foreign first-in-line keeps us waiting.
        foreign_spot(&lockfile, 0, now_secs());

        let cancel = CancelFlag::new();
        let cancel_remote = cancel.clone();
        let path = lockfile.clone();
        let tuning_remote = tuning.clone();

        let waiter = std::thread::spawn(move || {
            acquire(&[path], tuning_remote, cancel_remote)
        });

        std::thread::sleep(Duration::from_millis(100));
        cancel.cancel();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(TurnstileError::Cancelled)));

        // Only the foreign record survives.
        assert_eq!(spot_indices(&lockfile), vec![0]);
    }

    #[test]
    #[serial]
    fn crashed_holder_is_recovered_after_expiry() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning {
            spot_lifetime_secs: 1,
            ..Tuning::fast()
        };

        // A "crashed" peer: first in line, never refreshes, never releases.
        foreign_spot(&lockfile, 0, now_secs());

        let started = Instant::now();
        let _held = acquire_one(&lockfile, &tuning).unwrap();

        // Recovery happens after expiry, not before.
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn refresher_keeps_spots_alive_past_their_lifetime() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning {
            spot_lifetime_secs: 1,
            ..Tuning::fast()
        };

        let _held = acquire_one(&lockfile, &tuning).unwrap();

        std::thread::sleep(Duration::from_millis(2500));

        // Well past the lifetime, the record is still there and fresh.
        let path = lockfile.with_file_name("test.lock.0");
        let record = SpotRecord::read(&path).unwrap();
        assert!(!record.is_expired(tuning.spot_lifetime_secs, now_secs()));
    }

    #[test]
    #[serial]
    fn losing_the_spot_while_held_trips_cancellation() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();
        let cancel = CancelFlag::new();

        let _held = acquire(&[lockfile.clone()], tuning.clone(), cancel.clone()).unwrap();

        // A hostile neighbor reaps our record.
        std::fs::remove_file(lockfile.with_file_name("test.lock.0")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !cancel.is_cancelled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(cancel.is_cancelled());
    }

    #[test]
    #[serial]
    fn serializes_appenders_on_one_lockfile() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();
        let log = Arc::new(Mutex::new(Vec::<char>::new()));

        let workers: Vec<_> = ['A', 'b', 'Z']
            .into_iter()
            .map(|tag| {
                let lockfile = lockfile.clone();
                let tuning = tuning.clone();
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    let mut held =
                        acquire(&[lockfile], tuning, CancelFlag::new()).unwrap();
                    for _ in 0..100 {
                        log.lock().unwrap().push(tag);
                        std::thread::sleep(Duration::from_micros(200));
                    }
                    held.release();
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 300);
        assert_unbroken_runs(&log, &[('A', 100), ('b', 100), ('Z', 100)]);
    }

    #[test]
    #[serial]
    fn overlapping_sets_block_until_superset_releases() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock = |name: &str| tmp.path().join(name);
        let (a, b, c, d) = (lock("a.lock"), lock("b.lock"), lock("c.lock"), lock("d.lock"));
        let tuning = Tuning::fast();
        let log = Arc::new(Mutex::new(Vec::<char>::new()));

        let mut blocker = acquire(
            &[a.clone(), b.clone(), c.clone(), d.clone()],
            tuning.clone(),
            CancelFlag::new(),
        )
        .unwrap();

        let sets: Vec<(char, Vec<PathBuf>)> = vec![
            ('X', vec![a.clone(), b.clone(), c.clone()]),
            ('Y', vec![b.clone(), c.clone()]),
            ('Z', vec![b.clone(), d.clone()]),
            ('W', vec![a.clone(), b.clone(), c.clone(), d.clone()]),
        ];

        let workers: Vec<_> = sets
            .into_iter()
            .map(|(tag, paths)| {
                let tuning = tuning.clone();
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    let mut held = acquire(&paths, tuning, CancelFlag::new()).unwrap();
                    for _ in 0..10 {
                        log.lock().unwrap().push(tag);
                    }
                    held.release();
                })
            })
            .collect();

        // Everybody shares lockfile b with the blocker: no output yet.
        std::thread::sleep(Duration::from_millis(300));
        assert!(log.lock().unwrap().is_empty());

        blocker.release();
        for worker in workers {
            worker.join().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 40);
        assert_unbroken_runs(
            &log,
            &[('X', 10), ('Y', 10), ('Z', 10), ('W', 10)],
        );
    }

    #[test]
    #[serial]
    fn reversed_lock_orders_do_not_deadlock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a.lock");
        let b = tmp.path().join("b.lock");
        let tuning = Tuning::fast();
        let counter = Arc::new(Mutex::new(0u32));

        let workers: Vec<_> = [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]]
            .into_iter()
            .map(|paths| {
                let tuning = tuning.clone();
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        let mut held =
                            acquire(&paths, tuning.clone(), CancelFlag::new()).unwrap();
                        *counter.lock().unwrap() += 1;
                        held.release();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(*counter.lock().unwrap(), 6);
    }

    #[test]
    #[serial]
    fn survives_a_deletion_adversary() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let tuning = Tuning::fast();

        let stop = Arc::new(AtomicBool::new(false));
        let adversary = {
            let stop = Arc::clone(&stop);
            let dir = lockfile.parent().unwrap().to_path_buf();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Ok(entries) = std::fs::read_dir(&dir) {
                        for entry in entries.flatten() {
                            let name = entry.file_name();
                            if name.to_string_lossy().starts_with("test.lock") {
                                let _ = std::fs::remove_file(entry.path());
                            }
                        }
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        // The caller fights the adversary for a while, then wins once the
        // churn stops.
        let waiter = {
            let lockfile = lockfile.clone();
            let tuning = tuning.clone();
            std::thread::spawn(move || acquire_one(&lockfile, &tuning))
        };

        std::thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::SeqCst);
        adversary.join().unwrap();

        let held = waiter.join().unwrap().unwrap();
        drop(held);
    }
}
