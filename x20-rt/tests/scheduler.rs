//! End-to-end scheduler/synchronization scenarios: chained join,
//! self-join, double-join, deadlock-chain detection, and a contended
//! mutex counter.

use std::cell::RefCell;
use std::rc::Rc;

use x20_rt::{scheduler, sync::Mutex, JoinError};

/// Chained join: three threads join in a chain (1 joins 2, 2 joins 3),
/// and the main thread joins 1; every join must return success exactly
/// once.
#[test]
fn chained_join_succeeds_in_order() {
    scheduler::init();
    let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));

    let log3 = log.clone();
    let t3 = scheduler::thread_create(move || log3.borrow_mut().push("t3"));

    let log2 = log.clone();
    let t2 = scheduler::thread_create(move || {
        log2.borrow_mut().push("t2-start");
        assert_eq!(scheduler::thread_join(t3), Ok(()));
        log2.borrow_mut().push("t2-end");
    });

    let log1 = log.clone();
    let t1 = scheduler::thread_create(move || {
        log1.borrow_mut().push("t1-start");
        assert_eq!(scheduler::thread_join(t2), Ok(()));
        log1.borrow_mut().push("t1-end");
    });

    assert_eq!(scheduler::thread_join(t1), Ok(()));
    assert_eq!(
        *log.borrow(),
        vec!["t2-start", "t1-start", "t3", "t2-end", "t1-end"]
    );
    scheduler::thread_cleanup();
}

#[test]
fn join_unknown_tid_returns_not_found() {
    scheduler::init();
    assert_eq!(scheduler::thread_join(9999), Err(JoinError::NotFound));
    scheduler::thread_cleanup();
}

#[test]
fn self_join_returns_self_join_error() {
    scheduler::init();
    let result = Rc::new(RefCell::new(None));
    let result_clone = result.clone();
    let t = scheduler::thread_create(move || {
        let self_tid = scheduler::thread_self();
        *result_clone.borrow_mut() = Some(scheduler::thread_join(self_tid));
    });
    scheduler::thread_join(t).unwrap();
    assert_eq!(*result.borrow(), Some(Err(JoinError::SelfJoin)));
    scheduler::thread_cleanup();
}

#[test]
fn joining_an_already_observed_thread_fails_without_suspending() {
    scheduler::init();
    // t holds long enough for two observers to race to join it.
    let t = scheduler::thread_create(|| {
        scheduler::thread_yield();
    });
    let second_result = Rc::new(RefCell::new(None));
    let second_result_clone = second_result.clone();
    let observer = scheduler::thread_create(move || {
        *second_result_clone.borrow_mut() = Some(scheduler::thread_join(t));
    });
    assert_eq!(scheduler::thread_join(t), Ok(()));
    scheduler::thread_join(observer).unwrap();
    assert_eq!(
        *second_result.borrow(),
        Some(Err(JoinError::AlreadyObserved))
    );
    scheduler::thread_cleanup();
}

/// Mutual-join deadlock: two threads that each try to join the other
/// must have the cycle detected and rejected for whichever side closes
/// it, rather than wedging the scheduler.
///
/// `t_b` registers its join on `t_a` first (so `t_a.observer == t_b`);
/// `t_a` yields once on purpose to guarantee that happens before it
/// attempts to join `t_b` in turn, which would close a 2-cycle through
/// the observer chain (`t_a -> t_b -> t_a`) and must be rejected rather
/// than suspend. `t_a` then runs to completion normally, which wakes
/// `t_b` out of its (legitimate, non-cyclic) wait.
#[test]
fn mutual_join_is_detected_as_deadlock_not_fatal() {
    scheduler::init();
    let outcome_a = Rc::new(RefCell::new(None));
    let outcome_b = Rc::new(RefCell::new(None));
    let ids = Rc::new(RefCell::new((0u64, 0u64)));

    let ids_for_a = ids.clone();
    let outcome_for_a = outcome_a.clone();
    let t_a = scheduler::thread_create(move || {
        scheduler::thread_yield();
        let (_, b) = *ids_for_a.borrow();
        *outcome_for_a.borrow_mut() = Some(scheduler::thread_join(b));
    });
    let ids_for_b = ids.clone();
    let outcome_for_b = outcome_b.clone();
    let t_b = scheduler::thread_create(move || {
        let (a, _) = *ids_for_b.borrow();
        *outcome_for_b.borrow_mut() = Some(scheduler::thread_join(a));
    });
    *ids.borrow_mut() = (t_a, t_b);

    for _ in 0..8 {
        scheduler::thread_yield();
    }
    scheduler::thread_join(t_a).unwrap();
    scheduler::thread_join(t_b).unwrap();

    assert_eq!(*outcome_a.borrow(), Some(Err(JoinError::Deadlock)));
    assert_eq!(*outcome_b.borrow(), Some(Ok(())));
    scheduler::thread_cleanup();
}

/// Ten threads each increment a shared counter 100 times under a mutex,
/// yielding at random points inside and outside the critical section;
/// the final count must be exact.
#[test]
fn contended_mutex_counter_reaches_exact_total() {
    scheduler::init();
    let mutex = Rc::new(Mutex::new());
    let counter = Rc::new(RefCell::new(0i32));

    const THREADS: usize = 10;
    const ITERS: i32 = 100;

    let mut seed = 0x2545_f491_4f6c_dd1du64;
    let mut next_seed = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = mutex.clone();
            let counter = counter.clone();
            let r0 = next_seed();
            scheduler::thread_create(move || {
                let mut seed = r0;
                for _ in 0..ITERS {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    assert!(mutex.lock());
                    let value = *counter.borrow();
                    if seed % 7 == 0 {
                        scheduler::thread_yield();
                    }
                    *counter.borrow_mut() = value + 1;
                    assert!(mutex.unlock());
                    if seed % 5 == 0 {
                        scheduler::thread_yield();
                    }
                }
            })
        })
        .collect();

    for t in handles {
        scheduler::thread_join(t).unwrap();
    }

    assert_eq!(*counter.borrow(), THREADS as i32 * ITERS);
    scheduler::thread_cleanup();
}

/// An unlock attempt by a non-owner must fail rather than silently
/// releasing a lock someone else holds.
#[test]
fn unlock_by_non_owner_is_rejected() {
    scheduler::init();
    let mutex = Rc::new(Mutex::new());
    let owner_done = Rc::new(RefCell::new(false));

    let mutex_for_owner = mutex.clone();
    let owner_done_clone = owner_done.clone();
    let owner = scheduler::thread_create(move || {
        assert!(mutex_for_owner.lock());
        scheduler::thread_yield();
        assert!(mutex_for_owner.unlock());
        *owner_done_clone.borrow_mut() = true;
    });

    let mutex_for_other = mutex.clone();
    let other = scheduler::thread_create(move || {
        // The owner holds the lock across our first yield; unlocking it
        // from here must fail.
        assert!(!mutex_for_other.unlock());
    });

    scheduler::thread_join(owner).unwrap();
    scheduler::thread_join(other).unwrap();
    assert!(*owner_done.borrow());
    scheduler::thread_cleanup();
}

/// Condition-variable hand-off: on return from `wait`, the caller owns
/// the mutex it passed in, without racing anyone else for it.
#[test]
fn condvar_wait_returns_with_mutex_held() {
    scheduler::init();
    let mutex = Rc::new(Mutex::new());
    let cond = Rc::new(x20_rt::Condvar::new());
    let ready = Rc::new(RefCell::new(false));

    let mutex_w = mutex.clone();
    let cond_w = cond.clone();
    let ready_w = ready.clone();
    let waiter = scheduler::thread_create(move || {
        assert!(mutex_w.lock());
        while !*ready_w.borrow() {
            cond_w.wait(&mutex_w);
        }
        // wait() only returns once we already own the mutex again, so
        // this unlock must succeed immediately.
        assert!(mutex_w.unlock());
    });

    scheduler::thread_yield();
    assert!(mutex.lock());
    *ready.borrow_mut() = true;
    assert!(cond.signal(&mutex));
    assert!(mutex.unlock());

    scheduler::thread_join(waiter).unwrap();
    scheduler::thread_cleanup();
}
