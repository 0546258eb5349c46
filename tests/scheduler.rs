//! Scheduler integration: real context switches between kernel tasks.
//!
//! The test binary's boot thread spawns workers, yields into the ring and
//! regains control once every worker has exited.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(basalt::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use basalt::multiboot::{BootInfo, BOOTLOADER_MAGIC};
use basalt::task::{self, KillError, Pid};

#[no_mangle]
pub extern "C" fn kmain(magic: u64, mbi_phys: u64) -> ! {
    assert_eq!(magic, BOOTLOADER_MAGIC);
    let boot_info = unsafe { BootInfo::from_phys(mbi_phys) };
    basalt::init(&boot_info);
    test_main();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    basalt::testing::test_panic_handler(info)
}

/// Yields from the boot thread until every spawned task has exited.
fn drive_until_idle() {
    loop {
        if task::snapshot().is_empty() {
            return;
        }
        task::task_yield();
    }
}

const ROUNDS: usize = 10;

static COUNTER: Mutex<u64> = Mutex::new(0);
static ORDER: Mutex<[Pid; 3 * ROUNDS]> = Mutex::new([0; 3 * ROUNDS]);
static ORDER_LEN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counting_worker() {
    for _ in 0..ROUNDS {
        {
            let mut counter = COUNTER.lock();
            *counter += 1;
            let idx = ORDER_LEN.fetch_add(1, Ordering::SeqCst);
            ORDER.lock()[idx] = task::current_pid().unwrap_or(0);
        }
        task::task_yield();
    }
    task::exit(0);
}

#[test_case]
fn three_workers_rotate_cyclically() {
    let a = task::spawn(counting_worker, "worker-a").expect("spawn a");
    let b = task::spawn(counting_worker, "worker-b").expect("spawn b");
    let c = task::spawn(counting_worker, "worker-c").expect("spawn c");

    drive_until_idle();

    assert_eq!(*COUNTER.lock(), (3 * ROUNDS) as u64);

    // Deterministic round-robin: every consecutive window of three holds
    // each worker exactly once.
    let order = ORDER.lock();
    for window in order.chunks(3) {
        let mut seen = [false; 3];
        for &pid in window {
            for (i, &expect) in [a, b, c].iter().enumerate() {
                if pid == expect {
                    seen[i] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}

static PARKED_SPINS: AtomicUsize = AtomicUsize::new(0);
static PARKED_PID: AtomicUsize = AtomicUsize::new(0);
static KILL_RESULTS_OK: AtomicBool = AtomicBool::new(false);

extern "C" fn parked_worker() {
    loop {
        PARKED_SPINS.fetch_add(1, Ordering::SeqCst);
        task::task_yield();
    }
}

extern "C" fn killer_worker() {
    // Give the parked sibling one slice before removing it.
    task::task_yield();
    let pid = PARKED_PID.load(Ordering::SeqCst) as Pid;
    let ok = task::kill(9999) == Err(KillError::NotFound)
        && task::kill(pid) == Ok(())
        && task::kill(pid) == Err(KillError::NotFound);
    KILL_RESULTS_OK.store(ok, Ordering::SeqCst);
    task::exit(0);
}

#[test_case]
fn kill_removes_a_parked_task() {
    let parked = task::spawn(parked_worker, "parked").expect("spawn parked");
    PARKED_PID.store(parked as usize, Ordering::SeqCst);
    task::spawn(killer_worker, "killer").expect("spawn killer");

    // The killer empties the ring by removing the parked task and exiting.
    drive_until_idle();

    assert!(PARKED_SPINS.load(Ordering::SeqCst) > 0);
    assert!(KILL_RESULTS_OK.load(Ordering::SeqCst));
    assert!(task::snapshot().iter().all(|t| t.pid != parked));
}

static SELF_KILL_REFUSED: AtomicBool = AtomicBool::new(false);

extern "C" fn self_killer() {
    if let Some(me) = task::current_pid() {
        if task::kill(me) == Err(KillError::IsCurrent) {
            SELF_KILL_REFUSED.store(true, Ordering::SeqCst);
        }
    }
    task::exit(7);
}

#[test_case]
fn killing_self_is_refused() {
    task::spawn(self_killer, "self-killer").expect("spawn");
    drive_until_idle();
    assert!(SELF_KILL_REFUSED.load(Ordering::SeqCst));
}

#[test_case]
fn exited_tasks_release_their_slots() {
    extern "C" fn ephemeral() {
        task::exit(0);
    }
    // Churn through more tasks than the arena holds; slots must recycle.
    for i in 0..basalt::task::MAX_TASKS * 2 {
        let pid = task::spawn(ephemeral, "ephemeral");
        assert!(pid.is_some(), "spawn failed on iteration {}", i);
        drive_until_idle();
    }
}
