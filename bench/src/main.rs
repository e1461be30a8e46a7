//! Multi-process benchmark for the bptree engine.
//!
//! The parent builds the shared key table, opens (and thereby formats)
//! the database, forks `P - 1` children, and every process spawns
//! worker threads until `P * T` participants share the file. Workers
//! check in on the process-shared condition; when all `P * T - 1` of
//! them are parked the parent broadcasts, starts the wall clock, and
//! works its own share. Everyone loops on the atomic dispatch index
//! until the table is drained; workers post the completion semaphore
//! on the way out, the parent collects the posts, reaps the children,
//! and reports.
//!
//! Signals only set a flag here; the dispatch loops poll it and the
//! names are unlinked on the normal unwind path (unless -C).

mod opts;
mod shm;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use bptree::{BptHandle, Mgr, DEFAULT_LATCH_CAPACITY};
use opts::{OpKind, Opts};
use shm::{DoneSem, KeyValue, SharedRegion, KEY_CAP};

const DB_PATH: &str = "bpt.dat";

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("bench: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let opts = Opts::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if opts.threads == 0 || opts.processes == 0 || opts.rounds == 0 {
        bail!("threads, processes and rounds must all be nonzero");
    }

    // SAFETY: the handler only stores to an atomic flag.
    unsafe {
        let handler = on_signal as extern "C" fn(libc::c_int);
        let _ = libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        let _ = libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let mut region = SharedRegion::create(opts.rounds).context("create shared region")?;
    fill_keys(region.kvs_mut(), opts.random);
    let region = Arc::new(region);
    let sem = Arc::new(DoneSem::create().context("create completion semaphore")?);

    // The parent opens first and formats an empty file; children open
    // the already-formatted database.
    let mgr = Arc::new(
        Mgr::open(
            DB_PATH,
            opts.node_bits,
            opts.pool_capacity,
            DEFAULT_LATCH_CAPACITY,
        )
        .context("open database")?,
    );

    let mut children = Vec::new();
    for _ in 1..opts.processes {
        // SAFETY: fork before any thread exists in this process; the
        // child only touches inherited mappings and its own manager.
        match unsafe { libc::fork() } {
            -1 => bail!("fork: {}", io::Error::last_os_error()),
            0 => {
                let code = child_main(&region, &sem, &opts);
                // Skip destructors: the parent owns cleanup of the
                // shared names, and this process's mappings die with it.
                std::process::exit(code);
            }
            pid => children.push(pid),
        }
    }

    // Parent-side workers.
    let mut workers = Vec::new();
    for _ in 1..opts.threads {
        let mgr = Arc::clone(&mgr);
        let region = Arc::clone(&region);
        let sem = Arc::clone(&sem);
        let op = opts.op;
        workers.push(thread::spawn(move || {
            let mut h = BptHandle::new(&mgr);
            region.ready_and_wait();
            let failed = work_loop(&mut h, &region, op);
            sem.post();
            failed
        }));
    }

    // Rendezvous: every participant except this thread checks in.
    let expected = opts.processes * opts.threads - 1;
    while region.header().ready_threads.load(Ordering::SeqCst) < expected {
        if STOP.load(Ordering::SeqCst) {
            // Release whatever is parked so the semaphore drains.
            region.release_workers();
        }
        thread::sleep(Duration::from_millis(1));
    }

    region.release_workers();
    let clock = Instant::now();

    let mut handle = BptHandle::new(&mgr);
    let parent_failed = work_loop(&mut handle, &region, opts.op);

    for _ in 0..expected {
        sem.wait();
    }
    let elapsed = clock.elapsed();

    let mut failures = parent_failed as u32;
    for w in workers {
        if w.join().unwrap_or(true) {
            failures += 1;
        }
    }
    let mut child_failed = false;
    for pid in children {
        let mut status = 0;
        // SAFETY: reaping our own forked children.
        if unsafe { libc::waitpid(pid, &mut status, 0) } < 0 {
            child_failed = true;
        } else if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
            child_failed = true;
        }
    }

    report(&opts, elapsed, failures, &handle);

    if !opts.no_cleanup {
        SharedRegion::unlink();
        DoneSem::unlink();
    }

    Ok(if child_failed { 1 } else { 0 })
}

/// One forked child: its own manager on the shared file, `T` workers
/// counting its main thread.
fn child_main(region: &Arc<SharedRegion>, sem: &Arc<DoneSem>, opts: &Opts) -> i32 {
    let mgr = match Mgr::open(
        DB_PATH,
        opts.node_bits,
        opts.pool_capacity,
        DEFAULT_LATCH_CAPACITY,
    ) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            eprintln!("bench child: open database: {}", e);
            // Stand in for this process's workers so the parent's
            // rendezvous and semaphore counts still add up.
            let _ = region
                .header()
                .ready_threads
                .fetch_add(opts.threads, Ordering::SeqCst);
            for _ in 0..opts.threads {
                sem.post();
            }
            return 1;
        }
    };

    let mut workers = Vec::new();
    for _ in 1..opts.threads {
        let mgr = Arc::clone(&mgr);
        let region = Arc::clone(region);
        let sem = Arc::clone(sem);
        let op = opts.op;
        workers.push(thread::spawn(move || {
            let mut h = BptHandle::new(&mgr);
            region.ready_and_wait();
            let failed = work_loop(&mut h, &region, op);
            sem.post();
            failed
        }));
    }

    let mut h = BptHandle::new(&mgr);
    region.ready_and_wait();
    // Operation failures are logged by the worker that hit them and do
    // not fail the run; only setup or teardown trouble does.
    let _ = work_loop(&mut h, region, opts.op);
    sem.post();

    for w in workers {
        let _ = w.join();
    }
    0
}

/// Drains the shared dispatch index. Returns true if this worker hit a
/// failure; the first failure ends the loop, everyone else continues.
fn work_loop(h: &mut BptHandle, region: &SharedRegion, op: OpKind) -> bool {
    let hdr = region.header();
    let kvs = region.kvs();
    loop {
        if STOP.load(Ordering::Relaxed) {
            return false;
        }
        let i = hdr.index.fetch_add(1, Ordering::SeqCst);
        if i >= hdr.rounds {
            return false;
        }
        let kv = &kvs[i as usize];
        let outcome = match op {
            OpKind::Write => h.insert_key(kv.key(), 0, kv.value).map(|_| true),
            OpKind::Read => h.find_key(kv.key()).map(|v| v == kv.value),
            OpKind::Rw => h
                .insert_key(kv.key(), 0, kv.value)
                .and_then(|_| h.find_key(kv.key()))
                .map(|v| v == kv.value),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "wrong or missing value for key {}",
                    String::from_utf8_lossy(kv.key())
                );
                return true;
            }
            Err(e) => {
                log::warn!(
                    "operation failed on key {}: {}",
                    String::from_utf8_lossy(kv.key()),
                    e
                );
                return true;
            }
        }
    }
}

/// Fills the shared table with `benchmark_%08d` keys. Values start at
/// 2 so that 0 (absent) and 1 (the superblock) never appear as stored
/// values.
fn fill_keys(kvs: &mut [KeyValue], random: bool) {
    for (i, kv) in kvs.iter_mut().enumerate() {
        let text = format!("benchmark_{:08}", i);
        let bytes = text.as_bytes();
        assert!(bytes.len() <= KEY_CAP);
        kv.key[..bytes.len()].copy_from_slice(bytes);
        kv.len = bytes.len() as u8;
        kv.value = i as u64 + 2;
    }
    if random {
        use rand::seq::SliceRandom;
        kvs.shuffle(&mut rand::thread_rng());
    }
}

fn report(opts: &Opts, elapsed: Duration, failures: u32, handle: &BptHandle) {
    let secs = elapsed.as_secs_f64();
    let stat = handle.iostat();
    println!("Bench summary:");
    println!("Page bits      : {}", opts.node_bits);
    println!("Number of keys : {}", opts.rounds);
    println!("Operation      : {}", opts.op.name());
    println!(
        "IO pattern     : {}",
        if opts.random { "random" } else { "sequential" }
    );
    println!("Processes      : {}", opts.processes);
    println!("Threads/process: {}", opts.threads);
    println!("Elapsed time   : {:.6} seconds", secs);
    if secs > 0.0 {
        println!(
            "Throughput     : {:.0} ops/sec",
            opts.rounds as f64 / secs
        );
    }
    println!(
        "Parent iostat  : {} maps, {} unmaps, {} latch hits, {} latch evicts",
        stat.pool_maps, stat.pool_unmaps, stat.latch_hits, stat.latch_evicts
    );
    if failures > 0 {
        println!("Failed workers : {} (parent process)", failures);
    }
}
