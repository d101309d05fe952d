use rustfiber_io::{Runtime, WorkCounter};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("RustFiber I/O - fiber I/O and timer integration\n");

    let work = WorkCounter::new();
    let runtime = Runtime::builder().work_counter(work.clone()).build();
    if let Err(e) = runtime.ensure_initialized() {
        eprintln!("Failed to initialize runtime: {}", e);
        std::process::exit(1);
    }

    // Example 1: fibers sleeping for different durations wake in deadline order
    println!("Example 1: Delays");
    let order = Rc::new(RefCell::new(Vec::new()));
    for ms in [30u64, 10, 20] {
        let order = order.clone();
        runtime
            .spawn(move |ctx| {
                let late = ctx.delay(ms);
                order.borrow_mut().push(ms);
                println!("  fiber {} slept {}ms ({}ms late)", ctx.id(), ms, late);
            })
            .expect("spawn failed");
    }

    // Example 2: a timer fiber re-armed before it fires
    println!("Example 2: Timer");
    let start = Instant::now();
    let timer = runtime
        .create_timer(1_000, move |_| {
            println!("  timer fired after {:?}", start.elapsed());
        })
        .expect("timer creation failed");
    runtime.reset_timer(timer, 40).expect("timer reset failed");

    // Example 3: one fiber waits for a socket to become readable, another writes to it
    println!("Example 3: Readiness");
    let (reader, mut writer) = UnixStream::pair().expect("socketpair failed");
    reader.set_nonblocking(true).expect("nonblocking failed");
    let fd = reader.as_raw_fd();
    runtime
        .spawn(move |ctx| {
            let mut reader = reader;
            if let Err(e) = ctx.wait_readable(fd) {
                eprintln!("  wait failed: {}", e);
                return;
            }
            let mut buf = [0u8; 64];
            match reader.read(&mut buf) {
                Ok(n) => println!("  read {:?}", String::from_utf8_lossy(&buf[..n])),
                Err(e) => eprintln!("  read failed: {}", e),
            }
            ctx.close_handle(fd);
        })
        .expect("spawn failed");
    runtime
        .spawn(move |ctx| {
            ctx.delay(15);
            writer.write_all(b"hello fiber").expect("write failed");
        })
        .expect("spawn failed");

    if let Err(e) = runtime.run() {
        eprintln!("Run error: {}", e);
        std::process::exit(1);
    }

    println!("\nWake order: {:?}", order.borrow());
    let metrics = runtime.metrics();
    println!(
        "Polls: {}, I/O wakeups: {}, timer expirations: {}, pending work: {}",
        metrics.polls,
        metrics.io_wakeups,
        metrics.timer_expirations,
        work.value()
    );
}
