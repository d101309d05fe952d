use rustfiber_io::{FiberConfig, FiberError, Runtime, WorkCounter};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn runtime() -> Runtime {
    Runtime::builder()
        .config(FiberConfig {
            max_fds: Some(1024),
            ..FiberConfig::default()
        })
        .work_counter(WorkCounter::new())
        .build()
}

/// Non-blocking pipe; closed on drop.
struct Pipe {
    read: RawFd,
    write: RawFd,
}

impl Pipe {
    fn new() -> Self {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe failed: {}", std::io::Error::last_os_error());
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Pipe {
            read: fds[0],
            write: fds[1],
        }
    }

    fn write(&self, data: &[u8]) -> isize {
        unsafe { libc::write(self.write, data.as_ptr().cast(), data.len()) }
    }

    fn read(&self, buf: &mut [u8]) -> isize {
        unsafe { libc::read(self.read, buf.as_mut_ptr().cast(), buf.len()) }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

#[test]
fn test_pipe_readable_after_delayed_write() {
    let runtime = runtime();
    let pipe = Rc::new(Pipe::new());
    let received = Rc::new(RefCell::new(Vec::new()));

    let reader = pipe.clone();
    let out = received.clone();
    runtime
        .spawn(move |ctx| {
            assert_eq!(reader.read(&mut [0u8; 8]), -1, "nothing written yet");
            ctx.wait_readable(reader.read).unwrap();
            let mut buf = [0u8; 16];
            let n = reader.read(&mut buf);
            assert!(n > 0);
            out.borrow_mut().extend_from_slice(&buf[..n as usize]);
        })
        .unwrap();

    let writer = pipe.clone();
    runtime
        .spawn(move |ctx| {
            ctx.delay(20);
            assert_eq!(writer.write(b"ping"), 4);
        })
        .unwrap();

    runtime.run().unwrap();
    assert_eq!(*received.borrow(), b"ping");
    assert_eq!(runtime.io_count(), 0);
    assert_eq!(runtime.metrics().io_wakeups, 1);
}

#[test]
fn test_empty_pipe_is_writable_immediately() {
    let runtime = runtime();
    let pipe = Rc::new(Pipe::new());
    let waited = Rc::new(Cell::new(Duration::MAX));
    let out = waited.clone();
    let writer = pipe.clone();
    runtime
        .spawn(move |ctx| {
            let start = Instant::now();
            ctx.wait_writable(writer.write).unwrap();
            out.set(start.elapsed());
        })
        .unwrap();
    runtime.run().unwrap();
    assert!(waited.get() < Duration::from_secs(1));
}

#[test]
fn test_ping_pong_between_fibers() {
    let runtime = runtime();
    let (left, right) = UnixStream::pair().unwrap();
    left.set_nonblocking(true).unwrap();
    right.set_nonblocking(true).unwrap();
    let rounds = Rc::new(Cell::new(0));

    let count = rounds.clone();
    runtime
        .spawn(move |ctx| {
            let mut stream = left;
            let mut buf = [0u8; 1];
            for _ in 0..5 {
                stream.write_all(b"x").unwrap();
                ctx.wait_readable(stream.as_raw_fd()).unwrap();
                stream.read_exact(&mut buf).unwrap();
                count.set(count.get() + 1);
            }
        })
        .unwrap();
    runtime
        .spawn(move |ctx| {
            let mut stream = right;
            let mut buf = [0u8; 1];
            for _ in 0..5 {
                ctx.wait_readable(stream.as_raw_fd()).unwrap();
                stream.read_exact(&mut buf).unwrap();
                stream.write_all(b"y").unwrap();
            }
        })
        .unwrap();

    runtime.run().unwrap();
    assert_eq!(rounds.get(), 5);
    assert_eq!(runtime.io_count(), 0);
}

#[test]
fn test_second_waiter_on_same_handle_fails() {
    let runtime = runtime();
    let pipe = Rc::new(Pipe::new());
    let outcome = Rc::new(RefCell::new(None));

    let first = pipe.clone();
    runtime
        .spawn(move |ctx| {
            ctx.wait_readable(first.read).unwrap();
        })
        .unwrap();
    let second = pipe.clone();
    let out = outcome.clone();
    runtime
        .spawn(move |ctx| {
            *out.borrow_mut() = Some(ctx.wait_readable(second.read));
            second.write(b"!");
        })
        .unwrap();
    runtime.run().unwrap();

    match outcome.borrow_mut().take() {
        Some(Err(FiberError::HandleBusy { fd, .. })) => assert_eq!(fd, pipe.read),
        other => panic!("expected HandleBusy, got {:?}", other),
    }
    assert_eq!(runtime.io_count(), 0);
}

#[test]
fn test_regular_file_does_not_block() {
    let runtime = runtime();
    let file = std::fs::File::open("Cargo.toml").unwrap();
    let fd = file.as_raw_fd();
    let returned = Rc::new(Cell::new(false));
    let out = returned.clone();
    runtime
        .spawn(move |ctx| {
            let _file = file;
            // epoll refuses regular files; the wait degrades to a no-op.
            if ctx.wait_readable(fd).is_ok() {
                out.set(true);
            }
        })
        .unwrap();
    runtime.run().unwrap();
    assert!(returned.get());
    assert_eq!(runtime.io_count(), 0);
}

#[test]
fn test_close_handle_wakes_blocked_reader() {
    let runtime = runtime();
    let pipe = Rc::new(Pipe::new());
    let woke = Rc::new(Cell::new(false));

    let reader = pipe.clone();
    let out = woke.clone();
    runtime
        .spawn(move |ctx| {
            ctx.wait_readable(reader.read).unwrap();
            out.set(true);
        })
        .unwrap();
    let closer = pipe.clone();
    runtime
        .spawn(move |ctx| {
            ctx.delay(10);
            ctx.close_handle(closer.read);
        })
        .unwrap();
    runtime.run().unwrap();

    assert!(woke.get());
    assert_eq!(runtime.io_count(), 0);
    assert_eq!(runtime.fiber_count(), 0);
}
