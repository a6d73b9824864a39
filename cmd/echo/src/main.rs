//! Echo server on hooked blocking I/O
//!
//! The whole server is written in straight-line blocking style: accept in
//! a loop, then read/write in a loop per connection. Because it runs on
//! fibers with the hook layer enabled, every would-block point yields the
//! worker to other connections instead of stalling it.
//!
//! ```text
//! STRAND_ECHO_PORT=7777 cargo run -p strand-echo
//! printf 'hello\n' | nc 127.0.0.1 7777
//! ```

use std::os::unix::io::RawFd;

use strand::{hook, log_error, log_info, IoManager};

fn listener_socket(port: u16) -> RawFd {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket failed");

    let one: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    let rt = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rt, 0, "bind failed");
    let rt = unsafe { libc::listen(fd, 128) };
    assert_eq!(rt, 0, "listen failed");
    fd
}

fn serve_connection(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::read(fd, &mut buf);
        if n == 0 {
            break; // peer closed
        }
        if n < 0 {
            log_error!("read({}) failed: errno {}", fd, hook::errno());
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let w = hook::write(fd, &buf[off..n as usize]);
            if w <= 0 {
                hook::close(fd);
                return;
            }
            off += w as usize;
        }
    }
    hook::close(fd);
}

fn main() {
    let port: u16 = std::env::var("STRAND_ECHO_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(7777);

    let iom = IoManager::new(4, false, "echo");
    iom.spawn(move || {
        let listener = listener_socket(port);
        log_info!("echo: listening on 0.0.0.0:{}", port);
        loop {
            let client = hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
            if client < 0 {
                log_error!("accept failed");
                continue;
            }
            if let Some(iom) = IoManager::current() {
                iom.spawn(move || serve_connection(client));
            }
        }
    });

    // The accept loop never returns; park the main thread.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
