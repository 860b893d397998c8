use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sandbox_console::console::size_of;
use sandbox_console::{recv_fd, send_fd, Console, ConsoleBridge, HostStreams, ProcessIo, WinSize};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn streams(output: SharedBuffer) -> HostStreams {
    HostStreams {
        input: Box::new(io::empty()),
        output: Box::new(output),
        error: Box::new(io::sink()),
    }
}

#[test]
fn received_console_is_bridged_to_host_output() {
    let (host, _host_slave) = Console::new_pty().unwrap();
    let out = SharedBuffer::default();
    let mut process_io = ProcessIo::default();
    let mut bridge = ConsoleBridge::attach_host(&mut process_io, host, streams(out.clone()))
        .unwrap()
        .without_interrupts();
    let socket = process_io.console_socket.take().unwrap();

    // what the container's init does after allocating its pty
    let (pty_master, pty_slave) = Console::new_pty().unwrap();
    send_fd(&socket, "console", &pty_master).unwrap();
    drop(pty_master);

    bridge.wait_console().unwrap();
    assert!(bridge.is_received());
    assert!(bridge.host().unwrap().is_raw());

    bridge.close_post_start().unwrap();

    let mut slave = File::from(pty_slave);
    slave.write_all(b"hello from init\n").unwrap();

    bridge
        .host()
        .unwrap()
        .resize(WinSize { rows: 30, cols: 100 })
        .unwrap();
    bridge.resize().unwrap();
    assert_eq!(
        size_of(slave.as_raw_fd()).unwrap(),
        WinSize { rows: 30, cols: 100 }
    );

    drop(slave);
    drop(socket);
    bridge.close().unwrap();
    assert!(out.contents().contains("hello from init"));
}

#[test]
fn resize_before_receive_is_silent() {
    let (host, _host_slave) = Console::new_pty().unwrap();
    let mut process_io = ProcessIo::default();
    let bridge = ConsoleBridge::attach_host(&mut process_io, host, streams(SharedBuffer::default()))
        .unwrap()
        .without_interrupts();

    assert!(bridge.resize().is_ok());
    assert!(!bridge.is_received());
    assert!(bridge.interrupts().try_recv().is_err());

    bridge.close().unwrap();
}

#[test]
fn wait_console_fails_when_init_hangs_up() {
    let (host, _host_slave) = Console::new_pty().unwrap();
    let mut process_io = ProcessIo::default();
    let mut bridge =
        ConsoleBridge::attach_host(&mut process_io, host, streams(SharedBuffer::default()))
            .unwrap()
            .without_interrupts();

    drop(process_io.console_socket.take());
    assert!(bridge.wait_console().is_err());
    assert!(!bridge.is_received());
    bridge.close().unwrap();
}

#[test]
fn interrupt_is_reported_on_channel() {
    let (host, _host_slave) = Console::new_pty().unwrap();
    let mut process_io = ProcessIo::default();
    let mut bridge =
        ConsoleBridge::attach_host(&mut process_io, host, streams(SharedBuffer::default()))
            .unwrap();
    let socket = process_io.console_socket.take().unwrap();

    let (pty_master, pty_slave) = Console::new_pty().unwrap();
    send_fd(&socket, "console", &pty_master).unwrap();
    bridge.wait_console().unwrap();

    let interrupts = bridge.interrupts();
    unsafe { libc::raise(libc::SIGINT) };
    assert!(interrupts.recv_timeout(Duration::from_secs(5)).is_ok());

    drop(pty_master);
    drop(pty_slave);
    bridge.close().unwrap();
}

#[test]
fn detached_console_goes_to_caller_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("console.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let mut process_io = ProcessIo::default();
    let mut bridge = ConsoleBridge::attach(&mut process_io, true, Some(path.as_path())).unwrap();
    assert!(bridge.is_detached());
    let (peer, _) = listener.accept().unwrap();

    let (pty_master, _pty_slave) = Console::new_pty().unwrap();
    let socket = process_io.console_socket.take().unwrap();
    send_fd(&socket, "console", &pty_master).unwrap();

    let (fd, name) = recv_fd(&peer).unwrap();
    assert_eq!(name, "console");
    assert!(Console::from_fd(fd).is_ok());

    bridge.wait_console().unwrap();
    assert!(!bridge.is_received());
    bridge.close_post_start().unwrap();
    bridge.close().unwrap();
}

#[test]
fn close_releases_console_while_host_input_blocks() {
    let (host, _host_slave) = Console::new_pty().unwrap();
    // a host stdin nobody ever writes to or closes
    let (input_read, input_write) = nix::unistd::pipe().unwrap();
    let host_streams = HostStreams {
        input: Box::new(File::from(input_read)),
        output: Box::new(SharedBuffer::default()),
        error: Box::new(io::sink()),
    };
    let mut process_io = ProcessIo::default();
    let mut bridge = ConsoleBridge::attach_host(&mut process_io, host, host_streams)
        .unwrap()
        .without_interrupts();
    let socket = process_io.console_socket.take().unwrap();

    let (pty_master, pty_slave) = Console::new_pty().unwrap();
    send_fd(&socket, "console", &pty_master).unwrap();
    drop(pty_master);

    bridge.wait_console().unwrap();
    bridge.close_post_start().unwrap();
    drop(socket);
    bridge.close().unwrap();

    // no master left anywhere, so the slave is hung up
    let mut slave = File::from(pty_slave);
    assert!(slave.write_all(b"after close").is_err());

    // the stdin copy gives up on its next chunk and drops the host input
    let mut input = File::from(input_write);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match input.write(b"x") {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
            _ => {}
        }
        assert!(Instant::now() < deadline, "stdin copy kept the host input open");
        thread::sleep(Duration::from_millis(20));
    }
}
