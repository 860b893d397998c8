//! Namespace-isolated container built on `clone(2)`
//!
//! Startup order inside the child:
//! - Wait for the parent to write uid/gid maps and note the container's
//!   namespaces
//! - New session; console or pipes become stdio
//! - chdir, LSM exec labels
//! - Bounding set, groups, uid/gid, remaining capability sets
//! - no_new_privs, then execve
//!
//! Any failure before execve is written to a close-on-exec pipe the parent
//! reads, so `run` only returns once the new program is running. Nothing in
//! the child allocates: the parent may have other threads holding allocator
//! locks at the moment of the clone.

use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::iter;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sched::clone;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::stat::Mode;
use nix::sys::termios::Termios;
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, getgid, getpid, getuid, pipe2, setgid, setgroups, setsid, setuid};
use nix::unistd::{Gid, Pid, Uid};
use sandbox_console::console::{make_controlling_terminal, resize_fd};
use sandbox_console::{send_raw_fd, ProcessIo, WinSize};
use sandbox_core::{Result, SandboxError};
use sandbox_namespace::procfs::{self, ProcStat};
use sandbox_namespace::user_ns::setup_user_namespace;
use sandbox_namespace::{ContainerConfig, NamespaceType};

use super::caps::{CapabilityMasks, LAST_CAP};
use super::{Container, ContainerProcess};
use crate::execution::process::resolve_program_path;
use crate::execution::signal::exit_status;
use crate::execution::ProcessDescriptor;

const CHILD_STACK_SIZE: usize = 128 * 1024;

const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

const EXEC_ATTR: &CStr = c"/proc/thread-self/attr/exec";

/// Errno followed by the failed step's name
const ERROR_RECORD_SIZE: usize = 4 + 60;

/// Namespaces checked for membership, widest first
const MEMBERSHIP_ORDER: [NamespaceType; 6] = [
    NamespaceType::Pid,
    NamespaceType::Mount,
    NamespaceType::Ipc,
    NamespaceType::Uts,
    NamespaceType::Net,
    NamespaceType::User,
];

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// How the container's processes are told apart from the rest of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    /// Every process in a namespace the container owns
    Namespace(NamespaceType, u64),
    /// No namespace of its own: init's process tree, plus orphans re-parented
    /// to the supervisor that started no earlier than init
    Descendants { since: u64 },
}

/// A container made of fresh Linux namespaces around a single init process.
///
/// No root filesystem, mounts or cgroups are set up; the process sees the
/// host filesystem through its own mount namespace.
pub struct NamespaceContainer {
    id: String,
    config: ContainerConfig,
    init: Option<Pid>,
    membership: Option<Membership>,
    exited: Arc<AtomicBool>,
}

impl NamespaceContainer {
    pub fn create(id: &str, config: ContainerConfig) -> Result<Self> {
        if id.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "container id cannot be empty".to_string(),
            ));
        }
        config.validate()?;

        Ok(Self {
            id: id.to_string(),
            config,
            init: None,
            membership: None,
            exited: Arc::new(AtomicBool::new(false)),
        })
    }

    /// PID of the running init process, if any
    pub fn init_pid(&self) -> Option<Pid> {
        self.init
    }

    /// Work out how to find the container's processes later, while init is
    /// still parked before execve
    fn membership(&self, init: Pid) -> Option<Membership> {
        for ty in MEMBERSHIP_ORDER {
            if !self.config.namespaces.is_enabled(ty) {
                continue;
            }
            match (
                procfs::namespace_inode(ty, Some(init)),
                procfs::namespace_inode(ty, None),
            ) {
                (Ok(inode), Ok(own)) if inode != own => {
                    return Some(Membership::Namespace(ty, inode))
                }
                (Ok(_), Ok(_)) => {}
                (Err(e), _) | (_, Err(e)) => {
                    debug!("container {}: {:?} namespace: {}", self.id, ty, e)
                }
            }
        }

        match ProcStat::read(init) {
            Ok(stat) => Some(Membership::Descendants {
                since: stat.start_time,
            }),
            Err(e) => {
                warn!("container {}: unable to read init {}: {}", self.id, init, e);
                None
            }
        }
    }

    /// SIGKILL every container process other than init, including those that
    /// left init's session, and reap the ones that are our children
    fn kill_members(&self, init: Pid, membership: Membership) {
        let members = match membership {
            Membership::Namespace(ty, inode) => procfs::namespace_members(ty, inode),
            Membership::Descendants { since } => procfs::processes()
                .map(|table| procfs::descendants(&table, init, Some((getpid(), since)))),
        };
        let members: Vec<Pid> = match members {
            Ok(members) => members.into_iter().filter(|pid| *pid != init).collect(),
            Err(e) => {
                warn!("container {}: listing processes: {}", self.id, e);
                return;
            }
        };
        if members.is_empty() {
            return;
        }

        debug!(
            "container {}: killing {} remaining processes",
            self.id,
            members.len()
        );
        for member in &members {
            match kill(*member, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("container {}: kill {}: {}", self.id, member, e),
            }
        }
        for member in &members {
            loop {
                match waitpid(*member, None) {
                    Ok(status) if exit_status(status).is_none() => continue,
                    Err(Errno::EINTR) => continue,
                    // reaped, or somebody else's child
                    _ => break,
                }
            }
        }
    }
}

impl Container for NamespaceContainer {
    type Process = NamespaceProcess;

    fn id(&self) -> &str {
        &self.id
    }

    fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn run(&mut self, process: ProcessDescriptor) -> Result<NamespaceProcess> {
        if self.init.is_some() {
            return Err(SandboxError::AlreadyRunning);
        }

        let plan = ChildPlan::new(process)?;
        let program = plan.program.to_string_lossy().into_owned();
        let (mut error_read, error_write) = cloexec_pipe()?;
        let (sync_read, mut sync_write) = cloexec_pipe()?;

        let flags = self.config.namespaces.to_clone_flags();
        let mut stack = vec![0u8; CHILD_STACK_SIZE];

        // Everything the child needs moves into the closure and is dropped on
        // the parent side as soon as clone returns.
        let mut plan = Some(plan);
        let mut error_write = Some(error_write);
        let mut sync_read = Some(sync_read);
        let child = Box::new(move || -> isize {
            let (Some(plan), Some(mut error_pipe), Some(sync)) =
                (plan.take(), error_write.take(), sync_read.take())
            else {
                return 1;
            };
            let code = match init_process(&plan, sync) {
                Ok(never) => match never {},
                Err(err) => {
                    let mut record = [0u8; ERROR_RECORD_SIZE];
                    let len = err.encode(&mut record);
                    let _ = error_pipe.write_all(&record[..len]);
                    1
                }
            };
            // the plan's memory is released with the process, not by free()
            mem::forget(plan);
            code
        });

        // SAFETY: the child only runs the closure above and then execs or exits
        let pid = unsafe { clone(child, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
            .map_err(|e| SandboxError::syscall("clone", e))?;
        debug!("container {}: cloned init {} ({:?})", self.id, pid, flags);

        if self.config.namespaces.user {
            if let Err(e) = setup_user_namespace(pid, &self.config) {
                abandon(pid);
                return Err(e);
            }
        }

        let membership = self.membership(pid);
        if let Err(e) = sync_write.write_all(&[1]) {
            abandon(pid);
            return Err(SandboxError::Container(format!(
                "failed to release init {}: {}",
                pid, e
            )));
        }
        drop(sync_write);

        let mut record = Vec::new();
        error_read.read_to_end(&mut record)?;
        if let Some(failure) = ChildError::describe(&record) {
            let _ = waitpid(pid, None);
            return Err(SandboxError::Container(format!(
                "container {} init for {} failed: {}",
                self.id, program, failure
            )));
        }

        info!("container {}: init {} started", self.id, pid);
        self.exited.store(false, Ordering::SeqCst);
        self.init = Some(pid);
        self.membership = membership;

        Ok(NamespaceProcess {
            pid,
            exited: Arc::clone(&self.exited),
        })
    }

    fn destroy(&mut self) -> Result<()> {
        let pid = match self.init.take() {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let membership = self.membership.take();

        // init is a session leader, so its pid names the process group too
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("container {}: killpg {}: {}", self.id, pid, e),
        }
        if let Some(membership) = membership {
            self.kill_members(pid, membership);
        }

        if self.exited.load(Ordering::SeqCst) {
            debug!("container {}: init {} already collected", self.id, pid);
            return Ok(());
        }

        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(SandboxError::syscall("kill", e)),
        }

        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if exit_status(status).is_some() {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(SandboxError::syscall("waitpid", e)),
            }
        }
        self.exited.store(true, Ordering::SeqCst);
        debug!("container {}: destroyed", self.id);
        Ok(())
    }
}

/// The init process of a [`NamespaceContainer`]
#[derive(Debug)]
pub struct NamespaceProcess {
    pid: Pid,
    exited: Arc<AtomicBool>,
}

impl ContainerProcess for NamespaceProcess {
    fn pid(&self) -> Result<Pid> {
        Ok(self.pid)
    }

    fn signal(&self, sig: libc::c_int) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(SandboxError::NotRunning);
        }
        // nix's Signal has no realtime signals, so this goes through libc
        // SAFETY: plain kill(2) on a pid we started
        if unsafe { libc::kill(self.pid.as_raw(), sig) } != 0 {
            return Err(SandboxError::syscall("kill", Errno::last()));
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<i32>> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some((_, code)) = exit_status(status) {
                        self.exited.store(true, Ordering::SeqCst);
                        return Ok(Some(code));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.exited.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                Err(e) => return Err(SandboxError::syscall("waitpid", e)),
            }
        }
    }
}

/// Launch parameters converted up front so the child only makes syscalls
/// between clone and execve.
struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    /// Null-terminated pointers into `argv` and `envp`
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: CString,
    uid: Uid,
    gid: Gid,
    additional_gids: Vec<Gid>,
    capabilities: Option<CapabilityMasks>,
    selinux_label: Option<Vec<u8>>,
    apparmor_exec: Option<Vec<u8>>,
    no_new_privileges: bool,
    console_size: Option<WinSize>,
    io: ProcessIo,
}

impl ChildPlan {
    fn new(process: ProcessDescriptor) -> Result<Self> {
        let name = process
            .args
            .first()
            .ok_or_else(|| SandboxError::InvalidConfig("process args must not be empty".to_string()))?;
        let program = resolve_program_path(name, &process.env).map_err(SandboxError::Process)?;

        let argv = process
            .args
            .into_iter()
            .map(cstring)
            .collect::<Result<Vec<_>>>()?;
        let envp = process
            .env
            .into_iter()
            .map(cstring)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            program: cstring(program)?,
            argv_ptrs: pointers(&argv),
            envp_ptrs: pointers(&envp),
            argv,
            envp,
            cwd: cstring(process.cwd)?,
            uid: Uid::from_raw(process.uid),
            gid: Gid::from_raw(process.gid),
            additional_gids: process
                .additional_gids
                .into_iter()
                .map(Gid::from_raw)
                .collect(),
            capabilities: process.capabilities,
            selinux_label: process.label.map(String::into_bytes),
            apparmor_exec: process
                .apparmor_profile
                .map(|profile| format!("exec {}", profile).into_bytes()),
            no_new_privileges: process.no_new_privileges,
            console_size: process.console_size,
            io: process.io,
        })
    }
}

fn cstring(value: String) -> Result<CString> {
    CString::new(value)
        .map_err(|e| SandboxError::InvalidConfig(format!("argument contains a nul byte: {}", e)))
}

fn pointers(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(iter::once(ptr::null()))
        .collect()
}

fn cloexec_pipe() -> Result<(File, File)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::syscall("pipe2", e))?;
    Ok((File::from(read), File::from(write)))
}

/// Kill and reap a child that never made it to execve
fn abandon(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

/// What went wrong in the child, in a form that needs no allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChildError {
    step: &'static str,
    /// 0 when the step failed without an errno
    errno: i32,
}

impl ChildError {
    fn new(step: &'static str, errno: Errno) -> Self {
        Self {
            step,
            errno: errno as i32,
        }
    }

    fn io(step: &'static str, err: &io::Error) -> Self {
        Self {
            step,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }

    fn step(step: &'static str) -> Self {
        Self { step, errno: 0 }
    }

    fn encode(&self, record: &mut [u8; ERROR_RECORD_SIZE]) -> usize {
        record[..4].copy_from_slice(&self.errno.to_ne_bytes());
        let name = self.step.as_bytes();
        let len = name.len().min(ERROR_RECORD_SIZE - 4);
        record[4..4 + len].copy_from_slice(&name[..len]);
        4 + len
    }

    /// Parent side: `None` for an empty record, meaning execve succeeded
    fn describe(record: &[u8]) -> Option<String> {
        if record.is_empty() {
            return None;
        }
        let (errno, step) = match record.get(..4) {
            Some(raw) => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(raw);
                (i32::from_ne_bytes(bytes), String::from_utf8_lossy(&record[4..]))
            }
            None => return Some("truncated error report".to_string()),
        };
        Some(match errno {
            0 => step.into_owned(),
            errno => format!("{}: {}", step, Errno::from_raw(errno)),
        })
    }
}

fn failed(step: &'static str) -> impl FnOnce(Errno) -> ChildError {
    move |errno| ChildError::new(step, errno)
}

type ChildResult<T> = std::result::Result<T, ChildError>;

fn init_process(plan: &ChildPlan, mut sync: File) -> ChildResult<Infallible> {
    let mut byte = [0u8; 1];
    match sync.read(&mut byte) {
        Ok(1) => {}
        Ok(_) => return Err(ChildError::step("parent aborted before releasing init")),
        Err(e) => return Err(ChildError::io("waiting for the parent", &e)),
    }
    drop(sync);

    setsid().map_err(failed("setsid"))?;
    setup_stdio(plan)?;

    chdir(plan.cwd.as_c_str()).map_err(failed("chdir"))?;

    if let Some(exec) = &plan.apparmor_exec {
        write_exec_attr(exec).map_err(failed("apparmor profile"))?;
    }
    if let Some(label) = &plan.selinux_label {
        write_exec_attr(label).map_err(failed("selinux label"))?;
    }

    let switching_user = plan.uid != getuid();
    if let Some(caps) = &plan.capabilities {
        if switching_user {
            prctl(libc::PR_SET_KEEPCAPS, 1).map_err(failed("keep capabilities"))?;
        }
        drop_bounding_set(caps)?;
    }

    if !plan.additional_gids.is_empty() {
        setgroups(&plan.additional_gids).map_err(failed("setgroups"))?;
    }
    if plan.gid != getgid() {
        setgid(plan.gid).map_err(failed("setgid"))?;
    }
    if switching_user {
        setuid(plan.uid).map_err(failed("setuid"))?;
    }

    if let Some(caps) = &plan.capabilities {
        apply_capabilities(caps)?;
    }

    if plan.no_new_privileges {
        prctl(libc::PR_SET_NO_NEW_PRIVS, 1).map_err(failed("no_new_privs"))?;
    }

    // SAFETY: both pointer arrays are null-terminated and point into
    // CStrings the plan keeps alive
    unsafe {
        libc::execve(
            plan.program.as_ptr(),
            plan.argv_ptrs.as_ptr(),
            plan.envp_ptrs.as_ptr(),
        )
    };
    Err(ChildError::new("execve", Errno::last()))
}

fn setup_stdio(plan: &ChildPlan) -> ChildResult<()> {
    if let Some(socket) = &plan.io.console_socket {
        let pty = openpty(None::<&Winsize>, None::<&Termios>).map_err(failed("openpty"))?;
        if let Some(size) = plan.console_size {
            resize_fd(pty.master.as_raw_fd(), size).map_err(failed("console size"))?;
        }
        send_raw_fd(socket.as_raw_fd(), b"console", pty.master.as_raw_fd())
            .map_err(failed("send console"))?;
        drop(pty.master);

        make_controlling_terminal(pty.slave.as_raw_fd())
            .map_err(failed("controlling terminal"))?;
        for target in 0..=2 {
            redirect(&pty.slave, target)?;
        }
        if pty.slave.as_raw_fd() <= 2 {
            // already one of the standard streams
            let _ = pty.slave.into_raw_fd();
        }
        return Ok(());
    }

    for (fd, target) in [
        (&plan.io.stdin, 0),
        (&plan.io.stdout, 1),
        (&plan.io.stderr, 2),
    ] {
        if let Some(fd) = fd {
            redirect(fd, target)?;
        }
    }
    Ok(())
}

/// Make `fd` the process's descriptor `target`, surviving execve
fn redirect(fd: &OwnedFd, target: i32) -> ChildResult<()> {
    if fd.as_raw_fd() == target {
        fcntl(target, FcntlArg::F_SETFD(FdFlag::empty())).map_err(failed("clear close-on-exec"))?;
        return Ok(());
    }
    dup2(fd.as_raw_fd(), target).map_err(failed("dup2"))?;
    Ok(())
}

fn write_exec_attr(value: &[u8]) -> nix::Result<()> {
    let fd = open(EXEC_ATTR, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    // SAFETY: fd was just opened and nothing else owns it
    let mut file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.write_all(value)
        .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

fn prctl(option: libc::c_int, arg: libc::c_ulong) -> nix::Result<()> {
    // SAFETY: the options used here take integer arguments only
    let res = unsafe { libc::prctl(option, arg, 0, 0, 0) };
    Errno::result(res).map(drop)
}

fn drop_bounding_set(caps: &CapabilityMasks) -> ChildResult<()> {
    for cap in 0..=LAST_CAP {
        if caps.bounding.contains(cap) {
            continue;
        }
        match prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong) {
            // capability newer than the running kernel
            Ok(()) | Err(Errno::EINVAL) => {}
            Err(e) => return Err(ChildError::new("drop bounding capability", e)),
        }
    }
    Ok(())
}

fn apply_capabilities(caps: &CapabilityMasks) -> ChildResult<()> {
    let (effective_low, effective_high) = caps.effective.split();
    let (permitted_low, permitted_high) = caps.permitted.split();
    let (inheritable_low, inheritable_high) = caps.inheritable.split();

    let header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapData {
            effective: effective_low,
            permitted: permitted_low,
            inheritable: inheritable_low,
        },
        CapData {
            effective: effective_high,
            permitted: permitted_high,
            inheritable: inheritable_high,
        },
    ];

    // SAFETY: header and data match the kernel's v3 capability layout
    let res = unsafe { libc::syscall(libc::SYS_capset, &header as *const CapHeader, data.as_ptr()) };
    if res != 0 {
        return Err(ChildError::new("capset", Errno::last()));
    }

    for cap in caps.ambient.iter() {
        // SAFETY: integer-only prctl
        let res = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                cap as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if res != 0 {
            return Err(ChildError::new("raise ambient capability", Errno::last()));
        }
    }
    Ok(())
}
