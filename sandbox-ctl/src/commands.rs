use log::info;
use sandbox_rs::{util, SystemCapabilities};

pub fn check_requirements() {
    info!("Checking sandbox requirements");
    println!("Checking sandbox requirements...\n");

    let caps = SystemCapabilities::detect();
    println!("{}", caps.summary());

    println!();
    if caps.has_root {
        println!("Any namespace set can be used.");
    } else if caps.can_launch_unprivileged() {
        println!("Not root: pass --userns to run inside a user namespace.");
    } else {
        println!("Not root and user namespaces are unavailable: launches will fail.");
    }
    if !caps.can_attach_console() {
        println!("No /dev/ptmx: use --no-tty.");
    }

    println!("\nSystem info:");
    println!("  UID: {}", util::get_uid());
    println!("  GID: {}", util::get_gid());
}
