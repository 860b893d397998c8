//! Basic sandbox example

use sandbox_rs::{util, NamespaceConfig, SandboxBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Sandbox RS - Basic Example ===\n");

    // Root can use any namespaces; everyone else needs a user namespace
    // mapping container root onto themselves.
    let builder = if util::is_root() {
        SandboxBuilder::new("example-1").namespaces(NamespaceConfig::default())
    } else {
        SandboxBuilder::new("example-1")
            .namespaces(NamespaceConfig::unprivileged())
            .root_mapping(util::get_uid(), util::get_gid())
    };

    println!("[1] Creating sandbox...");
    let mut sandbox = builder
        .command("/bin/sh", &["-c", "echo hello from $(hostname); exit 3"])
        .terminal(false)
        .build()?;

    println!("[*] Sandbox created: {}", sandbox.id());
    println!(
        "[*] Namespaces: {:?}\n",
        sandbox.config().container.namespaces.enabled()
    );

    println!("[2] Running the command...");
    let outcome = sandbox.run()?;

    println!("[*] Execution result:");
    println!("Exit code: {}", outcome.exit_code());

    Ok(())
}
