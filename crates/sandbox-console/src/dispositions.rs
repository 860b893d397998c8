//! Restoring default signal behaviour once nobody is listening.
//!
//! signal-hook never uninstalls the OS-level handler it puts in place, so
//! without help a signal that used to terminate the process would be
//! silently swallowed after its last `Signals` iterator is dropped. Every
//! signal that had the default disposition gets a conditional default action
//! registered alongside; it stays disarmed while at least one
//! [`DefaultActions`] covers the signal.

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use log::debug;
use sandbox_core::{Result, SandboxError};

struct Slot {
    holders: usize,
    /// `None` when the signal was ignored or caught before we got to it
    restore: Option<Arc<AtomicBool>>,
}

fn slots() -> MutexGuard<'static, HashMap<i32, Slot>> {
    static SLOTS: OnceLock<Mutex<HashMap<i32, Slot>>> = OnceLock::new();
    SLOTS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn had_default_disposition(signal: i32) -> Result<bool> {
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signal, ptr::null(), &mut old) } != 0 {
        return Err(SandboxError::syscall("sigaction", io::Error::last_os_error()));
    }
    Ok(old.sa_sigaction == libc::SIG_DFL)
}

fn first_slot(signal: i32) -> Result<Slot> {
    let restore = if had_default_disposition(signal)? {
        let flag = Arc::new(AtomicBool::new(false));
        match signal_hook::flag::register_conditional_default(signal, Arc::clone(&flag)) {
            Ok(_) => Some(flag),
            // realtime signals have no entry in signal-hook's table
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                debug!("no default action emulation for signal {}", signal);
                None
            }
            Err(e) => {
                return Err(SandboxError::Signal(format!(
                    "unable to register default action for signal {}: {}",
                    signal, e
                )))
            }
        }
    } else {
        None
    };
    Ok(Slot { holders: 0, restore })
}

fn release(slots: &mut HashMap<i32, Slot>, signal: i32) {
    if let Some(slot) = slots.get_mut(&signal) {
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders == 0 {
            if let Some(restore) = &slot.restore {
                restore.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Keeps the listed signals from running their default action.
///
/// Take one before subscribing to the signals; dropping the last guard for a
/// signal makes it behave as if no handler had ever been installed.
#[derive(Debug)]
pub struct DefaultActions {
    signals: Vec<i32>,
}

impl DefaultActions {
    pub fn hold(signals: &[i32]) -> Result<Self> {
        let mut slots = slots();
        let mut held = Vec::with_capacity(signals.len());
        for &signal in signals {
            if !slots.contains_key(&signal) {
                match first_slot(signal) {
                    Ok(slot) => {
                        slots.insert(signal, slot);
                    }
                    Err(e) => {
                        for &signal in &held {
                            release(&mut slots, signal);
                        }
                        return Err(e);
                    }
                }
            }
            let slot = match slots.get_mut(&signal) {
                Some(slot) => slot,
                None => continue,
            };
            slot.holders += 1;
            if let Some(restore) = &slot.restore {
                restore.store(false, Ordering::SeqCst);
            }
            held.push(signal);
        }
        Ok(Self { signals: held })
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }
}

impl Drop for DefaultActions {
    fn drop(&mut self) {
        let mut slots = slots();
        for &signal in &self.signals {
            release(&mut slots, signal);
        }
    }
}
