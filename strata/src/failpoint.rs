//! Named fault-injection points for crash-consistency tests.
//!
//! A failpoint is armed either for the current thread with [`enable`] or for the
//! whole process through the `STRATA_FAILPOINTS` environment variable
//! (comma-separated names, `name=enospc` for a full volume).
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

use crate::error::ENOSPC;

pub const ENV_VAR: &str = "STRATA_FAILPOINTS";

/// What an armed failpoint returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAction {
    /// A generic I/O error.
    Error,
    /// The error a volume raises when it has no space left.
    DiskFull,
}

thread_local! {
    static FAILPOINTS: RefCell<HashMap<String, FailAction>> = RefCell::new(HashMap::new());
}

pub fn enable(name: &str) {
    enable_with(name, FailAction::Error);
}

pub fn enable_with(name: &str, action: FailAction) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string(), action);
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| {
        set.borrow_mut().clear();
    });
}

fn action_for(name: &str) -> Option<FailAction> {
    let local = FAILPOINTS.with(|set| set.borrow().get(name).copied());
    if local.is_some() {
        return local;
    }

    let raw = std::env::var(ENV_VAR).ok()?;
    raw.split(',').find_map(|entry| {
        let (point, action) = match entry.trim().split_once('=') {
            Some((point, "enospc")) => (point, FailAction::DiskFull),
            Some((point, _)) => (point, FailAction::Error),
            None => (entry.trim(), FailAction::Error),
        };
        (point == name).then_some(action)
    })
}

pub fn is_enabled(name: &str) -> bool {
    action_for(name).is_some()
}

pub fn maybe_fail(name: &str) -> io::Result<()> {
    match action_for(name) {
        None => Ok(()),
        Some(action) => {
            tracing::warn!(failpoint = name, ?action, "failpoint triggered");
            match action {
                FailAction::Error => Err(io::Error::other(format!("failpoint triggered: {name}"))),
                FailAction::DiskFull => Err(io::Error::from_raw_os_error(ENOSPC)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_local_failpoints_toggle() {
        clear();
        assert!(maybe_fail("wal.sync").is_ok());
        enable("wal.sync");
        let err = maybe_fail("wal.sync").unwrap_err();
        assert!(err.to_string().contains("wal.sync"));
        disable("wal.sync");
        assert!(!is_enabled("wal.sync"));
    }

    #[test]
    fn disk_full_action_raises_enospc() {
        clear();
        enable_with("wal.append", FailAction::DiskFull);
        let err = maybe_fail("wal.append").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(ENOSPC));
        clear();
    }
}
