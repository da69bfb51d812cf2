//! Node actions and waiting for them to complete.

pub mod tracker;

pub use tracker::{machine_ready, sequence_completed, BootIdChanged, Node, PostCheck, Tracker};

use nodeplane_core::{Error, Result};

/// Resolve whether to wait for an action. `--debug` implies `--wait`; neither
/// works over the insecure maintenance connection, which cannot follow the
/// node through a reboot.
pub fn wait_requested(wait: bool, debug: bool, insecure: bool) -> Result<bool> {
    let wait = wait || debug;
    if wait && insecure {
        return Err(Error::validation(
            "--wait and --insecure are mutually exclusive",
        ));
    }
    Ok(wait)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_implies_wait() {
        assert!(wait_requested(false, true, false).unwrap());
        assert!(wait_requested(true, false, false).unwrap());
        assert!(!wait_requested(false, false, false).unwrap());
        assert!(!wait_requested(false, false, true).unwrap());
    }

    #[test]
    fn wait_is_rejected_with_insecure() {
        assert!(wait_requested(true, false, true).is_err());
        // --debug turns on --wait, so it conflicts too
        assert!(wait_requested(false, true, true).is_err());
    }
}
