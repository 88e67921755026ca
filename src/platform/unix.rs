use std::process::Child;

use tracing::debug;

/// Kills the process group led by `child`.
///
/// The child is spawned as a group leader, so this also reaches anything it
/// forked. Falls back to killing the child alone if the group is gone.
pub(super) fn kill_tree(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };

    // SAFETY: killpg has no memory-safety preconditions; a stale pgid only yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "killpg failed, killing child only"
        );
        let _ = child.kill();
    }
}
