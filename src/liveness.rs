//! Process liveness and start-time probes (platform-variant).
//!
//! Two operations, both best-effort:
//!
//! - [`is_alive`]: whether a PID currently refers to a live process.
//! - [`process_start`]: the process's start time in nanoseconds, used to
//!   defend against PID recycling. Returns `None` on platforms where we
//!   have no reliable probe; callers must treat that as "unknown", not
//!   "definitely still the same process".
//!
//! Start-time values are only ever meaningful when compared to another
//! value captured on the *same host*; they are not wall-clock timestamps.

pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        is_alive_unix(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
fn is_alive_unix(pid: u32) -> bool {
    // SAFETY: signal 0 delivers nothing; it only probes existence and
    // permission. A return of 0 means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM still proves the process exists (we just can't signal it).
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

pub fn process_start(pid: u32) -> Option<i64> {
    #[cfg(target_os = "linux")]
    {
        linux_process_start(pid)
    }
    #[cfg(target_os = "macos")]
    {
        macos_process_start(pid)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        None
    }
}

#[cfg(target_os = "linux")]
fn linux_process_start(pid: u32) -> Option<i64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // `comm` (field 2) is parenthesized and may itself contain ')' or
    // whitespace, so field 22 (starttime) is located by skipping past the
    // *last* ')' and then counting whitespace-separated fields from there.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // `after_comm` begins at field 3 (state); starttime is field 22, index 19.
    let starttime_ticks: u64 = fields.get(19)?.parse().ok()?;
    let ticks_per_sec = clock_ticks_per_sec();
    let ns = (starttime_ticks as f64 / ticks_per_sec as f64 * 1_000_000_000.0).round() as i64;
    Some(ns)
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> i64 {
    // SAFETY: sysconf(_SC_CLK_TCK) has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks } else { 100 }
}

#[cfg(target_os = "macos")]
fn macos_process_start(pid: u32) -> Option<i64> {
    use std::mem;

    let mib: [libc::c_int; 4] = [
        libc::CTL_KERN,
        libc::KERN_PROC,
        libc::KERN_PROC_PID,
        pid as libc::c_int,
    ];
    let mut size: libc::size_t = 0;
    // SAFETY: querying the required buffer size with a null oldp is always valid.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut _,
            mib.len() as u32,
            std::ptr::null_mut(),
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc != 0 || size == 0 {
        return None;
    }

    let mut buf = vec![0u8; size];
    // SAFETY: buf is sized by the prior query; sysctl will write at most `size` bytes.
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut _,
            mib.len() as u32,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc != 0 || size < mem::size_of::<libc::timeval>() {
        return None;
    }

    // kp_proc.p_starttime is the leading timeval in the returned kinfo_proc.
    // SAFETY: the buffer is at least size_of::<timeval>() bytes, just checked above.
    let tv: libc::timeval = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const libc::timeval) };
    Some(tv.tv_sec as i64 * 1_000_000_000 + tv.tv_usec as i64 * 1_000)
}
