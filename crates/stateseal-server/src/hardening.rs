//! Process hardening applied before any key material is loaded.
//!
//! The proxy holds the local private key, transit credentials and decrypted
//! state documents in memory. A core dump would write all of them to disk,
//! so core dumps are disabled at startup. No-op on non-Unix platforms.

/// Set `RLIMIT_CORE` to 0 for this process.
///
/// # Errors
///
/// Returns a description of the failure if `setrlimit` is rejected.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `setrlimit` only reads the `rlimit` value passed by reference,
    // which is a fully initialized local. It changes a kernel-side limit and
    // touches no Rust-managed memory.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };

    if rc == 0 {
        Ok(())
    } else {
        Err(format!(
            "setrlimit(RLIMIT_CORE, 0) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}
