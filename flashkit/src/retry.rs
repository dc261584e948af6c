// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, thread, time::Duration};

use tracing::warn;

use crate::source::{Error, Result};

/// Default retry budget for one positioned read or write.
pub const MAX_RETRIES: u32 = 5;

/// Base delay between retries. The n-th retry waits n times this long.
pub const RETRY_BASE_TIMEOUT: Duration = Duration::from_millis(100);

/// Whether an I/O error is considered a transient occurrence worth retrying.
/// Removable media tends to report these while the kernel is still settling
/// after the device was plugged in or another process briefly held it.
///
/// * Linux: `EIO`, `EBUSY`
/// * macOS: `ENXIO`, `EBUSY`
/// * Windows: `ERROR_FILE_NOT_FOUND`, `ERROR_INVALID_HANDLE`
pub fn is_transient(error: &io::Error) -> bool {
    let Some(code) = error.raw_os_error() else {
        return false;
    };

    #[cfg(target_os = "linux")]
    {
        code == libc::EIO || code == libc::EBUSY
    }
    #[cfg(target_os = "macos")]
    {
        code == libc::ENXIO || code == libc::EBUSY
    }
    #[cfg(windows)]
    {
        // ERROR_FILE_NOT_FOUND and ERROR_INVALID_HANDLE.
        code == 2 || code == 6
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = code;
        false
    }
}

/// Run `op`, retrying transient I/O errors up to `max_retries` times with a
/// linearly increasing delay. Once the budget is exhausted, the transient
/// error is re-tagged as [`Error::Unplugged`]. Non-transient errors
/// propagate immediately.
pub fn retry_on_transient<T>(
    max_retries: u32,
    base_delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut retries = 0;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(Error::Io(e)) if is_transient(&e) => {
                if retries < max_retries {
                    retries += 1;
                    warn!("Transient I/O error (attempt {retries}/{max_retries}): {e}");
                    thread::sleep(base_delay * retries);
                } else {
                    return Err(Error::Unplugged {
                        attempts: retries + 1,
                        source: e,
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }
}
