use core::ffi;

pub(crate) fn errno() -> i32 {
    // SAFETY: Surely errno_location would be valid, right?
    unsafe { *libc::__errno_location() }
}

/// Calls `f` with the message for the current `errno`.
pub(crate) fn with_last_os_error_str<R>(f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 512] = [0; 512];

    // SAFETY: Our buffer length is passed correctly
    let error = unsafe { libc::strerror_r(errno(), buf.as_mut_ptr().cast(), buf.len()) };
    let msg = if error != 0 {
        "<strerror_r returned an error>"
    } else {
        // SAFETY: strerror_r writes a nul-terminated string to buf, and we zero
        // initialized it in case it wrote nothing.
        unsafe { ffi::CStr::from_ptr(buf.as_ptr().cast()) }
            .to_str()
            .unwrap_or("<error message contained invalid utf8>")
    };
    f(msg)
}
