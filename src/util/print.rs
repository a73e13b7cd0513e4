/// Write `s` to stderr without touching the allocator. This is what we use on
/// paths where the allocator itself might be the thing that is broken.
pub fn putstr(s: &str) {
    let mut bytes = s.as_bytes();
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, and fd 2 is either open or the
        //         call fails with EBADF, which we just give up on.
        let written = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}
