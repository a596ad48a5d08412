//! Millisecond clocks.
//!
//! Deadlines inside the runtime are always expressed on the monotonic
//! clock; the realtime clock exists for log timestamps only.

use std::mem::MaybeUninit;

#[inline(always)]
pub fn monotonic_ms() -> u64 {
    gettime_ms(libc::CLOCK_MONOTONIC)
}

#[inline(always)]
pub fn realtime_ms() -> u64 {
    gettime_ms(libc::CLOCK_REALTIME)
}

#[inline]
fn gettime_ms(clock: libc::clockid_t) -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    // clock_gettime can only fail for an invalid clock id
    assert_eq!(rc, 0, "clock_gettime({})", clock);
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
