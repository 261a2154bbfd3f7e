use std::sync::atomic::{AtomicI32, Ordering};

// Set once at startup from -v/-vv/-vvv, read everywhere. Plumbing it through
// every producer call stack isn't worth it.
static VERBOSE_LEVEL: AtomicI32 = AtomicI32::new(0);

pub fn set_verbose_level(level: i32) {
    VERBOSE_LEVEL.store(level, Ordering::Relaxed);
}

pub fn verbose_level() -> i32 {
    VERBOSE_LEVEL.load(Ordering::Relaxed)
}

// verbose!(2, "..."): printed to stderr iff verbosity >= 2.
#[macro_export]
macro_rules! verbose {
    ($level:expr, $($arg:tt)*) => (
        if $crate::log::verbose_level() >= $level {
            eprintln!($($arg)*);
        }
    );
}
