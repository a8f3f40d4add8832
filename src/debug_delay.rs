/// This function is useful for inducing random jitter into our atomic
/// operations, shaking out more possible interleavings quickly. It gets
/// fully eliminated by the compiler in non-test code.
#[cfg(test)]
pub(crate) fn debug_delay() {
    use rand::Rng;

    if rand::thread_rng().gen_ratio(1, 1000) {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}

#[cfg(not(test))]
#[inline(always)]
pub(crate) fn debug_delay() {}
