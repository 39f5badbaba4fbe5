//! Task identity for the reentrant heap guard.
//!
//! The guard needs to tell "the task that already holds this heap" from
//! "some other task". Hosted builds (`std` feature, and the test
//! harness) derive a per-thread id automatically. Bare-metal builds
//! register a provider that reports the scheduler's current task id;
//! until one is registered every caller counts as a single implicit
//! task, which is correct before the scheduler starts.

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        use core::sync::atomic::{AtomicU32, Ordering};

        static NEXT_ID: AtomicU32 = AtomicU32::new(0);

        std::thread_local! {
            static THREAD_ID: u32 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        }

        /// Id of the calling task.
        pub(crate) fn current_id() -> u32 {
            THREAD_ID.with(|id| *id)
        }
    } else {
        use core::sync::atomic::{AtomicPtr, Ordering};

        static PROVIDER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

        /// Registers the function the allocator uses to identify the
        /// calling task.
        ///
        /// The provider must return a value unique to the running task
        /// for the guard's reentrancy accounting to be sound; call this
        /// before any heap sees multi-tasking traffic.
        pub fn set_task_id_provider(provider: fn() -> u32) {
            PROVIDER.store(provider as *mut (), Ordering::Release);
        }

        /// Id of the calling task (0 before a provider is registered).
        pub(crate) fn current_id() -> u32 {
            let provider = PROVIDER.load(Ordering::Acquire);
            if provider.is_null() {
                return 0;
            }
            let provider: fn() -> u32 = unsafe { core::mem::transmute(provider) };
            provider()
        }
    }
}
