use std::sync::atomic::{AtomicBool, Ordering};

static TEST_MODE: AtomicBool = AtomicBool::new(false);
static MOCK_MODE: AtomicBool = AtomicBool::new(false);

/// In test mode the scheduler records every admitted message ID
pub fn set_test_mode(value: bool) {
    TEST_MODE.store(value, Ordering::SeqCst);
}

pub fn is_test_mode() -> bool {
    TEST_MODE.load(Ordering::SeqCst)
}

/// In mock mode remote calls are recorded instead of sent
pub fn set_mock_mode(value: bool) {
    MOCK_MODE.store(value, Ordering::SeqCst);
}

pub fn is_mock_mode() -> bool {
    MOCK_MODE.load(Ordering::SeqCst)
}

/// Reset every process-wide singleton: scheduler state, KV store, snapshot
/// registry, mock transport recordings and MPI worlds. Tests call this
/// between cases.
pub fn clean_fabric() {
    crate::scheduler::scheduler().shutdown();
    crate::state::global_kv().clear();
    crate::snapshot::clear_snapshots();
    crate::transport::clear_mock_requests();
    crate::mpi::clear_worlds();
}
