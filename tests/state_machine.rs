use kybernate::cuda::{Checkpointer, CudaDriver, DriverCall, FakeDriver, ProcessState};
use kybernate::KybernateError;
use proptest::prelude::*;
use std::sync::Arc;

const PID: u32 = 4242;

fn machine() -> (Checkpointer, Arc<FakeDriver>) {
    let driver = Arc::new(FakeDriver::new());
    driver.register(PID);
    (Checkpointer::new(driver.clone()), driver)
}

#[test]
fn test_happy_checkpoint_restore_cycle() {
    let (machine, driver) = machine();

    machine.full_checkpoint(PID, 5000).unwrap();
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Checkpointed);
    // No rollback happened on the happy path.
    assert_eq!(driver.unlock_count(), 0);

    machine.full_restore(PID, None).unwrap();
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Running);
    assert_eq!(driver.unlock_count(), 1);
}

#[test]
fn test_lock_timeout_surfaces_and_leaves_running() {
    let (machine, driver) = machine();
    driver.set_lock_delay_ms(2000);

    let err = machine.full_checkpoint(PID, 500).unwrap_err();
    assert!(err.is_timeout());
    match err {
        KybernateError::Driver { op, .. } => assert_eq!(op, "lock"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Running);
}

#[test]
fn test_checkpoint_failure_rolls_back_to_running() {
    let (machine, driver) = machine();
    driver.fail_checkpoint_with(700);

    let err = machine.full_checkpoint(PID, 5000).unwrap_err();
    match err {
        KybernateError::Driver { code, op } => {
            assert_eq!(code, 700);
            assert_eq!(op, "checkpoint");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The rollback unlock was issued and took effect.
    assert_eq!(driver.unlock_count(), 1);
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Running);
}

#[test]
fn test_full_checkpoint_refuses_checkpointed_process() {
    let (machine, driver) = machine();
    machine.full_checkpoint(PID, 5000).unwrap();
    let calls_before = driver.calls().len();

    let err = machine.full_checkpoint(PID, 5000).unwrap_err();
    match err {
        KybernateError::WrongState { expected, observed } => {
            assert_eq!(expected, ProcessState::Running);
            assert_eq!(observed, ProcessState::Checkpointed);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Only the state observation happened; no transition was attempted.
    let calls = driver.calls();
    assert_eq!(calls.len(), calls_before + 1);
    assert!(matches!(calls.last(), Some(DriverCall::GetState(_))));
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Checkpointed);
}

#[test]
fn test_full_restore_refuses_running_process() {
    let (machine, driver) = machine();

    let err = machine.full_restore(PID, None).unwrap_err();
    match err {
        KybernateError::WrongState { expected, observed } => {
            assert_eq!(expected, ProcessState::Checkpointed);
            assert_eq!(observed, ProcessState::Running);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Running);
}

#[test]
fn test_unlock_failure_in_restore_is_surfaced_without_relock() {
    let (machine, driver) = machine();
    machine.full_checkpoint(PID, 5000).unwrap();
    driver.fail_unlock_with(304);

    let err = machine.full_restore(PID, None).unwrap_err();
    match err {
        KybernateError::Driver { code, op } => {
            assert_eq!(code, 304);
            assert_eq!(op, "unlock");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // VRAM was repopulated; the process stays locked and no re-lock or
    // retry was attempted.
    assert_eq!(driver.get_state(PID).unwrap(), ProcessState::Locked);
    let locks = driver
        .calls()
        .iter()
        .filter(|c| matches!(c, DriverCall::Lock { .. }))
        .count();
    assert_eq!(locks, 1);
    assert_eq!(driver.unlock_count(), 1);
}

fn diagram_next(op: u8, state: ProcessState) -> Option<ProcessState> {
    match (op, state) {
        (0, ProcessState::Running) => Some(ProcessState::Locked),
        (1, ProcessState::Locked) => Some(ProcessState::Checkpointed),
        (2, ProcessState::Checkpointed) => Some(ProcessState::Locked),
        (3, ProcessState::Locked) => Some(ProcessState::Running),
        _ => None,
    }
}

proptest! {
    /// Any sequence of raw driver operations either follows the transition
    /// diagram exactly or fails with a wrong-state error and no effect.
    #[test]
    fn test_state_machine_closure(ops in proptest::collection::vec(0u8..4, 1..48)) {
        let driver = FakeDriver::new();
        driver.register(PID);
        let mut model = ProcessState::Running;

        for op in ops {
            let result = match op {
                0 => driver.lock(PID, 1000),
                1 => driver.checkpoint(PID),
                2 => driver.restore(PID),
                _ => driver.unlock(PID),
            };

            match diagram_next(op, model) {
                Some(next) => {
                    prop_assert!(result.is_ok(), "valid transition failed: {:?}", result);
                    model = next;
                }
                None => {
                    prop_assert!(
                        matches!(result, Err(KybernateError::WrongState { .. })),
                        "invalid transition did not fail with WrongState: {:?}",
                        result
                    );
                }
            }
            prop_assert_eq!(driver.get_state(PID).unwrap(), model);
        }
    }
}
