use crate::util::object_model::{HeaderState, ObjectHeader};
use crate::util::ObjectReference;
use crossbeam::utils::Backoff;

/// Outcome of racing other evacuators for an object.
pub enum ForwardingAttempt {
    /// This thread owns the copy. Carries the header the object had before the race.
    Won(ObjectHeader),
    /// Another thread already copied the object.
    Forwarded(ObjectReference),
}

/// Attempt to become the thread who will forward the object.
/// The winner sets the header to BEING_FORWARDED, preventing other threads from forwarding the same object.
pub fn attempt_to_forward(object: ObjectReference) -> ForwardingAttempt {
    loop {
        let header = object.header();
        match header.state() {
            HeaderState::Object => {
                if object
                    .compare_exchange_header(header, ObjectHeader::BEING_FORWARDED)
                    .is_ok()
                {
                    return ForwardingAttempt::Won(header);
                }
            }
            HeaderState::BeingForwarded | HeaderState::Forwarded => {
                return ForwardingAttempt::Forwarded(spin_and_get_forwarded_object(object));
            }
            HeaderState::Free => panic!("Attempt to forward free cell {}", object),
        }
    }
}

/// Spin-wait for the object's forwarding to become complete and then read the forwarding pointer to the new object.
pub fn spin_and_get_forwarded_object(object: ObjectReference) -> ObjectReference {
    let backoff = Backoff::new();
    loop {
        let header = object.header();
        match header.forwarding_target() {
            Some(target) => return target,
            None => {
                debug_assert_eq!(
                    header.state(),
                    HeaderState::BeingForwarded,
                    "Invalid forwarding word {:?} for object {}",
                    header,
                    object
                );
                backoff.snooze();
            }
        }
    }
}

/// Publish the new location of an object this thread won the race for.
pub fn forward_object(object: ObjectReference, new_object: ObjectReference) {
    debug_assert_eq!(object.header().state(), HeaderState::BeingForwarded);
    object.set_header(ObjectHeader::forwarded(new_object));
}

/// Return the new location if the object has been forwarded.
pub fn get_forwarded_object(object: ObjectReference) -> Option<ObjectReference> {
    object.header().forwarding_target()
}

pub fn is_forwarded_or_being_forwarded(object: ObjectReference) -> bool {
    matches!(
        object.header().state(),
        HeaderState::Forwarded | HeaderState::BeingForwarded
    )
}
