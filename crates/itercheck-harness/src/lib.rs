//! itercheck verification harness.
//!
//! This crate is intentionally not "just tests": it contains the reusable
//! scripted host and session runner that other crates (and embedders
//! validating a host integration) can drive from their own tests. The
//! end-to-end property suite lives under `tests/`.

pub mod scripted_host;
pub mod session;

pub use scripted_host::ScriptedHost;
pub use session::{CMD_AT, Session, enter_iteration};


#[cfg(test)]
mod wire_verification {
    use itercheck::{CMD_TOTAL_SIZE, DecodeOutcome, decode};
    use proptest::prelude::*;

    proptest! {
        /// Random memory essentially never decodes as a command, and
        /// decode never fails fatally on garbage (the `thrd` argument
        /// checks only run after both tag stages match, which random
        /// bytes will not).
        #[test]
        fn garbage_is_never_a_command(image in prop::collection::vec(any::<u8>(), 0..CMD_TOTAL_SIZE + 16)) {
            // Rule out the astronomically unlikely accidental tag.
            prop_assume!(image.len() < 4 || !itercheck::is_tagged([image[0], image[1], image[2], image[3]]));
            prop_assert_eq!(decode(&image).expect("garbage never errors"), DecodeOutcome::NotACommand);
        }
    }
}
