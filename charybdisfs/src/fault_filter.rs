//! The fault filter (component F): decides, for a given syscall tag, whether
//! one of its registered rules fires on this call, and if so which.
//!
//! Grounded on `core/operations.py`'s `faulty` descriptor — its own comment
//! says "we can add inserting faults machinery right here", marking exactly
//! the hook point this module occupies — and on the bucket-subtraction
//! algorithm this engine's design settled on: draw one `0..100` sample, walk
//! the candidate rules in registration order subtracting each one's
//! probability, and fire the first rule the sample lands inside. A sample
//! that exhausts every candidate without landing means no fault fires this
//! call, which is also what happens when there are no candidates at all.

use rand::Rng;

use crate::configuration::Configuration;
use crate::error::CharybdisError;
use crate::fault::{Fault, SysCall};

/// Consult the registry for `sys_call`, roll the dice, and apply whichever
/// rule (if any) the roll selects. On firing, the registry's copy of the
/// rule is updated to `Status::Applied` so `GET /faults` reflects it.
///
/// Returns `Ok(())` if no rule fired, or the error the fired rule produced
/// (an injected errno for an `ErrorFault`; `Ok(())` after sleeping for a
/// `LatencyFault`).
pub fn maybe_fire(config: &Configuration, sys_call: SysCall) -> Result<(), CharybdisError> {
    let candidates = config.get_by_sys_call_with_ids(sys_call);
    if candidates.is_empty() {
        return Ok(());
    }
    let roll = rand::thread_rng().gen_range(0..100u32);
    if let Some((id, mut fault)) = pick(&candidates, roll) {
        let result = fault.apply();
        config.mark_applied(&id, fault);
        return result;
    }
    Ok(())
}

/// Pure bucket-subtraction selection, split out from [`maybe_fire`] so it can
/// be exercised with a fixed roll instead of a live random draw.
fn pick(candidates: &[(String, Fault)], mut roll: u32) -> Option<(String, Fault)> {
    for (id, fault) in candidates {
        let probability = fault.probability as u32;
        if roll < probability {
            return Some((id.clone(), *fault));
        }
        roll -= probability;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<(String, Fault)> {
        vec![
            ("a".into(), Fault::error(SysCall::Write, 30, libc::ENOSPC)),
            ("b".into(), Fault::error(SysCall::Write, 20, libc::EIO)),
        ]
    }

    #[test]
    fn a_roll_inside_the_first_bucket_selects_the_first_rule() {
        let (id, _) = pick(&candidates(), 0).expect("should select");
        assert_eq!(id, "a");
    }

    #[test]
    fn a_roll_inside_the_second_bucket_selects_the_second_rule() {
        let (id, _) = pick(&candidates(), 35).expect("should select");
        assert_eq!(id, "b");
    }

    #[test]
    fn a_roll_past_every_bucket_selects_nothing() {
        assert!(pick(&candidates(), 99).is_none());
    }

    #[test]
    fn no_registered_rules_means_no_fault_fires() {
        let config = Configuration::new();
        assert!(maybe_fire(&config, SysCall::Read).is_ok());
    }

    #[test]
    fn a_certain_error_rule_always_fires() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::Write, 100, libc::ENOSPC))
            .unwrap();
        match maybe_fire(&config, SysCall::Write) {
            Err(CharybdisError::Injected(no)) => assert_eq!(no, libc::ENOSPC),
            other => panic!("expected a certain fault to fire, got {other:?}"),
        }
    }
}
