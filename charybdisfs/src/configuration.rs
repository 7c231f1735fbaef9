//! The fault-rule registry (component B in the engine's terms).
//!
//! A single `parking_lot::Mutex` guards the whole map; every method takes the
//! lock, does its work, and releases it before returning, so the Control API
//! thread and the FUSE dispatch thread never hold it across an I/O wait.
//! Grounded on `core/configuration.py`'s `set_fault`/`remove_fault`/
//! `get_fault`/`get_all_faults_ids` shape, corrected for the probability
//! budget the Python source's own test suite (`tests/core/test_configuration.py`)
//! exercises but the shipped `configuration.py` doesn't actually enforce
//! (its `get_fault`/`get_all_faults_ids` reference an undefined `cls.syscalls`
//! attribute rather than `cls.syscalls_conf` — a bug, not a behavior to copy).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::ControlApiError;
use crate::fault::{Fault, SysCall};

/// Owned, explicitly-constructed fault registry. Clone the `Arc` around it,
/// don't reach for a singleton.
#[derive(Debug, Default)]
pub struct Configuration {
    rules: Mutex<HashMap<String, Fault>>,
}

impl Configuration {
    /// An empty registry.
    pub fn new() -> Configuration {
        Configuration {
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new rule under `id`. Rejects the insert (leaving the registry
    /// unchanged) if `id` is already present, or if it would push any
    /// concrete syscall's total probability (its own rules' probabilities
    /// plus every `SysCall::All` rule's probability) over 100.
    pub fn add(&self, id: String, fault: Fault) -> Result<(), ControlApiError> {
        let mut rules = self.rules.lock();
        if rules.contains_key(&id) {
            return Err(ControlApiError::DuplicateId(id));
        }

        let mut per_tag: HashMap<SysCall, u32> = HashMap::new();
        let mut all_sum: u32 = 0;
        for existing in rules.values() {
            if existing.sys_call == SysCall::All {
                all_sum += existing.probability as u32;
            } else {
                *per_tag.entry(existing.sys_call).or_insert(0) += existing.probability as u32;
            }
        }

        let requested = fault.probability as u32;
        // A concrete tag with no rules of its own still carries the baseline
        // `all_sum`, so an `All` rule must check against that baseline too,
        // not just against tags that already have a concrete rule.
        let violates = if fault.sys_call == SysCall::All {
            all_sum + requested > 100 || per_tag.values().any(|&sum| sum + all_sum + requested > 100)
        } else {
            let existing = *per_tag.get(&fault.sys_call).unwrap_or(&0);
            existing + all_sum + requested > 100
        };
        if violates {
            let existing = if fault.sys_call == SysCall::All {
                per_tag.values().copied().max().unwrap_or(0) + all_sum
            } else {
                *per_tag.get(&fault.sys_call).unwrap_or(&0) + all_sum
            };
            return Err(ControlApiError::ProbabilityBudgetExceeded {
                sys_call: fault.sys_call.to_string(),
                existing: existing.min(100) as u8,
                requested: fault.probability,
            });
        }

        rules.insert(id, fault);
        Ok(())
    }

    /// Remove a rule by id. Returns the removed fault, or `None` if `id`
    /// wasn't present.
    pub fn remove(&self, id: &str) -> Option<Fault> {
        self.rules.lock().remove(id)
    }

    /// Look up a single rule by id.
    pub fn get(&self, id: &str) -> Option<Fault> {
        self.rules.lock().get(id).copied()
    }

    /// All rules whose tag matches `sys_call` exactly, followed by every
    /// `SysCall::All` rule — except when `sys_call` itself is `All`, in which
    /// case only the `All` rules are returned (they'd otherwise appear twice).
    pub fn get_by_sys_call(&self, sys_call: SysCall) -> Vec<Fault> {
        let rules = self.rules.lock();
        if sys_call == SysCall::All {
            return rules
                .values()
                .filter(|f| f.sys_call == SysCall::All)
                .copied()
                .collect();
        }
        let mut matching: Vec<Fault> = rules
            .values()
            .filter(|f| f.sys_call == sys_call)
            .copied()
            .collect();
        matching.extend(rules.values().filter(|f| f.sys_call == SysCall::All).copied());
        matching
    }

    /// Like [`Configuration::get_by_sys_call`], but paired with each rule's
    /// id so the caller can mark it applied after it fires.
    pub fn get_by_sys_call_with_ids(&self, sys_call: SysCall) -> Vec<(String, Fault)> {
        let rules = self.rules.lock();
        if sys_call == SysCall::All {
            return rules
                .iter()
                .filter(|(_, f)| f.sys_call == SysCall::All)
                .map(|(id, f)| (id.clone(), *f))
                .collect();
        }
        let mut matching: Vec<(String, Fault)> = rules
            .iter()
            .filter(|(_, f)| f.sys_call == sys_call)
            .map(|(id, f)| (id.clone(), *f))
            .collect();
        matching.extend(
            rules
                .iter()
                .filter(|(_, f)| f.sys_call == SysCall::All)
                .map(|(id, f)| (id.clone(), *f)),
        );
        matching
    }

    /// Every rule currently registered.
    pub fn all(&self) -> Vec<(String, Fault)> {
        self.rules
            .lock()
            .iter()
            .map(|(id, fault)| (id.clone(), *fault))
            .collect()
    }

    /// Every rule id currently registered.
    pub fn all_ids(&self) -> Vec<String> {
        self.rules.lock().keys().cloned().collect()
    }

    /// Replace the fault stored under `id`, marking it applied in place.
    /// Used by the operations engine after a rule fires so its `status`
    /// transition is visible to anyone inspecting the registry afterward.
    pub fn mark_applied(&self, id: &str, fault: Fault) {
        self.rules.lock().insert(id.to_string(), fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_syscalls_each_get_their_own_budget() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::Write, 41, libc::ENOSPC))
            .unwrap();
        config
            .add("b".into(), Fault::error(SysCall::Read, 60, libc::ENOSPC))
            .unwrap();
        assert_eq!(config.all().len(), 2);
    }

    #[test]
    fn an_all_rule_is_rejected_if_it_would_overflow_any_concrete_tag() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::Write, 41, libc::ENOSPC))
            .unwrap();
        config
            .add("b".into(), Fault::error(SysCall::Read, 60, libc::ENOSPC))
            .unwrap();
        let result = config.add("c".into(), Fault::error(SysCall::All, 50, libc::ENOSPC));
        assert!(result.is_err());
        assert_eq!(config.all().len(), 2);
    }

    #[test]
    fn exactly_one_hundred_percent_is_accepted() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::Write, 41, libc::ENOSPC))
            .unwrap();
        config
            .add("b".into(), Fault::error(SysCall::Write, 59, libc::ENOSPC))
            .unwrap();
        assert_eq!(config.all().len(), 2);
    }

    #[test]
    fn one_more_than_the_budget_is_rejected() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::Write, 41, libc::ENOSPC))
            .unwrap();
        config
            .add("b".into(), Fault::error(SysCall::Write, 59, libc::ENOSPC))
            .unwrap();
        let result = config.add("c".into(), Fault::error(SysCall::Write, 1, libc::ENOSPC));
        assert!(result.is_err());
    }

    #[test]
    fn adding_a_second_rule_under_the_same_id_is_rejected() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::Write, 10, libc::ENOSPC))
            .unwrap();
        let result = config.add("a".into(), Fault::error(SysCall::Read, 10, libc::ENOSPC));
        assert!(matches!(result, Err(ControlApiError::DuplicateId(id)) if id == "a"));
        assert_eq!(config.get("a").unwrap().sys_call, SysCall::Write);
    }

    #[test]
    fn two_all_rules_cannot_together_exceed_the_budget() {
        let config = Configuration::new();
        config
            .add("a".into(), Fault::error(SysCall::All, 60, libc::ENOSPC))
            .unwrap();
        let result = config.add("b".into(), Fault::error(SysCall::All, 50, libc::ENOSPC));
        assert!(result.is_err());
        assert_eq!(config.all().len(), 1);
    }

    #[test]
    fn remove_returns_the_removed_fault_once_then_none() {
        let config = Configuration::new();
        let fault = Fault::error(SysCall::Write, 100, libc::ENOSPC);
        config.add("a".into(), fault).unwrap();
        assert_eq!(config.remove("a"), Some(fault));
        assert_eq!(config.remove("a"), None);
        assert!(config.all().is_empty());
    }

    #[test]
    fn get_by_sys_call_includes_matching_and_wildcard_rules() {
        let config = Configuration::new();
        config
            .add("write".into(), Fault::error(SysCall::Write, 10, libc::ENOSPC))
            .unwrap();
        config
            .add("read".into(), Fault::error(SysCall::Read, 10, libc::ENOSPC))
            .unwrap();
        config
            .add("all".into(), Fault::error(SysCall::All, 10, libc::ENOSPC))
            .unwrap();

        assert_eq!(config.get_by_sys_call(SysCall::Write).len(), 2);
        assert_eq!(config.get_by_sys_call(SysCall::Read).len(), 2);
        assert_eq!(config.get_by_sys_call(SysCall::All).len(), 1);
    }
}
