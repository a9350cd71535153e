//! Alias and group index over assembled motors
//!
//! Every motor is addressable by its own name; every group definition is
//! flattened into an ordered sequence of the same shared descriptors. Groups
//! may reference other groups in any definition order. A group never owns
//! state of its own, it is only a view.

use crate::config::validate_name;
use crate::motor::MotorDescriptor;
use crate::{ArmatureError, Result};
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// What a name resolves to
#[derive(Debug, Clone, Copy)]
pub enum Alias<'a> {
    Motor(&'a Arc<MotorDescriptor>),
    Group(&'a [Arc<MotorDescriptor>]),
}

impl<'a> Alias<'a> {
    /// Motors addressed by this alias, a single motor counts as a group of one
    pub fn motors(&self) -> &'a [Arc<MotorDescriptor>] {
        match *self {
            Alias::Motor(motor) => std::slice::from_ref(motor),
            Alias::Group(motors) => motors,
        }
    }
}

#[derive(Debug, Default)]
pub struct AliasIndex {
    motors: IndexMap<String, Arc<MotorDescriptor>>,
    groups: IndexMap<String, Vec<Arc<MotorDescriptor>>>,
    /// motor name -> groups containing it, in group definition order
    memberships: HashMap<String, Vec<String>>,
}

/// Depth-first traversal state for one `build` call
struct GroupResolver<'a> {
    motors: &'a IndexMap<String, Arc<MotorDescriptor>>,
    definitions: &'a IndexMap<String, Vec<String>>,
    resolved: HashMap<String, Vec<Arc<MotorDescriptor>>>,
    visiting: IndexSet<String>,
}

/// One group being flattened, kept on an explicit stack
struct Frame<'a> {
    group: &'a str,
    members: std::slice::Iter<'a, String>,
    flattened: Vec<Arc<MotorDescriptor>>,
    seen: HashSet<String>,
}

impl<'a> Frame<'a> {
    fn new(group: &'a str, members: &'a [String]) -> Self {
        Self {
            group,
            members: members.iter(),
            flattened: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn extend(&mut self, motors: &[Arc<MotorDescriptor>]) {
        for motor in motors {
            if self.seen.insert(motor.name().to_string()) {
                self.flattened.push(Arc::clone(motor));
            } else {
                debug!(
                    "Group '{}' lists motor '{}' more than once; keeping first position",
                    self.group,
                    motor.name()
                );
            }
        }
    }
}

impl<'a> GroupResolver<'a> {
    fn definition(&self, group: &str) -> Result<(&'a str, &'a [String])> {
        self.definitions
            .get_key_value(group)
            .map(|(name, members)| (name.as_str(), members.as_slice()))
            .ok_or_else(|| {
                ArmatureError::Configuration(format!("group '{}' is not defined", group))
            })
    }

    fn cycle_through(&self, group: &str) -> Option<ArmatureError> {
        let start = self.visiting.get_index_of(group)?;
        let mut cycle: Vec<String> = self.visiting.iter().skip(start).cloned().collect();
        cycle.push(group.to_string());
        Some(ArmatureError::CyclicGroup(cycle))
    }

    fn resolve(&mut self, group: &str) -> Result<Vec<Arc<MotorDescriptor>>> {
        if let Some(done) = self.resolved.get(group) {
            return Ok(done.clone());
        }

        let (name, members) = self.definition(group)?;
        self.visiting.insert(name.to_string());
        let mut stack = vec![Frame::new(name, members)];

        while let Some(frame) = stack.last_mut() {
            let Some(member) = frame.members.next() else {
                let Some(done) = stack.pop() else { break };
                self.visiting.shift_remove(done.group);
                self.resolved.insert(done.group.to_string(), done.flattened.clone());
                match stack.last_mut() {
                    Some(parent) => parent.extend(&done.flattened),
                    None => return Ok(done.flattened),
                }
                continue;
            };

            if let Some(motor) = self.motors.get(member) {
                frame.extend(std::slice::from_ref(motor));
            } else if let Some(done) = self.resolved.get(member) {
                frame.extend(done);
            } else if self.definitions.contains_key(member) {
                if let Some(cycle) = self.cycle_through(member) {
                    return Err(cycle);
                }
                let (nested, nested_members) = self.definition(member)?;
                self.visiting.insert(nested.to_string());
                stack.push(Frame::new(nested, nested_members));
            } else {
                return Err(ArmatureError::Configuration(format!(
                    "motorgroups.{} references unknown motor or group '{}'",
                    frame.group, member
                )));
            }
        }

        Err(ArmatureError::Configuration(format!("group '{}' did not resolve", group)))
    }
}

impl AliasIndex {
    /// Build the index from resolved motors and ordered group definitions
    pub fn build(
        motors: &[Arc<MotorDescriptor>],
        group_definitions: &[(String, Vec<String>)],
    ) -> Result<Self> {
        // Step 1: every motor under its own name
        let mut motor_index: IndexMap<String, Arc<MotorDescriptor>> = IndexMap::new();
        for motor in motors {
            if motor_index
                .insert(motor.name().to_string(), Arc::clone(motor))
                .is_some()
            {
                return Err(ArmatureError::DuplicateName(motor.name().to_string()));
            }
        }

        let mut definitions: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, members) in group_definitions {
            validate_name("group", name)?;
            if motor_index.contains_key(name) || definitions.contains_key(name) {
                return Err(ArmatureError::DuplicateName(name.clone()));
            }
            definitions.insert(name.clone(), members.clone());
        }

        // Step 2 and 3: resolve and flatten each group
        let mut resolver = GroupResolver {
            motors: &motor_index,
            definitions: &definitions,
            resolved: HashMap::new(),
            visiting: IndexSet::new(),
        };

        let mut groups = IndexMap::new();
        for name in definitions.keys() {
            let flattened = resolver.resolve(name)?;
            groups.insert(name.clone(), flattened);
        }

        let mut memberships: HashMap<String, Vec<String>> = HashMap::new();
        for (group, members) in &groups {
            for motor in members {
                memberships
                    .entry(motor.name().to_string())
                    .or_default()
                    .push(group.clone());
            }
        }

        for (motor, containing) in &memberships {
            if containing.len() > 1 {
                debug!("Motor '{}' is shared by groups {:?}", motor, containing);
            }
        }

        Ok(Self {
            motors: motor_index,
            groups,
            memberships,
        })
    }

    pub fn motor(&self, name: &str) -> Option<&Arc<MotorDescriptor>> {
        self.motors.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&[Arc<MotorDescriptor>]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Look a name up as a motor first, then as a group
    pub fn get(&self, name: &str) -> Option<Alias<'_>> {
        self.motor(name)
            .map(Alias::Motor)
            .or_else(|| self.group(name).map(Alias::Group))
    }

    pub fn motor_names(&self) -> impl Iterator<Item = &str> {
        self.motors.keys().map(String::as_str)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Groups containing a motor, in group definition order
    pub fn groups_of(&self, motor: &str) -> &[String] {
        self.memberships
            .get(motor)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve a list of motor or group names into distinct motors, first-seen order
    pub fn expand(&self, names: &[String]) -> Result<Vec<Arc<MotorDescriptor>>> {
        let mut seen = IndexSet::new();
        let mut motors = Vec::new();
        for name in names {
            let alias = self.get(name).ok_or_else(|| {
                ArmatureError::Configuration(format!("unknown motor or group '{}'", name))
            })?;
            for motor in alias.motors() {
                if seen.insert(motor.name().to_string()) {
                    motors.push(Arc::clone(motor));
                }
            }
        }
        Ok(motors)
    }

    pub fn motor_count(&self) -> usize {
        self.motors.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotorConfig;

    fn motor(name: &str, id: u32) -> Arc<MotorDescriptor> {
        let entry = MotorConfig {
            id,
            model: None,
            offset: 0.0,
            orientation: Default::default(),
            limits: None,
        };
        Arc::new(MotorDescriptor::from_config(name, &entry).unwrap())
    }

    fn groups(defs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        defs.iter()
            .map(|(name, members)| {
                (name.to_string(), members.iter().map(|m| m.to_string()).collect())
            })
            .collect()
    }

    fn names(motors: &[Arc<MotorDescriptor>]) -> Vec<&str> {
        motors.iter().map(|m| m.name()).collect()
    }

    #[test]
    fn test_group_order_and_identity() {
        let motors = vec![motor("m1", 0), motor("m2", 1)];
        let index = AliasIndex::build(&motors, &groups(&[("arm", &["m1", "m2"])])).unwrap();

        let arm = index.group("arm").unwrap();
        assert_eq!(names(arm), vec!["m1", "m2"]);
        assert!(Arc::ptr_eq(index.motor("m1").unwrap(), &arm[0]));
        assert!(Arc::ptr_eq(&motors[1], &arm[1]));
    }

    #[test]
    fn test_nested_groups_flatten_with_first_seen_dedup() {
        let motors = vec![motor("a", 0), motor("b", 1), motor("c", 2)];
        let defs = groups(&[
            ("torso", &["upper", "c", "a"]),
            ("upper", &["b", "a", "b"]),
        ]);
        let index = AliasIndex::build(&motors, &defs).unwrap();

        assert_eq!(names(index.group("upper").unwrap()), vec!["b", "a"]);
        assert_eq!(names(index.group("torso").unwrap()), vec!["b", "a", "c"]);
        assert_eq!(index.group_names().collect::<Vec<_>>(), vec!["torso", "upper"]);
    }

    #[test]
    fn test_flattening_is_idempotent() {
        let motors = vec![motor("a", 0), motor("b", 1)];
        let defs = groups(&[("g", &["b", "a", "b", "a"]), ("h", &["g", "g"])]);

        let first = AliasIndex::build(&motors, &defs).unwrap();
        let second = AliasIndex::build(&motors, &defs).unwrap();
        assert_eq!(names(first.group("g").unwrap()), names(second.group("g").unwrap()));
        assert_eq!(names(first.group("h").unwrap()), vec!["b", "a"]);
    }

    #[test]
    fn test_overlapping_groups_share_descriptors() {
        let motors = vec![motor("a", 0), motor("b", 1)];
        let defs = groups(&[("left", &["a", "b"]), ("right", &["b"])]);
        let index = AliasIndex::build(&motors, &defs).unwrap();

        assert!(Arc::ptr_eq(&index.group("left").unwrap()[1], &index.group("right").unwrap()[0]));
        assert_eq!(index.groups_of("b"), &["left".to_string(), "right".to_string()]);
        assert!(index.groups_of("nobody").is_empty());
    }

    #[test]
    fn test_duplicate_motor_name() {
        let motors = vec![motor("m1", 0), motor("m1", 1)];
        let err = AliasIndex::build(&motors, &[]).unwrap_err();
        assert!(matches!(err, ArmatureError::DuplicateName(ref name) if name == "m1"));
    }

    #[test]
    fn test_group_named_like_motor() {
        let motors = vec![motor("m1", 0)];
        let err = AliasIndex::build(&motors, &groups(&[("m1", &["m1"])])).unwrap_err();
        assert!(matches!(err, ArmatureError::DuplicateName(_)));
    }

    #[test]
    fn test_dangling_reference() {
        let motors = vec![motor("m1", 0)];
        let err = AliasIndex::build(&motors, &groups(&[("arm", &["m1", "m9"])])).unwrap_err();
        assert!(matches!(err, ArmatureError::Configuration(ref msg) if msg.contains("m9")));
    }

    #[test]
    fn test_cycles_are_reported() {
        let motors = vec![motor("m1", 0)];

        let err = AliasIndex::build(&motors, &groups(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        match err {
            ArmatureError::CyclicGroup(path) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("expected a cycle, got {:?}", other),
        }

        let err =
            AliasIndex::build(&motors, &groups(&[("self_ref", &["m1", "self_ref"])])).unwrap_err();
        assert!(matches!(err, ArmatureError::CyclicGroup(_)));
    }

    #[test]
    fn test_deep_chain_resolves() {
        let motors = vec![motor("m1", 0)];
        let depth = 100_000;
        // Outermost group first, so resolution walks the whole chain at once
        let mut defs: Vec<(String, Vec<String>)> = (1..depth)
            .rev()
            .map(|i| (format!("g{}", i), vec![format!("g{}", i - 1)]))
            .collect();
        defs.push(("g0".to_string(), vec!["m1".to_string()]));

        let index = AliasIndex::build(&motors, &defs).unwrap();
        assert_eq!(names(index.group("g99999").unwrap()), vec!["m1"]);
        assert_eq!(names(index.group("g0").unwrap()), vec!["m1"]);
        assert_eq!(index.groups_of("m1").len(), depth);
    }

    #[test]
    fn test_long_cycle_reports_cyclic_group() {
        let motors = vec![motor("m1", 0)];
        let n = 100_000;
        let defs: Vec<(String, Vec<String>)> = (0..n)
            .map(|i| (format!("g{}", i), vec!["m1".to_string(), format!("g{}", (i + 1) % n)]))
            .collect();

        match AliasIndex::build(&motors, &defs).unwrap_err() {
            ArmatureError::CyclicGroup(path) => {
                assert_eq!(path.len(), n + 1);
                assert_eq!(path.first(), path.last());
                assert_eq!(path[1], "g1");
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_below_resolved_prefix() {
        let motors = vec![motor("a", 0), motor("b", 1)];
        let defs = groups(&[
            ("top", &["a", "mid"]),
            ("mid", &["b", "loop_x"]),
            ("loop_x", &["loop_y"]),
            ("loop_y", &["loop_x"]),
        ]);
        match AliasIndex::build(&motors, &defs).unwrap_err() {
            ArmatureError::CyclicGroup(path) => {
                assert_eq!(path, vec!["loop_x", "loop_y", "loop_x"])
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_and_expand() {
        let motors = vec![motor("a", 0), motor("b", 1), motor("c", 2)];
        let index = AliasIndex::build(&motors, &groups(&[("ab", &["a", "b"])])).unwrap();

        assert!(matches!(index.get("a"), Some(Alias::Motor(_))));
        assert_eq!(index.get("ab").unwrap().motors().len(), 2);
        assert!(index.get("zz").is_none());

        let expanded = index.expand(&["c".to_string(), "ab".to_string(), "a".to_string()]).unwrap();
        assert_eq!(names(&expanded), vec!["c", "a", "b"]);
        assert!(index.expand(&["zz".to_string()]).is_err());
    }
}
