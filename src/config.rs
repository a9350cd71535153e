//! Robot configuration loading
//!
//! A configuration document (JSON or YAML) describes the motors of a robot,
//! the logical groups over them, optional physical controllers and the
//! synchronization policy. Entry order is kept exactly as written, including
//! repeated keys, so later stages can report them instead of silently keeping
//! the last one.

use crate::{ArmatureError, Result};
use regex::Regex;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::LazyLock;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("name pattern is a valid regex")
});

/// Check that a motor or group name can be used as an accessor name
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ArmatureError::Configuration(format!(
            "{} name '{}' is not a valid identifier",
            kind, name
        )))
    }
}

/// Mapping entries in document order, repeated keys included
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedEntries<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedEntries<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OrderedEntries<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First entry with the given name
    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedEntries<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = OrderedEntries<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of names to entries")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, T>()? {
                    entries.push((name, value));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

impl<T: Serialize> Serialize for OrderedEntries<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.0.iter().map(|(name, value)| (name, value)))
    }
}

/// Mounting direction of a motor relative to its joint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Direct,
    Indirect,
}

impl Orientation {
    pub fn sign(self) -> f64 {
        match self {
            Orientation::Direct => 1.0,
            Orientation::Indirect => -1.0,
        }
    }
}

/// One entry of the `motors` section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MotorConfig {
    pub id: u32,
    #[serde(default, alias = "type")]
    pub model: Option<String>,
    /// Offset in degrees between the backend zero and the joint zero
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub orientation: Orientation,
    /// `[lower, upper]` in degrees, joint frame
    #[serde(default, alias = "angle_limit")]
    pub limits: Option<[f64; 2]>,
}

impl MotorConfig {
    /// Parse the raw entry stored under `motors.<name>`
    pub fn parse(name: &str, raw: &Value) -> Result<Self> {
        if !raw.is_object() {
            return Err(ArmatureError::Configuration(format!(
                "motors.{}: entry must be a mapping",
                name
            )));
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| ArmatureError::Configuration(format!("motors.{}: {}", name, e)))
    }
}

/// One entry of the `controllers` section
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerDefinition {
    pub name: String,
    /// Bus address, `None` when the entry says `auto` or gives nothing
    pub port: Option<String>,
    /// Motor or group names driven by this controller
    pub attached_motors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ControllerEntry {
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    attached_motors: Vec<String>,
}

/// Synchronization and connection policy (`sync` section)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    pub rate_hz: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub bind_timeout_ms: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub sync_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

impl SyncConfig {
    /// Synchronization rate with default fallback
    pub fn rate_hz(&self) -> u32 {
        self.rate_hz.unwrap_or(50)
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms.unwrap_or(2000)
    }

    pub fn bind_timeout_ms(&self) -> u64 {
        self.bind_timeout_ms.unwrap_or(2000)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.unwrap_or(3)
    }

    pub fn sync_attempts(&self) -> u32 {
        self.sync_attempts.unwrap_or(3)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.retry_delay_ms.unwrap_or(50)
    }

    pub fn max_retry_delay_ms(&self) -> u64 {
        self.max_retry_delay_ms.unwrap_or(1000)
    }

    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms.unwrap_or(500)
    }

    fn validate(&self) -> Result<()> {
        let zero_field = [
            ("rate_hz", self.rate_hz.map(u64::from)),
            ("connect_attempts", self.connect_attempts.map(u64::from)),
            ("sync_attempts", self.sync_attempts.map(u64::from)),
        ]
        .into_iter()
        .find(|(_, value)| *value == Some(0));

        if let Some((field, _)) = zero_field {
            return Err(ArmatureError::Configuration(format!(
                "sync.{} must be greater than zero",
                field
            )));
        }
        Ok(())
    }
}

/// Parsed robot configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RobotConfig {
    #[serde(default)]
    motors: Option<OrderedEntries<Value>>,
    #[serde(default)]
    motorgroups: Option<OrderedEntries<Value>>,
    #[serde(default)]
    controllers: Option<OrderedEntries<Value>>,
    #[serde(default)]
    sync: Option<SyncConfig>,
}

impl RobotConfig {
    /// Load a configuration file; `.json` files are parsed as JSON, anything else as YAML
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ArmatureError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let shape: Value = serde_json::from_str(contents)
            .map_err(|e| ArmatureError::Configuration(format!("Invalid JSON document: {}", e)))?;
        check_shape(&shape)?;

        // Parsed again from the text so repeated motor keys survive
        let config: RobotConfig = serde_json::from_str(contents)
            .map_err(|e| ArmatureError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.finish()
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let shape: Value = serde_yaml::from_str(contents)
            .map_err(|e| ArmatureError::Configuration(format!("Invalid YAML document: {}", e)))?;
        check_shape(&shape)?;

        let config: RobotConfig = serde_yaml::from_str(contents)
            .map_err(|e| ArmatureError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.finish()
    }

    /// Build from an already parsed JSON value
    pub fn from_value(document: Value) -> Result<Self> {
        check_shape(&document)?;
        let config: RobotConfig = serde_json::from_value(document)
            .map_err(|e| ArmatureError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.finish()
    }

    fn finish(self) -> Result<Self> {
        self.sync().validate()?;
        Ok(self)
    }

    /// Raw motor entries in document order
    pub fn motor_entries(&self) -> &[(String, Value)] {
        self.motors.as_ref().map(|m| m.0.as_slice()).unwrap_or_default()
    }

    pub fn motor_names(&self) -> impl Iterator<Item = &str> {
        self.motor_entries().iter().map(|(name, _)| name.as_str())
    }

    /// Raw entry for a motor, first occurrence when the name is repeated
    pub fn motor_entry(&self, name: &str) -> Option<&Value> {
        self.motors.as_ref().and_then(|motors| motors.get(name))
    }

    pub fn has_groups(&self) -> bool {
        self.motorgroups.as_ref().is_some_and(|groups| !groups.is_empty())
    }

    /// Group definitions in document order, each as its ordered member names
    pub fn group_definitions(&self) -> Result<Vec<(String, Vec<String>)>> {
        let Some(groups) = &self.motorgroups else {
            return Ok(Vec::new());
        };
        groups
            .iter()
            .map(|(name, members)| {
                let members = string_list(members).ok_or_else(|| {
                    ArmatureError::Configuration(format!(
                        "motorgroups.{} must be a list of motor or group names",
                        name
                    ))
                })?;
                Ok((name.to_string(), members))
            })
            .collect()
    }

    /// Controller definitions in document order (physical backends only)
    pub fn controller_definitions(&self) -> Result<Vec<ControllerDefinition>> {
        let Some(controllers) = &self.controllers else {
            return Ok(Vec::new());
        };
        controllers
            .iter()
            .map(|(name, raw)| {
                let entry: ControllerEntry = serde_json::from_value(raw.clone()).map_err(|e| {
                    ArmatureError::Configuration(format!("controllers.{}: {}", name, e))
                })?;
                let port = entry
                    .port
                    .filter(|port| !port.is_empty() && !port.eq_ignore_ascii_case("auto"));
                Ok(ControllerDefinition {
                    name: name.to_string(),
                    port,
                    attached_motors: entry.attached_motors,
                })
            })
            .collect()
    }

    pub fn sync(&self) -> &SyncConfig {
        static DEFAULT_SYNC: SyncConfig = SyncConfig {
            rate_hz: None,
            connect_timeout_ms: None,
            bind_timeout_ms: None,
            connect_attempts: None,
            sync_attempts: None,
            retry_delay_ms: None,
            max_retry_delay_ms: None,
            shutdown_grace_ms: None,
        };
        self.sync.as_ref().unwrap_or(&DEFAULT_SYNC)
    }

    pub fn has_controllers(&self) -> bool {
        self.controllers.as_ref().is_some_and(|controllers| !controllers.is_empty())
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

/// Top-level shape checks, so errors name the offending key
fn check_shape(document: &Value) -> Result<()> {
    let root = document.as_object().ok_or_else(|| {
        ArmatureError::Configuration("configuration document must be a mapping".to_string())
    })?;

    match root.get("motors") {
        None | Some(Value::Null) => {
            return Err(ArmatureError::Configuration(
                "missing required key `motors`".to_string(),
            ))
        }
        Some(Value::Object(_)) => {}
        Some(_) => {
            return Err(ArmatureError::Configuration(
                "`motors` must be a mapping of motor names to entries".to_string(),
            ))
        }
    }

    for key in ["motorgroups", "controllers", "sync"] {
        match root.get(key) {
            None | Some(Value::Null) | Some(Value::Object(_)) => {}
            Some(_) => {
                return Err(ArmatureError::Configuration(format!(
                    "`{}` must be a mapping",
                    key
                )))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_entries_keep_document_order() {
        let config = RobotConfig::from_json_str(
            r#"{"motors": {"m2": {"id": 1}, "m1": {"id": 0}}, "motorgroups": {"arm": ["m2", "m1"]}}"#,
        )
        .unwrap();

        let names: Vec<&str> = config.motor_names().collect();
        assert_eq!(names, vec!["m2", "m1"]);

        let groups = config.group_definitions().unwrap();
        assert_eq!(groups, vec![("arm".to_string(), vec!["m2".to_string(), "m1".to_string()])]);
    }

    #[test]
    fn test_repeated_motor_keys_are_preserved() {
        let config = RobotConfig::from_json_str(
            r#"{"motors": {"m1": {"id": 0}, "m1": {"id": 1}}}"#,
        )
        .unwrap();

        assert_eq!(config.motor_entries().len(), 2);
        assert_eq!(config.motor_entry("m1"), Some(&json!({"id": 0})));
    }

    #[test]
    fn test_yaml_accepts_legacy_field_names() {
        let yaml = r#"
motors:
  shoulder:
    id: 11
    type: MX-28
    orientation: indirect
    offset: 90.0
    angle_limit: [-90.0, 120.0]
motorgroups:
  arm: [shoulder]
"#;
        let config = RobotConfig::from_yaml_str(yaml).unwrap();
        let raw = config.motor_entry("shoulder").unwrap();
        let motor = MotorConfig::parse("shoulder", raw).unwrap();

        assert_eq!(motor.id, 11);
        assert_eq!(motor.model.as_deref(), Some("MX-28"));
        assert_eq!(motor.orientation, Orientation::Indirect);
        assert_eq!(motor.offset, 90.0);
        assert_eq!(motor.limits, Some([-90.0, 120.0]));
    }

    #[test]
    fn test_missing_motors_key_is_named() {
        let err = RobotConfig::from_value(json!({"motorgroups": {}})).unwrap_err();
        assert!(matches!(err, ArmatureError::Configuration(ref msg) if msg.contains("`motors`")));
    }

    #[test]
    fn test_motors_must_be_a_mapping() {
        let err = RobotConfig::from_value(json!({"motors": ["m1"]})).unwrap_err();
        assert!(matches!(err, ArmatureError::Configuration(ref msg) if msg.contains("`motors` must be a mapping")));
    }

    #[test]
    fn test_group_members_must_be_names() {
        let config = RobotConfig::from_value(json!({
            "motors": {"m1": {"id": 0}},
            "motorgroups": {"arm": "m1"}
        }))
        .unwrap();

        let err = config.group_definitions().unwrap_err();
        assert!(matches!(err, ArmatureError::Configuration(ref msg) if msg.contains("motorgroups.arm")));
    }

    #[test]
    fn test_malformed_motor_entry_is_named() {
        let config =
            RobotConfig::from_value(json!({"motors": {"elbow": {"offset": 3.0}}})).unwrap();
        let err = MotorConfig::parse("elbow", config.motor_entry("elbow").unwrap()).unwrap_err();
        assert!(matches!(err, ArmatureError::Configuration(ref msg) if msg.starts_with("motors.elbow")));
    }

    #[test]
    fn test_controller_auto_port_means_default() {
        let config = RobotConfig::from_value(json!({
            "motors": {"m1": {"id": 1}},
            "controllers": {
                "upper": {"port": "auto", "attached_motors": ["m1"]},
                "lower": {"port": "/dev/ttyUSB1", "attached_motors": []}
            }
        }))
        .unwrap();

        let controllers = config.controller_definitions().unwrap();
        assert_eq!(controllers[0].port, None);
        assert_eq!(controllers[0].attached_motors, vec!["m1".to_string()]);
        assert_eq!(controllers[1].port.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_sync_defaults_and_validation() {
        let config = RobotConfig::from_value(json!({"motors": {}})).unwrap();
        assert_eq!(config.sync().rate_hz(), 50);
        assert_eq!(config.sync().connect_attempts(), 3);

        let err =
            RobotConfig::from_value(json!({"motors": {}, "sync": {"rate_hz": 0}})).unwrap_err();
        assert!(matches!(err, ArmatureError::Configuration(ref msg) if msg.contains("sync.rate_hz")));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("motor", "l_shoulder_y").is_ok());
        assert!(validate_name("motor", "2nd").is_err());
        assert!(validate_name("group", "left arm").is_err());
    }
}
