//! This module defines the configuration of the robot.
//! The configuration is a RON file with one map of key/values per component.
//!
//! (
//!   components: {
//!     "drive": { "expo": 30, "max_speed": 100 },
//!     "weapon": { "expo": 20, "arm_timeout_ms": 5000 },
//!   },
//! )
use crate::error::{ErrorKind, TuError, TuResult};
use log::debug;
use ron::extensions::Extensions;
use ron::value::Value as RonValue;
use ron::Options;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::fs::read_to_string;

/// Wrapper around the ron::Value to allow for custom conversions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Value(RonValue);

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value(RonValue::Number((value as i64).into()))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value(RonValue::Number((value as i64).into()))
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value(RonValue::Number((value as i64).into()))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value(RonValue::Number(value.into()))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value(RonValue::Bool(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value(RonValue::String(value))
    }
}

impl Value {
    fn as_i64(&self) -> Option<i64> {
        match &self.0 {
            RonValue::Number(num) => num.as_i64(),
            _ => None,
        }
    }
}

// Conversions never panic: a badly typed value is reported, never coerced.
macro_rules! integer_from_value {
    ($($t:ty),*) => {
        $(
            impl TryFrom<Value> for $t {
                type Error = TuError;

                fn try_from(value: Value) -> TuResult<Self> {
                    let raw = value.as_i64().ok_or_else(|| {
                        TuError::new(
                            ErrorKind::InvalidParam,
                            format!("Expected an integer value but got {:?}", value),
                        )
                    })?;
                    <$t>::try_from(raw).map_err(|_| {
                        TuError::new(
                            ErrorKind::OutOfRange,
                            format!("{} does not fit in {}", raw, stringify!($t)),
                        )
                    })
                }
            }
        )*
    };
}

integer_from_value!(u8, u16, u32, u64, i32, i64);

impl TryFrom<Value> for f64 {
    type Error = TuError;

    fn try_from(value: Value) -> TuResult<Self> {
        match &value.0 {
            RonValue::Number(num) => Ok(num.into_f64()),
            _ => Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("Expected a float value but got {:?}", value),
            )),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = TuError;

    fn try_from(value: Value) -> TuResult<Self> {
        match value.0 {
            RonValue::Bool(b) => Ok(b),
            other => Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("Expected a bool but got {:?}", other),
            )),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = TuError;

    fn try_from(value: Value) -> TuResult<Self> {
        match value.0 {
            RonValue::String(s) => Ok(s),
            other => Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("Expected a String but got {:?}", other),
            )),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            RonValue::Number(n) => match n.as_i64() {
                Some(i) => write!(f, "{}", i),
                None => write!(f, "{}", n.into_f64()),
            },
            RonValue::String(s) => write!(f, "{}", s),
            RonValue::Bool(b) => write!(f, "{}", b),
            other => write!(f, "{:?}", other),
        }
    }
}

/// This is the configuration of a component (drive, weapon, dshot...).
/// It is a map of key/values.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ComponentConfig(pub HashMap<String, Value>);

impl Display for ComponentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        write!(f, "{{")?;
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, self.0[*key])?;
        }
        write!(f, "}}")
    }
}

// forward map interface
impl ComponentConfig {
    pub fn new() -> Self {
        ComponentConfig(HashMap::new())
    }

    /// Returns the value if it is present and converts cleanly.
    pub fn get<T: TryFrom<Value>>(&self, key: &str) -> Option<T> {
        self.0.get(key).and_then(|v| T::try_from(v.clone()).ok())
    }

    /// Returns `default` when the key is absent, an error when it is present but unusable.
    pub fn get_or<T>(&self, key: &str, default: T) -> TuResult<T>
    where
        T: TryFrom<Value, Error = TuError>,
    {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => T::try_from(v.clone()).map_err(|e| e.add_context(key)),
        }
    }

    pub fn set<T: Into<Value>>(&mut self, key: &str, value: T) {
        self.0.insert(key.to_string(), value.into());
    }
}

/// Same as `ComponentConfig::get_or` but tolerant of a missing component section.
pub fn getcfg<T>(config: Option<&ComponentConfig>, key: &str, default: T) -> TuResult<T>
where
    T: TryFrom<Value, Error = TuError>,
{
    match config {
        Some(config) => config.get_or(key, default),
        None => Ok(default),
    }
}

/// Whole robot configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RobotConfig {
    #[serde(default)]
    pub components: HashMap<String, ComponentConfig>,
}

impl RobotConfig {
    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.get(name)
    }

    pub fn set_component(&mut self, name: &str, config: ComponentConfig) {
        self.components.insert(name.to_string(), config);
    }

    fn get_options() -> Options {
        Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .with_default_extension(Extensions::UNWRAP_NEWTYPES)
    }

    pub fn deserialize_ron(ron: &str) -> TuResult<Self> {
        Self::get_options().from_str(ron).map_err(|e| {
            TuError::new(ErrorKind::InvalidParam, "Syntax error in configuration")
                .add_context(e.to_string().as_str())
        })
    }

    pub fn serialize_ron(&self) -> TuResult<String> {
        Self::get_options()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| TuError::new_with_cause("Failed to serialize configuration", e))
    }
}

/// Read a robot configuration from a file.
pub fn read_configuration(config_filename: &str) -> TuResult<RobotConfig> {
    let config_content = read_to_string(config_filename).map_err(|e| {
        TuError::from(format!(
            "Failed to read configuration file: {:?}",
            &config_filename
        ))
        .add_context(e.to_string().as_str())
    })?;
    let config = RobotConfig::deserialize_ron(&config_content)?;
    debug!(
        "Loaded {} component sections from {config_filename}",
        config.components.len()
    );
    Ok(config)
}
