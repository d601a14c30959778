use serde::{Deserialize, Serialize};

/// A typed organization setting value. Stored as `value_json` alongside a
/// `value_type` discriminant so reads can deserialize without guessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Str(String),
    StrList(Vec<String>),
}

impl SettingValue {
    pub fn type_tag(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Str(_) => "string",
            SettingValue::StrList(_) => "string[]",
        }
    }
}
