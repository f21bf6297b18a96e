use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::collections::HashMap;

/// Startup options the server accepts, each with its allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    pub fn supports(&self, option: &str, value: &str) -> bool {
        self.options
            .get(option)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value)))
    }
}
