//! Accelerator program synthesis primitives: entry-point names, source
//! templates, and the program record handed to the device runtime.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::Status;

/// Size of the framework's entry-point name buffer, including the NUL byte.
pub const ENTRY_POINT_NAME_CAPACITY: usize = 64;

/// Validated OpenCL kernel function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EntryPointName(String);

impl EntryPointName {
    pub fn new(name: &str) -> Result<Self, Status> {
        if name.is_empty() {
            return Err(Status::InvalidValue(
                "entry point name must not be empty".to_string(),
            ));
        }
        if name.len() >= ENTRY_POINT_NAME_CAPACITY {
            return Err(Status::InvalidValue(format!(
                "entry point name '{name}' is {} bytes, limit is {}",
                name.len(),
                ENTRY_POINT_NAME_CAPACITY - 1
            )));
        }

        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
        if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(Status::InvalidValue(format!(
                "entry point name '{name}' is not a valid identifier"
            )));
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryPointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named values substituted into a [`KernelTemplate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams {
    values: BTreeMap<&'static str, String>,
}

impl TemplateParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl fmt::Display) -> Self {
        self.values.insert(name, value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Source template with `{{name}}` placeholders.
///
/// Single braces are left alone so OpenCL blocks need no escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTemplate {
    source: &'static str,
}

impl KernelTemplate {
    pub const fn new(source: &'static str) -> Self {
        Self { source }
    }

    /// Render strictly: every placeholder needs a value.
    pub fn render(&self, params: &TemplateParams) -> Result<String, Status> {
        let template = self.source;
        let mut result = String::with_capacity(template.len() + 32);
        let mut cursor = 0;

        while let Some(start_rel) = template[cursor..].find("{{") {
            let start = cursor + start_rel;
            result.push_str(&template[cursor..start]);

            let Some(end_rel) = template[start + 2..].find("}}") else {
                return Err(Status::InvalidValue(format!(
                    "unterminated placeholder at byte {start}"
                )));
            };
            let end = start + 2 + end_rel;
            let name = template[start + 2..end].trim();

            match params.get(name) {
                Some(value) => result.push_str(value),
                None => {
                    return Err(Status::InvalidValue(format!(
                        "missing value for placeholder '{{{{{name}}}}}'"
                    )))
                }
            }
            cursor = end + 2;
        }

        result.push_str(&template[cursor..]);
        Ok(result)
    }
}

/// ABI value of one argument of the generated entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KernelArgument {
    Uint(u32),
    Uint4([u32; 4]),
    /// Global buffer bound to the given parameter index.
    Buffer(usize),
}

/// Everything the codegen callback hands back to the framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodegenOutput {
    pub entry_point: EntryPointName,
    pub source: String,
    pub build_options: String,
    pub work_dim: u32,
    pub global_work: [usize; 3],
    /// `None` leaves the work-group size to the runtime.
    pub local_work: Option<[usize; 3]>,
    pub local_buffer_usage_mask: u32,
    pub local_buffer_size_in_bytes: u32,
}

impl CodegenOutput {
    /// Number of work-items the program is launched with.
    pub fn work_items(&self) -> usize {
        self.global_work[..self.work_dim as usize].iter().product()
    }
}
