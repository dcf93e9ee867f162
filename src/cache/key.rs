// Request keys and caller context.
// Keys combine endpoint, sorted query parameters and the full caller context.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Query parameters in stable key order.
pub type QueryParams = BTreeMap<String, String>;

/// Identity and tenant fields that scope every cached value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institute_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

/// A single field of [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextField {
    UserId,
    Role,
    InstituteId,
    ClassId,
    SubjectId,
}

impl ContextField {
    pub const ALL: [ContextField; 5] = [
        ContextField::UserId,
        ContextField::Role,
        ContextField::InstituteId,
        ContextField::ClassId,
        ContextField::SubjectId,
    ];
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn institute(mut self, institute_id: impl Into<String>) -> Self {
        self.institute_id = Some(institute_id.into());
        self
    }

    pub fn class(mut self, class_id: impl Into<String>) -> Self {
        self.class_id = Some(class_id.into());
        self
    }

    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn field(&self, field: ContextField) -> Option<&str> {
        match field {
            ContextField::UserId => self.user_id.as_deref(),
            ContextField::Role => self.role.as_deref(),
            ContextField::InstituteId => self.institute_id.as_deref(),
            ContextField::ClassId => self.class_id.as_deref(),
            ContextField::SubjectId => self.subject_id.as_deref(),
        }
    }

    fn slot(&mut self, field: ContextField) -> &mut Option<String> {
        match field {
            ContextField::UserId => &mut self.user_id,
            ContextField::Role => &mut self.role,
            ContextField::InstituteId => &mut self.institute_id,
            ContextField::ClassId => &mut self.class_id,
            ContextField::SubjectId => &mut self.subject_id,
        }
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        ContextField::ALL.iter().all(|f| self.field(*f).is_none())
    }

    /// Copy of this context keeping only the given fields.
    pub fn project(&self, fields: &[ContextField]) -> RequestContext {
        let mut projected = RequestContext::default();
        for field in fields {
            *projected.slot(*field) = self.field(*field).map(str::to_string);
        }
        projected
    }

    /// Whether every field set in `filter` has the same value here.
    pub fn matches(&self, filter: &RequestContext) -> bool {
        ContextField::ALL.iter().all(|f| match filter.field(*f) {
            Some(expected) => self.field(*f) == Some(expected),
            None => true,
        })
    }

    fn write_canonical(&self, out: &mut String) {
        // Absent and empty fields must stay distinguishable.
        for field in ContextField::ALL {
            match self.field(field) {
                Some(value) => {
                    out.push('=');
                    push_escaped(out, value);
                }
                None => out.push('-'),
            }
            out.push(';');
        }
    }
}

/// Deterministic cache and single-flight key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Build a key; the rendered form always starts with `endpoint`.
    pub fn new(endpoint: &str, params: &QueryParams, context: &RequestContext) -> Self {
        let mut key = String::with_capacity(endpoint.len() + 64);
        key.push_str(endpoint);
        key.push('?');
        for (i, (name, value)) in params.iter().enumerate() {
            if i > 0 {
                key.push('&');
            }
            push_escaped(&mut key, name);
            key.push('=');
            push_escaped(&mut key, value);
        }
        key.push('#');
        context.write_canonical(&mut key);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escape the key delimiters so distinct inputs never render the same.
fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '%' | '&' | '=' | '#' | ';' | '?' | '-' => {
                out.push_str(&format!("%{:02X}", c as u32));
            }
            _ => out.push(c),
        }
    }
}
