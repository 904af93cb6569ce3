//! Rows and their field metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueType};

/// Descriptor of one field in a row stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub value_type: ValueType,
    /// Declared length, `-1` when unspecified.
    #[serde(default = "unspecified")]
    pub length: i32,
    /// Declared precision, `-1` when unspecified.
    #[serde(default = "unspecified")]
    pub precision: i32,
}

fn unspecified() -> i32 {
    -1
}

impl FieldMeta {
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            length: -1,
            precision: -1,
        }
    }

    #[must_use]
    pub fn with_length(mut self, length: i32, precision: i32) -> Self {
        self.length = length;
        self.precision = precision;
        self
    }
}

/// Ordered field layout of a row stream. Fixed once the stream has started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowMeta {
    fields: Vec<FieldMeta>,
}

impl RowMeta {
    #[must_use]
    pub fn new(fields: Vec<FieldMeta>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&FieldMeta> {
        self.fields.get(index)
    }

    /// Position of the field called `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// A copy of this layout with `extra` fields appended.
    #[must_use]
    pub fn extended(&self, extra: impl IntoIterator<Item = FieldMeta>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { fields }
    }

    /// Same field names and types in the same order. Length and precision
    /// are not compared.
    #[must_use]
    pub fn same_layout(&self, other: &RowMeta) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name == b.name && a.value_type == b.value_type)
    }

    /// Check that `row` has one value per field and every value fits its type.
    ///
    /// # Errors
    ///
    /// Returns a description of the first mismatch.
    pub fn check_row(&self, row: &Row) -> Result<(), String> {
        if row.len() != self.fields.len() {
            return Err(format!(
                "row has {} values but metadata declares {} fields",
                row.len(),
                self.fields.len()
            ));
        }
        for (field, value) in self.fields.iter().zip(row.values()) {
            if !value.fits(field.value_type) {
                return Err(format!(
                    "field '{}' is declared {} but holds {:?}",
                    field.name, field.value_type, value
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RowMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{} {}", field.name, field.value_type))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Ordered values of one row; positions are interpreted through a [`RowMeta`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}
