//! Document structure and term keys for the write path.
//!
//! Documents are schema-less collections of field values; the indexing
//! chain configured on the writer decides how each field is indexed.
//! A [`Term`] identifies an exact field/text pair and is the key used by
//! delete and update operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single field value in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Text content, analyzed by the indexing chain.
    Text(String),

    /// Integer value, indexed as its decimal representation.
    Integer(i64),

    /// Float value, indexed as its decimal representation.
    Float(f64),

    /// Boolean value.
    Boolean(bool),

    /// Date/time value, indexed as RFC 3339.
    DateTime(DateTime<Utc>),
}

impl FieldValue {
    /// Render the value as the text the default indexing chain sees.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::Integer(num) => num.to_string(),
            FieldValue::Float(num) => num.to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::DateTime(dt) => dt.to_rfc3339(),
        }
    }
}

/// A document represents a single item to be indexed.
///
/// Documents are collections of field values in schema-less mode. Fields can
/// be added dynamically without a predefined schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// The field values for this document
    fields: HashMap<String, FieldValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document {
            fields: HashMap::new(),
        }
    }

    /// Add a field value to the document.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Get a field value from the document.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Check if the document has a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Get all field values.
    pub fn fields(&self) -> &HashMap<String, FieldValue> {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add a text field to the document.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document
            .add_field(name, FieldValue::Text(value.into()));
        self
    }

    /// Add an integer field to the document.
    pub fn add_integer<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add_field(name, FieldValue::Integer(value));
        self
    }

    /// Add a float field to the document.
    pub fn add_float<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.document.add_field(name, FieldValue::Float(value));
        self
    }

    /// Add a boolean field to the document.
    pub fn add_boolean<S: Into<String>>(mut self, name: S, value: bool) -> Self {
        self.document.add_field(name, FieldValue::Boolean(value));
        self
    }

    /// Add a date/time field to the document.
    pub fn add_datetime<S: Into<String>>(mut self, name: S, value: DateTime<Utc>) -> Self {
        self.document.add_field(name, FieldValue::DateTime(value));
        self
    }

    /// Build the final document.
    pub fn build(self) -> Document {
        self.document
    }
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An exact field/text pair identifying documents for delete and update
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    /// Field name.
    pub field: String,

    /// Exact term text.
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Approximate heap footprint of this term, for RAM accounting.
    pub fn ram_bytes_used(&self) -> usize {
        std::mem::size_of::<Self>() + self.field.capacity() + self.text.capacity()
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_builder() {
        let doc = Document::builder()
            .add_text("title", "Hello World")
            .add_integer("count", 42)
            .add_boolean("published", true)
            .build();

        assert_eq!(doc.len(), 3);
        assert!(doc.has_field("title"));
        assert_eq!(
            doc.get_field("count"),
            Some(&FieldValue::Integer(42))
        );
    }

    #[test]
    fn test_field_value_as_text() {
        assert_eq!(FieldValue::Text("abc".to_string()).as_text(), "abc");
        assert_eq!(FieldValue::Integer(7).as_text(), "7");
        assert_eq!(FieldValue::Boolean(false).as_text(), "false");
    }

    #[test]
    fn test_term_ordering_and_display() {
        let a = Term::new("id", "1");
        let b = Term::new("id", "2");

        assert!(a < b);
        assert_eq!(a.to_string(), "id:1");
        assert_eq!(a, Term::new("id", "1"));
    }
}
