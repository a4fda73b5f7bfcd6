//! Scalar field declarations.

use plinth_sql::{ColumnType, Value};

/// A declared scalar field on a collection.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: ColumnType,
    /// Reject writes that leave the field null and carry no default.
    pub required: bool,
    /// Applied on create when the field is absent.
    pub default: Option<Value>,
    pub indexed: bool,
    pub unique: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
            indexed: false,
            unique: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A composite index declared on a collection.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpec {
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            unique: false,
        }
    }

    pub fn unique(columns: Vec<String>) -> Self {
        Self {
            columns,
            unique: true,
        }
    }
}
