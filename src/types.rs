//! Core type definitions for the facetdb relation model
//!
//! Every record in the system, schema or data, is one `Row`. What a row
//! *means* depends on where it sits in the graph; the `BaseType` set and
//! the classification helpers in `schema` turn that convention into types.

use serde::{Deserialize, Serialize};

/// Unique identifier for rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl RowId {
    pub fn new(id: u64) -> Self {
        RowId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The root of the relation. Never a stored row; rows with `parent == ROOT`
/// are type definitions.
pub const ROOT: RowId = RowId(0);

/// First id available to user rows; everything below is a seeded base type.
pub const FIRST_USER_ID: u64 = 16;

/// Sibling sequences are 1-based; a row with no siblings keeps this order.
pub const DEFAULT_ORDER: i64 = 1;

/// Root-level order value marking a type whose instance values must be unique.
pub const UNIQUE_ORDER_FLAG: i64 = 2;

/// One record of the flat self-referential relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub parent: RowId,
    pub type_pointer: RowId,
    pub order: i64,
    pub value: String,
}

impl Row {
    pub fn new(id: RowId, parent: RowId, type_pointer: RowId, order: i64, value: String) -> Self {
        Row {
            id,
            parent,
            type_pointer,
            order,
            value,
        }
    }

    /// Terminal rows define themselves: their type pointer is their own id.
    pub fn is_terminal(&self) -> bool {
        self.id == self.type_pointer
    }

    /// The value payload parsed as a row reference, if it looks like one.
    ///
    /// Reference-typed attribute rows store the referenced id as decimal
    /// text; anything else is treated as plain text.
    pub fn value_as_reference(&self) -> Option<RowId> {
        parse_reference(&self.value)
    }
}

/// Parse a value payload as a row reference: non-empty, all decimal digits.
pub fn parse_reference(value: &str) -> Option<RowId> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<u64>().ok().map(RowId)
}

/// The fixed set of terminal base types and internal markers
///
/// These occupy ids `1..FIRST_USER_ID` and are seeded into every store at
/// bootstrap with `id == type_pointer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    ShortText,
    LongText,
    Number,
    Decimal,
    Date,
    DateTime,
    Boolean,
    Password,
    File,
    FilePath,
    Markup,
    // Internal markers: rows of these types configure reports and access
    // rules, they never define instance fields.
    Report,
    ReportColumn,
    ReportJoin,
    AccessRule,
}

impl BaseType {
    pub const ALL: [BaseType; 15] = [
        BaseType::ShortText,
        BaseType::LongText,
        BaseType::Number,
        BaseType::Decimal,
        BaseType::Date,
        BaseType::DateTime,
        BaseType::Boolean,
        BaseType::Password,
        BaseType::File,
        BaseType::FilePath,
        BaseType::Markup,
        BaseType::Report,
        BaseType::ReportColumn,
        BaseType::ReportJoin,
        BaseType::AccessRule,
    ];

    pub fn id(&self) -> RowId {
        let raw = match self {
            BaseType::ShortText => 1,
            BaseType::LongText => 2,
            BaseType::Number => 3,
            BaseType::Decimal => 4,
            BaseType::Date => 5,
            BaseType::DateTime => 6,
            BaseType::Boolean => 7,
            BaseType::Password => 8,
            BaseType::File => 9,
            BaseType::FilePath => 10,
            BaseType::Markup => 11,
            BaseType::Report => 12,
            BaseType::ReportColumn => 13,
            BaseType::ReportJoin => 14,
            BaseType::AccessRule => 15,
        };
        RowId(raw)
    }

    pub fn from_id(id: RowId) -> Option<BaseType> {
        BaseType::ALL.iter().copied().find(|b| b.id() == id)
    }

    /// Display name stored in the seeded base-type rows
    pub fn name(&self) -> &'static str {
        match self {
            BaseType::ShortText => "Short text",
            BaseType::LongText => "Long text",
            BaseType::Number => "Number",
            BaseType::Decimal => "Decimal",
            BaseType::Date => "Date",
            BaseType::DateTime => "Date and time",
            BaseType::Boolean => "Boolean",
            BaseType::Password => "Password",
            BaseType::File => "File",
            BaseType::FilePath => "Path",
            BaseType::Markup => "Markup",
            BaseType::Report => "Report",
            BaseType::ReportColumn => "Report column",
            BaseType::ReportJoin => "Report join",
            BaseType::AccessRule => "Access rule",
        }
    }

    /// Marker types carry report/access configuration, not field data
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            BaseType::Report | BaseType::ReportColumn | BaseType::ReportJoin | BaseType::AccessRule
        )
    }

    /// Types whose values participate in report totals
    pub fn is_numeric(&self) -> bool {
        matches!(self, BaseType::Number | BaseType::Decimal)
    }
}

/// Structured form of the packed modifier markers in a field definition's
/// value payload
///
/// The stored text is `name|req|multi|as:<alias>` with every segment after
/// the first optional. The packed form exists only at the storage boundary;
/// everything above it works with this record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldModifiers {
    pub required: bool,
    pub multi: bool,
    pub alias: Option<String>,
}

impl FieldModifiers {
    /// Split a stored field payload into display name and modifiers.
    ///
    /// A payload with an unrecognized segment degrades to "no modifiers,
    /// whole string is the name" rather than guessing at partial intent.
    pub fn decode(payload: &str) -> (String, FieldModifiers) {
        let mut parts = payload.split('|');
        let name = parts.next().unwrap_or("").to_string();
        let mut modifiers = FieldModifiers::default();

        for segment in parts {
            if segment == "req" {
                modifiers.required = true;
            } else if segment == "multi" {
                modifiers.multi = true;
            } else if let Some(alias) = segment.strip_prefix("as:") {
                if alias.is_empty() {
                    return (payload.to_string(), FieldModifiers::default());
                }
                modifiers.alias = Some(alias.to_string());
            } else {
                // Malformed marker: the whole payload is the name.
                return (payload.to_string(), FieldModifiers::default());
            }
        }

        (name, modifiers)
    }

    /// Pack display name and modifiers back into the stored form.
    pub fn encode(name: &str, modifiers: &FieldModifiers) -> String {
        let mut payload = String::from(name);
        if modifiers.required {
            payload.push_str("|req");
        }
        if modifiers.multi {
            payload.push_str("|multi");
        }
        if let Some(alias) = &modifiers.alias {
            payload.push_str("|as:");
            payload.push_str(alias);
        }
        payload
    }

    pub fn is_empty(&self) -> bool {
        !self.required && !self.multi && self.alias.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_type_ids_cover_reserved_range() {
        for base in BaseType::ALL {
            assert!(base.id().as_u64() >= 1);
            assert!(base.id().as_u64() < FIRST_USER_ID);
            assert_eq!(BaseType::from_id(base.id()), Some(base));
        }
    }

    #[test]
    fn test_value_as_reference() {
        let row = Row::new(RowId(20), RowId(18), RowId(19), 1, "42".to_string());
        assert_eq!(row.value_as_reference(), Some(RowId(42)));

        let text = Row::new(RowId(21), RowId(18), RowId(19), 1, "42a".to_string());
        assert_eq!(text.value_as_reference(), None);

        let empty = Row::new(RowId(22), RowId(18), RowId(19), 1, String::new());
        assert_eq!(empty.value_as_reference(), None);
    }

    #[test]
    fn test_modifier_roundtrip() {
        let modifiers = FieldModifiers {
            required: true,
            multi: false,
            alias: Some("amount".to_string()),
        };

        let packed = FieldModifiers::encode("Amount", &modifiers);
        assert_eq!(packed, "Amount|req|as:amount");

        let (name, decoded) = FieldModifiers::decode(&packed);
        assert_eq!(name, "Amount");
        assert_eq!(decoded, modifiers);
    }

    #[test]
    fn test_plain_name_has_no_modifiers() {
        let (name, modifiers) = FieldModifiers::decode("Customer");
        assert_eq!(name, "Customer");
        assert!(modifiers.is_empty());
    }

    #[test]
    fn test_malformed_payload_degrades_to_name() {
        // "Amount|rq" carries a typo'd marker; the safe reading is that the
        // whole string is a display name that happens to contain a pipe.
        let (name, modifiers) = FieldModifiers::decode("Amount|rq");
        assert_eq!(name, "Amount|rq");
        assert!(modifiers.is_empty());

        let (name, modifiers) = FieldModifiers::decode("Total|as:");
        assert_eq!(name, "Total|as:");
        assert!(modifiers.is_empty());
    }

    #[test]
    fn test_multi_marker() {
        let (name, modifiers) = FieldModifiers::decode("Tags|multi");
        assert_eq!(name, "Tags");
        assert!(modifiers.multi);
        assert!(!modifiers.required);
    }
}
