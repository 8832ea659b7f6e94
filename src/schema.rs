//! The four fixed target record shapes and their field rules.
//!
//! Each target field declares the synonym patterns the Field Mapper scores
//! against (declaration order is the tie-break), whether the field is
//! required, and the transformation/validation pair the pipeline applies to
//! mapped values. The vocabulary is deliberately closed: this engine is not
//! a general ETL framework.

use std::fmt;

use anyhow::{Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Named transformation applied to a mapped value before validation.
/// Every variant is pure and total: bad coercions yield a fallback, never
/// an error (invalid numbers become 0, invalid dates become null).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Uppercase,
    Lowercase,
    Trim,
    Number,
    Date,
    Boolean,
}

/// Named validation applied after transformation. A failure drops the field
/// from the transformed row and records a row/column-scoped error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    Required,
    Email,
    Number {
        min: Option<f64>,
        max: Option<f64>,
    },
    DateFormat,
}

#[derive(Debug, Clone, Copy)]
pub struct TargetField {
    pub name: &'static str,
    /// Synonyms scored by the mapper, in declaration (tie-break) order.
    pub patterns: &'static [&'static str],
    pub required: bool,
    pub transformation: Option<Transformation>,
    pub validation: Option<Validation>,
}

/// One of the four record shapes the persistence collaborator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum TargetSchema {
    Shareholders,
    Transactions,
    ShareClasses,
    VestingSchedules,
}

const SHAREHOLDER_FIELDS: &[TargetField] = &[
    TargetField {
        name: "name",
        patterns: &["name", "full_name", "shareholder_name", "holder", "investor"],
        required: true,
        transformation: Some(Transformation::Trim),
        validation: Some(Validation::Required),
    },
    TargetField {
        name: "email",
        patterns: &["email", "email_address", "contact_email"],
        required: false,
        transformation: Some(Transformation::Lowercase),
        validation: Some(Validation::Email),
    },
    TargetField {
        name: "share_count",
        patterns: &["share_count", "shares", "number_of_shares", "quantity"],
        required: true,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: None,
        }),
    },
    TargetField {
        name: "share_class",
        patterns: &["share_class", "class", "security_type", "series"],
        required: false,
        transformation: Some(Transformation::Trim),
        validation: None,
    },
    TargetField {
        name: "acquisition_date",
        patterns: &["acquisition_date", "date_acquired", "issue_date", "grant_date"],
        required: false,
        transformation: Some(Transformation::Date),
        validation: Some(Validation::DateFormat),
    },
    TargetField {
        name: "shareholder_type",
        patterns: &["shareholder_type", "holder_type", "investor_type", "type"],
        required: false,
        transformation: Some(Transformation::Lowercase),
        validation: None,
    },
];

const TRANSACTION_FIELDS: &[TargetField] = &[
    TargetField {
        name: "transaction_type",
        patterns: &["transaction_type", "type", "action", "event"],
        required: true,
        transformation: Some(Transformation::Lowercase),
        validation: Some(Validation::Required),
    },
    TargetField {
        name: "shareholder_name",
        patterns: &["shareholder_name", "shareholder", "name", "holder"],
        required: true,
        transformation: Some(Transformation::Trim),
        validation: Some(Validation::Required),
    },
    TargetField {
        name: "share_count",
        patterns: &["share_count", "shares", "quantity", "number_of_shares"],
        required: true,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: None,
        }),
    },
    TargetField {
        name: "price_per_share",
        patterns: &["price_per_share", "price", "share_price", "unit_price"],
        required: false,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: None,
        }),
    },
    TargetField {
        name: "transaction_date",
        patterns: &["transaction_date", "date", "trade_date", "effective_date"],
        required: true,
        transformation: Some(Transformation::Date),
        validation: Some(Validation::DateFormat),
    },
    TargetField {
        name: "share_class",
        patterns: &["share_class", "class", "series"],
        required: false,
        transformation: Some(Transformation::Trim),
        validation: None,
    },
];

const SHARE_CLASS_FIELDS: &[TargetField] = &[
    TargetField {
        name: "class_name",
        patterns: &["class_name", "name", "class", "series"],
        required: true,
        transformation: Some(Transformation::Trim),
        validation: Some(Validation::Required),
    },
    TargetField {
        name: "authorized_shares",
        patterns: &["authorized_shares", "authorized", "total_authorized"],
        required: true,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: None,
        }),
    },
    TargetField {
        name: "par_value",
        patterns: &["par_value", "par", "nominal_value"],
        required: false,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: None,
        }),
    },
    TargetField {
        name: "liquidation_preference",
        patterns: &["liquidation_preference", "liq_pref", "preference_multiple"],
        required: false,
        transformation: Some(Transformation::Number),
        validation: None,
    },
    TargetField {
        name: "voting_rights",
        patterns: &["voting_rights", "voting", "has_voting_rights"],
        required: false,
        transformation: Some(Transformation::Boolean),
        validation: None,
    },
];

const VESTING_SCHEDULE_FIELDS: &[TargetField] = &[
    TargetField {
        name: "shareholder_name",
        patterns: &["shareholder_name", "shareholder", "name", "employee", "holder"],
        required: true,
        transformation: Some(Transformation::Trim),
        validation: Some(Validation::Required),
    },
    TargetField {
        name: "total_shares",
        patterns: &["total_shares", "shares", "grant_shares", "share_count"],
        required: true,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: None,
        }),
    },
    TargetField {
        name: "start_date",
        patterns: &["start_date", "start", "vesting_start", "commencement_date"],
        required: true,
        transformation: Some(Transformation::Date),
        validation: Some(Validation::DateFormat),
    },
    TargetField {
        name: "cliff_months",
        patterns: &["cliff_months", "cliff", "cliff_period"],
        required: false,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: Some(120.0),
        }),
    },
    TargetField {
        name: "duration_months",
        patterns: &["duration_months", "duration", "vesting_period", "term_months"],
        required: false,
        transformation: Some(Transformation::Number),
        validation: Some(Validation::Number {
            min: Some(0.0),
            max: Some(240.0),
        }),
    },
    TargetField {
        name: "frequency",
        patterns: &["frequency", "vesting_frequency", "interval"],
        required: false,
        transformation: Some(Transformation::Lowercase),
        validation: None,
    },
];

impl TargetSchema {
    /// Fixed table name the persistence collaborator keys writes by.
    pub fn table_name(&self) -> &'static str {
        match self {
            TargetSchema::Shareholders => "shareholders",
            TargetSchema::Transactions => "transactions",
            TargetSchema::ShareClasses => "share_classes",
            TargetSchema::VestingSchedules => "vesting_schedules",
        }
    }

    pub fn fields(&self) -> &'static [TargetField] {
        match self {
            TargetSchema::Shareholders => SHAREHOLDER_FIELDS,
            TargetSchema::Transactions => TRANSACTION_FIELDS,
            TargetSchema::ShareClasses => SHARE_CLASS_FIELDS,
            TargetSchema::VestingSchedules => VESTING_SCHEDULE_FIELDS,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static TargetField> {
        self.fields().iter().find(|field| field.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &'static TargetField> {
        self.fields().iter().filter(|field| field.required)
    }
}

impl fmt::Display for TargetSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl std::str::FromStr for TargetSchema {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "shareholders" => Ok(TargetSchema::Shareholders),
            "transactions" => Ok(TargetSchema::Transactions),
            "share_classes" => Ok(TargetSchema::ShareClasses),
            "vesting_schedules" => Ok(TargetSchema::VestingSchedules),
            other => Err(anyhow!("Unknown target schema '{other}'")),
        }
    }
}
