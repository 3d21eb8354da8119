//! Deterministic keyword resolution of questions against the row set.
//!
//! Two independent passes run over the same rows: one finds the item a
//! question names (substring match on `item_name`/`product_name`), the other
//! finds the attribute it asks for (first trigger keyword in table order).
//! Every combination of hits and misses yields a message; nothing here fails.

pub mod keywords;

pub use keywords::{match_attribute, ATTRIBUTE_KEYWORDS, ITEM_NAME_FIELDS};

use serde::Serialize;

use crate::error::{Result, ServiceError};
use crate::store::{FieldValue, Row};

pub const NO_DATA: &str = "No data has been uploaded yet. Please upload a CSV first.";
pub const NOT_UNDERSTOOD: &str = "I could not understand which item or attribute you are asking about. Please rephrase your question more directly (e.g., 'What is the price of Apple?').";

/// A non-empty, lowercased question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question(String);

impl Question {
    /// Normalize `text`, rejecting empty or blank input as `InvalidInput`.
    pub fn parse(text: &str) -> Result<Self> {
        let normalized = text.to_lowercase();
        // whitespace-only text is rejected the same as "", not answered
        if normalized.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "Please provide a 'question' in the request body.".into(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub question: String,
    pub matched_item_key: Option<String>,
    pub matched_attribute: Option<&'static str>,
    pub value: Option<FieldValue>,
    pub message: String,
}

impl QueryResult {
    fn message_only(question: &Question, message: impl Into<String>) -> Self {
        Self {
            question: question.0.clone(),
            matched_item_key: None,
            matched_attribute: None,
            value: None,
            message: message.into(),
        }
    }
}

/// Answer `question` from `rows`, which are scanned in the order given.
pub fn resolve(question: &Question, rows: &[Row]) -> QueryResult {
    if rows.is_empty() {
        return QueryResult::message_only(question, NO_DATA);
    }

    let text = question.as_str();
    let item = match_item(text, rows);
    let attribute = match_attribute(text);

    let (item, attribute) = match (item, attribute) {
        (None, None) => return QueryResult::message_only(question, NOT_UNDERSTOOD),
        (None, Some(attribute)) => {
            return QueryResult {
                matched_attribute: Some(attribute),
                ..QueryResult::message_only(
                    question,
                    format!(
                        "I understand you are asking about '{}', but I couldn't identify the specific item. Please mention the item name (e.g., Apple, T-Shirt).",
                        attribute
                    ),
                )
            };
        }
        (Some(item), None) => {
            let message = format!(
                "I understand you are asking about '{}', but I couldn't identify what attribute (e.g., price, quantity, stock) you want to know. Please specify.",
                item
            );
            return QueryResult {
                matched_item_key: Some(item),
                ..QueryResult::message_only(question, message)
            };
        }
        (Some(item), Some(attribute)) => (item, attribute),
    };

    let value = lookup_value(rows, &item, attribute).cloned();
    let message = match &value {
        Some(value) => format!("The {} of {} is: {}", attribute, item, value),
        None => format!(
            "I could not find the {} for {} in the uploaded data.",
            attribute, item
        ),
    };
    QueryResult {
        question: question.0.clone(),
        matched_item_key: Some(item),
        matched_attribute: Some(attribute),
        value,
        message,
    }
}

/// First lowercased item name, across rows then name fields, that occurs
/// anywhere in the question.
fn match_item(question: &str, rows: &[Row]) -> Option<String> {
    rows.iter().find_map(|row| {
        ITEM_NAME_FIELDS.iter().find_map(|field| {
            let name = row.fields.get(*field)?.as_text()?.to_lowercase();
            // an empty name would match every question
            (!name.is_empty() && question.contains(&name)).then_some(name)
        })
    })
}

fn names_item(row: &Row, item: &str) -> bool {
    ITEM_NAME_FIELDS.iter().any(|field| {
        row.fields
            .get(*field)
            .and_then(FieldValue::as_text)
            .is_some_and(|name| name.to_lowercase() == item)
    })
}

/// The first row naming `item` decides the answer, whether or not it has
/// `attribute`.
fn lookup_value<'a>(rows: &'a [Row], item: &str, attribute: &str) -> Option<&'a FieldValue> {
    rows.iter()
        .find(|row| names_item(row, item))?
        .fields
        .get(attribute)
}
