/// Canonical attribute → trigger keywords, scanned in declared order.
///
/// `product_name` and `item_name` share triggers with each other; the first
/// entry in this table always wins.
pub const ATTRIBUTE_KEYWORDS: &[(&str, &[&str])] = &[
    ("price", &["price", "cost", "value"]),
    ("quantity", &["quantity", "number", "amount"]),
    ("stock", &["stock", "inventory", "available"]),
    ("warehouse", &["warehouse", "location", "where"]),
    ("product_name", &["product", "item", "name"]),
    ("item_name", &["item", "name", "product"]),
];

/// Fields that name the item a row describes, in priority order.
pub const ITEM_NAME_FIELDS: [&str; 2] = ["item_name", "product_name"];

/// First canonical attribute with a trigger keyword contained in `question`.
pub fn match_attribute(question: &str) -> Option<&'static str> {
    ATTRIBUTE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| question.contains(k)))
        .map(|(attribute, _)| *attribute)
}
