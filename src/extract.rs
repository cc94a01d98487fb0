//! Suggested-item extraction from tool-call results.
//!
//! Pure functions over an accumulated step list. The upstream column schema is
//! not stable, so every lookup goes by column name first and falls back to
//! scanning the row when the expected column is missing.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::{
    scoring::GameRules,
    types::{Column, Step, SuggestedItem, TabularData, ToolResult},
};

pub const MAX_SUGGESTED_ITEMS: usize = 5;
pub const MAX_ROWS_PER_RESULT: usize = 8;

/// Generic search tools return documents without grocery columns.
pub const EXCLUDED_TOOLS: &[&str] = &["platform.core.search"];

/// Checked in order; the first present column holding a number wins.
pub const PRICE_COLUMNS: [&str; 5] = [
    "best_price",
    "min_price",
    "final_price",
    "current_price",
    "avg_price",
];

const PLACEHOLDER_NAME: &str = "N/A";
const DEFAULT_BRAND: &str = "Unknown Brand";
const DEFAULT_CATEGORY: &str = "Suggested";
const DEFAULT_UNIT: &str = "item";

pub fn extract_items(steps: &[Step]) -> Vec<SuggestedItem> {
    extract_items_with_reply(steps, None)
}

/// Like [`extract_items`], additionally reading quantity hints such as
/// "2 lbs of Bananas" from the agent's reply text.
pub fn extract_items_with_reply(steps: &[Step], reply: Option<&str>) -> Vec<SuggestedItem> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();

    for table in grocery_tables(steps) {
        let columns = ColumnIndex::new(&table.columns);

        for (row_index, row) in table.values.iter().take(MAX_ROWS_PER_RESULT).enumerate() {
            let Some(cells) = row.as_array().filter(|cells| !cells.is_empty()) else {
                debug!(row_index, "skipping non-tuple row");
                continue;
            };

            let Some(mut item) = parse_row(&columns, cells, items.len()) else {
                debug!(row_index, "skipping row without usable name or price");
                continue;
            };

            if !seen.insert(item.name.to_lowercase()) {
                continue;
            }

            if let Some(quantity) = reply.and_then(|text| quantity_hint(text, &item.name)) {
                item.quantity = quantity;
            }

            items.push(item);
            if items.len() == MAX_SUGGESTED_ITEMS {
                return items;
            }
        }
    }

    items
}

fn grocery_tables(steps: &[Step]) -> impl Iterator<Item = &TabularData> {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::ToolCall(call) => Some(call),
            Step::Reasoning { .. } => None,
        })
        .filter(|call| {
            let excluded = EXCLUDED_TOOLS.contains(&call.tool_id.as_str());
            if excluded {
                debug!(tool_id = %call.tool_id, "skipping generic search results");
            }
            !excluded
        })
        .flat_map(|call| call.results.iter())
        .filter_map(|result| match result {
            ToolResult::TabularData(table) => Some(table),
            ToolResult::Query { .. } | ToolResult::Other(_) => None,
        })
}

/// Case-insensitive column name to position map. First occurrence wins.
struct ColumnIndex(HashMap<String, usize>);

impl ColumnIndex {
    fn new(columns: &[Column]) -> Self {
        let mut map = HashMap::new();
        for (index, column) in columns.iter().enumerate() {
            map.entry(column.name.trim().to_lowercase()).or_insert(index);
        }
        Self(map)
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }

    fn cell<'a>(&self, cells: &'a [Value], name: &str) -> Option<&'a Value> {
        self.get(name).and_then(|index| cells.get(index))
    }
}

fn parse_row(columns: &ColumnIndex, cells: &[Value], position: usize) -> Option<SuggestedItem> {
    let name = match columns.get("name") {
        Some(index) => cells.get(index).and_then(text_cell),
        None => cells
            .iter()
            .filter_map(text_cell)
            .find(|text| text.parse::<f64>().is_err()),
    }?;

    let price = resolve_price(columns, cells)?;

    let id = columns
        .cell(cells, "item_id")
        .or_else(|| columns.cell(cells, "id"))
        .and_then(id_cell)
        .unwrap_or_else(|| format!("item_{}", position + 1));

    let brand = columns
        .cell(cells, "brand")
        .and_then(text_cell)
        .unwrap_or_else(|| DEFAULT_BRAND.to_string());

    let category = columns
        .cell(cells, "category")
        .and_then(text_cell)
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

    let quantity = columns
        .cell(cells, "quantity")
        .and_then(Value::as_u64)
        .and_then(|quantity| u32::try_from(quantity).ok())
        .filter(|quantity| fits_in_bag(*quantity))
        .unwrap_or(1);

    Some(SuggestedItem {
        id,
        name,
        brand,
        category,
        price,
        quantity,
        unit: DEFAULT_UNIT.to_string(),
    })
}

fn resolve_price(columns: &ColumnIndex, cells: &[Value]) -> Option<f64> {
    let named: Vec<usize> = PRICE_COLUMNS
        .iter()
        .filter_map(|column| columns.get(column))
        .collect();

    let price = if named.is_empty() {
        cells
            .iter()
            .filter_map(Value::as_f64)
            .find(|price| price.is_finite() && *price > 0.0)
    } else {
        named
            .iter()
            .find_map(|index| cells.get(*index).and_then(numeric_cell))
    }?;

    (price.is_finite() && price > 0.0).then_some(price)
}

fn text_cell(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    if text.is_empty() || text.eq_ignore_ascii_case(PLACEHOLDER_NAME) {
        return None;
    }
    Some(text.to_string())
}

fn id_cell(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Numbers, or strings such as "3.49" / "$3.49".
fn numeric_cell(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => {
            let text = text.trim();
            text.strip_prefix('$').unwrap_or(text).parse::<f64>().ok()?
        }
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn quantity_hint(reply: &str, name: &str) -> Option<u32> {
    let pattern = format!(
        r"(?i){}.*?(\d+)\s*(?:lbs?|pounds?|oz|ounces?|pieces?|items?)",
        regex::escape(name)
    );
    let captures = Regex::new(&pattern).ok()?.captures(reply)?;
    captures[1].parse::<u32>().ok().filter(|quantity| fits_in_bag(*quantity))
}

/// Counts like "16 oz" describe package size, not how many to add.
fn fits_in_bag(quantity: u32) -> bool {
    quantity > 0 && quantity <= GameRules::default().max_per_bag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallStep;
    use serde_json::json;

    fn table(columns: &[&str], rows: Vec<Value>) -> ToolResult {
        ToolResult::TabularData(TabularData {
            columns: columns.iter().map(|name| Column::new(*name)).collect(),
            values: rows,
            ..TabularData::default()
        })
    }

    fn tool_step(tool_id: &str, results: Vec<ToolResult>) -> Step {
        Step::ToolCall(ToolCallStep {
            tool_call_id: format!("call-{tool_id}"),
            tool_id: tool_id.to_string(),
            params: Default::default(),
            results,
        })
    }

    fn names(items: &[SuggestedItem]) -> Vec<&str> {
        items.iter().map(|item| item.name.as_str()).collect()
    }

    #[test]
    fn reads_named_columns() {
        let steps = vec![tool_step(
            "grocery.budget_search",
            vec![table(
                &["item_id", "name", "brand", "category", "best_price"],
                vec![json!(["sku-1", "Whole Milk", "Acme", "Dairy", 3.49])],
            )],
        )];

        let items = extract_items(&steps);
        assert_eq!(
            items,
            vec![SuggestedItem {
                id: "sku-1".into(),
                name: "Whole Milk".into(),
                brand: "Acme".into(),
                category: "Dairy".into(),
                price: 3.49,
                quantity: 1,
                unit: "item".into(),
            }]
        );
    }

    #[test]
    fn column_names_match_case_insensitively() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(&["NAME", "Min_Price"], vec![json!(["Rice", "2.10"])])],
        )];
        let items = extract_items(&steps);
        assert_eq!(names(&items), vec!["Rice"]);
        assert_eq!(items[0].price, 2.10);
        assert_eq!(items[0].brand, "Unknown Brand");
        assert_eq!(items[0].category, "Suggested");
        assert_eq!(items[0].id, "item_1");
    }

    #[test]
    fn price_columns_follow_priority_order() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "avg_price", "current_price", "best_price"],
                vec![
                    json!(["Apples", 4.0, 3.0, 2.0]),
                    json!(["Pears", 4.0, 3.0, null]),
                    json!(["Plums", 4.0, "n/a", null]),
                ],
            )],
        )];
        let prices: Vec<f64> = extract_items(&steps).iter().map(|item| item.price).collect();
        assert_eq!(prices, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn falls_back_to_row_scan_without_named_columns() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(&[], vec![json!(["N/A", "", "42", "Oat Milk", 0, -1.5, 4.25])])],
        )];
        let items = extract_items(&steps);
        assert_eq!(names(&items), vec!["Oat Milk"]);
        assert_eq!(items[0].price, 4.25);
    }

    #[test]
    fn rows_without_name_or_positive_price_are_skipped() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "best_price"],
                vec![
                    json!(["N/A", 1.0]),
                    json!(["", 1.0]),
                    json!(["Free Sample", 0]),
                    json!(["Refund", -3]),
                    json!(["Mystery", "call for price"]),
                    json!(["Short row"]),
                    json!("not a row"),
                    json!([]),
                    json!(["Bread", 2.5]),
                ],
            )],
        )];
        // the row cap stops before Bread
        assert!(extract_items(&steps).is_empty());

        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "best_price"],
                vec![json!(["Free Sample", 0]), json!(["Bread", 2.5])],
            )],
        )];
        assert_eq!(names(&extract_items(&steps)), vec!["Bread"]);
    }

    #[test]
    fn generic_search_and_query_results_are_ignored() {
        let steps = vec![
            tool_step(
                "platform.core.search",
                vec![table(&["name", "best_price"], vec![json!(["Ignored", 1.0])])],
            ),
            tool_step(
                "grocery.search",
                vec![ToolResult::Query {
                    query: "FROM grocery".into(),
                }],
            ),
            Step::Reasoning {
                reasoning: "thinking".into(),
            },
        ];
        assert!(extract_items(&steps).is_empty());
    }

    #[test]
    fn deduplicates_by_name_ignoring_case_first_wins() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "best_price"],
                vec![json!(["Eggs", 3.0]), json!(["EGGS", 1.0]), json!(["eggs", 2.0])],
            )],
        )];
        let items = extract_items(&steps);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Eggs");
        assert_eq!(items[0].price, 3.0);
    }

    #[test]
    fn output_is_capped_in_first_seen_order() {
        let rows: Vec<Value> = (1..=8).map(|n| json!([format!("Item {n}"), n as f64])).collect();
        let steps = vec![
            tool_step("grocery.a", vec![table(&["name", "best_price"], rows.clone())]),
            tool_step("grocery.b", vec![table(&["name", "best_price"], rows)]),
        ];
        let items = extract_items(&steps);
        assert_eq!(items.len(), MAX_SUGGESTED_ITEMS);
        assert_eq!(
            names(&items),
            vec!["Item 1", "Item 2", "Item 3", "Item 4", "Item 5"]
        );
    }

    #[test]
    fn only_first_rows_of_each_result_are_read() {
        let mut rows: Vec<Value> = (0..MAX_ROWS_PER_RESULT).map(|_| json!(["N/A", 1.0])).collect();
        rows.push(json!(["Late Row", 1.0]));
        let steps = vec![tool_step("grocery.search", vec![table(&["name", "best_price"], rows)])];
        assert!(extract_items(&steps).is_empty());
    }

    #[test]
    fn extraction_is_repeatable() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "best_price"],
                vec![json!(["Tofu", 2.0]), json!(["Kale", 1.5])],
            )],
        )];
        assert_eq!(extract_items(&steps), extract_items(&steps));
    }

    #[test]
    fn reply_text_supplies_quantity_hint() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "best_price", "quantity"],
                vec![json!(["Bananas", 0.59, null]), json!(["Rice", 2.0, 2])],
            )],
        )];
        let reply = "Grab Bananas, about 3 lbs, plus a bag of rice.";
        let items = extract_items_with_reply(&steps, Some(reply));
        assert_eq!(items[0].quantity, 3);
        assert_eq!(items[1].quantity, 2);
    }

    #[test]
    fn package_sizes_are_not_quantities() {
        let steps = vec![tool_step(
            "grocery.search",
            vec![table(
                &["name", "best_price", "quantity"],
                vec![json!(["Yogurt", 3.49, null]), json!(["Water", 4.99, 24])],
            )],
        )];
        let reply = "Yogurt comes in a 16 oz tub and the Water is a 24 pieces case.";
        let items = extract_items_with_reply(&steps, Some(reply));
        assert_eq!(items[0].quantity, 1);
        assert_eq!(items[1].quantity, 1);
    }
}
