//! Default forecast assumptions per model type.
//!
//! Effective parameters for a generation are
//! `defaults(model_type) ⊕ assumptions ⊕ explicit parameters`, later maps
//! overriding earlier ones key by key.

use modelsmith_common::ModelType;
use serde_json::{Map, Value, json};

/// Base assumptions shared by every model type, plus the type-specific ones.
pub fn default_parameters(model_type: ModelType) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("start_date".into(), json!("2023-01-01"));
    params.insert("periods".into(), json!(36));

    let specific = match model_type {
        ModelType::Revenue => json!({
            "initial_customers": 100,
            "monthly_growth_rate": 0.05,
            "average_revenue_per_customer": 100,
            "churn_rate": 0.02,
        }),
        ModelType::Expense => json!({
            "fixed_costs": {
                "rent": 5000,
                "salaries": 20000,
                "utilities": 1000,
                "insurance": 1500,
                "other_fixed": 2000,
            },
            "variable_costs": {
                "marketing": 0.10,
                "sales_commission": 0.05,
                "customer_support": 0.03,
                "other_variable": 0.02,
            },
            "initial_revenue": 50000,
            "revenue_growth_rate": 0.03,
            "inflation_rate": 0.02,
        }),
        ModelType::CashFlow => json!({
            "initial_cash": 100000,
            "monthly_revenue": 50000,
            "revenue_growth_rate": 0.03,
            "collection_delay": 1,
            "monthly_expenses": 40000,
            "expense_growth_rate": 0.02,
            "payment_delay": 0,
        }),
        ModelType::Custom => json!({
            "initial_value": 1000,
            "growth_rate": 0.02,
        }),
    };

    if let Value::Object(specific) = specific {
        params.extend(specific);
    }
    params
}

/// Merge `layers` over the defaults for `model_type`.
pub fn effective_parameters<'a, I>(model_type: ModelType, layers: I) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a Map<String, Value>>,
{
    let mut params = default_parameters(model_type);
    for layer in layers {
        for (key, value) in layer {
            params.insert(key.clone(), value.clone());
        }
    }
    params
}
